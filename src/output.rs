//! Sinks for the ranked pool list

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;

use crate::error::Result;
use crate::types::PoolOutput;

#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Hand over one run's ranked pools, best first
    async fn publish(&self, pools: &[PoolOutput]) -> Result<()>;
}

/// Writes the ranked list as a pretty-printed JSON array
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl OutputSink for JsonFileSink {
    async fn publish(&self, pools: &[PoolOutput]) -> Result<()> {
        let json = serde_json::to_string_pretty(pools)?;

        // readers never observe a half-written file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        info!(path = %self.path.display(), pools = pools.len(), "Wrote ranked pools");
        Ok(())
    }
}

pub struct StdoutSink;

#[async_trait]
impl OutputSink for StdoutSink {
    async fn publish(&self, pools: &[PoolOutput]) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(pools)?);
        Ok(())
    }
}

/// Keeps every published list in memory
#[derive(Default)]
pub struct MemorySink {
    published: Mutex<Vec<Vec<PoolOutput>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<Vec<PoolOutput>> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last(&self) -> Option<Vec<PoolOutput>> {
        self.published().pop()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn publish(&self, pools: &[PoolOutput]) -> Result<()> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(pools.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chain;
    use std::collections::BTreeMap;

    fn row(address: &str) -> PoolOutput {
        PoolOutput {
            address: address.into(),
            chain: Chain::Ethereum,
            symbol: "usdc".into(),
            apy: 5.0,
            tvl: 2_000_000.0,
            volatility: 0.05,
            bridging_needed: false,
            chain_factor: 1.0,
            is_lsd: false,
            score: 39.17,
            extra_data: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_json_file_sink_writes_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregator_output.json");
        let sink = JsonFileSink::new(&path);

        sink.publish(&[row("A"), row("C")]).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<PoolOutput> = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].address, "A");
        assert!(!dir.path().join("aggregator_output.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_history() {
        let sink = MemorySink::new();
        sink.publish(&[row("A")]).await.unwrap();
        sink.publish(&[]).await.unwrap();
        assert_eq!(sink.published().len(), 2);
        assert!(sink.last().unwrap().is_empty());
    }
}
