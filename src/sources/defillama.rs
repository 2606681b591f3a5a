//! DeFiLlama yields API client
//!
//! Fetches the full pool listing. The response is large, so it can be cached
//! on disk and reused while younger than `cache_max_age_secs`.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::{as_f64, http_client, send_for_body, PoolSource};
use crate::config::SourcesConfig;
use crate::error::{Error, Result};
use crate::types::{Chain, ExtraValue, PoolRecord, SourceKind};

const SOURCE_NAME: &str = "defillama";

/// Fields mapped onto `PoolRecord` directly; everything else goes to `extra`
const MAPPED_FIELDS: &[&str] = &["pool", "chain", "symbol", "apy", "tvlUsd", "underlyingTokens"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PoolsPayload {
    Wrapped { data: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

pub struct DefiLlamaSource {
    client: reqwest::Client,
    url: String,
    token_cost: u32,
    cache_path: Option<PathBuf>,
    cache_max_age: Duration,
}

impl DefiLlamaSource {
    pub fn new(config: &SourcesConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: config.defillama_url.clone(),
            token_cost: config.defillama_token_cost,
            cache_path: config.cache_path.as_ref().map(PathBuf::from),
            cache_max_age: Duration::from_secs(config.cache_max_age_secs),
        })
    }

    async fn read_cache(&self) -> Option<String> {
        let path = self.cache_path.as_ref()?;
        let meta = tokio::fs::metadata(path).await.ok()?;
        let age = SystemTime::now()
            .duration_since(meta.modified().ok()?)
            .unwrap_or_default();
        if age > self.cache_max_age {
            debug!(path = %path.display(), age_secs = age.as_secs(), "Pool cache stale");
            return None;
        }
        tokio::fs::read_to_string(path).await.ok()
    }

    async fn write_cache(&self, body: &str) {
        if let Some(path) = &self.cache_path {
            if let Err(e) = tokio::fs::write(path, body).await {
                warn!(path = %path.display(), error = %e, "Failed to write pool cache");
            }
        }
    }
}

#[async_trait]
impl PoolSource for DefiLlamaSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Primary
    }

    fn token_cost(&self) -> u32 {
        self.token_cost
    }

    async fn fetch(&self) -> Result<Vec<PoolRecord>> {
        if let Some(body) = self.read_cache().await {
            match parse_pools(&body) {
                Ok(pools) => {
                    debug!(count = pools.len(), "Using cached pool listing");
                    return Ok(pools);
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable pool cache"),
            }
        }

        let body = send_for_body(SOURCE_NAME, self.client.get(&self.url)).await?;
        let pools = parse_pools(&body)?;
        self.write_cache(&body).await;
        Ok(pools)
    }
}

/// Parse a `/pools` response, either `{"data": [...]}` or a bare array.
/// Entries without a pool id are skipped.
pub fn parse_pools(body: &str) -> Result<Vec<PoolRecord>> {
    let payload: PoolsPayload = serde_json::from_str(body).map_err(|e| Error::MalformedPayload {
        source_name: SOURCE_NAME.to_string(),
        reason: e.to_string(),
    })?;

    let entries = match payload {
        PoolsPayload::Wrapped { data } => data,
        PoolsPayload::Bare(items) => items,
    };

    let total = entries.len();
    let pools: Vec<PoolRecord> = entries.iter().filter_map(parse_entry).collect();
    if pools.len() < total {
        debug!(skipped = total - pools.len(), "Skipped pool entries without an id");
    }
    Ok(pools)
}

fn parse_entry(entry: &serde_json::Value) -> Option<PoolRecord> {
    let obj = entry.as_object()?;
    let identifier = obj.get("pool")?.as_str()?.trim();
    if identifier.is_empty() {
        return None;
    }

    let chain = obj
        .get("chain")
        .and_then(|v| v.as_str())
        .map(Chain::parse)
        .unwrap_or(Chain::Other("unknown".into()));
    let symbol = obj.get("symbol").and_then(|v| v.as_str()).unwrap_or_default();
    let apy = obj.get("apy").and_then(as_f64).unwrap_or(0.0);
    let tvl = obj.get("tvlUsd").and_then(as_f64).unwrap_or(0.0);

    let mut record = PoolRecord::new(identifier, chain, symbol, apy, tvl);
    record.underlying_tokens = obj
        .get("underlyingTokens")
        .and_then(|v| v.as_array())
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|t| t.as_str())
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    record.extra = obj
        .iter()
        .filter(|(k, _)| !MAPPED_FIELDS.contains(&k.as_str()))
        .filter_map(|(k, v)| ExtraValue::from_json(v).map(|v| (k.clone(), v)))
        .collect::<BTreeMap<_, _>>();

    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::TokenCandidate;

    const SAMPLE: &str = r#"{
        "status": "success",
        "data": [
            {
                "pool": "747c1d2a-c668-4682-b9f9-296708a3dd90",
                "chain": "Ethereum",
                "project": "lido",
                "symbol": "STETH",
                "tvlUsd": 24500000000,
                "apy": 3.1,
                "apyBase": 3.1,
                "apyReward": null,
                "rewardTokens": ["0x5a98fcbea516cf06857215779fd812ca3bef1b32"],
                "underlyingTokens": ["0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"],
                "stablecoin": false
            },
            {
                "pool": "p-arb",
                "chain": "Arbitrum",
                "symbol": "USDC-USDT",
                "tvlUsd": "1500000",
                "apy": "7.5"
            },
            { "chain": "Ethereum", "symbol": "NOID", "apy": 1.0 }
        ]
    }"#;

    #[test]
    fn test_parse_wrapped_payload() {
        let pools = parse_pools(SAMPLE).unwrap();
        assert_eq!(pools.len(), 2);

        let steth = &pools[0];
        assert_eq!(steth.chain, Chain::Ethereum);
        assert_eq!(steth.symbol, "steth");
        assert_eq!(steth.apy, 3.1);
        assert_eq!(
            steth.underlying_tokens,
            vec!["0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".to_string()]
        );
        assert_eq!(steth.extra.get("project"), Some(&ExtraValue::Str("lido".into())));
        assert_eq!(steth.extra.get("apyReward"), Some(&ExtraValue::Null));
        // arrays have no scalar form
        assert!(!steth.extra.contains_key("rewardTokens"));
        assert!(!steth.extra.contains_key("tvlUsd"));

        let arb = &pools[1];
        assert_eq!(arb.chain, Chain::Arbitrum);
        assert_eq!(arb.tvl_usd, 1_500_000.0);
        assert_eq!(arb.apy, 7.5);
    }

    #[test]
    fn test_solana_mint_keeps_case() {
        let mint = "J1toso1uCk3RLmjorhTtrVwY9HJ7X8V9yYac6Y7kGCPn";
        let body = format!(
            r#"[{{"pool": "jito", "chain": "Solana", "symbol": "JITOSOL", "underlyingTokens": ["{}"]}}]"#,
            mint
        );
        let pools = parse_pools(&body).unwrap();
        assert_eq!(pools[0].underlying_tokens, vec![mint.to_string()]);
        assert!(TokenCandidate::new(mint, Chain::Solana, "defillama").is_ok());
    }

    #[test]
    fn test_parse_bare_array() {
        let pools = parse_pools(r#"[{"pool": "x", "chain": "eth", "symbol": "WETH"}]"#).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].chain, Chain::Ethereum);
        assert_eq!(pools[0].tvl_usd, 0.0);
        assert!(!pools[0].has_valid_tvl());
    }

    #[test]
    fn test_malformed_payload_is_retryable() {
        let err = parse_pools(r#"{"status": "error"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedPayload { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fresh_cache_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pools.json");
        tokio::fs::write(&path, SAMPLE).await.unwrap();

        let config = SourcesConfig {
            // unroutable, so a network call would fail
            defillama_url: "http://127.0.0.1:9/pools".into(),
            cache_path: Some(path.to_string_lossy().into_owned()),
            ..SourcesConfig::default()
        };
        let source = DefiLlamaSource::new(&config, Duration::from_secs(1)).unwrap();

        let pools = source.fetch().await.unwrap();
        assert_eq!(pools.len(), 2);
    }
}
