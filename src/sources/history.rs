//! Historical APY series used to seed volatility estimates

use async_trait::async_trait;
use std::time::Duration;

use super::{as_f64, http_client, send_for_body};
use crate::config::SourcesConfig;
use crate::error::{Error, Result};

const SOURCE_NAME: &str = "defillama-chart";

#[async_trait]
pub trait HistorySource: Send + Sync {
    fn name(&self) -> &str;

    fn token_cost(&self) -> u32;

    /// APY observations for a pool, oldest first
    async fn apy_history(&self, pool_id: &str) -> Result<Vec<f64>>;
}

pub struct DefiLlamaHistorySource {
    client: reqwest::Client,
    base_url: String,
    token_cost: u32,
}

impl DefiLlamaHistorySource {
    pub fn new(config: &SourcesConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: config.history_url.trim_end_matches('/').to_string(),
            token_cost: config.history_token_cost,
        })
    }
}

#[async_trait]
impl HistorySource for DefiLlamaHistorySource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn token_cost(&self) -> u32 {
        self.token_cost
    }

    async fn apy_history(&self, pool_id: &str) -> Result<Vec<f64>> {
        let url = format!("{}/{}", self.base_url, pool_id);
        let body = send_for_body(SOURCE_NAME, self.client.get(&url)).await?;
        parse_chart(&body)
    }
}

/// Extract the `apy` column from a `/chart/{pool}` response, skipping gaps
pub fn parse_chart(body: &str) -> Result<Vec<f64>> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::MalformedPayload {
            source_name: SOURCE_NAME.to_string(),
            reason: e.to_string(),
        })?;
    let points = value
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::MalformedPayload {
            source_name: SOURCE_NAME.to_string(),
            reason: "missing data array".into(),
        })?;

    Ok(points
        .iter()
        .filter_map(|p| p.get("apy").and_then(as_f64))
        .collect())
}
