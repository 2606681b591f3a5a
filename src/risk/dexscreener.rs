//! DexScreener API client for token liquidity and volume

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{LiquiditySource, TokenCandidate, VenueLiquidity, VolumeSource};
use crate::error::{Error, Result};
use crate::sources::{http_client, send_for_body};
use crate::types::Chain;

const SOURCE_NAME: &str = "dexscreener";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
    pub base: Option<f64>,
    pub quote: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
    pub h6: Option<f64>,
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "baseToken")]
    pub base_token: BaseToken,
    pub volume: Option<Volume>,
    pub liquidity: Option<Liquidity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairsResponse {
    pub pairs: Option<Vec<DexPair>>,
}

/// DexScreener's chain slug
fn dexscreener_chain(chain: &Chain) -> &str {
    match chain {
        Chain::Gnosis => "gnosischain",
        other => other.slug(),
    }
}

pub struct DexScreenerClient {
    client: reqwest::Client,
    base_url: String,
}

impl DexScreenerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// All pairs for a token on its own chain
    pub async fn token_pairs(&self, token: &TokenCandidate) -> Result<Vec<DexPair>> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, token.address);
        debug!("Fetching DexScreener pairs for {}", token.address);

        let body = send_for_body(SOURCE_NAME, self.client.get(&url)).await?;
        parse_pairs(&body, &token.chain)
    }
}

/// Parse a token pairs response, keeping only pairs on `chain`
pub fn parse_pairs(body: &str, chain: &Chain) -> Result<Vec<DexPair>> {
    let data: TokenPairsResponse =
        serde_json::from_str(body).map_err(|e| Error::MalformedPayload {
            source_name: SOURCE_NAME.to_string(),
            reason: e.to_string(),
        })?;

    let wanted = dexscreener_chain(chain);
    Ok(data
        .pairs
        .unwrap_or_default()
        .into_iter()
        .filter(|p| p.chain_id.eq_ignore_ascii_case(wanted))
        .collect())
}

#[async_trait]
impl LiquiditySource for DexScreenerClient {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn liquidity(&self, token: &TokenCandidate) -> Result<Vec<VenueLiquidity>> {
        let pairs = self.token_pairs(token).await?;
        Ok(pairs
            .into_iter()
            .map(|p| VenueLiquidity {
                liquidity_usd: p.liquidity.and_then(|l| l.usd).unwrap_or(0.0),
                venue: p.dex_id,
            })
            .collect())
    }
}

#[async_trait]
impl VolumeSource for DexScreenerClient {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn volume_24h(&self, token: &TokenCandidate) -> Result<f64> {
        let pairs = self.token_pairs(token).await?;
        Ok(pairs
            .iter()
            .filter_map(|p| p.volume.as_ref().and_then(|v| v.h24))
            .filter(|v| v.is_finite())
            .fold(0.0_f64, f64::max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "schemaVersion": "1.0.0",
        "pairs": [
            {
                "chainId": "ethereum",
                "dexId": "uniswap",
                "pairAddress": "0xpair1",
                "baseToken": {"address": "0xae7a", "name": "Liquid staked Ether", "symbol": "stETH"},
                "volume": {"h24": 1200000.5, "h1": 1000},
                "liquidity": {"usd": 9000000.0}
            },
            {
                "chainId": "ethereum",
                "dexId": "curve",
                "pairAddress": "0xpair2",
                "baseToken": {"address": "0xae7a"},
                "volume": {"h24": 3400000.0},
                "liquidity": {"usd": 150000000.0}
            },
            {
                "chainId": "arbitrum",
                "dexId": "camelot",
                "pairAddress": "0xpair3",
                "baseToken": {"address": "0xae7a"},
                "volume": {"h24": 99000000.0},
                "liquidity": null
            }
        ]
    }"#;

    #[test]
    fn test_pairs_filtered_by_chain() {
        let pairs = parse_pairs(SAMPLE, &Chain::Ethereum).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.chain_id == "ethereum"));

        let arb = parse_pairs(SAMPLE, &Chain::Arbitrum).unwrap();
        assert_eq!(arb.len(), 1);
        assert!(arb[0].liquidity.is_none());
    }

    #[test]
    fn test_null_pairs_is_empty() {
        let pairs = parse_pairs(r#"{"schemaVersion": "1.0.0", "pairs": null}"#, &Chain::Ethereum).unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_pairs("<html>", &Chain::Ethereum),
            Err(Error::MalformedPayload { .. })
        ));
    }
}
