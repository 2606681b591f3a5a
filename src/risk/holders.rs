//! Holder distribution from Moralis, with total supply from an Etherscan-style explorer

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use super::{HolderDistribution, HolderSource, TokenCandidate};
use crate::config::RiskConfig;
use crate::error::{Error, Result};
use crate::sources::{as_f64, http_client, send_for_body};
use crate::types::Chain;

const SOURCE_NAME: &str = "moralis";
const EXPLORER_NAME: &str = "explorer";

/// Holders requested per call; only the largest ten matter
const HOLDER_PAGE: u32 = 100;

/// One holder row from the holders endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct HolderBalance {
    pub balance: f64,
    /// Share of total supply, when the API reports it
    pub percent_of_supply: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HolderPage {
    pub total: u64,
    pub holders: Vec<HolderBalance>,
}

/// Moralis chain parameter
fn moralis_chain(chain: &Chain) -> Option<&'static str> {
    match chain {
        Chain::Ethereum => Some("0x1"),
        Chain::Polygon => Some("0x89"),
        Chain::Bsc => Some("0x38"),
        Chain::Arbitrum => Some("0xa4b1"),
        Chain::Base => Some("0x2105"),
        Chain::Optimism => Some("0xa"),
        Chain::Avalanche => Some("0xa86a"),
        Chain::Gnosis => Some("0x64"),
        Chain::Linea => Some("0xe708"),
        _ => None,
    }
}

/// Moralis holder client
pub struct MoralisHolderClient {
    client: Client,
    base_url: String,
    api_key: String,
    explorer_url: String,
    explorer_api_key: String,
}

impl MoralisHolderClient {
    pub fn new(config: &RiskConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: config.moralis_url.trim_end_matches('/').to_string(),
            api_key: config.moralis_api_key.clone(),
            explorer_url: config.explorer_url.clone(),
            explorer_api_key: config.explorer_api_key.clone(),
        })
    }

    async fn holder_page(&self, token: &TokenCandidate, chain_hex: &str) -> Result<HolderPage> {
        if self.api_key.is_empty() {
            return Err(Error::MissingEnvVar("MORALIS_API_KEY".into()));
        }

        let url = format!("{}/erc20/{}/holders", self.base_url, token.address);
        let limit = HOLDER_PAGE.to_string();
        let request = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .query(&[("chain", chain_hex), ("limit", limit.as_str())]);

        let body = send_for_body(SOURCE_NAME, request).await?;
        parse_holder_page(&body)
    }

    async fn total_supply(&self, token: &TokenCandidate) -> Result<f64> {
        let request = self.client.get(&self.explorer_url).query(&[
            ("module", "stats"),
            ("action", "tokensupply"),
            ("contractaddress", token.address.as_str()),
            ("apikey", self.explorer_api_key.as_str()),
        ]);
        let body = send_for_body(EXPLORER_NAME, request).await?;
        parse_supply(&body)
    }
}

#[async_trait]
impl HolderSource for MoralisHolderClient {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn token_cost(&self) -> u32 {
        // holders page plus a possible supply lookup
        2
    }

    async fn holder_distribution(&self, token: &TokenCandidate) -> Result<HolderDistribution> {
        let chain_hex = moralis_chain(&token.chain).ok_or_else(|| Error::SourcePermanent {
            source_name: SOURCE_NAME.to_string(),
            reason: format!("unsupported chain {}", token.chain),
        })?;

        let page = self.holder_page(token, chain_hex).await?;
        let top10_percent = match top10_from_percentages(&page.holders) {
            Some(pct) => pct,
            None => {
                let supply = self.total_supply(token).await?;
                top10_from_supply(&page.holders, supply)?
            }
        };

        debug!(
            token = %token.address,
            holders = page.total,
            top10_percent,
            "Holder distribution"
        );
        Ok(HolderDistribution {
            unique_holders: page.total,
            top10_percent,
        })
    }
}

fn top_ten(holders: &[HolderBalance]) -> Vec<&HolderBalance> {
    let mut sorted: Vec<&HolderBalance> = holders.iter().collect();
    sorted.sort_by(|a, b| b.balance.total_cmp(&a.balance));
    sorted.truncate(10);
    sorted
}

/// Sum of reported supply shares for the ten largest holders, if every one has it
pub fn top10_from_percentages(holders: &[HolderBalance]) -> Option<f64> {
    let top = top_ten(holders);
    if top.is_empty() {
        return None;
    }
    top.iter()
        .map(|h| h.percent_of_supply)
        .sum::<Option<f64>>()
}

/// Ten largest balances as a percentage of `supply`
pub fn top10_from_supply(holders: &[HolderBalance], supply: f64) -> Result<f64> {
    if !(supply > 0.0) {
        return Err(Error::MalformedPayload {
            source_name: EXPLORER_NAME.to_string(),
            reason: format!("non-positive total supply {}", supply),
        });
    }
    let top: f64 = top_ten(holders).iter().map(|h| h.balance).sum();
    Ok(top / supply * 100.0)
}

pub fn parse_holder_page(body: &str) -> Result<HolderPage> {
    let malformed = |reason: String| Error::MalformedPayload {
        source_name: SOURCE_NAME.to_string(),
        reason,
    };
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;

    let rows = value
        .get("result")
        .and_then(|r| r.as_array())
        .ok_or_else(|| malformed("missing result array".into()))?;

    let holders: Vec<HolderBalance> = rows
        .iter()
        .filter_map(|row| {
            Some(HolderBalance {
                balance: row.get("balance").and_then(as_f64)?,
                percent_of_supply: row
                    .get("percentage_relative_to_total_supply")
                    .and_then(as_f64),
            })
        })
        .collect();

    let total = value
        .get("total")
        .and_then(as_u64_lenient)
        .ok_or_else(|| malformed("missing holder total".into()))?;

    Ok(HolderPage { total, holders })
}

/// Holder totals arrive as numbers or numeric strings
fn as_u64_lenient(value: &serde_json::Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Parse an explorer `tokensupply` response (`{"status":"1","result":"..."}`)
pub fn parse_supply(body: &str) -> Result<f64> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::MalformedPayload {
            source_name: EXPLORER_NAME.to_string(),
            reason: e.to_string(),
        })?;

    if value.get("status").and_then(|s| s.as_str()) != Some("1") {
        let message = value
            .get("result")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(Error::SourcePermanent {
            source_name: EXPLORER_NAME.to_string(),
            reason: message.to_string(),
        });
    }

    value
        .get("result")
        .and_then(as_f64)
        .ok_or_else(|| Error::MalformedPayload {
            source_name: EXPLORER_NAME.to_string(),
            reason: "result is not numeric".into(),
        })
}
