//! Token discovery via CoinGecko with a local JSON registry
//!
//! Resolves a symbol or name to a contract address and remembers the answer
//! so the two CoinGecko calls are only made once per token.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TokenCandidate;
use crate::config::RiskConfig;
use crate::error::{Error, Result};
use crate::sources::{http_client, send_for_body, SourceFetcher};
use crate::types::Chain;

const SOURCE_NAME: &str = "coingecko";

/// The full coin list is heavy on CoinGecko's side
const LIST_TOKEN_COST: u32 = 50;
const COIN_TOKEN_COST: u32 = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct CoinListEntry {
    pub id: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinDetail {
    pub id: String,
    #[serde(default)]
    pub platforms: HashMap<String, Option<String>>,
}

/// CoinGecko platform id for a chain
fn coingecko_platform(chain: &Chain) -> &str {
    match chain {
        Chain::Ethereum => "ethereum",
        Chain::Arbitrum => "arbitrum-one",
        Chain::Optimism => "optimistic-ethereum",
        Chain::Polygon => "polygon-pos",
        Chain::Base => "base",
        Chain::Gnosis => "xdai",
        Chain::Avalanche => "avalanche",
        Chain::Bsc => "binance-smart-chain",
        Chain::Linea => "linea",
        Chain::Nova => "arbitrum-nova",
        Chain::Solana => "solana",
        Chain::Other(slug) => slug.as_str(),
    }
}

fn registry_key(query: &str, chain: &Chain) -> String {
    format!("{}:{}", chain.slug(), query.trim().to_lowercase())
}

pub struct TokenDiscovery {
    client: reqwest::Client,
    base_url: String,
    registry_path: PathBuf,
    fetcher: SourceFetcher,
    /// Loaded lazily from `registry_path`
    registry: Mutex<Option<BTreeMap<String, String>>>,
}

impl TokenDiscovery {
    pub fn new(config: &RiskConfig, fetcher: SourceFetcher, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: config.coingecko_url.trim_end_matches('/').to_string(),
            registry_path: PathBuf::from(&config.token_registry_path),
            fetcher,
            registry: Mutex::new(None),
        })
    }

    /// Registry lookup only, no network
    pub async fn lookup(&self, query: &str, chain: &Chain) -> Result<Option<String>> {
        let mut guard = self.registry.lock().await;
        let registry = self.loaded(&mut guard).await;
        Ok(registry.get(&registry_key(query, chain)).cloned())
    }

    /// Resolve a symbol or name to a candidate on `chain`.
    ///
    /// `Ok(None)` means CoinGecko has no matching coin or no address on that chain.
    pub async fn discover(
        &self,
        query: &str,
        chain: &Chain,
        cancel: &CancellationToken,
    ) -> Result<Option<TokenCandidate>> {
        if let Some(address) = self.lookup(query, chain).await? {
            debug!(query, %chain, "Token found in registry");
            return TokenCandidate::new(&address, chain.clone(), SOURCE_NAME).map(Some);
        }

        let list_url = format!("{}/coins/list", self.base_url);
        let coins: Vec<CoinListEntry> = self
            .fetcher
            .call(SOURCE_NAME, LIST_TOKEN_COST, cancel, || async {
                let body = send_for_body(SOURCE_NAME, self.client.get(&list_url)).await?;
                parse_json(&body)
            })
            .await
            .map_err(|e| e.cause)?;

        let Some(coin_id) = match_coin(&coins, query) else {
            info!(query, "No CoinGecko coin matches");
            return Ok(None);
        };

        let coin_url = format!("{}/coins/{}", self.base_url, coin_id);
        let detail: CoinDetail = self
            .fetcher
            .call(SOURCE_NAME, COIN_TOKEN_COST, cancel, || async {
                let body = send_for_body(SOURCE_NAME, self.client.get(&coin_url)).await?;
                parse_json(&body)
            })
            .await
            .map_err(|e| e.cause)?;

        let Some(address) = platform_address(&detail, chain) else {
            warn!(coin = %detail.id, %chain, "Coin has no address on chain");
            return Ok(None);
        };

        let candidate = match TokenCandidate::new(&address, chain.clone(), SOURCE_NAME) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(coin = %detail.id, error = %e, "CoinGecko returned an invalid address");
                return Ok(None);
            }
        };

        self.remember(query, chain, &candidate.address).await?;
        info!(query, %chain, address = %candidate.address, "Discovered token");
        Ok(Some(candidate))
    }

    async fn remember(&self, query: &str, chain: &Chain, address: &str) -> Result<()> {
        let mut guard = self.registry.lock().await;
        let registry = self.loaded(&mut guard).await;
        registry.insert(registry_key(query, chain), address.to_string());

        let json = serde_json::to_string_pretty(registry)?;
        tokio::fs::write(&self.registry_path, json).await?;
        debug!(path = %self.registry_path.display(), "Token registry saved");
        Ok(())
    }

    async fn loaded<'a>(
        &self,
        slot: &'a mut Option<BTreeMap<String, String>>,
    ) -> &'a mut BTreeMap<String, String> {
        if slot.is_none() {
            *slot = Some(load_registry(&self.registry_path).await);
        }
        slot.get_or_insert_with(BTreeMap::new)
    }
}

async fn load_registry(path: &PathBuf) -> BTreeMap<String, String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_str(&content) {
        Ok(registry) => registry,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable token registry");
            BTreeMap::new()
        }
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::MalformedPayload {
        source_name: SOURCE_NAME.to_string(),
        reason: e.to_string(),
    })
}

/// First coin whose symbol or name equals the query, case-insensitively
pub fn match_coin<'a>(coins: &'a [CoinListEntry], query: &str) -> Option<&'a str> {
    let q = query.trim().to_lowercase();
    coins
        .iter()
        .find(|c| c.symbol.to_lowercase() == q || c.name.to_lowercase() == q)
        .map(|c| c.id.as_str())
}

pub fn platform_address(detail: &CoinDetail, chain: &Chain) -> Option<String> {
    detail
        .platforms
        .get(coingecko_platform(chain))
        .and_then(|a| a.as_deref())
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::RetryPolicy;
    use crate::throttle::{ThrottleLimits, Throttler};
    use std::sync::Arc;

    fn discovery(registry_path: &std::path::Path) -> TokenDiscovery {
        let config = RiskConfig {
            // unroutable, so a network call would fail
            coingecko_url: "http://127.0.0.1:9".into(),
            token_registry_path: registry_path.to_string_lossy().into_owned(),
            ..RiskConfig::default()
        };
        let throttle = Arc::new(Throttler::new(ThrottleLimits {
            max_requests: 10,
            max_tokens: 100,
            window: Duration::from_secs(60),
            rate_limit_backoff: Duration::from_secs(1),
        }));
        let fetcher = SourceFetcher::new(
            throttle,
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                attempt_timeout: Duration::from_secs(1),
            },
        );
        TokenDiscovery::new(&config, fetcher, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_match_coin_by_symbol_or_name() {
        let coins: Vec<CoinListEntry> = serde_json::from_str(
            r#"[
                {"id": "usd-coin", "symbol": "usdc", "name": "USDC"},
                {"id": "dai", "symbol": "dai", "name": "Dai"},
                {"id": "lido-staked-ether", "symbol": "steth", "name": "Lido Staked Ether"}
            ]"#,
        )
        .unwrap();
        assert_eq!(match_coin(&coins, "USDC"), Some("usd-coin"));
        assert_eq!(match_coin(&coins, "lido staked ether"), Some("lido-staked-ether"));
        assert_eq!(match_coin(&coins, "nope"), None);
    }

    #[test]
    fn test_platform_address_per_chain() {
        let detail: CoinDetail = serde_json::from_str(
            r#"{"id": "usd-coin", "platforms": {
                "ethereum": "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
                "arbitrum-one": "0xaf88d065e77c8cc2239327c5edb3a432268e5831",
                "": ""
            }}"#,
        )
        .unwrap();
        assert_eq!(
            platform_address(&detail, &Chain::Ethereum).as_deref(),
            Some("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48")
        );
        assert!(platform_address(&detail, &Chain::Arbitrum).is_some());
        assert!(platform_address(&detail, &Chain::Polygon).is_none());
    }

    #[tokio::test]
    async fn test_registry_hit_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        tokio::fs::write(
            &path,
            r#"{"ethereum:usdc": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"}"#,
        )
        .await
        .unwrap();

        let found = discovery(&path)
            .discover("USDC", &Chain::Ethereum, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.address, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48");
        assert_eq!(found.discovery_source, "coingecko");
    }

    #[tokio::test]
    async fn test_remember_persists_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let d = discovery(&path);

        d.remember("DAI", &Chain::Ethereum, "0x6b175474e89094c44da98b954eedeac495271d0f")
            .await
            .unwrap();

        let saved: BTreeMap<String, String> =
            serde_json::from_str(&tokio::fs::read_to_string(&path).await.unwrap()).unwrap();
        assert_eq!(
            saved.get("ethereum:dai").map(String::as_str),
            Some("0x6b175474e89094c44da98b954eedeac495271d0f")
        );
        assert!(d.lookup("dai", &Chain::Ethereum).await.unwrap().is_some());
    }
}
