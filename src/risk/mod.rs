//! Token risk vetting
//!
//! A token is admitted only if it passes, in order:
//! 1. Liquidity: best reputable venue has at least `min_liquidity_usd`
//! 2. Volume: 24h volume of at least `min_volume_24h_usd`
//! 3. Holders: enough unique holders and a top-10 share under the cap
//!
//! The first failing check decides the verdict. A check whose data cannot be
//! fetched fails.

pub mod cache;
pub mod dexscreener;
pub mod discovery;
pub mod holders;

pub use cache::VerdictCache;
pub use dexscreener::DexScreenerClient;
pub use discovery::TokenDiscovery;
pub use holders::MoralisHolderClient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::error::{Error, Result};
use crate::sources::{RetryPolicy, SourceFetcher};
use crate::throttle::Throttler;
use crate::types::Chain;

lazy_static! {
    static ref EVM_ADDRESS: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").unwrap();
    static ref BASE58_ADDRESS: Regex =
        Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$").unwrap();
}

/// A token awaiting admission
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenCandidate {
    pub address: String,
    pub chain: Chain,
    pub discovery_source: String,
}

impl TokenCandidate {
    /// Validate and normalise an address. EVM addresses are lower-cased.
    pub fn new(address: &str, chain: Chain, discovery_source: impl Into<String>) -> Result<Self> {
        let address = address.trim();
        let normalised = if EVM_ADDRESS.is_match(address) {
            address.to_lowercase()
        } else if !chain.is_evm() && BASE58_ADDRESS.is_match(address) {
            address.to_string()
        } else {
            return Err(Error::InvalidToken {
                address: address.to_string(),
                chain: chain.to_string(),
            });
        };

        Ok(Self {
            address: normalised,
            chain,
            discovery_source: discovery_source.into(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheck {
    Liquidity,
    Volume,
    Holders,
}

impl fmt::Display for RiskCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskCheck::Liquidity => write!(f, "liquidity"),
            RiskCheck::Volume => write!(f, "volume"),
            RiskCheck::Holders => write!(f, "holders"),
        }
    }
}

/// Why a verdict came out the way it did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum VerdictReason {
    Passed,
    LiquidityBelowMinimum { observed_usd: f64 },
    VolumeBelowMinimum { observed_usd: f64 },
    TooFewHolders { observed: u64 },
    HoldersTooConcentrated { top10_percent: f64 },
    DataUnavailable { check: RiskCheck, reason: String },
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerdictReason::Passed => write!(f, "passed all checks"),
            VerdictReason::LiquidityBelowMinimum { observed_usd } => {
                write!(f, "liquidity ${:.0} below minimum", observed_usd)
            }
            VerdictReason::VolumeBelowMinimum { observed_usd } => {
                write!(f, "24h volume ${:.0} below minimum", observed_usd)
            }
            VerdictReason::TooFewHolders { observed } => {
                write!(f, "{} holders below minimum", observed)
            }
            VerdictReason::HoldersTooConcentrated { top10_percent } => {
                write!(f, "top 10 holders own {:.1}%", top10_percent)
            }
            VerdictReason::DataUnavailable { check, reason } => {
                write!(f, "{} data unavailable: {}", check, reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub admitted: bool,
    pub reason: VerdictReason,
    pub failed_check: Option<RiskCheck>,
    pub evaluated_at: DateTime<Utc>,
}

impl RiskVerdict {
    pub fn admit() -> Self {
        Self {
            admitted: true,
            reason: VerdictReason::Passed,
            failed_check: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn reject(check: RiskCheck, reason: VerdictReason) -> Self {
        Self {
            admitted: false,
            reason,
            failed_check: Some(check),
            evaluated_at: Utc::now(),
        }
    }

    /// Verdicts caused by missing data are not worth remembering
    pub fn is_cacheable(&self) -> bool {
        !matches!(self.reason, VerdictReason::DataUnavailable { .. })
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Passed,
    Failed(VerdictReason),
}

impl CheckOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, CheckOutcome::Passed)
    }
}

/// Liquidity on one trading venue
#[derive(Debug, Clone, PartialEq)]
pub struct VenueLiquidity {
    pub venue: String,
    pub liquidity_usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HolderDistribution {
    pub unique_holders: u64,
    /// Share of supply held by the ten largest holders, 0-100
    pub top10_percent: f64,
}

#[async_trait]
pub trait LiquiditySource: Send + Sync {
    fn name(&self) -> &str;
    fn token_cost(&self) -> u32 {
        1
    }
    async fn liquidity(&self, token: &TokenCandidate) -> Result<Vec<VenueLiquidity>>;
}

#[async_trait]
pub trait VolumeSource: Send + Sync {
    fn name(&self) -> &str;
    fn token_cost(&self) -> u32 {
        1
    }
    /// Highest 24h volume in USD across the token's markets
    async fn volume_24h(&self, token: &TokenCandidate) -> Result<f64>;
}

#[async_trait]
pub trait HolderSource: Send + Sync {
    fn name(&self) -> &str;
    fn token_cost(&self) -> u32 {
        1
    }
    async fn holder_distribution(&self, token: &TokenCandidate) -> Result<HolderDistribution>;
}

#[derive(Debug, Clone)]
pub struct RiskThresholds {
    pub min_liquidity_usd: f64,
    pub min_volume_24h_usd: f64,
    pub min_unique_holders: u64,
    pub max_top_holders_percent: f64,
    /// Lower-case venue prefixes. Empty accepts any venue.
    pub reputable_venues: Vec<String>,
}

impl From<&RiskConfig> for RiskThresholds {
    fn from(config: &RiskConfig) -> Self {
        Self {
            min_liquidity_usd: config.min_liquidity_usd,
            min_volume_24h_usd: config.min_volume_24h_usd,
            min_unique_holders: config.min_unique_holders,
            max_top_holders_percent: config.max_top_holders_percent,
            reputable_venues: config
                .reputable_venues
                .iter()
                .map(|v| v.to_lowercase())
                .collect(),
        }
    }
}

impl RiskThresholds {
    fn is_reputable(&self, venue: &str) -> bool {
        let venue = venue.to_lowercase();
        self.reputable_venues.is_empty()
            || self.reputable_venues.iter().any(|r| venue.starts_with(r.as_str()))
    }
}

/// Runs the three checks against external data sources
pub struct RiskVetter {
    thresholds: RiskThresholds,
    liquidity: Arc<dyn LiquiditySource>,
    volume: Arc<dyn VolumeSource>,
    holders: Arc<dyn HolderSource>,
    fetcher: SourceFetcher,
    cache: VerdictCache,
}

impl RiskVetter {
    pub fn new(
        thresholds: RiskThresholds,
        liquidity: Arc<dyn LiquiditySource>,
        volume: Arc<dyn VolumeSource>,
        holders: Arc<dyn HolderSource>,
        fetcher: SourceFetcher,
        cache: VerdictCache,
    ) -> Self {
        Self {
            thresholds,
            liquidity,
            volume,
            holders,
            fetcher,
            cache,
        }
    }

    /// Build a vetter backed by DexScreener and Moralis
    pub fn from_config(config: &RiskConfig, throttle: Arc<Throttler>, timeout: Duration) -> Result<Self> {
        let dex = Arc::new(DexScreenerClient::new(&config.dexscreener_url, timeout)?);
        let holders = Arc::new(MoralisHolderClient::new(config, timeout)?);
        let policy = RetryPolicy {
            max_attempts: config.max_check_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            attempt_timeout: timeout,
        };

        Ok(Self::new(
            RiskThresholds::from(config),
            dex.clone(),
            dex,
            holders,
            SourceFetcher::new(throttle, policy),
            VerdictCache::new(Duration::from_secs(config.verdict_ttl_secs)),
        ))
    }

    pub fn cache(&self) -> &VerdictCache {
        &self.cache
    }

    pub async fn check_liquidity(&self, token: &TokenCandidate, cancel: &CancellationToken) -> CheckOutcome {
        let venues = match self
            .fetcher
            .call(self.liquidity.name(), self.liquidity.token_cost(), cancel, || {
                self.liquidity.liquidity(token)
            })
            .await
        {
            Ok(venues) => venues,
            Err(e) => return unavailable(RiskCheck::Liquidity, e.cause),
        };

        let best = venues
            .iter()
            .filter(|v| self.thresholds.is_reputable(&v.venue))
            .map(|v| v.liquidity_usd)
            .filter(|usd| usd.is_finite())
            .fold(0.0_f64, f64::max);

        debug!(token = %token.address, best_liquidity = best, "Liquidity check");
        if best >= self.thresholds.min_liquidity_usd {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed(VerdictReason::LiquidityBelowMinimum { observed_usd: best })
        }
    }

    pub async fn check_volume(&self, token: &TokenCandidate, cancel: &CancellationToken) -> CheckOutcome {
        let volume = match self
            .fetcher
            .call(self.volume.name(), self.volume.token_cost(), cancel, || {
                self.volume.volume_24h(token)
            })
            .await
        {
            Ok(v) => v,
            Err(e) => return unavailable(RiskCheck::Volume, e.cause),
        };

        debug!(token = %token.address, volume_24h = volume, "Volume check");
        if volume >= self.thresholds.min_volume_24h_usd {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed(VerdictReason::VolumeBelowMinimum { observed_usd: volume })
        }
    }

    pub async fn check_holders(&self, token: &TokenCandidate, cancel: &CancellationToken) -> CheckOutcome {
        let dist = match self
            .fetcher
            .call(self.holders.name(), self.holders.token_cost(), cancel, || {
                self.holders.holder_distribution(token)
            })
            .await
        {
            Ok(d) => d,
            Err(e) => return unavailable(RiskCheck::Holders, e.cause),
        };

        debug!(
            token = %token.address,
            holders = dist.unique_holders,
            top10 = dist.top10_percent,
            "Holder check"
        );
        if dist.unique_holders < self.thresholds.min_unique_holders {
            CheckOutcome::Failed(VerdictReason::TooFewHolders {
                observed: dist.unique_holders,
            })
        } else if !(dist.top10_percent <= self.thresholds.max_top_holders_percent) {
            CheckOutcome::Failed(VerdictReason::HoldersTooConcentrated {
                top10_percent: dist.top10_percent,
            })
        } else {
            CheckOutcome::Passed
        }
    }

    /// Run all checks, stopping at the first failure. Ignores the cache.
    pub async fn vet_uncached(&self, token: &TokenCandidate, cancel: &CancellationToken) -> RiskVerdict {
        if let CheckOutcome::Failed(reason) = self.check_liquidity(token, cancel).await {
            return rejected(token, RiskCheck::Liquidity, reason);
        }
        if let CheckOutcome::Failed(reason) = self.check_volume(token, cancel).await {
            return rejected(token, RiskCheck::Volume, reason);
        }
        if let CheckOutcome::Failed(reason) = self.check_holders(token, cancel).await {
            return rejected(token, RiskCheck::Holders, reason);
        }

        info!(token = %token.address, chain = %token.chain, "Token admitted");
        RiskVerdict::admit()
    }

    /// Vet through the verdict cache; concurrent callers for one token share a single evaluation
    pub async fn vet(&self, token: &TokenCandidate, cancel: &CancellationToken) -> RiskVerdict {
        self.cache
            .get_or_compute(token, || self.vet_uncached(token, cancel))
            .await
    }
}

/// A check whose data cannot be fetched fails closed
fn unavailable(check: RiskCheck, cause: Error) -> CheckOutcome {
    let reason = cause.to_string();
    let error = Error::RiskCheckUnavailable {
        check: check.to_string(),
        reason: reason.clone(),
    };
    warn!(%error, "Failing check closed");
    CheckOutcome::Failed(VerdictReason::DataUnavailable { check, reason })
}

fn rejected(token: &TokenCandidate, check: RiskCheck, reason: VerdictReason) -> RiskVerdict {
    info!(token = %token.address, chain = %token.chain, %check, %reason, "Token rejected");
    RiskVerdict::reject(check, reason)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::throttle::ThrottleLimits;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Canned responses for all three checks with call counters
    pub struct StubMarket {
        pub venues: Vec<VenueLiquidity>,
        pub volume: f64,
        pub holders: Option<HolderDistribution>,
        pub delay: Duration,
        pub liquidity_calls: AtomicU32,
        pub volume_calls: AtomicU32,
        pub holder_calls: AtomicU32,
    }

    impl StubMarket {
        pub fn healthy() -> Self {
            Self {
                venues: vec![VenueLiquidity {
                    venue: "uniswap".into(),
                    liquidity_usd: 250_000.0,
                }],
                volume: 80_000.0,
                holders: Some(HolderDistribution {
                    unique_holders: 2_000,
                    top10_percent: 30.0,
                }),
                delay: Duration::ZERO,
                liquidity_calls: AtomicU32::new(0),
                volume_calls: AtomicU32::new(0),
                holder_calls: AtomicU32::new(0),
            }
        }

        pub fn calls(&self) -> (u32, u32, u32) {
            (
                self.liquidity_calls.load(Ordering::SeqCst),
                self.volume_calls.load(Ordering::SeqCst),
                self.holder_calls.load(Ordering::SeqCst),
            )
        }
    }

    #[async_trait]
    impl LiquiditySource for StubMarket {
        fn name(&self) -> &str {
            "stub-liquidity"
        }
        async fn liquidity(&self, _token: &TokenCandidate) -> Result<Vec<VenueLiquidity>> {
            self.liquidity_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.venues.clone())
        }
    }

    #[async_trait]
    impl VolumeSource for StubMarket {
        fn name(&self) -> &str {
            "stub-volume"
        }
        async fn volume_24h(&self, _token: &TokenCandidate) -> Result<f64> {
            self.volume_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.volume)
        }
    }

    #[async_trait]
    impl HolderSource for StubMarket {
        fn name(&self) -> &str {
            "stub-holders"
        }
        async fn holder_distribution(&self, _token: &TokenCandidate) -> Result<HolderDistribution> {
            self.holder_calls.fetch_add(1, Ordering::SeqCst);
            self.holders.clone().ok_or_else(|| Error::SourcePermanent {
                source_name: "stub-holders".into(),
                reason: "HTTP 401".into(),
            })
        }
    }

    pub fn thresholds() -> RiskThresholds {
        RiskThresholds::from(&RiskConfig::default())
    }

    pub fn vetter(market: Arc<StubMarket>) -> RiskVetter {
        let throttle = Arc::new(Throttler::new(ThrottleLimits {
            max_requests: 1_000,
            max_tokens: 1_000,
            window: Duration::from_secs(60),
            rate_limit_backoff: Duration::from_secs(1),
        }));
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(5),
        };
        RiskVetter::new(
            thresholds(),
            market.clone(),
            market.clone(),
            market,
            SourceFetcher::new(throttle, policy),
            VerdictCache::new(Duration::from_secs(3_600)),
        )
    }

    pub fn token() -> TokenCandidate {
        TokenCandidate::new(
            "0xAE7ab96520DE3A18E5e111B5EaAb095312D7fE84",
            Chain::Ethereum,
            "test",
        )
        .unwrap()
    }
}
