//! Configuration loading and validation

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::pipeline::merge::MergePolicy;

/// Main configuration structure
///
/// Treated as an immutable snapshot for the duration of a run; callers share
/// it behind an `Arc`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub volatility: VolatilityConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub risk: RiskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    /// Merge LSD subgraph data into the pool universe
    #[serde(default = "default_true")]
    pub lsd_merges: bool,
    /// Volatility used when a pool has too little history
    #[serde(default = "default_fallback_vol")]
    pub fallback_vol: f64,
    /// Total attempts per source fetch (not additional retries)
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,
    /// Maximum pools in the ranked output, 0 = unlimited
    #[serde(default = "default_max_pools")]
    pub max_pools: usize,
    #[serde(default = "default_min_apy")]
    pub min_apy: f64,
    #[serde(default = "default_min_tvl")]
    pub min_tvl: f64,
    #[serde(default = "default_max_chain_factor")]
    pub max_chain_factor: f64,
    /// Chain the strategy holds capital on; pools elsewhere need bridging
    #[serde(default = "default_home_chain")]
    pub home_chain: String,
    /// Chain factor for chains missing from `chain_risk`
    #[serde(default = "default_unknown_chain_factor")]
    pub unknown_chain_factor: f64,
    #[serde(default = "default_chain_risk")]
    pub chain_risk: HashMap<String, f64>,
    #[serde(default)]
    pub weights: AggregatorWeights,
    #[serde(default)]
    pub merge_policy: MergePolicy,
    /// Per-attempt timeout for source fetches
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Where the ranked output is written
    #[serde(default = "default_output_path")]
    pub output_path: String,
}

/// Weights of the composite score
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorWeights {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_delta")]
    pub delta: f64,
    #[serde(default = "default_bridging_penalty")]
    pub bridging_penalty: f64,
    #[serde(default = "default_lsd_bridging_penalty")]
    pub lsd_bridging_multiplier_penalty: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolatilityConfig {
    /// Observations retained per pool
    #[serde(default = "default_window_len")]
    pub window_len: usize,
    /// Fewer observations than this yields the fallback volatility
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,
    /// Seed empty series from the APY chart endpoint
    #[serde(default)]
    pub seed_history: bool,
    /// Only the highest-TVL pools are seeded
    #[serde(default = "default_history_seed_limit")]
    pub history_seed_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_max_requests_per_minute")]
    pub max_requests_per_minute: u32,
    #[serde(default = "default_max_tokens_per_minute")]
    pub max_tokens_per_minute: u32,
    #[serde(default = "default_rate_limit_backoff_seconds")]
    pub rate_limit_backoff_seconds: f64,
    /// Length of the rolling window
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Keep window state between runs instead of resetting it
    #[serde(default = "default_true")]
    pub persist_across_runs: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    #[serde(default = "default_defillama_url")]
    pub defillama_url: String,
    #[serde(default = "default_defillama_token_cost")]
    pub defillama_token_cost: u32,
    /// Optional on-disk cache of the pool listing
    #[serde(default)]
    pub cache_path: Option<String>,
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
    #[serde(default = "default_lido_subgraph_url")]
    pub lido_subgraph_url: String,
    /// Identifier the LSD record is published under
    #[serde(default = "default_lsd_pool_identifier")]
    pub lsd_pool_identifier: String,
    #[serde(default = "default_lsd_token_cost")]
    pub lsd_token_cost: u32,
    #[serde(default = "default_history_url")]
    pub history_url: String,
    #[serde(default = "default_history_token_cost")]
    pub history_token_cost: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_min_liquidity_usd")]
    pub min_liquidity_usd: f64,
    #[serde(default = "default_min_volume_24h_usd")]
    pub min_volume_24h_usd: f64,
    #[serde(default = "default_min_unique_holders")]
    pub min_unique_holders: u64,
    #[serde(default = "default_max_top_holders_percent")]
    pub max_top_holders_percent: f64,
    /// Venues (dex ids) whose liquidity counts. Empty = any venue.
    #[serde(default = "default_reputable_venues")]
    pub reputable_venues: Vec<String>,
    #[serde(default = "default_verdict_ttl_secs")]
    pub verdict_ttl_secs: u64,
    /// Attempts per external check before it is treated as unavailable
    #[serde(default = "default_max_check_attempts")]
    pub max_check_attempts: u32,
    /// Drop pools whose underlying tokens fail vetting
    #[serde(default)]
    pub gate_pools: bool,
    #[serde(default = "default_max_concurrent_vets")]
    pub max_concurrent_vets: usize,
    #[serde(default = "default_dexscreener_url")]
    pub dexscreener_url: String,
    #[serde(default = "default_moralis_url")]
    pub moralis_url: String,
    #[serde(default = "default_moralis_api_key")]
    pub moralis_api_key: String,
    #[serde(default = "default_explorer_url")]
    pub explorer_url: String,
    #[serde(default = "default_explorer_api_key")]
    pub explorer_api_key: String,
    #[serde(default = "default_coingecko_url")]
    pub coingecko_url: String,
    #[serde(default = "default_token_registry_path")]
    pub token_registry_path: String,
}

fn default_true() -> bool {
    true
}
fn default_fallback_vol() -> f64 {
    0.05
}
fn default_max_fetch_retries() -> u32 {
    3
}
fn default_max_pools() -> usize {
    50
}
fn default_min_apy() -> f64 {
    1.0
}
fn default_min_tvl() -> f64 {
    1_000_000.0
}
fn default_max_chain_factor() -> f64 {
    2.0
}
fn default_home_chain() -> String {
    "ethereum".into()
}
fn default_unknown_chain_factor() -> f64 {
    5.0
}
fn default_chain_risk() -> HashMap<String, f64> {
    [
        ("ethereum", 1.0),
        ("arbitrum", 1.2),
        ("optimism", 1.2),
        ("base", 1.3),
        ("polygon", 1.4),
        ("gnosis", 1.5),
        ("avalanche", 1.5),
        ("bsc", 1.8),
        ("linea", 1.6),
        ("nova", 1.7),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_retry_base_delay_ms() -> u64 {
    2_000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_output_path() -> String {
    "aggregator_output.json".into()
}
fn default_alpha() -> f64 {
    1.0
}
fn default_beta() -> f64 {
    2.0
}
fn default_gamma() -> f64 {
    2.5
}
fn default_delta() -> f64 {
    1.0
}
fn default_bridging_penalty() -> f64 {
    2.0
}
fn default_lsd_bridging_penalty() -> f64 {
    1.0
}
fn default_window_len() -> usize {
    30
}
fn default_min_observations() -> usize {
    3
}
fn default_history_seed_limit() -> usize {
    25
}
fn default_max_requests_per_minute() -> u32 {
    300
}
fn default_max_tokens_per_minute() -> u32 {
    1_500
}
fn default_rate_limit_backoff_seconds() -> f64 {
    5.0
}
fn default_window_secs() -> u64 {
    60
}
fn default_defillama_url() -> String {
    std::env::var("DEFI_LLAMA_API_URL").unwrap_or_else(|_| "https://yields.llama.fi/pools".into())
}
fn default_defillama_token_cost() -> u32 {
    50
}
fn default_cache_max_age_secs() -> u64 {
    600
}
fn default_lido_subgraph_url() -> String {
    std::env::var("LIDO_SUBGRAPH_URL")
        .unwrap_or_else(|_| "https://api.thegraph.com/subgraphs/name/lidofinance/lido".into())
}
fn default_lsd_pool_identifier() -> String {
    // DeFiLlama's id for Lido stETH, so both sources collide on merge
    "747c1d2a-c668-4682-b9f9-296708a3dd90".into()
}
fn default_lsd_token_cost() -> u32 {
    10
}
fn default_history_url() -> String {
    "https://yields.llama.fi/chart".into()
}
fn default_history_token_cost() -> u32 {
    10
}
fn default_min_liquidity_usd() -> f64 {
    50_000.0
}
fn default_min_volume_24h_usd() -> f64 {
    20_000.0
}
fn default_min_unique_holders() -> u64 {
    500
}
fn default_max_top_holders_percent() -> f64 {
    50.0
}
fn default_reputable_venues() -> Vec<String> {
    ["uniswap", "sushiswap", "curve", "balancer", "pancakeswap", "aerodrome", "velodrome", "camelot", "raydium", "orca"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_verdict_ttl_secs() -> u64 {
    3_600
}
fn default_max_check_attempts() -> u32 {
    2
}
fn default_max_concurrent_vets() -> usize {
    4
}
fn default_dexscreener_url() -> String {
    "https://api.dexscreener.com".into()
}
fn default_moralis_url() -> String {
    "https://deep-index.moralis.io/api/v2".into()
}
fn default_moralis_api_key() -> String {
    std::env::var("MORALIS_API_KEY").unwrap_or_default()
}
fn default_explorer_url() -> String {
    "https://api.etherscan.io/api".into()
}
fn default_explorer_api_key() -> String {
    std::env::var("ETHERSCAN_API_KEY").unwrap_or_default()
}
fn default_coingecko_url() -> String {
    "https://api.coingecko.com/api/v3".into()
}
fn default_token_registry_path() -> String {
    "token_registry.json".into()
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            lsd_merges: true,
            fallback_vol: default_fallback_vol(),
            max_fetch_retries: default_max_fetch_retries(),
            max_pools: default_max_pools(),
            min_apy: default_min_apy(),
            min_tvl: default_min_tvl(),
            max_chain_factor: default_max_chain_factor(),
            home_chain: default_home_chain(),
            unknown_chain_factor: default_unknown_chain_factor(),
            chain_risk: default_chain_risk(),
            weights: AggregatorWeights::default(),
            merge_policy: MergePolicy::default(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            output_path: default_output_path(),
        }
    }
}

impl Default for AggregatorWeights {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            beta: default_beta(),
            gamma: default_gamma(),
            delta: default_delta(),
            bridging_penalty: default_bridging_penalty(),
            lsd_bridging_multiplier_penalty: default_lsd_bridging_penalty(),
        }
    }
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            window_len: default_window_len(),
            min_observations: default_min_observations(),
            seed_history: false,
            history_seed_limit: default_history_seed_limit(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: default_max_requests_per_minute(),
            max_tokens_per_minute: default_max_tokens_per_minute(),
            rate_limit_backoff_seconds: default_rate_limit_backoff_seconds(),
            window_secs: default_window_secs(),
            persist_across_runs: true,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            defillama_url: default_defillama_url(),
            defillama_token_cost: default_defillama_token_cost(),
            cache_path: None,
            cache_max_age_secs: default_cache_max_age_secs(),
            lido_subgraph_url: default_lido_subgraph_url(),
            lsd_pool_identifier: default_lsd_pool_identifier(),
            lsd_token_cost: default_lsd_token_cost(),
            history_url: default_history_url(),
            history_token_cost: default_history_token_cost(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_liquidity_usd: default_min_liquidity_usd(),
            min_volume_24h_usd: default_min_volume_24h_usd(),
            min_unique_holders: default_min_unique_holders(),
            max_top_holders_percent: default_max_top_holders_percent(),
            reputable_venues: default_reputable_venues(),
            verdict_ttl_secs: default_verdict_ttl_secs(),
            max_check_attempts: default_max_check_attempts(),
            gate_pools: false,
            max_concurrent_vets: default_max_concurrent_vets(),
            dexscreener_url: default_dexscreener_url(),
            moralis_url: default_moralis_url(),
            moralis_api_key: default_moralis_api_key(),
            explorer_url: default_explorer_url(),
            explorer_api_key: default_explorer_api_key(),
            coingecko_url: default_coingecko_url(),
            token_registry_path: default_token_registry_path(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix YIELD_SCOUT__)
            .add_source(
                config::Environment::with_prefix("YIELD_SCOUT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregator;

        if !agg.fallback_vol.is_finite() || agg.fallback_vol < 0.0 {
            return Err(Error::Config("fallback_vol must be a non-negative number".into()));
        }
        if agg.max_fetch_retries == 0 {
            return Err(Error::Config("max_fetch_retries must be at least 1".into()));
        }
        for (name, value) in [
            ("min_apy", agg.min_apy),
            ("min_tvl", agg.min_tvl),
            ("max_chain_factor", agg.max_chain_factor),
        ] {
            if !value.is_finite() {
                return Err(Error::Config(format!("{} must be finite", name)));
            }
        }
        if agg.min_tvl < 0.0 {
            return Err(Error::Config("min_tvl cannot be negative".into()));
        }
        if agg.unknown_chain_factor < 1.0 {
            return Err(Error::Config("unknown_chain_factor must be >= 1".into()));
        }
        for (chain, factor) in &agg.chain_risk {
            if !factor.is_finite() || *factor < 1.0 {
                return Err(Error::Config(format!(
                    "chain_risk for {} must be >= 1, got {}",
                    chain, factor
                )));
            }
        }

        let w = &agg.weights;
        for (name, value) in [
            ("alpha", w.alpha),
            ("beta", w.beta),
            ("gamma", w.gamma),
            ("delta", w.delta),
            ("bridging_penalty", w.bridging_penalty),
            ("lsd_bridging_multiplier_penalty", w.lsd_bridging_multiplier_penalty),
        ] {
            if !value.is_finite() {
                return Err(Error::Config(format!("weight {} must be finite", name)));
            }
        }

        if agg.fetch_timeout_secs == 0 {
            return Err(Error::Config("fetch_timeout_secs must be positive".into()));
        }
        if agg.retry_base_delay_ms > agg.retry_max_delay_ms {
            return Err(Error::Config(
                "retry_base_delay_ms cannot exceed retry_max_delay_ms".into(),
            ));
        }

        if self.volatility.window_len < 2 {
            return Err(Error::Config("volatility.window_len must be at least 2".into()));
        }
        if self.volatility.min_observations > self.volatility.window_len {
            tracing::warn!(
                "volatility.min_observations ({}) exceeds window_len ({}); every pool will use fallback_vol",
                self.volatility.min_observations,
                self.volatility.window_len
            );
        }

        let t = &self.throttle;
        if t.max_requests_per_minute == 0 || t.max_tokens_per_minute == 0 {
            return Err(Error::Config("throttle ceilings must be positive".into()));
        }
        if t.window_secs == 0 {
            return Err(Error::Config("throttle.window_secs must be positive".into()));
        }
        if !t.rate_limit_backoff_seconds.is_finite() || t.rate_limit_backoff_seconds < 0.0 {
            return Err(Error::Config("rate_limit_backoff_seconds cannot be negative".into()));
        }
        for (name, cost) in [
            ("defillama_token_cost", self.sources.defillama_token_cost),
            ("lsd_token_cost", self.sources.lsd_token_cost),
            ("history_token_cost", self.sources.history_token_cost),
        ] {
            if cost > t.max_tokens_per_minute {
                return Err(Error::Config(format!(
                    "{} ({}) exceeds max_tokens_per_minute ({})",
                    name, cost, t.max_tokens_per_minute
                )));
            }
        }

        let r = &self.risk;
        if r.min_liquidity_usd < 0.0 || r.min_volume_24h_usd < 0.0 {
            return Err(Error::Config("risk thresholds cannot be negative".into()));
        }
        if !(0.0..=100.0).contains(&r.max_top_holders_percent) {
            return Err(Error::Config("max_top_holders_percent must be between 0 and 100".into()));
        }
        if r.max_check_attempts == 0 {
            return Err(Error::Config("risk.max_check_attempts must be at least 1".into()));
        }
        if r.max_concurrent_vets == 0 {
            return Err(Error::Config("risk.max_concurrent_vets must be at least 1".into()));
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Aggregator:
    lsd_merges: {}
    min_apy: {}%
    min_tvl: ${}
    max_chain_factor: {}
    max_pools: {}
    home_chain: {}
    merge_policy: {:?}
  Throttle:
    max_requests_per_minute: {}
    max_tokens_per_minute: {}
    rate_limit_backoff: {}s
  Sources:
    defillama: {}
    lido_subgraph: {}
  Risk:
    min_liquidity: ${}
    min_volume_24h: ${}
    min_unique_holders: {}
    max_top_holders: {}%
    moralis_api_key: {}
    explorer_api_key: {}
"#,
            self.aggregator.lsd_merges,
            self.aggregator.min_apy,
            self.aggregator.min_tvl,
            self.aggregator.max_chain_factor,
            self.aggregator.max_pools,
            self.aggregator.home_chain,
            self.aggregator.merge_policy,
            self.throttle.max_requests_per_minute,
            self.throttle.max_tokens_per_minute,
            self.throttle.rate_limit_backoff_seconds,
            mask_url(&self.sources.defillama_url),
            mask_url(&self.sources.lido_subgraph_url),
            self.risk.min_liquidity_usd,
            self.risk.min_volume_24h_usd,
            self.risk.min_unique_holders,
            self.risk.max_top_holders_percent,
            mask_secret(&self.risk.moralis_api_key),
            mask_secret(&self.risk.explorer_api_key),
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

fn mask_secret(secret: &str) -> &'static str {
    if secret.is_empty() {
        "(not set)"
    } else {
        "***"
    }
}
