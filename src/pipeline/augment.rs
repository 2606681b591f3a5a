//! Derived per-pool features

use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};

use crate::config::AggregatorConfig;
use crate::types::{AugmentedPool, Chain, PoolRecord};

/// Lower bound on volatility when computing the APY/volatility ratio
pub const VOL_EPSILON: f64 = 1e-9;

lazy_static! {
    /// Symbol segments that identify liquid staking derivatives
    static ref LSD_SEGMENTS: HashSet<&'static str> = [
        "steth", "wsteth", "reth", "stmatic", "seth2", "ankr", "cbeth", "sfrxeth",
    ]
    .into_iter()
    .collect();
}

/// Risk multiplier per chain
#[derive(Debug, Clone)]
pub struct ChainRiskTable {
    factors: HashMap<Chain, f64>,
    unknown: f64,
}

impl ChainRiskTable {
    pub fn new(factors: HashMap<Chain, f64>, unknown: f64) -> Self {
        Self {
            factors,
            unknown: unknown.max(1.0),
        }
    }

    pub fn from_config(config: &AggregatorConfig) -> Self {
        let factors = config
            .chain_risk
            .iter()
            .map(|(name, factor)| (Chain::parse(name), *factor))
            .collect();
        Self::new(factors, config.unknown_chain_factor)
    }

    /// Factor for a chain, never below 1
    pub fn factor(&self, chain: &Chain) -> f64 {
        self.factors
            .get(chain)
            .copied()
            .filter(|f| f.is_finite())
            .unwrap_or(self.unknown)
            .max(1.0)
    }
}

/// Whether any segment of a pool symbol ("WSTETH-WETH") is a known LSD
pub fn is_lsd_symbol(symbol: &str) -> bool {
    symbol
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|segment| LSD_SEGMENTS.contains(segment))
}

pub fn augment(
    record: PoolRecord,
    volatility: f64,
    chain_risk: &ChainRiskTable,
    home_chain: &Chain,
) -> AugmentedPool {
    let mut record = record;
    record.is_lsd = record.is_lsd || is_lsd_symbol(&record.symbol);

    let historical_volatility = volatility.max(0.0);
    AugmentedPool {
        bridging_needed: &record.chain != home_chain,
        chain_factor: chain_risk.factor(&record.chain),
        apy_vol_ratio: record.apy / historical_volatility.max(VOL_EPSILON),
        historical_volatility,
        record,
    }
}
