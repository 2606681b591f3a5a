//! Threshold filter for augmented pools

use tracing::trace;

use crate::config::AggregatorConfig;
use crate::types::AugmentedPool;

/// Reason a pool was rejected, with the observed value
#[derive(Debug, Clone, PartialEq)]
pub enum FilterReason {
    ApyBelowMinimum(f64),
    TvlBelowMinimum(f64),
    ChainFactorAboveMaximum(f64),
}

impl std::fmt::Display for FilterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterReason::ApyBelowMinimum(apy) => write!(f, "apy {}% below minimum", apy),
            FilterReason::TvlBelowMinimum(tvl) => write!(f, "tvl ${} below minimum", tvl),
            FilterReason::ChainFactorAboveMaximum(cf) => {
                write!(f, "chain factor {} above maximum", cf)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Pass,
    Rejected(FilterReason),
}

impl FilterOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, FilterOutcome::Pass)
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, FilterOutcome::Rejected(_))
    }
}

#[derive(Debug, Clone)]
pub struct FilterThresholds {
    pub min_apy: f64,
    pub min_tvl: f64,
    pub max_chain_factor: f64,
}

impl From<&AggregatorConfig> for FilterThresholds {
    fn from(config: &AggregatorConfig) -> Self {
        Self {
            min_apy: config.min_apy,
            min_tvl: config.min_tvl,
            max_chain_factor: config.max_chain_factor,
        }
    }
}

/// Pass iff apy >= min_apy, tvl >= min_tvl and chain_factor <= max_chain_factor.
/// NaN values never pass.
pub fn filter(pool: &AugmentedPool, thresholds: &FilterThresholds) -> FilterOutcome {
    let rec = &pool.record;
    let outcome = if !(rec.apy >= thresholds.min_apy) {
        FilterOutcome::Rejected(FilterReason::ApyBelowMinimum(rec.apy))
    } else if !(rec.tvl_usd >= thresholds.min_tvl) {
        FilterOutcome::Rejected(FilterReason::TvlBelowMinimum(rec.tvl_usd))
    } else if !(pool.chain_factor <= thresholds.max_chain_factor) {
        FilterOutcome::Rejected(FilterReason::ChainFactorAboveMaximum(pool.chain_factor))
    } else {
        FilterOutcome::Pass
    };

    if let FilterOutcome::Rejected(reason) = &outcome {
        trace!(pool = %rec.key(), %reason, "Pool filtered");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, PoolRecord};

    fn pool(apy: f64, tvl: f64, chain_factor: f64) -> AugmentedPool {
        AugmentedPool {
            record: PoolRecord::new("p", Chain::Ethereum, "USDC", apy, tvl),
            historical_volatility: 0.05,
            bridging_needed: false,
            chain_factor,
            apy_vol_ratio: apy / 0.05,
        }
    }

    fn thresholds() -> FilterThresholds {
        FilterThresholds {
            min_apy: 4.0,
            min_tvl: 100_000.0,
            max_chain_factor: 2.0,
        }
    }

    #[test]
    fn test_exact_thresholds_pass() {
        assert!(filter(&pool(4.0, 100_000.0, 2.0), &thresholds()).is_pass());
    }

    #[test]
    fn test_just_below_thresholds_fail() {
        let t = thresholds();
        let eps = 1e-9;
        assert_eq!(
            filter(&pool(4.0 - eps, 100_000.0, 1.0), &t),
            FilterOutcome::Rejected(FilterReason::ApyBelowMinimum(4.0 - eps))
        );
        assert!(matches!(
            filter(&pool(4.0, 100_000.0 - eps * 1e4, 1.0), &t),
            FilterOutcome::Rejected(FilterReason::TvlBelowMinimum(_))
        ));
        assert!(matches!(
            filter(&pool(4.0, 100_000.0, 2.0 + eps), &t),
            FilterOutcome::Rejected(FilterReason::ChainFactorAboveMaximum(_))
        ));
    }

    #[test]
    fn test_high_apy_does_not_rescue_low_tvl() {
        let outcome = filter(&pool(50.0, 10_000.0, 1.0), &thresholds());
        assert!(outcome.is_rejected());
    }

    #[test]
    fn test_matches_predicate_over_grid() {
        let t = thresholds();
        for apy in [0.0, 3.999, 4.0, 4.001, 50.0] {
            for tvl in [0.0, 99_999.0, 100_000.0, 2e6] {
                for cf in [1.0, 2.0, 2.001, 5.0] {
                    let expected = apy >= t.min_apy && tvl >= t.min_tvl && cf <= t.max_chain_factor;
                    assert_eq!(filter(&pool(apy, tvl, cf), &t).is_pass(), expected);
                }
            }
        }
    }

    #[test]
    fn test_nan_never_passes() {
        assert!(filter(&pool(f64::NAN, 1e9, 1.0), &thresholds()).is_rejected());
        assert!(filter(&pool(10.0, f64::NAN, 1.0), &thresholds()).is_rejected());
    }
}
