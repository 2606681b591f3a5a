//! Composite scoring and ordering

use std::cmp::Ordering;

use crate::config::AggregatorWeights;
use crate::types::{AugmentedPool, RankedPool};

/// alpha*apy - beta*vol + gamma*ln(1+tvl) - delta*chain_factor
/// - bridging_penalty*[bridging] - lsd_bridging_multiplier_penalty*[lsd and bridging]
pub fn score(pool: &AugmentedPool, weights: &AggregatorWeights) -> f64 {
    let rec = &pool.record;
    let bridging = if pool.bridging_needed { 1.0 } else { 0.0 };
    let lsd_bridging = if pool.bridging_needed && rec.is_lsd { 1.0 } else { 0.0 };

    weights.alpha * rec.apy - weights.beta * pool.historical_volatility
        + weights.gamma * rec.tvl_usd.max(0.0).ln_1p()
        - weights.delta * pool.chain_factor
        - weights.bridging_penalty * bridging
        - weights.lsd_bridging_multiplier_penalty * lsd_bridging
}

fn compare(a: &RankedPool, b: &RankedPool) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.pool.record.tvl_usd.total_cmp(&a.pool.record.tvl_usd))
        .then_with(|| a.pool.record.identifier.cmp(&b.pool.record.identifier))
        .then_with(|| a.pool.record.chain.cmp(&b.pool.record.chain))
}

/// Score and sort descending. `max_pools == 0` keeps everything.
pub fn rank(pools: Vec<AugmentedPool>, weights: &AggregatorWeights, max_pools: usize) -> Vec<RankedPool> {
    let mut ranked: Vec<RankedPool> = pools
        .into_iter()
        .map(|pool| RankedPool {
            score: score(&pool, weights),
            pool,
        })
        .collect();

    ranked.sort_by(compare);
    if max_pools > 0 {
        ranked.truncate(max_pools);
    }
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, PoolRecord};

    fn pool(id: &str, chain: Chain, apy: f64, tvl: f64) -> AugmentedPool {
        AugmentedPool {
            bridging_needed: chain != Chain::Ethereum,
            record: PoolRecord::new(id, chain, "TKN", apy, tvl),
            historical_volatility: 0.05,
            chain_factor: 1.0,
            apy_vol_ratio: apy / 0.05,
        }
    }

    fn ids(ranked: &[RankedPool]) -> Vec<String> {
        ranked.iter().map(|r| r.pool.record.identifier.clone()).collect()
    }

    #[test]
    fn test_score_formula() {
        let w = AggregatorWeights::default();
        let p = pool("a", Chain::Ethereum, 5.0, 2_000_000.0);
        let expected = 5.0 - 2.0 * 0.05 + 2.5 * (2_000_001f64).ln() - 1.0;
        assert!((score(&p, &w) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_lsd_bridging_penalty_stacks() {
        let w = AggregatorWeights::default();
        let plain = pool("x", Chain::Arbitrum, 5.0, 1e6);
        let mut lsd = plain.clone();
        lsd.record.is_lsd = true;
        assert!((score(&plain, &w) - score(&lsd, &w) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_higher_tvl_outranks_modest_apy_edge() {
        let ranked = rank(
            vec![
                pool("C", Chain::Ethereum, 8.0, 500_000.0),
                pool("A", Chain::Ethereum, 5.0, 2_000_000.0),
            ],
            &AggregatorWeights::default(),
            0,
        );
        assert_eq!(ids(&ranked), vec!["A", "C"]);
    }

    #[test]
    fn test_order_independent_of_input() {
        let w = AggregatorWeights::default();
        let mut pools = vec![
            pool("a", Chain::Ethereum, 5.0, 1e6),
            pool("b", Chain::Ethereum, 5.0, 1e6),
            pool("b", Chain::Base, 5.0, 1e6),
            pool("c", Chain::Polygon, 9.0, 3e5),
            pool("d", Chain::Ethereum, 2.0, 5e7),
        ];
        let expected = rank(pools.clone(), &w, 0);

        for rotation in 1..pools.len() {
            pools.rotate_left(1);
            let mut reversed = pools.clone();
            reversed.reverse();
            assert_eq!(rank(pools.clone(), &w, 0), expected, "rotation {}", rotation);
            assert_eq!(rank(reversed, &w, 0), expected);
        }
    }

    #[test]
    fn test_ties_break_on_tvl_then_identifier() {
        let w = AggregatorWeights {
            alpha: 0.0,
            beta: 0.0,
            gamma: 0.0,
            delta: 0.0,
            bridging_penalty: 0.0,
            lsd_bridging_multiplier_penalty: 0.0,
        };
        let ranked = rank(
            vec![
                pool("b", Chain::Ethereum, 1.0, 10.0),
                pool("a", Chain::Ethereum, 1.0, 10.0),
                pool("z", Chain::Ethereum, 1.0, 20.0),
            ],
            &w,
            0,
        );
        assert_eq!(ids(&ranked), vec!["z", "a", "b"]);
    }

    #[test]
    fn test_truncates_to_max_pools() {
        let pools = (0..10)
            .map(|i| pool(&format!("p{}", i), Chain::Ethereum, i as f64, 1e6))
            .collect();
        let ranked = rank(pools, &AggregatorWeights::default(), 3);
        assert_eq!(ids(&ranked), vec!["p9", "p8", "p7"]);
    }
}
