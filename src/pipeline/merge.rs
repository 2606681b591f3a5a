//! Cross-source deduplication by `(identifier, chain)`

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use crate::types::{PoolKey, PoolRecord, SourceKind};

/// Precedence when several sources report the same pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Most complete record wins, primary source breaks ties
    #[default]
    CompletenessThenPrimary,
    /// Primary source wins, completeness breaks ties
    PrimaryFirst,
    /// LSD source wins, completeness breaks ties
    LsdFirst,
}

impl MergePolicy {
    /// Ordering where `Less` means `a` is preferred over `b`
    fn compare(self, a: &PoolRecord, b: &PoolRecord) -> Ordering {
        let by_completeness = b.completeness().cmp(&a.completeness());
        let by_kind = match self {
            MergePolicy::LsdFirst => kind_rank(a.source_kind, SourceKind::Lsd)
                .cmp(&kind_rank(b.source_kind, SourceKind::Lsd)),
            _ => kind_rank(a.source_kind, SourceKind::Primary)
                .cmp(&kind_rank(b.source_kind, SourceKind::Primary)),
        };

        let preferred = match self {
            MergePolicy::CompletenessThenPrimary => by_completeness.then(by_kind),
            MergePolicy::PrimaryFirst | MergePolicy::LsdFirst => by_kind.then(by_completeness),
        };
        preferred.then_with(|| total_order(a, b))
    }
}

fn kind_rank(kind: SourceKind, favoured: SourceKind) -> u8 {
    u8::from(kind != favoured)
}

/// Fixed order so the winner never depends on arrival order
fn total_order(a: &PoolRecord, b: &PoolRecord) -> Ordering {
    tvl_rank(b)
        .total_cmp(&tvl_rank(a))
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| b.apy.total_cmp(&a.apy))
        .then_with(|| a.symbol.cmp(&b.symbol))
        .then_with(|| format!("{:?}", a.extra).cmp(&format!("{:?}", b.extra)))
}

fn tvl_rank(record: &PoolRecord) -> f64 {
    if record.has_valid_tvl() {
        record.tvl_usd
    } else {
        f64::NEG_INFINITY
    }
}

/// Collapse records sharing a key into one.
///
/// The winner keeps its own fields. Extra keys it lacks are filled from the
/// other records in preference order, and `is_lsd` is set if any record has it.
/// Output is sorted by key.
pub fn merge(records: Vec<PoolRecord>, policy: MergePolicy) -> Vec<PoolRecord> {
    let input = records.len();
    let mut groups: BTreeMap<PoolKey, Vec<PoolRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key()).or_default().push(record);
    }

    let merged: Vec<PoolRecord> = groups
        .into_values()
        .filter_map(|mut group| {
            group.sort_by(|a, b| policy.compare(a, b));
            let mut iter = group.into_iter();
            let mut winner = iter.next()?;
            for other in iter {
                winner.is_lsd |= other.is_lsd;
                for (k, v) in other.extra {
                    let missing = winner.extra.get(&k).map_or(true, |existing| existing.is_empty());
                    if missing && !v.is_empty() {
                        winner.extra.insert(k, v);
                    }
                }
                if winner.underlying_tokens.is_empty() {
                    winner.underlying_tokens = other.underlying_tokens;
                }
            }
            Some(winner)
        })
        .collect();

    debug!(input, merged = merged.len(), "Merged pool records");
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, ExtraValue};

    fn primary(id: &str, tvl: f64) -> PoolRecord {
        let mut r = PoolRecord::new(id, Chain::Ethereum, "STETH", 3.0, tvl);
        r.source = "defillama".into();
        r
    }

    fn lsd(id: &str, tvl: f64) -> PoolRecord {
        let mut r = PoolRecord::new(id, Chain::Ethereum, "STETH", 3.4, tvl);
        r.source = "lido-subgraph".into();
        r.source_kind = SourceKind::Lsd;
        r.is_lsd = true;
        r
    }

    #[test]
    fn test_more_complete_record_wins_regardless_of_order() {
        let sparse = primary("p", 1_000.0);
        let mut rich = primary("p", 900.0);
        rich.source = "other".into();
        rich.extra.insert("project".into(), ExtraValue::Str("aave".into()));

        let a = merge(vec![sparse.clone(), rich.clone()], MergePolicy::default());
        let b = merge(vec![rich.clone(), sparse], MergePolicy::default());

        assert_eq!(a.len(), 1);
        assert_eq!(a, b);
        assert_eq!(a[0].tvl_usd, 900.0);
    }

    #[test]
    fn test_equal_completeness_prefers_primary() {
        let merged = merge(vec![lsd("s", 5.0), primary("s", 1.0)], MergePolicy::default());
        assert_eq!(merged[0].source, "defillama");
        // flag survives from the lsd record
        assert!(merged[0].is_lsd);
    }

    #[test]
    fn test_lsd_first_policy() {
        let mut p = primary("s", 1.0);
        p.extra.insert("project".into(), ExtraValue::Str("lido".into()));
        let merged = merge(vec![p, lsd("s", 5.0)], MergePolicy::LsdFirst);
        assert_eq!(merged[0].source, "lido-subgraph");
        assert_eq!(merged[0].apy, 3.4);
        // extras are backfilled from the losing record
        assert_eq!(
            merged[0].extra.get("project"),
            Some(&ExtraValue::Str("lido".into()))
        );
    }

    #[test]
    fn test_invalid_tvl_loses_completeness() {
        let good = primary("p", 10.0);
        let mut bad = primary("p", f64::NAN);
        bad.source = "aaa".into();
        let merged = merge(vec![bad, good], MergePolicy::default());
        assert_eq!(merged[0].tvl_usd, 10.0);
    }

    #[test]
    fn test_distinct_chains_are_distinct_pools() {
        let eth = primary("same-id", 1.0);
        let mut arb = primary("same-id", 1.0);
        arb.chain = Chain::Arbitrum;
        assert_eq!(merge(vec![eth, arb], MergePolicy::default()).len(), 2);
    }

    #[test]
    fn test_policy_deserializes_snake_case() {
        let p: MergePolicy = serde_json::from_str("\"primary_first\"").unwrap();
        assert_eq!(p, MergePolicy::PrimaryFirst);
    }
}
