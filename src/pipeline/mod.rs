//! Pure aggregation stages: merge, augment, filter, rank

pub mod augment;
pub mod filter;
pub mod merge;
pub mod rank;

pub use augment::{augment, is_lsd_symbol, ChainRiskTable};
pub use filter::{filter, FilterOutcome, FilterReason, FilterThresholds};
pub use merge::{merge, MergePolicy};
pub use rank::{rank, score};
