//! Multi-chain yield pool aggregator
//!
//! Fetches pool listings from several sources under a shared rate limiter,
//! merges and enriches them, filters and ranks the result. A separate risk
//! pipeline vets tokens on liquidity, volume and holder distribution.

pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod risk;
pub mod sources;
pub mod throttle;
pub mod types;
pub mod volatility;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, RunReport, RunState};
