//! Aggregation run state machine
//!
//! Idle -> Fetching -> Merging -> Augmenting -> Filtering -> Ranking -> Published | Failed
//!
//! Only one run may be active at a time. A run fails when no source
//! succeeds or when it is cancelled; in both cases nothing is published.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::output::OutputSink;
use crate::pipeline::{
    augment, filter, merge, rank, ChainRiskTable, FilterThresholds,
};
use crate::risk::{RiskVetter, TokenCandidate};
use crate::sources::{
    DefiLlamaHistorySource, DefiLlamaSource, HistorySource, LidoSubgraphSource, PoolSource,
    RetryPolicy, SourceFetcher,
};
use crate::throttle::Throttler;
use crate::types::{Chain, PoolKey, PoolOutput, PoolRecord};
use crate::volatility::VolatilityEstimator;

/// Concurrent history requests while seeding
const HISTORY_CONCURRENCY: usize = 4;

/// Hex addresses compare case-insensitively, base58 ones do not
fn gate_key(token: &str, chain: &Chain) -> (String, Chain) {
    let token = token.trim();
    let address = if chain.is_evm() || token.starts_with("0x") {
        token.to_lowercase()
    } else {
        token.to_string()
    };
    (address, chain.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Merging,
    Augmenting,
    Filtering,
    Ranking,
    Published,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Merging => "merging",
            RunState::Augmenting => "augmenting",
            RunState::Filtering => "filtering",
            RunState::Ranking => "ranking",
            RunState::Published => "published",
            RunState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub merged: usize,
    /// Pools dropped by the risk gate
    pub gated: usize,
    /// Pools dropped by the threshold filter
    pub filtered: usize,
    pub published: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub attempts: u32,
    pub cause: String,
}

/// Summary of a published run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_ok: Vec<String>,
    pub sources_failed: Vec<SourceFailure>,
    pub counts: RunCounts,
    pub pools: Vec<PoolOutput>,
}

impl RunReport {
    pub fn is_degraded(&self) -> bool {
        !self.sources_failed.is_empty()
    }
}

/// Clears the running flag however the run ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    sources: Vec<Arc<dyn PoolSource>>,
    history: Option<Arc<dyn HistorySource>>,
    vetter: Option<Arc<RiskVetter>>,
    fetcher: SourceFetcher,
    volatility: VolatilityEstimator,
    chain_risk: ChainRiskTable,
    home_chain: Chain,
    sink: Arc<dyn OutputSink>,
    state: Mutex<RunState>,
    running: AtomicBool,
}

impl Orchestrator {
    /// An orchestrator with no sources; add them with [`Orchestrator::with_source`]
    pub fn new(config: Arc<Config>, throttle: Arc<Throttler>, sink: Arc<dyn OutputSink>) -> Self {
        let fetcher = SourceFetcher::new(throttle, RetryPolicy::from(&config.aggregator));
        Self {
            volatility: VolatilityEstimator::from_config(&config.volatility, &config.aggregator),
            chain_risk: ChainRiskTable::from_config(&config.aggregator),
            home_chain: Chain::parse(&config.aggregator.home_chain),
            config,
            sources: Vec::new(),
            history: None,
            vetter: None,
            fetcher,
            sink,
            state: Mutex::new(RunState::Idle),
            running: AtomicBool::new(false),
        }
    }

    /// Wire up the HTTP sources and, if enabled, history seeding and the risk gate
    pub fn from_config(config: Arc<Config>, sink: Arc<dyn OutputSink>) -> Result<Self> {
        let throttle = Arc::new(Throttler::from_config(&config.throttle));
        let timeout = Duration::from_secs(config.aggregator.fetch_timeout_secs);

        let mut orchestrator = Self::new(config.clone(), throttle.clone(), sink)
            .with_source(Arc::new(DefiLlamaSource::new(&config.sources, timeout)?));

        if config.aggregator.lsd_merges {
            orchestrator = orchestrator
                .with_source(Arc::new(LidoSubgraphSource::new(&config.sources, timeout)?));
        }
        if config.volatility.seed_history {
            orchestrator = orchestrator
                .with_history(Arc::new(DefiLlamaHistorySource::new(&config.sources, timeout)?));
        }
        if config.risk.gate_pools {
            let vetter = RiskVetter::from_config(&config.risk, throttle, timeout)?;
            orchestrator = orchestrator.with_vetter(Arc::new(vetter));
        }
        Ok(orchestrator)
    }

    pub fn with_source(mut self, source: Arc<dyn PoolSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySource>) -> Self {
        self.history = Some(history);
        self
    }

    /// Gate merged pools on their underlying tokens' verdicts
    pub fn with_vetter(mut self, vetter: Arc<RiskVetter>) -> Self {
        self.vetter = Some(vetter);
        self
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        debug!(%state, "Run state");
    }

    pub fn volatility(&self) -> &VolatilityEstimator {
        &self.volatility
    }

    pub fn throttle(&self) -> &Arc<Throttler> {
        self.fetcher.throttle()
    }

    /// Execute one aggregation run and publish its ranked output
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::RunInProgress);
        }
        let _guard = RunGuard(&self.running);

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sources = self.sources.len(), "Aggregation run started");

        match self.execute(cancel).await {
            Ok((sources_ok, sources_failed, counts, pools)) => {
                self.enter(RunState::Published);
                let report = RunReport {
                    run_id,
                    started_at,
                    finished_at: Utc::now(),
                    sources_ok,
                    sources_failed,
                    counts,
                    pools,
                };
                if report.is_degraded() {
                    let excluded: Vec<&str> =
                        report.sources_failed.iter().map(|f| f.source.as_str()).collect();
                    warn!(%run_id, ?excluded, "Run published without some sources");
                }
                info!(%run_id, published = report.counts.published, "Aggregation run published");
                Ok(report)
            }
            Err(e) => {
                self.enter(RunState::Failed);
                error!(%run_id, error = %e, "Aggregation run failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Vec<String>, Vec<SourceFailure>, RunCounts, Vec<PoolOutput>)> {
        let agg = &self.config.aggregator;
        let mut counts = RunCounts::default();

        if !self.config.throttle.persist_across_runs {
            self.fetcher.throttle().reset();
        }

        // Fetching
        self.enter(RunState::Fetching);
        let results = join_all(
            self.sources
                .iter()
                .map(|source| self.fetcher.fetch_pools(source.as_ref(), cancel)),
        )
        .await;
        ensure_not_cancelled(cancel)?;

        let mut records: Vec<PoolRecord> = Vec::new();
        let mut sources_ok = Vec::new();
        let mut sources_failed = Vec::new();
        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(mut pools) => {
                    sources_ok.push(source.name().to_string());
                    records.append(&mut pools);
                }
                Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => sources_failed.push(SourceFailure {
                    source: e.source_name,
                    attempts: e.attempts,
                    cause: e.cause.to_string(),
                }),
            }
        }
        if sources_ok.is_empty() {
            return Err(Error::NoSourcesAvailable(
                sources_failed
                    .iter()
                    .map(|f| format!("{}: {}", f.source, f.cause))
                    .collect(),
            ));
        }
        counts.fetched = records.len();

        // Merging
        self.enter(RunState::Merging);
        let mut merged = merge(records, agg.merge_policy);
        counts.merged = merged.len();
        if let Some(vetter) = &self.vetter {
            let before = merged.len();
            merged = self.gate(vetter, merged, cancel).await;
            ensure_not_cancelled(cancel)?;
            counts.gated = before - merged.len();
        }

        // Augmenting
        self.enter(RunState::Augmenting);
        let seeds = self.seed_history(&merged, cancel).await;
        ensure_not_cancelled(cancel)?;
        let live: HashSet<PoolKey> = merged.iter().map(PoolRecord::key).collect();
        // observations are committed only once the run publishes
        let mut staged: Vec<(PoolKey, f64)> = Vec::with_capacity(merged.len());
        let augmented: Vec<_> = merged
            .into_iter()
            .map(|record| {
                let key = record.key();
                let vol = self.volatility.projected(
                    &key,
                    record.apy,
                    seeds.get(&key).map(Vec::as_slice),
                );
                staged.push((key, record.apy));
                augment(record, vol, &self.chain_risk, &self.home_chain)
            })
            .collect();

        // Filtering
        self.enter(RunState::Filtering);
        let thresholds = FilterThresholds::from(agg);
        let before = augmented.len();
        let survivors: Vec<_> = augmented
            .into_iter()
            .filter(|pool| filter(pool, &thresholds).is_pass())
            .collect();
        counts.filtered = before - survivors.len();

        // Ranking
        self.enter(RunState::Ranking);
        let ranked = rank(survivors, &agg.weights, agg.max_pools);
        let pools: Vec<PoolOutput> = ranked.iter().map(PoolOutput::from).collect();
        counts.published = pools.len();

        ensure_not_cancelled(cancel)?;
        self.sink.publish(&pools).await?;

        if sources_failed.is_empty() {
            self.volatility.retain_keys(|k| live.contains(k));
        }
        for (key, apy) in &staged {
            self.volatility
                .update(key, *apy, seeds.get(key).map(Vec::as_slice));
        }

        Ok((sources_ok, sources_failed, counts, pools))
    }

    /// Drop pools backed by a token that fails vetting
    async fn gate(
        &self,
        vetter: &RiskVetter,
        pools: Vec<PoolRecord>,
        cancel: &CancellationToken,
    ) -> Vec<PoolRecord> {
        let purged = vetter.cache().purge_expired();
        if purged > 0 {
            debug!(purged, "Expired verdicts purged");
        }

        let mut candidates: BTreeSet<(String, Chain)> = BTreeSet::new();
        for pool in &pools {
            for token in &pool.underlying_tokens {
                candidates.insert(gate_key(token, &pool.chain));
            }
        }

        // a token that cannot be vetted counts as rejected
        let mut rejected: HashSet<(String, Chain)> = HashSet::new();
        let mut valid: Vec<TokenCandidate> = Vec::with_capacity(candidates.len());
        for (address, chain) in candidates {
            match TokenCandidate::new(&address, chain.clone(), "pool-universe") {
                Ok(candidate) => valid.push(candidate),
                Err(e) => {
                    warn!(error = %e, "Underlying token cannot be vetted");
                    rejected.insert((address, chain));
                }
            }
        }

        let limit = self.config.risk.max_concurrent_vets.max(1);
        let verdicts: Vec<(TokenCandidate, bool)> = stream::iter(valid)
            .map(|candidate| async move {
                let admitted = vetter.vet(&candidate, cancel).await.admitted;
                (candidate, admitted)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        rejected.extend(
            verdicts
                .into_iter()
                .filter(|(_, admitted)| !admitted)
                .map(|(c, _)| (c.address, c.chain)),
        );
        if rejected.is_empty() {
            return pools;
        }

        info!(tokens = rejected.len(), "Risk gate rejected tokens");
        pools
            .into_iter()
            .filter(|pool| {
                !pool
                    .underlying_tokens
                    .iter()
                    .any(|t| rejected.contains(&gate_key(t, &pool.chain)))
            })
            .collect()
    }

    /// Fetch APY history for the largest pools that have none yet
    async fn seed_history(
        &self,
        pools: &[PoolRecord],
        cancel: &CancellationToken,
    ) -> HashMap<PoolKey, Vec<f64>> {
        let Some(history) = &self.history else {
            return HashMap::new();
        };

        let mut wanted: Vec<&PoolRecord> = pools
            .iter()
            .filter(|p| self.volatility.is_empty_for(&p.key()))
            .collect();
        wanted.sort_by(|a, b| {
            b.tvl_usd
                .total_cmp(&a.tvl_usd)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        wanted.truncate(self.config.volatility.history_seed_limit);

        let wanted: Vec<(PoolKey, String)> = wanted
            .into_iter()
            .map(|p| (p.key(), p.identifier.clone()))
            .collect();

        let fetched: Vec<(PoolKey, Option<Vec<f64>>)> = stream::iter(wanted)
            .map(|(key, identifier)| async move {
                let series = self
                    .fetcher
                    .call(history.name(), history.token_cost(), cancel, || {
                        history.apy_history(&identifier)
                    })
                    .await;
                match series {
                    Ok(series) => (key, Some(series)),
                    Err(e) => {
                        debug!(pool = %key, error = %e, "No history seed");
                        (key, None)
                    }
                }
            })
            .buffer_unordered(HISTORY_CONCURRENCY)
            .collect()
            .await;

        fetched
            .into_iter()
            .filter_map(|(key, series)| series.map(|s| (key, s)))
            .collect()
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
