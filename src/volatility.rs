//! Historical APY volatility
//!
//! Volatility is the sample standard deviation of fractional APY changes
//! between consecutive observations. Series live in a bounded per-pool
//! window that survives across runs.

use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::trace;

use crate::config::{AggregatorConfig, VolatilityConfig};
use crate::types::PoolKey;

/// Estimate volatility from a series, oldest first.
///
/// Returns exactly `fallback_vol` when the series has fewer than
/// `min_observations` points or fewer than two usable changes.
pub fn estimate(series: &[f64], min_observations: usize, fallback_vol: f64) -> f64 {
    if series.len() < min_observations {
        return fallback_vol;
    }

    let changes: Vec<f64> = series
        .windows(2)
        .filter(|pair| pair[0] > 0.0 && pair[0].is_finite() && pair[1].is_finite())
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .collect();

    if changes.len() < 2 {
        return fallback_vol;
    }

    let n = changes.len() as f64;
    let mean = changes.iter().sum::<f64>() / n;
    let variance = changes.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

/// Owns the per-pool observation windows
pub struct VolatilityEstimator {
    series: DashMap<PoolKey, VecDeque<f64>>,
    window_len: usize,
    min_observations: usize,
    fallback_vol: f64,
}

impl VolatilityEstimator {
    pub fn new(window_len: usize, min_observations: usize, fallback_vol: f64) -> Self {
        Self {
            series: DashMap::new(),
            window_len: window_len.max(2),
            min_observations,
            fallback_vol,
        }
    }

    pub fn from_config(volatility: &VolatilityConfig, aggregator: &AggregatorConfig) -> Self {
        Self::new(
            volatility.window_len,
            volatility.min_observations,
            aggregator.fallback_vol,
        )
    }

    pub fn fallback_vol(&self) -> f64 {
        self.fallback_vol
    }

    /// Whether a pool has no history yet and could use a seed
    pub fn is_empty_for(&self, key: &PoolKey) -> bool {
        self.series.get(key).map_or(true, |s| s.is_empty())
    }

    pub fn observations(&self, key: &PoolKey) -> usize {
        self.series.get(key).map_or(0, |s| s.len())
    }

    /// Volatility the pool would have after recording `current_apy`,
    /// without recording it
    pub fn projected(&self, key: &PoolKey, current_apy: f64, seed: Option<&[f64]>) -> f64 {
        let mut series = self
            .series
            .get(key)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        self.push_observation(&mut series, current_apy, seed);
        estimate(series.make_contiguous(), self.min_observations, self.fallback_vol)
    }

    /// Record this run's observation for a pool and return its volatility.
    ///
    /// `seed` is only applied when the pool has no history. Call once per
    /// pool per published run.
    pub fn update(&self, key: &PoolKey, current_apy: f64, seed: Option<&[f64]>) -> f64 {
        let mut entry = self.series.entry(key.clone()).or_default();
        let series = entry.value_mut();
        self.push_observation(series, current_apy, seed);

        let vol = estimate(series.make_contiguous(), self.min_observations, self.fallback_vol);
        trace!(pool = %key, observations = series.len(), vol, "Volatility updated");
        vol
    }

    fn push_observation(&self, series: &mut VecDeque<f64>, current_apy: f64, seed: Option<&[f64]>) {
        if series.is_empty() {
            if let Some(seed) = seed {
                series.extend(seed.iter().copied().filter(|v| v.is_finite()));
            }
        }
        if current_apy.is_finite() {
            series.push_back(current_apy);
        }
        while series.len() > self.window_len {
            series.pop_front();
        }
    }

    /// Drop series for pools no longer in the universe
    pub fn retain_keys<F>(&self, mut keep: F)
    where
        F: FnMut(&PoolKey) -> bool,
    {
        self.series.retain(|k, _| keep(k));
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}
