//! CLI command implementations

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::output::{JsonFileSink, OutputSink, StdoutSink};
use crate::risk::{RiskVetter, TokenCandidate, TokenDiscovery};
use crate::sources::{RetryPolicy, SourceFetcher};
use crate::throttle::Throttler;
use crate::types::Chain;

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

/// Run aggregation once, or repeatedly every `interval_secs`
pub async fn run(config: &Config, interval_secs: Option<u64>, stdout: bool) -> Result<()> {
    let sink: Arc<dyn OutputSink> = if stdout {
        Arc::new(StdoutSink)
    } else {
        Arc::new(JsonFileSink::new(&config.aggregator.output_path))
    };
    let orchestrator = Orchestrator::from_config(Arc::new(config.clone()), sink)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let Some(interval_secs) = interval_secs else {
        let report = orchestrator.run(&cancel).await?;
        print_summary(&report);
        return Ok(());
    };

    info!("Running every {}s, Ctrl-C to stop", interval_secs);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match orchestrator.run(&cancel).await {
            Ok(report) => print_summary(&report),
            // a failed run publishes nothing; the next tick tries again
            Err(e) if !cancel.is_cancelled() => error!("Run failed: {}", e),
            Err(_) => break,
        }
    }
    info!("Stopped");
    Ok(())
}

fn print_summary(report: &RunReport) {
    eprintln!("\n=== RUN {} ===", report.run_id);
    eprintln!(
        "Sources OK: {}  Failed: {}",
        report.sources_ok.join(", "),
        report.sources_failed.len()
    );
    for failure in &report.sources_failed {
        eprintln!(
            "  {} ({} attempts): {}",
            failure.source, failure.attempts, failure.cause
        );
    }
    eprintln!(
        "Fetched {} / merged {} / gated {} / filtered {} / published {}",
        report.counts.fetched,
        report.counts.merged,
        report.counts.gated,
        report.counts.filtered,
        report.counts.published
    );
    for (i, pool) in report.pools.iter().take(10).enumerate() {
        eprintln!(
            "{:>3}. {:<12} {:<10} apy {:>7.2}%  tvl ${:>15.0}  score {:.3}",
            i + 1,
            pool.symbol,
            pool.chain,
            pool.apy,
            pool.tvl,
            pool.score
        );
    }
}

/// Vet a single token and print the verdict as JSON
pub async fn vet(config: &Config, address: &str, chain: &str, no_cache: bool) -> Result<()> {
    let token = TokenCandidate::new(address, Chain::parse(chain), "cli")?;
    let throttle = Arc::new(Throttler::from_config(&config.throttle));
    let timeout = Duration::from_secs(config.aggregator.fetch_timeout_secs);
    let vetter = RiskVetter::from_config(&config.risk, throttle, timeout)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let verdict = if no_cache {
        vetter.vet_uncached(&token, &cancel).await
    } else {
        vetter.vet(&token, &cancel).await
    };

    println!("{}", serde_json::to_string_pretty(&verdict)?);
    if verdict.admitted {
        info!("{} on {} admitted", token.address, token.chain);
    } else {
        warn!("{} on {} rejected: {}", token.address, token.chain, verdict.reason);
    }
    Ok(())
}

/// Resolve a symbol or name to a token address, optionally vetting it
pub async fn discover(config: &Config, query: &str, chain: &str, vet: bool) -> Result<()> {
    let chain = Chain::parse(chain);
    let throttle = Arc::new(Throttler::from_config(&config.throttle));
    let timeout = Duration::from_secs(config.aggregator.fetch_timeout_secs);
    let fetcher = SourceFetcher::new(throttle.clone(), RetryPolicy::from(&config.aggregator));
    let discovery = TokenDiscovery::new(&config.risk, fetcher, timeout)?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let candidate = discovery
        .discover(query, &chain, &cancel)
        .await
        .with_context(|| format!("discovery of {} failed", query))?;

    let Some(candidate) = candidate else {
        println!("No token found for {} on {}", query, chain);
        return Ok(());
    };
    println!("{} on {} => {}", query, chain, candidate.address);

    if vet {
        let vetter = RiskVetter::from_config(&config.risk, throttle, timeout)?;
        let verdict = vetter.vet(&candidate, &cancel).await;
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    }
    Ok(())
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}
