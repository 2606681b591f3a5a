//! Upstream pool data sources

pub mod defillama;
pub mod fetcher;
pub mod history;
pub mod lido;

pub use defillama::DefiLlamaSource;
pub use fetcher::{FetchError, RetryPolicy, SourceFetcher};
pub use history::{DefiLlamaHistorySource, HistorySource};
pub use lido::LidoSubgraphSource;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::{PoolRecord, SourceKind};

/// A source of raw pool listings
#[async_trait]
pub trait PoolSource: Send + Sync {
    /// Name used in logs, reports and merge tie-breaks
    fn name(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Tokens charged against the throttle per request
    fn token_cost(&self) -> u32;

    /// One attempt at fetching the listing. Retries are the fetcher's job.
    async fn fetch(&self) -> Result<Vec<PoolRecord>>;
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("yield-scout/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Send a request and return the body of a successful response
pub(crate) async fn send_for_body(source: &str, request: reqwest::RequestBuilder) -> Result<String> {
    let response = request
        .send()
        .await
        .map_err(|e| Error::from_reqwest(source, e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::from_reqwest(source, e))?;

    if !status.is_success() {
        return Err(Error::from_status(source, status, &body));
    }
    Ok(body)
}

/// Numbers arrive as JSON numbers or numeric strings depending on the API
pub(crate) fn as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_f64_accepts_strings() {
        assert_eq!(as_f64(&json!(1.5)), Some(1.5));
        assert_eq!(as_f64(&json!("2.25")), Some(2.25));
        assert_eq!(as_f64(&json!("n/a")), None);
        assert_eq!(as_f64(&json!(null)), None);
    }
}
