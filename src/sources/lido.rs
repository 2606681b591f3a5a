//! Lido subgraph client for liquid staking data

use async_trait::async_trait;
use std::time::Duration;

use super::{as_f64, http_client, send_for_body, PoolSource};
use crate::config::SourcesConfig;
use crate::error::{Error, Result};
use crate::types::{Chain, ExtraValue, PoolRecord, SourceKind};

const SOURCE_NAME: &str = "lido-subgraph";

const TOTALS_QUERY: &str = "{ totals(first: 1) { tvl apr } }";

/// Produces a single stETH record from the Lido subgraph totals
pub struct LidoSubgraphSource {
    client: reqwest::Client,
    url: String,
    pool_identifier: String,
    token_cost: u32,
}

impl LidoSubgraphSource {
    pub fn new(config: &SourcesConfig, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: config.lido_subgraph_url.clone(),
            pool_identifier: config.lsd_pool_identifier.clone(),
            token_cost: config.lsd_token_cost,
        })
    }
}

#[async_trait]
impl PoolSource for LidoSubgraphSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Lsd
    }

    fn token_cost(&self) -> u32 {
        self.token_cost
    }

    async fn fetch(&self) -> Result<Vec<PoolRecord>> {
        let request = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "query": TOTALS_QUERY }));
        let body = send_for_body(SOURCE_NAME, request).await?;
        parse_totals(&body, &self.pool_identifier)
    }
}

/// Turn a `totals` response into the stETH record. `apr` is a fraction.
pub fn parse_totals(body: &str, pool_identifier: &str) -> Result<Vec<PoolRecord>> {
    let malformed = |reason: String| Error::MalformedPayload {
        source_name: SOURCE_NAME.to_string(),
        reason,
    };

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;

    if let Some(errors) = value.get("errors").filter(|e| !e.is_null()) {
        return Err(malformed(format!("graphql errors: {}", errors)));
    }

    let totals = value
        .pointer("/data/totals/0")
        .ok_or_else(|| malformed("missing data.totals[0]".into()))?;
    let apr = totals
        .get("apr")
        .and_then(as_f64)
        .ok_or_else(|| malformed("missing apr".into()))?;
    let tvl = totals.get("tvl").and_then(as_f64).unwrap_or(0.0);

    let mut record = PoolRecord::new(pool_identifier, Chain::Ethereum, "steth", apr * 100.0, tvl);
    record.is_lsd = true;
    record.extra.insert("project".into(), ExtraValue::Str("lido".into()));
    record.extra.insert("aprFraction".into(), ExtraValue::Num(apr));

    Ok(vec![record])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_totals() {
        let body = r#"{"data": {"totals": [{"tvl": "9200000000", "apr": "0.034"}]}}"#;
        let records = parse_totals(body, "steth-pool").unwrap();

        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.identifier, "steth-pool");
        assert_eq!(rec.chain, Chain::Ethereum);
        assert!(rec.is_lsd);
        assert!((rec.apy - 3.4).abs() < 1e-9);
        assert_eq!(rec.tvl_usd, 9_200_000_000.0);
    }

    #[test]
    fn test_graphql_errors_are_malformed() {
        let body = r#"{"errors": [{"message": "indexer unavailable"}]}"#;
        assert!(matches!(
            parse_totals(body, "x"),
            Err(Error::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_empty_totals() {
        let body = r#"{"data": {"totals": []}}"#;
        assert!(parse_totals(body, "x").is_err());
    }
}
