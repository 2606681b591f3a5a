//! Core domain types shared by the aggregation pipeline and the risk vetting pipeline

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Supported chains. Anything we do not recognise is carried as `Other`
/// so that its pools can still be scored with the unknown-chain factor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Chain {
    Ethereum,
    Arbitrum,
    Optimism,
    Polygon,
    Base,
    Gnosis,
    Avalanche,
    Bsc,
    Linea,
    Nova,
    Solana,
    Other(String),
}

impl Chain {
    /// Normalise a chain identifier from any source.
    ///
    /// Accepts display names ("Ethereum"), short names ("eth") and numeric
    /// EVM chain ids ("42161").
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim().to_lowercase();
        match s.as_str() {
            "ethereum" | "eth" | "mainnet" | "1" => Chain::Ethereum,
            "arbitrum" | "arbitrum one" | "42161" => Chain::Arbitrum,
            "optimism" | "op mainnet" | "10" => Chain::Optimism,
            "polygon" | "matic" | "137" => Chain::Polygon,
            "base" | "8453" => Chain::Base,
            "gnosis" | "xdai" | "100" => Chain::Gnosis,
            "avalanche" | "avax" | "43114" => Chain::Avalanche,
            "bsc" | "binance" | "bnb" | "56" => Chain::Bsc,
            "linea" | "59144" => Chain::Linea,
            "nova" | "arbitrum nova" | "42170" => Chain::Nova,
            "solana" | "sol" => Chain::Solana,
            _ => Chain::Other(s),
        }
    }

    /// Canonical lower-case slug
    pub fn slug(&self) -> &str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Polygon => "polygon",
            Chain::Base => "base",
            Chain::Gnosis => "gnosis",
            Chain::Avalanche => "avalanche",
            Chain::Bsc => "bsc",
            Chain::Linea => "linea",
            Chain::Nova => "nova",
            Chain::Solana => "solana",
            Chain::Other(s) => s.as_str(),
        }
    }

    /// Whether addresses on this chain are EVM (0x-prefixed hex)
    pub fn is_evm(&self) -> bool {
        !matches!(self, Chain::Solana | Chain::Other(_))
    }
}

impl From<String> for Chain {
    fn from(s: String) -> Self {
        Chain::parse(&s)
    }
}

impl From<Chain> for String {
    fn from(c: Chain) -> Self {
        c.slug().to_string()
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.slug())
    }
}

/// Scalar value carried in a pool's source-specific extra fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Num(f64),
    Str(String),
    Null,
}

impl ExtraValue {
    /// Convert a JSON value. Arrays and objects have no scalar form and are dropped.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(ExtraValue::Null),
            serde_json::Value::Bool(b) => Some(ExtraValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(ExtraValue::Num),
            serde_json::Value::String(s) => Some(ExtraValue::Str(s.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Null and empty strings carry no information
    pub fn is_empty(&self) -> bool {
        match self {
            ExtraValue::Null => true,
            ExtraValue::Str(s) => s.trim().is_empty(),
            ExtraValue::Num(n) => !n.is_finite(),
            ExtraValue::Bool(_) => false,
        }
    }
}

/// Where a record came from. Used as a merge tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Primary,
    Lsd,
}

/// Compound identity of a pool within one run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub identifier: String,
    pub chain: Chain,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identifier, self.chain)
    }
}

/// One yield opportunity as reported by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub identifier: String,
    pub chain: Chain,
    pub symbol: String,
    /// Percent, e.g. 5.0 = 5%
    pub apy: f64,
    pub tvl_usd: f64,
    pub is_lsd: bool,
    #[serde(default)]
    pub extra: BTreeMap<String, ExtraValue>,
    #[serde(default)]
    pub underlying_tokens: Vec<String>,
    pub source: String,
    pub source_kind: SourceKind,
}

impl PoolRecord {
    pub fn new(
        identifier: impl Into<String>,
        chain: Chain,
        symbol: impl Into<String>,
        apy: f64,
        tvl_usd: f64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            chain,
            symbol: symbol.into().to_lowercase(),
            apy,
            tvl_usd,
            is_lsd: false,
            extra: BTreeMap::new(),
            underlying_tokens: Vec::new(),
            source: String::new(),
            source_kind: SourceKind::Primary,
        }
    }

    pub fn key(&self) -> PoolKey {
        PoolKey {
            identifier: self.identifier.clone(),
            chain: self.chain.clone(),
        }
    }

    pub fn has_valid_tvl(&self) -> bool {
        self.tvl_usd.is_finite() && self.tvl_usd > 0.0
    }

    /// Completeness used by merge: non-empty extra fields plus one for a valid TVL
    pub fn completeness(&self) -> usize {
        let extras = self.extra.values().filter(|v| !v.is_empty()).count();
        extras + usize::from(self.has_valid_tvl())
    }
}

/// A merged record enriched with derived features
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedPool {
    pub record: PoolRecord,
    pub historical_volatility: f64,
    pub bridging_needed: bool,
    /// Risk multiplier, always >= 1
    pub chain_factor: f64,
    pub apy_vol_ratio: f64,
}

/// An augmented pool with its composite score attached
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPool {
    pub pool: AugmentedPool,
    pub score: f64,
}

/// Output artifact row, one per surviving pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolOutput {
    pub address: String,
    pub chain: Chain,
    pub symbol: String,
    pub apy: f64,
    pub tvl: f64,
    pub volatility: f64,
    pub bridging_needed: bool,
    pub chain_factor: f64,
    pub is_lsd: bool,
    pub score: f64,
    pub extra_data: BTreeMap<String, ExtraValue>,
}

impl From<&RankedPool> for PoolOutput {
    fn from(r: &RankedPool) -> Self {
        let rec = &r.pool.record;
        Self {
            address: rec.identifier.clone(),
            chain: rec.chain.clone(),
            symbol: rec.symbol.clone(),
            apy: rec.apy,
            tvl: rec.tvl_usd,
            volatility: r.pool.historical_volatility,
            bridging_needed: r.pool.bridging_needed,
            chain_factor: r.pool.chain_factor,
            is_lsd: rec.is_lsd,
            score: r.score,
            extra_data: rec.extra.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_normalisation() {
        assert_eq!(Chain::parse("Ethereum"), Chain::Ethereum);
        assert_eq!(Chain::parse("eth"), Chain::Ethereum);
        assert_eq!(Chain::parse("42161"), Chain::Arbitrum);
        assert_eq!(Chain::parse(" Polygon "), Chain::Polygon);
        assert_eq!(Chain::parse("Fantom"), Chain::Other("fantom".to_string()));
        assert_eq!(Chain::parse("Fantom").to_string(), "fantom");
    }

    #[test]
    fn test_chain_serde_roundtrip_uses_slug() {
        let json = serde_json::to_string(&Chain::Bsc).unwrap();
        assert_eq!(json, "\"bsc\"");
        let parsed: Chain = serde_json::from_str("\"BSC\"").unwrap();
        assert_eq!(parsed, Chain::Bsc);
    }

    #[test]
    fn test_completeness() {
        let mut rec = PoolRecord::new("p1", Chain::Ethereum, "USDC", 4.0, 1_000.0);
        assert_eq!(rec.completeness(), 1);

        rec.extra.insert("project".into(), ExtraValue::Str("aave-v3".into()));
        rec.extra.insert("poolMeta".into(), ExtraValue::Null);
        rec.extra.insert("note".into(), ExtraValue::Str("  ".into()));
        assert_eq!(rec.completeness(), 2);

        rec.tvl_usd = f64::NAN;
        assert_eq!(rec.completeness(), 1);
    }

    #[test]
    fn test_extra_value_from_json() {
        assert_eq!(
            ExtraValue::from_json(&serde_json::json!(1.5)),
            Some(ExtraValue::Num(1.5))
        );
        assert_eq!(ExtraValue::from_json(&serde_json::json!([1, 2])), None);
        assert_eq!(
            ExtraValue::from_json(&serde_json::json!(null)),
            Some(ExtraValue::Null)
        );
    }

    #[test]
    fn test_output_field_names() {
        let rec = PoolRecord::new("abc", Chain::Base, "WETH", 3.0, 10.0);
        let ranked = RankedPool {
            pool: AugmentedPool {
                record: rec,
                historical_volatility: 0.05,
                bridging_needed: true,
                chain_factor: 1.2,
                apy_vol_ratio: 60.0,
            },
            score: 1.0,
        };
        let value = serde_json::to_value(PoolOutput::from(&ranked)).unwrap();
        for field in [
            "address",
            "chain",
            "symbol",
            "apy",
            "tvl",
            "volatility",
            "bridging_needed",
            "chain_factor",
            "is_lsd",
            "score",
            "extra_data",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(value["symbol"], "weth");
    }
}
