//! Unique identifier types for exchange entities
//!
//! Order and account IDs use UUID v7 so they sort by creation time, which
//! keeps WAL replay output in the same order the orders were accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("invalid identifier: {0}")]
    InvalidUuid(String),

    #[error("market must be in BASE/QUOTE format: {0}")]
    InvalidMarket(String),
}

/// Unique identifier for an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Create a new OrderId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| IdError::InvalidUuid(s.to_string()))
    }
}

/// Unique identifier for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Market identifier (trading pair)
///
/// Format: "BASE/QUOTE" (e.g., "BTC/USDT", "ETH/USDC"). Deserialization
/// rejects anything else, so a `MarketId` in hand is always well formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MarketId(String);

impl MarketId {
    /// Try to create a MarketId, returning an error if the format is invalid
    pub fn try_new(symbol: impl Into<String>) -> Result<Self, IdError> {
        let s = symbol.into();
        match s.split_once('/') {
            Some((base, quote)) if !base.is_empty() && !quote.is_empty() && !quote.contains('/') => {
                Ok(Self(s))
            }
            _ => Err(IdError::InvalidMarket(s)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into base and quote assets
    pub fn split(&self) -> (&str, &str) {
        self.0.split_once('/').unwrap_or((self.0.as_str(), ""))
    }
}

impl fmt::Display for MarketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for MarketId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_new(value)
    }
}

impl From<MarketId> for String {
    fn from(market: MarketId) -> Self {
        market.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_id_creation() {
        let id1 = OrderId::new();
        let id2 = OrderId::new();
        assert_ne!(id1, id2, "OrderIds should be unique");
    }

    #[test]
    fn test_order_id_parse() {
        let id = OrderId::new();
        let parsed: OrderId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<OrderId>().is_err());
    }

    #[test]
    fn test_market_id_try_new() {
        let market = MarketId::try_new("BTC/USDT").unwrap();
        assert_eq!(market.split(), ("BTC", "USDT"));
        assert!(MarketId::try_new("INVALID").is_err());
        assert!(MarketId::try_new("/USDT").is_err());
        assert!(MarketId::try_new("A/B/C").is_err());
    }

    #[test]
    fn test_market_id_deserialization_validates() {
        let market: MarketId = serde_json::from_str("\"ETH/USDC\"").unwrap();
        assert_eq!(market.as_str(), "ETH/USDC");
        assert_eq!(serde_json::to_string(&market).unwrap(), "\"ETH/USDC\"");

        let bad = serde_json::from_str::<MarketId>("\"ETHUSDC\"");
        assert!(bad.is_err());
    }
}
