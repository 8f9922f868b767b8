//! Order vocabulary shared by the engine, the WAL payloads and the API

use crate::ids::{AccountId, MarketId, OrderId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Order side (buyer or seller)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Buy order (bid)
    BUY,
    /// Sell order (ask)
    SELL,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrderError {
    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),
}

/// An order as submitted by a client, before the engine assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub account_id: AccountId,
    pub market: MarketId,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

impl NewOrder {
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.price <= Decimal::ZERO {
            return Err(OrderError::InvalidPrice(self.price.to_string()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::InvalidQuantity(self.quantity.to_string()));
        }
        Ok(())
    }
}

/// An accepted order waiting in the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestingOrder {
    pub order_id: OrderId,
    pub account_id: AccountId,
    pub market: MarketId,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Unix nanoseconds at which the engine accepted the order
    pub accepted_at: i64,
}

impl RestingOrder {
    pub fn from_new(order_id: OrderId, order: NewOrder, accepted_at: i64) -> Self {
        Self {
            order_id,
            account_id: order.account_id,
            market: order.market,
            side: order.side,
            price: order.price,
            quantity: order.quantity,
            accepted_at,
        }
    }
}
