//! Types library for the exchange API
//!
//! Identifiers and order vocabulary shared by the WAL journal, the engine
//! and the HTTP gateway.
//!
//! # Modules
//! - `ids`: Unique identifiers (OrderId, AccountId, MarketId)
//! - `order`: Order side, new-order requests and resting orders

pub mod ids;
pub mod order;
