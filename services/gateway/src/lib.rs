//! Exchange API server
//!
//! Wires the database, the order engine, the event hub and the HTTP surface
//! together and owns their lifecycle. See [`server::Server`].

pub mod config;
pub mod cors;
pub mod database;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod models;
pub mod router;
pub mod server;
pub mod state;

pub use config::Config;
pub use error::{ServerError, ShutdownError};
pub use server::{Collaborators, Lifecycle, ServeOutcome, Server};
