//! Database handle shared by the engine and the HTTP handlers

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("database handle is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// A live database connection.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Close the connection. Waits for checked-out connections to be returned.
    async fn close(&self) -> Result<(), DatabaseError>;

    fn is_closed(&self) -> bool;
}

/// Establishes the server's database connection.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Database>, DatabaseError>;
}

pub struct PgDatabase {
    pool: PgPool,
}

#[async_trait]
impl Database for PgDatabase {
    async fn ping(&self) -> Result<(), DatabaseError> {
        if self.pool.is_closed() {
            return Err(DatabaseError::Closed);
        }
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        self.pool.close().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Connects eagerly to Postgres: the first connection is opened before
/// `connect` returns, so bad credentials or an unreachable host fail here.
pub struct PgConnector;

#[async_trait]
impl DatabaseConnector for PgConnector {
    async fn connect(
        &self,
        url: &str,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Database>, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(options.connect_timeout)
            .connect(url)
            .await?;
        Ok(Arc::new(PgDatabase { pool }))
    }
}
