use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::database::DatabaseError;
use crate::engine::EngineError;
use crate::server::Lifecycle;

/// Errors surfaced by the server lifecycle: construction, serving and teardown.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database connection failed: {0}")]
    Connection(#[source] DatabaseError),

    #[error("Cannot create WAL directory {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("WAL recovery failed: {0}")]
    Recovery(#[source] EngineError),

    #[error("Listener error: {0}")]
    Listen(#[source] io::Error),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error("Server is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: Lifecycle,
        actual: Lifecycle,
    },
}

/// The teardown steps, in the order `Server::shutdown` visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Listener,
    Engine,
    Hub,
    Database,
}

impl fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownStep::Listener => "listener",
            ShutdownStep::Engine => "engine",
            ShutdownStep::Hub => "hub",
            ShutdownStep::Database => "database",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The deadline elapsed before the step completed.
    Timeout,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub step: ShutdownStep,
    pub kind: FailureKind,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Timeout => write!(f, "{}: timed out", self.step),
            FailureKind::Failed(msg) => write!(f, "{}: {}", self.step, msg),
        }
    }
}

/// Every failure encountered during one teardown, in step order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct ShutdownError {
    pub failures: Vec<StepFailure>,
}

impl ShutdownError {
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn push(&mut self, step: ShutdownStep, kind: FailureKind) {
        self.failures.push(StepFailure { step, kind });
    }

    /// Whether any step ran out of time.
    pub fn timed_out(&self) -> bool {
        self.failures.iter().any(|f| f.kind == FailureKind::Timeout)
    }

    pub fn step(&self, step: ShutdownStep) -> Option<&StepFailure> {
        self.failures.iter().find(|f| f.step == step)
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shutdown failed")?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

/// Error type returned by HTTP handlers
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error")]
    InternalError(#[from] anyhow::Error),
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidOrder(e) => AppError::BadRequest(e.to_string()),
            EngineError::UnknownOrder(id) => AppError::NotFound(format!("order {}", id)),
            EngineError::Closed | EngineError::Unavailable(_) => {
                AppError::ServiceUnavailable(err.to_string())
            }
            other => AppError::InternalError(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "BAD_REQUEST"),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND"),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, msg, "SERVICE_UNAVAILABLE")
            }
            AppError::InternalError(err) => {
                tracing::error!(error = %err, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_ERROR",
                )
            }
        };

        let body = Json(json!({
            "error": code,
            "message": error_message
        }));

        (status, body).into_response()
    }
}
