//! Server lifecycle
//!
//! [`Server`] owns the database handle, the engine, the hub and the HTTP
//! listener, and is the only place that sequences them:
//!
//! ```text
//! new:      connect db → ensure WAL dir → hub → engine → recover → router → bind
//! run:      spawn hub loop → wait until it consumes → serve HTTP
//! shutdown: stop accepting + drain → engine → hub → db
//! ```
//!
//! Lifecycle: `Created → Initialized → Running → ShuttingDown → Closed`.
//! Transitions only move forward and `Closed` is terminal.
//!
//! Shutdown stops the listener first so no request reaches a closed engine
//! or database, then closes the rest in reverse dependency order.

use axum::Router;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::{ConnectOptions, Database, DatabaseConnector, PgConnector};
use crate::engine::{Engine, EngineError, EngineFactory, JournalEngineFactory, RecoveryReport};
use crate::error::{FailureKind, ServerError, ShutdownError, ShutdownStep};
use crate::hub::{Hub, HubError};
use crate::router;
use crate::state::AppState;

#[cfg(unix)]
const WAL_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Initialized,
    Running,
    ShuttingDown,
    Closed,
}

/// How a successful [`Server::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Stopped by [`Server::shutdown`].
    Closed,
}

/// Signal from `shutdown` to the accept loop. Ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stop {
    Serving,
    /// Stop accepting and let in-flight requests finish.
    Drain,
    /// The drain deadline passed; stop waiting for open connections. Their
    /// tasks are not cancelled and finish on their own.
    Abort,
}

/// Factories for the server's external collaborators.
pub struct Collaborators {
    pub connector: Arc<dyn DatabaseConnector>,
    pub engines: Arc<dyn EngineFactory>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            connector: Arc::new(PgConnector),
            engines: Arc::new(JournalEngineFactory),
        }
    }
}

/// Everything construction opened, in the order it was opened.
struct Assembled {
    db: Arc<dyn Database>,
    hub: Hub,
    engine: Arc<dyn Engine>,
    recovery: RecoveryReport,
    router: Router,
    listener: TcpListener,
}

/// Handles opened so far during construction, released if a later step fails.
#[derive(Default)]
struct Opened {
    db: Option<Arc<dyn Database>>,
    hub: Option<Hub>,
    engine: Option<Arc<dyn Engine>>,
}

impl Opened {
    async fn release(self) {
        if let Some(engine) = self.engine {
            if let Err(e) = engine.close() {
                warn!(error = %e, "Engine close failed during aborted startup");
            }
        }
        if let Some(hub) = self.hub {
            hub.close();
        }
        if let Some(db) = self.db {
            if let Err(e) = db.close().await {
                warn!(error = %e, "Database close failed during aborted startup");
            }
        }
    }
}

pub struct Server {
    config: Config,
    db: Arc<dyn Database>,
    engine: Arc<dyn Engine>,
    hub: Hub,
    router: Router,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    recovery: RecoveryReport,
    hub_task: Mutex<Option<JoinHandle<Result<(), HubError>>>>,
    lifecycle: watch::Sender<Lifecycle>,
    stop: watch::Sender<Stop>,
    /// Set once the accept loop in `run` has returned.
    served: watch::Sender<bool>,
}

impl Server {
    /// Build a server backed by Postgres and the WAL journal engine.
    pub async fn new(config: &Config) -> Result<Self, ServerError> {
        Self::with_collaborators(config, Collaborators::default()).await
    }

    /// Acquire every resource in order and recover the engine.
    ///
    /// Either returns a server ready to [`run`](Server::run), or an error
    /// after releasing whatever had already been opened.
    pub async fn with_collaborators(
        config: &Config,
        collaborators: Collaborators,
    ) -> Result<Self, ServerError> {
        let (lifecycle, _) = watch::channel(Lifecycle::Created);

        let mut opened = Opened::default();
        let assembled = match Self::assemble(config, &collaborators, &mut opened).await {
            Ok(assembled) => assembled,
            Err(e) => {
                error!(error = %e, "Server construction failed");
                opened.release().await;
                return Err(e);
            }
        };

        let local_addr = match assembled.listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                opened.release().await;
                return Err(ServerError::Listen(e));
            }
        };
        let (stop, _) = watch::channel(Stop::Serving);
        let (served, _) = watch::channel(false);

        let server = Self {
            config: config.clone(),
            db: assembled.db,
            engine: assembled.engine,
            hub: assembled.hub,
            router: assembled.router,
            listener: Mutex::new(Some(assembled.listener)),
            local_addr,
            recovery: assembled.recovery,
            hub_task: Mutex::new(None),
            lifecycle,
            stop,
            served,
        };
        server.transition(&[Lifecycle::Created], Lifecycle::Initialized)?;
        info!(addr = %local_addr, "Server initialized");
        Ok(server)
    }

    async fn assemble(
        config: &Config,
        collaborators: &Collaborators,
        opened: &mut Opened,
    ) -> Result<Assembled, ServerError> {
        config.validate()?;
        let addr = config.listen_addr()?;

        let options = ConnectOptions {
            max_connections: config.database_max_connections,
            connect_timeout: config.database_connect_timeout(),
        };
        let db = collaborators
            .connector
            .connect(&config.database_url, options)
            .await
            .map_err(ServerError::Connection)?;
        opened.db = Some(db.clone());
        info!("Database connected");

        ensure_wal_dir(&config.wal_dir).await?;

        let hub = Hub::new(config.hub_backlog);
        opened.hub = Some(hub.clone());

        let wal_path = config.wal_path();
        let engine = collaborators
            .engines
            .build(wal_path.clone(), hub.clone(), db.clone());
        opened.engine = Some(engine.clone());

        info!(wal = %wal_path.display(), "Recovering engine state from WAL");
        let recovering = engine.clone();
        let recovery = tokio::task::spawn_blocking(move || recovering.recover())
            .await
            .map_err(|e| {
                ServerError::Recovery(EngineError::Unavailable(format!("recovery task failed: {}", e)))
            })?
            .map_err(ServerError::Recovery)?;

        let state = AppState::new(engine.clone(), db.clone(), hub.clone());
        let router = router::create_router(&config.allowed_origins, state)?;

        let listener = TcpListener::bind(addr).await.map_err(ServerError::Listen)?;

        Ok(Assembled {
            db,
            hub,
            engine,
            recovery,
            router,
            listener,
        })
    }

    /// Start the hub loop, then serve HTTP until [`shutdown`](Server::shutdown).
    ///
    /// Returns `Ok(ServeOutcome::Closed)` after a shutdown and
    /// `Err(ServerError::Listen)` if the listener fails on its own; in that
    /// case the caller still owes a `shutdown` to release the other resources.
    pub async fn run(&self) -> Result<ServeOutcome, ServerError> {
        self.transition(&[Lifecycle::Initialized], Lifecycle::Running)?;
        // marks the accept loop as gone on every exit, including cancellation
        let _served = MarkServed(&self.served);

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            return Err(ServerError::InvalidState {
                expected: Lifecycle::Initialized,
                actual: self.lifecycle(),
            });
        };

        let hub = self.hub.clone();
        let task = tokio::spawn(async move { hub.run().await });
        *self.hub_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        self.hub.started().await;

        info!(addr = %self.local_addr, "Accepting connections");

        let mut drain = self.stop.subscribe();
        let mut abort = self.stop.subscribe();
        let serve = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move { wait_for_stop(&mut drain, Stop::Drain).await })
            .into_future();

        let result = tokio::select! {
            result = serve => match result {
                Ok(()) => Ok(ServeOutcome::Closed),
                Err(e) => {
                    error!(error = %e, "Listener failed");
                    Err(ServerError::Listen(e))
                }
            },
            _ = wait_for_stop(&mut abort, Stop::Abort) => {
                warn!("Drain deadline passed, no longer waiting for open connections");
                Ok(ServeOutcome::Closed)
            }
        };

        info!("Stopped accepting connections");
        result
    }

    /// Release every owned resource, in order, by `deadline`.
    ///
    /// Each step is attempted even if an earlier one failed or the deadline
    /// has already passed; all failures are returned together. Calling this
    /// again after the first call is a no-op.
    pub async fn shutdown(&self, deadline: Instant) -> Result<(), ServerError> {
        let previous = match self.transition(
            &[Lifecycle::Initialized, Lifecycle::Running],
            Lifecycle::ShuttingDown,
        ) {
            Ok(previous) => previous,
            Err(ServerError::InvalidState { actual, .. }) => {
                warn!(state = ?actual, "Shutdown already requested");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        info!(from = ?previous, "Shutting down");
        let mut failures = ShutdownError::default();

        // 1. listener: stop accepting, drain in-flight requests
        self.stop.send_replace(Stop::Drain);
        let unused = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(unused);
        if previous == Lifecycle::Running && timeout_at(deadline, self.served()).await.is_err() {
            warn!("Connections still open at deadline");
            self.stop.send_replace(Stop::Abort);
            failures.push(ShutdownStep::Listener, FailureKind::Timeout);
        }

        // 2. engine
        if let Err(e) = self.engine.close() {
            error!(error = %e, "Engine close failed");
            failures.push(ShutdownStep::Engine, FailureKind::Failed(e.to_string()));
        }

        // 3. hub
        self.hub.close();
        let task = self
            .hub_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            match timeout_at(deadline, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => failures.push(ShutdownStep::Hub, FailureKind::Failed(e.to_string())),
                Ok(Err(e)) => failures.push(ShutdownStep::Hub, FailureKind::Failed(e.to_string())),
                Err(_) => {
                    warn!("Hub loop still running at deadline");
                    failures.push(ShutdownStep::Hub, FailureKind::Timeout);
                }
            }
        }

        // 4. database
        match timeout_at(deadline, self.db.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "Database close failed");
                failures.push(ShutdownStep::Database, FailureKind::Failed(e.to_string()));
            }
            Err(_) => {
                warn!("Database close still pending at deadline");
                failures.push(ShutdownStep::Database, FailureKind::Timeout);
            }
        }

        self.transition(&[Lifecycle::ShuttingDown], Lifecycle::Closed)?;
        if failures.is_empty() {
            info!("Shutdown complete");
            Ok(())
        } else {
            warn!(%failures, "Shutdown finished with failures");
            Err(failures.into())
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// Resolves once the server reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.lifecycle.subscribe();
        while *rx.borrow_and_update() != Lifecycle::Closed {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Resolves once `run` has stopped accepting.
    async fn served(&self) {
        let mut rx = self.served.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Move to `to` if the current state is one of `from`; returns the
    /// state that was left.
    fn transition(&self, from: &[Lifecycle], to: Lifecycle) -> Result<Lifecycle, ServerError> {
        let mut current = self.lifecycle();
        let moved = self.lifecycle.send_if_modified(|state| {
            current = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            info!(from = ?current, to = ?to, "Lifecycle transition");
            Ok(current)
        } else {
            Err(ServerError::InvalidState {
                expected: from.first().copied().unwrap_or(to),
                actual: current,
            })
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let state = self.lifecycle();
        if state != Lifecycle::Closed {
            warn!(state = ?state, "Server dropped without shutdown");
            self.hub.close();
        }
    }
}

/// Flags the accept loop as finished when dropped.
struct MarkServed<'a>(&'a watch::Sender<bool>);

impl Drop for MarkServed<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn wait_for_stop(rx: &mut watch::Receiver<Stop>, at_least: Stop) {
    while *rx.borrow_and_update() < at_least {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Create the WAL directory if it is missing. An existing directory is left
/// as it is, permissions included.
async fn ensure_wal_dir(dir: &Path) -> Result<(), ServerError> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(WAL_DIR_MODE);
    builder
        .create(dir)
        .await
        .map_err(|source| ServerError::Filesystem {
            path: dir.to_path_buf(),
            source,
        })
}
