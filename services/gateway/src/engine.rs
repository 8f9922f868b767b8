//! Engine collaborator
//!
//! The server depends on the [`Engine`] contract only: build it from the WAL
//! path, the hub and the database handle, recover once before serving, close
//! once during shutdown. [`JournalEngine`] is the implementation the binary
//! runs: a WAL-backed registry of resting orders. It does not match orders.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use persistence::{FsyncPolicy, WalEntry, WalError, WalReader, WalWriter};
use types::ids::OrderId;
use types::order::{NewOrder, OrderError, RestingOrder};

use crate::database::Database;
use crate::hub::Hub;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid order: {0}")]
    InvalidOrder(#[from] OrderError),

    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),

    #[error("Engine is closed")]
    Closed,

    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    #[error("Engine has not recovered its WAL yet")]
    NotRecovered,

    #[error("WAL already recovered")]
    AlreadyRecovered,

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("Inconsistent WAL at sequence {sequence}: {detail}")]
    Inconsistent { sequence: u64, detail: String },

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub replayed: u64,
    pub last_sequence: u64,
    pub open_orders: usize,
    /// Bytes of a torn final entry that were cut off the WAL.
    pub torn_tail_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Resting,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub status: AckStatus,
    /// WAL sequence of the entry that recorded this change
    pub sequence: u64,
}

/// Contract the server requires of the engine.
pub trait Engine: Send + Sync + 'static {
    /// Replay the WAL. Blocking; called once, before serving.
    fn recover(&self) -> Result<RecoveryReport, EngineError>;

    fn submit(&self, order: NewOrder) -> Result<OrderAck, EngineError>;

    fn cancel(&self, order_id: OrderId) -> Result<OrderAck, EngineError>;

    fn open_orders(&self) -> Result<Vec<RestingOrder>, EngineError>;

    /// Flush and release the WAL. Later calls are no-ops.
    fn close(&self) -> Result<(), EngineError>;

    fn is_closed(&self) -> bool;
}

/// Builds the engine once the server has its hub and database.
pub trait EngineFactory: Send + Sync {
    fn build(&self, wal_path: PathBuf, hub: Hub, db: Arc<dyn Database>) -> Arc<dyn Engine>;
}

pub struct JournalEngineFactory;

impl EngineFactory for JournalEngineFactory {
    fn build(&self, wal_path: PathBuf, hub: Hub, db: Arc<dyn Database>) -> Arc<dyn Engine> {
        Arc::new(JournalEngine::new(wal_path, hub, db))
    }
}

/// WAL record; `kind` on the entry mirrors the variant name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WalRecord {
    OrderPlaced { order: RestingOrder },
    OrderCanceled { order_id: OrderId },
}

impl WalRecord {
    fn kind(&self) -> &'static str {
        match self {
            WalRecord::OrderPlaced { .. } => "OrderPlaced",
            WalRecord::OrderCanceled { .. } => "OrderCanceled",
        }
    }
}

struct EngineState {
    orders: BTreeMap<OrderId, RestingOrder>,
    writer: Option<WalWriter>,
    /// Set by recovery; appends are refused until then.
    next_sequence: Option<u64>,
}

pub struct JournalEngine {
    wal_path: PathBuf,
    hub: Hub,
    db: Arc<dyn Database>,
    state: Mutex<EngineState>,
    closed: AtomicBool,
}

impl JournalEngine {
    pub fn new(wal_path: PathBuf, hub: Hub, db: Arc<dyn Database>) -> Self {
        Self {
            wal_path,
            hub,
            db,
            state: Mutex::new(EngineState {
                orders: BTreeMap::new(),
                writer: None,
                next_sequence: None,
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.db.is_closed() {
            return Err(EngineError::Unavailable("database is closed".into()));
        }
        Ok(())
    }

    /// Append `record` and apply it, then announce it on the hub.
    ///
    /// Must be called with the state lock held; `close` takes the same lock,
    /// so nothing is appended once it has released the writer.
    fn commit(&self, state: &mut EngineState, record: WalRecord) -> Result<u64, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let Some(next_sequence) = state.next_sequence else {
            return Err(EngineError::NotRecovered);
        };
        if state.writer.is_none() {
            state.writer = Some(WalWriter::open(
                &self.wal_path,
                next_sequence,
                FsyncPolicy::EveryWrite,
            )?);
        }
        let writer = state.writer.as_mut().ok_or(EngineError::NotRecovered)?;

        let payload = serde_json::to_vec(&record)?;
        // a failed append leaves the file as it was, so the writer is kept
        let entry = writer.append(now_nanos(), record.kind(), payload).map_err(|e| {
            tracing::error!(sequence = next_sequence, error = %e, "WAL append failed");
            e
        })?;
        state.next_sequence = Some(entry.sequence + 1);

        let event = match &record {
            WalRecord::OrderPlaced { order } => json!({ "sequence": entry.sequence, "order": order }),
            WalRecord::OrderCanceled { order_id } => {
                json!({ "sequence": entry.sequence, "order_id": order_id })
            }
        };
        apply(&mut state.orders, &entry, record)?;

        let kind = match entry.kind.as_str() {
            "OrderPlaced" => "order.placed",
            _ => "order.canceled",
        };
        if let Err(e) = self.hub.publish(kind, event) {
            tracing::warn!(sequence = entry.sequence, error = %e, "Event not broadcast");
        }
        Ok(entry.sequence)
    }
}

impl Engine for JournalEngine {
    fn recover(&self) -> Result<RecoveryReport, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        let mut state = self.lock();
        if state.next_sequence.is_some() {
            return Err(EngineError::AlreadyRecovered);
        }

        let mut reader = WalReader::open(&self.wal_path)?;
        let mut orders = BTreeMap::new();
        let mut replayed = 0u64;
        while let Some(entry) = reader.next_entry()? {
            let record: WalRecord =
                serde_json::from_slice(&entry.payload).map_err(|e| EngineError::Inconsistent {
                    sequence: entry.sequence,
                    detail: format!("undecodable payload: {}", e),
                })?;
            if record.kind() != entry.kind {
                return Err(EngineError::Inconsistent {
                    sequence: entry.sequence,
                    detail: format!("kind {} does not match payload {}", entry.kind, record.kind()),
                });
            }
            apply(&mut orders, &entry, record)?;
            replayed += 1;
        }

        let torn_tail_bytes = reader.torn_tail();
        if torn_tail_bytes > 0 {
            truncate_wal(&self.wal_path, reader.valid_len())?;
        }

        let last_sequence = reader.last_sequence().unwrap_or(0);
        state.orders = orders;
        state.next_sequence = Some(last_sequence + 1);

        let report = RecoveryReport {
            replayed,
            last_sequence,
            open_orders: state.orders.len(),
            torn_tail_bytes,
        };
        tracing::info!(
            wal = %self.wal_path.display(),
            replayed = report.replayed,
            last_sequence = report.last_sequence,
            open_orders = report.open_orders,
            "WAL recovery complete"
        );
        Ok(report)
    }

    fn submit(&self, order: NewOrder) -> Result<OrderAck, EngineError> {
        self.ensure_open()?;
        order.validate()?;

        let order_id = OrderId::new();
        let resting = RestingOrder::from_new(order_id, order, now_nanos());
        let mut state = self.lock();
        let sequence = self.commit(&mut state, WalRecord::OrderPlaced { order: resting })?;

        Ok(OrderAck {
            order_id,
            status: AckStatus::Resting,
            sequence,
        })
    }

    fn cancel(&self, order_id: OrderId) -> Result<OrderAck, EngineError> {
        self.ensure_open()?;
        let mut state = self.lock();
        if !state.orders.contains_key(&order_id) {
            return Err(EngineError::UnknownOrder(order_id));
        }
        let sequence = self.commit(&mut state, WalRecord::OrderCanceled { order_id })?;

        Ok(OrderAck {
            order_id,
            status: AckStatus::Canceled,
            sequence,
        })
    }

    fn open_orders(&self) -> Result<Vec<RestingOrder>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        Ok(self.lock().orders.values().cloned().collect())
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.lock();
        if let Some(mut writer) = state.writer.take() {
            writer.sync()?;
        }
        tracing::info!(open_orders = state.orders.len(), "Engine closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn apply(
    orders: &mut BTreeMap<OrderId, RestingOrder>,
    entry: &WalEntry,
    record: WalRecord,
) -> Result<(), EngineError> {
    match record {
        WalRecord::OrderPlaced { order } => {
            if orders.insert(order.order_id, order).is_some() {
                return Err(EngineError::Inconsistent {
                    sequence: entry.sequence,
                    detail: "order placed twice".into(),
                });
            }
        }
        WalRecord::OrderCanceled { order_id } => {
            if orders.remove(&order_id).is_none() {
                return Err(EngineError::Inconsistent {
                    sequence: entry.sequence,
                    detail: format!("cancel of unknown order {}", order_id),
                });
            }
        }
    }
    Ok(())
}

fn truncate_wal(path: &Path, len: u64) -> Result<(), WalError> {
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(len)?;
    file.sync_all()?;
    Ok(())
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
