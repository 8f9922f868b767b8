//! Broadcast hub
//!
//! A single consumer loop that distributes engine events to every
//! subscriber. Publishers and subscribers talk to the loop through one
//! unbounded inbox, so the order in which events are published is the order
//! in which every subscriber receives them.
//!
//! The loop keeps the most recent events and replays them to each new
//! subscriber before any live event, so a client that connects after an
//! event was published still sees it.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Extra room in each subscriber channel on top of the backlog replay.
const SUBSCRIBER_HEADROOM: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is closed")]
    Closed,

    #[error("hub loop is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HubState {
    Idle,
    Running,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubEvent {
    /// Position in the hub's distribution order, starting at 1
    pub sequence: u64,
    pub kind: String,
    pub payload: serde_json::Value,
}

enum Command {
    Publish {
        kind: String,
        payload: serde_json::Value,
    },
    Subscribe(mpsc::Sender<Arc<HubEvent>>),
}

struct Inner {
    inbox: mpsc::UnboundedSender<Command>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    state: watch::Sender<HubState>,
    backlog: usize,
}

/// Cloneable handle to the hub; all clones share one loop.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

/// Receiving end of a hub subscription. Ends when the hub closes.
pub struct Subscription {
    rx: mpsc::Receiver<Arc<HubEvent>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<HubEvent>> {
        self.rx.recv().await
    }
}

impl Hub {
    pub fn new(backlog: usize) -> Self {
        let (inbox, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(HubState::Idle);
        Self {
            inner: Arc::new(Inner {
                inbox,
                receiver: Mutex::new(Some(receiver)),
                state,
                backlog: backlog.max(1),
            }),
        }
    }

    pub fn state(&self) -> HubState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == HubState::Closed
    }

    /// Queue an event for distribution.
    pub fn publish(
        &self,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        self.inner
            .inbox
            .send(Command::Publish {
                kind: kind.into(),
                payload,
            })
            .map_err(|_| HubError::Closed)
    }

    /// Register a subscriber. It first receives the retained backlog, then
    /// live events.
    pub fn subscribe(&self) -> Result<Subscription, HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }
        let (tx, rx) = mpsc::channel(self.inner.backlog + SUBSCRIBER_HEADROOM);
        self.inner
            .inbox
            .send(Command::Subscribe(tx))
            .map_err(|_| HubError::Closed)?;
        Ok(Subscription { rx })
    }

    /// Resolves once the loop is consuming its inbox, or the hub is closed.
    pub async fn started(&self) {
        let mut state = self.inner.state.subscribe();
        while *state.borrow_and_update() == HubState::Idle {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signal the loop to stop. Subscribers see their stream end.
    pub fn close(&self) {
        let previous = self.inner.state.send_replace(HubState::Closed);
        if previous != HubState::Closed {
            tracing::info!(previous = ?previous, "Hub closed");
        }
    }

    /// Consume and distribute events until [`close`](Hub::close) is called.
    ///
    /// Meant to be spawned on its own task. Only one loop may run per hub.
    pub async fn run(&self) -> Result<(), HubError> {
        let receiver = self
            .inner
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            return Err(HubError::AlreadyRunning);
        };

        let started = self.inner.state.send_if_modified(|s| {
            if *s == HubState::Idle {
                *s = HubState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Ok(());
        }
        tracing::info!(backlog = self.inner.backlog, "Hub loop started");

        let mut state_rx = self.inner.state.subscribe();
        let mut fanout = Fanout::new(self.inner.backlog);

        loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut state_rx) => break,
                command = receiver.recv() => match command {
                    Some(command) => fanout.handle(command),
                    None => break,
                },
            }
        }

        let dropped = receiver.len();
        tracing::info!(
            distributed = fanout.sequence,
            subscribers = fanout.subscribers.len(),
            dropped,
            "Hub loop stopped"
        );
        Ok(())
    }
}

async fn wait_closed(state: &mut watch::Receiver<HubState>) {
    while *state.borrow_and_update() != HubState::Closed {
        if state.changed().await.is_err() {
            return;
        }
    }
}

struct Fanout {
    sequence: u64,
    backlog: VecDeque<Arc<HubEvent>>,
    capacity: usize,
    subscribers: Vec<mpsc::Sender<Arc<HubEvent>>>,
}

impl Fanout {
    fn new(capacity: usize) -> Self {
        Self {
            sequence: 0,
            backlog: VecDeque::with_capacity(capacity),
            capacity,
            subscribers: Vec::new(),
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Publish { kind, payload } => {
                self.sequence += 1;
                let event = Arc::new(HubEvent {
                    sequence: self.sequence,
                    kind,
                    payload,
                });

                if self.backlog.len() == self.capacity {
                    self.backlog.pop_front();
                }
                self.backlog.push_back(event.clone());

                self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(sequence = event.sequence, "Dropping slow hub subscriber");
                        false
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
            Command::Subscribe(tx) => {
                let replayed = self
                    .backlog
                    .iter()
                    .all(|event| tx.try_send(event.clone()).is_ok());
                if replayed {
                    self.subscribers.push(tx);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn spawn_loop(hub: &Hub) -> tokio::task::JoinHandle<Result<(), HubError>> {
        let hub = hub.clone();
        tokio::spawn(async move { hub.run().await })
    }

    #[tokio::test]
    async fn test_events_published_before_run_are_delivered() {
        let hub = Hub::new(16);
        hub.publish("order.placed", json!({"n": 1})).unwrap();

        let handle = spawn_loop(&hub);
        hub.started().await;

        let mut sub = hub.subscribe().unwrap();
        let event = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
        assert_eq!(event.sequence, 1);
        assert_eq!(event.kind, "order.placed");

        hub.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_backlog_then_live_in_order() {
        let hub = Hub::new(2);
        let handle = spawn_loop(&hub);
        for n in 1..=3 {
            hub.publish("tick", json!(n)).unwrap();
        }

        let mut sub = hub.subscribe().unwrap();
        hub.publish("tick", json!(4)).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = timeout(Duration::from_secs(1), sub.recv()).await.unwrap().unwrap();
            seen.push(event.payload.clone());
        }
        // backlog of 2 keeps events 2 and 3
        assert_eq!(seen, vec![json!(2), json!(3), json!(4)]);

        hub.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions_and_rejects_publish() {
        let hub = Hub::new(4);
        let handle = spawn_loop(&hub);
        let mut sub = hub.subscribe().unwrap();

        hub.close();
        handle.await.unwrap().unwrap();

        assert!(timeout(Duration::from_secs(1), sub.recv()).await.unwrap().is_none());
        assert_eq!(hub.publish("late", json!(null)), Err(HubError::Closed));
        assert!(hub.subscribe().is_err());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let hub = Hub::new(4);
        let handle = spawn_loop(&hub);
        hub.started().await;

        assert_eq!(hub.run().await, Err(HubError::AlreadyRunning));

        hub.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_before_run_returns_immediately() {
        let hub = Hub::new(4);
        hub.close();
        hub.started().await;
        assert_eq!(hub.run().await, Ok(()));
        assert_eq!(hub.state(), HubState::Closed);
    }
}
