//! Message bus abstraction and the in-process topic.
//!
//! Delivery is peek-lock: a received message stays owned by the receiver
//! until it is completed or abandoned. Abandoned messages are redelivered
//! with a higher delivery count until `max_delivery_count` is reached, then
//! dead-lettered.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("subscription {0} is closed")]
    Closed(String),

    #[error("message {id} is not locked by subscription {subscription}")]
    NotLocked { subscription: String, id: u64 },

    #[error("bus error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub id: u64,
    pub body: String,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next message. `None` once the subscription is closed
    /// and drained, or when `cancel` fires.
    async fn receive(
        &self,
        cancel: &CancellationToken,
    ) -> BusResult<Option<BusMessage>>;

    async fn complete(&self, message: &BusMessage) -> BusResult<()>;

    /// Release the lock so the message is delivered again.
    async fn abandon(&self, message: &BusMessage) -> BusResult<()>;
}

// ============================================================================
// In-memory subscription
// ============================================================================

#[derive(Debug, Default)]
struct SubscriptionState {
    ready: VecDeque<BusMessage>,
    locked: HashMap<u64, BusMessage>,
    dead_letters: Vec<BusMessage>,
    completed: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct MemSubscription {
    name: String,
    max_delivery_count: u32,
    state: Mutex<SubscriptionState>,
    notify: Notify,
}

impl MemSubscription {
    fn new(name: impl Into<String>, max_delivery_count: u32) -> Self {
        Self {
            name: name.into(),
            max_delivery_count: max_delivery_count.max(1),
            state: Mutex::new(SubscriptionState::default()),
            notify: Notify::new(),
        }
    }

    fn enqueue(&self, id: u64, body: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.ready.push_back(BusMessage {
                id,
                body: body.to_owned(),
                delivery_count: 0,
            });
        }
        self.notify.notify_waiters();
        true
    }

    /// Stop accepting messages. Receivers drain what is left, then see
    /// `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn dead_letters(&self) -> Vec<BusMessage> {
        self.state.lock().dead_letters.clone()
    }

    pub fn completed_count(&self) -> usize {
        self.state.lock().completed
    }

    /// Messages waiting or locked by a receiver.
    pub fn pending(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.locked.len()
    }
}

#[async_trait]
impl MessageBus for MemSubscription {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        cancel: &CancellationToken,
    ) -> BusResult<Option<BusMessage>> {
        loop {
            // registered before the state check so a wakeup in between is kept
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;
                    state.locked.insert(message.id, message.clone());
                    return Ok(Some(message));
                }
                if state.closed && state.locked.is_empty() {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = notified => {}
            }
        }
    }

    async fn complete(&self, message: &BusMessage) -> BusResult<()> {
        let mut state = self.state.lock();
        if state.locked.remove(&message.id).is_none() {
            return Err(BusError::NotLocked {
                subscription: self.name.clone(),
                id: message.id,
            });
        }
        state.completed += 1;
        drop(state);
        // a closed subscription may be waiting for its last lock
        self.notify.notify_waiters();
        Ok(())
    }

    async fn abandon(&self, message: &BusMessage) -> BusResult<()> {
        let mut state = self.state.lock();
        let Some(locked) = state.locked.remove(&message.id) else {
            return Err(BusError::NotLocked {
                subscription: self.name.clone(),
                id: message.id,
            });
        };

        if locked.delivery_count >= self.max_delivery_count {
            warn!(
                subscription = %self.name,
                message_id = locked.id,
                delivery_count = locked.delivery_count,
                "message dead-lettered"
            );
            state.dead_letters.push(locked);
        } else {
            debug!(
                subscription = %self.name,
                message_id = locked.id,
                delivery_count = locked.delivery_count,
                "message abandoned, redelivering"
            );
            state.ready.push_front(locked);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

// ============================================================================
// In-memory topic
// ============================================================================

/// Topic that copies every published message to each subscription.
#[derive(Debug)]
pub struct MemTopic {
    name: String,
    subscriptions: RwLock<Vec<Arc<MemSubscription>>>,
    next_id: AtomicU64,
}

impl MemTopic {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscriptions only see messages published after they were created.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        max_delivery_count: u32,
    ) -> Arc<MemSubscription> {
        let subscription =
            Arc::new(MemSubscription::new(name, max_delivery_count));
        self.subscriptions.write().push(subscription.clone());
        subscription
    }

    /// Returns the message id.
    pub fn publish(&self, body: impl AsRef<str>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = body.as_ref();
        let delivered = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.enqueue(id, body))
            .count();
        debug!(topic = %self.name, message_id = id, delivered, "message published");
        id
    }

    pub fn close(&self) {
        for subscription in self.subscriptions.read().iter() {
            subscription.close();
        }
    }
}
