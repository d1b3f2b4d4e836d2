//! Worker loop: one subscription, one sink, one message at a time.

use crate::bus::{BusMessage, MessageBus};
use common::{RetryPolicy, sleep_or_cancelled};
use schemaforge_core::IngestOutcome;
use serde_json::Value;
use sinks::SinkHandle;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Completed { written: usize, skipped: usize },
    Abandoned,
    /// Shutdown hit mid-message; the lock is left to expire.
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub abandoned: usize,
    pub interrupted: usize,
    pub records_written: usize,
    pub records_skipped: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Completed { written, skipped } => {
                self.completed += 1;
                self.records_written += written;
                self.records_skipped += skipped;
            }
            MessageOutcome::Abandoned => self.abandoned += 1,
            MessageOutcome::Interrupted => self.interrupted += 1,
        }
    }
}

pub struct Worker {
    name: String,
    sink: SinkHandle,
    bus: Arc<dyn MessageBus>,
    backoff: RetryPolicy,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        sink: SinkHandle,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            name: name.into(),
            sink,
            bus,
            backoff: RetryPolicy::default(),
        }
    }

    /// Receive and process until the subscription ends or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerStats {
        info!(
            worker = %self.name,
            sink = %self.sink.id,
            subscription = %self.bus.name(),
            "worker starting"
        );
        let mut stats = WorkerStats::default();
        let mut backoff = self.backoff.clone();

        loop {
            let message = match self.bus.receive(&cancel).await {
                Ok(Some(message)) => {
                    backoff.reset();
                    message
                }
                Ok(None) => break,
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(worker = %self.name, error = %e, ?delay, "receive failed");
                    if !sleep_or_cancelled(&cancel, delay).await {
                        break;
                    }
                    continue;
                }
            };

            let outcome = self.process_message(&message, &cancel).await;
            stats.record(outcome);
            if outcome == MessageOutcome::Interrupted {
                break;
            }
        }

        info!(
            worker = %self.name,
            sink = %self.sink.id,
            completed = stats.completed,
            abandoned = stats.abandoned,
            written = stats.records_written,
            "worker stopped"
        );
        stats
    }

    /// Ingest every record of a message, then complete it. Any failure
    /// abandons the whole message; records already written are rewritten
    /// idempotently on redelivery.
    pub async fn process_message(
        &self,
        message: &BusMessage,
        cancel: &CancellationToken,
    ) -> MessageOutcome {
        let elements = match serde_json::from_str::<Value>(&message.body) {
            Ok(Value::Array(items)) => items,
            Ok(value @ Value::Object(_)) => vec![value],
            Ok(other) => {
                let reason = format!("expected a JSON array or object, got {other}");
                return self.abandon(message, &reason).await;
            }
            Err(e) => {
                return self
                    .abandon(message, &format!("invalid JSON: {e}"))
                    .await;
            }
        };

        let (mut written, mut skipped) = (0, 0);
        for element in &elements {
            match self.sink.ingestor.ingest_record(element, cancel).await {
                Ok(IngestOutcome::Written) => written += 1,
                Ok(IngestOutcome::Skipped) => skipped += 1,
                Err(e) if e.is_cancelled() => {
                    debug!(worker = %self.name, message_id = message.id, "shutdown during message");
                    return MessageOutcome::Interrupted;
                }
                Err(e) => return self.abandon(message, &e.to_string()).await,
            }
        }

        if let Err(e) = self.bus.complete(message).await {
            // the lock lapsed; the redelivery rewrites the same rows
            warn!(worker = %self.name, message_id = message.id, error = %e, "complete failed");
        }
        debug!(worker = %self.name, message_id = message.id, written, skipped, "message completed");
        MessageOutcome::Completed { written, skipped }
    }

    async fn abandon(&self, message: &BusMessage, reason: &str) -> MessageOutcome {
        error!(
            worker = %self.name,
            sink = %self.sink.id,
            message_id = message.id,
            delivery_count = message.delivery_count,
            error = reason,
            "abandoning message"
        );
        if let Err(e) = self.bus.abandon(message).await {
            warn!(worker = %self.name, message_id = message.id, error = %e, "abandon failed");
        }
        MessageOutcome::Abandoned
    }
}
