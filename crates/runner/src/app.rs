//! Process wiring: lock service, sink services, topic and workers.

use crate::bus::{MemSubscription, MemTopic};
use crate::worker::{Worker, WorkerStats};
use anyhow::{Context, Result};
use futures::future::join_all;
use leases::{LeaseConfig, LeaseStore, LockService, MemLeaseStore, SqliteLeaseStore};
use schemaforge_config::{Config, LockBackend, LocksCfg};
use sinks::{SinkAdapters, build_services};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lease store per `locks`; each store call is bounded by `call_timeout`.
pub fn lock_service(cfg: &LocksCfg, call_timeout: Duration) -> Result<LockService> {
    let store: Arc<dyn LeaseStore> = match cfg.backend {
        LockBackend::Memory => Arc::new(MemLeaseStore::new()),
        LockBackend::Sqlite => {
            let path = cfg
                .path
                .as_deref()
                .context("locks.path is required for the sqlite backend")?;
            Arc::new(
                SqliteLeaseStore::new(path)
                    .with_context(|| format!("open lease store {path}"))?,
            )
        }
    };
    info!(backend = ?cfg.backend, lease = ?cfg.lease_duration(), "lock service ready");
    Ok(LockService::new(
        store,
        LeaseConfig {
            lease_duration: cfg.lease_duration(),
            poll_interval: cfg.poll_interval(),
            call_timeout,
        },
    ))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub sink_id: String,
    pub stats: WorkerStats,
    pub dead_lettered: usize,
}

/// Running workers, one per enabled sink, fed from one in-process topic.
pub struct App {
    topic: Arc<MemTopic>,
    subscriptions: Vec<(String, Arc<MemSubscription>)>,
    workers: Vec<(String, JoinHandle<WorkerStats>)>,
}

impl App {
    pub fn start(
        cfg: &Config,
        adapters: &SinkAdapters,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let locks = lock_service(&cfg.locks, cfg.worker.op_timeout())?;
        let services =
            build_services(cfg, &locks, adapters).context("build sink services")?;
        let topic = Arc::new(MemTopic::new(cfg.worker.topic.as_str()));

        let mut subscriptions = Vec::with_capacity(services.len());
        let mut workers = Vec::with_capacity(services.len());
        for sink in services {
            let subscription = topic.subscribe(
                cfg.subscription_name(&sink.id),
                cfg.worker.max_delivery_count,
            );
            let sink_id = sink.id.clone();
            let worker = Worker::new(
                format!("{}-{}", cfg.worker.name, sink_id),
                sink,
                subscription.clone(),
            );
            let token = cancel.child_token();
            let handle = tokio::spawn(async move { worker.run(token).await });

            subscriptions.push((sink_id.clone(), subscription));
            workers.push((sink_id, handle));
        }

        info!(topic = %topic.name(), workers = workers.len(), "workers started");
        Ok(Self {
            topic,
            subscriptions,
            workers,
        })
    }

    pub fn topic(&self) -> &MemTopic {
        &self.topic
    }

    pub fn subscription(&self, sink_id: &str) -> Option<&Arc<MemSubscription>> {
        self.subscriptions
            .iter()
            .find(|(id, _)| id == sink_id)
            .map(|(_, s)| s)
    }

    /// Close the topic and wait until every worker has drained it.
    pub async fn drain(self) -> Result<Vec<WorkerReport>> {
        self.topic.close();
        let (ids, handles): (Vec<String>, Vec<_>) = self.workers.into_iter().unzip();
        let results = join_all(handles).await;

        let mut reports = Vec::with_capacity(ids.len());
        for (sink_id, result) in ids.into_iter().zip(results) {
            let stats = match result {
                Ok(stats) => stats,
                Err(e) => {
                    error!(sink = %sink_id, error = %e, "worker task failed");
                    return Err(e).with_context(|| format!("worker for sink {sink_id}"));
                }
            };
            let dead_lettered = self
                .subscriptions
                .iter()
                .find(|(id, _)| *id == sink_id)
                .map_or(0, |(_, s)| s.dead_letters().len());
            reports.push(WorkerReport {
                sink_id,
                stats,
                dead_lettered,
            });
        }
        Ok(reports)
    }
}
