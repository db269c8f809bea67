use crate::config::SYNCER_CHANNEL_CAPACITY;
use crate::model::ServiceInstances;
use crate::scheduler::ServiceScheduler;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One published service→instances snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SyncerSnapshot {
    pub timestamp: DateTime<Utc>,
    pub services: HashMap<String, ServiceInstances>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct SyncerStateInner {
    last_published_at: Option<DateTime<Utc>>,
    last_service_count: usize,
    last_instance_count: usize,
}

/// Most recent publish bookkeeping, shared between the syncer worker and
/// the scheduler's `state` operation.
#[derive(Default)]
pub struct SyncerState {
    inner: RwLock<SyncerStateInner>,
}

impl SyncerState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, service_count: usize, instance_count: usize) {
        if let Ok(mut inner) = self.inner.write() {
            inner.last_published_at = Some(Utc::now());
            inner.last_service_count = service_count;
            inner.last_instance_count = instance_count;
        }
    }

    #[must_use]
    pub fn state(&self) -> serde_json::Value {
        self.inner.read().map_or(serde_json::Value::Null, |inner| {
            serde_json::to_value(inner.clone()).unwrap_or(serde_json::Value::Null)
        })
    }

    #[must_use]
    pub fn last_published_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().ok().and_then(|inner| inner.last_published_at)
    }
}

/// Periodic worker publishing service→instance snapshots to a bounded
/// channel the router and autoscaler consume. Backend trouble shows up as
/// an empty snapshot, never as a missing one.
pub struct SchedulerSyncer {
    scheduler: Arc<dyn ServiceScheduler>,
    interval: Duration,
    state: Arc<SyncerState>,
    tx: mpsc::Sender<SyncerSnapshot>,
}

impl SchedulerSyncer {
    /// Returns the syncer and the receiving half of its channel.
    #[must_use]
    pub fn new(
        scheduler: Arc<dyn ServiceScheduler>,
        interval_secs: u64,
        state: Arc<SyncerState>,
    ) -> (Self, mpsc::Receiver<SyncerSnapshot>) {
        let (tx, rx) = mpsc::channel(SYNCER_CHANNEL_CAPACITY);
        (
            Self {
                scheduler,
                interval: Duration::from_secs(interval_secs.max(1)),
                state,
                tx,
            },
            rx,
        )
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting scheduler syncer"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.publish_once().await;
            }
        })
    }

    async fn publish_once(&self) {
        let services = self.scheduler.get_service_instances().await;
        let service_count = services.len();
        let instance_count = services
            .values()
            .map(|instances| instances.active_instances.len() + instances.failed_instances.len())
            .sum();
        self.state.record(service_count, instance_count);
        let snapshot = SyncerSnapshot {
            timestamp: Utc::now(),
            services,
        };
        if self.tx.send(snapshot).await.is_err() {
            debug!("syncer channel has no receiver, dropping snapshot");
        }
    }
}
