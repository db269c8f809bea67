use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// Observed replica breakdown for one service.
///
/// `running + staged` always equals the service's `task-count`; `unhealthy`
/// is clamped at zero because `readyReplicas` can transiently exceed
/// `availableReplicas` while pods age into availability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub healthy: i32,
    pub unhealthy: i32,
    pub running: i32,
    pub staged: i32,
}

/// A logical Waiter service as reflected from its backing workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Service {
    pub id: String,
    /// Requested replica count.
    pub instances: i32,
    pub task_count: i32,
    pub task_stats: TaskStats,
    #[serde(rename = "k8s/app-name")]
    pub app_name: String,
    #[serde(rename = "k8s/namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum InstanceFlag {
    #[serde(rename = "memory-limit-exceeded")]
    MemoryLimitExceeded,
}

/// One incarnation of one replica. A restarted container produces a fresh
/// instance with a new id; the previous incarnation lives on in the failure
/// store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceInstance {
    pub id: String,
    pub service_id: String,
    /// Pod IP; empty until the pod is scheduled and addressable.
    pub host: String,
    pub port: i32,
    pub extra_ports: Vec<i32>,
    pub protocol: String,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "healthy?")]
    pub healthy: bool,
    pub log_directory: String,
    pub restart_count: i32,
    pub flags: BTreeSet<InstanceFlag>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(rename = "k8s/app-name")]
    pub app_name: String,
    #[serde(rename = "k8s/namespace")]
    pub namespace: String,
}

/// Same shape as a live instance, `healthy?` always false.
pub type FailedInstance = ServiceInstance;

/// Snapshot entry published by the syncer for one service.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceInstances {
    pub active_instances: Vec<ServiceInstance>,
    pub failed_instances: Vec<FailedInstance>,
}

/// Instance ids are injective on `(service-id, pod-name, restart-count)`.
#[must_use]
pub fn instance_id(service_id: &str, pod_name: &str, restart_count: i32) -> String {
    format!("{service_id}.{pod_name}-{restart_count}")
}

impl ServiceInstance {
    /// Recover the pod name embedded in the instance id.
    #[must_use]
    pub fn pod_name(&self) -> Option<&str> {
        let rest = self
            .id
            .strip_prefix(&self.service_id)?
            .strip_prefix('.')?;
        rest.strip_suffix(&format!("-{}", self.restart_count))
    }
}
