use crate::config::AuthorizerKind;
use crate::error::{Result, SchedulerError};
use crate::model::{Service, ServiceInstance, ServiceInstances};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// The subset of a Waiter service description the scheduler core consumes.
/// The full description lives with the service-description builder; this
/// crate only sees it through [`DescriptorLookup`].
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ServiceDescription {
    pub cmd: String,
    pub cmd_type: String,
    pub cpus: f64,
    /// Memory in MiB.
    pub mem: i64,
    /// Number of ports the backend binds, PORT0 first.
    pub ports: i32,
    pub run_as_user: String,
    pub backend_proto: String,
    pub health_check_url: String,
    pub health_check_interval_secs: i32,
    pub health_check_max_consecutive_failures: i32,
    pub grace_period_secs: i32,
    pub min_instances: i32,
    pub env: BTreeMap<String, String>,
    /// Composite-scheduler tag; absent means the configured default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
}

impl Default for ServiceDescription {
    fn default() -> Self {
        Self {
            cmd: String::new(),
            cmd_type: "shell".to_string(),
            cpus: 1.0,
            mem: 1024,
            ports: 1,
            run_as_user: String::new(),
            backend_proto: "http".to_string(),
            health_check_url: "/status".to_string(),
            health_check_interval_secs: 10,
            health_check_max_consecutive_failures: 5,
            grace_period_secs: 30,
            min_instances: 1,
            env: BTreeMap::new(),
            scheduler: None,
        }
    }
}

/// service-id → service-description resolution, provided by the service
/// description store outside this crate.
pub trait DescriptorLookup: Send + Sync {
    fn lookup(&self, service_id: &str) -> Option<ServiceDescription>;
}

/// Derives the per-service backend password injected into the workload env.
pub trait PasswordSource: Send + Sync {
    fn password_for(&self, service_id: &str) -> String;
}

/// Capability check backing `validate_service`.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, run_as_user: &str, service_id: &str) -> Result<()>;
}

pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn authorize(&self, _run_as_user: &str, _service_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Permits only services that run as the configured user.
pub struct RunAsUserAuthorizer {
    user: String,
}

impl RunAsUserAuthorizer {
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into() }
    }
}

impl Authorizer for RunAsUserAuthorizer {
    fn authorize(&self, run_as_user: &str, service_id: &str) -> Result<()> {
        if run_as_user == self.user {
            Ok(())
        } else {
            Err(SchedulerError::AuthFailed(format!(
                "user {run_as_user} may not run service {service_id}"
            )))
        }
    }
}

#[must_use]
pub fn make_authorizer(kind: AuthorizerKind, user: impl Into<String>) -> Box<dyn Authorizer> {
    match kind {
        AuthorizerKind::AllowAll => Box::new(AllowAllAuthorizer),
        AuthorizerKind::RunAsUser => Box::new(RunAsUserAuthorizer::new(user)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleOutcome {
    Scaled,
    ScalingNotNeeded,
    NoSuchServiceExists,
    Conflict,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleResult {
    pub success: bool,
    pub status: u16,
    pub result: ScaleOutcome,
    pub message: String,
}

impl ScaleResult {
    #[must_use]
    pub fn new(success: bool, status: u16, result: ScaleOutcome, message: impl Into<String>) -> Self {
        Self {
            success,
            status,
            result,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum KillOutcome {
    InstanceKilled,
    NoSuchInstanceExists,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillResult {
    #[serde(rename = "killed?")]
    pub killed: bool,
    pub status: u16,
    pub result: KillOutcome,
    pub message: String,
}

impl KillResult {
    #[must_use]
    pub fn new(killed: bool, status: u16, result: KillOutcome, message: impl Into<String>) -> Self {
        Self {
            killed,
            status,
            result,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeleteOutcome {
    Deleted,
    NoSuchServiceExists,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub result: DeleteOutcome,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

/// One fileserver listing entry, annotated with either a direct download
/// `url` (files) or a navigable sub-`path` (directories).
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// The stable scheduler interface the rest of Waiter consumes. Implemented
/// by the Kubernetes backend and the composite router; tests add in-memory
/// stubs.
#[async_trait]
pub trait ServiceScheduler: Send + Sync {
    /// Services currently known to the backend, from local watch state.
    async fn get_services(&self) -> Vec<Service>;

    /// service-id → active/failed instances, the syncer's input.
    async fn get_service_instances(&self) -> HashMap<String, ServiceInstances>;

    /// Three-step safe kill of one instance.
    async fn kill_instance(&self, instance: &ServiceInstance) -> KillResult;

    async fn service_exists(&self, service_id: &str) -> bool;

    /// One-shot create. `Ok(None)` when the service already exists or the
    /// orchestrator rejected the request (logged); `Err` only for requests
    /// this backend cannot express at all.
    async fn create_service_if_new(
        &self,
        service_id: &str,
        descriptor: &ServiceDescription,
    ) -> Result<Option<Service>>;

    async fn delete_service(&self, service_id: &str) -> DeleteResult;

    /// Absolute, upward-only scale to `target`.
    async fn scale_service(&self, service_id: &str, target: i32, force: bool) -> ScaleResult;

    /// Directory listing from the instance's fileserver; `None` when the
    /// fileserver is unreachable or not configured.
    async fn retrieve_directory_content(
        &self,
        service_id: &str,
        instance_id: &str,
        host: &str,
        path: &str,
    ) -> Option<Vec<DirectoryEntry>>;

    async fn service_id_state(&self, service_id: &str) -> serde_json::Value;

    /// Snapshot of watch state, failure store, and syncer state.
    async fn state(&self) -> serde_json::Value;

    async fn validate_service(&self, service_id: &str) -> Result<()>;
}
