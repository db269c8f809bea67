use crate::config::{KubernetesConfig, WATCH_TIMEOUT_SECONDS};
use crate::error::{Result, SchedulerError};
use crate::k8s::client::ClientManager;
use crate::k8s::convert::{self, MANAGED_BY_LABEL};
use crate::k8s::failures::FailureStore;
use crate::model::Service;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use futures::pin_mut;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

const INITIAL_BACKOFF_SECONDS: u64 = 1;
const MAX_BACKOFF_SECONDS: u64 = 60;
const RESTART_DELAY_SECONDS: u64 = 1;

/// Snapshot/watch bookmarks for one stream. Versions are opaque resume
/// tokens, never compared numerically.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamMetadata {
    pub timestamp: StreamTimestamps,
    pub version: StreamVersions,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamTimestamps {
    pub snapshot: Option<DateTime<Utc>>,
    pub watch: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamVersions {
    pub snapshot: Option<String>,
    pub watch: Option<String>,
}

impl StreamMetadata {
    fn record_snapshot(&mut self, version: &str) {
        self.timestamp.snapshot = Some(Utc::now());
        self.timestamp.watch = None;
        self.version.snapshot = Some(version.to_string());
        self.version.watch = None;
    }

    fn record_watch(&mut self, version: Option<String>) {
        self.timestamp.watch = Some(Utc::now());
        if version.is_some() {
            self.version.watch = version;
        }
    }
}

/// In-memory mirror of the cluster objects this scheduler owns, maintained
/// by the two watch workers. Maps are replaced wholesale at snapshot time
/// and updated in place per watch event; readers clone under a short read
/// lock and never block on the apiserver.
#[derive(Default)]
pub struct WatchState {
    services: RwLock<HashMap<String, Service>>,
    pods: RwLock<HashMap<String, HashMap<String, Pod>>>,
    replicasets_metadata: RwLock<StreamMetadata>,
    pods_metadata: RwLock<StreamMetadata>,
}

impl WatchState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        self.services
            .read()
            .map_or_else(|_| Vec::new(), |map| map.values().cloned().collect())
    }

    #[must_use]
    pub fn service(&self, service_id: &str) -> Option<Service> {
        self.services
            .read()
            .ok()
            .and_then(|map| map.get(service_id).cloned())
    }

    #[must_use]
    pub fn pods_for(&self, service_id: &str) -> Vec<Pod> {
        self.pods.read().map_or_else(
            |_| Vec::new(),
            |map| {
                map.get(service_id)
                    .map(|pods| pods.values().cloned().collect())
                    .unwrap_or_default()
            },
        )
    }

    #[must_use]
    pub fn pods_by_service(&self) -> HashMap<String, Vec<Pod>> {
        self.pods.read().map_or_else(
            |_| HashMap::new(),
            |map| {
                map.iter()
                    .map(|(id, pods)| (id.clone(), pods.values().cloned().collect()))
                    .collect()
            },
        )
    }

    pub fn replace_services(&self, services: HashMap<String, Service>, version: &str) {
        if let Ok(mut map) = self.services.write() {
            *map = services;
        }
        if let Ok(mut metadata) = self.replicasets_metadata.write() {
            metadata.record_snapshot(version);
        }
    }

    pub fn upsert_service(&self, service: Service) {
        if let Ok(mut map) = self.services.write() {
            map.insert(service.id.clone(), service);
        }
    }

    pub fn remove_service(&self, service_id: &str) {
        if let Ok(mut map) = self.services.write() {
            map.remove(service_id);
        }
    }

    pub fn record_replicasets_watch(&self, version: Option<String>) {
        if let Ok(mut metadata) = self.replicasets_metadata.write() {
            metadata.record_watch(version);
        }
    }

    pub fn replace_pods(&self, pods: HashMap<String, HashMap<String, Pod>>, version: &str) {
        if let Ok(mut map) = self.pods.write() {
            *map = pods;
        }
        if let Ok(mut metadata) = self.pods_metadata.write() {
            metadata.record_snapshot(version);
        }
    }

    pub fn upsert_pod(&self, service_id: &str, pod_name: &str, pod: Pod) {
        if let Ok(mut map) = self.pods.write() {
            map.entry(service_id.to_string())
                .or_default()
                .insert(pod_name.to_string(), pod);
        }
    }

    pub fn remove_pod(&self, service_id: &str, pod_name: &str) {
        if let Ok(mut map) = self.pods.write() {
            if let Some(pods) = map.get_mut(service_id) {
                pods.remove(pod_name);
                if pods.is_empty() {
                    map.remove(service_id);
                }
            }
        }
    }

    pub fn record_pods_watch(&self, version: Option<String>) {
        if let Ok(mut metadata) = self.pods_metadata.write() {
            metadata.record_watch(version);
        }
    }

    #[must_use]
    pub fn state(&self) -> serde_json::Value {
        let services = self.services();
        let pods: HashMap<String, Vec<String>> = self.pods.read().map_or_else(
            |_| HashMap::new(),
            |map| {
                map.iter()
                    .map(|(id, pods)| (id.clone(), pods.keys().cloned().collect()))
                    .collect()
            },
        );
        let rs_metadata = self
            .replicasets_metadata
            .read()
            .map_or_else(|_| StreamMetadata::default(), |metadata| metadata.clone());
        let pods_metadata = self
            .pods_metadata
            .read()
            .map_or_else(|_| StreamMetadata::default(), |metadata| metadata.clone());
        serde_json::json!({
            "service-id->service": services
                .iter()
                .map(|service| (service.id.clone(), service))
                .collect::<HashMap<_, _>>(),
            "service-id->pod-names": pods,
            "replicasets-metadata": rs_metadata,
            "pods-metadata": pods_metadata,
        })
    }
}

fn ownership_selector(config: &KubernetesConfig) -> String {
    format!("{MANAGED_BY_LABEL}={}", config.orchestrator_name)
}

/// Snapshot + stream cycle for the ReplicaSets watcher. Returning `Ok` means
/// the stream ended cleanly and the caller re-snapshots; any error also
/// sends the caller back to the snapshot step.
async fn replicasets_cycle(
    clients: &ClientManager,
    config: &KubernetesConfig,
    state: &WatchState,
) -> Result<()> {
    let client = clients.get().await?;
    let api: Api<ReplicaSet> = Api::all(client);
    let selector = ownership_selector(config);

    let list = api.list(&ListParams::default().labels(&selector)).await?;
    let version = list.metadata.resource_version.clone().unwrap_or_default();
    let mut services = HashMap::new();
    for rs in &list.items {
        match convert::replicaset_to_service(rs) {
            Ok(service) => {
                services.insert(service.id.clone(), service);
            }
            Err(err) => debug!("skipping replicaset in snapshot: {err}"),
        }
    }
    info!(
        services = services.len(),
        version = %version,
        "replicasets snapshot applied"
    );
    state.replace_services(services, &version);

    let wp = WatchParams::default()
        .labels(&selector)
        .timeout(WATCH_TIMEOUT_SECONDS);
    let stream = api.watch(&wp, &version).await?;
    pin_mut!(stream);
    while let Some(event) = stream.try_next().await.map_err(SchedulerError::from)? {
        match event {
            WatchEvent::Added(rs) | WatchEvent::Modified(rs) => {
                let version = rs.metadata.resource_version.clone();
                match convert::replicaset_to_service(&rs) {
                    Ok(service) => state.upsert_service(service),
                    Err(err) => debug!("skipping replicaset event: {err}"),
                }
                state.record_replicasets_watch(version);
            }
            WatchEvent::Deleted(rs) => {
                if let Some(service_id) = convert::replicaset_service_id(&rs) {
                    state.remove_service(service_id);
                }
                state.record_replicasets_watch(rs.metadata.resource_version.clone());
            }
            WatchEvent::Bookmark(bookmark) => {
                state.record_replicasets_watch(Some(bookmark.metadata.resource_version));
            }
            WatchEvent::Error(err) => return Err(kube::Error::Api(err).into()),
        }
    }
    Ok(())
}

/// Snapshot + stream cycle for the Pods watcher. Every observed pod also
/// feeds the failure store with its previous incarnation, if any.
async fn pods_cycle(
    clients: &ClientManager,
    config: &KubernetesConfig,
    state: &WatchState,
    failures: &FailureStore,
) -> Result<()> {
    let client = clients.get().await?;
    let api: Api<Pod> = Api::all(client);
    let selector = ownership_selector(config);

    let list = api.list(&ListParams::default().labels(&selector)).await?;
    let version = list.metadata.resource_version.clone().unwrap_or_default();
    let mut pods: HashMap<String, HashMap<String, Pod>> = HashMap::new();
    for pod in list.items {
        let Some(service_id) = convert::pod_service_id(&pod).map(str::to_string) else {
            debug!(
                "skipping unannotated pod {}",
                pod.metadata.name.as_deref().unwrap_or("<unnamed>")
            );
            continue;
        };
        let Some(pod_name) = pod.metadata.name.clone() else {
            continue;
        };
        observe_pod_failure(config, failures, &pod);
        pods.entry(service_id).or_default().insert(pod_name, pod);
    }
    info!(
        services = pods.len(),
        version = %version,
        "pods snapshot applied"
    );
    state.replace_pods(pods, &version);

    let wp = WatchParams::default()
        .labels(&selector)
        .timeout(WATCH_TIMEOUT_SECONDS);
    let stream = api.watch(&wp, &version).await?;
    pin_mut!(stream);
    while let Some(event) = stream.try_next().await.map_err(SchedulerError::from)? {
        match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                let version = pod.metadata.resource_version.clone();
                if let (Some(service_id), Some(pod_name)) = (
                    convert::pod_service_id(&pod).map(str::to_string),
                    pod.metadata.name.clone(),
                ) {
                    observe_pod_failure(config, failures, &pod);
                    state.upsert_pod(&service_id, &pod_name, pod);
                }
                state.record_pods_watch(version);
            }
            WatchEvent::Deleted(pod) => {
                if let (Some(service_id), Some(pod_name)) =
                    (convert::pod_service_id(&pod), pod.metadata.name.as_deref())
                {
                    state.remove_pod(service_id, pod_name);
                }
                state.record_pods_watch(pod.metadata.resource_version.clone());
            }
            WatchEvent::Bookmark(bookmark) => {
                state.record_pods_watch(Some(bookmark.metadata.resource_version));
            }
            WatchEvent::Error(err) => return Err(kube::Error::Api(err).into()),
        }
    }
    Ok(())
}

fn observe_pod_failure(config: &KubernetesConfig, failures: &FailureStore, pod: &Pod) {
    if !convert::pod_live(pod) {
        return;
    }
    if let Some(failed) = convert::terminated_incarnation(config, pod) {
        failures.record(failed);
    }
}

/// Restart discipline shared by both watchers: re-snapshot forever, backing
/// off exponentially on consecutive failures; exhausting the restart budget
/// terminates the process when so configured.
async fn run_watcher<F, Fut>(resource: &'static str, config: Arc<KubernetesConfig>, cycle: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!("starting {resource} watcher");
    let mut backoff_seconds = INITIAL_BACKOFF_SECONDS;
    let mut restart_count: u32 = 0;
    loop {
        match cycle().await {
            Ok(()) => {
                debug!("{resource} watch stream ended, resuming from snapshot");
                backoff_seconds = INITIAL_BACKOFF_SECONDS;
                restart_count = 0;
            }
            Err(err) => {
                restart_count += 1;
                error!(
                    "{resource} watcher failed (attempt {restart_count}/{}): {err}, \
                     restarting in {backoff_seconds}s",
                    config.max_watch_restarts
                );
                if restart_count >= config.max_watch_restarts {
                    if config.exit_on_error {
                        error!("{resource} watcher exhausted restarts, terminating process");
                        std::process::exit(1);
                    }
                    error!("{resource} watcher exhausted restarts, stopping");
                    return;
                }
                sleep(Duration::from_secs(backoff_seconds)).await;
                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
            }
        }
        sleep(Duration::from_secs(RESTART_DELAY_SECONDS)).await;
    }
}

pub fn spawn_replicasets_watcher(
    clients: Arc<ClientManager>,
    config: Arc<KubernetesConfig>,
    state: Arc<WatchState>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let cycle_config = config.clone();
        run_watcher("replicasets", config, move || {
            let clients = clients.clone();
            let config = cycle_config.clone();
            let state = state.clone();
            async move { replicasets_cycle(&clients, &config, &state).await }
        })
        .await;
    })
}

pub fn spawn_pods_watcher(
    clients: Arc<ClientManager>,
    config: Arc<KubernetesConfig>,
    state: Arc<WatchState>,
    failures: Arc<FailureStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let cycle_config = config.clone();
        run_watcher("pods", config, move || {
            let clients = clients.clone();
            let config = cycle_config.clone();
            let state = state.clone();
            let failures = failures.clone();
            async move { pods_cycle(&clients, &config, &state, &failures).await }
        })
        .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStats;
    use serde_json::json;

    fn service(id: &str, instances: i32) -> Service {
        Service {
            id: id.to_string(),
            instances,
            task_count: instances,
            task_stats: TaskStats::default(),
            app_name: format!("{id}-app"),
            namespace: "testuser".to_string(),
        }
    }

    fn pod(service_id: &str, pod_name: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {
                "name": pod_name,
                "namespace": "testuser",
                "annotations": {"waiter/service-id": service_id}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_snapshot_replaces_wholesale() {
        let state = WatchState::new();
        state.upsert_service(service("svc-old", 1));
        state.replace_services(
            HashMap::from([("svc-new".to_string(), service("svc-new", 2))]),
            "100",
        );
        assert!(state.service("svc-old").is_none());
        assert_eq!(state.service("svc-new").unwrap().instances, 2);
    }

    #[test]
    fn test_watch_events_update_in_place() {
        let state = WatchState::new();
        state.replace_services(HashMap::new(), "100");
        state.upsert_service(service("svc-a", 1));
        state.upsert_service(service("svc-a", 3));
        assert_eq!(state.service("svc-a").unwrap().instances, 3);
        state.remove_service("svc-a");
        assert!(state.services().is_empty());
    }

    #[test]
    fn test_pod_bookkeeping() {
        let state = WatchState::new();
        state.upsert_pod("svc-a", "pod-1", pod("svc-a", "pod-1"));
        state.upsert_pod("svc-a", "pod-2", pod("svc-a", "pod-2"));
        assert_eq!(state.pods_for("svc-a").len(), 2);
        state.remove_pod("svc-a", "pod-1");
        assert_eq!(state.pods_for("svc-a").len(), 1);
        state.remove_pod("svc-a", "pod-2");
        assert!(state.pods_by_service().is_empty());
    }

    #[test]
    fn test_stream_metadata_snapshot_then_watch() {
        let state = WatchState::new();
        state.replace_services(HashMap::new(), "41");
        state.record_replicasets_watch(Some("42".to_string()));
        let json = state.state();
        let metadata = &json["replicasets-metadata"];
        assert_eq!(metadata["version"]["snapshot"], json!("41"));
        assert_eq!(metadata["version"]["watch"], json!("42"));
        assert!(metadata["timestamp"]["snapshot"].is_string());
        assert!(metadata["timestamp"]["watch"].is_string());
    }

    #[test]
    fn test_watch_version_survives_versionless_events() {
        let state = WatchState::new();
        state.replace_pods(HashMap::new(), "7");
        state.record_pods_watch(Some("8".to_string()));
        state.record_pods_watch(None);
        let json = state.state();
        assert_eq!(json["pods-metadata"]["version"]["watch"], json!("8"));
    }
}
