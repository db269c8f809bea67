use crate::config::KubernetesConfig;
use crate::error::{Result, SchedulerError};
use crate::k8s::client::{self, ClientManager};
use crate::k8s::convert;
use crate::k8s::failures::FailureStore;
use crate::k8s::fileserver;
use crate::k8s::spec_builder::{DefaultSpecBuilder, SpecBuilder};
use crate::k8s::watch::{self, WatchState};
use crate::model::{Service, ServiceInstance, ServiceInstances};
use crate::scheduler::{
    Authorizer, DeleteOutcome, DeleteResult, DescriptorLookup, DirectoryEntry, KillOutcome,
    KillResult, PasswordSource, ScaleOutcome, ScaleResult, ServiceDescription, ServiceScheduler,
};
use crate::syncer::SyncerState;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Grace long enough that a victim pod is still terminating when the
/// follow-up scale-down patch lands; the controller then has no reason to
/// pick a second victim.
const KILL_GRACE_PERIOD_SECONDS: u32 = 300;

const PATCH_RETRY_DELAY_MS: u64 = 100;

/// Kubernetes-backed scheduler: services are ReplicaSets, instances are
/// pods, and all reads come from the local watch mirror.
pub struct KubernetesScheduler {
    config: Arc<KubernetesConfig>,
    clients: Arc<ClientManager>,
    watch_state: Arc<WatchState>,
    failures: Arc<FailureStore>,
    descriptors: Arc<dyn DescriptorLookup>,
    passwords: Arc<dyn PasswordSource>,
    authorizer: Arc<dyn Authorizer>,
    spec_builder: Arc<dyn SpecBuilder>,
    syncer_state: Arc<SyncerState>,
    http: reqwest::Client,
}

impl KubernetesScheduler {
    #[must_use]
    pub fn new(
        config: KubernetesConfig,
        clients: Arc<ClientManager>,
        descriptors: Arc<dyn DescriptorLookup>,
        passwords: Arc<dyn PasswordSource>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        if config.replicaset_api_version != "apps/v1" {
            warn!(
                "replicaset-api-version {} is not apps/v1; the typed client speaks apps/v1",
                config.replicaset_api_version
            );
        }
        let max_failed = config.max_failed_instances;
        Self {
            config: Arc::new(config),
            clients,
            watch_state: Arc::new(WatchState::new()),
            failures: Arc::new(FailureStore::new(max_failed)),
            descriptors,
            passwords,
            authorizer,
            spec_builder: Arc::new(DefaultSpecBuilder),
            syncer_state: Arc::new(SyncerState::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Substitute a custom workload-template builder.
    #[must_use]
    pub fn with_spec_builder(mut self, spec_builder: Arc<dyn SpecBuilder>) -> Self {
        self.spec_builder = spec_builder;
        self
    }

    #[must_use]
    pub fn watch_state(&self) -> Arc<WatchState> {
        self.watch_state.clone()
    }

    #[must_use]
    pub fn failure_store(&self) -> Arc<FailureStore> {
        self.failures.clone()
    }

    #[must_use]
    pub fn syncer_state(&self) -> Arc<SyncerState> {
        self.syncer_state.clone()
    }

    /// Start the two watch workers feeding this scheduler's mirror.
    #[must_use]
    pub fn start_watchers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            watch::spawn_replicasets_watcher(
                self.clients.clone(),
                self.config.clone(),
                self.watch_state.clone(),
            ),
            watch::spawn_pods_watcher(
                self.clients.clone(),
                self.config.clone(),
                self.watch_state.clone(),
                self.failures.clone(),
            ),
        ]
    }

    /// Live instances for one service, through the pod liveness filter.
    fn active_instances(&self, service_id: &str) -> Vec<ServiceInstance> {
        self.watch_state
            .pods_for(service_id)
            .iter()
            .filter(|pod| convert::pod_live(pod))
            .filter_map(|pod| match convert::pod_to_instance(&self.config, pod) {
                Ok(instance) => Some(instance),
                Err(err) => {
                    debug!("skipping pod of {service_id}: {err}");
                    None
                }
            })
            .collect()
    }

    async fn delete_pod(&self, namespace: &str, pod_name: &str, grace_seconds: u32) -> Result<()> {
        let client = self.clients.get().await?;
        match delete_pod_once(client, namespace, pod_name, grace_seconds).await {
            Err(err) if client::should_refresh_client(&err) => {
                let client = self.clients.refresh().await?;
                delete_pod_once(client, namespace, pod_name, grace_seconds).await
            }
            other => other,
        }
    }

    async fn patch_replicas(
        &self,
        namespace: &str,
        app_name: &str,
        current: i32,
        target: i32,
    ) -> Result<()> {
        let patch: json_patch::Patch = serde_json::from_value(json!([
            {"op": "test", "path": "/spec/replicas", "value": current},
            {"op": "replace", "path": "/spec/replicas", "value": target},
        ]))?;
        let client = self.clients.get().await?;
        match patch_replicas_once(client, namespace, app_name, &patch).await {
            Err(err) if client::should_refresh_client(&err) => {
                let client = self.clients.refresh().await?;
                patch_replicas_once(client, namespace, app_name, &patch).await
            }
            other => other,
        }
    }

    /// Conflict-retrying scale. Each attempt re-reads the watch mirror and
    /// issues a test-guarded patch, so it linearizes against the
    /// orchestrator rather than against concurrent local callers.
    async fn scale_to(
        &self,
        service_id: &str,
        compute_target: impl Fn(i32) -> i32,
        allow_downward: bool,
    ) -> ScaleResult {
        let mut attempts: u32 = 0;
        loop {
            let Some(service) = self.watch_state.service(service_id) else {
                return ScaleResult::new(
                    false,
                    404,
                    ScaleOutcome::NoSuchServiceExists,
                    format!("service {service_id} does not exist"),
                );
            };
            let current = service.instances;
            let target = compute_target(current).max(0);
            if !allow_downward && target <= current {
                return ScaleResult::new(
                    true,
                    200,
                    ScaleOutcome::ScalingNotNeeded,
                    format!("service already has {current} instances"),
                );
            }
            match self
                .patch_replicas(&service.namespace, &service.app_name, current, target)
                .await
            {
                Ok(()) => {
                    let mut scaled = service;
                    scaled.instances = target;
                    self.watch_state.upsert_service(scaled);
                    info!(service_id, current, target, "scaled service");
                    return ScaleResult::new(
                        true,
                        200,
                        ScaleOutcome::Scaled,
                        format!("scaled from {current} to {target}"),
                    );
                }
                Err(err) if err.is_conflict() => {
                    attempts += 1;
                    if attempts >= self.config.max_patch_retries {
                        return ScaleResult::new(
                            false,
                            409,
                            ScaleOutcome::Conflict,
                            format!("scale conflict persisted after {attempts} attempts"),
                        );
                    }
                    debug!(service_id, attempts, "scale patch conflict, re-reading state");
                    sleep(Duration::from_millis(PATCH_RETRY_DELAY_MS)).await;
                }
                Err(err) if err.is_not_found() => {
                    return ScaleResult::new(
                        false,
                        404,
                        ScaleOutcome::NoSuchServiceExists,
                        err.to_string(),
                    );
                }
                Err(err) => {
                    return ScaleResult::new(false, 500, ScaleOutcome::Failed, err.to_string());
                }
            }
        }
    }

    async fn service_exists_inner(
        &self,
        service_id: &str,
        descriptor: Option<&ServiceDescription>,
    ) -> bool {
        if self.watch_state.service(service_id).is_some() {
            return true;
        }
        let descriptor = match descriptor {
            Some(descriptor) => Some(descriptor.clone()),
            None => self.descriptors.lookup(service_id),
        };
        let Some(descriptor) = descriptor else {
            return false;
        };
        if descriptor.run_as_user.is_empty() {
            return false;
        }
        let app_name = crate::k8s::names::app_name(&self.config, service_id);
        let client = match self.clients.get().await {
            Ok(client) => client,
            Err(err) => {
                warn!("service-exists check for {service_id} failed: {err}");
                return false;
            }
        };
        let api: Api<ReplicaSet> = Api::namespaced(client, &descriptor.run_as_user);
        match api.get_opt(&app_name).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!("service-exists check for {service_id} failed: {err}");
                false
            }
        }
    }
}

async fn delete_pod_once(
    client: Client,
    namespace: &str,
    pod_name: &str,
    grace_period_seconds: u32,
) -> Result<()> {
    let params = DeleteParams::default().grace_period(grace_period_seconds);
    let api: Api<Pod> = Api::namespaced(client, namespace);
    api.delete(pod_name, &params)
        .await
        .map(|_| ())
        .map_err(Into::into)
}

async fn patch_replicas_once(
    client: Client,
    namespace: &str,
    app_name: &str,
    patch: &json_patch::Patch,
) -> Result<()> {
    let api: Api<ReplicaSet> = Api::namespaced(client, namespace);
    api.patch(
        app_name,
        &PatchParams::default(),
        &Patch::Json::<()>(patch.clone()),
    )
    .await
    .map(|_| ())
    .map_err(Into::into)
}

#[async_trait]
impl ServiceScheduler for KubernetesScheduler {
    async fn get_services(&self) -> Vec<Service> {
        self.watch_state.services()
    }

    async fn get_service_instances(&self) -> HashMap<String, ServiceInstances> {
        self.watch_state
            .services()
            .into_iter()
            .map(|service| {
                let instances = ServiceInstances {
                    active_instances: self.active_instances(&service.id),
                    failed_instances: self.failures.failed_instances(&service.id),
                };
                (service.id, instances)
            })
            .collect()
    }

    async fn kill_instance(&self, instance: &ServiceInstance) -> KillResult {
        let Some(pod_name) = instance.pod_name().map(str::to_string) else {
            return KillResult::new(
                false,
                500,
                KillOutcome::Failed,
                format!("malformed instance id {}", instance.id),
            );
        };
        let namespace = if instance.namespace.is_empty() {
            match self.watch_state.service(&instance.service_id) {
                Some(service) => service.namespace,
                None => {
                    return KillResult::new(
                        false,
                        404,
                        KillOutcome::NoSuchInstanceExists,
                        format!("service {} is unknown", instance.service_id),
                    );
                }
            }
        } else {
            instance.namespace.clone()
        };

        // Step 1: put the pod into Terminating with a long grace, so the
        // controller will not pick a different victim for the scale-down.
        match self
            .delete_pod(&namespace, &pod_name, KILL_GRACE_PERIOD_SECONDS)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                return KillResult::new(
                    false,
                    404,
                    KillOutcome::NoSuchInstanceExists,
                    format!("pod {pod_name} not found"),
                );
            }
            Err(err) => {
                return KillResult::new(false, err.status(), KillOutcome::Failed, err.to_string());
            }
        }

        // Step 2: shrink the owner by one. Failure here is recoverable; the
        // controller reconciles once the pod finishes terminating.
        let scaled = self
            .scale_to(&instance.service_id, |current| current - 1, true)
            .await;
        if !scaled.success {
            warn!(
                instance_id = %instance.id,
                "scale-down after kill failed: {}",
                scaled.message
            );
        }

        // Step 3: short-circuit the grace period. 404 means the pod is
        // already gone, which is the goal.
        match self.delete_pod(&namespace, &pod_name, 0).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                warn!(instance_id = %instance.id, "hard delete after kill failed: {err}");
            }
        }
        KillResult::new(
            true,
            200,
            KillOutcome::InstanceKilled,
            format!("killed {}", instance.id),
        )
    }

    async fn service_exists(&self, service_id: &str) -> bool {
        self.service_exists_inner(service_id, None).await
    }

    async fn create_service_if_new(
        &self,
        service_id: &str,
        descriptor: &ServiceDescription,
    ) -> Result<Option<Service>> {
        if descriptor.cmd_type == "docker" {
            return Err(SchedulerError::Unsupported(
                "command type docker is not supported on Kubernetes".to_string(),
            ));
        }
        if self.service_exists_inner(service_id, Some(descriptor)).await {
            debug!(service_id, "service already exists, skipping create");
            return Ok(None);
        }

        let password = self.passwords.password_for(service_id);
        let replicaset =
            match self
                .spec_builder
                .build(&self.config, service_id, descriptor, &password)
            {
                Ok(replicaset) => replicaset,
                Err(err) => {
                    warn!(service_id, "cannot build workload spec: {err}");
                    return Ok(None);
                }
            };

        let namespace = descriptor.run_as_user.clone();
        let client = match self.clients.get().await {
            Ok(client) => client,
            Err(err) => {
                warn!(service_id, "create failed getting client: {err}");
                return Ok(None);
            }
        };
        let api: Api<ReplicaSet> = Api::namespaced(client, &namespace);
        match api.create(&PostParams::default(), &replicaset).await {
            Ok(created) => {
                info!(service_id, "created service");
                match convert::replicaset_to_service(&created) {
                    Ok(service) => {
                        self.watch_state.upsert_service(service.clone());
                        Ok(Some(service))
                    }
                    Err(err) => {
                        warn!(service_id, "created service is unreadable: {err}");
                        Ok(None)
                    }
                }
            }
            Err(err) => {
                let err = SchedulerError::from(err);
                if err.is_conflict() {
                    debug!(service_id, "service created concurrently");
                } else {
                    warn!(service_id, "create failed: {err}");
                }
                Ok(None)
            }
        }
    }

    async fn delete_service(&self, service_id: &str) -> DeleteResult {
        let Some(service) = self.watch_state.service(service_id) else {
            return DeleteResult {
                result: DeleteOutcome::NoSuchServiceExists,
                message: format!("service {service_id} does not exist"),
            };
        };
        let params = DeleteParams::background();
        let client = match self.clients.get().await {
            Ok(client) => client,
            Err(err) => {
                return DeleteResult {
                    result: DeleteOutcome::Error,
                    message: err.to_string(),
                };
            }
        };
        let api: Api<ReplicaSet> = Api::namespaced(client, &service.namespace);
        match api.delete(&service.app_name, &params).await {
            Ok(_) => {
                info!(service_id, "deleted service");
                self.watch_state.remove_service(service_id);
                self.failures.remove_service(service_id);
                DeleteResult {
                    result: DeleteOutcome::Deleted,
                    message: format!("deleted {service_id}"),
                }
            }
            Err(err) => {
                let err = SchedulerError::from(err);
                if err.is_not_found() {
                    self.watch_state.remove_service(service_id);
                    self.failures.remove_service(service_id);
                    DeleteResult {
                        result: DeleteOutcome::NoSuchServiceExists,
                        message: format!("service {service_id} does not exist"),
                    }
                } else {
                    DeleteResult {
                        result: DeleteOutcome::Error,
                        message: err.to_string(),
                    }
                }
            }
        }
    }

    async fn scale_service(&self, service_id: &str, target: i32, _force: bool) -> ScaleResult {
        self.scale_to(service_id, |_| target, false).await
    }

    async fn retrieve_directory_content(
        &self,
        _service_id: &str,
        _instance_id: &str,
        host: &str,
        path: &str,
    ) -> Option<Vec<DirectoryEntry>> {
        fileserver::retrieve_directory_content(&self.config.fileserver, &self.http, host, path)
            .await
    }

    async fn service_id_state(&self, service_id: &str) -> serde_json::Value {
        json!({
            "service": self.watch_state.service(service_id),
            "active-instances": self.active_instances(service_id),
            "failed-instances": self.failures.failed_instances(service_id),
        })
    }

    async fn state(&self) -> serde_json::Value {
        json!({
            "watch-state": self.watch_state.state(),
            "failure-store": self.failures.state(),
            "syncer": self.syncer_state.state(),
        })
    }

    async fn validate_service(&self, service_id: &str) -> Result<()> {
        let descriptor = self.descriptors.lookup(service_id).ok_or_else(|| {
            SchedulerError::NotFound(format!("no description for service {service_id}"))
        })?;
        self.authorizer.authorize(&descriptor.run_as_user, service_id)
    }
}
