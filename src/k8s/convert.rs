use crate::config::KubernetesConfig;
use crate::error::{Result, SchedulerError};
use crate::model::{FailedInstance, InstanceFlag, Service, ServiceInstance, TaskStats, instance_id};
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use std::collections::BTreeSet;

pub const SERVICE_ID_ANNOTATION: &str = "waiter/service-id";
pub const PROTOCOL_ANNOTATION: &str = "waiter/protocol";
pub const PORT_COUNT_ANNOTATION: &str = "waiter/port-count";
pub const APP_LABEL: &str = "app";
pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const PRIMARY_CONTAINER: &str = "waiter-app";
pub const FILESERVER_CONTAINER: &str = "waiter-fileserver";

/// Exit code 137 with reason `Error` means the kubelet killed the container
/// after a failed liveness probe; the code carries no signal then.
const SIGKILL_EXIT_CODE: i32 = 137;

pub fn replicaset_service_id(rs: &ReplicaSet) -> Option<&str> {
    rs.metadata
        .annotations
        .as_ref()?
        .get(SERVICE_ID_ANNOTATION)
        .map(String::as_str)
}

pub fn pod_service_id(pod: &Pod) -> Option<&str> {
    pod.metadata
        .annotations
        .as_ref()?
        .get(SERVICE_ID_ANNOTATION)
        .map(String::as_str)
}

/// A pod counts as live once it is addressable and not yet condemned.
#[must_use]
pub fn pod_live(pod: &Pod) -> bool {
    let has_ip = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.as_ref())
        .is_some_and(|ip| !ip.is_empty());
    has_ip && pod.metadata.deletion_timestamp.is_none()
}

/// Container status of the primary app container. Selected by name so a
/// fileserver sidecar cannot shift the read; index 0 is the fallback for
/// pods predating named lookup.
#[must_use]
pub fn primary_container_status(pod: &Pod) -> Option<&ContainerStatus> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses
        .iter()
        .find(|cs| cs.name == PRIMARY_CONTAINER)
        .or_else(|| statuses.first())
}

/// Convert a watched ReplicaSet into the uniform Service view.
///
/// `staged` counts pods the controller has created but not yet made
/// available; `unavailableReplicas` is not modeled on ReplicaSet status and
/// contributes zero. Transiently inconsistent status windows clamp to zero
/// rather than error.
pub fn replicaset_to_service(rs: &ReplicaSet) -> Result<Service> {
    let service_id = replicaset_service_id(rs).ok_or_else(|| {
        SchedulerError::Malformed(format!(
            "replicaset {} lacks the {SERVICE_ID_ANNOTATION} annotation",
            rs.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })?;
    let app_name = rs
        .metadata
        .name
        .clone()
        .ok_or_else(|| SchedulerError::Malformed("replicaset has no name".to_string()))?;

    let requested = rs
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(0)
        .max(0);
    let status = rs.status.as_ref();
    let replicas = status.map_or(0, |s| s.replicas).max(0);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0).max(0);
    let available = status.and_then(|s| s.available_replicas).unwrap_or(0).max(0);

    let staged = (replicas - available).max(0);
    let task_stats = TaskStats {
        healthy: ready,
        unhealthy: (replicas - ready - staged).max(0),
        running: replicas - staged,
        staged,
    };

    Ok(Service {
        id: service_id.to_string(),
        instances: requested,
        task_count: replicas,
        task_stats,
        app_name,
        namespace: rs.metadata.namespace.clone().unwrap_or_default(),
    })
}

/// Convert a watched pod into the current instance incarnation.
pub fn pod_to_instance(config: &KubernetesConfig, pod: &Pod) -> Result<ServiceInstance> {
    let service_id = pod_service_id(pod).ok_or_else(|| {
        SchedulerError::Malformed(format!(
            "pod {} lacks the {SERVICE_ID_ANNOTATION} annotation",
            pod.metadata.name.as_deref().unwrap_or("<unnamed>")
        ))
    })?;
    let pod_name = pod
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| SchedulerError::Malformed("pod has no name".to_string()))?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();

    let primary = primary_container_status(pod);
    let restart_count = primary.map_or(0, |cs| cs.restart_count);
    let healthy = primary.is_some_and(|cs| cs.ready);

    let annotations = pod.metadata.annotations.as_ref();
    let protocol = annotations
        .and_then(|a| a.get(PROTOCOL_ANNOTATION))
        .cloned()
        .unwrap_or_else(|| "http".to_string());
    let port_count = annotations
        .and_then(|a| a.get(PORT_COUNT_ANNOTATION))
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(1)
        .max(1);

    let port = primary_container_port(pod);
    let extra_ports = (1..port_count).map(|i| port + i).collect();

    let host = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .unwrap_or_default();
    let started_at = pod
        .status
        .as_ref()
        .and_then(|status| status.start_time.as_ref())
        .map(|time| time.0);

    let app_name = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(APP_LABEL))
        .cloned()
        .unwrap_or_default();

    Ok(ServiceInstance {
        id: instance_id(service_id, pod_name, restart_count),
        service_id: service_id.to_string(),
        host,
        port,
        extra_ports,
        protocol,
        started_at,
        healthy,
        log_directory: log_directory(config, &namespace, restart_count),
        restart_count,
        flags: BTreeSet::new(),
        exit_code: None,
        app_name,
        namespace,
    })
}

/// Extract the previous incarnation from a pod whose primary container has
/// been restarted. Keyed on `restart-count − 1`, so repeated observations
/// of the same pod state derive the same instance id.
#[must_use]
pub fn terminated_incarnation(config: &KubernetesConfig, pod: &Pod) -> Option<FailedInstance> {
    let primary = primary_container_status(pod)?;
    let terminated = primary.last_state.as_ref()?.terminated.as_ref()?;
    let prior_restart = primary.restart_count - 1;
    if prior_restart < 0 {
        return None;
    }

    let mut failed = pod_to_instance(config, pod).ok()?;
    let pod_name = pod.metadata.name.as_deref()?;

    let reason = terminated.reason.as_deref().unwrap_or_default();
    let killed_by_probe = terminated.exit_code == SIGKILL_EXIT_CODE && reason == "Error";

    failed.id = instance_id(&failed.service_id, pod_name, prior_restart);
    failed.restart_count = prior_restart;
    failed.healthy = false;
    failed.started_at = terminated.started_at.as_ref().map(|time| time.0);
    failed.log_directory = log_directory(config, &failed.namespace, prior_restart);
    failed.exit_code = (!killed_by_probe).then_some(terminated.exit_code);
    failed.flags = if reason == "OOMKilled" {
        BTreeSet::from([InstanceFlag::MemoryLimitExceeded])
    } else {
        BTreeSet::new()
    };
    Some(failed)
}

fn primary_container_port(pod: &Pod) -> i32 {
    let containers = pod.spec.as_ref().map(|spec| &spec.containers);
    containers
        .and_then(|containers| {
            containers
                .iter()
                .find(|c| c.name == PRIMARY_CONTAINER)
                .or_else(|| containers.first())
        })
        .and_then(|container| container.ports.as_ref())
        .and_then(|ports| ports.first())
        .map_or(0, |port| port.container_port)
}

/// The init process rotates sandbox logs into `r<restart>` subdirectories
/// of the user home; namespace doubles as the run-as-user.
fn log_directory(config: &KubernetesConfig, namespace: &str, restart_count: i32) -> String {
    format!(
        "{}/{namespace}/r{restart_count}",
        config.pod_working_dir_prefix
    )
}
