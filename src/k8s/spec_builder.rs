use crate::config::KubernetesConfig;
use crate::error::{Result, SchedulerError};
use crate::k8s::convert::{
    APP_LABEL, FILESERVER_CONTAINER, MANAGED_BY_LABEL, PORT_COUNT_ANNOTATION, PRIMARY_CONTAINER,
    PROTOCOL_ANNOTATION, SERVICE_ID_ANNOTATION,
};
use crate::k8s::names;
use crate::scheduler::ServiceDescription;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const USER_HOME_VOLUME: &str = "user-home";

/// Produces the workload template for a service. The default builder covers
/// stock Waiter deployments; patched controllers substitute their own.
pub trait SpecBuilder: Send + Sync {
    fn build(
        &self,
        config: &KubernetesConfig,
        service_id: &str,
        descriptor: &ServiceDescription,
        password: &str,
    ) -> Result<ReplicaSet>;
}

pub struct DefaultSpecBuilder;

/// Primary port for a service: spread across 100 slots of 10 ports above
/// the base port, pseudo-random but stable across restarts.
#[must_use]
pub fn base_port(config: &KubernetesConfig, service_id: &str) -> i32 {
    let digest = Sha256::digest(service_id.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    config.pod_base_port + (hash % 100) as i32 * 10
}

fn format_cpus(cpus: f64) -> String {
    if cpus.fract() == 0.0 {
        format!("{}", cpus as i64)
    } else {
        format!("{cpus}")
    }
}

fn env_var(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn health_probe(
    descriptor: &ServiceDescription,
    port: i32,
    failure_threshold: i32,
) -> Probe {
    let scheme = if descriptor.backend_proto.starts_with("https") {
        "HTTPS"
    } else {
        "HTTP"
    };
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(descriptor.health_check_url.clone()),
            port: IntOrString::Int(port),
            scheme: Some(scheme.to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(descriptor.grace_period_secs),
        period_seconds: Some(descriptor.health_check_interval_secs),
        failure_threshold: Some(failure_threshold),
        timeout_seconds: Some(1),
        ..Default::default()
    }
}

impl SpecBuilder for DefaultSpecBuilder {
    fn build(
        &self,
        config: &KubernetesConfig,
        service_id: &str,
        descriptor: &ServiceDescription,
        password: &str,
    ) -> Result<ReplicaSet> {
        if descriptor.cmd.is_empty() {
            return Err(SchedulerError::Malformed(format!(
                "service {service_id} has an empty command"
            )));
        }
        if descriptor.run_as_user.is_empty() {
            return Err(SchedulerError::Malformed(format!(
                "service {service_id} has no run-as-user"
            )));
        }

        let app_name = names::app_name(config, service_id);
        let run_as_user = &descriptor.run_as_user;
        let home = format!("{}/{run_as_user}", config.pod_working_dir_prefix);
        let port0 = base_port(config, service_id);
        let port_count = descriptor.ports.max(1);

        let labels = BTreeMap::from([
            (APP_LABEL.to_string(), app_name.clone()),
            (
                MANAGED_BY_LABEL.to_string(),
                config.orchestrator_name.clone(),
            ),
        ]);
        let annotations = BTreeMap::from([
            (SERVICE_ID_ANNOTATION.to_string(), service_id.to_string()),
            (
                PROTOCOL_ANNOTATION.to_string(),
                descriptor.backend_proto.clone(),
            ),
            (PORT_COUNT_ANNOTATION.to_string(), port_count.to_string()),
        ]);

        // User env first, then the Waiter-owned names override.
        let mut env: Vec<EnvVar> = descriptor
            .env
            .iter()
            .map(|(name, value)| env_var(name, value.clone()))
            .collect();
        env.extend([
            env_var("HOME", home.clone()),
            env_var("LOGNAME", run_as_user.clone()),
            env_var("USER", run_as_user.clone()),
            env_var("WAITER_CPUS", format_cpus(descriptor.cpus)),
            env_var("WAITER_MEM_MB", descriptor.mem.to_string()),
            env_var("WAITER_PASSWORD", password),
            env_var("WAITER_SERVICE_ID", service_id),
            env_var("WAITER_USERNAME", run_as_user.clone()),
            // Legacy sandbox names some clients still read.
            env_var("MESOS_DIRECTORY", home.clone()),
            env_var("MESOS_SANDBOX", home.clone()),
        ]);
        for i in 0..port_count {
            env.push(env_var(&format!("PORT{i}"), (port0 + i).to_string()));
        }

        let mut command = config.replicaset_spec_builder.container_init_commands.clone();
        command.push(descriptor.cmd.clone());

        let resources = {
            let quantities = BTreeMap::from([
                ("cpu".to_string(), Quantity(format_cpus(descriptor.cpus))),
                ("memory".to_string(), Quantity(format!("{}Mi", descriptor.mem))),
            ]);
            ResourceRequirements {
                limits: Some(quantities.clone()),
                requests: Some(quantities),
                ..Default::default()
            }
        };

        let home_mount = VolumeMount {
            name: USER_HOME_VOLUME.to_string(),
            mount_path: home.clone(),
            ..Default::default()
        };

        let mut containers = vec![Container {
            name: PRIMARY_CONTAINER.to_string(),
            image: Some(config.replicaset_spec_builder.default_container_image.clone()),
            command: Some(command),
            env: Some(env),
            ports: Some(
                (0..port_count)
                    .map(|i| ContainerPort {
                        container_port: port0 + i,
                        ..Default::default()
                    })
                    .collect(),
            ),
            liveness_probe: Some(health_probe(
                descriptor,
                port0,
                descriptor.health_check_max_consecutive_failures,
            )),
            readiness_probe: Some(health_probe(descriptor, port0, 1)),
            resources: Some(resources),
            volume_mounts: Some(vec![home_mount.clone()]),
            working_dir: Some(home.clone()),
            ..Default::default()
        }];

        if let (Some(port), Some(image)) = (config.fileserver.port, &config.fileserver.image) {
            containers.push(Container {
                name: FILESERVER_CONTAINER.to_string(),
                image: Some(image.clone()),
                env: Some(vec![
                    env_var("WAITER_FILESERVER_PORT", port.to_string()),
                    env_var("WAITER_SANDBOX", home.clone()),
                ]),
                ports: Some(vec![ContainerPort {
                    container_port: port,
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![home_mount]),
                ..Default::default()
            });
        }

        Ok(ReplicaSet {
            metadata: ObjectMeta {
                name: Some(app_name.clone()),
                namespace: Some(run_as_user.clone()),
                labels: Some(labels.clone()),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            spec: Some(ReplicaSetSpec {
                replicas: Some(descriptor.min_instances),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        APP_LABEL.to_string(),
                        app_name,
                    )])),
                    ..Default::default()
                },
                template: Some(PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers,
                        volumes: Some(vec![Volume {
                            name: USER_HOME_VOLUME.to_string(),
                            empty_dir: Some(Default::default()),
                            ..Default::default()
                        }]),
                        // The safe-kill protocol manages its own grace.
                        termination_grace_period_seconds: Some(0),
                        ..Default::default()
                    }),
                }),
                ..Default::default()
            }),
            status: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE_ID: &str = "waiter-myapp-e8b625cc83c411e8974c38d5474b213d";

    fn descriptor() -> ServiceDescription {
        ServiceDescription {
            cmd: "./run-service".to_string(),
            run_as_user: "testuser".to_string(),
            cpus: 0.5,
            mem: 512,
            ports: 2,
            min_instances: 3,
            ..Default::default()
        }
    }

    fn build(config: &KubernetesConfig) -> ReplicaSet {
        DefaultSpecBuilder
            .build(config, SERVICE_ID, &descriptor(), "open-sesame")
            .unwrap()
    }

    fn primary(rs: &ReplicaSet) -> &Container {
        rs.spec
            .as_ref()
            .unwrap()
            .template
            .as_ref()
            .unwrap()
            .spec
            .as_ref()
            .unwrap()
            .containers
            .iter()
            .find(|c| c.name == PRIMARY_CONTAINER)
            .unwrap()
    }

    #[test]
    fn test_metadata_and_replicas() {
        let config = KubernetesConfig::default();
        let rs = build(&config);
        let metadata = &rs.metadata;
        assert_eq!(metadata.namespace.as_deref(), Some("testuser"));
        let annotations = metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[SERVICE_ID_ANNOTATION], SERVICE_ID);
        assert_eq!(annotations[PORT_COUNT_ANNOTATION], "2");
        let labels = metadata.labels.as_ref().unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], "waiter");
        assert_eq!(rs.spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn test_base_port_is_stable_and_in_range() {
        let config = KubernetesConfig::default();
        let port = base_port(&config, SERVICE_ID);
        assert_eq!(port, base_port(&config, SERVICE_ID));
        assert!(port >= config.pod_base_port);
        assert!(port < config.pod_base_port + 1000);
        assert_eq!(port % 10, 0);
    }

    #[test]
    fn test_port_env_and_container_ports() {
        let config = KubernetesConfig::default();
        let rs = build(&config);
        let container = primary(&rs);
        let port0 = base_port(&config, SERVICE_ID);
        let env = container.env.as_ref().unwrap();
        let lookup = |name: &str| {
            env.iter()
                .find(|var| var.name == name)
                .and_then(|var| var.value.clone())
        };
        assert_eq!(lookup("PORT0"), Some(port0.to_string()));
        assert_eq!(lookup("PORT1"), Some((port0 + 1).to_string()));
        assert_eq!(lookup("MESOS_SANDBOX"), Some("/home/testuser".to_string()));
        assert_eq!(lookup("WAITER_PASSWORD"), Some("open-sesame".to_string()));
        let ports = container.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].container_port, port0);
    }

    #[test]
    fn test_probes() {
        let config = KubernetesConfig::default();
        let rs = build(&config);
        let container = primary(&rs);
        let liveness = container.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.failure_threshold, Some(5));
        assert_eq!(liveness.period_seconds, Some(10));
        assert_eq!(liveness.initial_delay_seconds, Some(30));
        assert_eq!(liveness.timeout_seconds, Some(1));
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.failure_threshold, Some(1));
        let get = liveness.http_get.as_ref().unwrap();
        assert_eq!(get.path.as_deref(), Some("/status"));
        assert_eq!(get.scheme.as_deref(), Some("HTTP"));
    }

    #[test]
    fn test_command_prefix() {
        let config = KubernetesConfig::default();
        let rs = build(&config);
        assert_eq!(
            primary(&rs).command.as_ref().unwrap(),
            &vec!["/usr/bin/waiter-init".to_string(), "./run-service".to_string()]
        );
    }

    #[test]
    fn test_fileserver_sidecar_requires_port_and_image() {
        let mut config = KubernetesConfig::default();
        let containers = |rs: &ReplicaSet| {
            rs.spec
                .as_ref()
                .unwrap()
                .template
                .as_ref()
                .unwrap()
                .spec
                .as_ref()
                .unwrap()
                .containers
                .len()
        };
        assert_eq!(containers(&build(&config)), 1);

        config.fileserver.port = Some(591);
        assert_eq!(containers(&build(&config)), 1);

        config.fileserver.image = Some("waiter/fileserver:latest".to_string());
        assert_eq!(containers(&build(&config)), 2);
    }

    #[test]
    fn test_resources_mirror_descriptor() {
        let config = KubernetesConfig::default();
        let rs = build(&config);
        let resources = primary(&rs).resources.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(limits["cpu"].0, "0.5");
        assert_eq!(limits["memory"].0, "512Mi");
        assert_eq!(resources.requests, resources.limits);
    }

    #[test]
    fn test_rejects_incomplete_descriptors() {
        let config = KubernetesConfig::default();
        let mut bad = descriptor();
        bad.cmd = String::new();
        assert!(
            DefaultSpecBuilder
                .build(&config, SERVICE_ID, &bad, "pw")
                .is_err()
        );
    }
}
