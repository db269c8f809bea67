use serde::Deserialize;

/// Capacity of the syncer output channel consumed by the router/autoscaler.
pub const SYNCER_CHANNEL_CAPACITY: usize = 32;

/// Server-side watch timeout in seconds. Streams end cleanly at this bound
/// and the watcher resumes from its bookmark.
pub const WATCH_TIMEOUT_SECONDS: u32 = 290;

/// Options for the Kubernetes-backed scheduler. All keys are recognized in
/// kebab-case; unset keys take the defaults below.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KubernetesConfig {
    /// Apiserver base URL. When absent the client infers in-cluster or
    /// kubeconfig settings.
    pub url: Option<String>,
    pub http_options: HttpOptions,
    /// Label value marking workloads owned by this scheduler
    /// (`managed-by=<orchestrator-name>`).
    pub orchestrator_name: String,
    pub pod_base_port: i32,
    /// Length of the random suffix Kubernetes appends to pod names; reserved
    /// out of the app-name budget.
    pub pod_suffix_length: usize,
    pub max_name_length: usize,
    pub max_patch_retries: u32,
    pub replicaset_api_version: String,
    pub replicaset_spec_builder: SpecBuilderConfig,
    pub pod_working_dir_prefix: String,
    pub fileserver: FileserverConfig,
    pub authentication: AuthenticationConfig,
    pub authorizer: AuthorizerConfig,
    pub scheduler_syncer_interval_secs: u64,
    /// Per-service cap on retained failed instance incarnations.
    pub max_failed_instances: usize,
    pub max_watch_restarts: u32,
    /// Terminate the process when a watch worker exhausts its restarts.
    pub exit_on_error: bool,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            url: None,
            http_options: HttpOptions::default(),
            orchestrator_name: "waiter".to_string(),
            pod_base_port: 31000,
            pod_suffix_length: 5,
            max_name_length: 63,
            max_patch_retries: 5,
            replicaset_api_version: "apps/v1".to_string(),
            replicaset_spec_builder: SpecBuilderConfig::default(),
            pod_working_dir_prefix: "/home".to_string(),
            fileserver: FileserverConfig::default(),
            authentication: AuthenticationConfig::default(),
            authorizer: AuthorizerConfig::default(),
            scheduler_syncer_interval_secs: 5,
            max_failed_instances: 64,
            max_watch_restarts: 10,
            exit_on_error: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpOptions {
    /// Connect timeout in milliseconds.
    pub conn_timeout: Option<u64>,
    /// Socket read timeout in milliseconds. Leave unset for watch-friendly
    /// defaults; the server-side watch timeout bounds stream reads.
    pub socket_timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SpecBuilderConfig {
    /// Image run by the primary `waiter-app` container.
    pub default_container_image: String,
    /// Command prefix prepended to the service command.
    pub container_init_commands: Vec<String>,
}

impl Default for SpecBuilderConfig {
    fn default() -> Self {
        Self {
            default_container_image: "waiter/base-image:latest".to_string(),
            container_init_commands: vec!["/usr/bin/waiter-init".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileserverConfig {
    /// Port the per-pod fileserver sidecar listens on. Unset disables both
    /// the sidecar and directory listing.
    pub port: Option<i32>,
    pub scheme: String,
    /// Sidecar image; required (with `port`) to inject the sidecar.
    pub image: Option<String>,
}

impl Default for FileserverConfig {
    fn default() -> Self {
        Self {
            port: None,
            scheme: "http".to_string(),
            image: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthenticationConfig {
    /// Interval between Authorization-token refreshes. Unset disables the
    /// refresh worker; the token cell then keeps whatever was seeded.
    pub refresh_delay_mins: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthorizerConfig {
    pub kind: AuthorizerKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthorizerKind {
    AllowAll,
    #[default]
    RunAsUser,
}

/// Wiring for the composite scheduler: one sub-scheduler per tag, plus the
/// tag used when a service description names none.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompositeConfig {
    pub default_tag: String,
    #[serde(default)]
    pub components: std::collections::HashMap<String, KubernetesConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: KubernetesConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.orchestrator_name, "waiter");
        assert_eq!(config.pod_base_port, 31000);
        assert_eq!(config.pod_suffix_length, 5);
        assert_eq!(config.max_name_length, 63);
        assert_eq!(config.max_patch_retries, 5);
        assert_eq!(config.replicaset_api_version, "apps/v1");
        assert_eq!(config.scheduler_syncer_interval_secs, 5);
        assert!(config.exit_on_error);
        assert!(config.fileserver.port.is_none());
        assert_eq!(config.fileserver.scheme, "http");
    }

    #[test]
    fn test_kebab_case_keys() {
        let config: KubernetesConfig = serde_json::from_str(
            r#"{
                "url": "https://k8s-api.example.com:6443",
                "http-options": {"conn-timeout": 5000, "socket-timeout": 20000},
                "orchestrator-name": "waiter-prod",
                "pod-base-port": 32000,
                "max-name-length": 32,
                "max-patch-retries": 3,
                "fileserver": {"port": 591, "scheme": "https"},
                "authentication": {"refresh-delay-mins": 10},
                "authorizer": {"kind": "allow-all"},
                "scheduler-syncer-interval-secs": 2
            }"#,
        )
        .unwrap();
        assert_eq!(config.url.as_deref(), Some("https://k8s-api.example.com:6443"));
        assert_eq!(config.http_options.conn_timeout, Some(5000));
        assert_eq!(config.orchestrator_name, "waiter-prod");
        assert_eq!(config.pod_base_port, 32000);
        assert_eq!(config.max_name_length, 32);
        assert_eq!(config.fileserver.port, Some(591));
        assert_eq!(config.authentication.refresh_delay_mins, Some(10));
        assert_eq!(config.authorizer.kind, AuthorizerKind::AllowAll);
        assert_eq!(config.scheduler_syncer_interval_secs, 2);
    }
}
