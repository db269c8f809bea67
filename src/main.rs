use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use waiter_scheduler::config::KubernetesConfig;
use waiter_scheduler::k8s::client::ClientManager;
use waiter_scheduler::scheduler::{
    Authorizer, DescriptorLookup, PasswordSource, ServiceDescription, make_authorizer,
};
use waiter_scheduler::{KubernetesScheduler, SchedulerSyncer, ServiceScheduler};

/// Run the scheduler core standalone against a cluster: start the watch
/// workers and the syncer, and log every published snapshot. A diagnostic
/// aid for operators; the router and autoscaler embed the library instead.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the scheduler configuration (JSON)
    #[arg(short, long)]
    config: Option<String>,
    /// Path to a service-id → service-description JSON map
    #[arg(short, long)]
    descriptors: Option<String>,
}

struct FileDescriptors {
    map: HashMap<String, ServiceDescription>,
}

impl DescriptorLookup for FileDescriptors {
    fn lookup(&self, service_id: &str) -> Option<ServiceDescription> {
        self.map.get(service_id).cloned()
    }
}

/// Standalone runs have no password-derivation service behind them.
struct NoPasswords;

impl PasswordSource for NoPasswords {
    fn password_for(&self, _service_id: &str) -> String {
        String::new()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let config: KubernetesConfig = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => KubernetesConfig::default(),
    };
    let descriptors: HashMap<String, ServiceDescription> = match &args.descriptors {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => HashMap::new(),
    };
    if config.authentication.refresh_delay_mins.is_some() {
        warn!("standalone runs have no token source, ignoring authentication settings");
    }

    let clients = Arc::new(ClientManager::new(config.clone(), None));
    let authorizer: Arc<dyn Authorizer> = Arc::from(make_authorizer(
        config.authorizer.kind,
        std::env::var("USER").unwrap_or_default(),
    ));
    let scheduler = Arc::new(KubernetesScheduler::new(
        config.clone(),
        clients,
        Arc::new(FileDescriptors { map: descriptors }),
        Arc::new(NoPasswords),
        authorizer,
    ));

    let _watchers = scheduler.start_watchers();
    let (syncer, mut snapshots) = SchedulerSyncer::new(
        scheduler.clone(),
        config.scheduler_syncer_interval_secs,
        scheduler.syncer_state(),
    );
    let _syncer = syncer.spawn();
    info!("scheduler core running, ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            Some(snapshot) = snapshots.recv() => {
                let active: usize = snapshot
                    .services
                    .values()
                    .map(|instances| instances.active_instances.len())
                    .sum();
                info!(
                    services = snapshot.services.len(),
                    active_instances = active,
                    "snapshot published at {}",
                    snapshot.timestamp.to_rfc3339()
                );
            }
        }
    }

    let state = scheduler.state().await;
    info!("final state: {state}");
    Ok(())
}
