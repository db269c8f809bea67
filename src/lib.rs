//! Scheduler core for Waiter, an autoscaling HTTP front-end: reifies
//! logical services as Kubernetes ReplicaSets, mirrors cluster state
//! through long-lived watch streams, performs safe scale-down, retains a
//! bounded history of failed instances, and periodically publishes
//! service→instance snapshots for the router and autoscaler.

pub mod composite;
pub mod config;
pub mod error;
pub mod k8s;
pub mod model;
pub mod scheduler;
pub mod syncer;

pub use composite::CompositeScheduler;
pub use error::{Result, SchedulerError};
pub use k8s::scheduler::KubernetesScheduler;
pub use scheduler::ServiceScheduler;
pub use syncer::{SchedulerSyncer, SyncerSnapshot};
