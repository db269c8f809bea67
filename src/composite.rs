use crate::error::{Result, SchedulerError};
use crate::model::{Service, ServiceInstance, ServiceInstances};
use crate::scheduler::{
    DeleteOutcome, DeleteResult, DescriptorLookup, DirectoryEntry, KillOutcome, KillResult,
    ScaleOutcome, ScaleResult, ServiceDescription, ServiceScheduler,
};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Routes every service to one of several sub-schedulers by the
/// description's `scheduler` tag, falling back to the configured default.
/// Holds no state of its own.
pub struct CompositeScheduler {
    components: HashMap<String, Arc<dyn ServiceScheduler>>,
    default_tag: String,
    descriptors: Arc<dyn DescriptorLookup>,
}

impl CompositeScheduler {
    #[must_use]
    pub fn new(
        components: HashMap<String, Arc<dyn ServiceScheduler>>,
        default_tag: impl Into<String>,
        descriptors: Arc<dyn DescriptorLookup>,
    ) -> Self {
        Self {
            components,
            default_tag: default_tag.into(),
            descriptors,
        }
    }

    fn tag_for(&self, service_id: &str) -> String {
        self.descriptors
            .lookup(service_id)
            .and_then(|descriptor| descriptor.scheduler)
            .unwrap_or_else(|| self.default_tag.clone())
    }

    fn component_for(&self, service_id: &str) -> Result<&Arc<dyn ServiceScheduler>> {
        let tag = self.tag_for(service_id);
        self.components
            .get(&tag)
            .or_else(|| self.components.get(&self.default_tag))
            .ok_or_else(|| {
                SchedulerError::Internal(format!(
                    "no scheduler component for tag {tag} (service {service_id})"
                ))
            })
    }

    /// Tags in deterministic order, for stable concatenation and state.
    fn sorted_tags(&self) -> Vec<&String> {
        let mut tags: Vec<&String> = self.components.keys().collect();
        tags.sort();
        tags
    }
}

#[async_trait]
impl ServiceScheduler for CompositeScheduler {
    async fn get_services(&self) -> Vec<Service> {
        let mut services = Vec::new();
        for tag in self.sorted_tags() {
            services.extend(self.components[tag].get_services().await);
        }
        services
    }

    async fn get_service_instances(&self) -> HashMap<String, ServiceInstances> {
        let mut merged = HashMap::new();
        for tag in self.sorted_tags() {
            merged.extend(self.components[tag].get_service_instances().await);
        }
        merged
    }

    async fn kill_instance(&self, instance: &ServiceInstance) -> KillResult {
        match self.component_for(&instance.service_id) {
            Ok(component) => component.kill_instance(instance).await,
            Err(err) => KillResult::new(false, 500, KillOutcome::Failed, err.to_string()),
        }
    }

    async fn service_exists(&self, service_id: &str) -> bool {
        match self.component_for(service_id) {
            Ok(component) => component.service_exists(service_id).await,
            Err(_) => false,
        }
    }

    async fn create_service_if_new(
        &self,
        service_id: &str,
        descriptor: &ServiceDescription,
    ) -> Result<Option<Service>> {
        let tag = descriptor
            .scheduler
            .clone()
            .unwrap_or_else(|| self.default_tag.clone());
        let component = self.components.get(&tag).ok_or_else(|| {
            SchedulerError::Internal(format!("no scheduler component for tag {tag}"))
        })?;
        component.create_service_if_new(service_id, descriptor).await
    }

    async fn delete_service(&self, service_id: &str) -> DeleteResult {
        match self.component_for(service_id) {
            Ok(component) => component.delete_service(service_id).await,
            Err(err) => DeleteResult {
                result: DeleteOutcome::Error,
                message: err.to_string(),
            },
        }
    }

    async fn scale_service(&self, service_id: &str, target: i32, force: bool) -> ScaleResult {
        match self.component_for(service_id) {
            Ok(component) => component.scale_service(service_id, target, force).await,
            Err(err) => ScaleResult::new(false, 500, ScaleOutcome::Failed, err.to_string()),
        }
    }

    async fn retrieve_directory_content(
        &self,
        service_id: &str,
        instance_id: &str,
        host: &str,
        path: &str,
    ) -> Option<Vec<DirectoryEntry>> {
        match self.component_for(service_id) {
            Ok(component) => {
                component
                    .retrieve_directory_content(service_id, instance_id, host, path)
                    .await
            }
            Err(_) => None,
        }
    }

    async fn service_id_state(&self, service_id: &str) -> serde_json::Value {
        match self.component_for(service_id) {
            Ok(component) => component.service_id_state(service_id).await,
            Err(_) => serde_json::Value::Null,
        }
    }

    async fn state(&self) -> serde_json::Value {
        let mut components = serde_json::Map::new();
        for tag in self.sorted_tags() {
            components.insert(tag.clone(), self.components[tag].state().await);
        }
        json!({
            "components": components,
            "default-tag": self.default_tag,
        })
    }

    async fn validate_service(&self, service_id: &str) -> Result<()> {
        self.component_for(service_id)?
            .validate_service(service_id)
            .await
    }
}
