use crate::model::FailedInstance;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Bounded history of terminated instance incarnations, keyed by service-id
/// then instance-id. Insert-once per key: repeated observations of the same
/// pod state are no-ops. Entries leave only when their service is deleted
/// or the per-service bound evicts the oldest.
pub struct FailureStore {
    limit: usize,
    entries: RwLock<HashMap<String, HashMap<String, FailedInstance>>>,
}

impl FailureStore {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a failed incarnation. Returns true when the entry is new.
    pub fn record(&self, failed: FailedInstance) -> bool {
        let Ok(mut entries) = self.entries.write() else {
            return false;
        };
        let per_service = entries.entry(failed.service_id.clone()).or_default();
        if per_service.contains_key(&failed.id) {
            return false;
        }
        debug!(
            service_id = %failed.service_id,
            instance_id = %failed.id,
            "recording failed instance"
        );
        per_service.insert(failed.id.clone(), failed);
        while per_service.len() > self.limit {
            let oldest = per_service
                .iter()
                .min_by_key(|(_, instance)| instance.started_at)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    per_service.remove(&id);
                }
                None => break,
            }
        }
        true
    }

    #[must_use]
    pub fn failed_instances(&self, service_id: &str) -> Vec<FailedInstance> {
        self.entries.read().map_or_else(
            |_| Vec::new(),
            |entries| {
                entries
                    .get(service_id)
                    .map(|per_service| per_service.values().cloned().collect())
                    .unwrap_or_default()
            },
        )
    }

    /// Drop all history for a deleted service.
    pub fn remove_service(&self, service_id: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(service_id);
        }
    }

    #[must_use]
    pub fn state(&self) -> serde_json::Value {
        self.entries.read().map_or_else(
            |_| serde_json::Value::Null,
            |entries| {
                let by_service: HashMap<&String, Vec<&FailedInstance>> = entries
                    .iter()
                    .map(|(service_id, per_service)| {
                        (service_id, per_service.values().collect())
                    })
                    .collect();
                serde_json::to_value(by_service).unwrap_or(serde_json::Value::Null)
            },
        )
    }
}
