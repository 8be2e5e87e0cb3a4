use crate::domain::{DomainResult, PendingRegistrationEntry, PendingRegistrationRepository};
use crate::storage::{load_json, save_json, KeyValueStore, PENDING_REGISTRATION_KEY};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

type PendingMap = BTreeMap<String, Vec<PendingRegistrationEntry>>;

/// PendingRegistrationRepository storing every owner's list under one key
pub struct KeyValuePendingRegistrationRepository {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl KeyValuePendingRegistrationRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> DomainResult<PendingMap> {
        Ok(load_json(self.store.as_ref(), PENDING_REGISTRATION_KEY)
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl PendingRegistrationRepository for KeyValuePendingRegistrationRepository {
    #[instrument(skip(self, entry), fields(target_project = %entry.target_project))]
    async fn append(&self, owner_id: &str, entry: PendingRegistrationEntry) -> DomainResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut pending = self.load().await?;
        pending.entry(owner_id.to_string()).or_default().push(entry);
        save_json(self.store.as_ref(), PENDING_REGISTRATION_KEY, &pending).await?;
        debug!("pending registration entry appended");
        Ok(())
    }

    async fn list(&self, owner_id: &str) -> DomainResult<Vec<PendingRegistrationEntry>> {
        let mut pending = self.load().await?;
        Ok(pending.remove(owner_id).unwrap_or_default())
    }

    #[instrument(skip(self))]
    async fn clear(&self, owner_id: &str) -> DomainResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut pending = self.load().await?;
        if pending.remove(owner_id).is_some() {
            save_json(self.store.as_ref(), PENDING_REGISTRATION_KEY, &pending).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EnrollmentId, EnrollmentResult};
    use crate::storage::InMemoryKeyValueStore;

    fn entry(project: &str, id: u32) -> PendingRegistrationEntry {
        PendingRegistrationEntry {
            target_project: project.to_string(),
            result: EnrollmentResult {
                enroll_id: EnrollmentId::new(id).unwrap(),
                device_id: "SN-1".to_string(),
                channel_cluster_id: "broker:8000".to_string(),
                enrolled_at: chrono::Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn test_append_list_clear() {
        let repo =
            KeyValuePendingRegistrationRepository::new(Arc::new(InMemoryKeyValueStore::new()));

        repo.append("temp-1", entry("proj-a", 99)).await.unwrap();
        repo.append("temp-1", entry("proj-b", 100)).await.unwrap();
        repo.append("temp-2", entry("proj-a", 101)).await.unwrap();

        let list = repo.list("temp-1").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].target_project, "proj-a");
        assert_eq!(list[1].target_project, "proj-b");

        repo.clear("temp-1").await.unwrap();
        assert!(repo.list("temp-1").await.unwrap().is_empty());
        assert_eq!(repo.list("temp-2").await.unwrap().len(), 1);
    }
}
