use crate::mqtt::{BrokerEndpoint, DeviceTopics};
use enroll_common::domain::{DomainError, DomainResult, EnrollmentId, QueueItem};
use enroll_common::storage::{load_json, save_json, KeyValueStore, QUEUE_KEY};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

/// Durable FIFO of enrollment attempts awaiting a reachable device.
///
/// The whole queue lives under one storage key. Every read-modify-write
/// happens under `lock`, which [`crate::domain::IdAllocator`] shares so that
/// allocation and enqueue observe one consistent view.
pub struct QueueStore {
    store: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub(crate) fn key_value_store(&self) -> &dyn KeyValueStore {
        self.store.as_ref()
    }

    /// Read without taking the lock; callers must already hold it
    pub(crate) async fn read_locked(&self) -> DomainResult<Vec<QueueItem>> {
        Ok(load_json(self.store.as_ref(), QUEUE_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn write_locked(&self, items: &[QueueItem]) -> DomainResult<()> {
        save_json(self.store.as_ref(), QUEUE_KEY, items).await
    }

    /// Append an item at the tail.
    ///
    /// Items whose device or broker could never be addressed are refused, so
    /// the head is always an item a later pass can deliver.
    #[instrument(skip(self, item), fields(enroll_id = %item.enroll_id, device_id = %item.device_id))]
    pub async fn enqueue(&self, item: QueueItem) -> DomainResult<()> {
        DeviceTopics::for_device(&item.device_id)?;
        BrokerEndpoint::parse(&item.channel_endpoint)?;

        let _guard = self.lock().await;
        let mut items = self.read_locked().await?;
        if items.iter().any(|queued| queued.enroll_id == item.enroll_id) {
            return Err(DomainError::ValidationError(format!(
                "enrollment id {} is already queued",
                item.enroll_id
            )));
        }

        items.push(item);
        self.write_locked(&items).await?;
        info!(queue_len = items.len(), "enrollment queued for retry");
        Ok(())
    }

    /// Oldest item, left in place
    pub async fn peek_head(&self) -> DomainResult<Option<QueueItem>> {
        let _guard = self.lock().await;
        Ok(self.read_locked().await?.into_iter().next())
    }

    /// Remove the item that was processed. Items appended meanwhile are kept.
    #[instrument(skip(self))]
    pub async fn remove_head(&self, enroll_id: EnrollmentId) -> DomainResult<bool> {
        let _guard = self.lock().await;
        let mut items = self.read_locked().await?;
        let Some(position) = items.iter().position(|item| item.enroll_id == enroll_id) else {
            warn!("processed item no longer in queue");
            return Ok(false);
        };
        if position != 0 {
            warn!(position, "processed item was not at the head");
        }

        items.remove(position);
        self.write_locked(&items).await?;
        debug!(queue_len = items.len(), "removed item from queue");
        Ok(true)
    }

    /// Snapshot of all queued items, oldest first
    pub async fn items(&self) -> DomainResult<Vec<QueueItem>> {
        let _guard = self.lock().await;
        self.read_locked().await
    }

    /// IDs held by queued attempts, oldest first
    pub async fn enroll_ids(&self) -> DomainResult<Vec<EnrollmentId>> {
        Ok(self.items().await?.into_iter().map(|item| item.enroll_id).collect())
    }

    pub async fn len(&self) -> DomainResult<usize> {
        Ok(self.items().await?.len())
    }

    pub async fn is_empty(&self) -> DomainResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use enroll_common::domain::Flow;
    use enroll_common::storage::{InMemoryKeyValueStore, MockKeyValueStore};

    fn queue_item(id: u32) -> QueueItem {
        QueueItem {
            enroll_id: EnrollmentId::new(id).unwrap(),
            subject_name: format!("user-{}", id),
            image_record: "QUJD".to_string(),
            target_project: "proj-a".to_string(),
            device_id: "SN-1".to_string(),
            channel_endpoint: "ws://broker.example.com:8000/mqtt".to_string(),
            owner_id: format!("owner-{}", id),
            flow: Flow::Profile,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = QueueStore::new(Arc::new(InMemoryKeyValueStore::new()));
        queue.enqueue(queue_item(100)).await.unwrap();
        queue.enqueue(queue_item(101)).await.unwrap();

        assert_eq!(queue.peek_head().await.unwrap().unwrap().enroll_id.value(), 100);
        assert_eq!(
            queue.enroll_ids().await.unwrap(),
            vec![EnrollmentId::new(100).unwrap(), EnrollmentId::new(101).unwrap()]
        );
        assert!(queue.remove_head(EnrollmentId::new(100).unwrap()).await.unwrap());
        assert_eq!(queue.peek_head().await.unwrap().unwrap().enroll_id.value(), 101);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remove_head_keeps_items_appended_meanwhile() {
        let queue = QueueStore::new(Arc::new(InMemoryKeyValueStore::new()));
        queue.enqueue(queue_item(100)).await.unwrap();
        let head = queue.peek_head().await.unwrap().unwrap();

        queue.enqueue(queue_item(101)).await.unwrap();
        queue.remove_head(head.enroll_id).await.unwrap();

        let remaining = queue.items().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].enroll_id.value(), 101);
    }

    #[tokio::test]
    async fn test_remove_missing_item_is_noop() {
        let queue = QueueStore::new(Arc::new(InMemoryKeyValueStore::new()));
        queue.enqueue(queue_item(100)).await.unwrap();

        assert!(!queue.remove_head(EnrollmentId::new(555).unwrap()).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_enroll_id_rejected() {
        let queue = QueueStore::new(Arc::new(InMemoryKeyValueStore::new()));
        queue.enqueue(queue_item(100)).await.unwrap();

        let result = queue.enqueue(queue_item(100)).await;
        assert!(matches!(result, Err(DomainError::ValidationError(_))));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unaddressable_item_rejected() {
        let queue = QueueStore::new(Arc::new(InMemoryKeyValueStore::new()));

        let mut bad_device = queue_item(100);
        bad_device.device_id = "SN/1".to_string();
        assert!(matches!(
            queue.enqueue(bad_device).await,
            Err(DomainError::ValidationError(_))
        ));

        let mut bad_broker = queue_item(101);
        bad_broker.channel_endpoint = "ftp://broker.example.com".to_string();
        assert!(queue.enqueue(bad_broker).await.is_err());

        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_failure_propagates() {
        let mut store = MockKeyValueStore::new();
        store
            .expect_get()
            .returning(|_| Err(DomainError::StorageError(anyhow::anyhow!("disk gone"))));

        let queue = QueueStore::new(Arc::new(store));
        assert!(matches!(
            queue.peek_head().await,
            Err(DomainError::StorageError(_))
        ));
    }
}
