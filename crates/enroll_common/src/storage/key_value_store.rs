use crate::domain::DomainResult;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Ordered list of pending `QueueItem`s
pub const QUEUE_KEY: &str = "enrollment.queue";

/// Every enrollment ID ever handed out
pub const ALLOCATED_IDS_KEY: &str = "enrollment.allocated_ids";

/// Map of owner id to pending registration entries
pub const PENDING_REGISTRATION_KEY: &str = "enrollment.pending_registration";

/// Notifications waiting to be picked up by the push dispatcher
pub const NOTIFICATION_OUTBOX_KEY: &str = "notification.outbox";

/// Key of a user profile document
pub fn profile_key(owner_id: &str) -> String {
    format!("profile.{}", owner_id)
}

/// Durable key-value surface backing the queue, the allocated-ID set and the
/// local record stores.
///
/// Implementations only need single-key atomicity; callers that read-modify-write
/// several keys hold their own lock.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` when the key was never written
    async fn get(&self, key: &str) -> DomainResult<Option<Value>>;

    /// Write (replace) a value
    async fn set(&self, key: &str, value: Value) -> DomainResult<()>;
}

/// Read and deserialize a value. A stored JSON `null` reads as absent.
pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> DomainResult<Option<T>> {
    match store.get(key).await? {
        Some(Value::Null) | None => Ok(None),
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
    }
}

/// Serialize and write a value
pub async fn save_json<T: Serialize + ?Sized + Sync>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> DomainResult<()> {
    store.set(key, serde_json::to_value(value)?).await
}
