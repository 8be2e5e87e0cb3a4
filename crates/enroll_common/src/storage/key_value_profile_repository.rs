use crate::domain::{DomainResult, ProfileRecord, ProfileRepository};
use crate::storage::{load_json, profile_key, save_json, KeyValueStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};

/// ProfileRepository keeping one JSON document per owner in the key-value store
pub struct KeyValueProfileRepository {
    store: Arc<dyn KeyValueStore>,
}

impl KeyValueProfileRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ProfileRepository for KeyValueProfileRepository {
    #[instrument(skip(self))]
    async fn get_profile(&self, owner_id: &str) -> DomainResult<Option<ProfileRecord>> {
        load_json(self.store.as_ref(), &profile_key(owner_id)).await
    }

    #[instrument(skip(self, profile), fields(owner_id = %profile.owner_id))]
    async fn put_profile(&self, profile: ProfileRecord) -> DomainResult<()> {
        save_json(self.store.as_ref(), &profile_key(&profile.owner_id), &profile).await?;
        debug!("profile written");
        Ok(())
    }
}
