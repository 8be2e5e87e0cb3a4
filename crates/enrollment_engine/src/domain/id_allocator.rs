use crate::domain::QueueStore;
use enroll_common::domain::{DomainError, DomainResult, EnrollmentId, ENROLL_ID_MAX, ENROLL_ID_MIN};
use enroll_common::storage::{load_json, save_json, ALLOCATED_IDS_KEY};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Hands out device user slots that no live attempt holds.
///
/// Allocated IDs are persisted so restarts never reuse a slot, and the
/// queue is consulted under the queue's own lock so a queued ID is never
/// handed out twice.
pub struct IdAllocator {
    queue: Arc<QueueStore>,
}

impl IdAllocator {
    pub fn new(queue: Arc<QueueStore>) -> Self {
        Self { queue }
    }

    /// Smallest ID in range not yet allocated
    #[instrument(skip(self))]
    pub async fn allocate(&self) -> DomainResult<EnrollmentId> {
        let _guard = self.queue.lock().await;
        let mut allocated = self.allocated_locked().await?;
        let queued: HashSet<EnrollmentId> = self
            .queue
            .read_locked()
            .await?
            .into_iter()
            .map(|item| item.enroll_id)
            .collect();

        let id = EnrollmentId::allocable()
            .find(|id| !allocated.contains(&id.value()) && !queued.contains(id))
            .ok_or(DomainError::EnrollmentIdsExhausted(
                ENROLL_ID_MIN,
                ENROLL_ID_MAX,
            ))?;

        allocated.insert(id.value());
        self.save_locked(&allocated).await?;
        debug!(enroll_id = %id, "allocated enrollment id");
        Ok(id)
    }

    /// Record an externally supplied ID, refusing one already handed out or queued
    #[instrument(skip(self))]
    pub async fn claim(&self, id: EnrollmentId) -> DomainResult<EnrollmentId> {
        let _guard = self.queue.lock().await;
        let queued = self.queue.read_locked().await?;
        if queued.iter().any(|item| item.enroll_id == id) {
            return Err(DomainError::ValidationError(format!(
                "enrollment id {} is held by a queued attempt",
                id
            )));
        }

        let mut allocated = self.allocated_locked().await?;
        if !allocated.insert(id.value()) {
            return Err(DomainError::ValidationError(format!(
                "enrollment id {} is already allocated",
                id
            )));
        }
        self.save_locked(&allocated).await?;
        debug!(enroll_id = %id, "claimed enrollment id");
        Ok(id)
    }

    /// IDs handed out so far
    pub async fn allocated(&self) -> DomainResult<BTreeSet<u32>> {
        let _guard = self.queue.lock().await;
        self.allocated_locked().await
    }

    async fn allocated_locked(&self) -> DomainResult<BTreeSet<u32>> {
        Ok(load_json(self.queue.key_value_store(), ALLOCATED_IDS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save_locked(&self, allocated: &BTreeSet<u32>) -> DomainResult<()> {
        save_json(self.queue.key_value_store(), ALLOCATED_IDS_KEY, allocated).await
    }
}
