use crate::mqtt::cluster_id_for;
use chrono::{DateTime, Utc};
use enroll_common::domain::{
    DomainError, DomainResult, EnrollmentResult, Flow, PendingRegistrationEntry,
    PendingRegistrationRepository, ProfileRepository, QueueItem, RejectionNotice,
    RejectionNotifier,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// A confirmed enrollment and where its result belongs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedEnrollment {
    pub owner_id: String,
    pub flow: Flow,
    pub target_project: String,
    pub result: EnrollmentResult,
}

impl ConfirmedEnrollment {
    /// Result for a queued item confirmed at `enrolled_at`
    pub fn from_queue_item(item: &QueueItem, enrolled_at: DateTime<Utc>) -> Self {
        Self {
            owner_id: item.owner_id.clone(),
            flow: item.flow,
            target_project: item.target_project.clone(),
            result: EnrollmentResult {
                enroll_id: item.enroll_id,
                device_id: item.device_id.clone(),
                channel_cluster_id: cluster_id_for(&item.channel_endpoint),
                enrolled_at,
            },
        }
    }
}

/// Writes confirmed enrollments to the owner's record and reports rejections
pub struct ResultSink {
    profiles: Arc<dyn ProfileRepository>,
    pending: Arc<dyn PendingRegistrationRepository>,
    notifier: Arc<dyn RejectionNotifier>,
    /// Serializes read-merge-write cycles on owner records
    write_lock: Mutex<()>,
}

impl ResultSink {
    pub fn new(
        profiles: Arc<dyn ProfileRepository>,
        pending: Arc<dyn PendingRegistrationRepository>,
        notifier: Arc<dyn RejectionNotifier>,
    ) -> Self {
        Self {
            profiles,
            pending,
            notifier,
            write_lock: Mutex::new(()),
        }
    }

    /// Merge the result into the profile, or park it for a registration in progress
    #[instrument(
        skip(self, confirmed),
        fields(
            owner_id = %confirmed.owner_id,
            target_project = %confirmed.target_project,
            enroll_id = %confirmed.result.enroll_id,
        )
    )]
    pub async fn record_success(&self, confirmed: ConfirmedEnrollment) -> DomainResult<()> {
        let _guard = self.write_lock.lock().await;
        match confirmed.flow {
            Flow::Profile => {
                let mut profile = self
                    .profiles
                    .get_profile(&confirmed.owner_id)
                    .await?
                    .ok_or_else(|| DomainError::ProfileNotFound(confirmed.owner_id.clone()))?;
                profile.merge_enrollment(&confirmed.target_project, confirmed.result);
                self.profiles.put_profile(profile).await?;
                info!("enrollment recorded on profile");
            }
            Flow::Registration => {
                self.pending
                    .append(
                        &confirmed.owner_id,
                        PendingRegistrationEntry {
                            target_project: confirmed.target_project,
                            result: confirmed.result,
                        },
                    )
                    .await?;
                info!("enrollment parked for pending registration");
            }
        }
        Ok(())
    }

    /// Ask the owner for a new photo. Delivery failures are logged only.
    #[instrument(skip(self))]
    pub async fn notify_rejection(&self, owner_id: &str, target_project: &str, flow: Flow) {
        let notice = RejectionNotice::new(owner_id, target_project, flow);
        match self.notifier.notify_rejected(notice).await {
            Ok(()) => debug!("rejection notification dispatched"),
            Err(e) => error!(error = %e, "failed to dispatch rejection notification"),
        }
    }

    /// Results parked under a temporary owner id
    pub async fn pending_for(&self, owner_id: &str) -> DomainResult<Vec<PendingRegistrationEntry>> {
        self.pending.list(owner_id).await
    }

    /// Drop results parked under an owner id without migrating them
    pub async fn clear_pending(&self, owner_id: &str) -> DomainResult<()> {
        let _guard = self.write_lock.lock().await;
        self.pending.clear(owner_id).await
    }

    /// Move parked results onto the newly created account's profile.
    ///
    /// The pending list is cleared only after the profile write succeeds.
    #[instrument(skip(self))]
    pub async fn migrate_pending_registration(
        &self,
        temp_owner_id: &str,
        account_id: &str,
    ) -> DomainResult<usize> {
        let _guard = self.write_lock.lock().await;
        let entries = self.pending.list(temp_owner_id).await?;
        if entries.is_empty() {
            debug!("no pending enrollments to migrate");
            return Ok(0);
        }

        let Some(mut profile) = self.profiles.get_profile(account_id).await? else {
            warn!("account profile missing, pending enrollments kept");
            return Err(DomainError::ProfileNotFound(account_id.to_string()));
        };

        let migrated = entries.len();
        for entry in entries {
            profile.merge_enrollment(&entry.target_project, entry.result);
        }
        self.profiles.put_profile(profile).await?;
        self.pending.clear(temp_owner_id).await?;

        info!(migrated, "pending enrollments migrated to account");
        Ok(migrated)
    }
}
