use crate::domain::enrollment::EnrollmentResult;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// User profile document as far as face enrollment is concerned.
///
/// Fields the engine does not own are carried in `attributes` so a
/// read-merge-write cycle leaves the rest of the document untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub owner_id: String,
    #[serde(default)]
    pub face_enrollments: BTreeMap<String, EnrollmentResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_enrolled_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl ProfileRecord {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    /// Merge one project's enrollment into the map, replacing any previous entry
    pub fn merge_enrollment(&mut self, target_project: &str, result: EnrollmentResult) {
        self.face_enrolled_at = Some(result.enrolled_at);
        self.face_enrollments
            .insert(target_project.to_string(), result);
    }
}

/// Enrollment confirmed for a user who has no permanent account yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRegistrationEntry {
    pub target_project: String,
    pub result: EnrollmentResult,
}

/// Store of user profile documents keyed by owner id
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    /// Fetch a profile document
    async fn get_profile(&self, owner_id: &str) -> DomainResult<Option<ProfileRecord>>;

    /// Replace a profile document
    async fn put_profile(&self, profile: ProfileRecord) -> DomainResult<()>;
}

/// Enrollment results parked until account creation completes
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PendingRegistrationRepository: Send + Sync {
    /// Append an entry to the owner's pending list
    async fn append(&self, owner_id: &str, entry: PendingRegistrationEntry) -> DomainResult<()>;

    /// All pending entries for an owner, oldest first
    async fn list(&self, owner_id: &str) -> DomainResult<Vec<PendingRegistrationEntry>>;

    /// Drop the owner's pending list
    async fn clear(&self, owner_id: &str) -> DomainResult<()>;
}
