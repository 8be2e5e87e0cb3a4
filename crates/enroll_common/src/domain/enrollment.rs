use crate::domain::result::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest enrollment ID the system hands out. 0..=98 are reserved.
pub const ENROLL_ID_MIN: u32 = 99;

/// Highest enrollment ID accepted by the device firmware.
pub const ENROLL_ID_MAX: u32 = 49_999;

/// Project used when a caller supplies no enrollment targets
pub const DEFAULT_TARGET_PROJECT: &str = "default";

/// Device-side user slot identifier.
///
/// Always within `ENROLL_ID_MIN..=ENROLL_ID_MAX`; construction outside that
/// range fails with [`DomainError::InvalidEnrollmentId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct EnrollmentId(u32);

impl EnrollmentId {
    pub fn new(value: u32) -> DomainResult<Self> {
        if value < ENROLL_ID_MIN {
            return Err(DomainError::InvalidEnrollmentId(format!(
                "{} is reserved (0..={} are never allocated)",
                value,
                ENROLL_ID_MIN - 1
            )));
        }
        if value > ENROLL_ID_MAX {
            return Err(DomainError::InvalidEnrollmentId(format!(
                "{} exceeds the maximum of {}",
                value, ENROLL_ID_MAX
            )));
        }
        Ok(Self(value))
    }

    /// Every allocable ID in ascending order
    pub fn allocable() -> impl Iterator<Item = EnrollmentId> {
        (ENROLL_ID_MIN..=ENROLL_ID_MAX).map(EnrollmentId)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for EnrollmentId {
    type Error = DomainError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EnrollmentId> for u32 {
    fn from(id: EnrollmentId) -> Self {
        id.0
    }
}

impl fmt::Display for EnrollmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which record a successful enrollment is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    /// Existing account; result merged into the profile record
    Profile,
    /// Account creation still in progress; result parked under the temporary owner id
    Registration,
}

impl Flow {
    /// In-app location the user is sent to when asked to resubmit a photo
    pub fn deep_link(self) -> &'static str {
        match self {
            Flow::Profile => "/profile/face-verification",
            Flow::Registration => "/register/face-verification",
        }
    }
}

/// One device (per project) a face must be enrolled on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentTarget {
    pub target_project: String,
    pub device_id: String,
    pub channel_endpoint: String,
}

/// A durable enrollment attempt waiting for the device to become reachable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub enroll_id: EnrollmentId,
    pub subject_name: String,
    /// Base64 JPEG exactly as sent in the `record` field
    pub image_record: String,
    pub target_project: String,
    pub device_id: String,
    pub channel_endpoint: String,
    pub owner_id: String,
    pub flow: Flow,
    pub created_at: DateTime<Utc>,
}

/// Metadata recorded once the device confirms an enrollment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentResult {
    pub enroll_id: EnrollmentId,
    pub device_id: String,
    pub channel_cluster_id: String,
    pub enrolled_at: DateTime<Utc>,
}
