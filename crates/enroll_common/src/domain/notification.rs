use crate::domain::enrollment::Flow;
use crate::domain::result::DomainResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Tells a user the device refused their photo and asks for a new one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionNotice {
    pub owner_id: String,
    pub target_project: String,
    pub deep_link: String,
}

impl RejectionNotice {
    pub fn new(owner_id: &str, target_project: &str, flow: Flow) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            target_project: target_project.to_string(),
            deep_link: flow.deep_link().to_string(),
        }
    }
}

/// Fire-and-forget notification dispatch for terminal rejections
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait RejectionNotifier: Send + Sync {
    async fn notify_rejected(&self, notice: RejectionNotice) -> DomainResult<()>;
}
