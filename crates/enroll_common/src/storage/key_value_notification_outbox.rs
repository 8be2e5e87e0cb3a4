use crate::domain::{DomainResult, RejectionNotice, RejectionNotifier};
use crate::storage::{load_json, save_json, KeyValueStore, NOTIFICATION_OUTBOX_KEY};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument};

pub const FACE_REJECTED_NOTIFICATION_TYPE: &str = "face_enrollment_rejected";

/// Push notification record picked up by the delivery pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundNotification {
    pub project_id: String,
    pub audience_uids: Vec<String>,
    pub title_en: String,
    pub title_ar: String,
    pub body_en: String,
    pub body_ar: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub url: String,
    pub send_now: bool,
    pub created_at: DateTime<Utc>,
}

impl OutboundNotification {
    pub fn face_rejected(notice: &RejectionNotice) -> Self {
        Self {
            project_id: notice.target_project.clone(),
            audience_uids: vec![notice.owner_id.clone()],
            title_en: "Face photo not accepted".to_string(),
            title_ar: "لم يتم قبول صورة الوجه".to_string(),
            body_en: "Please upload a clearer photo of your face so we can recognise you."
                .to_string(),
            body_ar: "يرجى رفع صورة أوضح لوجهك حتى نتمكن من التعرف عليك.".to_string(),
            notification_type: FACE_REJECTED_NOTIFICATION_TYPE.to_string(),
            url: notice.deep_link.clone(),
            send_now: true,
            created_at: Utc::now(),
        }
    }
}

/// RejectionNotifier that appends notifications to an outbox list
pub struct KeyValueNotificationOutbox {
    store: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
}

impl KeyValueNotificationOutbox {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Notifications not yet delivered, oldest first
    pub async fn pending(&self) -> DomainResult<Vec<OutboundNotification>> {
        Ok(load_json(self.store.as_ref(), NOTIFICATION_OUTBOX_KEY)
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl RejectionNotifier for KeyValueNotificationOutbox {
    #[instrument(skip(self, notice), fields(owner_id = %notice.owner_id, target_project = %notice.target_project))]
    async fn notify_rejected(&self, notice: RejectionNotice) -> DomainResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut outbox = self.pending().await?;
        outbox.push(OutboundNotification::face_rejected(&notice));
        save_json(self.store.as_ref(), NOTIFICATION_OUTBOX_KEY, &outbox).await?;
        info!("face rejection notification queued");
        Ok(())
    }
}
