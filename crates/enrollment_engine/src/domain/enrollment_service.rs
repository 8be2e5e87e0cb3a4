use crate::domain::{
    prepare_data_url, prepare_enrollment, prepare_image_bytes, ConfirmedEnrollment,
    DeviceExchangeClient, ExchangeFailure, ExchangeOutcome, ExchangeRequest, IdAllocator,
    PreparedImage, QueueStore, ResultSink,
};
use crate::mqtt::{cluster_id_for, BrokerEndpoint, DeviceTopics};
use chrono::Utc;
use enroll_common::domain::{
    DomainError, DomainResult, EnrollmentId, EnrollmentResult, EnrollmentTarget, Flow, QueueItem,
    DEFAULT_TARGET_PROJECT,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const ENROLLED_MESSAGE: &str = "Your face has been registered on the device.";

pub const QUEUED_MESSAGE: &str =
    "We've saved your photo. We'll send it to the device when it's available. You can keep using the app.";

pub const FAILED_MESSAGE: &str =
    "Something went wrong while saving your photo for this device. Please try again.";

/// Photo as supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Encoded file bytes (JPEG, PNG, BMP, WebP)
    Encoded(Vec<u8>),
    /// `data:image/...;base64,` URL from a camera capture or file picker
    DataUrl(String),
}

/// One foreground enrollment submission
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub image: ImageSource,
    pub subject_name: String,
    pub owner_id: String,
    pub flow: Flow,
    /// Empty means the configured default device
    pub targets: Vec<EnrollmentTarget>,
    /// Operator-chosen ID; only valid with a single target
    pub enroll_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Enrolled(EnrollmentResult),
    /// Saved for the queue processor to retry
    Queued {
        enroll_id: EnrollmentId,
        reason: ExchangeFailure,
    },
    /// The device refused the photo; the owner has been notified
    Rejected { enroll_id: EnrollmentId },
    /// Allocation or storage failed for this target; other targets are unaffected
    Failed {
        enroll_id: Option<EnrollmentId>,
        error: String,
    },
}

impl TargetOutcome {
    pub fn enroll_id(&self) -> Option<EnrollmentId> {
        match self {
            TargetOutcome::Enrolled(result) => Some(result.enroll_id),
            TargetOutcome::Queued { enroll_id, .. } | TargetOutcome::Rejected { enroll_id } => {
                Some(*enroll_id)
            }
            TargetOutcome::Failed { enroll_id, .. } => *enroll_id,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            TargetOutcome::Enrolled(_) => ENROLLED_MESSAGE,
            TargetOutcome::Queued { .. } => QUEUED_MESSAGE,
            TargetOutcome::Rejected { .. } => ExchangeFailure::ReplyRejected.user_message(),
            TargetOutcome::Failed { .. } => FAILED_MESSAGE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub target: EnrollmentTarget,
    pub outcome: TargetOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentReport {
    pub targets: Vec<TargetReport>,
}

impl EnrollmentReport {
    pub fn all_enrolled(&self) -> bool {
        self.targets
            .iter()
            .all(|report| matches!(report.outcome, TargetOutcome::Enrolled(_)))
    }

    /// Single message summarising the submission; rejection outranks failure,
    /// failure outranks queueing
    pub fn user_message(&self) -> &'static str {
        let outcomes = || self.targets.iter().map(|report| &report.outcome);
        if let Some(rejected) = outcomes().find(|o| matches!(o, TargetOutcome::Rejected { .. })) {
            return rejected.user_message();
        }
        if let Some(failed) = outcomes().find(|o| matches!(o, TargetOutcome::Failed { .. })) {
            return failed.user_message();
        }
        if let Some(queued) = outcomes().find(|o| matches!(o, TargetOutcome::Queued { .. })) {
            return queued.user_message();
        }
        ENROLLED_MESSAGE
    }
}

/// Foreground entry point: prepare, allocate, exchange, then record or queue
pub struct EnrollmentService {
    allocator: Arc<IdAllocator>,
    queue: Arc<QueueStore>,
    client: Arc<DeviceExchangeClient>,
    sink: Arc<ResultSink>,
    default_target: EnrollmentTarget,
}

impl EnrollmentService {
    pub fn new(
        allocator: Arc<IdAllocator>,
        queue: Arc<QueueStore>,
        client: Arc<DeviceExchangeClient>,
        sink: Arc<ResultSink>,
        default_device_id: &str,
        default_channel_endpoint: &str,
    ) -> Self {
        Self {
            allocator,
            queue,
            client,
            sink,
            default_target: EnrollmentTarget {
                target_project: DEFAULT_TARGET_PROJECT.to_string(),
                device_id: default_device_id.to_string(),
                channel_endpoint: default_channel_endpoint.to_string(),
            },
        }
    }

    /// Enroll one face on every target.
    ///
    /// Image and validation errors are returned before any target is tried.
    /// Once targets are under way each gets its own outcome: protocol failures
    /// appear as `Queued` or `Rejected`, allocation and storage errors as `Failed`.
    #[instrument(
        skip(self, request),
        fields(owner_id = %request.owner_id, flow = ?request.flow, targets = request.targets.len())
    )]
    pub async fn enroll(&self, request: EnrollmentRequest) -> DomainResult<EnrollmentReport> {
        if request.owner_id.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "owner id must not be empty".to_string(),
            ));
        }

        let targets = if request.targets.is_empty() {
            vec![self.default_target.clone()]
        } else {
            request.targets.clone()
        };
        for target in &targets {
            validate_target(target)?;
        }

        let explicit_id = request.enroll_id.map(EnrollmentId::new).transpose()?;
        if explicit_id.is_some() && targets.len() > 1 {
            return Err(DomainError::ValidationError(
                "an explicit enrollment id can only be used with a single target".to_string(),
            ));
        }

        let image = prepare_source(request.image.clone()).await?;

        let mut reports = Vec::with_capacity(targets.len());
        for target in targets {
            let reserved = match explicit_id {
                Some(id) => self.allocator.claim(id).await,
                None => self.allocator.allocate().await,
            };
            let outcome = match reserved {
                Ok(enroll_id) => self
                    .enroll_target(&request, &target, enroll_id, &image)
                    .await
                    .unwrap_or_else(|e| failed_target(&target, Some(enroll_id), e)),
                Err(e) => failed_target(&target, None, e),
            };
            reports.push(TargetReport { target, outcome });
        }

        Ok(EnrollmentReport { targets: reports })
    }

    #[instrument(
        skip(self, request, target, image),
        fields(device_id = %target.device_id, target_project = %target.target_project)
    )]
    async fn enroll_target(
        &self,
        request: &EnrollmentRequest,
        target: &EnrollmentTarget,
        enroll_id: EnrollmentId,
        image: &PreparedImage,
    ) -> DomainResult<TargetOutcome> {
        let payload = prepare_enrollment(enroll_id, &request.subject_name, image)?;
        let exchange = ExchangeRequest {
            channel_endpoint: &target.channel_endpoint,
            device_id: &target.device_id,
            enroll_id,
            payload: &payload,
        };

        match self.client.execute(&exchange).await {
            ExchangeOutcome::Success => {
                let result = EnrollmentResult {
                    enroll_id,
                    device_id: target.device_id.clone(),
                    channel_cluster_id: cluster_id_for(&target.channel_endpoint),
                    enrolled_at: Utc::now(),
                };
                let confirmed = ConfirmedEnrollment {
                    owner_id: request.owner_id.clone(),
                    flow: request.flow,
                    target_project: target.target_project.clone(),
                    result: result.clone(),
                };
                if let Err(e) = self.sink.record_success(confirmed).await {
                    error!(enroll_id = %enroll_id, error = %e, "failed to record enrollment result");
                }
                info!(enroll_id = %enroll_id, "enrolled on device");
                Ok(TargetOutcome::Enrolled(result))
            }
            ExchangeOutcome::Failure(ExchangeFailure::ReplyRejected) => {
                self.sink
                    .notify_rejection(&request.owner_id, &target.target_project, request.flow)
                    .await;
                warn!(enroll_id = %enroll_id, "device rejected enrollment");
                Ok(TargetOutcome::Rejected { enroll_id })
            }
            ExchangeOutcome::Failure(reason) => {
                self.queue
                    .enqueue(QueueItem {
                        enroll_id,
                        subject_name: payload.name.clone(),
                        image_record: payload.record.clone(),
                        target_project: target.target_project.clone(),
                        device_id: target.device_id.clone(),
                        channel_endpoint: target.channel_endpoint.clone(),
                        owner_id: request.owner_id.clone(),
                        flow: request.flow,
                        created_at: Utc::now(),
                    })
                    .await?;
                Ok(TargetOutcome::Queued { enroll_id, reason })
            }
        }
    }
}

fn failed_target(
    target: &EnrollmentTarget,
    enroll_id: Option<EnrollmentId>,
    error: DomainError,
) -> TargetOutcome {
    error!(
        target_project = %target.target_project,
        device_id = %target.device_id,
        error = %error,
        "enrollment target failed"
    );
    TargetOutcome::Failed {
        enroll_id,
        error: error.to_string(),
    }
}

fn validate_target(target: &EnrollmentTarget) -> DomainResult<()> {
    if target.target_project.trim().is_empty() {
        return Err(DomainError::ValidationError(
            "target project must not be empty".to_string(),
        ));
    }
    DeviceTopics::for_device(&target.device_id)?;
    BrokerEndpoint::parse(&target.channel_endpoint)?;
    Ok(())
}

/// Decode and re-encode off the async workers
async fn prepare_source(source: ImageSource) -> DomainResult<PreparedImage> {
    tokio::task::spawn_blocking(move || match source {
        ImageSource::Encoded(bytes) => prepare_image_bytes(&bytes),
        ImageSource::DataUrl(url) => prepare_data_url(&url),
    })
    .await
    .map_err(|e| DomainError::EncodingError(format!("image task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EngineConfig;
    use crate::testing::{DeviceBehavior, FakeDevice};
    use base64::{engine::general_purpose, Engine as _};
    use enroll_common::domain::{
        MockRejectionNotifier, ProfileRecord, ProfileRepository, RejectionNotice,
    };
    use enroll_common::storage::{
        InMemoryKeyValueStore, KeyValuePendingRegistrationRepository, KeyValueProfileRepository,
    };
    use image::{DynamicImage, ImageFormat};
    use std::io::Cursor;

    struct Harness {
        service: EnrollmentService,
        store: Arc<InMemoryKeyValueStore>,
        queue: Arc<QueueStore>,
        allocator: Arc<IdAllocator>,
        profiles: Arc<KeyValueProfileRepository>,
    }

    fn harness(device: &FakeDevice, notifier: MockRejectionNotifier) -> Harness {
        let store = Arc::new(InMemoryKeyValueStore::new());
        let queue = Arc::new(QueueStore::new(store.clone()));
        let allocator = Arc::new(IdAllocator::new(queue.clone()));
        let profiles = Arc::new(KeyValueProfileRepository::new(store.clone()));
        let sink = Arc::new(ResultSink::new(
            profiles.clone(),
            Arc::new(KeyValuePendingRegistrationRepository::new(store.clone())),
            Arc::new(notifier),
        ));
        let client = Arc::new(DeviceExchangeClient::new(
            device.connector(),
            EngineConfig::default(),
        ));
        Harness {
            service: EnrollmentService::new(
                allocator.clone(),
                queue.clone(),
                client,
                sink,
                "AYTL03156426",
                "ws://broker.hivemq.com:8000/mqtt",
            ),
            store,
            queue,
            allocator,
            profiles,
        }
    }

    fn png() -> Vec<u8> {
        let mut buffer = Vec::new();
        DynamicImage::new_rgb8(64, 48)
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn request(targets: Vec<EnrollmentTarget>) -> EnrollmentRequest {
        EnrollmentRequest {
            image: ImageSource::Encoded(png()),
            subject_name: "Jane Doe".to_string(),
            owner_id: "u1".to_string(),
            flow: Flow::Profile,
            targets,
            enroll_id: None,
        }
    }

    fn target(project: &str, device_id: &str) -> EnrollmentTarget {
        EnrollmentTarget {
            target_project: project.to_string(),
            device_id: device_id.to_string(),
            channel_endpoint: "ws://broker.example.com:8000/mqtt".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_uses_default_target() {
        let device = FakeDevice::new(DeviceBehavior::Accept);
        let h = harness(&device, MockRejectionNotifier::new());
        h.profiles.put_profile(ProfileRecord::new("u1")).await.unwrap();

        let report = h.service.enroll(request(vec![])).await.unwrap();

        assert!(report.all_enrolled());
        assert_eq!(report.user_message(), ENROLLED_MESSAGE);
        assert_eq!(report.targets[0].target.target_project, DEFAULT_TARGET_PROJECT);
        assert_eq!(device.published()[0].0, "aiface/AYTL03156426/pub");

        let profile = h.profiles.get_profile("u1").await.unwrap().unwrap();
        let result = &profile.face_enrollments[DEFAULT_TARGET_PROJECT];
        assert_eq!(result.enroll_id.value(), 99);
        assert_eq!(result.channel_cluster_id, "broker.hivemq.com:8000");
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_is_queued_not_errored() {
        let device = FakeDevice::new(DeviceBehavior::Silent);
        let h = harness(&device, MockRejectionNotifier::new());

        let report = h.service.enroll(request(vec![])).await.unwrap();

        let outcome = &report.targets[0].outcome;
        assert_eq!(
            outcome,
            &TargetOutcome::Queued {
                enroll_id: EnrollmentId::new(99).unwrap(),
                reason: ExchangeFailure::TimeoutSilent,
            }
        );
        assert_eq!(report.user_message(), QUEUED_MESSAGE);

        let queued = h.queue.items().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].subject_name, "Jane Doe");
        assert_eq!(queued[0].device_id, "AYTL03156426");
        let jpeg = general_purpose::STANDARD.decode(&queued[0].image_record).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_notifies_and_is_not_queued() {
        let device = FakeDevice::new(DeviceBehavior::Reject);
        let mut notifier = MockRejectionNotifier::new();
        notifier
            .expect_notify_rejected()
            .withf(|notice: &RejectionNotice| {
                notice.owner_id == "u1" && notice.target_project == "proj-a"
            })
            .times(1)
            .returning(|_| Ok(()));
        let h = harness(&device, notifier);

        let report = h
            .service
            .enroll(request(vec![target("proj-a", "SN-1")]))
            .await
            .unwrap();

        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::Rejected { .. }
        ));
        assert_eq!(
            report.user_message(),
            ExchangeFailure::ReplyRejected.user_message()
        );
        assert!(h.queue.is_empty().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_target_gets_its_own_id() {
        let device = FakeDevice::new(DeviceBehavior::Silent);
        let h = harness(&device, MockRejectionNotifier::new());

        let report = h
            .service
            .enroll(request(vec![target("proj-a", "SN-1"), target("proj-b", "SN-2")]))
            .await
            .unwrap();

        let ids: Vec<u32> = report
            .targets
            .iter()
            .map(|r| r.outcome.enroll_id().unwrap().value())
            .collect();
        assert_eq!(ids, vec![99, 100]);
        assert_eq!(h.queue.len().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_target_failure_keeps_earlier_outcomes() {
        use enroll_common::domain::{ENROLL_ID_MAX, ENROLL_ID_MIN};
        use enroll_common::storage::{KeyValueStore, ALLOCATED_IDS_KEY};

        let device = FakeDevice::new(DeviceBehavior::Silent);
        let h = harness(&device, MockRejectionNotifier::new());
        // only 99 is left to hand out
        let taken: Vec<u32> = (ENROLL_ID_MIN + 1..=ENROLL_ID_MAX).collect();
        h.store
            .set(ALLOCATED_IDS_KEY, serde_json::json!(taken))
            .await
            .unwrap();

        let report = h
            .service
            .enroll(request(vec![target("proj-a", "SN-1"), target("proj-b", "SN-2")]))
            .await
            .unwrap();

        assert_eq!(report.targets.len(), 2);
        assert_eq!(
            report.targets[0].outcome,
            TargetOutcome::Queued {
                enroll_id: EnrollmentId::new(99).unwrap(),
                reason: ExchangeFailure::TimeoutSilent,
            }
        );
        assert!(matches!(
            report.targets[1].outcome,
            TargetOutcome::Failed { enroll_id: None, .. }
        ));
        assert!(!report.all_enrolled());
        assert_eq!(report.user_message(), FAILED_MESSAGE);
        assert_eq!(h.queue.len().await.unwrap(), 1);
        assert_eq!(device.connections(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_image_is_fatal_and_allocates_nothing() {
        let device = FakeDevice::new(DeviceBehavior::Accept);
        let h = harness(&device, MockRejectionNotifier::new());
        let mut bad = request(vec![]);
        bad.image = ImageSource::Encoded(b"not an image".to_vec());

        let result = h.service.enroll(bad).await;

        assert!(matches!(result, Err(DomainError::ImageDecodeError(_))));
        assert!(h.allocator.allocated().await.unwrap().is_empty());
        assert_eq!(device.connections(), 0);
    }

    #[tokio::test]
    async fn test_reserved_explicit_id_is_rejected() {
        let device = FakeDevice::new(DeviceBehavior::Accept);
        let h = harness(&device, MockRejectionNotifier::new());
        let mut reserved = request(vec![]);
        reserved.enroll_id = Some(42);

        let result = h.service.enroll(reserved).await;
        assert!(matches!(result, Err(DomainError::InvalidEnrollmentId(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_id_is_used() {
        let device = FakeDevice::new(DeviceBehavior::Silent);
        let h = harness(&device, MockRejectionNotifier::new());
        let mut explicit = request(vec![]);
        explicit.enroll_id = Some(4321);

        let report = h.service.enroll(explicit).await.unwrap();
        assert_eq!(report.targets[0].outcome.enroll_id().unwrap().value(), 4321);
        assert_eq!(device.published()[0].1["enrollid"], 4321);
    }

    #[tokio::test]
    async fn test_invalid_target_is_rejected_before_any_exchange() {
        let device = FakeDevice::new(DeviceBehavior::Accept);
        let h = harness(&device, MockRejectionNotifier::new());

        let result = h
            .service
            .enroll(request(vec![target("proj-a", "SN/1")]))
            .await;

        assert!(matches!(result, Err(DomainError::ValidationError(_))));
        assert_eq!(device.connections(), 0);
    }
}
