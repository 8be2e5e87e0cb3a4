use enroll_common::domain::{
    Flow, PendingRegistrationRepository, ProfileRecord, ProfileRepository,
};
use enroll_common::storage::{
    KeyValueNotificationOutbox, KeyValuePendingRegistrationRepository, KeyValueProfileRepository,
    KeyValueStore, SqliteKeyValueStore,
};
use enrollment_engine::testing::{DeviceBehavior, FakeDevice};
use enrollment_engine::{
    EngineConfig, EnrollmentEngine, EnrollmentEngineConfig, EnrollmentRequest, ImageSource,
    ResultSink, TargetOutcome, TriggerSource,
};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_config() -> EngineConfig {
    EngineConfig {
        reply_timeout_secs: 1,
        arming_delay_ms: 10,
        ..EngineConfig::default()
    }
}

struct App {
    engine: EnrollmentEngine,
    profiles: Arc<KeyValueProfileRepository>,
    pending: Arc<KeyValuePendingRegistrationRepository>,
    outbox: Arc<KeyValueNotificationOutbox>,
}

fn start_app(path: &Path, device: &FakeDevice) -> App {
    let store: Arc<dyn KeyValueStore> = Arc::new(SqliteKeyValueStore::open(path).unwrap());
    let profiles = Arc::new(KeyValueProfileRepository::new(Arc::clone(&store)));
    let pending = Arc::new(KeyValuePendingRegistrationRepository::new(Arc::clone(&store)));
    let outbox = Arc::new(KeyValueNotificationOutbox::new(Arc::clone(&store)));
    let sink = Arc::new(ResultSink::new(
        profiles.clone(),
        pending.clone(),
        outbox.clone(),
    ));

    let engine = EnrollmentEngine::new(
        store,
        device.connector(),
        sink,
        EnrollmentEngineConfig {
            engine: fast_config(),
            default_device_id: "AYTL03156426".to_string(),
            default_channel_endpoint: "ws://broker.hivemq.com:8000/mqtt".to_string(),
        },
    );
    App {
        engine,
        profiles,
        pending,
        outbox,
    }
}

fn photo() -> ImageSource {
    let mut buffer = Vec::new();
    DynamicImage::new_rgb8(640, 480)
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
        .unwrap();
    ImageSource::Encoded(buffer)
}

fn request(owner_id: &str, flow: Flow, enroll_id: Option<u32>) -> EnrollmentRequest {
    EnrollmentRequest {
        image: photo(),
        subject_name: "Jane Doe".to_string(),
        owner_id: owner_id.to_string(),
        flow,
        targets: vec![],
        enroll_id,
    }
}

#[tokio::test]
async fn test_queued_enrollment_survives_restart_and_lands_on_profile() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("enroll.db");

    let offline = FakeDevice::new(DeviceBehavior::Unreachable);
    {
        let app = start_app(&db, &offline);
        app.profiles
            .put_profile(ProfileRecord::new("u1"))
            .await
            .unwrap();

        let report = app
            .engine
            .service()
            .enroll(request("u1", Flow::Profile, Some(150)))
            .await
            .unwrap();
        assert!(matches!(
            report.targets[0].outcome,
            TargetOutcome::Queued { .. }
        ));
    }

    let online = FakeDevice::new(DeviceBehavior::Accept);
    let app = start_app(&db, &online);
    let head = app.engine.queue().peek_head().await.unwrap().unwrap();
    assert_eq!(head.enroll_id.value(), 150);
    assert_eq!(head.owner_id, "u1");
    assert_eq!(head.flow, Flow::Profile);

    let runner_token = CancellationToken::new();
    let queue = app.engine.queue();
    let profiles = app.profiles.clone();
    let handle = tokio::spawn((app.engine.into_runner_process())(runner_token.clone()));

    for _ in 0..100 {
        if queue.is_empty().await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(queue.is_empty().await.unwrap());

    let profile = profiles.get_profile("u1").await.unwrap().unwrap();
    let result = &profile.face_enrollments["default"];
    assert_eq!(result.enroll_id.value(), 150);
    assert_eq!(result.device_id, "AYTL03156426");
    assert_eq!(result.channel_cluster_id, "broker.hivemq.com:8000");

    runner_token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_always_unreachable_device_never_drops_item() {
    let dir = tempfile::tempdir().unwrap();
    let device = FakeDevice::new(DeviceBehavior::Unreachable);
    let app = start_app(&dir.path().join("enroll.db"), &device);

    app.engine
        .service()
        .enroll(request("u1", Flow::Profile, None))
        .await
        .unwrap();

    let queue = app.engine.queue();
    assert_eq!(queue.len().await.unwrap(), 1);

    let trigger = app.engine.trigger();
    let token = CancellationToken::new();
    let handle = tokio::spawn((app.engine.into_runner_process())(token.clone()));

    for source in [TriggerSource::NetworkReachable, TriggerSource::Foregrounded] {
        trigger.fire(source);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(queue.len().await.unwrap(), 1);
    assert!(device.connections() >= 3);
    assert!(app.profiles.get_profile("u1").await.unwrap().is_none());

    token.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_registration_rejection_then_success_and_migration() {
    let dir = tempfile::tempdir().unwrap();
    let device = FakeDevice::new(DeviceBehavior::Accept).then(DeviceBehavior::Reject);
    let app = start_app(&dir.path().join("enroll.db"), &device);

    let rejected = app
        .engine
        .service()
        .enroll(request("temp-1", Flow::Registration, None))
        .await
        .unwrap();
    assert!(matches!(
        rejected.targets[0].outcome,
        TargetOutcome::Rejected { .. }
    ));
    let notifications = app.outbox.pending().await.unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].url, "/register/face-verification");
    assert!(app.engine.queue().is_empty().await.unwrap());

    let accepted = app
        .engine
        .service()
        .enroll(request("temp-1", Flow::Registration, None))
        .await
        .unwrap();
    assert!(accepted.all_enrolled());
    assert_eq!(app.pending.list("temp-1").await.unwrap().len(), 1);

    app.profiles
        .put_profile(ProfileRecord::new("acct-1"))
        .await
        .unwrap();
    let migrated = app
        .engine
        .sink()
        .migrate_pending_registration("temp-1", "acct-1")
        .await
        .unwrap();
    assert_eq!(migrated, 1);

    let profile = app.profiles.get_profile("acct-1").await.unwrap().unwrap();
    assert_eq!(profile.face_enrollments["default"].enroll_id.value(), 100);
    assert!(app.engine.sink().pending_for("temp-1").await.unwrap().is_empty());
}
