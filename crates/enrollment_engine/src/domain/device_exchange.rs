use crate::domain::{
    ConnectOptions, DeviceChannel, DeviceConnector, DeviceReply, EngineConfig, EnrollmentPayload,
    ReplyVerdict, ReplyWindow,
};
use crate::mqtt::DeviceTopics;
use chrono::Utc;
use enroll_common::domain::EnrollmentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Why an exchange did not end in a positive confirmation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeFailure {
    Connect,
    Subscribe,
    Publish,
    TimeoutSilent,
    TimeoutWithLiveness,
    ReplyRejected,
}

impl ExchangeFailure {
    /// Everything except an explicit device refusal is worth retrying
    pub fn is_retryable(self) -> bool {
        !matches!(self, ExchangeFailure::ReplyRejected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeFailure::Connect => "connect",
            ExchangeFailure::Subscribe => "subscribe",
            ExchangeFailure::Publish => "publish",
            ExchangeFailure::TimeoutSilent => "timeout_silent",
            ExchangeFailure::TimeoutWithLiveness => "timeout_with_liveness",
            ExchangeFailure::ReplyRejected => "reply_rejected",
        }
    }

    /// Text shown to the person who submitted the photo
    pub fn user_message(self) -> &'static str {
        match self {
            ExchangeFailure::Connect => {
                "We couldn't reach the face recognition service. Check your internet connection."
            }
            ExchangeFailure::Subscribe | ExchangeFailure::Publish => {
                "We couldn't send your photo to the device. Please try again."
            }
            ExchangeFailure::TimeoutSilent => {
                "The device didn't respond. It may be offline or out of range."
            }
            ExchangeFailure::TimeoutWithLiveness => {
                "The device is online but didn't confirm your photo. Please try again."
            }
            ExchangeFailure::ReplyRejected => {
                "The device couldn't use this photo. Please upload a clearer photo of your face."
            }
        }
    }
}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Success,
    Failure(ExchangeFailure),
}

/// Observable phase of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Connecting,
    Subscribing,
    ArmingDelay,
    Publishing,
    AwaitingReply,
    Resolved(ExchangeOutcome),
}

/// What to send, and where
#[derive(Debug, Clone)]
pub struct ExchangeRequest<'a> {
    pub channel_endpoint: &'a str,
    pub device_id: &'a str,
    pub enroll_id: EnrollmentId,
    pub payload: &'a EnrollmentPayload,
}

/// Outcome plus every state the exchange passed through
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReport {
    pub outcome: ExchangeOutcome,
    pub transitions: Vec<ExchangeState>,
}

/// Internal state carrying the live channel between phases
enum Step {
    Idle,
    Connecting,
    Subscribing(Box<dyn DeviceChannel>),
    ArmingDelay(Box<dyn DeviceChannel>),
    Publishing(Box<dyn DeviceChannel>),
    AwaitingReply(Box<dyn DeviceChannel>),
    Resolved(Option<Box<dyn DeviceChannel>>, ExchangeOutcome),
}

impl Step {
    fn state(&self) -> ExchangeState {
        match self {
            Step::Idle => ExchangeState::Idle,
            Step::Connecting => ExchangeState::Connecting,
            Step::Subscribing(_) => ExchangeState::Subscribing,
            Step::ArmingDelay(_) => ExchangeState::ArmingDelay,
            Step::Publishing(_) => ExchangeState::Publishing,
            Step::AwaitingReply(_) => ExchangeState::AwaitingReply,
            Step::Resolved(_, outcome) => ExchangeState::Resolved(*outcome),
        }
    }
}

/// Drives single request/reply exchanges with a device.
///
/// Each exchange opens its own session, so concurrent exchanges never share
/// broker state. Every path ends in exactly one [`ExchangeOutcome`] and the
/// session is closed before it is returned.
pub struct DeviceExchangeClient {
    connector: Arc<dyn DeviceConnector>,
    config: EngineConfig,
}

impl DeviceExchangeClient {
    pub fn new(connector: Arc<dyn DeviceConnector>, config: EngineConfig) -> Self {
        Self { connector, config }
    }

    pub async fn execute(&self, request: &ExchangeRequest<'_>) -> ExchangeOutcome {
        self.execute_with_report(request).await.outcome
    }

    #[instrument(
        name = "device_exchange",
        skip_all,
        fields(
            device_id = %request.device_id,
            enroll_id = %request.enroll_id,
        )
    )]
    pub async fn execute_with_report(&self, request: &ExchangeRequest<'_>) -> ExchangeReport {
        let mut transitions = vec![ExchangeState::Idle];
        let mut step = Step::Idle;

        let topics = match DeviceTopics::for_device(request.device_id) {
            Ok(topics) => topics,
            Err(e) => {
                warn!(error = %e, "device cannot be addressed, not connecting");
                let outcome = ExchangeOutcome::Failure(ExchangeFailure::Connect);
                transitions.push(ExchangeState::Connecting);
                transitions.push(ExchangeState::Resolved(outcome));
                return ExchangeReport {
                    outcome,
                    transitions,
                };
            }
        };

        loop {
            step = match step {
                Step::Idle => Step::Connecting,
                Step::Connecting => self.connect(request).await,
                Step::Subscribing(mut channel) => match channel.subscribe(&topics.reply).await {
                    Ok(()) => Step::ArmingDelay(channel),
                    Err(e) => {
                        warn!(error = %e, topic = %topics.reply, "subscribe failed");
                        Step::Resolved(
                            Some(channel),
                            ExchangeOutcome::Failure(ExchangeFailure::Subscribe),
                        )
                    }
                },
                Step::ArmingDelay(channel) => {
                    tokio::time::sleep(self.config.arming_delay()).await;
                    Step::Publishing(channel)
                }
                Step::Publishing(mut channel) => {
                    match self.publish(channel.as_mut(), request, &topics.command).await {
                        Ok(()) => Step::AwaitingReply(channel),
                        Err(failure) => Step::Resolved(Some(channel), ExchangeOutcome::Failure(failure)),
                    }
                }
                Step::AwaitingReply(mut channel) => {
                    let outcome = self
                        .await_reply(channel.as_mut(), request.enroll_id, &topics.reply)
                        .await;
                    Step::Resolved(Some(channel), outcome)
                }
                Step::Resolved(channel, outcome) => {
                    if let Some(mut channel) = channel {
                        channel.disconnect().await;
                    }
                    match outcome {
                        ExchangeOutcome::Success => info!("device confirmed enrollment"),
                        ExchangeOutcome::Failure(failure) => {
                            info!(failure = %failure, retryable = failure.is_retryable(), "exchange failed")
                        }
                    }
                    return ExchangeReport {
                        outcome,
                        transitions,
                    };
                }
            };

            let state = step.state();
            debug!(state = ?state, "exchange transition");
            transitions.push(state);
        }
    }

    async fn connect(&self, request: &ExchangeRequest<'_>) -> Step {
        let options = ConnectOptions {
            client_id: format!(
                "face-enroll-{}-{}-{}",
                request.device_id,
                request.enroll_id,
                Utc::now().timestamp_millis()
            ),
            connect_timeout: self.config.connect_timeout(),
            ack_timeout: self.config.ack_timeout(),
            keep_alive: self.config.keep_alive(),
        };

        match self
            .connector
            .connect(request.channel_endpoint, &options)
            .await
        {
            Ok(channel) => Step::Subscribing(channel),
            Err(e) => {
                warn!(error = %e, endpoint = %request.channel_endpoint, "connect failed");
                Step::Resolved(None, ExchangeOutcome::Failure(ExchangeFailure::Connect))
            }
        }
    }

    async fn publish(
        &self,
        channel: &mut dyn DeviceChannel,
        request: &ExchangeRequest<'_>,
        topic: &str,
    ) -> Result<(), ExchangeFailure> {
        let bytes = request.payload.to_bytes().map_err(|e| {
            warn!(error = %e, "failed to serialize payload");
            ExchangeFailure::Publish
        })?;

        channel.publish(topic, bytes).await.map_err(|e| {
            warn!(error = %e, topic = %topic, "publish failed");
            ExchangeFailure::Publish
        })
    }

    /// Wait for the positive confirmation until the reply timer fires
    async fn await_reply(
        &self,
        channel: &mut dyn DeviceChannel,
        enroll_id: EnrollmentId,
        reply_topic: &str,
    ) -> ExchangeOutcome {
        let deadline = Instant::now() + self.config.reply_timeout();
        let mut window = ReplyWindow::new(enroll_id);

        loop {
            let message = match tokio::time::timeout_at(deadline, channel.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    warn!("connection closed while awaiting reply");
                    break;
                }
                Err(_) => break,
            };

            if message.topic != reply_topic {
                continue;
            }

            let reply = match DeviceReply::parse(&message.payload) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable device message");
                    continue;
                }
            };

            if reply.is_heartbeat() {
                debug!("device heartbeat");
            }
            if window.observe(&reply) == ReplyVerdict::Confirmed {
                return ExchangeOutcome::Success;
            }
        }

        let observation = window.observation();
        debug!(
            saw_heartbeat = observation.saw_heartbeat,
            saw_negative_reply = observation.saw_negative_reply,
            "reply window closed"
        );
        ExchangeOutcome::Failure(window.timeout_failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::build_payload;
    use crate::testing::{DeviceBehavior, FakeDevice};
    use std::time::Duration;

    fn client(device: &FakeDevice) -> DeviceExchangeClient {
        DeviceExchangeClient::new(device.connector(), EngineConfig::default())
    }

    async fn run(device: &FakeDevice, enroll_id: u32) -> ExchangeReport {
        let enroll_id = EnrollmentId::new(enroll_id).unwrap();
        let payload = build_payload(enroll_id, "Jane", "QUJD");
        let request = ExchangeRequest {
            channel_endpoint: "ws://broker.example.com:8000/mqtt",
            device_id: "SN-1",
            enroll_id,
            payload: &payload,
        };
        client(device).execute_with_report(&request).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_transitions() {
        let device = FakeDevice::new(DeviceBehavior::Accept);
        let report = run(&device, 150).await;

        assert_eq!(report.outcome, ExchangeOutcome::Success);
        assert_eq!(
            report.transitions,
            vec![
                ExchangeState::Idle,
                ExchangeState::Connecting,
                ExchangeState::Subscribing,
                ExchangeState::ArmingDelay,
                ExchangeState::Publishing,
                ExchangeState::AwaitingReply,
                ExchangeState::Resolved(ExchangeOutcome::Success),
            ]
        );
        assert_eq!(device.subscriptions(), vec!["aiface/SN-1/sub".to_string()]);
        let published = device.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "aiface/SN-1/pub");
        assert_eq!(published[0].1["enrollid"], 150);
        assert_eq!(device.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arming_delay_precedes_publish() {
        let device = FakeDevice::new(DeviceBehavior::Accept);
        let started = Instant::now();
        run(&device, 150).await;

        let published_at = device.published_at()[0];
        assert!(published_at - started >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure() {
        let device = FakeDevice::new(DeviceBehavior::Unreachable);
        let report = run(&device, 150).await;

        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::Connect)
        );
        assert_eq!(
            report.transitions.last(),
            Some(&ExchangeState::Resolved(ExchangeOutcome::Failure(
                ExchangeFailure::Connect
            )))
        );
        assert!(device.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unaddressable_device_never_connects() {
        let device = FakeDevice::new(DeviceBehavior::Accept);
        let enroll_id = EnrollmentId::new(150).unwrap();
        let payload = build_payload(enroll_id, "Jane", "QUJD");
        let request = ExchangeRequest {
            channel_endpoint: "ws://broker.example.com:8000/mqtt",
            device_id: "SN/1",
            enroll_id,
            payload: &payload,
        };

        let report = client(&device).execute_with_report(&request).await;

        let failed = ExchangeOutcome::Failure(ExchangeFailure::Connect);
        assert_eq!(report.outcome, failed);
        assert_eq!(
            report.transitions,
            vec![
                ExchangeState::Idle,
                ExchangeState::Connecting,
                ExchangeState::Resolved(failed),
            ]
        );
        assert_eq!(device.connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_publishes_nothing() {
        let device = FakeDevice::new(DeviceBehavior::SubscribeFails);
        let report = run(&device, 150).await;

        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::Subscribe)
        );
        assert!(device.published().is_empty());
        assert_eq!(device.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure() {
        let device = FakeDevice::new(DeviceBehavior::PublishFails);
        let report = run(&device, 150).await;
        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::Publish)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out_after_reply_window() {
        let device = FakeDevice::new(DeviceBehavior::Silent);
        let started = Instant::now();
        let report = run(&device, 150).await;

        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::TimeoutSilent)
        );
        assert!(Instant::now() - started >= Duration::from_secs(13));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_then_silence_is_timeout_with_liveness() {
        let device = FakeDevice::new(DeviceBehavior::HeartbeatOnly);
        let report = run(&device, 150).await;
        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::TimeoutWithLiveness)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_reply_resolves_rejected_at_timeout() {
        let device = FakeDevice::new(DeviceBehavior::Reject);
        let started = Instant::now();
        let report = run(&device, 150).await;

        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::ReplyRejected)
        );
        assert!(Instant::now() - started >= Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_reply_after_negative_wins() {
        let device = FakeDevice::new(DeviceBehavior::Script(vec![
            serde_json::json!({"ret": "setuserinfo", "enrollid": 150, "result": false}),
            serde_json::json!({"ret": "setuserinfo", "enrollid": "150", "result": true}),
        ]));
        let report = run(&device, 150).await;
        assert_eq!(report.outcome, ExchangeOutcome::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_for_other_ids_and_garbage_are_ignored() {
        let device = FakeDevice::new(DeviceBehavior::Script(vec![
            serde_json::json!({"ret": "setuserinfo", "enrollid": 151, "result": true}),
            serde_json::json!("not an object"),
            serde_json::json!({"cmd": "checklive"}),
        ]));
        let report = run(&device, 150).await;
        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::TimeoutWithLiveness)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_drop_classifies_immediately() {
        let device = FakeDevice::new(DeviceBehavior::DropAfterHeartbeat);
        let started = Instant::now();
        let report = run(&device, 150).await;

        assert_eq!(
            report.outcome,
            ExchangeOutcome::Failure(ExchangeFailure::TimeoutWithLiveness)
        );
        assert!(Instant::now() - started < Duration::from_secs(12));
    }

    #[test]
    fn test_retryable_classification() {
        for failure in [
            ExchangeFailure::Connect,
            ExchangeFailure::Subscribe,
            ExchangeFailure::Publish,
            ExchangeFailure::TimeoutSilent,
            ExchangeFailure::TimeoutWithLiveness,
        ] {
            assert!(failure.is_retryable(), "{}", failure);
        }
        assert!(!ExchangeFailure::ReplyRejected.is_retryable());
    }
}
