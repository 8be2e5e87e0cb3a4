use crate::domain::{
    build_payload, ConfirmedEnrollment, DeviceExchangeClient, ExchangeFailure, ExchangeOutcome,
    ExchangeRequest, QueueStore, ResultSink,
};
use chrono::Utc;
use enroll_common::domain::{DomainResult, EnrollmentId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What asked for a queue pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Startup,
    Interval,
    NetworkReachable,
    Foregrounded,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerSource::Startup => "startup",
            TriggerSource::Interval => "interval",
            TriggerSource::NetworkReachable => "network_reachable",
            TriggerSource::Foregrounded => "foregrounded",
            TriggerSource::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Result of one queue pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Another pass was already running
    Coalesced,
    Empty,
    Enrolled(EnrollmentId),
    Rejected(EnrollmentId),
    /// Retryable failure; the item stays at the head
    Retained(EnrollmentId, ExchangeFailure),
}

/// Clears the in-flight flag however the pass ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Re-drives the queue head through the device exchange, one item per pass.
///
/// At most one pass runs at a time; a trigger arriving during a pass is
/// coalesced rather than queued.
pub struct QueueProcessor {
    queue: Arc<QueueStore>,
    client: Arc<DeviceExchangeClient>,
    sink: Arc<ResultSink>,
    in_flight: AtomicBool,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<QueueStore>,
        client: Arc<DeviceExchangeClient>,
        sink: Arc<ResultSink>,
    ) -> Self {
        Self {
            queue,
            client,
            sink,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Attempt the head item once
    #[instrument(name = "queue_pass", skip(self, trigger), fields(trigger = %trigger))]
    pub async fn process_next(&self, trigger: TriggerSource) -> DomainResult<ProcessOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("queue pass already running, trigger coalesced");
            return Ok(ProcessOutcome::Coalesced);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let Some(item) = self.queue.peek_head().await? else {
            debug!("queue empty");
            return Ok(ProcessOutcome::Empty);
        };

        let payload = build_payload(item.enroll_id, &item.subject_name, &item.image_record);
        let request = ExchangeRequest {
            channel_endpoint: &item.channel_endpoint,
            device_id: &item.device_id,
            enroll_id: item.enroll_id,
            payload: &payload,
        };

        match self.client.execute(&request).await {
            ExchangeOutcome::Success => {
                let confirmed = ConfirmedEnrollment::from_queue_item(&item, Utc::now());
                if let Err(e) = self.sink.record_success(confirmed).await {
                    error!(
                        enroll_id = %item.enroll_id,
                        owner_id = %item.owner_id,
                        error = %e,
                        "failed to record enrollment result"
                    );
                }
                self.queue.remove_head(item.enroll_id).await?;
                info!(enroll_id = %item.enroll_id, "queued enrollment delivered");
                Ok(ProcessOutcome::Enrolled(item.enroll_id))
            }
            ExchangeOutcome::Failure(ExchangeFailure::ReplyRejected) => {
                self.sink
                    .notify_rejection(&item.owner_id, &item.target_project, item.flow)
                    .await;
                self.queue.remove_head(item.enroll_id).await?;
                warn!(enroll_id = %item.enroll_id, "queued enrollment rejected by device");
                Ok(ProcessOutcome::Rejected(item.enroll_id))
            }
            ExchangeOutcome::Failure(failure) => {
                info!(enroll_id = %item.enroll_id, failure = %failure, "queued enrollment retained");
                Ok(ProcessOutcome::Retained(item.enroll_id, failure))
            }
        }
    }

    async fn process_and_log(&self, trigger: TriggerSource) {
        if let Err(e) = self.process_next(trigger).await {
            error!(trigger = %trigger, error = %e, "queue pass failed");
        }
    }

    /// Run a pass at startup, on every interval tick and on every trigger
    /// until the token is cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<TriggerSource>,
        interval: Duration,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        info!(interval_secs = interval.as_secs(), "queue processor started");
        self.process_and_log(TriggerSource::Startup).await;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("queue processor stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.process_and_log(TriggerSource::Interval).await;
                }
                trigger = triggers.recv(), if triggers_open => match trigger {
                    Some(source) => self.process_and_log(source).await,
                    None => {
                        debug!("trigger channel closed, interval only");
                        triggers_open = false;
                    }
                },
            }
        }
    }
}

/// Sender half used by trigger sources
#[derive(Debug, Clone)]
pub struct ProcessorTrigger {
    sender: mpsc::Sender<TriggerSource>,
}

impl ProcessorTrigger {
    /// Request a pass. Returns false when one is already pending.
    pub fn fire(&self, source: TriggerSource) -> bool {
        match self.sender.try_send(source) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(trigger = %source, "pass already pending, trigger coalesced");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(trigger = %source, "queue processor is not running");
                false
            }
        }
    }
}

/// Capacity one: at most one pass waits behind the running one
pub fn trigger_channel() -> (ProcessorTrigger, mpsc::Receiver<TriggerSource>) {
    let (sender, receiver) = mpsc::channel(1);
    (ProcessorTrigger { sender }, receiver)
}
