use crate::domain::{ExchangeFailure, SET_USER_INFO_COMMAND};
use enroll_common::domain::EnrollmentId;
use serde::Deserialize;
use serde_json::Value;

/// Liveness command the device emits periodically
pub const HEARTBEAT_COMMAND: &str = "checklive";

/// Any JSON object the device publishes on its reply topic.
///
/// Only the fields the exchange inspects are modelled; everything else is
/// ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceReply {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub ret: Option<String>,
    #[serde(default)]
    pub enrollid: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl DeviceReply {
    pub fn parse(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.cmd.as_deref() == Some(HEARTBEAT_COMMAND)
    }

    /// `Some(accepted)` when this is the `setuserinfo` reply for `enroll_id`.
    ///
    /// The device may send the ID as a number or a numeric string; only a
    /// literal boolean `true` counts as acceptance.
    pub fn confirmation_for(&self, enroll_id: EnrollmentId) -> Option<bool> {
        if self.ret.as_deref() != Some(SET_USER_INFO_COMMAND) {
            return None;
        }
        if !self.enrollid.as_ref().is_some_and(|raw| id_matches(raw, enroll_id)) {
            return None;
        }
        Some(matches!(self.result, Some(Value::Bool(true))))
    }
}

fn id_matches(raw: &Value, enroll_id: EnrollmentId) -> bool {
    let expected = f64::from(enroll_id.value());
    match raw {
        Value::Number(number) => number.as_f64() == Some(expected),
        Value::String(text) => text.trim().parse::<f64>().ok() == Some(expected),
        _ => false,
    }
}

/// What the awaiting-reply phase has seen so far
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyObservation {
    pub saw_heartbeat: bool,
    pub saw_negative_reply: bool,
}

/// Result of feeding one reply into the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    Confirmed,
    Pending,
}

/// Classifies replies for one enrollment ID until the timer fires
#[derive(Debug, Clone)]
pub struct ReplyWindow {
    enroll_id: EnrollmentId,
    observation: ReplyObservation,
}

impl ReplyWindow {
    pub fn new(enroll_id: EnrollmentId) -> Self {
        Self {
            enroll_id,
            observation: ReplyObservation::default(),
        }
    }

    pub fn observation(&self) -> ReplyObservation {
        self.observation
    }

    /// Record a reply. A negative confirmation does not end the window.
    pub fn observe(&mut self, reply: &DeviceReply) -> ReplyVerdict {
        if reply.is_heartbeat() {
            self.observation.saw_heartbeat = true;
        }
        match reply.confirmation_for(self.enroll_id) {
            Some(true) => ReplyVerdict::Confirmed,
            Some(false) => {
                self.observation.saw_negative_reply = true;
                ReplyVerdict::Pending
            }
            None => ReplyVerdict::Pending,
        }
    }

    /// Failure reported when no positive confirmation arrived in time
    pub fn timeout_failure(&self) -> ExchangeFailure {
        if self.observation.saw_negative_reply {
            ExchangeFailure::ReplyRejected
        } else if self.observation.saw_heartbeat {
            ExchangeFailure::TimeoutWithLiveness
        } else {
            ExchangeFailure::TimeoutSilent
        }
    }
}
