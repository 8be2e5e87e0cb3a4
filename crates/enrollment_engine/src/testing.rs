//! In-process stand-in for a device behind a broker.

use crate::domain::{ChannelError, ConnectOptions, DeviceChannel, DeviceConnector, InboundMessage};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

/// How the fake device reacts to one exchange
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceBehavior {
    Unreachable,
    SubscribeFails,
    PublishFails,
    Silent,
    HeartbeatOnly,
    /// Heartbeat, then the connection drops
    DropAfterHeartbeat,
    Accept,
    Reject,
    /// Publish these JSON values on the reply topic after the command arrives
    Script(Vec<Value>),
}

#[derive(Default)]
struct DeviceLog {
    behaviors: VecDeque<DeviceBehavior>,
    connections: usize,
    subscriptions: Vec<String>,
    published: Vec<(String, Value)>,
    published_at: Vec<Instant>,
    disconnects: usize,
}

/// Fake device whose behavior can change per connection.
///
/// Behaviors queued with [`FakeDevice::then`] are consumed one per
/// connection; once exhausted the default applies.
#[derive(Clone)]
pub struct FakeDevice {
    default: DeviceBehavior,
    log: Arc<Mutex<DeviceLog>>,
}

impl FakeDevice {
    pub fn new(default: DeviceBehavior) -> Self {
        Self {
            default,
            log: Arc::new(Mutex::new(DeviceLog::default())),
        }
    }

    /// Queue a behavior for the next unclaimed connection
    pub fn then(self, behavior: DeviceBehavior) -> Self {
        self.log().behaviors.push_back(behavior);
        self
    }

    pub fn connector(&self) -> Arc<dyn DeviceConnector> {
        Arc::new(FakeConnector {
            device: self.clone(),
        })
    }

    pub fn connections(&self) -> usize {
        self.log().connections
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.log().subscriptions.clone()
    }

    /// (topic, decoded JSON) of every command received
    pub fn published(&self) -> Vec<(String, Value)> {
        self.log().published.clone()
    }

    pub fn published_at(&self) -> Vec<Instant> {
        self.log().published_at.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.log().disconnects
    }

    fn log(&self) -> MutexGuard<'_, DeviceLog> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn next_behavior(&self) -> DeviceBehavior {
        let mut log = self.log();
        log.connections += 1;
        log.behaviors
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

struct FakeConnector {
    device: FakeDevice,
}

#[async_trait]
impl DeviceConnector for FakeConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        _options: &ConnectOptions,
    ) -> Result<Box<dyn DeviceChannel>, ChannelError> {
        let behavior = self.device.next_behavior();
        if behavior == DeviceBehavior::Unreachable {
            return Err(ChannelError::Connect("device unreachable".to_string()));
        }
        Ok(Box::new(FakeChannel {
            device: self.device.clone(),
            behavior,
            reply_topic: None,
            inbox: VecDeque::new(),
            drop_when_empty: false,
        }))
    }
}

struct FakeChannel {
    device: FakeDevice,
    behavior: DeviceBehavior,
    reply_topic: Option<String>,
    inbox: VecDeque<InboundMessage>,
    drop_when_empty: bool,
}

impl FakeChannel {
    fn push_reply(&mut self, value: Value) {
        if let Some(topic) = &self.reply_topic {
            self.inbox.push_back(InboundMessage {
                topic: topic.clone(),
                payload: value.to_string().into_bytes(),
            });
        }
    }
}

#[async_trait]
impl DeviceChannel for FakeChannel {
    async fn subscribe(&mut self, topic: &str) -> Result<(), ChannelError> {
        if self.behavior == DeviceBehavior::SubscribeFails {
            return Err(ChannelError::Subscribe("not authorized".to_string()));
        }
        self.device.log().subscriptions.push(topic.to_string());
        self.reply_topic = Some(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.behavior == DeviceBehavior::PublishFails {
            return Err(ChannelError::Publish("connection reset".to_string()));
        }

        let command: Value = serde_json::from_slice(&payload)
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        let enroll_id = command["enrollid"].clone();
        {
            let mut log = self.device.log();
            log.published.push((topic.to_string(), command));
            log.published_at.push(Instant::now());
        }

        match self.behavior.clone() {
            DeviceBehavior::HeartbeatOnly => self.push_reply(json!({"cmd": "checklive"})),
            DeviceBehavior::DropAfterHeartbeat => {
                self.push_reply(json!({"cmd": "checklive"}));
                self.drop_when_empty = true;
            }
            DeviceBehavior::Accept => self.push_reply(
                json!({"ret": "setuserinfo", "enrollid": enroll_id, "result": true}),
            ),
            DeviceBehavior::Reject => self.push_reply(
                json!({"ret": "setuserinfo", "enrollid": enroll_id, "result": false}),
            ),
            DeviceBehavior::Script(replies) => {
                for reply in replies {
                    self.push_reply(reply);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        if let Some(message) = self.inbox.pop_front() {
            return Some(message);
        }
        if self.drop_when_empty {
            return None;
        }
        std::future::pending().await
    }

    async fn disconnect(&mut self) {
        self.device.log().disconnects += 1;
    }
}
