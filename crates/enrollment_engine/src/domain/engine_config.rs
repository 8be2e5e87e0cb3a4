use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long to wait for the device's confirmation after publishing (default: 12 seconds)
    pub reply_timeout_secs: u64,

    /// Pause between subscribe acknowledgment and publish (default: 1000 ms)
    pub arming_delay_ms: u64,

    /// Bound on establishing the broker connection (default: 10 seconds)
    pub connect_timeout_secs: u64,

    /// Bound on subscribe and publish acknowledgments (default: 10 seconds)
    pub ack_timeout_secs: u64,

    /// MQTT keep-alive interval (default: 60 seconds)
    pub keep_alive_secs: u64,

    /// Interval between scheduled queue passes (default: 30 minutes)
    pub queue_retry_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reply_timeout_secs: 12,
            arming_delay_ms: 1000,
            connect_timeout_secs: 10,
            ack_timeout_secs: 10,
            keep_alive_secs: 60,
            queue_retry_interval_secs: 30 * 60,
        }
    }
}

impl EngineConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn arming_delay(&self) -> Duration {
        Duration::from_millis(self.arming_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn queue_retry_interval(&self) -> Duration {
        Duration::from_secs(self.queue_retry_interval_secs)
    }
}
