use config::{Config, ConfigError, Environment};
use enroll_common::telemetry::TelemetryConfig;
use enrollment_engine::EngineConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // OpenTelemetry configuration
    /// OTLP endpoint traces are exported to
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Export traces over OTLP
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    /// Service name reported to the collector
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,

    // Storage configuration
    /// SQLite file holding the queue, allocated IDs, profiles and outbox
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    // Device defaults
    /// Broker used when a request names no targets
    #[serde(default = "default_broker_url")]
    pub default_broker_url: String,

    /// Device used when a request names no targets
    #[serde(default = "default_device_id")]
    pub default_device_id: String,

    // Exchange timing
    /// Seconds to wait for a device reply after publishing
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,

    /// Milliseconds between SUBACK and publishing the command
    #[serde(default = "default_arming_delay_ms")]
    pub arming_delay_ms: u64,

    /// Seconds allowed for CONNACK
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Seconds allowed for SUBACK and PUBACK
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// MQTT keep-alive in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    // Queue triggers
    /// Seconds between periodic queue passes
    #[serde(default = "default_queue_retry_interval_secs")]
    pub queue_retry_interval_secs: u64,

    /// Seconds between broker reachability probes
    #[serde(default = "default_connectivity_probe_interval_secs")]
    pub connectivity_probe_interval_secs: u64,

    /// Seconds a single reachability probe may take
    #[serde(default = "default_connectivity_probe_timeout_secs")]
    pub connectivity_probe_timeout_secs: u64,

    /// Seconds the shutdown closers may take in total
    #[serde(default = "default_closer_timeout_secs")]
    pub closer_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "face-enroll".to_string()
}

fn default_sqlite_path() -> String {
    "face_enroll.db".to_string()
}

fn default_broker_url() -> String {
    "ws://broker.hivemq.com:8000/mqtt".to_string()
}

fn default_device_id() -> String {
    "AYTL03156426".to_string()
}

fn default_reply_timeout_secs() -> u64 {
    12
}

fn default_arming_delay_ms() -> u64 {
    1000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_ack_timeout_secs() -> u64 {
    10
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_queue_retry_interval_secs() -> u64 {
    1800
}

fn default_connectivity_probe_interval_secs() -> u64 {
    30
}

fn default_connectivity_probe_timeout_secs() -> u64 {
    5
}

fn default_closer_timeout_secs() -> u64 {
    10
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("FACE_ENROLL"))
            .build()?
            .try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reply_timeout_secs: self.reply_timeout_secs,
            arming_delay_ms: self.arming_delay_ms,
            connect_timeout_secs: self.connect_timeout_secs,
            ack_timeout_secs: self.ack_timeout_secs,
            keep_alive_secs: self.keep_alive_secs,
            queue_retry_interval_secs: self.queue_retry_interval_secs,
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.otel_service_name.clone(),
            otel_endpoint: self.otel_endpoint.clone(),
            otel_enabled: self.otel_enabled,
            log_level: self.log_level.clone(),
        }
    }

    pub fn connectivity_probe_interval(&self) -> Duration {
        Duration::from_secs(self.connectivity_probe_interval_secs)
    }

    pub fn connectivity_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.connectivity_probe_timeout_secs)
    }

    pub fn closer_timeout(&self) -> Duration {
        Duration::from_secs(self.closer_timeout_secs)
    }
}
