use enroll_common::domain::{DomainError, DomainResult};

const TOPIC_ROOT: &str = "aiface";

/// Topic pair a device listens and answers on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    /// Commands to the device: `aiface/{deviceId}/pub`
    pub command: String,
    /// Replies and heartbeats from the device: `aiface/{deviceId}/sub`
    pub reply: String,
}

impl DeviceTopics {
    /// Derive the topics for a device serial.
    ///
    /// Serials containing MQTT level separators or wildcards are rejected.
    ///
    /// ```
    /// use enrollment_engine::mqtt::DeviceTopics;
    ///
    /// let topics = DeviceTopics::for_device("AYTL03156426").unwrap();
    /// assert_eq!(topics.reply, "aiface/AYTL03156426/sub");
    /// assert!(DeviceTopics::for_device("SN/1").is_err());
    /// ```
    pub fn for_device(device_id: &str) -> DomainResult<Self> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return Err(DomainError::ValidationError(
                "Device ID cannot be empty".to_string(),
            ));
        }
        if device_id.contains(['/', '+', '#']) {
            return Err(DomainError::ValidationError(format!(
                "Device ID '{}' contains MQTT topic separators",
                device_id
            )));
        }

        Ok(Self {
            command: format!("{}/{}/pub", TOPIC_ROOT, device_id),
            reply: format!("{}/{}/sub", TOPIC_ROOT, device_id),
        })
    }
}
