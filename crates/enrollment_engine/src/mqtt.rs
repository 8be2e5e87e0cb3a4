mod broker_endpoint;
mod rumqtt_connector;
mod topic;

pub(crate) use broker_endpoint::cluster_id_for;
pub use broker_endpoint::{BrokerEndpoint, BrokerScheme};
pub use rumqtt_connector::RumqttDeviceConnector;
pub use topic::DeviceTopics;
