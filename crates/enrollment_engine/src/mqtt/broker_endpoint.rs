use enroll_common::domain::{DomainError, DomainResult};
use rumqttc::{MqttOptions, Transport};

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_WS_PORT: u16 = 80;
const DEFAULT_WSS_PORT: u16 = 443;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Tcp,
    Ws,
    Wss,
}

/// Parsed broker address.
///
/// Accepts `mqtt://host:port`, `tcp://host:port`, `ws://host:port/path`,
/// `wss://host:port/path` or bare `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    explicit_port: bool,
}

impl BrokerEndpoint {
    pub fn parse(url: &str) -> DomainResult<Self> {
        let url = url.trim();
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("ws://") {
            (BrokerScheme::Ws, rest)
        } else if let Some(rest) = url.strip_prefix("wss://") {
            (BrokerScheme::Wss, rest)
        } else if let Some(rest) = url.strip_prefix("mqtt://") {
            (BrokerScheme::Tcp, rest)
        } else if let Some(rest) = url.strip_prefix("tcp://") {
            (BrokerScheme::Tcp, rest)
        } else if url.contains("://") {
            return Err(DomainError::InvalidBrokerUrl(format!(
                "Unsupported broker URL scheme: {}",
                url
            )));
        } else {
            (BrokerScheme::Tcp, url)
        };

        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    DomainError::InvalidBrokerUrl(format!("Invalid port in broker URL: {}", port))
                })?;
                (host, Some(port))
            }
            None => (authority, None),
        };

        if host.is_empty() {
            return Err(DomainError::InvalidBrokerUrl(format!(
                "Broker URL has no host: {}",
                url
            )));
        }

        let default_port = match scheme {
            BrokerScheme::Tcp => DEFAULT_TCP_PORT,
            BrokerScheme::Ws => DEFAULT_WS_PORT,
            BrokerScheme::Wss => DEFAULT_WSS_PORT,
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port: port.unwrap_or(default_port),
            path: path.to_string(),
            explicit_port: port.is_some(),
        })
    }

    /// `host[:port]` as written in the URL; recorded with each enrollment
    pub fn cluster_id(&self) -> String {
        if self.explicit_port {
            format!("{}:{}", self.host, self.port)
        } else {
            self.host.clone()
        }
    }

    /// Client options for this endpoint with the given client id
    pub fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        match self.scheme {
            BrokerScheme::Tcp => MqttOptions::new(client_id, &self.host, self.port),
            BrokerScheme::Ws => {
                let url = format!("ws://{}:{}{}", self.host, self.port, self.path);
                let mut options = MqttOptions::new(client_id, url, self.port);
                options.set_transport(Transport::Ws);
                options
            }
            BrokerScheme::Wss => {
                let url = format!("wss://{}:{}{}", self.host, self.port, self.path);
                let mut options = MqttOptions::new(client_id, url, self.port);
                options.set_transport(Transport::wss_with_default_config());
                options
            }
        }
    }
}

/// Cluster id for an endpoint string, empty when it does not parse
pub(crate) fn cluster_id_for(endpoint: &str) -> String {
    BrokerEndpoint::parse(endpoint)
        .map(|endpoint| endpoint.cluster_id())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_websocket_url() {
        let endpoint = BrokerEndpoint::parse("ws://broker.hivemq.com:8000/mqtt").unwrap();
        assert_eq!(endpoint.scheme, BrokerScheme::Ws);
        assert_eq!(endpoint.host, "broker.hivemq.com");
        assert_eq!(endpoint.port, 8000);
        assert_eq!(endpoint.path, "/mqtt");
        assert_eq!(endpoint.cluster_id(), "broker.hivemq.com:8000");
    }

    #[test]
    fn test_parse_secure_websocket_default_port() {
        let endpoint = BrokerEndpoint::parse("wss://broker.example.com/mqtt").unwrap();
        assert_eq!(endpoint.scheme, BrokerScheme::Wss);
        assert_eq!(endpoint.port, 443);
        assert_eq!(endpoint.cluster_id(), "broker.example.com");
    }

    #[test]
    fn test_parse_tcp_forms() {
        let endpoint = BrokerEndpoint::parse("mqtt://localhost:1883").unwrap();
        assert_eq!((endpoint.host.as_str(), endpoint.port), ("localhost", 1883));

        let endpoint = BrokerEndpoint::parse("tcp://mqtt.example.com:1884").unwrap();
        assert_eq!((endpoint.host.as_str(), endpoint.port), ("mqtt.example.com", 1884));

        let endpoint = BrokerEndpoint::parse("broker.local").unwrap();
        assert_eq!(endpoint.scheme, BrokerScheme::Tcp);
        assert_eq!(endpoint.port, 1883);
    }

    #[test]
    fn test_parse_invalid_urls() {
        assert!(matches!(
            BrokerEndpoint::parse("ws://broker:notaport/mqtt"),
            Err(DomainError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            BrokerEndpoint::parse("http://broker:80"),
            Err(DomainError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            BrokerEndpoint::parse("ws://:8000/mqtt"),
            Err(DomainError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_cluster_id_for_unparseable_endpoint_is_empty() {
        assert_eq!(cluster_id_for("http://nope"), "");
        assert_eq!(cluster_id_for("ws://b.example.com:8000/mqtt"), "b.example.com:8000");
    }
}
