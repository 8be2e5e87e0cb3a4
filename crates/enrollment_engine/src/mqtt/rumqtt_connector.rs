use crate::domain::{ChannelError, ConnectOptions, DeviceChannel, DeviceConnector, InboundMessage};
use crate::mqtt::BrokerEndpoint;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// DeviceConnector over rumqttc, one clean session per exchange
#[derive(Debug, Default, Clone)]
pub struct RumqttDeviceConnector;

impl RumqttDeviceConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceConnector for RumqttDeviceConnector {
    #[instrument(name = "mqtt_connect", skip(self, options), fields(client_id = %options.client_id))]
    async fn connect(
        &self,
        endpoint: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn DeviceChannel>, ChannelError> {
        let endpoint =
            BrokerEndpoint::parse(endpoint).map_err(|e| ChannelError::Connect(e.to_string()))?;

        let mut mqtt_options = endpoint.mqtt_options(&options.client_id);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let connack = tokio::time::timeout(options.connect_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(ChannelError::Connect(format!(
                                "broker refused connection: {:?}",
                                ack.code
                            )))
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Err(ChannelError::Connect(e.to_string())),
                }
            }
        })
        .await;

        match connack {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ChannelError::Connect(format!(
                    "no CONNACK within {:?}",
                    options.connect_timeout
                )))
            }
        }

        info!(host = %endpoint.host, port = endpoint.port, "connected to MQTT broker");
        Ok(Box::new(RumqttDeviceChannel {
            client,
            eventloop,
            ack_timeout: options.ack_timeout,
            inbox: VecDeque::new(),
            closed: false,
        }))
    }
}

struct RumqttDeviceChannel {
    client: AsyncClient,
    eventloop: EventLoop,
    ack_timeout: Duration,
    /// Publishes received while waiting for an acknowledgment
    inbox: VecDeque<InboundMessage>,
    closed: bool,
}

impl RumqttDeviceChannel {
    /// Drive the event loop until `is_ack` matches, buffering publishes
    async fn await_ack<F>(&mut self, mut is_ack: F) -> Result<Packet, String>
    where
        F: FnMut(&Packet) -> bool + Send,
    {
        let ack_timeout = self.ack_timeout;
        let eventloop = &mut self.eventloop;
        let inbox = &mut self.inbox;

        let waited = tokio::time::timeout(ack_timeout, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(packet)) if is_ack(&packet) => return Ok(packet),
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        inbox.push_back(InboundMessage {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        });
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        })
        .await;

        match waited {
            Ok(result) => {
                if result.is_err() {
                    self.closed = true;
                }
                result
            }
            Err(_) => Err(format!("no acknowledgment within {:?}", ack_timeout)),
        }
    }
}

#[async_trait]
impl DeviceChannel for RumqttDeviceChannel {
    async fn subscribe(&mut self, topic: &str) -> Result<(), ChannelError> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))?;

        let packet = self
            .await_ack(|packet| matches!(packet, Packet::SubAck(_)))
            .await
            .map_err(ChannelError::Subscribe)?;

        if let Packet::SubAck(ack) = packet {
            if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure))
            {
                return Err(ChannelError::Subscribe(format!(
                    "broker refused subscription to {}",
                    topic
                )));
            }
        }

        debug!(topic = %topic, "subscription acknowledged");
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))?;

        self.await_ack(|packet| matches!(packet, Packet::PubAck(_)))
            .await
            .map_err(ChannelError::Publish)?;

        debug!(topic = %topic, "publish acknowledged");
        Ok(())
    }

    async fn recv(&mut self) -> Option<InboundMessage> {
        if let Some(message) = self.inbox.pop_front() {
            return Some(message);
        }
        if self.closed {
            return None;
        }

        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Some(InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("broker closed the session");
                    self.closed = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT event loop error");
                    self.closed = true;
                    return None;
                }
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.closed || self.client.try_disconnect().is_err() {
            return;
        }

        let eventloop = &mut self.eventloop;
        let _ = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        self.closed = true;
        debug!("disconnected from MQTT broker");
    }
}
