//! Broker link
//!
//! [`MqttPublisher`] is the seam between the publish pipeline and the
//! broker. [`MqttLink`] implements it over rumqttc and runs the event loop
//! that feeds inbound frames to [`Hub::dispatch`]. Subscriptions are
//! (re)issued on every ConnAck, so they survive broker reconnects. The loop
//! outlives [`Hub::shutdown`] until the publish queue is drained.

use acgw_core::MqttEnvelope;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::error::{HubError, Result};
use crate::hub::Hub;

/// Publishes frames to the broker
#[async_trait]
pub trait MqttPublisher: Send + Sync + 'static {
    async fn publish(&self, envelope: MqttEnvelope) -> Result<()>;
}

pub type SharedPublisher = Arc<dyn MqttPublisher>;

/// Map a numeric QoS onto rumqttc's
pub fn parse_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Publisher backed by a rumqttc client
#[derive(Clone)]
pub struct RumqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl MqttPublisher for RumqttPublisher {
    async fn publish(&self, envelope: MqttEnvelope) -> Result<()> {
        self.client
            .publish(
                envelope.topic,
                parse_qos(envelope.qos),
                envelope.retained,
                envelope.payload.to_vec(),
            )
            .await
            .map_err(|e| HubError::Publish(e.to_string()))
    }
}

/// A broker connection that is not polled yet
pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttLink {
    pub fn new(config: &MqttConfig) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(options, config.capacity.max(1));
        Self {
            client,
            eventloop,
            config: config.clone(),
        }
    }

    pub fn publisher(&self) -> SharedPublisher {
        Arc::new(RumqttPublisher {
            client: self.client.clone(),
        })
    }

    /// Poll the broker connection until the hub has shut down and drained
    /// its publish queue
    pub fn spawn(self, hub: Hub) -> JoinHandle<()> {
        tokio::spawn(self.run(hub))
    }

    async fn run(mut self, hub: Hub) {
        let filters = hub.subscriptions();
        let qos = parse_qos(self.config.subscribe_qos);
        let reconnect_delay = Duration::from_secs(self.config.reconnect_delay_secs);

        info!(
            "MQTT link connecting to {}:{}",
            self.config.broker_host, self.config.broker_port
        );

        loop {
            let event = tokio::select! {
                _ = hub.drained() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected, subscribing to {} filters", filters.len());
                    for filter in &filters {
                        if let Err(e) = self.client.subscribe(filter.as_str(), qos).await {
                            error!("MQTT subscribe to {} failed: {}", filter, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    debug!(
                        "MQTT received: {} ({} bytes)",
                        publish.topic,
                        publish.payload.len()
                    );
                    let envelope = MqttEnvelope {
                        topic: publish.topic,
                        qos: publish.qos as u8,
                        retained: publish.retain,
                        payload: publish.payload,
                    };
                    hub.dispatch(envelope).await;
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("MQTT disconnected by broker");
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT error: {:?}", e);
                    tokio::select! {
                        _ = hub.drained() => break,
                        _ = tokio::time::sleep(reconnect_delay) => {}
                    }
                }
            }
        }

        self.flush().await;
        info!("MQTT link stopped");
    }

    /// Send whatever the pipeline left in the client queue, then disconnect
    async fn flush(&mut self) {
        let timeout = self.config.shutdown_timeout();
        let client = self.client.clone();
        let eventloop = &mut self.eventloop;

        // the disconnect request queues behind pending publishes
        let flush = async move {
            let poll = async {
                loop {
                    match eventloop.poll().await {
                        Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                        Ok(_) => {}
                        Err(e) => return Err(e),
                    }
                }
            };
            tokio::join!(client.disconnect(), poll)
        };

        match tokio::time::timeout(timeout, flush).await {
            Ok((Ok(()), Ok(()))) => debug!("MQTT link flushed and disconnected"),
            Ok((Err(e), _)) => warn!("MQTT disconnect failed: {}", e),
            Ok((_, Err(e))) => warn!("MQTT connection lost while flushing: {}", e),
            Err(_) => warn!("MQTT link not flushed within {:?}", timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qos() {
        assert_eq!(parse_qos(0), QoS::AtMostOnce);
        assert_eq!(parse_qos(1), QoS::AtLeastOnce);
        assert_eq!(parse_qos(2), QoS::ExactlyOnce);
        assert_eq!(parse_qos(7), QoS::ExactlyOnce);
    }
}
