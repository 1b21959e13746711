// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlow.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! MQTT bus adapter: a thin rumqttc wrapper exposing the non-blocking
//! `Publish` seam the models use, an event-loop forwarder feeding the engine
//! queue, and a bounded retained-topic drain for startup configuration.

use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use gridflow_core::bridge::{EngineEvent, EngineEventSender, Publish, PublishError, SharedPublisher};
use gridflow_types::MqttSettings;

/// Capacity of the outbound request queue; publishes beyond this while the
/// broker is unreachable are dropped with an error.
const REQUEST_QUEUE_CAP: usize = 64;
/// Upper bound for the reconnect backoff
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Handle to the shared MQTT client. Cheap to clone; all publishes are
/// buffered and non-blocking.
#[derive(Debug, Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Set up the client. The actual connection is established lazily by
    /// the event loop; a random client id keeps parallel runs apart.
    pub fn connect(settings: &MqttSettings) -> (Self, EventLoop) {
        let client_id = format!("gridflow-ctrl-{}", rand::thread_rng().gen_range(0..100));
        info!(
            "📡 MQTT broker: {}:{} (client id: {})",
            settings.host, settings.port, client_id
        );
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(user, password);
        }
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAP);
        (Self { client }, eventloop)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        info!("📡 Subscribing: {}", topic);
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    pub async fn subscribe_all(&self, topics: &[String]) -> Result<(), BusError> {
        for topic in topics {
            self.subscribe(topic).await?;
        }
        Ok(())
    }

    /// The `Publish` seam handed to the models
    pub fn publisher(&self) -> SharedPublisher {
        Arc::new(self.clone())
    }
}

impl Publish for MqttBus {
    fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), PublishError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|_| PublishError::QueueFull)
    }
}

/// Drive the connection until `window` elapses, collecting the retained
/// messages the broker replays on subscription. Used once at startup to let
/// retained `control/*` topics override the static configuration.
pub async fn drain_retained(eventloop: &mut EventLoop, window: Duration) -> HashMap<String, String> {
    let mut retained = HashMap::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        match tokio::time::timeout_at(deadline, eventloop.poll()).await {
            Err(_) => break,
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                if publish.retain {
                    match String::from_utf8(publish.payload.to_vec()) {
                        Ok(text) => {
                            debug!("📡 Retained config: {} = {}", publish.topic, text);
                            retained.insert(publish.topic.clone(), text);
                        }
                        Err(_) => warn!("⚠️ Retained payload on {} is not UTF-8", publish.topic),
                    }
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("📡 MQTT error while reading retained config: {}", e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
    info!("📡 Read {} retained control settings from MQTT", retained.len());
    retained
}

/// Forward every inbound publish into the engine queue, forever. Connection
/// errors are logged and retried with capped backoff; rumqttc re-subscribes
/// on reconnect.
pub async fn run_event_loop(mut eventloop: EventLoop, events: EngineEventSender) {
    let mut backoff = 1;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("📡 Connected to MQTT Broker!");
                backoff = 1;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                backoff = 1;
                events.send(EngineEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("📡 Disconnected from MQTT broker!");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("📡 MQTT connection error: {} - retrying in {}s", e, backoff);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> MqttSettings {
        MqttSettings {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
        }
    }

    #[tokio::test]
    async fn test_publish_is_buffered_without_broker() {
        let (bus, _eventloop) = MqttBus::connect(&settings());
        let publisher = bus.publisher();
        // requests queue locally until the event loop connects
        assert!(publisher
            .publish("solarflow-hub/test", "1".into(), false)
            .is_ok());
    }

    #[tokio::test]
    async fn test_queue_overflow_is_reported() {
        let (bus, _eventloop) = MqttBus::connect(&settings());
        let publisher = bus.publisher();
        let mut saw_error = false;
        for i in 0..(REQUEST_QUEUE_CAP + 8) {
            if publisher
                .publish("solarflow-hub/test", format!("{i}"), false)
                .is_err()
            {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error, "overflowing the request queue must surface an error");
    }
}
