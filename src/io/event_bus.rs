//! Real-time event publishing
//!
//! The engine publishes; it never subscribes. `emit` must not block, so
//! `MqttEventBus` only enqueues and the `MqttPublisher` actor owns the
//! broker connection:
//! - <prefix>/geofence.entry
//! - <prefix>/geofence.exit
//! - <prefix>/geofence.exit_cancelled
//! - <prefix>/geofence.emergency

use crate::domain::events::Topic;
use crate::infra::config::Config;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub trait EventBus: Send + Sync {
    fn emit(&self, topic: Topic, payload: serde_json::Value);
}

/// Bus that discards everything (event bus disabled)
#[derive(Debug, Clone, Default)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn emit(&self, topic: Topic, _payload: serde_json::Value) {
        debug!(topic = %topic, "event_bus_disabled");
    }
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: Topic,
    pub payload: serde_json::Value,
}

/// Full MQTT topic for a bus topic
pub fn mqtt_topic(prefix: &str, topic: Topic) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        topic.as_str().to_string()
    } else {
        format!("{prefix}/{}", topic.as_str())
    }
}

/// Sender handle for bus messages
///
/// Clone to share. Non-blocking: if the channel is full the message is dropped.
#[derive(Clone)]
pub struct MqttEventBus {
    tx: mpsc::Sender<BusMessage>,
    site_id: String,
}

impl EventBus for MqttEventBus {
    fn emit(&self, topic: Topic, mut payload: serde_json::Value) {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("site".into(), serde_json::Value::String(self.site_id.clone()));
        }
        if self.tx.try_send(BusMessage { topic, payload }).is_err() {
            debug!(topic = %topic, "event_bus_dropped");
        }
    }
}

/// Create the bus sender and the receiver the publisher drains
pub fn create_event_bus(
    buffer_size: usize,
    site_id: String,
) -> (MqttEventBus, mpsc::Receiver<BusMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (MqttEventBus { tx, site_id }, rx)
}

/// MQTT publisher actor
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<BusMessage>,
    prefix: String,
}

impl MqttPublisher {
    /// Connect to the configured broker and spawn its event loop
    pub fn new(config: &Config, rx: mpsc::Receiver<BusMessage>) -> Self {
        let client_id = format!("geofence-bus-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("event_bus_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "event_bus_mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, prefix: config.event_bus_topic_prefix().to_string() }
    }

    /// Publish until shutdown, then drain what is left
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(prefix = %self.prefix, "event_bus_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("event_bus_shutdown");
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish(msg).await;
                        }
                        return;
                    }
                }
                Some(msg) = self.rx.recv() => {
                    self.publish(msg).await;
                }
            }
        }
    }

    async fn publish(&self, msg: BusMessage) {
        let topic = mqtt_topic(&self.prefix, msg.topic);
        let body = match serde_json::to_vec(&msg.payload) {
            Ok(b) => b,
            Err(e) => {
                warn!(topic = %topic, error = %e, "event_bus_serialize_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(&topic, QoS::AtMostOnce, false, body).await {
            debug!(topic = %topic, error = %e, "event_bus_publish_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mqtt_topic() {
        assert_eq!(mqtt_topic("safety", Topic::Entry), "safety/geofence.entry");
        assert_eq!(mqtt_topic("safety/", Topic::ExitCancelled), "safety/geofence.exit_cancelled");
        assert_eq!(mqtt_topic("", Topic::Emergency), "geofence.emergency");
    }

    #[tokio::test]
    async fn test_emit_injects_site() {
        let (bus, mut rx) = create_event_bus(4, "site-a".into());
        bus.emit(Topic::Exit, json!({"geofenceId": "g-1"}));
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, Topic::Exit);
        assert_eq!(msg.payload["site"], "site-a");
        assert_eq!(msg.payload["geofenceId"], "g-1");
    }

    #[tokio::test]
    async fn test_emit_drops_when_full() {
        let (bus, mut rx) = create_event_bus(1, "s".into());
        bus.emit(Topic::Entry, json!({"n": 1}));
        bus.emit(Topic::Entry, json!({"n": 2}));
        assert_eq!(rx.recv().await.unwrap().payload["n"], 1);
        assert!(rx.try_recv().is_err());
    }
}
