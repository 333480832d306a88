//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `repository` - Geofence and per-user status persistence
//! - `notifier` - User notification delivery (webhook worker, log)
//! - `event_bus` - Fire-and-forget domain event publishing over MQTT
//! - `mqtt` - MQTT client for receiving location reports
//! - `prometheus` - Prometheus metrics HTTP endpoint
//! - `recording` - In-process collaborators that keep what they receive

pub mod event_bus;
pub mod mqtt;
pub mod notifier;
pub mod prometheus;
pub mod recording;
pub mod repository;

// Re-export commonly used types
pub use event_bus::{create_event_bus, EventBus, MqttEventBus, MqttPublisher, NoopEventBus};
pub use notifier::{create_webhook_notifier, LogNotifier, NotificationService, WebhookNotifier};
pub use recording::{RecordingEventBus, RecordingNotifier};
pub use repository::{GeofenceRepository, InMemoryRepository};
