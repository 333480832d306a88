//! In-process collaborators that remember what they were given
//!
//! Used by the simulator and the test suites to observe the engine's
//! outbound traffic without a broker or a webhook.

use crate::domain::error::NotifyError;
use crate::domain::events::{DwellNotice, EmergencyNotice, GeofenceAlert, Topic};
use crate::domain::types::{NotificationKind, UserId};
use crate::io::event_bus::EventBus;
use crate::io::notifier::NotificationService;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub enum SentNotification {
    Geofence(UserId, GeofenceAlert),
    Dwell(UserId, DwellNotice),
    Emergency(UserId, EmergencyNotice),
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail with a transport error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    pub fn total(&self) -> usize {
        self.sent.lock().len()
    }

    /// Entry/exit alerts of one kind
    pub fn geofence_alerts(&self, kind: NotificationKind) -> Vec<GeofenceAlert> {
        self.sent
            .lock()
            .iter()
            .filter_map(|n| match n {
                SentNotification::Geofence(_, a) if a.kind == kind => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn dwell_alerts(&self) -> Vec<DwellNotice> {
        self.sent
            .lock()
            .iter()
            .filter_map(|n| match n {
                SentNotification::Dwell(_, d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn emergencies(&self) -> Vec<EmergencyNotice> {
        self.sent
            .lock()
            .iter()
            .filter_map(|n| match n {
                SentNotification::Emergency(_, e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, notification: SentNotification) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(NotifyError::Transport("recording notifier set to fail".into()));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}

#[async_trait]
impl NotificationService for RecordingNotifier {
    async fn send_geofence_alert(&self, user_id: &UserId, alert: &GeofenceAlert) -> Result<(), NotifyError> {
        self.record(SentNotification::Geofence(user_id.clone(), alert.clone()))
    }

    async fn send_dwell_alert(&self, user_id: &UserId, notice: &DwellNotice) -> Result<(), NotifyError> {
        self.record(SentNotification::Dwell(user_id.clone(), notice.clone()))
    }

    async fn send_emergency_alert(
        &self,
        user_id: &UserId,
        notice: &EmergencyNotice,
    ) -> Result<(), NotifyError> {
        self.record(SentNotification::Emergency(user_id.clone(), notice.clone()))
    }
}

#[derive(Debug, Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<(Topic, serde_json::Value)>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Topic, serde_json::Value)> {
        self.events.lock().clone()
    }

    pub fn count(&self, topic: Topic) -> usize {
        self.events.lock().iter().filter(|(t, _)| *t == topic).count()
    }

    pub fn last(&self, topic: Topic) -> Option<serde_json::Value> {
        self.events.lock().iter().rev().find(|(t, _)| *t == topic).map(|(_, p)| p.clone())
    }
}

impl EventBus for RecordingEventBus {
    fn emit(&self, topic: Topic, payload: serde_json::Value) {
        self.events.lock().push((topic, payload));
    }
}
