//! Evaluation result and the event records it carries
//!
//! Every array in `EvaluationResult` is disjoint: one geofence produces at
//! most one record per array in a single evaluation.

use crate::domain::error::ErrorRecord;
use crate::domain::types::{GeofenceId, GeofenceType, LatLng, NotificationKind, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Why a notification that was otherwise due did not go out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    /// Another geofence entered in the same pass had higher priority
    Priority,
    /// The (user, geofence, kind) cooldown window was still open
    Cooldown,
}

/// Outcome of asking for a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub notification_sent: bool,
    pub cooldown_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed_by: Option<SuppressionReason>,
}

impl Delivery {
    pub const SENT: Delivery =
        Delivery { notification_sent: true, cooldown_active: false, suppressed_by: None };

    pub const COOLDOWN: Delivery = Delivery {
        notification_sent: false,
        cooldown_active: true,
        suppressed_by: Some(SuppressionReason::Cooldown),
    };

    pub const PRIORITY: Delivery = Delivery {
        notification_sent: false,
        cooldown_active: false,
        suppressed_by: Some(SuppressionReason::Priority),
    };

    /// The collaborator refused the notification
    pub const FAILED: Delivery =
        Delivery { notification_sent: false, cooldown_active: false, suppressed_by: None };
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryEvent {
    pub event_id: String,
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub geofence_type: GeofenceType,
    pub priority: i32,
    pub distance_m: f64,
    pub entered_at: DateTime<Utc>,
    #[serde(flatten)]
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserReturned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledExit {
    pub event_id: String,
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub reason: CancelReason,
    pub pending_since: DateTime<Utc>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExitReport {
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub distance_m: f64,
    pub started_at: DateTime<Utc>,
    pub confirm_at: DateTime<Utc>,
    pub confirmation_delay_ms: u64,
    pub remaining_ms: u64,
    /// True when this sample found an exit already waiting for confirmation
    pub already_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedExit {
    pub event_id: String,
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub geofence_type: GeofenceType,
    pub exited_at: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
    pub last_location: LatLng,
    pub distance_m: f64,
    #[serde(flatten)]
    pub delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DwellUpdate {
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub dwell_start: DateTime<Utc>,
    pub dwell_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DwellAlert {
    pub event_id: String,
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    /// The configured interval boundary that was crossed
    pub interval_minutes: u32,
    pub dwell_minutes: u64,
    #[serde(flatten)]
    pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAlert {
    pub event_id: String,
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub severity: Severity,
    pub message: String,
    pub location: LatLng,
    pub raised_at: DateTime<Utc>,
    pub notification_sent: bool,
}

/// Everything one `check_status` call decided
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub user_id: UserId,
    pub evaluated_at: DateTime<Utc>,
    pub location: LatLng,
    pub entries: Vec<EntryEvent>,
    pub cancelled_exits: Vec<CancelledExit>,
    pub pending_exits: Vec<PendingExitReport>,
    pub confirmed_exits: Vec<ConfirmedExit>,
    pub dwell_updates: Vec<DwellUpdate>,
    pub dwell_alerts: Vec<DwellAlert>,
    pub emergency_alerts: Vec<EmergencyAlert>,
    pub errors: Vec<ErrorRecord>,
}

impl EvaluationResult {
    pub fn new(user_id: UserId, evaluated_at: DateTime<Utc>, location: LatLng) -> Self {
        Self {
            user_id,
            evaluated_at,
            location,
            entries: Vec::new(),
            cancelled_exits: Vec::new(),
            pending_exits: Vec::new(),
            confirmed_exits: Vec::new(),
            dwell_updates: Vec::new(),
            dwell_alerts: Vec::new(),
            emergency_alerts: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// True when nothing happened for any geofence
    pub fn is_quiet(&self) -> bool {
        self.entries.is_empty()
            && self.cancelled_exits.is_empty()
            && self.pending_exits.is_empty()
            && self.confirmed_exits.is_empty()
            && self.dwell_updates.is_empty()
            && self.dwell_alerts.is_empty()
            && self.emergency_alerts.is_empty()
            && self.errors.is_empty()
    }

    pub fn notifications_sent(&self) -> usize {
        self.entries.iter().filter(|e| e.delivery.notification_sent).count()
            + self.confirmed_exits.iter().filter(|e| e.delivery.notification_sent).count()
            + self.dwell_alerts.iter().filter(|e| e.delivery.notification_sent).count()
            + self.emergency_alerts.iter().filter(|e| e.notification_sent).count()
    }
}

/// Event bus topics the engine publishes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Entry,
    Exit,
    ExitCancelled,
    Emergency,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Entry => "geofence.entry",
            Topic::Exit => "geofence.exit",
            Topic::ExitCancelled => "geofence.exit_cancelled",
            Topic::Emergency => "geofence.emergency",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to `send_geofence_alert`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceAlert {
    pub kind: NotificationKind,
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub geofence_type: GeofenceType,
    pub location: LatLng,
    pub at: DateTime<Utc>,
}

/// Payload handed to `send_dwell_alert`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DwellNotice {
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub interval_minutes: u32,
    pub dwell_minutes: u64,
    pub at: DateTime<Utc>,
}

/// Payload handed to `send_emergency_alert`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyNotice {
    pub geofence_id: GeofenceId,
    pub geofence_name: String,
    pub severity: Severity,
    pub message: String,
    pub location: LatLng,
    pub at: DateTime<Utc>,
}
