//! Shared types for the geofence engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for user IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for geofence IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeofenceId(pub String);

impl GeofenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GeofenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite key for everything tracked per (user, geofence)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub user_id: UserId,
    pub geofence_id: GeofenceId,
}

impl PairKey {
    pub fn new(user_id: &UserId, geofence_id: &GeofenceId) -> Self {
        Self { user_id: user_id.clone(), geofence_id: geofence_id.clone() }
    }
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.geofence_id)
    }
}

/// WGS84 coordinate pair in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    #[inline]
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Latitude in [-90, 90] and longitude in [-180, 180]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A single GPS sample from the locator device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    /// Reported accuracy radius in meters
    pub accuracy: f64,
    /// Device timestamp, if the transport supplied one
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl LocationSample {
    pub fn new(lat: f64, lng: f64, accuracy: f64) -> Self {
        Self { lat, lng, accuracy, timestamp: None }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[inline]
    pub fn position(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }
}

/// Ingest message: `{userId, lat, lng, accuracy, timestamp}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport {
    pub user_id: UserId,
    #[serde(flatten)]
    pub sample: LocationSample,
}

impl LocationReport {
    pub fn new(user_id: UserId, sample: LocationSample) -> Self {
        Self { user_id, sample }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceType {
    SafeZone,
    DangerZone,
    NotificationZone,
}

impl GeofenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeofenceType::SafeZone => "safe_zone",
            GeofenceType::DangerZone => "danger_zone",
            GeofenceType::NotificationZone => "notification_zone",
        }
    }
}

/// Default dwell alert boundaries in minutes
pub const DEFAULT_DWELL_ALERT_INTERVALS: [u32; 4] = [5, 15, 30, 60];

/// Default priority (lower number wins)
pub const DEFAULT_PRIORITY: i32 = 5;

/// A circular region a caregiver monitors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geofence {
    pub id: GeofenceId,
    pub user_id: UserId,
    pub name: String,
    pub center: LatLng,
    pub radius: f64,
    #[serde(rename = "type")]
    pub geofence_type: GeofenceType,
    #[serde(default)]
    pub emergency_enabled: bool,
    #[serde(default)]
    pub dwell_tracking_enabled: bool,
    #[serde(default = "default_dwell_alert_intervals")]
    pub dwell_alert_intervals: Vec<u32>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_dwell_alert_intervals() -> Vec<u32> {
    DEFAULT_DWELL_ALERT_INTERVALS.to_vec()
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_active() -> bool {
    true
}

impl Geofence {
    /// Emergency signaling only applies to danger zones
    #[inline]
    pub fn raises_emergency(&self) -> bool {
        self.geofence_type == GeofenceType::DangerZone && self.emergency_enabled
    }
}

/// Validated input for creating a geofence
#[derive(Debug, Clone, PartialEq)]
pub struct NewGeofence {
    pub user_id: UserId,
    pub name: String,
    pub center: LatLng,
    pub radius: f64,
    pub geofence_type: GeofenceType,
    pub emergency_enabled: bool,
    pub dwell_tracking_enabled: bool,
    pub dwell_alert_intervals: Vec<u32>,
    pub priority: i32,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Inside,
    Outside,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceStatus::Inside => "inside",
            PresenceStatus::Outside => "outside",
        }
    }
}

/// Persisted presence of one user relative to one geofence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGeofenceStatus {
    pub status: PresenceStatus,
    pub last_entry: Option<DateTime<Utc>>,
    pub last_exit: Option<DateTime<Utc>>,
    pub dwell_start_time: Option<DateTime<Utc>>,
    pub last_dwell_alert: Option<DateTime<Utc>>,
}

impl UserGeofenceStatus {
    pub fn outside() -> Self {
        Self {
            status: PresenceStatus::Outside,
            last_entry: None,
            last_exit: None,
            dwell_start_time: None,
            last_dwell_alert: None,
        }
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, patch: &StatusPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(at) = patch.last_entry {
            self.last_entry = Some(at);
        }
        if let Some(at) = patch.last_exit {
            self.last_exit = Some(at);
        }
        if let Some(dwell) = patch.dwell_start_time {
            self.dwell_start_time = dwell;
        }
        if let Some(alert) = patch.last_dwell_alert {
            self.last_dwell_alert = alert;
        }
    }
}

/// Partial update for a `UserGeofenceStatus`
///
/// The nested options on the dwell fields distinguish "leave as is" (`None`)
/// from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub status: Option<PresenceStatus>,
    pub last_entry: Option<DateTime<Utc>>,
    pub last_exit: Option<DateTime<Utc>>,
    pub dwell_start_time: Option<Option<DateTime<Utc>>>,
    pub last_dwell_alert: Option<Option<DateTime<Utc>>>,
}

impl StatusPatch {
    pub fn entered(at: DateTime<Utc>, dwell_start: Option<DateTime<Utc>>) -> Self {
        Self {
            status: Some(PresenceStatus::Inside),
            last_entry: Some(at),
            last_exit: None,
            dwell_start_time: Some(dwell_start),
            last_dwell_alert: Some(None),
        }
    }

    pub fn exited(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(PresenceStatus::Outside),
            last_entry: None,
            last_exit: Some(at),
            dwell_start_time: Some(None),
            last_dwell_alert: None,
        }
    }

    pub fn dwell_started(at: DateTime<Utc>) -> Self {
        Self { dwell_start_time: Some(Some(at)), ..Self::default() }
    }

    pub fn dwell_alerted(at: DateTime<Utc>) -> Self {
        Self { last_dwell_alert: Some(Some(at)), ..Self::default() }
    }
}

/// Notification categories with their own cooldown windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Entry,
    Exit,
    DwellAlert,
    Emergency,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Entry => "entry",
            NotificationKind::Exit => "exit",
            NotificationKind::DwellAlert => "dwell_alert",
            NotificationKind::Emergency => "emergency",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last notification actually sent for a (user, geofence, kind) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownRecord {
    pub user_id: UserId,
    pub geofence_id: GeofenceId,
    pub kind: NotificationKind,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lat_lng_validity() {
        assert!(LatLng::new(24.8138, 120.9675).is_valid());
        assert!(LatLng::new(90.0, -180.0).is_valid());
        assert!(!LatLng::new(90.1, 0.0).is_valid());
        assert!(!LatLng::new(0.0, 180.5).is_valid());
        assert!(!LatLng::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_location_report_from_json() {
        let json = r#"{"userId":"u-1","lat":24.8138,"lng":120.9675,"accuracy":5.0,
            "timestamp":"2026-01-05T10:00:00Z"}"#;
        let report: LocationReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.user_id, UserId::new("u-1"));
        assert_eq!(report.sample.accuracy, 5.0);
        assert!(report.sample.timestamp.is_some());
    }

    #[test]
    fn test_geofence_defaults_from_json() {
        let json = r#"{"id":"g-1","userId":"u-1","name":"Home",
            "center":{"lat":24.8138,"lng":120.9675},"radius":100.0,"type":"safe_zone"}"#;
        let fence: Geofence = serde_json::from_str(json).unwrap();
        assert_eq!(fence.dwell_alert_intervals, vec![5, 15, 30, 60]);
        assert_eq!(fence.priority, DEFAULT_PRIORITY);
        assert!(fence.active);
        assert!(!fence.raises_emergency());
    }

    #[test]
    fn test_status_patch_clears_dwell_on_exit() {
        let now = Utc::now();
        let mut status = UserGeofenceStatus::outside();
        status.apply(&StatusPatch::entered(now, Some(now)));
        assert_eq!(status.status, PresenceStatus::Inside);
        assert_eq!(status.dwell_start_time, Some(now));

        status.apply(&StatusPatch::exited(now));
        assert_eq!(status.status, PresenceStatus::Outside);
        assert_eq!(status.dwell_start_time, None);
        assert_eq!(status.last_entry, Some(now));
    }
}
