//! Error types for evaluation, registration and the collaborator seams

use crate::domain::types::{GeofenceId, NotificationKind, UserId};
use serde::Serialize;
use std::time::Duration;

/// Failures of the repository collaborator
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the notification collaborator
#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("notification queue full")]
    QueueFull,
    #[error("notification transport failed: {0}")]
    Transport(String),
}

/// Errors raised by the evaluation pipeline
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Sample rejected before any geofence logic ran
    #[error("location accuracy {accuracy_m:.1} m exceeds threshold {threshold_m:.1} m")]
    LocationAccuracy { accuracy_m: f64, threshold_m: f64 },

    #[error("invalid location ({lat}, {lng})")]
    InvalidLocation { lat: f64, lng: f64 },

    /// A notification was due but its cooldown window is still open
    #[error(
        "{kind} cooldown active for user {user_id} on geofence {geofence_id} ({}s remaining)",
        remaining.as_secs()
    )]
    CooldownActive {
        user_id: UserId,
        geofence_id: GeofenceId,
        kind: NotificationKind,
        remaining: Duration,
    },

    #[error("user {user_id} entered danger zone '{geofence_name}' ({geofence_id})")]
    GeofenceViolation { user_id: UserId, geofence_id: GeofenceId, geofence_name: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("evaluation task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    /// Stable machine-readable kind, used in results and logs
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::LocationAccuracy { .. } => "location_accuracy",
            EngineError::InvalidLocation { .. } => "invalid_location",
            EngineError::CooldownActive { .. } => "cooldown_active",
            EngineError::GeofenceViolation { .. } => "geofence_violation",
            EngineError::Repository(_) => "repository",
            EngineError::TaskFailed(_) => "task_failed",
        }
    }
}

/// Geofence registration/update validation failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid center coordinates ({lat}, {lng})")]
    InvalidCoordinates { lat: f64, lng: f64 },
    #[error("radius {0} m outside allowed range [1, 2000]")]
    InvalidRadius(f64),
    #[error("dwell alert intervals must be positive and strictly ascending")]
    InvalidDwellIntervals,
    #[error("user already owns the maximum of {limit} active geofences")]
    QuotaExceeded { limit: usize },
    #[error("a geofence named '{0}' already exists for this user")]
    DuplicateName(String),
    #[error("geofence {0} not found")]
    NotFound(GeofenceId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Serializable error entry captured into an evaluation result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence_id: Option<GeofenceId>,
    pub kind: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn for_geofence(geofence_id: &GeofenceId, err: &EngineError) -> Self {
        Self {
            geofence_id: Some(geofence_id.clone()),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&EngineError> for ErrorRecord {
    fn from(err: &EngineError) -> Self {
        Self { geofence_id: None, kind: err.kind().to_string(), message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_error_message() {
        let err = EngineError::LocationAccuracy { accuracy_m: 15.0, threshold_m: 10.0 };
        assert_eq!(err.to_string(), "location accuracy 15.0 m exceeds threshold 10.0 m");
        assert_eq!(err.kind(), "location_accuracy");
    }

    #[test]
    fn test_repository_error_is_transparent() {
        let err: EngineError = RepositoryError::Unavailable("db down".into()).into();
        assert_eq!(err.to_string(), "repository unavailable: db down");
        let record = ErrorRecord::for_geofence(&GeofenceId::new("g-1"), &err);
        assert_eq!(record.kind, "repository");
        assert_eq!(record.geofence_id, Some(GeofenceId::new("g-1")));
    }
}
