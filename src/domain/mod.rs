//! Domain models - geofences, presence status and evaluation events
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - geofence definitions, location samples, per-pair status
//! - `events` - the evaluation result and the records it carries
//! - `error` - typed errors for evaluation, registration and collaborators

pub mod error;
pub mod events;
pub mod types;

// Re-export commonly used types at module level
pub use error::{EngineError, ErrorRecord, NotifyError, RepositoryError, ValidationError};
pub use events::{EvaluationResult, Topic};
pub use types::{
    Geofence, GeofenceId, GeofenceType, LatLng, LocationReport, LocationSample, NotificationKind,
    PairKey, PresenceStatus, UserGeofenceStatus, UserId,
};
