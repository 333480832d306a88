//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `engine` - Central evaluation orchestrator for (user, geofence) state
//! - `geo` - Great-circle distance
//! - `accuracy` - Accuracy gate for incoming samples
//! - `boundary` - Inside/outside classification against stored status
//! - `exit_scheduler` - Pending exits awaiting confirmation
//! - `scheduler` - Timer abstraction (tokio and manual)
//! - `dwell_tracker` - Dwell time and one-shot interval alerts
//! - `cooldown` - Per-kind notification cooldown ledger
//! - `priority` - Arbitration between simultaneous entries
//! - `registry` - Geofence registration and validation

pub mod accuracy;
pub mod boundary;
pub mod cooldown;
pub mod dwell_tracker;
pub mod engine;
pub mod exit_scheduler;
pub mod geo;
pub mod priority;
pub mod registry;
pub mod scheduler;

// Re-export commonly used types
pub use engine::{BatchEntry, EngineSettings, GeofenceEngine, GeofenceEngineBuilder};
pub use registry::{GeofenceDraft, GeofenceRegistry};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
