//! Infrastructure - configuration, time, shared stores and metrics
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `clock` - Injectable wall clock (system and manual)
//! - `sharded` - Key-partitioned maps and per-key async locks
//! - `metrics` - Lock-free metrics collection

pub mod clock;
pub mod config;
pub mod metrics;
pub mod sharded;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use metrics::Metrics;
pub use sharded::{KeyLocks, ShardedMap};
