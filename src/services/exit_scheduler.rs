//! Pending exit table
//!
//! Holds at most one pending exit per (user, geofence). Entries are grouped
//! by user so the per-user sweep never scans other users. Each pending exit
//! carries a generation number; a timer only confirms the exit it was
//! scheduled for.

use crate::domain::types::{Geofence, GeofenceId, LatLng, PairKey, UserId};
use crate::infra::sharded::ShardedMap;
use crate::services::scheduler::TimerHandle;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const DEFAULT_EXIT_CONFIRMATION_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct PendingExit {
    /// Geofence snapshot taken when the exit candidate was observed
    pub geofence: Geofence,
    pub started_at: DateTime<Utc>,
    pub confirm_at: DateTime<Utc>,
    pub generation: u64,
    pub last_location: LatLng,
    pub distance_m: f64,
    handle: Option<TimerHandle>,
}

impl PendingExit {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.confirm_at
    }

    /// Time left until confirmation, zero once due
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.confirm_at - now).max(Duration::zero())
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> u64 {
        self.remaining(now).num_milliseconds().max(0) as u64
    }

    fn cancel_timer(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }
}

/// Outcome of an exit candidate
#[derive(Debug, Clone)]
pub enum BeginExit {
    /// A new pending exit was created; a timer must be attached
    Started(PendingExit),
    /// The key already had a pending exit; nothing was created
    AlreadyPending(PendingExit),
}

pub struct ExitScheduler {
    delay: Duration,
    pending: ShardedMap<UserId, FxHashMap<GeofenceId, PendingExit>>,
    next_generation: AtomicU64,
}

impl ExitScheduler {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::milliseconds(delay_ms as i64),
            pending: ShardedMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay.num_milliseconds().max(0) as u64
    }

    /// Start a pending exit for `key` unless one already exists
    pub fn begin(
        &self,
        key: &PairKey,
        geofence: &Geofence,
        now: DateTime<Utc>,
        location: LatLng,
        distance_m: f64,
    ) -> BeginExit {
        self.pending.upsert(key.user_id.clone(), |exits| {
            if let Some(existing) = exits.get_mut(&key.geofence_id) {
                existing.last_location = location;
                existing.distance_m = distance_m;
                return BeginExit::AlreadyPending(existing.clone());
            }
            let pending = PendingExit {
                geofence: geofence.clone(),
                started_at: now,
                confirm_at: now + self.delay,
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
                last_location: location,
                distance_m,
                handle: None,
            };
            exits.insert(key.geofence_id.clone(), pending.clone());
            debug!(key = %key, generation = %pending.generation, "pending_exit_started");
            BeginExit::Started(pending)
        })
    }

    /// Bind the scheduled timer to its pending exit
    ///
    /// If the pending exit is gone or has moved on to another generation the
    /// timer is cancelled straight away.
    pub fn attach_timer(&self, key: &PairKey, generation: u64, handle: TimerHandle) {
        let attached = self
            .pending
            .update(&key.user_id, |exits| match exits.get_mut(&key.geofence_id) {
                Some(p) if p.generation == generation => {
                    p.handle = Some(handle.clone());
                    true
                }
                _ => false,
            })
            .unwrap_or(false);
        if !attached {
            handle.cancel();
        }
    }

    pub fn get(&self, key: &PairKey) -> Option<PendingExit> {
        self.pending.with(&key.user_id, |exits| exits.and_then(|e| e.get(&key.geofence_id).cloned()))
    }

    pub fn is_pending(&self, key: &PairKey) -> bool {
        self.pending
            .with(&key.user_id, |exits| exits.is_some_and(|e| e.contains_key(&key.geofence_id)))
    }

    /// Remove the pending exit and cancel its timer; `None` when nothing was pending
    pub fn cancel(&self, key: &PairKey) -> Option<PendingExit> {
        let removed = self.remove_where(key, |_| true)?;
        removed.cancel_timer();
        debug!(key = %key, generation = %removed.generation, "pending_exit_cancelled");
        Some(removed)
    }

    /// Remove the pending exit if its delay has elapsed
    pub fn take_if_due(&self, key: &PairKey, now: DateTime<Utc>) -> Option<PendingExit> {
        let taken = self.remove_where(key, |p| p.is_due(now))?;
        taken.cancel_timer();
        Some(taken)
    }

    /// Remove the pending exit only if it is the one `generation` refers to
    pub fn take_fired(&self, key: &PairKey, generation: u64) -> Option<PendingExit> {
        self.remove_where(key, |p| p.generation == generation)
    }

    /// Geofences of `user_id` whose pending exit is due at `now`
    pub fn due_for_user(&self, user_id: &UserId, now: DateTime<Utc>) -> Vec<GeofenceId> {
        let mut due: Vec<GeofenceId> = self.pending.with(user_id, |exits| {
            exits
                .map(|e| e.iter().filter(|(_, p)| p.is_due(now)).map(|(id, _)| id.clone()).collect())
                .unwrap_or_default()
        });
        due.sort();
        due
    }

    pub fn pending_for_user(&self, user_id: &UserId) -> usize {
        self.pending.with(user_id, |exits| exits.map_or(0, |e| e.len()))
    }

    /// Total pending exits across all users
    pub fn len(&self) -> usize {
        self.pending.values().iter().map(|e| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, key: &PairKey, pred: impl FnOnce(&PendingExit) -> bool) -> Option<PendingExit> {
        let removed = self
            .pending
            .update(&key.user_id, |exits| {
                if exits.get(&key.geofence_id).is_some_and(pred) {
                    exits.remove(&key.geofence_id)
                } else {
                    None
                }
            })
            .flatten();
        self.pending.remove_if(&key.user_id, |exits| exits.is_empty());
        removed
    }
}

impl Default for ExitScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_EXIT_CONFIRMATION_DELAY_MS)
    }
}
