//! Continuous inside-time per (user, geofence)
//!
//! A session is identified by its dwell start. Each configured interval
//! boundary fires at most once per session; a different start (re-entry
//! after a confirmed exit) begins a fresh session.

use crate::domain::types::PairKey;
use crate::infra::sharded::ShardedMap;
use chrono::{DateTime, Utc};
use smallvec::SmallVec;
use tracing::debug;

pub const DEFAULT_MIN_DWELL_MINUTES: u64 = 5;

#[derive(Debug, Clone)]
struct DwellWindow {
    start: DateTime<Utc>,
    fired: SmallVec<[u32; 4]>,
}

impl DwellWindow {
    fn new(start: DateTime<Utc>) -> Self {
        Self { start, fired: SmallVec::new() }
    }

    /// Rebuild the fired set after a restart from the persisted last alert
    fn restored(start: DateTime<Utc>, last_alert: Option<DateTime<Utc>>, intervals: &[u32]) -> Self {
        let mut window = Self::new(start);
        if let Some(alerted_at) = last_alert.filter(|at| *at >= start) {
            let minutes_at_alert = whole_minutes(start, alerted_at);
            window.fired.extend(intervals.iter().copied().filter(|m| u64::from(*m) <= minutes_at_alert));
        }
        window
    }
}

/// What one inside sample means for the dwell session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwellObservation {
    pub minutes: u64,
    /// Minutes reached the dwell floor; a `dwell_update` is due
    pub update_due: bool,
    /// Largest interval boundary newly crossed by this sample
    pub alert: Option<u32>,
}

/// Whole minutes between two instants, clamped at zero
#[inline]
fn whole_minutes(start: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - start).num_minutes().max(0) as u64
}

pub struct DwellTracker {
    min_dwell_minutes: u64,
    windows: ShardedMap<PairKey, Option<DwellWindow>>,
}

impl DwellTracker {
    pub fn new(min_dwell_minutes: u64) -> Self {
        Self { min_dwell_minutes, windows: ShardedMap::new() }
    }

    pub fn min_dwell_minutes(&self) -> u64 {
        self.min_dwell_minutes
    }

    /// Accumulate dwell for an inside sample
    ///
    /// `dwell_start` is the persisted session start; `last_alert` seeds the
    /// fired set when no in-memory window exists yet.
    pub fn observe(
        &self,
        key: &PairKey,
        dwell_start: DateTime<Utc>,
        last_alert: Option<DateTime<Utc>>,
        intervals: &[u32],
        now: DateTime<Utc>,
    ) -> DwellObservation {
        let minutes = whole_minutes(dwell_start, now);

        let alert = self.windows.upsert(key.clone(), |slot: &mut Option<DwellWindow>| {
            if !matches!(slot, Some(w) if w.start == dwell_start) {
                *slot = Some(DwellWindow::restored(dwell_start, last_alert, intervals));
            }
            let window = slot.as_mut()?;

            let crossed: SmallVec<[u32; 4]> = intervals
                .iter()
                .copied()
                .filter(|m| u64::from(*m) <= minutes && !window.fired.contains(m))
                .collect();
            window.fired.extend(crossed.iter().copied());
            crossed.iter().copied().max()
        });

        if let Some(interval) = alert {
            debug!(key = %key, interval_minutes = %interval, dwell_minutes = %minutes, "dwell_boundary_crossed");
        }

        DwellObservation { minutes, update_due: minutes >= self.min_dwell_minutes, alert }
    }

    /// Forget the session (confirmed exit)
    pub fn reset(&self, key: &PairKey) {
        self.windows.remove(key);
    }

    pub fn is_tracking(&self, key: &PairKey) -> bool {
        self.windows.with(key, |w| matches!(w, Some(Some(_))))
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for DwellTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_DWELL_MINUTES)
    }
}
