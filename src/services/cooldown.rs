//! Notification cooldown ledger
//!
//! One stamp per (user, geofence, kind): the last time a notification of that
//! kind actually went out. A new notification is allowed when no stamp exists
//! or the window has strictly elapsed. A zero window always allows.
//! Emergencies have no window at all.

use crate::domain::error::EngineError;
use crate::domain::types::{CooldownRecord, NotificationKind, PairKey};
use crate::infra::config::CooldownConfig;
use crate::infra::sharded::ShardedMap;
use chrono::{DateTime, Duration, Utc};

/// Cooldown window per notification kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownWindows {
    pub entry: Duration,
    pub exit: Duration,
    pub dwell_alert: Duration,
}

impl CooldownWindows {
    pub fn window(&self, kind: NotificationKind) -> Duration {
        match kind {
            NotificationKind::Entry => self.entry,
            NotificationKind::Exit => self.exit,
            NotificationKind::DwellAlert => self.dwell_alert,
            NotificationKind::Emergency => Duration::zero(),
        }
    }

    pub fn from_config(config: &CooldownConfig) -> Self {
        Self {
            entry: Duration::seconds(config.entry_secs as i64),
            exit: Duration::seconds(config.exit_secs as i64),
            dwell_alert: Duration::seconds(config.dwell_alert_secs as i64),
        }
    }
}

impl Default for CooldownWindows {
    fn default() -> Self {
        Self {
            entry: Duration::minutes(5),
            exit: Duration::minutes(5),
            dwell_alert: Duration::minutes(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    pair: PairKey,
    kind: NotificationKind,
}

pub struct CooldownLedger {
    windows: CooldownWindows,
    /// `None` marks a triple known to have no persisted stamp
    stamps: ShardedMap<LedgerKey, Option<DateTime<Utc>>>,
}

impl CooldownLedger {
    pub fn new(windows: CooldownWindows) -> Self {
        Self { windows, stamps: ShardedMap::new() }
    }

    pub fn windows(&self) -> &CooldownWindows {
        &self.windows
    }

    /// Check and stamp in one step
    ///
    /// On success the stamp becomes `now` and the stamp it replaced is
    /// returned, so a send that fails can be undone with [`Self::rollback`].
    /// On failure nothing changes and the error carries the time left in the
    /// window.
    pub fn try_notify(
        &self,
        key: &PairKey,
        kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        let window = self.windows.window(kind);
        let ledger_key = LedgerKey { pair: key.clone(), kind };
        let outcome = self.stamps.upsert(ledger_key, |stamp| match *stamp {
            Some(last) if window > Duration::zero() && now - last <= window => {
                Err(window - (now - last))
            }
            previous => {
                *stamp = Some(now);
                Ok(previous)
            }
        });

        outcome.map_err(|remaining| EngineError::CooldownActive {
            user_id: key.user_id.clone(),
            geofence_id: key.geofence_id.clone(),
            kind,
            remaining: remaining.to_std().unwrap_or_default(),
        })
    }

    /// Restore the stamp replaced by `try_notify` when the send failed
    ///
    /// A stamp that moved on since `stamped` is left alone.
    pub fn rollback(
        &self,
        key: &PairKey,
        kind: NotificationKind,
        stamped: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) {
        self.stamps.update(&LedgerKey { pair: key.clone(), kind }, |stamp| {
            if *stamp == Some(stamped) {
                *stamp = previous;
            }
        });
    }

    /// Whether a notification would currently be blocked, without stamping
    pub fn is_active(&self, key: &PairKey, kind: NotificationKind, now: DateTime<Utc>) -> bool {
        let window = self.windows.window(kind);
        if window <= Duration::zero() {
            return false;
        }
        self.last(key, kind).is_some_and(|last| now - last <= window)
    }

    pub fn last(&self, key: &PairKey, kind: NotificationKind) -> Option<DateTime<Utc>> {
        self.stamps.get(&LedgerKey { pair: key.clone(), kind }).flatten()
    }

    pub fn is_known(&self, key: &PairKey, kind: NotificationKind) -> bool {
        self.stamps.contains_key(&LedgerKey { pair: key.clone(), kind })
    }

    /// Load a persisted stamp; the newer of the two wins
    pub fn seed(&self, record: &CooldownRecord) {
        let key = PairKey::new(&record.user_id, &record.geofence_id);
        let ledger_key = LedgerKey { pair: key, kind: record.kind };
        self.stamps.upsert(ledger_key, |stamp| {
            if stamp.map_or(true, |current| record.sent_at > current) {
                *stamp = Some(record.sent_at);
            }
        });
    }

    /// Remember that the store has no stamp for this triple
    pub fn mark_known(&self, key: &PairKey, kind: NotificationKind) {
        self.stamps.upsert(LedgerKey { pair: key.clone(), kind }, |_| ());
    }

    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }
}

impl Default for CooldownLedger {
    fn default() -> Self {
        Self::new(CooldownWindows::default())
    }
}
