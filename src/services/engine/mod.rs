//! Geofence event engine
//!
//! The engine is the single orchestration path for per-(user, geofence)
//! state. It coordinates:
//! - Accuracy gating of incoming samples
//! - Boundary classification and persisted presence status
//! - Exit confirmation (pending exits and their timers)
//! - Dwell tracking and one-shot dwell alerts
//! - Cooldown and priority gating of notifications
//! - Emergency signaling for danger zones
//!
//! Every mutation of one key happens under that key's async lock, so a
//! location update and a firing exit timer for the same key are serialized.

mod handlers;

use crate::domain::error::EngineError;
use crate::domain::events::{ConfirmedExit, EvaluationResult};
use crate::domain::types::{
    GeofenceId, LocationReport, LocationSample, PairKey, UserId, DEFAULT_DWELL_ALERT_INTERVALS,
};
use crate::infra::clock::{Clock, SystemClock};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::infra::sharded::KeyLocks;
use crate::io::event_bus::{EventBus, NoopEventBus};
use crate::io::notifier::{LogNotifier, NotificationService};
use crate::io::repository::GeofenceRepository;
use crate::services::accuracy::{AccuracyGate, DEFAULT_ACCURACY_THRESHOLD_M};
use crate::services::cooldown::{CooldownLedger, CooldownWindows};
use crate::services::dwell_tracker::{DwellTracker, DEFAULT_MIN_DWELL_MINUTES};
use crate::services::exit_scheduler::{ExitScheduler, DEFAULT_EXIT_CONFIRMATION_DELAY_MS};
use crate::services::scheduler::{Scheduler, TokioScheduler};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

pub const DEFAULT_BATCH_CONCURRENCY: usize = 64;

/// Timing and threshold settings
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub accuracy_threshold_m: f64,
    pub exit_confirmation_delay_ms: u64,
    pub min_dwell_minutes: u64,
    /// Used for geofences that list no intervals of their own
    pub default_dwell_alert_intervals: Vec<u32>,
    pub cooldowns: CooldownWindows,
    pub batch_concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            accuracy_threshold_m: DEFAULT_ACCURACY_THRESHOLD_M,
            exit_confirmation_delay_ms: DEFAULT_EXIT_CONFIRMATION_DELAY_MS,
            min_dwell_minutes: DEFAULT_MIN_DWELL_MINUTES,
            default_dwell_alert_intervals: DEFAULT_DWELL_ALERT_INTERVALS.to_vec(),
            cooldowns: CooldownWindows::default(),
            batch_concurrency: DEFAULT_BATCH_CONCURRENCY,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let engine = config.engine();
        Self {
            accuracy_threshold_m: engine.accuracy_threshold_m,
            exit_confirmation_delay_ms: engine.exit_confirmation_delay_ms,
            min_dwell_minutes: engine.min_dwell_minutes,
            default_dwell_alert_intervals: engine.default_dwell_alert_intervals.clone(),
            cooldowns: CooldownWindows::from_config(config.cooldown()),
            batch_concurrency: engine.batch_concurrency.max(1),
        }
    }
}

/// Outcome for one report of a batch
#[derive(Debug)]
pub struct BatchEntry {
    pub user_id: UserId,
    pub outcome: Result<EvaluationResult, EngineError>,
}

/// Shared engine state
pub(crate) struct EngineInner {
    pub(crate) repository: Arc<dyn GeofenceRepository>,
    pub(crate) notifier: Arc<dyn NotificationService>,
    pub(crate) event_bus: Arc<dyn EventBus>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) settings: EngineSettings,
    pub(crate) gate: AccuracyGate,
    pub(crate) exits: ExitScheduler,
    pub(crate) dwell: DwellTracker,
    pub(crate) cooldowns: CooldownLedger,
    pub(crate) locks: KeyLocks<PairKey>,
    batch_permits: Arc<Semaphore>,
}

pub struct GeofenceEngineBuilder {
    repository: Arc<dyn GeofenceRepository>,
    notifier: Option<Arc<dyn NotificationService>>,
    event_bus: Option<Arc<dyn EventBus>>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    metrics: Option<Arc<Metrics>>,
    settings: EngineSettings,
}

impl GeofenceEngineBuilder {
    pub fn notifier(mut self, notifier: Arc<dyn NotificationService>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> GeofenceEngine {
        let settings = self.settings;
        let inner = EngineInner {
            repository: self.repository,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            event_bus: self.event_bus.unwrap_or_else(|| Arc::new(NoopEventBus)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            scheduler: self.scheduler.unwrap_or_else(|| Arc::new(TokioScheduler)),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(Metrics::new())),
            gate: AccuracyGate::new(settings.accuracy_threshold_m),
            exits: ExitScheduler::new(settings.exit_confirmation_delay_ms),
            dwell: DwellTracker::new(settings.min_dwell_minutes),
            cooldowns: CooldownLedger::new(settings.cooldowns),
            locks: KeyLocks::new(),
            batch_permits: Arc::new(Semaphore::new(settings.batch_concurrency.max(1))),
            settings,
        };
        info!(
            accuracy_threshold_m = %inner.settings.accuracy_threshold_m,
            exit_confirmation_delay_ms = %inner.settings.exit_confirmation_delay_ms,
            min_dwell_minutes = %inner.settings.min_dwell_minutes,
            batch_concurrency = %inner.settings.batch_concurrency,
            "geofence_engine_created"
        );
        GeofenceEngine { inner: Arc::new(inner) }
    }
}

/// Cheap to clone; all clones share one state
#[derive(Clone)]
pub struct GeofenceEngine {
    inner: Arc<EngineInner>,
}

impl GeofenceEngine {
    pub fn builder(repository: Arc<dyn GeofenceRepository>) -> GeofenceEngineBuilder {
        GeofenceEngineBuilder {
            repository,
            notifier: None,
            event_bus: None,
            clock: None,
            scheduler: None,
            metrics: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Evaluate one sample against every active geofence of `user_id`
    ///
    /// Fails as a whole only when the sample is rejected or the user's
    /// geofences cannot be loaded. Per-geofence failures land in
    /// `result.errors`.
    pub async fn check_status(
        &self,
        user_id: &UserId,
        sample: &LocationSample,
    ) -> Result<EvaluationResult, EngineError> {
        self.inner.check_status(user_id, sample).await
    }

    /// Evaluate many reports concurrently, isolating failures per report
    ///
    /// Output order matches input order.
    pub async fn check_status_batch(&self, reports: Vec<LocationReport>) -> Vec<BatchEntry> {
        let users: Vec<UserId> = reports.iter().map(|r| r.user_id.clone()).collect();
        let mut outcomes: Vec<Option<Result<EvaluationResult, EngineError>>> =
            (0..reports.len()).map(|_| None).collect();

        let mut set = JoinSet::new();
        for (idx, report) in reports.into_iter().enumerate() {
            let engine = self.clone();
            let permits = self.inner.batch_permits.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let outcome = engine.check_status(&report.user_id, &report.sample).await;
                (idx, outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => {
                    if let Some(slot) = outcomes.get_mut(idx) {
                        *slot = Some(outcome);
                    }
                }
                Err(e) => error!(error = %e, "batch_task_failed"),
            }
        }

        users
            .into_iter()
            .zip(outcomes)
            .map(|(user_id, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    Err(EngineError::TaskFailed(format!("evaluation for user {user_id} did not complete")))
                });
                BatchEntry { user_id, outcome }
            })
            .collect()
    }

    /// Confirm every pending exit of `user_id` whose delay has elapsed
    pub async fn sweep_due_exits(&self, user_id: &UserId) -> Vec<ConfirmedExit> {
        let now = self.inner.clock.now();
        let (confirmed, _errors) = self.inner.sweep_due_exits(user_id, now).await;
        self.inner.metrics.set_pending_exits(self.inner.exits.len() as u64);
        confirmed
    }

    /// Pending exits across all users
    pub fn pending_exit_count(&self) -> usize {
        self.inner.exits.len()
    }

    pub fn is_exit_pending(&self, user_id: &UserId, geofence_id: &GeofenceId) -> bool {
        self.inner.exits.is_pending(&PairKey::new(user_id, geofence_id))
    }

    /// Drop per-key locks nobody holds
    pub fn prune_idle_locks(&self) {
        self.inner.locks.prune();
    }
}
