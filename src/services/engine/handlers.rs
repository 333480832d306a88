//! Evaluation handlers for the geofence engine

use super::EngineInner;
use crate::domain::error::{EngineError, ErrorRecord, NotifyError};
use crate::domain::events::{
    new_uuid_v7, CancelReason, CancelledExit, ConfirmedExit, Delivery, DwellAlert, DwellNotice,
    DwellUpdate, EmergencyAlert, EmergencyNotice, EntryEvent, EvaluationResult, GeofenceAlert,
    PendingExitReport, Severity, Topic,
};
use crate::domain::types::{
    CooldownRecord, Geofence, GeofenceId, LatLng, LocationSample, NotificationKind, PairKey,
    StatusPatch, UserGeofenceStatus, UserId,
};
use crate::services::boundary::{self, Transition};
use crate::services::exit_scheduler::{BeginExit, PendingExit};
use crate::services::geo;
use crate::services::priority::{self, Prioritized};
use crate::services::scheduler::TimerTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// A geofence entered during this pass, waiting for arbitration
struct EntryCandidate {
    geofence: Geofence,
    distance_m: f64,
}

impl Prioritized for EntryCandidate {
    fn priority(&self) -> i32 {
        self.geofence.priority
    }

    fn geofence_id(&self) -> &GeofenceId {
        &self.geofence.id
    }
}

/// Notification payload routed to the matching collaborator call
enum Notice<'a> {
    Geofence(&'a GeofenceAlert),
    Dwell(&'a DwellNotice),
    Emergency(&'a EmergencyNotice),
}

impl EngineInner {
    pub(crate) async fn check_status(
        self: &Arc<Self>,
        user_id: &UserId,
        sample: &LocationSample,
    ) -> Result<EvaluationResult, EngineError> {
        let started = Instant::now();

        if let Err(e) = self.gate.admit(sample) {
            self.metrics.record_sample_rejected();
            warn!(user_id = %user_id, accuracy_m = %sample.accuracy, error = %e, "sample_rejected");
            return Err(e);
        }

        let now = self.clock.now();
        let location = sample.position();

        let geofences = self.repository.find_active_by_user(user_id).await.map_err(|e| {
            error!(user_id = %user_id, error = %e, "geofence_lookup_failed");
            EngineError::from(e)
        })?;

        let mut result = EvaluationResult::new(user_id.clone(), now, location);
        let mut entered = Vec::new();

        for geofence in &geofences {
            let key = PairKey::new(user_id, &geofence.id);
            let outcome = {
                let _guard = self.locks.lock(&key).await;
                self.evaluate_geofence(&key, geofence, location, now, &mut result).await
            };
            match outcome {
                Ok(Some(candidate)) => entered.push(candidate),
                Ok(None) => {}
                Err(e) => self.capture_error(&key, &e, &mut result),
            }
        }

        self.notify_entries(user_id, entered, location, now, &mut result).await;

        let (confirmed, errors) = self.sweep_due_exits(user_id, now).await;
        result.confirmed_exits.extend(confirmed);
        result.errors.extend(errors);

        self.metrics.record_sample_evaluated(started.elapsed().as_micros() as u64);
        self.metrics.set_pending_exits(self.exits.len() as u64);

        debug!(
            user_id = %user_id,
            geofences = %geofences.len(),
            entries = %result.entries.len(),
            pending_exits = %result.pending_exits.len(),
            confirmed_exits = %result.confirmed_exits.len(),
            errors = %result.errors.len(),
            "sample_evaluated"
        );
        Ok(result)
    }

    /// Classify one geofence and apply the transition; the key lock is held
    async fn evaluate_geofence(
        self: &Arc<Self>,
        key: &PairKey,
        geofence: &Geofence,
        location: LatLng,
        now: DateTime<Utc>,
        result: &mut EvaluationResult,
    ) -> Result<Option<EntryCandidate>, EngineError> {
        let distance_m = geo::distance_m(location, geofence.center);
        let status = self.repository.get_user_geofence_status(&key.user_id, &key.geofence_id).await?;
        let transition = boundary::classify(
            distance_m,
            geofence.radius,
            status.as_ref().map(|s| s.status),
            self.exits.is_pending(key),
        );

        debug!(
            key = %key,
            distance_m = %format!("{distance_m:.1}"),
            radius_m = %geofence.radius,
            transition = %transition.as_str(),
            "geofence_classified"
        );

        match transition {
            Transition::Entry => self.record_entry(key, geofence, distance_m, now).await.map(Some),
            Transition::ExitCandidate => {
                self.handle_exit_candidate(key, geofence, location, distance_m, now, result).await?;
                Ok(None)
            }
            Transition::Return => {
                // The delay ran out unmet: the exit stands and this is a fresh entry
                if let Some(pending) = self.exits.take_if_due(key, now) {
                    let confirmed = self.finalize_exit(key, pending, now).await?;
                    result.confirmed_exits.push(confirmed);
                    return self.record_entry(key, geofence, distance_m, now).await.map(Some);
                }
                self.cancel_pending_exit(key, now, result);
                self.track_dwell(key, geofence, status.as_ref(), now, result).await?;
                Ok(None)
            }
            Transition::SteadyInside => {
                self.track_dwell(key, geofence, status.as_ref(), now, result).await?;
                Ok(None)
            }
            Transition::SteadyOutside => Ok(None),
        }
    }

    async fn record_entry(
        &self,
        key: &PairKey,
        geofence: &Geofence,
        distance_m: f64,
        now: DateTime<Utc>,
    ) -> Result<EntryCandidate, EngineError> {
        let dwell_start = geofence.dwell_tracking_enabled.then_some(now);
        self.repository
            .update_geofence_status(&key.user_id, &key.geofence_id, &StatusPatch::entered(now, dwell_start))
            .await?;
        self.dwell.reset(key);
        Ok(EntryCandidate { geofence: geofence.clone(), distance_m })
    }

    async fn handle_exit_candidate(
        self: &Arc<Self>,
        key: &PairKey,
        geofence: &Geofence,
        location: LatLng,
        distance_m: f64,
        now: DateTime<Utc>,
        result: &mut EvaluationResult,
    ) -> Result<(), EngineError> {
        // Polling callers may observe the delay elapsing before the timer does
        if let Some(pending) = self.exits.take_if_due(key, now) {
            let confirmed = self.finalize_exit(key, pending, now).await?;
            result.confirmed_exits.push(confirmed);
            return Ok(());
        }

        match self.exits.begin(key, geofence, now, location, distance_m) {
            BeginExit::Started(pending) => {
                self.schedule_exit_timer(key, pending.generation);
                info!(
                    user_id = %key.user_id,
                    geofence_id = %key.geofence_id,
                    distance_m = %format!("{distance_m:.1}"),
                    confirm_in_ms = %self.exits.delay_ms(),
                    "exit_pending"
                );
                result.pending_exits.push(self.pending_report(&pending, now, false));
            }
            BeginExit::AlreadyPending(pending) => {
                debug!(
                    key = %key,
                    remaining_ms = %pending.remaining_ms(now),
                    "exit_already_pending"
                );
                result.pending_exits.push(self.pending_report(&pending, now, true));
            }
        }
        Ok(())
    }

    fn pending_report(&self, pending: &PendingExit, now: DateTime<Utc>, already_pending: bool) -> PendingExitReport {
        PendingExitReport {
            geofence_id: pending.geofence.id.clone(),
            geofence_name: pending.geofence.name.clone(),
            distance_m: pending.distance_m,
            started_at: pending.started_at,
            confirm_at: pending.confirm_at,
            confirmation_delay_ms: self.exits.delay_ms(),
            remaining_ms: pending.remaining_ms(now),
            already_pending,
        }
    }

    fn schedule_exit_timer(self: &Arc<Self>, key: &PairKey, generation: u64) {
        let weak = Arc::downgrade(self);
        let task_key = key.clone();
        let task: TimerTask = Box::pin(async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_exit_timer(task_key, generation).await;
            }
        });
        let handle = self.scheduler.after(Duration::from_millis(self.exits.delay_ms()), task);
        self.exits.attach_timer(key, generation, handle);
    }

    /// Timer callback: confirm the exit unless it was cancelled or replaced
    async fn on_exit_timer(&self, key: PairKey, generation: u64) {
        let _guard = self.locks.lock(&key).await;
        let Some(pending) = self.exits.take_fired(&key, generation) else {
            debug!(key = %key, generation = %generation, "exit_timer_stale");
            return;
        };

        let now = self.clock.now();
        if let Err(e) = self.finalize_exit(&key, pending, now).await {
            self.metrics.record_geofence_error();
            error!(key = %key, error = %e, "exit_confirmation_failed");
        }
        self.metrics.set_pending_exits(self.exits.len() as u64);
    }

    /// Confirm every due pending exit of the user
    pub(crate) async fn sweep_due_exits(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> (Vec<ConfirmedExit>, Vec<ErrorRecord>) {
        let mut confirmed = Vec::new();
        let mut errors = Vec::new();

        for geofence_id in self.exits.due_for_user(user_id, now) {
            let key = PairKey::new(user_id, &geofence_id);
            let _guard = self.locks.lock(&key).await;
            let Some(pending) = self.exits.take_if_due(&key, now) else {
                continue;
            };
            match self.finalize_exit(&key, pending, now).await {
                Ok(exit) => confirmed.push(exit),
                Err(e) => {
                    self.metrics.record_geofence_error();
                    warn!(key = %key, error = %e, "exit_sweep_failed");
                    errors.push(ErrorRecord::for_geofence(&geofence_id, &e));
                }
            }
        }
        (confirmed, errors)
    }

    /// Persist a confirmed exit and notify about it
    ///
    /// `lastExit` is the instant the user was first seen outside; the
    /// confirmation instant is reported separately.
    async fn finalize_exit(
        &self,
        key: &PairKey,
        pending: PendingExit,
        now: DateTime<Utc>,
    ) -> Result<ConfirmedExit, EngineError> {
        self.repository
            .update_geofence_status(&key.user_id, &key.geofence_id, &StatusPatch::exited(pending.started_at))
            .await?;
        self.dwell.reset(key);
        self.metrics.record_exit_confirmed();

        let geofence = &pending.geofence;
        let alert = GeofenceAlert {
            kind: NotificationKind::Exit,
            geofence_id: geofence.id.clone(),
            geofence_name: geofence.name.clone(),
            geofence_type: geofence.geofence_type,
            location: pending.last_location,
            at: pending.started_at,
        };
        let delivery = self.notify(key, NotificationKind::Exit, now, Notice::Geofence(&alert)).await;

        let confirmed = ConfirmedExit {
            event_id: new_uuid_v7(),
            geofence_id: geofence.id.clone(),
            geofence_name: geofence.name.clone(),
            geofence_type: geofence.geofence_type,
            exited_at: pending.started_at,
            confirmed_at: now,
            last_location: pending.last_location,
            distance_m: pending.distance_m,
            delivery,
        };
        self.publish(Topic::Exit, &key.user_id, &confirmed);
        info!(
            user_id = %key.user_id,
            geofence_id = %key.geofence_id,
            name = %geofence.name,
            pending_ms = %(now - pending.started_at).num_milliseconds(),
            notification_sent = %delivery.notification_sent,
            "exit_confirmed"
        );
        Ok(confirmed)
    }

    /// Drop a pending exit because the user came back; dwell start is kept
    fn cancel_pending_exit(&self, key: &PairKey, now: DateTime<Utc>, result: &mut EvaluationResult) {
        let Some(pending) = self.exits.cancel(key) else {
            return;
        };
        self.metrics.record_exit_cancelled();

        let cancelled = CancelledExit {
            event_id: new_uuid_v7(),
            geofence_id: pending.geofence.id.clone(),
            geofence_name: pending.geofence.name.clone(),
            reason: CancelReason::UserReturned,
            pending_since: pending.started_at,
            cancelled_at: now,
        };
        self.publish(Topic::ExitCancelled, &key.user_id, &cancelled);
        info!(
            user_id = %key.user_id,
            geofence_id = %key.geofence_id,
            pending_ms = %(now - pending.started_at).num_milliseconds(),
            "exit_cancelled"
        );
        result.cancelled_exits.push(cancelled);
    }

    async fn track_dwell(
        &self,
        key: &PairKey,
        geofence: &Geofence,
        status: Option<&UserGeofenceStatus>,
        now: DateTime<Utc>,
        result: &mut EvaluationResult,
    ) -> Result<(), EngineError> {
        if !geofence.dwell_tracking_enabled {
            return Ok(());
        }
        let Some(status) = status else {
            return Ok(());
        };

        let dwell_start = match status.dwell_start_time {
            Some(start) => start,
            None => {
                // Tracking was switched on while the user was already inside
                let start = status.last_entry.unwrap_or(now);
                self.repository
                    .update_geofence_status(&key.user_id, &key.geofence_id, &StatusPatch::dwell_started(start))
                    .await?;
                start
            }
        };

        let intervals = if geofence.dwell_alert_intervals.is_empty() {
            &self.settings.default_dwell_alert_intervals[..]
        } else {
            &geofence.dwell_alert_intervals[..]
        };
        let observation = self.dwell.observe(key, dwell_start, status.last_dwell_alert, intervals, now);

        if observation.update_due {
            result.dwell_updates.push(DwellUpdate {
                geofence_id: geofence.id.clone(),
                geofence_name: geofence.name.clone(),
                dwell_start,
                dwell_minutes: observation.minutes,
            });
        }

        if let Some(interval_minutes) = observation.alert {
            self.repository
                .update_geofence_status(&key.user_id, &key.geofence_id, &StatusPatch::dwell_alerted(now))
                .await?;
            self.metrics.record_dwell_alert();

            let notice = DwellNotice {
                geofence_id: geofence.id.clone(),
                geofence_name: geofence.name.clone(),
                interval_minutes,
                dwell_minutes: observation.minutes,
                at: now,
            };
            let delivery = self.notify(key, NotificationKind::DwellAlert, now, Notice::Dwell(&notice)).await;
            info!(
                user_id = %key.user_id,
                geofence_id = %key.geofence_id,
                interval_minutes = %interval_minutes,
                dwell_minutes = %observation.minutes,
                notification_sent = %delivery.notification_sent,
                "dwell_alert"
            );
            result.dwell_alerts.push(DwellAlert {
                event_id: new_uuid_v7(),
                geofence_id: geofence.id.clone(),
                geofence_name: geofence.name.clone(),
                interval_minutes,
                dwell_minutes: observation.minutes,
                delivery,
            });
        }
        Ok(())
    }

    /// Arbitrate and notify the entries of this pass
    ///
    /// Every entry is recorded. Only the highest-priority one may notify;
    /// emergency alerts go out regardless.
    async fn notify_entries(
        &self,
        user_id: &UserId,
        entered: Vec<EntryCandidate>,
        location: LatLng,
        now: DateTime<Utc>,
        result: &mut EvaluationResult,
    ) {
        let winner = priority::select(&entered);

        for (idx, candidate) in entered.into_iter().enumerate() {
            let geofence = &candidate.geofence;
            let key = PairKey::new(user_id, &geofence.id);
            self.metrics.record_entry();

            let delivery = if winner == Some(idx) {
                let alert = GeofenceAlert {
                    kind: NotificationKind::Entry,
                    geofence_id: geofence.id.clone(),
                    geofence_name: geofence.name.clone(),
                    geofence_type: geofence.geofence_type,
                    location,
                    at: now,
                };
                self.notify(&key, NotificationKind::Entry, now, Notice::Geofence(&alert)).await
            } else {
                self.metrics.record_notification_priority();
                warn!(
                    user_id = %user_id,
                    geofence_id = %geofence.id,
                    priority = %geofence.priority,
                    "entry_notification_suppressed_priority"
                );
                Delivery::PRIORITY
            };

            let entry = EntryEvent {
                event_id: new_uuid_v7(),
                geofence_id: geofence.id.clone(),
                geofence_name: geofence.name.clone(),
                geofence_type: geofence.geofence_type,
                priority: geofence.priority,
                distance_m: candidate.distance_m,
                entered_at: now,
                delivery,
            };
            self.publish(Topic::Entry, user_id, &entry);
            info!(
                user_id = %user_id,
                geofence_id = %geofence.id,
                name = %geofence.name,
                geofence_type = %geofence.geofence_type.as_str(),
                distance_m = %format!("{:.1}", candidate.distance_m),
                notification_sent = %delivery.notification_sent,
                "geofence_entry"
            );
            result.entries.push(entry);

            if geofence.raises_emergency() {
                let alert = self.raise_emergency(&key, geofence, location, now).await;
                result.emergency_alerts.push(alert);
            }
        }
    }

    /// Critical alert for a danger zone entry; never arbitrated
    async fn raise_emergency(
        &self,
        key: &PairKey,
        geofence: &Geofence,
        location: LatLng,
        now: DateTime<Utc>,
    ) -> EmergencyAlert {
        let violation = EngineError::GeofenceViolation {
            user_id: key.user_id.clone(),
            geofence_id: geofence.id.clone(),
            geofence_name: geofence.name.clone(),
        };
        self.metrics.record_emergency_alert();

        let notice = EmergencyNotice {
            geofence_id: geofence.id.clone(),
            geofence_name: geofence.name.clone(),
            severity: Severity::Critical,
            message: violation.to_string(),
            location,
            at: now,
        };
        let delivery = self.notify(key, NotificationKind::Emergency, now, Notice::Emergency(&notice)).await;

        let alert = EmergencyAlert {
            event_id: new_uuid_v7(),
            geofence_id: geofence.id.clone(),
            geofence_name: geofence.name.clone(),
            severity: Severity::Critical,
            message: notice.message,
            location,
            raised_at: now,
            notification_sent: delivery.notification_sent,
        };
        self.publish(Topic::Emergency, &key.user_id, &alert);
        warn!(
            user_id = %key.user_id,
            geofence_id = %geofence.id,
            error = %violation,
            notification_sent = %delivery.notification_sent,
            "emergency_alert"
        );
        alert
    }

    /// Gate a notification through the cooldown ledger, then hand it over
    async fn notify(
        &self,
        key: &PairKey,
        kind: NotificationKind,
        now: DateTime<Utc>,
        notice: Notice<'_>,
    ) -> Delivery {
        self.load_cooldown(key, kind).await;

        let previous = match self.cooldowns.try_notify(key, kind, now) {
            Ok(previous) => previous,
            Err(e) => {
                self.metrics.record_notification_cooldown();
                warn!(key = %key, kind = %kind, error = %e, "notification_suppressed_cooldown");
                return Delivery::COOLDOWN;
            }
        };

        let sent = match notice {
            Notice::Geofence(alert) => self.notifier.send_geofence_alert(&key.user_id, alert).await,
            Notice::Dwell(notice) => self.notifier.send_dwell_alert(&key.user_id, notice).await,
            Notice::Emergency(notice) => self.notifier.send_emergency_alert(&key.user_id, notice).await,
        };
        self.delivered(key, kind, now, previous, sent).await
    }

    async fn delivered(
        &self,
        key: &PairKey,
        kind: NotificationKind,
        now: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
        sent: Result<(), NotifyError>,
    ) -> Delivery {
        match sent {
            Ok(()) => {
                self.metrics.record_notification_sent();
                let record = CooldownRecord {
                    user_id: key.user_id.clone(),
                    geofence_id: key.geofence_id.clone(),
                    kind,
                    sent_at: now,
                };
                if let Err(e) = self.repository.record_notification(&record).await {
                    error!(key = %key, kind = %kind, error = %e, "cooldown_record_failed");
                }
                Delivery::SENT
            }
            Err(e) => {
                // Nothing went out, so the window must not start
                self.cooldowns.rollback(key, kind, now, previous);
                self.metrics.record_notification_failed();
                warn!(key = %key, kind = %kind, error = %e, "notification_failed");
                Delivery::FAILED
            }
        }
    }

    /// Seed the ledger from the store the first time a triple is seen
    async fn load_cooldown(&self, key: &PairKey, kind: NotificationKind) {
        if self.cooldowns.is_known(key, kind) {
            return;
        }
        match self.repository.get_last_notification(&key.user_id, &key.geofence_id, kind).await {
            Ok(Some(record)) => self.cooldowns.seed(&record),
            Ok(None) => self.cooldowns.mark_known(key, kind),
            Err(e) => warn!(key = %key, kind = %kind, error = %e, "cooldown_lookup_failed"),
        }
    }

    fn capture_error(&self, key: &PairKey, err: &EngineError, result: &mut EvaluationResult) {
        self.metrics.record_geofence_error();
        warn!(key = %key, kind = %err.kind(), error = %err, "geofence_error");
        result.errors.push(ErrorRecord::for_geofence(&key.geofence_id, err));
    }

    /// Emit a record on the bus with the owning user attached
    fn publish<T: Serialize>(&self, topic: Topic, user_id: &UserId, record: &T) {
        match serde_json::to_value(record) {
            Ok(mut payload) => {
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert("userId".into(), serde_json::Value::String(user_id.to_string()));
                }
                self.event_bus.emit(topic, payload);
            }
            Err(e) => warn!(topic = %topic, error = %e, "event_serialize_failed"),
        }
    }
}
