//! Geofence registration and update
//!
//! A thin validation layer in front of the repository. The engine never goes
//! through here; it only reads what the registry stored.

use crate::domain::error::ValidationError;
use crate::domain::types::{
    Geofence, GeofenceId, GeofenceType, LatLng, NewGeofence, UserId, DEFAULT_DWELL_ALERT_INTERVALS,
    DEFAULT_PRIORITY,
};
use crate::infra::config::Config;
use crate::infra::sharded::KeyLocks;
use crate::io::repository::GeofenceRepository;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub const MIN_RADIUS_M: f64 = 1.0;
pub const MAX_RADIUS_M: f64 = 2000.0;
pub const DEFAULT_MAX_GEOFENCES_PER_USER: usize = 10;

/// Caller-supplied geofence fields; everything optional until validated
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceDraft {
    pub name: Option<String>,
    pub center: Option<LatLng>,
    pub radius: Option<f64>,
    #[serde(rename = "type")]
    pub geofence_type: Option<GeofenceType>,
    pub emergency_enabled: Option<bool>,
    pub dwell_tracking_enabled: Option<bool>,
    pub dwell_alert_intervals: Option<Vec<u32>>,
    pub priority: Option<i32>,
    pub active: Option<bool>,
}

fn validate_center(center: LatLng) -> Result<(), ValidationError> {
    if center.is_valid() {
        Ok(())
    } else {
        Err(ValidationError::InvalidCoordinates { lat: center.lat, lng: center.lng })
    }
}

fn validate_radius(radius: f64) -> Result<(), ValidationError> {
    if radius.is_finite() && (MIN_RADIUS_M..=MAX_RADIUS_M).contains(&radius) {
        Ok(())
    } else {
        Err(ValidationError::InvalidRadius(radius))
    }
}

/// Positive and strictly ascending
fn validate_intervals(intervals: &[u32]) -> Result<(), ValidationError> {
    let positive = intervals.iter().all(|m| *m > 0);
    let ascending = intervals.windows(2).all(|w| w[0] < w[1]);
    if positive && ascending {
        Ok(())
    } else {
        Err(ValidationError::InvalidDwellIntervals)
    }
}

fn required_name(name: Option<&str>) -> Result<String, ValidationError> {
    match name.map(str::trim) {
        Some(n) if !n.is_empty() => Ok(n.to_string()),
        _ => Err(ValidationError::MissingField("name")),
    }
}

/// Registrations and updates of one user are serialized, so the quota and
/// name checks hold until the write lands.
pub struct GeofenceRegistry {
    repository: Arc<dyn GeofenceRepository>,
    max_per_user: usize,
    default_intervals: Vec<u32>,
    locks: KeyLocks<UserId>,
}

impl GeofenceRegistry {
    pub fn new(repository: Arc<dyn GeofenceRepository>) -> Self {
        Self {
            repository,
            max_per_user: DEFAULT_MAX_GEOFENCES_PER_USER,
            default_intervals: DEFAULT_DWELL_ALERT_INTERVALS.to_vec(),
            locks: KeyLocks::new(),
        }
    }

    pub fn from_config(repository: Arc<dyn GeofenceRepository>, config: &Config) -> Self {
        Self {
            repository,
            max_per_user: config.engine().max_geofences_per_user,
            default_intervals: config.engine().default_dwell_alert_intervals.clone(),
            locks: KeyLocks::new(),
        }
    }

    pub fn max_per_user(&self) -> usize {
        self.max_per_user
    }

    /// Validate and store a new geofence for `user_id`
    pub async fn register(
        &self,
        user_id: &UserId,
        draft: GeofenceDraft,
    ) -> Result<Geofence, ValidationError> {
        if user_id.as_str().trim().is_empty() {
            return Err(ValidationError::MissingField("userId"));
        }
        let name = required_name(draft.name.as_deref())?;
        let center = draft.center.ok_or(ValidationError::MissingField("center"))?;
        let radius = draft.radius.ok_or(ValidationError::MissingField("radius"))?;
        validate_center(center)?;
        validate_radius(radius)?;

        let intervals = match draft.dwell_alert_intervals {
            Some(list) if !list.is_empty() => list,
            _ => self.default_intervals.clone(),
        };
        validate_intervals(&intervals)?;

        let active = draft.active.unwrap_or(true);
        let _guard = self.locks.lock(user_id).await;
        if active {
            self.check_quota(user_id).await?;
        }
        self.check_unique_name(user_id, &name, None).await?;

        let geofence = self
            .repository
            .create(NewGeofence {
                user_id: user_id.clone(),
                name,
                center,
                radius,
                geofence_type: draft.geofence_type.unwrap_or(GeofenceType::SafeZone),
                emergency_enabled: draft.emergency_enabled.unwrap_or(false),
                dwell_tracking_enabled: draft.dwell_tracking_enabled.unwrap_or(false),
                dwell_alert_intervals: intervals,
                priority: draft.priority.unwrap_or(DEFAULT_PRIORITY),
                active,
            })
            .await?;

        info!(
            user_id = %user_id,
            geofence_id = %geofence.id,
            name = %geofence.name,
            geofence_type = %geofence.geofence_type.as_str(),
            radius_m = %geofence.radius,
            "geofence_registered"
        );
        Ok(geofence)
    }

    /// Apply the fields present in `draft` to an existing geofence
    pub async fn update(
        &self,
        user_id: &UserId,
        id: &GeofenceId,
        draft: GeofenceDraft,
    ) -> Result<Geofence, ValidationError> {
        let _guard = self.locks.lock(user_id).await;
        let existing = self
            .repository
            .find_by_id(id)
            .await?
            .filter(|g| &g.user_id == user_id)
            .ok_or_else(|| ValidationError::NotFound(id.clone()))?;

        let mut updated = existing.clone();
        if let Some(name) = draft.name.as_deref() {
            updated.name = required_name(Some(name))?;
        }
        if let Some(center) = draft.center {
            validate_center(center)?;
            updated.center = center;
        }
        if let Some(radius) = draft.radius {
            validate_radius(radius)?;
            updated.radius = radius;
        }
        if let Some(intervals) = draft.dwell_alert_intervals {
            let intervals = if intervals.is_empty() { self.default_intervals.clone() } else { intervals };
            validate_intervals(&intervals)?;
            updated.dwell_alert_intervals = intervals;
        }
        if let Some(t) = draft.geofence_type {
            updated.geofence_type = t;
        }
        if let Some(v) = draft.emergency_enabled {
            updated.emergency_enabled = v;
        }
        if let Some(v) = draft.dwell_tracking_enabled {
            updated.dwell_tracking_enabled = v;
        }
        if let Some(p) = draft.priority {
            updated.priority = p;
        }
        if let Some(active) = draft.active {
            updated.active = active;
        }

        if updated.active && !existing.active {
            self.check_quota(user_id).await?;
        }
        if !updated.name.eq_ignore_ascii_case(&existing.name) {
            self.check_unique_name(user_id, &updated.name, Some(id)).await?;
        }

        let stored = self.repository.update(updated).await?;
        info!(user_id = %user_id, geofence_id = %stored.id, active = %stored.active, "geofence_updated");
        Ok(stored)
    }

    async fn check_quota(&self, user_id: &UserId) -> Result<(), ValidationError> {
        let count = self.repository.count_user_geofences(user_id).await?;
        if count >= self.max_per_user {
            return Err(ValidationError::QuotaExceeded { limit: self.max_per_user });
        }
        Ok(())
    }

    async fn check_unique_name(
        &self,
        user_id: &UserId,
        name: &str,
        except: Option<&GeofenceId>,
    ) -> Result<(), ValidationError> {
        match self.repository.find_by_user_and_name(user_id, name).await? {
            Some(existing) if Some(&existing.id) != except => {
                Err(ValidationError::DuplicateName(name.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::RepositoryError;
    use crate::domain::types::{CooldownRecord, NotificationKind, StatusPatch, UserGeofenceStatus};
    use crate::io::repository::InMemoryRepository;
    use async_trait::async_trait;

    fn registry() -> (GeofenceRegistry, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        (GeofenceRegistry::new(repo.clone()), repo)
    }

    fn draft(name: &str) -> GeofenceDraft {
        GeofenceDraft {
            name: Some(name.into()),
            center: Some(LatLng::new(24.8138, 120.9675)),
            radius: Some(100.0),
            ..GeofenceDraft::default()
        }
    }

    fn user() -> UserId {
        UserId::new("u-1")
    }

    #[tokio::test]
    async fn test_register_applies_defaults() {
        let (registry, _) = registry();
        let fence = registry.register(&user(), draft("Home")).await.unwrap();
        assert_eq!(fence.geofence_type, GeofenceType::SafeZone);
        assert_eq!(fence.dwell_alert_intervals, vec![5, 15, 30, 60]);
        assert_eq!(fence.priority, DEFAULT_PRIORITY);
        assert!(fence.active);
    }

    #[tokio::test]
    async fn test_register_rejects_missing_fields() {
        let (registry, _) = registry();
        let no_name = GeofenceDraft { name: Some("  ".into()), ..draft("x") };
        assert!(matches!(
            registry.register(&user(), no_name).await,
            Err(ValidationError::MissingField("name"))
        ));
        let no_center = GeofenceDraft { center: None, ..draft("x") };
        assert!(matches!(
            registry.register(&user(), no_center).await,
            Err(ValidationError::MissingField("center"))
        ));
        let no_radius = GeofenceDraft { radius: None, ..draft("x") };
        assert!(matches!(
            registry.register(&user(), no_radius).await,
            Err(ValidationError::MissingField("radius"))
        ));
        assert!(matches!(
            registry.register(&UserId::new(""), draft("x")).await,
            Err(ValidationError::MissingField("userId"))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_bad_geometry() {
        let (registry, _) = registry();
        let bad_center = GeofenceDraft { center: Some(LatLng::new(91.0, 0.0)), ..draft("a") };
        assert!(matches!(
            registry.register(&user(), bad_center).await,
            Err(ValidationError::InvalidCoordinates { .. })
        ));
        for radius in [0.5, 2000.5, f64::NAN] {
            let d = GeofenceDraft { radius: Some(radius), ..draft("a") };
            assert!(matches!(registry.register(&user(), d).await, Err(ValidationError::InvalidRadius(_))));
        }
        // Both ends of the range are accepted
        registry.register(&user(), GeofenceDraft { radius: Some(1.0), ..draft("a") }).await.unwrap();
        registry.register(&user(), GeofenceDraft { radius: Some(2000.0), ..draft("b") }).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_unordered_intervals() {
        let (registry, _) = registry();
        for intervals in [vec![15, 5], vec![0, 5], vec![5, 5]] {
            let d = GeofenceDraft { dwell_alert_intervals: Some(intervals), ..draft("a") };
            assert!(matches!(
                registry.register(&user(), d).await,
                Err(ValidationError::InvalidDwellIntervals)
            ));
        }
    }

    #[tokio::test]
    async fn test_quota_and_duplicate_name() {
        let (registry, _) = registry();
        for i in 0..DEFAULT_MAX_GEOFENCES_PER_USER {
            registry.register(&user(), draft(&format!("Fence {i}"))).await.unwrap();
        }
        assert!(matches!(
            registry.register(&user(), draft("One more")).await,
            Err(ValidationError::QuotaExceeded { limit: 10 })
        ));

        // Another user is unaffected, but names are per user
        let other = UserId::new("u-2");
        registry.register(&other, draft("Home")).await.unwrap();
        assert!(matches!(
            registry.register(&other, draft("home")).await,
            Err(ValidationError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn test_update_validates_and_checks_ownership() {
        let (registry, repo) = registry();
        let home = registry.register(&user(), draft("Home")).await.unwrap();
        registry.register(&user(), draft("School")).await.unwrap();

        let rename = GeofenceDraft { name: Some("School".into()), ..GeofenceDraft::default() };
        assert!(matches!(
            registry.update(&user(), &home.id, rename).await,
            Err(ValidationError::DuplicateName(_))
        ));

        let resize = GeofenceDraft { radius: Some(250.0), ..GeofenceDraft::default() };
        let updated = registry.update(&user(), &home.id, resize).await.unwrap();
        assert_eq!(updated.radius, 250.0);
        assert_eq!(updated.name, "Home");
        assert_eq!(repo.find_by_id(&home.id).await.unwrap().unwrap().radius, 250.0);

        let keep_name = GeofenceDraft { name: Some("Home".into()), ..GeofenceDraft::default() };
        assert!(registry.update(&user(), &home.id, keep_name).await.is_ok());

        assert!(matches!(
            registry.update(&UserId::new("intruder"), &home.id, GeofenceDraft::default()).await,
            Err(ValidationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reactivation_counts_against_quota() {
        let (registry, _) = registry();
        let parked = registry
            .register(&user(), GeofenceDraft { active: Some(false), ..draft("Parked") })
            .await
            .unwrap();
        for i in 0..DEFAULT_MAX_GEOFENCES_PER_USER {
            registry.register(&user(), draft(&format!("Fence {i}"))).await.unwrap();
        }
        let activate = GeofenceDraft { active: Some(true), ..GeofenceDraft::default() };
        assert!(matches!(
            registry.update(&user(), &parked.id, activate).await,
            Err(ValidationError::QuotaExceeded { .. })
        ));
    }

    /// Store whose lookups yield, so concurrent registrations interleave
    struct YieldingRepository(InMemoryRepository);

    #[async_trait]
    impl GeofenceRepository for YieldingRepository {
        async fn find_active_by_user(&self, user_id: &UserId) -> Result<Vec<Geofence>, RepositoryError> {
            self.0.find_active_by_user(user_id).await
        }

        async fn find_by_id(&self, id: &GeofenceId) -> Result<Option<Geofence>, RepositoryError> {
            self.0.find_by_id(id).await
        }

        async fn get_user_geofence_status(
            &self,
            user_id: &UserId,
            geofence_id: &GeofenceId,
        ) -> Result<Option<UserGeofenceStatus>, RepositoryError> {
            self.0.get_user_geofence_status(user_id, geofence_id).await
        }

        async fn update_geofence_status(
            &self,
            user_id: &UserId,
            geofence_id: &GeofenceId,
            patch: &StatusPatch,
        ) -> Result<(), RepositoryError> {
            self.0.update_geofence_status(user_id, geofence_id, patch).await
        }

        async fn get_last_notification(
            &self,
            user_id: &UserId,
            geofence_id: &GeofenceId,
            kind: NotificationKind,
        ) -> Result<Option<CooldownRecord>, RepositoryError> {
            self.0.get_last_notification(user_id, geofence_id, kind).await
        }

        async fn record_notification(&self, record: &CooldownRecord) -> Result<(), RepositoryError> {
            self.0.record_notification(record).await
        }

        async fn count_user_geofences(&self, user_id: &UserId) -> Result<usize, RepositoryError> {
            let count = self.0.count_user_geofences(user_id).await;
            tokio::task::yield_now().await;
            count
        }

        async fn find_by_user_and_name(
            &self,
            user_id: &UserId,
            name: &str,
        ) -> Result<Option<Geofence>, RepositoryError> {
            let found = self.0.find_by_user_and_name(user_id, name).await;
            tokio::task::yield_now().await;
            found
        }

        async fn create(&self, geofence: NewGeofence) -> Result<Geofence, RepositoryError> {
            self.0.create(geofence).await
        }

        async fn update(&self, geofence: Geofence) -> Result<Geofence, RepositoryError> {
            self.0.update(geofence).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_registrations_respect_quota() {
        let repo = Arc::new(YieldingRepository(InMemoryRepository::new()));
        let registry = GeofenceRegistry::new(repo.clone());
        for i in 0..DEFAULT_MAX_GEOFENCES_PER_USER - 1 {
            registry.register(&user(), draft(&format!("Fence {i}"))).await.unwrap();
        }

        let u = user();
        let (a, b) = tokio::join!(
            registry.register(&u, draft("Last A")),
            registry.register(&u, draft("Last B")),
        );
        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        assert!([a, b].into_iter().any(|r| matches!(r, Err(ValidationError::QuotaExceeded { .. }))));
        assert_eq!(repo.count_user_geofences(&u).await.unwrap(), DEFAULT_MAX_GEOFENCES_PER_USER);
    }

    #[tokio::test]
    async fn test_concurrent_registrations_reject_duplicate_name() {
        let repo = Arc::new(YieldingRepository(InMemoryRepository::new()));
        let registry = GeofenceRegistry::new(repo.clone());

        let u = user();
        let (a, b) = tokio::join!(registry.register(&u, draft("Home")), registry.register(&u, draft("HOME")));
        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        assert!([a, b].into_iter().any(|r| matches!(r, Err(ValidationError::DuplicateName(_)))));
        assert_eq!(repo.count_user_geofences(&u).await.unwrap(), 1);
    }

    #[test]
    fn test_draft_from_json() {
        let json = r#"{"name":"Park","center":{"lat":24.8,"lng":120.9},"radius":300,
            "type":"danger_zone","emergencyEnabled":true,"priority":1}"#;
        let draft: GeofenceDraft = serde_json::from_str(json).unwrap();
        assert_eq!(draft.geofence_type, Some(GeofenceType::DangerZone));
        assert_eq!(draft.emergency_enabled, Some(true));
        assert_eq!(draft.radius, Some(300.0));
        assert!(draft.dwell_alert_intervals.is_none());
    }
}
