//! Geofence and status persistence
//!
//! `GeofenceRepository` is the engine's only path to stored state.
//! `InMemoryRepository` keeps everything in key-partitioned maps and can be
//! seeded from a JSON file of geofence definitions.

use crate::domain::error::RepositoryError;
use crate::domain::events::new_uuid_v7;
use crate::domain::types::{
    CooldownRecord, Geofence, GeofenceId, NewGeofence, NotificationKind, PairKey, StatusPatch,
    UserGeofenceStatus, UserId,
};
use crate::infra::clock::{Clock, SystemClock};
use crate::infra::sharded::ShardedMap;
use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait GeofenceRepository: Send + Sync {
    async fn find_active_by_user(&self, user_id: &UserId) -> Result<Vec<Geofence>, RepositoryError>;

    async fn find_by_id(&self, id: &GeofenceId) -> Result<Option<Geofence>, RepositoryError>;

    async fn get_user_geofence_status(
        &self,
        user_id: &UserId,
        geofence_id: &GeofenceId,
    ) -> Result<Option<UserGeofenceStatus>, RepositoryError>;

    async fn update_geofence_status(
        &self,
        user_id: &UserId,
        geofence_id: &GeofenceId,
        patch: &StatusPatch,
    ) -> Result<(), RepositoryError>;

    async fn get_last_notification(
        &self,
        user_id: &UserId,
        geofence_id: &GeofenceId,
        kind: NotificationKind,
    ) -> Result<Option<CooldownRecord>, RepositoryError>;

    async fn record_notification(&self, record: &CooldownRecord) -> Result<(), RepositoryError>;

    /// Number of active geofences owned by the user
    async fn count_user_geofences(&self, user_id: &UserId) -> Result<usize, RepositoryError>;

    async fn find_by_user_and_name(
        &self,
        user_id: &UserId,
        name: &str,
    ) -> Result<Option<Geofence>, RepositoryError>;

    async fn create(&self, geofence: NewGeofence) -> Result<Geofence, RepositoryError>;

    async fn update(&self, geofence: Geofence) -> Result<Geofence, RepositoryError>;
}

/// Read a JSON array of geofences
pub fn load_geofences_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Geofence>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read geofences file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse geofences file {}", path.display()))
}

pub struct InMemoryRepository {
    /// Geofences grouped by owner
    geofences: ShardedMap<UserId, Vec<Geofence>>,
    owners: ShardedMap<GeofenceId, UserId>,
    statuses: ShardedMap<PairKey, UserGeofenceStatus>,
    notifications: ShardedMap<(PairKey, NotificationKind), CooldownRecord>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            geofences: ShardedMap::new(),
            owners: ShardedMap::new(),
            statuses: ShardedMap::new(),
            notifications: ShardedMap::new(),
            clock,
        }
    }

    /// Insert or replace geofences as-is (no validation)
    pub fn seed(&self, geofences: impl IntoIterator<Item = Geofence>) -> usize {
        let mut count = 0;
        for geofence in geofences {
            self.put(geofence);
            count += 1;
        }
        count
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let repo = Self::new();
        let count = repo.seed(load_geofences_file(&path)?);
        info!(path = %path.as_ref().display(), geofences = %count, "repository_seeded");
        Ok(repo)
    }

    /// Current status snapshot
    pub fn status(&self, user_id: &UserId, geofence_id: &GeofenceId) -> Option<UserGeofenceStatus> {
        self.statuses.get(&PairKey::new(user_id, geofence_id))
    }

    pub fn geofence_count(&self) -> usize {
        self.owners.len()
    }

    fn put(&self, geofence: Geofence) {
        if let Some(previous_owner) = self.owners.insert(geofence.id.clone(), geofence.user_id.clone()) {
            if previous_owner != geofence.user_id {
                self.geofences.update(&previous_owner, |list| list.retain(|g| g.id != geofence.id));
            }
        }
        self.geofences.upsert(geofence.user_id.clone(), |list| {
            match list.iter_mut().find(|g| g.id == geofence.id) {
                Some(existing) => *existing = geofence,
                None => list.push(geofence),
            }
        });
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GeofenceRepository for InMemoryRepository {
    async fn find_active_by_user(&self, user_id: &UserId) -> Result<Vec<Geofence>, RepositoryError> {
        Ok(self.geofences.with(user_id, |list| {
            list.map(|l| l.iter().filter(|g| g.active).cloned().collect()).unwrap_or_default()
        }))
    }

    async fn find_by_id(&self, id: &GeofenceId) -> Result<Option<Geofence>, RepositoryError> {
        let Some(owner) = self.owners.get(id) else {
            return Ok(None);
        };
        Ok(self.geofences.with(&owner, |list| {
            list.and_then(|l| l.iter().find(|g| &g.id == id).cloned())
        }))
    }

    async fn get_user_geofence_status(
        &self,
        user_id: &UserId,
        geofence_id: &GeofenceId,
    ) -> Result<Option<UserGeofenceStatus>, RepositoryError> {
        Ok(self.status(user_id, geofence_id))
    }

    async fn update_geofence_status(
        &self,
        user_id: &UserId,
        geofence_id: &GeofenceId,
        patch: &StatusPatch,
    ) -> Result<(), RepositoryError> {
        let key = PairKey::new(user_id, geofence_id);
        if self.statuses.update(&key, |status| status.apply(patch)).is_none() {
            let mut status = UserGeofenceStatus::outside();
            status.apply(patch);
            self.statuses.insert(key, status);
        }
        Ok(())
    }

    async fn get_last_notification(
        &self,
        user_id: &UserId,
        geofence_id: &GeofenceId,
        kind: NotificationKind,
    ) -> Result<Option<CooldownRecord>, RepositoryError> {
        Ok(self.notifications.get(&(PairKey::new(user_id, geofence_id), kind)))
    }

    async fn record_notification(&self, record: &CooldownRecord) -> Result<(), RepositoryError> {
        let key = (PairKey::new(&record.user_id, &record.geofence_id), record.kind);
        self.notifications.insert(key, record.clone());
        Ok(())
    }

    async fn count_user_geofences(&self, user_id: &UserId) -> Result<usize, RepositoryError> {
        Ok(self
            .geofences
            .with(user_id, |list| list.map_or(0, |l| l.iter().filter(|g| g.active).count())))
    }

    async fn find_by_user_and_name(
        &self,
        user_id: &UserId,
        name: &str,
    ) -> Result<Option<Geofence>, RepositoryError> {
        Ok(self.geofences.with(user_id, |list| {
            list.and_then(|l| l.iter().find(|g| g.name.eq_ignore_ascii_case(name)).cloned())
        }))
    }

    async fn create(&self, new: NewGeofence) -> Result<Geofence, RepositoryError> {
        let geofence = Geofence {
            id: GeofenceId::new(new_uuid_v7()),
            user_id: new.user_id,
            name: new.name,
            center: new.center,
            radius: new.radius,
            geofence_type: new.geofence_type,
            emergency_enabled: new.emergency_enabled,
            dwell_tracking_enabled: new.dwell_tracking_enabled,
            dwell_alert_intervals: new.dwell_alert_intervals,
            priority: new.priority,
            active: new.active,
            created_at: self.clock.now(),
        };
        self.put(geofence.clone());
        Ok(geofence)
    }

    async fn update(&self, geofence: Geofence) -> Result<Geofence, RepositoryError> {
        if !self.owners.contains_key(&geofence.id) {
            return Err(RepositoryError::NotFound(geofence.id.to_string()));
        }
        self.put(geofence.clone());
        Ok(geofence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{GeofenceType, LatLng, PresenceStatus};
    use chrono::Utc;
    use std::io::Write;

    fn fence(id: &str, user: &str, active: bool) -> Geofence {
        Geofence {
            id: GeofenceId::new(id),
            user_id: UserId::new(user),
            name: format!("Fence {id}"),
            center: LatLng::new(24.8138, 120.9675),
            radius: 100.0,
            geofence_type: GeofenceType::SafeZone,
            emergency_enabled: false,
            dwell_tracking_enabled: true,
            dwell_alert_intervals: vec![5, 15, 30, 60],
            priority: 5,
            active,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_find_active_filters_inactive() {
        let repo = InMemoryRepository::new();
        repo.seed([fence("g-1", "u-1", true), fence("g-2", "u-1", false), fence("g-3", "u-2", true)]);

        let active = repo.find_active_by_user(&UserId::new("u-1")).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, GeofenceId::new("g-1"));
        assert_eq!(repo.count_user_geofences(&UserId::new("u-1")).await.unwrap(), 1);
        assert!(repo.find_active_by_user(&UserId::new("nobody")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_patch_creates_and_updates() {
        let repo = InMemoryRepository::new();
        let (u, g) = (UserId::new("u-1"), GeofenceId::new("g-1"));
        assert!(repo.get_user_geofence_status(&u, &g).await.unwrap().is_none());

        let now = Utc::now();
        repo.update_geofence_status(&u, &g, &StatusPatch::entered(now, Some(now))).await.unwrap();
        let status = repo.get_user_geofence_status(&u, &g).await.unwrap().unwrap();
        assert_eq!(status.status, PresenceStatus::Inside);
        assert_eq!(status.dwell_start_time, Some(now));

        repo.update_geofence_status(&u, &g, &StatusPatch::dwell_alerted(now)).await.unwrap();
        let status = repo.status(&u, &g).unwrap();
        assert_eq!(status.last_dwell_alert, Some(now));
        assert_eq!(status.status, PresenceStatus::Inside);
    }

    #[tokio::test]
    async fn test_notification_records_overwrite() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let mut record = CooldownRecord {
            user_id: UserId::new("u-1"),
            geofence_id: GeofenceId::new("g-1"),
            kind: NotificationKind::Entry,
            sent_at: now,
        };
        repo.record_notification(&record).await.unwrap();
        record.sent_at = now + chrono::Duration::minutes(6);
        repo.record_notification(&record).await.unwrap();

        let stored = repo
            .get_last_notification(&record.user_id, &record.geofence_id, NotificationKind::Entry)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.sent_at, record.sent_at);
        assert!(repo
            .get_last_notification(&record.user_id, &record.geofence_id, NotificationKind::Exit)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_update_and_lookup_by_name() {
        let repo = InMemoryRepository::new();
        let created = repo
            .create(NewGeofence {
                user_id: UserId::new("u-1"),
                name: "School".into(),
                center: LatLng::new(24.8, 120.9),
                radius: 200.0,
                geofence_type: GeofenceType::NotificationZone,
                emergency_enabled: false,
                dwell_tracking_enabled: false,
                dwell_alert_intervals: vec![5, 15],
                priority: 2,
                active: true,
            })
            .await
            .unwrap();

        let found = repo.find_by_user_and_name(&UserId::new("u-1"), "school").await.unwrap();
        assert_eq!(found.map(|g| g.id), Some(created.id.clone()));

        let mut changed = created.clone();
        changed.radius = 300.0;
        repo.update(changed).await.unwrap();
        assert_eq!(repo.find_by_id(&created.id).await.unwrap().unwrap().radius, 300.0);

        let missing = fence("ghost", "u-1", true);
        assert!(matches!(repo.update(missing).await, Err(RepositoryError::NotFound(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let json = serde_json::to_string(&vec![fence("g-1", "u-1", true), fence("g-2", "u-2", true)]).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();

        let repo = InMemoryRepository::from_file(file.path()).unwrap();
        assert_eq!(repo.geofence_count(), 2);
        assert!(InMemoryRepository::from_file("/nonexistent/geofences.json").is_err());
    }
}
