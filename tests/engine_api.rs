//! End-to-end tests through the public engine API
//!
//! Geofences are registered through the registry, then a user walks
//! in and out while the test drives a virtual clock.

use geofence_engine::domain::events::Topic;
use geofence_engine::domain::types::{
    GeofenceType, LatLng, LocationSample, NotificationKind, PresenceStatus, UserId,
};
use geofence_engine::domain::{EngineError, ValidationError};
use geofence_engine::infra::clock::ManualClock;
use geofence_engine::io::{InMemoryRepository, RecordingEventBus, RecordingNotifier};
use geofence_engine::services::geo;
use geofence_engine::services::{GeofenceDraft, GeofenceEngine, GeofenceRegistry, ManualScheduler};
use std::sync::Arc;

const PARK: LatLng = LatLng { lat: 25.0330, lng: 121.5654 };

struct World {
    engine: GeofenceEngine,
    registry: GeofenceRegistry,
    repo: Arc<InMemoryRepository>,
    clock: ManualClock,
    scheduler: ManualScheduler,
    notifier: Arc<RecordingNotifier>,
    bus: Arc<RecordingEventBus>,
}

fn world() -> World {
    let clock = ManualClock::at_epoch();
    let scheduler = ManualScheduler::new(clock.clone());
    let repo = Arc::new(InMemoryRepository::with_clock(Arc::new(clock.clone())));
    let notifier = Arc::new(RecordingNotifier::new());
    let bus = Arc::new(RecordingEventBus::new());
    let engine = GeofenceEngine::builder(repo.clone())
        .clock(Arc::new(clock.clone()))
        .scheduler(Arc::new(scheduler.clone()))
        .notifier(notifier.clone())
        .event_bus(bus.clone())
        .build();
    let registry = GeofenceRegistry::new(repo.clone());
    World { engine, registry, repo, clock, scheduler, notifier, bus }
}

fn at(north_m: f64) -> LocationSample {
    let p = geo::offset_m(PARK, north_m, 0.0);
    LocationSample::new(p.lat, p.lng, 5.0)
}

fn park_draft() -> GeofenceDraft {
    GeofenceDraft {
        name: Some("Park".into()),
        center: Some(PARK),
        radius: Some(150.0),
        geofence_type: Some(GeofenceType::SafeZone),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_registered_geofence_round_trip() {
    let w = world();
    let grandma = UserId::new("grandma");
    let park = w.registry.register(&grandma, park_draft()).await.unwrap();

    // Enter
    let result = w.engine.check_status(&grandma, &at(20.0)).await.unwrap();
    assert_eq!(result.entries.len(), 1);
    assert_eq!(result.entries[0].geofence_id, park.id);
    assert!(result.entries[0].delivery.notification_sent);

    let entry_event = w.bus.last(Topic::Entry).unwrap();
    assert_eq!(entry_event["userId"], "grandma");
    assert_eq!(entry_event["geofenceName"], "Park");

    // Leave; the exit waits for its timer
    w.clock.advance_secs(60);
    let result = w.engine.check_status(&grandma, &at(400.0)).await.unwrap();
    assert_eq!(result.pending_exits.len(), 1);
    assert!(result.confirmed_exits.is_empty());
    assert!(w.engine.is_exit_pending(&grandma, &park.id));

    w.clock.advance_secs(31);
    assert_eq!(w.scheduler.run_due().await, 1);
    assert!(!w.engine.is_exit_pending(&grandma, &park.id));

    let status = w.repo.status(&grandma, &park.id).unwrap();
    assert_eq!(status.status, PresenceStatus::Outside);
    assert_eq!(w.notifier.geofence_alerts(NotificationKind::Exit).len(), 1);
    assert_eq!(w.bus.count(Topic::Exit), 1);
}

#[tokio::test]
async fn test_result_serializes_camel_case() {
    let w = world();
    let user = UserId::new("grandpa");
    w.registry.register(&user, park_draft()).await.unwrap();

    let result = w.engine.check_status(&user, &at(0.0)).await.unwrap();
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["userId"], "grandpa");
    assert!(json["entries"][0]["notificationSent"].as_bool().unwrap());
    assert!(json["confirmedExits"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_inaccurate_sample_rejected_before_any_state_change() {
    let w = world();
    let user = UserId::new("u");
    let park = w.registry.register(&user, park_draft()).await.unwrap();

    let mut sample = at(0.0);
    sample.accuracy = 80.0;
    let err = w.engine.check_status(&user, &sample).await.unwrap_err();
    assert!(matches!(err, EngineError::LocationAccuracy { .. }));
    assert!(w.repo.status(&user, &park.id).is_none());
    assert_eq!(w.notifier.total(), 0);
    assert_eq!(w.engine.metrics().samples_rejected(), 1);
}

#[tokio::test]
async fn test_inactive_geofence_is_ignored() {
    let w = world();
    let user = UserId::new("u");
    let draft = GeofenceDraft { active: Some(false), ..park_draft() };
    w.registry.register(&user, draft).await.unwrap();

    let result = w.engine.check_status(&user, &at(0.0)).await.unwrap();
    assert!(result.entries.is_empty());
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn test_registry_quota_and_duplicates() {
    let w = world();
    let user = UserId::new("u");
    w.registry.register(&user, park_draft()).await.unwrap();

    let dup = GeofenceDraft { name: Some("park".into()), ..park_draft() };
    assert!(matches!(
        w.registry.register(&user, dup).await,
        Err(ValidationError::DuplicateName(_))
    ));

    for i in 1..w.registry.max_per_user() {
        let draft = GeofenceDraft { name: Some(format!("Spot {i}")), ..park_draft() };
        w.registry.register(&user, draft).await.unwrap();
    }
    let one_more = GeofenceDraft { name: Some("Overflow".into()), ..park_draft() };
    assert!(matches!(
        w.registry.register(&user, one_more).await,
        Err(ValidationError::QuotaExceeded { .. })
    ));
}

#[tokio::test]
async fn test_clones_share_pending_exits() {
    let w = world();
    let user = UserId::new("u");
    let park = w.registry.register(&user, park_draft()).await.unwrap();
    let other = w.engine.clone();

    w.engine.check_status(&user, &at(0.0)).await.unwrap();
    other.check_status(&user, &at(500.0)).await.unwrap();
    assert!(w.engine.is_exit_pending(&user, &park.id));
    assert_eq!(w.engine.pending_exit_count(), 1);

    // Returning through the other handle cancels the same pending exit
    let result = w.engine.check_status(&user, &at(10.0)).await.unwrap();
    assert_eq!(result.cancelled_exits.len(), 1);
    assert_eq!(other.pending_exit_count(), 0);
}
