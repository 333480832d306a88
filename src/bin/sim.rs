//! Geofence walk simulator
//!
//! Replays a scripted walk around one geofence: approach, enter, linger,
//! step out briefly and come back, then leave for good.
//!
//! Two modes:
//! - default: publishes location reports to the engine's MQTT topic and
//!   prints whatever the engine emits on the event bus
//! - `--offline`: runs the engine in-process on a virtual clock, so the
//!   whole walk (including dwell alerts) finishes instantly
//!
//! Usage:
//!   cargo run --bin geofence-sim -- --user elder-1 --radius 100
//!   cargo run --bin geofence-sim -- --offline --linger-secs 420

use chrono::Duration as ChronoDuration;
use clap::Parser;
use geofence_engine::domain::types::{
    Geofence, GeofenceId, GeofenceType, LatLng, LocationSample, NotificationKind, UserId,
    DEFAULT_DWELL_ALERT_INTERVALS, DEFAULT_PRIORITY,
};
use geofence_engine::domain::{EvaluationResult, Topic};
use geofence_engine::infra::clock::{Clock, ManualClock};
use geofence_engine::io::{InMemoryRepository, RecordingEventBus, RecordingNotifier};
use geofence_engine::services::geo;
use geofence_engine::services::{EngineSettings, GeofenceEngine, ManualScheduler};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "geofence-sim", about = "Scripted walk around a geofence")]
struct Args {
    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    port: u16,

    /// Location topic prefix; reports go to `<topic>/<user>`
    #[arg(long, default_value = "locations")]
    topic: String,

    /// Event bus prefix to listen on (empty to skip)
    #[arg(long, default_value = "safety")]
    events: String,

    #[arg(long, default_value = "sim-user")]
    user: String,

    /// Geofence center latitude
    #[arg(long, default_value = "24.8138")]
    lat: f64,

    /// Geofence center longitude
    #[arg(long, default_value = "120.9675")]
    lng: f64,

    /// Geofence radius in meters
    #[arg(long, default_value = "100")]
    radius: f64,

    /// Reported accuracy in meters
    #[arg(long, default_value = "5")]
    accuracy: f64,

    /// Seconds between reports while holding a position
    #[arg(long, default_value = "10")]
    interval_secs: u64,

    /// Time spent inside before the brief step out
    #[arg(long, default_value = "60")]
    linger_secs: u64,

    /// Divide real-time waits by this factor (MQTT mode only)
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Run the engine in-process on a virtual clock
    #[arg(long)]
    offline: bool,
}

/// One leg of the walk: move to `north_m` from the center and stay
#[derive(Debug, Clone, Copy)]
struct Step {
    label: &'static str,
    north_m: f64,
    hold_secs: u64,
}

fn script(radius: f64, linger_secs: u64) -> Vec<Step> {
    vec![
        Step { label: "approach", north_m: radius * 2.0, hold_secs: 10 },
        Step { label: "enter", north_m: 0.0, hold_secs: linger_secs },
        Step { label: "step out", north_m: radius + 20.0, hold_secs: 10 },
        Step { label: "return", north_m: radius * 0.5, hold_secs: 20 },
        Step { label: "leave", north_m: radius * 3.0, hold_secs: 40 },
    ]
}

/// Sample times within a step, in seconds from its start
fn report_offsets(hold_secs: u64, interval_secs: u64) -> Vec<u64> {
    let interval = interval_secs.max(1);
    let mut offsets: Vec<u64> = (0..=hold_secs).step_by(interval as usize).collect();
    if offsets.last() != Some(&hold_secs) {
        offsets.push(hold_secs);
    }
    offsets
}

fn sim_geofence(args: &Args, center: LatLng) -> Geofence {
    Geofence {
        id: GeofenceId::new("sim-home"),
        user_id: UserId::new(&args.user),
        name: "Home".to_string(),
        center,
        radius: args.radius,
        geofence_type: GeofenceType::SafeZone,
        emergency_enabled: false,
        dwell_tracking_enabled: true,
        dwell_alert_intervals: DEFAULT_DWELL_ALERT_INTERVALS.to_vec(),
        priority: DEFAULT_PRIORITY,
        active: true,
        created_at: chrono::Utc::now(),
    }
}

fn print_result(at_secs: u64, result: &EvaluationResult) {
    for e in &result.entries {
        let status = if e.delivery.notification_sent { "notified" } else { "suppressed" };
        println!("  [{at_secs:>5}s] ENTRY    {} ({status})", e.geofence_name);
    }
    for p in &result.pending_exits {
        if !p.already_pending {
            println!("  [{at_secs:>5}s] PENDING  {} confirms in {}ms", p.geofence_name, p.remaining_ms);
        }
    }
    for c in &result.cancelled_exits {
        println!("  [{at_secs:>5}s] RETURN   {} exit cancelled", c.geofence_name);
    }
    for x in &result.confirmed_exits {
        println!("  [{at_secs:>5}s] EXIT     {} at {}", x.geofence_name, x.exited_at.format("%H:%M:%S"));
    }
    for d in &result.dwell_alerts {
        println!("  [{at_secs:>5}s] DWELL    {} {} min", d.geofence_name, d.interval_minutes);
    }
    for err in &result.errors {
        println!("  [{at_secs:>5}s] ERROR    {err:?}");
    }
}

async fn run_offline(args: &Args, center: LatLng) {
    let clock = ManualClock::at_epoch();
    let scheduler = ManualScheduler::new(clock.clone());
    let repository = Arc::new(InMemoryRepository::with_clock(Arc::new(clock.clone())));
    repository.seed([sim_geofence(args, center)]);
    let notifier = Arc::new(RecordingNotifier::new());
    let bus = Arc::new(RecordingEventBus::new());

    let engine = GeofenceEngine::builder(repository)
        .clock(Arc::new(clock.clone()))
        .scheduler(Arc::new(scheduler.clone()))
        .notifier(notifier.clone())
        .event_bus(bus.clone())
        .settings(EngineSettings::default())
        .build();

    let user = UserId::new(&args.user);
    let start = clock.now();
    println!("Offline walk for {} around ({:.5}, {:.5}) r={}m", args.user, center.lat, center.lng, args.radius);

    for step in script(args.radius, args.linger_secs) {
        println!("-- {} ({:.0} m north, {}s)", step.label, step.north_m, step.hold_secs);
        let position = geo::offset_m(center, step.north_m, 0.0);
        let mut elapsed = 0;
        for offset in report_offsets(step.hold_secs, args.interval_secs) {
            clock.advance(ChronoDuration::seconds((offset - elapsed) as i64));
            elapsed = offset;
            scheduler.run_due().await;

            let sample = LocationSample::new(position.lat, position.lng, args.accuracy)
                .with_timestamp(clock.now());
            let at = (clock.now() - start).num_seconds().max(0) as u64;
            match engine.check_status(&user, &sample).await {
                Ok(result) => print_result(at, &result),
                Err(e) => println!("  [{at:>5}s] REJECTED {e}"),
            }
        }
    }

    println!();
    println!("Notifications sent:");
    println!("  entry:     {}", notifier.geofence_alerts(NotificationKind::Entry).len());
    println!("  exit:      {}", notifier.geofence_alerts(NotificationKind::Exit).len());
    println!("  dwell:     {}", notifier.dwell_alerts().len());
    println!("Bus events:  {} ({} entry, {} exit)", bus.events().len(), bus.count(Topic::Entry), bus.count(Topic::Exit));
}

async fn run_mqtt(args: &Args, center: LatLng) -> Result<(), rumqttc::ClientError> {
    let client_id = format!("geofence-sim-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, &args.host, args.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 100);

    if !args.events.is_empty() {
        client.subscribe(format!("{}/#", args.events.trim_end_matches('/')), QoS::AtMostOnce).await?;
    }

    // Print engine events as they arrive
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let body = String::from_utf8_lossy(&publish.payload);
                    println!("  <- {} {}", publish.topic, body);
                }
                Ok(_) => {}
                Err(e) => {
                    println!("  !! mqtt error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let topic = format!("{}/{}", args.topic.trim_end_matches('/'), args.user);
    let speed = if args.speed > 0.0 { args.speed } else { 1.0 };
    println!("Publishing walk for {} to {topic} via {}:{}", args.user, args.host, args.port);

    for step in script(args.radius, args.linger_secs) {
        println!("-- {} ({:.0} m north, {}s)", step.label, step.north_m, step.hold_secs);
        let position = geo::offset_m(center, step.north_m, 0.0);
        let mut elapsed = 0;
        for offset in report_offsets(step.hold_secs, args.interval_secs) {
            let wait = Duration::from_secs_f64((offset - elapsed) as f64 / speed);
            tokio::time::sleep(wait).await;
            elapsed = offset;

            let payload = json!({
                "userId": args.user,
                "lat": position.lat,
                "lng": position.lng,
                "accuracy": args.accuracy,
                "timestamp": chrono::Utc::now(),
            });
            client.publish(&topic, QoS::AtMostOnce, false, payload.to_string()).await?;
            println!("  -> ({:.6}, {:.6})", position.lat, position.lng);
        }
    }

    // Let the last bus events arrive
    tokio::time::sleep(Duration::from_secs(2)).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let center = LatLng::new(args.lat, args.lng);
    if !center.is_valid() || args.radius <= 0.0 {
        eprintln!("invalid geofence: center ({}, {}) radius {}", args.lat, args.lng, args.radius);
        std::process::exit(2);
    }

    if args.offline {
        run_offline(&args, center).await;
    } else if let Err(e) = run_mqtt(&args, center).await {
        eprintln!("mqtt error: {e}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_offsets_cover_hold() {
        assert_eq!(report_offsets(25, 10), vec![0, 10, 20, 25]);
        assert_eq!(report_offsets(20, 10), vec![0, 10, 20]);
        assert_eq!(report_offsets(0, 10), vec![0]);
    }

    #[test]
    fn test_script_leaves_and_returns() {
        let steps = script(100.0, 60);
        assert!(steps[0].north_m > 100.0);
        assert!(steps[1].north_m <= 100.0);
        assert!(steps[2].north_m > 100.0 && steps[2].hold_secs < 30);
        assert!(steps[4].north_m > 100.0 && steps[4].hold_secs > 30);
    }
}
