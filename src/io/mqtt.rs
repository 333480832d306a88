//! MQTT client for receiving location reports
//!
//! Payloads are JSON, either one report or an array of reports:
//! `{"userId": "...", "lat": .., "lng": .., "accuracy": .., "timestamp": ".."}`.
//! The timestamp may be RFC 3339 or epoch milliseconds.
//! When `userId` is absent the last topic segment is used
//! (`locations/<userId>`).

use crate::domain::types::{LocationReport, LocationSample, UserId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use chrono::{DateTime, Utc};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReport {
    #[serde(default)]
    user_id: Option<String>,
    lat: f64,
    lng: f64,
    accuracy: f64,
    #[serde(default)]
    timestamp: Option<TimestampValue>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TimestampValue {
    EpochMs(i64),
    IsoString(String),
}

/// Parse "2026-01-05T16:41:30.048+00:00" (RFC 3339)
fn parse_iso_time(time_str: &str) -> Option<DateTime<Utc>> {
    let dt = OffsetDateTime::parse(time_str, &Rfc3339).ok()?;
    DateTime::from_timestamp_millis((dt.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Unparseable timestamps fall back to the engine clock
fn timestamp_to_utc(ts: &TimestampValue) -> Option<DateTime<Utc>> {
    match ts {
        TimestampValue::EpochMs(ms) => DateTime::from_timestamp_millis(*ms),
        TimestampValue::IsoString(s) => parse_iso_time(s),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPayload {
    One(RawReport),
    Many(Vec<RawReport>),
}

/// User id carried by the topic, if the topic has more than one level
fn user_from_topic(topic: &str) -> Option<&str> {
    let (_, last) = topic.rsplit_once('/')?;
    (!last.is_empty() && last != "#" && last != "+").then_some(last)
}

/// Parse one MQTT message into location reports
///
/// Reports without a resolvable user id are skipped.
pub fn parse_location_message(topic: &str, json_str: &str) -> Vec<LocationReport> {
    let payload: RawPayload = match serde_json::from_str(json_str) {
        Ok(p) => p,
        Err(e) => {
            debug!(topic = %topic, error = %e, "location_parse_failed");
            return Vec::new();
        }
    };
    let raws = match payload {
        RawPayload::One(r) => vec![r],
        RawPayload::Many(v) => v,
    };

    let topic_user = user_from_topic(topic);
    raws.into_iter()
        .filter_map(|raw| {
            let user = raw.user_id.as_deref().filter(|u| !u.is_empty()).or(topic_user)?;
            let mut sample = LocationSample::new(raw.lat, raw.lng, raw.accuracy);
            sample.timestamp = raw.timestamp.as_ref().and_then(timestamp_to_utc);
            Some(LocationReport::new(UserId::new(user), sample))
        })
        .collect()
}

pub async fn start_mqtt_client(
    config: &Config,
    report_tx: mpsc::Sender<LocationReport>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), rumqttc::ClientError> {
    let client_id = format!("geofence-ingest-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        mqttoptions.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);
    client.subscribe(config.mqtt_topic(), QoS::AtMostOnce).await?;

    info!(topic = %config.mqtt_topic(), host = %config.mqtt_host(), port = %config.mqtt_port(), "mqtt_subscribed");

    // Rate limit drop warnings to once per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("mqtt_shutdown");
                    return Ok(());
                }
            }
            result = eventloop.poll() => {
                match result {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Ok(json_str) = std::str::from_utf8(&publish.payload) else {
                            warn!(topic = %publish.topic, "mqtt_invalid_utf8");
                            continue;
                        };

                        for report in parse_location_message(&publish.topic, json_str) {
                            match report_tx.try_send(report) {
                                Ok(()) => {}
                                Err(TrySendError::Full(_)) => {
                                    metrics.record_ingest_dropped();
                                    if last_drop_warn.elapsed() > Duration::from_secs(1) {
                                        warn!(dropped_total = %metrics.ingest_dropped(), "location_dropped_channel_full");
                                        last_drop_warn = Instant::now();
                                    }
                                }
                                Err(TrySendError::Closed(_)) => {
                                    warn!("location_channel_closed");
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "mqtt_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_report() {
        let json = r#"{"userId":"u-1","lat":24.8138,"lng":120.9675,"accuracy":5.0,
            "timestamp":"2026-01-05T10:00:00Z"}"#;
        let reports = parse_location_message("locations/u-1", json);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].user_id, UserId::new("u-1"));
        assert_eq!(reports[0].sample.accuracy, 5.0);
        assert!(reports[0].sample.timestamp.is_some());
    }

    #[test]
    fn test_parse_array_payload() {
        let json = r#"[{"userId":"a","lat":1.0,"lng":2.0,"accuracy":3.0},
            {"userId":"b","lat":1.5,"lng":2.5,"accuracy":4.0}]"#;
        let reports = parse_location_message("locations", json);
        let users: Vec<_> = reports.iter().map(|r| r.user_id.as_str().to_string()).collect();
        assert_eq!(users, vec!["a", "b"]);
    }

    #[test]
    fn test_user_taken_from_topic() {
        let json = r#"{"lat":24.8,"lng":120.9,"accuracy":8.0}"#;
        let reports = parse_location_message("locations/elder-42", json);
        assert_eq!(reports[0].user_id, UserId::new("elder-42"));
        assert!(reports[0].sample.timestamp.is_none());
    }

    #[test]
    fn test_report_without_user_is_skipped() {
        let json = r#"{"lat":24.8,"lng":120.9,"accuracy":8.0}"#;
        assert!(parse_location_message("locations", json).is_empty());
        assert!(parse_location_message("locations/#", json).is_empty());
    }

    #[test]
    fn test_timestamp_formats() {
        let iso = r#"{"userId":"u","lat":1.0,"lng":2.0,"accuracy":3.0,"timestamp":"2026-01-05T16:41:30.048+08:00"}"#;
        let ts = parse_location_message("locations", iso)[0].sample.timestamp.unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-05T08:41:30.048+00:00");

        let epoch = r#"{"userId":"u","lat":1.0,"lng":2.0,"accuracy":3.0,"timestamp":1767602490048}"#;
        let ts = parse_location_message("locations", epoch)[0].sample.timestamp.unwrap();
        assert_eq!(ts.timestamp_millis(), 1_767_602_490_048);

        let junk = r#"{"userId":"u","lat":1.0,"lng":2.0,"accuracy":3.0,"timestamp":"yesterday"}"#;
        assert!(parse_location_message("locations", junk)[0].sample.timestamp.is_none());
    }

    #[test]
    fn test_invalid_json() {
        assert!(parse_location_message("locations/u", "not json").is_empty());
        assert!(parse_location_message("locations/u", r#"{"lat":"north"}"#).is_empty());
    }
}
