//! Translation between the server shape and the editor shape of payloads.
//!
//! The server stores datetimes as UTC strings in the `+0000` offset form
//! and decorates documents with bookkeeping keys (`_links`, `_created`, …).
//! Editors work on RFC 3339 datetimes and never see the bookkeeping keys.
//! Every payload that crosses the wire goes through [`to_server_shape`] on
//! the way out and [`to_editor_shape`] on the way in.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::error::CoreError;
use crate::item::ItemType;
use crate::types::{Payload, Timestamp};

/// Datetime layout used by the server.
pub const SERVER_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S+0000";

/// Keys the server manages itself; they never travel inside a payload.
pub const SERVER_MANAGED_KEYS: &[&str] = &["_links", "_created", "_updated", "_status", "_etag"];

/// Marker segment meaning "every element of this array".
const EACH: &str = "[]";

const EVENT_DATE_PATHS: &[&[&str]] = &[&["dates", "start"], &["dates", "end"]];

const PLANNING_DATE_PATHS: &[&[&str]] = &[
    &["planning_date"],
    &["coverages", EACH, "planning", "scheduled"],
];

const ASSIGNMENT_DATE_PATHS: &[&[&str]] = &[&["planning", "scheduled"]];

/// Payload paths holding datetimes for an item type.
pub fn date_paths(item_type: ItemType) -> &'static [&'static [&'static str]] {
    match item_type {
        ItemType::Event => EVENT_DATE_PATHS,
        ItemType::Planning => PLANNING_DATE_PATHS,
        ItemType::Assignment => ASSIGNMENT_DATE_PATHS,
    }
}

// ---------------------------------------------------------------------------
// Datetime helpers
// ---------------------------------------------------------------------------

/// Parse a datetime in either the server form or RFC 3339.
pub fn parse_datetime(raw: &str) -> Result<Timestamp, CoreError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::Validation(format!("Invalid datetime '{raw}': {e}")))
}

pub fn format_server_datetime(ts: &Timestamp) -> String {
    ts.format(SERVER_DATETIME_FORMAT).to_string()
}

pub fn format_editor_datetime(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Serde adapter for optional timestamps in either accepted form.
///
/// Serializes in the server form.
pub mod opt_datetime {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_server_datetime, parse_datetime};
    use crate::types::Timestamp;

    pub fn serialize<S: Serializer>(value: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&format_server_datetime(ts)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Timestamp>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| parse_datetime(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Shape translation
// ---------------------------------------------------------------------------

/// Editor shape -> server shape.
pub fn to_server_shape(item_type: ItemType, payload: &Payload) -> Result<Payload, CoreError> {
    translate(item_type, payload, format_server_datetime)
}

/// Server shape -> editor shape.
pub fn to_editor_shape(item_type: ItemType, payload: &Payload) -> Result<Payload, CoreError> {
    translate(item_type, payload, format_editor_datetime)
}

fn translate(
    item_type: ItemType,
    payload: &Payload,
    format: fn(&Timestamp) -> String,
) -> Result<Payload, CoreError> {
    let mut out: Payload = payload
        .iter()
        .filter(|(key, _)| !SERVER_MANAGED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for path in date_paths(item_type) {
        let (head, rest) = match path.split_first() {
            Some(split) => split,
            None => continue,
        };
        if let Some(value) = out.get_mut(*head) {
            rewrite_at(value, rest, format)?;
        }
    }
    Ok(out)
}

/// Walk `path` inside `value` and rewrite the datetime strings found there.
/// Missing segments and `null` leaves are left untouched.
fn rewrite_at(
    value: &mut Value,
    path: &[&str],
    format: fn(&Timestamp) -> String,
) -> Result<(), CoreError> {
    let Some((segment, rest)) = path.split_first() else {
        if let Value::String(raw) = value {
            let ts = parse_datetime(raw)?;
            *value = Value::String(format(&ts));
        }
        return Ok(());
    };

    if *segment == EACH {
        if let Value::Array(elements) = value {
            for element in elements {
                rewrite_at(element, rest, format)?;
            }
        }
        return Ok(());
    }

    if let Some(child) = value.as_object_mut().and_then(|obj| obj.get_mut(*segment)) {
        rewrite_at(child, rest, format)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parses_server_and_rfc3339_forms() {
        let a = parse_datetime("2026-10-19T10:00:00+0000").unwrap();
        let b = parse_datetime("2026-10-19T12:00:00+02:00").unwrap();
        assert_eq!(a, b);
        assert!(parse_datetime("yesterday").is_err());
    }

    #[test]
    fn event_dates_go_to_server_form() {
        let editor = payload(json!({
            "name": "Launch",
            "dates": {"start": "2026-10-19T12:00:00+02:00", "end": null},
            "_links": {"self": "/events/e1"},
        }));

        let server = to_server_shape(ItemType::Event, &editor).unwrap();

        assert_eq!(server["dates"]["start"], "2026-10-19T10:00:00+0000");
        assert!(server["dates"]["end"].is_null());
        assert!(!server.contains_key("_links"));
        assert_eq!(server["name"], "Launch");
    }

    #[test]
    fn coverage_schedules_are_rewritten_for_every_coverage() {
        let server = payload(json!({
            "planning_date": "2026-10-19T08:00:00+0000",
            "coverages": [
                {"planning": {"scheduled": "2026-10-19T09:00:00+0000"}},
                {"planning": {}},
                {"planning": {"scheduled": "2026-10-20T09:30:00+0000"}},
            ],
        }));

        let editor = to_editor_shape(ItemType::Planning, &server).unwrap();

        assert_eq!(editor["planning_date"], "2026-10-19T08:00:00+00:00");
        assert_eq!(
            editor["coverages"][0]["planning"]["scheduled"],
            "2026-10-19T09:00:00+00:00"
        );
        assert!(editor["coverages"][1]["planning"].get("scheduled").is_none());
        assert_eq!(
            editor["coverages"][2]["planning"]["scheduled"],
            "2026-10-20T09:30:00+00:00"
        );
    }

    #[test]
    fn invalid_date_is_a_validation_error() {
        let editor = payload(json!({"planning_date": "soon"}));
        let err = to_server_shape(ItemType::Planning, &editor).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn shapes_agree_after_a_round_trip() {
        let editor = payload(json!({"dates": {"start": "2026-10-19T10:00:00+00:00"}}));
        let back = to_editor_shape(
            ItemType::Event,
            &to_server_shape(ItemType::Event, &editor).unwrap(),
        )
        .unwrap();
        assert_eq!(back, editor);
    }
}
