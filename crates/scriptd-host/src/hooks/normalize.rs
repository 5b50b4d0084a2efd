use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

/// Turn a stored document into the plain shape model hooks receive.
///
/// - `_id` is removed; its string form becomes `id` unless `id` is present
/// - `{"$oid": hex}` becomes the lowercase hex string
/// - `{"$date": ...}` and RFC 3339 strings become UTC RFC 3339 with millis
pub fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::Object(mut document) => {
            let internal_id = document.remove("_id").map(normalize_value);
            let mut out: Map<String, Value> = document
                .into_iter()
                .map(|(key, value)| (key, normalize_value(value)))
                .collect();

            if let Some(id) = internal_id {
                if !out.contains_key("id") {
                    out.insert("id".to_string(), Value::String(id_string(id)));
                }
            }
            Value::Object(out)
        }
        other => normalize_value(other),
    }
}

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => match extended_scalar(&map) {
            Some(scalar) => scalar,
            None => Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, normalize_value(value)))
                    .collect(),
            ),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        Value::String(s) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Value::String(format_utc(dt.with_timezone(&Utc))),
            Err(_) => Value::String(s),
        },
        other => other,
    }
}

/// Single-key wrapper objects used by document stores for typed scalars
fn extended_scalar(map: &Map<String, Value>) -> Option<Value> {
    if map.len() != 1 {
        return None;
    }
    let (key, value) = map.iter().next()?;
    match (key.as_str(), value) {
        ("$oid", Value::String(hex)) => Some(Value::String(hex.to_ascii_lowercase())),
        ("$date", value) => parse_date(value).map(|dt| Value::String(format_utc(dt))),
        _ => None,
    }
}

fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        Value::Object(inner) => {
            let millis = inner.get("$numberLong")?.as_str()?.parse::<i64>().ok()?;
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn id_string(id: Value) -> String {
    match id {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
