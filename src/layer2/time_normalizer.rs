// Time Normalizer - wire timestamp conversion
// ISO-8601 strings in time-named fields become epoch-millisecond integers

use chrono::DateTime;
use serde_json::Value;

// Wire payloads are trees; the cap guards against pathological nesting
const MAX_DEPTH: usize = 64;

/// Normalize all instant-valued fields of a decoded payload in place.
///
/// Every object field whose name ends in `time` or `Time` and holds an
/// ISO-8601 string is replaced by its epoch-millisecond integer. The exact
/// names `brokerTime` and `BrokerTime` are excluded: broker-local times stay
/// formatted strings. Idempotent, and each container is visited exactly once.
pub fn normalize_times(value: &mut Value) {
    walk(value, 0);
}

fn walk(value: &mut Value, depth: usize) {
    if depth >= MAX_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                if is_time_field(key) {
                    if let Value::String(text) = child {
                        if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
                            *child = Value::from(instant.timestamp_millis());
                            continue;
                        }
                    }
                }
                walk(child, depth + 1);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                walk(item, depth + 1);
            }
        }
        _ => {}
    }
}

fn is_time_field(name: &str) -> bool {
    (name.ends_with("time") || name.ends_with("Time"))
        && name != "brokerTime"
        && name != "BrokerTime"
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_converts_iso_time_fields() {
        let mut value = json!({"time": "2021-01-01T00:00:00.000Z"});
        normalize_times(&mut value);
        assert_eq!(value, json!({"time": 1_609_459_200_000_i64}));
    }

    #[test]
    fn test_suffix_match_on_field_name() {
        let mut value = json!({
            "updateTime": "2021-01-01T00:00:00.000Z",
            "doneTime": "2021-01-01T01:00:00.000Z",
            "timestamp": "2021-01-01T00:00:00.000Z"
        });
        normalize_times(&mut value);
        assert_eq!(value["updateTime"], json!(1_609_459_200_000_i64));
        assert_eq!(value["doneTime"], json!(1_609_462_800_000_i64));
        // `timestamp` does not end in time/Time
        assert_eq!(value["timestamp"], json!("2021-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_broker_time_stays_string() {
        let mut value = json!({
            "time": "2021-01-01T00:00:00.000Z",
            "brokerTime": "2021-01-01 02:00:00.000"
        });
        normalize_times(&mut value);
        assert_eq!(value["time"], json!(1_609_459_200_000_i64));
        assert_eq!(value["brokerTime"], json!("2021-01-01 02:00:00.000"));
    }

    #[test]
    fn test_recurses_into_arrays_and_objects() {
        let mut value = json!({
            "positions": [
                {"id": "1", "openTime": "2021-01-01T00:00:00.000Z"},
                {"id": "2", "openTime": "2021-01-01T01:00:00.000Z"}
            ],
            "accountInformation": {"updateTime": "2021-01-01T00:00:00.000Z"}
        });
        normalize_times(&mut value);
        assert_eq!(value["positions"][0]["openTime"], json!(1_609_459_200_000_i64));
        assert_eq!(value["positions"][1]["openTime"], json!(1_609_462_800_000_i64));
        assert_eq!(
            value["accountInformation"]["updateTime"],
            json!(1_609_459_200_000_i64)
        );
    }

    #[test]
    fn test_idempotent() {
        let mut once = json!({
            "time": "2021-01-01T00:00:00.000Z",
            "deals": [{"doneTime": "2021-01-01T00:00:01.500Z"}]
        });
        normalize_times(&mut once);
        let mut twice = once.clone();
        normalize_times(&mut twice);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unparseable_string_left_alone() {
        let mut value = json!({"time": "not a timestamp"});
        normalize_times(&mut value);
        assert_eq!(value, json!({"time": "not a timestamp"}));
    }

    #[test]
    fn test_time_field_holding_object_is_still_walked() {
        let mut value = json!({"serverTime": {"time": "2021-01-01T00:00:00.000Z"}});
        normalize_times(&mut value);
        assert_eq!(value["serverTime"]["time"], json!(1_609_459_200_000_i64));
    }

    #[test]
    fn test_round_trip_preserves_instant() {
        let mut value = json!({"time": "2021-01-01T00:00:00.000Z"});
        normalize_times(&mut value);
        let millis = value["time"].as_i64().unwrap();
        let parsed = DateTime::parse_from_rfc3339("2021-01-01T00:00:00.000Z").unwrap();
        assert_eq!(millis, parsed.timestamp_millis());
    }
}
