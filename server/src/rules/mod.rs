use serde_json::{Value, json};

use crate::core::error::ServiceError;
use crate::core::{ObjectKey, StateObject, strip_user_prefix};
use crate::state::{DeviceStateService, MergeOptions};
use crate::store::StateStore;

/// Fan control fields that must survive partial updates with their prior
/// values, even when the device nulls them out.
pub const FAN_TIMER_FIELDS: &[&str] = &[
    "fan_timer_timeout",
    "fan_control_state",
    "fan_timer_duration",
    "fan_current_speed",
    "fan_mode",
];

/// Device object fields that feed the per-user away aggregate.
pub const AWAY_FIELDS: &[&str] = &["away", "away_timestamp", "vacation_mode", "manual_away_timestamp"];

/// Restores fan-timer fields the merge lost or nulled out. Runs post-merge,
/// before the revision comparison.
pub fn preserve_fan_timer(prior: &Value, merged: &mut Value) {
    let (Some(prior_map), Some(merged_map)) = (prior.as_object(), merged.as_object_mut()) else {
        return;
    };

    for field in FAN_TIMER_FIELDS {
        let lost = match merged_map.get(*field) {
            None => true,
            Some(Value::Null) => prior_map.get(*field).is_some_and(|v| !v.is_null()),
            Some(_) => false,
        };
        if lost && let Some(prev) = prior_map.get(*field) {
            merged_map.insert((*field).to_string(), prev.clone());
        }
    }
}

pub fn touches_away_fields(incoming: &Value) -> bool {
    incoming
        .as_object()
        .is_some_and(|map| AWAY_FIELDS.iter().any(|f| map.contains_key(*f)))
}

#[derive(Debug, Default, PartialEq)]
pub struct AwayAggregate {
    pub away: bool,
    pub away_timestamp: Option<i64>,
    pub manual_away_timestamp: Option<i64>,
    pub away_setter: Option<Value>,
    pub vacation_mode: bool,
}

/// Away = all devices report away; timestamps and setter come from the most
/// recent reporter; vacation mode = any device in vacation mode.
pub fn aggregate_away(device_values: &[Value]) -> AwayAggregate {
    let mut agg = AwayAggregate {
        away: !device_values.is_empty(),
        ..AwayAggregate::default()
    };

    for value in device_values {
        if !truthy(value.get("away")) {
            agg.away = false;
        }
        if truthy(value.get("vacation_mode")) {
            agg.vacation_mode = true;
        }

        let ts = value.get("away_timestamp").and_then(Value::as_i64);
        if ts > agg.away_timestamp {
            agg.away_timestamp = ts;
            agg.away_setter = value.get("away_setter").cloned();
        }

        let manual = value.get("manual_away_timestamp").and_then(Value::as_i64);
        if manual > agg.manual_away_timestamp {
            agg.manual_away_timestamp = manual;
        }
    }

    agg
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

/// Recomputes the owner's `user.*` aggregate and writes it into the bucket of
/// every serial the user owns. Returns the per-serial objects that changed so
/// the caller can wake subscribers.
pub async fn recompute_user_away(
    state: &DeviceStateService,
    store: &StateStore,
    user_id: &str,
) -> Result<Vec<(String, StateObject)>, ServiceError> {
    let serials = store.list_user_devices(user_id).await?;
    if serials.is_empty() {
        return Ok(vec![]);
    }

    let mut device_values = Vec::with_capacity(serials.len());
    for serial in &serials {
        if let Some(obj) = state.get(serial, &ObjectKey::device(serial)).await? {
            device_values.push(obj.value);
        }
    }

    let agg = aggregate_away(&device_values);
    let mut fields = json!({
        "away": agg.away,
        "vacation_mode": agg.vacation_mode,
    });
    if let Some(ts) = agg.away_timestamp {
        fields["away_timestamp"] = json!(ts);
    }
    if let Some(ts) = agg.manual_away_timestamp {
        fields["manual_away_timestamp"] = json!(ts);
    }
    if let Some(setter) = agg.away_setter {
        fields["away_setter"] = setter;
    }

    let user_key = ObjectKey::user(strip_user_prefix(user_id));
    let mut changed = vec![];
    for serial in &serials {
        let outcome = state
            .merge_update(serial, &user_key, &fields, MergeOptions::default())
            .await?;
        if outcome.changed {
            changed.push((serial.clone(), outcome.object));
        }
    }

    Ok(changed)
}

/// Creates the pairing-confirm alert dialog on first contact.
pub async fn ensure_device_alert_dialog(
    state: &DeviceStateService,
    serial: &str,
) -> Result<Option<StateObject>, ServiceError> {
    let key = ObjectKey::device_alert_dialog(serial);
    if state.get(serial, &key).await?.is_some() {
        return Ok(None);
    }

    let outcome = state
        .merge_update(
            serial,
            &key,
            &json!({"dialog_id": "confirm-pairing", "dialog_data": ""}),
            MergeOptions::default(),
        )
        .await?;

    Ok(Some(outcome.object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    #[test]
    fn preserve_restores_missing_and_nulled_fields() {
        let prior = json!({"fan_mode": "auto", "fan_timer_duration": 900, "away": false});
        let mut merged = json!({"fan_mode": null, "away": true});

        preserve_fan_timer(&prior, &mut merged);

        assert_json_eq!(merged, json!({"fan_mode": "auto", "fan_timer_duration": 900, "away": true}));
    }

    #[test]
    fn preserve_keeps_explicit_new_values() {
        let prior = json!({"fan_mode": "auto"});
        let mut merged = json!({"fan_mode": "on"});

        preserve_fan_timer(&prior, &mut merged);

        assert_eq!(merged["fan_mode"], json!("on"));
    }

    #[test]
    fn away_requires_all_devices() {
        let agg = aggregate_away(&[
            json!({"away": true, "away_timestamp": 100}),
            json!({"away": false, "away_timestamp": 200, "away_setter": 1}),
        ]);

        assert!(!agg.away);
        assert_eq!(agg.away_timestamp, Some(200));
        assert_eq!(agg.away_setter, Some(json!(1)));
    }

    #[test]
    fn away_of_all_devices_with_latest_stamps() {
        let agg = aggregate_away(&[
            json!({"away": true, "away_timestamp": 300, "manual_away_timestamp": 50}),
            json!({"away": 1, "away_timestamp": 100, "manual_away_timestamp": 400, "vacation_mode": true}),
        ]);

        assert!(agg.away);
        assert!(agg.vacation_mode);
        assert_eq!(agg.away_timestamp, Some(300));
        assert_eq!(agg.manual_away_timestamp, Some(400));
    }

    #[test]
    fn no_devices_means_not_away() {
        assert_eq!(aggregate_away(&[]), AwayAggregate::default());
    }

    #[test]
    fn away_field_detection() {
        assert!(touches_away_fields(&json!({"away": true})));
        assert!(touches_away_fields(&json!({"manual_away_timestamp": 1})));
        assert!(!touches_away_fields(&json!({"target_temperature": 21.0})));
        assert!(!touches_away_fields(&json!(42)));
    }
}
