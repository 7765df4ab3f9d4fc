use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::error::{RemoteError, RemoteErrorKind};
use crate::types::AcState;

pub const DEFAULT_BASE_URL: &str = "https://home.sensibo.com/api";

pub const SNAPSHOT_FIELDS: &str = "measurements,acState,timer,filtersCleaning";
pub const CAPABILITY_FIELDS: &str = "measurements,remoteCapabilities,filtersCleaning";
pub const TIMER_FIELDS: &str = "timer";
pub const LISTING_FIELDS: &str = "id,room,productModel,motionSensors";
pub const FLEET_FIELDS: &str = "id,room,productModel,acState,measurements,motionSensors,\
    timer,connectionStatus,filtersCleaning,smartMode";

pub const MAX_TIMER_MINUTES: i64 = 1440;
pub const SYNC_POWER_REASON: &str = "StateCorrectionByUser";

/// API version segment. The timer endpoints still live on v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V1,
    V2,
}

impl ApiVersion {
    fn segment(self) -> &'static str {
        match self {
            ApiVersion::V1 => "v1",
            ApiVersion::V2 => "v2",
        }
    }
}

pub fn api_url(base: &str, version: ApiVersion, path: &str) -> String {
    format!("{}/{}{}", base.trim_end_matches('/'), version.segment(), path)
}

pub fn pod_path(device_id: &str) -> String {
    format!("/pods/{device_id}")
}

pub fn ac_state_body(state: &AcState) -> Value {
    json!({ "acState": state })
}

pub fn property_body(value: &Value) -> Value {
    json!({ "newValue": value })
}

pub fn sync_power_body(on: bool) -> Value {
    json!({
        "newValue": on,
        "reason": SYNC_POWER_REASON,
    })
}

pub fn timer_body(minutes_from_now: i64, state: &AcState) -> Value {
    json!({
        "minutesFromNow": minutes_from_now,
        "acState": state,
    })
}

pub fn toggle_body(enabled: bool) -> Value {
    json!({ "enabled": enabled })
}

/// Body sent to the timer endpoint: the requested keys win, the core keys
/// come from the last known state so the remote never receives a sparse
/// state. Horizontal swing and light are only sent when requested.
pub fn timer_state(partial: &AcState, last_known: &AcState) -> AcState {
    AcState {
        on: partial.on.or(last_known.on),
        mode: partial.mode.clone().or_else(|| last_known.mode.clone()),
        fan_level: partial
            .fan_level
            .clone()
            .or_else(|| last_known.fan_level.clone()),
        target_temperature: partial
            .target_temperature
            .or(last_known.target_temperature),
        temperature_unit: partial.temperature_unit.or(last_known.temperature_unit),
        swing: partial.swing.clone().or_else(|| last_known.swing.clone()),
        horizontal_swing: partial.horizontal_swing.clone(),
        light: partial.light.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

/// Unwrap the `{"status": ..., "result": ...}` envelope every endpoint uses.
pub fn parse_result<T: DeserializeOwned>(body: &str) -> Result<T, RemoteError> {
    serde_json::from_str::<Envelope<T>>(body)
        .map(|e| e.result)
        .map_err(|e| RemoteError {
            kind: RemoteErrorKind::Permanent,
            status: None,
            message: format!("unexpected response body: {e}"),
        })
}

/// Best-effort message extraction from an error body.
pub fn error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    ["message", "reason", "error"]
        .iter()
        .find_map(|key| parsed.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TemperatureUnit;

    #[test]
    fn urls() {
        assert_eq!(
            api_url(DEFAULT_BASE_URL, ApiVersion::V2, &pod_path("abc")),
            "https://home.sensibo.com/api/v2/pods/abc"
        );
        assert_eq!(
            api_url("http://127.0.0.1:8080/", ApiVersion::V1, "/pods/abc/timer"),
            "http://127.0.0.1:8080/v1/pods/abc/timer"
        );
    }

    #[test]
    fn ac_state_body_skips_unset_keys() {
        let body = ac_state_body(&AcState {
            on: Some(true),
            mode: Some("cool".into()),
            ..Default::default()
        });
        assert_eq!(body, json!({"acState": {"on": true, "mode": "cool"}}));
    }

    #[test]
    fn sync_power_carries_reason() {
        let body = sync_power_body(false);
        assert_eq!(body["newValue"], false);
        assert_eq!(body["reason"], "StateCorrectionByUser");
    }

    #[test]
    fn timer_state_fills_from_last_known() {
        let last = AcState {
            on: Some(false),
            mode: Some("heat".into()),
            fan_level: Some("low".into()),
            target_temperature: Some(21.0),
            temperature_unit: Some(TemperatureUnit::C),
            swing: Some("rangeFull".into()),
            horizontal_swing: Some("stopped".into()),
            light: Some("on".into()),
        };
        let partial = AcState {
            on: Some(true),
            target_temperature: Some(24.0),
            ..Default::default()
        };
        let state = timer_state(&partial, &last);
        assert_eq!(state.on, Some(true));
        assert_eq!(state.mode.as_deref(), Some("heat"));
        assert_eq!(state.fan_level.as_deref(), Some("low"));
        assert_eq!(state.target_temperature, Some(24.0));
        assert_eq!(state.temperature_unit, Some(TemperatureUnit::C));
        assert_eq!(state.swing.as_deref(), Some("rangeFull"));
        assert_eq!(state.horizontal_swing, None);
        assert_eq!(state.light, None);
    }

    #[test]
    fn timer_state_keeps_every_requested_key() {
        let last = AcState {
            on: Some(false),
            swing: Some("stopped".into()),
            light: Some("on".into()),
            ..Default::default()
        };
        let partial = AcState {
            swing: Some("rangeFull".into()),
            horizontal_swing: Some("fixedLeft".into()),
            light: Some("off".into()),
            ..Default::default()
        };
        let state = timer_state(&partial, &last);
        assert_eq!(state.on, Some(false));
        assert_eq!(state.swing.as_deref(), Some("rangeFull"));
        assert_eq!(state.horizontal_swing.as_deref(), Some("fixedLeft"));
        assert_eq!(state.light.as_deref(), Some("off"));
    }

    #[test]
    fn parse_result_unwraps_envelope() {
        let body = r#"{"status": "success", "result": {"enabled": true}}"#;
        let value: Value = parse_result(body).unwrap();
        assert_eq!(value["enabled"], true);
    }

    #[test]
    fn parse_result_rejects_garbage() {
        let err = parse_result::<Value>("not json").unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Permanent);
    }

    #[test]
    fn error_message_prefers_message_key() {
        let body = r#"{"status": "error", "reason": "badRequest", "message": "mode is not valid"}"#;
        assert_eq!(error_message(body).as_deref(), Some("mode is not valid"));
        assert_eq!(error_message("<html>").as_deref(), None);
    }
}
