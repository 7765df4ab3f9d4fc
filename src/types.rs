use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    C,
    F,
}

/// Remote-controllable AC properties.
///
/// Every field is optional: a payload that omits a key leaves the previously
/// known value in place when merged (see [`AcState::merge`]). The same type
/// doubles as the partial state accepted by commands.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_unit: Option<TemperatureUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_swing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light: Option<String>,
}

impl AcState {
    /// Apply only the keys present in `partial`.
    pub fn merge(&mut self, partial: &AcState) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        take(&mut self.on, &partial.on);
        take(&mut self.mode, &partial.mode);
        take(&mut self.fan_level, &partial.fan_level);
        take(&mut self.target_temperature, &partial.target_temperature);
        take(&mut self.temperature_unit, &partial.temperature_unit);
        take(&mut self.swing, &partial.swing);
        take(&mut self.horizontal_swing, &partial.horizontal_swing);
        take(&mut self.light, &partial.light);
    }

    pub fn merged(&self, partial: &AcState) -> AcState {
        let mut state = self.clone();
        state.merge(partial);
        state
    }

    pub fn is_empty(&self) -> bool {
        *self == AcState::default()
    }

    pub fn power(on: bool) -> Self {
        Self {
            on: Some(on),
            ..Default::default()
        }
    }
}

/// Thermostat-style view of the AC: only modes with a thermostat equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermostatMode {
    Off,
    Heat,
    Cool,
    Auto,
}

impl ThermostatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThermostatMode::Off => "off",
            ThermostatMode::Heat => "heat",
            ThermostatMode::Cool => "cool",
            ThermostatMode::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ThermostatMode::Off),
            "heat" => Some(ThermostatMode::Heat),
            "cool" => Some(ThermostatMode::Cool),
            "auto" => Some(ThermostatMode::Auto),
            _ => None,
        }
    }

    /// `off` when the unit is off, the mode when it is heat/cool/auto,
    /// nothing for fan/dry and other modes.
    pub fn derive(state: &AcState) -> Option<Self> {
        if state.on == Some(false) {
            return Some(ThermostatMode::Off);
        }
        match state.mode.as_deref()? {
            "off" => None,
            mode => ThermostatMode::parse(mode),
        }
    }
}

impl fmt::Display for ThermostatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-mode option sets. `None` means the descriptor says nothing, which
/// never restricts a value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeCapabilities {
    #[serde(default)]
    pub fan_levels: Option<Vec<String>>,
    #[serde(default)]
    pub swing: Option<Vec<String>>,
    #[serde(default)]
    pub horizontal_swing: Option<Vec<String>>,
    #[serde(default)]
    pub light: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteCapabilities {
    #[serde(default)]
    pub modes: BTreeMap<String, ModeCapabilities>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementTime {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seconds_ago: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurements {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    /// Categorical PM2.5 code (1/2/3), not a concentration.
    #[serde(default)]
    pub pm25: Option<f64>,
    #[serde(default)]
    pub co2: Option<f64>,
    #[serde(default)]
    pub tvoc: Option<f64>,
    #[serde(default)]
    pub iaq: Option<f64>,
    #[serde(default)]
    pub time: Option<MeasurementTime>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerDescriptor {
    #[serde(default)]
    pub is_enabled: bool,
    #[serde(default)]
    pub target_time_seconds_from_now: Option<i64>,
    #[serde(default)]
    pub ac_state: Option<AcState>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FiltersCleaning {
    #[serde(default)]
    pub should_clean_filters: Option<bool>,
    #[serde(default)]
    pub ac_on_seconds_since_last_filters_clean: Option<i64>,
    #[serde(default)]
    pub filters_clean_seconds_threshold: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    #[serde(default)]
    pub is_alive: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SmartMode {
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Room {
    #[serde(default)]
    pub name: String,
}

/// Room sensor paired to a pod, reported inside the fleet listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionSensor {
    pub id: String,
    #[serde(default)]
    pub parent_device_uid: Option<String>,
    #[serde(default)]
    pub measurements: Option<Measurements>,
    #[serde(default)]
    pub connection_status: Option<ConnectionStatus>,
}

impl MotionSensor {
    pub fn to_snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            id: self.id.clone(),
            measurements: self.measurements.clone(),
            connection_status: self.connection_status.clone(),
            ..Default::default()
        }
    }
}

/// One entry of the remote AC state history, newest first.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalAction {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub ac_state: Option<AcState>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub changed_properties: Vec<String>,
}

/// One polled read of a device.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub room: Option<Room>,
    #[serde(default)]
    pub product_model: Option<String>,
    #[serde(default)]
    pub ac_state: Option<AcState>,
    #[serde(default)]
    pub measurements: Option<Measurements>,
    #[serde(default)]
    pub timer: Option<TimerDescriptor>,
    #[serde(default)]
    pub filters_cleaning: Option<FiltersCleaning>,
    #[serde(default)]
    pub connection_status: Option<ConnectionStatus>,
    #[serde(default)]
    pub smart_mode: Option<SmartMode>,
    #[serde(default)]
    pub motion_sensors: Option<Vec<MotionSensor>>,
    /// Filled by the poller from the history endpoint, not part of the pod payload.
    #[serde(skip)]
    pub history: Option<Vec<HistoricalAction>>,
}

impl DeviceSnapshot {
    pub fn climate_react_enabled(&self) -> Option<bool> {
        self.smart_mode.as_ref().and_then(|s| s.enabled)
    }
}

/// Result of the capability fetch. Measurements and filter data may be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityReport {
    #[serde(default)]
    pub remote_capabilities: Option<RemoteCapabilities>,
    #[serde(default)]
    pub measurements: Option<Measurements>,
    #[serde(default)]
    pub filters_cleaning: Option<FiltersCleaning>,
}

/// Pod entry of the account-wide device listing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub id: String,
    #[serde(default)]
    pub room: Option<Room>,
    #[serde(default)]
    pub product_model: Option<String>,
    #[serde(default)]
    pub motion_sensors: Option<Vec<MotionSensor>>,
}

/// Locally derived timer flags, compared across polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerState {
    pub has_timer: bool,
    pub has_timer_enabled: bool,
}

impl TimerState {
    pub fn observe(timer: Option<&TimerDescriptor>) -> Self {
        Self {
            has_timer: timer.is_some(),
            has_timer_enabled: timer.is_some_and(|t| t.is_enabled),
        }
    }

    pub fn armed() -> Self {
        Self {
            has_timer: true,
            has_timer_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AirQuality {
    Good,
    Moderate,
    Bad,
}

impl AirQuality {
    /// Unknown codes yield `None` rather than an error.
    pub fn from_pm25_code(code: f64) -> Option<Self> {
        if code.fract() != 0.0 {
            return None;
        }
        match code as i64 {
            1 => Some(AirQuality::Good),
            2 => Some(AirQuality::Moderate),
            3 => Some(AirQuality::Bad),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AirQuality::Good => "good",
            AirQuality::Moderate => "moderate",
            AirQuality::Bad => "bad",
        }
    }
}

/// Who caused a timer lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrigin {
    /// A command issued through this process.
    Local,
    /// Observed on a poll.
    Remote,
}

/// Notifications posted to the [`EventSink`](crate::EventSink).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TurnedOn,
    TurnedOff,
    TimerCreated { origin: TriggerOrigin },
    TimerDeleted { origin: TriggerOrigin },
    TimerFired,
    AcStateChanged {
        id: String,
        status: Option<String>,
        reason: Option<String>,
        state: Option<AcState>,
        failure_reason: Option<String>,
    },
    ClimateReactChanged { enabled: bool },
    DeviceOffline { seconds_ago: i64, last_seen: String },
    FilterAlarm { active: bool },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::TurnedOn => "turned_on",
            Event::TurnedOff => "turned_off",
            Event::TimerCreated { .. } => "timer_created",
            Event::TimerDeleted { .. } => "timer_deleted",
            Event::TimerFired => "timer_fired",
            Event::AcStateChanged { .. } => "ac_state_changed",
            Event::ClimateReactChanged { .. } => "climate_react_changed",
            Event::DeviceOffline { .. } => "device_offline",
            Event::FilterAlarm { .. } => "filter_alarm",
        }
    }
}

impl From<&HistoricalAction> for Event {
    fn from(action: &HistoricalAction) -> Self {
        Event::AcStateChanged {
            id: action.id.clone(),
            status: action.status.clone(),
            reason: action.reason.clone(),
            state: action.ac_state.clone(),
            failure_reason: action.failure_reason.clone(),
        }
    }
}
