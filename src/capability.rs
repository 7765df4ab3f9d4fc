use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::Mutex;

use crate::sink::SinkError;
use crate::types::CapabilityReport;

/// Named device properties mirrored into the platform, by platform id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    OnOff,
    ThermostatMode,
    TargetTemperature,
    FanLevel,
    PureFanLevel,
    Swing,
    HorizontalSwing,
    ClimateReact,
    Temperature,
    Humidity,
    AirQuality,
    Co2,
    Tvoc,
    Iaq,
    LastSeen,
    LastSeenSeconds,
    FilterAlarm,
    FilterDueDate,
    FilterDueHours,
    FilterRunHours,
}

impl Capability {
    pub fn id(&self) -> &'static str {
        match self {
            Capability::OnOff => "se_onoff",
            Capability::ThermostatMode => "thermostat_mode",
            Capability::TargetTemperature => "target_temperature",
            Capability::FanLevel => "se_fanlevel",
            Capability::PureFanLevel => "se_fanlevel_pure",
            Capability::Swing => "se_fandirection",
            Capability::HorizontalSwing => "se_horizontal_swing",
            Capability::ClimateReact => "se_climate_react",
            Capability::Temperature => "measure_temperature",
            Capability::Humidity => "measure_humidity",
            Capability::AirQuality => "air_quality",
            Capability::Co2 => "measure_co2",
            Capability::Tvoc => "measure_tvoc",
            Capability::Iaq => "measure_iaq",
            Capability::LastSeen => "se_last_seen",
            Capability::LastSeenSeconds => "se_last_seen_seconds",
            Capability::FilterAlarm => "alarm_filter",
            Capability::FilterDueDate => "se_filter_due_date",
            Capability::FilterDueHours => "se_filter_due_hours",
            Capability::FilterRunHours => "se_filter_run_hours",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<bool> for CapabilityValue {
    fn from(v: bool) -> Self {
        CapabilityValue::Bool(v)
    }
}

impl From<f64> for CapabilityValue {
    fn from(v: f64) -> Self {
        CapabilityValue::Number(v)
    }
}

impl From<i64> for CapabilityValue {
    fn from(v: i64) -> Self {
        CapabilityValue::Number(v as f64)
    }
}

impl From<String> for CapabilityValue {
    fn from(v: String) -> Self {
        CapabilityValue::Text(v)
    }
}

impl From<&str> for CapabilityValue {
    fn from(v: &str) -> Self {
        CapabilityValue::Text(v.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    AirConditioner,
    Pure,
    Elements,
    RoomSensor,
}

impl DeviceKind {
    /// Pods only; room sensors are found through their parent pod.
    pub fn from_product_model(model: &str) -> Option<Self> {
        if model.contains("sky") || model.contains("airq") {
            Some(DeviceKind::AirConditioner)
        } else if model == "pure" {
            Some(DeviceKind::Pure)
        } else if model == "elements" {
            Some(DeviceKind::Elements)
        } else {
            None
        }
    }

    pub fn display_prefix(&self) -> &'static str {
        match self {
            DeviceKind::AirConditioner => "Sensibo",
            DeviceKind::Pure => "Sensibo Pure",
            DeviceKind::Elements => "Sensibo Elements",
            DeviceKind::RoomSensor => "Sensibo Room Sensor",
        }
    }
}

/// Feature flags a device's behaviour dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceTraits {
    pub has_fan_level: bool,
    pub has_pure_fan_level: bool,
    pub has_swing: bool,
    pub has_horizontal_swing: bool,
    pub has_thermostat_mode: bool,
    pub has_climate_react: bool,
    pub has_timer: bool,
    pub has_light: bool,
    pub has_pure_boost: bool,
    pub has_air_quality: bool,
    pub is_sensor_only: bool,
}

impl DeviceTraits {
    pub fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::AirConditioner => DeviceTraits {
                has_fan_level: true,
                has_swing: true,
                has_horizontal_swing: true,
                has_thermostat_mode: true,
                has_climate_react: true,
                has_timer: true,
                has_light: true,
                ..Default::default()
            },
            DeviceKind::Pure => DeviceTraits {
                has_pure_fan_level: true,
                has_pure_boost: true,
                has_air_quality: true,
                ..Default::default()
            },
            DeviceKind::Elements => DeviceTraits {
                has_air_quality: true,
                is_sensor_only: true,
                ..Default::default()
            },
            DeviceKind::RoomSensor => DeviceTraits {
                is_sensor_only: true,
                ..Default::default()
            },
        }
    }

    pub fn can_control(&self) -> bool {
        !self.is_sensor_only
    }

    /// Capabilities every device of this shape starts with.
    pub fn capabilities(&self) -> BTreeSet<Capability> {
        let mut caps = BTreeSet::from([
            Capability::Temperature,
            Capability::Humidity,
            Capability::LastSeen,
            Capability::LastSeenSeconds,
        ]);
        let flagged = [
            (self.can_control(), Capability::OnOff),
            (self.has_thermostat_mode, Capability::ThermostatMode),
            (self.has_thermostat_mode, Capability::TargetTemperature),
            (self.has_fan_level, Capability::FanLevel),
            (self.has_pure_fan_level, Capability::PureFanLevel),
            (self.has_swing, Capability::Swing),
            (self.has_horizontal_swing, Capability::HorizontalSwing),
            (self.has_climate_react, Capability::ClimateReact),
            (self.has_air_quality, Capability::AirQuality),
        ];
        caps.extend(flagged.into_iter().filter(|(on, _)| *on).map(|(_, cap)| cap));
        caps
    }
}

/// Model-specific capabilities revealed by the capability fetch.
pub fn discovered_capabilities(report: &CapabilityReport) -> Vec<Capability> {
    let mut found = Vec::new();
    if let Some(m) = &report.measurements {
        if m.co2.is_some() {
            found.push(Capability::Co2);
        }
        if m.tvoc.is_some() {
            found.push(Capability::Tvoc);
        }
        if m.iaq.is_some() {
            found.push(Capability::Iaq);
        }
    }
    if let Some(f) = &report.filters_cleaning {
        if f.should_clean_filters.is_some() {
            found.push(Capability::FilterAlarm);
        }
        if f.ac_on_seconds_since_last_filters_clean.is_some()
            && f.filters_clean_seconds_threshold.is_some()
        {
            found.extend([
                Capability::FilterRunHours,
                Capability::FilterDueHours,
                Capability::FilterDueDate,
            ]);
        }
    }
    found
}

/// Platform-side capability storage. Writes are best effort: callers log
/// failures and carry on.
pub trait CapabilityStore: Send + Sync {
    fn get(&self, device_id: &str, capability: Capability) -> Option<CapabilityValue>;
    fn set(
        &self,
        device_id: &str,
        capability: Capability,
        value: CapabilityValue,
    ) -> Result<(), SinkError>;
}

/// In-process store, for tests and hosts without their own persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<(String, Capability), CapabilityValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, device_id: &str) -> HashMap<Capability, CapabilityValue> {
        self.values
            .lock()
            .iter()
            .filter(|((id, _), _)| id == device_id)
            .map(|((_, cap), value)| (*cap, value.clone()))
            .collect()
    }
}

impl CapabilityStore for MemoryStore {
    fn get(&self, device_id: &str, capability: Capability) -> Option<CapabilityValue> {
        self.values
            .lock()
            .get(&(device_id.to_string(), capability))
            .cloned()
    }

    fn set(
        &self,
        device_id: &str,
        capability: Capability,
        value: CapabilityValue,
    ) -> Result<(), SinkError> {
        self.values
            .lock()
            .insert((device_id.to_string(), capability), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FiltersCleaning, Measurements};

    #[test]
    fn product_model_mapping() {
        assert_eq!(DeviceKind::from_product_model("skyv2"), Some(DeviceKind::AirConditioner));
        assert_eq!(DeviceKind::from_product_model("airq"), Some(DeviceKind::AirConditioner));
        assert_eq!(DeviceKind::from_product_model("pure"), Some(DeviceKind::Pure));
        assert_eq!(DeviceKind::from_product_model("elements"), Some(DeviceKind::Elements));
        assert_eq!(DeviceKind::from_product_model("thermostat"), None);
    }

    #[test]
    fn sensor_only_devices_have_no_controls() {
        let caps = DeviceTraits::for_kind(DeviceKind::RoomSensor).capabilities();
        assert!(!caps.contains(&Capability::OnOff));
        assert!(!caps.contains(&Capability::ThermostatMode));
        assert!(caps.contains(&Capability::Temperature));
        assert!(caps.contains(&Capability::LastSeenSeconds));
    }

    #[test]
    fn air_conditioner_capabilities() {
        let caps = DeviceTraits::for_kind(DeviceKind::AirConditioner).capabilities();
        for cap in [
            Capability::OnOff,
            Capability::ThermostatMode,
            Capability::TargetTemperature,
            Capability::FanLevel,
            Capability::Swing,
            Capability::HorizontalSwing,
            Capability::ClimateReact,
        ] {
            assert!(caps.contains(&cap), "missing {cap}");
        }
        assert!(!caps.contains(&Capability::PureFanLevel));
    }

    #[test]
    fn discovery_requires_both_filter_counters() {
        let report = CapabilityReport {
            measurements: Some(Measurements {
                co2: Some(600.0),
                ..Default::default()
            }),
            filters_cleaning: Some(FiltersCleaning {
                should_clean_filters: Some(false),
                ac_on_seconds_since_last_filters_clean: Some(3600),
                filters_clean_seconds_threshold: None,
            }),
            ..Default::default()
        };
        let found = discovered_capabilities(&report);
        assert_eq!(found, vec![Capability::Co2, Capability::FilterAlarm]);
    }

    #[test]
    fn memory_store_is_per_device() {
        let store = MemoryStore::new();
        store.set("a", Capability::OnOff, true.into()).unwrap();
        store.set("b", Capability::OnOff, false.into()).unwrap();
        assert_eq!(store.get("a", Capability::OnOff), Some(CapabilityValue::Bool(true)));
        assert_eq!(store.snapshot("b").len(), 1);
        assert_eq!(store.get("c", Capability::OnOff), None);
    }
}
