use std::ops::RangeInclusive;
use std::time::Duration;

use crate::capability::DeviceKind;

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_OFFLINE_DELAY: Duration = Duration::from_secs(300);

/// Per-device settings as exposed on the platform's settings page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSettings {
    polling_interval: Duration,
    offline_delay: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            offline_delay: DEFAULT_OFFLINE_DELAY,
        }
    }
}

impl DeviceSettings {
    /// Intervals below 15 s are raised to 15 s.
    pub fn new(polling_interval: Duration, offline_delay: Duration) -> Self {
        Self {
            polling_interval: polling_interval.max(MIN_POLLING_INTERVAL),
            offline_delay,
        }
    }

    /// Map raw `Polling_Interval` / `Delay_Offline` values (seconds). Missing
    /// or zero values fall back to the defaults.
    pub fn from_platform(polling_interval: Option<u64>, delay_offline: Option<u64>) -> Self {
        let secs = |v: Option<u64>, default: Duration| match v {
            Some(0) | None => default,
            Some(s) => Duration::from_secs(s),
        };
        Self::new(
            secs(polling_interval, DEFAULT_POLLING_INTERVAL),
            secs(delay_offline, DEFAULT_OFFLINE_DELAY),
        )
    }

    /// Skips the polling floor.
    #[cfg(test)]
    pub(crate) fn unchecked(polling_interval: Duration, offline_delay: Duration) -> Self {
        Self {
            polling_interval,
            offline_delay,
        }
    }

    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    pub fn offline_delay(&self) -> Duration {
        self.offline_delay
    }
}

/// How a device gets its snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollMode {
    /// The device polls its own pod endpoint.
    #[default]
    Device,
    /// Snapshots arrive from the [`FleetPoller`](crate::FleetPoller).
    Fleet,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub settings: DeviceSettings,
    pub mode: PollMode,
}

impl DeviceConfig {
    pub fn new(device_id: impl Into<String>, kind: DeviceKind) -> Self {
        let device_id = device_id.into();
        Self {
            name: format!("{} {device_id}", kind.display_prefix()),
            device_id,
            kind,
            settings: DeviceSettings::default(),
            mode: PollMode::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn settings(mut self, settings: DeviceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn mode(mut self, mode: PollMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Delay before the first poll after initialization.
    pub initial_delay: Duration,
    /// Number of history entries fetched per poll.
    pub history_limit: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            history_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetConfig {
    /// Random delay added before every bulk fetch.
    pub jitter: RangeInclusive<Duration>,
    /// Tick used while no device is registered.
    pub idle_interval: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            jitter: Duration::from_secs(2)..=Duration::from_secs(10),
            idle_interval: DEFAULT_POLLING_INTERVAL,
        }
    }
}
