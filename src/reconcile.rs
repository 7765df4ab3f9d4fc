//! Snapshot diffing.
//!
//! [`reconcile`] is a pure function: it takes the bookkeeping of the previous
//! poll and a fresh [`DeviceSnapshot`] and returns the next bookkeeping, the
//! capability writes, the events to emit and what to do with the local
//! countdown. Applying any of that is the caller's job.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, Utc};

use crate::capability::{Capability, CapabilityValue};
use crate::types::{
    AirQuality, DeviceSnapshot, Event, FiltersCleaning, Measurements, ThermostatMode, TimerState,
    TriggerOrigin,
};

/// Per-device bookkeeping carried from one poll to the next.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollState {
    /// Last value written for each capability.
    pub capabilities: BTreeMap<Capability, CapabilityValue>,
    /// `None` until the first poll.
    pub timer: Option<TimerState>,
    /// Ids of the last fetched history page. `None` until the first page.
    pub history_ids: Option<BTreeSet<String>>,
    pub climate_react: Option<bool>,
    pub offline_latched: bool,
}

impl PollState {
    /// Start from values the platform already holds, so a restart does not
    /// replay transitions that were reported before.
    pub fn seeded(values: impl IntoIterator<Item = (Capability, CapabilityValue)>) -> Self {
        Self {
            capabilities: values.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn value(&self, capability: Capability) -> Option<&CapabilityValue> {
        self.capabilities.get(&capability)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileContext<'a> {
    /// Capabilities the device exposes; nothing else is written.
    pub capabilities: &'a BTreeSet<Capability>,
    pub offline_threshold: Duration,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityUpdate {
    pub capability: Capability,
    pub value: CapabilityValue,
}

/// What to do with the local countdown mirroring the remote timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// (Re)start the countdown.
    Schedule(Duration),
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub state: PollState,
    pub updates: Vec<CapabilityUpdate>,
    pub events: Vec<Event>,
    pub timer: TimerAction,
}

pub fn reconcile(
    previous: &PollState,
    snapshot: &DeviceSnapshot,
    ctx: &ReconcileContext<'_>,
) -> Reconciliation {
    let mut pass = Pass {
        ctx,
        state: previous.clone(),
        updates: Vec::new(),
        events: Vec::new(),
    };

    pass.ac_state(snapshot);
    let timer = pass.timer(snapshot);
    pass.history(snapshot);
    pass.climate_react(snapshot);
    if let Some(m) = &snapshot.measurements {
        pass.measurements(m);
    }
    if let Some(f) = &snapshot.filters_cleaning {
        pass.filters(f);
    }

    Reconciliation {
        state: pass.state,
        updates: pass.updates,
        events: pass.events,
        timer,
    }
}

struct Pass<'a, 'b> {
    ctx: &'a ReconcileContext<'b>,
    state: PollState,
    updates: Vec<CapabilityUpdate>,
    events: Vec<Event>,
}

impl Pass<'_, '_> {
    /// Write `value` if the device has the capability, the value was reported
    /// and it differs from the last known one. Returns whether it was written.
    fn update<V: Into<CapabilityValue>>(&mut self, capability: Capability, value: Option<V>) -> bool {
        if !self.ctx.capabilities.contains(&capability) {
            return false;
        }
        let Some(value) = value.map(Into::into) else {
            return false;
        };
        if self.state.capabilities.get(&capability) == Some(&value) {
            return false;
        }
        self.state.capabilities.insert(capability, value.clone());
        self.updates.push(CapabilityUpdate { capability, value });
        true
    }

    fn ac_state(&mut self, snapshot: &DeviceSnapshot) {
        let Some(ac) = &snapshot.ac_state else {
            return;
        };

        if self.update(Capability::OnOff, ac.on) {
            self.events.push(if ac.on == Some(true) {
                Event::TurnedOn
            } else {
                Event::TurnedOff
            });
        }

        self.update(Capability::TargetTemperature, ac.target_temperature);
        self.update(Capability::FanLevel, ac.fan_level.clone());
        self.update(Capability::PureFanLevel, ac.fan_level.clone());
        self.update(Capability::Swing, ac.swing.clone());
        self.update(Capability::HorizontalSwing, ac.horizontal_swing.clone());

        let mode = ThermostatMode::derive(ac).map(|m| m.as_str());
        self.update(Capability::ThermostatMode, mode);
    }

    fn timer(&mut self, snapshot: &DeviceSnapshot) -> TimerAction {
        let timer = snapshot.timer.as_ref();
        let current = TimerState::observe(timer);

        if let Some(prev) = self.state.timer {
            if !prev.has_timer_enabled && current.has_timer_enabled {
                self.events.push(Event::TimerCreated {
                    origin: TriggerOrigin::Remote,
                });
            } else if prev.has_timer && !current.has_timer {
                self.events.push(Event::TimerDeleted {
                    origin: TriggerOrigin::Remote,
                });
            }
        }
        self.state.timer = Some(current);

        match timer {
            Some(t) if t.is_enabled => match t.target_time_seconds_from_now {
                Some(secs) if secs >= 0 => TimerAction::Schedule(
                    Duration::from_secs(secs as u64) + Duration::from_millis(1),
                ),
                _ => TimerAction::Cancel,
            },
            _ => TimerAction::Cancel,
        }
    }

    fn history(&mut self, snapshot: &DeviceSnapshot) {
        let Some(history) = &snapshot.history else {
            return;
        };
        if let Some(known) = &self.state.history_ids {
            let fresh = history.iter().take_while(|action| !known.contains(&action.id));
            self.events.extend(fresh.map(Event::from));
        }
        self.state.history_ids = Some(history.iter().map(|a| a.id.clone()).collect());
    }

    fn climate_react(&mut self, snapshot: &DeviceSnapshot) {
        let Some(enabled) = snapshot.climate_react_enabled() else {
            return;
        };
        if self.state.climate_react.is_some_and(|prev| prev != enabled) {
            self.events.push(Event::ClimateReactChanged { enabled });
        }
        self.state.climate_react = Some(enabled);
        self.update(Capability::ClimateReact, Some(enabled));
    }

    fn measurements(&mut self, m: &Measurements) {
        self.update(Capability::Temperature, m.temperature);
        self.update(Capability::Humidity, m.humidity);
        self.update(
            Capability::AirQuality,
            m.pm25.and_then(AirQuality::from_pm25_code).map(|q| q.as_str()),
        );
        self.update(Capability::Co2, m.co2);
        self.update(Capability::Tvoc, m.tvoc);
        self.update(Capability::Iaq, m.iaq);

        let Some(time) = &m.time else {
            return;
        };
        let seconds_ago = time
            .seconds_ago
            .or_else(|| time.time.map(|t| (self.ctx.now - t).num_seconds()));
        let last_seen = time
            .time
            .map(|t| t.with_timezone(&Local).format("%H:%M:%S").to_string());

        self.update(Capability::LastSeenSeconds, seconds_ago);
        self.update(Capability::LastSeen, last_seen.clone());

        let Some(seconds_ago) = seconds_ago else {
            return;
        };
        let threshold = self.ctx.offline_threshold.as_secs() as i64;
        if seconds_ago > threshold {
            if !self.state.offline_latched {
                self.state.offline_latched = true;
                self.events.push(Event::DeviceOffline {
                    seconds_ago,
                    last_seen: last_seen.unwrap_or_default(),
                });
            }
        } else {
            self.state.offline_latched = false;
        }
    }

    fn filters(&mut self, f: &FiltersCleaning) {
        if let Some(active) = f.should_clean_filters {
            let known = self.state.value(Capability::FilterAlarm).cloned();
            let changed = match known {
                Some(prev) => prev != CapabilityValue::Bool(active),
                None => active,
            };
            if self.update(Capability::FilterAlarm, Some(active)) && changed {
                self.events.push(Event::FilterAlarm { active });
            }
        }

        let (Some(run), Some(threshold)) = (
            f.ac_on_seconds_since_last_filters_clean,
            f.filters_clean_seconds_threshold,
        ) else {
            return;
        };
        let left = threshold - run;
        if left > 0 {
            let due = self.ctx.now + TimeDelta::seconds(left);
            self.update(
                Capability::FilterDueDate,
                Some(due.format("%Y-%m-%d").to_string()),
            );
            self.update(Capability::FilterDueHours, Some((left + 3599) / 3600));
        }
        self.update(Capability::FilterRunHours, Some(run / 3600));
    }
}
