use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, trace, warn};

use crate::capability::{
    discovered_capabilities, Capability, CapabilityStore, CapabilityValue, DeviceKind,
    DeviceTraits,
};
use crate::client::SensiboClient;
use crate::config::{DeviceConfig, DeviceSettings};
use crate::model::{CapabilityModel, Choice, ChoiceKind};
use crate::reconcile::{reconcile, PollState, ReconcileContext, TimerAction};
use crate::sink::{dispatch, EventSink};
use crate::types::{AcState, DeviceSnapshot, Event, ThermostatMode, TimerState, TriggerOrigin};
use crate::{Error, Result};

/// Below this a flow's target temperature argument means "leave unchanged".
const MIN_TIMER_TEMPERATURE: f64 = 10.0;
/// Flow argument meaning "leave unchanged".
const NO_OP: &str = "nop";

/// A scheduled state change as configured from an automation flow.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerRequest {
    pub minutes_from_now: i64,
    pub state: AcState,
}

impl TimerRequest {
    pub fn new(minutes_from_now: i64, state: AcState) -> Self {
        Self {
            minutes_from_now,
            state,
        }
    }

    /// Build from raw flow arguments, where `"nop"` leaves a property unset.
    pub fn from_flow_args(
        minutes_from_now: i64,
        on: &str,
        mode: &str,
        fan_level: &str,
        target_temperature: f64,
    ) -> Self {
        let arg = |v: &str| (v != NO_OP).then(|| v.to_string());
        Self::new(
            minutes_from_now,
            AcState {
                on: (on != NO_OP).then(|| on == "on"),
                mode: arg(mode),
                fan_level: arg(fan_level),
                target_temperature: (target_temperature >= MIN_TIMER_TEMPERATURE)
                    .then_some(target_temperature),
                ..Default::default()
            },
        )
    }
}

/// User-issued operations, one per flow action or capability listener.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TurnOn,
    TurnOff,
    SetMode(String),
    SetFanLevel(String),
    SetSwing(String),
    SetHorizontalSwing(String),
    SetTargetTemperature(f64),
    SetThermostatMode(ThermostatMode),
    SetLight(String),
    SetClimateReact(bool),
    SetPureBoost(bool),
    ResetFilterIndicator,
    SetTimer(TimerRequest),
    DeleteTimer,
    SyncPowerState(bool),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::TurnOn => "turn_on",
            Command::TurnOff => "turn_off",
            Command::SetMode(_) => "set_mode",
            Command::SetFanLevel(_) => "set_fan_level",
            Command::SetSwing(_) => "set_swing",
            Command::SetHorizontalSwing(_) => "set_horizontal_swing",
            Command::SetTargetTemperature(_) => "set_target_temperature",
            Command::SetThermostatMode(_) => "set_thermostat_mode",
            Command::SetLight(_) => "set_light",
            Command::SetClimateReact(_) => "set_climate_react",
            Command::SetPureBoost(_) => "set_pure_boost",
            Command::ResetFilterIndicator => "reset_filter_indicator",
            Command::SetTimer(_) => "set_timer",
            Command::DeleteTimer => "delete_timer",
            Command::SyncPowerState(_) => "sync_power_state",
        }
    }
}

/// One registered device: its model, poll bookkeeping and collaborators.
///
/// Owned by a single scheduler task, so nothing in here is locked.
pub(crate) struct Device {
    config: DeviceConfig,
    traits: DeviceTraits,
    capabilities: BTreeSet<Capability>,
    client: SensiboClient,
    model: CapabilityModel,
    poll: PollState,
    sink: Arc<dyn EventSink>,
    store: Arc<dyn CapabilityStore>,
    history_limit: u32,
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        client: SensiboClient,
        sink: Arc<dyn EventSink>,
        store: Arc<dyn CapabilityStore>,
        history_limit: u32,
    ) -> Self {
        let traits = DeviceTraits::for_kind(config.kind);
        Self {
            capabilities: traits.capabilities(),
            traits,
            config,
            client,
            model: CapabilityModel::new(),
            poll: PollState::default(),
            sink,
            store,
            history_limit,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn settings(&self) -> DeviceSettings {
        self.config.settings
    }

    pub fn update_settings(&mut self, settings: DeviceSettings) {
        self.config.settings = settings;
    }

    /// Fetch the capability descriptor and seed the bookkeeping from the
    /// store. A failed fetch leaves validation permissive.
    pub async fn initialize(&mut self) {
        if self.config.kind != DeviceKind::RoomSensor {
            match self.client.fetch_capabilities(self.id()).await {
                Ok(report) => {
                    let found = discovered_capabilities(&report);
                    if !found.is_empty() {
                        debug!(device = %self.id(), capabilities = ?found, "discovered capabilities");
                    }
                    self.capabilities.extend(found);
                    if let Some(remote) = report.remote_capabilities {
                        self.model.set_remote_capabilities(remote);
                    }
                }
                Err(e) => {
                    warn!(device = %self.id(), error = %e, "failed to fetch remote capabilities");
                }
            }
        }

        let id = self.config.device_id.clone();
        let known = self
            .capabilities
            .iter()
            .filter_map(|cap| self.store.get(&id, *cap).map(|v| (*cap, v)));
        self.poll = PollState::seeded(known);
        info!(device = %self.id(), name = %self.config.name, "device initialized");
    }

    /// One snapshot, enriched with the climate react flag and the action
    /// history where the device has them. Those two are best effort.
    pub async fn fetch(&self) -> Result<DeviceSnapshot> {
        if self.config.kind == DeviceKind::RoomSensor {
            return Err(Error::NotSupported("direct polling"));
        }
        let mut snapshot = self.client.fetch_snapshot(self.id()).await?;
        if self.traits.has_climate_react {
            match self.client.get_climate_react_settings(self.id()).await {
                Ok(smart_mode) => snapshot.smart_mode = Some(smart_mode),
                Err(e) => debug!(device = %self.id(), error = %e, "climate react settings unavailable"),
            }
        }
        self.fill_history(&mut snapshot).await;
        Ok(snapshot)
    }

    /// Attach the action history to a snapshot that lacks it. Bulk snapshots
    /// never carry one. Best effort.
    pub async fn fill_history(&self, snapshot: &mut DeviceSnapshot) {
        if snapshot.history.is_some() || !self.traits.can_control() {
            return;
        }
        match self
            .client
            .fetch_action_history(self.id(), self.history_limit)
            .await
        {
            Ok(history) => snapshot.history = Some(history),
            Err(e) => debug!(device = %self.id(), error = %e, "action history unavailable"),
        }
    }

    /// Apply a snapshot: update the model, write changed capabilities and emit
    /// events. Returns what to do with the local countdown.
    pub fn process(&mut self, snapshot: &DeviceSnapshot) -> TimerAction {
        if let Some(ac) = &snapshot.ac_state {
            self.model.merge(ac);
        }
        let ctx = ReconcileContext {
            capabilities: &self.capabilities,
            offline_threshold: self.config.settings.offline_delay(),
            now: Utc::now(),
        };
        let result = reconcile(&self.poll, snapshot, &ctx);
        self.poll = result.state;

        if result.updates.is_empty() && result.events.is_empty() {
            trace!(device = %self.id(), "no changes");
        }
        for update in result.updates {
            self.write(update.capability, update.value);
        }
        for event in &result.events {
            self.emit(event);
        }
        result.timer
    }

    pub fn timer_fired(&self) {
        info!(device = %self.id(), "timer fired");
        self.emit(&Event::TimerFired);
    }

    // -- Commands --

    pub async fn execute(&mut self, command: Command) -> Result<()> {
        debug!(device = %self.id(), command = command.name(), "executing command");
        if !self.traits.can_control() {
            return Err(Error::NotSupported("remote control"));
        }
        match command {
            Command::TurnOn => self.turn_on().await,
            Command::TurnOff => self.turn_off().await,
            Command::SetMode(mode) => self.set_mode(mode).await,
            Command::SetFanLevel(level) => self.set_fan_level(level).await,
            Command::SetSwing(swing) => self.set_swing(swing).await,
            Command::SetHorizontalSwing(swing) => self.set_horizontal_swing(swing).await,
            Command::SetTargetTemperature(t) => self.set_target_temperature(t).await,
            Command::SetThermostatMode(mode) => self.set_thermostat_mode(mode).await,
            Command::SetLight(state) => self.set_light(state).await,
            Command::SetClimateReact(enabled) => self.set_climate_react(enabled).await,
            Command::SetPureBoost(enabled) => self.set_pure_boost(enabled).await,
            Command::ResetFilterIndicator => self.reset_filter_indicator().await,
            Command::SetTimer(request) => self.set_timer(request).await,
            Command::DeleteTimer => self.delete_timer().await,
            Command::SyncPowerState(on) => self.sync_power_state(on).await,
        }
    }

    async fn push(&mut self, partial: AcState) -> Result<()> {
        let state = self
            .client
            .push_ac_state(&self.config.device_id, self.model.ac_state(), &partial)
            .await?;
        self.model.merge(&state);
        Ok(())
    }

    async fn turn_on(&mut self) -> Result<()> {
        self.push(AcState::power(true)).await?;
        self.set(Capability::OnOff, true);
        let mode = match self.model.ac_state().mode.as_deref() {
            Some(m @ ("heat" | "cool" | "auto")) => m.to_string(),
            _ => ThermostatMode::Auto.as_str().to_string(),
        };
        self.set(Capability::ThermostatMode, mode);
        self.emit(&Event::TurnedOn);
        Ok(())
    }

    async fn turn_off(&mut self) -> Result<()> {
        self.push(AcState::power(false)).await?;
        self.set(Capability::OnOff, false);
        self.set(Capability::ThermostatMode, ThermostatMode::Off.as_str());
        self.emit(&Event::TurnedOff);
        Ok(())
    }

    async fn set_mode(&mut self, mode: String) -> Result<()> {
        self.check("mode", &mode, CapabilityModel::validate_mode)?;
        self.push(AcState {
            mode: Some(mode),
            ..Default::default()
        })
        .await?;
        if let Some(derived) = ThermostatMode::derive(self.model.ac_state()) {
            self.set(Capability::ThermostatMode, derived.as_str());
        }
        Ok(())
    }

    async fn set_fan_level(&mut self, level: String) -> Result<()> {
        self.check("fanLevel", &level, CapabilityModel::validate_fan_level)?;
        self.push(AcState {
            fan_level: Some(level.clone()),
            ..Default::default()
        })
        .await?;
        self.set(Capability::FanLevel, level.clone());
        self.set(Capability::PureFanLevel, level);
        Ok(())
    }

    async fn set_swing(&mut self, swing: String) -> Result<()> {
        self.check("swing", &swing, CapabilityModel::validate_swing)?;
        self.push(AcState {
            swing: Some(swing.clone()),
            ..Default::default()
        })
        .await?;
        self.set(Capability::Swing, swing);
        Ok(())
    }

    async fn set_horizontal_swing(&mut self, swing: String) -> Result<()> {
        self.check(
            "horizontalSwing",
            &swing,
            CapabilityModel::validate_horizontal_swing,
        )?;
        self.push(AcState {
            horizontal_swing: Some(swing.clone()),
            ..Default::default()
        })
        .await?;
        self.set(Capability::HorizontalSwing, swing);
        Ok(())
    }

    async fn set_target_temperature(&mut self, temperature: f64) -> Result<()> {
        self.push(AcState {
            target_temperature: Some(temperature),
            ..Default::default()
        })
        .await?;
        self.set(Capability::TargetTemperature, temperature);
        Ok(())
    }

    async fn set_thermostat_mode(&mut self, mode: ThermostatMode) -> Result<()> {
        if mode == ThermostatMode::Off {
            return self.turn_off().await;
        }
        self.check("mode", mode.as_str(), CapabilityModel::validate_mode)?;
        self.push(AcState {
            on: Some(true),
            mode: Some(mode.as_str().to_string()),
            ..Default::default()
        })
        .await?;
        self.set(Capability::OnOff, true);
        self.set(Capability::ThermostatMode, mode.as_str());
        self.emit(&Event::TurnedOn);
        Ok(())
    }

    async fn set_light(&mut self, state: String) -> Result<()> {
        if !self.traits.has_light {
            return Err(Error::NotSupported("light"));
        }
        self.client
            .push_ac_property(&self.config.device_id, "light", json!(state))
            .await?;
        self.model.merge(&AcState {
            light: Some(state),
            ..Default::default()
        });
        Ok(())
    }

    async fn set_climate_react(&mut self, enabled: bool) -> Result<()> {
        if !self.traits.has_climate_react {
            return Err(Error::NotSupported("climate react"));
        }
        self.client
            .set_climate_react_enabled(&self.config.device_id, enabled)
            .await?;
        self.poll.climate_react = Some(enabled);
        self.set(Capability::ClimateReact, enabled);
        Ok(())
    }

    async fn set_pure_boost(&mut self, enabled: bool) -> Result<()> {
        if !self.traits.has_pure_boost {
            return Err(Error::NotSupported("pure boost"));
        }
        self.client
            .set_pure_boost_enabled(&self.config.device_id, enabled)
            .await
    }

    async fn reset_filter_indicator(&mut self) -> Result<()> {
        self.client
            .reset_filter_indicator(&self.config.device_id)
            .await?;
        self.set(Capability::FilterAlarm, false);
        Ok(())
    }

    async fn set_timer(&mut self, request: TimerRequest) -> Result<()> {
        if !self.traits.has_timer {
            return Err(Error::NotSupported("timer"));
        }
        let timer = self
            .client
            .set_scheduled_action(
                &self.config.device_id,
                request.minutes_from_now,
                &request.state,
                self.model.ac_state(),
            )
            .await?;
        self.poll.timer = Some(timer);
        self.emit(&Event::TimerCreated {
            origin: TriggerOrigin::Local,
        });
        Ok(())
    }

    async fn delete_timer(&mut self) -> Result<()> {
        if !self.traits.has_timer {
            return Err(Error::NotSupported("timer"));
        }
        self.client
            .clear_scheduled_action(&self.config.device_id)
            .await?;
        self.poll.timer = Some(TimerState::default());
        self.emit(&Event::TimerDeleted {
            origin: TriggerOrigin::Local,
        });
        Ok(())
    }

    async fn sync_power_state(&mut self, on: bool) -> Result<()> {
        self.client
            .sync_power_state(&self.config.device_id, on)
            .await?;
        self.model.merge(&AcState::power(on));
        self.set(Capability::OnOff, on);
        Ok(())
    }

    // -- Queries --

    pub async fn is_timer_enabled(&self) -> Result<bool> {
        let timer = self.client.fetch_timer(self.id()).await?;
        Ok(timer.is_some_and(|t| t.is_enabled))
    }

    pub fn is_light_on(&self) -> Result<bool> {
        if self.model.all_lights().is_none() {
            return Err(Error::NotSupported("light"));
        }
        Ok(self
            .model
            .ac_state()
            .light
            .as_deref()
            .is_some_and(|l| l != "off"))
    }

    pub fn choices(&self, kind: ChoiceKind, query: &str) -> Vec<Choice> {
        self.model.choices(kind, query)
    }

    // -- Helpers --

    fn check(
        &self,
        property: &'static str,
        value: &str,
        valid: fn(&CapabilityModel, &str) -> bool,
    ) -> Result<()> {
        if valid(&self.model, value) {
            Ok(())
        } else {
            Err(Error::UnsupportedCapability {
                property,
                value: value.to_string(),
            })
        }
    }

    /// Record a value produced by a command, for capabilities the device has.
    fn set(&mut self, capability: Capability, value: impl Into<CapabilityValue>) {
        if !self.capabilities.contains(&capability) {
            return;
        }
        let value = value.into();
        self.poll.capabilities.insert(capability, value.clone());
        self.write(capability, value);
    }

    fn write(&self, capability: Capability, value: CapabilityValue) {
        trace!(device = %self.id(), capability = %capability, value = ?value, "capability update");
        if let Err(e) = self.store.set(self.id(), capability, value) {
            warn!(device = %self.id(), capability = %capability, error = %e, "capability write failed");
        }
    }

    fn emit(&self, event: &Event) {
        dispatch(self.sink.as_ref(), self.id(), event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_request_from_flow_args() {
        let req = TimerRequest::from_flow_args(30, "on", "nop", "high", 5.0);
        assert_eq!(req.minutes_from_now, 30);
        assert_eq!(req.state.on, Some(true));
        assert_eq!(req.state.mode, None);
        assert_eq!(req.state.fan_level.as_deref(), Some("high"));
        assert_eq!(req.state.target_temperature, None);

        let req = TimerRequest::from_flow_args(10, "off", "cool", "nop", 21.0);
        assert_eq!(req.state.on, Some(false));
        assert_eq!(req.state.mode.as_deref(), Some("cool"));
        assert_eq!(req.state.target_temperature, Some(21.0));
    }

    #[test]
    fn all_nop_args_give_an_empty_state() {
        let req = TimerRequest::from_flow_args(10, "nop", "nop", "nop", 0.0);
        assert!(req.state.is_empty());
    }
}
