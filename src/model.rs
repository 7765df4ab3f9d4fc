use crate::types::{AcState, ModeCapabilities, RemoteCapabilities};

const DEFAULT_MODES: &[&str] = &["cool", "heat", "fan", "auto", "dry"];
const DEFAULT_FAN_LEVELS: &[&str] = &["auto", "high", "medium", "low"];
const DEFAULT_SWINGS: &[&str] = &["stopped", "fixedBottom", "fixedTop", "rangeTop", "rangeFull"];
const DEFAULT_HORIZONTAL_SWINGS: &[&str] =
    &["stopped", "fixedLeft", "fixedRight", "rangeCenter", "rangeFull"];
const DEFAULT_LIGHTS: &[&str] = &["on", "off"];

/// Last known AC state of one device plus the descriptor it is validated
/// against.
///
/// Validation is permissive: a missing descriptor, a mode the descriptor
/// does not list, or an option set it does not carry all accept any value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityModel {
    ac_state: AcState,
    remote: Option<RemoteCapabilities>,
}

/// Which option set a choice list is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceKind {
    Mode,
    FanLevel,
    Swing,
    HorizontalSwing,
    Light,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub id: String,
    pub name: String,
}

impl CapabilityModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ac_state(&self) -> &AcState {
        &self.ac_state
    }

    pub fn remote_capabilities(&self) -> Option<&RemoteCapabilities> {
        self.remote.as_ref()
    }

    pub fn set_remote_capabilities(&mut self, remote: RemoteCapabilities) {
        self.remote = Some(remote);
    }

    pub fn merge(&mut self, partial: &AcState) {
        self.ac_state.merge(partial);
    }

    pub fn validate_mode(&self, mode: &str) -> bool {
        match &self.remote {
            Some(remote) if !remote.modes.is_empty() => remote.modes.contains_key(mode),
            _ => true,
        }
    }

    pub fn validate_fan_level(&self, fan_level: &str) -> bool {
        self.allowed_in_current_mode(fan_level, |m| m.fan_levels.as_deref())
    }

    pub fn validate_swing(&self, swing: &str) -> bool {
        self.allowed_in_current_mode(swing, |m| m.swing.as_deref())
    }

    pub fn validate_horizontal_swing(&self, swing: &str) -> bool {
        self.allowed_in_current_mode(swing, |m| m.horizontal_swing.as_deref())
    }

    fn allowed_in_current_mode(
        &self,
        value: &str,
        options: impl Fn(&ModeCapabilities) -> Option<&[String]>,
    ) -> bool {
        self.current_mode_capabilities()
            .and_then(options)
            .is_none_or(|allowed| allowed.iter().any(|v| v == value))
    }

    fn current_mode_capabilities(&self) -> Option<&ModeCapabilities> {
        let mode = self.ac_state.mode.as_deref()?;
        self.remote.as_ref()?.modes.get(mode)
    }

    pub fn modes(&self) -> Option<Vec<String>> {
        let remote = self.remote.as_ref()?;
        if remote.modes.is_empty() {
            return None;
        }
        Some(remote.modes.keys().cloned().collect())
    }

    pub fn all_fan_levels(&self) -> Option<Vec<String>> {
        self.collect_options(|m| m.fan_levels.as_deref())
    }

    pub fn all_swings(&self) -> Option<Vec<String>> {
        self.collect_options(|m| m.swing.as_deref())
    }

    pub fn all_horizontal_swings(&self) -> Option<Vec<String>> {
        self.collect_options(|m| m.horizontal_swing.as_deref())
    }

    pub fn all_lights(&self) -> Option<Vec<String>> {
        self.collect_options(|m| m.light.as_deref())
    }

    /// Union over all modes, first occurrence wins the position.
    fn collect_options(
        &self,
        options: impl Fn(&ModeCapabilities) -> Option<&[String]>,
    ) -> Option<Vec<String>> {
        let mut all: Vec<String> = Vec::new();
        for mode in self.remote.as_ref()?.modes.values() {
            for value in options(mode).unwrap_or_default() {
                if !all.contains(value) {
                    all.push(value.clone());
                }
            }
        }
        (!all.is_empty()).then_some(all)
    }

    /// Autocomplete entries for `kind`, matching `query` case-insensitively
    /// against the display name.
    pub fn choices(&self, kind: ChoiceKind, query: &str) -> Vec<Choice> {
        let (known, defaults) = match kind {
            ChoiceKind::Mode => (self.modes(), DEFAULT_MODES),
            ChoiceKind::FanLevel => (self.all_fan_levels(), DEFAULT_FAN_LEVELS),
            ChoiceKind::Swing => (self.all_swings(), DEFAULT_SWINGS),
            ChoiceKind::HorizontalSwing => {
                (self.all_horizontal_swings(), DEFAULT_HORIZONTAL_SWINGS)
            }
            ChoiceKind::Light => (self.all_lights(), DEFAULT_LIGHTS),
        };
        let ids = known.unwrap_or_else(|| defaults.iter().map(|s| s.to_string()).collect());
        let query = query.to_lowercase();
        ids.into_iter()
            .map(|id| Choice {
                name: display_name(&id),
                id,
            })
            .filter(|c| c.name.to_lowercase().contains(&query))
            .collect()
    }
}

fn display_name(id: &str) -> String {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    let name: String = first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect();
    name.replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn descriptor() -> RemoteCapabilities {
        let mut modes = BTreeMap::new();
        modes.insert(
            "cool".to_string(),
            ModeCapabilities {
                fan_levels: Some(vec!["low".into(), "high".into()]),
                swing: Some(vec!["stopped".into(), "rangeFull".into()]),
                horizontal_swing: None,
                light: Some(vec!["on".into(), "off".into()]),
            },
        );
        modes.insert(
            "heat".to_string(),
            ModeCapabilities {
                fan_levels: Some(vec!["low".into(), "medium_high".into()]),
                ..Default::default()
            },
        );
        RemoteCapabilities { modes }
    }

    fn model_in(mode: &str) -> CapabilityModel {
        let mut model = CapabilityModel::new();
        model.set_remote_capabilities(descriptor());
        model.merge(&AcState {
            mode: Some(mode.into()),
            ..Default::default()
        });
        model
    }

    #[test]
    fn merge_is_idempotent() {
        let mut model = CapabilityModel::new();
        model.merge(&AcState {
            on: Some(true),
            target_temperature: Some(22.0),
            ..Default::default()
        });
        let partial = AcState {
            fan_level: Some("high".into()),
            ..Default::default()
        };
        model.merge(&partial);
        let once = model.clone();
        model.merge(&partial);
        assert_eq!(model, once);
        assert_eq!(model.ac_state().on, Some(true));
        assert_eq!(model.ac_state().fan_level.as_deref(), Some("high"));
    }

    #[test]
    fn permissive_without_descriptor() {
        let model = CapabilityModel::new();
        for value in ["cool", "", "turbo", "anything at all"] {
            assert!(model.validate_mode(value));
            assert!(model.validate_fan_level(value));
            assert!(model.validate_swing(value));
            assert!(model.validate_horizontal_swing(value));
        }
    }

    #[test]
    fn validation_is_scoped_to_current_mode() {
        let cool = model_in("cool");
        assert!(cool.validate_mode("heat"));
        assert!(!cool.validate_mode("dry"));
        assert!(cool.validate_fan_level("high"));
        assert!(!cool.validate_fan_level("medium_high"));
        assert!(!cool.validate_swing("fixedTop"));
        // no horizontal swing set for cool
        assert!(cool.validate_horizontal_swing("rangeCenter"));

        let heat = model_in("heat");
        assert!(heat.validate_fan_level("medium_high"));
        assert!(!heat.validate_fan_level("high"));
        assert!(heat.validate_swing("fixedTop"));
    }

    #[test]
    fn unlisted_current_mode_is_permissive() {
        let model = model_in("dry");
        assert!(model.validate_fan_level("whatever"));
    }

    #[test]
    fn fan_levels_are_deduplicated_across_modes() {
        let model = model_in("cool");
        assert_eq!(
            model.all_fan_levels(),
            Some(vec!["low".to_string(), "high".to_string(), "medium_high".to_string()])
        );
        assert_eq!(model.all_horizontal_swings(), None);
    }

    #[test]
    fn choices_fall_back_to_defaults() {
        let model = CapabilityModel::new();
        let modes = model.choices(ChoiceKind::Mode, "");
        assert_eq!(modes.len(), 5);
        assert_eq!(modes[0], Choice { id: "cool".into(), name: "Cool".into() });

        let swings = model.choices(ChoiceKind::Swing, "FIXED");
        let ids: Vec<_> = swings.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["fixedBottom", "fixedTop"]);
        assert_eq!(swings[0].name, "Fixedbottom");
    }

    #[test]
    fn choice_names_replace_underscores() {
        let model = model_in("heat");
        let levels = model.choices(ChoiceKind::FanLevel, "medium");
        assert_eq!(levels, vec![Choice { id: "medium_high".into(), name: "Medium high".into() }]);
    }

    #[test]
    fn lights_are_known_from_any_mode() {
        assert_eq!(model_in("heat").all_lights().map(|l| l.len()), Some(2));
        assert_eq!(CapabilityModel::new().all_lights(), None);
        let lights = CapabilityModel::new().choices(ChoiceKind::Light, "o");
        assert_eq!(lights.len(), 2);
    }
}
