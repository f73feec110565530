//! Per-path proxy behaviour
//!
//! Rules are matched in declaration order against the request URI,
//! case-insensitively and anchored at the start. The first match wins; an
//! unmatched URI gets [`Behaviour::RemoteIfMissing`].

use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// Default device API rule.
pub const DEVICES_PATTERN: &str = r"/api/v1\.0/devices.*";
/// Default firmware version rule.
pub const VERSION_PATTERN: &str = r"/fwUpgrade/PR06549/version\.txt";
/// Default outside temperature rule.
pub const WEB_TEMPERATURE_PATTERN: &str = r"/WifiBoxInterface_vokera/getWebTemperature\.php";

/// How a request is split between the local app and the upstream service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Behaviour {
    /// Local app only
    OnlyLocal,
    /// Upstream only, response passed through unmodified
    OnlyRemote,
    /// Both, local response returned
    LocalFirst,
    /// Both, upstream response returned
    RemoteFirst,
    /// `LocalFirst` when the local app has the route, `OnlyRemote` otherwise
    RemoteIfMissing,
}

impl Behaviour {
    pub fn name(self) -> &'static str {
        match self {
            Behaviour::OnlyLocal => "ONLY_LOCAL",
            Behaviour::OnlyRemote => "ONLY_REMOTE",
            Behaviour::LocalFirst => "LOCAL_FIRST",
            Behaviour::RemoteFirst => "REMOTE_FIRST",
            Behaviour::RemoteIfMissing => "REMOTE_IF_MISSING",
        }
    }

    /// Whether both sides are consulted and compared.
    pub fn compares(self) -> bool {
        matches!(self, Behaviour::LocalFirst | Behaviour::RemoteFirst)
    }

    /// Whether the upstream response is what the client receives.
    pub fn remote_primary(self) -> bool {
        matches!(self, Behaviour::OnlyRemote | Behaviour::RemoteFirst)
    }
}

impl fmt::Display for Behaviour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compiled `(pattern, behaviour)` pair.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pattern: String,
    regex: Regex,
    behaviour: Behaviour,
}

impl PolicyRule {
    pub fn new(pattern: impl Into<String>, behaviour: Behaviour) -> Result<Self> {
        let pattern = pattern.into();
        let regex = RegexBuilder::new(&format!("^(?:{})", pattern)).case_insensitive(true).build()?;
        Ok(Self { pattern, regex, behaviour })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn behaviour(&self) -> Behaviour {
        self.behaviour
    }

    pub fn matches(&self, uri: &str) -> bool {
        self.regex.is_match(uri)
    }
}

/// Ordered rule list.
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    rules: Vec<PolicyRule>,
}

impl PolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock rules. With a weather location the outside temperature
    /// endpoint is answered locally first.
    pub fn with_defaults(weather_location: bool) -> Result<Self> {
        let mut table = Self::new();
        table.push(DEVICES_PATTERN, Behaviour::OnlyLocal)?;
        table.push(VERSION_PATTERN, Behaviour::LocalFirst)?;
        table.push(WEB_TEMPERATURE_PATTERN, Behaviour::RemoteFirst)?;
        if weather_location {
            table.upgrade(WEB_TEMPERATURE_PATTERN, Behaviour::LocalFirst);
        }
        Ok(table)
    }

    /// Append a rule after the existing ones.
    pub fn push(&mut self, pattern: impl Into<String>, behaviour: Behaviour) -> Result<()> {
        self.rules.push(PolicyRule::new(pattern, behaviour)?);
        Ok(())
    }

    /// Insert a rule ahead of the existing ones.
    pub fn prepend(&mut self, pattern: impl Into<String>, behaviour: Behaviour) -> Result<()> {
        self.rules.insert(0, PolicyRule::new(pattern, behaviour)?);
        Ok(())
    }

    /// Change the behaviour of the rule declared with `pattern`.
    pub fn upgrade(&mut self, pattern: &str, behaviour: Behaviour) -> bool {
        match self.rules.iter_mut().find(|rule| rule.pattern == pattern) {
            Some(rule) => {
                debug!("Policy {} {} -> {}", pattern, rule.behaviour, behaviour);
                rule.behaviour = behaviour;
                true
            }
            None => false,
        }
    }

    /// Behaviour for a request URI.
    pub fn behaviour_for(&self, uri: &str) -> Behaviour {
        self.rules
            .iter()
            .find(|rule| rule.matches(uri))
            .map(PolicyRule::behaviour)
            .unwrap_or(Behaviour::RemoteIfMissing)
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_rules() {
        let table = PolicyTable::with_defaults(false).unwrap();
        assert_eq!(table.behaviour_for("/api/v1.0/devices/42"), Behaviour::OnlyLocal);
        assert_eq!(table.behaviour_for("/API/V1.0/DEVICES"), Behaviour::OnlyLocal);
        assert_eq!(table.behaviour_for("/fwUpgrade/PR06549/version.txt"), Behaviour::LocalFirst);
        assert_eq!(
            table.behaviour_for("/WifiBoxInterface_vokera/getWebTemperature.php?lat=1"),
            Behaviour::RemoteFirst
        );
        assert_eq!(table.behaviour_for("/index.html"), Behaviour::RemoteIfMissing);
    }

    #[test]
    fn weather_location_upgrades_web_temperature() {
        let table = PolicyTable::with_defaults(true).unwrap();
        assert_eq!(
            table.behaviour_for("/WifiBoxInterface_vokera/getWebTemperature.php"),
            Behaviour::LocalFirst
        );
    }

    #[test]
    fn patterns_are_anchored_at_start() {
        let table = PolicyTable::with_defaults(false).unwrap();
        assert_eq!(table.behaviour_for("/prefix/api/v1.0/devices"), Behaviour::RemoteIfMissing);
    }

    #[test]
    fn first_match_wins() {
        let mut table = PolicyTable::with_defaults(false).unwrap();
        table.prepend("/api/.*", Behaviour::OnlyRemote).unwrap();
        assert_eq!(table.behaviour_for("/api/v1.0/devices/1"), Behaviour::OnlyRemote);
        assert!(!table.upgrade("/missing", Behaviour::OnlyLocal));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = PolicyRule::new("(", Behaviour::OnlyLocal).unwrap_err();
        assert!(matches!(err, crate::GatewayError::Config { .. }));
    }

    #[test]
    fn only_shadowing_behaviours_compare() {
        assert!(Behaviour::LocalFirst.compares());
        assert!(Behaviour::RemoteFirst.compares());
        assert!(!Behaviour::OnlyLocal.compares());
        assert!(!Behaviour::OnlyRemote.compares());
        assert!(!Behaviour::RemoteIfMissing.compares());
    }

    #[test]
    fn behaviour_names_round_trip_through_serde() {
        let yaml = serde_yaml_ng::to_string(&Behaviour::RemoteIfMissing).unwrap();
        assert_eq!(yaml.trim(), "REMOTE_IF_MISSING");
        let parsed: Behaviour = serde_yaml_ng::from_str("LOCAL_FIRST").unwrap();
        assert_eq!(parsed, Behaviour::LocalFirst);
    }

    proptest! {
        #[test]
        fn unmatched_paths_fall_back(path in "/[a-z]{1,8}/[a-z0-9]{0,8}") {
            let table = PolicyTable::with_defaults(false).unwrap();
            prop_assert_eq!(table.behaviour_for(&path), Behaviour::RemoteIfMissing);
        }
    }
}
