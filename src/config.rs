//! Manager configuration.

use serde::{Deserialize, Serialize};

use crate::protocol::{PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};

/// Settings shared by a [`WidgetManager`](crate::manager::WidgetManager) and
/// the models it creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Comm target that widget comms are opened against.
    #[serde(default = "default_comm_target")]
    pub comm_target_name: String,
    /// Comm target of the version handshake side channel.
    #[serde(default = "default_version_target")]
    pub version_target_name: String,
    /// How long the version handshake waits for the remote requirement.
    #[serde(default = "default_version_timeout_ms")]
    pub version_timeout_ms: u64,
    /// Version checked against the requirement sent by the remote peer.
    #[serde(default = "default_frontend_version")]
    pub frontend_version: String,
    /// Protocol version advertised in comm-open metadata.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// When set, `display` messages are left to an output area and ignored.
    #[serde(default)]
    pub display_with_output: bool,
    /// Throttle limit used when a model has no usable `msg_throttle`.
    #[serde(default = "default_msg_throttle")]
    pub default_msg_throttle: usize,
}

fn default_comm_target() -> String {
    "jupyter.widget".to_string()
}
fn default_version_target() -> String {
    "jupyter.widget.version".to_string()
}
fn default_version_timeout_ms() -> u64 {
    3000
}
fn default_frontend_version() -> String {
    format!("{}.{}.0", PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR)
}
fn default_protocol_version() -> String {
    format!("{}.{}.0", PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR)
}
fn default_msg_throttle() -> usize {
    1
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            comm_target_name: default_comm_target(),
            version_target_name: default_version_target(),
            version_timeout_ms: default_version_timeout_ms(),
            frontend_version: default_frontend_version(),
            protocol_version: default_protocol_version(),
            display_with_output: false,
            default_msg_throttle: default_msg_throttle(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `WIDGET_SYNC_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(target) = lookup("WIDGET_SYNC_COMM_TARGET") {
            config.comm_target_name = target;
        }
        if let Some(raw) = lookup("WIDGET_SYNC_VERSION_TIMEOUT_MS") {
            match raw.parse() {
                Ok(ms) => config.version_timeout_ms = ms,
                Err(_) => log::warn!("Ignoring WIDGET_SYNC_VERSION_TIMEOUT_MS={:?}", raw),
            }
        }
        if let Some(raw) = lookup("WIDGET_SYNC_DISPLAY_WITH_OUTPUT") {
            config.display_with_output = matches!(raw.as_str(), "1" | "true" | "yes");
        }
        if let Some(raw) = lookup("WIDGET_SYNC_MSG_THROTTLE") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => config.default_msg_throttle = n,
                _ => log::warn!("Ignoring WIDGET_SYNC_MSG_THROTTLE={:?}", raw),
            }
        }

        config
    }

    pub fn with_comm_target(mut self, target: impl Into<String>) -> Self {
        self.comm_target_name = target.into();
        self
    }

    pub fn with_version_timeout_ms(mut self, ms: u64) -> Self {
        self.version_timeout_ms = ms;
        self
    }

    pub fn with_frontend_version(mut self, version: impl Into<String>) -> Self {
        self.frontend_version = version.into();
        self
    }

    pub fn with_display_with_output(mut self, enabled: bool) -> Self {
        self.display_with_output = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.comm_target_name, "jupyter.widget");
        assert_eq!(config.version_target_name, "jupyter.widget.version");
        assert_eq!(config.version_timeout_ms, 3000);
        assert_eq!(config.default_msg_throttle, 1);
        assert!(!config.display_with_output);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{"display_with_output": true}"#).unwrap();
        assert!(config.display_with_output);
        assert_eq!(config.comm_target_name, "jupyter.widget");
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("WIDGET_SYNC_COMM_TARGET", "custom.target"),
            ("WIDGET_SYNC_VERSION_TIMEOUT_MS", "250"),
            ("WIDGET_SYNC_MSG_THROTTLE", "0"),
            ("WIDGET_SYNC_DISPLAY_WITH_OUTPUT", "true"),
        ]
        .into_iter()
        .collect();
        let config = ManagerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.comm_target_name, "custom.target");
        assert_eq!(config.version_timeout_ms, 250);
        assert_eq!(config.default_msg_throttle, 1);
        assert!(config.display_with_output);
    }
}
