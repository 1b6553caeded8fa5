//! Node configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/mtr/node.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `node.node_id`
//!
//! Everything else has defaults matching the Matter-recommended values.

use std::path::Path;
use std::time::Duration;

use mtr_im::InteractionConfig;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub schema_version: u32,
    pub node_id: u64,
    pub udp: UdpConfig,
    pub store: StoreConfig,
    pub interaction: InteractionConfig,
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    node: Option<RawNodeSection>,
    udp: Option<RawUdpConfig>,
    store: Option<RawStoreConfig>,
    interaction: Option<RawInteractionConfig>,
}

#[derive(Debug, Deserialize)]
struct RawNodeSection {
    node_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawUdpConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawInteractionConfig {
    max_paths_per_invoke: Option<u16>,
    min_interval_floor_s: Option<u64>,
    subscription_max_interval_limit_s: Option<u64>,
    timed_request_timeout_ms: Option<u64>,
    failsafe_response_timeout_ms: Option<u64>,
    resubscribe_connect_timeout_ms: Option<u64>,
    peer_response_timeout_ms: Option<u64>,
    read_path_budget: Option<usize>,
    allow_unsecured_sessions: Option<bool>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<NodeConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load node config from the default path `/etc/mtr/node.toml`.
pub fn load_config() -> Result<NodeConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/mtr/node.toml"))
}

pub fn load_config_from_str(toml_str: &str) -> Result<NodeConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let node = raw
        .node
        .ok_or_else(|| ConfigError::MissingField("node".to_owned()))?;
    let node_id = node
        .node_id
        .ok_or_else(|| ConfigError::MissingField("node.node_id".to_owned()))?;

    let udp = UdpConfig {
        bind: raw
            .udp
            .and_then(|u| u.bind)
            .unwrap_or_else(|| "0.0.0.0:5540".to_owned()),
    };

    let store = StoreConfig {
        sqlite_path: raw
            .store
            .and_then(|s| s.sqlite_path)
            .unwrap_or_else(|| "/var/lib/mtr/node.sqlite3".to_owned()),
    };

    let defaults = InteractionConfig::default();
    let interaction = match raw.interaction {
        Some(i) => {
            let max_paths = i.max_paths_per_invoke.unwrap_or(defaults.max_paths_per_invoke);
            if max_paths == 0 {
                return Err(ConfigError::InvalidValue(
                    "interaction.max_paths_per_invoke must be at least 1".to_owned(),
                ));
            }
            InteractionConfig {
                max_paths_per_invoke: max_paths,
                default_min_interval_floor: i
                    .min_interval_floor_s
                    .map_or(defaults.default_min_interval_floor, Duration::from_secs),
                subscription_max_interval_limit: i
                    .subscription_max_interval_limit_s
                    .map_or(defaults.subscription_max_interval_limit, Duration::from_secs),
                timed_request_timeout: i
                    .timed_request_timeout_ms
                    .map_or(defaults.timed_request_timeout, Duration::from_millis),
                failsafe_response_timeout: i
                    .failsafe_response_timeout_ms
                    .map_or(defaults.failsafe_response_timeout, Duration::from_millis),
                resubscribe_connect_timeout: i
                    .resubscribe_connect_timeout_ms
                    .map_or(defaults.resubscribe_connect_timeout, Duration::from_millis),
                peer_response_timeout: i
                    .peer_response_timeout_ms
                    .map_or(defaults.peer_response_timeout, Duration::from_millis),
                read_path_budget: i.read_path_budget.unwrap_or(defaults.read_path_budget),
                allow_unsecured_sessions: i
                    .allow_unsecured_sessions
                    .unwrap_or(defaults.allow_unsecured_sessions),
            }
        }
        None => defaults,
    };

    Ok(NodeConfig {
        schema_version,
        node_id,
        udp,
        store,
        interaction,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
schema_version = 1

[node]
node_id = 42
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(cfg.node_id, 42);
        assert_eq!(cfg.udp.bind, "0.0.0.0:5540");
        assert_eq!(cfg.interaction.max_paths_per_invoke, 9);
        assert_eq!(
            cfg.interaction.timed_request_timeout,
            Duration::from_secs(10)
        );
        assert!(!cfg.interaction.allow_unsecured_sessions);
    }

    #[test]
    fn missing_node_id_is_rejected() {
        let err = load_config_from_str("schema_version = 1\n[node]\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "node.node_id"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = load_config_from_str("schema_version = 2\n[node]\nnode_id = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn interaction_overrides_apply() {
        let cfg = load_config_from_str(
            r#"
schema_version = 1

[node]
node_id = 7

[interaction]
max_paths_per_invoke = 4
timed_request_timeout_ms = 5000
allow_unsecured_sessions = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.interaction.max_paths_per_invoke, 4);
        assert_eq!(
            cfg.interaction.timed_request_timeout,
            Duration::from_secs(5)
        );
        assert!(cfg.interaction.allow_unsecured_sessions);
    }

    #[test]
    fn zero_invoke_budget_is_rejected() {
        let err = load_config_from_str(
            "schema_version = 1\n[node]\nnode_id = 7\n[interaction]\nmax_paths_per_invoke = 0\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}
