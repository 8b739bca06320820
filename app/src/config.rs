//! Devnet configuration.
//!
//! Loaded once from YAML at startup, optionally patched from the environment,
//! and validated before any node is launched. Durations are written the
//! human way (`10s`, `500ms`, `1m`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration validation error: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration validation trait
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default, rename = "healthcheck")]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub chain_id: u64,
    /// Falls back to the chain id when unset.
    #[serde(default)]
    pub network_id: u64,
}

impl NetworkConfig {
    pub fn effective_network_id(&self) -> u64 {
        if self.network_id == 0 {
            self.chain_id
        } else {
            self.network_id
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub name: String,
    /// P2P listening port. When zero the discovery port is used instead.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub rpc_port: u16,
    #[serde(default)]
    pub ws_port: u16,
    #[serde(default)]
    pub discovery_port: u16,
    #[serde(default)]
    pub miner: bool,
    /// Block reward beneficiary. Defaults to the node's keystore account.
    #[serde(default)]
    pub etherbase: String,
}

impl NodeConfig {
    pub fn p2p_port(&self) -> u16 {
        if self.port != 0 {
            self.port
        } else {
            self.discovery_port
        }
    }

    /// The configured beneficiary, if any.
    pub fn etherbase_address(&self) -> Result<Option<engine::Address>, ConfigError> {
        let raw = self.etherbase.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        engine::Address::from_str(raw.trim_start_matches("0x"))
            .map(Some)
            .map_err(|e| {
                ConfigError::invalid(format!("nodes.{}.etherbase", self.name), e.to_string())
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub threads: usize,
    pub gas_price: u64,
    pub monitor_interval: String,
    /// Restart the miner on nodes that stopped mining behind our back.
    pub remediate: bool,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            gas_price: 1,
            monitor_interval: "30s".to_string(),
            remediate: false,
        }
    }
}

impl MiningConfig {
    pub fn monitor_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("mining.monitor_interval", &self.monitor_interval)
    }
}

/// Upper bound for `healthcheck.retries`.
pub const MAX_HEALTH_RETRIES: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            retries: 3,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("healthcheck.interval", &self.interval)
    }

    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("healthcheck.timeout", &self.timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: PathBuf,
    pub data_dir: PathBuf,
    pub host: String,
    pub password: String,
    pub startup_timeout: String,
    /// Pause between start-up and peering.
    pub settle_delay: String,
    /// Pause between peering and mining.
    pub peer_settle_delay: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(engine::geth::DEFAULT_GETH_BINARY),
            data_dir: PathBuf::from("data"),
            host: "127.0.0.1".to_string(),
            password: engine::geth::DEFAULT_PASSWORD.to_string(),
            startup_timeout: "60s".to_string(),
            settle_delay: "5s".to_string(),
            peer_settle_delay: "3s".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn startup_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("engine.startup_timeout", &self.startup_timeout)
    }

    pub fn settle_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration("engine.settle_delay", &self.settle_delay)
    }

    pub fn peer_settle_delay(&self) -> Result<Duration, ConfigError> {
        parse_duration("engine.peer_settle_delay", &self.peer_settle_delay)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub port: Option<u16>,
}

pub fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ConfigError::invalid(field, format!("`{value}`: {e}")))
}

impl Config {
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    /// Read, parse and validate a configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, None)
    }

    /// Like [`Config::load_from_file`] but applies `<prefix>*` environment
    /// overrides before validating.
    pub fn load_with_overrides<P: AsRef<Path>>(
        path: P,
        env_prefix: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::FileNotFound {
                path: path.display().to_string(),
            },
            _ => ConfigError::ParseError {
                reason: format!("reading {}: {e}", path.display()),
            },
        })?;

        let mut config = Self::from_yaml_str(&contents)?;
        if let Some(prefix) = env_prefix {
            config.apply_env_overrides(prefix, |key| std::env::var(key).ok())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Override selected settings from `lookup("<prefix>NAME")`.
    pub fn apply_env_overrides<F>(&mut self, prefix: &str, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{prefix}{name}"));

        if let Some(binary) = var("GETH_BINARY") {
            self.engine.binary = PathBuf::from(binary);
        }
        if let Some(data_dir) = var("DATA_DIR") {
            self.engine.data_dir = PathBuf::from(data_dir);
        }
        if let Some(chain_id) = var("CHAIN_ID") {
            self.network.chain_id = chain_id.parse().map_err(|_| {
                ConfigError::invalid(format!("{prefix}CHAIN_ID"), "must be an unsigned integer")
            })?;
        }
        if let Some(port) = var("METRICS_PORT") {
            self.metrics.port = Some(port.parse().map_err(|_| {
                ConfigError::invalid(format!("{prefix}METRICS_PORT"), "must be a port number")
            })?);
        }
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.name == name)
    }
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.network.chain_id == 0 {
            return Err(ConfigError::invalid("network.chain_id", "chain ID must be set"));
        }
        if self.nodes.is_empty() {
            return Err(ConfigError::invalid("nodes", "at least one node must be configured"));
        }

        let mut names = HashSet::new();
        for (index, node) in self.nodes.iter().enumerate() {
            node.validate().map_err(|e| match e {
                ConfigError::ValidationError { field, reason } if node.name.is_empty() => {
                    ConfigError::invalid(format!("nodes[{index}].{field}"), reason)
                }
                other => other,
            })?;
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::invalid(
                    format!("nodes.{}", node.name),
                    "node names must be unique",
                ));
            }
        }

        for (field, period) in [
            ("mining.monitor_interval", self.mining.monitor_interval()?),
            ("healthcheck.interval", self.health_check.interval()?),
        ] {
            if period.is_zero() {
                return Err(ConfigError::invalid(field, "interval must be greater than zero"));
            }
        }
        self.health_check.timeout()?;
        if self.health_check.retries > MAX_HEALTH_RETRIES {
            return Err(ConfigError::invalid(
                "healthcheck.retries",
                format!("at most {MAX_HEALTH_RETRIES} retries are allowed"),
            ));
        }
        self.engine.startup_timeout()?;
        self.engine.settle_delay()?;
        self.engine.peer_settle_delay()?;
        Ok(())
    }
}

impl Validate for NodeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "node name is required"));
        }
        if self.rpc_port == 0 {
            return Err(ConfigError::invalid(
                format!("nodes.{}.rpc_port", self.name),
                "RPC port is required",
            ));
        }
        self.etherbase_address()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
network:
  chain_id: 1337
  network_id: 1337
nodes:
  - name: node1
    port: 30303
    rpc_port: 8545
    ws_port: 8546
    discovery_port: 30301
    miner: true
  - name: node2
    port: 30304
    rpc_port: 8547
    miner: false
mining:
  threads: 2
  gas_price: 1000000000
healthcheck:
  interval: 15s
  timeout: 500ms
  retries: 2
"#;

    fn sample() -> Config {
        Config::from_yaml_str(SAMPLE).unwrap()
    }

    #[test]
    fn parses_sample_with_defaults() {
        let config = sample();
        assert_eq!(config.network.chain_id, 1337);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].ws_port, 0);
        assert_eq!(config.mining.threads, 2);
        assert_eq!(config.mining.monitor_interval().unwrap(), Duration::from_secs(30));
        assert!(!config.mining.remediate);
        assert_eq!(config.health_check.interval().unwrap(), Duration::from_secs(15));
        assert_eq!(config.health_check.timeout().unwrap(), Duration::from_millis(500));
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.metrics.port, None);
        config.validate().unwrap();
    }

    #[test]
    fn network_id_falls_back_to_chain_id() {
        let network = NetworkConfig {
            chain_id: 42,
            network_id: 0,
        };
        assert_eq!(network.effective_network_id(), 42);
    }

    #[test]
    fn p2p_port_falls_back_to_discovery_port() {
        let node = NodeConfig {
            name: "n".to_string(),
            discovery_port: 30301,
            rpc_port: 8545,
            ..Default::default()
        };
        assert_eq!(node.p2p_port(), 30301);
    }

    #[test]
    fn rejects_missing_chain_id() {
        let mut config = sample();
        config.network.chain_id = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "network.chain_id"
        ));
    }

    #[test]
    fn rejects_empty_node_list() {
        let mut config = sample();
        config.nodes.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "nodes"
        ));
    }

    #[test]
    fn rejects_unnamed_node() {
        let mut config = sample();
        config.nodes[1].name = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "nodes[1].name"
        ));
    }

    #[test]
    fn rejects_node_without_rpc_port() {
        let mut config = sample();
        config.nodes[0].rpc_port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "nodes.node1.rpc_port"
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut config = sample();
        config.nodes[1].name = "node1".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        let mut config = sample();
        config.health_check.timeout = "soon".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "healthcheck.timeout"
        ));
    }

    #[test]
    fn rejects_excessive_retries() {
        let mut config = sample();
        config.health_check.retries = u32::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "healthcheck.retries"
        ));

        config.health_check.retries = MAX_HEALTH_RETRIES;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_interval() {
        let mut config = sample();
        config.mining.monitor_interval = "0s".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field, .. }) if field == "mining.monitor_interval"
        ));
    }

    #[test]
    fn rejects_bad_etherbase() {
        let mut config = sample();
        config.nodes[0].etherbase = "0x1234".to_string();
        assert!(config.validate().is_err());

        config.nodes[0].etherbase = "0x00000000000000000000000000000000000000aa".to_string();
        config.validate().unwrap();
        assert_eq!(
            config.nodes[0].etherbase_address().unwrap(),
            Some(engine::Address::from_low_u64_be(0xaa))
        );
    }

    #[test]
    fn env_overrides_apply_with_prefix() {
        let env: HashMap<String, String> = [
            ("DEVNET_GETH_BINARY", "/opt/geth"),
            ("DEVNET_CHAIN_ID", "99"),
            ("DEVNET_METRICS_PORT", "9100"),
            ("OTHER_DATA_DIR", "/ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let mut config = sample();
        config
            .apply_env_overrides("DEVNET_", |key| env.get(key).cloned())
            .unwrap();
        assert_eq!(config.engine.binary, PathBuf::from("/opt/geth"));
        assert_eq!(config.engine.data_dir, PathBuf::from("data"));
        assert_eq!(config.network.chain_id, 99);
        assert_eq!(config.metrics.port, Some(9100));
    }

    #[test]
    fn env_override_rejects_garbage() {
        let mut config = sample();
        let err = config
            .apply_env_overrides("DEVNET_", |key| {
                (key == "DEVNET_CHAIN_ID").then(|| "abc".to_string())
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn load_from_file_round_trip() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config, sample());
    }

    #[test]
    fn load_reports_missing_file() {
        assert!(matches!(
            Config::load_from_file("/definitely/not/here.yaml"),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn load_reports_parse_errors() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"network: [unterminated").unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
