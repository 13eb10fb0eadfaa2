/// Server configuration
///
/// The configuration surface is consumed by the server, never owned by it:
/// the host hands over a `CoilServerConfig` at construction and again on
/// every reconfiguration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};
use crate::utils::validation;

/// Default listener address
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default coil bank size
pub const DEFAULT_COIL_COUNT: usize = 48;

/// Default discrete input bank size
pub const DEFAULT_DISCRETE_INPUT_COUNT: usize = 48;

/// Largest accepted coil / discrete input bank
pub const MAX_POINT_COUNT: usize = 1000;

/// Reconnect policy for listener faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Scheduled attempts allowed before the fault becomes terminal
    pub max_attempts: u32,
    /// Delay used for every fault except address-in-use
    pub default_delay_ms: u64,
    /// Delay used when the bind failed because the port is taken
    pub address_in_use_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            default_delay_ms: 5_000,
            address_in_use_delay_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Retry delay for a listener fault
    pub fn delay_for(&self, error: &ModbusError) -> Duration {
        if error.is_address_in_use() {
            Duration::from_millis(self.address_in_use_delay_ms)
        } else {
            Duration::from_millis(self.default_delay_ms)
        }
    }
}

/// Coil server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoilServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub coil_count: usize,
    /// Accepted and validated, but discrete inputs always read as zero
    pub discrete_input_count: usize,
    /// Enables debug level logging and frame tracing
    pub debug: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for CoilServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: crate::DEFAULT_TCP_PORT,
            coil_count: DEFAULT_COIL_COUNT,
            discrete_input_count: DEFAULT_DISCRETE_INPUT_COUNT,
            debug: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl CoilServerConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document
    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` is read as JSON, anything else as YAML
    pub fn from_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ModbusError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    /// Check every field against its accepted range
    pub fn validate(&self) -> ModbusResult<()> {
        self.bind_ip()?;
        validation::validate_port(self.port)?;
        validation::validate_point_count("coil_count", self.coil_count)?;
        validation::validate_point_count("discrete_input_count", self.discrete_input_count)?;

        if self.reconnect.max_attempts == 0 {
            return Err(ModbusError::configuration(
                "reconnect.max_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Listener socket address
    pub fn socket_addr(&self) -> ModbusResult<SocketAddr> {
        Ok(SocketAddr::new(self.bind_ip()?, self.port))
    }

    fn bind_ip(&self) -> ModbusResult<IpAddr> {
        self.bind_address.parse().map_err(|e| {
            ModbusError::configuration(format!(
                "Invalid bind address '{}': {}",
                self.bind_address, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CoilServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.port, 502);
        assert_eq!(config.coil_count, 48);
        assert_eq!(config.discrete_input_count, 48);
        assert!(!config.debug);
        assert_eq!(config.reconnect.max_attempts, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = CoilServerConfig::from_yaml_str("port: 5020\ncoil_count: 100\n").unwrap();
        assert_eq!(config.port, 5020);
        assert_eq!(config.coil_count, 100);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_validation_ranges() {
        let mut config = CoilServerConfig::default();
        config.port = 0;
        assert!(config.validate().is_err());

        let mut config = CoilServerConfig::default();
        config.coil_count = 1001;
        assert!(config.validate().is_err());

        let mut config = CoilServerConfig::default();
        config.coil_count = 0;
        assert!(config.validate().is_err());

        let mut config = CoilServerConfig::default();
        config.bind_address = "not-an-ip".to_string();
        assert!(matches!(
            config.validate(),
            Err(ModbusError::Configuration { .. })
        ));
    }

    #[test]
    fn test_reconnect_delays() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.delay_for(&ModbusError::address_in_use("0.0.0.0:502")),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.delay_for(&ModbusError::connection("listener closed")),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"bind_address": "127.0.0.1", "port": 1502, "debug": true}}"#).unwrap();

        let config = CoilServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:1502".parse().unwrap());
        assert!(config.debug);
    }
}
