//! Configuration management
//!
//! Handles:
//! - Field bus (serial port, device address, register window, retry budget)
//! - Modem AT channel and GNSS acquisition settings
//! - Broker endpoint and credentials (secrets from environment, never written back)
//! - Publish trigger policy and update preferences

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "METER_AGENT_CONFIG";
const BROKER_PASSWORD_ENV: &str = "METER_AGENT_BROKER_PASSWORD";
const ACCESS_TOKEN_ENV: &str = "METER_AGENT_ACCESS_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device: DeviceConfig,
    pub meter: MeterConfig,
    pub modem: ModemConfig,
    pub broker: BrokerConfig,
    pub publish: PublishConfig,
    pub update: UpdateConfig,
    pub supervisor: SupervisorConfig,
}

/// Identity carried verbatim into every payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub serial_number: String,
    pub account_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub port: String,
    pub baud_rate: u32,
    pub device_address: u8,
    pub start_address: u16,
    pub register_count: u16,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub port: String,
    pub baud_rate: u32,
    pub command_timeout_ms: u64,
    pub fix_attempts: u32,
    pub fix_retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub movement_threshold_m: f64,
    pub max_interval_secs: u64,
    pub abort_on_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub manifest_url: String,
    pub program_path: PathBuf,
    pub check_interval_secs: u64,
    pub ordering: VersionOrdering,
    pub require_checksum: bool,
    pub restart: RestartPolicy,
    /// argv run for `restart = "reboot"`
    pub reboot_command: Vec<String>,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_secs: u64,
}

/// How a manifest version is compared with the running one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionOrdering {
    /// Dotted components compared as integers ("1.10" > "1.9")
    Numeric,
    /// Plain string ordering ("9" > "10")
    Lexical,
}

/// What happens once a new program is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    Exit,
    Reboot,
    None,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_number: "EM-000000".to_string(),
            account_id: String::new(),
            access_token: String::new(),
        }
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            device_address: 1,
            start_address: 0,
            register_count: 64,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            response_timeout_ms: 1000,
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB2".to_string(),
            baud_rate: 115_200,
            command_timeout_ms: 5000,
            fix_attempts: 3,
            fix_retry_delay_secs: 10,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "meter-agent".to_string(),
            username: String::new(),
            password: String::new(),
            topic: "energy_values".to_string(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            movement_threshold_m: 50.0,
            max_interval_secs: 30,
            abort_on_error: false,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            program_path: PathBuf::from("/usr/local/bin/meter-agent"),
            check_interval_secs: 0,
            ordering: VersionOrdering::Numeric,
            require_checksum: false,
            restart: RestartPolicy::Exit,
            reboot_command: vec!["reboot".to_string()],
            http_timeout_secs: 30,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 5 }
    }
}

impl MeterConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl ModemConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn fix_retry_delay(&self) -> Duration {
        Duration::from_secs(self.fix_retry_delay_secs)
    }
}

impl AgentConfig {
    /// Load config from `METER_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            Self::from_toml(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?
        } else {
            tracing::warn!("No config file at {}, using defaults", config_path.display());
            Self::default()
        };

        config.apply_env_secrets();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Into::into)
    }

    /// Get config file path, honouring the environment override
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not find config directory"))?;
        path.push("meter-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Secrets are supplied at startup, never compiled in
    fn apply_env_secrets(&mut self) {
        if let Ok(password) = std::env::var(BROKER_PASSWORD_ENV) {
            self.broker.password = password;
        }
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            self.device.access_token = token;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.meter.baud_rate == 0 || self.modem.baud_rate == 0 {
            return Err(anyhow!("Baud rate must be non-zero"));
        }
        if self.meter.register_count < crate::meter::registers::REGISTER_BLOCK_LEN {
            return Err(anyhow!(
                "meter.register_count must be at least {}",
                crate::meter::registers::REGISTER_BLOCK_LEN
            ));
        }
        if self.meter.retry_attempts == 0 || self.modem.fix_attempts == 0 {
            return Err(anyhow!("Retry budgets must allow at least one attempt"));
        }
        if !(self.publish.movement_threshold_m >= 0.0) {
            return Err(anyhow!("publish.movement_threshold_m must be a non-negative number"));
        }
        if self.broker.topic.is_empty() {
            return Err(anyhow!("broker.topic must not be empty"));
        }
        if self.update.restart == RestartPolicy::Reboot && self.update.reboot_command.is_empty() {
            return Err(anyhow!("update.reboot_command is required for restart = \"reboot\""));
        }
        Ok(())
    }
}
