use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_BROKER_PORT: i64 = 1883;
pub const DEFAULT_PUBLISH_INTERVAL_MS: i64 = 60_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub blink_interval_ms: u64,
    pub broker_retry_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            blink_interval_ms: 250,
            broker_retry_interval_ms: 5_000,
        }
    }
}

/// Operating parameters of the node. Field order is the persisted order.
///
/// Replaced wholesale, never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub network_ssid: String,
    #[serde(default)]
    pub network_password: String,
    #[serde(default)]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: i64,
    #[serde(default)]
    pub broker_user: String,
    #[serde(default)]
    pub broker_password: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub temperature_topic: String,
    #[serde(default)]
    pub humidity_topic: String,
    #[serde(default)]
    pub light_topic: String,
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: i64,
}

fn default_broker_port() -> i64 {
    DEFAULT_BROKER_PORT
}

fn default_publish_interval_ms() -> i64 {
    DEFAULT_PUBLISH_INTERVAL_MS
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("network_ssid", &self.network_ssid),
            ("network_password", &self.network_password),
            ("broker_host", &self.broker_host),
            ("broker_user", &self.broker_user),
            ("broker_password", &self.broker_password),
            ("temperature_topic", &self.temperature_topic),
            ("humidity_topic", &self.humidity_topic),
            ("light_topic", &self.light_topic),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(ConfigError::MissingField(name));
            }
        }

        if !(1..=i64::from(u16::MAX)).contains(&self.broker_port) {
            return Err(ConfigError::PortOutOfRange(self.broker_port));
        }
        if self.publish_interval_ms <= 0 {
            return Err(ConfigError::IntervalOutOfRange(self.publish_interval_ms));
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Port as the broker client expects it. Only meaningful once validated.
    pub fn broker_port_u16(&self) -> u16 {
        u16::try_from(self.broker_port).unwrap_or(0)
    }

    pub fn publish_interval_u64(&self) -> u64 {
        u64::try_from(self.publish_interval_ms).unwrap_or(0)
    }

    /// True when `other` would need a fresh network join or broker session.
    pub fn requires_reconnect(&self, other: &Configuration) -> bool {
        self.network_ssid != other.network_ssid
            || self.network_password != other.network_password
            || self.broker_host != other.broker_host
            || self.broker_port != other.broker_port
            || self.broker_user != other.broker_user
            || self.broker_password != other.broker_password
            || self.device_name != other.device_name
    }

    /// True when `other` names a different wireless network.
    pub fn requires_rejoin(&self, other: &Configuration) -> bool {
        self.network_ssid != other.network_ssid || self.network_password != other.network_password
    }
}

/// Configuration as typed on the console: same keys as the persisted
/// document, but `publish_interval_ms` carries whole seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeDocument {
    #[serde(default)]
    pub network_ssid: String,
    #[serde(default)]
    pub network_password: String,
    #[serde(default)]
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: i64,
    #[serde(default)]
    pub broker_user: String,
    #[serde(default)]
    pub broker_password: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub temperature_topic: String,
    #[serde(default)]
    pub humidity_topic: String,
    #[serde(default)]
    pub light_topic: String,
    #[serde(rename = "publish_interval_ms", default)]
    pub publish_interval_s: i64,
}

impl IntakeDocument {
    pub fn into_configuration(self) -> Result<Configuration, ConfigError> {
        let publish_interval_ms = self
            .publish_interval_s
            .checked_mul(1_000)
            .ok_or(ConfigError::IntervalOutOfRange(self.publish_interval_s))?;

        let config = Configuration {
            network_ssid: self.network_ssid,
            network_password: self.network_password,
            broker_host: self.broker_host,
            broker_port: self.broker_port,
            broker_user: self.broker_user,
            broker_password: self.broker_password,
            device_name: self.device_name,
            temperature_topic: self.temperature_topic,
            humidity_topic: self.humidity_topic,
            light_topic: self.light_topic,
            publish_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }
}
