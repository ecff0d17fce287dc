use crate::{config::Configuration, types::ReadingKind};

pub const CONFIG_PATH: &str = "/config.json";

const CLIENT_ID_INFIX: &str = "_sensor_temphum_";

/// Full broker topics for one configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub temperature: String,
    pub humidity: String,
    pub light: String,
}

impl Topics {
    pub fn for_config(config: &Configuration) -> Self {
        Self {
            temperature: full_topic(&config.device_name, &config.temperature_topic),
            humidity: full_topic(&config.device_name, &config.humidity_topic),
            light: full_topic(&config.device_name, &config.light_topic),
        }
    }

    pub fn get(&self, kind: ReadingKind) -> &str {
        match kind {
            ReadingKind::Temperature => &self.temperature,
            ReadingKind::Humidity => &self.humidity,
            ReadingKind::Light => &self.light,
        }
    }
}

pub fn full_topic(device_name: &str, suffix: &str) -> String {
    format!("{device_name}/{suffix}")
}

/// `<device>_sensor_temphum_<hardware address without separators>`.
pub fn client_id(device_name: &str, hardware_address: &str) -> String {
    let address: String = hardware_address
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    format!("{device_name}{CLIENT_ID_INFIX}{address}")
}
