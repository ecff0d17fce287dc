use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectivityState {
    Unconfigured,
    JoiningNetwork,
    JoiningBroker,
    Connected,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "UNCONFIGURED",
            Self::JoiningNetwork => "JOINING_NETWORK",
            Self::JoiningBroker => "JOINING_BROKER",
            Self::Connected => "CONNECTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Joined,
    NotJoined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerStatus {
    Connected,
    NotConnected,
}

/// One sample from the node's sensors. Values may be stale or out of range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvironmentReading {
    pub temperature: f32,
    pub humidity: f32,
    pub light: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingKind {
    Temperature,
    Humidity,
    Light,
}

impl ReadingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Light => "light",
        }
    }
}
