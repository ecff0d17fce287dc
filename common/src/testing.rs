//! Fakes for the capability traits, shared by the unit tests.

use std::collections::{HashMap, HashSet};

use crate::{
    config::Configuration,
    connectivity::{Broker, Devices, Network},
    error::StorageError,
    indicator::{Indicator, Rgb},
    publish::Environment,
    store::Storage,
    types::{BrokerStatus, EnvironmentReading, NetworkStatus},
};

pub fn sample_config() -> Configuration {
    Configuration {
        network_ssid: "lab-net".to_string(),
        network_password: "hunter22".to_string(),
        broker_host: "10.0.0.2".to_string(),
        broker_port: 1883,
        broker_user: "node".to_string(),
        broker_password: "secret".to_string(),
        device_name: "home".to_string(),
        temperature_topic: "temp".to_string(),
        humidity_topic: "hum".to_string(),
        light_topic: "light".to_string(),
        publish_interval_ms: 60_000,
    }
}

pub fn sample_reading() -> EnvironmentReading {
    EnvironmentReading {
        temperature: 22.5,
        humidity: 45.0,
        light: 300,
    }
}

/// Joins after `joins_needed` join calls.
#[derive(Debug, Default)]
pub struct ScriptedNetwork {
    pub joined: bool,
    pub joins_needed: u32,
    pub join_calls: u32,
    pub leave_calls: u32,
    pub status_calls: std::cell::Cell<u32>,
}

impl ScriptedNetwork {
    pub fn joined() -> Self {
        Self {
            joined: true,
            ..Self::default()
        }
    }

    pub fn joins_after(calls: u32) -> Self {
        Self {
            joins_needed: calls,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.join_calls + self.status_calls.get()
    }
}

impl Network for ScriptedNetwork {
    fn join(&mut self, _ssid: &str, _password: &str) {
        self.join_calls += 1;
        if self.join_calls >= self.joins_needed {
            self.joined = true;
        }
    }

    fn leave(&mut self) {
        self.leave_calls += 1;
        self.joined = false;
    }

    fn status(&self) -> NetworkStatus {
        self.status_calls.set(self.status_calls.get() + 1);
        if self.joined {
            NetworkStatus::Joined
        } else {
            NetworkStatus::NotJoined
        }
    }

    fn hardware_address(&self) -> String {
        "5C:CF:7F:12:34:56".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectCall {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Default)]
pub struct ScriptedBroker {
    pub connected: bool,
    pub accept_connect: bool,
    /// Session comes up after `connect` returns, as with a real handshake.
    pub handshake_pending: bool,
    pub connects: Vec<ConnectCall>,
    pub disconnects: u32,
    pub published: Vec<(String, String, bool)>,
    pub polls: u32,
    pub status_calls: std::cell::Cell<u32>,
    rejected_topics: HashSet<String>,
}

impl ScriptedBroker {
    pub fn connected() -> Self {
        Self {
            connected: true,
            accept_connect: true,
            ..Self::default()
        }
    }

    pub fn accepting() -> Self {
        Self {
            accept_connect: true,
            ..Self::default()
        }
    }

    pub fn refusing() -> Self {
        Self::default()
    }

    pub fn handshaking() -> Self {
        Self {
            accept_connect: true,
            handshake_pending: true,
            ..Self::default()
        }
    }

    pub fn reject_topic(&mut self, topic: &str) {
        self.rejected_topics.insert(topic.to_string());
    }

    pub fn calls(&self) -> u32 {
        self.connects.len() as u32 + self.polls + self.status_calls.get()
    }
}

impl Broker for ScriptedBroker {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        client_id: &str,
        user: &str,
        password: &str,
    ) -> bool {
        self.connects.push(ConnectCall {
            host: host.to_string(),
            port,
            client_id: client_id.to_string(),
            user: user.to_string(),
            password: password.to_string(),
        });
        self.connected = self.accept_connect;
        self.connected && !self.handshake_pending
    }

    fn status(&self) -> BrokerStatus {
        self.status_calls.set(self.status_calls.get() + 1);
        if self.connected {
            BrokerStatus::Connected
        } else {
            BrokerStatus::NotConnected
        }
    }

    fn poll(&mut self) {
        self.polls += 1;
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> bool {
        if !self.connected || self.rejected_topics.contains(topic) {
            return false;
        }
        self.published
            .push((topic.to_string(), payload.to_string(), retain));
        true
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.connected = false;
    }
}

#[derive(Debug)]
pub struct FixedEnvironment(pub EnvironmentReading);

impl Environment for FixedEnvironment {
    fn read(&mut self) -> EnvironmentReading {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct RecordingIndicator {
    pub writes: Vec<Rgb>,
}

impl RecordingIndicator {
    pub fn last(&self) -> Rgb {
        self.writes.last().copied().unwrap_or(Rgb::OFF)
    }
}

impl Indicator for RecordingIndicator {
    fn set(&mut self, color: Rgb) {
        self.writes.push(color);
    }
}

pub type FakeDevices =
    Devices<ScriptedNetwork, ScriptedBroker, FixedEnvironment, RecordingIndicator>;

pub fn devices(network: ScriptedNetwork, broker: ScriptedBroker) -> FakeDevices {
    Devices {
        network,
        broker,
        environment: FixedEnvironment(sample_reading()),
        indicator: RecordingIndicator::default(),
    }
}

/// Volatile [`Storage`], also able to simulate a broken medium.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pub(crate) files: HashMap<String, Vec<u8>>,
    pub fail_mount: bool,
    pub fail_writes: bool,
    pub mount_calls: u32,
}

impl MemoryStorage {
    pub fn with_file(path: &str, bytes: impl Into<Vec<u8>>) -> Self {
        let mut storage = Self::default();
        storage.files.insert(path.to_string(), bytes.into());
        storage
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }
}

impl Storage for MemoryStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        self.mount_calls += 1;
        if self.fail_mount {
            return Err(StorageError::Mount("simulated mount failure".to_string()));
        }
        Ok(())
    }

    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.files.get(path).cloned())
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Backend("simulated write failure".to_string()));
        }
        self.files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Backend("simulated delete failure".to_string()));
        }
        self.files.remove(path);
        Ok(())
    }
}
