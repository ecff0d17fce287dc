use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use envnode_common::{
    Broker, BrokerStatus, ConfigStore, Devices, Environment, EnvironmentReading, Indicator,
    IntakeError, IntakeOutcome, Network, NetworkStatus, NodeAgent, Rgb, Storage, StorageError,
    TimingConfig, CONFIG_TEMPLATE,
};

const DEFAULT_DATA_DIR: &str = "./.envnode";
const DEFAULT_TICK_MS: u64 = 50;
const DEFAULT_HW_ADDR: &str = "02:00:00:00:00:01";
const BROKER_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const BROKER_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, PartialEq)]
struct HostSettings {
    data_dir: PathBuf,
    tick_ms: u64,
    hardware_address: String,
}

impl HostSettings {
    fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup("ENVNODE_DATA_DIR")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            tick_ms: lookup("ENVNODE_TICK_MS")
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_TICK_MS),
            hardware_address: lookup("ENVNODE_HW_ADDR")
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| DEFAULT_HW_ADDR.to_string()),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = HostSettings::from_env();
    info!(
        "envnode host starting (data dir {}, tick {}ms)",
        settings.data_dir.display(),
        settings.tick_ms
    );

    let devices = Devices {
        network: HostNetwork::new(settings.hardware_address.clone()),
        broker: HostBroker::new(Handle::current()),
        environment: SimulatedEnvironment::default(),
        indicator: LogIndicator,
    };
    let store = ConfigStore::new(FileStorage::new(&settings.data_dir));
    let mut agent = NodeAgent::start(store, TimingConfig::default(), devices);

    let mut console = spawn_console_reader();
    let mut interval = tokio::time::interval(Duration::from_millis(settings.tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            result = &mut shutdown => {
                result.context("failed to listen for shutdown signal")?;
                info!("shutdown requested");
                return Ok(());
            }
        }

        if let Ok(line) = console.try_recv() {
            apply_console_line(&mut agent, &line);
        }
        agent.tick(monotonic_ms());
    }
}

fn apply_console_line<S, N, B, E, I>(agent: &mut NodeAgent<S, N, B, E, I>, line: &str)
where
    S: Storage,
    N: Network,
    B: Broker,
    E: Environment,
    I: Indicator,
{
    match agent.handle_intake(line) {
        Ok(IntakeOutcome::Configured { session_reset }) => {
            info!("configuration accepted (session reset: {session_reset})");
        }
        Ok(IntakeOutcome::Reset { persisted }) => {
            info!("configuration cleared (storage updated: {persisted})");
        }
        Err(IntakeError::Empty) => {}
        Err(IntakeError::Unrecognized) => {
            warn!("unrecognized input; send RESET or a configuration document: {CONFIG_TEMPLATE}");
        }
        Err(err) => warn!("configuration rejected: {err}"),
    }
}

fn spawn_console_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("console closed");
                    break;
                }
                Err(err) => {
                    warn!("console read failed: {err}");
                    break;
                }
            }
        }
    });
    rx
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// The host is always on a network; `join` only records the request.
struct HostNetwork {
    hardware_address: String,
    joined: bool,
}

impl HostNetwork {
    fn new(hardware_address: String) -> Self {
        Self {
            hardware_address,
            joined: false,
        }
    }
}

impl Network for HostNetwork {
    fn join(&mut self, ssid: &str, _password: &str) {
        if !self.joined {
            info!("using host network in place of `{ssid}`");
            self.joined = true;
        }
    }

    fn leave(&mut self) {
        self.joined = false;
    }

    fn status(&self) -> NetworkStatus {
        if self.joined {
            NetworkStatus::Joined
        } else {
            NetworkStatus::NotJoined
        }
    }

    fn hardware_address(&self) -> String {
        self.hardware_address.clone()
    }
}

struct BrokerSession {
    client: AsyncClient,
    pump: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct HostBroker {
    runtime: Handle,
    session: Option<BrokerSession>,
}

impl HostBroker {
    fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            session: None,
        }
    }
}

impl Broker for HostBroker {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        client_id: &str,
        user: &str,
        password: &str,
    ) -> bool {
        self.session = None;
        if client_id.starts_with(' ') {
            warn!("client id `{client_id}` rejected by the mqtt client");
            return false;
        }

        let mut options = MqttOptions::new(client_id, host, port);
        options.set_credentials(user, password);
        options.set_keep_alive(BROKER_KEEP_ALIVE);

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        let pump = self.runtime.spawn(async move {
            if wait_for_connack(&mut eventloop).await {
                info!("broker session established");
                flag.store(true, Ordering::SeqCst);
                pump_events(&mut eventloop).await;
            }
            flag.store(false, Ordering::SeqCst);
        });

        self.session = Some(BrokerSession {
            client,
            pump,
            connected,
        });
        // Reported through `status` once the broker acknowledges.
        false
    }

    fn status(&self) -> BrokerStatus {
        match &self.session {
            Some(session) if session.connected.load(Ordering::SeqCst) => BrokerStatus::Connected,
            _ => BrokerStatus::NotConnected,
        }
    }

    fn poll(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|session| session.pump.is_finished())
        {
            self.session = None;
        }
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        match session
            .client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
        {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to queue publish on `{topic}`: {err}");
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if self.session.take().is_some() {
            info!("broker session closed");
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> bool {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return ack.code == ConnectReturnCode::Success;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("broker handshake failed: {err}");
                    return false;
                }
            }
        }
    };

    match tokio::time::timeout(BROKER_CONNECT_TIMEOUT, handshake).await {
        Ok(accepted) => accepted,
        Err(_) => {
            warn!(
                "broker handshake timed out after {}ms",
                BROKER_CONNECT_TIMEOUT.as_millis()
            );
            false
        }
    }
}

async fn pump_events(eventloop: &mut EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker closed the session");
                return;
            }
            Ok(event) => debug!("broker event: {event:?}"),
            Err(err) => {
                warn!("broker connection lost: {err}");
                return;
            }
        }
    }
}

/// Slowly drifting readings standing in for real sensors.
#[derive(Debug, Default)]
struct SimulatedEnvironment {
    samples: u64,
}

impl Environment for SimulatedEnvironment {
    fn read(&mut self) -> EnvironmentReading {
        self.samples = self.samples.saturating_add(1);
        EnvironmentReading {
            temperature: 21.0 + (self.samples % 8) as f32 * 0.25,
            humidity: 45.0 + (self.samples % 6) as f32 * 0.5,
            light: 300 + (self.samples % 10) as u16 * 5,
        }
    }
}

struct LogIndicator;

impl Indicator for LogIndicator {
    fn set(&mut self, color: Rgb) {
        debug!("indicator rgb({}, {}, {})", color.r, color.g, color.b);
    }
}

/// Directory-backed storage; `/config.json` lives at `<root>/config.json`.
struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl Storage for FileStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(|err| {
            StorageError::Mount(format!("{}: {err}", self.root.display()))
        })
    }

    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.resolve(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let mut staging = target.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        fs::write(&staging, bytes)?;
        fs::rename(&staging, &target)?;
        Ok(())
    }

    fn delete(&mut self, path: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.resolve(path)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
