use core::convert::TryInto;
use std::{
    io::BufRead,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration as WifiConfiguration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{Ets, FreeRtos},
    gpio::{AnyIOPin, Gpio34, IOPin, InputOutput, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    prelude::*,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::EspWifi,
};
use log::{info, warn};

use envnode_common::{
    Broker, BrokerStatus, ConfigStore, Devices, Environment, EnvironmentReading, Indicator,
    IntakeError, IntakeOutcome, Network, NetworkStatus, NodeAgent, Rgb, Storage, StorageError,
    TimingConfig, CONFIG_TEMPLATE,
};

const NVS_NAMESPACE: &str = "envnode";
const NVS_KEY_MAX_LEN: usize = 15;
const NVS_VALUE_BUFFER: usize = 4096;

const DHT11_PIN: i32 = 16;
const LIGHT_SAMPLES: u32 = 10;
const LIGHT_SAMPLE_DELAY_MS: u32 = 10;

const TICK_MS: u64 = 50;
const WATCHDOG_TIMEOUT_SEC: u64 = 30;
const WIFI_CONNECT_RETRY_MS: u64 = 3_000;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem,
        pins,
        ledc,
        adc1,
        ..
    } = Peripherals::take()?;

    let timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::new()
            .frequency(5.kHz().into())
            .resolution(Resolution::Bits8),
    )
    .context("failed to configure LED timer")?;
    let indicator = LedcIndicator {
        red: LedcDriver::new(ledc.channel0, &timer, pins.gpio25)?,
        green: LedcDriver::new(ledc.channel1, &timer, pins.gpio26)?,
        blue: LedcDriver::new(ledc.channel2, &timer, pins.gpio27)?,
    };

    let adc = AdcDriver::new(adc1).context("failed to initialize ADC1")?;
    let light = AdcChannelDriver::new(
        &adc,
        pins.gpio34,
        &AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        },
    )
    .context("failed to configure light sensor channel")?;
    let environment = BoardEnvironment::new(pins.gpio16.downgrade(), light)
        .context("failed to initialize sensors")?;

    let network = EspNetwork::new(modem, sys_loop, nvs_partition.clone())
        .context("wifi startup failed")?;

    let devices = Devices {
        network,
        broker: EspBroker::default(),
        environment,
        indicator,
    };
    let store = ConfigStore::new(NvsStorage::new(nvs_partition));
    let mut agent = NodeAgent::start(store, TimingConfig::default(), devices);

    let watchdog = TaskWatchdog::subscribe(Duration::from_secs(WATCHDOG_TIMEOUT_SEC))?;

    let console = spawn_console_reader()?;
    info!("envnode sensor started");

    loop {
        watchdog.feed();
        if let Ok(line) = console.try_recv() {
            apply_console_line(&mut agent, &line);
        }
        agent.tick(monotonic_ms());
        thread::sleep(Duration::from_millis(TICK_MS));
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
            warn!("invalid command or configuration; send RESET or: {CONFIG_TEMPLATE}");
        }
        Err(err) => warn!("configuration rejected: {err}"),
    }
}

/// UART0 is the console; lines are handed to the main loop one at a time.
fn spawn_console_reader() -> anyhow::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("console".to_string())
        .stack_size(4096)
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) => thread::sleep(Duration::from_millis(100)),
                    Ok(_) => {
                        if tx.send(line.clone()).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("console read failed: {err}");
                        thread::sleep(Duration::from_millis(500));
                    }
                }
            }
        })
        .context("failed to spawn console thread")?;
    Ok(rx)
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

struct LedcIndicator<'d> {
    red: LedcDriver<'d>,
    green: LedcDriver<'d>,
    blue: LedcDriver<'d>,
}

fn scaled_duty(driver: &LedcDriver<'_>, level: u8) -> u32 {
    driver.get_max_duty() * u32::from(level) / u32::from(u8::MAX)
}

impl Indicator for LedcIndicator<'_> {
    fn set(&mut self, color: Rgb) {
        for (driver, level) in [
            (&mut self.red, color.r),
            (&mut self.green, color.g),
            (&mut self.blue, color.b),
        ] {
            let duty = scaled_duty(driver, level);
            if let Err(err) = driver.set_duty(duty) {
                warn!("failed to set LED duty: {err:?}");
            }
        }
    }
}

type LightChannel<'d> = AdcChannelDriver<'d, Gpio34, &'d AdcDriver<'d, ADC1>>;

/// DHT11 temperature and humidity plus a light-dependent resistor on ADC1.
/// Failed reads keep the previous values.
struct BoardEnvironment<'d> {
    dht_pin: PinDriver<'d, AnyIOPin, InputOutput>,
    light: LightChannel<'d>,
    delay: Ets,
    last: EnvironmentReading,
}

impl<'d> BoardEnvironment<'d> {
    fn new(dht_pin: AnyIOPin, light: LightChannel<'d>) -> anyhow::Result<Self> {
        let mut dht_pin = PinDriver::input_output_od(dht_pin)?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        Ok(Self {
            dht_pin,
            light,
            delay: Ets,
            last: EnvironmentReading {
                temperature: 0.0,
                humidity: 0.0,
                light: 0,
            },
        })
    }

    fn read_climate(&mut self) {
        if let Err(err) = self.dht_pin.set_high() {
            warn!("failed to set DHT11 line high before read: {err:?}");
            return;
        }

        match dht11::blocking::read(&mut self.delay, &mut self.dht_pin) {
            Ok(reading) => {
                self.last.temperature = f32::from(reading.temperature);
                self.last.humidity = f32::from(reading.relative_humidity);
            }
            Err(err) => warn!("failed to read DHT11 on GPIO{DHT11_PIN}: {err:?}"),
        }
    }

    fn read_light(&mut self) {
        let mut total: u32 = 0;
        for _ in 0..LIGHT_SAMPLES {
            match self.light.read() {
                Ok(sample) => total += u32::from(sample),
                Err(err) => {
                    warn!("failed to sample light sensor: {err:?}");
                    return;
                }
            }
            FreeRtos::delay_ms(LIGHT_SAMPLE_DELAY_MS);
        }
        self.last.light = u16::try_from(total / LIGHT_SAMPLES).unwrap_or(u16::MAX);
    }
}

impl Environment for BoardEnvironment<'_> {
    fn read(&mut self) -> EnvironmentReading {
        self.read_climate();
        self.read_light();
        info!(
            "reading: {:.1}C {:.0}% light {}",
            self.last.temperature, self.last.humidity, self.last.light
        );
        self.last
    }
}

/// Station-mode wifi. Connect requests are issued at most every
/// `WIFI_CONNECT_RETRY_MS` so `join` can run on every tick.
struct EspNetwork {
    wifi: EspWifi<'static>,
    hardware_address: String,
    configured_ssid: Option<String>,
    last_connect: Option<Instant>,
}

impl EspNetwork {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
    ) -> anyhow::Result<Self> {
        let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
        let mac = wifi.sta_netif().get_mac()?;
        let hardware_address = mac
            .iter()
            .map(|byte| format!("{byte:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        Ok(Self {
            wifi,
            hardware_address,
            configured_ssid: None,
            last_connect: None,
        })
    }

    fn configure(&mut self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        self.wifi
            .set_configuration(&WifiConfiguration::Client(ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        info!("wifi started, joining `{ssid}`");
        self.configured_ssid = Some(ssid.to_string());
        Ok(())
    }
}

impl Network for EspNetwork {
    fn join(&mut self, ssid: &str, password: &str) {
        if self.configured_ssid.as_deref() != Some(ssid) {
            if let Err(err) = self.configure(ssid, password) {
                warn!("failed to configure wifi: {err:#}");
                return;
            }
        }

        let due = self
            .last_connect
            .map(|at| at.elapsed() >= Duration::from_millis(WIFI_CONNECT_RETRY_MS))
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_connect = Some(Instant::now());

        if let Err(err) = self.wifi.connect() {
            warn!("wifi connect request failed: {err:?}");
        }
    }

    fn leave(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect request failed: {err:?}");
        }
        self.configured_ssid = None;
        self.last_connect = None;
    }

    fn status(&self) -> NetworkStatus {
        match self.wifi.is_up() {
            Ok(true) => NetworkStatus::Joined,
            _ => NetworkStatus::NotJoined,
        }
    }

    fn hardware_address(&self) -> String {
        self.hardware_address.clone()
    }
}

struct BrokerSession {
    client: EspMqttClient<'static>,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct EspBroker {
    session: Option<BrokerSession>,
}

impl Broker for EspBroker {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        client_id: &str,
        user: &str,
        password: &str,
    ) -> bool {
        self.session = None;

        let url = format!("mqtt://{host}:{port}");
        let conf = MqttClientConfiguration {
            client_id: Some(client_id),
            username: Some(user),
            password: Some(password),
            ..Default::default()
        };
        let (client, mut conn) = match EspMqttClient::new(&url, &conf) {
            Ok(pair) => pair,
            Err(err) => {
                warn!("failed to create mqtt client for {url}: {err:?}");
                return false;
            }
        };

        let connected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connected);
        let spawned = thread::Builder::new()
            .name("mqtt-pump".to_string())
            .stack_size(6144)
            .spawn(move || {
                // Ends once the client is dropped.
                while let Ok(event) = conn.next() {
                    match event.payload() {
                        EventPayload::Connected(_) => {
                            info!("broker session established");
                            flag.store(true, Ordering::SeqCst);
                        }
                        EventPayload::Disconnected => flag.store(false, Ordering::SeqCst),
                        EventPayload::Error(err) => warn!("mqtt error event: {err:?}"),
                        _ => {}
                    }
                }
                flag.store(false, Ordering::SeqCst);
            });
        if let Err(err) = spawned {
            warn!("failed to spawn mqtt pump: {err}");
            return false;
        }

        // Reported through `status` once the broker acknowledges.
        self.session = Some(BrokerSession { client, connected });
        false
    }

    fn status(&self) -> BrokerStatus {
        match &self.session {
            Some(session) if session.connected.load(Ordering::SeqCst) => BrokerStatus::Connected,
            _ => BrokerStatus::NotConnected,
        }
    }

    fn poll(&mut self) {
        // Keep-alives are serviced by the pump thread.
        if self
            .session
            .as_ref()
            .is_some_and(|session| !session.connected.load(Ordering::SeqCst))
        {
            self.session = None;
        }
    }

    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session
            .client
            .publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes())
        {
            Ok(_) => true,
            Err(err) => {
                warn!("failed to publish on `{topic}`: {err:?}");
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

/// Files map onto string keys of one NVS namespace: `/config.json` is
/// stored under `config_json`.
struct NvsStorage {
    partition: EspDefaultNvsPartition,
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsStorage {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self {
            partition,
            nvs: None,
        }
    }

    fn handle(&mut self) -> Result<&mut EspNvs<NvsDefault>, StorageError> {
        self.nvs.as_mut().ok_or(StorageError::Unavailable)
    }
}

fn nvs_key(path: &str) -> Result<String, StorageError> {
    let key = path.trim_start_matches('/').replace(['.', '/'], "_");
    if key.is_empty() || key.len() > NVS_KEY_MAX_LEN {
        return Err(StorageError::Backend(format!(
            "`{path}` does not map to an NVS key"
        )));
    }
    Ok(key)
}

fn backend(err: impl core::fmt::Debug) -> StorageError {
    StorageError::Backend(format!("{err:?}"))
}

impl Storage for NvsStorage {
    fn mount(&mut self) -> Result<(), StorageError> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)
            .map_err(|err| StorageError::Mount(format!("{err:?}")))?;
        self.nvs = Some(nvs);
        Ok(())
    }

    fn read(&mut self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = nvs_key(path)?;
        let nvs = self.handle()?;
        let mut buffer = vec![0_u8; NVS_VALUE_BUFFER];
        let value = nvs.get_str(&key, &mut buffer).map_err(backend)?;
        Ok(value.map(|text| text.as_bytes().to_vec()))
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let key = nvs_key(path)?;
        let text = core::str::from_utf8(bytes).map_err(backend)?;
        self.handle()?.set_str(&key, text).map_err(backend)
    }

    fn delete(&mut self, path: &str) -> Result<(), StorageError> {
        let key = nvs_key(path)?;
        self.handle()?.remove(&key).map_err(backend)?;
        Ok(())
    }
}

/// Task watchdog subscription for the scheduler task. A tick that stalls
/// longer than the timeout panics and reboots the board.
struct TaskWatchdog;

impl TaskWatchdog {
    fn subscribe(timeout: Duration) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        // Already initialised or subscribed counts as success.
        accept_wdt("init", unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })?;
        accept_wdt("add", unsafe {
            esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut())
        })?;
        Ok(Self)
    }

    fn feed(&self) {
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("watchdog reset failed with code {rc}");
        }
    }
}

fn accept_wdt(op: &str, rc: esp_idf_svc::sys::esp_err_t) -> anyhow::Result<()> {
    match rc {
        esp_idf_svc::sys::ESP_OK | esp_idf_svc::sys::ESP_ERR_INVALID_STATE => Ok(()),
        _ => Err(anyhow!("esp_task_wdt_{op} failed with code {rc}")),
    }
}
