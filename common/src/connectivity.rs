use tracing::{info, warn};

use crate::{
    config::{Configuration, TimingConfig},
    error::PublishError,
    indicator::{Color, Indicator, IndicatorMode, StatusIndicator},
    publish::{publish_reading, Environment},
    topics::client_id,
    types::{BrokerStatus, ConnectivityState, NetworkStatus},
};

/// Wireless link. `join` must be safe to call on every tick.
pub trait Network {
    fn join(&mut self, ssid: &str, password: &str);
    /// Drops the current association so the next `join` uses new credentials.
    fn leave(&mut self);
    fn status(&self) -> NetworkStatus;
    fn hardware_address(&self) -> String;
}

/// Broker session.
///
/// `connect` must not wait on the network. It returns true only when the
/// session is already up; an adapter with an asynchronous handshake returns
/// false and lets `status` report the session once it is established.
pub trait Broker {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        client_id: &str,
        user: &str,
        password: &str,
    ) -> bool;
    fn status(&self) -> BrokerStatus;
    /// Services keep-alives and inbound messages.
    fn poll(&mut self);
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> bool;
    fn disconnect(&mut self);
}

/// The collaborators one tick talks to.
pub struct Devices<N, B, E, I> {
    pub network: N,
    pub broker: B,
    pub environment: E,
    pub indicator: I,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub state: ConnectivityState,
    pub indicator: IndicatorMode,
    /// `Some(succeeded)` when a broker connect was attempted this tick.
    pub connect_attempt: Option<bool>,
    /// Outcome of the publication task when it ran this tick.
    pub publish: Option<Result<(), PublishError>>,
}

impl TickReport {
    fn new(state: ConnectivityState, indicator: IndicatorMode) -> Self {
        Self {
            state,
            indicator,
            connect_attempt: None,
            publish: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectivityMachine {
    timing: TimingConfig,
    state: ConnectivityState,
    last_publish_ms: Option<u64>,
    last_connect_attempt_ms: Option<u64>,
    indicator: StatusIndicator,
}

impl ConnectivityMachine {
    pub fn new(timing: TimingConfig, configured: bool) -> Self {
        let indicator = StatusIndicator::new(timing.blink_interval_ms);
        Self {
            timing,
            state: if configured {
                ConnectivityState::JoiningNetwork
            } else {
                ConnectivityState::Unconfigured
            },
            last_publish_ms: None,
            last_connect_attempt_ms: None,
            indicator,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn indicator(&self) -> &StatusIndicator {
        &self.indicator
    }

    pub fn last_publish_ms(&self) -> Option<u64> {
        self.last_publish_ms
    }

    /// Forgets the session timestamps: the next broker attempt is immediate
    /// and the next established session publishes at once.
    pub fn reset_session(&mut self) {
        self.last_connect_attempt_ms = None;
        self.last_publish_ms = None;
    }

    /// Recomputes the state from what the collaborators report right now.
    ///
    /// Only the publish and reconnect timestamps carry over between ticks, so
    /// a dropped link is picked up on the very next call whatever the
    /// previous state was.
    pub fn tick<N, B, E, I>(
        &mut self,
        config: Option<&Configuration>,
        devices: &mut Devices<N, B, E, I>,
        now_ms: u64,
    ) -> TickReport
    where
        N: Network,
        B: Broker,
        E: Environment,
        I: Indicator,
    {
        let report = match config.filter(|config| config.is_valid()) {
            None => TickReport::new(
                ConnectivityState::Unconfigured,
                IndicatorMode::Blink(Color::Yellow),
            ),
            Some(config) => self.evaluate_configured(config, devices, now_ms),
        };

        if report.state != self.state {
            info!(
                "connectivity {} -> {}",
                self.state.as_str(),
                report.state.as_str()
            );
            self.state = report.state;
        }

        self.indicator
            .drive(&mut devices.indicator, report.indicator, now_ms);
        report
    }

    fn evaluate_configured<N, B, E, I>(
        &mut self,
        config: &Configuration,
        devices: &mut Devices<N, B, E, I>,
        now_ms: u64,
    ) -> TickReport
    where
        N: Network,
        B: Broker,
        E: Environment,
        I: Indicator,
    {
        if devices.network.status() == NetworkStatus::NotJoined {
            devices
                .network
                .join(&config.network_ssid, &config.network_password);
            return TickReport::new(
                ConnectivityState::JoiningNetwork,
                IndicatorMode::Blink(Color::Red),
            );
        }

        if devices.broker.status() == BrokerStatus::NotConnected {
            return self.join_broker(config, devices, now_ms);
        }

        let publish_due = self
            .last_publish_ms
            .map(|last| now_ms.saturating_sub(last) > config.publish_interval_u64())
            .unwrap_or(true);

        if publish_due {
            self.last_publish_ms = Some(now_ms);
            self.indicator.drive(
                &mut devices.indicator,
                IndicatorMode::Blink(Color::Green),
                now_ms,
            );
            let reading = devices.environment.read();
            let outcome = publish_reading(&mut devices.broker, config, &reading);
            let indicator = publish_indicator(&outcome);
            let mut report = TickReport::new(ConnectivityState::Connected, indicator);
            report.publish = Some(outcome);
            return report;
        }

        devices.broker.poll();
        TickReport::new(
            ConnectivityState::Connected,
            IndicatorMode::Solid(Color::Green),
        )
    }

    fn join_broker<N, B, E, I>(
        &mut self,
        config: &Configuration,
        devices: &mut Devices<N, B, E, I>,
        now_ms: u64,
    ) -> TickReport
    where
        N: Network,
        B: Broker,
        E: Environment,
    {
        let waiting = TickReport::new(
            ConnectivityState::JoiningBroker,
            IndicatorMode::Blink(Color::Blue),
        );

        let eligible = self
            .last_connect_attempt_ms
            .map(|last| now_ms.saturating_sub(last) >= self.timing.broker_retry_interval_ms)
            .unwrap_or(true);
        if !eligible {
            return waiting;
        }
        self.last_connect_attempt_ms = Some(now_ms);
        self.last_publish_ms = None;

        let id = client_id(&config.device_name, &devices.network.hardware_address());
        info!(
            "attempting broker connection to {}:{} as `{id}`",
            config.broker_host, config.broker_port
        );
        let connected = devices.broker.connect(
            &config.broker_host,
            config.broker_port_u16(),
            &id,
            &config.broker_user,
            &config.broker_password,
        );

        if !connected {
            warn!(
                "broker session not established; retrying in {}ms",
                self.timing.broker_retry_interval_ms
            );
            let mut report = TickReport::new(
                ConnectivityState::JoiningBroker,
                IndicatorMode::Solid(Color::Red),
            );
            report.connect_attempt = Some(false);
            return report;
        }

        info!("broker connected");
        self.last_publish_ms = Some(now_ms);
        let reading = devices.environment.read();
        let outcome = publish_reading(&mut devices.broker, config, &reading);
        let indicator = publish_indicator(&outcome);

        TickReport {
            state: ConnectivityState::Connected,
            indicator,
            connect_attempt: Some(true),
            publish: Some(outcome),
        }
    }
}

fn publish_indicator(outcome: &Result<(), PublishError>) -> IndicatorMode {
    match outcome {
        Ok(()) => IndicatorMode::Solid(Color::Green),
        Err(_) => IndicatorMode::Solid(Color::Red),
    }
}
