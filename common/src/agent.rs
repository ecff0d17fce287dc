use tracing::{error, info, warn};

use crate::{
    config::{Configuration, TimingConfig},
    connectivity::{Broker, ConnectivityMachine, Devices, Network, TickReport},
    error::{IntakeError, StoreError},
    indicator::Indicator,
    intake::{parse_intake, IntakeCommand, CONFIG_TEMPLATE},
    publish::Environment,
    store::{ConfigStore, Storage},
    types::ConnectivityState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Configuration accepted and persisted. `session_reset` is set when the
    /// network or broker identity changed and the old session was dropped.
    Configured { session_reset: bool },
    /// Configuration dropped; `persisted` is false if the stored copy could
    /// not be removed.
    Reset { persisted: bool },
}

/// Everything the scheduler owns: store, current configuration snapshot,
/// connectivity machine and the devices it drives.
pub struct NodeAgent<S, N, B, E, I> {
    store: ConfigStore<S>,
    config: Option<Configuration>,
    machine: ConnectivityMachine,
    devices: Devices<N, B, E, I>,
}

impl<S, N, B, E, I> NodeAgent<S, N, B, E, I>
where
    S: Storage,
    N: Network,
    B: Broker,
    E: Environment,
    I: Indicator,
{
    /// Cold start: loads the persisted configuration, falling back to the
    /// unconfigured state on any failure.
    pub fn start(
        mut store: ConfigStore<S>,
        timing: TimingConfig,
        devices: Devices<N, B, E, I>,
    ) -> Self {
        let config = match store.load() {
            Ok(config) => {
                info!(
                    "loaded configuration for device `{}` (network `{}`)",
                    config.device_name, config.network_ssid
                );
                Some(config)
            }
            Err(StoreError::NotFound) => {
                info!("no configuration found; send a JSON document to configure: {CONFIG_TEMPLATE}");
                None
            }
            Err(err @ (StoreError::Parse(_) | StoreError::Invalid(_))) => {
                warn!("discarded persisted configuration ({err}); restarting unconfigured");
                None
            }
            Err(err) => {
                error!("configuration storage unavailable: {err}");
                None
            }
        };

        let machine = ConnectivityMachine::new(timing, config.is_some());
        Self {
            store,
            config,
            machine,
            devices,
        }
    }

    pub fn config(&self) -> Option<&Configuration> {
        self.config.as_ref()
    }

    pub fn state(&self) -> ConnectivityState {
        self.machine.state()
    }

    pub fn machine(&self) -> &ConnectivityMachine {
        &self.machine
    }

    pub fn devices(&self) -> &Devices<N, B, E, I> {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut Devices<N, B, E, I> {
        &mut self.devices
    }

    pub fn store(&self) -> &ConfigStore<S> {
        &self.store
    }

    pub fn tick(&mut self, now_ms: u64) -> TickReport {
        self.machine
            .tick(self.config.as_ref(), &mut self.devices, now_ms)
    }

    /// Applies one console line. Safe between any two ticks; the snapshot is
    /// only ever replaced as a whole.
    pub fn handle_intake(&mut self, line: &str) -> Result<IntakeOutcome, IntakeError> {
        match parse_intake(line)? {
            IntakeCommand::Reset => {
                let persisted = match self.store.reset() {
                    Ok(()) => true,
                    Err(err) => {
                        error!("failed to remove configuration: {err}");
                        false
                    }
                };
                self.config = None;
                self.devices.broker.disconnect();
                self.machine.reset_session();
                info!("configuration reset; send a new configuration");
                Ok(IntakeOutcome::Reset { persisted })
            }
            IntakeCommand::Configure(config) => {
                self.store.save(&config).map_err(IntakeError::Store)?;
                let (session_reset, rejoin) = match &self.config {
                    Some(current) => (
                        current.requires_reconnect(&config),
                        current.requires_rejoin(&config),
                    ),
                    None => (false, false),
                };
                if session_reset {
                    info!("network or broker settings changed; reconnecting");
                    self.devices.broker.disconnect();
                    if rejoin {
                        self.devices.network.leave();
                    }
                    self.machine.reset_session();
                }
                self.config = Some(config);
                Ok(IntakeOutcome::Configured { session_reset })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::StorageError,
        indicator::{Color, IndicatorMode},
        testing::{
            devices, sample_config, FixedEnvironment, MemoryStorage, RecordingIndicator,
            ScriptedBroker, ScriptedNetwork,
        },
        topics::CONFIG_PATH,
    };

    type TestAgent =
        NodeAgent<MemoryStorage, ScriptedNetwork, ScriptedBroker, FixedEnvironment, RecordingIndicator>;

    fn agent_with(storage: MemoryStorage, network: ScriptedNetwork, broker: ScriptedBroker) -> TestAgent {
        NodeAgent::start(
            ConfigStore::new(storage),
            TimingConfig::default(),
            devices(network, broker),
        )
    }

    fn persisted_sample() -> MemoryStorage {
        MemoryStorage::with_file(CONFIG_PATH, serde_json::to_vec(&sample_config()).unwrap())
    }

    const DOCUMENT_30S: &str = r#"{"network_ssid":"lab-net","network_password":"hunter22","broker_host":"10.0.0.2","broker_port":1883,"broker_user":"node","broker_password":"secret","device_name":"home","temperature_topic":"temp","humidity_topic":"hum","light_topic":"light","publish_interval_ms":30}"#;

    #[test]
    fn cold_start_without_configuration() {
        let mut agent = agent_with(
            MemoryStorage::default(),
            ScriptedNetwork::default(),
            ScriptedBroker::accepting(),
        );
        assert_eq!(agent.state(), ConnectivityState::Unconfigured);

        for now in (0..600).step_by(10) {
            let report = agent.tick(now);
            assert_eq!(report.state, ConnectivityState::Unconfigured);
            assert_eq!(report.indicator, IndicatorMode::Blink(Color::Yellow));
        }

        assert_eq!(agent.devices().network.calls(), 0);
        assert_eq!(agent.devices().broker.calls(), 0);
        assert_eq!(
            agent.devices().indicator.writes[..2],
            [Color::Yellow.rgb(255), crate::indicator::Rgb::OFF]
        );
    }

    #[test]
    fn cold_start_publishes_reading_to_device_topics() {
        let mut agent = agent_with(
            persisted_sample(),
            ScriptedNetwork::default(),
            ScriptedBroker::accepting(),
        );
        assert_eq!(agent.state(), ConnectivityState::JoiningNetwork);

        let first = agent.tick(0);
        assert_eq!(first.state, ConnectivityState::JoiningNetwork);
        assert_eq!(agent.devices().network.join_calls, 1);

        let second = agent.tick(10);
        assert_eq!(second.state, ConnectivityState::Connected);
        assert_eq!(second.publish, Some(Ok(())));
        assert_eq!(second.indicator, IndicatorMode::Solid(Color::Green));
        assert_eq!(
            agent.devices().broker.published,
            vec![
                ("home/temp".to_string(), "22.50".to_string(), true),
                ("home/hum".to_string(), "45.00".to_string(), true),
                ("home/light".to_string(), "300".to_string(), true),
            ]
        );
        assert_eq!(agent.devices().indicator.last(), Color::Green.rgb(255));
    }

    #[test]
    fn corrupt_copy_starts_unconfigured_and_is_removed() {
        let agent = agent_with(
            MemoryStorage::with_file(CONFIG_PATH, r#"{"network_ssid":"#),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );

        assert_eq!(agent.state(), ConnectivityState::Unconfigured);
        assert!(agent.config().is_none());
        assert_eq!(agent.store().storage().get(CONFIG_PATH), None);
    }

    #[test]
    fn reset_while_connected_goes_unconfigured() {
        let mut agent = agent_with(
            persisted_sample(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        assert_eq!(agent.tick(0).state, ConnectivityState::Connected);
        assert_eq!(agent.tick(10).state, ConnectivityState::Connected);

        let outcome = agent.handle_intake("RESET").unwrap();

        assert_eq!(outcome, IntakeOutcome::Reset { persisted: true });
        assert_eq!(agent.store().storage().get(CONFIG_PATH), None);
        let report = agent.tick(20);
        assert_eq!(report.state, ConnectivityState::Unconfigured);
        assert_eq!(report.indicator, IndicatorMode::Blink(Color::Yellow));
    }

    #[test]
    fn reset_clears_snapshot_even_if_storage_fails() {
        let mut agent = agent_with(
            persisted_sample(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        agent.store.storage_mut().fail_writes = true;

        let outcome = agent.handle_intake("RESET").unwrap();

        assert_eq!(outcome, IntakeOutcome::Reset { persisted: false });
        assert_eq!(agent.tick(0).state, ConnectivityState::Unconfigured);
    }

    #[test]
    fn intake_configures_unconfigured_node() {
        let mut agent = agent_with(
            MemoryStorage::default(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        assert_eq!(agent.tick(0).state, ConnectivityState::Unconfigured);

        let outcome = agent.handle_intake(DOCUMENT_30S).unwrap();

        assert_eq!(
            outcome,
            IntakeOutcome::Configured {
                session_reset: false
            }
        );
        let stored: Configuration =
            serde_json::from_slice(agent.store().storage().get(CONFIG_PATH).unwrap()).unwrap();
        assert_eq!(stored.publish_interval_ms, 30_000);
        assert_eq!(agent.config(), Some(&stored));
        assert_eq!(agent.tick(10).state, ConnectivityState::Connected);
    }

    #[test]
    fn rejected_intake_changes_nothing() {
        let mut agent = agent_with(
            persisted_sample(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        let before = agent.store().storage().get(CONFIG_PATH).map(<[u8]>::to_vec);

        let invalid = DOCUMENT_30S.replace(r#""broker_host":"10.0.0.2""#, r#""broker_host":"""#);
        assert!(matches!(
            agent.handle_intake(&invalid),
            Err(IntakeError::Invalid(_))
        ));
        assert!(matches!(
            agent.handle_intake("{oops"),
            Err(IntakeError::Parse(_))
        ));
        assert!(matches!(
            agent.handle_intake("status"),
            Err(IntakeError::Unrecognized)
        ));

        assert_eq!(agent.config(), Some(&sample_config()));
        assert_eq!(
            agent.store().storage().get(CONFIG_PATH).map(<[u8]>::to_vec),
            before
        );
    }

    #[test]
    fn storage_failure_rejects_configuration() {
        let mut agent = agent_with(
            MemoryStorage::default(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        agent.store.storage_mut().fail_writes = true;

        assert!(matches!(
            agent.handle_intake(DOCUMENT_30S),
            Err(IntakeError::Store(_))
        ));
        assert!(agent.config().is_none());
    }

    #[test]
    fn broker_change_reconnects_to_new_host() {
        let mut agent = agent_with(
            persisted_sample(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        assert_eq!(agent.tick(0).state, ConnectivityState::Connected);
        let moved = DOCUMENT_30S.replace("10.0.0.2", "10.0.0.9");

        let outcome = agent.handle_intake(&moved).unwrap();

        assert_eq!(outcome, IntakeOutcome::Configured { session_reset: true });
        assert_eq!(agent.devices().broker.disconnects, 1);
        assert_eq!(agent.devices().network.leave_calls, 0);

        // Inside the retry window of the first attempt: the reset makes the
        // new session immediate.
        let report = agent.tick(10);
        assert_eq!(report.state, ConnectivityState::Connected);
        assert_eq!(report.publish, Some(Ok(())));
        let hosts: Vec<&str> = agent
            .devices()
            .broker
            .connects
            .iter()
            .map(|call| call.host.as_str())
            .collect();
        assert_eq!(hosts, vec!["10.0.0.2", "10.0.0.9"]);
    }

    #[test]
    fn network_change_rejoins() {
        let mut agent = agent_with(
            persisted_sample(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        assert_eq!(agent.tick(0).state, ConnectivityState::Connected);
        let roamed = DOCUMENT_30S.replace("lab-net", "shop-net");

        let outcome = agent.handle_intake(&roamed).unwrap();

        assert_eq!(outcome, IntakeOutcome::Configured { session_reset: true });
        assert_eq!(agent.devices().network.leave_calls, 1);
        assert_eq!(agent.tick(10).state, ConnectivityState::JoiningNetwork);
        assert_eq!(agent.tick(20).state, ConnectivityState::Connected);
    }

    #[test]
    fn interval_change_keeps_session() {
        let mut agent = agent_with(
            persisted_sample(),
            ScriptedNetwork::joined(),
            ScriptedBroker::accepting(),
        );
        assert_eq!(agent.tick(0).state, ConnectivityState::Connected);

        let outcome = agent.handle_intake(DOCUMENT_30S).unwrap();

        assert_eq!(outcome, IntakeOutcome::Configured { session_reset: false });
        assert_eq!(agent.devices().broker.disconnects, 0);
        assert_eq!(agent.devices().broker.connects.len(), 1);
    }

    #[test]
    fn unmountable_storage_starts_unconfigured() {
        let mut storage = persisted_sample();
        storage.fail_mount = true;
        let mut agent = agent_with(storage, ScriptedNetwork::joined(), ScriptedBroker::accepting());

        assert_eq!(agent.state(), ConnectivityState::Unconfigured);
        assert!(agent.config().is_none());
        // Nothing is removed while the medium is unavailable.
        assert!(agent.store().storage().get(CONFIG_PATH).is_some());

        let report = agent.tick(0);
        assert_eq!(report.state, ConnectivityState::Unconfigured);
        assert_eq!(report.indicator, IndicatorMode::Blink(Color::Yellow));
        assert_eq!(agent.devices().broker.connects.len(), 0);

        assert!(matches!(
            agent.handle_intake(DOCUMENT_30S),
            Err(IntakeError::Store(StoreError::Storage(StorageError::Unavailable)))
        ));
        assert!(agent.config().is_none());
        assert_eq!(agent.store().storage().mount_calls, 1);
    }
}
