pub mod agent;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod indicator;
pub mod intake;
pub mod publish;
pub mod store;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use agent::{IntakeOutcome, NodeAgent};
pub use config::{Configuration, IntakeDocument, TimingConfig};
pub use connectivity::{Broker, ConnectivityMachine, Devices, Network, TickReport};
pub use error::{ConfigError, IntakeError, PublishError, StorageError, StoreError};
pub use indicator::{Color, Indicator, IndicatorMode, Rgb, StatusIndicator};
pub use intake::{parse_intake, IntakeCommand, CONFIG_TEMPLATE, RESET_COMMAND};
pub use publish::{format_payload, publish_reading, Environment};
pub use store::{ConfigStore, Storage};
pub use topics::*;
pub use types::{BrokerStatus, ConnectivityState, EnvironmentReading, NetworkStatus, ReadingKind};
