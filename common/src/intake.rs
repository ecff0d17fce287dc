use crate::{
    config::{Configuration, IntakeDocument},
    error::IntakeError,
};

pub const RESET_COMMAND: &str = "RESET";

/// Printed when the node has nothing to run with.
pub const CONFIG_TEMPLATE: &str = r#"{ "network_ssid": "your_ssid", "network_password": "your_password", "broker_host": "your_broker", "broker_port": 1883, "broker_user": "your_user", "broker_password": "your_password", "device_name": "your_device", "temperature_topic": "temperature", "humidity_topic": "humidity", "light_topic": "light", "publish_interval_ms": 60 }"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeCommand {
    Reset,
    Configure(Configuration),
}

/// Parses one line from the console. Configuration documents are validated
/// here, so `Configure` always carries a usable configuration.
pub fn parse_intake(line: &str) -> Result<IntakeCommand, IntakeError> {
    let line = line.trim();

    if line.is_empty() {
        return Err(IntakeError::Empty);
    }
    if line == RESET_COMMAND {
        return Ok(IntakeCommand::Reset);
    }
    if !line.starts_with('{') {
        return Err(IntakeError::Unrecognized);
    }

    let document: IntakeDocument = serde_json::from_str(line).map_err(IntakeError::Parse)?;
    Ok(IntakeCommand::Configure(document.into_configuration()?))
}
