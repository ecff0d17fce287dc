use tracing::{debug, warn};

use crate::{
    config::Configuration,
    connectivity::Broker,
    error::PublishError,
    topics::Topics,
    types::{EnvironmentReading, ReadingKind},
};

/// Sensor acquisition. Never fails; a reading may be stale.
pub trait Environment {
    fn read(&mut self) -> EnvironmentReading;
}

pub fn format_payload(kind: ReadingKind, reading: &EnvironmentReading) -> String {
    match kind {
        ReadingKind::Temperature => format!("{:.2}", reading.temperature),
        ReadingKind::Humidity => format!("{:.2}", reading.humidity),
        ReadingKind::Light => reading.light.to_string(),
    }
}

/// Publishes temperature, humidity and light as retained messages, in that
/// order. Every topic is attempted; the ones that succeeded stay published
/// even when another one fails.
pub fn publish_reading<B: Broker>(
    broker: &mut B,
    config: &Configuration,
    reading: &EnvironmentReading,
) -> Result<(), PublishError> {
    let topics = Topics::for_config(config);
    let mut failed = Vec::new();

    for kind in [
        ReadingKind::Temperature,
        ReadingKind::Humidity,
        ReadingKind::Light,
    ] {
        let topic = topics.get(kind);
        let payload = format_payload(kind, reading);
        if broker.publish(topic, &payload, true) {
            debug!("published {} `{payload}` to {topic}", kind.as_str());
        } else {
            warn!("failed to publish {} to {topic}", kind.as_str());
            failed.push(kind);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(PublishError::Partial { failed })
    }
}
