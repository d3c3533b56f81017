//! State documents and the publishing contract towards the bus.

use crate::bridge::fields::Group;
use crate::bridge::remembered::Document;
use crate::session::CapabilityMap;
use chrono::NaiveDateTime;
use serde_json::Value;
use thiserror::Error;

pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Publishing side of the bus as seen by the poll loop and the bus callback.
///
/// Implementations must not block: they are called from inside the bus event
/// loop as well.
pub trait StatePublisher: Send + Sync {
    fn publish_state(&self, group: Group, document: &Value) -> Result<(), BusError>;

    /// Clears the retained reboot button payload.
    fn reset_reboot_button(&self) -> Result<(), BusError>;
}

/// Local timestamp format used by the device and injected where it is missing.
pub fn device_timestamp(now: NaiveDateTime) -> String {
    now.format("%Y-%m-%dT%H:%M:%S").to_string()
}

/// Builds the `info` state document from the remembered info read.
pub fn info_document(info: &Document, capabilities: &CapabilityMap, rebooting: bool) -> Value {
    let mut document = info.clone();
    document.insert(
        "operating_state".into(),
        Value::from(if rebooting { "rebooting" } else { "online" }),
    );
    document.insert(
        "connected_to".into(),
        Value::from(if capabilities.local { "local" } else { "cloud" }),
    );
    document.insert("bridge_version".into(), Value::from(BRIDGE_VERSION));
    Value::Object(document)
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn info_is_enriched() {
        let info = json!({"version": "1.2", "ip": "10.0.0.2"}).as_object().cloned().unwrap();
        let caps = CapabilityMap {
            local: true,
            shutdown: true,
            ..Default::default()
        };
        let doc = info_document(&info, &caps, true);
        assert_eq!(doc["operating_state"], "rebooting");
        assert_eq!(doc["connected_to"], "local");
        assert_eq!(doc["version"], "1.2");
        assert_eq!(
            info_document(&info, &CapabilityMap::default(), false)["connected_to"],
            "cloud"
        );
    }

    #[test]
    fn timestamp_format() {
        let now = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(23, 45, 0)
            .unwrap();
        assert_eq!(device_timestamp(now), "2024-05-01T23:45:00");
    }
}
