use crate::bridge::fields::{self, Group, WritableField};
use crate::config::MqttSettings;

/// Topic naming for one bridged device.
///
/// ```text
/// {prefix}/sensor/{topic}/{group}            retained state documents
/// {prefix}/sensor/{topic}/availability       online / offline (last will)
/// {prefix}/number/{topic}/{field}            writable fields
/// {prefix}/button/{topic}/command/reboot     reboot button
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    sensor_base: String,
    number_base: String,
    button_base: String,
}

impl TopicLayout {
    pub fn new(settings: &MqttSettings) -> Self {
        Self {
            sensor_base: format!("{}/sensor/{}", settings.prefix, settings.topic),
            number_base: format!("{}/number/{}", settings.prefix, settings.topic),
            button_base: format!("{}/button/{}", settings.prefix, settings.topic),
        }
    }

    pub fn state_topic(&self, group: Group) -> String {
        format!("{}/{}", self.sensor_base, group.endpoint())
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.sensor_base)
    }

    pub fn never_available_topic(&self) -> String {
        format!("{}/never_available", self.sensor_base)
    }

    pub fn command_topic(&self, field: &WritableField) -> String {
        format!("{}/{}", self.number_base, field.name)
    }

    pub fn reboot_topic(&self) -> String {
        format!("{}/command/reboot", self.button_base)
    }

    pub fn is_reboot_topic(&self, topic: &str) -> bool {
        topic == self.reboot_topic()
    }

    pub fn field_for_topic(&self, topic: &str) -> Option<&'static WritableField> {
        let name = topic.strip_prefix(&self.number_base)?.strip_prefix('/')?;
        fields::find(name)
    }

    /// Every topic the bridge subscribes to.
    pub fn command_topics(&self) -> Vec<String> {
        fields::FIELDS
            .iter()
            .map(|f| self.command_topic(f))
            .chain(std::iter::once(self.reboot_topic()))
            .collect()
    }
}
