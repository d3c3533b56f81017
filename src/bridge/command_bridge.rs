use super::command_queue::{CommandSender, PendingCommand};
use super::fields::{self, Group, WritableField};
use super::remembered::RememberedReader;
use super::validator::{self, remembered_int};
use crate::config::LimitConfig;
use crate::mqtt::config::TopicLayout;
use crate::mqtt::message_manager::{info_document, StatePublisher};
use crate::session::CapabilityMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Set while a reboot has been requested and not yet seen through.
#[derive(Debug, Clone, Default)]
pub struct RebootLatch(Arc<AtomicBool>);

impl RebootLatch {
    /// Returns false when a reboot is already in progress.
    pub fn try_engage(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Queued(PendingCommand),
    Ignored(&'static str),
}

/// Producer side of the bridge, called for every inbound bus message.
pub struct CommandBridge {
    layout: TopicLayout,
    limits: LimitConfig,
    remembered: RememberedReader,
    capabilities: watch::Receiver<CapabilityMap>,
    reboot: RebootLatch,
    queue: CommandSender,
    publisher: Arc<dyn StatePublisher>,
}

impl CommandBridge {
    pub fn new(
        layout: TopicLayout,
        limits: LimitConfig,
        remembered: RememberedReader,
        capabilities: watch::Receiver<CapabilityMap>,
        reboot: RebootLatch,
        queue: CommandSender,
        publisher: Arc<dyn StatePublisher>,
    ) -> Self {
        Self {
            layout,
            limits,
            remembered,
            capabilities,
            reboot,
            queue,
            publisher,
        }
    }

    /// Republishes the remembered info document, if any.
    pub fn announce_info(&self) {
        let capabilities = *self.capabilities.borrow();
        if let Some(info) = self.remembered.snapshot().get(Group::Info) {
            let document = info_document(info, &capabilities, self.reboot.is_engaged());
            if let Err(e) = self.publisher.publish_state(Group::Info, &document) {
                warn!("Could not republish info: {}", e);
            }
        }
    }

    pub fn handle(&self, topic: &str, payload: &[u8]) -> Disposition {
        let text = String::from_utf8_lossy(payload).replace("\"\"", "");
        let value = text.trim();
        if value.is_empty() {
            return Disposition::Ignored("empty payload");
        }

        let disposition = if self.layout.is_reboot_topic(topic) {
            self.handle_reboot()
        } else if let Some(field) = self.layout.field_for_topic(topic) {
            self.handle_write(field, value)
        } else {
            Disposition::Ignored("unknown topic")
        };

        match &disposition {
            Disposition::Queued(command) => {
                if let Err(e) = self.queue.push(command.clone()) {
                    warn!("{}", e);
                    if *command == PendingCommand::Reboot {
                        self.reboot.release();
                        self.announce_info();
                    }
                    return Disposition::Ignored("queue closed");
                }
            }
            Disposition::Ignored(reason) => debug!("Ignoring {} ({})", topic, reason),
        }
        disposition
    }

    fn handle_reboot(&self) -> Disposition {
        let capabilities = *self.capabilities.borrow();
        if !capabilities.shutdown {
            return Disposition::Ignored("reboot not available on this connection");
        }
        if !self.reboot.try_engage() {
            return Disposition::Ignored("reboot already in progress");
        }

        self.announce_info();
        info!("Initializing device reboot");
        Disposition::Queued(PendingCommand::Reboot)
    }

    fn handle_write(&self, field: &WritableField, raw: &str) -> Disposition {
        let capabilities = *self.capabilities.borrow();
        let available = match field.group {
            Group::Boost => capabilities.boost_injection,
            Group::Injection => capabilities.user_settings,
            Group::Live | Group::Info => false,
        };
        if !available {
            return Disposition::Ignored("route not available on this connection");
        }

        let snapshot = self.remembered.snapshot();
        let Some(remembered) = snapshot.get(field.group) else {
            warn!(
                "Write to {} before the first {} read, skipping",
                field.name,
                field.group.endpoint()
            );
            return Disposition::Ignored("group not read yet");
        };

        let checked = validator::validate(field, raw, field.bounds(&self.limits), remembered);
        if let Some(rejection) = &checked.rejection {
            if remembered_int(remembered, field.name).is_none() {
                warn!(
                    "Key '{}': {}, no remembered value to fall back to, skipping",
                    field.name, rejection
                );
                return Disposition::Ignored("no remembered value");
            }
            warn!(
                "Key '{}': {}, using last valid: {}",
                field.name, rejection, checked.value
            );
        }

        let mut write = BTreeMap::new();
        for sibling in fields::route_fields(field.route) {
            if sibling.name == field.name {
                continue;
            }
            let Some(current) = remembered_int(remembered, sibling.name) else {
                warn!(
                    "No remembered {} to complete {}, skipping",
                    sibling.name, field.route
                );
                return Disposition::Ignored("incomplete field set");
            };
            write.insert(sibling.wire_key.to_string(), current);
        }
        write.insert(field.wire_key.to_string(), checked.value);

        Disposition::Queued(PendingCommand::Write {
            route: field.route.to_string(),
            fields: write,
        })
    }
}
