use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Outgoing, Packet, QoS,
};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::TopicLayout;
use super::message_manager::{BusError, StatePublisher};
use crate::bridge::fields::Group;
use crate::bridge::CommandBridge;
use crate::config::{MqttSettings, TimerConfig};
use crate::retry::RetryController;

const OFFLINE_FLUSH_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Broker refused us for good, the process has to stop
    Failed,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Retained, exactly-once publishing of state documents.
///
/// Uses the non-blocking `try_*` calls of the client, so it can be used from
/// inside the event loop task without awaiting it.
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    layout: TopicLayout,
}

impl MqttPublisher {
    fn publish(&self, topic: String, payload: impl Into<Vec<u8>>) -> Result<(), BusError> {
        self.client
            .try_publish(topic.as_str(), QoS::ExactlyOnce, true, payload)
            .map_err(|e| BusError::Publish {
                topic,
                reason: e.to_string(),
            })
    }

    pub fn publish_availability(&self, online: bool) -> Result<(), BusError> {
        let payload = if online { "online" } else { "offline" };
        self.publish(self.layout.availability_topic(), payload)
    }
}

impl StatePublisher for MqttPublisher {
    fn publish_state(&self, group: Group, document: &Value) -> Result<(), BusError> {
        self.publish(self.layout.state_topic(group), document.to_string())
    }

    fn reset_reboot_button(&self) -> Result<(), BusError> {
        self.publish(self.layout.reboot_topic(), "")
    }
}

pub struct MqttHandler {
    client: AsyncClient,
    event_loop: EventLoop,
    layout: TopicLayout,
    timers: TimerConfig,
    status: watch::Sender<MQTTStatus>,
}

impl MqttHandler {
    pub fn new(
        settings: &MqttSettings,
        timers: &TimerConfig,
    ) -> (Self, Arc<MqttPublisher>, watch::Receiver<MQTTStatus>) {
        let layout = TopicLayout::new(settings);
        let mut mqtt_options =
            MqttOptions::new(settings.client_id.clone(), settings.server.clone(), settings.port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(settings.keep_alive))
            .set_last_will(LastWill::new(
                layout.availability_topic(),
                "offline",
                QoS::AtMostOnce,
                true,
            ));
        if !settings.username.is_empty() {
            mqtt_options.set_credentials(settings.username.clone(), settings.password.clone());
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, 100);
        let publisher = Arc::new(MqttPublisher {
            client: client.clone(),
            layout: layout.clone(),
        });
        let (status, status_rx) = watch::channel(MQTTStatus::default());

        (
            MqttHandler {
                client,
                event_loop,
                layout,
                timers: timers.clone(),
                status,
            },
            publisher,
            status_rx,
        )
    }

    /// Drives the broker connection until `stop` is cancelled.
    ///
    /// An unrecoverable credential rejection cancels `fatal` and ends the task.
    pub async fn run(
        mut self,
        bridge: CommandBridge,
        stop: CancellationToken,
        fatal: CancellationToken,
    ) {
        let retry = RetryController::new(&self.timers);
        self.set_state(ConnectionState::Connecting, None);

        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = self.event_loop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ConnAck {
                    code: ConnectReturnCode::Success,
                    ..
                }))) => {
                    info!("MQTT: Connected to broker");
                    self.set_state(ConnectionState::Connected, None);
                    self.on_connected(&bridge);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.status.send_modify(|s| {
                        s.messages_received += 1;
                        s.last_activity = Some(chrono::Local::now());
                    });
                    let disposition = bridge.handle(&publish.topic, &publish.payload);
                    debug!("MQTT: {} -> {:?}", publish.topic, disposition);
                }
                Ok(_) => {}
                Err(ConnectionError::ConnectionRefused(
                    code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
                )) => {
                    error!("MQTT: Login credentials mismatch ({:?}), giving up", code);
                    self.set_state(ConnectionState::Failed, Some(format!("{:?}", code)));
                    fatal.cancel();
                    return;
                }
                Err(e) => {
                    let decision = retry.bus_decision();
                    warn!(
                        "MQTT: Connection error: {}. Waiting {}: {}s",
                        e,
                        decision.timer.map(|t| t.name()).unwrap_or("none"),
                        decision.wait.as_secs()
                    );
                    self.set_state(ConnectionState::Reconnecting, Some(e.to_string()));
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(decision.wait) => {}
                    }
                }
            }
        }

        self.go_offline().await;
    }

    fn on_connected(&self, bridge: &CommandBridge) {
        let publisher = MqttPublisher {
            client: self.client.clone(),
            layout: self.layout.clone(),
        };
        if let Err(e) = publisher.publish_availability(true) {
            warn!("MQTT: {}", e);
        }
        if let Err(e) = publisher.publish(self.layout.never_available_topic(), "offline") {
            warn!("MQTT: {}", e);
        }
        for topic in self.layout.command_topics() {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                warn!("MQTT: Failed to subscribe to {}: {}", topic, e);
            }
        }
        bridge.announce_info();
    }

    /// Announces `offline` and disconnects, bounded by a short timeout.
    ///
    /// The disconnect waits for the broker to complete the exactly-once
    /// handshake of the `offline` publish, otherwise the broker discards it.
    async fn go_offline(&mut self) {
        if self.status.borrow().connection_state != ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected, None);
            return;
        }

        let client = self.client.clone();
        let availability = self.layout.availability_topic();
        let command_topics = self.layout.command_topics();
        let event_loop = &mut self.event_loop;
        let flush = async {
            client
                .publish(availability.as_str(), QoS::ExactlyOnce, true, "offline")
                .await
                .map_err(|e| e.to_string())?;
            // Queued right behind `offline`: the last publish before the first
            // unsubscribe carries its packet id.
            for topic in &command_topics {
                client
                    .unsubscribe(topic.as_str())
                    .await
                    .map_err(|e| e.to_string())?;
            }

            let mut last_publish = None;
            let mut offline_queued = false;
            let mut unreleased = HashSet::new();
            loop {
                match event_loop.poll().await.map_err(|e| e.to_string())? {
                    Event::Outgoing(Outgoing::Publish(pkid)) if !offline_queued => {
                        last_publish = Some(pkid);
                        unreleased.insert(pkid);
                    }
                    Event::Outgoing(Outgoing::Unsubscribe(_)) => offline_queued = true,
                    Event::Incoming(Packet::PubComp(comp)) => {
                        unreleased.remove(&comp.pkid);
                    }
                    _ => {}
                }
                if offline_queued && last_publish.map_or(true, |pkid| !unreleased.contains(&pkid)) {
                    break;
                }
            }

            client.disconnect().await.map_err(|e| e.to_string())?;
            loop {
                if let Event::Outgoing(Outgoing::Disconnect) =
                    event_loop.poll().await.map_err(|e| e.to_string())?
                {
                    return Ok::<(), String>(());
                }
            }
        };

        match tokio::time::timeout(OFFLINE_FLUSH_TIMEOUT, flush).await {
            Ok(Ok(())) => info!("MQTT: Announced offline and disconnected"),
            Ok(Err(e)) => warn!("MQTT: Offline announcement failed: {}", e),
            Err(_) => warn!("MQTT: Offline announcement timed out"),
        }
        self.set_state(ConnectionState::Disconnected, None);
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        self.status.send_modify(|s| {
            s.connection_state = state;
            if error.is_some() {
                s.last_error = error;
            }
        });
    }
}
