//! # Poll Loop
//!
//! Drives the device session: establish, then cycle until something escalates.
//!
//! ```text
//!            ┌──────────── reconnect wait (retry timer) ◄──────────────┐
//!            ▼                                                          │
//!  establish: connect → authenticate → discover capabilities            │
//!            │                                                          │
//!            ▼                                                          │
//!  cycle:    drain queued writes (FIFO)                                 │
//!            live_values                                                │
//!            get_injection_settings   (user_settings)                   │
//!            get_boost_injection      (boost_injection)                 │
//!            get_solmate_info         (daily, once at first connection) │
//!            │                                                          │
//!            ├── escalation ────────────────────────────────────────────┘
//!            ▼
//!  pause:    timer_live, cut short by a queued write
//! ```
//!
//! Exactly one request is in flight at any time. Recoverable failures never
//! leave this module; fatal ones are returned to the caller.

use crate::bridge::fields::Group;
use crate::bridge::{CommandReceiver, PendingCommand, RebootLatch, RememberedWriter};
use crate::config::{BridgeConfig, ConfigError};
use crate::mqtt::message_manager::{device_timestamp, info_document, StatePublisher};
use crate::retry::{RetryAction, RetryController, RetryDecision, Timer};
use crate::session::{Authenticated, CapabilityMap, Connector, DeviceSession, SessionError};
use chrono::{Duration as ChronoDuration, NaiveDateTime, NaiveTime};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const API_INFO_ROUTE: &str = "get_api_info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancelled from outside
    Shutdown,
    ApiInfoDumped,
}

/// Once-a-day trigger at a fixed local wall-clock time.
#[derive(Debug, Clone)]
pub struct DailySchedule {
    at: NaiveTime,
    next_due: Option<NaiveDateTime>,
}

impl DailySchedule {
    pub fn new(at: NaiveTime) -> Self {
        Self { at, next_due: None }
    }

    /// Schedules the next run, either right away or at the next occurrence of the daily time.
    pub fn arm(&mut self, now: NaiveDateTime, immediately: bool) {
        self.next_due = Some(if immediately {
            now
        } else {
            self.next_after(now)
        });
    }

    /// True once per due time; re-arms itself for the following day.
    pub fn due(&mut self, now: NaiveDateTime) -> bool {
        match self.next_due {
            Some(due) if due <= now => {
                self.next_due = Some(self.next_after(now));
                true
            }
            _ => false,
        }
    }

    fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.at);
        if today > now {
            today
        } else {
            today + ChronoDuration::days(1)
        }
    }
}

/// Channels and shared cells the loop works with.
pub struct LoopWiring {
    pub queue: CommandReceiver,
    pub remembered: RememberedWriter,
    pub capabilities: watch::Sender<CapabilityMap>,
    pub reboot: RebootLatch,
    /// `None` when the bus is disabled
    pub publisher: Option<Arc<dyn StatePublisher>>,
}

struct Escalation {
    error: SessionError,
    decision: RetryDecision,
}

pub struct PollLoop {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    retry: RetryController,
    queue: CommandReceiver,
    remembered: RememberedWriter,
    capabilities: watch::Sender<CapabilityMap>,
    reboot: RebootLatch,
    publisher: Option<Arc<dyn StatePublisher>>,
    daily: DailySchedule,
    first_connection: bool,
    reboot_sent: bool,
    cancel: CancellationToken,
}

impl PollLoop {
    pub fn new(
        config: BridgeConfig,
        connector: Arc<dyn Connector>,
        wiring: LoopWiring,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let daily = DailySchedule::new(config.general.daily_info_time()?);
        Ok(Self {
            retry: RetryController::new(&config.timers),
            config,
            connector,
            queue: wiring.queue,
            remembered: wiring.remembered,
            capabilities: wiring.capabilities,
            reboot: wiring.reboot,
            publisher: wiring.publisher,
            daily,
            first_connection: true,
            reboot_sent: false,
            cancel,
        })
    }

    /// Runs until cancelled or until a fatal failure.
    pub async fn run(mut self) -> Result<LoopExit, SessionError> {
        let cancel = self.cancel.clone();
        loop {
            let established = tokio::select! {
                _ = cancel.cancelled() => return Ok(LoopExit::Shutdown),
                established = self.establish() => established,
            };

            let mut session = match established {
                Ok(session) => session,
                Err(error) => {
                    let decision = self.retry.on_failure(error.kind(), self.reboot_sent);
                    if decision.action == RetryAction::Exit {
                        return Err(error);
                    }
                    warn!("Device connection failed: {}", error);
                    let decision = self.as_reconnect(decision);
                    if self.back_off(decision, &cancel).await {
                        return Ok(LoopExit::Shutdown);
                    }
                    continue;
                }
            };

            if self.config.general.api_info {
                let response = session.request(API_INFO_ROUTE, json!({})).await;
                session.close().await;
                let response = response?;
                println!(
                    "'{}' route info requested:\n{}",
                    API_INFO_ROUTE,
                    serde_json::to_string_pretty(&response).unwrap_or_default()
                );
                return Ok(LoopExit::ApiInfoDumped);
            }

            let now = chrono::Local::now().naive_local();
            self.daily.arm(now, self.first_connection);
            self.first_connection = false;

            let escalation = tokio::select! {
                _ = cancel.cancelled() => {
                    session.close().await;
                    return Ok(LoopExit::Shutdown);
                }
                escalation = self.serve(&mut session) => escalation,
            };
            let last_message = session.last_message_id();
            session.close().await;

            if escalation.decision.action == RetryAction::Exit {
                return Err(escalation.error);
            }
            warn!(
                "Device session lost after message {}: {}",
                last_message, escalation.error
            );
            if self.back_off(escalation.decision, &cancel).await {
                return Ok(LoopExit::Shutdown);
            }
        }
    }

    async fn establish(&mut self) -> Result<DeviceSession<Authenticated>, SessionError> {
        let device = &self.config.device;
        let (mut session, outcome) = DeviceSession::create(
            self.connector.clone(),
            device.server_uri.clone(),
            self.config.timers.request_timeout(),
        )
        .connect()
        .await?
        .authenticate(device, self.config.timers.max_redirects)
        .await?;

        let capabilities = CapabilityMap::discover(&mut session, outcome).await?;
        self.capabilities.send_replace(capabilities);
        Ok(session)
    }

    /// Cycles until a failure asks for a reconnect or an exit.
    async fn serve(&mut self, session: &mut DeviceSession<Authenticated>) -> Escalation {
        let live = Timer::Live.duration(&self.config.timers);
        loop {
            if let Err(escalation) = self.cycle(session).await {
                return escalation;
            }
            let outcome = self.queue.wait(live, true).await;
            debug!("Pause ended: {:?}", outcome);
        }
    }

    async fn cycle(&mut self, session: &mut DeviceSession<Authenticated>) -> Result<(), Escalation> {
        self.dispatch_writes(session).await?;

        let capabilities = *self.capabilities.borrow();
        self.read(session, Group::Live).await?;
        if capabilities.user_settings {
            self.read(session, Group::Injection).await?;
        }
        if capabilities.boost_injection {
            self.read(session, Group::Boost).await?;
        }
        if self.daily.due(chrono::Local::now().naive_local()) {
            info!("Daily info read due");
            self.read(session, Group::Info).await?;
        }
        Ok(())
    }

    async fn dispatch_writes(
        &mut self,
        session: &mut DeviceSession<Authenticated>,
    ) -> Result<(), Escalation> {
        let mut pending = VecDeque::from(self.queue.drain());
        while let Some(command) = pending.pop_front() {
            if command == PendingCommand::Reboot {
                self.reboot_sent = true;
            }
            let route = command.route().to_string();
            let payload = command.payload();
            let accepted = match self.query(session, &route, payload.clone()).await {
                Ok(Some(response)) => {
                    let success = response.get("success").and_then(Value::as_bool) == Some(true);
                    if success {
                        info!("Wrote {} {}", route, payload);
                    } else {
                        warn!("Write back to device failed: {} {} -> {}", route, payload, response);
                    }
                    success
                }
                Ok(None) => false,
                Err(escalation) => {
                    self.queue.requeue(pending.into());
                    return Err(escalation);
                }
            };
            if command == PendingCommand::Reboot && !accepted {
                warn!("Device did not take the reboot, releasing the reboot button");
                self.end_reboot();
            }
        }
        Ok(())
    }

    async fn read(
        &mut self,
        session: &mut DeviceSession<Authenticated>,
        group: Group,
    ) -> Result<(), Escalation> {
        if let Some(response) = self.query(session, group.read_route(), json!({})).await? {
            self.publish_read(group, response);
        }
        Ok(())
    }

    /// One request; `Ok(None)` means a transient failure with nothing to process.
    async fn query(
        &mut self,
        session: &mut DeviceSession<Authenticated>,
        route: &str,
        data: Value,
    ) -> Result<Option<Value>, Escalation> {
        match session.request(route, data).await {
            Ok(response) => {
                self.retry.record_success();
                Ok(Some(response))
            }
            Err(error) => {
                let decision = self.retry.on_failure(error.kind(), self.reboot_sent);
                match decision.action {
                    RetryAction::Continue => {
                        warn!("'{}' gave no data this cycle: {}", route, error);
                        Ok(None)
                    }
                    RetryAction::Reconnect | RetryAction::Exit => Err(Escalation { error, decision }),
                }
            }
        }
    }

    fn publish_read(&self, group: Group, response: Value) {
        let Value::Object(mut document) = response else {
            warn!("Ignoring non-object '{}' response", group.read_route());
            return;
        };
        if group == Group::Info && !document.contains_key("timestamp") {
            let now = chrono::Local::now().naive_local();
            document.insert("timestamp".into(), Value::from(device_timestamp(now)));
        }
        if self.config.general.print_response {
            info!(
                "{}:\n{}",
                group.read_route(),
                serde_json::to_string_pretty(&document).unwrap_or_default()
            );
        }

        self.remembered.record(group, document.clone());

        if let Some(publisher) = &self.publisher {
            let state = match group {
                Group::Info => {
                    info_document(&document, &self.capabilities.borrow(), self.reboot.is_engaged())
                }
                _ => Value::Object(document),
            };
            if let Err(e) = publisher.publish_state(group, &state) {
                warn!("{}", e);
            }
        }
    }

    /// Escalation during establish has no session to keep, so a "continue" becomes a reconnect.
    fn as_reconnect(&self, decision: RetryDecision) -> RetryDecision {
        if decision.action != RetryAction::Continue {
            return decision;
        }
        let timer = if self.reboot_sent { Timer::Reboot } else { Timer::ConnErr };
        RetryDecision {
            action: RetryAction::Reconnect,
            timer: Some(timer),
            wait: timer.duration(&self.config.timers),
            queue_drain_suppressed: true,
            ..decision
        }
    }

    /// Waits out a reconnect decision. Returns true when cancelled meanwhile.
    async fn back_off(&mut self, decision: RetryDecision, cancel: &CancellationToken) -> bool {
        let timer = decision.timer.map(|t| t.to_string()).unwrap_or_default();
        info!(
            "Waiting {}s ({}) before reconnecting",
            decision.wait.as_secs(),
            timer
        );
        let interruptible = !decision.queue_drain_suppressed;
        tokio::select! {
            _ = cancel.cancelled() => return true,
            _ = self.queue.wait(decision.wait, interruptible) => {}
        }
        self.complete_reboot();
        false
    }

    fn complete_reboot(&mut self) {
        if !self.reboot_sent {
            return;
        }
        info!("Reboot wait finished, back to normal operation");
        self.end_reboot();
    }

    /// Resets the reboot button and latch and announces the device as online again.
    fn end_reboot(&mut self) {
        self.reboot_sent = false;
        if let Some(publisher) = &self.publisher {
            if let Err(e) = publisher.reset_reboot_button() {
                warn!("{}", e);
            }
        }
        self.reboot.release();

        let snapshot = self.remembered.snapshot();
        if let (Some(publisher), Some(info)) = (&self.publisher, snapshot.get(Group::Info)) {
            let document = info_document(info, &self.capabilities.borrow(), false);
            if let Err(e) = publisher.publish_state(Group::Info, &document) {
                warn!("{}", e);
            }
        }
    }
}
