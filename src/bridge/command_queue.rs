//! FIFO hand-off of write intents from the bus task to the poll loop.
//!
//! ```text
//! bus callback ──► CommandSender ──[unbounded mpsc]──► CommandReceiver ──► poll loop
//!                                                        (drain / wait)
//! ```
//!
//! The receiver keeps a small stash so that a command which ends a wait early
//! is not lost: it is handed out first by the next [`CommandReceiver::drain`].

use super::BridgeError;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

pub const SHUTDOWN_ROUTE: &str = "shutdown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingCommand {
    Write {
        route: String,
        fields: BTreeMap<String, i64>,
    },
    /// Shares the `shutdown` route, disambiguated by the payload
    Reboot,
}

impl PendingCommand {
    pub fn route(&self) -> &str {
        match self {
            PendingCommand::Write { route, .. } => route,
            PendingCommand::Reboot => SHUTDOWN_ROUTE,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            PendingCommand::Write { fields, .. } => json!(fields),
            PendingCommand::Reboot => json!({ "shut_reboot": "reboot" }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    CommandArrived,
}

pub fn command_queue() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        CommandSender { tx },
        CommandReceiver {
            rx,
            stash: VecDeque::new(),
        },
    )
}

#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<PendingCommand>,
}

impl CommandSender {
    pub fn push(&self, command: PendingCommand) -> Result<(), BridgeError> {
        debug!("Queueing {} {}", command.route(), command.payload());
        self.tx
            .send(command)
            .map_err(|e| BridgeError::QueueClosed(e.0.route().to_string()))
    }
}

#[derive(Debug)]
pub struct CommandReceiver {
    rx: mpsc::UnboundedReceiver<PendingCommand>,
    stash: VecDeque<PendingCommand>,
}

impl CommandReceiver {
    /// Takes everything queued right now, oldest first.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        let mut commands: Vec<_> = self.stash.drain(..).collect();
        while let Ok(command) = self.rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    /// Puts undelivered commands back in front of everything still queued.
    pub fn requeue(&mut self, commands: Vec<PendingCommand>) {
        for command in commands.into_iter().rev() {
            self.stash.push_front(command);
        }
    }

    /// Sleeps for `duration`.
    ///
    /// When `interruptible`, a queued command ends the wait early. A
    /// non-interruptible wait always runs to the end and leaves commands queued.
    pub async fn wait(&mut self, duration: Duration, interruptible: bool) -> WaitOutcome {
        if !interruptible {
            tokio::time::sleep(duration).await;
            return WaitOutcome::Elapsed;
        }
        if !self.stash.is_empty() {
            return WaitOutcome::CommandArrived;
        }

        let deadline = tokio::time::Instant::now() + duration;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => WaitOutcome::Elapsed,
            received = self.rx.recv() => match received {
                Some(command) => {
                    self.stash.push_back(command);
                    WaitOutcome::CommandArrived
                }
                None => {
                    // no producer left, nothing can interrupt any more
                    tokio::time::sleep_until(deadline).await;
                    WaitOutcome::Elapsed
                }
            },
        }
    }
}
