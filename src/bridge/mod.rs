//! # Command Bridge Module
//!
//! Moves write intents from the bus callback into the poll loop.
//!
//! ```text
//! bridge/
//! ├── fields.rs          - endpoint groups and the writable field table
//! ├── validator.rs       - coercion, range and counterpart checks with fallback
//! ├── remembered.rs      - last good read per group as swapped snapshots
//! ├── command_queue.rs   - FIFO queue with an interruptible wait
//! └── command_bridge.rs  - topic decoding, boost merge, reboot latch
//! ```
//!
//! A multi-field route is always enqueued with its complete field set. The
//! fields the bus did not touch are filled in from the remembered read.

pub mod command_bridge;
pub mod command_queue;
pub mod fields;
pub mod remembered;
pub mod validator;

pub use command_bridge::{CommandBridge, Disposition, RebootLatch};
pub use command_queue::{command_queue, CommandReceiver, CommandSender, PendingCommand, WaitOutcome};
pub use remembered::{remembered_state, RememberedReader, RememberedWriter};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Command queue closed, dropped write to {0}")]
    QueueClosed(String),
}
