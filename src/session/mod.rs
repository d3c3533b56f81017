//! # Device Session Module
//!
//! Everything that talks to the device: the transport abstraction, the
//! authenticated session state machine, the failure taxonomy and the probing of
//! optional routes.
//!
//! ```text
//! session/
//! ├── error.rs           - SessionError and the ErrorKind taxonomy
//! ├── transport.rs       - Connector/DeviceTransport traits, websocket implementation
//! ├── device_session.rs  - Disconnected → Connected → Authenticated lifecycle
//! └── capabilities.rs    - CapabilityMap discovery after authentication
//! ```
//!
//! A session is never repaired in place. Any failure that needs a reconnect
//! drops the session and the poll loop builds a new one from scratch.

pub mod capabilities;
pub mod device_session;
pub mod error;
pub mod transport;

pub use capabilities::CapabilityMap;
pub use device_session::{AuthOutcome, Authenticated, DeviceSession};
pub use error::{ErrorKind, SessionError};
pub use transport::{Connector, WebSocketConnector};
