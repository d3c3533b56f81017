//! Error taxonomy of the device session

use thiserror::Error;

/// Failure classes the retry controller reasons about.
///
/// Every [`SessionError`] maps to exactly one kind. Kinds carry no payload so
/// they can be compared and copied freely by the retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transport could not be opened
    ConnectFailed,
    /// Device rejected the password; retrying can never succeed
    BadCredentials,
    /// Login/authenticate exchange failed for any other reason
    AuthFailed,
    /// Load balancer kept redirecting past the configured hop bound
    RedirectLimit,
    /// Route does not exist on this device
    RouteNotFound,
    /// Peer closed the connection
    ConnectionClosed,
    /// Keepalive failed or the device stopped answering
    PingTimeout,
    /// Anything else; counted toward the escalation threshold
    Unclassified,
}

impl ErrorKind {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::BadCredentials | ErrorKind::RouteNotFound | ErrorKind::RedirectLimit
        )
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to connect to {uri}: {reason}")]
    ConnectFailed { uri: String, reason: String },

    #[error("Password for {serial} does not match")]
    BadCredentials { serial: String },

    #[error("Authentication of {serial} failed: {reason}")]
    AuthFailed { serial: String, reason: String },

    #[error("Redirected more than {max_hops} times, last target {last_uri}")]
    RedirectLimit { max_hops: u32, last_uri: String },

    #[error("Route '{route}' is not implemented: {detail}")]
    RouteNotFound { route: String, detail: String },

    #[error("Device returned an error for '{route}': {detail}")]
    Protocol { route: String, detail: String },

    #[error("Malformed response for '{route}': {detail}")]
    Malformed { route: String, detail: String },

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Keepalive failed: {0}")]
    PingTimeout(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            SessionError::BadCredentials { .. } => ErrorKind::BadCredentials,
            SessionError::AuthFailed { .. } => ErrorKind::AuthFailed,
            SessionError::RedirectLimit { .. } => ErrorKind::RedirectLimit,
            SessionError::RouteNotFound { .. } => ErrorKind::RouteNotFound,
            SessionError::ConnectionClosed => ErrorKind::ConnectionClosed,
            SessionError::PingTimeout(_) => ErrorKind::PingTimeout,
            SessionError::Protocol { .. }
            | SessionError::Malformed { .. }
            | SessionError::Transport(_) => ErrorKind::Unclassified,
        }
    }

    /// Turns a failure of the login/authenticate exchange into [`SessionError::AuthFailed`],
    /// keeping the kinds that have their own handling.
    pub(crate) fn into_auth_failure(self, serial: &str) -> SessionError {
        match self.kind() {
            ErrorKind::BadCredentials | ErrorKind::RedirectLimit | ErrorKind::ConnectFailed => self,
            _ => SessionError::AuthFailed {
                serial: serial.to_string(),
                reason: self.to_string(),
            },
        }
    }
}

/// Device error texts that identify a missing route.
///
/// The firmware spells the exception name both correctly and with a typo.
const ROUTE_NOT_FOUND_MARKERS: [&str; 2] = ["NotImplementedError", "NotImplemetedError"];

/// Classifies the payload of an `{"error": ...}` response.
pub fn classify_error_response(route: &str, detail: String) -> SessionError {
    if ROUTE_NOT_FOUND_MARKERS.iter().any(|m| detail.contains(m)) {
        SessionError::RouteNotFound {
            route: route.to_string(),
            detail,
        }
    } else if detail.contains("sent 1011") {
        SessionError::PingTimeout(detail)
    } else {
        SessionError::Protocol {
            route: route.to_string(),
            detail,
        }
    }
}
