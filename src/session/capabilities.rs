use super::device_session::{AuthOutcome, Authenticated, DeviceSession};
use super::error::SessionError;
use tracing::info;

pub const BOOST_PROBE_ROUTE: &str = "get_boost_injection";
pub const USER_SETTINGS_PROBE_ROUTE: &str = "get_injection_settings";

/// Optional routes and features available on the current connection.
///
/// Discovered once per authenticated session and never mutated afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityMap {
    pub boost_injection: bool,
    pub user_settings: bool,
    /// Reboot/shutdown is only offered on a local connection
    pub shutdown: bool,
    pub local: bool,
}

impl CapabilityMap {
    pub async fn discover(
        session: &mut DeviceSession<Authenticated>,
        auth: AuthOutcome,
    ) -> Result<Self, SessionError> {
        let capabilities = Self {
            boost_injection: session.probe(BOOST_PROBE_ROUTE).await?,
            user_settings: session.probe(USER_SETTINGS_PROBE_ROUTE).await?,
            shutdown: auth.local,
            local: auth.local,
        };
        info!("Capabilities: {:?}", capabilities);
        Ok(capabilities)
    }
}
