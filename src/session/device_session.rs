//! Device session with statum state machine for the connection lifecycle
//!
//! Owns the single connection to the device, the login/authenticate handshake
//! including load-balancer redirects, and the request/response primitive.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──► Connected ──► Authenticated ──► (dropped on any failure)
//!                      ▲  │
//!                      └──┘
//!                   (redirect: reopen transport, resubmit authenticate)
//! ```
//!
//! Only an `Authenticated` session exposes [`DeviceSession::request`], so routes
//! other than `login`/`authenticate` cannot be sent before the handshake.
//!
//! # Wire format
//!
//! ```text
//! request:  {"id": <n>, "route": "<route>", "data": {...}}
//! response: {"data": {...}} | {"error": ...}
//! ```

use super::error::{classify_error_response, SessionError};
use super::transport::{Connector, DeviceTransport};
use crate::config::DeviceConfig;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Disconnected,  // Endpoint known, no transport yet
    Connected,     // Transport open, handshake pending
    Authenticated, // Signature accepted by the final endpoint
}

#[machine]
pub struct DeviceSession<S: SessionState> {
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn DeviceTransport>>,
    endpoint: String,
    message_id: u64,
    request_timeout: Duration,
}

/// What the handshake learned about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub online: bool,
    pub local: bool,
}

impl<S: SessionState> DeviceSession<S> {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn last_message_id(&self) -> u64 {
        self.message_id
    }

    /// Sends one request and waits for its response.
    ///
    /// Assigns the next message id before sending. A missing response within
    /// the request timeout is reported as a keepalive failure.
    async fn exchange(&mut self, route: &str, data: Value) -> Result<Value, SessionError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(SessionError::ConnectionClosed)?;

        self.message_id += 1;
        let request = json!({ "id": self.message_id, "route": route, "data": data });
        debug!("-> {} (id {})", route, self.message_id);
        transport.send_text(request.to_string()).await?;

        let text = tokio::time::timeout(self.request_timeout, transport.recv_text())
            .await
            .map_err(|_| {
                SessionError::PingTimeout(format!(
                    "no response for '{}' within {:?}",
                    route, self.request_timeout
                ))
            })??;

        parse_response(route, &text)
    }

    async fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }
}

impl DeviceSession<Disconnected> {
    pub fn create(
        connector: Arc<dyn Connector>,
        endpoint: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        let endpoint = endpoint.into();
        info!("Initializing device session for {}", endpoint);
        Self::new(connector, None, endpoint, 0, request_timeout)
    }

    /// Opens the transport to the current endpoint.
    pub async fn connect(mut self) -> Result<DeviceSession<Connected>, SessionError> {
        let transport = self.connector.connect(&self.endpoint).await?;
        self.transport = Some(transport);
        Ok(self.transition())
    }
}

impl DeviceSession<Connected> {
    /// Runs the login/authenticate handshake, following at most `max_redirects` redirects.
    ///
    /// # Errors
    ///
    /// * [`SessionError::BadCredentials`] - the device answered `success: false` to login
    /// * [`SessionError::RedirectLimit`] - more redirects than allowed
    /// * [`SessionError::ConnectFailed`] - a redirect target could not be opened
    /// * [`SessionError::AuthFailed`] - everything else during the handshake
    pub async fn authenticate(
        mut self,
        device: &DeviceConfig,
        max_redirects: u32,
    ) -> Result<(DeviceSession<Authenticated>, AuthOutcome), SessionError> {
        let serial = device.auth_serial().to_string();
        info!("Authenticating {}", serial);

        let login = self
            .exchange(
                "login",
                json!({
                    "serial_num": serial,
                    "user_password_hash": password_hash(&device.password),
                    "device_id": device.device_id,
                }),
            )
            .await
            .map_err(|e| e.into_auth_failure(&serial))?;

        if login.get("success").and_then(Value::as_bool) == Some(false) {
            error!("Password for {} does not match", serial);
            return Err(SessionError::BadCredentials { serial });
        }

        let signature = match login.get("signature").and_then(Value::as_str) {
            Some(signature) if login.get("success").and_then(Value::as_bool) == Some(true) => {
                signature.to_string()
            }
            _ => {
                return Err(SessionError::AuthFailed {
                    serial,
                    reason: "signature missing in login response".into(),
                })
            }
        };

        let mut hops = 0;
        let response = loop {
            let response = self
                .exchange(
                    "authenticate",
                    json!({
                        "serial_num": serial,
                        "signature": signature,
                        "device_id": device.device_id,
                    }),
                )
                .await
                .map_err(|e| e.into_auth_failure(&serial))?;

            match redirect_target(&response) {
                Some(target) => {
                    hops += 1;
                    if hops > max_redirects {
                        error!("Redirect bound of {} exceeded at {}", max_redirects, target);
                        return Err(SessionError::RedirectLimit {
                            max_hops: max_redirects,
                            last_uri: target,
                        });
                    }
                    info!("Got redirected to {} (hop {}/{})", target, hops, max_redirects);
                    self.reopen(target).await?;
                }
                None => break response,
            }
        };

        if response.as_object().map_or(true, |o| o.is_empty()) {
            return Err(SessionError::AuthFailed {
                serial,
                reason: "empty authenticate response".into(),
            });
        }

        let local = device.is_local_uri(&device.server_uri);
        let outcome = match response.get("online").and_then(Value::as_bool) {
            Some(online) => AuthOutcome {
                online,
                local: false,
            },
            None => AuthOutcome {
                online: local,
                local,
            },
        };

        info!("Authentication of {} successful via {}", serial, self.endpoint);
        if outcome.online {
            info!("Device is online");
        } else {
            warn!("Device is offline");
        }
        Ok((self.transition(), outcome))
    }

    async fn reopen(&mut self, target: String) -> Result<(), SessionError> {
        self.close_transport().await;
        self.endpoint = target;
        let transport = self.connector.connect(&self.endpoint).await?;
        self.transport = Some(transport);
        Ok(())
    }
}

impl DeviceSession<Authenticated> {
    pub async fn request(&mut self, route: &str, data: Value) -> Result<Value, SessionError> {
        self.exchange(route, data).await
    }

    /// Checks whether an optional route exists.
    ///
    /// A missing route (or any device-side error) reads as `false`; losing the
    /// connection is still an error.
    pub async fn probe(&mut self, route: &str) -> Result<bool, SessionError> {
        match self.exchange(route, json!({})).await {
            Ok(_) => Ok(true),
            Err(e @ SessionError::RouteNotFound { .. })
            | Err(e @ SessionError::Protocol { .. })
            | Err(e @ SessionError::Malformed { .. }) => {
                debug!("Probe of '{}' negative: {}", route, e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn close(mut self) {
        info!("Closing device session to {}", self.endpoint);
        self.close_transport().await;
    }
}

/// `base64(sha256(password))` with the trailing newline of MIME-style encoding.
pub fn password_hash(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    format!("{}\n", STANDARD.encode(digest))
}

fn redirect_target(response: &Value) -> Option<String> {
    match response.get("redirect") {
        None | Some(Value::Null) => None,
        Some(Value::String(uri)) => Some(uri.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn parse_response(route: &str, text: &str) -> Result<Value, SessionError> {
    let mut response: Value =
        serde_json::from_str(text).map_err(|e| SessionError::Malformed {
            route: route.to_string(),
            detail: e.to_string(),
        })?;

    let Some(object) = response.as_object_mut() else {
        return Err(SessionError::Malformed {
            route: route.to_string(),
            detail: "response is not an object".into(),
        });
    };

    if let Some(data) = object.remove("data") {
        return Ok(data);
    }
    if let Some(err) = object.remove("error") {
        let detail = match err {
            Value::String(s) => s,
            other => other.to_string(),
        };
        warn!("Device error for '{}': {}", route, detail);
        return Err(classify_error_response(route, detail));
    }
    // handshake answers may come unwrapped
    if object.contains_key("success") {
        return Ok(response);
    }
    Err(SessionError::Malformed {
        route: route.to_string(),
        detail: "response carried neither data nor error".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::error::ErrorKind;
    use crate::session::transport::testing::{Reply, ScriptedDevice};

    const CLOUD: &str = "wss://relay.example/";
    const NODE: &str = "wss://node-7.example/";

    fn device_config(uri: &str) -> DeviceConfig {
        DeviceConfig {
            server_uri: uri.to_string(),
            serial_number: "S1".into(),
            spare_serial_number: None,
            password: "secret".into(),
            device_id: "bridge".into(),
            local_subdomain: Some("sun2plug".into()),
        }
    }

    fn login_ok() -> Reply {
        Reply::Json(json!({"data": {"success": true, "signature": "sig"}}))
    }

    async fn handshake(
        device: &ScriptedDevice,
        uri: &str,
        max_redirects: u32,
    ) -> Result<(DeviceSession<Authenticated>, AuthOutcome), SessionError> {
        let session = DeviceSession::create(Arc::new(device.clone()), uri, Duration::from_secs(5));
        session
            .connect()
            .await?
            .authenticate(&device_config(uri), max_redirects)
            .await
    }

    #[test]
    fn password_hash_matches_reference_encoding() {
        // sha256("secret") in base64 plus newline
        assert_eq!(
            password_hash("secret"),
            "K7gNU3sdo+OL0wNhqoVWhr3g6s1xYv72ol/pe/Unols=\n"
        );
    }

    #[tokio::test]
    async fn follows_redirect_and_resubmits_authenticate() {
        let device = ScriptedDevice::new(|uri, route, _| match (uri, route) {
            (_, "login") => login_ok(),
            (CLOUD, "authenticate") => Reply::Json(json!({"data": {"redirect": NODE}})),
            (NODE, "authenticate") => {
                Reply::Json(json!({"data": {"redirect": null, "online": true}}))
            }
            _ => Reply::Closed,
        });

        let (session, outcome) = handshake(&device, CLOUD, 5).await.unwrap();
        assert_eq!(session.endpoint(), NODE);
        assert_eq!(outcome, AuthOutcome { online: true, local: false });
        assert_eq!(device.connects.lock().unwrap().as_slice(), [CLOUD, NODE]);

        let auth = device.requests_for("authenticate");
        assert_eq!(auth.len(), 2);
        assert_eq!(auth[1].uri, NODE);
        assert_eq!(auth[1].data["signature"], "sig");
    }

    #[tokio::test]
    async fn redirect_loop_is_bounded() {
        let device = ScriptedDevice::new(|_, route, _| match route {
            "login" => login_ok(),
            _ => Reply::Json(json!({"data": {"redirect": CLOUD}})),
        });

        let err = handshake(&device, CLOUD, 3).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RedirectLimit);
        assert!(err.kind().is_fatal());
        assert_eq!(device.requests_for("authenticate").len(), 4);
    }

    #[tokio::test]
    async fn rejected_password_is_bad_credentials() {
        let device = ScriptedDevice::new(|_, _, _| Reply::Json(json!({"data": {"success": false}})));
        let err = handshake(&device, CLOUD, 5).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::BadCredentials);
    }

    #[tokio::test]
    async fn lost_connection_during_login_is_auth_failure() {
        let device = ScriptedDevice::new(|_, _, _| Reply::Closed);
        let err = handshake(&device, CLOUD, 5).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AuthFailed);
    }

    #[tokio::test]
    async fn local_connection_without_online_flag() {
        let uri = "ws://sun2plug.local:9124/";
        let device = ScriptedDevice::new(|_, route, _| match route {
            "login" => login_ok(),
            _ => Reply::Json(json!({"data": {"ok": true}})),
        });
        let (_, outcome) = handshake(&device, uri, 5).await.unwrap();
        assert_eq!(outcome, AuthOutcome { online: true, local: true });
    }

    #[tokio::test]
    async fn message_ids_strictly_increase() {
        let device = ScriptedDevice::new(|_, route, _| match route {
            "login" => login_ok(),
            "authenticate" => Reply::Json(json!({"data": {"online": true}})),
            _ => Reply::Json(json!({"data": {"pv_power": 1.5}})),
        });
        let (mut session, _) = handshake(&device, CLOUD, 5).await.unwrap();
        session.request("live_values", json!({})).await.unwrap();
        session.request("live_values", json!({})).await.unwrap();

        let ids: Vec<u64> = device.requests.lock().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(session.last_message_id(), 4);
    }

    #[tokio::test]
    async fn response_shapes_are_classified() {
        let device = ScriptedDevice::new(|_, route, _| match route {
            "login" => login_ok(),
            "authenticate" => Reply::Json(json!({"data": {"online": true}})),
            "get_boost_injection" => {
                Reply::Json(json!({"error": "NotImplementedError: Response: get_boost_injection"}))
            }
            "garbage" => Reply::Raw("not json".into()),
            "empty" => Reply::Json(json!({"id": 9})),
            _ => Reply::Closed,
        });
        let (mut session, _) = handshake(&device, CLOUD, 5).await.unwrap();

        let missing = session.request("get_boost_injection", json!({})).await;
        assert_eq!(missing.err().unwrap().kind(), ErrorKind::RouteNotFound);
        let garbage = session.request("garbage", json!({})).await;
        assert!(matches!(garbage, Err(SessionError::Malformed { .. })));
        let empty = session.request("empty", json!({})).await;
        assert!(matches!(empty, Err(SessionError::Malformed { .. })));
        let closed = session.request("live_values", json!({})).await;
        assert_eq!(closed.err().unwrap().kind(), ErrorKind::ConnectionClosed);
    }

    #[tokio::test]
    async fn probe_turns_missing_route_into_false() {
        let device = ScriptedDevice::new(|_, route, _| match route {
            "login" => login_ok(),
            "authenticate" => Reply::Json(json!({"data": {"online": true}})),
            "get_injection_settings" => Reply::Json(json!({"data": {"user_minimum_injection": 0}})),
            "get_boost_injection" => Reply::Json(json!({"error": "NotImplementedError: Response:"})),
            _ => Reply::Closed,
        });
        let (mut session, _) = handshake(&device, CLOUD, 5).await.unwrap();

        assert!(session.probe("get_injection_settings").await.unwrap());
        assert!(!session.probe("get_boost_injection").await.unwrap());
        assert!(session.probe("anything_else").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_as_ping_failure() {
        let device = ScriptedDevice::new(|_, route, _| match route {
            "login" => login_ok(),
            "authenticate" => Reply::Json(json!({"data": {"online": true}})),
            _ => Reply::Hang,
        });
        let (mut session, _) = handshake(&device, CLOUD, 5).await.unwrap();
        let err = session.request("live_values", json!({})).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::PingTimeout);
    }
}
