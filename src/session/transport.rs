//! Message-oriented transport underneath the device session.
//!
//! The session only needs to send one text frame and receive one text frame at
//! a time. [`Connector`] opens a [`DeviceTransport`] to a URI; the production
//! implementation is a websocket, tests plug in a scripted device.

use super::error::SessionError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

#[async_trait]
pub trait DeviceTransport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError>;

    /// Waits for the next text frame, skipping control frames.
    async fn recv_text(&mut self) -> Result<String, SessionError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Box<dyn DeviceTransport>, SessionError>;
}

/// Opens websocket connections (`ws://` for local devices, `wss://` for the cloud relay).
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, uri: &str) -> Result<Box<dyn DeviceTransport>, SessionError> {
        debug!("Opening websocket to {}", uri);
        let (stream, _) = connect_async(uri)
            .await
            .map_err(|e| SessionError::ConnectFailed {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        info!("Websocket connected to {}", uri);
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl DeviceTransport for WebSocketTransport {
    async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn recv_text(&mut self) -> Result<String, SessionError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return String::from_utf8(bytes)
                        .map_err(|e| SessionError::Transport(format!("non UTF-8 frame: {}", e)))
                }
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Error => {
                            Err(SessionError::PingTimeout(format!(
                                "closed with 1011: {}",
                                frame.reason
                            )))
                        }
                        _ => Err(SessionError::ConnectionClosed),
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(map_ws_error(e)),
                None => return Err(SessionError::ConnectionClosed),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Websocket close reported: {}", e);
        }
    }
}

fn map_ws_error(error: WsError) -> SessionError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => SessionError::ConnectionClosed,
        WsError::Io(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            SessionError::ConnectionClosed
        }
        other => {
            warn!("Websocket error: {}", other);
            SessionError::Transport(other.to_string())
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory device used by session and scheduler tests.

    use super::*;
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub enum Reply {
        Json(Value),
        Raw(String),
        Closed,
        Hang,
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Recorded {
        pub uri: String,
        pub id: u64,
        pub route: String,
        pub data: Value,
    }

    type Handler = dyn Fn(&str, &str, &Value) -> Reply + Send + Sync;

    /// Answers every request through a handler of `(uri, route, data)`.
    #[derive(Clone)]
    pub struct ScriptedDevice {
        handler: Arc<Handler>,
        pub requests: Arc<Mutex<Vec<Recorded>>>,
        pub connects: Arc<Mutex<Vec<String>>>,
        pub unreachable: Arc<Mutex<HashSet<String>>>,
    }

    impl ScriptedDevice {
        pub fn new(handler: impl Fn(&str, &str, &Value) -> Reply + Send + Sync + 'static) -> Self {
            Self {
                handler: Arc::new(handler),
                requests: Arc::new(Mutex::new(Vec::new())),
                connects: Arc::new(Mutex::new(Vec::new())),
                unreachable: Arc::new(Mutex::new(HashSet::new())),
            }
        }

        pub fn routes(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.route.clone())
                .collect()
        }

        pub fn requests_for(&self, route: &str) -> Vec<Recorded> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.route == route)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Connector for ScriptedDevice {
        async fn connect(&self, uri: &str) -> Result<Box<dyn DeviceTransport>, SessionError> {
            self.connects.lock().unwrap().push(uri.to_string());
            if self.unreachable.lock().unwrap().contains(uri) {
                return Err(SessionError::ConnectFailed {
                    uri: uri.to_string(),
                    reason: "unreachable".into(),
                });
            }
            Ok(Box::new(ScriptedTransport {
                uri: uri.to_string(),
                device: self.clone(),
                pending: None,
            }))
        }
    }

    struct ScriptedTransport {
        uri: String,
        device: ScriptedDevice,
        pending: Option<Reply>,
    }

    #[async_trait]
    impl DeviceTransport for ScriptedTransport {
        async fn send_text(&mut self, text: String) -> Result<(), SessionError> {
            let request: Value = serde_json::from_str(&text)
                .map_err(|e| SessionError::Transport(e.to_string()))?;
            let route = request["route"].as_str().unwrap_or_default().to_string();
            let data = request["data"].clone();
            self.device.requests.lock().unwrap().push(Recorded {
                uri: self.uri.clone(),
                id: request["id"].as_u64().unwrap_or_default(),
                route: route.clone(),
                data: data.clone(),
            });
            self.pending = Some((self.device.handler)(&self.uri, &route, &data));
            Ok(())
        }

        async fn recv_text(&mut self) -> Result<String, SessionError> {
            match self.pending.take() {
                Some(Reply::Json(value)) => Ok(value.to_string()),
                Some(Reply::Raw(text)) => Ok(text),
                Some(Reply::Closed) | None => Err(SessionError::ConnectionClosed),
                Some(Reply::Hang) => std::future::pending().await,
            }
        }

        async fn close(&mut self) {}
    }
}
