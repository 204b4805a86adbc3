#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    dead_code,
    reason = "Each integration test binary uses a different subset of the helpers"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use realtime_transport::Result;
use realtime_transport::auth::{AuthTokenProvider, SecretString};
use realtime_transport::error::Error;
use realtime_transport::ws::{ConnectionManager, ConnectionStatus};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// What the mock server observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Handshake accepted; carries the request URI
    Connected(String),
    /// Handshake refused with 401; carries the request URI
    Rejected(String),
    Received(String),
    /// Client closed with the given code
    Closed(Option<u16>),
}

#[derive(Debug, Clone)]
enum Command {
    Send(String),
    Close(u16),
}

/// Mock realtime server.
pub struct MockWsServer {
    addr: SocketAddr,
    /// Commands fanned out to ALL connected clients
    command_tx: broadcast::Sender<Command>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
    /// Handshakes presenting this token are refused
    rejected_token: Arc<Mutex<Option<String>>>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (command_tx, _) = broadcast::channel::<Command>(100);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let rejected_token: Arc<Mutex<Option<String>>> = Arc::default();

        let commands = command_tx.clone();
        let rejected = Arc::clone(&rejected_token);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                // Subscribe before the handshake so no command sent after the client
                // reports itself connected can be missed
                let mut command_rx = commands.subscribe();
                let events = events_tx.clone();
                let refused_token = rejected.lock().unwrap().clone();

                let handshake_events = events_tx.clone();
                let callback = move |request: &Request, response: Response| {
                    let uri = request.uri().to_string();
                    let refused = refused_token
                        .as_deref()
                        .is_some_and(|token| uri.contains(&format!("token={token}")));

                    if refused {
                        drop(handshake_events.send(ServerEvent::Rejected(uri)));
                        let mut rejection = ErrorResponse::new(Some("token rejected".to_owned()));
                        *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                        return Err(rejection);
                    }

                    drop(handshake_events.send(ServerEvent::Connected(uri)));
                    Ok(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(events.send(ServerEvent::Received(text.to_string())));
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        let code = frame.map(|f| u16::from(f.code));
                                        drop(events.send(ServerEvent::Closed(code)));
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            command = command_rx.recv() => {
                                match command {
                                    Ok(Command::Send(text)) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Ok(Command::Close(code)) => {
                                        let frame = CloseFrame {
                                            code: CloseCode::from(code),
                                            reason: Utf8Bytes::from_static("server close"),
                                        };
                                        drop(write.send(Message::Close(Some(frame))).await);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            command_tx,
            events_rx,
            rejected_token,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/chat/", self.addr)
    }

    /// Send a JSON text frame to all connected clients.
    pub fn send(&self, message: &serde_json::Value) {
        self.send_text(&message.to_string());
    }

    pub fn send_text(&self, text: &str) {
        drop(self.command_tx.send(Command::Send(text.to_owned())));
    }

    /// Close every connected client with `code`.
    pub fn close(&self, code: u16) {
        drop(self.command_tx.send(Command::Close(code)));
    }

    /// Refuse future handshakes carrying `token` with HTTP 401.
    pub fn reject_token(&self, token: &str) {
        *self.rejected_token.lock().unwrap() = Some(token.to_owned());
    }

    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        timeout(TIMEOUT, self.events_rx.recv()).await.ok().flatten()
    }

    /// Wait for the next accepted handshake and return its request URI.
    pub async fn next_connection(&mut self) -> Option<String> {
        loop {
            if let ServerEvent::Connected(uri) = self.next_event().await? {
                return Some(uri);
            }
        }
    }

    /// Wait for the next text frame the client sent that is not a heartbeat.
    pub async fn next_received(&mut self) -> Option<serde_json::Value> {
        loop {
            if let ServerEvent::Received(text) = self.next_event().await? {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                if value["type"] != "heartbeat" {
                    return Some(value);
                }
            }
        }
    }

    /// Assert nothing at all happens for `quiet`.
    pub async fn assert_quiet(&mut self, quiet: Duration) {
        let event = timeout(quiet, self.events_rx.recv()).await;
        assert!(event.is_err(), "unexpected server event: {event:?}");
    }
}

/// An address nothing listens on.
pub async fn unused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/ws/chat/")
}

/// Token provider double counting refreshes.
pub struct TestAuth {
    access: Mutex<Option<String>>,
    /// Token handed out by the next refresh; `None` makes refreshes fail
    refreshed: Option<String>,
    refreshes: AtomicUsize,
    cleared: AtomicBool,
}

impl TestAuth {
    pub fn new(access: &str, refreshed: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            access: Mutex::new(Some(access.to_owned())),
            refreshed: refreshed.map(str::to_owned),
            refreshes: AtomicUsize::new(0),
            cleared: AtomicBool::new(false),
        })
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn was_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthTokenProvider for TestAuth {
    fn access_token(&self) -> Option<SecretString> {
        self.access.lock().unwrap().clone().map(SecretString::from)
    }

    async fn refresh(&self) -> Result<SecretString> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        match &self.refreshed {
            Some(token) => {
                *self.access.lock().unwrap() = Some(token.clone());
                Ok(SecretString::from(token.clone()))
            }
            None => Err(Error::auth_expired("refresh token expired")),
        }
    }

    fn clear(&self) {
        self.cleared.store(true, Ordering::SeqCst);
        *self.access.lock().unwrap() = None;
    }
}

/// Wait until the connection status satisfies `predicate`.
pub async fn wait_for_status<F>(connection: &ConnectionManager, predicate: F) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    let mut status = connection.status_receiver();
    let matched = timeout(TIMEOUT, status.wait_for(predicate))
        .await
        .expect("timed out waiting for connection status")
        .expect("status channel closed");
    matched.clone()
}
