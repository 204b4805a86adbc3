#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use backoff::backoff::Backoff as _;
use chrono::{DateTime, Utc};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, interval_at, sleep};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::{Config, LinearBackoff};
use super::dispatch::{MessageDispatcher, Subscription};
use super::error::WsError;
use super::message::{MessageKind, WebSocketMessage, parse_frame};
use crate::Result;
use crate::auth::{AuthTokenProvider, ExposeSecret as _, SecretString, SessionState};
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the warnings broadcast channel.
const WARNINGS_CAPACITY: usize = 64;

/// Close code of an intentional shutdown. Never reconnected.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code the server uses for a rejected handshake/protocol; treated as auth failure.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Application close code for an invalid or expired access token.
pub const CLOSE_AUTH_FAILED: u16 = 4001;
/// Reported when the socket ended without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
const CLOSE_NO_STATUS: u16 = 1005;

/// Status error after a socket or handshake failure.
pub const TRANSPORT_ERROR_MESSAGE: &str = "WebSocket connection error";
/// Status error once reconnect attempts are exhausted.
pub const CONNECTION_UNAVAILABLE_MESSAGE: &str =
    "Realtime connection unavailable after repeated attempts";
/// Status error when the access token could not be refreshed.
pub const AUTH_EXPIRED_MESSAGE: &str = "Authentication expired, please log in again";

/// Transport health as seen by consumers.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub is_connecting: bool,
    pub error: Option<String>,
    pub last_connected: Option<DateTime<Utc>>,
}

/// Non-blocking notice meant to be shown to the user.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// Reconnect attempts passed the configured warning threshold
    ConnectionUnstable { attempt: u32 },
    /// A frame could not be sent because the socket was not open
    SendFailed { kind: MessageKind },
    /// Token refresh failed; the user has to log in again
    AuthenticationExpired,
    /// Reconnect attempts are exhausted
    ConnectionUnavailable { attempts: u32 },
}

/// What to do after the socket closed with a given code.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Intentional close, stay disconnected
    Stop,
    /// Refresh the access token once, then reconnect
    RefreshAuth,
    /// Reconnect with backoff
    Reconnect,
}

impl CloseAction {
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => Self::Stop,
            CLOSE_PROTOCOL_ERROR | CLOSE_AUTH_FAILED => Self::RefreshAuth,
            _ => Self::Reconnect,
        }
    }
}

/// Build `<base>?user_id=<id>&token=<urlencoded token>`.
pub fn connection_url(base: &str, user_id: i64, token: &SecretString) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("user_id", &user_id.to_string())
        .append_pair("token", token.expose_secret());
    Ok(url)
}

/// Mutable connection bookkeeping. Every write from a driver task is checked
/// against `generation` under this lock, so a cancelled driver can never touch
/// the state of a newer one.
struct Lifecycle {
    generation: u64,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    /// Present only while the socket is open
    outbound: Option<mpsc::UnboundedSender<String>>,
    backoff: LinearBackoff,
    last_warning: Option<Instant>,
}

struct Inner {
    config: Config,
    auth: Arc<dyn AuthTokenProvider>,
    session: RwLock<SessionState>,
    dispatcher: MessageDispatcher,
    status_tx: watch::Sender<ConnectionStatus>,
    warnings_tx: broadcast::Sender<Warning>,
    lifecycle: Mutex<Lifecycle>,
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // Lifecycle fields are each valid on their own, so a poisoned lock is recovered.
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> SessionState {
        *self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn target_url(&self) -> Option<Result<Url>> {
        let user_id = self.session().connectable_user()?;
        let token = self.auth.access_token()?;
        Some(connection_url(&self.config.url, user_id, &token))
    }

    fn handle_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(message) if message.is_heartbeat() => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Heartbeat acknowledged");
            }
            Ok(message) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(kind = %message.kind, "Received WebSocket message");
                self.dispatcher.dispatch(&message);
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "Dropping malformed WebSocket frame");
                #[cfg(not(feature = "tracing"))]
                let _ = (&text, &e);
            }
        }
    }
}

/// Owns the realtime WebSocket and drives its lifecycle.
///
/// - One physical socket at a time, owned by a single background driver task
/// - Heartbeat frames while the socket is open
/// - Linear backoff reconnection up to [`super::config::ReconnectConfig::max_attempts`]
/// - One token refresh, then reconnect, when the server rejects the access token
/// - Fan-out of inbound frames through a shared [`MessageDispatcher`]
///
/// The handle is cheap to clone; every clone controls the same connection, which
/// lets each consumer be handed the manager explicitly.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use realtime_transport::auth::{HttpTokenProvider, SessionState, TokenStore};
/// use realtime_transport::ws::ConnectionManager;
/// use realtime_transport::ws::config::Config;
///
/// # async fn example() -> realtime_transport::Result<()> {
/// let store = TokenStore::new("access".to_owned(), "refresh".to_owned());
/// let auth = Arc::new(HttpTokenProvider::new("https://example.com/api/", store)?);
/// let connection = ConnectionManager::new(Config::default(), auth)?;
///
/// connection.set_session(SessionState::authenticated(42));
/// connection.connect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create an idle connection manager. Nothing is opened until [`Self::connect`].
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::Kind::Validation`] when the URL does not parse or
    /// heartbeats are enabled with a zero interval.
    pub fn new(config: Config, auth: Arc<dyn AuthTokenProvider>) -> Result<Self> {
        Url::parse(&config.url)?;
        if config.enable_heartbeat && config.heartbeat_interval.is_zero() {
            return Err(Error::validation(
                "heartbeat_interval must be non-zero when heartbeats are enabled",
            ));
        }

        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        let (warnings_tx, _) = broadcast::channel(WARNINGS_CAPACITY);
        let backoff = config.reconnect.into();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                auth,
                session: RwLock::new(SessionState::default()),
                dispatcher: MessageDispatcher::new(),
                status_tx,
                warnings_tx,
                lifecycle: Mutex::new(Lifecycle {
                    generation: 0,
                    cancel: CancellationToken::new(),
                    driver: None,
                    outbound: None,
                    backoff,
                    last_warning: None,
                }),
            }),
        })
    }

    /// Record who the connection is for. Does not connect or disconnect by itself.
    pub fn set_session(&self, session: SessionState) {
        *self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner) = session;
    }

    #[must_use]
    pub fn session(&self) -> SessionState {
        self.inner.session()
    }

    /// Start connecting.
    ///
    /// Does nothing unless the session is authenticated with a user id and the
    /// token provider has an access token, and does nothing while a connection
    /// (or a pending reconnect) is already live. Returns whether a new connection
    /// attempt was started. Must be called from within a tokio runtime.
    pub fn connect(&self) -> bool {
        let url = match self.inner.target_url() {
            Some(Ok(url)) => url,
            Some(Err(e)) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Invalid realtime URL");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return false;
            }
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Not connecting: no authenticated user or access token");
                return false;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            #[cfg(feature = "tracing")]
            tracing::error!("ConnectionManager::connect called outside of a tokio runtime");
            return false;
        };

        let mut lifecycle = self.inner.lifecycle();
        if lifecycle
            .driver
            .as_ref()
            .is_some_and(|driver| !driver.is_finished())
        {
            return false;
        }

        lifecycle.generation += 1;
        lifecycle.cancel = CancellationToken::new();
        lifecycle.backoff.reset();
        lifecycle.outbound = None;

        self.inner.status_tx.send_modify(|status| {
            status.is_connecting = true;
            status.error = None;
        });

        let driver = Driver {
            inner: Arc::clone(&self.inner),
            generation: lifecycle.generation,
            cancel: lifecycle.cancel.clone(),
        };
        lifecycle.driver = Some(runtime.spawn(driver.run(url)));

        true
    }

    /// Close the connection intentionally.
    ///
    /// Synchronously cancels any pending reconnect, refresh and heartbeat, then has
    /// the socket closed with code 1000. Status becomes disconnected immediately.
    /// Safe to call any number of times.
    pub fn disconnect(&self) {
        let mut lifecycle = self.inner.lifecycle();
        lifecycle.generation += 1;
        lifecycle.cancel.cancel();
        lifecycle.driver = None;
        lifecycle.outbound = None;
        lifecycle.backoff.reset();

        self.inner
            .status_tx
            .send_replace(ConnectionStatus::default());

        #[cfg(feature = "tracing")]
        tracing::debug!(generation = lifecycle.generation, "Realtime connection stopped");
    }

    /// Send `message` if the socket is open.
    ///
    /// The message is stamped with the current time. Returns `false` (and emits a
    /// [`Warning::SendFailed`]) when the socket is not open; nothing is queued.
    pub fn send_message(&self, message: &WebSocketMessage) -> bool {
        let mut message = message.clone();
        message.timestamp = Some(Utc::now());

        let sent = match serde_json::to_string(&message) {
            Ok(json) => self
                .inner
                .lifecycle()
                .outbound
                .as_ref()
                .is_some_and(|tx| tx.send(json).is_ok()),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %e, "Unable to serialize outbound message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                false
            }
        };

        if !sent {
            let error: Error = WsError::SendWhileClosed.into();
            #[cfg(feature = "tracing")]
            tracing::warn!(kind = %message.kind, %error, "Message not sent");
            #[cfg(not(feature = "tracing"))]
            let _ = &error;
            _ = self
                .inner
                .warnings_tx
                .send(Warning::SendFailed { kind: message.kind });
        }

        sent
    }

    /// Register a handler on the shared dispatcher. See [`MessageDispatcher::on_message`].
    pub fn on_message<S, F>(&self, id: S, handler: F) -> Subscription
    where
        S: Into<String>,
        F: Fn(&WebSocketMessage) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_message(id, handler)
    }

    #[must_use]
    pub fn dispatcher(&self) -> &MessageDispatcher {
        &self.inner.dispatcher
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Subscribe to user-facing warnings.
    #[must_use]
    pub fn warnings(&self) -> broadcast::Receiver<Warning> {
        self.inner.warnings_tx.subscribe()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.lifecycle().outbound.is_some()
    }

    /// Reconnect attempts made since the last successful open or token refresh.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lifecycle().backoff.attempt()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

/// How a socket session ended.
enum SocketEnd {
    /// Closed with `code`; `accepted` when the server sent at least one frame or the
    /// socket stayed open for the auth grace period
    Closed { code: u16, accepted: bool },
    Cancelled,
}

/// Background task owning the socket for one `connect()` .. `disconnect()` span.
struct Driver {
    inner: Arc<Inner>,
    generation: u64,
    cancel: CancellationToken,
}

impl Driver {
    /// Run `f` against the lifecycle only if this driver is still the live one.
    fn with_live<T, F>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Lifecycle, &watch::Sender<ConnectionStatus>) -> T,
    {
        let mut lifecycle = self.inner.lifecycle();
        if lifecycle.generation != self.generation || self.cancel.is_cancelled() {
            return None;
        }
        Some(f(&mut lifecycle, &self.inner.status_tx))
    }

    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = sleep(duration) => true,
        }
    }

    fn warn(&self, warning: Warning) {
        _ = self.inner.warnings_tx.send(warning);
    }

    async fn run(self, first_url: Url) {
        let mut url = Some(first_url);
        let mut auth_retry_used = false;

        loop {
            let target = match url.take() {
                Some(url) => url,
                None => match self.inner.target_url() {
                    Some(Ok(url)) => url,
                    _ => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Session no longer connectable, stopping reconnects");
                        self.with_live(|_, status| {
                            status.send_modify(|s| s.is_connecting = false);
                        });
                        return;
                    }
                },
            };

            if self
                .with_live(|_, status| {
                    status.send_modify(|s| {
                        s.is_connecting = true;
                        s.error = None;
                    });
                })
                .is_none()
            {
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(host = ?target.host_str(), "Opening realtime connection");

            let attempt = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                attempt = connect_async(target.as_str()) => attempt,
            };

            let code = match attempt {
                Ok((stream, _)) => match self.run_socket(stream).await {
                    SocketEnd::Cancelled => return,
                    SocketEnd::Closed { code, accepted } => {
                        // A socket the server talked on, or kept open, proves the refreshed token worked
                        if accepted {
                            auth_retry_used = false;
                        }
                        code
                    }
                },
                Err(tungstenite::Error::Http(response))
                    if matches!(response.status().as_u16(), 401 | 403) =>
                {
                    CLOSE_AUTH_FAILED
                }
                Err(e) => {
                    self.on_error(e);
                    CLOSE_ABNORMAL
                }
            };

            if self
                .with_live(|lifecycle, status| {
                    lifecycle.outbound = None;
                    status.send_modify(|s| s.is_connected = false);
                })
                .is_none()
            {
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(code, "Realtime connection closed");

            match CloseAction::from_code(code) {
                CloseAction::Stop => {
                    self.with_live(|_, status| {
                        status.send_modify(|s| s.is_connecting = false);
                    });
                    return;
                }
                CloseAction::RefreshAuth => {
                    if auth_retry_used {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(code, "Access token rejected again after refresh");
                        self.fail_auth();
                        return;
                    }
                    auth_retry_used = true;

                    let refreshed = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return,
                        refreshed = self.inner.auth.refresh() => refreshed,
                    };

                    match refreshed {
                        Ok(_) => {
                            if self
                                .with_live(|lifecycle, _| lifecycle.backoff.reset())
                                .is_none()
                            {
                                return;
                            }
                            #[cfg(feature = "tracing")]
                            tracing::debug!("Access token refreshed, reconnecting");
                            if !self.sleep(self.inner.config.auth_retry_delay).await {
                                return;
                            }
                        }
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(error = %e, "Token refresh failed");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                            self.fail_auth();
                            return;
                        }
                    }
                }
                CloseAction::Reconnect => {
                    let Some(next) = self.with_live(|lifecycle, status| {
                        let next = lifecycle.backoff.next_backoff();
                        if next.is_none() {
                            status.send_modify(|s| {
                                s.is_connecting = false;
                                s.error = Some(CONNECTION_UNAVAILABLE_MESSAGE.to_owned());
                            });
                        }
                        (next, lifecycle.backoff.attempt())
                    }) else {
                        return;
                    };

                    match next {
                        (Some(delay), attempt) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(attempt, ?delay, "Scheduling reconnect");
                            #[cfg(not(feature = "tracing"))]
                            let _ = attempt;
                            if !self.sleep(delay).await {
                                return;
                            }
                        }
                        (None, attempts) => {
                            #[cfg(feature = "tracing")]
                            tracing::error!(attempts, "Reconnect attempts exhausted");
                            self.warn(Warning::ConnectionUnavailable { attempts });
                            return;
                        }
                    }
                }
            }
        }
    }

    fn fail_auth(&self) {
        let live = self.with_live(|lifecycle, status| {
            lifecycle.backoff.reset();
            status.send_modify(|s| {
                s.is_connected = false;
                s.is_connecting = false;
                s.error = Some(AUTH_EXPIRED_MESSAGE.to_owned());
            });
        });

        if live.is_some() {
            self.inner.auth.clear();
            #[cfg(feature = "tracing")]
            tracing::error!("Realtime authentication expired");
            self.warn(Warning::AuthenticationExpired);
        }
    }

    fn on_error(&self, e: tungstenite::Error) {
        let error = Error::from(e);
        #[cfg(feature = "tracing")]
        tracing::warn!(%error, "Realtime transport error");
        #[cfg(not(feature = "tracing"))]
        let _ = &error;

        let cooldown = self.inner.config.warning_cooldown;
        let threshold = self.inner.config.warning_threshold;
        let unstable = self.with_live(|lifecycle, status| {
            status.send_modify(|s| {
                s.is_connected = false;
                s.is_connecting = false;
                s.error = Some(TRANSPORT_ERROR_MESSAGE.to_owned());
            });

            let attempt = lifecycle.backoff.attempt();
            let cooled_down = lifecycle
                .last_warning
                .is_none_or(|at| at.elapsed() >= cooldown);
            if attempt > threshold && cooled_down {
                lifecycle.last_warning = Some(Instant::now());
                Some(attempt)
            } else {
                None
            }
        });

        if let Some(Some(attempt)) = unstable {
            self.warn(Warning::ConnectionUnstable { attempt });
        }
    }

    /// Mark the socket open and pump frames until it closes or the driver is cancelled.
    async fn run_socket(&self, stream: WsStream) -> SocketEnd {
        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let opened = self.with_live(|lifecycle, status| {
            lifecycle.outbound = Some(outbound_tx);
            lifecycle.backoff.reset();
            status.send_modify(|s| {
                s.is_connected = true;
                s.is_connecting = false;
                s.error = None;
                s.last_connected = Some(Utc::now());
            });
        });
        if opened.is_none() {
            _ = write.send(Message::Close(Some(normal_close()))).await;
            return SocketEnd::Cancelled;
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Realtime connection open");

        let config = &self.inner.config;
        let mut heartbeat = config.enable_heartbeat.then(|| {
            interval_at(
                Instant::now() + config.heartbeat_interval,
                config.heartbeat_interval,
            )
        });

        let opened_at = Instant::now();
        let accepted = |talked: bool| talked || opened_at.elapsed() >= config.auth_grace_period;
        let mut talked = false;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    _ = write.send(Message::Close(Some(normal_close()))).await;
                    return SocketEnd::Cancelled;
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            talked = true;
                            self.inner.handle_text(text.as_str());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map_or(CLOSE_NO_STATUS, |f| u16::from(f.code));
                            return SocketEnd::Closed { code, accepted: accepted(talked) };
                        }
                        Some(Ok(_)) => {
                            // Binary frames are not part of the protocol; ping/pong is answered by tungstenite.
                        }
                        Some(Err(e)) => {
                            self.on_error(e);
                            return SocketEnd::Closed {
                                code: CLOSE_ABNORMAL,
                                accepted: accepted(talked),
                            };
                        }
                        None => {
                            return SocketEnd::Closed {
                                code: CLOSE_ABNORMAL,
                                accepted: accepted(talked),
                            };
                        }
                    }
                }

                Some(text) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        self.on_error(e);
                        return SocketEnd::Closed {
                            code: CLOSE_ABNORMAL,
                            accepted: accepted(talked),
                        };
                    }
                }

                () = tick(heartbeat.as_mut()) => {
                    let Ok(frame) = serde_json::to_string(&WebSocketMessage::heartbeat()) else {
                        continue;
                    };
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Sending heartbeat");
                    if let Err(e) = write.send(Message::Text(frame.into())).await {
                        self.on_error(e);
                        return SocketEnd::Closed {
                            code: CLOSE_ABNORMAL,
                            accepted: accepted(talked),
                        };
                    }
                }
            }
        }
    }
}

fn normal_close() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: Utf8Bytes::from_static("client disconnect"),
    }
}

/// Tick `interval` if heartbeats are enabled, otherwise never resolve.
async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
