//! The application-facing bundle of one connection and its channels.

use std::sync::Arc;

use crate::Result;
use crate::auth::{AuthTokenProvider, SessionState};
use crate::channels::{ChatChannel, PresenceChannel, TypingChannel};
use crate::ws::ConnectionManager;
use crate::ws::config::Config;

/// One realtime connection shared by the chat, typing and presence channels.
///
/// Nothing connects until [`Self::start`] or an authenticated
/// [`Self::set_session`]. Dropping the session disconnects and unregisters every
/// channel handler.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use realtime_transport::auth::{HttpTokenProvider, SessionState, TokenStore};
/// use realtime_transport::session::RealtimeSession;
/// use realtime_transport::ws::config::Config;
///
/// # async fn example() -> realtime_transport::Result<()> {
/// let store = TokenStore::new("access".to_owned(), "refresh".to_owned());
/// let auth = Arc::new(HttpTokenProvider::new("https://example.com/api/", store)?);
/// let session = RealtimeSession::new(Config::default(), auth)?;
///
/// session.set_session(SessionState::authenticated(42));
/// session.chat().send_chat_message(7, "hello", vec![]);
/// # Ok(())
/// # }
/// ```
pub struct RealtimeSession {
    connection: ConnectionManager,
    chat: ChatChannel,
    typing: TypingChannel,
    presence: PresenceChannel,
}

impl RealtimeSession {
    pub fn new(config: Config, auth: Arc<dyn AuthTokenProvider>) -> Result<Self> {
        let connection = ConnectionManager::new(config, auth)?;
        let chat = ChatChannel::new(&connection);
        Ok(Self::with_chat(connection, chat))
    }

    /// Build around an existing connection, with a caller-configured chat channel
    /// (for example one created by [`ChatChannel::with_deletion_callback`]).
    #[must_use]
    pub fn with_chat(connection: ConnectionManager, chat: ChatChannel) -> Self {
        let typing = TypingChannel::new(&connection);
        let presence = PresenceChannel::new(&connection);

        Self {
            connection,
            chat,
            typing,
            presence,
        }
    }

    /// Connect for the current session. Returns whether a connection attempt started.
    pub fn start(&self) -> bool {
        self.connection.connect()
    }

    pub fn stop(&self) {
        self.connection.disconnect();
    }

    /// Follow a change of the signed-in user.
    ///
    /// Becoming authenticated connects; losing authentication disconnects; switching
    /// to a different user reconnects as that user.
    pub fn set_session(&self, session: SessionState) {
        let previous = self.connection.session();
        if previous == session {
            return;
        }

        self.connection.set_session(session);

        match (previous.connectable_user(), session.connectable_user()) {
            (_, None) => self.connection.disconnect(),
            (Some(before), Some(after)) if before != after => {
                self.connection.disconnect();
                self.connection.connect();
            }
            (_, Some(_)) => {
                self.connection.connect();
            }
        }
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    #[must_use]
    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    #[must_use]
    pub fn typing(&self) -> &TypingChannel {
        &self.typing
    }

    #[must_use]
    pub fn presence(&self) -> &PresenceChannel {
        &self.presence
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
