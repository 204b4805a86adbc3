//! Realtime features layered on a shared [`ConnectionManager`](crate::ws::ConnectionManager).
//!
//! Each channel registers exactly one handler on the connection's dispatcher and
//! sends only through [`ConnectionManager::send_message`](crate::ws::ConnectionManager::send_message);
//! none of them touches the socket. Dropping a channel unregisters its handler.

pub mod chat;
pub mod presence;
pub mod typing;

pub use chat::ChatChannel;
pub use presence::PresenceChannel;
pub use typing::{TypingChannel, TypingEntry};

/// Handler id unique to one channel instance.
fn handler_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}
