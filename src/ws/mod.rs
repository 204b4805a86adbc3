//! Core WebSocket infrastructure.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: owns the socket, heartbeat, reconnection and token refresh
//! - [`MessageDispatcher`]: fans inbound frames out to registered consumer handlers
//! - [`WebSocketMessage`]: the JSON envelope every frame uses, with a typed [`Event`] view
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use realtime_transport::auth::{HttpTokenProvider, TokenStore};
//! use realtime_transport::ws::ConnectionManager;
//! use realtime_transport::ws::config::Config;
//!
//! # async fn example() -> realtime_transport::Result<()> {
//! let store = TokenStore::new("access".to_owned(), "refresh".to_owned());
//! let auth = Arc::new(HttpTokenProvider::new("https://example.com/api/", store)?);
//! let connection = ConnectionManager::new(Config::default(), auth)?;
//!
//! let _sub = connection.on_message("audit", |msg| {
//!     println!("{:?}", msg.event()?);
//!     Ok(())
//! });
//! connection.connect();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod message;

pub use connection::{ConnectionManager, ConnectionStatus, Warning};
pub use dispatch::{MessageDispatcher, Subscription};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use message::{Event, MessageKind, WebSocketMessage};
