//! Connects to a realtime chat server and logs everything the channels observe.
//!
//! Run with tracing enabled:
//! ```sh
//! REALTIME_WS_URL=ws://localhost:8000/ws/chat/ REALTIME_API_URL=http://localhost:8000/api/ \
//! ACCESS_TOKEN=... REFRESH_TOKEN=... USER_ID=42 \
//! RUST_LOG=info,realtime_transport=debug cargo run --example chat --features tracing
//! ```
//!
//! Optionally send a message once connected with `CONVERSATION_ID=7 MESSAGE=hello`.

use std::sync::Arc;
use std::time::Duration;

use realtime_transport::RealtimeSession;
use realtime_transport::auth::{HttpTokenProvider, SessionState, TokenStore};
use realtime_transport::channels::ChatChannel;
use realtime_transport::ws::ConnectionManager;
use realtime_transport::ws::config::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

fn env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|e| anyhow::anyhow!("{name}: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = TokenStore::new(env("ACCESS_TOKEN")?, env("REFRESH_TOKEN")?);
    let auth = Arc::new(HttpTokenProvider::new(&env("REALTIME_API_URL")?, store)?);
    let config = Config::builder().url(env("REALTIME_WS_URL")?).build();

    let connection = ConnectionManager::new(config, auth)?;
    let chat = ChatChannel::with_deletion_callback(&connection, |message_id, conversation_id| {
        info!(message_id, ?conversation_id, "message deleted");
    });
    let session = RealtimeSession::with_chat(connection, chat);

    let mut warnings = session.connection().warnings();
    tokio::spawn(async move {
        while let Ok(warning) = warnings.recv().await {
            warn!(?warning, "connection warning");
        }
    });

    session.set_session(SessionState::authenticated(env("USER_ID")?.parse()?));

    let mut status = session.connection().status_receiver();
    status.wait_for(|s| s.is_connected || s.error.is_some()).await?;
    info!(status = ?*status.borrow(), "initial connection settled");

    if let (Ok(conversation), Ok(text)) = (env("CONVERSATION_ID"), env("MESSAGE")) {
        let sent = session
            .chat()
            .send_chat_message(conversation.parse()?, &text, vec![]);
        info!(sent, "chat message");
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                info!(
                    messages = session.chat().messages().len(),
                    typing = ?session.typing().typing_users(),
                    online = ?session.presence().online_users(),
                    "snapshot"
                );
            }
        }
    }

    session.stop();
    Ok(())
}
