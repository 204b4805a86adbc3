use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use super::handler_id;
use crate::ws::message::{ChatPayload, Event, MessageKind, WebSocketMessage};
use crate::ws::{ConnectionManager, Subscription};

/// Called once per `message_deleted` event with `(message_id, conversation_id)`.
pub type DeletionCallback = Arc<dyn Fn(i64, Option<i64>) + Send + Sync>;

/// Chat delivery over the shared connection.
///
/// Received messages are kept in arrival order and never removed: a
/// `message_deleted` event marks the stored message with its `deletion_type`
/// instead.
pub struct ChatChannel {
    connection: ConnectionManager,
    messages: Arc<RwLock<Vec<ChatPayload>>>,
    subscription: Subscription,
}

impl ChatChannel {
    #[must_use]
    pub fn new(connection: &ConnectionManager) -> Self {
        Self::register(connection, None)
    }

    /// Like [`Self::new`], additionally invoking `on_deleted` for every deletion event.
    #[must_use]
    pub fn with_deletion_callback<F>(connection: &ConnectionManager, on_deleted: F) -> Self
    where
        F: Fn(i64, Option<i64>) + Send + Sync + 'static,
    {
        Self::register(connection, Some(Arc::new(on_deleted)))
    }

    fn register(connection: &ConnectionManager, on_deleted: Option<DeletionCallback>) -> Self {
        let messages: Arc<RwLock<Vec<ChatPayload>>> = Arc::default();
        let store = Arc::clone(&messages);

        let subscription = connection.on_message(handler_id("chat"), move |msg| {
            if !matches!(msg.kind, MessageKind::Message | MessageKind::MessageDeleted) {
                return Ok(());
            }

            match msg.event()? {
                Event::Chat(payload) => {
                    store
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(payload);
                }
                Event::MessageDeleted(deleted) => {
                    let patched = {
                        let mut messages = store.write().unwrap_or_else(PoisonError::into_inner);
                        match messages.iter_mut().find(|m| m.id == Some(deleted.message_id)) {
                            Some(message) => {
                                message.deletion_type = Some(deleted.deletion_type.clone());
                                true
                            }
                            None => false,
                        }
                    };

                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        message_id = deleted.message_id,
                        deletion_type = %deleted.deletion_type,
                        patched,
                        "Message deleted"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = patched;

                    if let Some(callback) = &on_deleted {
                        callback(deleted.message_id, deleted.conversation_id);
                    }
                }
                _ => {}
            }
            Ok(())
        });

        Self {
            connection: connection.clone(),
            messages,
            subscription,
        }
    }

    /// Send `text` to `conversation_id`. Returns `false` when the socket is not open.
    pub fn send_chat_message(
        &self,
        conversation_id: i64,
        text: &str,
        attachments: Vec<Value>,
    ) -> bool {
        self.connection
            .send_message(&WebSocketMessage::chat(conversation_id, text, attachments))
    }

    /// Every message received so far, in arrival order.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatPayload> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn messages_in(&self, conversation_id: i64) -> Vec<ChatPayload> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.conversation_id == Some(conversation_id))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn message(&self, id: i64) -> Option<ChatPayload> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id == Some(id))
            .cloned()
    }

    /// Stop receiving messages. Idempotent; also happens on drop.
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }
}
