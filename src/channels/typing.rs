use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

use super::handler_id;
use crate::ws::message::{Event, MessageKind, WebSocketMessage};
use crate::ws::{ConnectionManager, Subscription};

/// How long a typing indicator lives without a fresh `is_typing=true` event.
pub const TYPING_TTL: Duration = Duration::from_millis(3000);

/// A user currently typing.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub user_id: i64,
    pub user_name: String,
    pub conversation_id: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

struct Slot {
    entry: TypingEntry,
    expires_at: Instant,
    /// Identifies the event that scheduled `expiry`
    token: u64,
    expiry: Option<JoinHandle<()>>,
}

impl Slot {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(expiry) = self.expiry.take() {
            expiry.abort();
        }
    }
}

type Slots = DashMap<i64, Slot>;

/// Typing indicators over the shared connection.
///
/// Each user has at most one pending expiry timer: a new `is_typing=true` event
/// cancels the previous timer and starts a fresh one.
pub struct TypingChannel {
    connection: ConnectionManager,
    slots: Arc<Slots>,
    subscription: Subscription,
}

impl TypingChannel {
    #[must_use]
    pub fn new(connection: &ConnectionManager) -> Self {
        Self::with_ttl(connection, TYPING_TTL)
    }

    #[must_use]
    pub fn with_ttl(connection: &ConnectionManager, ttl: Duration) -> Self {
        let slots: Arc<Slots> = Arc::default();
        let weak = Arc::downgrade(&slots);
        let counter = AtomicU64::new(0);

        let subscription = connection.on_message(handler_id("typing"), move |msg| {
            if msg.kind != MessageKind::Typing {
                return Ok(());
            }
            let Event::Typing(typing) = msg.event()? else {
                return Ok(());
            };
            let Some(slots) = weak.upgrade() else {
                return Ok(());
            };

            if !typing.is_typing {
                slots.remove(&typing.user_id);
                return Ok(());
            }

            let token = counter.fetch_add(1, Ordering::Relaxed);
            let slot = Slot {
                entry: TypingEntry {
                    user_id: typing.user_id,
                    user_name: typing.user_name,
                    conversation_id: typing.conversation_id,
                    timestamp: msg.timestamp.unwrap_or_else(Utc::now),
                },
                expires_at: Instant::now() + ttl,
                token,
                expiry: schedule_expiry(Weak::clone(&weak), typing.user_id, token, ttl),
            };

            // Replacing the slot drops the previous one, which cancels its timer
            slots.insert(typing.user_id, slot);
            Ok(())
        });

        Self {
            connection: connection.clone(),
            slots,
            subscription,
        }
    }

    /// Tell `conversation_id` whether the local user is typing.
    pub fn send_typing_status(&self, conversation_id: i64, is_typing: bool) -> bool {
        self.connection
            .send_message(&WebSocketMessage::typing(conversation_id, is_typing))
    }

    #[must_use]
    pub fn is_user_typing(&self, user_id: i64) -> bool {
        self.slots.get(&user_id).is_some_and(|slot| slot.is_live())
    }

    #[must_use]
    pub fn typing_users(&self) -> Vec<TypingEntry> {
        let mut users: Vec<TypingEntry> = self
            .slots
            .iter()
            .filter(|slot| slot.is_live())
            .map(|slot| slot.entry.clone())
            .collect();
        users.sort_by_key(|entry| entry.user_id);
        users
    }

    #[must_use]
    pub fn typing_in(&self, conversation_id: i64) -> Vec<TypingEntry> {
        self.typing_users()
            .into_iter()
            .filter(|entry| entry.conversation_id == Some(conversation_id))
            .collect()
    }

    /// Stop receiving typing events. Idempotent; also happens on drop.
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }
}

/// Remove `user_id` after `ttl` unless a newer event replaced the slot meanwhile.
/// Without a runtime no timer runs; reads still treat the entry as expired.
fn schedule_expiry(
    slots: Weak<Slots>,
    user_id: i64,
    token: u64,
    ttl: Duration,
) -> Option<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current().ok()?;
    Some(runtime.spawn(async move {
        sleep(ttl).await;
        if let Some(slots) = slots.upgrade()
            && let Some((_, mut expired)) =
                slots.remove_if(&user_id, |_, slot| slot.token == token)
        {
            // This task is the timer; do not abort ourselves while dropping
            expired.expiry = None;
        }
    }))
}
