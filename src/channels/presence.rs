use std::sync::Arc;

use dashmap::DashSet;

use super::handler_id;
use crate::ws::message::{Event, MessageKind};
use crate::ws::{ConnectionManager, Subscription};

/// Online users, tracked from `status` events.
pub struct PresenceChannel {
    online: Arc<DashSet<i64>>,
    subscription: Subscription,
}

impl PresenceChannel {
    #[must_use]
    pub fn new(connection: &ConnectionManager) -> Self {
        let online: Arc<DashSet<i64>> = Arc::default();
        let set = Arc::clone(&online);

        let subscription = connection.on_message(handler_id("presence"), move |msg| {
            if msg.kind != MessageKind::Status {
                return Ok(());
            }
            if let Event::Status(status) = msg.event()? {
                if status.is_online {
                    set.insert(status.user_id);
                } else {
                    set.remove(&status.user_id);
                }

                #[cfg(feature = "tracing")]
                tracing::trace!(
                    user_id = status.user_id,
                    online = status.is_online,
                    "Presence changed"
                );
            }
            Ok(())
        });

        Self {
            online,
            subscription,
        }
    }

    #[must_use]
    pub fn is_user_online(&self, user_id: i64) -> bool {
        self.online.contains(&user_id)
    }

    /// Online user ids in ascending order.
    #[must_use]
    pub fn online_users(&self) -> Vec<i64> {
        let mut users: Vec<i64> = self.online.iter().map(|id| *id).collect();
        users.sort_unstable();
        users
    }

    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }
}
