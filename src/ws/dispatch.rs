use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::message::{MessageKind, WebSocketMessage};
use crate::Result;
use crate::error::HandlerFailure;

/// Consumer callback invoked for every fanned-out frame.
pub type Handler = Arc<dyn Fn(&WebSocketMessage) -> Result<()> + Send + Sync>;

struct Registration {
    /// Distinguishes a replaced handler from its replacement under the same id
    token: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    handlers: DashMap<String, Registration>,
    next_token: AtomicU64,
}

/// Registry of consumer handlers sharing one connection.
///
/// Every inbound frame except heartbeats and unknown kinds is delivered to every
/// registered handler. Delivery order across different ids is unspecified.
#[derive(Clone, Default)]
pub struct MessageDispatcher {
    registry: Arc<Registry>,
}

impl MessageDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `id`, replacing any handler already registered there.
    ///
    /// The returned [`Subscription`] removes the registration when
    /// [`Subscription::unsubscribe`] is called or when it is dropped.
    pub fn on_message<S, F>(&self, id: S, handler: F) -> Subscription
    where
        S: Into<String>,
        F: Fn(&WebSocketMessage) -> Result<()> + Send + Sync + 'static,
    {
        let id = id.into();
        let token = self.registry.next_token.fetch_add(1, Ordering::Relaxed);

        let replaced = self
            .registry
            .handlers
            .insert(
                id.clone(),
                Registration {
                    token,
                    handler: Arc::new(handler),
                },
            )
            .is_some();

        #[cfg(feature = "tracing")]
        tracing::debug!(handler = %id, replaced, "Registered message handler");
        #[cfg(not(feature = "tracing"))]
        let _ = replaced;

        Subscription {
            registry: Arc::downgrade(&self.registry),
            id,
            token,
            active: AtomicBool::new(true),
        }
    }

    /// Fan `message` out to every registered handler, returning how many handled it
    /// successfully.
    ///
    /// A handler that errors or panics is logged and skipped; the remaining handlers
    /// still receive the frame.
    pub fn dispatch(&self, message: &WebSocketMessage) -> usize {
        match message.kind {
            MessageKind::Heartbeat => return 0,
            MessageKind::Unknown => {
                #[cfg(feature = "tracing")]
                tracing::debug!(data = %message.data, "Ignoring message with unknown type");
                return 0;
            }
            _ => {}
        }

        // Snapshot so handlers may register or unsubscribe without deadlocking the map
        let handlers: Vec<(String, Handler)> = self
            .registry
            .handlers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.value().handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(message))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(handler = %id, kind = %message.kind, error = %e, "Message handler failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = (&id, &e);
                }
                Err(panic) => {
                    let failure = HandlerFailure {
                        handler: id,
                        message: panic_message(panic.as_ref()),
                    };
                    #[cfg(feature = "tracing")]
                    tracing::error!(kind = %message.kind, error = %failure, "Message handler panicked");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &failure;
                }
            }
        }

        delivered
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.registry.handlers.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.handlers.is_empty()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Handle to a handler registration.
///
/// Removal is idempotent and safe after the dispatcher itself has been dropped. A
/// subscription whose id was since re-registered by someone else leaves the newer
/// handler in place.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    registry: Weak<Registry>,
    id: String,
    token: u64,
    active: AtomicBool,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(registry) = self.registry.upgrade() {
            let removed = registry
                .handlers
                .remove_if(&self.id, |_, registration| registration.token == self.token)
                .is_some();

            #[cfg(feature = "tracing")]
            tracing::debug!(handler = %self.id, removed, "Unregistered message handler");
            #[cfg(not(feature = "tracing"))]
            let _ = removed;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::error::Error;
    use crate::ws::message::parse_frame;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Handler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let make = move |label: &str| -> Handler {
            let seen = Arc::clone(&seen_clone);
            let label = label.to_owned();
            Arc::new(move |msg: &WebSocketMessage| {
                seen.lock().unwrap().push(format!("{label}:{}", msg.kind));
                Ok(())
            })
        };
        (seen, make)
    }

    fn message(kind: &str) -> WebSocketMessage {
        parse_frame(&json!({ "type": kind, "data": {} }).to_string()).unwrap()
    }

    #[test]
    fn fans_out_to_every_handler() {
        let dispatcher = MessageDispatcher::new();
        let (seen, make) = recorder();
        let a = make("a");
        let b = make("b");
        let _sub_a = dispatcher.on_message("a", move |m| a(m));
        let _sub_b = dispatcher.on_message("b", move |m| b(m));

        assert_eq!(dispatcher.dispatch(&message("notification")), 2);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:notification", "b:notification"]);
    }

    #[test]
    fn same_id_is_last_writer_wins() {
        let dispatcher = MessageDispatcher::new();
        let (seen, make) = recorder();
        let h1 = make("h1");
        let h2 = make("h2");
        let _first = dispatcher.on_message("a", move |m| h1(m));
        let _second = dispatcher.on_message("a", move |m| h2(m));

        dispatcher.dispatch(&message("status"));

        assert_eq!(*seen.lock().unwrap(), vec!["h2:status"]);
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn stale_subscription_does_not_remove_replacement() {
        let dispatcher = MessageDispatcher::new();
        let first = dispatcher.on_message("a", |_| Ok(()));
        let _second = dispatcher.on_message("a", |_| Ok(()));

        first.unsubscribe();

        assert!(dispatcher.contains("a"));
    }

    #[test]
    fn heartbeat_and_unknown_are_never_delivered() {
        let dispatcher = MessageDispatcher::new();
        let (seen, make) = recorder();
        let h = make("h");
        let _sub = dispatcher.on_message("h", move |m| h(m));

        assert_eq!(dispatcher.dispatch(&message("heartbeat")), 0);
        assert_eq!(dispatcher.dispatch(&message("mystery")), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_handlers_do_not_stop_fan_out() {
        let dispatcher = MessageDispatcher::new();
        let (seen, make) = recorder();
        let ok = make("ok");
        let _err = dispatcher.on_message("err", |_| Err(Error::validation("bad")));
        let _panic = dispatcher.on_message("panic", |_| panic!("consumer bug"));
        let _ok = dispatcher.on_message("ok", move |m| ok(m));

        assert_eq!(dispatcher.dispatch(&message("typing")), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["ok:typing"]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_safe() {
        let dispatcher = MessageDispatcher::new();
        let sub = dispatcher.on_message("a", |_| Ok(()));

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(dispatcher.is_empty());

        let late = dispatcher.on_message("b", |_| Ok(()));
        drop(dispatcher);
        late.unsubscribe();
        drop(late);
    }

    #[test]
    fn dropping_subscription_unregisters() {
        let dispatcher = MessageDispatcher::new();
        {
            let _sub = dispatcher.on_message("scoped", |_| Ok(()));
            assert!(dispatcher.contains("scoped"));
        }
        assert!(!dispatcher.contains("scoped"));
    }

    #[test]
    fn handler_may_unsubscribe_during_dispatch() {
        let dispatcher = MessageDispatcher::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = Arc::clone(&slot);
        let sub = dispatcher.on_message("once", move |_| {
            if let Some(sub) = slot_clone.lock().unwrap().take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(sub);

        assert_eq!(dispatcher.dispatch(&message("notification")), 1);
        assert!(!dispatcher.contains("once"));
    }
}
