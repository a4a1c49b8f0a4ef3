//! Typed pub/sub keyed by `<kind>:<sessionId>` (spec.md §4.3).
//!
//! Delivery within one key is sequential in emit order; across keys no
//! ordering is promised. A subscriber callback is synchronous and fallible:
//! an `Err` is logged and does not stop delivery to the remaining
//! subscribers for that key.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use orchestrator_protocol::Event;
use tokio::sync::RwLock;

/// `output | todo | plan | tool | result | error`, matching spec.md §4.3's
/// key taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Output,
    Todo,
    Plan,
    Tool,
    Result,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Output => "output",
            EventKind::Todo => "todo",
            EventKind::Plan => "plan",
            EventKind::Tool => "tool",
            EventKind::Result => "result",
            EventKind::Error => "error",
        }
    }
}

fn key(kind: EventKind, session_id: &str) -> String {
    format!("{}:{session_id}", kind.as_str())
}

pub type Callback = Arc<dyn Fn(&Event) -> Result<(), String> + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: Callback,
}

/// A handle returned by `subscribe`. Calling `unsubscribe()` removes the
/// callback exactly once, even if called more than once.
#[derive(Clone)]
pub struct Subscription {
    bus: EventBus,
    kind: EventKind,
    session_id: String,
    id: u64,
}

impl Subscription {
    pub async fn unsubscribe(&self) {
        self.bus.unsubscribe(self.kind, &self.session_id, self.id).await;
    }
}

/// Cheap to clone: shares the underlying map via `Arc`.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn subscribe(
        &self,
        kind: EventKind,
        session_id: impl Into<String>,
        callback: Callback,
    ) -> Subscription {
        let session_id = session_id.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let k = key(kind, &session_id);
        self.subscribers
            .write()
            .await
            .entry(k)
            .or_default()
            .push(Subscriber { id, callback });

        Subscription {
            bus: self.clone(),
            kind,
            session_id,
            id,
        }
    }

    async fn unsubscribe(&self, kind: EventKind, session_id: &str, id: u64) {
        let k = key(kind, session_id);
        let mut map = self.subscribers.write().await;
        if let Some(subs) = map.get_mut(&k) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Deliver `event` to every subscriber registered under `kind` for
    /// `event.session_id()`, in registration order. A subscriber error is
    /// logged and does not stop the remaining deliveries.
    pub async fn emit(&self, kind: EventKind, event: &Event) {
        let k = key(kind, event.session_id());
        let callbacks: Vec<Callback> = {
            let map = self.subscribers.read().await;
            match map.get(&k) {
                Some(subs) => subs.iter().map(|s| s.callback.clone()).collect(),
                None => return,
            }
        };

        for callback in callbacks {
            if let Err(e) = callback(event) {
                tracing::warn!(key = %k, error = %e, "event bus subscriber returned an error");
            }
        }
    }

    /// Remove every subscriber for a session across all kinds, used by
    /// `destroySession` to strip subscriber addressability.
    pub async fn clear_session(&self, session_id: &str) {
        let mut map = self.subscribers.write().await;
        map.retain(|k, _| !k.ends_with(&format!(":{session_id}")));
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::Mutex;

    fn sample_event(session_id: &str) -> Event {
        Event::System {
            subtype: "init".to_string(),
            session_id: session_id.to_string(),
            extra: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_events_in_emit_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(
            EventKind::Output,
            "s1",
            Arc::new(move |_e| {
                o1.lock().unwrap().push(1);
                Ok(())
            }),
        )
        .await;

        let o2 = order.clone();
        bus.subscribe(
            EventKind::Output,
            "s1",
            Arc::new(move |_e| {
                o2.lock().unwrap().push(2);
                Ok(())
            }),
        )
        .await;

        bus.emit(EventKind::Output, &sample_event("s1")).await;
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn a_failing_subscriber_does_not_block_the_next_one() {
        let bus = EventBus::new();
        let second_ran = Arc::new(Mutex::new(false));

        bus.subscribe(EventKind::Error, "s1", Arc::new(|_e| Err("boom".to_string())))
            .await;

        let flag = second_ran.clone();
        bus.subscribe(
            EventKind::Error,
            "s1",
            Arc::new(move |_e| {
                *flag.lock().unwrap() = true;
                Ok(())
            }),
        )
        .await;

        bus.emit(EventKind::Error, &sample_event("s1")).await;
        assert!(*second_ran.lock().unwrap());
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_callback_exactly_once() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let sub = bus
            .subscribe(
                EventKind::Output,
                "s1",
                Arc::new(move |_e| {
                    *c.lock().unwrap() += 1;
                    Ok(())
                }),
            )
            .await;

        bus.emit(EventKind::Output, &sample_event("s1")).await;
        sub.unsubscribe().await;
        sub.unsubscribe().await;
        bus.emit(EventKind::Output, &sample_event("s1")).await;

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn keys_are_scoped_by_session_id() {
        let bus = EventBus::new();
        let hit = Arc::new(Mutex::new(false));
        let h = hit.clone();
        bus.subscribe(
            EventKind::Output,
            "s1",
            Arc::new(move |_e| {
                *h.lock().unwrap() = true;
                Ok(())
            }),
        )
        .await;

        bus.emit(EventKind::Output, &sample_event("s2")).await;
        assert!(!*hit.lock().unwrap());
    }
}
