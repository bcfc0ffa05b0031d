//! Lifecycle event subscriptions.

use crate::execution::SandboxId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Destroy,
    Console,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Dir,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    /// Emitted exactly once, after the engine has been torn down.
    Destroy { id: SandboxId, cpu_time_ms: f64 },
    /// Guest console output (only with logging enabled).
    Console {
        id: SandboxId,
        level: ConsoleLevel,
        args: Vec<Value>,
    },
}

impl SandboxEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SandboxEvent::Destroy { .. } => EventKind::Destroy,
            SandboxEvent::Console { .. } => EventKind::Console,
        }
    }
}

type Callback = Arc<dyn Fn(&SandboxEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    kind: EventKind,
    callback: Callback,
}

/// Subscriber table. `None` once closed by `destroy`.
pub struct EventBus {
    subscribers: Arc<Mutex<Option<Vec<Subscriber>>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Some(Vec::new()))),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. After [`EventBus::close`] the returned
    /// subscription is inert.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&SandboxEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(subscribers) = guard.as_mut() {
            subscribers.push(Subscriber {
                id,
                kind,
                callback: Arc::new(callback),
            });
        }
        Subscription {
            table: Arc::downgrade(&self.subscribers),
            id,
        }
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// Callbacks run outside the lock, so they may subscribe or unsubscribe.
    pub fn emit(&self, event: &SandboxEvent) {
        let callbacks: Vec<Callback> = {
            let guard = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            match guard.as_ref() {
                Some(subscribers) => subscribers
                    .iter()
                    .filter(|s| s.kind == event.kind())
                    .map(|s| s.callback.clone())
                    .collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Deliver a final event and drop the subscriber table.
    pub fn close_with(&self, event: &SandboxEvent) {
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        for subscriber in subscribers.into_iter().flatten() {
            if subscriber.kind == event.kind() {
                (subscriber.callback)(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, Vec::len)
    }
}

/// Handle returned by [`EventBus::on`].
#[must_use = "dropping a Subscription does not unsubscribe; call unsubscribe()"]
pub struct Subscription {
    table: Weak<Mutex<Option<Vec<Subscriber>>>>,
    id: u64,
}

impl Subscription {
    /// Remove the callback. No-op if the bus is gone or closed.
    pub fn unsubscribe(self) {
        if let Some(table) = self.table.upgrade() {
            let mut guard = table.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(subscribers) = guard.as_mut() {
                subscribers.retain(|s| s.id != self.id);
            }
        }
    }
}
