//! Per-session event bus
//!
//! Two independent mechanisms live here:
//!
//! - [`EventBus`]: named publish/subscribe. Handlers are invoked in
//!   subscription order, outside the table lock, so a handler may
//!   unsubscribe itself while being called.
//! - [`ContentWaiters`]: one-shot completions keyed by content id. The
//!   session dispatcher resolves them when the engine reports `contentEnd`
//!   for that id; they never touch the subscriber table.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::events::{EventName, SessionEvent};
use crate::{Error, Result};

/// Callback invoked for each published event
pub type EventHandler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Identity of a subscription, returned by [`EventBus::on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Named publish/subscribe channel for one session
pub struct EventBus {
    session_id: String,
    handlers: RwLock<HashMap<EventName, Vec<(SubscriptionId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `handler` to events named `name`
    pub fn on<F>(&self, name: EventName, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.on_shared(name, Arc::new(handler))
    }

    /// Subscribe one shared handler to every event name
    pub fn on_all<F>(&self, handler: F) -> Vec<(EventName, SubscriptionId)>
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        EventName::ALL
            .iter()
            .map(|name| (*name, self.on_shared(*name, handler.clone())))
            .collect()
    }

    fn on_shared(&self, name: EventName, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(name)
            .or_default()
            .push((id, handler));
        tracing::trace!(session_id = %self.session_id, event = %name, ?id, "Subscribed");
        id
    }

    /// Remove exactly the subscription `id` from `name`
    ///
    /// Returns false if it was not subscribed (already removed or wrong name).
    pub fn off(&self, name: EventName, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(&name);
        }
        removed
    }

    /// Deliver `event` to its subscribers, returning how many were called
    pub fn publish(&self, event: &SessionEvent) -> usize {
        let snapshot: Vec<EventHandler> = match self.handlers.read().get(&event.name()) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self, name: EventName) -> usize {
        self.handlers.read().get(&name).map_or(0, Vec::len)
    }
}

/// Pending "wait for contentEnd of this id" completions for one session
#[derive(Default)]
pub struct ContentWaiters {
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<SessionEvent>>>>,
    closed: AtomicBool,
}

impl ContentWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the `contentEnd` of `content_id`
    ///
    /// Register before issuing the content so a fast engine cannot answer
    /// ahead of the waiter.
    pub fn register(&self, content_id: impl Into<String>) -> ContentEndWait {
        let content_id = content_id.into();
        let (tx, rx) = oneshot::channel();
        // Checked under the table lock so a concurrent `close` cannot strand
        // the sender
        let mut pending = self.pending.lock();
        if !self.closed.load(Ordering::Acquire) {
            pending.entry(content_id.clone()).or_default().push(tx);
        }
        ContentEndWait { content_id, rx }
    }

    /// Complete every waiter for `content_id` with `event`
    pub fn resolve(&self, content_id: &str, event: &SessionEvent) -> usize {
        let Some(waiters) = self.pending.lock().remove(content_id) else {
            return 0;
        };
        let mut delivered = 0;
        for tx in waiters {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drop the waiters for `content_id` without resolving them
    pub fn cancel(&self, content_id: &str) {
        self.pending.lock().remove(content_id);
    }

    /// Fail all outstanding and future waiters (engine stream is gone)
    pub fn close(&self) {
        let mut pending = self.pending.lock();
        self.closed.store(true, Ordering::Release);
        pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }
}

/// Completion of a content block, resolved by its `contentEnd` event
#[must_use = "the contentEnd wait does nothing unless awaited"]
pub struct ContentEndWait {
    content_id: String,
    rx: oneshot::Receiver<SessionEvent>,
}

impl ContentEndWait {
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// Wait for the matching `contentEnd` event
    pub async fn wait(self) -> Result<SessionEvent> {
        let content_id = self.content_id;
        self.rx.await.map_err(|_| {
            Error::Connection(format!(
                "event stream ended before contentEnd for {}",
                content_id
            ))
        })
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`
    pub async fn wait_timeout(self, timeout: Duration) -> Result<SessionEvent> {
        let content_id = self.content_id.clone();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!(
                "no contentEnd for {} within {}ms",
                content_id,
                timeout.as_millis()
            ))),
        }
    }
}
