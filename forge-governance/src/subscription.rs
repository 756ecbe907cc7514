//! Typed subscriber lists shared by every component that emits events.
//!
//! Each subscriber owns a dedicated delivery task fed by its own channel, so
//! delivery is FIFO per subscriber and a slow callback never holds up the
//! emitter or other subscribers. Filters run before enqueueing; debouncing
//! happens inside the delivery task and always delivers the latest item of
//! a burst. Callback errors and panics are logged and swallowed.
//!
//! ```text
//! publish(item) ─┬─ filter? ─► [chan] ─► task ─► debounce? ─► callback
//!                ├─ filter? ─► [chan] ─► task ─► callback
//!                └─ ...
//! ```

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Subscriber callback.
pub type Callback<T> = Arc<dyn Fn(&T) -> anyhow::Result<()> + Send + Sync>;

/// Pure predicate evaluated before an item is queued for a subscriber.
pub type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Per-subscription delivery options.
pub struct SubscribeOptions<T> {
    pub filter: Option<Filter<T>>,
    pub debounce: Option<Duration>,
}

impl<T> Default for SubscribeOptions<T> {
    fn default() -> Self {
        Self {
            filter: None,
            debounce: None,
        }
    }
}

impl<T> Clone for SubscribeOptions<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            debounce: self.debounce,
        }
    }
}

impl<T> SubscribeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only deliver items for which `filter` returns true.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Coalesce bursts so at most one callback runs per `window`.
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window).filter(|w| !w.is_zero());
        self
    }
}

enum Sender<T> {
    Unbounded(mpsc::UnboundedSender<T>),
    Bounded(mpsc::Sender<T>),
}

enum Receiver<T> {
    Unbounded(mpsc::UnboundedReceiver<T>),
    Bounded(mpsc::Receiver<T>),
}

impl<T> Receiver<T> {
    async fn recv(&mut self) -> Option<T> {
        match self {
            Receiver::Unbounded(rx) => rx.recv().await,
            Receiver::Bounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<T> {
        match self {
            Receiver::Unbounded(rx) => rx.try_recv().ok(),
            Receiver::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

enum SendOutcome {
    Queued,
    Dropped,
    Closed,
}

impl<T> Sender<T> {
    fn send(&self, item: T) -> SendOutcome {
        match self {
            Sender::Unbounded(tx) => match tx.send(item) {
                Ok(()) => SendOutcome::Queued,
                Err(_) => SendOutcome::Closed,
            },
            Sender::Bounded(tx) => match tx.try_send(item) {
                Ok(()) => SendOutcome::Queued,
                Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Dropped,
                Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
            },
        }
    }
}

struct Entry<T> {
    id: String,
    token: u64,
    filter: Option<Filter<T>>,
    sender: Sender<T>,
    task: JoinHandle<()>,
}

struct Registry<T> {
    entries: Vec<Entry<T>>,
    next_token: u64,
}

impl<T> Registry<T> {
    fn remove(&mut self, id: &str, token: Option<u64>) -> bool {
        let position = self
            .entries
            .iter()
            .position(|e| e.id == id && token.map_or(true, |t| t == e.token));
        match position {
            Some(index) => {
                let entry = self.entries.remove(index);
                entry.task.abort();
                true
            }
            None => false,
        }
    }
}

/// Ordered list of subscribers for items of type `T`.
pub struct SubscriberList<T> {
    channel: &'static str,
    capacity: Option<usize>,
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> fmt::Debug for SubscriberList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberList")
            .field("channel", &self.channel)
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> SubscriberList<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Subscriber list whose per-subscriber queues are unbounded.
    pub fn unbounded(channel: &'static str) -> Self {
        Self::build(channel, None)
    }

    /// Subscriber list whose per-subscriber queues hold at most `capacity`
    /// items; overflow is dropped for the lagging subscriber only.
    pub fn bounded(channel: &'static str, capacity: usize) -> Self {
        Self::build(channel, Some(capacity.max(1)))
    }

    fn build(channel: &'static str, capacity: Option<usize>) -> Self {
        Self {
            channel,
            capacity,
            registry: Arc::new(Mutex::new(Registry {
                entries: Vec::new(),
                next_token: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` under `id`. Re-using an id replaces the previous
    /// subscription in place, keeping its position in delivery order.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(
        &self,
        id: impl Into<String>,
        callback: F,
        options: SubscribeOptions<T>,
    ) -> Subscription
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = id.into();
        let callback: Callback<T> = Arc::new(callback);

        let (sender, receiver) = match self.capacity {
            Some(cap) => {
                let (tx, rx) = mpsc::channel(cap);
                (Sender::Bounded(tx), Receiver::Bounded(rx))
            }
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Sender::Unbounded(tx), Receiver::Unbounded(rx))
            }
        };

        let task = tokio::spawn(deliver(
            id.clone(),
            self.channel,
            receiver,
            callback,
            options.debounce,
        ));

        let mut registry = self.lock();
        let token = registry.next_token;
        registry.next_token += 1;

        let entry = Entry {
            id: id.clone(),
            token,
            filter: options.filter,
            sender,
            task,
        };

        match registry.entries.iter().position(|e| e.id == id) {
            Some(index) => {
                let old = std::mem::replace(&mut registry.entries[index], entry);
                old.task.abort();
                tracing::debug!(channel = self.channel, subscriber_id = %id, "Subscription replaced");
            }
            None => {
                registry.entries.push(entry);
                tracing::debug!(channel = self.channel, subscriber_id = %id, "Subscribed");
            }
        }

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        let detach_id = id.clone();
        Subscription {
            id,
            detach: Some(Box::new(move || match weak.upgrade() {
                Some(registry) => registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&detach_id, Some(token)),
                None => false,
            })),
        }
    }

    /// Queue `item` for every subscriber whose filter accepts it, in
    /// registration order. Returns the number of subscribers it was queued for.
    pub fn publish(&self, item: &T) -> usize {
        let mut registry = self.lock();
        let mut queued = 0;
        let mut closed = Vec::new();

        for entry in &registry.entries {
            if let Some(filter) = &entry.filter {
                match catch_unwind(AssertUnwindSafe(|| filter(item))) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(_) => {
                        tracing::error!(
                            channel = self.channel,
                            subscriber_id = %entry.id,
                            "Subscriber filter panicked; item skipped"
                        );
                        continue;
                    }
                }
            }

            match entry.sender.send(item.clone()) {
                SendOutcome::Queued => queued += 1,
                SendOutcome::Dropped => {
                    tracing::warn!(
                        channel = self.channel,
                        subscriber_id = %entry.id,
                        "Subscriber buffer full; item dropped"
                    );
                }
                SendOutcome::Closed => closed.push((entry.id.clone(), entry.token)),
            }
        }

        for (id, token) in closed {
            registry.remove(&id, Some(token));
        }

        queued
    }

    /// Remove the subscriber registered under `id`.
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.lock().remove(id, None)
    }

    /// Subscriber ids in delivery order.
    pub fn ids(&self) -> Vec<String> {
        self.lock().entries.iter().map(|e| e.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn deliver<T>(
    id: String,
    channel: &'static str,
    mut receiver: Receiver<T>,
    callback: Callback<T>,
    debounce: Option<Duration>,
) {
    while let Some(mut item) = receiver.recv().await {
        if let Some(window) = debounce {
            tokio::time::sleep(window).await;
            while let Some(next) = receiver.try_recv() {
                item = next;
            }
        }

        match catch_unwind(AssertUnwindSafe(|| callback(&item))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(channel, subscriber_id = %id, error = %e, "Subscriber callback failed");
            }
            Err(_) => {
                tracing::error!(channel, subscriber_id = %id, "Subscriber callback panicked");
            }
        }
    }
}

/// Handle returned by every `subscribe` call. Dropping it does **not**
/// unsubscribe; call [`Subscription::unsubscribe`] explicitly.
pub struct Subscription {
    id: String,
    detach: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop delivery to this subscriber. Returns false if the subscription
    /// was already replaced, removed, or its emitter dropped.
    pub fn unsubscribe(mut self) -> bool {
        self.detach.take().map_or(false, |detach| detach())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
