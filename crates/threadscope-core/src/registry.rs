//! Subscriber registry with non-blocking, drop-on-full fan-out.
//!
//! Every subscriber owns a bounded channel. [`Registry::dispatch`] offers a
//! snapshot to each of them with `try_send` under the read lock; a full
//! buffer drops that snapshot for that subscriber only. Registration and
//! removal take the write lock. The lock is never held across an `.await`.
//!
//! Dropping a [`Subscription`] removes it from the registry, so a subscriber
//! is removed exactly once however its owner goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::snapshot::SystemSnapshot;

/// Identity of a registered subscriber, unique within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of one [`Registry::dispatch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Subscribers whose buffer was full; they miss this snapshot.
    pub dropped: usize,
    /// Subscribers whose receiving side is gone but not yet deregistered.
    pub closed: usize,
}

type Outbound = mpsc::Sender<Arc<SystemSnapshot>>;

struct Inner {
    next_id: AtomicU64,
    closed: AtomicBool,
    subscribers: RwLock<HashMap<SubscriberId, Outbound>>,
}

impl Inner {
    fn remove(&self, id: SubscriberId) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

/// Shared set of bounded subscriber channels. Cloning yields another handle
/// to the same set.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new subscriber with a buffer of `capacity` snapshots.
    ///
    /// On a closed registry the returned subscription is already finished.
    pub fn register(&self, capacity: usize) -> Subscription {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(capacity.max(1));
        {
            let mut subs = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // Checked under the write lock so `close()` cannot miss it.
            if !self.inner.closed.load(Ordering::Acquire) {
                subs.insert(id, tx);
            }
        }
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscriber. Returns false if it was not registered, which
    /// makes repeated calls harmless.
    pub fn deregister(&self, id: SubscriberId) -> bool {
        self.inner.remove(id)
    }

    /// Offer `snapshot` to every subscriber without waiting on any of them.
    pub fn dispatch(&self, snapshot: &Arc<SystemSnapshot>) -> DispatchReport {
        let subs = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut report = DispatchReport::default();
        for (id, tx) in subs.iter() {
            match tx.try_send(Arc::clone(snapshot)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::trace!("{id} buffer full, dropping snapshot #{}", snapshot.seq);
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => report.closed += 1,
            }
        }
        report
    }

    /// Drop every subscriber channel and refuse new ones. Pending snapshots
    /// stay readable; afterwards `recv()` returns `None`.
    pub fn close(&self) {
        let mut subs = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.closed.store(true, Ordering::Release);
        subs.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of registered subscribers.
    pub fn len(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a registered subscriber.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<SystemSnapshot>>,
    registry: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next snapshot, or `None` once the subscription has been removed and
    /// its buffer drained.
    pub async fn recv(&mut self) -> Option<Arc<SystemSnapshot>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<SystemSnapshot>> {
        self.rx.try_recv().ok()
    }

    /// Snapshots currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Remove this subscriber from its registry. Idempotent; also runs on drop.
    pub fn deregister(&self) -> bool {
        match self.registry.upgrade() {
            Some(inner) => inner.remove(self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("buffered", &self.rx.len())
            .finish()
    }
}
