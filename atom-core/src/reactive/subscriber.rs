//! Subscriber bookkeeping for cells.
//!
//! Every cell owns a [`SubscriberSet`]: the callbacks to invoke on
//! invalidation, plus the mount state that tracks whether the cell's
//! external resource is live. The set drives the mount/unmount lifecycle:
//!
//! - 0 → 1 subscribers: run the mount hook and keep its cleanup.
//! - 1 → 0 subscribers: defer a teardown task through the cell's
//!   [`Scheduler`]; the task only runs the cleanup if the set is still empty
//!   when it fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::cell::CellId;
use crate::scheduler::Scheduler;

/// Callback invoked when a cell is invalidated or updated.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Cleanup returned by a mount hook or an async producer.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Unique identifier for a subscriber.
///
/// Each subscription gets a fresh ID, so subscribing the same closure twice
/// yields two independent subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

enum Mount {
    Unmounted,
    /// Live. The cleanup may be absent if the hook returned none.
    Mounted(Option<Cleanup>),
}

struct Registry {
    callbacks: IndexMap<SubscriberId, Callback>,
    mount: Mount,
}

/// The subscribers of one cell and its mount state.
pub(crate) struct SubscriberSet {
    cell: CellId,
    registry: Mutex<Registry>,
    scheduler: Arc<dyn Scheduler>,
}

impl SubscriberSet {
    pub(crate) fn new(cell: CellId, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            cell,
            registry: Mutex::new(Registry {
                callbacks: IndexMap::new(),
                mount: Mount::Unmounted,
            }),
            scheduler,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.lock().callbacks.len()
    }

    pub(crate) fn is_mounted(&self) -> bool {
        matches!(self.registry.lock().mount, Mount::Mounted(_))
    }

    /// Register `callback`. Runs `on_mount` if the cell was not mounted.
    ///
    /// A cell whose teardown is still pending counts as mounted, so a quick
    /// resubscribe keeps the existing resource.
    pub(crate) fn subscribe<M>(self: &Arc<Self>, callback: Callback, on_mount: M) -> Subscription
    where
        M: FnOnce() -> Option<Cleanup>,
    {
        let id = SubscriberId::new();
        let needs_mount = {
            let mut registry = self.registry.lock();
            registry.callbacks.insert(id, callback);
            if matches!(registry.mount, Mount::Unmounted) {
                registry.mount = Mount::Mounted(None);
                true
            } else {
                false
            }
        };

        if needs_mount {
            debug!(cell = %self.cell, "mounting");
            let cleanup = on_mount();
            // The mount hook may have dropped the last subscriber already.
            let orphaned = {
                let mut registry = self.registry.lock();
                match &mut registry.mount {
                    Mount::Mounted(slot) => {
                        *slot = cleanup;
                        None
                    }
                    Mount::Unmounted => cleanup,
                }
            };
            if let Some(cleanup) = orphaned {
                cleanup();
            }
        }

        Subscription {
            set: Some(Arc::clone(self)),
            id,
        }
    }

    fn remove(self: &Arc<Self>, id: SubscriberId) {
        let became_idle = {
            let mut registry = self.registry.lock();
            registry.callbacks.shift_remove(&id).is_some()
                && registry.callbacks.is_empty()
                && matches!(registry.mount, Mount::Mounted(_))
        };

        if became_idle {
            trace!(cell = %self.cell, "last subscriber left, scheduling teardown");
            let set = Arc::clone(self);
            self.scheduler.defer(Box::new(move || set.teardown_if_idle()));
        }
    }

    fn teardown_if_idle(&self) {
        let cleanup = {
            let mut registry = self.registry.lock();
            if !registry.callbacks.is_empty() {
                trace!(cell = %self.cell, "resubscribed before teardown, staying mounted");
                return;
            }
            match std::mem::replace(&mut registry.mount, Mount::Unmounted) {
                Mount::Mounted(cleanup) => cleanup,
                Mount::Unmounted => return,
            }
        };

        debug!(cell = %self.cell, "unmounting");
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    /// Invoke every subscriber registered right now.
    ///
    /// Subscribers added during the pass are not called; subscribers removed
    /// during the pass are skipped.
    pub(crate) fn notify(&self) {
        let snapshot: SmallVec<[(SubscriberId, Callback); 4]> = self
            .registry
            .lock()
            .callbacks
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        trace!(cell = %self.cell, subscribers = snapshot.len(), "notifying");
        for (id, callback) in snapshot {
            let live = self.registry.lock().callbacks.contains_key(&id);
            if live {
                callback();
            }
        }
    }
}

/// A live subscription to a cell.
///
/// Dropping the subscription unsubscribes; [`Subscription::unsubscribe`]
/// does the same explicitly.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    set: Option<Arc<SubscriberSet>>,
    id: SubscriberId,
}

impl Subscription {
    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Remove the callback from the cell.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(set) = self.set.take() {
            set.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("cell", &self.set.as_ref().map(|set| set.cell))
            .finish()
    }
}
