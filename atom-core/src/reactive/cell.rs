//! The reactive cell core.
//!
//! Every cell kind is a thin handle around an `Arc` of its own inner type,
//! and every inner type embeds a [`CellCore`]. The core owns the three
//! pieces of state the cell kinds share:
//!
//! - the cached value and its dirty flag,
//! - the subscriber set with its mount lifecycle,
//! - the per-cell options (label, scheduler, mount hook).
//!
//! # Caching
//!
//! The cached value is only returned while the cell is clean. A dirty cell
//! runs its kind-specific `read` on the next `peek`. If `read` suspends or
//! fails, the dirty flag is left untouched and the interrupt propagates to
//! the caller.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::subscriber::{Callback, Cleanup, SubscriberSet, Subscription};
use crate::scheduler::{default_scheduler, Scheduler};
use crate::suspense::{Interrupt, Peek};

/// Counter for generating unique cell IDs.
static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of a cell.
///
/// Handles are cheap clones of one shared cell; they all report the same ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    pub fn new() -> Self {
        Self(CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CellId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Side effect run on the 0 → 1 subscriber transition.
pub type MountHook = Arc<dyn Fn() -> Option<Cleanup> + Send + Sync>;

/// Per-cell options.
#[derive(Clone)]
pub struct CellOptions {
    label: Option<String>,
    scheduler: Arc<dyn Scheduler>,
    on_mount: Option<MountHook>,
}

impl CellOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the cell in log records and `Debug` output.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Scheduler for deferred unmount.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Run `hook` whenever the cell gains its first subscriber.
    ///
    /// The returned cleanup runs when the cell is unmounted. The hook is
    /// owned by the cell, so it should not hold a strong handle to it.
    pub fn on_mount<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Option<Cleanup> + Send + Sync + 'static,
    {
        self.on_mount = Some(Arc::new(hook));
        self
    }
}

impl Default for CellOptions {
    fn default() -> Self {
        Self {
            label: None,
            scheduler: default_scheduler(),
            on_mount: None,
        }
    }
}

impl fmt::Debug for CellOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellOptions")
            .field("label", &self.label)
            .field("on_mount", &self.on_mount.is_some())
            .finish()
    }
}

/// The capability shared by every cell: identity and subscription.
pub trait Observable: Send + Sync {
    fn id(&self) -> CellId;

    /// Register `callback` for every future invalidation or update.
    fn subscribe(&self, callback: Callback) -> Subscription;

    /// Mark the cell dirty and notify subscribers without recomputing.
    fn invalidate(&self);

    fn subscriber_count(&self) -> usize;

    /// A type-erased handle to the same cell.
    fn observable(&self) -> Arc<dyn Observable>;

    /// [`Observable::subscribe`] for a plain closure.
    fn on_change<F>(&self, f: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
        Self: Sized,
    {
        self.subscribe(Arc::new(f))
    }
}

/// The readable capability.
pub trait Readable: Observable {
    type Value: Clone + Send + Sync + 'static;

    /// The current value, computing it first if the cell is dirty.
    fn peek(&self) -> Peek<Self::Value>;

    /// Overwrite the cached value and notify every subscriber.
    ///
    /// No equality check is made; callers decide when to skip.
    fn update(&self, next: Self::Value);
}

/// The writable capability.
pub trait Writable<A> {
    type Output;

    fn send(&self, args: A) -> Result<Self::Output, Interrupt>;
}

struct Slot<T> {
    state: Option<T>,
    dirty: bool,
}

/// State shared by every cell kind.
pub(crate) struct CellCore<T> {
    id: CellId,
    label: Option<String>,
    slot: Mutex<Slot<T>>,
    subscribers: Arc<SubscriberSet>,
    on_mount: Option<MountHook>,
}

impl<T> CellCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(options: CellOptions) -> Self {
        let id = CellId::new();
        Self {
            id,
            label: options.label,
            slot: Mutex::new(Slot {
                state: None,
                dirty: true,
            }),
            subscribers: Arc::new(SubscriberSet::new(id, options.scheduler)),
            on_mount: options.on_mount,
        }
    }

    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    pub(crate) fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Return the cached value if clean, otherwise run `read` and cache it.
    pub(crate) fn peek_with<F>(&self, read: F) -> Peek<T>
    where
        F: FnOnce() -> Peek<T>,
    {
        {
            let slot = self.slot.lock();
            if !slot.dirty {
                if let Some(state) = &slot.state {
                    trace!(cell = %self.id, "cache hit");
                    return Ok(state.clone());
                }
            }
        }

        // `read` may re-enter this cell (e.g. a producer resolving inline),
        // so the slot lock is not held across it.
        let value = read()?;

        let mut slot = self.slot.lock();
        slot.state = Some(value.clone());
        slot.dirty = false;
        Ok(value)
    }

    /// The cached value regardless of the dirty flag.
    pub(crate) fn cached(&self) -> Option<T> {
        self.slot.lock().state.clone()
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.slot.lock().dirty
    }

    pub(crate) fn update(&self, next: T) {
        {
            let mut slot = self.slot.lock();
            slot.state = Some(next);
            slot.dirty = false;
        }
        self.subscribers.notify();
    }

    pub(crate) fn invalidate(&self) {
        self.mark_dirty();
        self.notify();
    }

    pub(crate) fn notify(&self) {
        self.subscribers.notify();
    }

    pub(crate) fn mark_dirty(&self) {
        self.slot.lock().dirty = true;
    }

    /// Subscribe with a kind-specific mount step.
    ///
    /// `on_mount` runs before the user hook from [`CellOptions::on_mount`];
    /// their cleanups run in the same order.
    pub(crate) fn subscribe_with<M>(&self, callback: Callback, on_mount: M) -> Subscription
    where
        M: FnOnce() -> Option<Cleanup>,
    {
        let hook = self.on_mount.clone();
        self.subscribers.subscribe(callback, move || {
            let own = on_mount();
            let user = hook.and_then(|hook| hook());
            match (own, user) {
                (Some(own), Some(user)) => Some(Box::new(move || {
                    own();
                    user();
                }) as Cleanup),
                (own, user) => own.or(user),
            }
        })
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub(crate) fn is_mounted(&self) -> bool {
        self.subscribers.is_mounted()
    }
}

impl<T: fmt::Debug> fmt::Debug for CellCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot.lock();
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &slot.state)
            .field("dirty", &slot.dirty)
            .field("subscriber_count", &self.subscribers.len())
            .finish()
    }
}
