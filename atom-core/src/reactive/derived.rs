//! Derived Cell
//!
//! A DerivedCell computes its value from other cells. Its getter receives a
//! [`Tracker`]; every cell read through the tracker becomes a dependency of
//! this computation pass.
//!
//! # How Derived Cells Work
//!
//! 1. On `peek()` of a dirty derived cell, the getter runs with a fresh
//!    tracker.
//!
//! 2. After a completed run, the dependency set is reconciled against the
//!    cells actually touched: new ones are subscribed, untouched ones are
//!    unsubscribed. Conditional reads therefore add and drop dependencies
//!    as branches change.
//!
//! 3. A dependency notification only invalidates the derived cell. Nothing
//!    is recomputed until the next `peek()`.
//!
//! 4. If the getter suspends or fails, cells touched so far are subscribed
//!    but nothing is dropped, so the cell hears about the pending value
//!    settling.
//!
//! 5. Unmounting releases the dependency subscriptions and marks the cell
//!    dirty, so the next `peek()` recomputes instead of trusting a cache
//!    nobody kept current.
//!
//! Writes do not touch the derived cell itself: `send` runs the writer as a
//! transaction over other cells, and the derived value catches up through
//! the normal invalidation path.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use super::cell::{CellCore, CellId, CellOptions, Observable, Readable, Writable};
use super::subscriber::{Callback, Cleanup, Subscription};
use crate::error::AtomError;
use crate::suspense::{Interrupt, Peek};

/// The computation of a derived cell.
pub type Getter<T> = Arc<dyn Fn(&mut Tracker) -> Peek<T> + Send + Sync>;

/// The write behavior of a derived cell.
pub type Writer<A, R> = Arc<dyn Fn(&Transaction, A) -> Result<R, Interrupt> + Send + Sync>;

/// Records the cells read during one computation pass.
///
/// Tracking is explicit: only reads made through [`Tracker::get`] count.
#[derive(Default)]
pub struct Tracker {
    touched: IndexMap<CellId, Arc<dyn Observable>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `cell` and record it as a dependency.
    ///
    /// The cell is recorded even if the read suspends.
    pub fn get<C>(&mut self, cell: &C) -> Peek<C::Value>
    where
        C: Readable + ?Sized,
    {
        self.touched
            .entry(cell.id())
            .or_insert_with(|| cell.observable());
        cell.peek()
    }

    /// IDs of the cells read so far, in first-read order.
    pub fn touched(&self) -> impl Iterator<Item = CellId> + '_ {
        self.touched.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.touched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    fn into_touched(self) -> IndexMap<CellId, Arc<dyn Observable>> {
        self.touched
    }
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.touched.keys()).finish()
    }
}

/// Access to other cells from inside a derived cell's writer.
#[derive(Debug, Default)]
pub struct Transaction {
    _private: (),
}

impl Transaction {
    /// Peek any cell.
    pub fn get<C>(&self, cell: &C) -> Peek<C::Value>
    where
        C: Readable + ?Sized,
    {
        cell.peek()
    }

    /// Send to any writable cell.
    pub fn set<A, W>(&self, cell: &W, args: A) -> Result<W::Output, Interrupt>
    where
        W: Writable<A> + ?Sized,
    {
        cell.send(args)
    }
}

struct Dependency {
    source: Arc<dyn Observable>,
    /// `None` while the derived cell is unmounted.
    subscription: Option<Subscription>,
}

struct DerivedInner<T, A, R> {
    core: CellCore<T>,
    getter: Getter<T>,
    writer: Option<Writer<A, R>>,
    dependencies: Mutex<IndexMap<CellId, Dependency>>,
}

impl<T, A, R> DerivedInner<T, A, R>
where
    T: Clone + Send + Sync + 'static,
    A: 'static,
    R: 'static,
{
    fn read(self: &Arc<Self>) -> Peek<T> {
        let mut tracker = Tracker::new();
        let result = (self.getter)(&mut tracker);
        self.reconcile(tracker.into_touched(), result.is_ok());
        result
    }

    fn reconcile(self: &Arc<Self>, touched: IndexMap<CellId, Arc<dyn Observable>>, complete: bool) {
        let mut previous = std::mem::take(&mut *self.dependencies.lock());
        let mut next = IndexMap::with_capacity(touched.len());
        let mut added = 0usize;

        for (id, source) in touched {
            let mut dependency = match previous.shift_remove(&id) {
                Some(dependency) => dependency,
                None => Dependency {
                    source,
                    subscription: None,
                },
            };
            if dependency.subscription.is_none() {
                dependency.subscription = Some(self.watch(dependency.source.as_ref()));
                added += 1;
            }
            next.insert(id, dependency);
        }

        if !complete {
            for (id, dependency) in previous.drain(..) {
                next.entry(id).or_insert(dependency);
            }
        }

        debug!(
            cell = %self.core.id(),
            dependencies = next.len(),
            added,
            dropped = previous.len(),
            complete,
            "reconciled dependencies"
        );
        *self.dependencies.lock() = next;
        // Stale subscriptions are released here, outside the lock.
        drop(previous);
    }

    /// Subscribe to `source` so that it invalidates this cell.
    fn watch(self: &Arc<Self>, source: &dyn Observable) -> Subscription {
        let weak = Arc::downgrade(self);
        source.subscribe(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.core.invalidate();
            }
        }))
    }

    fn mount(self: &Arc<Self>) -> Option<Cleanup> {
        let missing: SmallVec<[(CellId, Arc<dyn Observable>); 4]> = self
            .dependencies
            .lock()
            .iter()
            .filter(|(_, dependency)| dependency.subscription.is_none())
            .map(|(id, dependency)| (*id, Arc::clone(&dependency.source)))
            .collect();

        let subscribed: SmallVec<[(CellId, Subscription); 4]> = missing
            .into_iter()
            .map(|(id, source)| (id, self.watch(source.as_ref())))
            .collect();

        if !subscribed.is_empty() {
            debug!(cell = %self.core.id(), resubscribed = subscribed.len(), "resubscribing dependencies");
            let mut dependencies = self.dependencies.lock();
            for (id, subscription) in subscribed {
                if let Some(dependency) = dependencies.get_mut(&id) {
                    dependency.subscription.get_or_insert(subscription);
                }
            }
        }

        let weak = Arc::downgrade(self);
        Some(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let released: SmallVec<[Subscription; 4]> = inner
                    .dependencies
                    .lock()
                    .values_mut()
                    .filter_map(|dependency| dependency.subscription.take())
                    .collect();
                // Nothing can invalidate the cache once unsubscribed.
                inner.core.mark_dirty();
                debug!(cell = %inner.core.id(), released = released.len(), "released dependencies");
            }
        }))
    }
}

/// A cell computed from other cells.
///
/// `A` and `R` are the argument and result types of its writer; a cell
/// built with [`DerivedCell::new`] is read-only.
///
/// # Example
///
/// ```rust
/// use atom_core::prelude::*;
///
/// let a = ValueCell::new(1);
/// let source = a.clone();
/// let b = DerivedCell::new(move |t| Ok(t.get(&source)? * 2));
///
/// assert_eq!(b.peek().unwrap(), 2);
/// a.send(Updater::Replace(5)).unwrap();
/// assert_eq!(b.peek().unwrap(), 10);
/// ```
pub struct DerivedCell<T, A = (), R = ()>
where
    T: Clone + Send + Sync + 'static,
    A: 'static,
    R: 'static,
{
    inner: Arc<DerivedInner<T, A, R>>,
}

impl<T> DerivedCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A read-only derived cell.
    pub fn new<G>(getter: G) -> Self
    where
        G: Fn(&mut Tracker) -> Peek<T> + Send + Sync + 'static,
    {
        Self::new_with_options(getter, CellOptions::default())
    }

    /// A read-only derived cell with explicit options.
    pub fn new_with_options<G>(getter: G, options: CellOptions) -> Self
    where
        G: Fn(&mut Tracker) -> Peek<T> + Send + Sync + 'static,
    {
        Self::with_options(getter, None, options)
    }
}

impl<T, A, R> DerivedCell<T, A, R>
where
    T: Clone + Send + Sync + 'static,
    A: 'static,
    R: 'static,
{
    /// A derived cell whose `send` runs `writer`.
    pub fn with_writer<G, W>(getter: G, writer: W) -> Self
    where
        G: Fn(&mut Tracker) -> Peek<T> + Send + Sync + 'static,
        W: Fn(&Transaction, A) -> Result<R, Interrupt> + Send + Sync + 'static,
    {
        Self::with_options(getter, Some(Arc::new(writer)), CellOptions::default())
    }

    pub fn with_options<G>(getter: G, writer: Option<Writer<A, R>>, options: CellOptions) -> Self
    where
        G: Fn(&mut Tracker) -> Peek<T> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(DerivedInner {
                core: CellCore::new(options),
                getter: Arc::new(getter),
                writer,
                dependencies: Mutex::new(IndexMap::new()),
            }),
        }
    }

    /// The cells read by the most recent computation.
    pub fn dependency_ids(&self) -> Vec<CellId> {
        self.inner.dependencies.lock().keys().copied().collect()
    }

    /// Whether the next `peek()` will recompute.
    pub fn is_dirty(&self) -> bool {
        self.inner.core.is_dirty()
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.core.is_mounted()
    }
}

impl<T, A, R> Observable for DerivedCell<T, A, R>
where
    T: Clone + Send + Sync + 'static,
    A: 'static,
    R: 'static,
{
    fn id(&self) -> CellId {
        self.inner.core.id()
    }

    fn subscribe(&self, callback: Callback) -> Subscription {
        let inner = Arc::clone(&self.inner);
        self.inner
            .core
            .subscribe_with(callback, move || inner.mount())
    }

    fn invalidate(&self) {
        self.inner.core.invalidate();
    }

    fn subscriber_count(&self) -> usize {
        self.inner.core.subscriber_count()
    }

    fn observable(&self) -> Arc<dyn Observable> {
        Arc::new(self.clone())
    }
}

impl<T, A, R> Readable for DerivedCell<T, A, R>
where
    T: Clone + Send + Sync + 'static,
    A: 'static,
    R: 'static,
{
    type Value = T;

    fn peek(&self) -> Peek<T> {
        self.inner.core.peek_with(|| self.inner.read())
    }

    fn update(&self, next: T) {
        self.inner.core.update(next);
    }
}

impl<T, A, R> Writable<A> for DerivedCell<T, A, R>
where
    T: Clone + Send + Sync + 'static,
    A: 'static,
    R: 'static,
{
    type Output = R;

    fn send(&self, args: A) -> Result<R, Interrupt> {
        match &self.inner.writer {
            Some(writer) => writer(&Transaction::default(), args),
            None => Err(AtomError::ReadOnly { cell: self.id() }.into()),
        }
    }
}

impl<T, A, R> Clone for DerivedCell<T, A, R>
where
    T: Clone + Send + Sync + 'static,
    A: 'static,
    R: 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, A, R> fmt::Debug for DerivedCell<T, A, R>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    A: 'static,
    R: 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedCell")
            .field("id", &self.id())
            .field("label", &self.inner.core.label())
            .field("dirty", &self.is_dirty())
            .field("dependencies", &self.dependency_ids())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::{AsyncCell, Setter, Updater, ValueCell};
    use crate::scheduler::ImmediateScheduler;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counter() -> Arc<AtomicI32> {
        Arc::new(AtomicI32::new(0))
    }

    #[test]
    fn derived_doubles_source() {
        let a = ValueCell::new(1);
        let source = a.clone();
        let b = DerivedCell::new(move |t| Ok(t.get(&source)? * 2));

        assert_eq!(b.peek().unwrap(), 2);
        a.send(Updater::Replace(5)).unwrap();
        assert_eq!(b.peek().unwrap(), 10);
    }

    #[test]
    fn change_invalidates_without_recomputing() {
        let a = ValueCell::new(1);
        let b = ValueCell::new(10);
        let runs = counter();

        let (sa, sb, runs_clone) = (a.clone(), b.clone(), runs.clone());
        let sum = DerivedCell::new(move |t| {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(t.get(&sa)? + t.get(&sb)?)
        });

        assert_eq!(sum.peek().unwrap(), 11);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        a.set(2);
        assert!(sum.is_dirty());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        assert_eq!(sum.peek().unwrap(), 12);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(sum.dependency_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn untaken_branch_is_pruned() {
        let flag = ValueCell::new(true);
        let detail = ValueCell::new(7);

        let (sf, sd) = (flag.clone(), detail.clone());
        let view = DerivedCell::new(move |t| {
            if t.get(&sf)? {
                Ok(Some(t.get(&sd)?))
            } else {
                Ok(None)
            }
        });

        let notified = counter();
        let notified_clone = notified.clone();
        let _sub = view.on_change(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(view.peek().unwrap(), Some(7));
        assert_eq!(detail.subscriber_count(), 1);

        flag.set(false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(view.peek().unwrap(), None);
        assert_eq!(view.dependency_ids(), vec![flag.id()]);
        assert_eq!(detail.subscriber_count(), 0);

        detail.set(8);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(!view.is_dirty());
    }

    #[test]
    fn chained_derivations_propagate() {
        let base = ValueCell::new(5);
        let source = base.clone();
        let doubled = DerivedCell::new(move |t| Ok(t.get(&source)? * 2));
        let inner = doubled.clone();
        let plus_ten = DerivedCell::new(move |t| Ok(t.get(&inner)? + 10));

        assert_eq!(plus_ten.peek().unwrap(), 20);

        base.set(10);
        assert!(doubled.is_dirty());
        assert!(plus_ten.is_dirty());
        assert_eq!(plus_ten.peek().unwrap(), 30);
    }

    #[test]
    fn suspension_propagates_and_resolution_invalidates() {
        let setter: Arc<Mutex<Option<Setter<i32>>>> = Arc::new(Mutex::new(None));
        let slot = setter.clone();
        let remote = AsyncCell::new(move |set: Setter<i32>| {
            *slot.lock() = Some(set);
            None
        });

        let source = remote.clone();
        let label = DerivedCell::new(move |t| Ok(format!("#{}", t.get(&source)?)));

        let notified = counter();
        let notified_clone = notified.clone();
        let _sub = label.on_change(move || {
            notified_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(label.peek(), Err(Interrupt::Pending(_))));
        assert_eq!(label.dependency_ids(), vec![remote.id()]);

        let set = setter.lock().clone().unwrap();
        set.set(4);

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(label.peek().unwrap(), "#4");
    }

    #[test]
    fn writer_runs_transaction_over_other_cells() {
        let celsius = ValueCell::new(0.0_f64);
        let (read_c, write_c) = (celsius.clone(), celsius.clone());

        let fahrenheit = DerivedCell::with_writer(
            move |t| Ok(t.get(&read_c)? * 9.0 / 5.0 + 32.0),
            move |tx: &Transaction, f: f64| {
                let before = tx.get(&write_c)?;
                tx.set(&write_c, Updater::Replace((f - 32.0) * 5.0 / 9.0))?;
                Ok(before)
            },
        );

        assert_eq!(fahrenheit.peek().unwrap(), 32.0);
        let previous = fahrenheit.send(212.0).unwrap();

        assert_eq!(previous, 0.0);
        assert_eq!(celsius.peek().unwrap(), 100.0);
        assert_eq!(fahrenheit.peek().unwrap(), 212.0);
    }

    #[test]
    fn read_only_send_fails() {
        let cell = DerivedCell::new(|_| Ok(1));
        let err = cell.send(()).unwrap_err();
        assert!(matches!(err, Interrupt::Failed(AtomError::ReadOnly { .. })));
    }

    #[test]
    fn unmount_releases_and_mount_restores_dependencies() {
        let a = ValueCell::new(1);
        let source = a.clone();
        let b = DerivedCell::new_with_options(
            move |t| Ok(t.get(&source)? + 1),
            CellOptions::new().scheduler(Arc::new(ImmediateScheduler)),
        );

        b.peek().unwrap();
        assert_eq!(a.subscriber_count(), 1);

        let sub = b.on_change(|| {});
        assert!(b.is_mounted());
        drop(sub);
        assert!(!b.is_mounted());
        assert_eq!(a.subscriber_count(), 0);

        let _sub = b.on_change(|| {});
        assert_eq!(a.subscriber_count(), 1);

        a.set(5);
        assert_eq!(b.peek().unwrap(), 6);
    }

    fn times_ten(a: &ValueCell<i32>) -> DerivedCell<i32> {
        let source = a.clone();
        DerivedCell::new_with_options(
            move |t| Ok(t.get(&source)? * 10),
            CellOptions::new().scheduler(Arc::new(ImmediateScheduler)),
        )
    }

    #[test]
    fn change_while_unmounted_is_seen_by_next_peek() {
        let a = ValueCell::new(1);
        let b = times_ten(&a);

        assert_eq!(b.peek().unwrap(), 10);
        drop(b.on_change(|| {}));
        assert_eq!(a.subscriber_count(), 0);
        assert!(b.is_dirty());

        a.set(5);
        assert_eq!(b.peek().unwrap(), 50);
    }

    #[test]
    fn change_while_unmounted_is_seen_after_remount() {
        let a = ValueCell::new(1);
        let b = times_ten(&a);

        assert_eq!(b.peek().unwrap(), 10);
        drop(b.on_change(|| {}));

        a.set(7);
        let _sub = b.on_change(|| {});
        assert_eq!(b.peek().unwrap(), 70);

        a.set(8);
        assert!(b.is_dirty());
        assert_eq!(b.peek().unwrap(), 80);
    }

    #[test]
    fn getter_can_run_against_an_injected_tracker() {
        let a = ValueCell::new(2);
        let b = ValueCell::new(3);
        let getter = {
            let (a, b) = (a.clone(), b.clone());
            move |t: &mut Tracker| -> Peek<i32> { Ok(t.get(&a)? * t.get(&b)? + t.get(&a)?) }
        };

        let mut tracker = Tracker::new();
        assert_eq!(getter(&mut tracker).unwrap(), 8);
        assert_eq!(tracker.touched().collect::<Vec<_>>(), vec![a.id(), b.id()]);
        assert_eq!(tracker.len(), 2);
    }
}
