//! Value Cell
//!
//! A ValueCell holds a plain value that callers set directly. Reading never
//! suspends. Writing goes through [`Updater`]: a redundant write (equal under
//! the cell's [`Equality`]) is a no-op and notifies nobody.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::cell::{CellCore, CellId, CellOptions, Observable, Readable, Writable};
use super::subscriber::{Callback, Subscription};
use super::update::{Equality, Updater};
use crate::suspense::{Interrupt, Peek};

struct ValueInner<T> {
    core: CellCore<T>,
    initial: T,
    value: Mutex<T>,
    equality: Equality<T>,
}

/// A directly settable cell.
///
/// # Example
///
/// ```rust
/// use atom_core::prelude::*;
///
/// let count = ValueCell::new(1);
/// count.send(Updater::Replace(5)).unwrap();
/// assert_eq!(count.peek().unwrap(), 5);
/// ```
pub struct ValueCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<ValueInner<T>>,
}

impl<T> ValueCell<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    /// Create a cell compared by `PartialEq`, with default options.
    pub fn new(value: T) -> Self {
        Self::with_options(value, Equality::value(), CellOptions::default())
    }
}

impl<T> ValueCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn with_options(value: T, equality: Equality<T>, options: CellOptions) -> Self {
        Self {
            inner: Arc::new(ValueInner {
                core: CellCore::new(options),
                initial: value.clone(),
                value: Mutex::new(value),
                equality,
            }),
        }
    }

    /// Shorthand for `send(Updater::Replace(value))`.
    pub fn set(&self, value: T) {
        self.write(Updater::Replace(value));
    }

    fn write(&self, updater: Updater<T>) {
        let current = self.inner.value.lock().clone();
        let next = updater
            .apply(&current)
            .unwrap_or_else(|| self.inner.initial.clone());

        if self.inner.equality.equals(&current, &next) {
            trace!(cell = %self.id(), "unchanged, skipping update");
            return;
        }

        *self.inner.value.lock() = next.clone();
        self.inner.core.update(next);
    }
}

impl<T> Observable for ValueCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn id(&self) -> CellId {
        self.inner.core.id()
    }

    fn subscribe(&self, callback: Callback) -> Subscription {
        self.inner.core.subscribe_with(callback, || None)
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

impl<T> Readable for ValueCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn peek(&self) -> Peek<T> {
        self.inner
            .core
            .peek_with(|| Ok(self.inner.value.lock().clone()))
    }

    fn update(&self, next: T) {
        *self.inner.value.lock() = next.clone();
        self.inner.core.update(next);
    }
}

impl<T> Writable<Updater<T>> for ValueCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = ();

    /// Apply `updater`. [`Updater::Reset`] restores the initial value.
    fn send(&self, updater: Updater<T>) -> Result<(), Interrupt> {
        self.write(updater);
        Ok(())
    }
}

impl<T> Clone for ValueCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ValueCell<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueCell")
            .field("id", &self.id())
            .field("label", &self.inner.core.label())
            .field("value", &*self.inner.value.lock())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
