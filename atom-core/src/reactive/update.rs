//! Write commands and equality policies for settable cells.

use std::fmt;
use std::sync::Arc;

/// A write command for [`ValueCell`](super::ValueCell) and
/// [`AsyncCell`](super::AsyncCell).
pub enum Updater<T> {
    /// Return the cell to its initial state.
    Reset,
    /// Replace the value outright.
    Replace(T),
    /// Compute the next value from the current one.
    Update(Arc<dyn Fn(&T) -> T + Send + Sync>),
}

impl<T> Updater<T> {
    /// Build an [`Updater::Update`] from a closure.
    pub fn update<F>(f: F) -> Self
    where
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        Updater::Update(Arc::new(f))
    }

    /// Apply a non-reset command to `current`.
    ///
    /// Returns `None` for [`Updater::Reset`], whose meaning depends on the cell.
    pub(crate) fn apply(self, current: &T) -> Option<T> {
        match self {
            Updater::Reset => None,
            Updater::Replace(next) => Some(next),
            Updater::Update(f) => Some(f(current)),
        }
    }
}

impl<T> From<T> for Updater<T> {
    fn from(value: T) -> Self {
        Updater::Replace(value)
    }
}

impl<T: Clone> Clone for Updater<T> {
    fn clone(&self) -> Self {
        match self {
            Updater::Reset => Updater::Reset,
            Updater::Replace(value) => Updater::Replace(value.clone()),
            Updater::Update(f) => Updater::Update(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Updater<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Updater::Reset => f.write_str("Reset"),
            Updater::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Updater::Update(_) => f.write_str("Update(..)"),
        }
    }
}

/// Decides whether a write is redundant.
///
/// A write whose next value is equal to the current one under the cell's
/// policy is a no-op: no state change, no notification.
pub struct Equality<T> {
    eq: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T: 'static> Equality<T> {
    /// Structural equality through `PartialEq`.
    pub fn value() -> Self
    where
        T: PartialEq,
    {
        Self::custom(|a: &T, b: &T| a == b)
    }

    /// Never equal: every write notifies.
    pub fn never() -> Self {
        Self::custom(|_: &T, _: &T| false)
    }

    /// A caller-supplied comparison.
    pub fn custom<F>(eq: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        Self { eq: Arc::new(eq) }
    }

    pub fn equals(&self, current: &T, next: &T) -> bool {
        (self.eq)(current, next)
    }
}

impl<U: ?Sized + Send + Sync + 'static> Equality<Arc<U>> {
    /// Reference identity: equal only when both point at the same allocation.
    pub fn identity() -> Self {
        Self::custom(|a: &Arc<U>, b: &Arc<U>| Arc::ptr_eq(a, b))
    }
}

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self {
        Self {
            eq: Arc::clone(&self.eq),
        }
    }
}

impl<T> fmt::Debug for Equality<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Equality(..)")
    }
}
