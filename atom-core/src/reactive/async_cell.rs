//! Async Cell
//!
//! An AsyncCell gets its value from an external producer: a long-lived
//! source such as a subscription or a background task. The producer is
//! handed a [`Setter`] and may deliver any number of values over its life.
//!
//! # State Machine
//!
//! ```text
//! Uninitialized --peek--> Pending --set--> Resolved
//!       ^                    |  \--fail--> Failed
//!       +------- Reset ------+--------------+
//! ```
//!
//! 1. The first `peek()` starts the producer and returns
//!    [`Interrupt::Pending`] with a fresh [`Suspension`].
//!
//! 2. Further reads while pending hand out the same suspension.
//!
//! 3. The first delivery resolves the cell: the value is cached, subscribers
//!    are notified and the suspension settles. Later deliveries update the
//!    cell directly.
//!
//! 4. [`Updater::Reset`] returns the cell to `Uninitialized`, runs the
//!    producer's cleanup, and the next `peek()` starts it again. Deliveries
//!    from the old run are ignored.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::cell::{CellCore, CellId, CellOptions, Observable, Readable, Writable};
use super::subscriber::{Callback, Cleanup, Subscription};
use super::update::{Equality, Updater};
use crate::error::AtomError;
use crate::suspense::{suspend, Interrupt, Peek, Settle, Suspension};

/// Producer of values for an [`AsyncCell`].
///
/// Invoked once per start; the returned cleanup runs on reset.
pub type Producer<T> = Arc<dyn Fn(Setter<T>) -> Option<Cleanup> + Send + Sync>;

/// Observable state of an [`AsyncCell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    /// The producer has not been started.
    Uninitialized,
    /// Started, waiting for the first value.
    Pending,
    /// At least one value was delivered.
    Resolved,
    /// The producer reported a failure. Only a reset recovers.
    Failed,
}

enum Status {
    Uninitialized,
    Pending {
        settle: Settle,
        suspension: Suspension,
    },
    Resolved,
    Failed(AtomError),
}

impl Status {
    fn public(&self) -> AsyncStatus {
        match self {
            Status::Uninitialized => AsyncStatus::Uninitialized,
            Status::Pending { .. } => AsyncStatus::Pending,
            Status::Resolved => AsyncStatus::Resolved,
            Status::Failed(_) => AsyncStatus::Failed,
        }
    }
}

/// The status together with the producer run it belongs to.
struct Run {
    status: Status,
    generation: u64,
}

struct AsyncInner<T> {
    core: CellCore<T>,
    producer: Producer<T>,
    equality: Equality<T>,
    run: Mutex<Run>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl<T> AsyncInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn read(self: &Arc<Self>) -> Peek<T> {
        let generation = {
            let mut run = self.run.lock();
            match &run.status {
                Status::Uninitialized => {}
                Status::Pending { suspension, .. } => {
                    return Err(Interrupt::Pending(suspension.clone()));
                }
                Status::Resolved => return self.resolved_value(),
                Status::Failed(error) => return Err(error.clone().into()),
            }
            let (settle, suspension) = suspend(self.core.id());
            run.status = Status::Pending { settle, suspension };
            run.generation
        };

        debug!(cell = %self.core.id(), generation, "starting producer");
        let setter = Setter {
            inner: Arc::downgrade(self),
            generation,
        };
        let cleanup = (self.producer)(setter);
        self.keep_cleanup(generation, cleanup);

        // The producer may have delivered or failed before returning.
        let run = self.run.lock();
        match &run.status {
            Status::Pending { suspension, .. } => {
                debug!(cell = %self.core.id(), suspension = suspension.id(), "suspended");
                Err(Interrupt::Pending(suspension.clone()))
            }
            Status::Resolved => self.resolved_value(),
            Status::Failed(error) => Err(error.clone().into()),
            Status::Uninitialized => Err(AtomError::Inconsistent {
                cell: self.core.id(),
                detail: "reset while the producer was starting",
            }
            .into()),
        }
    }

    fn resolved_value(&self) -> Peek<T> {
        self.core.cached().ok_or_else(|| {
            AtomError::Inconsistent {
                cell: self.core.id(),
                detail: "resolved without a cached value",
            }
            .into()
        })
    }

    fn keep_cleanup(&self, generation: u64, cleanup: Option<Cleanup>) {
        let Some(cleanup) = cleanup else {
            return;
        };
        let stale = self.run.lock().generation != generation;
        if stale {
            cleanup();
        } else {
            *self.cleanup.lock() = Some(cleanup);
        }
    }

    fn deliver(&self, generation: u64, value: T) {
        let settle = {
            let mut run = self.run.lock();
            if run.generation != generation {
                warn!(cell = %self.core.id(), generation, "ignoring value from a reset producer");
                return;
            }
            match std::mem::replace(&mut run.status, Status::Resolved) {
                Status::Pending { settle, .. } => Some(settle),
                Status::Resolved => None,
                other => {
                    run.status = other;
                    warn!(cell = %self.core.id(), "ignoring value for a failed cell");
                    return;
                }
            }
        };

        match settle {
            Some(settle) => {
                debug!(cell = %self.core.id(), "resolved");
                self.core.update(value);
                settle.resolve();
            }
            None => {
                if let Some(current) = self.core.cached() {
                    if self.equality.equals(&current, &value) {
                        trace!(cell = %self.core.id(), "unchanged delivery, skipping update");
                        return;
                    }
                }
                self.core.update(value);
            }
        }
    }

    fn fail(&self, generation: u64, message: String) {
        let error = AtomError::ProducerFailed {
            cell: self.core.id(),
            message,
        };
        let settle = {
            let mut run = self.run.lock();
            if run.generation != generation {
                return;
            }
            match std::mem::replace(&mut run.status, Status::Failed(error.clone())) {
                Status::Pending { settle, .. } => Some(settle),
                Status::Resolved => None,
                other => {
                    run.status = other;
                    return;
                }
            }
        };

        warn!(cell = %self.core.id(), %error, "producer failed");
        if let Some(settle) = settle {
            settle.fail(error);
        }
        self.core.invalidate();
    }

    fn reset(&self) {
        let (settle, cleanup) = {
            let mut run = self.run.lock();
            run.generation += 1;
            let settle = match std::mem::replace(&mut run.status, Status::Uninitialized) {
                Status::Pending { settle, .. } => Some(settle),
                _ => None,
            };
            (settle, self.cleanup.lock().take())
        };

        debug!(cell = %self.core.id(), "reset");
        self.core.mark_dirty();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        if let Some(settle) = settle {
            settle.reset();
        }
        self.core.notify();
    }
}

/// Delivers values from a producer into its [`AsyncCell`].
///
/// A setter is tied to one producer run. After the cell is reset, or once
/// the cell is dropped, its calls are ignored.
pub struct Setter<T> {
    inner: Weak<AsyncInner<T>>,
    generation: u64,
}

impl<T> Setter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Deliver the next value.
    pub fn set(&self, value: T) {
        if let Some(inner) = self.inner.upgrade() {
            inner.deliver(self.generation, value);
        }
    }

    /// Report that the producer failed.
    pub fn fail(&self, reason: impl fmt::Display) {
        if let Some(inner) = self.inner.upgrade() {
            inner.fail(self.generation, reason.to_string());
        }
    }

    /// Whether deliveries from this setter still reach the cell.
    pub fn is_current(&self) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.run.lock().generation == self.generation)
    }
}

impl<T> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
            generation: self.generation,
        }
    }
}

impl<T> fmt::Debug for Setter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Setter")
            .field("generation", &self.generation)
            .finish()
    }
}

/// A cell whose value comes from an asynchronous producer.
///
/// # Example
///
/// ```rust,ignore
/// let user = AsyncCell::from_future(|| async { fetch_user().await });
///
/// // Suspends on first read, then resolves.
/// let value = retry::peek_settled(&user).await?;
/// ```
pub struct AsyncCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<AsyncInner<T>>,
}

impl<T> AsyncCell<T>
where
    T: Clone + Send + Sync + PartialEq + 'static,
{
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Setter<T>) -> Option<Cleanup> + Send + Sync + 'static,
    {
        Self::with_options(producer, Equality::value(), CellOptions::default())
    }

    /// A cell resolved by a one-shot future spawned on the tokio runtime.
    ///
    /// Resetting the cell aborts the task and the next read spawns a new one.
    pub fn from_future<F, Fut, E>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        Self::new(move |setter: Setter<T>| {
            let handle = match tokio::runtime::Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    setter.fail("no tokio runtime to drive the future");
                    return None;
                }
            };
            let future = factory();
            let task = handle.spawn(async move {
                match future.await {
                    Ok(value) => setter.set(value),
                    Err(error) => setter.fail(error),
                }
            });
            Some(Box::new(move || task.abort()) as Cleanup)
        })
    }
}

impl<T> AsyncCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn with_options<F>(producer: F, equality: Equality<T>, options: CellOptions) -> Self
    where
        F: Fn(Setter<T>) -> Option<Cleanup> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(AsyncInner {
                core: CellCore::new(options),
                producer: Arc::new(producer),
                equality,
                run: Mutex::new(Run {
                    status: Status::Uninitialized,
                    generation: 0,
                }),
                cleanup: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> AsyncStatus {
        self.inner.run.lock().status.public()
    }

    /// Shorthand for `send(Updater::Reset)`.
    pub fn reset(&self) {
        self.inner.reset();
    }
}

impl<T> Observable for AsyncCell<T>
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

impl<T> Readable for AsyncCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn peek(&self) -> Peek<T> {
        self.inner.core.peek_with(|| self.inner.read())
    }

    fn update(&self, next: T) {
        self.inner.core.update(next);
    }
}

impl<T> Writable<Updater<T>> for AsyncCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = ();

    /// Reset the cell, or write through the resolved value.
    ///
    /// A write while the cell is pending returns the pending interrupt
    /// instead of being accepted.
    fn send(&self, updater: Updater<T>) -> Result<(), Interrupt> {
        if let Updater::Reset = updater {
            self.inner.reset();
            return Ok(());
        }

        let current = self.peek()?;
        if let Some(next) = updater.apply(&current) {
            if self.inner.equality.equals(&current, &next) {
                trace!(cell = %self.id(), "unchanged, skipping update");
                return Ok(());
            }
            self.inner.core.update(next);
        }
        Ok(())
    }
}

impl<T> Clone for AsyncCell<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for AsyncCell<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCell")
            .field("id", &self.id())
            .field("label", &self.inner.core.label())
            .field("status", &self.status())
            .field("cached", &self.inner.core.cached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// A producer that parks its setter so the test can deliver by hand.
    struct Harness {
        setter: Arc<Mutex<Option<Setter<i32>>>>,
        starts: Arc<AtomicI32>,
        cleanups: Arc<AtomicI32>,
    }

    impl Harness {
        fn new() -> (Self, AsyncCell<i32>) {
            let setter = Arc::new(Mutex::new(None));
            let starts = Arc::new(AtomicI32::new(0));
            let cleanups = Arc::new(AtomicI32::new(0));

            let (slot, started, cleaned) = (setter.clone(), starts.clone(), cleanups.clone());
            let cell = AsyncCell::new(move |set: Setter<i32>| {
                started.fetch_add(1, Ordering::SeqCst);
                *slot.lock() = Some(set);
                let cleaned = cleaned.clone();
                Some(Box::new(move || {
                    cleaned.fetch_add(1, Ordering::SeqCst);
                }) as Cleanup)
            });

            (
                Self {
                    setter,
                    starts,
                    cleanups,
                },
                cell,
            )
        }

        fn deliver(&self, value: i32) {
            let setter = self.setter.lock().clone();
            if let Some(setter) = setter {
                setter.set(value);
            }
        }

        fn starts(&self) -> i32 {
            self.starts.load(Ordering::SeqCst)
        }

        fn cleanups(&self) -> i32 {
            self.cleanups.load(Ordering::SeqCst)
        }
    }

    fn pending(result: Peek<i32>) -> Suspension {
        match result {
            Err(Interrupt::Pending(suspension)) => suspension,
            other => panic!("expected a pending read, got {other:?}"),
        }
    }

    #[test]
    fn first_peek_suspends_and_starts_producer() {
        let (harness, cell) = Harness::new();
        assert_eq!(cell.status(), AsyncStatus::Uninitialized);
        assert_eq!(harness.starts(), 0);

        let first = pending(cell.peek());
        let second = pending(cell.peek());

        assert_eq!(first, second);
        assert_eq!(harness.starts(), 1);
        assert_eq!(cell.status(), AsyncStatus::Pending);
    }

    #[test]
    fn delivery_resolves_and_settles() {
        let (harness, cell) = Harness::new();
        let suspension = pending(cell.peek());

        harness.deliver(5);

        assert!(suspension.is_settled());
        assert_eq!(cell.status(), AsyncStatus::Resolved);
        assert_eq!(cell.peek().unwrap(), 5);
    }

    #[test]
    fn later_deliveries_update_subscribers() {
        let (harness, cell) = Harness::new();
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();
        let _sub = cell.on_change(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let _ = cell.peek();
        harness.deliver(1);
        harness.deliver(2);
        harness.deliver(2);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cell.peek().unwrap(), 2);
    }

    #[test]
    fn producer_resolving_inline_does_not_suspend() {
        let cell = AsyncCell::new(|set: Setter<&'static str>| {
            set.set("ready");
            None
        });
        assert_eq!(cell.peek().unwrap(), "ready");
    }

    #[test]
    fn send_while_pending_is_rejected() {
        let (_harness, cell) = Harness::new();
        let _ = cell.peek();

        let result = cell.send(Updater::Replace(9));
        assert!(matches!(result, Err(Interrupt::Pending(_))));
    }

    #[test]
    fn send_after_resolution_writes_through() {
        let (harness, cell) = Harness::new();
        let _ = cell.peek();
        harness.deliver(1);

        cell.send(Updater::update(|v: &i32| v * 10)).unwrap();
        assert_eq!(cell.peek().unwrap(), 10);
    }

    #[test]
    fn reset_restarts_producer() {
        let (harness, cell) = Harness::new();
        let _ = cell.peek();
        harness.deliver(1);

        cell.send(Updater::Reset).unwrap();
        assert_eq!(cell.status(), AsyncStatus::Uninitialized);
        assert_eq!(harness.cleanups(), 1);

        let _ = pending(cell.peek());
        assert_eq!(harness.starts(), 2);
    }

    #[test]
    fn stale_setter_is_ignored_after_reset() {
        let (harness, cell) = Harness::new();
        let _ = cell.peek();
        let stale = harness.setter.lock().clone().unwrap();

        cell.reset();
        assert!(!stale.is_current());

        stale.set(7);
        assert_eq!(cell.status(), AsyncStatus::Uninitialized);
    }

    #[test]
    fn reset_while_pending_settles_waiters() {
        let (_harness, cell) = Harness::new();
        let suspension = pending(cell.peek());

        cell.reset();
        assert!(suspension.is_settled());
    }

    #[test]
    fn failure_is_sticky_until_reset() {
        let (harness, cell) = Harness::new();
        let _ = cell.peek();
        let setter = harness.setter.lock().clone().unwrap();

        setter.fail("connection refused");
        assert_eq!(cell.status(), AsyncStatus::Failed);
        match cell.peek() {
            Err(Interrupt::Failed(AtomError::ProducerFailed { message, .. })) => {
                assert_eq!(message, "connection refused");
            }
            other => panic!("expected a failure, got {other:?}"),
        }

        cell.reset();
        let _ = pending(cell.peek());
        harness.deliver(3);
        assert_eq!(cell.peek().unwrap(), 3);
    }

    #[tokio::test]
    async fn from_future_resolves_on_runtime() {
        let cell = AsyncCell::from_future(|| async { Ok::<_, String>(21 * 2) });
        let suspension = pending(cell.peek());

        suspension.settled().await.unwrap();
        assert_eq!(cell.peek().unwrap(), 42);
    }

    #[test]
    fn from_future_without_runtime_fails() {
        let cell = AsyncCell::from_future(|| async { Ok::<_, String>(1) });
        assert!(matches!(cell.peek(), Err(Interrupt::Failed(_))));
    }
}
