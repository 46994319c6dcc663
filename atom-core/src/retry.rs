//! Suspend-and-retry helpers.
//!
//! These compose with any cell. They turn the synchronous
//! [`Interrupt::Pending`] protocol into an `async` call by awaiting the
//! carried [`Suspension`](crate::suspense::Suspension) and then trying again.
//!
//! Neither helper queues: concurrent callers against the same pending cell
//! each wait and retry on their own.

use tracing::debug;

use crate::error::AtomResult;
use crate::reactive::{Readable, Writable};
use crate::suspense::Interrupt;

/// Peek `cell`, waiting out any suspension.
///
/// Once the suspension settles the value is already cached by the cell that
/// suspended, so the follow-up read is served without suspending again.
/// A derived cell that reads several pending cells may suspend once per
/// pending dependency. A reset landing between the settlement and the
/// follow-up read starts the producer again, and the read suspends again.
pub async fn peek_settled<C>(cell: &C) -> AtomResult<C::Value>
where
    C: Readable + ?Sized,
{
    loop {
        match cell.peek() {
            Ok(value) => return Ok(value),
            Err(Interrupt::Pending(suspension)) => {
                debug!(cell = %cell.id(), pending = %suspension.cell(), "peek suspended, waiting");
                suspension.settled().await?;
            }
            Err(Interrupt::Failed(error)) => return Err(error),
        }
    }
}

/// Send `args` to `cell`, retrying from scratch after each suspension.
pub async fn send_settled<A, W>(cell: &W, args: A) -> AtomResult<W::Output>
where
    A: Clone,
    W: Writable<A> + ?Sized,
{
    loop {
        match cell.send(args.clone()) {
            Ok(output) => return Ok(output),
            Err(Interrupt::Pending(suspension)) => {
                debug!(pending = %suspension.cell(), "send suspended, waiting");
                suspension.settled().await?;
            }
            Err(Interrupt::Failed(error)) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AtomError;
    use crate::reactive::{AsyncCell, Observable, Setter, Updater, ValueCell};
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn delayed(value: i32) -> AsyncCell<i32> {
        AsyncCell::new(move |set: Setter<i32>| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                set.set(value);
            });
            None
        })
    }

    #[tokio::test]
    async fn peek_settled_returns_resolved_value() {
        let cell = delayed(8);
        assert!(cell.peek().unwrap_err().is_pending());

        assert_eq!(peek_settled(&cell).await, Ok(8));
        assert_eq!(cell.peek().unwrap(), 8);
    }

    #[tokio::test]
    async fn peek_settled_on_ready_cell_is_immediate() {
        let cell = ValueCell::new(3);
        assert_eq!(peek_settled(&cell).await, Ok(3));
    }

    #[tokio::test]
    async fn peek_settled_surfaces_producer_failure() {
        let cell = AsyncCell::new(|set: Setter<i32>| {
            tokio::spawn(async move { set.fail("gone") });
            None
        });

        let err = peek_settled(&cell).await.unwrap_err();
        assert!(matches!(err, AtomError::ProducerFailed { cell: id, .. } if id == cell.id()));
    }

    #[tokio::test]
    async fn send_settled_retries_after_resolution() {
        let cell = delayed(1);
        let _ = cell.peek();

        send_settled(&cell, Updater::update(|v: &i32| v + 1))
            .await
            .unwrap();
        assert_eq!(cell.peek().unwrap(), 2);
    }

    #[tokio::test]
    async fn concurrent_sends_each_retry() {
        let cell = delayed(0);
        let attempts = Arc::new(AtomicI32::new(0));

        let bump = {
            let attempts = attempts.clone();
            Updater::update(move |v: &i32| {
                attempts.fetch_add(1, Ordering::SeqCst);
                v + 1
            })
        };

        let (first, second) = tokio::join!(
            send_settled(&cell, bump.clone()),
            send_settled(&cell, bump.clone())
        );
        first.unwrap();
        second.unwrap();

        assert_eq!(cell.peek().unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
