//! Suspension
//!
//! A cell whose value is not available yet does not block and does not
//! fail: its `peek()` returns [`Interrupt::Pending`] carrying a
//! [`Suspension`]. The suspension is an awaitable handle that settles once
//! the producer behind the cell delivers, fails, or is reset.
//!
//! # How It Works
//!
//! 1. The pending cell creates a settle/suspension pair backed by a
//!    `tokio::sync::watch` channel.
//!
//! 2. Every `peek()` while pending hands out a clone of the same suspension
//!    (same [`Suspension::id`]), so suspension is idempotent.
//!
//! 3. The cell keeps the [`Settle`] half and resolves, fails, or resets it
//!    exactly once. Waiters then retry from scratch.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::watch;

use crate::error::{AtomError, AtomResult};
use crate::reactive::CellId;

/// Counter for generating unique suspension IDs.
static SUSPENSION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique suspension ID.
fn next_suspension_id() -> u64 {
    SUSPENSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Outcome of a pending value as seen by waiters.
#[derive(Debug, Clone)]
enum Settlement {
    Waiting,
    Resolved,
    Reset,
    Failed(AtomError),
}

/// The result of reading a cell.
///
/// `Ok` is the ready value. `Err` is either a suspension or a failure.
pub type Peek<T> = Result<T, Interrupt>;

/// Why a read or write did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum Interrupt {
    /// The value is not available yet; retry once the suspension settles.
    #[error("{} is still pending", .0.cell())]
    Pending(Suspension),

    /// A genuine failure.
    #[error(transparent)]
    Failed(#[from] AtomError),
}

impl Interrupt {
    /// Returns `true` for [`Interrupt::Pending`].
    pub fn is_pending(&self) -> bool {
        matches!(self, Interrupt::Pending(_))
    }

    /// The carried suspension, if this is a pending interrupt.
    pub fn suspension(&self) -> Option<&Suspension> {
        match self {
            Interrupt::Pending(suspension) => Some(suspension),
            Interrupt::Failed(_) => None,
        }
    }
}

/// Awaitable handle for a value that is not ready yet.
#[derive(Debug, Clone)]
pub struct Suspension {
    id: u64,
    cell: CellId,
    receiver: watch::Receiver<Settlement>,
}

impl Suspension {
    /// Unique identity of the pending run this suspension belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The cell that suspended.
    pub fn cell(&self) -> CellId {
        self.cell
    }

    /// Returns `true` once the pending run has settled in any way.
    pub fn is_settled(&self) -> bool {
        !matches!(*self.receiver.borrow(), Settlement::Waiting)
    }

    /// Wait until the pending run settles.
    ///
    /// Resolves to `Ok(())` when the value was delivered or the cell was
    /// reset (both mean "retry now"), and to the producer's error when it
    /// failed.
    pub async fn settled(mut self) -> AtomResult<()> {
        let cell = self.cell;
        let outcome = match self
            .receiver
            .wait_for(|settlement| !matches!(settlement, Settlement::Waiting))
            .await
        {
            Ok(settlement) => match &*settlement {
                Settlement::Failed(error) => Err(error.clone()),
                _ => Ok(()),
            },
            Err(_) => Err(AtomError::Abandoned { cell }),
        };
        outcome
    }
}

impl PartialEq for Suspension {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Suspension {}

/// Settling half of a suspension, owned by the pending cell.
///
/// Dropping it without settling abandons every waiter.
#[derive(Debug)]
pub(crate) struct Settle {
    sender: watch::Sender<Settlement>,
}

impl Settle {
    pub(crate) fn resolve(self) {
        self.sender.send_replace(Settlement::Resolved);
    }

    pub(crate) fn reset(self) {
        self.sender.send_replace(Settlement::Reset);
    }

    pub(crate) fn fail(self, error: AtomError) {
        self.sender.send_replace(Settlement::Failed(error));
    }
}

/// Create a fresh settle/suspension pair for `cell`.
pub(crate) fn suspend(cell: CellId) -> (Settle, Suspension) {
    let (sender, receiver) = watch::channel(Settlement::Waiting);
    let suspension = Suspension {
        id: next_suspension_id(),
        cell,
        receiver,
    };
    (Settle { sender }, suspension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolved_suspension_settles_ok() {
        let (settle, suspension) = suspend(CellId::new());
        let waiter = suspension.clone();

        assert!(!suspension.is_settled());
        settle.resolve();

        assert!(suspension.is_settled());
        assert_eq!(waiter.settled().await, Ok(()));
    }

    #[tokio::test]
    async fn failed_suspension_carries_error() {
        let cell = CellId::new();
        let (settle, suspension) = suspend(cell);
        let error = AtomError::ProducerFailed {
            cell,
            message: "boom".into(),
        };

        settle.fail(error.clone());
        assert_eq!(suspension.settled().await, Err(error));
    }

    #[tokio::test]
    async fn reset_suspension_settles_ok() {
        let (settle, suspension) = suspend(CellId::new());
        settle.reset();
        assert_eq!(suspension.settled().await, Ok(()));
    }

    #[tokio::test]
    async fn dropped_settle_abandons_waiters() {
        let cell = CellId::new();
        let (settle, suspension) = suspend(cell);
        drop(settle);
        assert_eq!(
            suspension.settled().await,
            Err(AtomError::Abandoned { cell })
        );
    }

    #[test]
    fn clones_share_identity() {
        let (_settle, first) = suspend(CellId::new());
        let (_other, second) = suspend(CellId::new());

        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }
}
