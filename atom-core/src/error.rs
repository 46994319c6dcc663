//! Error types.
//!
//! Suspension is not an error: it travels as [`Interrupt::Pending`] next to
//! these failures so that `?` bubbles both out of derived computations.
//!
//! [`Interrupt::Pending`]: crate::suspense::Interrupt::Pending

use thiserror::Error;

use crate::reactive::CellId;

/// Failures surfaced by cells.
///
/// `AtomError` is `Clone` because a single producer failure is delivered to
/// every caller waiting on the same suspension.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AtomError {
    /// The asynchronous producer of a cell reported a failure.
    ///
    /// The cell stays failed until it is reset.
    #[error("producer for {cell} failed: {message}")]
    ProducerFailed { cell: CellId, message: String },

    /// `send` was called on a derived cell that has no writer.
    #[error("{cell} is read-only")]
    ReadOnly { cell: CellId },

    /// Internal bookkeeping of a cell disagrees with itself.
    #[error("{cell} is in an inconsistent state: {detail}")]
    Inconsistent { cell: CellId, detail: &'static str },

    /// The cell was dropped while callers were still waiting on it.
    #[error("{cell} was dropped before its value settled")]
    Abandoned { cell: CellId },
}

/// Errors raised while loading an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result alias for operations that can only fail, never suspend.
pub type AtomResult<T> = Result<T, AtomError>;
