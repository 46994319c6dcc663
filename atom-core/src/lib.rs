//! Atom Core
//!
//! This crate provides a reactive-value engine built from "atoms": lazily
//! recomputed cells that notify observers when their value may have
//! changed. It implements:
//!
//! - Settable value cells with configurable equality
//! - Derived cells with automatic, per-computation dependency tracking
//! - Async cells fed by external producers, with suspend-and-retry reads
//! - Deferred, coalesced unmounting of cell resources
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: The cell kinds and their shared core
//! - `suspense`: The pending/failed interrupt returned by reads and writes
//! - `retry`: Async helpers that wait out suspensions
//! - `scheduler`: Where deferred unmount work runs
//! - `config`: Engine-wide defaults
//!
//! # Example
//!
//! ```rust
//! use atom_core::prelude::*;
//!
//! let count = ValueCell::new(1);
//! let source = count.clone();
//! let doubled = DerivedCell::new(move |t| Ok(t.get(&source)? * 2));
//!
//! assert_eq!(doubled.peek().unwrap(), 2);
//!
//! count.send(Updater::Replace(5)).unwrap();
//! // Recomputed lazily on this read.
//! assert_eq!(doubled.peek().unwrap(), 10);
//! ```

pub mod config;
pub mod error;
pub mod reactive;
pub mod retry;
pub mod scheduler;
pub mod suspense;

pub use error::{AtomError, AtomResult, ConfigError};

/// The types most callers need.
pub mod prelude {
    pub use crate::error::{AtomError, AtomResult};
    pub use crate::reactive::{
        AsyncCell, AsyncStatus, CellOptions, DerivedCell, Equality, Observable, Readable, Setter,
        Subscription, Tracker, Transaction, Updater, ValueCell, Writable,
    };
    pub use crate::retry::{peek_settled, send_settled};
    pub use crate::suspense::{Interrupt, Peek, Suspension};
}
