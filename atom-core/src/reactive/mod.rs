//! Reactive Cells
//!
//! This module implements the atom engine: lazily computed cells that
//! notify subscribers when their value may have changed.
//!
//! # Concepts
//!
//! ## Value cells
//!
//! A [`ValueCell`] holds a value that callers set directly. Redundant
//! writes are skipped under the cell's [`Equality`] policy.
//!
//! ## Async cells
//!
//! An [`AsyncCell`] gets its value from an external producer. Until the
//! first value arrives, reads return [`Interrupt::Pending`] carrying a
//! [`Suspension`] to await.
//!
//! ## Derived cells
//!
//! A [`DerivedCell`] computes its value from other cells read through a
//! [`Tracker`]. The set of dependencies is rebuilt on every computation, so
//! cells read only on some branches are subscribed only while those
//! branches are taken.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: the getter is handed the tracker for
//! its computation pass. There is no ambient "current computation" state.
//!
//! Invalidation is push, computation is pull. A change marks dependents
//! dirty and notifies their subscribers synchronously; values are only
//! recomputed when somebody peeks.
//!
//! [`Interrupt::Pending`]: crate::suspense::Interrupt::Pending
//! [`Suspension`]: crate::suspense::Suspension

mod async_cell;
mod cell;
mod derived;
mod subscriber;
mod update;
mod value;

pub use async_cell::{AsyncCell, AsyncStatus, Producer, Setter};
pub use cell::{CellId, CellOptions, MountHook, Observable, Readable, Writable};
pub use derived::{DerivedCell, Getter, Tracker, Transaction, Writer};
pub use subscriber::{Callback, Cleanup, SubscriberId, Subscription};
pub use update::{Equality, Updater};
pub use value::ValueCell;
