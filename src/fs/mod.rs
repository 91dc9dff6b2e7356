//! Filesystem facilities.
//!
//! This module provides the stat-polling watcher ([`FsPoll`]) and
//! the metadata snapshot it reports ([`StatSnapshot`]), built on the
//! reactor's timer and asynchronous stat facilities.

mod poll;

pub(crate) mod stat;

pub use poll::{FsPoll, FsPollCallback};
pub use stat::StatSnapshot;
