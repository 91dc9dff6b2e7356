//! Handle lifecycle machinery shared by the loop's handle types.
//!
//! Every handle registered with the reactor carries a [`HandleCore`]:
//! a small flag word tracking whether the handle is active, whether
//! it still references the loop (an unreferenced handle does not keep
//! [`run`](crate::Reactor::run) alive), and whether it is closing.
//!
//! A handle counts toward loop liveness while it is both active and
//! referenced. The transitions here keep the reactor's handle count
//! consistent with that rule.

use std::cell::Cell;

use crate::reactor::core::ReactorInner;

const ACTIVE: u8 = 1 << 0;
const REFERENCED: u8 = 1 << 1;
const CLOSING: u8 = 1 << 2;
const CLOSED: u8 = 1 << 3;

/// Lifecycle flags embedded in each handle.
pub(crate) struct HandleCore {
    flags: Cell<u8>,
}

impl HandleCore {
    /// A fresh handle: inactive, referenced, not closing.
    pub(crate) fn new() -> Self {
        Self {
            flags: Cell::new(REFERENCED),
        }
    }

    fn has(&self, flag: u8) -> bool {
        self.flags.get() & flag != 0
    }

    fn set(&self, flag: u8) {
        self.flags.set(self.flags.get() | flag);
    }

    fn clear(&self, flag: u8) {
        self.flags.set(self.flags.get() & !flag);
    }

    /// True between a successful start and the matching stop.
    pub(crate) fn is_active(&self) -> bool {
        self.has(ACTIVE)
    }

    /// True once a close has been requested, including after the
    /// close callback has run.
    pub(crate) fn is_closing(&self) -> bool {
        self.has(CLOSING) || self.has(CLOSED)
    }

    /// Marks the handle active. A referenced active handle keeps the
    /// loop alive.
    pub(crate) fn start(&self, reactor: &ReactorInner) {
        if self.has(ACTIVE) {
            return;
        }
        self.set(ACTIVE);
        if self.has(REFERENCED) {
            reactor.add_handle();
        }
    }

    /// Marks the handle inactive.
    pub(crate) fn stop(&self, reactor: &ReactorInner) {
        if !self.has(ACTIVE) {
            return;
        }
        if self.has(REFERENCED) {
            reactor.remove_handle();
        }
        self.clear(ACTIVE);
    }

    /// Drops the handle's loop reference. The handle keeps working
    /// but no longer prevents [`run`](crate::Reactor::run) from
    /// returning.
    pub(crate) fn unref(&self, reactor: &ReactorInner) {
        if !self.has(REFERENCED) {
            return;
        }
        if self.has(ACTIVE) {
            reactor.remove_handle();
        }
        self.clear(REFERENCED);
    }

    /// Marks the handle closing. Irreversible.
    pub(crate) fn set_closing(&self) {
        self.set(CLOSING);
    }

    /// Marks the handle fully closed, after its close callback ran.
    pub(crate) fn set_closed(&self) {
        self.clear(CLOSING);
        self.set(CLOSED);
    }
}
