use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::reactor::event::Event;

/// Callback invoked when a watched descriptor becomes ready.
pub(crate) type IoCallback = Box<dyn FnMut(Event)>;

/// A descriptor registered in the reactor for readiness events.
///
/// The callback is stored behind a shared cell so the reactor can
/// invoke it without keeping the watcher slab borrowed: a callback is
/// free to register or stop other watchers while it runs.
pub(crate) struct IoWatcher {
    /// The watched file descriptor.
    fd: RawFd,

    /// Callback to run when the descriptor is ready.
    cb: Rc<RefCell<IoCallback>>,
}

impl IoWatcher {
    pub(crate) fn new(fd: RawFd, cb: IoCallback) -> Self {
        Self {
            fd,
            cb: Rc::new(RefCell::new(cb)),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Returns a shared reference to the callback cell.
    pub(crate) fn callback(&self) -> Rc<RefCell<IoCallback>> {
        self.cb.clone()
    }
}
