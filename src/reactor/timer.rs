use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::handle::HandleCore;
use crate::reactor::core::ReactorInner;
use crate::Reactor;

/// An entry in the reactor timer queue.
///
/// `TimerEntry` represents a scheduled wake-up at a specific
/// deadline, stored inside a binary heap ordered by deadline.
///
/// Entries are cancelled lazily: stopping or restarting a timer bumps
/// its schedule sequence number, and the reactor discards entries
/// whose sequence no longer matches when they surface at the top of
/// the heap.
pub(crate) struct TimerEntry {
    /// Loop-clock time (milliseconds) at which the timer should fire.
    pub(crate) deadline: u64,

    /// Schedule sequence this entry belongs to.
    pub(crate) seq: u64,

    /// The timer this entry wakes.
    pub(crate) timer: Weak<RefCell<TimerInner>>,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    /// Two timer entries are equal if their deadlines are equal.
    fn eq(&self, other: &Self) -> bool {
        self.deadline.eq(&other.deadline)
    }
}

impl Ord for TimerEntry {
    /// Orders timer entries by deadline.
    ///
    /// Note that the comparison is **reversed** so that a
    /// `BinaryHeap<TimerEntry>` behaves as a min-heap, where the
    /// earliest deadline is popped first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for TimerEntry {
    /// Partial ordering consistent with [`Ord`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Loop-side timer state.
pub(crate) struct TimerInner {
    pub(crate) core: HandleCore,

    /// Current deadline in loop-clock milliseconds.
    deadline: u64,

    /// Repeat interval in milliseconds; zero for one-shot timers.
    repeat: u64,

    /// Schedule sequence; bumped on every start/stop to invalidate
    /// stale heap entries.
    pub(crate) seq: u64,

    /// Callback to run when the timer fires.
    cb: Option<Box<dyn FnMut()>>,
}

/// A timer handle registered with a [`Reactor`].
///
/// Timers fire a callback on the loop thread once their deadline
/// passes. A timer with a non-zero repeat interval reschedules itself
/// before each callback invocation.
///
/// ```rust,ignore
/// let reactor = Reactor::new();
/// let timer = Timer::new(&reactor);
/// timer.start(|| println!("tick"), 100, 0).unwrap();
/// reactor.run().unwrap();
/// ```
pub struct Timer {
    reactor: Rc<ReactorInner>,
    inner: Rc<RefCell<TimerInner>>,
}

impl Timer {
    /// Creates an idle timer bound to the given reactor.
    pub fn new(reactor: &Reactor) -> Self {
        Self::with_reactor(reactor.inner().clone())
    }

    pub(crate) fn with_reactor(reactor: Rc<ReactorInner>) -> Self {
        Self {
            reactor,
            inner: Rc::new(RefCell::new(TimerInner {
                core: HandleCore::new(),
                deadline: 0,
                repeat: 0,
                seq: 0,
                cb: None,
            })),
        }
    }

    /// Schedules the timer.
    ///
    /// `cb` runs on the loop thread after `timeout` milliseconds. If
    /// `repeat` is non-zero the timer then fires every `repeat`
    /// milliseconds until stopped. Starting an active timer
    /// reschedules it with the new parameters.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Closing`] once the timer has been closed.
    pub fn start<F>(&self, cb: F, timeout: u64, repeat: u64) -> Result<(), Error>
    where
        F: FnMut() + 'static,
    {
        let mut inner = self.inner.borrow_mut();

        if inner.core.is_closing() {
            return Err(Error::Closing);
        }

        inner.seq += 1;
        inner.deadline = self.reactor.now().wrapping_add(timeout);
        inner.repeat = repeat;
        inner.cb = Some(Box::new(cb));
        inner.core.start(&self.reactor);

        self.reactor.push_timer(TimerEntry {
            deadline: inner.deadline,
            seq: inner.seq,
            timer: Rc::downgrade(&self.inner),
        });

        Ok(())
    }

    /// Deactivates the timer. The pending heap entry is discarded
    /// lazily. No-op on an inactive timer.
    pub fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.seq += 1;
        inner.core.stop(&self.reactor);
    }

    /// Returns whether the timer is waiting to fire.
    pub fn active(&self) -> bool {
        self.inner.borrow().core.is_active()
    }

    /// Drops the timer's loop reference: an unreferenced timer does
    /// not keep [`Reactor::run`] from returning.
    pub fn unref(&self) {
        self.inner.borrow().core.unref(&self.reactor);
    }

    /// Stops the timer and schedules `close_cb` on the loop's close
    /// queue. The callback runs exactly once, at the end of a loop
    /// turn. A closed timer cannot be restarted.
    pub fn close<F>(&self, close_cb: F)
    where
        F: FnOnce() + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.core.is_closing() {
                return;
            }
            inner.seq += 1;
            inner.core.stop(&self.reactor);
            inner.core.set_closing();
            inner.cb = None;
        }

        let inner = self.inner.clone();
        self.reactor.defer_close(Box::new(move || {
            inner.borrow().core.set_closed();
            close_cb();
        }));
    }
}

impl Drop for Timer {
    /// Deactivates the timer when the handle is dropped.
    fn drop(&mut self) {
        if self.inner.borrow().core.is_closing() {
            return;
        }
        self.stop();
    }
}

/// Fires a timer whose heap entry came due.
///
/// The entry is stale when the timer was stopped or restarted after
/// the entry was pushed; stale entries are ignored. A repeating timer
/// is rescheduled before its callback runs, so the callback observes
/// the timer as armed and may freely stop or restart it.
pub(crate) fn fire(reactor: &ReactorInner, seq: u64, timer: &Rc<RefCell<TimerInner>>) {
    let mut cb = {
        let mut inner = timer.borrow_mut();

        if inner.seq != seq || !inner.core.is_active() || inner.core.is_closing() {
            return;
        }

        if inner.repeat > 0 {
            inner.seq += 1;
            inner.deadline = reactor.now().wrapping_add(inner.repeat);
            reactor.push_timer(TimerEntry {
                deadline: inner.deadline,
                seq: inner.seq,
                timer: Rc::downgrade(timer),
            });
        } else {
            inner.core.stop(reactor);
        }

        inner.cb.take()
    };

    if let Some(f) = cb.as_mut() {
        f();
    }

    // The callback may have restarted the timer with a new closure or
    // closed it; only put the old callback back if neither happened.
    let mut inner = timer.borrow_mut();
    if inner.cb.is_none() && !inner.core.is_closing() {
        inner.cb = cb;
    }
}
