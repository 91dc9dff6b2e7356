//! Stat-polling filesystem watcher.
//!
//! [`FsPoll`] samples a path's metadata on a fixed cadence and
//! notifies a callback when the metadata changes. It is a fallback
//! for platforms and filesystems without kernel change notification:
//! everything is built from the loop's timer and asynchronous stat
//! facilities.
//!
//! Each `start()` allocates a *poll context* holding the path, the
//! sampling timer, the last snapshot and the in-flight stat slot. A
//! stat cannot be cancelled once issued, so `stop()` may leave a
//! context draining; a subsequent `start()` chains the old context
//! behind the new one, and each context frees itself once its stat
//! has completed and its timer has fully closed.

use std::cell::RefCell;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::error::{Errno, Error};
use crate::fs::stat::{StatSnapshot, ZERO_SNAPSHOT};
use crate::handle::HandleCore;
use crate::reactor::core::ReactorInner;
use crate::reactor::timer::Timer;
use crate::Reactor;

/// Callback invoked with the outcome of a poll sample.
///
/// On success the arguments are the previous and the current
/// snapshot. On error the previous snapshot is followed by an
/// all-zero one.
pub type FsPollCallback = Box<dyn FnMut(Result<(), Errno>, &StatSnapshot, &StatSnapshot)>;

/// A filesystem polling watcher.
///
/// The watcher stats its path every `interval` milliseconds and
/// invokes the callback when consecutive snapshots differ. Samples
/// are scheduled against `start_time + k * interval`, so the cost of
/// each stat does not accumulate into drift.
///
/// The very first successful sample only establishes the baseline
/// and is not reported. Repeated stat failures with the same error
/// are reported once, not once per interval.
pub struct FsPoll {
    reactor: Rc<ReactorInner>,
    inner: Rc<RefCell<FsPollInner>>,
}

struct FsPollInner {
    core: HandleCore,

    /// The current poll context; heads the chain of draining
    /// predecessors.
    ctx: Option<Rc<RefCell<PollContext>>>,

    /// User close callback, held until the last context is gone.
    close_cb: Option<Box<dyn FnOnce()>>,
}

/// Per-start poll state.
struct PollContext {
    parent: Weak<RefCell<FsPollInner>>,
    reactor: Rc<ReactorInner>,

    poll_cb: Rc<RefCell<FsPollCallback>>,

    /// Sampling interval in milliseconds, at least one.
    interval: u64,

    /// Loop-clock origin of the current tick, used for drift
    /// compensation.
    start_time: u64,

    /// `0` before the first successful sample, `1` in steady state,
    /// negative errno after a failed sample (sticky until a stat
    /// succeeds).
    busy_polling: i32,

    /// Last successful snapshot.
    statbuf: StatSnapshot,

    /// Sampling timer; internal to the context and unreferenced.
    timer: Timer,

    /// Whether a stat for this context is in flight. The timer is
    /// active exactly when this is false and the context is live.
    stat_inflight: bool,

    /// Context from the previous start()..stop() period.
    previous: Option<Rc<RefCell<PollContext>>>,

    /// Watched path, fixed at start.
    path: CString,
}

impl FsPoll {
    /// Creates an idle watcher bound to the given reactor.
    pub fn new(reactor: &Reactor) -> Self {
        Self {
            reactor: reactor.inner().clone(),
            inner: Rc::new(RefCell::new(FsPollInner {
                core: HandleCore::new(),
                ctx: None,
                close_cb: None,
            })),
        }
    }

    /// Starts polling `path` every `interval` milliseconds.
    ///
    /// A zero interval is coerced to one. Starting an active watcher
    /// is a no-op and succeeds.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Closing`] on a closed watcher, or with
    /// [`Error::Io`] when the path cannot be converted to a C string
    /// or the stat request cannot be dispatched.
    pub fn start<F>(&self, cb: F, path: impl AsRef<Path>, interval: u64) -> Result<(), Error>
    where
        F: FnMut(Result<(), Errno>, &StatSnapshot, &StatSnapshot) + 'static,
    {
        {
            let inner = self.inner.borrow();
            if inner.core.is_active() {
                return Ok(());
            }
            if inner.core.is_closing() {
                return Err(Error::Closing);
            }
        }

        let path = CString::new(path.as_ref().as_os_str().as_bytes())
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let timer = Timer::with_reactor(self.reactor.clone());
        timer.unref();

        let ctx = Rc::new(RefCell::new(PollContext {
            parent: Rc::downgrade(&self.inner),
            reactor: self.reactor.clone(),
            poll_cb: Rc::new(RefCell::new(Box::new(cb) as FsPollCallback)),
            interval: interval.max(1),
            start_time: self.reactor.now(),
            busy_polling: 0,
            statbuf: StatSnapshot::default(),
            timer,
            stat_inflight: false,
            previous: None,
            path,
        }));

        issue_stat(&ctx)?;

        let mut inner = self.inner.borrow_mut();
        ctx.borrow_mut().previous = inner.ctx.take();
        inner.ctx = Some(ctx);
        inner.core.start(&self.reactor);

        Ok(())
    }

    /// Stops polling. No-op on an inactive watcher.
    ///
    /// An in-flight stat is not cancelled: its completion observes
    /// the stopped state and quiesces, after which the context frees
    /// itself.
    pub fn stop(&self) {
        let ctx = {
            let inner = self.inner.borrow();
            if !inner.core.is_active() {
                return;
            }
            inner.ctx.clone().expect("active watcher without context")
        };

        // Close the timer if it's armed. If it isn't, a stat is in
        // flight and its completion takes care of the cleanup.
        if ctx.borrow().timer.active() {
            close_context(&ctx);
        }

        self.inner.borrow().core.stop(&self.reactor);
    }

    /// Returns whether the watcher is polling.
    pub fn active(&self) -> bool {
        self.inner.borrow().core.is_active()
    }

    /// Copies the watched path into `buffer` as a NUL-terminated
    /// string and returns its length, excluding the terminator.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotActive`] on an inactive watcher, or
    /// with [`Error::NoBuffer`] carrying the required size (including
    /// the terminator) when `buffer` is too small.
    pub fn getpath(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        let inner = self.inner.borrow();
        if !inner.core.is_active() {
            return Err(Error::NotActive);
        }

        let ctx = inner
            .ctx
            .as_ref()
            .expect("active watcher without context")
            .borrow();
        let path = ctx.path.as_bytes();

        if buffer.len() <= path.len() {
            return Err(Error::NoBuffer {
                required: path.len() + 1,
            });
        }

        buffer[..path.len()].copy_from_slice(path);
        buffer[path.len()] = 0;

        Ok(path.len())
    }

    /// Stops the watcher and schedules `close_cb` once no context
    /// remains.
    ///
    /// With no stat in flight the callback runs at the end of the
    /// current turn; otherwise it is deferred until the last draining
    /// context has been freed.
    pub fn close<F>(&self, close_cb: F)
    where
        F: FnOnce() + 'static,
    {
        if self.inner.borrow().core.is_closing() {
            return;
        }

        self.stop();

        let mut inner = self.inner.borrow_mut();
        inner.core.set_closing();
        inner.close_cb = Some(Box::new(close_cb));

        if inner.ctx.is_none() {
            drop(inner);
            make_close_pending(&self.reactor, &self.inner);
        }
    }
}

impl Drop for FsPoll {
    /// Tears the watcher down when it is dropped without a close.
    ///
    /// The context chain is dropped directly instead of going through
    /// the timer-close ceremony: nothing can observe this handle
    /// anymore, and an in-flight stat completion only holds a weak
    /// reference.
    fn drop(&mut self) {
        let ctx = {
            let mut inner = self.inner.borrow_mut();
            inner.core.stop(&self.reactor);
            inner.ctx.take()
        };
        drop(ctx);
    }
}

/// Queues the handle finalizer that runs the user's close callback.
fn make_close_pending(reactor: &Rc<ReactorInner>, handle: &Rc<RefCell<FsPollInner>>) {
    let handle = handle.clone();
    reactor.defer_close(Box::new(move || {
        let cb = {
            let mut inner = handle.borrow_mut();
            inner.core.set_closed();
            inner.close_cb.take()
        };
        if let Some(cb) = cb {
            cb();
        }
    }));
}

/// Dispatches the context's stat and marks the slot busy.
fn issue_stat(ctx: &Rc<RefCell<PollContext>>) -> Result<(), Error> {
    let (reactor, path) = {
        let ctx = ctx.borrow();
        (ctx.reactor.clone(), ctx.path.clone())
    };

    let weak = Rc::downgrade(ctx);
    reactor.stat_request(path, Box::new(move |result| on_stat(&weak, result)))?;

    ctx.borrow_mut().stat_inflight = true;
    Ok(())
}

/// A context is live while its handle is active, not closing, and
/// still points at this context as the current one. A context
/// superseded by a restart quiesces even though the handle is active
/// again.
fn is_live(ctx: &Rc<RefCell<PollContext>>) -> bool {
    let parent = match ctx.borrow().parent.upgrade() {
        Some(parent) => parent,
        None => return false,
    };

    let inner = parent.borrow();
    inner.core.is_active()
        && !inner.core.is_closing()
        && inner.ctx.as_ref().map_or(false, |head| Rc::ptr_eq(head, ctx))
}

/// Stat completion: notification, bookkeeping, reschedule.
fn on_stat(weak: &Weak<RefCell<PollContext>>, result: Result<StatSnapshot, Errno>) {
    let ctx = match weak.upgrade() {
        Some(ctx) => ctx,
        None => return,
    };

    if is_live(&ctx) {
        match result {
            Err(err) => {
                let deliver = ctx.borrow().busy_polling != err.raw();
                if deliver {
                    let (cb, prior) = {
                        let ctx = ctx.borrow();
                        (ctx.poll_cb.clone(), ctx.statbuf)
                    };
                    (cb.borrow_mut())(Err(err), &prior, &ZERO_SNAPSHOT);
                    ctx.borrow_mut().busy_polling = err.raw();
                }
            }
            Ok(current) => {
                let (deliver, cb, prior) = {
                    let ctx = ctx.borrow();
                    // The first sample only establishes the baseline.
                    // A success after a sticky error always reports,
                    // even when the snapshot matches the old baseline.
                    let deliver = ctx.busy_polling != 0
                        && (ctx.busy_polling < 0 || ctx.statbuf != current);
                    (deliver, ctx.poll_cb.clone(), ctx.statbuf)
                };

                if deliver {
                    (cb.borrow_mut())(Ok(()), &prior, &current);
                }

                let mut ctx = ctx.borrow_mut();
                ctx.statbuf = current;
                ctx.busy_polling = 1;
            }
        }
    }

    ctx.borrow_mut().stat_inflight = false;

    // The callback may have stopped, restarted or closed the
    // watcher; re-check before rescheduling.
    if !is_live(&ctx) {
        close_context(&ctx);
        return;
    }

    // Reschedule so samples stay on the start_time + k * interval
    // cadence, subtracting the time the stat took.
    let started = {
        let ctx_ref = ctx.borrow();
        let elapsed = ctx_ref.reactor.now() - ctx_ref.start_time;
        let delay = ctx_ref.interval - (elapsed % ctx_ref.interval);

        let weak = Rc::downgrade(&ctx);
        ctx_ref.timer.start(move || on_tick(&weak), delay, 0)
    };

    if started.is_err() {
        // The loop can no longer schedule timers; no local recovery
        // is possible.
        std::process::abort();
    }
}

/// Timer tick: records the tick origin and issues the next stat.
fn on_tick(weak: &Weak<RefCell<PollContext>>) {
    let ctx = match weak.upgrade() {
        Some(ctx) => ctx,
        None => return,
    };

    {
        let mut ctx = ctx.borrow_mut();
        debug_assert!(!ctx.stat_inflight, "overlapping stat request");
        ctx.start_time = ctx.reactor.now();
    }

    if issue_stat(&ctx).is_err() {
        std::process::abort();
    }
}

/// Closes the context's timer; the close callback unlinks the
/// context from its handle's chain and frees it.
fn close_context(ctx: &Rc<RefCell<PollContext>>) {
    let keep = ctx.clone();
    ctx.borrow().timer.close(move || unlink_context(&keep));
}

/// Timer-close finalizer: splices the context out of the chain.
///
/// When the last context of a closing handle goes away, the handle's
/// own close is made pending.
fn unlink_context(ctx: &Rc<RefCell<PollContext>>) {
    let parent = match ctx.borrow().parent.upgrade() {
        Some(parent) => parent,
        None => return,
    };

    let mut inner = parent.borrow_mut();

    let head = match inner.ctx.clone() {
        Some(head) => head,
        None => return,
    };

    if Rc::ptr_eq(&head, ctx) {
        inner.ctx = ctx.borrow_mut().previous.take();
        if inner.ctx.is_none() && inner.core.is_closing() {
            let reactor = ctx.borrow().reactor.clone();
            drop(inner);
            make_close_pending(&reactor, &parent);
        }
        return;
    }

    // Walk the chain and splice this context out.
    let mut last = head;
    loop {
        let next = last
            .borrow()
            .previous
            .clone()
            .expect("context missing from chain");

        if Rc::ptr_eq(&next, ctx) {
            last.borrow_mut().previous = ctx.borrow_mut().previous.take();
            return;
        }

        last = next;
    }
}
