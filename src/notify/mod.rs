//! Cross-thread async notification.
//!
//! An [`Async`] handle lets any thread wake the loop thread and have
//! a callback run there. Internally the loop owns a single lazily
//! created *dispatcher*: a readable wake-up descriptor (an eventfd on
//! Linux, the read end of a non-blocking pipe elsewhere) registered
//! as an I/O watcher, plus the list of registered handles.
//!
//! Each handle carries one word of cross-thread state, `pending`:
//!
//! - `0`: quiescent, no notification outstanding,
//! - `1`: a producer has claimed the handle and is about to write to
//!   the wake-up descriptor,
//! - `2`: the producer is done; the loop may consume.
//!
//! The intermediate `1` marks the producer's critical section so the
//! consumer waits for the descriptor write instead of missing it; any
//! number of sends while `pending != 0` coalesce into one callback
//! per drain. The descriptor write/read pair supplies the cross-thread
//! happens-before; the CAS chain on `pending` is acquire-release.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::handle::HandleCore;
use crate::reactor::core::ReactorInner;
use crate::reactor::poller::common::Interest;
use crate::reactor::poller::platform::{sys_close, sys_errno, sys_read, sys_write};
use crate::Reactor;

/// No notification outstanding.
const IDLE: u8 = 0;
/// A producer is inside its critical section.
const WRITING: u8 = 1;
/// A producer finished; the loop may consume.
const SIGNALED: u8 = 2;

/// Spin iterations between scheduler yields while waiting out a
/// producer. 997 is prime, so the spin length does not resonate with
/// power-of-two loop structures around it.
const SPIN_ROUNDS: u32 = 997;

/// The dispatcher's wake-up descriptors.
///
/// `wfd == -1` with a valid `rfd` means the read descriptor is an
/// event counter that is written directly (there is no separate write
/// end). Both descriptors are `-1` before the dispatcher is created
/// and after teardown.
pub(crate) struct Wakeup {
    rfd: AtomicI32,
    wfd: AtomicI32,
}

impl Wakeup {
    pub(crate) fn empty() -> Self {
        Self {
            rfd: AtomicI32::new(-1),
            wfd: AtomicI32::new(-1),
        }
    }

    pub(crate) fn read_fd(&self) -> i32 {
        self.rfd.load(Ordering::Acquire)
    }

    fn install(&self, rfd: i32, wfd: i32) {
        self.wfd.store(wfd, Ordering::Release);
        self.rfd.store(rfd, Ordering::Release);
    }

    /// Closes the descriptors (both, when distinct) and resets the
    /// sentinel state.
    pub(crate) fn teardown(&self) {
        let rfd = self.rfd.swap(-1, Ordering::AcqRel);
        let wfd = self.wfd.swap(-1, Ordering::AcqRel);

        if wfd >= 0 && wfd != rfd {
            sys_close(wfd);
        }
        if rfd >= 0 {
            sys_close(rfd);
        }
    }

    /// Rings the loop. Called by producers with `pending == 1`.
    ///
    /// An event counter takes an 8-byte increment, a pipe takes a
    /// single byte. `EINTR` retries; `EAGAIN` means the counter or
    /// pipe is full and the reader will wake anyway. Anything else is
    /// a broken loop invariant and aborts.
    fn notify(&self) {
        let counter = 1u64.to_ne_bytes();
        let token = [0u8; 1];

        let wfd = self.wfd.load(Ordering::Acquire);
        let (fd, payload): (i32, &[u8]) = if wfd == -1 {
            (self.rfd.load(Ordering::Acquire), &counter)
        } else {
            (wfd, &token)
        };

        if fd < 0 {
            // Dispatcher torn down; nothing left to wake.
            return;
        }

        loop {
            let r = sys_write(fd, payload);

            if r == payload.len() as isize {
                return;
            }

            if r < 0 {
                match sys_errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN | libc::EWOULDBLOCK => return,
                    _ => std::process::abort(),
                }
            }

            // Partial write of a wake-up token.
            std::process::abort();
        }
    }
}

/// Cross-thread state of one async handle.
pub(crate) struct AsyncShared {
    pending: AtomicU8,
    wakeup: Arc<Wakeup>,
}

impl AsyncShared {
    /// The producer half of the handshake. Never blocks.
    fn send(&self) {
        // Cheap read first: coalesce without touching the cache line
        // exclusively.
        if self.pending.load(Ordering::Relaxed) != IDLE {
            return;
        }

        // Claim the handle. Losing the race means another producer
        // already signalled.
        if self
            .pending
            .compare_exchange(IDLE, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.wakeup.notify();

        // Leave the critical section. No other thread may touch the
        // word while it is 1, so this must succeed.
        if self
            .pending
            .compare_exchange(WRITING, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            std::process::abort();
        }
    }
}

/// Consumes a handle's pending state from the loop thread.
///
/// Returns `true` when a signal was consumed. A handle observed in
/// the producer's critical section is spun on with a CPU-relax
/// primitive; after [`SPIN_ROUNDS`] iterations the scheduler is
/// yielded, in case the producer was preempted on this CPU.
fn spin_consume(pending: &AtomicU8) -> bool {
    loop {
        for _ in 0..SPIN_ROUNDS {
            match pending.compare_exchange(SIGNALED, IDLE, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(IDLE) => return false,
                Err(_) => std::hint::spin_loop(),
            }
        }

        std::thread::yield_now();
    }
}

/// Loop-side registration of one async handle.
///
/// The `closed` flag, not list membership, decides whether the entry
/// may still deliver: a drain cycle holds entries in a local queue
/// where the close path cannot see them, so close marks the entry
/// itself and the drain checks the mark before every delivery.
pub(crate) struct AsyncEntry {
    pub(crate) shared: Arc<AsyncShared>,
    pub(crate) core: HandleCore,
    pub(crate) closed: Cell<bool>,
    pub(crate) cb: RefCell<Option<Box<dyn FnMut()>>>,
}

/// A cross-thread notification handle.
///
/// Created on the loop thread; [`send`](Async::send) may be called
/// from any thread through a cloned [`AsyncSender`]. However many
/// times the handle is signalled between two loop turns, the callback
/// runs once per drain.
///
/// An async handle keeps the loop alive until it is closed. Dropping
/// the handle closes it.
pub struct Async {
    reactor: Rc<ReactorInner>,
    entry: Rc<AsyncEntry>,
}

impl Async {
    /// Registers a new async handle with the reactor, creating the
    /// dispatcher on first use.
    ///
    /// # Errors
    ///
    /// Fails when the wake-up descriptor cannot be created.
    pub fn new<F>(reactor: &Reactor, cb: F) -> io::Result<Self>
    where
        F: FnMut() + 'static,
    {
        let inner = reactor.inner().clone();

        ensure_dispatcher(&inner)?;

        let shared = Arc::new(AsyncShared {
            pending: AtomicU8::new(IDLE),
            wakeup: inner.wakeup.clone(),
        });

        let entry = Rc::new(AsyncEntry {
            shared,
            core: HandleCore::new(),
            closed: Cell::new(false),
            cb: RefCell::new(Some(Box::new(cb))),
        });

        entry.core.start(&inner);
        inner.async_handles.borrow_mut().push_back(entry.clone());

        Ok(Self {
            reactor: inner,
            entry,
        })
    }

    /// Signals the handle. Safe from the loop thread too.
    pub fn send(&self) {
        self.entry.shared.send();
    }

    /// Returns a cloneable sender usable from any thread.
    pub fn sender(&self) -> AsyncSender {
        AsyncSender {
            shared: self.entry.shared.clone(),
        }
    }

    /// Unregisters the handle. Must run on the loop thread.
    ///
    /// Waits out any producer currently mid-critical-section, so no
    /// send racing with the close can touch freed state. Closing
    /// marks the entry itself, so it takes effect even while a drain
    /// cycle holds the entry in its local queue; after this returns
    /// the callback will not run again.
    pub fn close(&self) {
        if self.entry.closed.get() {
            return;
        }

        spin_consume(&self.entry.shared.pending);

        self.entry.closed.set(true);
        self.entry.cb.borrow_mut().take();
        self.entry.core.stop(&self.reactor);

        // Unlink if currently on the global list. An entry parked in
        // a drain's local queue is not here; the drain discards it
        // via the closed flag instead of re-appending it.
        let mut handles = self.reactor.async_handles.borrow_mut();
        if let Some(i) = handles.iter().position(|e| Rc::ptr_eq(e, &self.entry)) {
            handles.remove(i);
        }
    }
}

impl Drop for Async {
    fn drop(&mut self) {
        self.close();
    }
}

/// The sending half of an [`Async`] handle.
///
/// Cloneable, `Send` and `Sync`. Sends made after the handle was
/// closed are consumed silently by a later drain cycle.
#[derive(Clone)]
pub struct AsyncSender {
    shared: Arc<AsyncShared>,
}

impl AsyncSender {
    /// Signals the handle from any thread. Never blocks.
    pub fn send(&self) {
        self.shared.send();
    }
}

/// Creates the dispatcher if the loop does not have one yet.
pub(crate) fn ensure_dispatcher(inner: &Rc<ReactorInner>) -> io::Result<()> {
    if inner.wakeup.read_fd() != -1 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    let (rfd, wfd) = {
        let fd = crate::reactor::poller::platform::sys_eventfd()?;
        (fd, -1)
    };

    #[cfg(not(target_os = "linux"))]
    let (rfd, wfd) = crate::reactor::poller::platform::sys_pipe()?;

    inner.wakeup.install(rfd, wfd);

    let weak = Rc::downgrade(inner);
    let token = inner.io_start(
        rfd,
        Interest::READABLE,
        Box::new(move |_event| {
            if let Some(inner) = weak.upgrade() {
                drain(&inner);
            }
        }),
    );
    inner.dispatcher.set(Some(token));

    log::debug!(
        "async dispatcher ready ({})",
        if wfd == -1 { "eventfd" } else { "pipe" }
    );

    Ok(())
}

/// Tears the dispatcher down: unregisters the watcher and closes the
/// descriptors.
fn stop_dispatcher(inner: &Rc<ReactorInner>) {
    if inner.wakeup.read_fd() == -1 {
        return;
    }

    if let Some(token) = inner.dispatcher.take() {
        inner.io_stop(token);
    }

    inner.wakeup.teardown();
}

/// Child-side fork recovery.
///
/// The descriptors inherited from the parent are shared with it and
/// must not be reused; they are closed and fresh ones are created.
/// The handle list is left untouched.
pub(crate) fn fork_reset(inner: &Rc<ReactorInner>) -> io::Result<()> {
    if inner.wakeup.read_fd() == -1 {
        // Dispatcher was never started.
        return Ok(());
    }

    log::debug!("recreating async dispatcher after fork");

    stop_dispatcher(inner);
    ensure_dispatcher(inner)
}

/// Drains the wake-up descriptor and runs pending handle callbacks.
///
/// Runs as the dispatcher's watcher callback when the descriptor
/// becomes readable.
fn drain(inner: &ReactorInner) {
    let fd = inner.wakeup.read_fd();
    if fd >= 0 {
        let mut scratch = [0u8; 1024];

        loop {
            let r = sys_read(fd, &mut scratch);

            // A full buffer means more may be queued.
            if r == scratch.len() as isize {
                continue;
            }

            if r >= 0 {
                break;
            }

            match sys_errno() {
                libc::EAGAIN | libc::EWOULDBLOCK => break,
                libc::EINTR => continue,
                _ => std::process::abort(),
            }
        }
    }

    // Move the handle list into a local queue and re-append each
    // visited entry before processing it. A callback that registers
    // or closes handles, or sends to this one again, sees a
    // consistent global list, and every handle gets a fair shot per
    // drain.
    let queue = std::mem::take(&mut *inner.async_handles.borrow_mut());

    for entry in queue {
        // A sibling's callback may have closed this handle while it
        // was parked in the local queue, where the close path cannot
        // unlink it. The closed mark is authoritative: drop the entry
        // here instead of re-appending it.
        if entry.closed.get() {
            continue;
        }

        inner.async_handles.borrow_mut().push_back(entry.clone());

        if !spin_consume(&entry.shared.pending) {
            // Not pending: a coalesced signal was already consumed.
            continue;
        }

        let taken = entry.cb.borrow_mut().take();
        if let Some(mut cb) = taken {
            cb();

            // The handle may have closed itself from its callback.
            if !entry.closed.get() {
                let mut slot = entry.cb.borrow_mut();
                if slot.is_none() {
                    *slot = Some(cb);
                }
            }
        }
    }
}
