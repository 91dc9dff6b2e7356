use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::ffi::CString;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Errno;
use crate::fs::stat::{StatJob, StatSnapshot, StatWorker};
use crate::notify::{AsyncEntry, Wakeup};
use crate::reactor::event::Event;
use crate::reactor::io::{IoCallback, IoWatcher};
use crate::reactor::poller::common::{Interest, PollerOp, WakeChannel};
use crate::reactor::poller::Poller;
use crate::reactor::timer::{self, TimerEntry};
use crate::utils::Slab;

/// Completion callback for an asynchronous stat request.
pub(crate) type StatCompletion = Box<dyn FnOnce(Result<StatSnapshot, Errno>)>;

/// A single-threaded callback event loop.
///
/// The reactor owns the platform poller, the timer queue, the
/// registered I/O watchers, the asynchronous stat facility and the
/// async notification dispatcher. Handles ([`Timer`](crate::Timer),
/// [`FsPoll`](crate::fs::FsPoll), [`Async`](crate::notify::Async))
/// are created against a reactor and their callbacks run on the
/// thread that calls [`run`](Reactor::run).
///
/// `Reactor` is a cheap clone of the underlying loop state. It is not
/// `Send`: the only operation in this crate that may be called from
/// another thread is [`AsyncSender::send`](crate::notify::AsyncSender).
#[derive(Clone)]
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Reactor {
    /// Creates a new reactor with a platform poller.
    ///
    /// The loop's internal wake channel is registered with the poller
    /// as an ordinary watcher; its only job is to interrupt a
    /// blocking poll when a worker thread posts a completion.
    pub fn new() -> Self {
        let inner = Rc::new(ReactorInner {
            origin: Instant::now(),
            now_ms: Cell::new(0),
            stop_flag: Cell::new(false),
            handle_count: Cell::new(0),
            requests: Cell::new(0),
            poller: RefCell::new(Poller::new()),
            wake: WakeChannel::new(),
            events: RefCell::new(Vec::with_capacity(64)),
            timers: RefCell::new(BinaryHeap::new()),
            io: RefCell::new(Slab::new(16)),
            closing: RefCell::new(Vec::new()),
            stat: RefCell::new(None),
            stat_seq: Cell::new(0),
            stat_pending: RefCell::new(HashMap::new()),
            wakeup: Arc::new(Wakeup::empty()),
            async_handles: RefCell::new(VecDeque::new()),
            dispatcher: Cell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        inner.io_start(
            inner.wake.read_fd(),
            Interest::READABLE,
            Box::new(move |_event| {
                if let Some(inner) = weak.upgrade() {
                    inner.wake.drain();
                }
            }),
        );

        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<ReactorInner> {
        &self.inner
    }

    /// Returns the loop clock: monotonic milliseconds, cached per
    /// turn.
    pub fn now(&self) -> u64 {
        self.inner.now()
    }

    /// Turns the loop until no referenced active handle, in-flight
    /// request or pending close remains, or until [`stop`](Self::stop)
    /// is called.
    ///
    /// # Errors
    ///
    /// Propagates poller failures. Interrupted polls are retried.
    pub fn run(&self) -> io::Result<()> {
        while self.inner.alive() && !self.inner.stop_flag.get() {
            self.inner.turn()?;
        }

        self.inner.stop_flag.set(false);
        Ok(())
    }

    /// Makes [`run`](Self::run) return after the current turn.
    pub fn stop(&self) {
        self.inner.stop_flag.set(true);
    }

    /// Re-arms the async notification dispatcher in a forked child.
    ///
    /// The dispatcher's descriptors are stale after `fork(2)`: the
    /// child must call this before using any async handle. Registered
    /// handles survive untouched.
    pub fn post_fork(&self) -> io::Result<()> {
        crate::notify::fork_reset(&self.inner)
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

/// Loop state shared by the reactor and its handles.
pub(crate) struct ReactorInner {
    /// Reference instant for the loop clock.
    origin: Instant,

    /// Cached loop clock in milliseconds, updated once per turn.
    now_ms: Cell<u64>,

    /// Makes `run` return after the current turn.
    stop_flag: Cell<bool>,

    /// Number of active, referenced handles.
    handle_count: Cell<usize>,

    /// Number of in-flight stat requests.
    requests: Cell<usize>,

    poller: RefCell<Poller>,

    /// Internal wake channel; worker threads ring it to interrupt a
    /// blocking poll.
    wake: WakeChannel,

    events: RefCell<Vec<Event>>,

    timers: RefCell<BinaryHeap<TimerEntry>>,
    io: RefCell<Slab<IoWatcher>>,

    /// Close callbacks deferred to the end of the current turn.
    closing: RefCell<Vec<Box<dyn FnOnce()>>>,

    /// Lazily spawned stat worker.
    stat: RefCell<Option<StatWorker>>,
    stat_seq: Cell<u64>,
    stat_pending: RefCell<HashMap<u64, StatCompletion>>,

    /// Wake-up descriptors shared with async handle senders.
    pub(crate) wakeup: Arc<Wakeup>,

    /// Handles registered with the async dispatcher. Mutated only on
    /// the loop thread.
    pub(crate) async_handles: RefCell<VecDeque<Rc<AsyncEntry>>>,

    /// Watcher token of the dispatcher's readable descriptor.
    pub(crate) dispatcher: Cell<Option<usize>>,
}

impl ReactorInner {
    pub(crate) fn now(&self) -> u64 {
        self.now_ms.get()
    }

    fn update_time(&self) {
        self.now_ms.set(self.origin.elapsed().as_millis() as u64);
    }

    pub(crate) fn add_handle(&self) {
        self.handle_count.set(self.handle_count.get() + 1);
    }

    pub(crate) fn remove_handle(&self) {
        self.handle_count.set(self.handle_count.get() - 1);
    }

    /// The loop stays alive while anything can still produce a
    /// callback: an active referenced handle, an in-flight stat, or a
    /// pending close.
    fn alive(&self) -> bool {
        self.handle_count.get() > 0
            || self.requests.get() > 0
            || !self.closing.borrow().is_empty()
    }

    pub(crate) fn push_timer(&self, entry: TimerEntry) {
        self.timers.borrow_mut().push(entry);
    }

    /// Queues a close callback for the end of the current turn.
    pub(crate) fn defer_close(&self, finalizer: Box<dyn FnOnce()>) {
        self.closing.borrow_mut().push(finalizer);
    }

    /// Registers a descriptor for readiness events and returns its
    /// watcher token.
    pub(crate) fn io_start(&self, fd: i32, interest: Interest, cb: IoCallback) -> usize {
        let token = self.io.borrow_mut().insert(IoWatcher::new(fd, cb));
        self.poller
            .borrow()
            .control(fd, token, PollerOp::Add(interest));
        token
    }

    /// Stops a watcher and removes its descriptor from the poller.
    pub(crate) fn io_stop(&self, token: usize) {
        if let Some(watcher) = self.io.borrow_mut().remove(token) {
            self.poller
                .borrow()
                .control(watcher.fd(), token, PollerOp::Remove);
        }
    }

    /// Submits an asynchronous stat of `path`.
    ///
    /// The completion runs on the loop thread during a later turn. At
    /// most one request should be outstanding per requesting context;
    /// the caller enforces this.
    pub(crate) fn stat_request(&self, path: CString, completion: StatCompletion) -> io::Result<()> {
        {
            let mut stat = self.stat.borrow_mut();
            if stat.is_none() {
                *stat = Some(StatWorker::spawn(self.wake.waker())?);
            }
        }

        let seq = self.stat_seq.get().wrapping_add(1);
        self.stat_seq.set(seq);

        self.stat_pending.borrow_mut().insert(seq, completion);

        let stat = self.stat.borrow();
        let worker = stat.as_ref().expect("stat worker just spawned");
        if let Err(e) = worker.submit(StatJob { seq, path }) {
            self.stat_pending.borrow_mut().remove(&seq);
            return Err(e);
        }

        self.requests.set(self.requests.get() + 1);
        Ok(())
    }

    /// One loop turn: completions, poll, I/O callbacks, timers,
    /// deferred closes.
    fn turn(&self) -> io::Result<()> {
        self.update_time();
        self.drain_stat_completions();

        let timeout = self.poll_timeout();
        {
            let mut poller = self.poller.borrow_mut();
            let mut events = self.events.borrow_mut();
            poller.poll(&mut events, timeout)?;
        }

        self.update_time();

        let events: Vec<Event> = self.events.borrow_mut().drain(..).collect();
        for event in events {
            // The callback cell is cloned out so a watcher callback
            // may register or stop watchers without re-entering the
            // slab borrow.
            let cb = self.io.borrow().get(event.token).map(|w| w.callback());
            if let Some(cb) = cb {
                (cb.borrow_mut())(event);
            }
        }

        self.run_timers();
        self.run_closing();

        Ok(())
    }

    /// Computes how long the poller may block.
    fn poll_timeout(&self) -> Option<Duration> {
        if self.stop_flag.get() || !self.closing.borrow().is_empty() {
            return Some(Duration::ZERO);
        }

        let now = self.now_ms.get();
        let mut timers = self.timers.borrow_mut();

        while let Some(top) = timers.peek() {
            let stale = match top.timer.upgrade() {
                None => true,
                Some(timer) => {
                    let t = timer.borrow();
                    t.seq != top.seq || !t.core.is_active()
                }
            };

            if stale {
                timers.pop();
                continue;
            }

            return Some(Duration::from_millis(top.deadline.saturating_sub(now)));
        }

        None
    }

    /// Dispatches completed stat requests.
    fn drain_stat_completions(&self) {
        let mut done = Vec::new();
        {
            let stat = self.stat.borrow();
            if let Some(worker) = stat.as_ref() {
                while let Some(completion) = worker.try_recv() {
                    done.push(completion);
                }
            }
        }

        for d in done {
            let completion = self.stat_pending.borrow_mut().remove(&d.seq);
            if let Some(completion) = completion {
                self.requests.set(self.requests.get() - 1);
                completion(d.result);
            }
        }
    }

    /// Runs every timer whose deadline has passed.
    ///
    /// Due entries are collected before any callback runs: a timer
    /// started from a callback with a zero timeout fires on the next
    /// turn, not in this one.
    fn run_timers(&self) {
        let now = self.now_ms.get();
        let mut due = Vec::new();

        {
            let mut timers = self.timers.borrow_mut();
            while let Some(top) = timers.peek() {
                if top.deadline > now {
                    break;
                }

                let entry = timers.pop().expect("peeked entry");
                if let Some(timer) = entry.timer.upgrade() {
                    due.push((entry.seq, timer));
                }
            }
        }

        for (seq, t) in due {
            timer::fire(self, seq, &t);
        }
    }

    /// Drains the close queue. Finalizers queued while draining run
    /// on the next turn.
    fn run_closing(&self) {
        let finalizers = std::mem::take(&mut *self.closing.borrow_mut());
        for finalizer in finalizers {
            finalizer();
        }
    }
}

impl Drop for ReactorInner {
    /// Tears down the async dispatcher descriptors. The poller closes
    /// its own descriptors, and dropping the stat worker's job sender
    /// makes the worker thread exit.
    fn drop(&mut self) {
        self.wakeup.teardown();
    }
}
