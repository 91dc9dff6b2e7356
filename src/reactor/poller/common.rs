//! State shared by the poller backends.
//!
//! The backends themselves are thin: they translate [`PollerOp`]
//! registration changes and readiness reports to and from the kernel
//! interface. Everything with cross-platform meaning lives here: the
//! interest set, the event-batch merging, and the wake channel the
//! reactor registers with its poller so worker threads can interrupt
//! a blocking poll.

use std::os::fd::RawFd;
use std::sync::Arc;

use super::unix::{sys_close, sys_read, sys_write};
use crate::reactor::event::Event;

/// I/O interests a registration can wait for.
#[derive(Clone, Copy)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Interest {
    /// Read readiness only.
    pub(crate) const READABLE: Interest = Interest {
        read: true,
        write: false,
    };
}

/// A registration change applied to a poller backend.
#[derive(Clone, Copy)]
pub(crate) enum PollerOp {
    /// Start watching a descriptor with the given interests.
    Add(Interest),
    /// Stop watching a descriptor.
    Remove,
}

/// Folds a readiness report into the event batch, combining repeated
/// reports for the same token.
pub(crate) fn merge_event(events: &mut Vec<Event>, token: usize, readable: bool, writable: bool) {
    if let Some(event) = events.iter_mut().find(|e| e.token == token) {
        event.readable |= readable;
        event.writable |= writable;
    } else {
        events.push(Event {
            token,
            readable,
            writable,
        });
    }
}

/// The loop's internal wake channel.
///
/// On Linux this is a single event counter descriptor acting as both
/// ends; elsewhere it is a non-blocking pipe. The reactor registers
/// the readable end with its poller like any other watched descriptor
/// and drains it when it reports readable; worker threads ring the
/// writable end through a [`Waker`].
pub(crate) struct WakeChannel {
    rfd: RawFd,

    /// Writable end; equal to `rfd` in counter mode.
    wfd: RawFd,
}

impl WakeChannel {
    pub(crate) fn new() -> Self {
        #[cfg(target_os = "linux")]
        let (rfd, wfd) = {
            let fd = super::unix::sys_eventfd().expect("wake channel");
            (fd, fd)
        };

        #[cfg(not(target_os = "linux"))]
        let (rfd, wfd) = super::unix::sys_pipe().expect("wake channel");

        Self { rfd, wfd }
    }

    /// The descriptor to register for read readiness.
    pub(crate) fn read_fd(&self) -> RawFd {
        self.rfd
    }

    /// Returns a cloneable handle for ringing the channel from other
    /// threads.
    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::new(Waker {
            fd: self.wfd,
            counter: self.wfd == self.rfd,
        })
    }

    /// Discards whatever has accumulated in the channel.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];
        while sys_read(self.rfd, &mut buf) > 0 {}
    }
}

impl Drop for WakeChannel {
    fn drop(&mut self) {
        if self.wfd != self.rfd {
            sys_close(self.wfd);
        }
        sys_close(self.rfd);
    }
}

/// Rings a [`WakeChannel`] from any thread.
///
/// A counter descriptor takes an 8-byte increment, a pipe takes one
/// byte. Write failures are ignored: a full channel already has a
/// wake pending, and a closed one means the loop is gone.
pub(crate) struct Waker {
    fd: RawFd,
    counter: bool,
}

impl Waker {
    pub(crate) fn wake(&self) {
        if self.counter {
            sys_write(self.fd, &1u64.to_ne_bytes());
        } else {
            sys_write(self.fd, &[0u8]);
        }
    }
}
