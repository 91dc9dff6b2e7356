//! Linux `epoll` backend.
//!
//! A thin translation layer: [`PollerOp`] registration changes become
//! `epoll_ctl` calls, readiness reports become [`Event`]s through the
//! shared merge in `common`. The backend owns nothing but the epoll
//! instance and a reusable kernel buffer; wake-up plumbing belongs to
//! the reactor's [`WakeChannel`](super::common::WakeChannel), which is
//! registered here like any other descriptor.
//!
//! This backend is selected automatically on Linux targets.

use super::common::{merge_event, Interest, PollerOp};
use super::unix::sys_close;
use crate::reactor::event::Event;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL,
};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// Linux `epoll` poller.
pub(crate) struct EpollPoller {
    /// Epoll instance descriptor.
    epoll: RawFd,

    /// Kernel event buffer reused across polls.
    buf: Vec<epoll_event>,
}

fn interest_bits(interest: Interest) -> u32 {
    let mut bits = 0;

    if interest.read {
        bits |= EPOLLIN;
    }
    if interest.write {
        bits |= EPOLLOUT;
    }

    bits as u32
}

impl EpollPoller {
    /// Creates the epoll instance.
    pub(crate) fn new() -> Self {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        assert!(epoll >= 0, "epoll_create1 failed");

        Self {
            epoll,
            buf: Vec::with_capacity(64),
        }
    }

    /// Applies a registration change to a descriptor.
    pub(crate) fn control(&self, fd: RawFd, token: usize, op: PollerOp) {
        match op {
            PollerOp::Add(interest) => {
                let mut event = epoll_event {
                    events: interest_bits(interest),
                    u64: token as u64,
                };

                let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_ADD, fd, &mut event) };
                debug_assert_eq!(rc, 0);
            }
            PollerOp::Remove => unsafe {
                // The descriptor may already be gone; removal is best
                // effort.
                epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, ptr::null_mut());
            },
        }
    }

    /// Waits for readiness events, or for the timeout to expire.
    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();

        let timeout_ms = timeout.map_or(-1, |t| t.as_millis() as i32);

        self.buf.clear();
        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.buf.as_mut_ptr(),
                self.buf.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            return if err.kind() == io::ErrorKind::Interrupted {
                Ok(())
            } else {
                Err(err)
            };
        }

        unsafe {
            self.buf.set_len(n as usize);
        }

        for ev in &self.buf {
            // Errors and hangups surface as read readiness so the
            // owning watcher observes them on its next read.
            let readable = ev.events & (EPOLLIN | EPOLLERR | EPOLLHUP) as u32 != 0;
            let writable = ev.events & EPOLLOUT as u32 != 0;

            merge_event(events, ev.u64 as usize, readable, writable);
        }

        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        sys_close(self.epoll);
    }
}
