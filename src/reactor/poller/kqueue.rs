//! macOS `kqueue` backend.
//!
//! A thin translation layer mirroring the Linux `epoll` backend:
//! [`PollerOp`] registration changes become kevent changelist
//! submissions, readiness reports become [`Event`]s through the
//! shared merge in `common`. Wake-up plumbing belongs to the
//! reactor's [`WakeChannel`](super::common::WakeChannel), which is
//! registered here like any other descriptor.

use super::common::{merge_event, PollerOp};
use super::unix::sys_close;
use crate::reactor::event::Event;

use libc::{kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

/// macOS `kqueue` poller.
pub(crate) struct KqueuePoller {
    /// Kqueue instance descriptor.
    kq: RawFd,

    /// Kernel event buffer reused across polls.
    buf: Vec<kevent>,
}

impl KqueuePoller {
    /// Creates the kqueue instance.
    pub(crate) fn new() -> Self {
        let kq = unsafe { kqueue() };
        assert!(kq >= 0, "kqueue failed");

        Self {
            kq,
            buf: Vec::with_capacity(64),
        }
    }

    /// Submits one filter change, ignoring per-change errors (a
    /// delete for an absent filter is not a failure).
    fn change(&self, fd: RawFd, token: usize, filter: i16, flags: u16) {
        let change = kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: token as *mut _,
        };

        unsafe {
            kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null());
        }
    }

    /// Applies a registration change to a descriptor.
    ///
    /// Kqueue tracks read and write interest as separate filters, so
    /// one [`PollerOp`] may expand to two changelist entries.
    pub(crate) fn control(&self, fd: RawFd, token: usize, op: PollerOp) {
        match op {
            PollerOp::Add(interest) => {
                if interest.read {
                    self.change(fd, token, EVFILT_READ, EV_ADD | EV_ENABLE);
                }
                if interest.write {
                    self.change(fd, token, EVFILT_WRITE, EV_ADD | EV_ENABLE);
                }
            }
            PollerOp::Remove => {
                self.change(fd, 0, EVFILT_READ, EV_DELETE);
                self.change(fd, 0, EVFILT_WRITE, EV_DELETE);
            }
        }
    }

    /// Waits for readiness events, or for the timeout to expire.
    pub(crate) fn poll(
        &mut self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        events.clear();

        let ts = timeout.map(|t| timespec {
            tv_sec: t.as_secs() as _,
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |ts| ts as *const _);

        self.buf.clear();
        let n = unsafe {
            kevent(
                self.kq,
                ptr::null(),
                0,
                self.buf.as_mut_ptr(),
                self.buf.capacity() as i32,
                ts_ptr,
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
            merge_event(
                events,
                ev.udata as usize,
                ev.filter == EVFILT_READ,
                ev.filter == EVFILT_WRITE,
            );
        }

        Ok(())
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        sys_close(self.kq);
    }
}
