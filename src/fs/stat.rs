//! Stat snapshots and the asynchronous stat facility.
//!
//! The reactor never stats a path on the loop thread: requests are
//! shipped to a lazily spawned worker thread, and completions are
//! posted back over a channel. After posting, the worker rings the
//! poller's waker so a loop blocked in `poll` picks the completion up
//! on its next turn.

use std::ffi::CString;
use std::io;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;

use crate::error::Errno;
use crate::reactor::poller::platform::sys_stat;
use crate::reactor::poller::Waker;

/// The file metadata fields used for change detection.
///
/// Two snapshots compare equal only when **every** field matches
/// bit for bit. On Linux the birth time, flags and generation fields
/// are always zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatSnapshot {
    /// Last status change time, seconds.
    pub ctime_sec: i64,
    /// Last status change time, nanoseconds.
    pub ctime_nsec: i64,
    /// Last modification time, seconds.
    pub mtime_sec: i64,
    /// Last modification time, nanoseconds.
    pub mtime_nsec: i64,
    /// Birth time, seconds.
    pub birthtime_sec: i64,
    /// Birth time, nanoseconds.
    pub birthtime_nsec: i64,
    /// File size in bytes.
    pub size: u64,
    /// File mode bits.
    pub mode: u32,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Inode number.
    pub ino: u64,
    /// Device id.
    pub dev: u64,
    /// Platform-specific flags.
    pub flags: u32,
    /// File generation number.
    pub gen: u32,
}

/// The all-zero snapshot passed as the current value on stat errors.
pub(crate) const ZERO_SNAPSHOT: StatSnapshot = StatSnapshot {
    ctime_sec: 0,
    ctime_nsec: 0,
    mtime_sec: 0,
    mtime_nsec: 0,
    birthtime_sec: 0,
    birthtime_nsec: 0,
    size: 0,
    mode: 0,
    uid: 0,
    gid: 0,
    ino: 0,
    dev: 0,
    flags: 0,
    gen: 0,
};

#[cfg(target_os = "linux")]
pub(crate) fn snapshot_from(st: &libc::stat) -> StatSnapshot {
    StatSnapshot {
        ctime_sec: st.st_ctime as i64,
        ctime_nsec: st.st_ctime_nsec as i64,
        mtime_sec: st.st_mtime as i64,
        mtime_nsec: st.st_mtime_nsec as i64,
        birthtime_sec: 0,
        birthtime_nsec: 0,
        size: st.st_size as u64,
        mode: st.st_mode,
        uid: st.st_uid,
        gid: st.st_gid,
        ino: st.st_ino as u64,
        dev: st.st_dev as u64,
        flags: 0,
        gen: 0,
    }
}

#[cfg(target_os = "macos")]
pub(crate) fn snapshot_from(st: &libc::stat) -> StatSnapshot {
    StatSnapshot {
        ctime_sec: st.st_ctime as i64,
        ctime_nsec: st.st_ctime_nsec as i64,
        mtime_sec: st.st_mtime as i64,
        mtime_nsec: st.st_mtime_nsec as i64,
        birthtime_sec: st.st_birthtime as i64,
        birthtime_nsec: st.st_birthtime_nsec as i64,
        size: st.st_size as u64,
        mode: st.st_mode as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        ino: st.st_ino,
        dev: st.st_dev as u64,
        flags: st.st_flags,
        gen: st.st_gen,
    }
}

/// A stat request shipped to the worker.
pub(crate) struct StatJob {
    pub(crate) seq: u64,
    pub(crate) path: CString,
}

/// A completed stat request.
pub(crate) struct StatDone {
    pub(crate) seq: u64,
    pub(crate) result: Result<StatSnapshot, Errno>,
}

/// The blocking stat worker.
///
/// Jobs go in over `jobs`, completions come back over `done`. The
/// worker thread exits when the job sender is dropped with the
/// reactor.
pub(crate) struct StatWorker {
    jobs: Sender<StatJob>,
    done: Receiver<StatDone>,
}

impl StatWorker {
    /// Spawns the worker thread.
    pub(crate) fn spawn(waker: Arc<Waker>) -> io::Result<Self> {
        let (jobs, job_rx) = channel::<StatJob>();
        let (done_tx, done) = channel::<StatDone>();

        thread::Builder::new()
            .name("vigil-fs-stat".into())
            .spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    let result = sys_stat(&job.path)
                        .map(|st| snapshot_from(&st))
                        .map_err(Errno::from_raw);

                    if done_tx.send(StatDone { seq: job.seq, result }).is_err() {
                        break;
                    }

                    waker.wake();
                }
            })?;

        log::debug!("spawned stat worker thread");

        Ok(Self { jobs, done })
    }

    /// Submits a job. Fails only when the worker thread has exited.
    pub(crate) fn submit(&self, job: StatJob) -> io::Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stat worker unavailable"))
    }

    /// Pulls the next completion, if one has been posted.
    pub(crate) fn try_recv(&self) -> Option<StatDone> {
        match self.done.try_recv() {
            Ok(done) => Some(done),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
