use libc::{c_int, close, read, write, F_GETFL, F_SETFL, O_NONBLOCK};
use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;

/// Reads from a file descriptor into the given buffer.
///
/// Returns the number of bytes read, or a negative value on error.
/// The file descriptor **must** be non-blocking.
pub(crate) fn sys_read(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { read(fd, buffer.as_mut_ptr() as *mut _, buffer.len()) }
}

/// Writes the buffer to a file descriptor.
///
/// Returns the number of bytes written, or a negative value on error.
pub(crate) fn sys_write(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { write(fd, buffer.as_ptr() as *const _, buffer.len()) }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { close(fd) };
}

/// Returns the calling thread's current `errno`.
pub(crate) fn sys_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

/// Stats a path with `stat(2)`.
///
/// Returns the populated stat structure, or the negated `errno` of
/// the failed call.
pub(crate) fn sys_stat(path: &CStr) -> Result<libc::stat, i32> {
    let mut storage = MaybeUninit::<libc::stat>::zeroed();

    let rc = unsafe { libc::stat(path.as_ptr(), storage.as_mut_ptr()) };
    if rc < 0 {
        return Err(-sys_errno());
    }

    Ok(unsafe { storage.assume_init() })
}

/// Creates a non-blocking, close-on-exec event counter descriptor.
///
/// The descriptor acts as both the readable and the writable end of a
/// wake-up channel: writes add to an in-kernel counter, a read drains
/// it.
#[cfg(target_os = "linux")]
pub(crate) fn sys_eventfd() -> io::Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

/// Creates a non-blocking, close-on-exec pipe pair.
///
/// Returns `(read_end, write_end)`.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn sys_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [c_int; 2] = [-1, -1];

    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        for &fd in &fds {
            if let Err(e) = sys_set_nonblocking(fd) {
                sys_close(fds[0]);
                sys_close(fds[1]);
                return Err(e);
            }
            sys_set_cloexec(fd);
        }
    }

    Ok((fds[0], fds[1]))
}

/// Sets a file descriptor to non-blocking mode.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn sys_set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(fd, F_SETFL, flags | O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Marks a file descriptor close-on-exec.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn sys_set_cloexec(fd: RawFd) {
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
}
