use std::fmt;
use std::io;

use thiserror::Error;

/// Errors returned by handle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The handle is not active.
    #[error("handle is not active")]
    NotActive,

    /// The handle is closing or has been closed and can no longer be
    /// started.
    #[error("handle is closing")]
    Closing,

    /// The destination buffer is too small.
    ///
    /// `required` is the number of bytes needed, including the NUL
    /// terminator.
    #[error("buffer too small, {required} bytes required")]
    NoBuffer {
        /// Required buffer size in bytes, including the terminator.
        required: usize,
    },

    /// An operating system error surfaced by the loop.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A raw operating system error code.
///
/// `Errno` carries the negated `errno` value of a failed system call,
/// the convention used for status codes delivered to poll callbacks.
/// The wrapped value is always negative.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Errno(i32);

impl Errno {
    /// Wraps an already-negated `errno` value.
    pub(crate) fn from_raw(negated: i32) -> Self {
        debug_assert!(negated < 0, "errno values are stored negated");
        Self(negated)
    }

    /// Returns the negated `errno` value.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Converts the code into an [`io::Error`].
    pub fn as_io_error(self) -> io::Error {
        io::Error::from_raw_os_error(-self.0)
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self.as_io_error())
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_io_error().fmt(f)
    }
}
