//! # vigil
//!
//! **Vigil** is a single-threaded, callback-driven event loop with
//! two specialized watchers: a stat-polling filesystem watcher and a
//! cross-thread async notifier.
//!
//! The loop (the [`Reactor`]) owns a platform poller (`epoll` on
//! Linux, `kqueue` on macOS), a timer queue and an asynchronous stat
//! facility. Handles are registered against a reactor and their
//! callbacks run on the thread that calls [`Reactor::run`]:
//!
//! - [`Timer`] — one-shot and repeating timers
//! - [`fs::FsPoll`] — periodic metadata sampling with change
//!   detection, drift-compensated scheduling and sticky error
//!   de-duplication
//! - [`notify::Async`] — a coalescing wake-up primitive whose
//!   [`sender`](notify::Async::sender) half may be signalled from any
//!   thread
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use vigil::{fs::FsPoll, Reactor};
//!
//! let reactor = Reactor::new();
//! let watcher = FsPoll::new(&reactor);
//!
//! watcher.start(
//!     |status, previous, current| {
//!         if status.is_ok() {
//!             println!("size: {} -> {}", previous.size, current.size);
//!         }
//!     },
//!     "/etc/hosts",
//!     1000,
//! )?;
//!
//! reactor.run()?;
//! ```
//!
//! ## Threading
//!
//! Everything runs on the loop thread except
//! [`AsyncSender::send`](notify::AsyncSender::send), which is safe
//! from any thread and never blocks. Multiple sends between two loop
//! turns coalesce into a single callback invocation.
//!
//! ## Lifetimes
//!
//! Handles follow a start/stop/close lifecycle. Closing is
//! asynchronous: close callbacks run on the loop thread at the end
//! of a turn, once every in-flight operation of the handle has
//! drained. A callback that captures its own handle keeps it alive
//! until the handle is closed.

mod error;
mod handle;
mod reactor;
mod utils;

pub mod fs;
pub mod notify;

pub use error::{Errno, Error};
pub use reactor::core::Reactor;
pub use reactor::timer::Timer;
