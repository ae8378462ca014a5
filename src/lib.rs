//! dynein, a callback-based event notification loop.
//!
//! This crate provides an [`EventLoop`] that multiplexes three kinds of
//! asynchronous operating-system events and dispatches them to
//! user-registered watchers:
//!
//! - file-descriptor readiness ([`FdWatch`]),
//! - POSIX signal delivery with the full siginfo record ([`SignalWatch`]),
//! - child-process termination ([`ChildWatch`]).
//!
//! The loop is thread-safe: any number of threads may call
//! [`EventLoop::run`] while others register, re-arm or deregister watches.
//! One thread polls the kernel mechanism at a time; a thread that needs to
//! mutate watcher state preempts it through a prioritized internal lock,
//! so deregistration can never be starved by a busy poller; once a
//! `deregister` call has returned, the backend will deliver no further
//! events for that watch. Handlers run outside all internal locks and
//! control their own watch through the [`Rearm`] value they return: keep
//! it armed, pause it, or remove it (which is also the only supported way
//! for a watch to remove *itself*).
//!
//! The kernel mechanism is pluggable through the [`backend`] contract; on
//! Linux an epoll + signalfd backend is the default, with a pselect-based
//! fallback behind the `select` feature.
//!
//! ```no_run
//! use dynein::{EventFlags, FdWatch, Rearm, ThreadedLoop};
//!
//! let ev = ThreadedLoop::new().unwrap();
//! let (rd, _wr) = nix::unistd::pipe().unwrap();
//! let watch = FdWatch::register(&ev, std::os::fd::AsRawFd::as_raw_fd(&rd), EventFlags::IN,
//!     |fd: i32, _flags: EventFlags| {
//!         println!("fd {} is readable", fd);
//!         Rearm::Rearm
//!     })
//!     .unwrap();
//! ev.run_once();
//! watch.deregister(&ev);
//! ```

mod childproc;
mod dispatch;
mod error;
mod event_loop;
mod waitq;
mod watch;

pub mod backend;

pub use backend::{Backend, EventFlags, Interrupter, SigInfo};
pub use dispatch::{DispatchInner, DispatchQueue, WatchKey};
pub use error::{Error, Result};
pub use event_loop::{EventLoop, LocalLoop, ThreadedLoop};
pub use waitq::{MultiThread, SingleThread, Threading};
pub use watch::{
    ChildReservation, ChildWatch, ChildWatcher, FdWatch, FdWatcher, Rearm, SignalWatch,
    SignalWatcher,
};
