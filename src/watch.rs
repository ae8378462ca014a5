//! Watcher traits and the user-facing watch handles.
//!
//! A watcher is the user's object: the loop borrows it (boxed) from
//! registration until the final `watch_removed` notification gives
//! ownership back by dropping the box. Handles are plain copyable keys;
//! a handle left over from a removed watch is inert.

use std::os::fd::RawFd;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::backend::{AsBackend, EventFlags, SigInfo};
use crate::dispatch::WatchKey;
use crate::error::Result;
use crate::event_loop::EventLoop;
use crate::waitq::Threading;

/// A handler's verdict on its watch after an event was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// Keep watching; deliver further events.
    Rearm,
    /// Stop delivering, but stay registered until explicitly re-enabled
    /// or deregistered.
    Disarm,
    /// Deregister; `watch_removed` follows.
    Remove,
}

/// Handler for fd readiness events.
///
/// Handlers run outside all loop-internal locks and may register or
/// deregister *other* watches; a watch removes *itself* by returning
/// [`Rearm::Remove`], never by calling deregister from inside its own
/// handler. `watch_removed` is the final notification (after it, the
/// handler is never called again) and must not call back into the loop.
pub trait FdWatcher: Send + 'static {
    fn on_event(&mut self, fd: RawFd, flags: EventFlags) -> Rearm;

    fn watch_removed(&mut self) {}
}

/// Handler for delivered signals. Same contract as [`FdWatcher`].
pub trait SignalWatcher: Send + 'static {
    fn on_signal(&mut self, signo: Signal, info: &SigInfo) -> Rearm;

    fn watch_removed(&mut self) {}
}

/// Handler for a child-process termination. Fires exactly once; the watch
/// removes itself afterwards.
pub trait ChildWatcher: Send + 'static {
    fn on_exit(&mut self, pid: Pid, status: WaitStatus);

    fn watch_removed(&mut self) {}
}

impl<F> FdWatcher for F
where
    F: FnMut(RawFd, EventFlags) -> Rearm + Send + 'static,
{
    fn on_event(&mut self, fd: RawFd, flags: EventFlags) -> Rearm {
        self(fd, flags)
    }
}

impl<F> SignalWatcher for F
where
    F: FnMut(Signal, &SigInfo) -> Rearm + Send + 'static,
{
    fn on_signal(&mut self, signo: Signal, info: &SigInfo) -> Rearm {
        self(signo, info)
    }
}

impl<F> ChildWatcher for F
where
    F: FnMut(Pid, WaitStatus) + Send + 'static,
{
    fn on_exit(&mut self, pid: Pid, status: WaitStatus) {
        self(pid, status)
    }
}

/// Handle to a registered fd watch.
#[derive(Debug, Clone, Copy)]
pub struct FdWatch(pub(crate) WatchKey);

impl FdWatch {
    /// Watch `fd` for the readiness in `flags` (`IN`, `OUT` or both;
    /// `ONESHOT` to stop after the first delivery unless the handler
    /// re-arms).
    pub fn register<B: AsBackend, T: Threading>(
        ev: &EventLoop<B, T>,
        fd: RawFd,
        flags: EventFlags,
        watcher: impl FdWatcher,
    ) -> Result<FdWatch> {
        ev.register_fd(Box::new(watcher), fd, flags).map(FdWatch)
    }

    /// Resume delivery after a [`Rearm::Disarm`] or [`disable`].
    ///
    /// [`disable`]: FdWatch::disable
    pub fn enable<B: AsBackend, T: Threading>(&self, ev: &EventLoop<B, T>) {
        ev.enable_fd(self.0);
    }

    /// Pause delivery without deregistering.
    pub fn disable<B: AsBackend, T: Threading>(&self, ev: &EventLoop<B, T>) {
        ev.disable_fd(self.0);
    }

    pub fn deregister<B: AsBackend, T: Threading>(self, ev: &EventLoop<B, T>) {
        ev.deregister_fd(self.0);
    }
}

/// Handle to a registered signal watch.
#[derive(Debug, Clone, Copy)]
pub struct SignalWatch(pub(crate) WatchKey);

impl SignalWatch {
    /// Watch for deliveries of `signo`. The signal is blocked on the
    /// calling thread (threads spawned later inherit the mask); register
    /// signal watches before spawning threads that would leave the
    /// signal unblocked.
    pub fn register<B: AsBackend, T: Threading>(
        ev: &EventLoop<B, T>,
        signo: Signal,
        watcher: impl SignalWatcher,
    ) -> Result<SignalWatch> {
        ev.register_signal(Box::new(watcher), signo).map(SignalWatch)
    }

    pub fn deregister<B: AsBackend, T: Threading>(self, ev: &EventLoop<B, T>) {
        ev.deregister_signal(self.0);
    }
}

/// Proof of preallocated child-watch capacity. Obtained before a `fork`,
/// consumed by [`ChildWatch::register_reserved`], which therefore cannot
/// fail in the parent, no matter how tight the moment after the fork is.
#[derive(Debug)]
pub struct ChildReservation {
    pub(crate) _priv: (),
}

/// Handle to a child-termination watch.
#[derive(Debug, Clone, Copy)]
pub struct ChildWatch(pub(crate) WatchKey);

impl ChildWatch {
    /// Preallocate everything a child registration needs, arming SIGCHLD
    /// capture if this is the first child watch.
    pub fn reserve<B: AsBackend, T: Threading>(
        ev: &EventLoop<B, T>,
    ) -> Result<ChildReservation> {
        ev.reserve_child_watch()
    }

    /// Watch for the termination of `pid`. Fires exactly once, even for a
    /// child that terminated before this call.
    pub fn register<B: AsBackend, T: Threading>(
        ev: &EventLoop<B, T>,
        pid: Pid,
        watcher: impl ChildWatcher,
    ) -> Result<ChildWatch> {
        ev.register_child(Box::new(watcher), pid).map(ChildWatch)
    }

    /// Like [`register`], but drawing on a reservation so it cannot fail.
    ///
    /// [`register`]: ChildWatch::register
    pub fn register_reserved<B: AsBackend, T: Threading>(
        ev: &EventLoop<B, T>,
        reservation: ChildReservation,
        pid: Pid,
        watcher: impl ChildWatcher,
    ) -> ChildWatch {
        ChildWatch(ev.register_reserved_child(reservation, Box::new(watcher), pid))
    }

    pub fn deregister<B: AsBackend, T: Threading>(self, ev: &EventLoop<B, T>) {
        ev.deregister_child(self.0);
    }
}
