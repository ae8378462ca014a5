//! Abstraction over the kernel notification mechanisms that can drive the
//! event loop.
//!
//! Different operating environments provide different notification systems,
//! each with their own semantics. This interface restricts their usage to a
//! shape every mechanism can provide, so the dispatch core never needs to
//! know which one is underneath. The notable constraints are:
//!
//! 1) epoll: fd interest is owned by the kernel, so the armed-state half of
//!           the backend only needs the control fd; watches are always
//!           registered one-shot and explicitly re-armed.
//! 2) pselect: the armed sets live in user space and are snapshotted per
//!            poll, so an fd enabled while another thread is already
//!            blocked polling is not seen until that poll is interrupted
//!            (`INTERRUPT_AFTER_FD_ADD`).
//!
//! A backend is split along its lock boundary. The *driver* half
//! ([`AsBackend`]) owns the blocking poll and is locked only around
//! [`AsBackend::pull_events`]. The *armed-tables* half ([`WatchTables`])
//! lives inside the dispatch queue's mutex; reaching its methods requires
//! holding that lock, which is exactly the discipline the delivery and
//! re-arm paths need.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use nix::sys::signal::Signal;
use nix::unistd;

use crate::dispatch::{DispatchQueue, WatchKey};
use crate::error::Result;

bitflags::bitflags! {
    /// Event interest and readiness bits for fd watches.
    ///
    /// `IN`, `OUT` and `ONESHOT` may be used when registering; delivered
    /// readiness additionally carries `ERR` and `HUP`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EventFlags: u32 {
        const IN = 0b00001;
        const OUT = 0b00010;
        const ERR = 0b00100;
        const HUP = 0b01000;
        const ONESHOT = 0b10000;
    }
}

/// The delivery record of one signal, captured when the kernel reports it
/// and handed unchanged to the watcher.
///
/// Which fields carry meaning depends on `code()`: sender pid/uid are set
/// for `kill`/`sigqueue` origins, `status` for child-state changes, `addr`
/// for faults. The rest read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigInfo {
    signo: i32,
    code: i32,
    errno: i32,
    pid: i32,
    uid: u32,
    status: i32,
    band: i64,
    addr: u64,
    value_int: i32,
    value_ptr: u64,
}

impl SigInfo {
    pub fn signo(&self) -> i32 {
        self.signo
    }

    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn errno(&self) -> i32 {
        self.errno
    }

    pub fn sender_pid(&self) -> i32 {
        self.pid
    }

    pub fn sender_uid(&self) -> u32 {
        self.uid
    }

    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn band(&self) -> i64 {
        self.band
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn value_int(&self) -> i32 {
        self.value_int
    }

    pub fn value_ptr(&self) -> u64 {
        self.value_ptr
    }

    pub fn set_signo(&mut self, signo: i32) {
        self.signo = signo;
    }

    /// Build from a signalfd record.
    #[allow(dead_code)]
    pub(crate) fn from_signalfd(ssi: &nix::libc::signalfd_siginfo) -> Self {
        SigInfo {
            signo: ssi.ssi_signo as i32,
            code: ssi.ssi_code,
            errno: ssi.ssi_errno,
            pid: ssi.ssi_pid as i32,
            uid: ssi.ssi_uid,
            status: ssi.ssi_status,
            band: ssi.ssi_band as i64,
            addr: ssi.ssi_addr,
            value_int: ssi.ssi_int as i32,
            value_ptr: ssi.ssi_ptr,
        }
    }

    /// Build from a raw record captured by a signal handler.
    #[allow(dead_code)]
    pub(crate) fn from_raw(si: &nix::libc::siginfo_t) -> Self {
        // The sifields union members are plain integers; reading one that
        // the si_code does not populate yields zeros or junk ints, never
        // anything worse. value_int is the low half of the sigval pointer
        // representation, which is how sigqueue lays it out.
        let value_ptr = unsafe { si.si_value().sival_ptr } as u64;
        SigInfo {
            signo: si.si_signo,
            code: si.si_code,
            errno: si.si_errno,
            pid: unsafe { si.si_pid() },
            uid: unsafe { si.si_uid() },
            status: unsafe { si.si_status() },
            band: 0,
            addr: unsafe { si.si_addr() } as u64,
            value_int: value_ptr as i32,
            value_ptr,
        }
    }
}

/// Write end of the wake-up pipe. Ringing it makes an in-progress
/// [`AsBackend::pull_events`] return promptly; it never blocks and is
/// async-signal-safe.
#[derive(Clone)]
pub struct Interrupter {
    wr: Arc<OwnedFd>,
}

impl Interrupter {
    /// Create the pipe pair: the interrupter and the read end the backend
    /// must include in its poll set and drain on wake-up.
    pub(crate) fn new_pair() -> Result<(Interrupter, OwnedFd)> {
        let (rd, wr) = unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK | nix::fcntl::OFlag::O_CLOEXEC)?;
        Ok((Interrupter { wr: Arc::new(wr) }, rd))
    }

    pub fn interrupt(&self) {
        // A full pipe already implies a pending wake-up.
        let _ = unistd::write(self.wr.as_fd(), &[1u8]);
    }
}

/// Drain a non-blocking wake-up pipe.
pub(crate) fn drain_pipe(fd: &OwnedFd) {
    let mut buf = [0u8; 64];
    while matches!(unistd::read(fd.as_raw_fd(), &mut buf), Ok(n) if n > 0) {}
}

/// Structural watch state of a backend. Lives inside the dispatch queue's
/// mutex; every method implicitly requires that lock to be held, which is
/// what makes them safe to call from the re-arm step of a dispatch.
pub trait WatchTables: Send + 'static {
    /// One registration can watch both directions of an fd.
    const HAS_BIDI_FD_WATCH: bool;
    /// Read and write interest in the same fd are independent watches.
    const HAS_SEPARATE_RW_FD_WATCHES: bool;
    /// Arming an fd is not observed by a poll already in progress; the
    /// caller must interrupt it.
    const INTERRUPT_AFTER_FD_ADD: bool;

    /// Register one direction of interest in `fd`. With `soft_fail`,
    /// returns `Ok(false)` (no side effects) for fd types the mechanism
    /// cannot poll instead of an error.
    fn add_fd_watch(
        &mut self,
        fd: RawFd,
        key: WatchKey,
        flags: EventFlags,
        enabled: bool,
        soft_fail: bool,
    ) -> Result<bool>;

    /// Register both directions under one key. Returns the direction(s)
    /// the mechanism cannot watch natively and would need emulated, empty
    /// when fully supported.
    fn add_bidi_fd_watch(&mut self, fd: RawFd, key: WatchKey, flags: EventFlags)
        -> Result<EventFlags>;

    fn remove_fd_watch(&mut self, fd: RawFd, flags: EventFlags);

    fn remove_bidi_fd_watch(&mut self, fd: RawFd);

    fn enable_fd_watch(&mut self, fd: RawFd, key: WatchKey, flags: EventFlags);

    fn disable_fd_watch(&mut self, fd: RawFd, flags: EventFlags);

    /// Install capture for `signo` and make it deliverable. Blocks the
    /// signal on the calling thread; threads spawned afterwards inherit
    /// the mask, so signal watches should be registered before worker
    /// threads that would otherwise leave the signal unblocked.
    fn add_signal_watch(&mut self, signo: Signal, key: WatchKey) -> Result<()>;

    /// Make a delivered (and therefore currently muted) signal deliverable
    /// again.
    fn rearm_signal_watch(&mut self, signo: Signal, key: WatchKey);

    /// Stop capturing `signo`. The signal stays blocked.
    fn remove_signal_watch(&mut self, signo: Signal);
}

/// The driver half of a backend: owns the kernel handle for the blocking
/// poll and the wake-up pipe.
pub trait AsBackend: Send + Sized + 'static {
    type Tables: WatchTables;

    /// Build the driver together with its armed tables.
    fn create() -> Result<(Self, Self::Tables)>;

    fn interrupter(&self) -> Interrupter;

    /// One poll step. When `do_wait`, block until at least one event
    /// arrives or the interrupter is rung; otherwise report whatever is
    /// already pending. Fired events are pushed into `core` (under its
    /// lock) through the delivery methods. Returning with no events
    /// delivered is permitted; callers loop.
    fn pull_events(&mut self, core: &DispatchQueue<Self::Tables>, do_wait: bool) -> Result<()>;
}
