//! pselect-based backend.
//!
//! The armed fd sets live in user space and are snapshotted under the
//! dispatch lock before each poll. Watched signals stay blocked except
//! inside the `pselect` window, where a `sigaction` handler captures the
//! raw `siginfo_t` and writes it to a non-blocking pipe; the interrupted
//! poll then drains the pipe and delivers. The capture pipe is a single
//! process-global, so at most one `SelectBackend` can exist per process.
//!
//! Delivered fds are cleared from the armed sets, so every delivery is
//! one-shot until the watch is re-armed; and because a poll computes its
//! sets up front, an fd armed while another thread is already polling is
//! only picked up once that poll has been interrupted.

use std::collections::HashMap;
use std::mem::{size_of, MaybeUninit};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use log::{trace, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::select::{pselect, FdSet};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::time::TimeSpec;
use nix::unistd;

use super::interface::{drain_pipe, AsBackend, EventFlags, Interrupter, SigInfo, WatchTables};
use crate::dispatch::{DispatchInner, DispatchQueue, WatchKey};
use crate::error::{Error, Result};

/// Write end of the capture pipe, shared with the signal handler. -1 when
/// no backend is installed.
static CAPTURE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn capture_signal(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let fd = CAPTURE_WR.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let saved_errno = Errno::last_raw();
    // siginfo_t fits in PIPE_BUF, so the record arrives whole or not at
    // all; a full pipe simply drops the instance.
    unsafe {
        libc::write(
            fd,
            info as *const libc::c_void,
            size_of::<libc::siginfo_t>(),
        );
    }
    Errno::set_raw(saved_errno);
}

struct FdArm {
    key: WatchKey,
    enabled: bool,
}

pub struct SelectTables {
    rd_watches: HashMap<RawFd, FdArm>,
    wr_watches: HashMap<RawFd, FdArm>,
    sig_watches: HashMap<i32, WatchKey>,
    sig_armed: HashMap<i32, Signal>,
}

impl SelectTables {
    fn direction(&mut self, flags: EventFlags) -> &mut HashMap<RawFd, FdArm> {
        if flags.contains(EventFlags::IN) {
            &mut self.rd_watches
        } else {
            &mut self.wr_watches
        }
    }
}

impl WatchTables for SelectTables {
    const HAS_BIDI_FD_WATCH: bool = false;
    const HAS_SEPARATE_RW_FD_WATCHES: bool = true;
    const INTERRUPT_AFTER_FD_ADD: bool = true;

    fn add_fd_watch(
        &mut self,
        fd: RawFd,
        key: WatchKey,
        flags: EventFlags,
        enabled: bool,
        _soft_fail: bool,
    ) -> Result<bool> {
        // pselect can watch any fd type.
        self.direction(flags).insert(fd, FdArm { key, enabled });
        Ok(true)
    }

    fn add_bidi_fd_watch(
        &mut self,
        fd: RawFd,
        key: WatchKey,
        flags: EventFlags,
    ) -> Result<EventFlags> {
        if flags.contains(EventFlags::IN) {
            self.rd_watches.insert(fd, FdArm { key, enabled: true });
        }
        if flags.contains(EventFlags::OUT) {
            self.wr_watches.insert(fd, FdArm { key, enabled: true });
        }
        Ok(EventFlags::empty())
    }

    fn remove_fd_watch(&mut self, fd: RawFd, flags: EventFlags) {
        if flags.contains(EventFlags::IN) {
            self.rd_watches.remove(&fd);
        }
        if flags.contains(EventFlags::OUT) {
            self.wr_watches.remove(&fd);
        }
    }

    fn remove_bidi_fd_watch(&mut self, fd: RawFd) {
        self.rd_watches.remove(&fd);
        self.wr_watches.remove(&fd);
    }

    fn enable_fd_watch(&mut self, fd: RawFd, key: WatchKey, flags: EventFlags) {
        if flags.contains(EventFlags::IN) {
            self.rd_watches.insert(fd, FdArm { key, enabled: true });
        }
        if flags.contains(EventFlags::OUT) {
            self.wr_watches.insert(fd, FdArm { key, enabled: true });
        }
    }

    fn disable_fd_watch(&mut self, fd: RawFd, flags: EventFlags) {
        if flags.contains(EventFlags::IN) {
            if let Some(arm) = self.rd_watches.get_mut(&fd) {
                arm.enabled = false;
            }
        }
        if flags.contains(EventFlags::OUT) {
            if let Some(arm) = self.wr_watches.get_mut(&fd) {
                arm.enabled = false;
            }
        }
    }

    fn add_signal_watch(&mut self, signo: Signal, key: WatchKey) -> Result<()> {
        let mut block = SigSet::empty();
        block.add(signo);
        block.thread_block()?;
        let action = SigAction::new(
            SigHandler::SigAction(capture_signal),
            SaFlags::SA_SIGINFO,
            SigSet::all(),
        );
        unsafe { sigaction(signo, &action) }?;
        self.sig_watches.insert(signo as i32, key);
        self.sig_armed.insert(signo as i32, signo);
        Ok(())
    }

    fn rearm_signal_watch(&mut self, signo: Signal, key: WatchKey) {
        self.sig_watches.insert(signo as i32, key);
        self.sig_armed.insert(signo as i32, signo);
    }

    fn remove_signal_watch(&mut self, signo: Signal) {
        // Restore the default disposition; the signal stays blocked so
        // this cannot terminate the process.
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        if let Err(e) = unsafe { sigaction(signo, &action) } {
            warn!("failed to restore disposition of {}: {}", signo, e);
        }
        self.sig_watches.remove(&(signo as i32));
        self.sig_armed.remove(&(signo as i32));
    }
}

pub struct SelectBackend {
    capture_rd: OwnedFd,
    // Keeps the handler's fd alive; the static holds only the raw value.
    _capture_wr: OwnedFd,
    intr_rd: OwnedFd,
    intr: Interrupter,
    // Snapshot buffers reused between polls.
    rfds: Vec<RawFd>,
    wfds: Vec<RawFd>,
    armed_sigs: Vec<Signal>,
}

impl SelectBackend {
    fn snapshot(&mut self, inner: &mut DispatchInner<SelectTables>) {
        let tables = inner.tables();
        self.rfds.clear();
        self.rfds.extend(
            tables
                .rd_watches
                .iter()
                .filter(|(_, arm)| arm.enabled)
                .map(|(fd, _)| *fd),
        );
        self.wfds.clear();
        self.wfds.extend(
            tables
                .wr_watches
                .iter()
                .filter(|(_, arm)| arm.enabled)
                .map(|(fd, _)| *fd),
        );
        self.armed_sigs.clear();
        self.armed_sigs.extend(tables.sig_armed.values().copied());
    }

    /// Deliver every captured siginfo record sitting in the pipe.
    fn drain_captured(&mut self, inner: &mut DispatchInner<SelectTables>) {
        loop {
            let mut record = MaybeUninit::<libc::siginfo_t>::uninit();
            let n = unsafe {
                libc::read(
                    self.capture_rd.as_raw_fd(),
                    record.as_mut_ptr() as *mut libc::c_void,
                    size_of::<libc::siginfo_t>(),
                )
            };
            if n != size_of::<libc::siginfo_t>() as isize {
                break;
            }
            let si = unsafe { record.assume_init() };
            let info = SigInfo::from_raw(&si);
            let signo = info.signo();
            match inner.tables().sig_watches.get(&signo).copied() {
                Some(key) => {
                    if inner.deliver_signal(key, info) {
                        inner.tables().sig_armed.remove(&signo);
                    }
                }
                None => trace!("discarding signal {} with no watch", signo),
            }
        }
    }
}

impl Drop for SelectBackend {
    fn drop(&mut self) {
        CAPTURE_WR.store(-1, Ordering::SeqCst);
    }
}

impl AsBackend for SelectBackend {
    type Tables = SelectTables;

    fn create() -> Result<(Self, Self::Tables)> {
        let (capture_rd, capture_wr) = unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        if CAPTURE_WR
            .compare_exchange(-1, capture_wr.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::CaptureBusy);
        }
        let (intr, intr_rd) = Interrupter::new_pair()?;
        let backend = SelectBackend {
            capture_rd,
            _capture_wr: capture_wr,
            intr_rd,
            intr,
            rfds: Vec::new(),
            wfds: Vec::new(),
            armed_sigs: Vec::new(),
        };
        let tables = SelectTables {
            rd_watches: HashMap::new(),
            wr_watches: HashMap::new(),
            sig_watches: HashMap::new(),
            sig_armed: HashMap::new(),
        };
        Ok((backend, tables))
    }

    fn interrupter(&self) -> Interrupter {
        self.intr.clone()
    }

    fn pull_events(&mut self, core: &DispatchQueue<SelectTables>, do_wait: bool) -> Result<()> {
        {
            let mut inner = core.lock();
            self.snapshot(&mut *inner);
        }

        let mut read_set = FdSet::new();
        let mut write_set = FdSet::new();
        for fd in self
            .rfds
            .iter()
            .chain(&[self.intr_rd.as_raw_fd(), self.capture_rd.as_raw_fd()])
        {
            read_set.insert(unsafe { BorrowedFd::borrow_raw(*fd) });
        }
        for fd in &self.wfds {
            write_set.insert(unsafe { BorrowedFd::borrow_raw(*fd) });
        }

        // Atomically unblock the armed signals for the duration of the
        // poll; a delivery runs the capture handler and fails the call
        // with EINTR.
        let mut mask = SigSet::thread_get_mask()?;
        for sig in &self.armed_sigs {
            mask.remove(*sig);
        }

        let zero = TimeSpec::new(0, 0);
        let timeout = if do_wait { None } else { Some(&zero) };
        match pselect(
            None,
            Some(&mut read_set),
            Some(&mut write_set),
            None,
            timeout,
            Some(&mask),
        ) {
            Err(Errno::EINTR) => {
                let mut inner = core.lock();
                self.drain_captured(&mut *inner);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        let mut inner = core.lock();
        if read_set.contains(unsafe { BorrowedFd::borrow_raw(self.intr_rd.as_raw_fd()) }) {
            drain_pipe(&self.intr_rd);
        }
        if read_set.contains(unsafe { BorrowedFd::borrow_raw(self.capture_rd.as_raw_fd()) }) {
            self.drain_captured(&mut *inner);
        }
        for i in 0..self.rfds.len() {
            let fd = self.rfds[i];
            if !read_set.contains(unsafe { BorrowedFd::borrow_raw(fd) }) {
                continue;
            }
            let key = match inner.tables().rd_watches.get_mut(&fd) {
                Some(arm) if arm.enabled => {
                    // One-shot: cleared until explicitly re-armed.
                    arm.enabled = false;
                    Some(arm.key)
                }
                _ => None,
            };
            if let Some(key) = key {
                inner.deliver_fd_event(key, EventFlags::IN);
            }
        }
        for i in 0..self.wfds.len() {
            let fd = self.wfds[i];
            if !write_set.contains(unsafe { BorrowedFd::borrow_raw(fd) }) {
                continue;
            }
            let key = match inner.tables().wr_watches.get_mut(&fd) {
                Some(arm) if arm.enabled => {
                    arm.enabled = false;
                    Some(arm.key)
                }
                _ => None,
            };
            if let Some(key) = key {
                inner.deliver_fd_event(key, EventFlags::OUT);
            }
        }
        Ok(())
    }
}
