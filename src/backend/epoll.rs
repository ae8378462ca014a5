//! epoll-based backend with signalfd signal capture.
//!
//! Fd interest lives in the kernel, registered `EPOLLONESHOT` and
//! explicitly re-armed, so a delivered watch cannot fire again while its
//! handler is queued or running. Watched signals are blocked and read
//! back as `signalfd_siginfo` records; after a delivery the signal is
//! dropped from the signalfd mask until the watch is re-armed, leaving
//! further instances pending in the kernel.

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::{trace, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use super::interface::{drain_pipe, AsBackend, EventFlags, Interrupter, SigInfo, WatchTables};
use crate::dispatch::{DispatchInner, DispatchQueue, WatchKey};
use crate::error::{Error, Result};

const TOKEN_SIGNAL_FD: u64 = u64::MAX;
const TOKEN_INTERRUPT: u64 = u64::MAX - 1;
const EVENT_BATCH: usize = 16;

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> nix::Result<()> {
    let mut ev = libc::epoll_event { events, u64: token };
    let res = unsafe { libc::epoll_ctl(epfd, op, fd, &mut ev) };
    if res == -1 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

fn interest_bits(flags: EventFlags, enabled: bool) -> u32 {
    let mut events = libc::EPOLLONESHOT as u32;
    if enabled {
        if flags.contains(EventFlags::IN) {
            events |= libc::EPOLLIN as u32;
        }
        if flags.contains(EventFlags::OUT) {
            events |= libc::EPOLLOUT as u32;
        }
    }
    events
}

fn readiness(events: u32) -> EventFlags {
    let mut flags = EventFlags::empty();
    if events & libc::EPOLLIN as u32 != 0 {
        flags |= EventFlags::IN;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        flags |= EventFlags::OUT;
    }
    if events & libc::EPOLLERR as u32 != 0 {
        flags |= EventFlags::ERR;
    }
    if events & libc::EPOLLHUP as u32 != 0 {
        flags |= EventFlags::HUP;
    }
    flags
}

pub struct EpollBackend {
    epoll: OwnedFd,
    intr_rd: OwnedFd,
    intr: Interrupter,
    events: [libc::epoll_event; EVENT_BATCH],
}

pub struct EpollTables {
    epoll_fd: RawFd,
    signal_fd: SignalFd,
    sig_watches: HashMap<i32, WatchKey>,
    sig_armed: HashSet<i32>,
}

impl EpollTables {
    fn update_sigmask(&mut self) -> nix::Result<()> {
        let mut mask = SigSet::empty();
        for signo in &self.sig_armed {
            // Only values that came in through a Signal make it into the set.
            if let Ok(sig) = Signal::try_from(*signo) {
                mask.add(sig);
            }
        }
        self.signal_fd.set_mask(&mask)
    }

    /// Mute a just-delivered signal until its watch is re-armed.
    fn disarm_signal(&mut self, signo: i32) {
        self.sig_armed.remove(&signo);
        if let Err(e) = self.update_sigmask() {
            warn!("failed to shrink signalfd mask: {}", e);
        }
    }
}

impl WatchTables for EpollTables {
    const HAS_BIDI_FD_WATCH: bool = true;
    const HAS_SEPARATE_RW_FD_WATCHES: bool = false;
    const INTERRUPT_AFTER_FD_ADD: bool = false;

    fn add_fd_watch(
        &mut self,
        fd: RawFd,
        key: WatchKey,
        flags: EventFlags,
        enabled: bool,
        soft_fail: bool,
    ) -> Result<bool> {
        match epoll_ctl(
            self.epoll_fd,
            libc::EPOLL_CTL_ADD,
            fd,
            interest_bits(flags, enabled),
            key.as_u64(),
        ) {
            Ok(()) => Ok(true),
            // epoll refuses plain files and the like with EPERM.
            Err(Errno::EPERM) if soft_fail => Ok(false),
            Err(Errno::EPERM) => Err(Error::UnsupportedFd),
            Err(e) => Err(e.into()),
        }
    }

    fn add_bidi_fd_watch(
        &mut self,
        fd: RawFd,
        key: WatchKey,
        flags: EventFlags,
    ) -> Result<EventFlags> {
        self.add_fd_watch(fd, key, flags, true, false)?;
        Ok(EventFlags::empty())
    }

    fn remove_fd_watch(&mut self, fd: RawFd, _flags: EventFlags) {
        match epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, 0, 0) {
            // Deregistration and a handler's Remove may both get here.
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(e) => warn!("failed to remove fd {} from epoll set: {}", fd, e),
        }
    }

    fn remove_bidi_fd_watch(&mut self, fd: RawFd) {
        self.remove_fd_watch(fd, EventFlags::IN | EventFlags::OUT);
    }

    fn enable_fd_watch(&mut self, fd: RawFd, key: WatchKey, flags: EventFlags) {
        if let Err(e) = epoll_ctl(
            self.epoll_fd,
            libc::EPOLL_CTL_MOD,
            fd,
            interest_bits(flags, true),
            key.as_u64(),
        ) {
            warn!("failed to re-arm fd {}: {}", fd, e);
        }
    }

    fn disable_fd_watch(&mut self, fd: RawFd, flags: EventFlags) {
        if let Err(e) = epoll_ctl(
            self.epoll_fd,
            libc::EPOLL_CTL_MOD,
            fd,
            interest_bits(flags, false),
            0,
        ) {
            warn!("failed to disarm fd {}: {}", fd, e);
        }
    }

    fn add_signal_watch(&mut self, signo: Signal, key: WatchKey) -> Result<()> {
        let mut block = SigSet::empty();
        block.add(signo);
        block.thread_block()?;
        self.sig_watches.insert(signo as i32, key);
        self.sig_armed.insert(signo as i32);
        if let Err(e) = self.update_sigmask() {
            self.sig_watches.remove(&(signo as i32));
            self.sig_armed.remove(&(signo as i32));
            return Err(e.into());
        }
        Ok(())
    }

    fn rearm_signal_watch(&mut self, signo: Signal, key: WatchKey) {
        self.sig_watches.insert(signo as i32, key);
        self.sig_armed.insert(signo as i32);
        if let Err(e) = self.update_sigmask() {
            warn!("failed to re-arm signal {}: {}", signo, e);
        }
    }

    fn remove_signal_watch(&mut self, signo: Signal) {
        // The signal stays blocked; pending instances are discarded with
        // the mask entry.
        self.sig_watches.remove(&(signo as i32));
        self.sig_armed.remove(&(signo as i32));
        if let Err(e) = self.update_sigmask() {
            warn!("failed to shrink signalfd mask: {}", e);
        }
    }
}

impl EpollBackend {
    fn drain_signals(inner: &mut DispatchInner<EpollTables>) {
        loop {
            let ssi = match inner.tables().signal_fd.read_signal() {
                Ok(Some(ssi)) => ssi,
                Ok(None) => break,
                Err(e) => {
                    warn!("signalfd read failed: {}", e);
                    break;
                }
            };
            let signo = ssi.ssi_signo as i32;
            let info = SigInfo::from_signalfd(&ssi);
            match inner.tables().sig_watches.get(&signo).copied() {
                Some(key) => {
                    if inner.deliver_signal(key, info) {
                        inner.tables().disarm_signal(signo);
                    }
                }
                None => trace!("discarding signal {} with no watch", signo),
            }
        }
    }
}

impl AsBackend for EpollBackend {
    type Tables = EpollTables;

    fn create() -> Result<(Self, Self::Tables)> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(Errno::last().into());
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        let signal_fd = SignalFd::with_flags(
            &SigSet::empty(),
            SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC,
        )?;
        epoll_ctl(
            epfd,
            libc::EPOLL_CTL_ADD,
            signal_fd.as_raw_fd(),
            libc::EPOLLIN as u32,
            TOKEN_SIGNAL_FD,
        )?;

        let (intr, intr_rd) = Interrupter::new_pair()?;
        epoll_ctl(
            epfd,
            libc::EPOLL_CTL_ADD,
            intr_rd.as_raw_fd(),
            libc::EPOLLIN as u32,
            TOKEN_INTERRUPT,
        )?;

        let backend = EpollBackend {
            epoll,
            intr_rd,
            intr,
            events: unsafe { std::mem::zeroed() },
        };
        let tables = EpollTables {
            epoll_fd: epfd,
            signal_fd,
            sig_watches: HashMap::new(),
            sig_armed: HashSet::new(),
        };
        Ok((backend, tables))
    }

    fn interrupter(&self) -> Interrupter {
        self.intr.clone()
    }

    fn pull_events(&mut self, core: &DispatchQueue<EpollTables>, do_wait: bool) -> Result<()> {
        let timeout = if do_wait { -1 } else { 0 };
        let nfds = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                EVENT_BATCH as libc::c_int,
                timeout,
            )
        };
        if nfds == -1 {
            if Errno::last() == Errno::EINTR {
                return Ok(());
            }
            return Err(Errno::last().into());
        }

        let mut inner = core.lock();
        for ev in &self.events[..nfds as usize] {
            match ev.u64 {
                TOKEN_SIGNAL_FD => Self::drain_signals(&mut *inner),
                TOKEN_INTERRUPT => drain_pipe(&self.intr_rd),
                token => {
                    let flags = readiness(ev.events);
                    trace!("fd event {:?} for watch {:#x}", flags, token);
                    inner.deliver_fd_event(WatchKey::from_u64(token), flags);
                }
            }
        }
        Ok(())
    }
}
