//! The event loop.
//!
//! Most notification mechanisms get awkward in a multi-threaded program at
//! the same point: a watched event source is associated with data that the
//! handler needs, and some thread eventually wants to unwatch the source
//! and drop that data while another thread may be mid-way through
//! reporting an event for it. Knowing when the data is really safe to
//! drop is the whole problem. The loop resolves it by combining:
//!
//! - a single poller at a time, gated by the poll side of the attention
//!   lock;
//! - mutations (register/deregister) taking the priority side of the same
//!   lock, interrupting a poll that is in flight;
//! - watchers marked while queued or executing, with removal of a marked
//!   watcher deferred via `deleteme` until its dispatch finishes.
//!
//! Handlers always run outside every internal lock, so they may freely
//! operate on other watches; their own watch is controlled through the
//! [`Rearm`](crate::Rearm) value they return.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::backend::{AsBackend, Backend, EventFlags, Interrupter, WatchTables};
use crate::dispatch::{DispatchQueue, WatchKey, WatchKind, CHILD_REAP_KEY};
use crate::error::{Error, Result};
use crate::waitq::{AttentionLock, MultiThread, SingleThread, Threading};
use crate::watch::{ChildReservation, ChildWatcher, FdWatcher, SignalWatcher};

/// Loop shareable between threads; any number of them may call
/// [`EventLoop::run`] concurrently.
pub type ThreadedLoop = EventLoop<Backend, MultiThread>;

/// Loop for strictly single-threaded use; thread suspension machinery is
/// compiled out.
pub type LocalLoop = EventLoop<Backend, SingleThread>;

pub struct EventLoop<B: AsBackend, T: Threading = MultiThread> {
    core: DispatchQueue<B::Tables>,
    driver: Mutex<B>,
    intr: Interrupter,
    attn: AttentionLock<T::Node>,
    stop: AtomicBool,
}

impl<B: AsBackend, T: Threading> EventLoop<B, T> {
    pub fn new() -> Result<Self> {
        let (driver, tables) = B::create()?;
        let intr = driver.interrupter();
        Ok(EventLoop {
            core: DispatchQueue::new(tables),
            driver: Mutex::new(driver),
            intr,
            attn: AttentionLock::new(),
            stop: AtomicBool::new(false),
        })
    }

    /// Run `f` under the dispatch lock with the attention lock held: no
    /// thread is polling and no new delivery can begin while it runs.
    fn with_attention<R>(
        &self,
        f: impl FnOnce(&mut crate::dispatch::DispatchInner<B::Tables>) -> R,
    ) -> R {
        let node = Arc::new(T::Node::default());
        self.attn.acquire_attention(&node, || self.intr.interrupt());
        let r = {
            let mut inner = self.core.lock();
            f(&mut *inner)
        };
        self.attn.release(&node);
        r
    }

    pub(crate) fn register_fd(
        &self,
        watcher: Box<dyn FdWatcher>,
        fd: RawFd,
        flags: EventFlags,
    ) -> Result<WatchKey> {
        if !flags.intersects(EventFlags::IN | EventFlags::OUT) {
            return Err(Error::Os(Errno::EINVAL));
        }
        self.with_attention(|inner| {
            let key = inner.watchers.insert_fd(fd, flags, watcher);
            let res = if flags.contains(EventFlags::IN | EventFlags::OUT) {
                match inner.tables().add_bidi_fd_watch(fd, key, flags) {
                    Ok(emulate) if emulate.is_empty() => Ok(()),
                    Ok(_) => Err(Error::UnsupportedFd),
                    Err(e) => Err(e),
                }
            } else {
                inner
                    .tables()
                    .add_fd_watch(fd, key, flags, true, false)
                    .map(|_| ())
            };
            match res {
                Ok(()) => {
                    debug!("registered fd watch {:#x} on fd {}", key.as_u64(), fd);
                    Ok(key)
                }
                Err(e) => {
                    inner.watchers.discard(key);
                    Err(e)
                }
            }
        })
    }

    /// Copy the registration parameters of a live fd watch.
    fn fd_params(
        inner: &mut crate::dispatch::DispatchInner<B::Tables>,
        key: WatchKey,
    ) -> Option<(RawFd, EventFlags)> {
        let slot = inner.watchers.check(key)?;
        match &inner.watchers.entry(slot).kind {
            WatchKind::Fd {
                fd, watch_flags, ..
            } => Some((*fd, *watch_flags)),
            _ => None,
        }
    }

    pub(crate) fn deregister_fd(&self, key: WatchKey) {
        self.with_attention(|inner| {
            let Some((fd, watch_flags)) = Self::fd_params(inner, key) else {
                return;
            };
            if watch_flags.contains(EventFlags::IN | EventFlags::OUT) {
                inner.tables().remove_bidi_fd_watch(fd);
            } else {
                inner.tables().remove_fd_watch(fd, watch_flags);
            }
            inner.issue_delete(key);
            debug!("deregistered fd watch {:#x}", key.as_u64());
        })
    }

    pub(crate) fn enable_fd(&self, key: WatchKey) {
        self.with_attention(|inner| {
            if let Some((fd, watch_flags)) = Self::fd_params(inner, key) {
                inner.tables().enable_fd_watch(fd, key, watch_flags);
            }
        })
    }

    pub(crate) fn disable_fd(&self, key: WatchKey) {
        self.with_attention(|inner| {
            if let Some((fd, watch_flags)) = Self::fd_params(inner, key) {
                inner.tables().disable_fd_watch(fd, watch_flags);
            }
        })
    }

    pub(crate) fn register_signal(
        &self,
        watcher: Box<dyn SignalWatcher>,
        signo: Signal,
    ) -> Result<WatchKey> {
        self.with_attention(|inner| {
            let key = inner.watchers.insert_signal(signo, watcher);
            match inner.tables().add_signal_watch(signo, key) {
                Ok(()) => {
                    debug!("registered watch {:#x} on {}", key.as_u64(), signo);
                    Ok(key)
                }
                Err(e) => {
                    inner.watchers.discard(key);
                    Err(e)
                }
            }
        })
    }

    pub(crate) fn deregister_signal(&self, key: WatchKey) {
        self.with_attention(|inner| {
            let Some(slot) = inner.watchers.check(key) else {
                return;
            };
            let signo = match &inner.watchers.entry(slot).kind {
                WatchKind::Signal { signo, .. } => Some(*signo),
                _ => None,
            };
            if let Some(signo) = signo {
                inner.tables().remove_signal_watch(signo);
            }
            inner.issue_delete(key);
            debug!("deregistered signal watch {:#x}", key.as_u64());
        })
    }

    pub(crate) fn reserve_child_watch(&self) -> Result<ChildReservation> {
        self.with_attention(|inner| {
            if !inner.children.sigchld_armed {
                inner
                    .tables()
                    .add_signal_watch(Signal::SIGCHLD, CHILD_REAP_KEY)?;
                inner.children.sigchld_armed = true;
            }
            let outstanding = inner.children.reserve();
            inner.watchers.reserve(outstanding);
            Ok(ChildReservation { _priv: () })
        })
    }

    pub(crate) fn register_child(
        &self,
        watcher: Box<dyn ChildWatcher>,
        pid: Pid,
    ) -> Result<WatchKey> {
        self.with_attention(|inner| {
            if !inner.children.sigchld_armed {
                inner
                    .tables()
                    .add_signal_watch(Signal::SIGCHLD, CHILD_REAP_KEY)?;
                inner.children.sigchld_armed = true;
            }
            let key = inner.watchers.insert_child(pid, watcher);
            inner.children.insert(pid, key.slot as usize);
            inner.probe_child(pid);
            debug!("registered child watch {:#x} on {}", key.as_u64(), pid);
            Ok(key)
        })
    }

    pub(crate) fn register_reserved_child(
        &self,
        reservation: ChildReservation,
        watcher: Box<dyn ChildWatcher>,
        pid: Pid,
    ) -> WatchKey {
        // SIGCHLD capture was armed when the reservation was made.
        let _ = reservation;
        self.with_attention(|inner| {
            let key = inner.watchers.insert_child(pid, watcher);
            inner.children.insert_reserved(pid, key.slot as usize);
            inner.probe_child(pid);
            debug!("registered child watch {:#x} on {}", key.as_u64(), pid);
            key
        })
    }

    pub(crate) fn deregister_child(&self, key: WatchKey) {
        self.with_attention(|inner| {
            let Some(slot) = inner.watchers.check(key) else {
                return;
            };
            let pid = match &inner.watchers.entry(slot).kind {
                WatchKind::Child { pid, .. } => Some(*pid),
                _ => None,
            };
            if let Some(pid) = pid {
                inner.children.forget(pid);
            }
            inner.issue_delete(key);
        })
    }

    /// Dispatch every watcher whose event has already fired. Returns
    /// whether at least one handler ran.
    fn process_events(&self) -> bool {
        let mut cur = self.core.lock().detach_pending();
        let mut had_work = false;
        while let Some(slot) = cur {
            let (job, next) = self.core.lock().begin_dispatch(slot);
            cur = next;
            let Some(job) = job else {
                continue;
            };
            had_work = true;
            let (rearm, job) = job.run();
            let interrupt = self.core.lock().finish_dispatch(slot, job, rearm);
            if interrupt {
                self.intr.interrupt();
            }
        }
        had_work
    }

    fn poll(&self, node: &Arc<T::Node>) {
        self.attn.acquire_poll(node);
        if !self.stop.load(Ordering::Acquire) {
            let r = self.driver.lock().pull_events(&self.core, true);
            if let Err(e) = r {
                warn!("event poll failed: {}", e);
            }
        }
        self.attn.release(node);
    }

    /// Dispatch and poll until [`stop`] is called.
    ///
    /// [`stop`]: EventLoop::stop
    pub fn run(&self) {
        let node = Arc::new(T::Node::default());
        while !self.stop.load(Ordering::Acquire) {
            if self.process_events() {
                continue;
            }
            self.poll(&node);
        }
    }

    /// Dispatch pending events, polling as needed, and return once a batch
    /// in which at least one handler ran has been processed.
    pub fn run_once(&self) {
        let node = Arc::new(T::Node::default());
        while !self.process_events() {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            self.poll(&node);
        }
    }

    /// Make every `run` caller return after its current cycle. Sticky: a
    /// stopped loop's `run` returns immediately.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.intr.interrupt();
    }
}
