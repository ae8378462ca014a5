//! Watcher storage and the pending-dispatch queue.
//!
//! Fired watchers are linked into an intrusive single-linked pending list
//! through a slot index stored in the entry itself, so the delivery path
//! never allocates while the lock is held. An entry is *queued* while it
//! sits on that list and *executing* while its handler box has been taken
//! out for a callback; removal requested in either state is deferred by
//! the `deleteme` flag until the dispatch drains.

use std::os::fd::RawFd;

use log::{debug, trace, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;

use crate::backend::{EventFlags, SigInfo, WatchTables};
use crate::childproc::ChildWatches;
use crate::watch::{ChildWatcher, FdWatcher, Rearm, SignalWatcher};

/// Identifies one registered watch. Packs into the `u64` userdata the
/// backend stores with the kernel; the serial makes stale handles and
/// stale kernel events inert after a slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchKey {
    pub(crate) slot: u32,
    pub(crate) serial: u32,
}

impl WatchKey {
    pub fn as_u64(self) -> u64 {
        (self.slot as u64) << 32 | self.serial as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        WatchKey {
            slot: (raw >> 32) as u32,
            serial: raw as u32,
        }
    }
}

/// Userdata key of the internal SIGCHLD watch feeding the child reaper.
pub(crate) const CHILD_REAP_KEY: WatchKey = WatchKey {
    slot: u32::MAX,
    serial: 0,
};

pub(crate) enum WatchKind {
    Fd {
        fd: RawFd,
        watch_flags: EventFlags,
        event_flags: EventFlags,
        handler: Option<Box<dyn FdWatcher>>,
    },
    Signal {
        signo: Signal,
        info: SigInfo,
        handler: Option<Box<dyn SignalWatcher>>,
    },
    Child {
        pid: Pid,
        status: WaitStatus,
        handler: Option<Box<dyn ChildWatcher>>,
    },
}

impl WatchKind {
    fn executing(&self) -> bool {
        match self {
            WatchKind::Fd { handler, .. } => handler.is_none(),
            WatchKind::Signal { handler, .. } => handler.is_none(),
            WatchKind::Child { handler, .. } => handler.is_none(),
        }
    }
}

pub(crate) struct WatchEntry {
    pub(crate) serial: u32,
    queued: bool,
    pub(crate) deleteme: bool,
    next: Option<usize>,
    pub(crate) kind: WatchKind,
}

impl WatchEntry {
    /// True while the handler is queued for dispatch or running; removal
    /// must be deferred in either state.
    fn busy(&self) -> bool {
        self.queued || self.kind.executing()
    }

    /// Final notification to the owner; consumes the entry.
    fn notify_removed(self) {
        match self.kind {
            WatchKind::Fd { handler, .. } => {
                if let Some(mut h) = handler {
                    h.watch_removed();
                }
            }
            WatchKind::Signal { handler, .. } => {
                if let Some(mut h) = handler {
                    h.watch_removed();
                }
            }
            WatchKind::Child { handler, .. } => {
                if let Some(mut h) = handler {
                    h.watch_removed();
                }
            }
        }
    }
}

/// Slot arena plus the pending list head.
pub(crate) struct WatcherTable {
    slab: Slab<WatchEntry>,
    pending: Option<usize>,
    next_serial: u32,
}

impl WatcherTable {
    fn new() -> Self {
        WatcherTable {
            slab: Slab::new(),
            pending: None,
            next_serial: 0,
        }
    }

    fn insert(&mut self, kind: WatchKind) -> WatchKey {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1);
        let slot = self.slab.insert(WatchEntry {
            serial,
            queued: false,
            deleteme: false,
            next: None,
            kind,
        });
        WatchKey {
            slot: slot as u32,
            serial,
        }
    }

    pub(crate) fn insert_fd(
        &mut self,
        fd: RawFd,
        watch_flags: EventFlags,
        handler: Box<dyn FdWatcher>,
    ) -> WatchKey {
        self.insert(WatchKind::Fd {
            fd,
            watch_flags,
            event_flags: EventFlags::empty(),
            handler: Some(handler),
        })
    }

    pub(crate) fn insert_signal(
        &mut self,
        signo: Signal,
        handler: Box<dyn SignalWatcher>,
    ) -> WatchKey {
        self.insert(WatchKind::Signal {
            signo,
            info: SigInfo::default(),
            handler: Some(handler),
        })
    }

    pub(crate) fn insert_child(&mut self, pid: Pid, handler: Box<dyn ChildWatcher>) -> WatchKey {
        self.insert(WatchKind::Child {
            pid,
            status: WaitStatus::StillAlive,
            handler: Some(handler),
        })
    }

    /// Roll back an insertion whose backend registration failed. No
    /// removal notification: the watch never existed.
    pub(crate) fn discard(&mut self, key: WatchKey) {
        if self.check(key).is_some() {
            self.slab.remove(key.slot as usize);
        }
    }

    pub(crate) fn reserve(&mut self, additional: usize) {
        self.slab.reserve(additional);
    }

    /// Resolve a key to its slot, rejecting stale serials.
    pub(crate) fn check(&self, key: WatchKey) -> Option<usize> {
        let slot = key.slot as usize;
        match self.slab.get(slot) {
            Some(e) if e.serial == key.serial => Some(slot),
            _ => None,
        }
    }

    pub(crate) fn entry(&mut self, slot: usize) -> &mut WatchEntry {
        &mut self.slab[slot]
    }

    fn link(&mut self, slot: usize) {
        let prev = self.pending.replace(slot);
        let e = &mut self.slab[slot];
        e.queued = true;
        e.next = prev;
    }
}

/// What a dispatch runs outside the lock: the handler box taken from the
/// entry plus a snapshot of the payload it fired with.
pub(crate) enum DispatchJob {
    Fd {
        handler: Box<dyn FdWatcher>,
        fd: RawFd,
        flags: EventFlags,
    },
    Signal {
        handler: Box<dyn SignalWatcher>,
        signo: Signal,
        info: SigInfo,
    },
    Child {
        handler: Box<dyn ChildWatcher>,
        pid: Pid,
        status: WaitStatus,
    },
}

impl DispatchJob {
    /// Invoke the handler. Child watches have no re-arm choice; they are
    /// removed after their single delivery.
    pub(crate) fn run(mut self) -> (Rearm, DispatchJob) {
        let rearm = match &mut self {
            DispatchJob::Fd { handler, fd, flags } => handler.on_event(*fd, *flags),
            DispatchJob::Signal {
                handler,
                signo,
                info,
            } => handler.on_signal(*signo, info),
            DispatchJob::Child {
                handler,
                pid,
                status,
            } => {
                handler.on_exit(*pid, *status);
                Rearm::Remove
            }
        };
        (rearm, self)
    }
}

/// The dispatch queue: one mutex guarding watcher storage, the child-watch
/// table and the backend's armed tables. Backends lock it to deliver;
/// the loop locks it around every structural transition.
pub struct DispatchQueue<T: WatchTables> {
    inner: Mutex<DispatchInner<T>>,
}

impl<T: WatchTables> DispatchQueue<T> {
    pub(crate) fn new(tables: T) -> Self {
        DispatchQueue {
            inner: Mutex::new(DispatchInner {
                watchers: WatcherTable::new(),
                children: ChildWatches::new(),
                tables,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, DispatchInner<T>> {
        self.inner.lock()
    }
}

pub struct DispatchInner<T: WatchTables> {
    pub(crate) watchers: WatcherTable,
    pub(crate) children: ChildWatches,
    tables: T,
}

impl<T: WatchTables> DispatchInner<T> {
    /// The backend's armed state; calling through here is what the
    /// "must hold the dispatch lock" contract looks like in practice.
    pub fn tables(&mut self) -> &mut T {
        &mut self.tables
    }

    /// Deliver fd readiness for `key`. Events observed while the watcher
    /// is already queued or executing merge into its pending flags.
    pub fn deliver_fd_event(&mut self, key: WatchKey, flags: EventFlags) {
        let Some(slot) = self.watchers.check(key) else {
            warn!("fd event for stale watch key {:#x}", key.as_u64());
            return;
        };
        let e = self.watchers.entry(slot);
        let busy = e.busy();
        match &mut e.kind {
            WatchKind::Fd { event_flags, .. } => {
                if busy {
                    *event_flags |= flags;
                    return;
                }
                *event_flags = flags;
            }
            _ => {
                warn!("fd event for non-fd watch key {:#x}", key.as_u64());
                return;
            }
        }
        trace!("queueing fd watch {:#x} for {:?}", key.as_u64(), flags);
        self.watchers.link(slot);
    }

    /// Deliver a signal. Returns whether the backend should mute the
    /// signal until the watcher is re-armed; the internal child-reap
    /// watch and stale keys stay live.
    pub fn deliver_signal(&mut self, key: WatchKey, info: SigInfo) -> bool {
        if key == CHILD_REAP_KEY {
            self.reap_children();
            return false;
        }
        let Some(slot) = self.watchers.check(key) else {
            trace!("signal {} with no live watch", info.signo());
            return false;
        };
        let e = self.watchers.entry(slot);
        let busy = e.busy();
        match &mut e.kind {
            WatchKind::Signal {
                info: stored_info, ..
            } => {
                *stored_info = info;
                if busy {
                    return true;
                }
            }
            _ => {
                warn!("signal for non-signal watch key {:#x}", key.as_u64());
                return false;
            }
        }
        trace!("queueing signal watch {:#x}", key.as_u64());
        self.watchers.link(slot);
        true
    }

    /// Queue a reaped (or probed) child status. The pid has already been
    /// taken out of the child table; delivery happens exactly once.
    pub(crate) fn deliver_child_status(&mut self, slot: usize, status: WaitStatus) {
        let e = self.watchers.entry(slot);
        if let WatchKind::Child {
            status: stored, ..
        } = &mut e.kind
        {
            *stored = status;
        }
        self.watchers.link(slot);
    }

    /// Request removal. Must be called with the attention lock held so no
    /// new delivery can race in; a watcher still queued or executing is
    /// flagged and torn down when the dispatch drains, otherwise the
    /// owner is notified immediately.
    pub(crate) fn issue_delete(&mut self, key: WatchKey) {
        let Some(slot) = self.watchers.check(key) else {
            return;
        };
        let e = self.watchers.entry(slot);
        if e.busy() {
            e.deleteme = true;
        } else {
            let entry = self.watchers.slab.remove(slot);
            entry.notify_removed();
        }
    }

    /// Detach the whole pending list, dropping entries whose removal was
    /// requested while they sat queued. Returns the head of what remains.
    pub(crate) fn detach_pending(&mut self) -> Option<usize> {
        let mut head = self.watchers.pending.take();
        let mut prev: Option<usize> = None;
        let mut cur = head;
        while let Some(slot) = cur {
            let e = &self.watchers.slab[slot];
            let (deleteme, next) = (e.deleteme, e.next);
            if deleteme {
                match prev {
                    Some(p) => self.watchers.slab[p].next = next,
                    None => head = next,
                }
                let entry = self.watchers.slab.remove(slot);
                debug!("dropping deregistered watch before dispatch");
                entry.notify_removed();
            } else {
                prev = Some(slot);
            }
            cur = next;
        }
        head
    }

    /// Take the handler and payload of a detached node, marking it
    /// executing. Returns `None` (after tearing the entry down) when
    /// removal was requested since the list was detached.
    pub(crate) fn begin_dispatch(&mut self, slot: usize) -> (Option<DispatchJob>, Option<usize>) {
        let e = &mut self.watchers.slab[slot];
        let next = e.next.take();
        e.queued = false;
        if e.deleteme {
            let entry = self.watchers.slab.remove(slot);
            entry.notify_removed();
            return (None, next);
        }
        let job = match &mut e.kind {
            WatchKind::Fd {
                fd,
                event_flags,
                handler,
                ..
            } => DispatchJob::Fd {
                fd: *fd,
                flags: std::mem::take(event_flags),
                handler: handler.take().expect("fd watch already executing"),
            },
            WatchKind::Signal {
                signo,
                info,
                handler,
            } => DispatchJob::Signal {
                signo: *signo,
                info: *info,
                handler: handler.take().expect("signal watch already executing"),
            },
            WatchKind::Child {
                pid,
                status,
                handler,
            } => DispatchJob::Child {
                pid: *pid,
                status: *status,
                handler: handler.take().expect("child watch already executing"),
            },
        };
        (Some(job), next)
    }

    /// Put the handler back and apply its re-arm decision. A removal
    /// requested while the handler ran overrides whatever it returned.
    /// Returns whether the poll must be interrupted for a re-arm to be
    /// noticed.
    pub(crate) fn finish_dispatch(&mut self, slot: usize, job: DispatchJob, rearm: Rearm) -> bool {
        let e = &mut self.watchers.slab[slot];
        let key = WatchKey {
            slot: slot as u32,
            serial: e.serial,
        };
        let rearm = if e.deleteme { Rearm::Remove } else { rearm };
        let mut interrupt = false;
        match (&mut e.kind, job) {
            (
                WatchKind::Fd {
                    fd,
                    watch_flags,
                    handler,
                    ..
                },
                DispatchJob::Fd { handler: h, .. },
            ) => {
                *handler = Some(h);
                let (fd, watch_flags) = (*fd, *watch_flags);
                match rearm {
                    Rearm::Rearm => {
                        self.tables.enable_fd_watch(fd, key, watch_flags);
                        interrupt = T::INTERRUPT_AFTER_FD_ADD;
                    }
                    Rearm::Remove => {
                        if watch_flags.contains(EventFlags::IN | EventFlags::OUT) {
                            self.tables.remove_bidi_fd_watch(fd);
                        } else {
                            self.tables.remove_fd_watch(fd, watch_flags);
                        }
                    }
                    Rearm::Disarm => {}
                }
            }
            (WatchKind::Signal { signo, handler, .. }, DispatchJob::Signal { handler: h, .. }) => {
                *handler = Some(h);
                let signo = *signo;
                match rearm {
                    Rearm::Rearm => self.tables.rearm_signal_watch(signo, key),
                    Rearm::Remove => self.tables.remove_signal_watch(signo),
                    Rearm::Disarm => {}
                }
            }
            (WatchKind::Child { handler, .. }, DispatchJob::Child { handler: h, .. }) => {
                *handler = Some(h);
            }
            _ => unreachable!("dispatch job kind mismatch"),
        }
        if matches!(rearm, Rearm::Remove) {
            let entry = self.watchers.slab.remove(slot);
            entry.notify_removed();
        }
        interrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NullTables;

    impl WatchTables for NullTables {
        const HAS_BIDI_FD_WATCH: bool = true;
        const HAS_SEPARATE_RW_FD_WATCHES: bool = false;
        const INTERRUPT_AFTER_FD_ADD: bool = false;

        fn add_fd_watch(
            &mut self,
            _fd: RawFd,
            _key: WatchKey,
            _flags: EventFlags,
            _enabled: bool,
            _soft_fail: bool,
        ) -> Result<bool> {
            Ok(true)
        }

        fn add_bidi_fd_watch(
            &mut self,
            _fd: RawFd,
            _key: WatchKey,
            _flags: EventFlags,
        ) -> Result<EventFlags> {
            Ok(EventFlags::empty())
        }

        fn remove_fd_watch(&mut self, _fd: RawFd, _flags: EventFlags) {}

        fn remove_bidi_fd_watch(&mut self, _fd: RawFd) {}

        fn enable_fd_watch(&mut self, _fd: RawFd, _key: WatchKey, _flags: EventFlags) {}

        fn disable_fd_watch(&mut self, _fd: RawFd, _flags: EventFlags) {}

        fn add_signal_watch(&mut self, _signo: Signal, _key: WatchKey) -> Result<()> {
            Ok(())
        }

        fn rearm_signal_watch(&mut self, _signo: Signal, _key: WatchKey) {}

        fn remove_signal_watch(&mut self, _signo: Signal) {}
    }

    struct CountingWatcher {
        events: Arc<AtomicUsize>,
        removed: Arc<AtomicUsize>,
        rearm: Rearm,
    }

    impl FdWatcher for CountingWatcher {
        fn on_event(&mut self, _fd: RawFd, _flags: EventFlags) -> Rearm {
            self.events.fetch_add(1, Ordering::SeqCst);
            self.rearm
        }

        fn watch_removed(&mut self) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn watcher(
        rearm: Rearm,
    ) -> (Box<dyn FdWatcher>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let events = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let w = CountingWatcher {
            events: events.clone(),
            removed: removed.clone(),
            rearm,
        };
        (Box::new(w), events, removed)
    }

    #[test]
    fn stale_keys_are_inert() {
        let q = DispatchQueue::new(NullTables);
        let mut inner = q.lock();
        let (w, _events, removed) = watcher(Rearm::Rearm);
        let key = inner.watchers.insert_fd(3, EventFlags::IN, w);
        inner.issue_delete(key);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        // Slot may be reused; the old key must no longer resolve.
        let (w2, ..) = watcher(Rearm::Rearm);
        let key2 = inner.watchers.insert_fd(4, EventFlags::IN, w2);
        assert_eq!(key.slot, key2.slot);
        assert!(inner.watchers.check(key).is_none());
        inner.deliver_fd_event(key, EventFlags::IN);
        assert!(inner.detach_pending().is_none());
    }

    #[test]
    fn deleted_while_queued_never_dispatches() {
        let q = DispatchQueue::new(NullTables);
        let mut inner = q.lock();
        let (w, events, removed) = watcher(Rearm::Rearm);
        let key = inner.watchers.insert_fd(3, EventFlags::IN, w);
        inner.deliver_fd_event(key, EventFlags::IN);
        inner.issue_delete(key);
        assert_eq!(removed.load(Ordering::SeqCst), 0);

        assert!(inner.detach_pending().is_none());
        assert_eq!(events.load(Ordering::SeqCst), 0);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn merge_while_queued_links_once() {
        let q = DispatchQueue::new(NullTables);
        let mut inner = q.lock();
        let (w, events, _removed) = watcher(Rearm::Disarm);
        let key = inner.watchers.insert_fd(3, EventFlags::IN | EventFlags::OUT, w);
        inner.deliver_fd_event(key, EventFlags::IN);
        inner.deliver_fd_event(key, EventFlags::OUT);

        let head = inner.detach_pending();
        let slot = head.expect("one node queued");
        let (job, next) = inner.begin_dispatch(slot);
        assert!(next.is_none());
        let (rearm, job) = job.expect("not deleted").run();
        match &job {
            DispatchJob::Fd { flags, .. } => {
                assert_eq!(*flags, EventFlags::IN | EventFlags::OUT)
            }
            _ => panic!("wrong job kind"),
        }
        inner.finish_dispatch(slot, job, rearm);
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deleteme_during_execution_overrides_rearm() {
        let q = DispatchQueue::new(NullTables);
        let mut inner = q.lock();
        let (w, events, removed) = watcher(Rearm::Rearm);
        let key = inner.watchers.insert_fd(3, EventFlags::IN, w);
        inner.deliver_fd_event(key, EventFlags::IN);

        let slot = inner.detach_pending().unwrap();
        let (job, _) = inner.begin_dispatch(slot);
        // Concurrent deregistration while the handler runs.
        inner.issue_delete(key);
        assert_eq!(removed.load(Ordering::SeqCst), 0);

        let (rearm, job) = job.unwrap().run();
        assert_eq!(rearm, Rearm::Rearm);
        inner.finish_dispatch(slot, job, rearm);
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(inner.watchers.check(key).is_none());
    }
}
