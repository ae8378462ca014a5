//! Fd watch scenarios on pipes: delivery, disarm, re-enable, re-arm and
//! handler-driven removal.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dynein::{EventFlags, FdWatch, FdWatcher, Rearm, ThreadedLoop};
use nix::unistd;

struct Counting {
    events: Arc<AtomicUsize>,
    removed: Arc<AtomicUsize>,
    rearm: Rearm,
    consume: bool,
}

impl FdWatcher for Counting {
    fn on_event(&mut self, fd: i32, _flags: EventFlags) -> Rearm {
        if self.consume {
            let mut buf = [0u8; 16];
            let _ = unistd::read(fd, &mut buf);
        }
        self.events.fetch_add(1, Ordering::SeqCst);
        self.rearm
    }

    fn watch_removed(&mut self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting(
    rearm: Rearm,
    consume: bool,
) -> (Counting, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let events = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let w = Counting {
        events: events.clone(),
        removed: removed.clone(),
        rearm,
        consume,
    };
    (w, events, removed)
}

fn pipe() -> (OwnedFd, OwnedFd) {
    unistd::pipe().unwrap()
}

/// Fire a throwaway watch so a `run_once` that should deliver nothing
/// else has something to return on.
fn fire_canary(ev: &ThreadedLoop) -> Arc<AtomicUsize> {
    let (rd, wr) = pipe();
    let (w, events, _removed) = counting(Rearm::Remove, true);
    let _watch = FdWatch::register(ev, rd.as_raw_fd(), EventFlags::IN, w).unwrap();
    unistd::write(&wr, b"c").unwrap();
    ev.run_once();
    events
}

#[test]
fn disarm_then_reenable() {
    let ev = ThreadedLoop::new().unwrap();
    let (rd, wr) = pipe();
    let (w, events, _removed) = counting(Rearm::Disarm, false);
    let watch = FdWatch::register(&ev, rd.as_raw_fd(), EventFlags::IN, w).unwrap();

    unistd::write(&wr, b"x").unwrap();
    ev.run_once();
    assert_eq!(events.load(Ordering::SeqCst), 1);

    // Disarmed: a further write must not produce a callback.
    unistd::write(&wr, b"y").unwrap();
    let canary = fire_canary(&ev);
    assert_eq!(canary.load(Ordering::SeqCst), 1);
    assert_eq!(events.load(Ordering::SeqCst), 1);

    // Explicit re-enable delivers again (the pipe still has data).
    watch.enable(&ev);
    ev.run_once();
    assert_eq!(events.load(Ordering::SeqCst), 2);

    watch.deregister(&ev);
}

#[test]
fn rearm_keeps_delivering() {
    let ev = ThreadedLoop::new().unwrap();
    let (rd, wr) = pipe();
    let (w, events, _removed) = counting(Rearm::Rearm, true);
    let watch = FdWatch::register(&ev, rd.as_raw_fd(), EventFlags::IN, w).unwrap();

    unistd::write(&wr, b"x").unwrap();
    ev.run_once();
    assert_eq!(events.load(Ordering::SeqCst), 1);

    unistd::write(&wr, b"y").unwrap();
    ev.run_once();
    assert_eq!(events.load(Ordering::SeqCst), 2);

    watch.deregister(&ev);
}

#[test]
fn handler_removes_itself() {
    let ev = ThreadedLoop::new().unwrap();
    let (rd, wr) = pipe();
    let (w, events, removed) = counting(Rearm::Remove, true);
    let _watch = FdWatch::register(&ev, rd.as_raw_fd(), EventFlags::IN, w).unwrap();

    unistd::write(&wr, b"x").unwrap();
    ev.run_once();
    assert_eq!(events.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 1);

    // No explicit deregister: further writes produce no callback.
    unistd::write(&wr, b"y").unwrap();
    let canary = fire_canary(&ev);
    assert_eq!(canary.load(Ordering::SeqCst), 1);
    assert_eq!(events.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

#[test]
fn deregister_before_dispatch_suppresses_handler() {
    let ev = ThreadedLoop::new().unwrap();
    let (rd, wr) = pipe();
    let (w, events, removed) = counting(Rearm::Rearm, true);
    let watch = FdWatch::register(&ev, rd.as_raw_fd(), EventFlags::IN, w).unwrap();

    // Queue the event without dispatching it, then deregister: the
    // handler must never run, only the removal notification.
    unistd::write(&wr, b"x").unwrap();
    watch.deregister(&ev);
    let canary = fire_canary(&ev);
    assert_eq!(canary.load(Ordering::SeqCst), 1);
    assert_eq!(events.load(Ordering::SeqCst), 0);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}
