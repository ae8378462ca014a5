//! Child-watch scenarios, run without the libtest harness: SIGCHLD must
//! be blocked before any thread exists, and forking from a bare main
//! keeps the child trivial.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dynein::{ChildWatch, ChildWatcher, ThreadedLoop};
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, ForkResult, Pid};
use parking_lot::Mutex;

struct ExitRecorder {
    fired: Arc<AtomicUsize>,
    removed: Arc<AtomicUsize>,
    status: Arc<Mutex<Option<(Pid, WaitStatus)>>>,
}

impl ChildWatcher for ExitRecorder {
    fn on_exit(&mut self, pid: Pid, status: WaitStatus) {
        self.fired.fetch_add(1, Ordering::SeqCst);
        *self.status.lock() = Some((pid, status));
    }

    fn watch_removed(&mut self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

fn recorder() -> (
    ExitRecorder,
    Arc<AtomicUsize>,
    Arc<AtomicUsize>,
    Arc<Mutex<Option<(Pid, WaitStatus)>>>,
) {
    let fired = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let status = Arc::new(Mutex::new(None));
    let r = ExitRecorder {
        fired: fired.clone(),
        removed: removed.clone(),
        status: status.clone(),
    };
    (r, fired, removed, status)
}

/// Reserve, fork, register through the reservation, and collect exactly
/// one exit notification carrying the child's status.
fn reserved_registration_after_fork(ev: &ThreadedLoop) {
    let reservation = ChildWatch::reserve(ev).unwrap();
    let (rec, fired, removed, status) = recorder();

    let child = match unsafe { fork() }.unwrap() {
        ForkResult::Child => unsafe { libc::_exit(7) },
        ForkResult::Parent { child } => child,
    };
    let _watch = ChildWatch::register_reserved(ev, reservation, child, rec);

    ev.run_once();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(
        status.lock().take().expect("status recorded"),
        (child, WaitStatus::Exited(child, 7))
    );
}

/// A watch registered only after the child already exited must still
/// fire: registration probes for an early termination.
fn registration_after_exit(ev: &ThreadedLoop) {
    let child = match unsafe { fork() }.unwrap() {
        ForkResult::Child => unsafe { libc::_exit(3) },
        ForkResult::Parent { child } => child,
    };
    // Let the child die before the watch exists; its SIGCHLD predates it.
    thread::sleep(Duration::from_millis(200));

    let (rec, fired, removed, status) = recorder();
    let _watch = ChildWatch::register(ev, child, rec).unwrap();
    ev.run_once();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    assert_eq!(
        status.lock().take().expect("status recorded"),
        (child, WaitStatus::Exited(child, 3))
    );
}

fn main() {
    let ev = ThreadedLoop::new().unwrap();
    reserved_registration_after_fork(&ev);
    registration_after_exit(&ev);
    println!("child: ok");
}
