//! Signal scenarios, run without the libtest harness: watched signals
//! must be blocked before any thread exists, and registration on the
//! main thread before spawning workers guarantees exactly that.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dynein::{EventFlags, FdWatch, Rearm, SigInfo, SignalWatch, SignalWatcher, ThreadedLoop};
use nix::sys::signal::{kill, Signal};
use nix::unistd;
use parking_lot::Mutex;

struct Capture {
    count: Arc<AtomicUsize>,
    removed: Arc<AtomicUsize>,
    last: Arc<Mutex<Option<SigInfo>>>,
}

impl SignalWatcher for Capture {
    fn on_signal(&mut self, _signo: Signal, info: &SigInfo) -> Rearm {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(*info);
        Rearm::Disarm
    }

    fn watch_removed(&mut self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// sigqueue delivery carries the sender's identity and payload through
/// to the handler unchanged.
fn siginfo_fidelity(ev: &Arc<ThreadedLoop>) {
    let count = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(Mutex::new(None));
    let watch = SignalWatch::register(
        ev,
        Signal::SIGUSR1,
        Capture {
            count: count.clone(),
            removed: removed.clone(),
            last: last.clone(),
        },
    )
    .unwrap();

    let value = libc::sigval {
        sival_ptr: 0x2a as *mut libc::c_void,
    };
    let rc = unsafe { libc::sigqueue(unistd::getpid().as_raw(), libc::SIGUSR1, value) };
    assert_eq!(rc, 0);

    ev.run_once();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    let info = last.lock().take().expect("siginfo captured");
    assert_eq!(info.signo(), libc::SIGUSR1);
    assert_eq!(info.sender_pid(), unistd::getpid().as_raw());
    assert_eq!(info.sender_uid(), unistd::getuid().as_raw());
    assert_eq!(info.value_ptr(), 0x2a);

    watch.deregister(ev);
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

/// Deregistering while another thread is blocked polling: the poll is
/// interrupted, the call returns promptly, and a signal sent afterwards
/// invokes nothing.
fn deregister_while_polling(ev: &Arc<ThreadedLoop>) {
    let count = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(Mutex::new(None));
    let watch = SignalWatch::register(
        ev,
        Signal::SIGUSR2,
        Capture {
            count: count.clone(),
            removed: removed.clone(),
            last,
        },
    )
    .unwrap();

    let runner = {
        let ev = ev.clone();
        thread::spawn(move || ev.run())
    };
    thread::sleep(Duration::from_millis(100));

    watch.deregister(ev);
    assert_eq!(removed.load(Ordering::SeqCst), 1);

    // The watch is gone from the backend: this delivery stays pending in
    // the kernel and never reaches a handler.
    kill(unistd::getpid(), Signal::SIGUSR2).unwrap();

    // Bound the negative expectation with an fd canary through the
    // still-running loop.
    let (rd, wr) = unistd::pipe().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_count = fired.clone();
    let _canary = FdWatch::register(
        ev,
        rd.as_raw_fd(),
        EventFlags::IN,
        move |fd: i32, _: EventFlags| {
            let mut buf = [0u8; 4];
            let _ = unistd::read(fd, &mut buf);
            fired_count.fetch_add(1, Ordering::SeqCst);
            Rearm::Remove
        },
    )
    .unwrap();
    unistd::write(&wr, b"c").unwrap();
    while fired.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    assert_eq!(count.load(Ordering::SeqCst), 0);

    ev.stop();
    runner.join().unwrap();
}

fn main() {
    // Single loop for the whole binary; both signals get blocked on this
    // thread by their registrations, before any worker thread exists.
    let ev = Arc::new(ThreadedLoop::new().unwrap());
    siginfo_fidelity(&ev);
    deregister_while_polling(&ev);
    println!("signals: ok");
}
