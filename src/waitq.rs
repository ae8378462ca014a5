//! Wait queues and the attention lock.
//!
//! Only one thread may poll the kernel mechanism at a time, and a thread
//! that wants to change watcher state must be able to preempt a thread
//! that is blocked polling. A plain mutex gives neither property: there is
//! no fairness guarantee, and a mutator could starve behind a tight
//! poll-release-poll cycle. Instead we keep two FIFO queues of suspended
//! threads under one small mutex:
//!
//! - `attn`, the high-priority queue: whichever node is at its head holds
//!   the lock.
//! - `wait`, where threads that merely want to poll are parked whenever
//!   `attn` is occupied. A poll waiter only gains the lock by being
//!   migrated to an empty `attn`.
//!
//! A mutator enqueues on `attn` directly and interrupts any in-progress
//! poll; the poller returns, releases, and finds the mutator ahead of it.
//! The mutex protects nothing but the queues themselves, so it is never
//! held across a poll or a handler call.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// One parked thread. The node type decides how (and whether) suspension
/// actually blocks, so the same queue logic serves both threading modes.
pub trait WaitNode: Default + Send + Sync + Sized + 'static {
    fn wait(&self, guard: &mut MutexGuard<'_, Queues<Self>>);
    fn signal(&self);
}

/// Node used by [`MultiThread`] loops: a condition variable per waiter.
#[derive(Default)]
pub struct CondvarNode {
    cond: Condvar,
}

impl WaitNode for CondvarNode {
    fn wait(&self, guard: &mut MutexGuard<'_, Queues<Self>>) {
        self.cond.wait(guard);
    }

    fn signal(&self) {
        self.cond.notify_one();
    }
}

/// Node used by [`SingleThread`] loops. With a single thread no acquire
/// can ever be contended, so suspension never happens and both operations
/// degenerate to no-ops.
#[derive(Default)]
pub struct NoopNode;

impl WaitNode for NoopNode {
    fn wait(&self, _guard: &mut MutexGuard<'_, Queues<Self>>) {}

    fn signal(&self) {}
}

/// Threading mode of an event loop: selects the wait-node implementation.
pub trait Threading: Send + Sync + 'static {
    type Node: WaitNode;
}

/// Any number of threads may drive the loop concurrently.
pub struct MultiThread;

impl Threading for MultiThread {
    type Node = CondvarNode;
}

/// The loop is driven from exactly one thread; suspension machinery is
/// compiled out.
pub struct SingleThread;

impl Threading for SingleThread {
    type Node = NoopNode;
}

/// FIFO of parked threads.
struct WaitQueue<N> {
    nodes: VecDeque<Arc<N>>,
}

impl<N> WaitQueue<N> {
    fn new() -> Self {
        WaitQueue {
            nodes: VecDeque::new(),
        }
    }

    fn queue(&mut self, node: &Arc<N>) {
        self.nodes.push_back(node.clone());
    }

    fn unqueue(&mut self) -> Option<Arc<N>> {
        self.nodes.pop_front()
    }

    fn head(&self) -> Option<&Arc<N>> {
        self.nodes.front()
    }

    fn is_head(&self, node: &Arc<N>) -> bool {
        self.head().is_some_and(|h| Arc::ptr_eq(h, node))
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// The two queues protected by the attention-lock mutex.
pub struct Queues<N> {
    attn: WaitQueue<N>,
    wait: WaitQueue<N>,
}

pub struct AttentionLock<N: WaitNode> {
    queues: Mutex<Queues<N>>,
}

impl<N: WaitNode> AttentionLock<N> {
    pub fn new() -> Self {
        AttentionLock {
            queues: Mutex::new(Queues {
                attn: WaitQueue::new(),
                wait: WaitQueue::new(),
            }),
        }
    }

    /// Acquire with mutator priority. If another node currently holds the
    /// lock, `interrupt_poll` is invoked so that a poller blocked in the
    /// kernel returns and releases promptly.
    pub fn acquire_attention(&self, node: &Arc<N>, interrupt_poll: impl FnOnce()) {
        let mut q = self.queues.lock();
        q.attn.queue(node);
        if !q.attn.is_head(node) {
            interrupt_poll();
            while !q.attn.is_head(node) {
                node.wait(&mut q);
            }
        }
    }

    /// Acquire with poller priority: jump straight onto an empty `attn`,
    /// otherwise park on `wait` until migrated.
    pub fn acquire_poll(&self, node: &Arc<N>) {
        let mut q = self.queues.lock();
        if q.attn.is_empty() {
            q.attn.queue(node);
        } else {
            q.wait.queue(node);
        }
        while !q.attn.is_head(node) {
            node.wait(&mut q);
        }
    }

    /// Release the lock held by `node` and hand off: the next `attn` node
    /// if there is one, else the head of `wait` migrated across.
    pub fn release(&self, node: &Arc<N>) {
        let mut q = self.queues.lock();
        let head = q.attn.unqueue();
        debug_assert!(head.is_some_and(|h| Arc::ptr_eq(&h, node)));
        match q.attn.head().cloned() {
            Some(next) => next.signal(),
            None => {
                if let Some(waiter) = q.wait.unqueue() {
                    q.attn.queue(&waiter);
                    waiter.signal();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn poll_fast_path_when_uncontended() {
        let lock = AttentionLock::<NoopNode>::new();
        let node = Arc::new(NoopNode);
        lock.acquire_poll(&node);
        lock.release(&node);
        // Reacquire to show release left the queues consistent.
        lock.acquire_attention(&node, || panic!("no holder to interrupt"));
        lock.release(&node);
    }

    #[test]
    fn attention_preempts_parked_pollers() {
        let lock = Arc::new(AttentionLock::<CondvarNode>::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let interrupted = Arc::new(AtomicUsize::new(0));

        let holder = Arc::new(CondvarNode::default());
        lock.acquire_poll(&holder);

        // A second poller parks on the wait queue, then a mutator queues
        // on attn. When the holder releases, the mutator must win.
        let mut threads = Vec::new();
        {
            let (lock, order) = (lock.clone(), order.clone());
            threads.push(thread::spawn(move || {
                let node = Arc::new(CondvarNode::default());
                lock.acquire_poll(&node);
                order.lock().push("poller");
                lock.release(&node);
            }));
        }
        thread::sleep(Duration::from_millis(50));
        {
            let (lock, order, interrupted) = (lock.clone(), order.clone(), interrupted.clone());
            threads.push(thread::spawn(move || {
                let node = Arc::new(CondvarNode::default());
                lock.acquire_attention(&node, || {
                    interrupted.fetch_add(1, Ordering::SeqCst);
                });
                order.lock().push("mutator");
                lock.release(&node);
            }));
        }
        // The interrupt callback fires once the mutator is queued behind
        // the holder; only then is it safe to release.
        while interrupted.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }

        lock.release(&holder);
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(*order.lock(), vec!["mutator", "poller"]);
        assert_eq!(interrupted.load(Ordering::SeqCst), 1);
    }
}
