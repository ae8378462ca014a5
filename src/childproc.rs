//! Child-process watches.
//!
//! Child terminations arrive as SIGCHLD; an internal signal watch feeds a
//! non-blocking reap loop that matches exited pids against the registered
//! watches and queues each of them exactly once. Reservations preallocate
//! the table capacity a registration needs, so that registering a watch
//! for a freshly forked child cannot fail.
//!
//! Once any child watch has been registered, the loop owns SIGCHLD and
//! reaps every terminated child of the process; terminations nobody
//! watched are logged and discarded.

use std::collections::HashMap;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::backend::WatchTables;
use crate::dispatch::DispatchInner;

pub(crate) struct ChildWatches {
    pids: HashMap<Pid, usize>,
    reserved: usize,
    pub(crate) sigchld_armed: bool,
}

impl ChildWatches {
    pub(crate) fn new() -> Self {
        ChildWatches {
            pids: HashMap::new(),
            reserved: 0,
            sigchld_armed: false,
        }
    }

    /// Grow the pid table ahead of a post-fork registration.
    pub(crate) fn reserve(&mut self) -> usize {
        self.reserved += 1;
        self.pids.reserve(self.reserved);
        self.reserved
    }

    pub(crate) fn insert(&mut self, pid: Pid, slot: usize) {
        self.pids.insert(pid, slot);
    }

    pub(crate) fn insert_reserved(&mut self, pid: Pid, slot: usize) {
        self.reserved = self.reserved.saturating_sub(1);
        self.pids.insert(pid, slot);
    }

    pub(crate) fn forget(&mut self, pid: Pid) {
        self.pids.remove(&pid);
    }
}

impl<T: WatchTables> DispatchInner<T> {
    /// Reap every terminated child and queue the watchers that were
    /// waiting for them. Driven by the internal SIGCHLD watch.
    pub(crate) fn reap_children(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(status @ WaitStatus::Exited(pid, _))
                | Ok(status @ WaitStatus::Signaled(pid, _, _)) => {
                    self.child_terminated(pid, status)
                }
                Ok(WaitStatus::StillAlive) => break,
                Err(Errno::ECHILD) => break, // No more children
                Err(e) => {
                    warn!("waitpid failed while reaping: {}", e);
                    break;
                }
                _ => {}
            }
        }
    }

    /// Check whether `pid` already terminated. Run at registration time:
    /// a child that exited before its watch was added would otherwise
    /// never be reported, since its SIGCHLD predates the watch.
    pub(crate) fn probe_child(&mut self, pid: Pid) {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status @ WaitStatus::Exited(pid, _))
            | Ok(status @ WaitStatus::Signaled(pid, _, _)) => {
                self.child_terminated(pid, status)
            }
            Ok(_) => {}
            Err(Errno::ECHILD) => {}
            Err(e) => warn!("waitpid probe for {} failed: {}", pid, e),
        }
    }

    fn child_terminated(&mut self, pid: Pid, status: WaitStatus) {
        match self.children.pids.remove(&pid) {
            Some(slot) => self.deliver_child_status(slot, status),
            None => debug!("reaped unwatched child {}", pid),
        }
    }
}
