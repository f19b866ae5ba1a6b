use std::collections::HashMap;
use std::fmt;

use log::{debug, info, warn};

/// Debuggee thread state as the control core tracks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is running
    Running,
    /// Thread is stopped by the debugger
    Paused,
    /// Thread has exited
    Exited(i32),
}

impl ThreadState {
    pub fn is_running(&self) -> bool {
        matches!(self, ThreadState::Running)
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, ThreadState::Exited(_))
    }

    pub fn description(&self) -> String {
        match self {
            ThreadState::Running => "running".to_string(),
            ThreadState::Paused => "paused".to_string(),
            ThreadState::Exited(code) => format!("exited ({code})"),
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A thread of the debuggee.
#[derive(Debug, Clone)]
pub struct DebuggeeThread {
    tid: u64,
    entry: u64,
    is_main: bool,
    state: ThreadState,
}

impl DebuggeeThread {
    pub fn new(tid: u64, entry: u64, is_main: bool) -> Self {
        Self {
            tid,
            entry,
            is_main,
            state: ThreadState::Running,
        }
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    /// Entry point the thread started at.
    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn is_main(&self) -> bool {
        self.is_main
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn set_state(&mut self, state: ThreadState) {
        self.state = state;
    }
}

/// Thread table for the debuggee, maintained by create/exit events.
#[derive(Debug, Default)]
pub struct ThreadManager {
    threads: HashMap<u64, DebuggeeThread>,
    /// Thread the last debug event arrived on.
    active: Option<u64>,
}

impl ThreadManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new thread. The first thread becomes the active one.
    pub fn add(&mut self, thread: DebuggeeThread) {
        let tid = thread.tid();
        info!(
            "thread {} created (entry {:#x}{})",
            tid,
            thread.entry(),
            if thread.is_main() { ", main" } else { "" }
        );
        if self.threads.is_empty() {
            self.active = Some(tid);
        }
        if self.threads.insert(tid, thread).is_some() {
            warn!("thread {tid} was already tracked");
        }
    }

    /// Drop a thread on exit, returning its record.
    pub fn remove(&mut self, tid: u64, exit_code: i32) -> Option<DebuggeeThread> {
        let mut thread = self.threads.remove(&tid);
        if let Some(thread) = thread.as_mut() {
            thread.set_state(ThreadState::Exited(exit_code));
            info!("thread {tid} exited with code {exit_code}");
        } else {
            warn!("exit event for untracked thread {tid}");
        }
        if self.active == Some(tid) {
            self.active = self.threads.keys().next().copied();
        }
        thread
    }

    pub fn get(&self, tid: u64) -> Option<&DebuggeeThread> {
        self.threads.get(&tid)
    }

    pub fn get_mut(&mut self, tid: u64) -> Option<&mut DebuggeeThread> {
        self.threads.get_mut(&tid)
    }

    /// Thread the last debug event arrived on.
    pub fn active_tid(&self) -> Option<u64> {
        self.active
    }

    pub fn set_active(&mut self, tid: u64) {
        if self.threads.contains_key(&tid) {
            if self.active != Some(tid) {
                debug!("active thread is now {tid}");
            }
            self.active = Some(tid);
        } else {
            warn!("cannot activate untracked thread {tid}");
        }
    }

    pub fn set_all_states(&mut self, state: ThreadState) {
        for thread in self.threads.values_mut() {
            if !thread.state().is_exited() {
                thread.set_state(state);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &DebuggeeThread> {
        self.threads.values()
    }

    pub fn count(&self) -> usize {
        self.threads.len()
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_thread_becomes_active() {
        let mut manager = ThreadManager::new();
        manager.add(DebuggeeThread::new(10, 0x401000, true));
        manager.add(DebuggeeThread::new(11, 0x402000, false));
        assert_eq!(manager.active_tid(), Some(10));
        assert_eq!(manager.count(), 2);
    }

    #[test]
    fn test_remove_reassigns_active() {
        let mut manager = ThreadManager::new();
        manager.add(DebuggeeThread::new(10, 0x401000, true));
        manager.add(DebuggeeThread::new(11, 0x402000, false));
        let gone = manager.remove(10, 0).unwrap();
        assert_eq!(gone.state(), ThreadState::Exited(0));
        assert_eq!(manager.active_tid(), Some(11));
    }

    #[test]
    fn test_set_active_ignores_unknown() {
        let mut manager = ThreadManager::new();
        manager.add(DebuggeeThread::new(10, 0x401000, true));
        manager.set_active(99);
        assert_eq!(manager.active_tid(), Some(10));
    }
}
