use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::debug;

#[derive(Debug, Default)]
struct GateState {
    /// True while the debuggee is paused and command threads hold control.
    locked: bool,
    /// Number of lock transitions, for instrumentation.
    locks: u64,
    /// Number of unlock transitions, for instrumentation.
    unlocks: u64,
}

/// The run/pause gate between the event-loop thread and command threads.
///
/// The gate starts open (debuggee running). The event-loop thread `lock`s it
/// when it decides to pause and then `wait`s; a command thread `unlock`s it
/// to resume. Only command threads may unlock: the event loop never resumes
/// itself, it only blocks until someone else does.
#[derive(Debug, Default)]
pub struct RunGate {
    state: Mutex<GateState>,
    resumed: Condvar,
    changed: Condvar,
}

impl RunGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate: the debuggee is now paused.
    pub fn lock(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.locked {
            state.locked = true;
            state.locks += 1;
            debug!("run gate locked (pause #{})", state.locks);
            self.changed.notify_all();
        }
    }

    /// Open the gate and wake the event-loop thread: the debuggee resumes.
    pub fn unlock(&self) {
        let mut state = self.state.lock().unwrap();
        if state.locked {
            state.locked = false;
            state.unlocks += 1;
            debug!("run gate unlocked (resume #{})", state.unlocks);
            self.resumed.notify_one();
            self.changed.notify_all();
        }
    }

    /// Block the calling thread until the gate is unlocked.
    ///
    /// Called by the event-loop thread after `lock`; returns immediately if
    /// the gate is already open.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap();
        while state.locked {
            state = self.resumed.wait(state).unwrap();
        }
    }

    /// Block until the gate is locked, or the timeout elapses.
    ///
    /// Command threads use this to wait for a pause. Returns true if the
    /// gate was locked when the wait ended.
    pub fn wait_locked_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        while !state.locked {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.changed.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
        true
    }

    /// Whether the gate is currently locked (debuggee paused).
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Lock/unlock transition counters.
    pub fn counters(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.locks, state.unlocks)
    }
}
