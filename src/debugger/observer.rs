//! Fire-and-forget observer callbacks.
//!
//! Observers are notified from the event-loop thread after the core has
//! updated its own state; their return values are ignored and they must not
//! block.

use std::sync::{Arc, Mutex};

use crate::debugger::breakpoint::Breakpoint;
use crate::debugger::modules::Module;
use crate::engine::ExceptionInfo;

/// Callbacks into interested parties (UI layers, scripts).
///
/// All methods default to no-ops so implementors pick only what they need.
#[allow(unused_variables)]
pub trait DebugObserver: Send + Sync {
    fn on_paused(&self, address: u64) {}
    fn on_resumed(&self) {}
    fn on_breakpoint_hit(&self, breakpoint: &Breakpoint) {}
    fn on_module_loaded(&self, module: &Module) {}
    fn on_module_unloaded(&self, module: &Module) {}
    fn on_exception(&self, info: &ExceptionInfo) {}
    fn on_step(&self, address: u64) {}
}

/// The registered observers of a session.
#[derive(Default)]
pub struct ObserverList {
    observers: Mutex<Vec<Arc<dyn DebugObserver>>>,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn DebugObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.lock().unwrap().is_empty()
    }

    /// Run `f` against every observer. The list is copied out first so a
    /// callback may register further observers without deadlocking.
    pub fn notify(&self, f: impl Fn(&dyn DebugObserver)) {
        let observers: Vec<_> = self.observers.lock().unwrap().clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }
}
