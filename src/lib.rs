//! rdbg - a user-mode debugger control core
//!
//! This library provides the control core of an interactive debugger: the
//! debug-event dispatch loop, a breakpoint table with per-kind hit
//! semantics, a stepping/tracing automaton with conditional
//! break/log/command evaluation, and the run/pause gate that coordinates
//! the event-loop thread with command-issuing threads. The OS layer is a
//! trait boundary, so the whole core can be driven against the scripted
//! engine in [`engine::mock`].

pub mod debugger;
pub mod engine;
pub mod error;

/// Re-export key types for easier access in tests and embedders
pub use debugger::breakpoint::{BpKey, BpKind, BpPayload, Breakpoint};
pub use debugger::eval::{
    BasicEvaluator, CommandDispatcher, ExpressionEval, LogSink, MemorySink, VarStore,
};
pub use debugger::events::{BreakOn, ExceptionFilter};
pub use debugger::modules::{Module, ModuleParty};
pub use debugger::observer::DebugObserver;
pub use debugger::session::{DebugSession, ModuleBreakPolicy, SessionBuilder, SessionConfig};
pub use debugger::step::{RecordStop, TraceSpec};
pub use engine::{ContinueStatus, CpuContext, DebugEngine, DebugEvent, HwAccess, MemAccess, TrapKind};
pub use error::{DebugError, EngineError, ExpressionError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the logging system
pub fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("rdbg", level)
        .format_timestamp_secs()
        .init();
}
