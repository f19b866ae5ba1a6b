use std::time::Duration;

use thiserror::Error;

/// Failures reported by the underlying debug engine (OS layer).
///
/// These are surfaced synchronously to the caller; the affected request is
/// left inert rather than silently retried.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The debuggee could not be launched.
    #[error("failed to launch {path}: {reason}")]
    Launch { path: String, reason: String },
    /// Attaching to an existing process failed.
    #[error("failed to attach to pid {pid}: {reason}")]
    Attach { pid: u32, reason: String },
    /// A primitive engine call failed.
    #[error("{op} failed: {reason}")]
    Os { op: &'static str, reason: String },
    /// Memory at the given address is not accessible.
    #[error("invalid memory access at {address:#x}")]
    BadAddress { address: u64 },
    /// No debug event arrived within the wait interval.
    #[error("timed out waiting for a debug event")]
    WaitTimeout,
    /// The debuggee process is gone.
    #[error("debuggee process has exited")]
    ProcessGone,
}

impl EngineError {
    pub fn os(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Os {
            op,
            reason: reason.into(),
        }
    }
}

/// A condition expression could not be compiled or evaluated.
///
/// Expression errors are recovered locally: the hit pipeline defaults the
/// break decision to true and reports the error once per condition text.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed expression {text:?}: {reason}")]
pub struct ExpressionError {
    pub text: String,
    pub reason: String,
}

impl ExpressionError {
    pub fn new(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reason: reason.into(),
        }
    }
}

/// Errors produced by the debugger control core.
#[derive(Debug, Error)]
pub enum DebugError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// A debug event arrived for a key the breakpoint table does not track.
    /// Always surfaces as a pause with a diagnostic, never swallowed.
    #[error("debug event for untracked {kind} breakpoint at {address:#x}")]
    StaleEvent { kind: &'static str, address: u64 },

    /// An enabled breakpoint with the same key already exists.
    #[error("an enabled breakpoint already exists at this location")]
    BreakpointExists,

    /// No breakpoint was found for the given key.
    #[error("no breakpoint at this location")]
    BreakpointMissing,

    /// All hardware debug-register slots are occupied.
    #[error("all hardware breakpoint slots are in use")]
    NoFreeSlot,

    /// A step or trace is already active; cancel it first.
    #[error("a step or trace is already in progress")]
    StepBusy,

    /// The request requires a paused debuggee.
    #[error("debuggee is running; pause it first")]
    NotPaused,

    /// The debuggee refused to stop within the escalation window. The
    /// event-loop thread is abandoned and session state may be corrupted.
    #[error("debuggee did not stop within {0:?}; state may be corrupted")]
    TerminationTimeout(Duration),

    /// No debuggee is attached.
    #[error("no active debug session")]
    NoSession,
}

pub type Result<T, E = DebugError> = std::result::Result<T, E>;
