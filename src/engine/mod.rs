//! The debug engine adapter: the boundary between the control core and the
//! OS debugging primitives.
//!
//! The core never talks to the OS directly. Everything it needs — launching,
//! waiting for debug events, register context, memory, breakpoint arming and
//! stepping — goes through the [`DebugEngine`] trait, so the whole control
//! core can be driven against [`mock::MockEngine`] in tests.

pub mod mock;

use std::time::Duration;

use crate::error::EngineError;

/// Page granularity used to normalize memory-breakpoint hits.
pub const PAGE_SIZE: u64 = 0x1000;

/// Number of hardware debug-register slots.
pub const HW_SLOT_COUNT: usize = 4;

/// Exception code delivered for a debug trap (used by `break_in`).
pub const EXCEPTION_BREAKPOINT_CODE: u32 = 0x8000_0003;

/// Access type for a hardware breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwAccess {
    Execute,
    Write,
    ReadWrite,
}

impl HwAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Write => "write",
            Self::ReadWrite => "read/write",
        }
    }
}

/// Access type for a page-protection memory breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemAccess {
    Read,
    Write,
    Execute,
    ReadWriteExecute,
}

impl MemAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
            Self::ReadWriteExecute => "read/write/execute",
        }
    }
}

/// Which arming mechanism raised a breakpoint trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Software,
    Hardware,
    Memory,
}

/// Minimal register context the control core manipulates.
///
/// Only the event-loop thread reads or writes the live context of a stopped
/// debuggee; command threads see copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuContext {
    /// Instruction pointer.
    pub pc: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Frame pointer.
    pub fp: u64,
}

/// How the pending debug event is acknowledged to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinueStatus {
    /// The exception is considered handled by the debugger.
    Handled,
    /// The exception is passed on to the debuggee's own handlers.
    NotHandled,
}

/// An exception record as delivered by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub code: u32,
    pub address: u64,
    /// Offered to the debugger before (true) or after (false) the debuggee's
    /// own handler ran.
    pub first_chance: bool,
}

/// A debug event delivered by `wait_event`.
///
/// The engine is responsible for classifying raw OS exceptions into
/// `Breakpoint` / `StepCompleted` events for traps it armed itself;
/// everything else arrives as `Exception`.
#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    ProcessCreated {
        pid: u32,
        tid: u64,
        image_base: u64,
        image_size: u64,
        image_path: String,
        entry_point: u64,
        tls_callbacks: Vec<u64>,
    },
    ProcessExited {
        exit_code: i32,
    },
    ThreadCreated {
        tid: u64,
        entry: u64,
    },
    ThreadExited {
        tid: u64,
        exit_code: i32,
    },
    ModuleLoaded {
        base: u64,
        size: u64,
        path: String,
        entry_point: u64,
        tls_callbacks: Vec<u64>,
    },
    ModuleUnloaded {
        base: u64,
    },
    OutputString {
        text: String,
    },
    Exception {
        tid: u64,
        info: ExceptionInfo,
    },
    Breakpoint {
        tid: u64,
        kind: TrapKind,
        address: u64,
    },
    StepCompleted {
        tid: u64,
    },
}

/// Identity of a freshly launched or attached debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub main_tid: u64,
}

/// The OS debugging primitives consumed by the control core.
///
/// All methods take `&self`; implementations use interior mutability and must
/// be safe to call from both the event-loop thread and command threads.
pub trait DebugEngine: Send + Sync {
    fn launch(&self, path: &str, args: &[String]) -> Result<ProcessInfo, EngineError>;
    fn attach(&self, pid: u32) -> Result<ProcessInfo, EngineError>;
    /// Stop debugging without killing the debuggee.
    fn detach(&self) -> Result<(), EngineError>;
    /// Kill the debuggee.
    fn terminate(&self) -> Result<(), EngineError>;

    /// Block for the next debug event. Only the event-loop thread calls this.
    fn wait_event(&self, timeout: Duration) -> Result<DebugEvent, EngineError>;
    /// Acknowledge the pending event and resume the debuggee.
    fn continue_event(&self, status: ContinueStatus) -> Result<(), EngineError>;
    /// Inject a debug trap into the running debuggee so the event loop gets
    /// a chance to pause or detach.
    fn break_in(&self) -> Result<(), EngineError>;

    fn context(&self, tid: u64) -> Result<CpuContext, EngineError>;
    fn set_context(&self, tid: u64, ctx: &CpuContext) -> Result<(), EngineError>;

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, EngineError>;
    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), EngineError>;

    /// Patch a trap instruction at `address`, returning the original byte.
    fn set_software_breakpoint(&self, address: u64) -> Result<u8, EngineError>;
    /// Restore the original byte previously returned by the set call.
    fn remove_software_breakpoint(&self, address: u64, original: u8) -> Result<(), EngineError>;

    fn set_hardware_breakpoint(
        &self,
        address: u64,
        slot: u8,
        access: HwAccess,
        size: u8,
    ) -> Result<(), EngineError>;
    fn remove_hardware_breakpoint(&self, slot: u8) -> Result<(), EngineError>;

    fn set_memory_breakpoint(
        &self,
        base: u64,
        size: u64,
        access: MemAccess,
    ) -> Result<(), EngineError>;
    fn remove_memory_breakpoint(&self, base: u64) -> Result<(), EngineError>;

    /// Arm a single-instruction step for `tid`, reported as `StepCompleted`.
    fn single_step(&self, tid: u64) -> Result<(), EngineError>;
    /// Arm a step that treats a call instruction as one step.
    fn step_over_call(&self, tid: u64) -> Result<(), EngineError>;
}

/// Page base containing `address`.
pub fn page_base(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}
