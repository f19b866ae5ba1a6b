//! The stepping/tracing automaton.
//!
//! At most one step or trace is active at a time. The engine holds no OS
//! state itself: the session arms the single step through the adapter, and
//! every `StepCompleted` event is fed back here to decide whether to arm
//! another step or finalize and pause.

use std::fmt;

use log::debug;

use crate::debugger::eval::{
    format_log, CommandDispatcher, ExpressionEval, LazyCondition, LogSink, VarStore,
};
use crate::debugger::trace_record::TraceRecord;
use crate::error::{DebugError, ExpressionError, Result};

/// Opcode bytes treated as a return instruction by step-out.
pub const RET_OPCODES: [u8; 2] = [0xC3, 0xC2];

/// Bound on trace length when the caller does not give one.
pub const DEFAULT_MAX_TRACE_STEPS: u64 = 50_000;

/// Consult the execution-history cache to stop a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordStop {
    /// Ignore the history.
    #[default]
    None,
    /// Stop on the first address never executed before.
    NewByte,
    /// Stop on the first address executed before.
    SeenByte,
}

/// Parameters of a conditional trace.
#[derive(Debug, Clone)]
pub struct TraceSpec {
    pub break_condition: String,
    pub log_condition: String,
    pub log_text: String,
    pub command_condition: String,
    pub command_text: String,
    /// Hard bound; the trace breaks when it is reached. 0 means the default.
    pub max_steps: u64,
    pub record_stop: RecordStop,
    /// Step over calls instead of descending into them.
    pub step_over: bool,
}

impl Default for TraceSpec {
    fn default() -> Self {
        Self {
            break_condition: String::new(),
            log_condition: String::new(),
            log_text: String::new(),
            command_condition: String::new(),
            command_text: String::new(),
            max_steps: DEFAULT_MAX_TRACE_STEPS,
            record_stop: RecordStop::None,
            step_over: false,
        }
    }
}

/// Live state of an active trace; dropped when the trace finalizes.
struct TraceSession {
    break_condition: LazyCondition,
    log_condition: LazyCondition,
    log_text: String,
    command_condition: LazyCondition,
    command_text: String,
    steps: u64,
    max_steps: u64,
    record_stop: RecordStop,
    step_over: bool,
}

impl TraceSession {
    fn new(spec: TraceSpec) -> Self {
        let max_steps = if spec.max_steps == 0 {
            DEFAULT_MAX_TRACE_STEPS
        } else {
            spec.max_steps
        };
        Self {
            break_condition: LazyCondition::new(spec.break_condition),
            log_condition: LazyCondition::new(spec.log_condition),
            log_text: spec.log_text,
            command_condition: LazyCondition::new(spec.command_condition),
            command_text: spec.command_text,
            steps: 0,
            max_steps,
            record_stop: spec.record_stop,
            step_over: spec.step_over,
        }
    }
}

enum StepMode {
    Idle,
    Into { remaining: u32 },
    Over { remaining: u32 },
    Out { watermark: u64 },
    Trace(TraceSession),
}

impl StepMode {
    fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Into { .. } => "step into",
            Self::Over { .. } => "step over",
            Self::Out { .. } => "step out",
            Self::Trace(_) => "trace",
        }
    }
}

/// What the stopped thread looked like when the step completed.
#[derive(Debug, Clone, Copy)]
pub struct StepTick {
    pub tid: u64,
    pub pc: u64,
    pub sp: u64,
    /// First opcode byte at `pc`.
    pub opcode: u8,
}

/// Verdict for one completed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Arm another step (over a call when `over`) and resume.
    Continue { over: bool },
    /// The automaton finalized; pause the debuggee.
    Pause,
}

/// The step/trace state machine.
pub struct StepEngine {
    mode: StepMode,
    /// Advisory cancellation; honored at the next callback.
    abort: bool,
}

impl Default for StepEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StepEngine {
    pub fn new() -> Self {
        Self {
            mode: StepMode::Idle,
            abort: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.mode, StepMode::Idle)
    }

    pub fn mode_name(&self) -> &'static str {
        self.mode.name()
    }

    /// Steps taken by the active trace, 0 outside a trace.
    pub fn trace_steps(&self) -> u64 {
        match &self.mode {
            StepMode::Trace(session) => session.steps,
            _ => 0,
        }
    }

    /// Whether the next armed step should go over calls.
    pub fn steps_over(&self) -> bool {
        match &self.mode {
            StepMode::Over { .. } | StepMode::Out { .. } => true,
            StepMode::Trace(session) => session.step_over,
            _ => false,
        }
    }

    fn enter(&mut self, mode: StepMode) -> Result<()> {
        if !self.is_idle() {
            return Err(DebugError::StepBusy);
        }
        debug!("step engine entering {}", mode.name());
        self.abort = false;
        self.mode = mode;
        Ok(())
    }

    /// Begin stepping into, one instruction at a time, `count` times.
    pub fn request_into(&mut self, count: u32) -> Result<()> {
        self.enter(StepMode::Into {
            remaining: count.max(1),
        })
    }

    /// Begin stepping over calls `count` times.
    pub fn request_over(&mut self, count: u32) -> Result<()> {
        self.enter(StepMode::Over {
            remaining: count.max(1),
        })
    }

    /// Begin stepping until a return at or above the stack `watermark`.
    pub fn request_out(&mut self, watermark: u64) -> Result<()> {
        self.enter(StepMode::Out { watermark })
    }

    /// Begin a conditional trace.
    pub fn request_trace(&mut self, spec: TraceSpec) -> Result<()> {
        self.enter(StepMode::Trace(TraceSession::new(spec)))
    }

    /// Ask the active step or trace to stop at its next callback.
    pub fn cancel(&mut self) {
        if !self.is_idle() {
            debug!("cancelling {}", self.mode.name());
            self.abort = true;
        }
    }

    /// Drop any active step or trace immediately (used when an unrelated
    /// pause takes over).
    pub fn clear(&mut self) {
        self.mode = StepMode::Idle;
        self.abort = false;
    }

    /// Feed one completed step into the automaton.
    ///
    /// Trace conditions are evaluated with the breakpoint fail-safe rules:
    /// a malformed condition forces a break and is reported once through
    /// `report`; the command may override the decision via the variable
    /// store.
    #[allow(clippy::too_many_arguments)]
    pub fn on_step_completed(
        &mut self,
        tick: &StepTick,
        record: &TraceRecord,
        eval: &dyn ExpressionEval,
        vars: &VarStore,
        dispatcher: &dyn CommandDispatcher,
        sink: &dyn LogSink,
        report: &mut dyn FnMut(&ExpressionError),
    ) -> StepOutcome {
        if self.abort {
            debug!("{} aborted at {:#x}", self.mode.name(), tick.pc);
            self.clear();
            return StepOutcome::Pause;
        }
        match &mut self.mode {
            StepMode::Idle => StepOutcome::Pause,
            StepMode::Into { remaining } => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.clear();
                    StepOutcome::Pause
                } else {
                    StepOutcome::Continue { over: false }
                }
            }
            StepMode::Over { remaining } => {
                *remaining -= 1;
                if *remaining == 0 {
                    self.clear();
                    StepOutcome::Pause
                } else {
                    StepOutcome::Continue { over: true }
                }
            }
            StepMode::Out { watermark } => {
                // Finalize only on a return about to execute at or above the
                // stack depth captured when the step-out was requested. One
                // more step carries execution through the ret, back into the
                // caller.
                if RET_OPCODES.contains(&tick.opcode) && tick.sp >= *watermark {
                    self.mode = StepMode::Into { remaining: 1 };
                    StepOutcome::Continue { over: false }
                } else {
                    StepOutcome::Continue { over: true }
                }
            }
            StepMode::Trace(session) => {
                session.steps += 1;

                // History stop conditions look at the count before this
                // step is recorded.
                let prior_hits = record.hit_count(tick.pc);
                let record_hit = match session.record_stop {
                    RecordStop::None => false,
                    RecordStop::NewByte => prior_hits == 0,
                    RecordStop::SeenByte => prior_hits > 0,
                };
                record.record(tick.pc);

                let exhausted = session.steps >= session.max_steps;
                let condition_break =
                    session
                        .break_condition
                        .decide(eval, vars, false, report);
                let mut final_break = condition_break || record_hit || exhausted;

                if session.log_condition.decide(eval, vars, true, report)
                    && !session.log_text.is_empty()
                {
                    sink.write_line(&format_log(
                        &session.log_text,
                        tick.pc,
                        session.steps,
                        "trace",
                    ));
                }

                if session
                    .command_condition
                    .decide(eval, vars, final_break, report)
                    && !session.command_text.is_empty()
                {
                    // The command sees the tentative decision and may
                    // override it.
                    vars.set(crate::debugger::eval::BREAK_DECISION_VAR, u64::from(final_break));
                    if let Err(err) = dispatcher.execute(&session.command_text, vars) {
                        log::warn!("trace command failed: {err:#}");
                    }
                    if let Some(override_break) = vars.take_break_override() {
                        final_break = override_break;
                    }
                }

                if exhausted && !final_break {
                    // The bound is a hard stop even when a command vetoed it.
                    final_break = true;
                }

                if final_break {
                    let steps = session.steps;
                    debug!("trace finalized after {} step(s) at {:#x}", steps, tick.pc);
                    self.clear();
                    StepOutcome::Pause
                } else {
                    let over = session.step_over;
                    StepOutcome::Continue { over }
                }
            }
        }
    }
}

impl fmt::Debug for StepEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepEngine")
            .field("mode", &self.mode.name())
            .field("abort", &self.abort)
            .finish()
    }
}
