//! The debug-event dispatch loop.
//!
//! One dedicated thread owns `wait_event` and the live register context.
//! Every handler either produces a continue status and loops, or closes the
//! run gate and blocks until a command thread reopens it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::debugger::breakpoint::{BpKind, BpPayload, Breakpoint};
use crate::debugger::eval::{format_log, BREAK_DECISION_VAR};
use crate::debugger::session::Shared;
use crate::debugger::step::{StepOutcome, StepTick};
use crate::debugger::threads::{DebuggeeThread, ThreadState};
use crate::engine::{
    ContinueStatus, DebugEvent, ExceptionInfo, TrapKind, EXCEPTION_BREAKPOINT_CODE,
};
use crate::error::{EngineError, ExpressionError};

/// When an exception filter pauses the debuggee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOn {
    /// Pause as soon as the exception is first reported.
    FirstChance,
    /// Pause only after the debuggee's own handlers failed.
    LastChance,
    /// Never pause for this exception.
    Never,
}

/// One entry of the ordered exception filter table.
///
/// Filters match a code range; the first match wins. An unmatched code
/// falls through to the catch-all default: pause on first chance, pass the
/// exception to the debuggee unhandled, report the last chance handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionFilter {
    pub code_min: u32,
    pub code_max: u32,
    pub break_on: BreakOn,
    pub log: bool,
    /// Acknowledge the first chance as handled instead of passing the
    /// exception on to the debuggee.
    pub handled_first_chance: bool,
}

impl ExceptionFilter {
    pub fn range(code_min: u32, code_max: u32, break_on: BreakOn) -> Self {
        Self {
            code_min,
            code_max,
            break_on,
            log: true,
            handled_first_chance: false,
        }
    }

    pub fn single(code: u32, break_on: BreakOn) -> Self {
        Self::range(code, code, break_on)
    }

    pub fn catch_all() -> Self {
        Self::range(0, u32::MAX, BreakOn::FirstChance)
    }

    pub fn matches(&self, code: u32) -> bool {
        (self.code_min..=self.code_max).contains(&code)
    }

    pub fn is_catch_all(&self) -> bool {
        self.code_min == 0 && self.code_max == u32::MAX
    }
}

/// Why the loop is winding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// The debuggee exited (or the engine is unusable).
    Exited,
    /// Stop debugging, leave the debuggee alive.
    Detached,
}

/// What happened while the gate was closed.
enum PostPause {
    Resumed,
    Detach,
    Stop,
}

/// Verdict of one event handler.
enum LoopAction {
    Resume(ContinueStatus),
    Exit(Teardown),
}

/// Close the gate at `address` and block until a command thread resumes,
/// detaches or stops.
fn pause_here(shared: &Shared, address: u64) -> PostPause {
    shared.pause_address.store(address, Ordering::SeqCst);
    // Any pause cancels in-flight stepping and exception skipping.
    shared.step.lock().unwrap().clear();
    shared.skip_first_chance.store(0, Ordering::SeqCst);
    shared
        .threads
        .lock()
        .unwrap()
        .set_all_states(ThreadState::Paused);
    info!("paused at {address:#x}");
    shared.gate.lock();
    shared.observers.notify(|observer| observer.on_paused(address));
    shared.gate.wait();
    shared
        .threads
        .lock()
        .unwrap()
        .set_all_states(ThreadState::Running);
    if shared.detach_requested.load(Ordering::SeqCst) {
        PostPause::Detach
    } else if shared.stop_requested.load(Ordering::SeqCst) {
        PostPause::Stop
    } else {
        shared.observers.notify(|observer| observer.on_resumed());
        PostPause::Resumed
    }
}

fn after_pause(post: PostPause, status: ContinueStatus) -> LoopAction {
    match post {
        // A stop request is honored at the top of the loop.
        PostPause::Resumed | PostPause::Stop => LoopAction::Resume(status),
        PostPause::Detach => LoopAction::Exit(Teardown::Detached),
    }
}

/// Body of the event-loop thread.
pub(crate) fn run_loop(shared: &Arc<Shared>) {
    debug!("event loop started");
    let mut terminate_sent = false;
    let teardown = loop {
        if shared.detach_requested.load(Ordering::SeqCst) {
            break Teardown::Detached;
        }
        if shared.stop_requested.load(Ordering::SeqCst) && !terminate_sent {
            terminate_sent = true;
            if let Err(err) = shared.engine.terminate() {
                error!("terminate failed: {err}");
                break Teardown::Exited;
            }
        }
        match shared.engine.wait_event(shared.config.event_timeout) {
            Ok(event) => match dispatch(shared, event) {
                LoopAction::Resume(status) => {
                    if let Err(err) = shared.engine.continue_event(status) {
                        error!("failed to resume the debuggee: {err}");
                        break Teardown::Exited;
                    }
                }
                LoopAction::Exit(teardown) => {
                    let _ = shared.engine.continue_event(ContinueStatus::Handled);
                    break teardown;
                }
            },
            Err(EngineError::WaitTimeout) => {}
            Err(EngineError::ProcessGone) => break Teardown::Exited,
            Err(err) => {
                error!("wait for debug event failed: {err}");
                break Teardown::Exited;
            }
        }
    };
    shutdown(shared, teardown);
}

fn shutdown(shared: &Shared, teardown: Teardown) {
    shared.disarm_all();
    if teardown == Teardown::Detached {
        if let Err(err) = shared.engine.detach() {
            warn!("detach failed: {err}");
        } else {
            info!("detached from pid {}", shared.pid.load(Ordering::SeqCst));
        }
    }
    shared.threads.lock().unwrap().clear();
    shared.modules.write().unwrap().clear();
    shared.step.lock().unwrap().clear();
    shared.running.store(false, Ordering::SeqCst);
    shared.gate.unlock();
    shared.mark_finished();
    info!("debug session finished");
}

fn dispatch(shared: &Shared, event: DebugEvent) -> LoopAction {
    match event {
        DebugEvent::ProcessCreated {
            pid,
            tid,
            image_base,
            image_size,
            image_path,
            entry_point,
            tls_callbacks,
        } => handle_process_created(
            shared,
            pid,
            tid,
            image_base,
            image_size,
            &image_path,
            entry_point,
            &tls_callbacks,
        ),
        DebugEvent::ProcessExited { exit_code } => {
            info!("process exited with code {exit_code}");
            *shared.exit_code.lock().unwrap() = Some(exit_code);
            LoopAction::Exit(Teardown::Exited)
        }
        DebugEvent::ThreadCreated { tid, entry } => handle_thread_created(shared, tid, entry),
        DebugEvent::ThreadExited { tid, exit_code } => {
            shared.threads.lock().unwrap().remove(tid, exit_code);
            LoopAction::Resume(ContinueStatus::Handled)
        }
        DebugEvent::ModuleLoaded {
            base,
            size,
            path,
            entry_point,
            tls_callbacks,
        } => handle_module_loaded(shared, base, size, &path, entry_point, &tls_callbacks),
        DebugEvent::ModuleUnloaded { base } => handle_module_unloaded(shared, base),
        DebugEvent::OutputString { text } => handle_output_string(shared, &text),
        DebugEvent::Exception { tid, info } => handle_exception(shared, tid, info),
        DebugEvent::Breakpoint { tid, kind, address } => {
            handle_breakpoint_event(shared, tid, kind, address)
        }
        DebugEvent::StepCompleted { tid } => handle_step_completed(shared, tid),
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_process_created(
    shared: &Shared,
    pid: u32,
    tid: u64,
    image_base: u64,
    image_size: u64,
    image_path: &str,
    entry_point: u64,
    tls_callbacks: &[u64],
) -> LoopAction {
    info!("process {pid} started: {image_path} at {image_base:#x}");
    shared
        .threads
        .lock()
        .unwrap()
        .add(DebuggeeThread::new(tid, entry_point, true));
    let module = shared
        .modules
        .write()
        .unwrap()
        .load(image_base, image_size, image_path);
    shared.rearm_module(&module);
    if shared.config.break_on_tls_callbacks {
        for &callback in tls_callbacks {
            shared.add_singleshot(callback, "TLS callback");
        }
    }
    if shared.config.break_on_entry {
        shared.add_singleshot(entry_point, "entry point");
    }
    shared
        .observers
        .notify(|observer| observer.on_module_loaded(&module));
    LoopAction::Resume(ContinueStatus::Handled)
}

fn handle_thread_created(shared: &Shared, tid: u64, entry: u64) -> LoopAction {
    shared
        .threads
        .lock()
        .unwrap()
        .add(DebuggeeThread::new(tid, entry, false));
    if shared.config.break_on_thread_entry {
        shared.threads.lock().unwrap().set_active(tid);
        return after_pause(pause_here(shared, entry), ContinueStatus::Handled);
    }
    LoopAction::Resume(ContinueStatus::Handled)
}

fn handle_module_loaded(
    shared: &Shared,
    base: u64,
    size: u64,
    path: &str,
    _entry_point: u64,
    tls_callbacks: &[u64],
) -> LoopAction {
    let module = shared.modules.write().unwrap().load(base, size, path);
    shared.rearm_module(&module);
    if shared.config.break_on_tls_callbacks {
        for &callback in tls_callbacks {
            shared.add_singleshot(callback, "TLS callback");
        }
    }
    shared
        .observers
        .notify(|observer| observer.on_module_loaded(&module));

    let dll_bp = {
        let table = shared.breakpoints.read().unwrap();
        table
            .enum_all(|bp| {
                bp.is_enabled()
                    && matches!(bp.payload(), BpPayload::DllLoad { name } if name.as_str() == module.name())
            })
            .into_iter()
            .next()
    };
    if let Some(bp) = dll_bp {
        return evaluate_hit(shared, bp, base);
    }
    if shared.config.break_on_module_load.applies(module.party()) {
        return after_pause(pause_here(shared, base), ContinueStatus::Handled);
    }
    LoopAction::Resume(ContinueStatus::Handled)
}

fn handle_module_unloaded(shared: &Shared, base: u64) -> LoopAction {
    let Some(module) = shared.modules.write().unwrap().unload(base) else {
        return LoopAction::Resume(ContinueStatus::Handled);
    };
    shared.disarm_module(&module);
    shared
        .observers
        .notify(|observer| observer.on_module_unloaded(&module));

    let dll_bp = {
        let table = shared.breakpoints.read().unwrap();
        table
            .enum_all(|bp| {
                bp.is_enabled()
                    && matches!(bp.payload(), BpPayload::DllUnload { name } if name.as_str() == module.name())
            })
            .into_iter()
            .next()
    };
    if let Some(bp) = dll_bp {
        return evaluate_hit(shared, bp, base);
    }
    if shared
        .config
        .break_on_module_unload
        .applies(module.party())
    {
        return after_pause(pause_here(shared, base), ContinueStatus::Handled);
    }
    LoopAction::Resume(ContinueStatus::Handled)
}

/// Debuggee debug-output strings are logged once; the OS tends to deliver
/// the same string twice in a row.
fn handle_output_string(shared: &Shared, text: &str) -> LoopAction {
    let trimmed = text.trim_end_matches(['\r', '\n']);
    if !trimmed.is_empty() {
        let mut last = shared.last_output.lock().unwrap();
        if *last != trimmed {
            info!("debuggee: {trimmed}");
            *last = trimmed.to_string();
        }
    }
    LoopAction::Resume(ContinueStatus::Handled)
}

fn handle_exception(shared: &Shared, tid: u64, info: ExceptionInfo) -> LoopAction {
    shared.threads.lock().unwrap().set_active(tid);

    // A trap we injected ourselves to get control of a running debuggee.
    if info.code == EXCEPTION_BREAKPOINT_CODE {
        if shared.detach_requested.load(Ordering::SeqCst) {
            return LoopAction::Exit(Teardown::Detached);
        }
        if shared.stop_requested.load(Ordering::SeqCst) {
            return LoopAction::Resume(ContinueStatus::Handled);
        }
        if shared.pause_requested.swap(false, Ordering::SeqCst) {
            debug!("pause request honored at {:#x}", info.address);
            return after_pause(pause_here(shared, info.address), ContinueStatus::Handled);
        }
    }

    *shared.last_exception.lock().unwrap() = Some(info);
    shared.observers.notify(|observer| observer.on_exception(&info));

    // Exception breakpoints take precedence over the filter table.
    let exception_bp = {
        let table = shared.breakpoints.read().unwrap();
        table
            .enum_all(|bp| {
                bp.is_enabled()
                    && matches!(bp.payload(), BpPayload::Exception { code } if *code == info.code)
            })
            .into_iter()
            .next()
    };
    if let Some(bp) = exception_bp {
        return evaluate_hit(shared, bp, info.address);
    }

    let filter = {
        let filters = shared.filters.read().unwrap();
        filters
            .iter()
            .find(|filter| filter.matches(info.code))
            .cloned()
            .unwrap_or_else(ExceptionFilter::catch_all)
    };
    let chance = if info.first_chance { "first" } else { "last" };
    if filter.log {
        info!(
            "{chance}-chance exception {:#x} at {:#x}",
            info.code, info.address
        );
    }
    let status = if info.first_chance {
        if filter.handled_first_chance {
            ContinueStatus::Handled
        } else {
            ContinueStatus::NotHandled
        }
    } else {
        ContinueStatus::Handled
    };
    let mut should_break = match filter.break_on {
        BreakOn::FirstChance => true,
        BreakOn::LastChance => !info.first_chance,
        BreakOn::Never => false,
    };
    if should_break && info.first_chance {
        let skip = shared.skip_first_chance.load(Ordering::SeqCst);
        if skip > 0 {
            shared.skip_first_chance.store(skip - 1, Ordering::SeqCst);
            debug!("skipping first-chance exception ({} left)", skip - 1);
            should_break = false;
        }
    }
    if should_break {
        return after_pause(pause_here(shared, info.address), status);
    }
    LoopAction::Resume(status)
}

fn handle_breakpoint_event(
    shared: &Shared,
    tid: u64,
    kind: TrapKind,
    address: u64,
) -> LoopAction {
    shared.threads.lock().unwrap().set_active(tid);
    let bp_kind = match kind {
        TrapKind::Software => BpKind::Software,
        TrapKind::Hardware => BpKind::Hardware,
        TrapKind::Memory => BpKind::Memory,
    };
    let record = {
        let table = shared.breakpoints.read().unwrap();
        match bp_kind {
            // A memory trap can land anywhere inside the watched range.
            BpKind::Memory => table
                .enum_all(|bp| {
                    bp.is_enabled()
                        && bp.kind() == BpKind::Memory
                        && matches!(
                            bp.payload(),
                            BpPayload::Memory { size, .. }
                                if address >= bp.address() && address < bp.address() + size
                        )
                })
                .into_iter()
                .next(),
            _ => table.find_at(bp_kind, address).cloned(),
        }
    };
    match record {
        Some(bp) => evaluate_hit(shared, bp, address),
        None => {
            // Never swallow an unexplained trap: report and hand control
            // to the user.
            warn!("debug event for untracked {bp_kind} breakpoint at {address:#x}");
            after_pause(pause_here(shared, address), ContinueStatus::Handled)
        }
    }
}

/// The unified hit pipeline, shared by every breakpoint kind.
///
/// Decision order, with fail-safe defaults: empty break/log conditions are
/// true, an empty command condition follows the break decision, a malformed
/// condition forces a break and is reported once. When the break decision
/// is false and the record asks for fast resume, nothing else runs. The
/// gate is only touched when the final decision is to break.
fn evaluate_hit(shared: &Shared, bp: Breakpoint, address: u64) -> LoopAction {
    let hits = bp.hit();
    let sink = Arc::clone(&shared.sink);
    let mut report = move |err: &ExpressionError| {
        warn!("{err}");
        sink.write_line(&format!("expression error: {err}"));
    };

    let break_decision =
        bp.break_condition()
            .decide(&*shared.eval, &shared.vars, true, &mut report);
    if !break_decision && bp.is_fast_resume() {
        return LoopAction::Resume(ContinueStatus::Handled);
    }

    let log_decision = bp
        .log_condition()
        .decide(&*shared.eval, &shared.vars, true, &mut report);
    let command_decision =
        bp.command_condition()
            .decide(&*shared.eval, &shared.vars, break_decision, &mut report);

    if log_decision && !bp.log_text().is_empty() {
        let line = format_log(bp.log_text(), address, hits, bp.name());
        match bp.log_sink() {
            Some(sink) => sink.write_line(&line),
            None => shared.sink.write_line(&line),
        }
    }

    let mut final_break = break_decision;
    if command_decision && !bp.command_text().is_empty() {
        // The command sees the tentative decision and may override it.
        shared.vars.set(BREAK_DECISION_VAR, u64::from(final_break));
        if let Err(err) = shared.dispatcher.execute(bp.command_text(), &shared.vars) {
            warn!("breakpoint command failed: {err:#}");
        }
        if let Some(override_break) = shared.vars.take_break_override() {
            final_break = override_break;
        }
    }

    if !final_break {
        return LoopAction::Resume(ContinueStatus::Handled);
    }

    if bp.is_singleshot() {
        let mut table = shared.breakpoints.write().unwrap();
        if let Some(mut record) = table.remove(&bp.key()) {
            if let Err(err) = shared.disarm(&mut record) {
                warn!("failed to remove singleshot breakpoint: {err}");
            }
        }
    }
    if !bp.is_silent() {
        shared.sink.write_line(&bp.describe());
    }
    shared
        .observers
        .notify(|observer| observer.on_breakpoint_hit(&bp));
    after_pause(pause_here(shared, address), ContinueStatus::Handled)
}

fn handle_step_completed(shared: &Shared, tid: u64) -> LoopAction {
    shared.threads.lock().unwrap().set_active(tid);
    let ctx = match shared.engine.context(tid) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("cannot read the stepped thread's context: {err}");
            return after_pause(pause_here(shared, 0), ContinueStatus::Handled);
        }
    };
    let opcode = shared
        .engine
        .read_memory(ctx.pc, 1)
        .ok()
        .and_then(|bytes| bytes.first().copied())
        .unwrap_or(0);
    let tick = StepTick {
        tid,
        pc: ctx.pc,
        sp: ctx.sp,
        opcode,
    };
    shared.observers.notify(|observer| observer.on_step(ctx.pc));

    let sink = Arc::clone(&shared.sink);
    let mut report = move |err: &ExpressionError| {
        warn!("{err}");
        sink.write_line(&format!("expression error: {err}"));
    };
    let outcome = shared.step.lock().unwrap().on_step_completed(
        &tick,
        &shared.trace_record,
        &*shared.eval,
        &shared.vars,
        &*shared.dispatcher,
        &*shared.sink,
        &mut report,
    );
    match outcome {
        StepOutcome::Continue { over } => {
            let armed = if over {
                shared.engine.step_over_call(tid)
            } else {
                shared.engine.single_step(tid)
            };
            if let Err(err) = armed {
                error!("failed to arm the next step: {err}");
                shared.step.lock().unwrap().clear();
                return after_pause(pause_here(shared, ctx.pc), ContinueStatus::Handled);
            }
            LoopAction::Resume(ContinueStatus::Handled)
        }
        StepOutcome::Pause => after_pause(pause_here(shared, ctx.pc), ContinueStatus::Handled),
    }
}
