//! The debug session: lifecycle, the command-thread API, and the state
//! shared with the event-loop thread.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};

use crate::debugger::breakpoint::{BpKey, BpKind, BpPayload, Breakpoint, BreakpointTable, HwSlots};
use crate::debugger::eval::{
    BasicEvaluator, CommandDispatcher, DefaultSink, ExpressionEval, LogSink, NullDispatcher,
    VarStore,
};
use crate::debugger::events::{self, ExceptionFilter};
use crate::debugger::modules::{module_hash, Location, Module, ModuleParty, ModuleTable};
use crate::debugger::observer::{DebugObserver, ObserverList};
use crate::debugger::step::{StepEngine, TraceSpec};
use crate::debugger::threads::ThreadManager;
use crate::debugger::trace_record::TraceRecord;
use crate::debugger::RunGate;
use crate::engine::{DebugEngine, ExceptionInfo, HwAccess, MemAccess, ProcessInfo};
use crate::error::{DebugError, Result};

/// Whether a module event pauses the debuggee, split by module party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleBreakPolicy {
    pub user: bool,
    pub system: bool,
}

impl ModuleBreakPolicy {
    pub fn never() -> Self {
        Self {
            user: false,
            system: false,
        }
    }

    pub fn applies(&self, party: ModuleParty) -> bool {
        match party {
            ModuleParty::User => self.user,
            ModuleParty::System => self.system,
        }
    }
}

/// Session behavior knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Place a singleshot breakpoint on the image entry point.
    pub break_on_entry: bool,
    /// Place singleshot breakpoints on TLS callbacks.
    pub break_on_tls_callbacks: bool,
    /// Pause when a new debuggee thread starts.
    pub break_on_thread_entry: bool,
    pub break_on_module_load: ModuleBreakPolicy,
    pub break_on_module_unload: ModuleBreakPolicy,
    /// Path prefixes classifying a module as system code.
    pub system_prefixes: Vec<String>,
    /// Poll interval of the event loop.
    pub event_timeout: Duration,
    /// How long detach/stop waits before escalating.
    pub soft_stop_timeout: Duration,
    /// Last-resort wait after a forced terminate.
    pub hard_stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            break_on_entry: true,
            break_on_tls_callbacks: false,
            break_on_thread_entry: false,
            break_on_module_load: ModuleBreakPolicy::never(),
            break_on_module_unload: ModuleBreakPolicy::never(),
            system_prefixes: Vec::new(),
            event_timeout: Duration::from_millis(100),
            soft_stop_timeout: Duration::from_secs(10),
            hard_stop_timeout: Duration::from_secs(100),
        }
    }
}

/// State shared between the command threads and the event-loop thread.
pub(crate) struct Shared {
    pub(crate) engine: Arc<dyn DebugEngine>,
    pub(crate) config: SessionConfig,
    pub(crate) breakpoints: RwLock<BreakpointTable>,
    pub(crate) hw_slots: Mutex<HwSlots>,
    pub(crate) step: Mutex<StepEngine>,
    pub(crate) gate: RunGate,
    pub(crate) modules: RwLock<ModuleTable>,
    pub(crate) threads: Mutex<ThreadManager>,
    pub(crate) trace_record: TraceRecord,
    pub(crate) vars: VarStore,
    pub(crate) eval: Arc<dyn ExpressionEval>,
    pub(crate) dispatcher: Arc<dyn CommandDispatcher>,
    pub(crate) sink: Arc<dyn LogSink>,
    pub(crate) observers: ObserverList,
    pub(crate) filters: RwLock<Vec<ExceptionFilter>>,
    pub(crate) pause_requested: AtomicBool,
    pub(crate) detach_requested: AtomicBool,
    pub(crate) stop_requested: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) pause_address: AtomicU64,
    pub(crate) pid: AtomicU32,
    pub(crate) exit_code: Mutex<Option<i32>>,
    pub(crate) last_exception: Mutex<Option<ExceptionInfo>>,
    /// First-chance exceptions left to auto-skip; reset on every pause.
    pub(crate) skip_first_chance: AtomicU32,
    pub(crate) last_output: Mutex<String>,
    finished: Mutex<bool>,
    finished_cv: Condvar,
}

impl Shared {
    fn new(
        engine: Arc<dyn DebugEngine>,
        config: SessionConfig,
        eval: Arc<dyn ExpressionEval>,
        dispatcher: Arc<dyn CommandDispatcher>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let modules = ModuleTable::new(config.system_prefixes.clone());
        Self {
            engine,
            config,
            breakpoints: RwLock::new(BreakpointTable::new()),
            hw_slots: Mutex::new(HwSlots::new()),
            step: Mutex::new(StepEngine::new()),
            gate: RunGate::new(),
            modules: RwLock::new(modules),
            threads: Mutex::new(ThreadManager::new()),
            trace_record: TraceRecord::new(),
            vars: VarStore::new(),
            eval,
            dispatcher,
            sink,
            observers: ObserverList::new(),
            filters: RwLock::new(vec![ExceptionFilter::catch_all()]),
            pause_requested: AtomicBool::new(false),
            detach_requested: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            pause_address: AtomicU64::new(0),
            pid: AtomicU32::new(0),
            exit_code: Mutex::new(None),
            last_exception: Mutex::new(None),
            skip_first_chance: AtomicU32::new(0),
            last_output: Mutex::new(String::new()),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
        }
    }

    /// Identity of a breakpoint of `kind` at the given absolute address,
    /// relative to the currently loaded modules.
    pub(crate) fn key_at(&self, kind: BpKind, address: u64) -> BpKey {
        BpKey {
            kind,
            location: self.modules.read().unwrap().location_of(address),
        }
    }

    fn owning_module(&self, address: u64) -> String {
        self.modules
            .read()
            .unwrap()
            .find(address)
            .map(|module| module.name().to_string())
            .unwrap_or_default()
    }

    /// Arm a breakpoint in the debuggee. Symbolic kinds need no arming.
    pub(crate) fn arm(&self, bp: &mut Breakpoint) -> Result<()> {
        if bp.is_active() {
            return Ok(());
        }
        let address = bp.address();
        let key = bp.key();
        match bp.payload_mut() {
            BpPayload::Software { original } => {
                let byte = self.engine.set_software_breakpoint(address)?;
                *original = Some(byte);
            }
            BpPayload::Hardware { slot, access, size } => {
                let (access, size) = (*access, *size);
                let index = self.hw_slots.lock().unwrap().allocate(key)?;
                if let Err(err) = self
                    .engine
                    .set_hardware_breakpoint(address, index, access, size)
                {
                    self.hw_slots.lock().unwrap().release(index);
                    return Err(err.into());
                }
                *slot = Some(index);
            }
            BpPayload::Memory { size, access } => {
                self.engine.set_memory_breakpoint(address, *size, *access)?;
            }
            BpPayload::DllLoad { .. } | BpPayload::DllUnload { .. } | BpPayload::Exception { .. } => {
                return Ok(());
            }
        }
        bp.set_active(true);
        Ok(())
    }

    /// Remove the arming of a breakpoint. The saved software byte is kept
    /// so re-arming can verify the memory was not repurposed.
    pub(crate) fn disarm(&self, bp: &mut Breakpoint) -> Result<()> {
        if !bp.is_active() {
            return Ok(());
        }
        let address = bp.address();
        let key = bp.key();
        match bp.payload_mut() {
            BpPayload::Software { original } => {
                if let Some(byte) = *original {
                    self.engine.remove_software_breakpoint(address, byte)?;
                }
            }
            BpPayload::Hardware { slot, .. } => {
                if let Some(index) = slot.take() {
                    self.hw_slots.lock().unwrap().release_key(&key);
                    self.engine.remove_hardware_breakpoint(index)?;
                }
            }
            BpPayload::Memory { .. } => {
                self.engine.remove_memory_breakpoint(address)?;
            }
            BpPayload::DllLoad { .. } | BpPayload::DllUnload { .. } | BpPayload::Exception { .. } => {}
        }
        bp.set_active(false);
        Ok(())
    }

    /// Disarm every active breakpoint; failures are logged and skipped.
    pub(crate) fn disarm_all(&self) {
        let mut table = self.breakpoints.write().unwrap();
        for bp in table.iter_mut() {
            if let Err(err) = self.disarm(bp) {
                warn!(
                    "failed to disarm {} breakpoint at {:#x}: {err}",
                    bp.kind(),
                    bp.address()
                );
            }
        }
    }

    /// Re-resolve and arm the breakpoints owned by a freshly loaded module.
    ///
    /// A software breakpoint whose saved byte no longer matches the loaded
    /// image is disabled instead of patching over foreign code.
    pub(crate) fn rearm_module(&self, module: &Module) {
        let hash = module_hash(module.name());
        let mut table = self.breakpoints.write().unwrap();
        for bp in table.iter_mut() {
            if bp.key().location.module != hash || !bp.is_enabled() || bp.is_active() {
                continue;
            }
            if !bp.kind().is_addressed() {
                continue;
            }
            let address = module.base() + bp.key().location.offset;
            bp.set_address(address);
            if let BpPayload::Software {
                original: Some(byte),
            } = bp.payload()
            {
                let expected = *byte;
                match self.engine.read_memory(address, 1) {
                    Ok(bytes) if bytes.first() == Some(&expected) => {}
                    Ok(_) => {
                        warn!(
                            "breakpoint at {address:#x} disabled: memory no longer matches the saved byte"
                        );
                        bp.set_enabled(false);
                        continue;
                    }
                    Err(err) => {
                        warn!("breakpoint at {address:#x} disabled: {err}");
                        bp.set_enabled(false);
                        continue;
                    }
                }
            }
            if let Err(err) = self.arm(bp) {
                warn!("failed to arm breakpoint at {address:#x}: {err}");
                bp.set_enabled(false);
            }
        }
    }

    /// Disarm the breakpoints owned by a module being unloaded.
    pub(crate) fn disarm_module(&self, module: &Module) {
        let hash = module_hash(module.name());
        let mut table = self.breakpoints.write().unwrap();
        for bp in table.iter_mut() {
            if bp.key().location.module != hash || !bp.is_active() {
                continue;
            }
            if let Err(err) = self.disarm(bp) {
                warn!(
                    "failed to disarm breakpoint at {:#x} on module unload: {err}",
                    bp.address()
                );
            }
        }
    }

    /// Place an internal singleshot breakpoint (entry point, TLS callback).
    pub(crate) fn add_singleshot(&self, address: u64, name: &str) {
        let key = self.key_at(BpKind::Software, address);
        let module = self.owning_module(address);
        let mut bp = Breakpoint::new(key, address, module, BpPayload::Software { original: None });
        bp.set_singleshot(true);
        bp.set_name(name);
        let mut table = self.breakpoints.write().unwrap();
        if table.get(&key).is_some_and(Breakpoint::is_enabled) {
            return;
        }
        if let Err(err) = self.arm(&mut bp) {
            warn!("failed to arm {name} breakpoint at {address:#x}: {err}");
            return;
        }
        let _ = table.add(bp);
    }

    pub(crate) fn mark_finished(&self) {
        *self.finished.lock().unwrap() = true;
        self.finished_cv.notify_all();
    }

    fn reset_finished(&self) {
        *self.finished.lock().unwrap() = false;
    }

    fn wait_finished(&self, timeout: Duration) -> bool {
        let guard = self.finished.lock().unwrap();
        let (guard, _) = self
            .finished_cv
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap();
        *guard
    }
}

/// A debug session against one debuggee.
///
/// All methods are callable from any command thread; the session spawns a
/// dedicated event-loop thread on launch/attach and tears it down on
/// detach/stop or debuggee exit.
pub struct DebugSession {
    shared: Arc<Shared>,
    loop_thread: Option<JoinHandle<()>>,
}

/// Builds a [`DebugSession`] with pluggable collaborators.
pub struct SessionBuilder {
    engine: Arc<dyn DebugEngine>,
    config: SessionConfig,
    eval: Arc<dyn ExpressionEval>,
    dispatcher: Arc<dyn CommandDispatcher>,
    sink: Arc<dyn LogSink>,
}

impl SessionBuilder {
    pub fn new(engine: Arc<dyn DebugEngine>) -> Self {
        Self {
            engine,
            config: SessionConfig::default(),
            eval: Arc::new(BasicEvaluator::new()),
            dispatcher: Arc::new(NullDispatcher),
            sink: Arc::new(DefaultSink),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn evaluator(mut self, eval: Arc<dyn ExpressionEval>) -> Self {
        self.eval = eval;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> DebugSession {
        DebugSession {
            shared: Arc::new(Shared::new(
                self.engine,
                self.config,
                self.eval,
                self.dispatcher,
                self.sink,
            )),
            loop_thread: None,
        }
    }
}

impl DebugSession {
    fn ensure_session(&self) -> Result<()> {
        if self.shared.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DebugError::NoSession)
        }
    }

    fn start(&mut self, info: ProcessInfo) -> anyhow::Result<()> {
        self.shared.pid.store(info.pid, Ordering::SeqCst);
        self.shared.pause_requested.store(false, Ordering::SeqCst);
        self.shared.detach_requested.store(false, Ordering::SeqCst);
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        *self.shared.exit_code.lock().unwrap() = None;
        self.shared.reset_finished();
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("rdbg-event-loop".into())
            .spawn(move || events::run_loop(&shared))
            .context("failed to spawn the event-loop thread")?;
        self.loop_thread = Some(handle);
        Ok(())
    }

    /// Launch a new debuggee under the debugger.
    pub fn launch(&mut self, path: &str, args: &[String]) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.shared.running.load(Ordering::SeqCst),
            "a debug session is already active"
        );
        let info = self
            .shared
            .engine
            .launch(path, args)
            .map_err(DebugError::Engine)
            .with_context(|| format!("failed to launch {path}"))?;
        info!("launched {} (pid {})", path, info.pid);
        self.start(info)
    }

    /// Attach to a running process.
    pub fn attach(&mut self, pid: u32) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.shared.running.load(Ordering::SeqCst),
            "a debug session is already active"
        );
        let info = self
            .shared
            .engine
            .attach(pid)
            .map_err(DebugError::Engine)
            .with_context(|| format!("failed to attach to pid {pid}"))?;
        info!("attached to pid {}", info.pid);
        self.start(info)
    }

    /// Resume a paused debuggee. Only command threads resume; the event
    /// loop blocks until this is called.
    pub fn run(&self) -> anyhow::Result<()> {
        self.ensure_session()?;
        self.shared.gate.unlock();
        Ok(())
    }

    /// Interrupt a running debuggee; the pause is reported like any other
    /// through the gate.
    pub fn pause(&self) -> anyhow::Result<()> {
        self.ensure_session()?;
        if self.shared.gate.is_locked() {
            return Ok(());
        }
        self.shared.pause_requested.store(true, Ordering::SeqCst);
        self.shared
            .engine
            .break_in()
            .map_err(DebugError::Engine)
            .context("failed to interrupt the debuggee")?;
        Ok(())
    }

    /// Wait until the debuggee pauses, or the timeout elapses.
    pub fn wait_until_paused(&self, timeout: Duration) -> bool {
        self.shared.gate.wait_locked_timeout(timeout)
    }

    /// Wait until the session finishes (exit, detach, stop).
    pub fn wait_until_finished(&self, timeout: Duration) -> bool {
        self.shared.wait_finished(timeout)
    }

    fn begin_step(
        &self,
        over: bool,
        request: impl FnOnce(&mut StepEngine, u64) -> Result<()>,
    ) -> anyhow::Result<()> {
        self.ensure_session()?;
        if !self.shared.gate.is_locked() {
            return Err(DebugError::NotPaused.into());
        }
        let tid = self
            .shared
            .threads
            .lock()
            .unwrap()
            .active_tid()
            .ok_or(DebugError::NoSession)?;
        let ctx = self
            .shared
            .engine
            .context(tid)
            .map_err(DebugError::Engine)?;

        let mut step = self.shared.step.lock().unwrap();
        if !step.is_idle() {
            return Err(DebugError::StepBusy.into());
        }
        // Arm first: a failed arm leaves the automaton idle.
        let armed = if over {
            self.shared.engine.step_over_call(tid)
        } else {
            self.shared.engine.single_step(tid)
        };
        armed
            .map_err(DebugError::Engine)
            .context("failed to arm the step")?;
        request(&mut step, ctx.sp)?;
        drop(step);
        self.shared.gate.unlock();
        Ok(())
    }

    /// Step one instruction into calls.
    pub fn step_into(&self) -> anyhow::Result<()> {
        self.step_into_n(1)
    }

    /// Step `count` instructions into calls.
    pub fn step_into_n(&self, count: u32) -> anyhow::Result<()> {
        self.begin_step(false, |step, _| step.request_into(count))
    }

    /// Step one instruction, treating calls as a single step.
    pub fn step_over(&self) -> anyhow::Result<()> {
        self.step_over_n(1)
    }

    /// Step `count` instructions over calls.
    pub fn step_over_n(&self, count: u32) -> anyhow::Result<()> {
        self.begin_step(true, |step, _| step.request_over(count))
    }

    /// Run until the current function returns.
    pub fn step_out(&self) -> anyhow::Result<()> {
        self.begin_step(true, |step, sp| step.request_out(sp))
    }

    /// Begin a conditional trace.
    pub fn trace(&self, spec: TraceSpec) -> anyhow::Result<()> {
        let over = spec.step_over;
        self.begin_step(over, |step, _| step.request_trace(spec))
    }

    /// Ask the active step or trace to stop at its next callback. Advisory:
    /// the pause arrives through the gate as usual.
    pub fn cancel_step(&self) {
        self.shared.step.lock().unwrap().cancel();
    }

    /// Stop debugging but leave the debuggee running. All software
    /// breakpoints are unpatched before this returns.
    pub fn detach(&mut self) -> anyhow::Result<()> {
        self.ensure_session()?;
        info!("detach requested");
        self.shared.detach_requested.store(true, Ordering::SeqCst);
        if self.shared.gate.is_locked() {
            self.shared.gate.unlock();
        } else if let Err(err) = self.shared.engine.break_in() {
            // The poll timeout will still notice the flag.
            warn!("break-in for detach failed: {err}");
        }
        if !self
            .shared
            .wait_finished(self.shared.config.soft_stop_timeout)
        {
            return Err(DebugError::TerminationTimeout(self.shared.config.soft_stop_timeout).into());
        }
        self.join_loop();
        Ok(())
    }

    /// Stop the session, killing the debuggee if needed.
    ///
    /// Escalates: ask the loop to wind down, wait the soft timeout, then
    /// force-terminate and wait the hard timeout. If the loop still does
    /// not exit it is abandoned and session state may be corrupted.
    pub fn stop(&mut self) -> anyhow::Result<()> {
        if !self.shared.running.load(Ordering::SeqCst) {
            self.join_loop();
            return Ok(());
        }
        info!("stop requested");
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if self.shared.gate.is_locked() {
            self.shared.gate.unlock();
        } else if let Err(err) = self.shared.engine.break_in() {
            warn!("break-in for stop failed: {err}");
        }
        let soft = self.shared.config.soft_stop_timeout;
        if self.shared.wait_finished(soft) {
            self.join_loop();
            return Ok(());
        }
        warn!("debuggee did not stop within {soft:?}, terminating it");
        if let Err(err) = self.shared.engine.terminate() {
            warn!("terminate failed: {err}");
        }
        let hard = self.shared.config.hard_stop_timeout;
        if self.shared.wait_finished(hard) {
            self.join_loop();
            return Ok(());
        }
        error!("event loop refused to exit; abandoning it");
        self.loop_thread = None;
        Err(DebugError::TerminationTimeout(soft + hard).into())
    }

    fn join_loop(&mut self) {
        if let Some(handle) = self.loop_thread.take() {
            let _ = handle.join();
        }
    }

    fn insert_armed(&self, mut bp: Breakpoint) -> anyhow::Result<BpKey> {
        self.ensure_session()?;
        let key = bp.key();
        let mut table = self.shared.breakpoints.write().unwrap();
        if table.get(&key).is_some_and(Breakpoint::is_enabled) {
            return Err(DebugError::BreakpointExists.into());
        }
        match self.shared.arm(&mut bp) {
            Ok(()) => {
                table.add(bp)?;
                Ok(key)
            }
            Err(err) => {
                // Keep the record around, disabled, so the caller can fix
                // the cause and re-enable it.
                bp.set_enabled(false);
                let _ = table.add(bp);
                Err(anyhow::Error::new(err).context("failed to arm breakpoint"))
            }
        }
    }

    /// Set a software breakpoint at an absolute address.
    pub fn add_breakpoint(&self, address: u64) -> anyhow::Result<BpKey> {
        let key = self.shared.key_at(BpKind::Software, address);
        let module = self.shared.owning_module(address);
        self.insert_armed(Breakpoint::new(
            key,
            address,
            module,
            BpPayload::Software { original: None },
        ))
    }

    /// Set a hardware breakpoint; fails when all slots are taken.
    pub fn add_hardware_breakpoint(
        &self,
        address: u64,
        access: HwAccess,
        size: u8,
    ) -> anyhow::Result<BpKey> {
        let key = self.shared.key_at(BpKind::Hardware, address);
        let module = self.shared.owning_module(address);
        self.insert_armed(Breakpoint::new(
            key,
            address,
            module,
            BpPayload::Hardware {
                slot: None,
                access,
                size,
            },
        ))
    }

    /// Set a page-protection breakpoint over a range.
    pub fn add_memory_breakpoint(
        &self,
        base: u64,
        size: u64,
        access: MemAccess,
    ) -> anyhow::Result<BpKey> {
        let key = self.shared.key_at(BpKind::Memory, base);
        let module = self.shared.owning_module(base);
        self.insert_armed(Breakpoint::new(
            key,
            base,
            module,
            BpPayload::Memory { size, access },
        ))
    }

    /// Break when a module with this name is loaded.
    pub fn add_dll_load_breakpoint(&self, name: &str) -> anyhow::Result<BpKey> {
        let name = name.to_ascii_lowercase();
        let key = Self::dll_key(BpKind::DllLoad, &name);
        self.insert_armed(Breakpoint::new(
            key,
            0,
            name.clone(),
            BpPayload::DllLoad { name },
        ))
    }

    /// Break when a module with this name is unloaded.
    pub fn add_dll_unload_breakpoint(&self, name: &str) -> anyhow::Result<BpKey> {
        let name = name.to_ascii_lowercase();
        let key = Self::dll_key(BpKind::DllUnload, &name);
        self.insert_armed(Breakpoint::new(
            key,
            0,
            name.clone(),
            BpPayload::DllUnload { name },
        ))
    }

    /// Break when an exception with this code is raised.
    pub fn add_exception_breakpoint(&self, code: u32) -> anyhow::Result<BpKey> {
        let key = Self::exception_key(code);
        self.insert_armed(Breakpoint::new(
            key,
            0,
            "",
            BpPayload::Exception { code },
        ))
    }

    pub fn software_key(&self, address: u64) -> BpKey {
        self.shared.key_at(BpKind::Software, address)
    }

    pub fn hardware_key(&self, address: u64) -> BpKey {
        self.shared.key_at(BpKind::Hardware, address)
    }

    pub fn memory_key(&self, base: u64) -> BpKey {
        self.shared.key_at(BpKind::Memory, base)
    }

    pub fn dll_key(kind: BpKind, name: &str) -> BpKey {
        BpKey {
            kind,
            location: Location {
                module: module_hash(name),
                offset: 0,
            },
        }
    }

    pub fn exception_key(code: u32) -> BpKey {
        BpKey {
            kind: BpKind::Exception,
            location: Location {
                module: 0,
                offset: u64::from(code),
            },
        }
    }

    /// Delete a breakpoint, unpatching it if armed.
    pub fn remove_breakpoint(&self, key: BpKey) -> anyhow::Result<()> {
        let mut table = self.shared.breakpoints.write().unwrap();
        let mut bp = table.remove(&key).ok_or(DebugError::BreakpointMissing)?;
        self.shared
            .disarm(&mut bp)
            .context("breakpoint removed, but disarming it failed")?;
        Ok(())
    }

    pub fn enable_breakpoint(&self, key: BpKey) -> anyhow::Result<()> {
        let mut table = self.shared.breakpoints.write().unwrap();
        let bp = table.get_mut(&key).ok_or(DebugError::BreakpointMissing)?;
        bp.set_enabled(true);
        match self.shared.arm(bp) {
            Ok(()) => Ok(()),
            Err(err) => {
                bp.set_enabled(false);
                Err(anyhow::Error::new(err).context("failed to arm breakpoint"))
            }
        }
    }

    pub fn disable_breakpoint(&self, key: BpKey) -> anyhow::Result<()> {
        let mut table = self.shared.breakpoints.write().unwrap();
        let bp = table.get_mut(&key).ok_or(DebugError::BreakpointMissing)?;
        self.shared.disarm(bp)?;
        bp.set_enabled(false);
        Ok(())
    }

    /// Apply an arbitrary edit to a breakpoint record.
    pub fn configure_breakpoint(
        &self,
        key: BpKey,
        f: impl FnOnce(&mut Breakpoint),
    ) -> anyhow::Result<()> {
        let mut table = self.shared.breakpoints.write().unwrap();
        let bp = table.get_mut(&key).ok_or(DebugError::BreakpointMissing)?;
        f(bp);
        Ok(())
    }

    /// Store break-condition text; it is compiled lazily at the next hit.
    pub fn set_break_condition(&self, key: BpKey, text: &str) -> anyhow::Result<()> {
        self.configure_breakpoint(key, |bp| bp.set_break_condition(text))
    }

    pub fn set_log(&self, key: BpKey, condition: &str, text: &str) -> anyhow::Result<()> {
        self.configure_breakpoint(key, |bp| {
            bp.set_log_condition(condition);
            bp.set_log_text(text);
        })
    }

    pub fn set_command(&self, key: BpKey, condition: &str, text: &str) -> anyhow::Result<()> {
        self.configure_breakpoint(key, |bp| {
            bp.set_command_condition(condition);
            bp.set_command_text(text);
        })
    }

    pub fn set_fast_resume(&self, key: BpKey, fast: bool) -> anyhow::Result<()> {
        self.configure_breakpoint(key, |bp| bp.set_fast_resume(fast))
    }

    pub fn set_singleshot(&self, key: BpKey, singleshot: bool) -> anyhow::Result<()> {
        self.configure_breakpoint(key, |bp| bp.set_singleshot(singleshot))
    }

    pub fn set_breakpoint_name(&self, key: BpKey, name: &str) -> anyhow::Result<()> {
        self.configure_breakpoint(key, |bp| bp.set_name(name))
    }

    pub fn set_breakpoint_log_sink(
        &self,
        key: BpKey,
        sink: Option<Arc<dyn LogSink>>,
    ) -> anyhow::Result<()> {
        self.configure_breakpoint(key, |bp| bp.set_log_sink(sink))
    }

    /// Copies of every breakpoint record.
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.shared.breakpoints.read().unwrap().enum_all(|_| true)
    }

    pub fn breakpoint(&self, key: BpKey) -> Option<Breakpoint> {
        self.shared.breakpoints.read().unwrap().get(&key).cloned()
    }

    /// Replace the ordered exception filter table. The first matching
    /// filter wins; a catch-all is appended if none is present.
    pub fn set_exception_filters(&self, mut filters: Vec<ExceptionFilter>) {
        if !filters.iter().any(ExceptionFilter::is_catch_all) {
            filters.push(ExceptionFilter::catch_all());
        }
        *self.shared.filters.write().unwrap() = filters;
    }

    pub fn push_exception_filter(&self, filter: ExceptionFilter) {
        let mut filters = self.shared.filters.write().unwrap();
        // Keep the catch-all last.
        let at = filters.len().saturating_sub(1);
        filters.insert(at, filter);
    }

    /// Auto-resume the next `count` first-chance exceptions instead of
    /// pausing. Reset on the next pause.
    pub fn set_skip_exceptions(&self, count: u32) {
        self.shared.skip_first_chance.store(count, Ordering::SeqCst);
    }

    pub fn register_observer(&self, observer: Arc<dyn DebugObserver>) {
        self.shared.observers.register(observer);
    }

    pub fn is_active(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.gate.is_locked()
    }

    /// Address the debuggee last paused at.
    pub fn pause_address(&self) -> u64 {
        self.shared.pause_address.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.shared.exit_code.lock().unwrap()
    }

    pub fn last_exception(&self) -> Option<ExceptionInfo> {
        *self.shared.last_exception.lock().unwrap()
    }

    pub fn vars(&self) -> &VarStore {
        &self.shared.vars
    }

    pub fn trace_record(&self) -> &TraceRecord {
        &self.shared.trace_record
    }

    /// (pauses, resumes) seen by the run gate.
    pub fn gate_counters(&self) -> (u64, u64) {
        self.shared.gate.counters()
    }

    pub fn thread_count(&self) -> usize {
        self.shared.threads.lock().unwrap().count()
    }

    pub fn modules(&self) -> Vec<Module> {
        self.shared.modules.read().unwrap().iter().cloned().collect()
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::SeqCst) {
            if let Err(err) = self.stop() {
                warn!("session dropped while active: {err:#}");
            }
        } else {
            self.join_loop();
        }
    }
}
