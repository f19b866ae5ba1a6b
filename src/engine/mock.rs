//! A scripted, in-memory debug engine.
//!
//! The mock models a debuggee with a sparse byte-addressable memory and a
//! trivial CPU: every instruction is 4 bytes, a configured call site jumps
//! into its callee on step-into, and a `0xC3` byte returns to the most
//! recent call site. Debug events are fed in by tests with [`MockEngine::push_event`]
//! and stepping generates `StepCompleted` events when the pending step is
//! executed on `continue_event`, mirroring how a trap-flag step is reported
//! by a real engine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::EngineError;

use super::{
    ContinueStatus, CpuContext, DebugEngine, DebugEvent, ExceptionInfo, HwAccess, MemAccess,
    ProcessInfo, EXCEPTION_BREAKPOINT_CODE, HW_SLOT_COUNT,
};

/// Byte patched in for a software breakpoint.
pub const TRAP_OPCODE: u8 = 0xCC;
/// Byte the mock CPU treats as a return instruction.
pub const RET_OPCODE: u8 = 0xC3;
/// Fixed instruction length of the mock CPU.
pub const INSTR_LEN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepFlavor {
    Into,
    Over,
}

#[derive(Default)]
struct MockState {
    memory: HashMap<u64, u8>,
    contexts: HashMap<u64, CpuContext>,
    queue: VecDeque<DebugEvent>,
    call_targets: HashMap<u64, u64>,
    ret_stacks: HashMap<u64, Vec<u64>>,
    /// address -> original byte currently hidden under a trap patch
    patched: HashMap<u64, u8>,
    hw_slots: HashMap<u8, u64>,
    mem_bps: HashMap<u64, (u64, MemAccess)>,
    pending_step: Option<(u64, StepFlavor)>,
    continue_log: Vec<ContinueStatus>,
    main_tid: u64,
    terminated: bool,
}

/// Scripted engine used by the test suite and examples.
#[derive(Default)]
pub struct MockEngine {
    state: Mutex<MockState>,
    cond: Condvar,
    sw_sets: AtomicUsize,
    sw_removes: AtomicUsize,
    fail_next_step: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a debug event for the event loop to pick up.
    pub fn push_event(&self, event: DebugEvent) {
        let mut state = self.state.lock().unwrap();
        state.queue.push_back(event);
        self.cond.notify_all();
    }

    /// Write bytes into the mock debuggee memory without going through the
    /// debugger (sets up the "pre-attach" image content).
    pub fn poke(&self, address: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            state.memory.insert(address + i as u64, *b);
        }
    }

    /// Read a byte back, 0 if never written.
    pub fn peek(&self, address: u64) -> u8 {
        let state = self.state.lock().unwrap();
        *state.memory.get(&address).unwrap_or(&0)
    }

    /// Mark `pc` as a call instruction that enters `target`.
    pub fn define_call(&self, pc: u64, target: u64) {
        let mut state = self.state.lock().unwrap();
        state.call_targets.insert(pc, target);
    }

    /// Set the register context of a thread directly.
    pub fn prime_context(&self, tid: u64, ctx: CpuContext) {
        let mut state = self.state.lock().unwrap();
        state.contexts.insert(tid, ctx);
    }

    /// Addresses that currently carry a trap patch.
    pub fn patched_addresses(&self) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        let mut addrs: Vec<u64> = state.patched.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    /// Continue statuses acknowledged so far.
    pub fn continue_statuses(&self) -> Vec<ContinueStatus> {
        self.state.lock().unwrap().continue_log.clone()
    }

    pub fn software_set_count(&self) -> usize {
        self.sw_sets.load(Ordering::SeqCst)
    }

    pub fn software_remove_count(&self) -> usize {
        self.sw_removes.load(Ordering::SeqCst)
    }

    /// Make the next step-arming call fail, as a protected page would.
    pub fn fail_next_step(&self) {
        self.fail_next_step.store(true, Ordering::SeqCst);
    }

    fn advance(state: &mut MockState, tid: u64, flavor: StepFlavor) {
        let ctx = state.contexts.entry(tid).or_default();
        let pc = ctx.pc;
        if let Some(&target) = state.call_targets.get(&pc) {
            match flavor {
                StepFlavor::Over => ctx.pc = pc + INSTR_LEN,
                StepFlavor::Into => {
                    ctx.sp = ctx.sp.wrapping_sub(8);
                    ctx.pc = target;
                    state
                        .ret_stacks
                        .entry(tid)
                        .or_default()
                        .push(pc + INSTR_LEN);
                }
            }
        } else if state.memory.get(&pc) == Some(&RET_OPCODE) {
            ctx.sp = ctx.sp.wrapping_add(8);
            let ret = state
                .ret_stacks
                .get_mut(&tid)
                .and_then(|stack| stack.pop());
            ctx.pc = ret.unwrap_or(pc + INSTR_LEN);
        } else {
            ctx.pc = pc + INSTR_LEN;
        }
    }

    fn arm_step(&self, tid: u64, flavor: StepFlavor) -> Result<(), EngineError> {
        if self.fail_next_step.swap(false, Ordering::SeqCst) {
            return Err(EngineError::os("single_step", "step arming failed"));
        }
        let mut state = self.state.lock().unwrap();
        state.pending_step = Some((tid, flavor));
        Ok(())
    }
}

impl DebugEngine for MockEngine {
    fn launch(&self, _path: &str, _args: &[String]) -> Result<ProcessInfo, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.main_tid = 1;
        state.contexts.entry(1).or_default();
        Ok(ProcessInfo {
            pid: 4242,
            main_tid: 1,
        })
    }

    fn attach(&self, pid: u32) -> Result<ProcessInfo, EngineError> {
        let mut state = self.state.lock().unwrap();
        state.main_tid = 1;
        state.contexts.entry(1).or_default();
        Ok(ProcessInfo { pid, main_tid: 1 })
    }

    fn detach(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn terminate(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if !state.terminated {
            state.terminated = true;
            state.queue.push_back(DebugEvent::ProcessExited { exit_code: 1 });
            self.cond.notify_all();
        }
        Ok(())
    }

    fn wait_event(&self, timeout: Duration) -> Result<DebugEvent, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Ok(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::WaitTimeout);
            }
            let (guard, result) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = guard;
            if result.timed_out() && state.queue.is_empty() {
                return Err(EngineError::WaitTimeout);
            }
        }
    }

    fn continue_event(&self, status: ContinueStatus) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.continue_log.push(status);
        if let Some((tid, flavor)) = state.pending_step.take() {
            Self::advance(&mut state, tid, flavor);
            state.queue.push_back(DebugEvent::StepCompleted { tid });
            self.cond.notify_all();
        }
        Ok(())
    }

    fn break_in(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let tid = state.main_tid;
        let pc = state.contexts.get(&tid).map_or(0, |c| c.pc);
        state.queue.push_back(DebugEvent::Exception {
            tid,
            info: ExceptionInfo {
                code: EXCEPTION_BREAKPOINT_CODE,
                address: pc,
                first_chance: true,
            },
        });
        self.cond.notify_all();
        Ok(())
    }

    fn context(&self, tid: u64) -> Result<CpuContext, EngineError> {
        let state = self.state.lock().unwrap();
        state
            .contexts
            .get(&tid)
            .copied()
            .ok_or(EngineError::os("context", "unknown thread"))
    }

    fn set_context(&self, tid: u64, ctx: &CpuContext) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.contexts.insert(tid, *ctx);
        Ok(())
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, EngineError> {
        let state = self.state.lock().unwrap();
        Ok((0..len as u64)
            .map(|i| *state.memory.get(&(address + i)).unwrap_or(&0))
            .collect())
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        for (i, b) in data.iter().enumerate() {
            state.memory.insert(address + i as u64, *b);
        }
        Ok(())
    }

    fn set_software_breakpoint(&self, address: u64) -> Result<u8, EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.patched.contains_key(&address) {
            return Err(EngineError::os("SetBPX", "address already patched"));
        }
        let original = *state.memory.get(&address).unwrap_or(&0);
        state.memory.insert(address, TRAP_OPCODE);
        state.patched.insert(address, original);
        self.sw_sets.fetch_add(1, Ordering::SeqCst);
        Ok(original)
    }

    fn remove_software_breakpoint(&self, address: u64, original: u8) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.patched.remove(&address).is_none() {
            return Err(EngineError::os("DeleteBPX", "no patch at address"));
        }
        state.memory.insert(address, original);
        self.sw_removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_hardware_breakpoint(
        &self,
        address: u64,
        slot: u8,
        _access: HwAccess,
        _size: u8,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if slot as usize >= HW_SLOT_COUNT {
            return Err(EngineError::os("SetHardwareBreakPoint", "bad slot"));
        }
        if state.hw_slots.contains_key(&slot) {
            return Err(EngineError::os("SetHardwareBreakPoint", "slot occupied"));
        }
        state.hw_slots.insert(slot, address);
        Ok(())
    }

    fn remove_hardware_breakpoint(&self, slot: u8) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.hw_slots.remove(&slot).is_none() {
            return Err(EngineError::os("DeleteHardwareBreakPoint", "slot empty"));
        }
        Ok(())
    }

    fn set_memory_breakpoint(
        &self,
        base: u64,
        size: u64,
        access: MemAccess,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state.mem_bps.insert(base, (size, access));
        Ok(())
    }

    fn remove_memory_breakpoint(&self, base: u64) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.mem_bps.remove(&base).is_none() {
            return Err(EngineError::os("RemoveMemoryBPX", "no breakpoint at base"));
        }
        Ok(())
    }

    fn single_step(&self, tid: u64) -> Result<(), EngineError> {
        self.arm_step(tid, StepFlavor::Into)
    }

    fn step_over_call(&self, tid: u64) -> Result<(), EngineError> {
        self.arm_step(tid, StepFlavor::Over)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_round_trip() {
        let engine = MockEngine::new();
        engine.poke(0x1000, &[0x55]);
        let original = engine.set_software_breakpoint(0x1000).unwrap();
        assert_eq!(original, 0x55);
        assert_eq!(engine.peek(0x1000), TRAP_OPCODE);
        engine.remove_software_breakpoint(0x1000, original).unwrap();
        assert_eq!(engine.peek(0x1000), 0x55);
        assert!(engine.patched_addresses().is_empty());
    }

    #[test]
    fn test_step_advances_linearly() {
        let engine = MockEngine::new();
        engine.prime_context(1, CpuContext { pc: 0x1000, sp: 0x8000, fp: 0 });
        engine.single_step(1).unwrap();
        engine.continue_event(ContinueStatus::Handled).unwrap();
        let event = engine.wait_event(Duration::from_millis(10)).unwrap();
        assert_eq!(event, DebugEvent::StepCompleted { tid: 1 });
        assert_eq!(engine.context(1).unwrap().pc, 0x1000 + INSTR_LEN);
    }

    #[test]
    fn test_step_into_and_out_of_call() {
        let engine = MockEngine::new();
        engine.prime_context(1, CpuContext { pc: 0x1000, sp: 0x8000, fp: 0 });
        engine.define_call(0x1000, 0x2000);
        engine.poke(0x2000, &[RET_OPCODE]);

        engine.single_step(1).unwrap();
        engine.continue_event(ContinueStatus::Handled).unwrap();
        engine.wait_event(Duration::from_millis(10)).unwrap();
        let ctx = engine.context(1).unwrap();
        assert_eq!(ctx.pc, 0x2000);
        assert_eq!(ctx.sp, 0x8000 - 8);

        engine.single_step(1).unwrap();
        engine.continue_event(ContinueStatus::Handled).unwrap();
        engine.wait_event(Duration::from_millis(10)).unwrap();
        let ctx = engine.context(1).unwrap();
        assert_eq!(ctx.pc, 0x1000 + INSTR_LEN);
        assert_eq!(ctx.sp, 0x8000);
    }

    #[test]
    fn test_step_over_skips_call() {
        let engine = MockEngine::new();
        engine.prime_context(1, CpuContext { pc: 0x1000, sp: 0x8000, fp: 0 });
        engine.define_call(0x1000, 0x2000);
        engine.step_over_call(1).unwrap();
        engine.continue_event(ContinueStatus::Handled).unwrap();
        engine.wait_event(Duration::from_millis(10)).unwrap();
        assert_eq!(engine.context(1).unwrap().pc, 0x1000 + INSTR_LEN);
    }

    #[test]
    fn test_wait_event_times_out() {
        let engine = MockEngine::new();
        let err = engine.wait_event(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, EngineError::WaitTimeout));
    }
}
