//! Step and trace behavior against the mock CPU: fixed 4-byte
//! instructions, scripted call sites, `0xC3` returns.

use rdbg::engine::mock::{INSTR_LEN, RET_OPCODE};
use rdbg::{DebugEngine, TraceSpec};

use crate::test_helpers::*;

const CALLEE: u64 = 0x40_2000;

fn wait_paused_at(harness: &Harness, address: u64) {
    assert!(
        wait_for(|| harness.session.is_paused() && harness.session.pause_address() == address),
        "never paused at {address:#x}; last pause {:#x}",
        harness.session.pause_address()
    );
}

#[test]
fn test_step_over_n_advances_n_instructions() {
    let harness = launch_paused_at_entry();
    harness.session.step_over_n(5).unwrap();
    wait_paused_at(&harness, ENTRY + 5 * INSTR_LEN);
}

#[test]
fn test_step_into_descends_into_calls() {
    let harness = launch_paused_at_entry();
    harness.engine.define_call(ENTRY, CALLEE);

    harness.session.step_into().unwrap();
    wait_paused_at(&harness, CALLEE);

    harness.session.step_into().unwrap();
    wait_paused_at(&harness, CALLEE + INSTR_LEN);
}

#[test]
fn test_step_over_skips_calls() {
    let harness = launch_paused_at_entry();
    harness.engine.define_call(ENTRY, CALLEE);

    harness.session.step_over().unwrap();
    wait_paused_at(&harness, ENTRY + INSTR_LEN);
}

#[test]
fn test_step_out_returns_to_caller() {
    let harness = launch_paused_at_entry();
    harness.engine.define_call(ENTRY, CALLEE);
    harness.engine.poke(CALLEE + INSTR_LEN, &[RET_OPCODE]);

    harness.session.step_into().unwrap();
    wait_paused_at(&harness, CALLEE);

    // Runs through the callee, executes its ret, pauses in the caller.
    harness.session.step_out().unwrap();
    wait_paused_at(&harness, ENTRY + INSTR_LEN);
    assert_eq!(harness.engine.context(1).unwrap().sp, STACK_TOP);
}

#[test]
fn test_trace_logs_every_step_until_the_bound() {
    let harness = launch_paused_at_entry();
    harness
        .session
        .trace(TraceSpec {
            log_text: "at {addr}".into(),
            max_steps: 3,
            ..TraceSpec::default()
        })
        .unwrap();
    wait_paused_at(&harness, ENTRY + 3 * INSTR_LEN);

    let lines = harness.sink.lines();
    let logged: Vec<&str> = lines
        .iter()
        .map(String::as_str)
        .filter(|line| line.starts_with("at "))
        .collect();
    assert_eq!(logged, vec!["at 0x401004", "at 0x401008", "at 0x40100c"]);
}

#[test]
fn test_trace_feeds_the_execution_record() {
    let harness = launch_paused_at_entry();
    harness
        .session
        .trace(TraceSpec {
            max_steps: 2,
            ..TraceSpec::default()
        })
        .unwrap();
    wait_paused_at(&harness, ENTRY + 2 * INSTR_LEN);

    let record = harness.session.trace_record();
    assert_eq!(record.hit_count(ENTRY + INSTR_LEN), 1);
    assert_eq!(record.hit_count(ENTRY + 2 * INSTR_LEN), 1);
    assert_eq!(record.hit_count(ENTRY + 3 * INSTR_LEN), 0);
}

#[test]
fn test_failed_step_arming_stays_paused() {
    let harness = launch_paused_at_entry();
    harness.engine.fail_next_step();

    assert!(harness.session.step_into().is_err());
    assert!(harness.session.is_paused());
    assert_eq!(harness.session.pause_address(), ENTRY);

    // The automaton is idle again; the next request goes through.
    harness.session.step_into().unwrap();
    wait_paused_at(&harness, ENTRY + INSTR_LEN);
}

#[test]
fn test_step_requires_a_paused_debuggee() {
    let harness = launch_paused_at_entry();
    harness.session.run().unwrap();
    assert!(harness.session.step_into().is_err());
}
