//! The unified hit pipeline: conditions, logging, commands, fast resume
//! and singleshot, observed through a full session.

use std::sync::Arc;

use rdbg::{CommandDispatcher, VarStore};

use crate::test_helpers::*;

const BP_ADDR: u64 = 0x40_1100;

fn count_lines(harness: &Harness, wanted: &str) -> usize {
    harness
        .sink
        .lines()
        .iter()
        .filter(|line| line.as_str() == wanted)
        .count()
}

fn error_report_count(harness: &Harness) -> usize {
    harness
        .sink
        .lines()
        .iter()
        .filter(|line| line.starts_with("expression error:"))
        .count()
}

#[test]
fn test_false_condition_keeps_running() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.set_break_condition(key, "0").unwrap();
    harness.session.run().unwrap();
    let counters = harness.session.gate_counters();

    for _ in 0..3 {
        harness.trap(BP_ADDR);
    }
    let bp = harness.session.breakpoint(key).unwrap();
    assert!(wait_for(|| bp.hit_count() == 3), "hits never reached 3");

    // The hit count moved but the debuggee never paused.
    assert!(!harness.session.is_paused());
    assert_eq!(harness.session.gate_counters(), counters);
}

#[test]
fn test_logging_breakpoint_logs_without_pausing() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.set_break_condition(key, "0").unwrap();
    harness
        .session
        .set_log(key, "1", "hit {hits} at {addr}")
        .unwrap();
    harness.session.run().unwrap();

    for _ in 0..3 {
        harness.trap(BP_ADDR);
    }
    let bp = harness.session.breakpoint(key).unwrap();
    assert!(wait_for(|| bp.hit_count() == 3));

    assert!(!harness.session.is_paused());
    for hits in 1..=3 {
        assert_eq!(
            count_lines(&harness, &format!("hit {hits} at 0x401100")),
            1
        );
    }
}

#[test]
fn test_malformed_condition_breaks_and_reports_once() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.set_break_condition(key, "1+").unwrap();
    harness.session.run().unwrap();

    harness.trap(BP_ADDR);
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), BP_ADDR);
    assert_eq!(error_report_count(&harness), 1);

    // The same malformed text still breaks, but is not reported again.
    harness.session.run().unwrap();
    harness.trap(BP_ADDR);
    let bp = harness.session.breakpoint(key).unwrap();
    assert!(wait_for(|| bp.hit_count() == 2 && harness.session.is_paused()));
    assert_eq!(error_report_count(&harness), 1);
}

#[test]
fn test_fast_resume_skips_log_and_command() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.set_break_condition(key, "0").unwrap();
    harness.session.set_fast_resume(key, true).unwrap();
    harness.session.set_log(key, "1", "should not appear").unwrap();
    harness.session.run().unwrap();

    harness.trap(BP_ADDR);
    let bp = harness.session.breakpoint(key).unwrap();
    assert!(wait_for(|| bp.hit_count() == 1));

    assert!(!harness.session.is_paused());
    assert_eq!(count_lines(&harness, "should not appear"), 0);
}

#[test]
fn test_trap_on_disabled_record_pauses_without_evaluating() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.set_break_condition(key, "0").unwrap();
    harness.session.disable_breakpoint(key).unwrap();
    harness.session.run().unwrap();

    // A trap no enabled record explains must reach the user, whatever
    // conditions the stale record carries.
    harness.trap(BP_ADDR);
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), BP_ADDR);
    assert_eq!(harness.session.breakpoint(key).unwrap().hit_count(), 0);
}

/// Sets `$breakpointcondition` to force a break the condition vetoed.
struct ForceBreak;

impl CommandDispatcher for ForceBreak {
    fn execute(&self, _command: &str, vars: &VarStore) -> anyhow::Result<()> {
        vars.set("$breakpointcondition", 1);
        Ok(())
    }
}

#[test]
fn test_command_overrides_break_decision() {
    let harness = launch_with(|builder| builder.dispatcher(Arc::new(ForceBreak)));
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.set_break_condition(key, "0").unwrap();
    harness.session.set_command(key, "1", "force-break").unwrap();
    harness.session.run().unwrap();

    harness.trap(BP_ADDR);
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), BP_ADDR);
}

#[test]
fn test_singleshot_breakpoint_removes_itself() {
    let harness = launch_paused_at_entry();
    harness.engine.poke(BP_ADDR, &[0x90]);
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.set_singleshot(key, true).unwrap();
    harness.session.run().unwrap();

    harness.trap(BP_ADDR);
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), BP_ADDR);

    // The record is gone and the patch byte is restored.
    assert!(harness.session.breakpoint(key).is_none());
    assert!(!harness.engine.patched_addresses().contains(&BP_ADDR));
    assert_eq!(harness.engine.peek(BP_ADDR), 0x90);
}

#[test]
fn test_hit_description_written_unless_silent() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_breakpoint(BP_ADDR).unwrap();
    harness.session.run().unwrap();

    harness.trap(BP_ADDR);
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(
        count_lines(&harness, "software breakpoint at 0x401100"),
        1
    );

    harness.session.configure_breakpoint(key, |bp| bp.set_silent(true)).unwrap();
    harness.session.run().unwrap();
    harness.trap(BP_ADDR);
    let bp = harness.session.breakpoint(key).unwrap();
    assert!(wait_for(|| bp.hit_count() == 2 && harness.session.is_paused()));
    assert_eq!(
        count_lines(&harness, "software breakpoint at 0x401100"),
        1
    );
}
