//! Session lifecycle: pause on demand, detach, stop, module tracking,
//! thread bookkeeping and the exception filter table.

use rdbg::engine::{DebugEvent, ExceptionInfo};
use rdbg::ContinueStatus;

use crate::test_helpers::*;

#[test]
fn test_pause_on_demand() {
    let harness = launch_paused_at_entry();
    harness.session.run().unwrap();
    harness.session.pause().unwrap();
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), ENTRY);
}

#[test]
fn test_detach_unpatches_all_software_breakpoints() {
    let mut harness = launch_paused_at_entry();
    harness.engine.poke(0x40_1200, &[0xAA]);
    harness.engine.poke(0x40_1300, &[0xBB]);
    harness.session.add_breakpoint(0x40_1200).unwrap();
    harness.session.add_breakpoint(0x40_1300).unwrap();
    assert_eq!(harness.engine.patched_addresses(), vec![0x40_1200, 0x40_1300]);

    harness.session.detach().unwrap();

    assert!(!harness.session.is_active());
    assert!(harness.engine.patched_addresses().is_empty());
    assert_eq!(harness.engine.peek(0x40_1200), 0xAA);
    assert_eq!(harness.engine.peek(0x40_1300), 0xBB);
}

#[test]
fn test_process_exit_finishes_the_session() {
    let harness = launch_paused_at_entry();
    harness.session.run().unwrap();
    harness
        .engine
        .push_event(DebugEvent::ProcessExited { exit_code: 7 });
    assert!(harness.session.wait_until_finished(WAIT));
    assert_eq!(harness.session.exit_code(), Some(7));
    assert!(!harness.session.is_active());
}

#[test]
fn test_stop_terminates_the_debuggee() {
    let mut harness = launch_paused_at_entry();
    harness.session.stop().unwrap();
    assert!(!harness.session.is_active());
    assert_eq!(harness.session.exit_code(), Some(1));
}

#[test]
fn test_breakpoint_follows_module_relocation() {
    let harness = launch_paused_at_entry();
    harness.session.run().unwrap();

    harness.engine.poke(0x50_1000, &[0xAA]);
    harness.engine.push_event(DebugEvent::ModuleLoaded {
        base: 0x50_0000,
        size: 0x1_0000,
        path: "/lib/libfoo.so".into(),
        entry_point: 0x50_0100,
        tls_callbacks: Vec::new(),
    });
    assert!(wait_for(|| harness.session.modules().len() == 2));

    let key = harness.session.add_breakpoint(0x50_1000).unwrap();
    assert!(harness.engine.patched_addresses().contains(&0x50_1000));

    // Unloading disarms but keeps the record, keyed by (module, offset).
    harness
        .engine
        .push_event(DebugEvent::ModuleUnloaded { base: 0x50_0000 });
    assert!(wait_for(|| harness.engine.patched_addresses().is_empty()));
    assert_eq!(harness.engine.peek(0x50_1000), 0xAA);

    // The module comes back at a different base; the breakpoint follows.
    harness.engine.poke(0x60_1000, &[0xAA]);
    harness.engine.push_event(DebugEvent::ModuleLoaded {
        base: 0x60_0000,
        size: 0x1_0000,
        path: "/lib/libfoo.so".into(),
        entry_point: 0x60_0100,
        tls_callbacks: Vec::new(),
    });
    assert!(wait_for(|| harness
        .engine
        .patched_addresses()
        .contains(&0x60_1000)));
    assert_eq!(harness.session.breakpoint(key).unwrap().address(), 0x60_1000);

    harness.trap(0x60_1000);
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), 0x60_1000);
}

#[test]
fn test_rearm_disables_on_byte_mismatch() {
    let harness = launch_paused_at_entry();
    harness.session.run().unwrap();

    harness.engine.poke(0x50_1000, &[0xAA]);
    harness.engine.push_event(DebugEvent::ModuleLoaded {
        base: 0x50_0000,
        size: 0x1_0000,
        path: "/lib/libfoo.so".into(),
        entry_point: 0x50_0100,
        tls_callbacks: Vec::new(),
    });
    assert!(wait_for(|| harness.session.modules().len() == 2));
    let key = harness.session.add_breakpoint(0x50_1000).unwrap();

    harness
        .engine
        .push_event(DebugEvent::ModuleUnloaded { base: 0x50_0000 });
    assert!(wait_for(|| harness.engine.patched_addresses().is_empty()));

    // The reloaded image carries different code at the target offset.
    harness.engine.poke(0x60_1000, &[0xBB]);
    harness.engine.push_event(DebugEvent::ModuleLoaded {
        base: 0x60_0000,
        size: 0x1_0000,
        path: "/lib/libfoo.so".into(),
        entry_point: 0x60_0100,
        tls_callbacks: Vec::new(),
    });
    assert!(wait_for(|| {
        harness
            .session
            .breakpoint(key)
            .is_some_and(|bp| !bp.is_enabled())
    }));
    assert!(harness.engine.patched_addresses().is_empty());
    assert_eq!(harness.engine.peek(0x60_1000), 0xBB);
}

#[test]
fn test_dll_load_breakpoint_pauses_on_matching_module() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_dll_load_breakpoint("libbar.so").unwrap();
    harness.session.run().unwrap();

    harness.engine.push_event(DebugEvent::ModuleLoaded {
        base: 0x70_0000,
        size: 0x1_0000,
        path: "/lib/LibBar.so".into(),
        entry_point: 0x70_0100,
        tls_callbacks: Vec::new(),
    });
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), 0x70_0000);
    assert_eq!(harness.session.breakpoint(key).unwrap().hit_count(), 1);
}

#[test]
fn test_default_filter_pauses_on_first_chance_unhandled() {
    let harness = launch_paused_at_entry();
    harness.session.run().unwrap();

    harness.engine.push_event(DebugEvent::Exception {
        tid: 1,
        info: ExceptionInfo {
            code: 0xC000_0005,
            address: 0x40_1234,
            first_chance: true,
        },
    });
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), 0x40_1234);
    assert_eq!(harness.session.last_exception().unwrap().code, 0xC000_0005);

    // The exception is passed on to the debuggee once resumed.
    harness.session.run().unwrap();
    assert!(wait_for(|| harness
        .engine
        .continue_statuses()
        .contains(&ContinueStatus::NotHandled)));
}

#[test]
fn test_skip_exceptions_auto_resumes() {
    let harness = launch_paused_at_entry();
    harness.session.set_skip_exceptions(1);
    harness.session.run().unwrap();

    for address in [0x40_2000u64, 0x40_3000] {
        harness.engine.push_event(DebugEvent::Exception {
            tid: 1,
            info: ExceptionInfo {
                code: 0xC000_0005,
                address,
                first_chance: true,
            },
        });
    }
    // The first exception is swallowed; the second pauses.
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), 0x40_3000);
}

#[test]
fn test_exception_breakpoint_takes_precedence_over_filters() {
    let harness = launch_paused_at_entry();
    let key = harness.session.add_exception_breakpoint(0x1234).unwrap();
    harness.session.run().unwrap();

    harness.engine.push_event(DebugEvent::Exception {
        tid: 1,
        info: ExceptionInfo {
            code: 0x1234,
            address: 0x40_9000,
            first_chance: true,
        },
    });
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), 0x40_9000);
    assert_eq!(harness.session.breakpoint(key).unwrap().hit_count(), 1);
}

#[test]
fn test_break_on_thread_entry() {
    let config = rdbg::SessionConfig {
        break_on_thread_entry: true,
        ..rdbg::SessionConfig::default()
    };
    let harness = launch_with_config(config);
    harness.session.run().unwrap();

    harness
        .engine
        .push_event(DebugEvent::ThreadCreated { tid: 2, entry: 0x40_5000 });
    assert!(harness.session.wait_until_paused(WAIT));
    assert_eq!(harness.session.pause_address(), 0x40_5000);
    assert_eq!(harness.session.thread_count(), 2);
}

#[test]
fn test_thread_bookkeeping() {
    let harness = launch_paused_at_entry();
    assert_eq!(harness.session.thread_count(), 1);
    harness.session.run().unwrap();

    harness
        .engine
        .push_event(DebugEvent::ThreadCreated { tid: 2, entry: 0x40_5000 });
    assert!(wait_for(|| harness.session.thread_count() == 2));

    harness
        .engine
        .push_event(DebugEvent::ThreadExited { tid: 2, exit_code: 0 });
    assert!(wait_for(|| harness.session.thread_count() == 1));
}
