//! Breakpoint table invariants: key round trips, slot exclusivity, and
//! exact byte restoration.

use proptest::prelude::*;
use test_case::test_case;

use rdbg::debugger::breakpoint::{BpKey, BpKind, BpPayload, Breakpoint, BreakpointTable};
use rdbg::debugger::modules::Location;
use rdbg::engine::mock::TRAP_OPCODE;
use rdbg::engine::{HwAccess, MemAccess};
use rdbg::DebugError;

use crate::test_helpers::*;

fn payload_for(kind: BpKind) -> BpPayload {
    match kind {
        BpKind::Software => BpPayload::Software { original: None },
        BpKind::Hardware => BpPayload::Hardware {
            slot: None,
            access: HwAccess::Execute,
            size: 1,
        },
        BpKind::Memory => BpPayload::Memory {
            size: 0x1000,
            access: MemAccess::ReadWriteExecute,
        },
        BpKind::DllLoad => BpPayload::DllLoad {
            name: "libfoo.so".into(),
        },
        BpKind::DllUnload => BpPayload::DllUnload {
            name: "libfoo.so".into(),
        },
        BpKind::Exception => BpPayload::Exception { code: 0xC0000005 },
    }
}

fn arb_kind() -> impl Strategy<Value = BpKind> {
    prop_oneof![
        Just(BpKind::Software),
        Just(BpKind::Hardware),
        Just(BpKind::Memory),
        Just(BpKind::DllLoad),
        Just(BpKind::DllUnload),
        Just(BpKind::Exception),
    ]
}

proptest! {
    /// add/get/delete round-trips for every kind and location, and an
    /// enabled duplicate is always rejected.
    #[test]
    fn prop_add_get_delete_round_trip(
        kind in arb_kind(),
        module in any::<u64>(),
        offset in any::<u64>(),
        address in any::<u64>(),
    ) {
        let key = BpKey {
            kind,
            location: Location { module, offset },
        };
        let mut table = BreakpointTable::new();
        table
            .add(Breakpoint::new(key, address, "m", payload_for(kind)))
            .unwrap();

        let bp = table.get(&key).expect("added breakpoint must be retrievable");
        prop_assert_eq!(bp.key(), key);
        prop_assert_eq!(bp.address(), address);
        prop_assert!(bp.is_enabled());

        prop_assert!(table
            .add(Breakpoint::new(key, address, "m", payload_for(kind)))
            .is_err());

        let removed = table.remove(&key).expect("delete must return the record");
        prop_assert_eq!(removed.key(), key);
        prop_assert!(table.get(&key).is_none());
        prop_assert_eq!(table.count(), 0);
    }
}

#[test]
fn test_software_delete_restores_exact_bytes() {
    let harness = launch_paused_at_entry();
    harness.engine.poke(0x401200, &[0x55]);

    let key = harness.session.add_breakpoint(0x401200).unwrap();
    assert_eq!(harness.engine.peek(0x401200), TRAP_OPCODE);

    harness.session.remove_breakpoint(key).unwrap();
    assert_eq!(harness.engine.peek(0x401200), 0x55);
}

#[test]
fn test_hardware_slots_are_exclusive() {
    let harness = launch_paused_at_entry();
    let mut keys = Vec::new();
    for i in 0..4u64 {
        keys.push(
            harness
                .session
                .add_hardware_breakpoint(0x401300 + i * 8, HwAccess::Execute, 1)
                .unwrap(),
        );
    }

    let err = harness
        .session
        .add_hardware_breakpoint(0x401400, HwAccess::Execute, 1)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DebugError>(),
        Some(DebugError::NoFreeSlot)
    ));

    // Releasing a slot makes it available again.
    harness.session.remove_breakpoint(keys[1]).unwrap();
    harness
        .session
        .add_hardware_breakpoint(0x401400, HwAccess::Execute, 1)
        .unwrap();
}

#[test_case(HwAccess::Execute; "execute")]
#[test_case(HwAccess::Write; "write")]
#[test_case(HwAccess::ReadWrite; "read write")]
fn test_hardware_breakpoint_arms(access: HwAccess) {
    let harness = launch_paused_at_entry();
    let key = harness
        .session
        .add_hardware_breakpoint(0x401500, access, 4)
        .unwrap();
    let bp = harness.session.breakpoint(key).unwrap();
    assert!(bp.is_active());
    assert!(matches!(
        bp.payload(),
        BpPayload::Hardware { slot: Some(_), .. }
    ));
}

#[test]
fn test_duplicate_breakpoint_rejected_by_session() {
    let harness = launch_paused_at_entry();
    harness.session.add_breakpoint(0x401200).unwrap();
    let err = harness.session.add_breakpoint(0x401200).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<DebugError>(),
        Some(DebugError::BreakpointExists)
    ));
}
