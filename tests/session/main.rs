mod common;

mod memory;
mod modules;
mod threads;
mod tiles;

use crate::common::{
    assert_quiet, client_setup, config, device, event, event_at, is_acked, metadata,
    module_area, next_event, open, start_default, wait_until, CLIENT,
};
use eudebug::backend::replay::TraceStep;
use eudebug::backend::{EventFlags, KernelEvent, MetadataClass, MetadataKind, COMMAND_QUEUE_UUID};
use eudebug::session::error::Error;
use eudebug::session::event::{DebugEventKind, DetachReason};
use serial_test::serial;

fn command_queue(handle: u64, sub_device: u32, sub_devices: u32) -> Vec<TraceStep> {
    let mut data = sub_device.to_le_bytes().to_vec();
    data.extend_from_slice(&sub_devices.to_le_bytes());
    metadata(handle, MetadataKind::Other, Some(COMMAND_QUEUE_UUID), data)
}

fn metadata_destroyed(handle: u64) -> TraceStep {
    event(
        EventFlags::DESTROY,
        KernelEvent::Metadata {
            client: CLIENT,
            handle,
            class: MetadataClass::Typed(MetadataKind::Other),
            size: 0,
        },
    )
}

#[test]
#[serial]
fn test_attach_and_close() {
    let mut h = start_default();
    assert_eq!(h.session.debug_area(), Some(common::debug_area()));
    assert_eq!(h.session.tile_count(), 0);
    assert!(h.session.tile(0).is_none());
    assert!(!h.session.is_detached());

    h.session.close();
    assert!(h.replay.is_closed());
    h.session.close();
}

#[test]
#[serial]
fn test_handshake_without_events() {
    let mut h = open(device(1), config(), vec![]);
    assert!(matches!(h.session.initialize(), Err(Error::NotReady)));
}

#[test]
#[serial]
fn test_handshake_retry() {
    let mut cfg = config();
    cfg.startup_timeout_ms = 200;
    let mut h = open(device(1), cfg, client_setup(1));

    assert!(matches!(h.session.initialize(), Err(Error::NotReady)));
    assert!(h.session.debug_area().is_none());

    h.replay.extend(module_area());
    h.session.initialize().unwrap();
    assert_eq!(h.session.debug_area(), Some(common::debug_area()));
    // repeated initialization of a running session does nothing
    h.session.initialize().unwrap();
}

#[test]
#[serial]
fn test_client_closed_during_handshake() {
    let mut steps = client_setup(1);
    steps.push(event(EventFlags::DESTROY, KernelEvent::Client { handle: CLIENT }));
    let mut h = open(device(1), config(), steps);

    assert!(matches!(h.session.initialize(), Err(Error::DeviceLost(CLIENT))));
}

#[test]
#[serial]
fn test_invalid_module_debug_area() {
    let mut steps = client_setup(1);
    steps.push(TraceStep::Memory {
        vm: common::vm(0),
        address: common::MODULE_AREA,
        data: b"garbage\0".to_vec(),
    });
    steps.extend(module_area());
    let mut h = open(device(1), config(), steps);

    assert!(matches!(h.session.initialize(), Err(Error::Unknown)));
}

#[test]
#[serial]
fn test_single_detach_event() {
    let h = start_default();
    h.replay
        .extend([TraceStep::PollError, TraceStep::PollError, TraceStep::PollError]);

    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(
        event.kind,
        DebugEventKind::Detached {
            reason: DetachReason::HostExit
        }
    );
    assert!(h.session.is_detached());
    wait_until("poll errors replayed", || h.replay.pending() == 0);
    assert_quiet(|t| h.session.read_event(t));
}

#[test]
#[serial]
fn test_process_entry_and_exit() {
    let h = start_default();

    h.replay.extend(command_queue(0x200, 0, 1));
    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(event.kind, DebugEventKind::ProcessEntry);
    assert!(!event.need_ack);

    h.replay.extend(command_queue(0x201, 0, 1));
    h.replay.push(metadata_destroyed(0x200));
    assert_quiet(|t| h.session.read_event(t));

    h.replay.push(metadata_destroyed(0x201));
    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(event.kind, DebugEventKind::ProcessExit);
}

#[test]
#[serial]
fn test_client_exit_ends_process() {
    let h = start_default();

    h.replay.extend(command_queue(0x200, 0, 1));
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        DebugEventKind::ProcessEntry
    );

    h.replay
        .push(event(EventFlags::DESTROY, KernelEvent::Client { handle: CLIENT }));
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        DebugEventKind::ProcessExit
    );
}

#[test]
#[serial]
fn test_events_acknowledged_on_receipt() {
    let h = start_default();

    h.replay.push(TraceStep::Metadata {
        client: CLIENT,
        handle: 0x300,
        uuid: None,
        data: vec![],
    });
    h.replay.push(event_at(
        100,
        EventFlags::CREATE | EventFlags::NEED_ACK,
        KernelEvent::Metadata {
            client: CLIENT,
            handle: 0x300,
            class: MetadataClass::Typed(MetadataKind::Other),
            size: 0,
        },
    ));
    wait_until("metadata acknowledged", || is_acked(&h.replay, 100));
}

#[test]
#[serial]
fn test_unknown_flags_dropped() {
    let h = start_default();

    h.replay.push(TraceStep::Metadata {
        client: CLIENT,
        handle: 0x200,
        uuid: Some(COMMAND_QUEUE_UUID.to_string()),
        data: vec![0, 0, 0, 0, 1, 0, 0, 0],
    });
    h.replay.push(TraceStep::Event {
        seqno: None,
        flags: EventFlags::CREATE.bits() | 1 << 7,
        event: KernelEvent::Metadata {
            client: CLIENT,
            handle: 0x200,
            class: MetadataClass::Typed(MetadataKind::Other),
            size: 8,
        },
    });
    assert_quiet(|t| h.session.read_event(t));

    h.replay.extend(command_queue(0x201, 0, 1));
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        DebugEventKind::ProcessEntry
    );
}
