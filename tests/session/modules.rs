use crate::common::{
    assert_quiet, combined, event, event_at, is_acked, metadata, next_event, start_default,
    wait_until, CLIENT,
};
use eudebug::backend::{BindEvent, EventFlags, KernelEvent, MetadataKind};
use eudebug::session::error::Error;
use eudebug::session::event::{DebugEvent, DebugEventKind, ModuleInfo};
use serial_test::serial;

pub const ISA: u64 = 0x400;
pub const ELF: u64 = 0x401;
pub const MODULE: u64 = 0x402;
pub const ELF_UUID: &str = "00000000-0000-0000-0000-000012340000";
pub const ELF_ADDRESS: u64 = 0x1234_0000;
pub const ELF_SIZE: u64 = 0x100;

pub fn elf_data() -> Vec<u8> {
    (0..ELF_SIZE).map(|i| i as u8).collect()
}

pub fn module_info(load: u64) -> ModuleInfo {
    ModuleInfo {
        begin: ELF_ADDRESS,
        end: ELF_ADDRESS + ELF_SIZE,
        load,
    }
}

fn need_ack() -> EventFlags {
    EventFlags::CREATE | EventFlags::NEED_ACK
}

#[test]
#[serial]
fn test_module_load_and_unload() {
    let h = start_default();
    h.replay.extend(metadata(ISA, MetadataKind::Isa, None, vec![]));
    h.replay
        .extend(metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data()));
    h.replay
        .push(event_at(100, need_ack(), combined(0, 0x80000, 0x1000, vec![ISA, ELF])));

    let load = next_event(|t| h.session.read_event(t));
    assert_eq!(load.kind, DebugEventKind::ModuleLoad(module_info(0x80000)));
    assert!(load.need_ack);
    assert!(!is_acked(&h.replay, 100));

    h.session.acknowledge_event(&load).unwrap();
    assert!(is_acked(&h.replay, 100));
    let acks = h.replay.acks().len();
    h.session.acknowledge_event(&load).unwrap();
    assert_eq!(h.replay.acks().len(), acks);

    h.replay.push(event(
        EventFlags::DESTROY,
        combined(0, 0x80000, 0x1000, vec![ISA, ELF]),
    ));
    let unload = next_event(|t| h.session.read_event(t));
    assert_eq!(unload.kind, DebugEventKind::ModuleUnload(module_info(0x80000)));
    assert!(!unload.need_ack);
}

#[test]
#[serial]
fn test_module_load_address_canonical() {
    let h = start_default();
    h.replay.extend(metadata(ISA, MetadataKind::Isa, None, vec![]));
    h.replay
        .extend(metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data()));
    h.replay.push(event_at(
        100,
        need_ack(),
        combined(0, 0x8000_0000_0000, 0x1000, vec![ISA, ELF]),
    ));

    let load = next_event(|t| h.session.read_event(t));
    assert_eq!(
        load.kind,
        DebugEventKind::ModuleLoad(module_info(0xFFFF_8000_0000_0000))
    );
    h.session.acknowledge_event(&load).unwrap();
    assert!(is_acked(&h.replay, 100));
}

#[test]
#[serial]
fn test_module_load_without_ack_request() {
    let h = start_default();
    h.replay
        .extend(metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data()));
    h.replay.push(event(
        EventFlags::CREATE,
        combined(0, 0x80000, 0x1000, vec![ELF]),
    ));

    let load = next_event(|t| h.session.read_event(t));
    assert_eq!(load.kind, DebugEventKind::ModuleLoad(module_info(0x80000)));
    assert!(!load.need_ack);
}

#[test]
#[serial]
fn test_module_load_after_last_segment() {
    let h = start_default();
    let mut module = 2u32.to_le_bytes().to_vec();
    module.extend_from_slice(&0u32.to_le_bytes());
    h.replay
        .extend(metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data()));
    h.replay
        .extend(metadata(MODULE, MetadataKind::Module, None, module));

    h.replay.push(event_at(
        100,
        need_ack(),
        combined(0, 0x90000, 0x1000, vec![MODULE, ELF]),
    ));
    // a partially bound module is not reported and must not block the workload
    wait_until("first segment acknowledged", || is_acked(&h.replay, 100));
    assert_quiet(|t| h.session.read_event(t));

    h.replay.push(event_at(
        101,
        need_ack(),
        combined(0, 0x80000, 0x1000, vec![MODULE, ELF]),
    ));
    let load = next_event(|t| h.session.read_event(t));
    assert_eq!(load.kind, DebugEventKind::ModuleLoad(module_info(0x80000)));
    assert!(load.need_ack);
    assert!(!is_acked(&h.replay, 101));
    h.session.acknowledge_event(&load).unwrap();
    assert!(is_acked(&h.replay, 101));

    h.replay.push(event(
        EventFlags::DESTROY,
        combined(0, 0x90000, 0x1000, vec![MODULE, ELF]),
    ));
    assert_quiet(|t| h.session.read_event(t));
    h.replay.push(event(
        EventFlags::DESTROY,
        combined(0, 0x80000, 0x1000, vec![MODULE, ELF]),
    ));
    let unload = next_event(|t| h.session.read_event(t));
    assert_eq!(unload.kind, DebugEventKind::ModuleUnload(module_info(0x80000)));
}

#[test]
#[serial]
fn test_bind_transaction() {
    let h = start_default();
    h.replay.extend(metadata(ISA, MetadataKind::Isa, None, vec![]));
    h.replay
        .extend(metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data()));

    h.replay.extend([
        event_at(
            200,
            need_ack(),
            KernelEvent::Bind(BindEvent::Begin {
                client: CLIENT,
                vm: crate::common::vm(0),
                ops: 1,
                fence: true,
            }),
        ),
        event_at(
            201,
            EventFlags::CREATE,
            KernelEvent::Bind(BindEvent::Op {
                bind_seqno: 200,
                metadata_count: 2,
                va: 0xA0000,
                length: 0x1000,
            }),
        ),
        event_at(
            202,
            EventFlags::CREATE,
            KernelEvent::Bind(BindEvent::OpMetadata {
                op_seqno: 201,
                metadata: ISA,
                cookie: 0,
            }),
        ),
        event_at(
            203,
            EventFlags::CREATE,
            KernelEvent::Bind(BindEvent::OpMetadata {
                op_seqno: 201,
                metadata: ELF,
                cookie: 0,
            }),
        ),
    ]);
    // without the user fence the transaction is not complete
    assert_quiet(|t| h.session.read_event(t));

    h.replay.push(event_at(
        204,
        need_ack(),
        KernelEvent::Bind(BindEvent::Fence { bind_seqno: 200 }),
    ));
    let load = next_event(|t| h.session.read_event(t));
    assert_eq!(load.kind, DebugEventKind::ModuleLoad(module_info(0xA0000)));
    assert!(load.need_ack);

    h.session.acknowledge_event(&load).unwrap();
    assert!(is_acked(&h.replay, 200));
    assert!(is_acked(&h.replay, 204));
}

#[test]
#[serial]
fn test_acknowledge_unknown_load() {
    let h = start_default();

    let event = DebugEvent::with_ack(
        DebugEventKind::ModuleLoad(ModuleInfo {
            begin: 0,
            end: 0,
            load: 0xDEAD_0000,
        }),
        true,
    );
    assert!(matches!(
        h.session.acknowledge_event(&event),
        Err(Error::Uninitialized(_))
    ));
    h.session
        .acknowledge_event(&DebugEvent::new(DebugEventKind::ProcessEntry))
        .unwrap();
}

#[test]
#[serial]
fn test_client_exit_releases_unfinished_bind() {
    let h = start_default();
    h.replay.extend([
        event_at(
            200,
            need_ack(),
            KernelEvent::Bind(BindEvent::Begin {
                client: CLIENT,
                vm: crate::common::vm(0),
                ops: 1,
                fence: true,
            }),
        ),
        event(EventFlags::DESTROY, KernelEvent::Client { handle: CLIENT }),
    ]);

    wait_until("unfinished bind acknowledged", || is_acked(&h.replay, 200));
}

#[test]
#[serial]
fn test_close_releases_deferred_acks() {
    let mut h = start_default();
    h.replay
        .extend(metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data()));
    h.replay
        .push(event_at(100, need_ack(), combined(0, 0x80000, 0x1000, vec![ELF])));

    let load = next_event(|t| h.session.read_event(t));
    assert!(load.need_ack);
    assert!(!is_acked(&h.replay, 100));

    h.session.close();
    assert!(is_acked(&h.replay, 100));
}
