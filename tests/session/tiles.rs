use crate::common::{
    assert_quiet, attention, combined, config, device, event, event_at, handshake, is_acked,
    metadata, next_event, sr_ident, start, vm, wait_until, Harness,
};
use crate::modules::{elf_data, module_info, ELF, ELF_UUID, ISA, MODULE};
use eudebug::backend::replay::TraceStep;
use eudebug::backend::{EventFlags, MetadataKind, COMMAND_QUEUE_UUID};
use eudebug::session::event::{DebugEventKind, DetachReason};
use eudebug::session::memory::MemoryDescriptor;
use eudebug::session::thread::{DeviceThread, ThreadId};
use serial_test::serial;

fn need_ack() -> EventFlags {
    EventFlags::CREATE | EventFlags::NEED_ACK
}

fn start_tiles(tile_attach: bool) -> Harness {
    let mut cfg = config();
    cfg.tile_attach = tile_attach;
    start(device(2), cfg, handshake(2))
}

fn elf() -> Vec<TraceStep> {
    metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data())
}

#[test]
#[serial]
fn test_module_loaded_on_every_tile() {
    let h = start_tiles(false);
    assert_eq!(h.session.tile_count(), 0);

    let mut module = 1u32.to_le_bytes().to_vec();
    module.extend_from_slice(&0b11u32.to_le_bytes());
    h.replay.extend(elf());
    h.replay
        .extend(metadata(MODULE, MetadataKind::Module, None, module));

    h.replay.push(event_at(
        100,
        need_ack(),
        combined(0, 0x80000, 0x1000, vec![MODULE, ELF]),
    ));
    assert_quiet(|t| h.session.read_event(t));

    h.replay.push(event_at(
        101,
        need_ack(),
        combined(1, 0x80000, 0x1000, vec![MODULE, ELF]),
    ));
    let load = next_event(|t| h.session.read_event(t));
    assert_eq!(load.kind, DebugEventKind::ModuleLoad(module_info(0x80000)));
    assert!(load.need_ack);
    assert!(!is_acked(&h.replay, 100));
    assert!(!is_acked(&h.replay, 101));

    h.session.acknowledge_event(&load).unwrap();
    assert!(is_acked(&h.replay, 100));
    assert!(is_acked(&h.replay, 101));
    assert_quiet(|t| h.session.read_event(t));
}

#[test]
#[serial]
fn test_isa_write_reaches_every_tile() {
    let h = start_tiles(false);
    h.replay.extend(metadata(ISA, MetadataKind::Isa, None, vec![]));
    h.replay.extend(elf());
    h.replay.push(event(
        EventFlags::CREATE,
        combined(0, 0x80000, 0x1000, vec![ISA, ELF]),
    ));
    h.replay.push(event_at(
        100,
        need_ack(),
        combined(1, 0x80000, 0x1000, vec![ISA, ELF]),
    ));

    // a segment is reported once for the whole device
    let load = next_event(|t| h.session.read_event(t));
    assert_eq!(load.kind, DebugEventKind::ModuleLoad(module_info(0x80000)));
    wait_until("second segment acknowledged", || is_acked(&h.replay, 100));
    assert_quiet(|t| h.session.read_event(t));

    h.session
        .write_memory(DeviceThread::ALL, MemoryDescriptor::new(0x80100), &[0x5A; 8])
        .unwrap();
    assert_eq!(h.replay.read_memory(vm(0), 0x80100, 8), vec![0x5A; 8]);
    assert_eq!(h.replay.read_memory(vm(1), 0x80100, 8), vec![0x5A; 8]);
}

#[test]
#[serial]
fn test_thread_of_second_tile() {
    let h = start_tiles(false);
    let id = ThreadId::new(1, 0, 0, 0, 1);
    h.replay.write_memory(vm(0), 0x50000, &[1; 8]);
    h.replay.write_memory(vm(1), 0x50000, &[4; 8]);

    h.replay.extend([
        sr_ident(id, 1),
        event(EventFlags::STATE_CHANGE, attention(1, &[id])),
    ]);
    // slices are numbered across tiles in the root session
    let thread = DeviceThread::single(1, 0, 0, 1);
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        DebugEventKind::ThreadStopped {
            threads: vec![thread]
        }
    );

    let mut buf = [0u8; 8];
    h.session
        .read_memory(thread, MemoryDescriptor::new(0x50000), &mut buf)
        .unwrap();
    assert_eq!(buf, [4; 8]);
    h.session
        .read_memory(DeviceThread::ALL, MemoryDescriptor::new(0x50000), &mut buf)
        .unwrap();
    assert_eq!(buf, [1; 8]);
}

#[test]
#[serial]
fn test_tile_load_reported_once() {
    let h = start_tiles(true);
    let tile0 = h.session.tile(0).unwrap();
    h.replay.extend(metadata(ISA, MetadataKind::Isa, None, vec![]));
    h.replay.extend(elf());

    // bound before the attach, replayed by it
    h.replay.push(event(
        EventFlags::CREATE,
        combined(0, 0x80000, 0x1000, vec![ISA, ELF]),
    ));
    wait_until("first bind handled", || h.replay.pending() == 0);
    tile0.attach().unwrap();
    assert_eq!(
        next_event(|t| tile0.read_event(t)).kind,
        DebugEventKind::ModuleLoad(module_info(0x80000))
    );
    assert_quiet(|t| tile0.read_event(t));

    // bound after the attach, reported live
    h.replay.push(event(
        EventFlags::CREATE,
        combined(0, 0x90000, 0x1000, vec![ISA, ELF]),
    ));
    assert_eq!(
        next_event(|t| tile0.read_event(t)).kind,
        DebugEventKind::ModuleLoad(module_info(0x90000))
    );
    assert_quiet(|t| tile0.read_event(t));

    // a second attach replays nothing new
    tile0.attach().unwrap();
    assert_quiet(|t| tile0.read_event(t));
}

#[test]
#[serial]
fn test_tile_sessions() {
    let h = start_tiles(true);
    assert_eq!(h.session.tile_count(), 2);
    assert!(h.session.tile(2).is_none());
    let tile0 = h.session.tile(0).unwrap();
    let tile1 = h.session.tile(1).unwrap();
    assert_eq!(tile1.index(), 1);
    assert!(!tile1.is_attached());

    let mut queue = 1u32.to_le_bytes().to_vec();
    queue.extend_from_slice(&2u32.to_le_bytes());
    h.replay.push(TraceStep::Metadata {
        client: crate::common::CLIENT,
        handle: 0x200,
        uuid: Some(COMMAND_QUEUE_UUID.to_string()),
        data: queue,
    });
    h.replay.push(event_at(
        300,
        need_ack(),
        eudebug::backend::KernelEvent::Metadata {
            client: crate::common::CLIENT,
            handle: 0x200,
            class: eudebug::backend::MetadataClass::Typed(MetadataKind::Other),
            size: 8,
        },
    ));
    h.replay.extend(metadata(ISA, MetadataKind::Isa, None, vec![]));
    h.replay.extend(elf());
    h.replay.push(event_at(
        301,
        need_ack(),
        combined(1, 0x80000, 0x1000, vec![ISA, ELF]),
    ));
    // nobody observes tile 1 yet, the bind must not block
    wait_until("bind acknowledged", || is_acked(&h.replay, 301));
    assert_quiet(|t| h.session.read_event(t));

    tile1.attach().unwrap();
    assert!(tile1.is_attached());
    assert_eq!(
        next_event(|t| tile1.read_event(t)).kind,
        DebugEventKind::ProcessEntry
    );
    let load = next_event(|t| tile1.read_event(t));
    assert_eq!(load.kind, DebugEventKind::ModuleLoad(module_info(0x80000)));
    assert!(!load.need_ack);
    assert_quiet(|t| tile0.read_event(t));

    // stops are reported to the tile with tile-local slices
    let id = ThreadId::new(1, 0, 1, 1, 2);
    h.replay.write_memory(vm(1), 0x50000, &[4; 8]);
    h.replay.extend([
        sr_ident(id, 1),
        event(EventFlags::STATE_CHANGE, attention(1, &[id])),
    ]);
    let thread = DeviceThread::single(0, 1, 1, 2);
    assert_eq!(
        next_event(|t| tile1.read_event(t)).kind,
        DebugEventKind::ThreadStopped {
            threads: vec![thread]
        }
    );
    let mut buf = [0u8; 8];
    tile1
        .read_memory(thread, MemoryDescriptor::new(0x50000), &mut buf)
        .unwrap();
    assert_eq!(buf, [4; 8]);
    tile1.resume(thread).unwrap();

    h.replay.push(event_at(
        302,
        need_ack(),
        combined(1, 0x90000, 0x1000, vec![ISA]),
    ));
    let load = next_event(|t| tile1.read_event(t));
    assert!(load.need_ack);
    assert!(!is_acked(&h.replay, 302));
    tile1.detach().unwrap();
    assert!(is_acked(&h.replay, 302));

    tile0.attach().unwrap();
    h.replay.push(TraceStep::PollError);
    let detached = DebugEventKind::Detached {
        reason: DetachReason::HostExit,
    };
    assert_eq!(next_event(|t| tile0.read_event(t)).kind, detached);
    assert_eq!(next_event(|t| h.session.read_event(t)).kind, detached);
    assert_quiet(|t| tile1.read_event(t));
}
