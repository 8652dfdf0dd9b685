use crate::common::{
    combined, config, device, event, handshake, metadata, next_event, start, start_default,
    vm, wait_until,
};
use crate::modules::{elf_data, ELF, ELF_ADDRESS, ELF_UUID, ISA};
use eudebug::backend::replay::TraceStep;
use eudebug::backend::{EventFlags, MetadataKind};
use eudebug::config::MemoryAccess;
use eudebug::session::error::Error;
use eudebug::session::event::DebugEventKind;
use eudebug::session::memory::{AddressSpace, MemoryDescriptor};
use eudebug::session::thread::DeviceThread;
use eudebug::session::DebugSession;
use serial_test::serial;

fn read(session: &DebugSession, address: u64, len: usize) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0; len];
    session.read_memory(DeviceThread::ALL, MemoryDescriptor::new(address), &mut buf)?;
    Ok(buf)
}

fn write(session: &DebugSession, address: u64, data: &[u8]) -> Result<(), Error> {
    session.write_memory(DeviceThread::ALL, MemoryDescriptor::new(address), data)
}

/// Bind a code segment with its debug ELF at 0x80000 and wait for the load.
fn load_isa(h: &crate::common::Harness) {
    h.replay.extend(metadata(ISA, MetadataKind::Isa, None, vec![]));
    h.replay
        .extend(metadata(ELF, MetadataKind::Elf, Some(ELF_UUID), elf_data()));
    h.replay.push(event(
        EventFlags::CREATE,
        combined(0, 0x80000, 0x1000, vec![ISA, ELF]),
    ));
    let load = next_event(|t| h.session.read_event(t));
    assert!(matches!(load.kind, DebugEventKind::ModuleLoad(_)));
}

#[test]
#[serial]
fn test_vm_memory() {
    let h = start_default();
    let data: Vec<u8> = (1..=32).collect();
    h.replay.write_memory(vm(0), 0x50FF0, &data);

    // crosses a page boundary
    assert_eq!(read(&h.session, 0x50FF0, 32).unwrap(), data);

    write(&h.session, 0x60000, &[9; 64]).unwrap();
    assert_eq!(h.replay.read_memory(vm(0), 0x60000, 64), vec![9; 64]);
    assert_eq!(read(&h.session, 0x60020, 8).unwrap(), vec![9; 8]);
}

#[test]
#[serial]
fn test_vm_memory_mapped_fallback() {
    let mut cfg = config();
    cfg.memory_access = MemoryAccess::Mmap;
    let h = start(device(1), cfg, handshake(1));
    h.replay.write_memory(vm(0), 0x70000, &[5; 16]);

    assert_eq!(read(&h.session, 0x70000, 16).unwrap(), vec![5; 16]);
}

#[test]
#[serial]
fn test_elf_memory() {
    let h = start_default();
    load_isa(&h);

    assert_eq!(
        read(&h.session, ELF_ADDRESS + 0x10, 16).unwrap(),
        elf_data()[0x10..0x20]
    );

    write(&h.session, ELF_ADDRESS, &[0xEE; 4]).unwrap();
    assert_eq!(read(&h.session, ELF_ADDRESS, 4).unwrap(), vec![0xEE; 4]);
    // the debugger copy is written, not the GPU memory
    assert_eq!(h.replay.read_memory(vm(0), ELF_ADDRESS, 4), vec![0; 4]);
}

#[test]
#[serial]
fn test_isa_memory() {
    let h = start_default();
    load_isa(&h);

    write(&h.session, 0x80010, &[0xCC; 8]).unwrap();
    assert_eq!(h.replay.read_memory(vm(0), 0x80010, 8), vec![0xCC; 8]);
    assert_eq!(read(&h.session, 0x8000C, 8).unwrap(), [0, 0, 0, 0, 0xCC, 0xCC, 0xCC, 0xCC]);
}

#[test]
#[serial]
fn test_memory_arguments() {
    let h = start_default();

    assert!(matches!(read(&h.session, 0x1000, 0), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        read(&h.session, 0x0001_0000_0000_0000, 8),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        read(&h.session, 0xFFFF_FFFF_FFFF_FFF8, 16),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(read(&h.session, 0xFFFF_8000_0000_0000, 8).unwrap(), vec![0; 8]);

    let slm = MemoryDescriptor {
        space: AddressSpace::Slm,
        address: 0,
    };
    let mut buf = [0u8; 4];
    assert!(matches!(
        h.session.read_memory(DeviceThread::ALL, slm, &mut buf),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        h.session
            .read_memory(DeviceThread::single(0, 0, 0, 0), slm, &mut buf),
        Err(Error::UnsupportedFeature)
    ));

    assert!(matches!(
        h.session.read_memory(
            DeviceThread::single(0, 0, 0, 0),
            MemoryDescriptor::new(0x1000),
            &mut buf
        ),
        Err(Error::NotAvailable)
    ));
    assert!(matches!(
        h.session.read_memory(
            DeviceThread::single(0, 9, 0, 0),
            MemoryDescriptor::new(0x1000),
            &mut buf
        ),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
#[serial]
fn test_zero_byte_transfers() {
    let h = start_default();
    h.replay.write_memory(vm(0), 0x40000, &[3; 8]);

    h.replay.push(TraceStep::ZeroTransfers(2));
    wait_until("zero transfers armed", || h.replay.pending() == 0);
    assert_eq!(read(&h.session, 0x40000, 8).unwrap(), vec![3; 8]);

    h.replay.push(TraceStep::ZeroTransfers(10));
    wait_until("zero transfers armed", || h.replay.pending() == 0);
    assert!(matches!(read(&h.session, 0x40000, 8), Err(Error::Unknown)));
}
