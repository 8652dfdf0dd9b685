use crate::common::{
    assert_quiet, attention, config, device, device_with, event, event_at, handshake,
    next_event, page_fault, register_address, sr_ident, start, start_default, topology, vm,
    wait_until,
};
use eudebug::backend::replay::TraceStep;
use eudebug::backend::{EuCommand, EventFlags};
use eudebug::device::{AttentionCodec, LinearCodec};
use eudebug::session::error::Error;
use eudebug::session::event::DebugEventKind;
use eudebug::session::sip::RegsetKind;
use eudebug::session::thread::{DeviceThread, ThreadId};
use serial_test::serial;

fn id(eu: u32, thread: u32) -> ThreadId {
    ThreadId::new(0, 0, 0, eu, thread)
}

fn api(eu: u32, thread: u32) -> DeviceThread {
    DeviceThread::single(0, 0, eu, thread)
}

fn stopped(threads: Vec<DeviceThread>) -> DebugEventKind {
    DebugEventKind::ThreadStopped { threads }
}

#[test]
#[serial]
fn test_unsolicited_stop_and_resume() {
    let h = start_default();
    let cmd = register_address(id(0, 1), RegsetKind::Cmd);
    h.replay.write_memory(vm(0), cmd, &[0xFF; 4]);

    h.replay.extend([
        sr_ident(id(0, 1), 1),
        event(EventFlags::STATE_CHANGE, attention(0, &[id(0, 1)])),
    ]);
    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(event.kind, stopped(vec![api(0, 1)]));

    assert!(matches!(
        h.session.interrupt(api(0, 1)),
        Err(Error::NotAvailable)
    ));

    h.session.resume(api(0, 1)).unwrap();
    let control = h.replay.controls().pop().unwrap();
    assert_eq!(control.command, EuCommand::Resume);
    assert_eq!(
        control.bitmask,
        LinearCodec.bitmask(&topology(1), 0, &[id(0, 1)])
    );
    // the system routine is told to leave through its command register
    assert_eq!(h.replay.read_memory(vm(0), cmd, 4), vec![0; 4]);

    assert!(matches!(h.session.resume(api(0, 1)), Err(Error::NotAvailable)));
}

#[test]
#[serial]
fn test_thread_registers() {
    let h = start_default();
    let grf = register_address(id(1, 0), RegsetKind::Grf);
    h.replay.write_memory(vm(0), grf, &[0xAB; 32]);

    h.replay.extend([
        sr_ident(id(1, 0), 1),
        event(EventFlags::STATE_CHANGE, attention(0, &[id(1, 0)])),
    ]);
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        stopped(vec![api(1, 0)])
    );

    let values = h
        .session
        .read_registers(api(1, 0), RegsetKind::Grf, 0, 1)
        .unwrap();
    assert_eq!(values, vec![0xAB; 32]);

    h.session
        .write_registers(api(1, 0), RegsetKind::Grf, 1, &[7; 32])
        .unwrap();
    assert_eq!(h.replay.read_memory(vm(0), grf + 32, 32), vec![7; 32]);
    assert_eq!(
        h.session
            .read_registers(api(1, 0), RegsetKind::Grf, 0, 2)
            .unwrap()[32..],
        [7; 32]
    );

    assert!(matches!(
        h.session.write_registers(api(1, 0), RegsetKind::Emask, 0, &[0; 16]),
        Err(Error::RegsetReadOnly(RegsetKind::Emask))
    ));
    assert!(matches!(
        h.session.read_registers(api(1, 0), RegsetKind::Grf, 3, 2),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        h.session.read_registers(api(1, 1), RegsetKind::Grf, 0, 1),
        Err(Error::NotAvailable)
    ));
}

#[test]
#[serial]
fn test_interrupt_all() {
    let h = start_default();
    h.replay.extend([
        sr_ident(id(0, 0), 1),
        sr_ident(id(1, 1), 1),
        TraceStep::WaitFor(EuCommand::InterruptAll),
        event(
            EventFlags::STATE_CHANGE,
            attention(0, &[id(0, 0), id(1, 1)]),
        ),
    ]);

    h.session.interrupt(DeviceThread::ALL).unwrap();
    assert!(matches!(
        h.session.interrupt(DeviceThread::ALL),
        Err(Error::NotReady)
    ));

    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(event.kind, stopped(vec![api(0, 0), api(1, 1)]));

    let control = h.replay.controls().pop().unwrap();
    assert_eq!(control.command, EuCommand::InterruptAll);
    assert_eq!(control.bitmask, vec![0; topology(1).bitmask_size()]);
}

#[test]
#[serial]
fn test_batched_stop() {
    let mut cfg = config();
    cfg.expected_attentions = Some(3);
    cfg.attention_grace_ms = 1000;
    let h = start(device(1), cfg, handshake(1));

    h.replay.extend([
        sr_ident(id(0, 0), 1),
        sr_ident(id(0, 1), 1),
        sr_ident(id(0, 2), 1),
        TraceStep::WaitFor(EuCommand::InterruptAll),
        event(EventFlags::STATE_CHANGE, attention(0, &[id(0, 0)])),
        event(EventFlags::STATE_CHANGE, attention(0, &[id(0, 1)])),
        event(EventFlags::STATE_CHANGE, attention(0, &[id(0, 2)])),
    ]);
    h.session.interrupt(DeviceThread::ALL).unwrap();

    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(event.kind, stopped(vec![api(0, 0), api(0, 1), api(0, 2)]));
    assert_quiet(|t| h.session.read_event(t));
}

#[test]
#[serial]
fn test_stale_attention_dropped() {
    let h = start_default();
    h.replay.extend([
        sr_ident(id(0, 1), 1),
        sr_ident(id(0, 2), 1),
        TraceStep::WaitFor(EuCommand::Interrupt),
        // raised before the interrupt was sent
        event_at(1, EventFlags::STATE_CHANGE, attention(0, &[id(0, 1)])),
        event(EventFlags::STATE_CHANGE, attention(0, &[id(0, 2)])),
    ]);
    h.session.interrupt(api(0, 2)).unwrap();

    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(event.kind, stopped(vec![api(0, 2)]));

    let control = h.replay.controls().pop().unwrap();
    assert_eq!(control.command, EuCommand::Interrupt);
    assert_eq!(
        control.bitmask,
        LinearCodec.bitmask(&topology(1), 0, &[id(0, 2)])
    );

    assert_quiet(|t| h.session.read_event(t));
    assert!(matches!(
        h.session.read_registers(api(0, 1), RegsetKind::Grf, 0, 1),
        Err(Error::NotAvailable)
    ));
}

#[test]
#[serial]
fn test_thread_without_ident_skipped() {
    let h = start_default();
    // only the second thread of the bitmask has a valid system routine ident
    h.replay.extend([
        sr_ident(id(0, 1), 1),
        event(
            EventFlags::STATE_CHANGE,
            attention(0, &[id(0, 0), id(0, 1)]),
        ),
    ]);

    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        stopped(vec![api(0, 1)])
    );
    assert!(matches!(
        h.session.read_registers(api(0, 0), RegsetKind::Grf, 0, 1),
        Err(Error::NotAvailable)
    ));
}

#[test]
#[serial]
fn test_interrupt_control_failure() {
    let h = start_default();
    h.replay.fail_eu_control(true);

    h.session.interrupt(api(0, 3)).unwrap();
    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(
        event.kind,
        DebugEventKind::ThreadUnavailable { thread: api(0, 3) }
    );
}

#[test]
#[serial]
fn test_interrupt_timeout() {
    let mut cfg = config();
    cfg.interrupt_timeout_ms = 200;
    let h = start(device(1), cfg, handshake(1));

    h.session.interrupt(api(1, 3)).unwrap();
    let event = next_event(|t| h.session.read_event(t));
    assert_eq!(
        event.kind,
        DebugEventKind::ThreadUnavailable { thread: api(1, 3) }
    );
}

#[test]
#[serial]
fn test_interrupt_out_of_range() {
    let h = start_default();
    assert!(matches!(
        h.session.interrupt(DeviceThread::single(5, 0, 0, 0)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
#[serial]
fn test_page_fault() {
    let h = start_default();

    h.replay.extend([
        sr_ident(id(0, 3), 1),
        event(
            EventFlags::STATE_CHANGE,
            page_fault(0, 0xDEAD_0000, &[id(0, 3)], &[]),
        ),
    ]);
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        DebugEventKind::PageFault {
            address: 0xDEAD_0000
        }
    );
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        stopped(vec![api(0, 3)])
    );

    // threads still faulted are reported as stopped only
    h.replay.extend([
        sr_ident(id(1, 2), 1),
        event(
            EventFlags::STATE_CHANGE,
            page_fault(0, 0xBEEF_0000, &[], &[id(1, 2)]),
        ),
    ]);
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        stopped(vec![api(1, 2)])
    );
}

#[test]
#[serial]
fn test_forced_exception_resumed() {
    let h = start(device_with(1, true), config(), handshake(1));

    let mut forced = [0u8; 16];
    forced[4..8].copy_from_slice(&0x4000_0000u32.to_le_bytes());
    h.replay
        .write_memory(vm(0), register_address(id(0, 1), RegsetKind::Cr), &forced);
    let mut breakpoint = [0u8; 16];
    breakpoint[4..8].copy_from_slice(&0x8000_0000u32.to_le_bytes());
    h.replay
        .write_memory(vm(0), register_address(id(0, 2), RegsetKind::Cr), &breakpoint);

    h.replay.extend([
        sr_ident(id(0, 1), 1),
        sr_ident(id(0, 2), 1),
        event(
            EventFlags::STATE_CHANGE,
            attention(0, &[id(0, 1), id(0, 2)]),
        ),
    ]);
    assert_eq!(
        next_event(|t| h.session.read_event(t)).kind,
        stopped(vec![api(0, 2)])
    );

    let resume = h
        .replay
        .controls()
        .into_iter()
        .find(|c| c.command == EuCommand::Resume)
        .unwrap();
    assert_eq!(
        resume.bitmask,
        LinearCodec.bitmask(&topology(1), 0, &[id(0, 1)])
    );
    assert!(matches!(
        h.session.read_registers(api(0, 1), RegsetKind::Grf, 0, 1),
        Err(Error::NotAvailable)
    ));
}

#[test]
#[serial]
fn test_stopped_threads_bitmask() {
    let h = start_default();
    h.replay.push(TraceStep::Stopped {
        tile: 0,
        bitmask: vec![1, 0, 0, 2],
    });
    wait_until("stopped bitmask", || h.replay.pending() == 0);

    let bitmask = h.session.stopped_threads_bitmask(DeviceThread::ALL).unwrap();
    assert_eq!(bitmask, vec![1, 0, 0, 2]);
    assert_eq!(
        h.replay.controls().pop().unwrap().command,
        EuCommand::Stopped
    );
}
