use eudebug::backend::replay::{ReplayBackend, ReplayHandle, TraceStep};
use eudebug::backend::{
    AttentionEvent, BindEvent, EventFlags, KernelEvent, MetadataClass, MetadataKind,
    PageFaultEvent,
};
use eudebug::config::SessionConfig;
use eudebug::device::{
    AttentionCodec, EngineInstance, HwInfo, LinearCodec, StaticDevice, Topology,
    ENGINE_CLASS_COMPUTE,
};
use eudebug::session::error::Error;
use eudebug::session::event::DebugEvent;
use eudebug::session::sip::{DebugArea, RegsetDesc, RegsetKind, SipHeader, SrIdent};
use eudebug::session::thread::ThreadId;
use eudebug::session::DebugSession;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const CLIENT: u64 = 1;
pub const SIP_AREA: u64 = 0x10_0000;
pub const MODULE_AREA: u64 = 0x20_0000;
pub const META_SIP: u64 = 0x100;
pub const META_MODULE_AREA: u64 = 0x101;

/// Wait for an expected event.
pub const EVENT_WAIT: Duration = Duration::from_secs(5);
/// Wait used to check that no event arrives.
pub const QUIET: Duration = Duration::from_millis(300);

pub fn vm(tile: u32) -> u64 {
    0x10 + tile as u64
}

pub fn context(tile: u32) -> u64 {
    0x20 + tile as u64
}

pub fn lrc(tile: u32) -> u64 {
    0x30 + tile as u64
}

pub fn engine(tile: u32) -> EngineInstance {
    EngineInstance {
        class: ENGINE_CLASS_COMPUTE,
        instance: tile as u16,
    }
}

pub fn topology(tiles: u32) -> Topology {
    Topology {
        tiles,
        slices_per_tile: 1,
        subslices_per_slice: 2,
        eus_per_subslice: 2,
        threads_per_eu: 4,
    }
}

pub fn device(tiles: u32) -> Arc<StaticDevice> {
    device_with(tiles, false)
}

pub fn device_with(tiles: u32, forced_exception_check: bool) -> Arc<StaticDevice> {
    let hw = HwInfo {
        topology: topology(tiles),
        va_bits: 48,
        forced_exception_check,
    };
    Arc::new(StaticDevice::new(hw, 1).with_driver("replay"))
}

pub fn config() -> SessionConfig {
    SessionConfig {
        pid: 4242,
        poll_timeout_ms: 10,
        startup_timeout_ms: 2000,
        interrupt_timeout_ms: 3000,
        attention_grace_ms: 50,
        ..SessionConfig::new(4242)
    }
}

/// State save area header: one slot of 0x400 bytes per thread, SR ident at the start of a slot,
/// 16 byte register sets from 0x10 and four 32 byte GRF registers at 0x200.
pub fn sip_header() -> SipHeader {
    let kinds = [
        RegsetKind::Grf,
        RegsetKind::Addr,
        RegsetKind::Flag,
        RegsetKind::Emask,
        RegsetKind::Sr,
        RegsetKind::Cr,
        RegsetKind::Notification,
        RegsetKind::Tdr,
        RegsetKind::Acc,
        RegsetKind::Mme,
        RegsetKind::Ctrl,
        RegsetKind::Dbg,
        RegsetKind::Fc,
        RegsetKind::Sp,
        RegsetKind::Cmd,
    ];
    let mut regsets = IndexMap::new();
    for (i, kind) in kinds.into_iter().enumerate() {
        let desc = match kind {
            RegsetKind::Grf => RegsetDesc {
                offset: 0x200,
                num: 4,
                bits: 256,
                bytes: 32,
            },
            _ => RegsetDesc {
                offset: 0x10 + i as u32 * 0x10,
                num: 1,
                bits: 128,
                bytes: 16,
            },
        };
        regsets.insert(kind, desc);
    }

    let topology = topology(1);
    SipHeader {
        version: (2, 0, 0),
        size: 32,
        num_slices: topology.slices_per_tile as u16,
        num_subslices_per_slice: topology.subslices_per_slice as u16,
        num_eus_per_subslice: topology.eus_per_subslice as u16,
        num_threads_per_eu: topology.threads_per_eu as u16,
        state_area_offset: 0,
        state_save_size: 0x400,
        slm_area_offset: 0,
        slm_bank_size: 0,
        slm_bank_valid: 0,
        sr_magic_offset: 0,
        regsets,
    }
}

pub fn debug_area() -> DebugArea {
    DebugArea {
        bindless_sip: true,
        version: 1,
        pgsize: 4096,
        size: 0x1000,
    }
}

/// GPU address of a register set of a thread.
pub fn register_address(id: ThreadId, kind: RegsetKind) -> u64 {
    let sip = sip_header();
    let (offset, _) = sip.register_range(id, kind, 0, 1).unwrap();
    SIP_AREA + offset
}

pub fn event(flags: EventFlags, event: KernelEvent) -> TraceStep {
    TraceStep::event(flags, event)
}

pub fn event_at(seqno: u64, flags: EventFlags, event: KernelEvent) -> TraceStep {
    TraceStep::Event {
        seqno: Some(seqno),
        flags: flags.bits(),
        event,
    }
}

pub fn metadata(
    handle: u64,
    kind: MetadataKind,
    uuid: Option<&str>,
    data: Vec<u8>,
) -> Vec<TraceStep> {
    vec![
        TraceStep::Metadata {
            client: CLIENT,
            handle,
            uuid: uuid.map(str::to_string),
            data: data.clone(),
        },
        event(
            EventFlags::CREATE,
            KernelEvent::Metadata {
                client: CLIENT,
                handle,
                class: MetadataClass::Typed(kind),
                size: data.len() as u64,
            },
        ),
    ]
}

/// Client, VMs, contexts and state save areas of every tile. The module debug area is
/// bound separately by [`module_area`].
pub fn client_setup(tiles: u32) -> Vec<TraceStep> {
    let mut steps = vec![];
    for tile in 0..tiles {
        steps.push(TraceStep::Memory {
            vm: vm(tile),
            address: SIP_AREA,
            data: sip_header().to_bytes(),
        });
    }
    steps.push(TraceStep::Memory {
        vm: vm(0),
        address: MODULE_AREA,
        data: debug_area().to_bytes(),
    });

    steps.push(event(EventFlags::CREATE, KernelEvent::Client { handle: CLIENT }));
    for tile in 0..tiles {
        steps.extend([
            event(
                EventFlags::CREATE,
                KernelEvent::Vm {
                    client: CLIENT,
                    handle: vm(tile),
                },
            ),
            event(
                EventFlags::CREATE,
                KernelEvent::Context {
                    client: CLIENT,
                    handle: context(tile),
                },
            ),
            event(
                EventFlags::STATE_CHANGE,
                KernelEvent::ContextVm {
                    client: CLIENT,
                    context: context(tile),
                    vm: vm(tile),
                },
            ),
            event(
                EventFlags::STATE_CHANGE,
                KernelEvent::ContextEngines {
                    client: CLIENT,
                    context: context(tile),
                    engines: vec![engine(tile)],
                },
            ),
            event(
                EventFlags::CREATE,
                KernelEvent::Engines {
                    client: CLIENT,
                    context: context(tile),
                    lrcs: vec![(engine(tile), lrc(tile))],
                },
            ),
        ]);
    }

    steps.extend(metadata(META_SIP, MetadataKind::StateSaveArea, None, vec![]));
    steps.extend(metadata(META_MODULE_AREA, MetadataKind::ModuleDebugArea, None, vec![]));
    for tile in 0..tiles {
        steps.push(event(
            EventFlags::CREATE,
            combined(tile, SIP_AREA, 0x10_0000, vec![META_SIP]),
        ));
    }
    steps
}

pub fn module_area() -> Vec<TraceStep> {
    vec![event(
        EventFlags::CREATE,
        combined(0, MODULE_AREA, 0x1000, vec![META_MODULE_AREA]),
    )]
}

pub fn handshake(tiles: u32) -> Vec<TraceStep> {
    let mut steps = client_setup(tiles);
    steps.extend(module_area());
    steps
}

pub fn combined(tile: u32, va: u64, length: u64, metadata: Vec<u64>) -> KernelEvent {
    KernelEvent::Bind(BindEvent::Combined {
        client: CLIENT,
        vm: vm(tile),
        va,
        length,
        metadata,
    })
}

pub fn sr_ident(id: ThreadId, count: u8) -> TraceStep {
    TraceStep::Memory {
        vm: vm(id.tile),
        address: SIP_AREA + sip_header().sr_ident_offset(id),
        data: SrIdent {
            count,
            version: [1, 0, 0],
        }
        .to_bytes(),
    }
}

pub fn attention(tile: u32, threads: &[ThreadId]) -> KernelEvent {
    KernelEvent::Attention(AttentionEvent {
        client: CLIENT,
        context: Some(context(tile)),
        exec_queue: None,
        lrc: lrc(tile),
        engine: Some(engine(tile)),
        bitmask: LinearCodec.bitmask(&topology(tile + 1), tile, threads),
    })
}

pub fn page_fault(
    tile: u32,
    address: u64,
    resolved: &[ThreadId],
    faulted: &[ThreadId],
) -> KernelEvent {
    let topology = topology(tile + 1);
    let mut all = resolved.to_vec();
    all.extend_from_slice(faulted);
    let after = LinearCodec.bitmask(&topology, tile, &all);
    let resolved = LinearCodec.bitmask(&topology, tile, resolved);

    let mut bitmask = after.clone();
    bitmask.extend_from_slice(&after);
    bitmask.extend_from_slice(&resolved);
    KernelEvent::PageFault(PageFaultEvent {
        client: CLIENT,
        context: Some(context(tile)),
        exec_queue: None,
        lrc: lrc(tile),
        engine: Some(engine(tile)),
        address,
        bitmask,
    })
}

pub struct Harness {
    pub session: DebugSession,
    pub replay: ReplayHandle,
}

/// Session over a replay backend, not initialized.
pub fn open(device: Arc<StaticDevice>, config: SessionConfig, steps: Vec<TraceStep>) -> Harness {
    let backend = ReplayBackend::new(steps);
    let replay = backend.handle();
    let session = DebugSession::with_backend(Box::new(backend), device, config);
    Harness { session, replay }
}

/// Session over a replay backend with a completed handshake.
pub fn start(device: Arc<StaticDevice>, config: SessionConfig, steps: Vec<TraceStep>) -> Harness {
    let mut harness = open(device, config, steps);
    harness.session.initialize().unwrap();
    harness
}

/// Single tile session with a completed handshake.
pub fn start_default() -> Harness {
    start(device(1), config(), handshake(1))
}

pub fn next_event(read: impl Fn(Duration) -> Result<DebugEvent, Error>) -> DebugEvent {
    read(EVENT_WAIT).unwrap()
}

pub fn assert_quiet(read: impl Fn(Duration) -> Result<DebugEvent, Error>) {
    match read(QUIET) {
        Err(Error::NotReady) => {}
        other => panic!("unexpected event: {other:?}"),
    }
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        if start.elapsed() > EVENT_WAIT {
            panic!("timeout waiting for {what}");
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn is_acked(replay: &ReplayHandle, seqno: u64) -> bool {
    replay.acks().iter().any(|token| token.seqno == seqno)
}
