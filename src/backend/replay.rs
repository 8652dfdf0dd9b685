//! Backend that replays a trace of normalized kernel events.
//!
//! A trace is a list of [`TraceStep`], stored as JSON lines. Event steps become raw events whose
//! payload is the JSON encoded [`KernelEvent`]. Other steps fill VM memory and metadata, inject
//! poll errors or zero-byte transfers, or hold the trace until the session sends an eu-control
//! request. A [`ReplayHandle`] observes acknowledgments and eu-control traffic and appends steps
//! while a session runs.

use crate::backend::{
    AckPolicy, AckToken, Backend, BackendFactory, DecodedEvent, EuCommand, EuControl,
    EuControlReply, EventFlags, KernelEvent, KernelFlavor, Metadata, RawEvent, VmAccess,
};
use crate::device::Device;
use crate::session::error::Error;
use crate::session::lock;
use bytes::Bytes;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::read_to_string;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PAGE_SIZE: u64 = 4096;
/// Longest sleep of an idle poll.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Event type numbers of replayed raw events.
mod kind {
    pub const CLIENT: u32 = 1;
    pub const VM: u32 = 2;
    pub const CONTEXT: u32 = 3;
    pub const CONTEXT_VM: u32 = 4;
    pub const CONTEXT_ENGINES: u32 = 5;
    pub const ENGINES: u32 = 6;
    pub const EXEC_QUEUE: u32 = 7;
    pub const METADATA: u32 = 8;
    pub const BIND: u32 = 9;
    pub const ATTENTION: u32 = 10;
    pub const PAGE_FAULT: u32 = 11;
}

fn event_kind(event: &KernelEvent) -> u32 {
    match event {
        KernelEvent::Client { .. } => kind::CLIENT,
        KernelEvent::Vm { .. } => kind::VM,
        KernelEvent::Context { .. } => kind::CONTEXT,
        KernelEvent::ContextVm { .. } => kind::CONTEXT_VM,
        KernelEvent::ContextEngines { .. } => kind::CONTEXT_ENGINES,
        KernelEvent::Engines { .. } => kind::ENGINES,
        KernelEvent::ExecQueue { .. } => kind::EXEC_QUEUE,
        KernelEvent::Metadata { .. } => kind::METADATA,
        KernelEvent::Bind(_) => kind::BIND,
        KernelEvent::Attention(_) => kind::ATTENTION,
        KernelEvent::PageFault(_) => kind::PAGE_FAULT,
    }
}

/// One step of a trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStep {
    /// Kernel event. Without a sequence number the next free one is used.
    Event {
        #[serde(default)]
        seqno: Option<u64>,
        /// Wire flags, see [`EventFlags`].
        flags: u32,
        event: KernelEvent,
    },
    /// Hold the rest of the trace until an eu-control request with this command arrives.
    WaitFor(EuCommand),
    /// Fill VM memory.
    Memory { vm: u64, address: u64, data: Vec<u8> },
    /// Content returned for a metadata object.
    Metadata {
        client: u64,
        handle: u64,
        #[serde(default)]
        uuid: Option<String>,
        data: Vec<u8>,
    },
    /// Bitmask returned by a STOPPED eu-control request of a tile.
    Stopped { tile: u32, bitmask: Vec<u8> },
    /// Poll fails as if the debug connection was invalidated.
    PollError,
    /// The next VM transfers move zero bytes.
    ZeroTransfers(u32),
}

impl TraceStep {
    pub fn event(flags: EventFlags, event: KernelEvent) -> Self {
        TraceStep::Event {
            seqno: None,
            flags: flags.bits(),
            event,
        }
    }
}

/// Parse a JSON lines trace, empty lines and lines starting with `#` are skipped.
pub fn parse_trace(data: &str) -> Result<Vec<TraceStep>, Error> {
    data.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| serde_json::from_str(line).map_err(|e| Error::Decode(format!("trace: {e}"))))
        .collect()
}

#[derive(Default)]
struct ReplayState {
    steps: VecDeque<TraceStep>,
    next_seqno: u64,
    /// Highest sequence number read so far.
    last_seqno: u64,
    /// eu-control commands not yet consumed by a wait step.
    received: Vec<EuCommand>,
    controls: Vec<EuControl>,
    acks: Vec<AckToken>,
    memory: HashMap<u64, BTreeMap<u64, Vec<u8>>>,
    metadata: HashMap<(u64, u64), Metadata>,
    stopped: HashMap<u32, Vec<u8>>,
    zero_transfers: u32,
    fail_eu_control: bool,
    closed: bool,
}

enum Front {
    Ready,
    Blocked,
    PollError,
}

impl ReplayState {
    /// Apply non-event steps at the front of the trace.
    fn advance(&mut self) -> Front {
        loop {
            let Some(step) = self.steps.front() else {
                return Front::Blocked;
            };
            match step {
                TraceStep::Event { .. } => return Front::Ready,
                TraceStep::WaitFor(command) => {
                    let Some(pos) = self.received.iter().position(|c| c == command) else {
                        return Front::Blocked;
                    };
                    self.received.remove(pos);
                }
                TraceStep::PollError => {
                    self.steps.pop_front();
                    return Front::PollError;
                }
                TraceStep::Memory { vm, address, data } => {
                    let (vm, address, data) = (*vm, *address, data.clone());
                    self.write(vm, address, &data);
                }
                TraceStep::Metadata {
                    client,
                    handle,
                    uuid,
                    data,
                } => {
                    let metadata = Metadata {
                        uuid: uuid.clone(),
                        data: data.clone(),
                    };
                    self.metadata.insert((*client, *handle), metadata);
                }
                TraceStep::Stopped { tile, bitmask } => {
                    self.stopped.insert(*tile, bitmask.clone());
                }
                TraceStep::ZeroTransfers(count) => self.zero_transfers += *count,
            }
            self.steps.pop_front();
        }
    }

    fn write(&mut self, vm: u64, address: u64, data: &[u8]) {
        let pages = self.memory.entry(vm).or_default();
        for (i, byte) in data.iter().enumerate() {
            let addr = address + i as u64;
            let page = pages
                .entry(addr / PAGE_SIZE)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize]);
            page[(addr % PAGE_SIZE) as usize] = *byte;
        }
    }

    fn read(&self, vm: u64, address: u64, buf: &mut [u8]) {
        let pages = self.memory.get(&vm);
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = address + i as u64;
            *byte = pages
                .and_then(|p| p.get(&(addr / PAGE_SIZE)))
                .map_or(0, |page| page[(addr % PAGE_SIZE) as usize]);
        }
    }

    fn take_zero_transfer(&mut self) -> bool {
        if self.zero_transfers > 0 {
            self.zero_transfers -= 1;
            return true;
        }
        false
    }
}

/// Observer of a replay backend.
#[derive(Clone, Default)]
pub struct ReplayHandle {
    state: Arc<Mutex<ReplayState>>,
}

impl ReplayHandle {
    pub fn push(&self, step: TraceStep) {
        lock(&self.state).steps.push_back(step);
    }

    pub fn extend(&self, steps: impl IntoIterator<Item = TraceStep>) {
        lock(&self.state).steps.extend(steps);
    }

    /// Acknowledged events in order.
    pub fn acks(&self) -> Vec<AckToken> {
        lock(&self.state).acks.clone()
    }

    /// Received eu-control requests in order.
    pub fn controls(&self) -> Vec<EuControl> {
        lock(&self.state).controls.clone()
    }

    /// Number of steps not replayed yet.
    pub fn pending(&self) -> usize {
        lock(&self.state).steps.len()
    }

    pub fn read_memory(&self, vm: u64, address: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        lock(&self.state).read(vm, address, &mut data);
        data
    }

    pub fn write_memory(&self, vm: u64, address: u64, data: &[u8]) {
        lock(&self.state).write(vm, address, data);
    }

    /// Make eu-control requests fail.
    pub fn fail_eu_control(&self, fail: bool) {
        lock(&self.state).fail_eu_control = fail;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

pub struct ReplayBackend {
    handle: ReplayHandle,
    ack_policy: AckPolicy,
}

impl ReplayBackend {
    pub fn new(steps: Vec<TraceStep>) -> Self {
        let handle = ReplayHandle::default();
        handle.extend(steps);
        Self {
            handle,
            ack_policy: AckPolicy::BlockOnFence,
        }
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn handle(&self) -> ReplayHandle {
        self.handle.clone()
    }
}

struct ReplayVm {
    state: Arc<Mutex<ReplayState>>,
    vm: u64,
}

impl ReplayVm {
    /// Bytes up to the end of the page of `offset`.
    fn chunk(offset: u64, len: usize) -> usize {
        len.min((PAGE_SIZE - offset % PAGE_SIZE) as usize)
    }
}

impl VmAccess for ReplayVm {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.take_zero_transfer() {
            return Ok(0);
        }
        let n = Self::chunk(offset, buf.len());
        state.read(self.vm, offset, &mut buf[..n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.take_zero_transfer() {
            return Ok(0);
        }
        let n = Self::chunk(offset, buf.len());
        state.write(self.vm, offset, &buf[..n]);
        Ok(n)
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn map(&self, _: u64, _: usize) -> io::Result<Option<memmap2::MmapMut>> {
        Ok(None)
    }
}

impl Backend for ReplayBackend {
    fn flavor(&self) -> KernelFlavor {
        KernelFlavor::Replay
    }

    fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    fn known_flags(&self) -> u32 {
        EventFlags::CREATE.bits()
            | EventFlags::DESTROY.bits()
            | EventFlags::STATE_CHANGE.bits()
            | EventFlags::NEED_ACK.bits()
    }

    fn is_attention(&self, raw: &RawEvent) -> bool {
        raw.kind == kind::ATTENTION
    }

    fn poll(&self, timeout: Duration) -> Result<bool, Errno> {
        let front = lock(&self.handle.state).advance();
        match front {
            Front::Ready => Ok(true),
            Front::PollError => Err(Errno::EINVAL),
            Front::Blocked => {
                std::thread::sleep(timeout.min(IDLE_POLL));
                Ok(false)
            }
        }
    }

    fn read_event(&self) -> Result<RawEvent, Error> {
        let mut state = lock(&self.handle.state);
        if !matches!(state.advance(), Front::Ready) {
            return Err(Error::NotReady);
        }
        let Some(TraceStep::Event {
            seqno,
            flags,
            event,
        }) = state.steps.pop_front()
        else {
            return Err(Error::NotReady);
        };

        let seqno = seqno.unwrap_or(state.next_seqno + 1);
        state.next_seqno = state.next_seqno.max(seqno);
        state.last_seqno = state.last_seqno.max(seqno);
        let payload = serde_json::to_vec(&event).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(RawEvent {
            kind: event_kind(&event),
            flags,
            seqno,
            payload: Bytes::from(payload),
        })
    }

    fn decode(&self, raw: &RawEvent) -> Result<DecodedEvent, Error> {
        let flags = EventFlags::from_bits(raw.flags).ok_or(Error::UnknownFlags(raw.flags))?;
        let event: KernelEvent =
            serde_json::from_slice(&raw.payload).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(DecodedEvent {
            seqno: raw.seqno,
            flags,
            event,
            ack: AckToken::from(raw),
        })
    }

    fn ack_event(&self, token: &AckToken) -> Result<(), Error> {
        lock(&self.handle.state).acks.push(*token);
        Ok(())
    }

    fn eu_control(&self, control: &EuControl) -> Result<EuControlReply, Error> {
        let mut state = lock(&self.handle.state);
        if state.fail_eu_control {
            return Err(Error::Ioctl("eu control", Errno::EIO));
        }
        state.controls.push(control.clone());
        state.received.push(control.command);

        let bitmask = match control.command {
            EuCommand::Stopped => state
                .stopped
                .get(&control.target.tile)
                .cloned()
                .unwrap_or_else(|| vec![0; control.bitmask.len()]),
            _ => control.bitmask.clone(),
        };
        Ok(EuControlReply {
            seqno: Some(state.last_seqno),
            bitmask,
        })
    }

    fn vm_open(&self, _client: u64, vm: u64, _write: bool) -> Result<Box<dyn VmAccess>, Error> {
        Ok(Box::new(ReplayVm {
            state: self.handle.state.clone(),
            vm,
        }))
    }

    fn read_metadata(&self, client: u64, handle: u64, _size: u64) -> Result<Metadata, Error> {
        lock(&self.handle.state)
            .metadata
            .get(&(client, handle))
            .cloned()
            .ok_or(Error::Uninitialized("metadata"))
    }

    fn close(&self) {
        lock(&self.handle.state).closed = true;
        log::debug!(target: "backend", "close replay connection");
    }
}

/// Creates replay backends for devices bound to the `replay` driver.
pub struct ReplayFactory {
    steps: Vec<TraceStep>,
}

impl ReplayFactory {
    pub fn new(steps: Vec<TraceStep>) -> Self {
        Self { steps }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = read_to_string(path)?;
        Ok(Self::new(parse_trace(&data)?))
    }
}

impl BackendFactory for ReplayFactory {
    fn flavor(&self) -> KernelFlavor {
        KernelFlavor::Replay
    }

    fn supports(&self, device: &dyn Device) -> bool {
        device.driver().as_deref() == Some("replay")
    }

    fn open(&self, _device: &dyn Device, pid: u32) -> Result<Box<dyn Backend>, Error> {
        log::info!(target: "backend", "replay {} trace steps for pid {pid}", self.steps.len());
        Ok(Box::new(ReplayBackend::new(self.steps.clone())))
    }
}
