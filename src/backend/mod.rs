//! Kernel debug interfaces.
//!
//! Both supported kernel ABIs expose the same verbs: connect, read event, acknowledge event,
//! eu-control, vm-open and read-metadata. Every implementation decodes its own wire format
//! into [`KernelEvent`], so the session state machine never sees ABI specifics.

pub mod i915;
pub mod replay;
pub mod vm;
pub mod xe;

use crate::device::{Device, EngineInstance};
use crate::session::error::Error;
use bytes::Bytes;
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::io;
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// UUID string that tags command queue notifications.
pub const COMMAND_QUEUE_UUID: &str = "285208b2-c5e0-5fcb-90bb-7576ed7a9697";

/// Kernel driver flavor of a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
pub enum KernelFlavor {
    #[strum(serialize = "i915")]
    I915,
    #[strum(serialize = "xe")]
    Xe,
    #[strum(serialize = "replay")]
    Replay,
}

/// How deferred acknowledgments are released when a tile stops being observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// The kernel blocks the submitting CPU thread on the last bind, acknowledging it releases
    /// the chain.
    #[strum(serialize = "block_on_cpu")]
    BlockOnCpu,
    /// Every bind blocks on its own user fence, each one needs its acknowledgment.
    #[strum(serialize = "block_on_fence")]
    BlockOnFence,
}

/// Normalized event flags.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFlags(u32);

impl EventFlags {
    pub const CREATE: EventFlags = EventFlags(1 << 0);
    pub const DESTROY: EventFlags = EventFlags(1 << 1);
    pub const STATE_CHANGE: EventFlags = EventFlags(1 << 2);
    pub const NEED_ACK: EventFlags = EventFlags(1 << 3);

    const KNOWN: u32 = 0b1111;

    pub const fn empty() -> Self {
        EventFlags(0)
    }

    /// Returns `None` if unknown bits are set.
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::KNOWN == 0).then_some(EventFlags(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_create(&self) -> bool {
        self.contains(Self::CREATE)
    }

    pub fn is_destroy(&self) -> bool {
        self.contains(Self::DESTROY)
    }

    pub fn needs_ack(&self) -> bool {
        self.contains(Self::NEED_ACK)
    }
}

impl std::ops::BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventFlags(self.0 | rhs.0)
    }
}

impl Debug for EventFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut names = vec![];
        if self.is_create() {
            names.push("CREATE");
        }
        if self.is_destroy() {
            names.push("DESTROY");
        }
        if self.contains(Self::STATE_CHANGE) {
            names.push("STATE_CHANGE");
        }
        if self.needs_ack() {
            names.push("NEED_ACK");
        }
        write!(f, "EventFlags({})", names.join("|"))
    }
}

/// Event as read from the kernel: fixed header fields plus raw payload.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEvent {
    /// Wire event type.
    pub kind: u32,
    /// Wire flags.
    pub flags: u32,
    pub seqno: u64,
    pub payload: Bytes,
}

/// Identity of an event for acknowledgment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckToken {
    pub kind: u32,
    pub flags: u32,
    pub seqno: u64,
}

impl From<&RawEvent> for AckToken {
    fn from(raw: &RawEvent) -> Self {
        Self {
            kind: raw.kind,
            flags: raw.flags,
            seqno: raw.seqno,
        }
    }
}

/// How a metadata object is classified by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataClass {
    /// Registration of a class, payload holds the class name.
    Registration,
    /// Instance of a previously registered class.
    Instance { class_handle: u64 },
    /// Kernel-typed metadata.
    Typed(MetadataKind),
}

/// Meaning of a metadata object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MetadataKind {
    /// GPU address of the thread state save area.
    StateSaveArea,
    /// GPU address of the state base address area.
    StateBaseArea,
    /// GPU address of the module debug area.
    ModuleDebugArea,
    /// Code segment.
    Isa,
    /// Debug ELF image of a code segment or module.
    Elf,
    /// Multi-segment module, payload holds the segment count.
    Module,
    /// Command queue notification.
    CommandQueue,
    Other,
}

impl MetadataKind {
    /// Kind from a class registration name.
    pub fn from_class_name(name: &str) -> Self {
        match name.trim_end_matches('\0') {
            "I915_UUID_L0_SIP_AREA" => MetadataKind::StateSaveArea,
            "I915_UUID_L0_SBA_AREA" => MetadataKind::StateBaseArea,
            "I915_UUID_L0_MODULE_AREA" => MetadataKind::ModuleDebugArea,
            "I915_UUID_CLASS_ISA_BYTECODE" => MetadataKind::Isa,
            "I915_UUID_CLASS_ELF_BINARY" => MetadataKind::Elf,
            "L0_ZEBIN_MODULE" => MetadataKind::Module,
            _ => MetadataKind::Other,
        }
    }

    pub fn is_special_area(&self) -> bool {
        matches!(
            self,
            MetadataKind::StateSaveArea
                | MetadataKind::StateBaseArea
                | MetadataKind::ModuleDebugArea
        )
    }
}

/// Parts of a bind transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BindEvent {
    /// A whole bind in a single event.
    Combined {
        client: u64,
        vm: u64,
        va: u64,
        length: u64,
        metadata: Vec<u64>,
    },
    /// Start of a bind transaction, followed by `ops` operations.
    Begin {
        client: u64,
        vm: u64,
        ops: u32,
        /// A user fence event closes the transaction.
        fence: bool,
    },
    Op {
        bind_seqno: u64,
        /// Number of metadata attachments that follow.
        metadata_count: u64,
        va: u64,
        length: u64,
    },
    OpMetadata {
        op_seqno: u64,
        metadata: u64,
        cookie: u64,
    },
    Fence {
        bind_seqno: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttentionEvent {
    pub client: u64,
    pub context: Option<u64>,
    pub exec_queue: Option<u64>,
    pub lrc: u64,
    pub engine: Option<EngineInstance>,
    pub bitmask: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PageFaultEvent {
    pub client: u64,
    pub context: Option<u64>,
    pub exec_queue: Option<u64>,
    pub lrc: u64,
    pub engine: Option<EngineInstance>,
    pub address: u64,
    /// Three equally sized bitmasks: before, after, resolved.
    pub bitmask: Vec<u8>,
}

impl PageFaultEvent {
    /// Split the bitmask into before/after/resolved parts.
    pub fn parts(&self) -> Option<(&[u8], &[u8], &[u8])> {
        if self.bitmask.len() % 3 != 0 {
            return None;
        }
        let size = self.bitmask.len() / 3;
        Some((
            &self.bitmask[..size],
            &self.bitmask[size..size * 2],
            &self.bitmask[size * 2..],
        ))
    }
}

/// Kernel event decoded from either ABI.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KernelEvent {
    Client {
        handle: u64,
    },
    Vm {
        client: u64,
        handle: u64,
    },
    Context {
        client: u64,
        handle: u64,
    },
    ContextVm {
        client: u64,
        context: u64,
        vm: u64,
    },
    ContextEngines {
        client: u64,
        context: u64,
        engines: Vec<EngineInstance>,
    },
    /// Logical ring contexts of a context.
    Engines {
        client: u64,
        context: u64,
        lrcs: Vec<(EngineInstance, u64)>,
    },
    ExecQueue {
        client: u64,
        vm: u64,
        handle: u64,
        engine_class: u16,
        lrcs: Vec<u64>,
    },
    Metadata {
        client: u64,
        handle: u64,
        class: MetadataClass,
        size: u64,
    },
    Bind(BindEvent),
    Attention(AttentionEvent),
    PageFault(PageFaultEvent),
}

/// Decoded event with its normalized header.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedEvent {
    pub seqno: u64,
    pub flags: EventFlags,
    pub event: KernelEvent,
    pub ack: AckToken,
}

/// Payload of a metadata object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub uuid: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EuCommand {
    InterruptAll,
    Interrupt,
    Stopped,
    Resume,
}

/// Threads addressed by an eu-control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EuTarget {
    pub tile: u32,
    pub engine: EngineInstance,
    pub exec_queue: Option<u64>,
    pub lrc: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EuControl {
    pub client: u64,
    pub command: EuCommand,
    pub target: EuTarget,
    pub bitmask: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EuControlReply {
    /// Sequence number of the request in the kernel event stream.
    pub seqno: Option<u64>,
    pub bitmask: Vec<u8>,
}

/// VM-scoped memory handle.
pub trait VmAccess: Send {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn flush(&self) -> io::Result<()>;

    /// Map a page aligned window of the VM, `None` if the handle cannot be mapped.
    fn map(&self, offset: u64, len: usize) -> io::Result<Option<memmap2::MmapMut>>;
}

/// Kernel debug interface of one connection.
pub trait Backend: Send + Sync {
    fn flavor(&self) -> KernelFlavor;

    fn ack_policy(&self) -> AckPolicy;

    /// Wire flag bits this backend understands.
    fn known_flags(&self) -> u32;

    /// True for wire events carrying thread attention.
    fn is_attention(&self, raw: &RawEvent) -> bool;

    /// Wait for an event. `Ok(false)` on timeout.
    fn poll(&self, timeout: Duration) -> Result<bool, Errno>;

    fn read_event(&self) -> Result<RawEvent, Error>;

    fn decode(&self, raw: &RawEvent) -> Result<DecodedEvent, Error>;

    fn ack_event(&self, token: &AckToken) -> Result<(), Error>;

    fn eu_control(&self, control: &EuControl) -> Result<EuControlReply, Error>;

    fn vm_open(&self, client: u64, vm: u64, write: bool) -> Result<Box<dyn VmAccess>, Error>;

    fn read_metadata(&self, client: u64, handle: u64, size: u64) -> Result<Metadata, Error>;

    fn close(&self);
}

/// Creates backends of one kernel flavor.
pub trait BackendFactory: Send + Sync {
    fn flavor(&self) -> KernelFlavor;

    /// True if this factory can serve the device.
    fn supports(&self, device: &dyn Device) -> bool;

    fn open(&self, device: &dyn Device, pid: u32) -> Result<Box<dyn Backend>, Error>;
}

/// Table of backend factories, built once and passed to sessions.
#[derive(Default)]
pub struct BackendRegistry {
    factories: Vec<Box<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with both kernel driver backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(i915::I915Factory));
        registry.register(Box::new(xe::XeFactory));
        registry
    }

    pub fn register(&mut self, factory: Box<dyn BackendFactory>) {
        self.factories.push(factory);
    }

    pub fn flavors(&self) -> Vec<KernelFlavor> {
        self.factories.iter().map(|f| f.flavor()).collect()
    }

    /// First factory that accepts the device.
    pub fn select(&self, device: &dyn Device) -> Option<&dyn BackendFactory> {
        self.factories
            .iter()
            .find(|f| f.supports(device))
            .map(|f| f.as_ref())
    }

    pub fn open(&self, device: &dyn Device, pid: u32) -> Result<Box<dyn Backend>, Error> {
        let factory = self.select(device).ok_or(Error::UnsupportedFeature)?;
        log::info!(target: "backend", "open {} debug connection for pid {pid}", factory.flavor());
        factory.open(device, pid)
    }
}

/// Little-endian payload reader that reports short payloads as decode errors.
pub(crate) struct PayloadReader {
    buf: Bytes,
    what: &'static str,
}

impl PayloadReader {
    pub(crate) fn new(buf: Bytes, what: &'static str) -> Self {
        Self { buf, what }
    }

    fn ensure(&self, size: usize) -> Result<(), Error> {
        use bytes::Buf;
        if self.buf.remaining() < size {
            return Err(Error::Decode(format!(
                "{}: need {size} bytes, {} left",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u16(&mut self) -> Result<u16, Error> {
        use bytes::Buf;
        self.ensure(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub(crate) fn u32(&mut self) -> Result<u32, Error> {
        use bytes::Buf;
        self.ensure(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub(crate) fn u64(&mut self) -> Result<u64, Error> {
        use bytes::Buf;
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub(crate) fn skip(&mut self, n: usize) -> Result<(), Error> {
        use bytes::Buf;
        self.ensure(n)?;
        self.buf.advance(n);
        Ok(())
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        self.ensure(n)?;
        Ok(self.buf.split_to(n).to_vec())
    }
}
