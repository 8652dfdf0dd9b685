//! EU debug interface of the xe driver.
//!
//! A bind transaction is split into several events: the bind itself, one event per bind
//! operation, one per metadata attached to an operation and an optional user fence that must be
//! acknowledged to let the bind complete. Metadata objects carry a kernel defined type.

use crate::backend::vm::VmFile;
use crate::backend::{
    AckPolicy, AckToken, AttentionEvent, Backend, BackendFactory, BindEvent, DecodedEvent,
    EuCommand, EuControl, EuControlReply, EventFlags, KernelEvent, KernelFlavor, Metadata,
    MetadataClass, MetadataKind, PageFaultEvent, PayloadReader, RawEvent, VmAccess,
};
use crate::device::Device;
use crate::session::error::Error;
use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

#[allow(dead_code)]
mod uapi {
    use nix::{ioctl_readwrite, ioctl_readwrite_bad, ioctl_write_ptr, request_code_none};

    pub const EVENT_READ: u16 = 1;
    pub const EVENT_OPEN: u16 = 2;
    pub const EVENT_VM: u16 = 3;
    pub const EVENT_EXEC_QUEUE: u16 = 4;
    pub const EVENT_EU_ATTENTION: u16 = 5;
    pub const EVENT_VM_BIND: u16 = 6;
    pub const EVENT_VM_BIND_OP: u16 = 7;
    pub const EVENT_VM_BIND_UFENCE: u16 = 8;
    pub const EVENT_METADATA: u16 = 9;
    pub const EVENT_VM_BIND_OP_METADATA: u16 = 10;
    pub const EVENT_PAGEFAULT: u16 = 11;

    pub const FLAG_CREATE: u16 = 1 << 0;
    pub const FLAG_DESTROY: u16 = 1 << 1;
    pub const FLAG_STATE_CHANGE: u16 = 1 << 2;
    pub const FLAG_NEED_ACK: u16 = 1 << 3;
    pub const KNOWN_FLAGS: u16 = FLAG_CREATE | FLAG_DESTROY | FLAG_STATE_CHANGE | FLAG_NEED_ACK;

    pub const VM_BIND_FLAG_UFENCE: u32 = 1 << 0;

    pub const METADATA_ELF_BINARY: u64 = 0;
    pub const METADATA_PROGRAM_MODULE: u64 = 1;
    pub const METADATA_SBA_AREA: u64 = 2;
    pub const METADATA_MODULE_AREA: u64 = 3;
    pub const METADATA_SIP_AREA: u64 = 4;

    pub const EU_CONTROL_INTERRUPT_ALL: u32 = 0;
    pub const EU_CONTROL_STOPPED: u32 = 1;
    pub const EU_CONTROL_RESUME: u32 = 2;

    pub const HEADER_SIZE: usize = 24;
    pub const MAX_EVENT_SIZE: usize = 4096;

    #[repr(C)]
    pub struct EventHeader {
        pub len: u32,
        pub kind: u16,
        pub flags: u16,
        pub seqno: u64,
        pub reserved: u64,
    }

    #[repr(C)]
    pub struct Connect {
        pub extensions: u64,
        pub pid: u64,
        pub flags: u32,
        pub version: u32,
    }

    #[repr(C)]
    pub struct ReadMetadata {
        pub client_handle: u64,
        pub metadata_handle: u64,
        pub flags: u32,
        pub reserved: u32,
        pub ptr: u64,
        pub size: u64,
    }

    #[repr(C)]
    pub struct VmOpen {
        pub extensions: u64,
        pub client_handle: u64,
        pub vm_handle: u64,
        pub flags: u64,
        pub timeout_ns: u64,
    }

    #[repr(C)]
    pub struct EuControl {
        pub client_handle: u64,
        pub cmd: u32,
        pub flags: u32,
        pub seqno: u64,
        pub exec_queue_handle: u64,
        pub lrc_handle: u64,
        pub reserved: u32,
        pub bitmask_size: u32,
        pub bitmask_ptr: u64,
    }

    #[repr(C)]
    pub struct EventAck {
        pub kind: u16,
        pub flags: u16,
        pub seqno: u64,
    }

    ioctl_readwrite!(connect, b'd', 0x4f, Connect);
    ioctl_readwrite_bad!(read_event, request_code_none!(b'j', 0x0), EventHeader);
    ioctl_write_ptr!(vm_open, b'j', 0x1, VmOpen);
    ioctl_readwrite!(eu_control, b'j', 0x2, EuControl);
    ioctl_readwrite!(read_metadata, b'j', 0x3, ReadMetadata);
    ioctl_write_ptr!(ack_event, b'j', 0x4, EventAck);
}

fn flags_from_wire(wire: u32) -> Result<EventFlags, Error> {
    if wire & !(uapi::KNOWN_FLAGS as u32) != 0 {
        return Err(Error::UnknownFlags(wire));
    }
    let mut flags = EventFlags::empty();
    for (bit, flag) in [
        (uapi::FLAG_CREATE, EventFlags::CREATE),
        (uapi::FLAG_DESTROY, EventFlags::DESTROY),
        (uapi::FLAG_STATE_CHANGE, EventFlags::STATE_CHANGE),
        (uapi::FLAG_NEED_ACK, EventFlags::NEED_ACK),
    ] {
        if wire & bit as u32 != 0 {
            flags = flags | flag;
        }
    }
    Ok(flags)
}

fn metadata_kind(kind: u64) -> MetadataKind {
    match kind {
        uapi::METADATA_ELF_BINARY => MetadataKind::Elf,
        uapi::METADATA_PROGRAM_MODULE => MetadataKind::Module,
        uapi::METADATA_SBA_AREA => MetadataKind::StateBaseArea,
        uapi::METADATA_MODULE_AREA => MetadataKind::ModuleDebugArea,
        uapi::METADATA_SIP_AREA => MetadataKind::StateSaveArea,
        _ => MetadataKind::Other,
    }
}

/// Decode an xe event payload (everything after the fixed header).
pub(crate) fn decode_payload(kind: u16, payload: Bytes) -> Result<KernelEvent, Error> {
    let mut r = PayloadReader::new(payload, "xe event");

    let event = match kind {
        uapi::EVENT_OPEN => KernelEvent::Client { handle: r.u64()? },
        uapi::EVENT_VM => KernelEvent::Vm {
            client: r.u64()?,
            handle: r.u64()?,
        },
        uapi::EVENT_EXEC_QUEUE => {
            let client = r.u64()?;
            let vm = r.u64()?;
            let handle = r.u64()?;
            let engine_class = r.u32()? as u16;
            let width = r.u32()?;
            let lrcs = (0..width).map(|_| r.u64()).collect::<Result<_, _>>()?;
            KernelEvent::ExecQueue {
                client,
                vm,
                handle,
                engine_class,
                lrcs,
            }
        }
        uapi::EVENT_EU_ATTENTION => {
            let client = r.u64()?;
            let exec_queue = r.u64()?;
            let lrc = r.u64()?;
            let _flags = r.u32()?;
            let size = r.u32()?;
            KernelEvent::Attention(AttentionEvent {
                client,
                context: None,
                exec_queue: Some(exec_queue),
                lrc,
                engine: None,
                bitmask: r.bytes(size as usize)?,
            })
        }
        uapi::EVENT_VM_BIND => {
            let client = r.u64()?;
            let vm = r.u64()?;
            let flags = r.u32()?;
            let ops = r.u32()?;
            KernelEvent::Bind(BindEvent::Begin {
                client,
                vm,
                ops,
                fence: flags & uapi::VM_BIND_FLAG_UFENCE != 0,
            })
        }
        uapi::EVENT_VM_BIND_OP => KernelEvent::Bind(BindEvent::Op {
            bind_seqno: r.u64()?,
            metadata_count: r.u64()?,
            va: r.u64()?,
            length: r.u64()?,
        }),
        uapi::EVENT_VM_BIND_OP_METADATA => KernelEvent::Bind(BindEvent::OpMetadata {
            op_seqno: r.u64()?,
            metadata: r.u64()?,
            cookie: r.u64()?,
        }),
        uapi::EVENT_VM_BIND_UFENCE => KernelEvent::Bind(BindEvent::Fence {
            bind_seqno: r.u64()?,
        }),
        uapi::EVENT_METADATA => {
            let client = r.u64()?;
            let handle = r.u64()?;
            let kind = r.u64()?;
            let size = r.u64()?;
            KernelEvent::Metadata {
                client,
                handle,
                class: MetadataClass::Typed(metadata_kind(kind)),
                size,
            }
        }
        uapi::EVENT_PAGEFAULT => {
            let client = r.u64()?;
            let exec_queue = r.u64()?;
            let lrc = r.u64()?;
            let _flags = r.u32()?;
            let size = r.u32()?;
            let address = r.u64()?;
            KernelEvent::PageFault(PageFaultEvent {
                client,
                context: None,
                exec_queue: Some(exec_queue),
                lrc,
                engine: None,
                address,
                bitmask: r.bytes(size as usize)?,
            })
        }
        other => return Err(Error::Decode(format!("unknown xe event type {other}"))),
    };

    Ok(event)
}

/// Connection to the xe EU debugger of one process.
pub struct XeBackend {
    fd: OwnedFd,
}

impl XeBackend {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}

impl Backend for XeBackend {
    fn flavor(&self) -> KernelFlavor {
        KernelFlavor::Xe
    }

    fn ack_policy(&self) -> AckPolicy {
        AckPolicy::BlockOnFence
    }

    fn known_flags(&self) -> u32 {
        uapi::KNOWN_FLAGS as u32
    }

    fn is_attention(&self, raw: &RawEvent) -> bool {
        raw.kind == uapi::EVENT_EU_ATTENTION as u32
    }

    fn poll(&self, timeout: Duration) -> Result<bool, Errno> {
        let mut fds = [PollFd::new(&self.fd, PollFlags::POLLIN)];
        let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        Ok(poll(&mut fds, timeout)? > 0)
    }

    fn read_event(&self) -> Result<RawEvent, Error> {
        let mut words = vec![0u64; uapi::MAX_EVENT_SIZE / 8];
        let header = words.as_mut_ptr() as *mut uapi::EventHeader;
        // SAFETY: the buffer is 8-byte aligned and larger than the header,
        // the kernel writes at most `len` bytes into it.
        unsafe {
            (*header).kind = uapi::EVENT_READ;
            (*header).len = uapi::MAX_EVENT_SIZE as u32;
            uapi::read_event(self.raw_fd(), header).map_err(|e| Error::Ioctl("read event", e))?;
        }

        let bytes: Bytes = words.iter().flat_map(|w| w.to_ne_bytes()).collect::<Vec<_>>().into();
        let mut r = PayloadReader::new(bytes.clone(), "xe event header");
        let len = (r.u32()? as usize).clamp(uapi::HEADER_SIZE, uapi::MAX_EVENT_SIZE);
        let kind = r.u16()?;
        let flags = r.u16()?;
        let seqno = r.u64()?;

        Ok(RawEvent {
            kind: kind as u32,
            flags: flags as u32,
            seqno,
            payload: bytes.slice(uapi::HEADER_SIZE..len),
        })
    }

    fn decode(&self, raw: &RawEvent) -> Result<DecodedEvent, Error> {
        let kind = u16::try_from(raw.kind)
            .map_err(|_| Error::Decode(format!("xe event type {} out of range", raw.kind)))?;
        Ok(DecodedEvent {
            seqno: raw.seqno,
            flags: flags_from_wire(raw.flags)?,
            event: decode_payload(kind, raw.payload.clone())?,
            ack: AckToken::from(raw),
        })
    }

    fn ack_event(&self, token: &AckToken) -> Result<(), Error> {
        let ack = uapi::EventAck {
            kind: token.kind as u16,
            flags: token.flags as u16,
            seqno: token.seqno,
        };
        // SAFETY: ack is a valid uapi struct for the whole call.
        unsafe { uapi::ack_event(self.raw_fd(), &ack) }.map_err(|e| Error::Ioctl("ack event", e))?;
        Ok(())
    }

    fn eu_control(&self, control: &EuControl) -> Result<EuControlReply, Error> {
        let (Some(exec_queue), Some(lrc)) = (control.target.exec_queue, control.target.lrc) else {
            return Err(Error::Uninitialized("exec queue of eu control target"));
        };

        let mut bitmask = control.bitmask.clone();
        let mut request = uapi::EuControl {
            client_handle: control.client,
            cmd: match control.command {
                // single thread interrupts are not supported by the driver
                EuCommand::InterruptAll | EuCommand::Interrupt => uapi::EU_CONTROL_INTERRUPT_ALL,
                EuCommand::Stopped => uapi::EU_CONTROL_STOPPED,
                EuCommand::Resume => uapi::EU_CONTROL_RESUME,
            },
            flags: 0,
            seqno: 0,
            exec_queue_handle: exec_queue,
            lrc_handle: lrc,
            reserved: 0,
            bitmask_size: bitmask.len() as u32,
            bitmask_ptr: bitmask.as_mut_ptr() as u64,
        };
        if control.command == EuCommand::Interrupt {
            request.bitmask_size = 0;
        }
        // SAFETY: bitmask outlives the call and its size is passed along.
        unsafe { uapi::eu_control(self.raw_fd(), &mut request) }
            .map_err(|e| Error::Ioctl("eu control", e))?;

        bitmask.truncate(request.bitmask_size as usize);
        Ok(EuControlReply {
            seqno: Some(request.seqno),
            bitmask,
        })
    }

    fn vm_open(&self, client: u64, vm: u64, write: bool) -> Result<Box<dyn VmAccess>, Error> {
        let request = uapi::VmOpen {
            extensions: 0,
            client_handle: client,
            vm_handle: vm,
            flags: if write {
                nix::libc::O_RDWR as u64
            } else {
                nix::libc::O_RDONLY as u64
            },
            timeout_ns: 5_000_000_000,
        };
        // SAFETY: request is a valid uapi struct, the returned descriptor is owned by us.
        let fd = unsafe { uapi::vm_open(self.raw_fd(), &request) }
            .map_err(|e| Error::Ioctl("vm open", e))?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Box::new(VmFile::new(fd, vm)))
    }

    fn read_metadata(&self, client: u64, handle: u64, size: u64) -> Result<Metadata, Error> {
        let mut data = vec![0u8; size as usize];
        let mut request = uapi::ReadMetadata {
            client_handle: client,
            metadata_handle: handle,
            flags: 0,
            reserved: 0,
            ptr: data.as_mut_ptr() as u64,
            size,
        };
        // SAFETY: data outlives the call and its size is passed along.
        unsafe { uapi::read_metadata(self.raw_fd(), &mut request) }
            .map_err(|e| Error::Ioctl("read metadata", e))?;
        Ok(Metadata { uuid: None, data })
    }

    fn close(&self) {
        log::debug!(target: "backend", "close xe debug connection");
    }
}

pub struct XeFactory;

impl BackendFactory for XeFactory {
    fn flavor(&self) -> KernelFlavor {
        KernelFlavor::Xe
    }

    fn supports(&self, device: &dyn Device) -> bool {
        device.driver().as_deref() == Some("xe")
    }

    fn open(&self, device: &dyn Device, pid: u32) -> Result<Box<dyn Backend>, Error> {
        let drm = device.drm_fd().ok_or(Error::UnsupportedFeature)?;
        let mut param = uapi::Connect {
            extensions: 0,
            pid: pid as u64,
            flags: 0,
            version: 0,
        };
        // SAFETY: param is a valid uapi struct, the returned descriptor is owned by us.
        let fd = unsafe { uapi::connect(drm.as_raw_fd(), &mut param) }.map_err(Error::from_errno)?;
        Ok(Box::new(XeBackend::new(unsafe { OwnedFd::from_raw_fd(fd) })))
    }
}
