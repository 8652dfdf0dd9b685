//! Debugger interface of the i915 driver (prelim uAPI).
//!
//! A bind is reported as one event that lists the UUIDs attached to the bound range.
//! Metadata is organized as UUID classes: a class is registered with its name, instances
//! refer to the class by handle.

use crate::backend::vm::VmFile;
use crate::backend::{
    AckPolicy, AckToken, AttentionEvent, Backend, BackendFactory, BindEvent, DecodedEvent,
    EuCommand, EuControl, EuControlReply, EventFlags, KernelEvent, KernelFlavor, Metadata,
    MetadataClass, PageFaultEvent, PayloadReader, RawEvent, VmAccess,
};
use crate::device::{Device, EngineInstance};
use crate::session::error::Error;
use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

#[allow(dead_code)]
mod uapi {
    use nix::{ioctl_readwrite, ioctl_readwrite_bad, ioctl_write_ptr, request_code_none};

    pub const EVENT_READ: u32 = 1;
    pub const EVENT_CLIENT: u32 = 2;
    pub const EVENT_CONTEXT: u32 = 3;
    pub const EVENT_UUID: u32 = 4;
    pub const EVENT_VM: u32 = 5;
    pub const EVENT_VM_BIND: u32 = 6;
    pub const EVENT_CONTEXT_PARAM: u32 = 7;
    pub const EVENT_EU_ATTENTION: u32 = 8;
    pub const EVENT_ENGINES: u32 = 9;
    pub const EVENT_PAGE_FAULT: u32 = 10;

    pub const FLAG_CREATE: u32 = 1 << 31;
    pub const FLAG_DESTROY: u32 = 1 << 30;
    pub const FLAG_STATE_CHANGE: u32 = 1 << 29;
    pub const FLAG_NEED_ACK: u32 = 1 << 28;
    pub const KNOWN_FLAGS: u32 = FLAG_CREATE | FLAG_DESTROY | FLAG_STATE_CHANGE | FLAG_NEED_ACK;

    pub const HEADER_SIZE: usize = 24;
    pub const MAX_EVENT_SIZE: usize = 4096;

    /// Class handle of UUIDs that register a class.
    pub const UUID_CLASS_STRING: u64 = u64::MAX;

    pub const CONTEXT_PARAM_VM: u64 = 0x9;
    pub const CONTEXT_PARAM_ENGINES: u64 = 0xa;

    pub const EU_CONTROL_INTERRUPT_ALL: u32 = 0;
    pub const EU_CONTROL_STOPPED: u32 = 1;
    pub const EU_CONTROL_RESUME: u32 = 2;
    pub const EU_CONTROL_INTERRUPT: u32 = 3;

    pub const DEBUGGER_VERSION: u32 = 1;

    #[repr(C)]
    pub struct EventHeader {
        pub kind: u32,
        pub flags: u32,
        pub seqno: u64,
        pub size: u64,
    }

    #[repr(C)]
    pub struct DebuggerOpen {
        pub pid: u64,
        pub flags: u32,
        pub version: u32,
        pub events: u64,
        pub extensions: u64,
    }

    #[repr(C)]
    pub struct ReadUuid {
        pub client_handle: u64,
        pub handle: u64,
        pub flags: u32,
        pub uuid: [u8; 36],
        pub payload_ptr: u64,
        pub payload_size: u64,
    }

    #[repr(C)]
    pub struct VmOpen {
        pub client_handle: u64,
        pub handle: u64,
        pub flags: u64,
    }

    #[repr(C)]
    pub struct EuControl {
        pub client_handle: u64,
        pub cmd: u32,
        pub flags: u32,
        pub seqno: u64,
        pub engine_class: u16,
        pub engine_instance: u16,
        pub bitmask_size: u32,
        pub bitmask_ptr: u64,
    }

    #[repr(C)]
    pub struct EventAck {
        pub kind: u32,
        pub flags: u32,
        pub seqno: u64,
    }

    ioctl_readwrite!(debugger_open, b'd', 0x9d, DebuggerOpen);
    ioctl_readwrite_bad!(read_event, request_code_none!(b'j', 0x0), EventHeader);
    ioctl_readwrite!(read_uuid, b'j', 0x1, ReadUuid);
    ioctl_write_ptr!(vm_open, b'j', 0x2, VmOpen);
    ioctl_readwrite!(eu_control, b'j', 0x3, EuControl);
    ioctl_write_ptr!(ack_event, b'j', 0x4, EventAck);
}

fn flags_from_wire(wire: u32) -> Result<EventFlags, Error> {
    if wire & !uapi::KNOWN_FLAGS != 0 {
        return Err(Error::UnknownFlags(wire));
    }
    let mut flags = EventFlags::empty();
    for (bit, flag) in [
        (uapi::FLAG_CREATE, EventFlags::CREATE),
        (uapi::FLAG_DESTROY, EventFlags::DESTROY),
        (uapi::FLAG_STATE_CHANGE, EventFlags::STATE_CHANGE),
        (uapi::FLAG_NEED_ACK, EventFlags::NEED_ACK),
    ] {
        if wire & bit != 0 {
            flags = flags | flag;
        }
    }
    Ok(flags)
}

fn engine(r: &mut PayloadReader) -> Result<EngineInstance, Error> {
    Ok(EngineInstance {
        class: r.u16()?,
        instance: r.u16()?,
    })
}

/// Decode an i915 event payload (everything after the fixed header).
pub(crate) fn decode_payload(kind: u32, payload: Bytes) -> Result<KernelEvent, Error> {
    let mut r = PayloadReader::new(payload, "i915 event");

    let event = match kind {
        uapi::EVENT_CLIENT => KernelEvent::Client { handle: r.u64()? },
        uapi::EVENT_CONTEXT => KernelEvent::Context {
            client: r.u64()?,
            handle: r.u64()?,
        },
        uapi::EVENT_VM => KernelEvent::Vm {
            client: r.u64()?,
            handle: r.u64()?,
        },
        uapi::EVENT_UUID => {
            let client = r.u64()?;
            let handle = r.u64()?;
            let class_handle = r.u64()?;
            let size = r.u64()?;
            let class = if class_handle == uapi::UUID_CLASS_STRING {
                MetadataClass::Registration
            } else {
                MetadataClass::Instance { class_handle }
            };
            KernelEvent::Metadata {
                client,
                handle,
                class,
                size,
            }
        }
        uapi::EVENT_VM_BIND => {
            let client = r.u64()?;
            let vm = r.u64()?;
            let va = r.u64()?;
            let length = r.u64()?;
            let num_uuids = r.u32()?;
            let _flags = r.u32()?;
            let metadata = (0..num_uuids).map(|_| r.u64()).collect::<Result<_, _>>()?;
            KernelEvent::Bind(BindEvent::Combined {
                client,
                vm,
                va,
                length,
                metadata,
            })
        }
        uapi::EVENT_CONTEXT_PARAM => {
            let client = r.u64()?;
            let context = r.u64()?;
            let _ctx_id = r.u32()?;
            let size = r.u32()?;
            let param = r.u64()?;
            let value = r.u64()?;
            match param {
                uapi::CONTEXT_PARAM_VM => KernelEvent::ContextVm {
                    client,
                    context,
                    vm: value,
                },
                uapi::CONTEXT_PARAM_ENGINES => {
                    let _extensions = r.u64()?;
                    let count = (size as usize).saturating_sub(8) / 4;
                    let engines = (0..count).map(|_| engine(&mut r)).collect::<Result<_, _>>()?;
                    KernelEvent::ContextEngines {
                        client,
                        context,
                        engines,
                    }
                }
                other => {
                    return Err(Error::Decode(format!("unsupported context param {other:#x}")))
                }
            }
        }
        uapi::EVENT_ENGINES => {
            let client = r.u64()?;
            let context = r.u64()?;
            let count = r.u64()?;
            let lrcs = (0..count)
                .map(|_| Ok((engine(&mut r)?, r.u64()?)))
                .collect::<Result<_, Error>>()?;
            KernelEvent::Engines {
                client,
                context,
                lrcs,
            }
        }
        uapi::EVENT_EU_ATTENTION => {
            let client = r.u64()?;
            let context = r.u64()?;
            let lrc = r.u64()?;
            let _reserved = r.u32()?;
            let _flags = r.u32()?;
            let engine = engine(&mut r)?;
            let size = r.u32()?;
            KernelEvent::Attention(AttentionEvent {
                client,
                context: Some(context),
                exec_queue: None,
                lrc,
                engine: Some(engine),
                bitmask: r.bytes(size as usize)?,
            })
        }
        uapi::EVENT_PAGE_FAULT => {
            let client = r.u64()?;
            let context = r.u64()?;
            let lrc = r.u64()?;
            let _flags = r.u32()?;
            let engine = engine(&mut r)?;
            let size = r.u32()?;
            r.skip(4)?;
            let address = r.u64()?;
            KernelEvent::PageFault(PageFaultEvent {
                client,
                context: Some(context),
                exec_queue: None,
                lrc,
                engine: Some(engine),
                address,
                bitmask: r.bytes(size as usize)?,
            })
        }
        other => return Err(Error::Decode(format!("unknown i915 event type {other}"))),
    };

    Ok(event)
}

/// Connection to the i915 debugger of one process.
pub struct I915Backend {
    fd: OwnedFd,
}

impl I915Backend {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}

impl Backend for I915Backend {
    fn flavor(&self) -> KernelFlavor {
        KernelFlavor::I915
    }

    fn ack_policy(&self) -> AckPolicy {
        AckPolicy::BlockOnCpu
    }

    fn known_flags(&self) -> u32 {
        uapi::KNOWN_FLAGS
    }

    fn is_attention(&self, raw: &RawEvent) -> bool {
        raw.kind == uapi::EVENT_EU_ATTENTION
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
        // the kernel writes at most `size` bytes into it.
        unsafe {
            (*header).kind = uapi::EVENT_READ;
            (*header).size = uapi::MAX_EVENT_SIZE as u64;
            uapi::read_event(self.raw_fd(), header).map_err(|e| Error::Ioctl("read event", e))?;
        }

        let bytes: Bytes = words.iter().flat_map(|w| w.to_ne_bytes()).collect::<Vec<_>>().into();
        let mut r = PayloadReader::new(bytes.clone(), "i915 event header");
        let kind = r.u32()?;
        let flags = r.u32()?;
        let seqno = r.u64()?;
        let size = (r.u64()? as usize).clamp(uapi::HEADER_SIZE, uapi::MAX_EVENT_SIZE);

        Ok(RawEvent {
            kind,
            flags,
            seqno,
            payload: bytes.slice(uapi::HEADER_SIZE..size),
        })
    }

    fn decode(&self, raw: &RawEvent) -> Result<DecodedEvent, Error> {
        Ok(DecodedEvent {
            seqno: raw.seqno,
            flags: flags_from_wire(raw.flags)?,
            event: decode_payload(raw.kind, raw.payload.clone())?,
            ack: AckToken::from(raw),
        })
    }

    fn ack_event(&self, token: &AckToken) -> Result<(), Error> {
        let ack = uapi::EventAck {
            kind: token.kind,
            flags: token.flags,
            seqno: token.seqno,
        };
        // SAFETY: ack is a valid uapi struct for the whole call.
        unsafe { uapi::ack_event(self.raw_fd(), &ack) }.map_err(|e| Error::Ioctl("ack event", e))?;
        Ok(())
    }

    fn eu_control(&self, control: &EuControl) -> Result<EuControlReply, Error> {
        let mut bitmask = control.bitmask.clone();
        let mut request = uapi::EuControl {
            client_handle: control.client,
            cmd: match control.command {
                EuCommand::InterruptAll => uapi::EU_CONTROL_INTERRUPT_ALL,
                EuCommand::Interrupt => uapi::EU_CONTROL_INTERRUPT,
                EuCommand::Stopped => uapi::EU_CONTROL_STOPPED,
                EuCommand::Resume => uapi::EU_CONTROL_RESUME,
            },
            flags: 0,
            seqno: 0,
            engine_class: control.target.engine.class,
            engine_instance: control.target.engine.instance,
            bitmask_size: bitmask.len() as u32,
            bitmask_ptr: bitmask.as_mut_ptr() as u64,
        };
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
            client_handle: client,
            handle: vm,
            flags: if write {
                nix::libc::O_RDWR as u64
            } else {
                nix::libc::O_RDONLY as u64
            },
        };
        // SAFETY: request is a valid uapi struct, the returned descriptor is owned by us.
        let fd = unsafe { uapi::vm_open(self.raw_fd(), &request) }
            .map_err(|e| Error::Ioctl("vm open", e))?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Box::new(VmFile::new(fd, vm)))
    }

    fn read_metadata(&self, client: u64, handle: u64, size: u64) -> Result<Metadata, Error> {
        let mut data = vec![0u8; size as usize];
        let mut request = uapi::ReadUuid {
            client_handle: client,
            handle,
            flags: 0,
            uuid: [0; 36],
            payload_ptr: data.as_mut_ptr() as u64,
            payload_size: size,
        };
        // SAFETY: data outlives the call and its size is passed along.
        unsafe { uapi::read_uuid(self.raw_fd(), &mut request) }
            .map_err(|e| Error::Ioctl("read uuid", e))?;

        let uuid = String::from_utf8_lossy(&request.uuid)
            .trim_end_matches('\0')
            .to_string();
        Ok(Metadata {
            uuid: Some(uuid),
            data,
        })
    }

    fn close(&self) {
        log::debug!(target: "backend", "close i915 debug connection");
    }
}

pub struct I915Factory;

impl BackendFactory for I915Factory {
    fn flavor(&self) -> KernelFlavor {
        KernelFlavor::I915
    }

    fn supports(&self, device: &dyn Device) -> bool {
        device.driver().as_deref() == Some("i915")
    }

    fn open(&self, device: &dyn Device, pid: u32) -> Result<Box<dyn Backend>, Error> {
        let drm = device.drm_fd().ok_or(Error::UnsupportedFeature)?;
        let mut param = uapi::DebuggerOpen {
            pid: pid as u64,
            flags: 0,
            version: uapi::DEBUGGER_VERSION,
            events: 0,
            extensions: 0,
        };
        // SAFETY: param is a valid uapi struct, the returned descriptor is owned by us.
        let fd = unsafe { uapi::debugger_open(drm.as_raw_fd(), &mut param) }
            .map_err(Error::from_errno)?;
        Ok(Box::new(I915Backend::new(unsafe { OwnedFd::from_raw_fd(fd) })))
    }
}
