//! GPU memory and register access for the debugger API.
//!
//! Requests are resolved under the session lock into a transfer target (debugger copy of a
//! debug ELF, code segments bound on one or more tiles, or a VM of the debugged client);
//! the transfer itself runs without any lock held.

use crate::backend::VmAccess;
use crate::config::MemoryAccess;
use crate::session::error::Error;
use crate::session::sip::{self, RegsetKind, SipHeader, SrIdent};
use crate::session::thread::{DeviceThread, ThreadId};
use crate::session::{lock, Scope, Shared};
use crate::eu_mem;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use strum_macros::{Display, EnumString};

const PAGE_SIZE: u64 = 4096;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
pub enum AddressSpace {
    /// GPU virtual address space of the debugged context.
    #[default]
    #[strum(serialize = "default")]
    Default,
    /// Shared local memory of a thread group.
    #[strum(serialize = "slm")]
    Slm,
}

/// Address of a memory request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryDescriptor {
    pub space: AddressSpace,
    /// Canonical GPU virtual address.
    pub address: u64,
}

impl MemoryDescriptor {
    pub fn new(address: u64) -> Self {
        Self {
            space: AddressSpace::Default,
            address,
        }
    }
}

pub(crate) enum Buffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Buffer<'_> {
    fn len(&self) -> usize {
        match self {
            Buffer::Read(buf) => buf.len(),
            Buffer::Write(buf) => buf.len(),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Buffer::Write(_))
    }

    fn transfer_at(&mut self, vm: &dyn VmAccess, done: usize, offset: u64) -> io::Result<usize> {
        match self {
            Buffer::Read(buf) => vm.read_at(&mut buf[done..], offset),
            Buffer::Write(buf) => vm.write_at(&buf[done..], offset),
        }
    }

    /// Copy between the buffer and a region of the same size.
    fn copy(&mut self, region: &mut [u8]) {
        match self {
            Buffer::Read(buf) => buf.copy_from_slice(region),
            Buffer::Write(buf) => region.copy_from_slice(buf),
        }
    }
}

/// Where a memory request goes.
enum Target {
    /// Already served from the debugger copy of a debug ELF.
    Done,
    /// Code segment of every tile it is bound on. Reads use the first one.
    Isa { client: u64, vms: Vec<u64> },
    /// First VM that accepts the transfer.
    Vm { client: u64, vms: Vec<u64> },
}

fn validate(
    shared: &Shared,
    thread: &DeviceThread,
    desc: &MemoryDescriptor,
    len: usize,
) -> Result<(), Error> {
    if len == 0 {
        return Err(Error::InvalidArgument("empty buffer"));
    }
    if desc.space != AddressSpace::Default {
        if !thread.is_single() {
            return Err(Error::InvalidArgument("address space requires a single thread"));
        }
        return Err(Error::UnsupportedFeature);
    }

    let hw = shared.device.hw_info();
    if !hw.is_canonical(desc.address) {
        return Err(Error::InvalidArgument("address not canonical"));
    }
    let end = hw.decanonize(desc.address).checked_add(len as u64);
    let limit = 1u128 << hw.va_bits.min(64);
    if end.map_or(true, |end| end as u128 > limit) {
        return Err(Error::InvalidArgument("range out of address space"));
    }
    Ok(())
}

/// Tile and VM of a stopped thread.
fn stopped_thread(
    shared: &Shared,
    scope: Scope,
    thread: &DeviceThread,
) -> Result<(ThreadId, u64), Error> {
    let registry = lock(&shared.threads);
    let id = registry
        .thread_id(scope, thread)
        .ok_or(Error::InvalidArgument("thread out of range"))?;
    let state = registry.get(id).ok_or(Error::InvalidArgument("thread out of range"))?;
    if !state.is_stopped() {
        return Err(Error::NotAvailable);
    }
    let vm = state.memory_handle().ok_or(Error::NotAvailable)?;
    Ok((id, vm))
}

fn route(
    shared: &Shared,
    thread: Option<(ThreadId, u64)>,
    address: u64,
    buf: &mut Buffer,
) -> Result<Target, Error> {
    let gpu_address = shared.device.hw_info().decanonize(address);
    let len = buf.len();
    let mut state = lock(&shared.state);
    let client = state.client.ok_or(Error::Uninitialized("client"))?;
    let conn = state
        .clients
        .get_mut(&client)
        .ok_or(Error::Uninitialized("client"))?;

    let mut tiles: Vec<u32> = (0..conn.isa.len() as u32).collect();
    if let Some((id, _)) = thread {
        tiles.retain(|t| *t != id.tile);
        tiles.insert(0, id.tile);
    }
    let isa_vms: Vec<u64> = tiles
        .iter()
        .filter_map(|tile| conn.find_isa(*tile, gpu_address, len).map(|isa| isa.vm))
        .collect();
    if !isa_vms.is_empty() {
        return Ok(Target::Isa {
            client,
            vms: isa_vms,
        });
    }

    if let Some(elf) = conn.find_elf_mut(address, len) {
        let start = (address - elf.address) as usize;
        let op = if buf.is_write() { "write" } else { "read" };
        eu_mem!("{op} debug elf at {address:#x}, {len} bytes");
        buf.copy(&mut elf.data[start..start + len]);
        return Ok(Target::Done);
    }

    let vms = match thread {
        Some((_, vm)) => vec![vm],
        None => conn.vms.iter().copied().collect(),
    };
    Ok(Target::Vm { client, vms })
}

/// Read or write GPU memory on behalf of a debugger.
pub(crate) fn access(
    shared: &Shared,
    scope: Scope,
    thread: &DeviceThread,
    desc: &MemoryDescriptor,
    mut buf: Buffer,
) -> Result<(), Error> {
    validate(shared, thread, desc, buf.len())?;
    let stopped = if thread.is_single() {
        Some(stopped_thread(shared, scope, thread)?)
    } else {
        None
    };

    match route(shared, stopped, desc.address, &mut buf)? {
        Target::Done => Ok(()),
        Target::Isa { client, vms } if buf.is_write() => {
            for vm in vms {
                transfer(shared, client, vm, desc.address, &mut buf)?;
            }
            Ok(())
        }
        Target::Isa { client, vms } | Target::Vm { client, vms } => {
            let mut result = Err(Error::NotAvailable);
            for vm in vms {
                result = transfer(shared, client, vm, desc.address, &mut buf);
                if result.is_ok() {
                    break;
                }
            }
            result
        }
    }
}

/// Transfer the whole buffer at `address` of a VM.
pub(crate) fn transfer(
    shared: &Shared,
    client: u64,
    vm: u64,
    address: u64,
    buf: &mut Buffer,
) -> Result<(), Error> {
    let address = shared.device.hw_info().decanonize(address);
    let handle = shared.backend.vm_open(client, vm, buf.is_write()).map_err(|e| {
        log::warn!(target: "session::mem", "open vm {vm:#x}: {e}");
        Error::Unknown
    })?;
    eu_mem!(
        "{} vm {vm:#x} at {address:#x}, {} bytes",
        if buf.is_write() { "write" } else { "read" },
        buf.len()
    );

    handle.flush().map_err(unknown)?;
    let mapped = match shared.config.memory_access {
        MemoryAccess::Mmap => transfer_mapped(handle.as_ref(), address, buf)?,
        MemoryAccess::Positional => false,
    };
    if !mapped {
        transfer_positional(handle.as_ref(), address, buf, shared.config.transfer_retries)?;
    }
    handle.flush().map_err(unknown)
}

fn unknown(e: io::Error) -> Error {
    log::warn!(target: "session::mem", "vm transfer: {e}");
    Error::Unknown
}

/// Returns false if the VM handle cannot be mapped.
fn transfer_mapped(vm: &dyn VmAccess, address: u64, buf: &mut Buffer) -> Result<bool, Error> {
    let window_start = address & !(PAGE_SIZE - 1);
    let skip = (address - window_start) as usize;
    let window_len = (skip + buf.len()).div_ceil(PAGE_SIZE as usize) * PAGE_SIZE as usize;

    let Some(mut map) = vm.map(window_start, window_len).map_err(unknown)? else {
        return Ok(false);
    };
    buf.copy(&mut map[skip..skip + buf.len()]);
    if buf.is_write() {
        map.flush().map_err(unknown)?;
    }
    Ok(true)
}

/// Positional transfer; a transfer of zero bytes is retried up to `retries` times in a row.
fn transfer_positional(
    vm: &dyn VmAccess,
    address: u64,
    buf: &mut Buffer,
    retries: u32,
) -> Result<(), Error> {
    let len = buf.len();
    let mut done = 0;
    let mut budget = retries;

    while done < len {
        match buf.transfer_at(vm, done, address + done as u64) {
            Ok(0) => {
                if budget == 0 {
                    log::warn!(
                        target: "session::mem",
                        "vm transfer stalled at {:#x}",
                        address + done as u64,
                    );
                    return Err(Error::Unknown);
                }
                budget -= 1;
            }
            Ok(n) => {
                done += n;
                budget = retries;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(unknown(e)),
        }
    }
    Ok(())
}

/// SIP header of the debugged client and the GPU address of the state save area of a VM.
fn state_save_area(shared: &Shared, vm: u64) -> Result<(Arc<SipHeader>, u64, u64), Error> {
    let (client, area, cached) = {
        let state = lock(&shared.state);
        let conn = state.connection()?;
        let area = conn
            .state_save_area
            .get(&vm)
            .or_else(|| {
                conn.state_save_area
                    .iter()
                    .min_by_key(|(vm, _)| **vm)
                    .map(|(_, info)| info)
            })
            .ok_or(Error::NoStateSaveArea(vm))?;
        (conn.handle, area.gpu_va, state.sip.clone())
    };
    if let Some(sip) = cached {
        return Ok((sip, client, area));
    }

    let mut data = vec![0u8; sip::SIP_HEADER_SIZE];
    transfer(shared, client, vm, area, &mut Buffer::Read(&mut data))?;
    let sip = Arc::new(SipHeader::parse(&data)?);
    log::debug!(
        target: "session::mem",
        "sip header v{}.{}.{}, {} register sets",
        sip.version.0,
        sip.version.1,
        sip.version.2,
        sip.regsets.len()
    );
    lock(&shared.state).sip = Some(sip.clone());
    Ok((sip, client, area))
}

/// Read the system routine ident of a thread executing in `vm`.
pub(crate) fn read_sr_ident(shared: &Shared, vm: u64, id: ThreadId) -> Result<SrIdent, Error> {
    let (sip, client, area) = state_save_area(shared, vm)?;
    let mut data = [0u8; sip::SR_IDENT_SIZE];
    transfer(shared, client, vm, area + sip.sr_ident_offset(id), &mut Buffer::Read(&mut data))?;
    SrIdent::parse(&data).ok_or(Error::InvalidSrIdent(id))
}

/// Transfer registers of a stopped thread starting at register `start`.
/// The buffer may cover a part of the last register.
pub(crate) fn thread_registers(
    shared: &Shared,
    id: ThreadId,
    kind: RegsetKind,
    start: u32,
    mut buf: Buffer,
) -> Result<(), Error> {
    let vm = lock(&shared.threads)
        .get(id)
        .filter(|t| t.is_stopped())
        .and_then(|t| t.memory_handle())
        .ok_or(Error::NotAvailable)?;
    let (sip, client, area) = state_save_area(shared, vm)?;

    let bytes = sip.regset(kind)?.bytes.max(1) as usize;
    let count = buf.len().div_ceil(bytes).max(1) as u32;
    let (offset, _) = sip.register_range(id, kind, start, count)?;
    transfer(shared, client, vm, area + offset, &mut buf)
}

/// Read `count` registers of a stopped thread.
pub(crate) fn read_thread_registers(
    shared: &Shared,
    id: ThreadId,
    kind: RegsetKind,
    start: u32,
    count: u32,
) -> Result<Vec<u8>, Error> {
    let sip = lock(&shared.state).sip.clone();
    let bytes = match sip {
        Some(sip) => sip.regset(kind)?.bytes as usize,
        None => return Err(Error::Uninitialized("state save area")),
    };
    if count == 0 {
        return Err(Error::InvalidArgument("empty register range"));
    }
    let mut values = vec![0u8; bytes * count as usize];
    thread_registers(shared, id, kind, start, Buffer::Read(&mut values))?;
    Ok(values)
}

pub(crate) fn read_registers(
    shared: &Shared,
    scope: Scope,
    thread: &DeviceThread,
    kind: RegsetKind,
    start: u32,
    count: u32,
) -> Result<Vec<u8>, Error> {
    let (id, _) = stopped_thread(shared, scope, thread)?;
    read_thread_registers(shared, id, kind, start, count)
}

pub(crate) fn write_registers(
    shared: &Shared,
    scope: Scope,
    thread: &DeviceThread,
    kind: RegsetKind,
    start: u32,
    values: &[u8],
) -> Result<(), Error> {
    if !kind.is_writable() {
        return Err(Error::RegsetReadOnly(kind));
    }
    if values.is_empty() {
        return Err(Error::InvalidArgument("empty register range"));
    }
    let (id, _) = stopped_thread(shared, scope, thread)?;
    thread_registers(shared, id, kind, start, Buffer::Write(values))
}
