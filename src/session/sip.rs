//! Layout of the system routine (SIP) state save area and the module debug area.
//!
//! The state save area starts with a header describing where every register set of a thread
//! lives inside the per-thread slot. Each slot carries an SR ident whose counter tells whether
//! the thread currently executes the system routine.

use crate::backend::PayloadReader;
use crate::session::error::Error;
use crate::session::thread::ThreadId;
use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use strum_macros::{Display, EnumString};

pub const SIP_HEADER_MAGIC: &[u8; 8] = b"tssarea\0";
pub const SR_IDENT_MAGIC: &[u8; 8] = b"srmagic\0";
pub const DEBUG_AREA_MAGIC: &[u8; 8] = b"dbgarea\0";

/// Bytes read to parse a state save area header.
pub const SIP_HEADER_SIZE: usize = 256;
pub const SR_IDENT_SIZE: usize = 12;
pub const DEBUG_AREA_SIZE: usize = 32;

/// Command written into the command register to leave the system routine.
pub const SIP_COMMAND_RESUME: u32 = 0;

const REGSETS_OFFSET: usize = 48;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RegsetKind {
    Grf,
    Addr,
    Flag,
    /// Channel enable.
    Emask,
    Sr,
    Cr,
    Notification,
    Tdr,
    Acc,
    Mme,
    Ctrl,
    Dbg,
    Fc,
    Sp,
    /// System routine command register.
    Cmd,
}

impl RegsetKind {
    /// Register sets in header order, v2 headers append `Sp` and `Cmd`.
    const V1: [RegsetKind; 13] = [
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
    ];
    const V2: [RegsetKind; 2] = [RegsetKind::Sp, RegsetKind::Cmd];

    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            RegsetKind::Grf
                | RegsetKind::Addr
                | RegsetKind::Flag
                | RegsetKind::Sr
                | RegsetKind::Cr
                | RegsetKind::Acc
                | RegsetKind::Sp
                | RegsetKind::Dbg
                | RegsetKind::Fc
        )
    }
}

/// Location of a register set inside a thread slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegsetDesc {
    pub offset: u32,
    /// Number of registers.
    pub num: u16,
    pub bits: u16,
    pub bytes: u16,
}

/// Parsed state save area header.
#[derive(Clone, Debug, PartialEq)]
pub struct SipHeader {
    pub version: (u8, u8, u8),
    /// Header size in 8 byte units.
    pub size: u8,
    pub num_slices: u16,
    pub num_subslices_per_slice: u16,
    pub num_eus_per_subslice: u16,
    pub num_threads_per_eu: u16,
    pub state_area_offset: u32,
    pub state_save_size: u32,
    pub slm_area_offset: u32,
    pub slm_bank_size: u32,
    pub slm_bank_valid: u32,
    pub sr_magic_offset: u32,
    pub regsets: IndexMap<RegsetKind, RegsetDesc>,
}

impl SipHeader {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < REGSETS_OFFSET || &data[..8] != SIP_HEADER_MAGIC {
            return Err(Error::InvalidSipHeader);
        }
        Self::parse_fields(Bytes::copy_from_slice(data)).map_err(|_| Error::InvalidSipHeader)
    }

    fn parse_fields(data: Bytes) -> Result<Self, Error> {
        let mut r = PayloadReader::new(data, "state save area header");
        r.skip(10)?;
        let version = (r.bytes(1)?[0], r.bytes(1)?[0], r.bytes(1)?[0]);
        let size = r.bytes(1)?[0];
        r.skip(2)?;

        let mut header = SipHeader {
            version,
            size,
            num_slices: r.u16()?,
            num_subslices_per_slice: r.u16()?,
            num_eus_per_subslice: r.u16()?,
            num_threads_per_eu: r.u16()?,
            state_area_offset: r.u32()?,
            state_save_size: r.u32()?,
            slm_area_offset: r.u32()?,
            slm_bank_size: r.u32()?,
            slm_bank_valid: r.u32()?,
            sr_magic_offset: r.u32()?,
            regsets: IndexMap::new(),
        };

        let kinds = RegsetKind::V1
            .iter()
            .chain(RegsetKind::V2.iter().filter(|_| version.0 >= 2));
        for kind in kinds {
            let desc = RegsetDesc {
                offset: r.u32()?,
                num: r.u16()?,
                bits: r.u16()?,
                bytes: r.u16()?,
            };
            r.skip(2)?;
            header.regsets.insert(*kind, desc);
        }

        Ok(header)
    }

    /// Serialize into the in-memory layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SIP_HEADER_SIZE);
        buf.put_slice(SIP_HEADER_MAGIC);
        buf.put_u16_le(0);
        buf.put_u8(self.version.0);
        buf.put_u8(self.version.1);
        buf.put_u8(self.version.2);
        buf.put_u8(self.size);
        buf.put_u16_le(0);
        buf.put_u16_le(self.num_slices);
        buf.put_u16_le(self.num_subslices_per_slice);
        buf.put_u16_le(self.num_eus_per_subslice);
        buf.put_u16_le(self.num_threads_per_eu);
        buf.put_u32_le(self.state_area_offset);
        buf.put_u32_le(self.state_save_size);
        buf.put_u32_le(self.slm_area_offset);
        buf.put_u32_le(self.slm_bank_size);
        buf.put_u32_le(self.slm_bank_valid);
        buf.put_u32_le(self.sr_magic_offset);
        for desc in self.regsets.values() {
            buf.put_u32_le(desc.offset);
            buf.put_u16_le(desc.num);
            buf.put_u16_le(desc.bits);
            buf.put_u16_le(desc.bytes);
            buf.put_u16_le(0);
        }
        buf.resize(SIP_HEADER_SIZE.max(buf.len()), 0);
        buf.to_vec()
    }

    pub fn regset(&self, kind: RegsetKind) -> Result<&RegsetDesc, Error> {
        self.regsets
            .get(&kind)
            .filter(|desc| desc.num > 0)
            .ok_or(Error::RegsetNotAvailable(kind))
    }

    /// Offset of a thread slot from the start of the state save area.
    pub fn slot_offset(&self, id: ThreadId) -> u64 {
        let index = ((id.slice as u64 * self.num_subslices_per_slice as u64 + id.subslice as u64)
            * self.num_eus_per_subslice as u64
            + id.eu as u64)
            * self.num_threads_per_eu as u64
            + id.thread as u64;
        self.size as u64 * 8 + self.state_area_offset as u64 + index * self.state_save_size as u64
    }

    pub fn sr_ident_offset(&self, id: ThreadId) -> u64 {
        self.slot_offset(id) + self.sr_magic_offset as u64
    }

    /// Offset and length of registers `start..start + count` of a thread.
    pub fn register_range(
        &self,
        id: ThreadId,
        kind: RegsetKind,
        start: u32,
        count: u32,
    ) -> Result<(u64, usize), Error> {
        let desc = self.regset(kind)?;
        if count == 0 || start as u64 + count as u64 > desc.num as u64 {
            return Err(Error::InvalidArgument("register range out of bounds"));
        }
        let offset = self.slot_offset(id) + desc.offset as u64 + desc.bytes as u64 * start as u64;
        Ok((offset, desc.bytes as usize * count as usize))
    }
}

/// Per-thread system routine ident.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SrIdent {
    /// Generation counter, odd while the thread is inside the system routine.
    pub count: u8,
    pub version: [u8; 3],
}

impl SrIdent {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < SR_IDENT_SIZE || &data[..8] != SR_IDENT_MAGIC {
            return None;
        }
        Some(Self {
            count: data[8],
            version: [data[9], data[10], data[11]],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = SR_IDENT_MAGIC.to_vec();
        buf.push(self.count);
        buf.extend_from_slice(&self.version);
        buf
    }
}

/// Module debug area header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebugArea {
    pub bindless_sip: bool,
    pub version: u16,
    pub pgsize: u16,
    pub size: u32,
}

impl DebugArea {
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 24 || &data[..8] != DEBUG_AREA_MAGIC {
            return Err(Error::InvalidDebugArea);
        }
        let mut r = PayloadReader::new(Bytes::copy_from_slice(&data[8..]), "module debug area");
        let parse = |r: &mut PayloadReader| -> Result<Self, Error> {
            let reserved = r.u64()?;
            Ok(Self {
                bindless_sip: reserved & 1 != 0,
                version: r.u16()?,
                pgsize: r.u16()?,
                size: r.u32()?,
            })
        };
        parse(&mut r).map_err(|_| Error::InvalidDebugArea)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(DEBUG_AREA_SIZE);
        buf.put_slice(DEBUG_AREA_MAGIC);
        buf.put_u64_le(self.bindless_sip as u64);
        buf.put_u16_le(self.version);
        buf.put_u16_le(self.pgsize);
        buf.put_u32_le(self.size);
        buf.resize(DEBUG_AREA_SIZE, 0);
        buf.to_vec()
    }
}
