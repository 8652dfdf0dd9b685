//! Bookkeeping of one debugged client: VMs, contexts, exec queues, metadata,
//! code segments and modules.
//!
//! Objects refer to each other by kernel handles, never by reference, so destroy events
//! racing with in-flight events only lead to failed lookups.

use crate::backend::{AckToken, MetadataKind};
use crate::device::EngineInstance;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ContextInfo {
    pub vm: Option<u64>,
    pub engines: Vec<EngineInstance>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ExecQueueInfo {
    pub vm: u64,
    pub engine_class: u16,
    pub lrcs: Vec<u64>,
}

/// GPU range a special buffer is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindInfo {
    pub gpu_va: u64,
    pub size: u64,
}

/// Content of a metadata object as read from the kernel.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct MetadataRecord {
    pub kind: MetadataKind,
    pub uuid: Option<String>,
    pub data: Vec<u8>,
}

impl MetadataRecord {
    fn u32_at(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Number of segments of a module.
    pub fn segment_count(&self) -> Option<u32> {
        self.u32_at(0)
    }

    /// Tiles a module is instanced on, `0` if not specified.
    pub fn device_bitfield(&self) -> u32 {
        self.u32_at(4).unwrap_or(0)
    }

    /// Sub-device index and count of a command queue notification.
    pub fn sub_device(&self) -> Option<(u32, u32)> {
        Some((self.u32_at(0)?, self.u32_at(4)?))
    }
}

/// Extract the CPU address of an ELF image encoded in the last two UUID groups.
pub(crate) fn elf_address_from_uuid(uuid: &str) -> Option<u64> {
    let tail = uuid.get(19..)?;
    let (high, low) = tail.split_once('-')?;
    let high = u64::from_str_radix(high, 16).ok()?;
    let low = u64::from_str_radix(low, 16).ok()?;
    Some(low | ((high & 0xFFFF) << 48))
}

/// Debug ELF image kept in debugger memory.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ElfBlob {
    pub address: u64,
    pub data: Vec<u8>,
}

impl ElfBlob {
    pub fn end(&self) -> u64 {
        self.address + self.data.len() as u64
    }

    pub fn contains(&self, address: u64, size: usize) -> bool {
        address >= self.address && address.saturating_add(size as u64) <= self.end()
    }
}

/// One bound code segment.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct IsaAllocation {
    pub vm: u64,
    pub va: u64,
    pub size: u64,
    pub elf: Option<u64>,
    pub module: Option<u64>,
    pub bind_count: u32,
    /// A module load event was delivered for this segment.
    pub load_reported: bool,
    pub acked: bool,
    pub pending_acks: Vec<AckToken>,
}

impl IsaAllocation {
    pub fn contains(&self, address: u64, size: usize) -> bool {
        address >= self.va && address.saturating_add(size as u64) <= self.va + self.size
    }
}

/// Per tile state of a module.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct TileModule {
    pub bind_count: u32,
    pub load_addresses: BTreeSet<u64>,
    pub loaded: bool,
    /// Load event was delivered to the tile session.
    pub reported: bool,
    pub acked: bool,
    pub pending_acks: Vec<AckToken>,
}

/// Multi-segment module.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Module {
    pub segment_count: u32,
    pub device_bitfield: u32,
    pub elf: Option<u64>,
    /// Load address delivered to the root session.
    pub reported: Option<u64>,
    pub tiles: Vec<TileModule>,
}

impl Module {
    pub fn new(segment_count: u32, device_bitfield: u32, tiles: u32) -> Self {
        Self {
            segment_count,
            device_bitfield,
            elf: None,
            reported: None,
            tiles: vec![TileModule::default(); tiles.max(1) as usize],
        }
    }

    /// Tiles that must all load the module before it counts as loaded on the device.
    pub fn applicable_tiles(&self, tile: u32) -> Vec<u32> {
        if self.device_bitfield == 0 {
            return vec![tile];
        }
        (0..self.tiles.len() as u32)
            .filter(|t| self.device_bitfield & (1 << t) != 0)
            .collect()
    }

    pub fn load_address(&self, tile: u32) -> Option<u64> {
        self.tiles
            .get(tile as usize)
            .and_then(|t| t.load_addresses.first().copied())
    }
}

/// State of one debugged client.
pub(crate) struct ClientConnection {
    pub handle: u64,
    pub vms: BTreeSet<u64>,
    pub contexts: HashMap<u64, ContextInfo>,
    pub lrc_to_context: HashMap<u64, u64>,
    pub exec_queues: HashMap<u64, ExecQueueInfo>,
    pub lrc_to_exec_queue: HashMap<u64, u64>,
    pub vm_to_tile: HashMap<u64, u32>,
    /// Code segments of each tile keyed by GPU address.
    pub isa: Vec<BTreeMap<u64, IsaAllocation>>,
    pub elfs: HashMap<u64, ElfBlob>,
    pub metadata: HashMap<u64, MetadataRecord>,
    /// Registered metadata classes.
    pub classes: HashMap<u64, MetadataKind>,
    pub modules: HashMap<u64, Module>,
    pub state_save_area: HashMap<u64, BindInfo>,
    pub state_base_area: HashMap<u64, BindInfo>,
    pub module_debug_area: HashMap<u64, BindInfo>,
    /// Live command queues and the tile they belong to.
    pub command_queues: BTreeMap<u64, Option<u32>>,
}

impl ClientConnection {
    pub fn new(handle: u64, tiles: u32) -> Self {
        Self {
            handle,
            vms: BTreeSet::new(),
            contexts: HashMap::new(),
            lrc_to_context: HashMap::new(),
            exec_queues: HashMap::new(),
            lrc_to_exec_queue: HashMap::new(),
            vm_to_tile: HashMap::new(),
            isa: vec![BTreeMap::new(); tiles.max(1) as usize],
            elfs: HashMap::new(),
            metadata: HashMap::new(),
            classes: HashMap::new(),
            modules: HashMap::new(),
            state_save_area: HashMap::new(),
            state_base_area: HashMap::new(),
            module_debug_area: HashMap::new(),
            command_queues: BTreeMap::new(),
        }
    }

    /// VM of an attention or page fault source.
    pub fn resolve_vm(
        &self,
        context: Option<u64>,
        exec_queue: Option<u64>,
        lrc: u64,
    ) -> Option<u64> {
        if let Some(queue) = exec_queue.or_else(|| self.lrc_to_exec_queue.get(&lrc).copied()) {
            if let Some(info) = self.exec_queues.get(&queue) {
                return Some(info.vm);
            }
        }
        let context = self
            .lrc_to_context
            .get(&lrc)
            .copied()
            .or(context)?;
        self.contexts.get(&context)?.vm
    }

    pub fn vm_tile(&self, vm: u64) -> u32 {
        self.vm_to_tile.get(&vm).copied().unwrap_or(0)
    }

    /// Exec queue and its first logical ring context usable for eu-control on a tile.
    pub fn eu_control_queue(&self, tile: u32) -> Option<(u64, u64)> {
        self.exec_queues
            .iter()
            .filter(|(_, info)| self.vm_tile(info.vm) == tile)
            .min_by_key(|(handle, _)| **handle)
            .and_then(|(handle, info)| info.lrcs.first().map(|lrc| (*handle, *lrc)))
    }

    /// Record a context parameter and derive the tile of the context VM when possible.
    pub fn update_context(
        &mut self,
        context: u64,
        vm: Option<u64>,
        engines: Option<Vec<EngineInstance>>,
        engine_tile: impl Fn(EngineInstance) -> Option<u32>,
    ) {
        let info = self.contexts.entry(context).or_default();
        if vm.is_some() {
            info.vm = vm;
        }
        if let Some(engines) = engines {
            info.engines = engines;
        }

        if let (Some(vm), Some(engine)) = (info.vm, info.engines.first()) {
            if let Some(tile) = engine_tile(*engine) {
                self.vm_to_tile.insert(vm, tile);
            }
        }
    }

    pub fn find_isa(&self, tile: u32, address: u64, size: usize) -> Option<&IsaAllocation> {
        let map = self.isa.get(tile as usize)?;
        map.range(..=address)
            .next_back()
            .map(|(_, isa)| isa)
            .filter(|isa| isa.contains(address, size))
    }

    pub fn find_elf_mut(&mut self, address: u64, size: usize) -> Option<&mut ElfBlob> {
        self.elfs.values_mut().find(|elf| elf.contains(address, size))
    }

    pub fn metadata_kind(&self, handle: u64) -> Option<MetadataKind> {
        self.metadata.get(&handle).map(|m| m.kind)
    }

    /// Bind info map of a special buffer kind.
    pub fn bind_info_mut(&mut self, kind: MetadataKind) -> Option<&mut HashMap<u64, BindInfo>> {
        match kind {
            MetadataKind::StateSaveArea => Some(&mut self.state_save_area),
            MetadataKind::StateBaseArea => Some(&mut self.state_base_area),
            MetadataKind::ModuleDebugArea => Some(&mut self.module_debug_area),
            _ => None,
        }
    }

    /// True if a command queue is live in the scope of `tile` (`None` - whole device).
    pub fn has_command_queue(&self, tile: Option<u32>) -> bool {
        self.command_queues
            .values()
            .any(|t| tile.is_none() || *t == tile)
    }
}
