//! Hardware side of a debug session: topology, engine placement, attention bitmask layout
//! and GPU virtual address form.

use crate::config::DeviceConfig;
use crate::session::error::Error;
use crate::session::thread::ThreadId;
use bit_field::BitField;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};

/// Engine class of compute engines.
pub const ENGINE_CLASS_COMPUTE: u16 = 4;
/// Engine class of render engines.
pub const ENGINE_CLASS_RENDER: u16 = 0;

/// Engine class/instance pair as reported by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineInstance {
    pub class: u16,
    pub instance: u16,
}

/// EU thread topology of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    pub tiles: u32,
    pub slices_per_tile: u32,
    pub subslices_per_slice: u32,
    pub eus_per_subslice: u32,
    pub threads_per_eu: u32,
}

impl Topology {
    pub fn threads_per_tile(&self) -> usize {
        (self.slices_per_tile
            * self.subslices_per_slice
            * self.eus_per_subslice
            * self.threads_per_eu) as usize
    }

    pub fn total_threads(&self) -> usize {
        self.threads_per_tile() * self.tiles as usize
    }

    /// Bytes used by one EU in an attention bitmask.
    pub fn bytes_per_eu(&self) -> usize {
        (self.threads_per_eu as usize).div_ceil(8)
    }

    /// Size of an attention bitmask of a single tile.
    pub fn bitmask_size(&self) -> usize {
        (self.slices_per_tile * self.subslices_per_slice * self.eus_per_subslice) as usize
            * self.bytes_per_eu()
    }

    /// Index of a thread inside its tile.
    pub fn tile_local_index(&self, id: ThreadId) -> usize {
        let eu =
            (id.slice * self.subslices_per_slice + id.subslice) * self.eus_per_subslice + id.eu;
        (eu * self.threads_per_eu + id.thread) as usize
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        id.tile < self.tiles
            && id.slice < self.slices_per_tile
            && id.subslice < self.subslices_per_slice
            && id.eu < self.eus_per_subslice
            && id.thread < self.threads_per_eu
    }
}

/// Hardware description consumed by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HwInfo {
    pub topology: Topology,
    /// Width of a GPU virtual address in bits.
    pub va_bits: u8,
    /// Threads stopped only by a forced exception are resumed instead of being reported.
    /// This is a hardware specific heuristic, not a general rule.
    pub forced_exception_check: bool,
}

impl HwInfo {
    /// Drop the sign extension of a canonical GPU address.
    pub fn decanonize(&self, address: u64) -> u64 {
        if self.va_bits >= 64 {
            return address;
        }
        address & ((1u64 << self.va_bits) - 1)
    }

    /// Sign-extend the highest address bit.
    pub fn canonize(&self, address: u64) -> u64 {
        if self.va_bits >= 64 {
            return address;
        }
        let shift = 64 - self.va_bits as u32;
        (((address << shift) as i64) >> shift) as u64
    }

    /// True if the address is either below the VA width or a valid sign extension of it.
    pub fn is_canonical(&self, address: u64) -> bool {
        self.canonize(self.decanonize(address)) == address || address >> self.va_bits == 0
    }
}

/// Conversion between attention bitmasks and thread coordinates of a hardware family.
pub trait AttentionCodec: Send + Sync {
    /// Threads whose bit is set in a single tile bitmask.
    fn threads(&self, topology: &Topology, tile: u32, bitmask: &[u8]) -> Vec<ThreadId>;

    /// Bitmask of a single tile with the bits of the given threads set.
    /// Threads of other tiles are ignored.
    fn bitmask(&self, topology: &Topology, tile: u32, threads: &[ThreadId]) -> Vec<u8>;
}

/// Bitmask layout where each EU owns `ceil(threads_per_eu / 8)` consecutive bytes,
/// ordered by slice, subslice and EU.
#[derive(Clone, Copy, Debug, Default)]
pub struct LinearCodec;

impl AttentionCodec for LinearCodec {
    fn threads(&self, topology: &Topology, tile: u32, bitmask: &[u8]) -> Vec<ThreadId> {
        let bytes_per_eu = topology.bytes_per_eu();
        let mut threads = vec![];

        for slice in 0..topology.slices_per_tile {
            for subslice in 0..topology.subslices_per_slice {
                for eu in 0..topology.eus_per_subslice {
                    let eu_index = ((slice * topology.subslices_per_slice + subslice)
                        * topology.eus_per_subslice
                        + eu) as usize;
                    for thread in 0..topology.threads_per_eu {
                        let byte = eu_index * bytes_per_eu + thread as usize / 8;
                        let Some(value) = bitmask.get(byte) else {
                            return threads;
                        };
                        if value.get_bit(thread as usize % 8) {
                            threads.push(ThreadId {
                                tile,
                                slice,
                                subslice,
                                eu,
                                thread,
                            });
                        }
                    }
                }
            }
        }

        threads
    }

    fn bitmask(&self, topology: &Topology, tile: u32, threads: &[ThreadId]) -> Vec<u8> {
        let bytes_per_eu = topology.bytes_per_eu();
        let mut bitmask = vec![0u8; topology.bitmask_size()];

        for id in threads
            .iter()
            .filter(|id| id.tile == tile && topology.contains(**id))
        {
            let eu_index = ((id.slice * topology.subslices_per_slice + id.subslice)
                * topology.eus_per_subslice
                + id.eu) as usize;
            let byte = eu_index * bytes_per_eu + id.thread as usize / 8;
            bitmask[byte].set_bit(id.thread as usize % 8, true);
        }

        bitmask
    }
}

/// Device handle consumed by a debug session.
pub trait Device: Send + Sync {
    fn hw_info(&self) -> &HwInfo;

    /// Tile that executes the given engine.
    fn engine_tile(&self, engine: EngineInstance) -> Option<u32>;

    /// Engine used to address eu-control requests to a tile.
    fn tile_engine(&self, tile: u32) -> EngineInstance;

    fn attention_codec(&self) -> &dyn AttentionCodec;

    /// Opened DRM device, if any.
    fn drm_fd(&self) -> Option<BorrowedFd<'_>>;

    /// Name of the kernel driver bound to the device (`i915`, `xe`).
    fn driver(&self) -> Option<String>;
}

/// Device described by configuration.
pub struct StaticDevice {
    hw: HwInfo,
    engines_per_tile: u16,
    codec: LinearCodec,
    node: Option<(PathBuf, File)>,
    driver: Option<String>,
}

impl StaticDevice {
    pub fn new(hw: HwInfo, engines_per_tile: u16) -> Self {
        Self {
            hw,
            engines_per_tile: engines_per_tile.max(1),
            codec: LinearCodec,
            node: None,
            driver: None,
        }
    }

    /// Create a device from configuration and open its render node if one is set.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, Error> {
        let hw = HwInfo {
            topology: Topology {
                tiles: config.tiles.max(1),
                slices_per_tile: config.slices_per_tile,
                subslices_per_slice: config.subslices_per_slice,
                eus_per_subslice: config.eus_per_subslice,
                threads_per_eu: config.threads_per_eu,
            },
            va_bits: config.va_bits,
            forced_exception_check: config.forced_exception_check,
        };
        let mut device = Self::new(hw, config.engines_per_tile);
        device.driver = config.driver.clone();
        if let Some(path) = config.render_node.as_deref() {
            device = device.with_render_node(path)?;
        }
        Ok(device)
    }

    pub fn with_render_node(mut self, path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.node = Some((path.to_path_buf(), file));
        Ok(self)
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    /// Driver name from `/sys/class/drm/<node>/device/driver`.
    fn sysfs_driver(path: &Path) -> Option<String> {
        let node = path.file_name()?;
        let link = Path::new("/sys/class/drm")
            .join(node)
            .join("device")
            .join("driver");
        let target = fs::read_link(link).ok()?;
        Some(target.file_name()?.to_string_lossy().into_owned())
    }
}

impl Device for StaticDevice {
    fn hw_info(&self) -> &HwInfo {
        &self.hw
    }

    fn engine_tile(&self, engine: EngineInstance) -> Option<u32> {
        let tile = (engine.instance / self.engines_per_tile) as u32;
        (tile < self.hw.topology.tiles).then_some(tile)
    }

    fn tile_engine(&self, tile: u32) -> EngineInstance {
        EngineInstance {
            class: ENGINE_CLASS_COMPUTE,
            instance: tile as u16 * self.engines_per_tile,
        }
    }

    fn attention_codec(&self) -> &dyn AttentionCodec {
        &self.codec
    }

    fn drm_fd(&self) -> Option<BorrowedFd<'_>> {
        self.node.as_ref().map(|(_, file)| file.as_fd())
    }

    fn driver(&self) -> Option<String> {
        self.driver.clone().or_else(|| {
            self.node
                .as_ref()
                .and_then(|(path, _)| Self::sysfs_driver(path))
        })
    }
}
