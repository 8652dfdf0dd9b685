use crate::backend::AckPolicy;
use crate::log::category;
use crate::session::error::Error;
use serde::Deserialize;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// How raw GPU memory is transferred through a VM handle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
pub enum MemoryAccess {
    /// Positional read/write on the VM file descriptor.
    #[default]
    #[strum(serialize = "positional")]
    Positional,
    /// Map a window of the VM and copy through the mapping.
    #[strum(serialize = "mmap")]
    Mmap,
}

/// Debug session configuration.
///
/// Every field has a default, so a configuration file only needs to list
/// the values it changes.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Process id of the debugged GPU workload.
    pub pid: u32,
    /// Expose every tile of a multi-tile device as its own sub-session.
    pub tile_attach: bool,
    /// Raw memory transfer mode.
    pub memory_access: MemoryAccess,
    /// Timeout of one poll on the backend handle.
    pub poll_timeout_ms: u64,
    /// Upper bound of the initial handshake.
    pub startup_timeout_ms: u64,
    /// Time an interrupt request may stay unsatisfied before its threads are reported unavailable.
    pub interrupt_timeout_ms: u64,
    /// Stopped threads are reported once no attention arrived for this long.
    pub attention_grace_ms: u64,
    /// Number of attention events to wait for after an interrupt before reporting stopped threads.
    /// By default, one attention per interrupted tile is expected.
    pub expected_attentions: Option<u32>,
    /// Capacity of the internal raw event channel.
    pub queue_capacity: usize,
    /// Number of retries of a zero-byte memory transfer.
    pub transfer_retries: u32,
    /// Enabled log categories, see [`crate::log::category`].
    pub log_categories: u32,
    /// Override the acknowledgment policy of the selected backend.
    pub ack_policy: Option<AckPolicy>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pid: 0,
            tile_attach: false,
            memory_access: MemoryAccess::default(),
            poll_timeout_ms: 1000,
            startup_timeout_ms: 3000,
            interrupt_timeout_ms: 2000,
            attention_grace_ms: 100,
            expected_attentions: None,
            queue_capacity: 4096,
            transfer_retries: 3,
            log_categories: category::DEFAULT,
            ack_policy: None,
        }
    }
}

impl SessionConfig {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn attention_grace(&self) -> Duration {
        Duration::from_millis(self.attention_grace_ms)
    }
}

/// Static description of a GPU device, used when hardware discovery is not available.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub tiles: u32,
    pub slices_per_tile: u32,
    pub subslices_per_slice: u32,
    pub eus_per_subslice: u32,
    pub threads_per_eu: u32,
    /// Width of GPU virtual addresses.
    pub va_bits: u8,
    /// Number of compute engine instances of a single tile.
    pub engines_per_tile: u16,
    /// Resume threads that were stopped only by a forced exception.
    pub forced_exception_check: bool,
    /// DRM render node, for example `/dev/dri/renderD128`.
    pub render_node: Option<PathBuf>,
    /// Kernel driver name, detected from sysfs when not set.
    pub driver: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tiles: 1,
            slices_per_tile: 1,
            subslices_per_slice: 8,
            eus_per_subslice: 8,
            threads_per_eu: 8,
            va_bits: 48,
            engines_per_tile: 4,
            forced_exception_check: true,
            render_node: None,
            driver: None,
        }
    }
}

/// Configuration file content: a `[session]` and a `[device]` table.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub device: DeviceConfig,
}

impl Config {
    pub fn from_toml(data: &str) -> Result<Self, Error> {
        Ok(toml::de::from_str(data)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = read_to_string(path)?;
        Self::from_toml(&data)
    }
}
