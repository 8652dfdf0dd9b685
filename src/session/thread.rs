use crate::device::Topology;
use crate::session::Scope;
use crate::eu_thread;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Hardware coordinates of an EU thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId {
    pub tile: u32,
    pub slice: u32,
    pub subslice: u32,
    pub eu: u32,
    pub thread: u32,
}

impl ThreadId {
    pub fn new(tile: u32, slice: u32, subslice: u32, eu: u32, thread: u32) -> Self {
        Self {
            tile,
            slice,
            subslice,
            eu,
            thread,
        }
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tile:{} slice:{} subslice:{} eu:{} thread:{}",
            self.tile, self.slice, self.subslice, self.eu, self.thread
        )
    }
}

/// Thread selector used by the debugger API. `None` in a component selects all values of it.
///
/// In a root session of a multi-tile device slices are numbered across tiles,
/// in a tile session slices are local to the tile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceThread {
    pub slice: Option<u32>,
    pub subslice: Option<u32>,
    pub eu: Option<u32>,
    pub thread: Option<u32>,
}

impl DeviceThread {
    pub const ALL: DeviceThread = DeviceThread {
        slice: None,
        subslice: None,
        eu: None,
        thread: None,
    };

    pub fn single(slice: u32, subslice: u32, eu: u32, thread: u32) -> Self {
        Self {
            slice: Some(slice),
            subslice: Some(subslice),
            eu: Some(eu),
            thread: Some(thread),
        }
    }

    pub fn is_all(&self) -> bool {
        *self == Self::ALL
    }

    pub fn is_single(&self) -> bool {
        self.slice.is_some()
            && self.subslice.is_some()
            && self.eu.is_some()
            && self.thread.is_some()
    }

    /// True if `other` is selected by this selector.
    pub fn covers(&self, other: &DeviceThread) -> bool {
        fn part(sel: Option<u32>, value: Option<u32>) -> bool {
            sel.is_none() || sel == value
        }
        part(self.slice, other.slice)
            && part(self.subslice, other.subslice)
            && part(self.eu, other.eu)
            && part(self.thread, other.thread)
    }
}

impl Display for DeviceThread {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn part(v: Option<u32>) -> String {
            v.map(|v| v.to_string()).unwrap_or_else(|| "*".to_string())
        }
        write!(
            f,
            "slice:{} subslice:{} eu:{} thread:{}",
            part(self.slice),
            part(self.subslice),
            part(self.eu),
            part(self.thread)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Stopped,
    Unavailable,
}

/// Execution state of a single EU thread.
#[derive(Clone, Debug, PartialEq)]
pub struct EuThread {
    id: ThreadId,
    state: ThreadState,
    /// Last observed system routine generation counter.
    sr_counter: u8,
    /// VM in which the thread executed when it stopped.
    memory_handle: Option<u64>,
    context: Option<u64>,
    lrc: Option<u64>,
    page_faulted: bool,
}

impl EuThread {
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            state: ThreadState::Running,
            sr_counter: 0,
            memory_handle: None,
            context: None,
            lrc: None,
            page_faulted: false,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.state == ThreadState::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.state == ThreadState::Running
    }

    pub fn memory_handle(&self) -> Option<u64> {
        self.memory_handle
    }

    pub fn context(&self) -> Option<u64> {
        self.context
    }

    pub fn lrc(&self) -> Option<u64> {
        self.lrc
    }

    pub fn is_page_faulted(&self) -> bool {
        self.page_faulted
    }

    pub fn sr_counter(&self) -> u8 {
        self.sr_counter
    }

    /// Check a new system routine counter value and update the thread state.
    ///
    /// An odd counter means the thread is inside the system routine (stopped),
    /// an even one means it left it. Returns true if the thread must be treated
    /// as stopped with this counter.
    pub fn verify_stopped(&mut self, counter: u8) -> bool {
        eu_thread!(
            "verify stopped, thread {id}, counter: {counter}, previous: {prev}",
            id = self.id,
            prev = self.sr_counter
        );

        if counter == self.sr_counter && counter % 2 != 0 {
            if self.state == ThreadState::Running {
                log::warn!(
                    target: "session::thread",
                    "thread {} running with odd counter, switch to stopped",
                    self.id,
                );
            }
            self.state = ThreadState::Stopped;
            return true;
        }

        if counter == self.sr_counter.wrapping_add(2) {
            self.state = ThreadState::Stopped;
            self.sr_counter = counter;
            return true;
        } else if counter > self.sr_counter.wrapping_add(2) {
            log::warn!(target: "session::thread", "thread {} counter out of sync", self.id);
        }

        if counter % 2 == 0 {
            if self.state == ThreadState::Stopped {
                log::warn!(
                    target: "session::thread",
                    "thread {} stopped with even counter",
                    self.id,
                );
            }
            self.state = ThreadState::Running;
            return false;
        }

        self.state = ThreadState::Stopped;
        self.sr_counter = counter;
        true
    }

    pub fn stop(&mut self, vm: u64) {
        eu_thread!("thread {id} stopped in vm {vm:#x}", id = self.id);
        self.state = ThreadState::Stopped;
        self.memory_handle = Some(vm);
    }

    /// Returns false if the thread was not stopped.
    pub fn resume(&mut self) -> bool {
        if self.state != ThreadState::Stopped {
            return false;
        }
        eu_thread!("thread {id} resumed", id = self.id);
        self.state = ThreadState::Running;
        self.memory_handle = None;
        self.page_faulted = false;
        true
    }

    pub fn set_unavailable(&mut self) {
        self.state = ThreadState::Unavailable;
    }

    pub fn set_queue(&mut self, context: Option<u64>, lrc: Option<u64>) {
        self.context = context;
        self.lrc = lrc;
    }

    pub fn set_page_faulted(&mut self, faulted: bool) {
        self.page_faulted = faulted;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.id);
    }
}

/// Registry of all EU threads of a device, created once for the whole topology.
pub struct ThreadRegistry {
    topology: Topology,
    threads: Vec<EuThread>,
}

impl ThreadRegistry {
    pub fn new(topology: Topology) -> Self {
        let mut threads = Vec::with_capacity(topology.total_threads());
        for tile in 0..topology.tiles {
            for slice in 0..topology.slices_per_tile {
                for subslice in 0..topology.subslices_per_slice {
                    for eu in 0..topology.eus_per_subslice {
                        for thread in 0..topology.threads_per_eu {
                            threads.push(EuThread::new(ThreadId::new(
                                tile, slice, subslice, eu, thread,
                            )));
                        }
                    }
                }
            }
        }
        Self { topology, threads }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    fn index(&self, id: ThreadId) -> Option<usize> {
        if !self.topology.contains(id) {
            return None;
        }
        Some(
            id.tile as usize * self.topology.threads_per_tile()
                + self.topology.tile_local_index(id),
        )
    }

    pub fn get(&self, id: ThreadId) -> Option<&EuThread> {
        self.index(id).map(|idx| &self.threads[idx])
    }

    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut EuThread> {
        self.index(id).map(|idx| &mut self.threads[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &EuThread> {
        self.threads.iter()
    }

    /// Convert an API selector component-wise into hardware coordinates.
    /// Returns `None` for selectors that are not a single thread or point outside the topology.
    pub fn thread_id(&self, scope: Scope, thread: &DeviceThread) -> Option<ThreadId> {
        if !thread.is_single() {
            return None;
        }
        let slice = thread.slice?;
        let (tile, slice) = match scope {
            Scope::Tile(tile) => (tile, slice),
            Scope::Root => (
                slice / self.topology.slices_per_tile,
                slice % self.topology.slices_per_tile,
            ),
        };
        let id = ThreadId::new(tile, slice, thread.subslice?, thread.eu?, thread.thread?);
        self.topology.contains(id).then_some(id)
    }

    /// Convert hardware coordinates into an API selector of the given scope.
    pub fn device_thread(&self, scope: Scope, id: ThreadId) -> DeviceThread {
        let slice = match scope {
            Scope::Tile(_) => id.slice,
            Scope::Root => id.tile * self.topology.slices_per_tile + id.slice,
        };
        DeviceThread::single(slice, id.subslice, id.eu, id.thread)
    }

    /// All threads selected by an API selector.
    pub fn select(&self, scope: Scope, selector: &DeviceThread) -> Vec<ThreadId> {
        self.threads
            .iter()
            .map(|t| t.id)
            .filter(|id| match scope {
                Scope::Tile(tile) => id.tile == tile,
                Scope::Root => true,
            })
            .filter(|id| selector.covers(&self.device_thread(scope, *id)))
            .collect()
    }

    /// Tiles touched by an API selector.
    pub fn tiles(&self, scope: Scope, selector: &DeviceThread) -> Vec<u32> {
        match scope {
            Scope::Tile(tile) => vec![tile],
            Scope::Root => match selector.slice {
                Some(slice) => vec![slice / self.topology.slices_per_tile],
                None => (0..self.topology.tiles).collect(),
            },
        }
    }

    pub fn all_stopped(&self, ids: &[ThreadId]) -> bool {
        !ids.is_empty() && ids.iter().all(|id| self.get(*id).is_some_and(|t| t.is_stopped()))
    }

    pub fn stopped(&self, tile: u32) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|t| t.id.tile == tile && t.is_stopped())
            .map(|t| t.id)
            .collect()
    }

    pub fn reset(&mut self) {
        self.threads.iter_mut().for_each(EuThread::reset);
    }
}
