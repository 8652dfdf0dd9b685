//! Tile sessions of a multi-tile device.
//!
//! Event dispatch stays with the parent session; a tile session only owns its event queue and
//! attach state. Requests made through a tile session address threads with tile-local slices.

use crate::session::bind;
use crate::session::error::Error;
use crate::session::event::{DebugEvent, DebugEventKind, DetachReason, EventQueue};
use crate::session::memory::{self, Buffer, MemoryDescriptor};
use crate::session::sip::RegsetKind;
use crate::session::thread::DeviceThread;
use crate::session::{lock, Scope, Shared};
use crate::eu_info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct TileState {
    pub events: EventQueue,
    attached: AtomicBool,
}

impl TileState {
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

impl Shared {
    fn attach_tile(&self, tile: u32) -> Result<(), Error> {
        let state = self
            .tiles
            .get(tile as usize)
            .ok_or(Error::InvalidArgument("no such tile"))?;

        // the dispatcher reads the attach state under the same lock, a load is either
        // replayed here or reported live afterwards
        let mut session = lock(&self.state);
        if state.attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        state.events.clear();

        let mut replay = vec![];
        if session
            .clients
            .values()
            .any(|conn| conn.has_command_queue(Some(tile)))
        {
            replay.push(DebugEvent::new(DebugEventKind::ProcessEntry));
        }
        let hw = self.device.hw_info();
        for conn in session.clients.values_mut() {
            replay.extend(bind::attach_tile(conn, tile, hw));
        }
        if self.detached.load(Ordering::SeqCst) {
            replay.push(DebugEvent::new(DebugEventKind::Detached {
                reason: DetachReason::HostExit,
            }));
        }

        eu_info!(target: "session", "tile {tile} attached, {} events replayed", replay.len());
        for event in replay {
            state.events.push(event);
        }
        Ok(())
    }

    fn detach_tile(&self, tile: u32) -> Result<(), Error> {
        let state = self
            .tiles
            .get(tile as usize)
            .ok_or(Error::InvalidArgument("no such tile"))?;
        let acks: Vec<_> = {
            let mut session = lock(&self.state);
            if !state.attached.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            session
                .clients
                .values_mut()
                .flat_map(|conn| bind::detach_tile(conn, tile, self.ack_policy))
                .collect()
        };
        self.ack(acks);
        state.events.clear();
        eu_info!(target: "session", "tile {tile} detached");
        Ok(())
    }
}

/// Debug session of a single tile, obtained with [`crate::session::DebugSession::tile`].
///
/// Events of a tile are delivered only while the tile session is attached.
#[derive(Clone)]
pub struct TileSession {
    shared: Arc<Shared>,
    index: u32,
}

impl TileSession {
    pub(crate) fn new(shared: Arc<Shared>, index: u32) -> Self {
        Self { shared, index }
    }

    fn scope(&self) -> Scope {
        Scope::Tile(self.index)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Start receiving events of the tile. Process entry and loaded modules of the tile are
    /// reported again.
    pub fn attach(&self) -> Result<(), Error> {
        self.shared.attach_tile(self.index)
    }

    /// Stop receiving events of the tile, deferred acknowledgments are released.
    pub fn detach(&self) -> Result<(), Error> {
        self.shared.detach_tile(self.index)
    }

    pub fn is_attached(&self) -> bool {
        self.shared
            .tiles
            .get(self.index as usize)
            .is_some_and(|t| t.is_attached())
    }

    pub fn read_event(&self, timeout: Duration) -> Result<DebugEvent, Error> {
        self.shared.read_event(self.scope(), timeout)
    }

    pub fn acknowledge_event(&self, event: &DebugEvent) -> Result<(), Error> {
        self.shared.acknowledge_event(self.scope(), event)
    }

    pub fn interrupt(&self, thread: DeviceThread) -> Result<(), Error> {
        self.shared.interrupt(self.scope(), thread)
    }

    pub fn resume(&self, thread: DeviceThread) -> Result<(), Error> {
        self.shared.resume(self.scope(), thread)
    }

    pub fn stopped_threads_bitmask(&self, thread: DeviceThread) -> Result<Vec<u8>, Error> {
        self.shared.stopped_threads_bitmask(self.scope(), thread)
    }

    pub fn read_memory(
        &self,
        thread: DeviceThread,
        desc: MemoryDescriptor,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        memory::access(&self.shared, self.scope(), &thread, &desc, Buffer::Read(buf))
    }

    pub fn write_memory(
        &self,
        thread: DeviceThread,
        desc: MemoryDescriptor,
        buf: &[u8],
    ) -> Result<(), Error> {
        memory::access(&self.shared, self.scope(), &thread, &desc, Buffer::Write(buf))
    }

    pub fn read_registers(
        &self,
        thread: DeviceThread,
        kind: RegsetKind,
        start: u32,
        count: u32,
    ) -> Result<Vec<u8>, Error> {
        memory::read_registers(&self.shared, self.scope(), &thread, kind, start, count)
    }

    pub fn write_registers(
        &self,
        thread: DeviceThread,
        kind: RegsetKind,
        start: u32,
        values: &[u8],
    ) -> Result<(), Error> {
        memory::write_registers(&self.shared, self.scope(), &thread, kind, start, values)
    }
}
