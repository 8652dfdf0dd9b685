//! Debug session: attach to a GPU workload, receive debug events and control EU threads.
//!
//! A session runs two worker threads. The ingestion thread polls the backend, validates raw
//! events and passes them through a bounded channel to the dispatch thread, which owns the
//! session state machine. Thread control and memory access run on the calling thread.

pub mod attention;
pub mod bind;
pub mod client;
pub mod error;
pub mod event;
pub mod memory;
pub mod sip;
pub mod thread;
pub mod tile;
mod worker;

use crate::backend::{
    AckPolicy, AckToken, Backend, BackendRegistry, EuCommand, EuControl, EuControlReply, EuTarget,
    RawEvent,
};
use crate::config::SessionConfig;
use crate::device::Device;
use crate::eu_info;
use crate::session::attention::{AttentionTracker, InterruptRequest};
use crate::session::bind::PendingBinds;
use crate::session::client::ClientConnection;
use crate::session::error::Error;
use crate::session::event::{DebugEvent, DebugEventKind, DetachReason, EventQueue};
use crate::session::memory::{Buffer, MemoryDescriptor};
use crate::session::sip::{DebugArea, RegsetKind, SipHeader, SIP_COMMAND_RESUME};
use crate::session::thread::{DeviceThread, ThreadId, ThreadRegistry};
use crate::session::tile::{TileSession, TileState};
use crate::weak_error;
use indexmap::IndexMap;
use itertools::Itertools;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Wait of one handshake iteration.
const HANDSHAKE_WAIT: Duration = Duration::from_millis(10);

/// Session a request is made for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The whole device.
    Root,
    /// A single tile of a multi-tile device.
    Tile(u32),
}

/// Lock a mutex, a poisoned lock is taken over as is.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bookkeeping protected by the session lock.
#[derive(Default)]
pub(crate) struct SessionState {
    pub clients: IndexMap<u64, ClientConnection>,
    /// Client of the debugged process.
    pub client: Option<u64>,
    /// Set if the client of the debugged process closed.
    pub closed_client: Option<u64>,
    pub pending_binds: PendingBinds,
    pub sip: Option<Arc<SipHeader>>,
    pub debug_area: Option<DebugArea>,
}

impl SessionState {
    /// Connection of the debugged process.
    pub fn connection(&self) -> Result<&ClientConnection, Error> {
        self.client
            .and_then(|c| self.clients.get(&c))
            .ok_or(Error::Uninitialized("client"))
    }

    fn handshake_done(&self) -> bool {
        self.connection()
            .is_ok_and(|conn| !conn.module_debug_area.is_empty())
    }
}

/// State shared by a session, its tile sessions and its worker threads.
pub(crate) struct Shared {
    pub backend: Box<dyn Backend>,
    pub device: Arc<dyn Device>,
    pub config: SessionConfig,
    pub ack_policy: AckPolicy,
    pub state: Mutex<SessionState>,
    pub threads: Mutex<ThreadRegistry>,
    pub attention: Mutex<AttentionTracker>,
    pub events: EventQueue,
    /// Tile sessions, empty if tile attach mode is off.
    pub tiles: Vec<TileState>,
    pub detached: AtomicBool,
    pub ingest_active: AtomicBool,
    pub dispatch_active: AtomicBool,
    /// Highest sequence number of an attention event read so far.
    pub attention_seqno: AtomicU64,
}

impl Shared {
    fn new(backend: Box<dyn Backend>, device: Arc<dyn Device>, config: SessionConfig) -> Self {
        let topology = device.hw_info().topology;
        let ack_policy = config.ack_policy.unwrap_or_else(|| backend.ack_policy());
        let tiles = if config.tile_attach && topology.tiles > 1 {
            (0..topology.tiles).map(|_| TileState::default()).collect()
        } else {
            vec![]
        };

        Self {
            backend,
            device,
            config,
            ack_policy,
            state: Mutex::new(SessionState::default()),
            threads: Mutex::new(ThreadRegistry::new(topology)),
            attention: Mutex::new(AttentionTracker::new(topology.tiles)),
            events: EventQueue::default(),
            tiles,
            detached: AtomicBool::new(false),
            ingest_active: AtomicBool::new(false),
            dispatch_active: AtomicBool::new(false),
            attention_seqno: AtomicU64::new(0),
        }
    }

    pub fn tile_mode(&self) -> bool {
        !self.tiles.is_empty()
    }

    pub fn tile_count(&self) -> u32 {
        self.device.hw_info().topology.tiles
    }

    /// Attach state of every tile session.
    pub fn attached_tiles(&self) -> Vec<bool> {
        self.tiles.iter().map(|t| t.is_attached()).collect()
    }

    /// Scope of events that concern a single tile.
    pub fn tile_scope(&self, tile: u32) -> Scope {
        if self.tile_mode() {
            Scope::Tile(tile)
        } else {
            Scope::Root
        }
    }

    fn queue(&self, scope: Scope) -> Result<&EventQueue, Error> {
        match scope {
            Scope::Root => Ok(&self.events),
            Scope::Tile(tile) => self
                .tiles
                .get(tile as usize)
                .map(|t| &t.events)
                .ok_or(Error::InvalidArgument("no such tile")),
        }
    }

    /// Deliver an API event. Events of tiles that are not attached are dropped.
    pub fn push_event(&self, scope: Scope, event: DebugEvent) {
        match scope {
            Scope::Root => self.events.push(event),
            Scope::Tile(tile) => match self.tiles.get(tile as usize) {
                Some(state) if state.is_attached() => state.events.push(event),
                Some(_) => {
                    log::debug!(target: "session", "tile {tile} not attached, drop event: {event}")
                }
                None => log::warn!(target: "session", "event for unknown tile {tile}: {event}"),
            },
        }
    }

    /// Report loss of the debug connection, only the first call has an effect.
    pub fn report_detached(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        eu_info!(target: "session", "debug connection invalidated, detach");
        let event = DebugEvent::new(DebugEventKind::Detached {
            reason: DetachReason::HostExit,
        });
        for tile in 0..self.tiles.len() as u32 {
            self.push_event(Scope::Tile(tile), event.clone());
        }
        self.events.push(event);
    }

    pub fn ack(&self, acks: impl IntoIterator<Item = AckToken>) {
        for token in acks {
            log::debug!(target: "session", "acknowledge event {}", token.seqno);
            weak_error!(self.backend.ack_event(&token), "acknowledge:");
        }
    }

    /// eu-control target of a tile.
    fn eu_target(&self, tile: u32) -> EuTarget {
        let queue = lock(&self.state)
            .connection()
            .ok()
            .and_then(|conn| conn.eu_control_queue(tile));
        EuTarget {
            tile,
            engine: self.device.tile_engine(tile),
            exec_queue: queue.map(|(q, _)| q),
            lrc: queue.map(|(_, lrc)| lrc),
        }
    }

    pub fn eu_control(
        &self,
        command: EuCommand,
        tile: u32,
        threads: &[ThreadId],
    ) -> Result<EuControlReply, Error> {
        let client = lock(&self.state).client.ok_or(Error::Uninitialized("client"))?;
        let topology = self.device.hw_info().topology;
        let bitmask = match command {
            EuCommand::Interrupt | EuCommand::Resume => {
                self.device
                    .attention_codec()
                    .bitmask(&topology, tile, threads)
            }
            EuCommand::InterruptAll | EuCommand::Stopped => vec![0; topology.bitmask_size()],
        };
        self.backend.eu_control(&EuControl {
            client,
            command,
            target: self.eu_target(tile),
            bitmask,
        })
    }

    fn interrupt(&self, scope: Scope, selector: DeviceThread) -> Result<(), Error> {
        let threads = {
            let registry = lock(&self.threads);
            let threads = registry.select(scope, &selector);
            if threads.is_empty() {
                return Err(Error::InvalidArgument("thread out of range"));
            }
            if registry.all_stopped(&threads) {
                return Err(Error::NotAvailable);
            }
            threads
        };
        lock(&self.attention).queue(InterruptRequest::new(scope, selector, threads))
    }

    fn resume(&self, scope: Scope, selector: DeviceThread) -> Result<(), Error> {
        let stopped: Vec<ThreadId> = {
            let registry = lock(&self.threads);
            registry
                .select(scope, &selector)
                .into_iter()
                .filter(|id| registry.get(*id).is_some_and(|t| t.is_stopped()))
                .collect()
        };
        if stopped.is_empty() {
            return Err(Error::NotAvailable);
        }
        self.resume_threads(&stopped)
    }

    /// Resume stopped threads, tile by tile.
    pub fn resume_threads(&self, threads: &[ThreadId]) -> Result<(), Error> {
        let mut result = Ok(());
        let by_tile = threads.iter().copied().into_group_map_by(|id| id.tile);
        for (tile, ids) in by_tile.into_iter().sorted_by_key(|(tile, _)| *tile) {
            self.write_resume_command(&ids);

            if let Err(e) = self.eu_control(EuCommand::Resume, tile, &ids) {
                log::warn!(target: "session::thread", "resume of tile {tile} failed: {e}");
                result = Err(Error::Unknown);
                continue;
            }
            let mut registry = lock(&self.threads);
            for id in ids {
                if let Some(thread) = registry.get_mut(id) {
                    thread.resume();
                }
            }
        }
        result
    }

    /// Ask the system routine of each thread to resume, if it has a command register.
    fn write_resume_command(&self, threads: &[ThreadId]) {
        let has_cmd = lock(&self.state)
            .sip
            .as_ref()
            .is_some_and(|sip| sip.regset(RegsetKind::Cmd).is_ok());
        if !has_cmd {
            return;
        }
        let command = SIP_COMMAND_RESUME.to_le_bytes();
        for id in threads {
            let write =
                memory::thread_registers(self, *id, RegsetKind::Cmd, 0, Buffer::Write(&command));
            weak_error!(write, "write resume command:");
        }
    }

    fn stopped_threads_bitmask(
        &self,
        scope: Scope,
        selector: DeviceThread,
    ) -> Result<Vec<u8>, Error> {
        let tiles = lock(&self.threads).tiles(scope, &selector);
        let mut bitmask = vec![];
        for tile in tiles {
            let reply = self.eu_control(EuCommand::Stopped, tile, &[])?;
            bitmask.extend(reply.bitmask);
        }
        Ok(bitmask)
    }

    fn read_event(&self, scope: Scope, timeout: Duration) -> Result<DebugEvent, Error> {
        self.queue(scope)?.pop(timeout).ok_or(Error::NotReady)
    }

    fn acknowledge_event(&self, scope: Scope, event: &DebugEvent) -> Result<(), Error> {
        let DebugEventKind::ModuleLoad(info) = &event.kind else {
            return Ok(());
        };
        if !event.need_ack {
            return Ok(());
        }

        let load = self.device.hw_info().decanonize(info.load);
        let acks = {
            let mut state = lock(&self.state);
            let mut found = None;
            for conn in state.clients.values_mut() {
                if let Ok(acks) = bind::take_module_acks(conn, scope, load) {
                    found = Some(acks);
                    break;
                }
            }
            found.ok_or(Error::Uninitialized("module load"))?
        };
        self.ack(acks);
        Ok(())
    }

    /// Read and validate the module debug area of the debugged client.
    fn read_debug_area(&self) -> Result<DebugArea, Error> {
        let (client, vm, info) = {
            let state = lock(&self.state);
            let conn = state.connection()?;
            let (vm, info) = conn
                .module_debug_area
                .iter()
                .min_by_key(|(vm, _)| **vm)
                .map(|(vm, info)| (*vm, *info))
                .ok_or(Error::Uninitialized("module debug area"))?;
            (conn.handle, vm, info)
        };

        let mut data = vec![0u8; sip::DEBUG_AREA_SIZE];
        memory::transfer(self, client, vm, info.gpu_va, &mut Buffer::Read(&mut data))?;
        let area = DebugArea::parse(&data)?;
        eu_info!(
            target: "session",
            "module debug area v{} at {:#x}, bindless sip: {}",
            area.version,
            info.gpu_va,
            area.bindless_sip
        );
        lock(&self.state).debug_area = Some(area);
        Ok(area)
    }

    /// Release every deferred acknowledgment.
    fn flush_acks(&self) {
        let acks: Vec<AckToken> = {
            let mut state = lock(&self.state);
            state.clients.values_mut().flat_map(bind::drain_acks).collect()
        };
        self.ack(acks);
    }
}

/// Debug session of a GPU workload.
pub struct DebugSession {
    shared: Arc<Shared>,
    ingest: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
    /// Receiver of the ingestion channel while the handshake is not complete.
    rx: Option<Receiver<RawEvent>>,
    closed: bool,
}

impl DebugSession {
    /// Open a debug connection without starting the session, see [`DebugSession::initialize`].
    pub fn open(
        registry: &BackendRegistry,
        device: Arc<dyn Device>,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        let backend = registry.open(device.as_ref(), config.pid)?;
        Ok(Self::with_backend(backend, device, config))
    }

    /// Create a session over an already connected backend.
    pub fn with_backend(
        backend: Box<dyn Backend>,
        device: Arc<dyn Device>,
        config: SessionConfig,
    ) -> Self {
        crate::log::set(config.log_categories);
        Self {
            shared: Arc::new(Shared::new(backend, device, config)),
            ingest: None,
            dispatch: None,
            rx: None,
            closed: false,
        }
    }

    /// Open a debug connection and run the initial handshake.
    pub fn attach(
        registry: &BackendRegistry,
        device: Arc<dyn Device>,
        config: SessionConfig,
    ) -> Result<Self, Error> {
        let mut session = Self::open(registry, device, config)?;
        session.initialize()?;
        Ok(session)
    }

    /// Run the initial handshake: start event ingestion and process events until the module
    /// debug area of the debugged client is known.
    ///
    /// Returns [`Error::NotReady`] if the handshake did not complete in time, the call
    /// may be repeated. [`Error::DeviceLost`] means the client closed during the handshake.
    pub fn initialize(&mut self) -> Result<(), Error> {
        if self.dispatch.is_some() {
            return Ok(());
        }
        let shared = self.shared.clone();

        if self.ingest.is_none() {
            match shared.backend.poll(shared.config.poll_timeout()) {
                Ok(true) => {}
                Ok(false) => return Err(Error::NotReady),
                Err(e) => return Err(Error::Syscall("poll", e)),
            }

            let (tx, rx) = mpsc::sync_channel(shared.config.queue_capacity);
            shared.ingest_active.store(true, Ordering::SeqCst);
            let ingest_shared = shared.clone();
            self.ingest = Some(
                std::thread::Builder::new()
                    .name("eu-ingest".to_string())
                    .spawn(move || worker::ingest_loop(ingest_shared, tx))?,
            );
            self.rx = Some(rx);
        }

        let rx = self.rx.as_ref().ok_or(Error::Unknown)?;
        let dispatcher = worker::Dispatcher::new(shared.clone());
        let start = Instant::now();
        loop {
            {
                let state = lock(&shared.state);
                if let Some(client) = state.closed_client {
                    return Err(Error::DeviceLost(client));
                }
                if state.handshake_done() {
                    break;
                }
            }
            if start.elapsed() >= shared.config.startup_timeout() {
                log::warn!(
                    target: "session",
                    "handshake not complete in {:?}",
                    shared.config.startup_timeout(),
                );
                return Err(Error::NotReady);
            }

            match rx.recv_timeout(HANDSHAKE_WAIT) {
                Ok(raw) => dispatcher.handle(raw),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return Err(Error::Unknown),
            }
        }

        if let Err(e) = shared.read_debug_area() {
            log::error!(target: "session", "module debug area: {e}");
            return Err(Error::Unknown);
        }

        let rx = self.rx.take().ok_or(Error::Unknown)?;
        shared.dispatch_active.store(true, Ordering::SeqCst);
        self.dispatch = Some(
            std::thread::Builder::new()
                .name("eu-dispatch".to_string())
                .spawn(move || worker::dispatch_loop(dispatcher, rx))?,
        );
        eu_info!(target: "session", "session for pid {} started", shared.config.pid);
        Ok(())
    }

    /// Stop worker threads, release deferred acknowledgments and close the backend.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.shared.dispatch_active.store(false, Ordering::SeqCst);
        self.shared.ingest_active.store(false, Ordering::SeqCst);
        if let Some(dispatch) = self.dispatch.take() {
            weak_error!(dispatch.join().map_err(|_| Error::Unknown), "join dispatch thread:");
        }
        self.rx = None;
        if let Some(ingest) = self.ingest.take() {
            weak_error!(ingest.join().map_err(|_| Error::Unknown), "join ingestion thread:");
        }

        self.shared.flush_acks();
        lock(&self.shared.threads).reset();
        lock(&self.shared.attention).reset();
        self.shared.backend.close();
        eu_info!(target: "session", "session for pid {} closed", self.shared.config.pid);
    }

    /// Wait up to `timeout` for the next debug event.
    pub fn read_event(&self, timeout: Duration) -> Result<DebugEvent, Error> {
        self.shared.read_event(Scope::Root, timeout)
    }

    /// Acknowledge an event delivered with `need_ack`. Acknowledging twice is harmless.
    pub fn acknowledge_event(&self, event: &DebugEvent) -> Result<(), Error> {
        self.shared.acknowledge_event(Scope::Root, event)
    }

    /// Request a stop of the selected threads. Stops are reported through debug events.
    pub fn interrupt(&self, thread: DeviceThread) -> Result<(), Error> {
        self.shared.interrupt(Scope::Root, thread)
    }

    pub fn resume(&self, thread: DeviceThread) -> Result<(), Error> {
        self.shared.resume(Scope::Root, thread)
    }

    /// Raw bitmask of stopped threads of every tile touched by the selector.
    pub fn stopped_threads_bitmask(&self, thread: DeviceThread) -> Result<Vec<u8>, Error> {
        self.shared.stopped_threads_bitmask(Scope::Root, thread)
    }

    pub fn read_memory(
        &self,
        thread: DeviceThread,
        desc: MemoryDescriptor,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        memory::access(&self.shared, Scope::Root, &thread, &desc, Buffer::Read(buf))
    }

    pub fn write_memory(
        &self,
        thread: DeviceThread,
        desc: MemoryDescriptor,
        buf: &[u8],
    ) -> Result<(), Error> {
        memory::access(&self.shared, Scope::Root, &thread, &desc, Buffer::Write(buf))
    }

    pub fn read_registers(
        &self,
        thread: DeviceThread,
        kind: RegsetKind,
        start: u32,
        count: u32,
    ) -> Result<Vec<u8>, Error> {
        memory::read_registers(&self.shared, Scope::Root, &thread, kind, start, count)
    }

    pub fn write_registers(
        &self,
        thread: DeviceThread,
        kind: RegsetKind,
        start: u32,
        values: &[u8],
    ) -> Result<(), Error> {
        memory::write_registers(&self.shared, Scope::Root, &thread, kind, start, values)
    }

    pub fn is_detached(&self) -> bool {
        self.shared.detached.load(Ordering::SeqCst)
    }

    /// Module debug area read during the handshake.
    pub fn debug_area(&self) -> Option<DebugArea> {
        lock(&self.shared.state).debug_area
    }

    /// Number of tile sessions, zero if tile attach mode is off.
    pub fn tile_count(&self) -> u32 {
        self.shared.tiles.len() as u32
    }

    /// Tile session of a multi-tile device in tile attach mode.
    pub fn tile(&self, index: u32) -> Option<TileSession> {
        ((index as usize) < self.shared.tiles.len())
            .then(|| TileSession::new(self.shared.clone(), index))
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.close();
    }
}
