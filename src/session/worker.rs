//! Worker loops of a session.
//!
//! The ingestion loop only polls the backend and validates raw events, everything that touches
//! session state happens in the [`Dispatcher`] driven by the dispatch loop.

use crate::backend::{
    AckToken, AttentionEvent, BindEvent, EuCommand, EventFlags, KernelEvent, Metadata,
    MetadataClass, MetadataKind, PageFaultEvent, RawEvent, COMMAND_QUEUE_UUID,
};
use crate::device::{EngineInstance, ENGINE_CLASS_COMPUTE, ENGINE_CLASS_RENDER};
use crate::session::attention::is_forced_exception_only;
use crate::session::bind::{self, Routed, Routing};
use crate::session::client::{
    elf_address_from_uuid, ClientConnection, ElfBlob, ExecQueueInfo, MetadataRecord,
};
use crate::session::error::Error;
use crate::session::event::{DebugEvent, DebugEventKind};
use crate::session::memory;
use crate::session::sip::RegsetKind;
use crate::session::thread::ThreadId;
use crate::session::{lock, Shared};
use crate::{eu_error, eu_event, eu_info, eu_thread, weak_error};
use itertools::Itertools;
use nix::errno::Errno;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest wait of the dispatch loop for a new event.
const DISPATCH_WAIT: Duration = Duration::from_millis(20);
const DETACHED_BACKOFF_MIN: Duration = Duration::from_millis(10);
const DETACHED_BACKOFF_MAX: Duration = Duration::from_millis(500);

/// Poll the backend and pass raw events to the dispatch loop until the session stops.
pub(crate) fn ingest_loop(shared: Arc<Shared>, tx: SyncSender<RawEvent>) {
    let known_flags = shared.backend.known_flags();
    let mut backoff = DETACHED_BACKOFF_MIN;

    while shared.ingest_active.load(Ordering::SeqCst) {
        match shared.backend.poll(shared.config.poll_timeout()) {
            Ok(true) => backoff = DETACHED_BACKOFF_MIN,
            Ok(false) | Err(Errno::EINTR) => continue,
            Err(Errno::EINVAL) => {
                shared.report_detached();
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(DETACHED_BACKOFF_MAX);
                continue;
            }
            Err(e) => {
                log::warn!(target: "session::ingest", "poll: {e}");
                std::thread::sleep(backoff);
                continue;
            }
        }

        let raw = match shared.backend.read_event() {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!(target: "session::ingest", "read event: {e}");
                continue;
            }
        };
        if raw.flags & !known_flags != 0 {
            eu_error!(
                target: "session::ingest",
                "event {} dropped: {}",
                raw.seqno,
                Error::UnknownFlags(raw.flags),
            );
            continue;
        }
        eu_event!(
            "event type: {}, flags: {:#x}, seqno: {}, payload: {} bytes",
            raw.kind,
            raw.flags,
            raw.seqno,
            raw.payload.len()
        );

        if shared.backend.is_attention(&raw) {
            shared.attention_seqno.fetch_max(raw.seqno, Ordering::SeqCst);
        }
        if tx.send(raw).is_err() {
            break;
        }
    }
    log::debug!(target: "session::ingest", "ingestion stopped");
}

/// Handle raw events and batch thread stops until the session stops.
pub(crate) fn dispatch_loop(dispatcher: Dispatcher, rx: Receiver<RawEvent>) {
    while dispatcher.shared.dispatch_active.load(Ordering::SeqCst) {
        match rx.recv_timeout(DISPATCH_WAIT) {
            Ok(raw) => dispatcher.handle(raw),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        dispatcher.send_interrupts();
        dispatcher.generate_events_and_resume();
    }
    log::debug!(target: "session", "dispatch stopped");
}

/// Session state machine fed with kernel events.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn publish(&self, events: Vec<Routed>) {
        for routed in events {
            self.shared.push_event(routed.scope, routed.event);
        }
    }

    pub fn handle(&self, raw: RawEvent) {
        let decoded = match self.shared.backend.decode(&raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                eu_error!(
                    target: "session",
                    "event {} (type {}) dropped: {e}",
                    raw.seqno,
                    raw.kind,
                );
                return;
            }
        };
        log::trace!(target: "session", "{:?} {:?}", decoded.flags, decoded.event);

        let flags = decoded.flags;
        let ack = decoded.ack;
        match decoded.event {
            KernelEvent::Bind(event) => self.handle_bind(decoded.seqno, flags, ack, &event),
            KernelEvent::Attention(event) => {
                self.handle_attention(decoded.seqno, event);
                self.ack_now(flags, ack);
            }
            KernelEvent::PageFault(event) => {
                self.handle_page_fault(event);
                self.ack_now(flags, ack);
            }
            KernelEvent::Metadata {
                client,
                handle,
                class,
                size,
            } => {
                let events = if flags.is_create() {
                    self.metadata_created(client, handle, class, size)
                } else if flags.is_destroy() {
                    self.metadata_destroyed(client, handle)
                } else {
                    vec![]
                };
                self.publish(events);
                self.ack_now(flags, ack);
            }
            event => {
                let events = self.handle_object(flags, event);
                self.publish(events);
                self.ack_now(flags, ack);
            }
        }
    }

    fn ack_now(&self, flags: EventFlags, ack: AckToken) {
        if flags.needs_ack() {
            self.shared.ack([ack]);
        }
    }

    /// Lifetime of clients, VMs, contexts and queues.
    fn handle_object(&self, flags: EventFlags, event: KernelEvent) -> Vec<Routed> {
        let create = flags.is_create();
        let destroy = flags.is_destroy();
        let device = self.shared.device.clone();
        let mut state = lock(&self.shared.state);

        if let KernelEvent::Client { handle } = event {
            if create {
                state
                    .clients
                    .insert(handle, ClientConnection::new(handle, self.shared.tile_count()));
                if state.client.is_none() {
                    state.client = Some(handle);
                }
                eu_info!(target: "session", "client {handle:#x} connected");
                return vec![];
            }
            if !destroy {
                return vec![];
            }

            let Some(mut conn) = state.clients.shift_remove(&handle) else {
                return vec![];
            };
            if state.client == Some(handle) {
                state.closed_client = Some(handle);
            }
            let unfinished = state.pending_binds.remove_client(handle);
            drop(state);
            eu_info!(target: "session", "client {handle:#x} disconnected");

            self.shared.ack(unfinished);
            self.shared.ack(bind::drain_acks(&mut conn));
            return conn
                .command_queues
                .values()
                .map(|tile| self.shared.tile_scope(tile.unwrap_or(0)))
                .unique()
                .map(|scope| Routed {
                    scope,
                    event: DebugEvent::new(DebugEventKind::ProcessExit),
                })
                .collect();
        }

        let client = match &event {
            KernelEvent::Vm { client, .. }
            | KernelEvent::Context { client, .. }
            | KernelEvent::ContextVm { client, .. }
            | KernelEvent::ContextEngines { client, .. }
            | KernelEvent::Engines { client, .. }
            | KernelEvent::ExecQueue { client, .. } => *client,
            _ => return vec![],
        };
        let Some(conn) = state.clients.get_mut(&client) else {
            log::warn!(target: "session", "event of unknown client {client:#x}: {event:?}");
            return vec![];
        };

        let mut events = vec![];
        match event {
            KernelEvent::Vm { handle, .. } => {
                if create {
                    conn.vms.insert(handle);
                } else if destroy {
                    conn.vms.remove(&handle);
                    conn.vm_to_tile.remove(&handle);
                }
            }
            KernelEvent::Context { handle, .. } => {
                if create {
                    conn.contexts.entry(handle).or_default();
                } else if destroy {
                    conn.contexts.remove(&handle);
                    conn.lrc_to_context.retain(|_, ctx| *ctx != handle);
                }
            }
            KernelEvent::ContextVm { context, vm, .. } => {
                conn.update_context(context, Some(vm), None, |e| device.engine_tile(e));
            }
            KernelEvent::ContextEngines {
                context, engines, ..
            } => {
                conn.update_context(context, None, Some(engines), |e| device.engine_tile(e));
            }
            KernelEvent::Engines { context, lrcs, .. } => {
                for (_, lrc) in lrcs {
                    if create {
                        conn.lrc_to_context.insert(lrc, context);
                    } else if destroy {
                        conn.lrc_to_context.remove(&lrc);
                    }
                }
            }
            KernelEvent::ExecQueue {
                vm,
                handle,
                engine_class,
                lrcs,
                ..
            } => {
                let command_queue =
                    engine_class == ENGINE_CLASS_COMPUTE || engine_class == ENGINE_CLASS_RENDER;
                if create {
                    for lrc in &lrcs {
                        conn.lrc_to_exec_queue.insert(*lrc, handle);
                    }
                    conn.exec_queues.insert(
                        handle,
                        ExecQueueInfo {
                            vm,
                            engine_class,
                            lrcs,
                        },
                    );
                    if command_queue {
                        events.extend(self.command_queue_created(conn, handle, 0));
                    }
                } else if destroy {
                    conn.exec_queues.remove(&handle);
                    conn.lrc_to_exec_queue.retain(|_, queue| *queue != handle);
                    events.extend(self.command_queue_destroyed(conn, handle));
                }
            }
            _ => {}
        }
        events
    }

    fn command_queue_created(
        &self,
        conn: &mut ClientConnection,
        handle: u64,
        tile: u32,
    ) -> Option<Routed> {
        let first = !conn.has_command_queue(self.shared.tile_mode().then_some(tile));
        conn.command_queues.insert(handle, Some(tile));
        eu_info!(target: "session", "command queue {handle:#x} created on tile {tile}");
        first.then(|| Routed {
            scope: self.shared.tile_scope(tile),
            event: DebugEvent::new(DebugEventKind::ProcessEntry),
        })
    }

    fn command_queue_destroyed(&self, conn: &mut ClientConnection, handle: u64) -> Option<Routed> {
        let tile = conn.command_queues.remove(&handle)?.unwrap_or(0);
        let last = !conn.has_command_queue(self.shared.tile_mode().then_some(tile));
        eu_info!(target: "session", "command queue {handle:#x} destroyed on tile {tile}");
        last.then(|| Routed {
            scope: self.shared.tile_scope(tile),
            event: DebugEvent::new(DebugEventKind::ProcessExit),
        })
    }

    fn metadata_created(
        &self,
        client: u64,
        handle: u64,
        class: MetadataClass,
        size: u64,
    ) -> Vec<Routed> {
        let metadata = match self.shared.backend.read_metadata(client, handle, size) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!(target: "session", "read metadata {handle:#x}: {e}");
                Metadata::default()
            }
        };

        let mut state = lock(&self.shared.state);
        let Some(conn) = state.clients.get_mut(&client) else {
            log::warn!(target: "session", "metadata {handle:#x} of unknown client {client:#x}");
            return vec![];
        };

        let kind = if metadata.uuid.as_deref() == Some(COMMAND_QUEUE_UUID) {
            MetadataKind::CommandQueue
        } else {
            match class {
                MetadataClass::Registration => {
                    let name = String::from_utf8_lossy(&metadata.data);
                    let kind = MetadataKind::from_class_name(&name);
                    log::debug!(target: "session", "metadata class {handle:#x} registered: {kind}");
                    conn.classes.insert(handle, kind);
                    MetadataKind::Other
                }
                MetadataClass::Instance { class_handle } => conn
                    .classes
                    .get(&class_handle)
                    .copied()
                    .unwrap_or(MetadataKind::Other),
                MetadataClass::Typed(kind) => kind,
            }
        };

        let mut record = MetadataRecord {
            kind,
            uuid: metadata.uuid,
            data: metadata.data,
        };
        let mut events = vec![];
        match kind {
            MetadataKind::Elf => {
                let data = std::mem::take(&mut record.data);
                let address = record
                    .uuid
                    .as_deref()
                    .and_then(elf_address_from_uuid)
                    .unwrap_or(data.as_ptr() as u64);
                log::debug!(
                    target: "session",
                    "debug elf {handle:#x} at {address:#x}, {} bytes",
                    data.len(),
                );
                conn.elfs.insert(handle, ElfBlob { address, data });
            }
            MetadataKind::Module => {
                let segments = record.segment_count().unwrap_or(1);
                bind::create_module(conn, handle, segments, record.device_bitfield());
            }
            MetadataKind::CommandQueue => {
                let tile = match record.sub_device() {
                    Some((index, count)) if count > 1 => index,
                    _ => 0,
                };
                events.extend(self.command_queue_created(conn, handle, tile));
            }
            _ => {}
        }
        conn.metadata.insert(handle, record);
        events
    }

    fn metadata_destroyed(&self, client: u64, handle: u64) -> Vec<Routed> {
        let mut state = lock(&self.shared.state);
        let Some(conn) = state.clients.get_mut(&client) else {
            return vec![];
        };
        conn.classes.remove(&handle);
        let Some(record) = conn.metadata.remove(&handle) else {
            return vec![];
        };

        match record.kind {
            MetadataKind::Elf => {
                conn.elfs.remove(&handle);
            }
            MetadataKind::Module => {
                conn.modules.remove(&handle);
            }
            MetadataKind::CommandQueue => {
                return self
                    .command_queue_destroyed(conn, handle)
                    .into_iter()
                    .collect()
            }
            _ => {}
        }
        vec![]
    }

    fn handle_bind(&self, seqno: u64, flags: EventFlags, ack: AckToken, event: &BindEvent) {
        let outcome = {
            let mut state = lock(&self.shared.state);
            let Some(txn) = state.pending_binds.feed(seqno, flags, ack, event) else {
                return;
            };
            // tile sessions change their attach state only under the session lock
            let attached = self.shared.attached_tiles();
            let routing = Routing {
                tile_mode: self.shared.tile_mode(),
                attached: &attached,
                hw: self.shared.device.hw_info(),
            };
            match state.clients.get_mut(&txn.client) {
                Some(conn) => bind::apply(conn, txn, &routing),
                None => {
                    log::warn!(target: "session::bind", "bind of unknown client {:#x}", txn.client);
                    bind::BindOutcome {
                        events: vec![],
                        acks: txn.acks,
                    }
                }
            }
        };

        self.publish(outcome.events);
        self.shared.ack(outcome.acks);
    }

    /// VM and tile of an attention or page fault source.
    fn resolve(
        &self,
        client: u64,
        context: Option<u64>,
        exec_queue: Option<u64>,
        lrc: u64,
        engine: Option<EngineInstance>,
    ) -> Option<(u64, u32)> {
        let state = lock(&self.shared.state);
        let conn = state.clients.get(&client)?;
        let vm = conn.resolve_vm(context, exec_queue, lrc)?;
        let tile = engine
            .and_then(|e| self.shared.device.engine_tile(e))
            .unwrap_or_else(|| conn.vm_tile(vm));
        Some((vm, tile))
    }

    fn handle_attention(&self, seqno: u64, event: AttentionEvent) {
        let Some((vm, tile)) = self.resolve(
            event.client,
            event.context,
            event.exec_queue,
            event.lrc,
            event.engine,
        ) else {
            log::warn!(
                target: "session::thread",
                "attention {seqno} without known vm, lrc {:#x}",
                event.lrc,
            );
            return;
        };

        {
            let mut attention = lock(&self.shared.attention);
            if attention.is_stale(tile, seqno) {
                eu_thread!("stale attention {seqno} on tile {tile} dropped");
                return;
            }
            attention.attention_received(Instant::now());
        }

        let topology = self.shared.device.hw_info().topology;
        let threads = self
            .shared
            .device
            .attention_codec()
            .threads(&topology, tile, &event.bitmask);
        eu_thread!("attention {seqno} on tile {tile}, {} threads", threads.len());
        self.process_stopped(vm, event.context, Some(event.lrc), &threads, &[]);
    }

    fn handle_page_fault(&self, event: PageFaultEvent) {
        let Some((vm, tile)) = self.resolve(
            event.client,
            event.context,
            event.exec_queue,
            event.lrc,
            event.engine,
        ) else {
            log::warn!(
                target: "session::thread",
                "page fault at {:#x} without known vm",
                event.address,
            );
            return;
        };
        let Some((_, after, resolved)) = event.parts() else {
            log::warn!(
                target: "session::thread",
                "page fault bitmask of {} bytes",
                event.bitmask.len(),
            );
            return;
        };

        let topology = self.shared.device.hw_info().topology;
        let codec = self.shared.device.attention_codec();
        let still_faulted: Vec<u8> = after.iter().zip(resolved).map(|(a, r)| a ^ r).collect();
        let faulted = codec.threads(&topology, tile, &still_faulted);
        let mut threads = codec.threads(&topology, tile, resolved);
        threads.extend(faulted.iter().copied());
        threads.sort_unstable();
        threads.dedup();

        log::info!(
            target: "session::thread",
            "page fault at {:#x} on tile {tile}, {} threads faulted",
            event.address,
            faulted.len()
        );
        lock(&self.shared.attention).stop_observed(Instant::now());
        if faulted.is_empty() {
            self.shared.push_event(
                self.shared.tile_scope(tile),
                DebugEvent::new(DebugEventKind::PageFault {
                    address: event.address,
                }),
            );
        }
        self.process_stopped(vm, event.context, Some(event.lrc), &threads, &faulted);
    }

    /// Verify and record threads reported as stopped.
    fn process_stopped(
        &self,
        vm: u64,
        context: Option<u64>,
        lrc: Option<u64>,
        threads: &[ThreadId],
        faulted: &[ThreadId],
    ) {
        for id in threads {
            let ident = match memory::read_sr_ident(&self.shared, vm, *id) {
                Ok(ident) => ident,
                Err(e) => {
                    log::warn!(
                        target: "session::thread",
                        "system routine ident of thread {id}: {e}"
                    );
                    continue;
                }
            };

            let was_stopped = {
                let mut registry = lock(&self.shared.threads);
                let Some(thread) = registry.get_mut(*id) else {
                    continue;
                };
                let was_stopped = thread.is_stopped();
                if !thread.verify_stopped(ident.count) {
                    continue;
                }
                thread.stop(vm);
                thread.set_queue(context, lrc);
                thread.set_page_faulted(faulted.contains(id));
                was_stopped
            };
            lock(&self.shared.attention).mark_stopped(*id, was_stopped);
        }
    }

    /// Send queued interrupt requests, one eu-control request per tile.
    pub fn send_interrupts(&self) {
        let requests = lock(&self.shared.attention).take_queued();
        if requests.is_empty() {
            return;
        }

        let tiles: Vec<u32> = requests
            .iter()
            .flat_map(|r| r.tiles())
            .sorted_unstable()
            .dedup()
            .collect();
        let mut seqnos = vec![];
        for tile in tiles {
            let covering = requests.iter().filter(|r| r.threads.iter().any(|id| id.tile == tile));
            let (command, threads) = if covering.clone().all(|r| r.selector.is_all()) {
                (EuCommand::InterruptAll, vec![])
            } else {
                let threads: Vec<ThreadId> = covering
                    .flat_map(|r| r.threads.iter().copied())
                    .filter(|id| id.tile == tile)
                    .collect();
                (EuCommand::Interrupt, threads)
            };

            match self.shared.eu_control(command, tile, &threads) {
                Ok(reply) => {
                    let seqno = reply
                        .seqno
                        .unwrap_or_else(|| self.shared.attention_seqno.load(Ordering::SeqCst));
                    eu_thread!("{command:?} sent to tile {tile}, seqno {seqno}");
                    seqnos.push((tile, seqno));
                }
                Err(e) => {
                    log::warn!(target: "session::thread", "interrupt of tile {tile} failed: {e}")
                }
            }
        }

        if seqnos.is_empty() {
            for request in requests {
                self.shared.push_event(
                    request.scope,
                    DebugEvent::new(DebugEventKind::ThreadUnavailable {
                        thread: request.selector,
                    }),
                );
            }
            return;
        }

        let expected = self
            .shared
            .config
            .expected_attentions
            .unwrap_or(seqnos.len() as u32);
        lock(&self.shared.attention).interrupt_sent(requests, &seqnos, expected, Instant::now());
    }

    /// Report collected stops once attention traffic settled.
    pub fn generate_events_and_resume(&self) {
        let batch = {
            let mut attention = lock(&self.shared.attention);
            if !attention.should_trigger(
                Instant::now(),
                self.shared.config.attention_grace(),
                self.shared.config.interrupt_timeout(),
            ) {
                return;
            }
            attention.take_batch()
        };

        let mut unsolicited = batch.unsolicited;
        if self.shared.device.hw_info().forced_exception_check && !unsolicited.is_empty() {
            let forced: Vec<ThreadId> = unsolicited
                .iter()
                .copied()
                .filter(|id| {
                    memory::read_thread_registers(&self.shared, *id, RegsetKind::Cr, 0, 1)
                        .is_ok_and(|cr0| is_forced_exception_only(&cr0))
                })
                .collect();
            if !forced.is_empty() {
                eu_thread!("resume {} threads stopped by a forced exception", forced.len());
                weak_error!(self.shared.resume_threads(&forced), "resume:");
                unsolicited.retain(|id| !forced.contains(id));
            }
        }

        let mut events = vec![];
        {
            let registry = lock(&self.shared.threads);
            for request in batch.requests {
                let kind = if request.stopped.is_empty() {
                    DebugEventKind::ThreadUnavailable {
                        thread: request.selector,
                    }
                } else {
                    DebugEventKind::ThreadStopped {
                        threads: request
                            .stopped
                            .iter()
                            .map(|id| registry.device_thread(request.scope, *id))
                            .collect(),
                    }
                };
                events.push((request.scope, DebugEvent::new(kind)));
            }

            let by_scope = unsolicited
                .into_iter()
                .into_group_map_by(|id| self.shared.tile_scope(id.tile));
            for (scope, ids) in by_scope {
                let threads = ids
                    .into_iter()
                    .map(|id| registry.device_thread(scope, id))
                    .collect();
                events.push((scope, DebugEvent::new(DebugEventKind::ThreadStopped { threads })));
            }
        }

        for (scope, event) in events {
            self.shared.push_event(scope, event);
        }
    }
}

