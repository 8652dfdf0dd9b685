//! Bind transactions and the module load/unload decisions they drive.
//!
//! A kernel bind is either one combined event or a chain of events (begin, operations,
//! per-operation metadata and an optional user fence). [`PendingBinds`] assembles the chain
//! into a [`BindTransaction`] that [`apply`] turns into API events and acknowledgments.

use crate::backend::{AckPolicy, AckToken, BindEvent, EventFlags, MetadataKind};
use crate::device::HwInfo;
use crate::session::client::{BindInfo, ClientConnection, IsaAllocation, Module};
use crate::session::error::Error;
use crate::session::event::{DebugEvent, DebugEventKind, ModuleInfo};
use crate::session::Scope;
use indexmap::IndexMap;
use smallvec::SmallVec;
use std::collections::HashMap;

/// One bound range with the metadata attached to it.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BindOp {
    pub va: u64,
    pub length: u64,
    pub metadata: SmallVec<[u64; 4]>,
}

/// Complete bind, ready to be applied.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct BindTransaction {
    pub client: u64,
    pub vm: u64,
    /// Bind (true) or unbind (false).
    pub create: bool,
    pub ops: Vec<BindOp>,
    /// Events of the transaction waiting for acknowledgment.
    pub acks: Vec<AckToken>,
}

struct PendingOp {
    va: u64,
    length: u64,
    expected_metadata: u64,
    metadata: SmallVec<[u64; 4]>,
}

struct PendingBind {
    client: u64,
    vm: u64,
    create: bool,
    expected_ops: u32,
    ops: IndexMap<u64, PendingOp>,
    fence_required: bool,
    fence_seen: bool,
    acks: Vec<AckToken>,
}

impl PendingBind {
    fn is_complete(&self) -> bool {
        self.ops.len() as u32 >= self.expected_ops
            && self
                .ops
                .values()
                .all(|op| op.metadata.len() as u64 >= op.expected_metadata)
            && (!self.fence_required || self.fence_seen)
    }
}

/// Bind transactions that are not complete yet, keyed by the sequence number of their first event.
#[derive(Default)]
pub(crate) struct PendingBinds {
    binds: HashMap<u64, PendingBind>,
    op_to_bind: HashMap<u64, u64>,
}

impl PendingBinds {
    /// Drop unfinished transactions of a closed client, returns their acknowledgments.
    pub fn remove_client(&mut self, client: u64) -> Vec<AckToken> {
        let mut acks = vec![];
        let op_to_bind = &mut self.op_to_bind;
        self.binds.retain(|_, bind| {
            if bind.client != client {
                return true;
            }
            for op_seqno in bind.ops.keys() {
                op_to_bind.remove(op_seqno);
            }
            acks.append(&mut bind.acks);
            false
        });
        acks
    }

    /// Feed one bind event. Returns a transaction once all of its parts arrived.
    pub fn feed(
        &mut self,
        seqno: u64,
        flags: EventFlags,
        ack: AckToken,
        event: &BindEvent,
    ) -> Option<BindTransaction> {
        let ack = flags.needs_ack().then_some(ack);

        let bind_seqno = match event {
            BindEvent::Combined {
                client,
                vm,
                va,
                length,
                metadata,
            } => {
                return Some(BindTransaction {
                    client: *client,
                    vm: *vm,
                    create: flags.is_create(),
                    ops: vec![BindOp {
                        va: *va,
                        length: *length,
                        metadata: metadata.iter().copied().collect(),
                    }],
                    acks: ack.into_iter().collect(),
                });
            }
            BindEvent::Begin {
                client,
                vm,
                ops,
                fence,
            } => {
                self.binds.insert(
                    seqno,
                    PendingBind {
                        client: *client,
                        vm: *vm,
                        create: flags.is_create(),
                        expected_ops: *ops,
                        ops: IndexMap::new(),
                        fence_required: *fence,
                        fence_seen: false,
                        acks: ack.into_iter().collect(),
                    },
                );
                seqno
            }
            BindEvent::Op {
                bind_seqno,
                metadata_count,
                va,
                length,
            } => {
                let Some(bind) = self.binds.get_mut(bind_seqno) else {
                    log::warn!(
                        target: "session::bind",
                        "bind operation {seqno} of unknown bind {bind_seqno}",
                    );
                    return None;
                };
                bind.ops.insert(
                    seqno,
                    PendingOp {
                        va: *va,
                        length: *length,
                        expected_metadata: *metadata_count,
                        metadata: SmallVec::new(),
                    },
                );
                bind.acks.extend(ack);
                self.op_to_bind.insert(seqno, *bind_seqno);
                *bind_seqno
            }
            BindEvent::OpMetadata {
                op_seqno, metadata, ..
            } => {
                let Some(bind_seqno) = self.op_to_bind.get(op_seqno).copied() else {
                    log::warn!(
                        target: "session::bind",
                        "metadata of unknown bind operation {op_seqno}",
                    );
                    return None;
                };
                let bind = self.binds.get_mut(&bind_seqno)?;
                let op = bind.ops.get_mut(op_seqno)?;
                op.metadata.push(*metadata);
                bind.acks.extend(ack);
                bind_seqno
            }
            BindEvent::Fence { bind_seqno } => {
                let Some(bind) = self.binds.get_mut(bind_seqno) else {
                    log::warn!(target: "session::bind", "fence of unknown bind {bind_seqno}");
                    return None;
                };
                bind.fence_seen = true;
                bind.acks.extend(ack);
                *bind_seqno
            }
        };

        self.try_complete(bind_seqno)
    }

    fn try_complete(&mut self, bind_seqno: u64) -> Option<BindTransaction> {
        if !self.binds.get(&bind_seqno)?.is_complete() {
            return None;
        }
        let bind = self.binds.remove(&bind_seqno)?;
        for op_seqno in bind.ops.keys() {
            self.op_to_bind.remove(op_seqno);
        }

        Some(BindTransaction {
            client: bind.client,
            vm: bind.vm,
            create: bind.create,
            ops: bind
                .ops
                .into_values()
                .map(|op| BindOp {
                    va: op.va,
                    length: op.length,
                    metadata: op.metadata,
                })
                .collect(),
            acks: bind.acks,
        })
    }
}

/// API event with its destination.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Routed {
    pub scope: Scope,
    pub event: DebugEvent,
}

/// Where module events of a tile go.
pub(crate) struct Routing<'a> {
    pub tile_mode: bool,
    /// Attach state of every tile session.
    pub attached: &'a [bool],
    pub hw: &'a HwInfo,
}

impl Routing<'_> {
    fn tile_attached(&self, tile: u32) -> bool {
        self.attached.get(tile as usize).copied().unwrap_or(false)
    }
}

/// Result of applying a transaction.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct BindOutcome {
    pub events: Vec<Routed>,
    /// Acknowledgments to send right away.
    pub acks: Vec<AckToken>,
}

/// Load addresses are reported in canonical form.
fn module_info(conn: &ClientConnection, hw: &HwInfo, elf: Option<u64>, load: u64) -> ModuleInfo {
    let (begin, end) = elf
        .and_then(|handle| conn.elfs.get(&handle))
        .map(|elf| (elf.address, elf.end()))
        .unwrap_or((0, 0));
    ModuleInfo {
        begin,
        end,
        load: hw.canonize(load),
    }
}

/// Apply a complete transaction to the client state.
pub(crate) fn apply(
    conn: &mut ClientConnection,
    txn: BindTransaction,
    routing: &Routing,
) -> BindOutcome {
    let mut outcome = BindOutcome::default();
    let mut acks = txn.acks;
    let tile = conn.vm_tile(txn.vm);

    for op in &txn.ops {
        let kinds: SmallVec<[(u64, MetadataKind); 4]> = op
            .metadata
            .iter()
            .filter_map(|handle| conn.metadata_kind(*handle).map(|kind| (*handle, kind)))
            .collect();
        let find = |kind: MetadataKind| kinds.iter().find(|(_, k)| *k == kind).map(|(h, _)| *h);

        for (_, kind) in kinds.iter().filter(|(_, k)| k.is_special_area()) {
            if let Some(map) = conn.bind_info_mut(*kind) {
                if txn.create {
                    log::debug!(
                        target: "session::bind",
                        "{kind} of vm {:#x} bound at {:#x}",
                        txn.vm,
                        op.va,
                    );
                    map.insert(
                        txn.vm,
                        BindInfo {
                            gpu_va: op.va,
                            size: op.length,
                        },
                    );
                } else if map.get(&txn.vm).is_some_and(|info| info.gpu_va == op.va) {
                    map.remove(&txn.vm);
                }
            }
        }

        let elf = find(MetadataKind::Elf);
        let module = find(MetadataKind::Module);
        let is_isa = find(MetadataKind::Isa).is_some() || elf.is_some();

        if is_isa {
            if txn.create {
                bind_isa(conn, txn.vm, tile, op, elf, module, routing, &mut acks, &mut outcome);
            } else {
                unbind_isa(conn, tile, op.va, routing, &mut outcome);
            }
        }

        if let Some(handle) = module {
            if let (Some(elf), Some(m)) = (elf, conn.modules.get_mut(&handle)) {
                m.elf.get_or_insert(elf);
            }
            if txn.create {
                bind_module(conn, handle, tile, op.va, routing, &mut acks, &mut outcome);
            } else {
                unbind_module(conn, handle, tile, op.va, routing, &mut outcome);
            }
        }
    }

    outcome.acks.extend(acks);
    outcome
}

#[allow(clippy::too_many_arguments)]
fn bind_isa(
    conn: &mut ClientConnection,
    vm: u64,
    tile: u32,
    op: &BindOp,
    elf: Option<u64>,
    module: Option<u64>,
    routing: &Routing,
    acks: &mut Vec<AckToken>,
    outcome: &mut BindOutcome,
) {
    let Some(map) = conn.isa.get_mut(tile as usize) else {
        return;
    };
    if let Some(isa) = map.get_mut(&op.va) {
        isa.bind_count += 1;
        return;
    }
    map.insert(
        op.va,
        IsaAllocation {
            vm,
            va: op.va,
            size: op.length,
            elf,
            module,
            bind_count: 1,
            load_reported: false,
            acked: false,
            pending_acks: vec![],
        },
    );
    log::debug!(target: "session::bind", "isa at {:#x} bound on tile {tile}", op.va);

    // segments of a multi-segment module are reported through the module
    if module.is_some() {
        return;
    }

    let scope = if routing.tile_mode {
        if !routing.tile_attached(tile) {
            return;
        }
        Scope::Tile(tile)
    } else {
        let reported_elsewhere = conn
            .isa
            .iter()
            .enumerate()
            .filter(|(t, _)| *t != tile as usize)
            .any(|(_, map)| map.get(&op.va).is_some_and(|isa| isa.load_reported));
        if reported_elsewhere {
            return;
        }
        Scope::Root
    };

    let info = module_info(conn, routing.hw, elf, op.va);
    let Some(isa) = conn.isa.get_mut(tile as usize).and_then(|map| map.get_mut(&op.va)) else {
        return;
    };
    isa.load_reported = true;
    isa.pending_acks = std::mem::take(acks);
    outcome.events.push(Routed {
        scope,
        event: DebugEvent::with_ack(DebugEventKind::ModuleLoad(info), !isa.pending_acks.is_empty()),
    });
}

fn unbind_isa(
    conn: &mut ClientConnection,
    tile: u32,
    va: u64,
    routing: &Routing,
    outcome: &mut BindOutcome,
) {
    let Some(map) = conn.isa.get_mut(tile as usize) else {
        return;
    };
    let Some(isa) = map.get_mut(&va) else {
        log::debug!(target: "session::bind", "unbind of unknown isa {va:#x}");
        return;
    };
    isa.bind_count = isa.bind_count.saturating_sub(1);
    if isa.bind_count > 0 {
        return;
    }
    let Some(isa) = map.remove(&va) else {
        return;
    };
    log::debug!(target: "session::bind", "isa at {va:#x} unbound on tile {tile}");
    outcome.acks.extend(isa.pending_acks.iter().copied());

    if isa.module.is_some() || !isa.load_reported {
        return;
    }

    let scope = if routing.tile_mode {
        if !routing.tile_attached(tile) {
            return;
        }
        Scope::Tile(tile)
    } else {
        // another tile still holds the segment, it inherits the reported load
        let other = conn
            .isa
            .iter_mut()
            .find_map(|map| map.get_mut(&va));
        if let Some(other) = other {
            other.load_reported = true;
            return;
        }
        Scope::Root
    };

    outcome.events.push(Routed {
        scope,
        event: DebugEvent::new(DebugEventKind::ModuleUnload(module_info(
            conn,
            routing.hw,
            isa.elf,
            va,
        ))),
    });
}

fn bind_module(
    conn: &mut ClientConnection,
    handle: u64,
    tile: u32,
    va: u64,
    routing: &Routing,
    acks: &mut Vec<AckToken>,
    outcome: &mut BindOutcome,
) {
    let Some(module) = conn.modules.get_mut(&handle) else {
        log::warn!(target: "session::bind", "bind of unknown module {handle:#x}");
        return;
    };
    let segment_count = module.segment_count;
    let Some(tm) = module.tiles.get_mut(tile as usize) else {
        return;
    };
    tm.bind_count += 1;
    tm.load_addresses.insert(va);

    if tm.loaded || (tm.load_addresses.len() as u32) < segment_count {
        return;
    }
    tm.loaded = true;
    let load = tm.load_addresses.first().copied().unwrap_or(va);
    log::debug!(target: "session::bind", "module {handle:#x} loaded on tile {tile} at {load:#x}");

    if routing.tile_mode {
        if !routing.tile_attached(tile) {
            return;
        }
        tm.reported = true;
        tm.pending_acks = std::mem::take(acks);
        let need_ack = !tm.pending_acks.is_empty();
        let elf = module.elf;
        outcome.events.push(Routed {
            scope: Scope::Tile(tile),
            event: DebugEvent::with_ack(
                DebugEventKind::ModuleLoad(module_info(conn, routing.hw, elf, load)),
                need_ack,
            ),
        });
        return;
    }

    // a tile reloading a reported module gets no event, its acknowledgments go out now
    if module.reported.is_some() {
        return;
    }
    tm.pending_acks = std::mem::take(acks);
    let all_loaded = module
        .applicable_tiles(tile)
        .iter()
        .all(|t| module.tiles.get(*t as usize).is_some_and(|tm| tm.loaded));
    if !all_loaded {
        return;
    }

    module.reported = Some(load);
    let need_ack = module.tiles.iter().any(|tm| !tm.pending_acks.is_empty());
    let elf = module.elf;
    let info = module_info(conn, routing.hw, elf, load);
    outcome.events.push(Routed {
        scope: Scope::Root,
        event: DebugEvent::with_ack(DebugEventKind::ModuleLoad(info), need_ack),
    });
}

fn unbind_module(
    conn: &mut ClientConnection,
    handle: u64,
    tile: u32,
    va: u64,
    routing: &Routing,
    outcome: &mut BindOutcome,
) {
    let Some(module) = conn.modules.get_mut(&handle) else {
        return;
    };
    let Some(tm) = module.tiles.get_mut(tile as usize) else {
        return;
    };
    if tm.bind_count == 0 {
        return;
    }
    tm.bind_count -= 1;
    if tm.bind_count > 0 {
        return;
    }

    let load = tm.load_addresses.first().copied().unwrap_or(va);
    let tile_reported = tm.reported;
    outcome.acks.append(&mut tm.pending_acks);
    *tm = Default::default();
    log::debug!(target: "session::bind", "module {handle:#x} unloaded on tile {tile}");

    let elf = module.elf;
    let scope = if routing.tile_mode {
        if !tile_reported || !routing.tile_attached(tile) {
            return;
        }
        Scope::Tile(tile)
    } else {
        let drained = module
            .applicable_tiles(tile)
            .iter()
            .all(|t| module.tiles.get(*t as usize).is_some_and(|tm| tm.bind_count == 0));
        if !drained {
            return;
        }
        let Some(load) = module.reported.take() else {
            return;
        };
        let info = module_info(conn, routing.hw, elf, load);
        outcome.events.push(Routed {
            scope: Scope::Root,
            event: DebugEvent::new(DebugEventKind::ModuleUnload(info)),
        });
        return;
    };

    let info = module_info(conn, routing.hw, elf, load);
    outcome.events.push(Routed {
        scope,
        event: DebugEvent::new(DebugEventKind::ModuleUnload(info)),
    });
}

/// Take the deferred acknowledgments of a reported module load.
///
/// Returns an empty list if the load was acknowledged already and
/// [`Error::Uninitialized`] if no reported load matches.
pub(crate) fn take_module_acks(
    conn: &mut ClientConnection,
    scope: Scope,
    load: u64,
) -> Result<Vec<AckToken>, Error> {
    let tiles: Vec<usize> = match scope {
        Scope::Root => (0..conn.isa.len()).collect(),
        Scope::Tile(tile) => vec![tile as usize],
    };
    for tile in &tiles {
        if let Some(isa) = conn.isa.get_mut(*tile).and_then(|map| map.get_mut(&load)) {
            if isa.module.is_none() && isa.load_reported {
                if isa.acked {
                    return Ok(vec![]);
                }
                isa.acked = true;
                return Ok(std::mem::take(&mut isa.pending_acks));
            }
        }
    }

    for module in conn.modules.values_mut() {
        match scope {
            Scope::Root if module.reported == Some(load) => {
                let mut acks = vec![];
                for tm in module.tiles.iter_mut().filter(|tm| tm.loaded) {
                    if !tm.acked {
                        tm.acked = true;
                        acks.append(&mut tm.pending_acks);
                    }
                }
                return Ok(acks);
            }
            Scope::Tile(tile) => {
                let loaded_here = module.load_address(tile) == Some(load);
                let Some(tm) = module.tiles.get_mut(tile as usize) else {
                    continue;
                };
                if tm.reported && loaded_here {
                    if tm.acked {
                        return Ok(vec![]);
                    }
                    tm.acked = true;
                    return Ok(std::mem::take(&mut tm.pending_acks));
                }
            }
            _ => {}
        }
    }

    Err(Error::Uninitialized("module load"))
}

/// Deferred module acknowledgments to send when a tile stops being observed.
fn release(pending: &mut Vec<AckToken>, policy: AckPolicy) -> Vec<AckToken> {
    let pending = std::mem::take(pending);
    match policy {
        AckPolicy::BlockOnCpu => pending.last().copied().into_iter().collect(),
        AckPolicy::BlockOnFence => pending,
    }
}

/// Release deferred acknowledgments of a tile that stops being observed.
/// Kernel code segments release all of them, modules follow the policy.
/// Loads of the tile count as not reported afterwards.
pub(crate) fn detach_tile(
    conn: &mut ClientConnection,
    tile: u32,
    policy: AckPolicy,
) -> Vec<AckToken> {
    let mut acks = vec![];
    if let Some(map) = conn.isa.get_mut(tile as usize) {
        for isa in map.values_mut() {
            acks.append(&mut isa.pending_acks);
            isa.load_reported = false;
            isa.acked = false;
        }
    }
    for module in conn.modules.values_mut() {
        if let Some(tm) = module.tiles.get_mut(tile as usize) {
            acks.extend(release(&mut tm.pending_acks, policy));
            tm.reported = false;
            tm.acked = false;
        }
    }
    acks
}

/// Load events a newly attached tile session must see, loads are marked reported.
pub(crate) fn attach_tile(conn: &mut ClientConnection, tile: u32, hw: &HwInfo) -> Vec<DebugEvent> {
    let mut loads = vec![];
    if let Some(map) = conn.isa.get_mut(tile as usize) {
        for isa in map.values_mut().filter(|isa| isa.module.is_none()) {
            isa.load_reported = true;
            isa.acked = true;
            loads.push((isa.elf, isa.va));
        }
    }
    for module in conn.modules.values_mut() {
        let elf = module.elf;
        let Some(tm) = module.tiles.get_mut(tile as usize) else {
            continue;
        };
        if tm.loaded {
            tm.reported = true;
            tm.acked = true;
            if let Some(load) = tm.load_addresses.first() {
                loads.push((elf, *load));
            }
        }
    }

    loads
        .into_iter()
        .map(|(elf, load)| {
            DebugEvent::new(DebugEventKind::ModuleLoad(module_info(conn, hw, elf, load)))
        })
        .collect()
}

/// All deferred acknowledgments of a client.
pub(crate) fn drain_acks(conn: &mut ClientConnection) -> Vec<AckToken> {
    let mut acks = vec![];
    for map in conn.isa.iter_mut() {
        for isa in map.values_mut() {
            acks.append(&mut isa.pending_acks);
        }
    }
    for module in conn.modules.values_mut() {
        for tm in module.tiles.iter_mut() {
            acks.append(&mut tm.pending_acks);
        }
    }
    acks
}

/// Record a module metadata object.
pub(crate) fn create_module(
    conn: &mut ClientConnection,
    handle: u64,
    segment_count: u32,
    device_bitfield: u32,
) {
    let tiles = conn.isa.len() as u32;
    conn.modules
        .insert(handle, Module::new(segment_count.max(1), device_bitfield, tiles));
}
