//! Interrupt requests and batching of thread stops reported through attention events.

use crate::session::error::Error;
use crate::session::thread::{DeviceThread, ThreadId};
use crate::session::Scope;
use crate::eu_thread;
use std::time::{Duration, Instant};

const CR0_EXCEPTION_MASK: u32 = 0xFC00_0000;
const CR0_FORCED_EXCEPTION_MASK: u32 = 0x4400_0000;

/// True if the exception bits of CR0 hold nothing but forced exception or external halt.
pub(crate) fn is_forced_exception_only(cr0: &[u8]) -> bool {
    let Some(dword) = cr0.get(4..8) else {
        return false;
    };
    let dword = u32::from_le_bytes([dword[0], dword[1], dword[2], dword[3]]);
    (dword & CR0_EXCEPTION_MASK) & !CR0_FORCED_EXCEPTION_MASK == 0
}

/// Interrupt request of a debugger.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct InterruptRequest {
    pub scope: Scope,
    pub selector: DeviceThread,
    /// Threads covered by the selector.
    pub threads: Vec<ThreadId>,
    /// Threads that stopped for this request.
    pub stopped: Vec<ThreadId>,
}

impl InterruptRequest {
    pub fn new(scope: Scope, selector: DeviceThread, threads: Vec<ThreadId>) -> Self {
        Self {
            scope,
            selector,
            threads,
            stopped: vec![],
        }
    }

    pub fn tiles(&self) -> Vec<u32> {
        let mut tiles: Vec<u32> = self.threads.iter().map(|t| t.tile).collect();
        tiles.sort_unstable();
        tiles.dedup();
        tiles
    }
}

/// Stops ready to be reported.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct AttentionBatch {
    pub requests: Vec<InterruptRequest>,
    /// Threads that stopped without being asked to.
    pub unsolicited: Vec<ThreadId>,
}

pub(crate) struct AttentionTracker {
    queued: Vec<InterruptRequest>,
    sent: Vec<InterruptRequest>,
    interrupt_time: Option<Instant>,
    /// Sequence number of the last interrupt of every tile.
    interrupt_seqno: Vec<Option<u64>>,
    expected_attentions: u32,
    last_attention: Option<Instant>,
    newly_stopped: Vec<ThreadId>,
}

impl AttentionTracker {
    pub fn new(tiles: u32) -> Self {
        Self {
            queued: vec![],
            sent: vec![],
            interrupt_time: None,
            interrupt_seqno: vec![None; tiles.max(1) as usize],
            expected_attentions: 0,
            last_attention: None,
            newly_stopped: vec![],
        }
    }

    /// Queue an interrupt request, a request equal to a pending one is rejected.
    pub fn queue(&mut self, request: InterruptRequest) -> Result<(), Error> {
        let duplicate = self
            .queued
            .iter()
            .chain(self.sent.iter())
            .any(|r| r.scope == request.scope && r.selector == request.selector);
        if duplicate {
            return Err(Error::NotReady);
        }
        eu_thread!("interrupt request for {} queued", request.selector);
        self.queued.push(request);
        Ok(())
    }

    pub fn interrupt_in_flight(&self) -> bool {
        self.interrupt_time.is_some()
    }

    /// Take queued requests if no interrupt is in flight.
    pub fn take_queued(&mut self) -> Vec<InterruptRequest> {
        if self.interrupt_in_flight() {
            return vec![];
        }
        std::mem::take(&mut self.queued)
    }

    /// Register interrupts sent to the kernel.
    pub fn interrupt_sent(
        &mut self,
        requests: Vec<InterruptRequest>,
        seqnos: &[(u32, u64)],
        expected_attentions: u32,
        now: Instant,
    ) {
        for (tile, seqno) in seqnos {
            if let Some(slot) = self.interrupt_seqno.get_mut(*tile as usize) {
                *slot = Some(*seqno);
            }
        }
        self.sent.extend(requests);
        self.expected_attentions = expected_attentions;
        self.interrupt_time = Some(now);
    }

    /// True for attention events that were raised before the last interrupt of the tile.
    pub fn is_stale(&self, tile: u32, seqno: u64) -> bool {
        self.interrupt_seqno
            .get(tile as usize)
            .copied()
            .flatten()
            .is_some_and(|interrupt| seqno <= interrupt)
    }

    pub fn attention_received(&mut self, now: Instant) {
        self.expected_attentions = self.expected_attentions.saturating_sub(1);
        self.last_attention = Some(now);
    }

    /// Threads stopped outside of an attention event, only restarts the grace period.
    pub fn stop_observed(&mut self, now: Instant) {
        self.last_attention = Some(now);
    }

    /// Attribute a newly stopped thread to the requests covering it.
    /// Threads that were already stopped and are not requested are ignored.
    pub fn mark_stopped(&mut self, id: ThreadId, was_stopped: bool) {
        let mut interrupted = false;
        for request in self.sent.iter_mut().filter(|r| r.threads.contains(&id)) {
            if !request.stopped.contains(&id) {
                request.stopped.push(id);
            }
            interrupted = true;
        }
        if !interrupted && !was_stopped && !self.newly_stopped.contains(&id) {
            self.newly_stopped.push(id);
        }
    }

    /// Decide whether collected stops must be reported now.
    pub fn should_trigger(
        &self,
        now: Instant,
        grace: Duration,
        interrupt_timeout: Duration,
    ) -> bool {
        let quiet = self
            .last_attention
            .is_some_and(|last| now.saturating_duration_since(last) >= grace);

        if let Some(sent) = self.interrupt_time {
            let heard = self.last_attention.is_some_and(|last| last >= sent);
            return (heard && (self.expected_attentions == 0 || quiet))
                || now.saturating_duration_since(sent) >= interrupt_timeout;
        }

        !self.newly_stopped.is_empty() && quiet
    }

    /// Take everything to report and end the current interrupt.
    pub fn take_batch(&mut self) -> AttentionBatch {
        self.interrupt_time = None;
        self.expected_attentions = 0;
        AttentionBatch {
            requests: std::mem::take(&mut self.sent),
            unsolicited: std::mem::take(&mut self.newly_stopped),
        }
    }

    pub fn reset(&mut self) {
        let tiles = self.interrupt_seqno.len() as u32;
        *self = Self::new(tiles);
    }
}
