use crate::session::lock;
use crate::session::thread::DeviceThread;
use itertools::Itertools;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DetachReason {
    /// The debug connection was invalidated by the host.
    HostExit,
}

/// Address range of a loaded module.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    /// Start of the debug ELF image.
    pub begin: u64,
    /// End of the debug ELF image.
    pub end: u64,
    /// GPU address the module is loaded at.
    pub load: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum DebugEventKind {
    Detached { reason: DetachReason },
    ProcessEntry,
    ProcessExit,
    ModuleLoad(ModuleInfo),
    ModuleUnload(ModuleInfo),
    ThreadStopped { threads: Vec<DeviceThread> },
    ThreadUnavailable { thread: DeviceThread },
    PageFault { address: u64 },
}

/// Event delivered to a debugger.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DebugEvent {
    pub kind: DebugEventKind,
    /// The debugger must acknowledge this event.
    pub need_ack: bool,
}

impl DebugEvent {
    pub fn new(kind: DebugEventKind) -> Self {
        Self {
            kind,
            need_ack: false,
        }
    }

    pub fn with_ack(kind: DebugEventKind, need_ack: bool) -> Self {
        Self { kind, need_ack }
    }
}

impl Display for DebugEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            DebugEventKind::Detached { reason } => write!(f, "detached ({reason:?})")?,
            DebugEventKind::ProcessEntry => write!(f, "process entry")?,
            DebugEventKind::ProcessExit => write!(f, "process exit")?,
            DebugEventKind::ModuleLoad(m) => write!(
                f,
                "module load at {:#x}, elf [{:#x}..{:#x})",
                m.load, m.begin, m.end
            )?,
            DebugEventKind::ModuleUnload(m) => write!(
                f,
                "module unload at {:#x}, elf [{:#x}..{:#x})",
                m.load, m.begin, m.end
            )?,
            DebugEventKind::ThreadStopped { threads } => write!(
                f,
                "threads stopped: [{}]",
                threads.iter().map(|t| format!("({t})")).join(", ")
            )?,
            DebugEventKind::ThreadUnavailable { thread } => {
                write!(f, "thread unavailable: ({thread})")?
            }
            DebugEventKind::PageFault { address } => write!(f, "page fault at {address:#x}")?,
        }
        if self.need_ack {
            write!(f, " [need ack]")?;
        }
        Ok(())
    }
}

/// Queue of events waiting for the debugger.
#[derive(Default)]
pub(crate) struct EventQueue {
    events: Mutex<VecDeque<DebugEvent>>,
    cond: Condvar,
}

impl EventQueue {
    pub(crate) fn push(&self, event: DebugEvent) {
        log::debug!(target: "session", "new debug event: {event}");
        lock(&self.events).push_back(event);
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for an event.
    pub(crate) fn pop(&self, timeout: Duration) -> Option<DebugEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = lock(&self.events);
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            events = match self.cond.wait_timeout(events, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub(crate) fn clear(&self) {
        lock(&self.events).clear();
    }
}
