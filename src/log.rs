use std::sync::atomic::{AtomicU32, Ordering};

/// Log categories that can be switched on and off while a session runs.
pub mod category {
    pub const INFO: u32 = 1 << 0;
    pub const ERROR: u32 = 1 << 1;
    pub const THREADS: u32 = 1 << 2;
    pub const MEMORY: u32 = 1 << 3;
    pub const EVENTS: u32 = 1 << 4;

    pub const ALL: u32 = INFO | ERROR | THREADS | MEMORY | EVENTS;
    pub const DEFAULT: u32 = INFO | ERROR;
}

static ENABLED: AtomicU32 = AtomicU32::new(category::DEFAULT);

#[inline(always)]
pub fn is_enabled(category: u32) -> bool {
    ENABLED.load(Ordering::Relaxed) & category != 0
}

/// Replace the whole category mask.
pub fn set(mask: u32) {
    ENABLED.store(mask & category::ALL, Ordering::SeqCst)
}

pub fn enable(category: u32) {
    ENABLED.fetch_or(category, Ordering::SeqCst);
}

pub fn disable(category: u32) {
    ENABLED.fetch_and(!category, Ordering::SeqCst);
}

pub fn current() -> u32 {
    ENABLED.load(Ordering::SeqCst)
}

#[macro_export]
macro_rules! eu_info {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::category::INFO) {
            log::info!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::category::INFO) {
            log::info!($($arg)+)
        }
    };
}

#[macro_export]
macro_rules! eu_error {
    (target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::category::ERROR) {
            log::error!(target: $target, $($arg)+)
        }
    };
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::category::ERROR) {
            log::error!($($arg)+)
        }
    };
}

/// Thread state transitions, attention and interrupt traffic.
#[macro_export]
macro_rules! eu_thread {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::category::THREADS) {
            log::debug!(target: "session::thread", $($arg)+)
        }
    };
}

/// GPU memory transfers.
#[macro_export]
macro_rules! eu_mem {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::category::MEMORY) {
            log::debug!(target: "session::mem", $($arg)+)
        }
    };
}

/// Raw kernel event dumps.
#[macro_export]
macro_rules! eu_event {
    ($($arg:tt)+) => {
        if $crate::log::is_enabled($crate::log::category::EVENTS) {
            log::trace!(target: "session::ingest", $($arg)+)
        }
    };
}
