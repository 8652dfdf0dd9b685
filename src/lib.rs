pub mod backend;
pub mod config;
pub mod device;
pub mod log;
pub mod session;
