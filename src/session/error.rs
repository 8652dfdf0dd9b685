use crate::session::sip::RegsetKind;
use crate::session::thread::ThreadId;
use nix::errno::Errno;
use strum_macros::Display;

/// Error classes reported to a debugger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ErrorKind {
    #[strum(serialize = "unsupported feature")]
    UnsupportedFeature,
    #[strum(serialize = "not available")]
    NotAvailable,
    #[strum(serialize = "insufficient permission")]
    InsufficientPermission,
    #[strum(serialize = "unknown")]
    Unknown,
    #[strum(serialize = "not ready")]
    NotReady,
    #[strum(serialize = "decode error")]
    DecodeError,
    #[strum(serialize = "resource exhausted")]
    ResourceExhausted,
    #[strum(serialize = "invalid argument")]
    InvalidArgument,
    #[strum(serialize = "uninitialized")]
    Uninitialized,
    #[strum(serialize = "device lost")]
    DeviceLost,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("configuration parsing error: {0}")]
    Config(#[from] toml::de::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no such object: {0}")]
    Uninitialized(&'static str),

    // --------------------------------- attach errors ---------------------------------------------
    #[error("feature not supported by the kernel driver")]
    UnsupportedFeature,
    #[error("debug target not available")]
    NotAvailable,
    #[error("insufficient permission")]
    InsufficientPermission,
    #[error("unknown error")]
    Unknown,
    #[error("not ready")]
    NotReady,
    #[error("device lost, client {0:#x} closed during attach")]
    DeviceLost(u64),

    // --------------------------------- event errors ----------------------------------------------
    #[error("event decode error: {0}")]
    Decode(String),
    #[error("unknown event flags {0:#x}")]
    UnknownFlags(u32),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("{0} ioctl error: {1}")]
    Ioctl(&'static str, nix::Error),

    // --------------------------------- state save area errors ------------------------------------
    #[error("state save area not found for vm {0:#x}")]
    NoStateSaveArea(u64),
    #[error("invalid state save area header")]
    InvalidSipHeader,
    #[error("system routine ident of thread {0} not valid")]
    InvalidSrIdent(ThreadId),
    #[error("invalid module debug area")]
    InvalidDebugArea,
    #[error("register set {0} not available")]
    RegsetNotAvailable(RegsetKind),
    #[error("register set {0} is read-only")]
    RegsetReadOnly(RegsetKind),
}

impl Error {
    /// Map an errno of a failed backend open/connect.
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::ENODEV => Error::UnsupportedFeature,
            Errno::EBUSY => Error::NotAvailable,
            Errno::EACCES => Error::InsufficientPermission,
            _ => Error::Unknown,
        }
    }

    /// Error class exposed to a debugger.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IO(_) => ErrorKind::Unknown,
            Error::Config(_) => ErrorKind::InvalidArgument,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Uninitialized(_) => ErrorKind::Uninitialized,
            Error::UnsupportedFeature => ErrorKind::UnsupportedFeature,
            Error::NotAvailable => ErrorKind::NotAvailable,
            Error::InsufficientPermission => ErrorKind::InsufficientPermission,
            Error::Unknown => ErrorKind::Unknown,
            Error::NotReady => ErrorKind::NotReady,
            Error::DeviceLost(_) => ErrorKind::DeviceLost,
            Error::Decode(_) => ErrorKind::DecodeError,
            Error::UnknownFlags(_) => ErrorKind::DecodeError,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Syscall(_, _) => ErrorKind::Unknown,
            Error::Ioctl(_, _) => ErrorKind::Unknown,
            Error::NoStateSaveArea(_) => ErrorKind::NotAvailable,
            Error::InvalidSipHeader => ErrorKind::Unknown,
            Error::InvalidSrIdent(_) => ErrorKind::Unknown,
            Error::InvalidDebugArea => ErrorKind::Unknown,
            Error::RegsetNotAvailable(_) => ErrorKind::InvalidArgument,
            Error::RegsetReadOnly(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Return a hint to an interface - continue debugging after error or drop the session.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Config(_) => false,
            Error::InvalidArgument(_) => false,
            Error::Uninitialized(_) => false,
            Error::NotAvailable => false,
            Error::NotReady => false,
            Error::Decode(_) => false,
            Error::UnknownFlags(_) => false,
            Error::ResourceExhausted(_) => false,
            Error::Ioctl(_, _) => false,
            Error::NoStateSaveArea(_) => false,
            Error::InvalidSrIdent(_) => false,
            Error::RegsetNotAvailable(_) => false,
            Error::RegsetReadOnly(_) => false,
            Error::Unknown => false,

            // currently fatal errors
            Error::UnsupportedFeature => true,
            Error::InsufficientPermission => true,
            Error::DeviceLost(_) => true,
            Error::Syscall(_, _) => true,
            Error::InvalidSipHeader => true,
            Error::InvalidDebugArea => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "session", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
