//! Crate-wide error type.
//!
//! Every subsystem (transport, backend, connectors, sample pipeline, task
//! engine) maps its failures onto [`CoreError`] so that the CLI front-end and
//! the Task Engine can make policy decisions (retry, skip, abort-batch)
//! without knowing which connector produced the error.

use thiserror::Error;

/// One of the error kinds named by the specification's error handling design.
///
/// These are intentionally coarse: a connector maps a protocol-specific
/// failure (a bad checksum, a NAK opcode, ...) onto the closest kind here
/// rather than inventing per-connector error types that the Task Engine would
/// have to special-case.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    #[error("not connected")]
    NotConnected,
    #[error("timed out")]
    TimedOut,
    #[error("canceled")]
    Canceled,
    #[error("wire I/O error")]
    Wire,
    #[error("protocol error")]
    Protocol,
    #[error("operation unsupported by this filesystem")]
    Unsupported,
    #[error("not found")]
    NotFound,
    #[error("destination exists")]
    Exists,
    #[error("device busy")]
    Busy,
    #[error("out of space")]
    OutOfSpace,
    #[error("bad input")]
    BadInput,
    #[error("fatal internal error")]
    Fatal,
}

impl CoreError {
    /// `errno`-shaped exit code used by the CLI, matching the sign convention
    /// the specification's command table documents (`0 / -errno`).
    pub fn exit_code(self) -> i32 {
        use CoreError::*;
        match self {
            NotConnected => -(libc_like::ENODEV),
            TimedOut => -(libc_like::ETIMEDOUT),
            Canceled => -(libc_like::ECANCELED),
            Wire => -(libc_like::EIO),
            Protocol => -(libc_like::EPROTO),
            Unsupported => -(libc_like::ENOSYS),
            NotFound => -(libc_like::ENOENT),
            Exists => -(libc_like::EEXIST),
            Busy => -(libc_like::EBUSY),
            OutOfSpace => -(libc_like::ENOSPC),
            BadInput => -(libc_like::EINVAL),
            Fatal => -(libc_like::EFAULT),
        }
    }
}

/// Small table of the POSIX error numbers the specification's receive
/// algorithm and exit-code table reference by name, without pulling `libc`
/// in just for a handful of constants.
mod libc_like {
    pub const ENODEV: i32 = 19;
    pub const ETIMEDOUT: i32 = 110;
    pub const ECANCELED: i32 = 125;
    pub const EIO: i32 = 5;
    pub const EPROTO: i32 = 71;
    pub const ENOSYS: i32 = 38;
    pub const ENOENT: i32 = 2;
    pub const EEXIST: i32 = 17;
    pub const EBUSY: i32 = 16;
    pub const ENOSPC: i32 = 28;
    pub const EFAULT: i32 = 14;
}

pub type Result<T> = std::result::Result<T, CoreError>;
