//! Error types for cuipc

use crate::driver::DriverCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{op} failed: {code}")]
    Driver { op: &'static str, code: DriverCode },

    #[error("cannot open an IPC handle exported by this process")]
    SelfImport,

    #[error("unsupported target: {0}")]
    UnsupportedTarget(String),

    #[error("buffer already released")]
    Released,

    #[error("invalid IPC handle: {0}")]
    InvalidHandle(String),

    #[error("driver library error: {0}")]
    Library(String),

    #[error("range out of bounds: {offset} + {len} exceeds {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(String),
}

impl Error {
    /// Build a native failure for `op` carrying the raw driver result
    pub(crate) fn driver(op: &'static str, code: impl Into<DriverCode>) -> Self {
        Error::Driver {
            op,
            code: code.into(),
        }
    }

    /// Native result code, if this is a native-call failure
    pub fn driver_code(&self) -> Option<DriverCode> {
        match self {
            Error::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
