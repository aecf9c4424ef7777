//! Native IPC surface
//!
//! Exactly three driver entry points are needed for cross-process sharing:
//! export a handle, open a handle, close an opened mapping. Implementations
//! pass through to the driver; a failing call surfaces as
//! [`Error::Driver`](crate::Error::Driver) carrying the untouched result code.

use crate::context::DevicePtr;
use crate::flags::IpcMemFlags;
use crate::handle::IpcHandle;
use crate::Result;
use std::fmt;

/// Raw driver result code (`CUresult`)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverCode(pub i32);

impl DriverCode {
    pub const SUCCESS: Self = Self(0);
    pub const INVALID_VALUE: Self = Self(1);
    pub const OUT_OF_MEMORY: Self = Self(2);
    pub const NOT_INITIALIZED: Self = Self(3);
    pub const INVALID_CONTEXT: Self = Self(201);
    pub const MAP_FAILED: Self = Self(205);
    pub const INVALID_HANDLE: Self = Self(400);
    pub const NOT_SUPPORTED: Self = Self(801);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Symbolic name for codes this crate knows about
    pub fn name(&self) -> Option<&'static str> {
        match self.0 {
            0 => Some("CUDA_SUCCESS"),
            1 => Some("CUDA_ERROR_INVALID_VALUE"),
            2 => Some("CUDA_ERROR_OUT_OF_MEMORY"),
            3 => Some("CUDA_ERROR_NOT_INITIALIZED"),
            201 => Some("CUDA_ERROR_INVALID_CONTEXT"),
            205 => Some("CUDA_ERROR_MAP_FAILED"),
            400 => Some("CUDA_ERROR_INVALID_HANDLE"),
            801 => Some("CUDA_ERROR_NOT_SUPPORTED"),
            _ => None,
        }
    }
}

impl From<i32> for DriverCode {
    fn from(code: i32) -> Self {
        Self(code)
    }
}

impl fmt::Display for DriverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "driver error {}", self.0),
        }
    }
}

impl fmt::Debug for DriverCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriverCode({})", self)
    }
}

/// Driver IPC entry points.
///
/// Callers must have the owning context bound on the current thread.
pub trait NativeIpc: Send + Sync {
    /// Export a handle for the allocation containing `ptr`
    fn get_mem_handle(&self, ptr: DevicePtr) -> Result<IpcHandle>;

    /// Map the allocation named by `handle` into this process
    fn open_mem_handle(&self, handle: &IpcHandle, flags: IpcMemFlags) -> Result<DevicePtr>;

    /// Drop one reference to a mapping returned by `open_mem_handle`
    fn close_mem_handle(&self, ptr: DevicePtr) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_display() {
        assert_eq!(
            DriverCode::INVALID_CONTEXT.to_string(),
            "CUDA_ERROR_INVALID_CONTEXT (201)"
        );
        assert_eq!(DriverCode(9999).to_string(), "driver error 9999");
        assert!(DriverCode::from(0).is_success());
    }
}
