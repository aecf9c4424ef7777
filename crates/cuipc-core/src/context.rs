//! Accelerator collaborator and scoped context binding

use crate::driver::NativeIpc;
use crate::Result;
use std::fmt;

/// Process-local address in device address space
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Pointer `bytes` past this one
    pub const fn offset(&self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Debug for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.0)
    }
}

/// Accelerator family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceleratorKind {
    Cuda,
    OpenCl,
    Cpu,
}

impl AcceleratorKind {
    /// Whether device pointers of this family can be exported through IPC
    pub fn supports_ipc(&self) -> bool {
        matches!(self, AcceleratorKind::Cuda)
    }
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AcceleratorKind::Cuda => "CUDA",
            AcceleratorKind::OpenCl => "OpenCL",
            AcceleratorKind::Cpu => "CPU",
        };
        f.write_str(name)
    }
}

/// Ordering token for device work; operations on one stream complete in
/// enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    raw: u64,
    device_id: i32,
}

impl Stream {
    pub const fn from_raw(raw: u64, device_id: i32) -> Self {
        Self { raw, device_id }
    }

    pub const fn as_raw(&self) -> u64 {
        self.raw
    }

    pub const fn device_id(&self) -> i32 {
        self.device_id
    }
}

/// A device with a bindable context.
///
/// The memory primitives assume the context is current on the calling
/// thread; use [`ContextGuard`] around them. Stream arguments of `None`
/// select the default stream.
pub trait Accelerator: Send + Sync {
    fn kind(&self) -> AcceleratorKind;

    fn device_id(&self) -> i32;

    /// IPC entry points, `None` for families that cannot share memory
    fn native_ipc(&self) -> Option<&dyn NativeIpc>;

    /// Make this context current, remembering the previous one
    fn push_context(&self) -> Result<()>;

    /// Restore the context that was current before the matching push
    fn pop_context(&self) -> Result<()>;

    fn alloc(&self, bytes: usize) -> Result<DevicePtr>;

    /// Free an allocation; exported ones go through
    /// [`crate::ipc::free_allocation`]
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    fn memset(&self, dst: DevicePtr, value: u8, bytes: usize, stream: Option<&Stream>)
        -> Result<()>;

    fn copy_htod(&self, dst: DevicePtr, src: &[u8], stream: Option<&Stream>) -> Result<()>;

    fn copy_dtoh(&self, dst: &mut [u8], src: DevicePtr, stream: Option<&Stream>) -> Result<()>;

    fn copy_dtod(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: Option<&Stream>,
    ) -> Result<()>;

    fn create_stream(&self) -> Result<Stream>;

    fn destroy_stream(&self, stream: Stream) -> Result<()>;

    fn synchronize_stream(&self, stream: &Stream) -> Result<()>;

    /// Wait until the device is idle
    fn synchronize(&self) -> Result<()>;
}

/// Keeps an accelerator's context current until dropped, then restores
/// whatever was current before.
#[must_use = "the context is unbound when the guard is dropped"]
pub struct ContextGuard<'a> {
    accelerator: &'a dyn Accelerator,
}

impl<'a> ContextGuard<'a> {
    pub fn bind(accelerator: &'a dyn Accelerator) -> Result<Self> {
        accelerator.push_context()?;
        Ok(Self { accelerator })
    }

    pub fn accelerator(&self) -> &'a dyn Accelerator {
        self.accelerator
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.accelerator.pop_context() {
            log::warn!(
                "failed to restore context after {} device {}: {}",
                self.accelerator.kind(),
                self.accelerator.device_id(),
                e
            );
        }
    }
}
