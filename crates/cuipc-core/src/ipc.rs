//! Handle export, import and release on an accelerator
//!
//! Every operation binds the accelerator's context for the duration of the
//! native call. Handles exported here are remembered together with the
//! exporting process id so that opening one in the same process fails with
//! [`Error::SelfImport`] instead of reaching the driver.

use crate::buffer::MemoryBuffer;
use crate::context::{Accelerator, ContextGuard, DevicePtr};
use crate::driver::NativeIpc;
use crate::flags::IpcMemFlags;
use crate::handle::IpcHandle;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};

#[derive(Debug, Clone, Copy)]
struct ExportRecord {
    pid: u32,
    ptr: DevicePtr,
}

fn exports() -> &'static Mutex<HashMap<IpcHandle, ExportRecord>> {
    static EXPORTS: OnceLock<Mutex<HashMap<IpcHandle, ExportRecord>>> = OnceLock::new();
    EXPORTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Whether `handle` was exported by the calling process
pub fn is_exported_here(handle: &IpcHandle) -> bool {
    let pid = std::process::id();
    exports()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(handle)
        .is_some_and(|record| record.pid == pid)
}

fn forget_exports(ptr: DevicePtr) {
    let pid = std::process::id();
    exports()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .retain(|_, record| !(record.pid == pid && record.ptr == ptr));
}

fn ipc_surface(accelerator: &dyn Accelerator) -> Result<&dyn NativeIpc> {
    let kind = accelerator.kind();
    if !kind.supports_ipc() {
        return Err(Error::UnsupportedTarget(format!(
            "{} accelerators cannot share memory through IPC",
            kind
        )));
    }
    accelerator.native_ipc().ok_or_else(|| {
        Error::UnsupportedTarget(format!(
            "{} device {} has no IPC entry points",
            kind,
            accelerator.device_id()
        ))
    })
}

/// Export a handle for the allocation at `ptr`.
///
/// The driver may zero a fresh allocation when it is first exported. Export
/// before writing data that must survive.
pub fn export_handle(accelerator: &dyn Accelerator, ptr: DevicePtr) -> Result<IpcHandle> {
    let native = ipc_surface(accelerator)?;
    let handle = {
        let _bound = ContextGuard::bind(accelerator)?;
        native.get_mem_handle(ptr)?
    };
    exports()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(
            handle,
            ExportRecord {
                pid: std::process::id(),
                ptr,
            },
        );
    log::debug!("exported IPC handle for {:?} on device {}", ptr, accelerator.device_id());
    Ok(handle)
}

/// Map the allocation named by `handle` into this process.
///
/// Handles exported by this same process are rejected.
pub fn open_handle(
    accelerator: &dyn Accelerator,
    handle: &IpcHandle,
    flags: IpcMemFlags,
) -> Result<DevicePtr> {
    let native = ipc_surface(accelerator)?;
    if is_exported_here(handle) {
        return Err(Error::SelfImport);
    }
    let ptr = {
        let _bound = ContextGuard::bind(accelerator)?;
        native.open_mem_handle(handle, flags)?
    };
    log::debug!("opened IPC handle as {:?} on device {}", ptr, accelerator.device_id());
    Ok(ptr)
}

/// Release one reference to a mapping; the last one unmaps it.
///
/// The exporting process and other importers are not affected.
pub fn close_handle(accelerator: &dyn Accelerator, ptr: DevicePtr) -> Result<()> {
    let native = ipc_surface(accelerator)?;
    {
        let _bound = ContextGuard::bind(accelerator)?;
        native.close_mem_handle(ptr)?;
    }
    log::debug!("closed IPC mapping {:?} on device {}", ptr, accelerator.device_id());
    Ok(())
}

/// Free an allocation and forget every handle exported from it.
///
/// Allocations that were exported must be freed here rather than through
/// [`Accelerator::free`], which leaves their handles registered.
pub fn free_allocation(accelerator: &dyn Accelerator, ptr: DevicePtr) -> Result<()> {
    forget_exports(ptr);
    let _bound = ContextGuard::bind(accelerator)?;
    accelerator.free(ptr)
}

/// Export a handle for a buffer's allocation
pub fn export_buffer_handle(buffer: &dyn MemoryBuffer) -> Result<IpcHandle> {
    let view = buffer.view()?;
    export_handle(view.accelerator(), view.ptr())
}

/// IPC operations as methods on an accelerator
pub trait AcceleratorIpcExt {
    fn export_ipc_handle(&self, ptr: DevicePtr) -> Result<IpcHandle>;

    fn open_ipc_handle(&self, handle: &IpcHandle, flags: IpcMemFlags) -> Result<DevicePtr>;

    fn close_ipc_handle(&self, ptr: DevicePtr) -> Result<()>;
}

impl AcceleratorIpcExt for dyn Accelerator + '_ {
    fn export_ipc_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        export_handle(self, ptr)
    }

    fn open_ipc_handle(&self, handle: &IpcHandle, flags: IpcMemFlags) -> Result<DevicePtr> {
        open_handle(self, handle, flags)
    }

    fn close_ipc_handle(&self, ptr: DevicePtr) -> Result<()> {
        close_handle(self, ptr)
    }
}

impl<A: Accelerator> AcceleratorIpcExt for A {
    fn export_ipc_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        export_handle(self, ptr)
    }

    fn open_ipc_handle(&self, handle: &IpcHandle, flags: IpcMemFlags) -> Result<DevicePtr> {
        open_handle(self, handle, flags)
    }

    fn close_ipc_handle(&self, ptr: DevicePtr) -> Result<()> {
        close_handle(self, ptr)
    }
}
