//! Conventional buffers backed by imported handles
//!
//! Some call sites need a [`DeviceBuffer`] rather than an [`IpcBuffer`]. An
//! import first produces an [`ImportedRegion`]; the buffer is then built
//! from that descriptor and remembers that its pointer is a mapping.
//!
//! [`IpcBuffer`]: crate::IpcBuffer

use crate::buffer::{byte_len, DeviceBuffer, MemoryBuffer, Provenance};
use crate::context::{Accelerator, DevicePtr};
use crate::flags::IpcMemFlags;
use crate::handle::IpcHandle;
use crate::{ipc, Error, Result};
use std::fmt;
use std::sync::Arc;

/// Result of a successful import: an open mapping plus its layout.
///
/// The region owns the mapping until it is handed to
/// [`DeviceBuffer::from_imported`]; dropping it earlier closes the mapping.
pub struct ImportedRegion {
    accelerator: Arc<dyn Accelerator>,
    ptr: DevicePtr,
    length: usize,
    element_size: usize,
    handle: IpcHandle,
}

impl ImportedRegion {
    /// Open `handle` as `length` elements of `element_size` bytes.
    ///
    /// A zero-length region maps nothing and has a null pointer.
    pub fn import(
        accelerator: Arc<dyn Accelerator>,
        handle: IpcHandle,
        length: usize,
        element_size: usize,
        flags: IpcMemFlags,
    ) -> Result<Self> {
        let ptr = if byte_len(length, element_size)? == 0 {
            DevicePtr::NULL
        } else {
            ipc::open_handle(accelerator.as_ref(), &handle, flags)?
        };
        Ok(Self {
            accelerator,
            ptr,
            length,
            element_size,
            handle,
        })
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn handle(&self) -> &IpcHandle {
        &self.handle
    }

    /// Close the mapping without building a buffer
    pub fn close(mut self) -> Result<()> {
        self.close_mapping()
    }

    fn take_ptr(&mut self) -> DevicePtr {
        std::mem::replace(&mut self.ptr, DevicePtr::NULL)
    }

    fn close_mapping(&mut self) -> Result<()> {
        let ptr = self.take_ptr();
        if ptr.is_null() {
            return Ok(());
        }
        ipc::close_handle(self.accelerator.as_ref(), ptr)
    }
}

impl fmt::Debug for ImportedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportedRegion")
            .field("device_id", &self.accelerator.device_id())
            .field("ptr", &self.ptr)
            .field("length", &self.length)
            .field("element_size", &self.element_size)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Drop for ImportedRegion {
    fn drop(&mut self) {
        if let Err(e) = self.close_mapping() {
            log::warn!("failed to close imported region: {}", e);
        }
    }
}

impl DeviceBuffer {
    /// Build a buffer around an imported region on the region's accelerator.
    ///
    /// The buffer takes over the mapping; releasing it closes the mapping
    /// instead of freeing memory.
    pub fn from_imported(mut region: ImportedRegion) -> Self {
        let ptr = region.take_ptr();
        let provenance = if ptr.is_null() {
            Provenance::Empty
        } else {
            Provenance::Imported(region.handle)
        };
        DeviceBuffer::from_parts(
            Arc::clone(&region.accelerator),
            ptr,
            region.length,
            region.element_size,
            provenance,
        )
    }

    /// Dispose this buffer's own allocation, then back it with `handle`.
    ///
    /// On failure the original allocation is already gone and no buffer is
    /// returned.
    pub fn rehome_from_ipc(
        mut self,
        handle: IpcHandle,
        length: usize,
        element_size: usize,
    ) -> Result<DeviceBuffer> {
        let accelerator = Arc::clone(self.accelerator());
        self.release()?;
        drop(self);
        try_create_buffer_from_ipc_handle(&accelerator, handle, length, element_size)
    }

    /// Close the IPC mapping behind this buffer, then dispose the buffer.
    pub fn ipc_close(mut self) -> Result<()> {
        match self.provenance() {
            Provenance::Imported(_) | Provenance::Empty => self.release(),
            Provenance::Allocated => Err(Error::UnsupportedTarget(
                "buffer was allocated, not imported".to_string(),
            )),
        }
    }
}

/// Import `handle` into a conventional [`DeviceBuffer`]
pub fn try_create_buffer_from_ipc_handle(
    accelerator: &Arc<dyn Accelerator>,
    handle: IpcHandle,
    length: usize,
    element_size: usize,
) -> Result<DeviceBuffer> {
    let region = ImportedRegion::import(
        Arc::clone(accelerator),
        handle,
        length,
        element_size,
        IpcMemFlags::default(),
    )?;
    Ok(DeviceBuffer::from_imported(region))
}
