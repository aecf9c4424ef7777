//! Device buffer contract and the conventional allocate/free buffer

use crate::context::{Accelerator, ContextGuard, DevicePtr, Stream};
use crate::dtype::{as_bytes, as_bytes_mut, Element};
use crate::handle::IpcHandle;
use crate::transfer::{self, DeviceView};
use crate::{ipc, Error, Result};
use std::fmt;
use std::sync::Arc;

/// Read/write/copy contract shared by every device buffer.
///
/// Callers cannot tell an allocated buffer from an imported one through this
/// trait; only release differs.
pub trait MemoryBuffer {
    fn accelerator(&self) -> &Arc<dyn Accelerator>;

    /// Length in elements
    fn length(&self) -> usize;

    /// Element size in bytes
    fn element_size(&self) -> usize;

    fn length_in_bytes(&self) -> usize {
        self.length() * self.element_size()
    }

    /// Device pointer; null for empty or released buffers
    fn device_ptr(&self) -> DevicePtr;

    fn is_released(&self) -> bool;

    /// Whole-buffer view for transfers
    fn view(&self) -> Result<DeviceView<'_>> {
        if self.is_released() {
            return Err(Error::Released);
        }
        Ok(DeviceView::new(
            self.accelerator().as_ref(),
            self.device_ptr(),
            self.length_in_bytes(),
        ))
    }
}

fn check_element<T: Element, B: MemoryBuffer + ?Sized>(buffer: &B) -> Result<()> {
    let size = std::mem::size_of::<T>();
    if size != buffer.element_size() {
        return Err(Error::LengthMismatch {
            expected: buffer.element_size(),
            actual: size,
        });
    }
    Ok(())
}

/// Typed data operations available on every buffer
pub trait BufferExt: MemoryBuffer {
    /// Set every byte to `value`
    fn memset(&self, value: u8, stream: Option<&Stream>) -> Result<()> {
        transfer::memset(stream, value, &self.view()?)
    }

    /// Copy `data` into the front of the buffer
    fn copy_from_host<T: Element>(&self, data: &[T], stream: Option<&Stream>) -> Result<()> {
        check_element::<T, _>(self)?;
        transfer::copy_from_host(stream, as_bytes(data), &self.view()?)
    }

    /// Fill `out` from the front of the buffer
    fn copy_to_host<T: Element>(&self, out: &mut [T], stream: Option<&Stream>) -> Result<()> {
        check_element::<T, _>(self)?;
        transfer::copy_to_host(stream, &self.view()?, as_bytes_mut(out))
    }

    /// Read the whole buffer back to the host
    fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let mut out = vec![T::default(); self.length()];
        self.copy_to_host(&mut out, None)?;
        Ok(out)
    }

    /// Copy all of `source` into this buffer
    fn copy_from_buffer(&self, source: &dyn MemoryBuffer, stream: Option<&Stream>) -> Result<()> {
        transfer::copy(stream, &source.view()?, &self.view()?)
    }

    /// Copy this buffer into all of `target`
    fn copy_to_buffer(&self, target: &dyn MemoryBuffer, stream: Option<&Stream>) -> Result<()> {
        transfer::copy(stream, &self.view()?, &target.view()?)
    }
}

impl<B: MemoryBuffer + ?Sized> BufferExt for B {}

pub(crate) fn byte_len(length: usize, element_size: usize) -> Result<usize> {
    length
        .checked_mul(element_size)
        .ok_or(Error::OutOfBounds {
            offset: 0,
            len: length,
            capacity: usize::MAX / element_size.max(1),
        })
}

/// Where a buffer's device pointer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Allocated by this process; release frees it
    Allocated,
    /// Mapped from an IPC handle; release closes the mapping
    Imported(IpcHandle),
    /// Zero-length, no native resource
    Empty,
}

/// Conventional device buffer
pub struct DeviceBuffer {
    accelerator: Arc<dyn Accelerator>,
    ptr: DevicePtr,
    length: usize,
    element_size: usize,
    provenance: Provenance,
    released: bool,
}

impl DeviceBuffer {
    /// Allocate `length` elements of `element_size` bytes
    pub fn allocate(
        accelerator: Arc<dyn Accelerator>,
        length: usize,
        element_size: usize,
    ) -> Result<Self> {
        let bytes = byte_len(length, element_size)?;
        if bytes == 0 {
            return Ok(Self::from_parts(
                accelerator,
                DevicePtr::NULL,
                length,
                element_size,
                Provenance::Empty,
            ));
        }
        let ptr = {
            let _bound = ContextGuard::bind(accelerator.as_ref())?;
            accelerator.alloc(bytes)?
        };
        log::debug!(
            "allocated {} bytes at {:?} on device {}",
            bytes,
            ptr,
            accelerator.device_id()
        );
        Ok(Self::from_parts(
            accelerator,
            ptr,
            length,
            element_size,
            Provenance::Allocated,
        ))
    }

    /// Allocate `length` elements of `T`
    pub fn allocate_typed<T: Element>(accelerator: Arc<dyn Accelerator>, length: usize) -> Result<Self> {
        Self::allocate(accelerator, length, std::mem::size_of::<T>())
    }

    pub(crate) fn from_parts(
        accelerator: Arc<dyn Accelerator>,
        ptr: DevicePtr,
        length: usize,
        element_size: usize,
        provenance: Provenance,
    ) -> Self {
        Self {
            accelerator,
            ptr,
            length,
            element_size,
            provenance,
            released: false,
        }
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Free the allocation or close the mapping. Later calls do nothing.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let ptr = std::mem::replace(&mut self.ptr, DevicePtr::NULL);
        match self.provenance {
            Provenance::Allocated => ipc::free_allocation(self.accelerator.as_ref(), ptr),
            Provenance::Imported(_) => ipc::close_handle(self.accelerator.as_ref(), ptr),
            Provenance::Empty => Ok(()),
        }
    }
}

impl MemoryBuffer for DeviceBuffer {
    fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    fn length(&self) -> usize {
        self.length
    }

    fn element_size(&self) -> usize {
        self.element_size
    }

    fn device_ptr(&self) -> DevicePtr {
        self.ptr
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device_id", &self.accelerator.device_id())
            .field("ptr", &self.ptr)
            .field("length", &self.length)
            .field("element_size", &self.element_size)
            .field("provenance", &self.provenance)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("failed to release device buffer: {}", e);
        }
    }
}
