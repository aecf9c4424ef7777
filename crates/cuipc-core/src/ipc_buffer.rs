//! Device buffer backed by an imported IPC handle
//!
//! The buffer owns this process's mapping of a foreign allocation, never the
//! allocation itself. Releasing it closes the mapping; the exporting process
//! keeps its memory.

use crate::buffer::{byte_len, MemoryBuffer};
use crate::context::{Accelerator, DevicePtr};
use crate::dtype::Element;
use crate::flags::IpcMemFlags;
use crate::handle::IpcHandle;
use crate::{ipc, Result};
use std::fmt;
use std::sync::Arc;

/// Lifecycle of an imported mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// Zero-length buffer, nothing was mapped
    Unmapped,
    Active(DevicePtr),
    Released,
}

/// Buffer whose device pointer was obtained by opening an IPC handle
pub struct IpcBuffer {
    accelerator: Arc<dyn Accelerator>,
    handle: IpcHandle,
    length: usize,
    element_size: usize,
    state: MappingState,
}

impl IpcBuffer {
    /// Open `handle` with lazy peer access
    pub fn open(
        accelerator: Arc<dyn Accelerator>,
        handle: IpcHandle,
        length: usize,
        element_size: usize,
    ) -> Result<Self> {
        Self::open_with_flags(accelerator, handle, length, element_size, IpcMemFlags::default())
    }

    /// Open `handle` as `length` elements of `T`
    pub fn open_typed<T: Element>(
        accelerator: Arc<dyn Accelerator>,
        handle: IpcHandle,
        length: usize,
    ) -> Result<Self> {
        Self::open(accelerator, handle, length, std::mem::size_of::<T>())
    }

    pub fn open_with_flags(
        accelerator: Arc<dyn Accelerator>,
        handle: IpcHandle,
        length: usize,
        element_size: usize,
        flags: IpcMemFlags,
    ) -> Result<Self> {
        let state = if byte_len(length, element_size)? == 0 {
            MappingState::Unmapped
        } else {
            MappingState::Active(ipc::open_handle(accelerator.as_ref(), &handle, flags)?)
        };
        Ok(Self {
            accelerator,
            handle,
            length,
            element_size,
            state,
        })
    }

    /// Handle this buffer was opened from
    pub fn handle(&self) -> &IpcHandle {
        &self.handle
    }

    pub fn state(&self) -> MappingState {
        self.state
    }

    /// Close the mapping.
    ///
    /// The first call on an active mapping always attempts the close and
    /// reports its failure; the buffer is released either way. Later calls
    /// return `Ok(())`.
    pub fn release(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, MappingState::Released) {
            MappingState::Active(ptr) => ipc::close_handle(self.accelerator.as_ref(), ptr),
            MappingState::Unmapped | MappingState::Released => Ok(()),
        }
    }
}

impl MemoryBuffer for IpcBuffer {
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
        match self.state {
            MappingState::Active(ptr) => ptr,
            MappingState::Unmapped | MappingState::Released => DevicePtr::NULL,
        }
    }

    fn is_released(&self) -> bool {
        self.state == MappingState::Released
    }
}

impl fmt::Debug for IpcBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcBuffer")
            .field("device_id", &self.accelerator.device_id())
            .field("handle", &self.handle)
            .field("length", &self.length)
            .field("element_size", &self.element_size)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for IpcBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("failed to close IPC mapping: {}", e);
        }
    }
}

/// Open `handle` on `accelerator` as an [`IpcBuffer`]
pub fn map_ipc(
    accelerator: &Arc<dyn Accelerator>,
    handle: IpcHandle,
    length: usize,
    element_size: usize,
) -> Result<IpcBuffer> {
    IpcBuffer::open(Arc::clone(accelerator), handle, length, element_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferExt, DeviceBuffer};
    use crate::driver::NativeIpc;
    use crate::sim::{ForeignAllocation, SimAccelerator};
    use crate::Error;

    #[test]
    fn test_zero_length_never_opens() {
        let sim = Arc::new(SimAccelerator::new(0));
        let mut buf = IpcBuffer::open(sim.clone(), IpcHandle::default(), 0, 4).unwrap();
        assert_eq!(buf.state(), MappingState::Unmapped);
        assert!(buf.device_ptr().is_null());
        buf.release().unwrap();
        assert_eq!(buf.state(), MappingState::Released);
        assert_eq!(sim.native_calls().open, 0);
        assert_eq!(sim.native_calls().close, 0);
    }

    #[test]
    fn test_imported_view_sees_exporter_data() {
        let importer = Arc::new(SimAccelerator::new(0));
        let foreign = ForeignAllocation::create_typed::<f32>(100).unwrap();
        let values: Vec<f32> = (1..=100).map(|v| v as f32).collect();
        foreign.write(&values).unwrap();

        let imported = IpcBuffer::open_typed::<f32>(importer, foreign.handle(), 100).unwrap();
        let mut head = [0f32; 5];
        imported.copy_to_host(&mut head, None).unwrap();
        assert_eq!(head, [1.0, 2.0, 3.0, 4.0, 5.0]);

        imported.copy_from_host(&[42.0f32], None).unwrap();
        assert_eq!(foreign.to_vec::<f32>()[0], 42.0);
    }

    #[test]
    fn test_double_release_is_noop() {
        let importer = Arc::new(SimAccelerator::new(0));
        let foreign = ForeignAllocation::create_typed::<f32>(8).unwrap();

        let mut buf = IpcBuffer::open(importer.clone(), foreign.handle(), 8, 4).unwrap();
        assert!(matches!(buf.state(), MappingState::Active(_)));
        buf.release().unwrap();
        buf.release().unwrap();
        assert_eq!(buf.state(), MappingState::Released);
        assert!(buf.device_ptr().is_null());
        assert_eq!(importer.native_calls().close, 1);
        assert!(matches!(buf.to_vec::<f32>(), Err(Error::Released)));

        drop(buf);
        assert_eq!(importer.native_calls().close, 1);
    }

    #[test]
    fn test_release_leaves_original_intact() {
        let importer: Arc<dyn Accelerator> = Arc::new(SimAccelerator::new(0));
        let foreign = ForeignAllocation::create_typed::<f32>(4).unwrap();
        foreign.write(&[7.0f32, 8.0, 9.0, 10.0]).unwrap();

        let mut imported = map_ipc(&importer, foreign.handle(), 4, 4).unwrap();
        imported.release().unwrap();
        assert_eq!(foreign.to_vec::<f32>(), vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn test_mappings_are_reference_counted() {
        let importer = Arc::new(SimAccelerator::new(0));
        let foreign = ForeignAllocation::create_typed::<f32>(2).unwrap();

        let mut first = IpcBuffer::open(importer.clone(), foreign.handle(), 2, 4).unwrap();
        let second = IpcBuffer::open(importer.clone(), foreign.handle(), 2, 4).unwrap();
        assert_eq!(first.device_ptr(), second.device_ptr());

        first.release().unwrap();
        second.copy_from_host(&[3.5f32, 4.5], None).unwrap();
        assert_eq!(second.to_vec::<f32>().unwrap(), vec![3.5, 4.5]);
    }

    #[test]
    fn test_own_native_handle_is_refused() {
        let owner = Arc::new(SimAccelerator::new(0));
        let other = Arc::new(SimAccelerator::new(1));
        let original = DeviceBuffer::allocate(owner.clone(), 4, 1).unwrap();
        // Bypasses the export registry; the driver still knows the allocation
        let handle = {
            let _bound = crate::ContextGuard::bind(owner.as_ref()).unwrap();
            owner.get_mem_handle(original.device_ptr()).unwrap()
        };

        assert!(matches!(
            IpcBuffer::open(other.clone(), handle, 4, 1),
            Err(Error::SelfImport)
        ));
        assert_eq!(other.live_regions(), 0);
    }

    #[test]
    fn test_failed_open_returns_driver_error() {
        let sim = Arc::new(SimAccelerator::new(0));
        let err = IpcBuffer::open(sim, IpcHandle::default(), 4, 4).unwrap_err();
        assert!(err.driver_code().is_some());
    }
}
