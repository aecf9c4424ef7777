//! CUDA accelerator backed by the driver API
//!
//! Device setup goes through `cudarc`; the IPC entry points are resolved
//! separately by [`DriverIpc`] so the per-platform library choice stays in
//! one place.

use crate::binding::DriverIpc;
use crate::config::IpcConfig;
use crate::context::{Accelerator, AcceleratorKind, DevicePtr, Stream};
use crate::driver::NativeIpc;
use crate::{Error, Result};
use cudarc::driver::sys::{self, CUresult};
use cudarc::driver::CudaDevice;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

fn check(op: &'static str, result: CUresult) -> Result<()> {
    if result == CUresult::CUDA_SUCCESS {
        Ok(())
    } else {
        Err(Error::driver(op, result as i32))
    }
}

fn raw_stream(stream: Option<&Stream>) -> sys::CUstream {
    match stream {
        Some(stream) => stream.as_raw() as usize as sys::CUstream,
        None => std::ptr::null_mut(),
    }
}

/// CUDA device with its primary context
pub struct CudaAccelerator {
    device: Arc<CudaDevice>,
    device_id: i32,
    ipc: DriverIpc,
}

impl CudaAccelerator {
    /// Open device `device_id` using the platform default driver library
    pub fn new(device_id: i32) -> Result<Self> {
        Self::with_config(device_id, &IpcConfig::default())
    }

    pub fn with_config(device_id: i32, config: &IpcConfig) -> Result<Self> {
        let ordinal = usize::try_from(device_id)
            .map_err(|_| Error::Cuda(format!("invalid device id {}", device_id)))?;
        let device = CudaDevice::new(ordinal).map_err(|e| Error::Cuda(e.to_string()))?;
        log::debug!("opened CUDA device {}", device_id);
        Ok(Self {
            device,
            device_id,
            ipc: DriverIpc::from_config(config),
        })
    }

    /// Underlying cudarc device
    pub fn device(&self) -> &Arc<CudaDevice> {
        &self.device
    }
}

impl fmt::Debug for CudaAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaAccelerator")
            .field("device_id", &self.device_id)
            .field("ipc", &self.ipc)
            .finish()
    }
}

impl Accelerator for CudaAccelerator {
    fn kind(&self) -> AcceleratorKind {
        AcceleratorKind::Cuda
    }

    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn native_ipc(&self) -> Option<&dyn NativeIpc> {
        Some(&self.ipc)
    }

    fn push_context(&self) -> Result<()> {
        let ctx = *self.device.cu_primary_ctx();
        // Safety: the primary context lives as long as `device`
        check("cuCtxPushCurrent", unsafe { sys::cuCtxPushCurrent_v2(ctx) })
    }

    fn pop_context(&self) -> Result<()> {
        let mut ctx: sys::CUcontext = std::ptr::null_mut();
        // Safety: ctx is a writable out parameter
        check("cuCtxPopCurrent", unsafe { sys::cuCtxPopCurrent_v2(&mut ctx) })
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        let mut ptr: sys::CUdeviceptr = 0;
        // Safety: ptr is a writable out parameter
        check("cuMemAlloc", unsafe { sys::cuMemAlloc_v2(&mut ptr, bytes) })?;
        Ok(DevicePtr::from_raw(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        // Safety: ptr came from alloc on this context
        check("cuMemFree", unsafe { sys::cuMemFree_v2(ptr.as_raw()) })
    }

    fn memset(&self, dst: DevicePtr, value: u8, bytes: usize, stream: Option<&Stream>) -> Result<()> {
        // Safety: range validated by the caller's view
        check("cuMemsetD8Async", unsafe {
            sys::cuMemsetD8Async(dst.as_raw(), value, bytes, raw_stream(stream))
        })
    }

    fn copy_htod(&self, dst: DevicePtr, src: &[u8], stream: Option<&Stream>) -> Result<()> {
        let raw = raw_stream(stream);
        // Safety: src outlives the call because the stream is synchronized below
        check("cuMemcpyHtoDAsync", unsafe {
            sys::cuMemcpyHtoDAsync_v2(dst.as_raw(), src.as_ptr() as *const c_void, src.len(), raw)
        })?;
        // Safety: raw is null or a live stream
        check("cuStreamSynchronize", unsafe { sys::cuStreamSynchronize(raw) })
    }

    fn copy_dtoh(&self, dst: &mut [u8], src: DevicePtr, stream: Option<&Stream>) -> Result<()> {
        let raw = raw_stream(stream);
        // Safety: dst outlives the call because the stream is synchronized below
        check("cuMemcpyDtoHAsync", unsafe {
            sys::cuMemcpyDtoHAsync_v2(dst.as_mut_ptr() as *mut c_void, src.as_raw(), dst.len(), raw)
        })?;
        // Safety: raw is null or a live stream
        check("cuStreamSynchronize", unsafe { sys::cuStreamSynchronize(raw) })
    }

    fn copy_dtod(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        stream: Option<&Stream>,
    ) -> Result<()> {
        // Safety: ranges validated by the caller's views
        check("cuMemcpyDtoDAsync", unsafe {
            sys::cuMemcpyDtoDAsync_v2(dst.as_raw(), src.as_raw(), bytes, raw_stream(stream))
        })
    }

    fn create_stream(&self) -> Result<Stream> {
        let mut raw: sys::CUstream = std::ptr::null_mut();
        // Safety: raw is a writable out parameter
        check("cuStreamCreate", unsafe {
            sys::cuStreamCreate(&mut raw, sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32)
        })?;
        Ok(Stream::from_raw(raw as usize as u64, self.device_id))
    }

    fn destroy_stream(&self, stream: Stream) -> Result<()> {
        // Safety: stream was created on this context
        check("cuStreamDestroy", unsafe {
            sys::cuStreamDestroy_v2(stream.as_raw() as usize as sys::CUstream)
        })
    }

    fn synchronize_stream(&self, stream: &Stream) -> Result<()> {
        // Safety: stream was created on this context
        check("cuStreamSynchronize", unsafe {
            sys::cuStreamSynchronize(stream.as_raw() as usize as sys::CUstream)
        })
    }

    fn synchronize(&self) -> Result<()> {
        // Safety: no arguments
        check("cuCtxSynchronize", unsafe { sys::cuCtxSynchronize() })
    }
}

// Safety: driver API calls are thread-safe; every call binds the context first
unsafe impl Send for CudaAccelerator {}
unsafe impl Sync for CudaAccelerator {}
