//! Accelerator-checked memset and copy primitives
//!
//! Each primitive validates the accelerator families involved before any
//! native call, then keeps the executing accelerator bound for the call.

use crate::context::{Accelerator, AcceleratorKind, ContextGuard, DevicePtr, Stream};
use crate::{Error, Result};

/// Byte range of device memory owned by some accelerator
#[derive(Clone, Copy)]
pub struct DeviceView<'a> {
    accelerator: &'a dyn Accelerator,
    ptr: DevicePtr,
    len_bytes: usize,
}

impl<'a> DeviceView<'a> {
    pub fn new(accelerator: &'a dyn Accelerator, ptr: DevicePtr, len_bytes: usize) -> Self {
        Self {
            accelerator,
            ptr,
            len_bytes,
        }
    }

    pub fn accelerator(&self) -> &'a dyn Accelerator {
        self.accelerator
    }

    pub fn kind(&self) -> AcceleratorKind {
        self.accelerator.kind()
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    /// Narrow to `len` bytes starting `offset` bytes in
    pub fn subview(&self, offset: usize, len: usize) -> Result<DeviceView<'a>> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len_bytes => Ok(Self {
                accelerator: self.accelerator,
                ptr: self.ptr.offset(offset),
                len_bytes: len,
            }),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity: self.len_bytes,
            }),
        }
    }
}

impl std::fmt::Debug for DeviceView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceView")
            .field("kind", &self.kind())
            .field("device_id", &self.accelerator.device_id())
            .field("ptr", &self.ptr)
            .field("len_bytes", &self.len_bytes)
            .finish()
    }
}

fn unsupported() -> Error {
    Error::UnsupportedTarget("target accelerator not supported".to_string())
}

fn require_cuda(view: &DeviceView<'_>) -> Result<()> {
    if view.kind() == AcceleratorKind::Cuda {
        Ok(())
    } else {
        Err(unsupported())
    }
}

/// Fill `target` with `value`
pub fn memset(stream: Option<&Stream>, value: u8, target: &DeviceView<'_>) -> Result<()> {
    require_cuda(target)?;
    if target.is_empty() {
        return Ok(());
    }
    let accelerator = target.accelerator();
    let _bound = ContextGuard::bind(accelerator)?;
    accelerator.memset(target.ptr(), value, target.len_bytes(), stream)
}

/// Copy between two device views of equal length.
///
/// Runs on the target's accelerator when it is a CUDA device, otherwise on
/// the source's.
pub fn copy(stream: Option<&Stream>, source: &DeviceView<'_>, target: &DeviceView<'_>) -> Result<()> {
    if source.kind() == AcceleratorKind::OpenCl || target.kind() == AcceleratorKind::OpenCl {
        return Err(unsupported());
    }
    if source.len_bytes() != target.len_bytes() {
        return Err(Error::LengthMismatch {
            expected: target.len_bytes(),
            actual: source.len_bytes(),
        });
    }
    let executor = if target.kind() == AcceleratorKind::Cuda {
        target.accelerator()
    } else if source.kind() == AcceleratorKind::Cuda {
        source.accelerator()
    } else {
        return Err(unsupported());
    };
    if target.is_empty() {
        return Ok(());
    }
    let _bound = ContextGuard::bind(executor)?;
    executor.copy_dtod(target.ptr(), source.ptr(), target.len_bytes(), stream)
}

/// Copy host bytes into the front of `target`
pub fn copy_from_host(stream: Option<&Stream>, source: &[u8], target: &DeviceView<'_>) -> Result<()> {
    require_cuda(target)?;
    let target = target.subview(0, source.len())?;
    if target.is_empty() {
        return Ok(());
    }
    let accelerator = target.accelerator();
    let _bound = ContextGuard::bind(accelerator)?;
    accelerator.copy_htod(target.ptr(), source, stream)
}

/// Copy the front of `source` into host bytes
pub fn copy_to_host(stream: Option<&Stream>, source: &DeviceView<'_>, target: &mut [u8]) -> Result<()> {
    require_cuda(source)?;
    let source = source.subview(0, target.len())?;
    if source.is_empty() {
        return Ok(());
    }
    let accelerator = source.accelerator();
    let _bound = ContextGuard::bind(accelerator)?;
    accelerator.copy_dtoh(target, source.ptr(), stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimAccelerator;

    fn alloc(sim: &SimAccelerator, bytes: usize) -> DevicePtr {
        let _bound = ContextGuard::bind(sim).unwrap();
        sim.alloc(bytes).unwrap()
    }

    fn free(sim: &SimAccelerator, ptr: DevicePtr) {
        let _bound = ContextGuard::bind(sim).unwrap();
        sim.free(ptr).unwrap();
    }

    #[test]
    fn test_memset_and_host_copies() {
        let sim = SimAccelerator::new(0);
        let ptr = alloc(&sim, 16);
        let view = DeviceView::new(&sim, ptr, 16);

        memset(None, 0xab, &view).unwrap();
        let mut out = [0u8; 16];
        copy_to_host(None, &view, &mut out).unwrap();
        assert_eq!(out, [0xab; 16]);

        copy_from_host(None, &[1, 2, 3], &view).unwrap();
        let mut head = [0u8; 4];
        copy_to_host(None, &view, &mut head).unwrap();
        assert_eq!(head, [1, 2, 3, 0xab]);

        free(&sim, ptr);
    }

    #[test]
    fn test_device_copy_between_accelerators() {
        let a = SimAccelerator::new(0);
        let b = SimAccelerator::new(1);
        let src = alloc(&a, 8);
        let dst = alloc(&b, 8);
        let src_view = DeviceView::new(&a, src, 8);
        let dst_view = DeviceView::new(&b, dst, 8);

        copy_from_host(None, &[9u8; 8], &src_view).unwrap();
        copy(None, &src_view, &dst_view).unwrap();
        let mut out = [0u8; 8];
        copy_to_host(None, &dst_view, &mut out).unwrap();
        assert_eq!(out, [9u8; 8]);

        free(&a, src);
        free(&b, dst);
    }

    #[test]
    fn test_opencl_views_fail_fast() {
        let cuda = SimAccelerator::new(0);
        let opencl = SimAccelerator::with_kind(0, AcceleratorKind::OpenCl);
        let ptr = alloc(&cuda, 8);
        let cuda_view = DeviceView::new(&cuda, ptr, 8);
        let foreign = DeviceView::new(&opencl, DevicePtr::from_raw(0x1000), 8);

        assert!(matches!(
            copy(None, &cuda_view, &foreign),
            Err(Error::UnsupportedTarget(_))
        ));
        assert!(matches!(
            copy(None, &foreign, &cuda_view),
            Err(Error::UnsupportedTarget(_))
        ));
        assert!(matches!(
            memset(None, 0, &foreign),
            Err(Error::UnsupportedTarget(_))
        ));
        assert_eq!(opencl.bind_count(), 0);
        free(&cuda, ptr);
    }

    #[test]
    fn test_length_checks() {
        let sim = SimAccelerator::new(0);
        let ptr = alloc(&sim, 8);
        let view = DeviceView::new(&sim, ptr, 8);

        assert!(matches!(
            copy_from_host(None, &[0u8; 9], &view),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(matches!(
            copy(None, &view.subview(0, 4).unwrap(), &view),
            Err(Error::LengthMismatch { expected: 8, actual: 4 })
        ));
        assert!(view.subview(6, 4).is_err());
        assert_eq!(view.subview(4, 4).unwrap().ptr(), ptr.offset(4));
        free(&sim, ptr);
    }

    #[test]
    fn test_empty_transfers_skip_binding() {
        let sim = SimAccelerator::new(0);
        let empty = DeviceView::new(&sim, DevicePtr::NULL, 0);
        memset(None, 1, &empty).unwrap();
        copy_from_host(None, &[], &empty).unwrap();
        copy_to_host(None, &empty, &mut []).unwrap();
        assert_eq!(sim.bind_count(), 0);
    }
}
