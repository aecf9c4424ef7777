//! Simulated CUDA-like driver
//!
//! Device allocations are POSIX shared memory segments placed at fake
//! addresses in a process-wide device address space. An exported handle
//! carries the segment name, so opening it in another process (a `fork`ed
//! child or an unrelated program) maps the very same bytes.
//!
//! Behaviour mirrors the real driver where this crate depends on it:
//! - every native call requires the accelerator's context to be current,
//!   otherwise it fails with `CUDA_ERROR_INVALID_CONTEXT`
//! - the first export of an allocation zeroes it
//! - opening the same handle twice in one process returns the same pointer
//!   and the mapping is removed by the last close
//! - opening a handle to an allocation made by the calling process fails
//!   with [`Error::SelfImport`]; a `fork`ed child counts as another process
//!
//! [`ForeignAllocation`] holds memory outside the simulated address space,
//! the way a peer process would, so single-process code can import it.

use crate::context::{Accelerator, AcceleratorKind, DevicePtr, Stream};
use crate::driver::{DriverCode, NativeIpc};
use crate::dtype::{as_bytes, as_bytes_mut, Element};
use crate::flags::IpcMemFlags;
use crate::handle::{IpcHandle, IPC_HANDLE_SIZE};
use crate::shm::SharedMemory;
use crate::{Error, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

const HANDLE_MAGIC: &[u8; 4] = b"CSIM";
const NAME_OFFSET: usize = 5;
const MAX_NAME_LEN: usize = IPC_HANDLE_SIZE - NAME_OFFSET;

const ADDRESS_BASE: u64 = 0x7f00_0000_0000;
const ADDRESS_ALIGN: u64 = 1 << 21;

/// Attempts at finding an unused segment name
const CREATE_ATTEMPTS: usize = 8;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
static NEXT_SEGMENT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CONTEXT_STACK: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

enum RegionKind {
    Allocation { exported: bool, pid: u32 },
    Mapping { refs: u32 },
}

struct Region {
    shm: SharedMemory,
    creator: u64,
    kind: RegionKind,
}

struct SimSpace {
    next_addr: u64,
    regions: BTreeMap<u64, Region>,
    /// Segment name -> address of this process's mapping
    mappings: HashMap<String, u64>,
}

impl SimSpace {
    fn reserve(&mut self, len: usize) -> u64 {
        let addr = self.next_addr;
        let span = (len as u64).div_ceil(ADDRESS_ALIGN) * ADDRESS_ALIGN;
        self.next_addr += span + ADDRESS_ALIGN;
        addr
    }

    /// Whether the calling process allocated the segment `name`
    fn allocated_here(&self, name: &str) -> bool {
        let pid = std::process::id();
        self.regions.values().any(|region| {
            matches!(region.kind, RegionKind::Allocation { pid: owner, .. } if owner == pid)
                && region.shm.name() == name
        })
    }

    fn containing(&mut self, ptr: DevicePtr) -> Option<(u64, &mut Region)> {
        let (&base, region) = self.regions.range_mut(..=ptr.as_raw()).next_back()?;
        if ptr.as_raw() - base < region.shm.size() as u64 {
            Some((base, region))
        } else {
            None
        }
    }

    /// Host address backing `len` bytes at `ptr`
    fn locate(&mut self, op: &'static str, ptr: DevicePtr, len: usize) -> Result<*mut u8> {
        let invalid = || Error::driver(op, DriverCode::INVALID_VALUE);
        let (base, region) = self.containing(ptr).ok_or_else(invalid)?;
        let offset = (ptr.as_raw() - base) as usize;
        if offset + len > region.shm.size() {
            return Err(invalid());
        }
        // Safety: offset is inside the mapping
        Ok(unsafe { region.shm.as_ptr().add(offset) })
    }
}

fn space() -> MutexGuard<'static, SimSpace> {
    static SPACE: OnceLock<Mutex<SimSpace>> = OnceLock::new();
    SPACE
        .get_or_init(|| {
            Mutex::new(SimSpace {
                next_addr: ADDRESS_BASE,
                regions: BTreeMap::new(),
                mappings: HashMap::new(),
            })
        })
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn encode_handle(name: &str) -> Result<IpcHandle> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_NAME_LEN {
        return Err(Error::driver("cuIpcGetMemHandle", DriverCode::INVALID_VALUE));
    }
    let mut raw = [0u8; IPC_HANDLE_SIZE];
    raw[..4].copy_from_slice(HANDLE_MAGIC);
    raw[4] = bytes.len() as u8;
    raw[NAME_OFFSET..NAME_OFFSET + bytes.len()].copy_from_slice(bytes);
    Ok(IpcHandle::from_bytes(raw))
}

fn decode_handle(handle: &IpcHandle) -> Option<String> {
    let raw = handle.as_bytes();
    if &raw[..4] != HANDLE_MAGIC {
        return None;
    }
    let len = raw[4] as usize;
    if len == 0 || len > MAX_NAME_LEN {
        return None;
    }
    std::str::from_utf8(&raw[NAME_OFFSET..NAME_OFFSET + len])
        .ok()
        .map(str::to_string)
}

fn create_segment(size: usize) -> Result<SharedMemory> {
    let pid = std::process::id();
    let mut last_error = String::new();
    for _ in 0..CREATE_ATTEMPTS {
        let seq = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
        let name = format!("/cuipc_{:x}_{:x}", pid, seq);
        match SharedMemory::create(&name, size) {
            Ok(shm) => return Ok(shm),
            Err(e) => last_error = e,
        }
    }
    log::warn!("simulated allocation of {} bytes failed: {}", size, last_error);
    Err(Error::driver("cuMemAlloc", DriverCode::OUT_OF_MEMORY))
}

/// Simulated device memory owned outside this process's address space.
///
/// Stands in for an allocation exported by a peer process: its handle opens
/// like any foreign handle and its bytes stay readable from the host after
/// every importer has closed its mapping. Dropping it removes the segment;
/// mappings that are still open keep working.
pub struct ForeignAllocation {
    shm: SharedMemory,
    handle: IpcHandle,
}

impl ForeignAllocation {
    /// Zero-filled allocation of `bytes` bytes
    pub fn create(bytes: usize) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::driver("cuMemAlloc", DriverCode::INVALID_VALUE));
        }
        let shm = create_segment(bytes)?;
        let handle = encode_handle(shm.name())?;
        Ok(Self { shm, handle })
    }

    /// Zero-filled allocation holding `length` elements of `T`
    pub fn create_typed<T: Element>(length: usize) -> Result<Self> {
        let bytes = length
            .checked_mul(std::mem::size_of::<T>())
            .ok_or(Error::OutOfBounds {
                offset: 0,
                len: length,
                capacity: usize::MAX / std::mem::size_of::<T>(),
            })?;
        Self::create(bytes)
    }

    pub fn handle(&self) -> IpcHandle {
        self.handle
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.shm.size()
    }

    /// Write `data` at the front of the allocation
    pub fn write<T: Element>(&self, data: &[T]) -> Result<()> {
        let bytes = as_bytes(data);
        if bytes.len() > self.size() {
            return Err(Error::OutOfBounds {
                offset: 0,
                len: bytes.len(),
                capacity: self.size(),
            });
        }
        let _space = space();
        // Safety: length checked against the segment
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.shm.as_ptr(), bytes.len()) };
        Ok(())
    }

    /// Read the whole allocation as elements of `T`
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        let mut out = vec![T::default(); self.size() / std::mem::size_of::<T>()];
        let bytes = as_bytes_mut(&mut out);
        let _space = space();
        // Safety: `out` covers at most `size` bytes
        unsafe { std::ptr::copy_nonoverlapping(self.shm.as_ptr(), bytes.as_mut_ptr(), bytes.len()) };
        out
    }
}

impl fmt::Debug for ForeignAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignAllocation")
            .field("name", &self.shm.name())
            .field("size", &self.size())
            .finish()
    }
}

/// Native calls made through one simulated accelerator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeCalls {
    pub export: usize,
    pub open: usize,
    pub close: usize,
    pub alloc: usize,
    pub free: usize,
}

#[derive(Default)]
struct Counters {
    export: AtomicUsize,
    open: AtomicUsize,
    close: AtomicUsize,
    alloc: AtomicUsize,
    free: AtomicUsize,
    binds: AtomicUsize,
}

/// Accelerator driving the simulated device
pub struct SimAccelerator {
    context: u64,
    device_id: i32,
    kind: AcceleratorKind,
    counters: Counters,
    next_stream: AtomicU64,
}

impl SimAccelerator {
    /// Simulated CUDA device
    pub fn new(device_id: i32) -> Self {
        Self::with_kind(device_id, AcceleratorKind::Cuda)
    }

    /// Simulated device reporting another accelerator family
    pub fn with_kind(device_id: i32, kind: AcceleratorKind) -> Self {
        Self {
            context: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            device_id,
            kind,
            counters: Counters::default(),
            next_stream: AtomicU64::new(1),
        }
    }

    /// Whether this accelerator's context is current on the calling thread
    pub fn is_current(&self) -> bool {
        CONTEXT_STACK.with(|stack| stack.borrow().last() == Some(&self.context))
    }

    /// Number of context binds performed so far
    pub fn bind_count(&self) -> usize {
        self.counters.binds.load(Ordering::SeqCst)
    }

    pub fn native_calls(&self) -> NativeCalls {
        NativeCalls {
            export: self.counters.export.load(Ordering::SeqCst),
            open: self.counters.open.load(Ordering::SeqCst),
            close: self.counters.close.load(Ordering::SeqCst),
            alloc: self.counters.alloc.load(Ordering::SeqCst),
            free: self.counters.free.load(Ordering::SeqCst),
        }
    }

    /// Allocations and mappings created through this accelerator that are still live
    pub fn live_regions(&self) -> usize {
        space()
            .regions
            .values()
            .filter(|region| region.creator == self.context)
            .count()
    }

    fn ensure_current(&self, op: &'static str) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::driver(op, DriverCode::INVALID_CONTEXT))
        }
    }
}

impl fmt::Debug for SimAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimAccelerator")
            .field("context", &self.context)
            .field("device_id", &self.device_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl NativeIpc for SimAccelerator {
    fn get_mem_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        const OP: &str = "cuIpcGetMemHandle";
        self.counters.export.fetch_add(1, Ordering::SeqCst);
        self.ensure_current(OP)?;

        let mut space = space();
        let (_, region) = space
            .containing(ptr)
            .ok_or_else(|| Error::driver(OP, DriverCode::INVALID_VALUE))?;
        match &mut region.kind {
            RegionKind::Allocation { exported, .. } => {
                if !*exported {
                    region.shm.zero();
                    *exported = true;
                }
            }
            RegionKind::Mapping { .. } => return Err(Error::driver(OP, DriverCode::INVALID_VALUE)),
        }
        encode_handle(region.shm.name())
    }

    fn open_mem_handle(&self, handle: &IpcHandle, _flags: IpcMemFlags) -> Result<DevicePtr> {
        const OP: &str = "cuIpcOpenMemHandle";
        self.counters.open.fetch_add(1, Ordering::SeqCst);
        self.ensure_current(OP)?;

        let name = decode_handle(handle).ok_or_else(|| Error::driver(OP, DriverCode::INVALID_VALUE))?;
        let mut space = space();
        if space.allocated_here(&name) {
            return Err(Error::SelfImport);
        }
        let existing = space.mappings.get(&name).copied();
        if let Some(addr) = existing {
            if let Some(Region {
                kind: RegionKind::Mapping { refs },
                ..
            }) = space.regions.get_mut(&addr)
            {
                *refs += 1;
            }
            return Ok(DevicePtr::from_raw(addr));
        }

        let shm = SharedMemory::open(&name).map_err(|e| {
            log::debug!("simulated open of {} failed: {}", name, e);
            Error::driver(OP, DriverCode::MAP_FAILED)
        })?;
        let addr = space.reserve(shm.size());
        space.regions.insert(
            addr,
            Region {
                shm,
                creator: self.context,
                kind: RegionKind::Mapping { refs: 1 },
            },
        );
        space.mappings.insert(name, addr);
        Ok(DevicePtr::from_raw(addr))
    }

    fn close_mem_handle(&self, ptr: DevicePtr) -> Result<()> {
        const OP: &str = "cuIpcCloseMemHandle";
        self.counters.close.fetch_add(1, Ordering::SeqCst);
        self.ensure_current(OP)?;

        let mut space = space();
        let remaining = match space.regions.get_mut(&ptr.as_raw()) {
            Some(Region {
                kind: RegionKind::Mapping { refs },
                ..
            }) => {
                *refs -= 1;
                *refs
            }
            _ => return Err(Error::driver(OP, DriverCode::INVALID_VALUE)),
        };
        if remaining == 0 {
            let removed = space.regions.remove(&ptr.as_raw());
            if let Some(region) = removed {
                space.mappings.remove(region.shm.name());
            }
        }
        Ok(())
    }
}

impl Accelerator for SimAccelerator {
    fn kind(&self) -> AcceleratorKind {
        self.kind
    }

    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn native_ipc(&self) -> Option<&dyn NativeIpc> {
        if self.kind.supports_ipc() {
            Some(self)
        } else {
            None
        }
    }

    fn push_context(&self) -> Result<()> {
        self.counters.binds.fetch_add(1, Ordering::SeqCst);
        CONTEXT_STACK.with(|stack| stack.borrow_mut().push(self.context));
        Ok(())
    }

    fn pop_context(&self) -> Result<()> {
        let popped = CONTEXT_STACK.with(|stack| stack.borrow_mut().pop());
        if popped == Some(self.context) {
            Ok(())
        } else {
            Err(Error::driver("cuCtxPopCurrent", DriverCode::INVALID_CONTEXT))
        }
    }

    fn alloc(&self, bytes: usize) -> Result<DevicePtr> {
        const OP: &str = "cuMemAlloc";
        self.counters.alloc.fetch_add(1, Ordering::SeqCst);
        self.ensure_current(OP)?;
        if bytes == 0 {
            return Err(Error::driver(OP, DriverCode::INVALID_VALUE));
        }

        let shm = create_segment(bytes)?;
        let mut space = space();
        let addr = space.reserve(bytes);
        space.regions.insert(
            addr,
            Region {
                shm,
                creator: self.context,
                kind: RegionKind::Allocation {
                    exported: false,
                    pid: std::process::id(),
                },
            },
        );
        Ok(DevicePtr::from_raw(addr))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        const OP: &str = "cuMemFree";
        self.counters.free.fetch_add(1, Ordering::SeqCst);
        self.ensure_current(OP)?;

        let mut space = space();
        let is_allocation = matches!(
            space.regions.get(&ptr.as_raw()),
            Some(Region {
                kind: RegionKind::Allocation { .. },
                ..
            })
        );
        if !is_allocation {
            return Err(Error::driver(OP, DriverCode::INVALID_VALUE));
        }
        space.regions.remove(&ptr.as_raw());
        Ok(())
    }

    fn memset(&self, dst: DevicePtr, value: u8, bytes: usize, _stream: Option<&Stream>) -> Result<()> {
        const OP: &str = "cuMemsetD8Async";
        self.ensure_current(OP)?;
        let mut space = space();
        let target = space.locate(OP, dst, bytes)?;
        // Safety: locate checked the range
        unsafe { std::ptr::write_bytes(target, value, bytes) };
        Ok(())
    }

    fn copy_htod(&self, dst: DevicePtr, src: &[u8], _stream: Option<&Stream>) -> Result<()> {
        const OP: &str = "cuMemcpyHtoDAsync";
        self.ensure_current(OP)?;
        let mut space = space();
        let target = space.locate(OP, dst, src.len())?;
        // Safety: locate checked the range; host and device memory never overlap
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), target, src.len()) };
        Ok(())
    }

    fn copy_dtoh(&self, dst: &mut [u8], src: DevicePtr, _stream: Option<&Stream>) -> Result<()> {
        const OP: &str = "cuMemcpyDtoHAsync";
        self.ensure_current(OP)?;
        let mut space = space();
        let source = space.locate(OP, src, dst.len())?;
        // Safety: locate checked the range
        unsafe { std::ptr::copy_nonoverlapping(source, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    fn copy_dtod(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        bytes: usize,
        _stream: Option<&Stream>,
    ) -> Result<()> {
        const OP: &str = "cuMemcpyDtoDAsync";
        self.ensure_current(OP)?;
        let mut space = space();
        let source = space.locate(OP, src, bytes)?;
        let target = space.locate(OP, dst, bytes)?;
        // Safety: both ranges checked; two mappings of one segment may overlap
        unsafe { std::ptr::copy(source, target, bytes) };
        Ok(())
    }

    fn create_stream(&self) -> Result<Stream> {
        self.ensure_current("cuStreamCreate")?;
        let raw = self.next_stream.fetch_add(1, Ordering::Relaxed);
        Ok(Stream::from_raw(raw, self.device_id))
    }

    fn destroy_stream(&self, _stream: Stream) -> Result<()> {
        self.ensure_current("cuStreamDestroy")
    }

    fn synchronize_stream(&self, _stream: &Stream) -> Result<()> {
        self.ensure_current("cuStreamSynchronize")
    }

    fn synchronize(&self) -> Result<()> {
        self.ensure_current("cuCtxSynchronize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextGuard;

    #[test]
    fn test_calls_require_bound_context() {
        let sim = SimAccelerator::new(0);
        let err = sim.alloc(16).unwrap_err();
        assert_eq!(err.driver_code(), Some(DriverCode::INVALID_CONTEXT));
    }

    #[test]
    fn test_nested_binds_restore_previous_context() {
        let a = SimAccelerator::new(0);
        let b = SimAccelerator::new(1);
        let outer = ContextGuard::bind(&a).unwrap();
        assert!(a.is_current());
        {
            let _inner = ContextGuard::bind(&b).unwrap();
            assert!(b.is_current());
            assert!(!a.is_current());
        }
        assert!(a.is_current());
        drop(outer);
        assert!(!a.is_current());
    }

    #[test]
    fn test_binding_is_per_thread() {
        let sim = std::sync::Arc::new(SimAccelerator::new(0));
        let _bound = ContextGuard::bind(sim.as_ref()).unwrap();
        let other = std::sync::Arc::clone(&sim);
        let bound_elsewhere = std::thread::spawn(move || other.is_current())
            .join()
            .unwrap();
        assert!(!bound_elsewhere);
        assert!(sim.is_current());
    }

    #[test]
    fn test_first_export_zeroes_allocation() {
        let sim = SimAccelerator::new(0);
        let _bound = ContextGuard::bind(&sim).unwrap();
        let ptr = sim.alloc(4).unwrap();
        sim.memset(ptr, 7, 4, None).unwrap();
        let handle = sim.get_mem_handle(ptr).unwrap();

        let mut out = [1u8; 4];
        sim.copy_dtoh(&mut out, ptr, None).unwrap();
        assert_eq!(out, [0; 4]);

        sim.memset(ptr, 9, 4, None).unwrap();
        assert_eq!(sim.get_mem_handle(ptr).unwrap(), handle);
        sim.copy_dtoh(&mut out, ptr, None).unwrap();
        assert_eq!(out, [9; 4]);
        sim.free(ptr).unwrap();
    }

    #[test]
    fn test_handle_encoding() {
        let handle = encode_handle("/cuipc_1_2").unwrap();
        assert_eq!(decode_handle(&handle).as_deref(), Some("/cuipc_1_2"));
        assert_eq!(decode_handle(&IpcHandle::default()), None);
        assert!(encode_handle(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_last_close_unmaps() {
        let foreign = ForeignAllocation::create(8).unwrap();
        let importer = SimAccelerator::new(0);
        let handle = foreign.handle();

        let _bound = ContextGuard::bind(&importer).unwrap();
        let first = importer.open_mem_handle(&handle, IpcMemFlags::default()).unwrap();
        let second = importer.open_mem_handle(&handle, IpcMemFlags::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(importer.live_regions(), 1);

        importer.close_mem_handle(first).unwrap();
        assert_eq!(importer.live_regions(), 1);
        importer.close_mem_handle(second).unwrap();
        assert_eq!(importer.live_regions(), 0);
        assert!(importer.close_mem_handle(second).is_err());
    }

    #[test]
    fn test_own_allocation_handle_is_refused() {
        let owner = SimAccelerator::new(0);
        let other = SimAccelerator::new(1);
        let (ptr, handle) = {
            let _bound = ContextGuard::bind(&owner).unwrap();
            let ptr = owner.alloc(4).unwrap();
            (ptr, owner.get_mem_handle(ptr).unwrap())
        };

        {
            let _bound = ContextGuard::bind(&other).unwrap();
            let err = other.open_mem_handle(&handle, IpcMemFlags::default()).unwrap_err();
            assert!(matches!(err, Error::SelfImport));
        }
        assert_eq!(other.live_regions(), 0);

        let _bound = ContextGuard::bind(&owner).unwrap();
        owner.free(ptr).unwrap();
    }

    #[test]
    fn test_foreign_allocation_shares_bytes_with_mapping() {
        let foreign = ForeignAllocation::create_typed::<u32>(3).unwrap();
        foreign.write(&[7u32, 8, 9]).unwrap();
        assert_eq!(foreign.size(), 12);

        let importer = SimAccelerator::new(0);
        let _bound = ContextGuard::bind(&importer).unwrap();
        let mapped = importer
            .open_mem_handle(&foreign.handle(), IpcMemFlags::default())
            .unwrap();
        let mut out = [0u8; 4];
        importer.copy_dtoh(&mut out, mapped, None).unwrap();
        assert_eq!(u32::from_ne_bytes(out), 7);

        importer.memset(mapped, 0, 4, None).unwrap();
        assert_eq!(foreign.to_vec::<u32>(), vec![0, 8, 9]);
        importer.close_mem_handle(mapped).unwrap();
        assert!(foreign.write(&[0u8; 13]).is_err());
    }

    #[test]
    fn test_opening_missing_segment_fails_to_map() {
        let sim = SimAccelerator::new(0);
        let _bound = ContextGuard::bind(&sim).unwrap();
        let handle = encode_handle("/cuipc_missing_segment").unwrap();
        let err = sim.open_mem_handle(&handle, IpcMemFlags::empty()).unwrap_err();
        assert_eq!(err.driver_code(), Some(DriverCode::MAP_FAILED));
    }
}
