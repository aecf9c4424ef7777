//! POSIX shared memory wrapper

use shared_memory::{Shmem, ShmemConf};

/// Shared memory segment wrapper
pub struct SharedMemory {
    inner: Shmem,
    name: String,
    size: usize,
}

// Safety: the mapping is process-wide; the wrapper only hands out raw
// pointers and never aliases Rust references across threads
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Create a new zero-filled segment; it is unlinked when this value drops
    pub fn create(name: &str, size: usize) -> Result<Self, String> {
        let shmem = ShmemConf::new()
            .size(size)
            .os_id(name)
            .create()
            .map_err(|e| e.to_string())?;

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// Map an existing segment; dropping only unmaps it
    pub fn open(name: &str) -> Result<Self, String> {
        let shmem = ShmemConf::new()
            .os_id(name)
            .open()
            .map_err(|e| e.to_string())?;

        let size = shmem.len();

        Ok(Self {
            inner: shmem,
            name: name.to_string(),
            size,
        })
    }

    /// OS name of the segment
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the segment in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw pointer to the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.as_ptr()
    }

    /// Zero the whole segment
    pub fn zero(&self) {
        // Safety: the mapping is valid for `size` bytes
        unsafe { std::ptr::write_bytes(self.as_ptr(), 0, self.size) }
    }
}
