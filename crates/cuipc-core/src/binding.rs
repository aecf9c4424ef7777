//! Driver library bindings for the IPC entry points
//!
//! The driver ships under a different library name per platform. The
//! binding is picked on every call; loaded libraries are cached by path, so
//! switching configuration inside one process loads the other library
//! instead of reusing a stale choice.

use crate::config::IpcConfig;
use crate::context::DevicePtr;
use crate::driver::{DriverCode, NativeIpc};
use crate::flags::IpcMemFlags;
use crate::handle::IpcHandle;
use crate::{Error, Result};
use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

type CuIpcGetMemHandle = unsafe extern "system" fn(*mut IpcHandle, u64) -> i32;
type CuIpcOpenMemHandle = unsafe extern "system" fn(*mut u64, IpcHandle, u32) -> i32;
type CuIpcCloseMemHandle = unsafe extern "system" fn(u64) -> i32;

/// Platform binding of the driver library
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverBinding {
    Windows,
    Unix,
}

impl DriverBinding {
    /// Binding for the host operating system
    pub fn resolve() -> Self {
        if cfg!(windows) {
            DriverBinding::Windows
        } else {
            DriverBinding::Unix
        }
    }

    /// Library names tried in order
    pub const fn library_names(&self) -> &'static [&'static str] {
        match self {
            DriverBinding::Windows => &["nvcuda.dll"],
            // macOS drivers use the same name
            DriverBinding::Unix => &["libcuda.so.1", "libcuda.so"],
        }
    }
}

struct DriverSymbols {
    get_mem_handle: CuIpcGetMemHandle,
    open_mem_handle: CuIpcOpenMemHandle,
    close_mem_handle: CuIpcCloseMemHandle,
    // Keeps the function pointers above valid
    _library: Library,
}

impl DriverSymbols {
    fn load(path: &Path) -> Result<Self> {
        // Safety: loading the vendor driver runs its initializers, nothing else
        let library = unsafe { Library::new(path) }
            .map_err(|e| Error::Library(format!("{}: {}", path.display(), e)))?;

        let missing = |name: &str, e: libloading::Error| {
            Error::Library(format!("{}: missing {}: {}", path.display(), name, e))
        };

        // Safety: signatures match the driver API declarations
        let (get_mem_handle, open_mem_handle, close_mem_handle) = unsafe {
            let get = *library
                .get::<CuIpcGetMemHandle>(b"cuIpcGetMemHandle\0")
                .map_err(|e| missing("cuIpcGetMemHandle", e))?;
            let open = match library.get::<CuIpcOpenMemHandle>(b"cuIpcOpenMemHandle_v2\0") {
                Ok(sym) => *sym,
                Err(_) => *library
                    .get::<CuIpcOpenMemHandle>(b"cuIpcOpenMemHandle\0")
                    .map_err(|e| missing("cuIpcOpenMemHandle", e))?,
            };
            let close = *library
                .get::<CuIpcCloseMemHandle>(b"cuIpcCloseMemHandle\0")
                .map_err(|e| missing("cuIpcCloseMemHandle", e))?;
            (get, open, close)
        };

        Ok(Self {
            get_mem_handle,
            open_mem_handle,
            close_mem_handle,
            _library: library,
        })
    }
}

type SymbolCache = HashMap<PathBuf, Arc<DriverSymbols>>;

fn loaded() -> &'static Mutex<SymbolCache> {
    static LOADED: OnceLock<Mutex<SymbolCache>> = OnceLock::new();
    LOADED.get_or_init(|| Mutex::new(HashMap::new()))
}

fn symbols_for(candidates: &[PathBuf]) -> Result<Arc<DriverSymbols>> {
    let mut cache = loaded().lock().unwrap_or_else(PoisonError::into_inner);
    resolve_symbols(&mut cache, candidates, DriverSymbols::load)
}

fn resolve_symbols<F>(
    cache: &mut SymbolCache,
    candidates: &[PathBuf],
    load: F,
) -> Result<Arc<DriverSymbols>>
where
    F: Fn(&Path) -> Result<DriverSymbols>,
{
    // Any cached candidate wins over retrying ones that failed before it
    if let Some(symbols) = candidates.iter().find_map(|path| cache.get(path)) {
        return Ok(Arc::clone(symbols));
    }
    let mut failures = Vec::new();
    for path in candidates {
        match load(path) {
            Ok(symbols) => {
                log::debug!("loaded driver IPC entry points from {}", path.display());
                let symbols = Arc::new(symbols);
                cache.insert(path.clone(), Arc::clone(&symbols));
                return Ok(symbols);
            }
            Err(e) => failures.push(e.to_string()),
        }
    }
    Err(Error::Library(failures.join("; ")))
}

fn check(op: &'static str, code: i32) -> Result<()> {
    let code = DriverCode(code);
    log::trace!("{} -> {}", op, code);
    if code.is_success() {
        Ok(())
    } else {
        Err(Error::driver(op, code))
    }
}

/// IPC entry points of the installed CUDA driver
#[derive(Debug, Clone, Default)]
pub struct DriverIpc {
    library_override: Option<PathBuf>,
}

impl DriverIpc {
    /// Use the platform default library
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit library path
    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            library_override: Some(path.into()),
        }
    }

    /// Use the library selected by `config`
    pub fn from_config(config: &IpcConfig) -> Self {
        Self {
            library_override: config.driver_library.clone(),
        }
    }

    /// Library candidates for the current call
    pub fn candidates(&self) -> Vec<PathBuf> {
        match &self.library_override {
            Some(path) => vec![path.clone()],
            None => DriverBinding::resolve()
                .library_names()
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }

    fn symbols(&self) -> Result<Arc<DriverSymbols>> {
        symbols_for(&self.candidates())
    }
}

impl NativeIpc for DriverIpc {
    fn get_mem_handle(&self, ptr: DevicePtr) -> Result<IpcHandle> {
        let symbols = self.symbols()?;
        let mut handle = IpcHandle::default();
        // Safety: handle is a writable 64 byte CUipcMemHandle
        let code = unsafe { (symbols.get_mem_handle)(&mut handle, ptr.as_raw()) };
        check("cuIpcGetMemHandle", code)?;
        Ok(handle)
    }

    fn open_mem_handle(&self, handle: &IpcHandle, flags: IpcMemFlags) -> Result<DevicePtr> {
        let symbols = self.symbols()?;
        let mut raw: u64 = 0;
        // Safety: raw is a writable CUdeviceptr, the handle is passed by value
        let code = unsafe { (symbols.open_mem_handle)(&mut raw, *handle, flags.bits()) };
        check("cuIpcOpenMemHandle", code)?;
        Ok(DevicePtr::from_raw(raw))
    }

    fn close_mem_handle(&self, ptr: DevicePtr) -> Result<()> {
        let symbols = self.symbols()?;
        // Safety: plain value call
        let code = unsafe { (symbols.close_mem_handle)(ptr.as_raw()) };
        check("cuIpcCloseMemHandle", code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_matches_host() {
        let binding = DriverBinding::resolve();
        if cfg!(windows) {
            assert_eq!(binding, DriverBinding::Windows);
        } else {
            assert_eq!(binding, DriverBinding::Unix);
        }
        assert_eq!(DriverBinding::Windows.library_names(), &["nvcuda.dll"]);
        assert_eq!(DriverBinding::Unix.library_names()[0], "libcuda.so.1");
    }

    #[test]
    fn test_override_replaces_platform_names() {
        let ipc = DriverIpc::with_library("/opt/driver/libcuda.so");
        assert_eq!(ipc.candidates(), vec![PathBuf::from("/opt/driver/libcuda.so")]);

        let config = IpcConfig::default();
        let ipc = DriverIpc::from_config(&config);
        assert_eq!(
            ipc.candidates().len(),
            DriverBinding::resolve().library_names().len()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_cached_fallback_skips_failed_candidates() {
        use std::cell::Cell;

        unsafe extern "system" fn get(_: *mut IpcHandle, _: u64) -> i32 {
            0
        }
        unsafe extern "system" fn open(_: *mut u64, _: IpcHandle, _: u32) -> i32 {
            0
        }
        unsafe extern "system" fn close(_: u64) -> i32 {
            0
        }

        let primary = PathBuf::from("/nonexistent/cuipc/libcuda.so.1");
        let fallback = PathBuf::from("/nonexistent/cuipc/libcuda.so");
        let candidates = vec![primary.clone(), fallback.clone()];
        let attempts = Cell::new(0);
        let load = |path: &Path| {
            attempts.set(attempts.get() + 1);
            if path == primary {
                return Err(Error::Library("not found".to_string()));
            }
            Ok(DriverSymbols {
                get_mem_handle: get,
                open_mem_handle: open,
                close_mem_handle: close,
                _library: libloading::os::unix::Library::this().into(),
            })
        };

        let mut cache = SymbolCache::new();
        let first = resolve_symbols(&mut cache, &candidates, &load).unwrap();
        assert_eq!(attempts.get(), 2);
        assert!(cache.contains_key(&fallback));

        let second = resolve_symbols(&mut cache, &candidates, &load).unwrap();
        assert_eq!(attempts.get(), 2);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_missing_library_is_not_a_driver_failure() {
        let ipc = DriverIpc::with_library("/nonexistent/cuipc/libcuda.so");
        let err = ipc.close_mem_handle(DevicePtr::from_raw(0x1000)).unwrap_err();
        assert!(matches!(err, Error::Library(_)));
        assert!(err.driver_code().is_none());
    }
}
