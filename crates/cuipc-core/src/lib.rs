//! cuipc - Cross-process CUDA device memory sharing through IPC handles

pub mod binding;
pub mod buffer;
pub mod config;
pub mod context;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod driver;
pub mod dtype;
pub mod error;
pub mod flags;
pub mod handle;
pub mod ipc;
pub mod ipc_buffer;
pub mod rehome;
mod shm;
pub mod sim;
pub mod transfer;

pub use binding::{DriverBinding, DriverIpc};
pub use buffer::{BufferExt, DeviceBuffer, MemoryBuffer, Provenance};
pub use config::IpcConfig;
pub use context::{Accelerator, AcceleratorKind, ContextGuard, DevicePtr, Stream};
#[cfg(feature = "cuda")]
pub use cuda::CudaAccelerator;
pub use driver::{DriverCode, NativeIpc};
pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use flags::IpcMemFlags;
pub use handle::{IpcHandle, IPC_HANDLE_HEX_LEN, IPC_HANDLE_SIZE};
pub use ipc::AcceleratorIpcExt;
pub use ipc_buffer::{map_ipc, IpcBuffer, MappingState};
pub use rehome::{try_create_buffer_from_ipc_handle, ImportedRegion};
pub use sim::{ForeignAllocation, SimAccelerator};
pub use transfer::DeviceView;
