//! Consumer - import a device buffer from another process
//!
//! Opens the handle printed by `producer`, replaces the contents with their
//! running sum and releases the mapping. The producer's allocation stays
//! alive.
//!
//! Usage:
//! ```bash
//! cargo run --example consumer -- --typestr '<i4' --length 10 --ipc-mem-handle <hex>
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use cuipc_core::{
    Accelerator, BufferExt, DType, Element, IpcBuffer, IpcConfig, IpcHandle, SimAccelerator,
};
use std::ops::AddAssign;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Sim,
    Cuda,
}

#[derive(Debug, Parser)]
#[command(about = "Import a device buffer and compute its running sum in place")]
struct Args {
    /// 128 hex characters printed by the producer
    #[arg(long)]
    ipc_mem_handle: IpcHandle,

    /// Array interface type string, e.g. `<i4` or `<f4`
    #[arg(long)]
    typestr: String,

    /// Number of elements
    #[arg(long)]
    length: usize,

    #[arg(long, default_value_t = 0)]
    device: i32,

    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,
}

fn accelerator(
    backend: Backend,
    device: i32,
    config: &IpcConfig,
) -> anyhow::Result<Arc<dyn Accelerator>> {
    match backend {
        Backend::Sim => Ok(Arc::new(SimAccelerator::new(device))),
        #[cfg(feature = "cuda")]
        Backend::Cuda => Ok(Arc::new(cuipc_core::CudaAccelerator::with_config(
            device, config,
        )?)),
        #[cfg(not(feature = "cuda"))]
        Backend::Cuda => {
            let _ = config;
            anyhow::bail!("built without the `cuda` feature")
        }
    }
}

fn running_sum<T>(buf: &IpcBuffer) -> anyhow::Result<()>
where
    T: Element + AddAssign + std::fmt::Debug,
{
    let mut values = buf.to_vec::<T>()?;
    println!("Imported {:?}", values);
    let mut total = T::default();
    for v in values.iter_mut() {
        total += *v;
        *v = total;
    }
    buf.copy_from_host(&values, None)?;
    println!("Wrote    {:?}", values);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = IpcConfig::from_env()?;

    let dtype = DType::from_typestr(&args.typestr)
        .with_context(|| format!("unsupported typestr '{}'", args.typestr))?;
    let accel = accelerator(args.backend, args.device, &config)?;
    let mut buf = IpcBuffer::open_with_flags(
        accel,
        args.ipc_mem_handle,
        args.length,
        dtype.size(),
        config.open_flags,
    )?;

    match dtype {
        DType::Int32 => running_sum::<i32>(&buf)?,
        DType::Int64 => running_sum::<i64>(&buf)?,
        DType::UInt32 => running_sum::<u32>(&buf)?,
        DType::UInt64 => running_sum::<u64>(&buf)?,
        DType::Float32 => running_sum::<f32>(&buf)?,
        DType::Float64 => running_sum::<f64>(&buf)?,
        other => anyhow::bail!("no running sum for {:?}", other),
    }

    buf.release()?;
    Ok(())
}
