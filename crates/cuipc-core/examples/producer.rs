//! Producer - allocate device memory and share it through an IPC handle
//!
//! Allocates an `int32` buffer, exports it, fills it with `0..n` and prints
//! the arguments for `consumer`. Press Enter once the consumer is done to
//! read the buffer back.
//!
//! Usage:
//! ```bash
//! cargo run --example producer -- --length 10
//! ```

use anyhow::Context;
use clap::{Parser, ValueEnum};
use cuipc_core::{ipc, Accelerator, BufferExt, DeviceBuffer, Element, SimAccelerator};
use std::io::BufRead;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    Sim,
    Cuda,
}

#[derive(Debug, Parser)]
#[command(about = "Export a device buffer for another process")]
struct Args {
    /// Number of int32 elements
    #[arg(long, default_value_t = 10)]
    length: usize,

    #[arg(long, default_value_t = 0)]
    device: i32,

    #[arg(long, value_enum, default_value_t = Backend::Sim)]
    backend: Backend,
}

fn accelerator(backend: Backend, device: i32) -> anyhow::Result<Arc<dyn Accelerator>> {
    match backend {
        Backend::Sim => Ok(Arc::new(SimAccelerator::new(device))),
        #[cfg(feature = "cuda")]
        Backend::Cuda => Ok(Arc::new(cuipc_core::CudaAccelerator::new(device)?)),
        #[cfg(not(feature = "cuda"))]
        Backend::Cuda => anyhow::bail!("built without the `cuda` feature"),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let accel = accelerator(args.backend, args.device)?;
    let buf = DeviceBuffer::allocate_typed::<i32>(accel, args.length)?;

    // Export first: the driver may zero the allocation on first export
    let handle = ipc::export_buffer_handle(&buf)?;
    let data: Vec<i32> = (0..args.length as i32).collect();
    buf.copy_from_host(&data, None)?;
    println!("Wrote {:?}", data);

    println!("\nRun the consumer with:");
    println!(
        "  cargo run --example consumer -- --backend {} --device {} --typestr '{}' --length {} --ipc-mem-handle {}",
        match args.backend {
            Backend::Sim => "sim",
            Backend::Cuda => "cuda",
        },
        args.device,
        i32::DTYPE.typestr(),
        args.length,
        handle
    );
    println!("\nPress Enter when the consumer has finished...");

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading stdin")?;

    println!("Buffer now holds {:?}", buf.to_vec::<i32>()?);
    Ok(())
}
