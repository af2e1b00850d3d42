//! Kiln - Compute Device Lifecycle and Dispatch
//!
//! A lifecycle-management layer over an OpenCL-class compute API: platform
//! and device discovery, contexts, program compilation with per-device build
//! diagnostics, kernel argument binding, buffer transfers, in-order and
//! out-of-order command queues, and event-based completion and profiling.
//!
//! The platform itself sits behind the [`driver::Driver`] trait. The
//! built-in [`driver::host::HostDriver`] executes registered native
//! work-item functions on host threads, so the full lifecycle runs without
//! any vendor runtime installed.
//!
//! # Quick Start
//!
//! ```
//! use kiln::prelude::*;
//! use kiln::driver::host::{HostDriver, WorkItem};
//! use std::sync::Arc;
//!
//! // A driver with one native kernel payload registered.
//! let driver = Arc::new(HostDriver::new());
//! driver.register_kernel("double", |item: &mut WorkItem<'_>| {
//!     let i = item.global_id(0);
//!     let v: u32 = item.read_elem(0, i)?;
//!     item.write_elem(1, i, v * 2)
//! });
//!
//! // Discovery, context, queue, program, kernel.
//! let registry = Registry::with_driver(driver).unwrap();
//! let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
//! let device = ctx.devices().unwrap()[0];
//! let queue = Queue::create(&ctx, device, QueueProps::default()).unwrap();
//! let program = Program::from_source(
//!     &ctx,
//!     "__kernel void double(__global const uint *in, __global uint *out) {}",
//!     None,
//! )
//! .unwrap();
//! let mut kernel = Kernel::create(&program, "double").unwrap();
//!
//! // Buffers, dispatch, read back.
//! let input: Vec<u32> = (0..64).collect();
//! let in_buf = Buffer::create(
//!     &ctx,
//!     input.len() * 4,
//!     Some(bytemuck::cast_slice(&input)),
//!     MemFlags::read_only(),
//! )
//! .unwrap();
//! let out_buf = Buffer::create(&ctx, input.len() * 4, None, MemFlags::write_only()).unwrap();
//! kernel.set_arg_buffer(0, &in_buf).unwrap();
//! kernel.set_arg_buffer(1, &out_buf).unwrap();
//! kernel.run(&queue, &[input.len()], None, None, &[]).unwrap().wait().unwrap();
//!
//! let mut out = vec![0u8; input.len() * 4];
//! out_buf.read(&queue, 0, &mut out, &[]).unwrap();
//! assert_eq!(bytemuck::cast_slice::<u8, u32>(&out)[10], 20);
//! ```
//!
//! # Features
//!
//! - **Move-only ownership**: every acquired handle is released exactly once,
//!   on `release()` or drop, whichever comes first
//! - **Failure policy**: driver errors abort by default (after a diagnostic),
//!   or propagate as `Result` when configured; discovery misses always stay
//!   non-fatal
//! - **Build diagnostics**: failed compiles dump every device's build log to
//!   a pluggable sink
//! - **Profiling**: queued/submitted/start/end timestamps per operation on
//!   profiling-enabled queues

#![warn(missing_docs, missing_debug_implementations)]

pub mod buffer;
pub mod config;
pub mod context;
pub mod diag;
pub mod driver;
pub mod error;
pub mod event;
pub mod kernel;
pub mod prelude;
pub mod program;
pub mod queue;
pub mod registry;

// Re-export key types at crate root
pub use buffer::{Buffer, ReadBack};
pub use config::{Config, ConfigBuilder};
pub use context::Context;
pub use diag::{DiagnosticSink, FailurePolicy};
pub use driver::{DeviceKind, EventStatus, MemFlags, ProfilingPoint, QueueProps};
pub use error::{Error, Result};
pub use event::Event;
pub use kernel::Kernel;
pub use program::Program;
pub use queue::Queue;
pub use registry::{Registry, RegistryBuilder};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_exposes_host_device() {
        let registry = Registry::new().unwrap();
        assert!(registry.device_count() >= 1);
        let platform = registry.devices()[0].0;
        assert!(!registry.platform_name(platform).unwrap().is_empty());
    }

    #[test]
    fn context_over_default_registry() {
        let registry = Registry::new().unwrap();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
        assert!(!ctx.devices().unwrap().is_empty());
    }
}
