//! Convenience re-exports for the common case.
//!
//! ```
//! use kiln::prelude::*;
//! ```

pub use crate::buffer::{Buffer, ReadBack};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::context::Context;
pub use crate::diag::{DiagnosticSink, FailurePolicy, StderrSink};
pub use crate::driver::{
    Access, DeviceId, DeviceKind, Driver, EventStatus, MemFlags, PlatformId, ProfilingPoint,
    QueueProps,
};
pub use crate::error::{Error, Result};
pub use crate::event::Event;
pub use crate::kernel::Kernel;
pub use crate::program::Program;
pub use crate::queue::Queue;
pub use crate::registry::{Registry, RegistryBuilder};
