//! Kernel entry points and dispatch.

use crate::buffer::Buffer;
use crate::driver::{ArgValue, Dispatch, RawKernel};
use crate::error::{Error, Result};
use crate::event::{raw_wait_list, Event};
use crate::program::Program;
use crate::queue::Queue;
use crate::registry::Shared;
use std::sync::Arc;
use tracing::{debug, warn};

/// Owning handle to one invocable entry point of a built [`Program`].
///
/// Argument binding is stateful: each position is set independently, the
/// last write per position wins, and every position must be bound before
/// [`run`](Kernel::run). Scalar arguments are copied at bind time; buffer
/// arguments bind the handle only, so the [`Buffer`] must outlive every
/// dispatch that uses it. Binding and running the same kernel from several
/// threads requires external serialization, which move-only ownership
/// already gives safe code.
#[derive(Debug)]
pub struct Kernel {
    shared: Arc<Shared>,
    raw: Option<RawKernel>,
}

impl Kernel {
    /// Resolve the entry point `name` inside a built program.
    pub fn create(program: &Program, name: &str) -> Result<Self> {
        let shared = Arc::clone(program.shared());
        let raw = shared.guard(shared.driver.create_kernel(program.raw()?, name))?;
        debug!(entry = name, "kernel created");
        Ok(Self { shared, raw: Some(raw) })
    }

    /// Number of parameters the entry point declares.
    pub fn arg_count(&self) -> Result<usize> {
        let raw = self.shared.guard(self.raw())?;
        self.shared.guard(self.shared.driver.kernel_arg_count(raw))
    }

    /// Bind a scalar argument at `index`, copying its bytes. The caller's
    /// value can go away immediately.
    pub fn set_arg<T: bytemuck::Pod>(&mut self, index: usize, value: &T) -> Result<()> {
        let raw = self.shared.guard(self.raw())?;
        let bytes = bytemuck::bytes_of(value).to_vec();
        self.shared
            .guard(self.shared.driver.set_kernel_arg(raw, index, ArgValue::Scalar(bytes)))
    }

    /// Bind a buffer argument at `index`. Only the handle is captured; the
    /// buffer must stay alive until dispatches using it have completed.
    pub fn set_arg_buffer(&mut self, index: usize, buffer: &Buffer) -> Result<()> {
        let raw = self.shared.guard(self.raw())?;
        let arg = ArgValue::Buffer(buffer.raw()?);
        self.shared.guard(self.shared.driver.set_kernel_arg(raw, index, arg))
    }

    /// Enqueue an N-dimensional dispatch (N = `global.len()`, 1..=3).
    ///
    /// `local`, when given, must have the same rank and divide `global`
    /// evenly per dimension; `None` lets the driver pick a workgroup size.
    /// Returns at submission; completion is observed through the returned
    /// [`Event`], a wait list, or a blocking operation on the same in-order
    /// queue.
    pub fn run(
        &self,
        queue: &Queue,
        global: &[usize],
        local: Option<&[usize]>,
        offset: Option<&[usize]>,
        wait: &[Event],
    ) -> Result<Event> {
        let dispatch = self
            .shared
            .guard(dispatch_shape(global, local, offset))?;
        let raw = self.shared.guard(self.raw())?;
        let event = self.shared.guard(self.shared.driver.enqueue_kernel(
            queue.raw()?,
            raw,
            &dispatch,
            &raw_wait_list(wait),
        ))?;
        Ok(Event::new(Arc::clone(&self.shared), event))
    }

    /// Release the underlying kernel. Safe to call more than once; only
    /// the first call reaches the driver.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.shared.driver.release_kernel(raw) {
                warn!(error = %e, "kernel release failed");
            }
        }
    }

    pub(crate) fn raw(&self) -> Result<RawKernel> {
        self.raw.ok_or(Error::Released("kernel"))
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.release();
    }
}

fn dispatch_shape(
    global: &[usize],
    local: Option<&[usize]>,
    offset: Option<&[usize]>,
) -> Result<Dispatch> {
    let dim = global.len();
    if !(1..=3).contains(&dim) {
        return Err(Error::invalid_arg(format!(
            "dispatch rank must be 1..=3, got {dim}"
        )));
    }
    if let Some(local) = local {
        if local.len() != dim {
            return Err(Error::invalid_arg(format!(
                "local size rank {} does not match global rank {dim}",
                local.len()
            )));
        }
    }
    if let Some(offset) = offset {
        if offset.len() != dim {
            return Err(Error::invalid_arg(format!(
                "global offset rank {} does not match global rank {dim}",
                offset.len()
            )));
        }
    }

    let pad = |values: &[usize], fill: usize| {
        let mut out = [fill; 3];
        out[..values.len()].copy_from_slice(values);
        out
    };

    Ok(Dispatch {
        work_dim: dim,
        global: pad(global, 1),
        local: local.map(|l| pad(l, 1)),
        offset: offset.map_or([0; 3], |o| pad(o, 0)),
    })
}
