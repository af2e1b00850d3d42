//! Command queues.

use crate::context::Context;
use crate::driver::{DeviceId, QueueProps, RawQueue};
use crate::error::{Error, Result};
use crate::registry::Shared;
use std::sync::Arc;
use tracing::{debug, warn};

/// Ordered submission channel to one device of one context.
///
/// In default (in-order) mode, submission order is the completion-dependency
/// order for everything enqueued on this queue. With
/// [`QueueProps::out_of_order`] set, ordering rests entirely on explicit
/// wait lists. Move-only; released exactly once.
#[derive(Debug)]
pub struct Queue {
    shared: Arc<Shared>,
    raw: Option<RawQueue>,
    device: DeviceId,
    props: QueueProps,
}

impl Queue {
    /// Create a queue on `device`, which must be part of `context`'s device
    /// set (enforced by the driver).
    pub fn create(context: &Context, device: DeviceId, props: QueueProps) -> Result<Self> {
        let shared = Arc::clone(context.shared());
        let ctx = shared.guard(context.raw())?;
        let raw = shared.guard(shared.driver.create_queue(ctx, device, props))?;
        debug!(?device, ?props, "queue created");
        Ok(Self { shared, raw: Some(raw), device, props })
    }

    /// The device this queue submits to.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The properties the queue was created with.
    pub fn props(&self) -> QueueProps {
        self.props
    }

    /// Block until everything submitted to this queue so far has completed.
    /// Individual operation failures surface through their events, not here.
    pub fn finish(&self) -> Result<()> {
        let raw = self.shared.guard(self.raw())?;
        self.shared.guard(self.shared.driver.finish_queue(raw))
    }

    /// Release the underlying queue. Safe to call more than once; only the
    /// first call reaches the driver. Work already submitted still runs.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.shared.driver.release_queue(raw) {
                warn!(error = %e, "queue release failed");
            }
        }
    }

    pub(crate) fn raw(&self) -> Result<RawQueue> {
        self.raw.ok_or(Error::Released("queue"))
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::host::HostDriver;
    use crate::driver::{DeviceKind, ObjectKind};
    use crate::registry::Registry;

    #[test]
    fn create_and_finish_empty_queue() {
        let registry = Registry::new().unwrap();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
        let device = ctx.devices().unwrap()[0];
        let queue = Queue::create(&ctx, device, QueueProps::default()).unwrap();
        queue.finish().unwrap();
        assert_eq!(queue.device(), device);
    }

    #[test]
    fn release_is_idempotent() {
        let driver = Arc::new(HostDriver::new());
        let registry = Registry::with_driver(driver.clone()).unwrap();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
        let device = ctx.devices().unwrap()[0];
        let mut queue = Queue::create(&ctx, device, QueueProps::default()).unwrap();

        queue.release();
        queue.release();
        drop(queue);

        assert_eq!(driver.releases(ObjectKind::Queue), 1);
        assert_eq!(driver.live(ObjectKind::Queue), 0);
    }

    #[test]
    fn profiling_flag_round_trips() {
        let registry = Registry::new().unwrap();
        let ctx = Context::create_specific(&registry, DeviceKind::Cpu).unwrap();
        let device = ctx.devices().unwrap()[0];
        let queue = Queue::create(&ctx, device, QueueProps::profiling()).unwrap();
        assert!(queue.props().profiling);
        assert!(!queue.props().out_of_order);
    }
}
