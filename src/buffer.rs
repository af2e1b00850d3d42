//! Device-resident memory buffers.

use crate::context::Context;
use crate::driver::{MemFlags, RawBuffer, ReadSlot};
use crate::error::{Error, Result};
use crate::event::{raw_wait_list, Event};
use crate::queue::Queue;
use crate::registry::Shared;
use std::sync::Arc;
use tracing::{debug, warn};

/// Owning handle to a device allocation. Move-only; released exactly once.
///
/// Access intent and host-copy semantics are fixed by the [`MemFlags`]
/// passed at creation and hold for the buffer's entire lifetime.
#[derive(Debug)]
pub struct Buffer {
    shared: Arc<Shared>,
    raw: Option<RawBuffer>,
    size: usize,
}

impl Buffer {
    /// Allocate `size` bytes on the context's device set, optionally
    /// initialized by copying `init` (which must then be exactly `size`
    /// bytes long and `flags.copy_host` must be set).
    pub fn create(
        context: &Context,
        size: usize,
        init: Option<&[u8]>,
        flags: MemFlags,
    ) -> Result<Self> {
        let shared = Arc::clone(context.shared());
        let ctx = shared.guard(context.raw())?;
        let raw = shared.guard(shared.driver.create_buffer(ctx, size, init, flags))?;
        debug!(size, ?flags, "buffer created");
        Ok(Self { shared, raw: Some(raw), size })
    }

    /// Allocated size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Enqueue a host→device transfer of `data` to `offset`.
    ///
    /// The source bytes are copied at enqueue time, so the caller's slice
    /// may be reused immediately even for a non-blocking write. A blocking
    /// write additionally returns only after the transfer completed.
    pub fn write(
        &self,
        queue: &Queue,
        blocking: bool,
        offset: usize,
        data: &[u8],
        wait: &[Event],
    ) -> Result<Event> {
        self.check_bounds(offset, data.len())?;
        let raw = self.shared.guard(self.raw())?;
        let event = self.shared.guard(self.shared.driver.enqueue_write(
            queue.raw()?,
            raw,
            blocking,
            offset,
            data.to_vec(),
            &raw_wait_list(wait),
        ))?;
        Ok(Event::new(Arc::clone(&self.shared), event))
    }

    /// Blocking device→host transfer of `dst.len()` bytes from `offset`.
    pub fn read(&self, queue: &Queue, offset: usize, dst: &mut [u8], wait: &[Event]) -> Result<()> {
        self.check_bounds(offset, dst.len())?;
        let raw = self.shared.guard(self.raw())?;
        let (_, slot) = self.shared.guard(self.shared.driver.enqueue_read(
            queue.raw()?,
            raw,
            true,
            offset,
            dst.len(),
            &raw_wait_list(wait),
        ))?;
        let bytes = slot
            .lock()
            .take()
            .ok_or_else(|| Error::driver("blocking read completed without data"))?;
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    /// Non-blocking device→host transfer. The returned [`ReadBack`] owns
    /// the deferred destination; the bytes become available once its event
    /// completes.
    pub fn read_async(
        &self,
        queue: &Queue,
        offset: usize,
        len: usize,
        wait: &[Event],
    ) -> Result<ReadBack> {
        self.check_bounds(offset, len)?;
        let raw = self.shared.guard(self.raw())?;
        let (event, slot) = self.shared.guard(self.shared.driver.enqueue_read(
            queue.raw()?,
            raw,
            false,
            offset,
            len,
            &raw_wait_list(wait),
        ))?;
        Ok(ReadBack { event: Event::new(Arc::clone(&self.shared), event), slot })
    }

    /// Release the underlying allocation. Safe to call more than once; only
    /// the first call reaches the driver.
    pub fn release(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Err(e) = self.shared.driver.release_buffer(raw) {
                warn!(error = %e, "buffer release failed");
            }
        }
    }

    pub(crate) fn raw(&self) -> Result<RawBuffer> {
        self.raw.ok_or(Error::Released("buffer"))
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.size) {
            return Err(self
                .shared
                .diag
                .handle(Error::OutOfBounds { offset, len, size: self.size }));
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// A pending non-blocking read: an event plus the deferred bytes.
#[derive(Debug)]
pub struct ReadBack {
    event: Event,
    slot: ReadSlot,
}

impl ReadBack {
    /// The event observing the transfer; usable in wait lists.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Wait for the transfer and take the bytes.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.event.wait()?;
        self.slot
            .lock()
            .take()
            .ok_or_else(|| Error::driver("read completed without data"))
    }
}
