//! The platform boundary.
//!
//! Everything the crate does eventually bottoms out in a [`Driver`]: an
//! OpenCL-class API surface for enumerating platforms and devices, creating
//! and releasing contexts, programs, kernels, buffers and queues, building
//! kernel programs with per-device build logs, and enqueueing transfers and
//! dispatches that produce event handles.
//!
//! Handles crossing this boundary are opaque integer ids. The owning
//! wrappers in the crate root guarantee each successfully acquired handle is
//! released exactly once; a driver may treat a second release of the same
//! handle as an error.

pub mod host;

use crate::error::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of a platform (a vendor/runtime grouping of devices).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformId(pub(crate) u64);

/// Opaque identifier of a single compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub(crate) u64);

macro_rules! raw_handle {
    ($(#[$doc:meta] $name:ident),* $(,)?) => {
        $(
            #[$doc]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $name(pub(crate) u64);
        )*
    };
}

raw_handle! {
    /// Raw context handle.
    RawContext,
    /// Raw program handle.
    RawProgram,
    /// Raw kernel handle.
    RawKernel,
    /// Raw buffer handle.
    RawBuffer,
    /// Raw command-queue handle.
    RawQueue,
    /// Raw event handle.
    RawEvent,
}

/// Device classification, also used as the selector when creating contexts.
///
/// [`Driver::device_kind`] only ever reports `Cpu`, `Gpu` or `Accelerator`;
/// `All` exists for selection call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Host-processor device.
    Cpu,
    /// GPU-class device.
    Gpu,
    /// Any other accelerator (FPGA, DSP, ...).
    Accelerator,
    /// Selector matching every device kind.
    All,
}

impl DeviceKind {
    /// Whether a device of kind `kind` satisfies this selector.
    pub fn matches(self, kind: DeviceKind) -> bool {
        self == DeviceKind::All || self == kind
    }
}

/// Access intent of a buffer, fixed for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    /// Kernels may only read the allocation.
    ReadOnly,
    /// Kernels may only write the allocation.
    WriteOnly,
    /// Kernels may read and write.
    #[default]
    ReadWrite,
}

/// Buffer creation flags: access intent plus host-copy semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFlags {
    /// How kernels may touch the allocation.
    pub access: Access,
    /// Whether initial contents are copied from the host region handed to
    /// [`Driver::create_buffer`].
    pub copy_host: bool,
}

impl Default for MemFlags {
    fn default() -> Self {
        Self { access: Access::ReadWrite, copy_host: true }
    }
}

impl MemFlags {
    /// Read-only allocation initialized from a host copy.
    pub fn read_only() -> Self {
        Self { access: Access::ReadOnly, copy_host: true }
    }

    /// Write-only allocation with no initial contents.
    pub fn write_only() -> Self {
        Self { access: Access::WriteOnly, copy_host: false }
    }
}

/// Command-queue creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueProps {
    /// Record the four profiling timestamps for every operation.
    pub profiling: bool,
    /// Drop the in-order completion-dependency guarantee; correctness then
    /// rests on explicit wait lists.
    pub out_of_order: bool,
}

impl QueueProps {
    /// In-order queue with profiling enabled.
    pub fn profiling() -> Self {
        Self { profiling: true, out_of_order: false }
    }

    /// Out-of-order queue without profiling.
    pub fn out_of_order() -> Self {
        Self { profiling: false, out_of_order: true }
    }
}

/// One of the four lifecycle timestamps of an enqueued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilingPoint {
    /// Operation accepted by the host queue.
    Queued,
    /// Operation handed to the device.
    Submitted,
    /// Execution started.
    Start,
    /// Execution finished.
    End,
}

/// Non-blocking completion state of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventStatus {
    /// Accepted by the host queue.
    Queued,
    /// Handed to the device.
    Submitted,
    /// Executing.
    Running,
    /// Finished, successfully or not.
    Complete,
}

/// A kernel argument as captured at bind time.
///
/// Scalars are copied on bind, so the caller's storage may go away
/// immediately. Buffer arguments bind the handle only; the buffer itself
/// must stay alive until the dispatch that uses it has completed.
#[derive(Debug, Clone)]
pub enum ArgValue {
    /// Plain-old-data bytes, copied at bind time.
    Scalar(Vec<u8>),
    /// Handle of a device buffer.
    Buffer(RawBuffer),
}

/// Shape of an N-dimensional work dispatch, N in 1..=3.
#[derive(Debug, Clone, Copy)]
pub struct Dispatch {
    /// Number of meaningful dimensions, 1..=3.
    pub work_dim: usize,
    /// Global work size per dimension; unused dimensions are 1.
    pub global: [usize; 3],
    /// `None` lets the driver pick a workgroup size.
    pub local: Option<[usize; 3]>,
    /// Global id offset per dimension; unused dimensions are 0.
    pub offset: [usize; 3],
}

/// Deferred destination of a non-blocking read. The driver fills the slot
/// before completing the associated event.
pub type ReadSlot = Arc<Mutex<Option<Vec<u8>>>>;

/// Object classes managed by a driver, for lifetime accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ObjectKind {
    Context,
    Program,
    Kernel,
    Buffer,
    Queue,
}

/// The raw platform API this crate drives.
///
/// Every method is a thin analogue of one underlying API call; no method
/// applies the crate's failure policy — that is the wrappers' job.
pub trait Driver: Send + Sync + fmt::Debug {
    /// Enumerate all platforms.
    fn platforms(&self) -> Result<Vec<PlatformId>>;
    /// Human-readable platform name.
    fn platform_name(&self, platform: PlatformId) -> Result<String>;
    /// Enumerate the devices of one platform, in a stable order.
    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceId>>;
    /// Classification of one device. Never reports [`DeviceKind::All`].
    fn device_kind(&self, device: DeviceId) -> Result<DeviceKind>;
    /// Human-readable device name.
    fn device_name(&self, device: DeviceId) -> Result<String>;
    /// Device vendor string.
    fn device_vendor(&self, device: DeviceId) -> Result<String>;

    /// Create a context over the platform's devices matching `selector`.
    /// Fails if no device matches.
    fn create_context(&self, platform: PlatformId, selector: DeviceKind) -> Result<RawContext>;
    /// The devices a context was created over.
    fn context_devices(&self, context: RawContext) -> Result<Vec<DeviceId>>;
    /// Release a context handle.
    fn release_context(&self, context: RawContext) -> Result<()>;

    /// Capture kernel source into a new program object without compiling.
    fn create_program(&self, context: RawContext, source: &str) -> Result<RawProgram>;
    /// Compile synchronously for the program's whole device set. After a
    /// failed build the handle stays valid so per-device logs can be
    /// fetched, exactly like the underlying API.
    fn build_program(&self, program: RawProgram, options: Option<&str>) -> Result<()>;
    /// Build log of the last compile attempt for one device.
    fn build_log(&self, program: RawProgram, device: DeviceId) -> Result<String>;
    /// Release a program handle.
    fn release_program(&self, program: RawProgram) -> Result<()>;

    /// Resolve an entry point of a built program.
    fn create_kernel(&self, program: RawProgram, name: &str) -> Result<RawKernel>;
    /// Number of parameters the entry point declares.
    fn kernel_arg_count(&self, kernel: RawKernel) -> Result<usize>;
    /// Bind one argument position. Last write per position wins.
    fn set_kernel_arg(&self, kernel: RawKernel, index: usize, value: ArgValue) -> Result<()>;
    /// Release a kernel handle.
    fn release_kernel(&self, kernel: RawKernel) -> Result<()>;

    /// Allocate a buffer, optionally copying `init` when
    /// [`MemFlags::copy_host`] is set.
    fn create_buffer(
        &self,
        context: RawContext,
        size: usize,
        init: Option<&[u8]>,
        flags: MemFlags,
    ) -> Result<RawBuffer>;
    /// Allocated size in bytes.
    fn buffer_size(&self, buffer: RawBuffer) -> Result<usize>;
    /// Release a buffer handle.
    fn release_buffer(&self, buffer: RawBuffer) -> Result<()>;

    /// Create a command queue on one device of a context.
    fn create_queue(&self, context: RawContext, device: DeviceId, props: QueueProps)
        -> Result<RawQueue>;
    /// Block until every operation submitted to the queue has completed.
    fn finish_queue(&self, queue: RawQueue) -> Result<()>;
    /// Release a queue handle. Work already submitted still runs.
    fn release_queue(&self, queue: RawQueue) -> Result<()>;

    /// Submit a dispatch. Returns at submission; ordering within an
    /// in-order queue is submission order.
    fn enqueue_kernel(
        &self,
        queue: RawQueue,
        kernel: RawKernel,
        dispatch: &Dispatch,
        wait: &[RawEvent],
    ) -> Result<RawEvent>;
    /// Submit a host→device transfer. The data is owned by the driver from
    /// this point; with `blocking` set, returns only after completion.
    fn enqueue_write(
        &self,
        queue: RawQueue,
        buffer: RawBuffer,
        blocking: bool,
        offset: usize,
        data: Vec<u8>,
        wait: &[RawEvent],
    ) -> Result<RawEvent>;
    /// Submit a device→host transfer. The slot is filled before the event
    /// completes; with `blocking` set, it is filled on return.
    fn enqueue_read(
        &self,
        queue: RawQueue,
        buffer: RawBuffer,
        blocking: bool,
        offset: usize,
        len: usize,
        wait: &[RawEvent],
    ) -> Result<(RawEvent, ReadSlot)>;

    /// Block until the event's operation completes; a failed operation
    /// surfaces here as an error.
    fn wait_event(&self, event: RawEvent) -> Result<()>;
    /// Non-blocking completion query.
    fn event_status(&self, event: RawEvent) -> Result<EventStatus>;
    /// One profiling timestamp, in nanoseconds on the driver's clock.
    fn event_profile(&self, event: RawEvent, point: ProfilingPoint) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matching() {
        assert!(DeviceKind::All.matches(DeviceKind::Gpu));
        assert!(DeviceKind::All.matches(DeviceKind::Cpu));
        assert!(DeviceKind::Gpu.matches(DeviceKind::Gpu));
        assert!(!DeviceKind::Gpu.matches(DeviceKind::Cpu));
        assert!(!DeviceKind::Accelerator.matches(DeviceKind::Gpu));
    }

    #[test]
    fn default_mem_flags_copy_host_read_write() {
        let flags = MemFlags::default();
        assert_eq!(flags.access, Access::ReadWrite);
        assert!(flags.copy_host);
        assert_eq!(MemFlags::read_only().access, Access::ReadOnly);
        assert!(!MemFlags::write_only().copy_host);
    }

    #[test]
    fn event_status_ordering() {
        assert!(EventStatus::Queued < EventStatus::Submitted);
        assert!(EventStatus::Submitted < EventStatus::Running);
        assert!(EventStatus::Running < EventStatus::Complete);
    }
}
