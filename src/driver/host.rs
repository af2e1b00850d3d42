//! In-process host driver.
//!
//! A complete [`Driver`] whose devices are host CPU executors. Kernel
//! "programs" are source modules scanned for `__kernel void name(...)`
//! entry declarations; the numeric payload behind each entry is a native
//! function registered on the driver by the embedding application (the
//! compiled payload stays opaque to the lifecycle layer, exactly as it does
//! with a real device compiler).
//!
//! In-order queues run on a dedicated worker thread fed by a channel, so
//! submission order is completion-dependency order. Out-of-order queues hand
//! every submission to its own thread and rely on caller wait lists. All
//! four profiling timestamps are recorded when a queue is created with
//! profiling enabled.

use super::{
    Access, ArgValue, DeviceId, DeviceKind, Dispatch, Driver, EventStatus, MemFlags, ObjectKind,
    PlatformId, ProfilingPoint, QueueProps, RawBuffer, RawContext, RawEvent, RawKernel,
    RawProgram, RawQueue, ReadSlot,
};
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Native payload invoked once per work item of a dispatch.
pub type KernelFn = Arc<dyn Fn(&mut WorkItem<'_>) -> Result<()> + Send + Sync>;

/// One device of a synthetic topology.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DeviceSpec {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
}

impl DeviceSpec {
    /// Device named `name` of kind `kind`, with the default vendor string.
    pub fn new<S: Into<String>>(name: S, kind: DeviceKind) -> Self {
        Self { name: name.into(), vendor: "kiln".to_string(), kind }
    }

    /// Override the vendor string.
    pub fn vendor<S: Into<String>>(mut self, vendor: S) -> Self {
        self.vendor = vendor.into();
        self
    }
}

/// One platform of a synthetic topology.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct PlatformSpec {
    pub name: String,
    pub devices: Vec<DeviceSpec>,
}

impl PlatformSpec {
    /// Empty platform named `name`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into(), devices: Vec::new() }
    }

    /// Append a device.
    pub fn device(mut self, device: DeviceSpec) -> Self {
        self.devices.push(device);
        self
    }
}

/// Per-work-item view handed to a native kernel payload: the global position
/// plus type-checked access to the bound arguments.
#[derive(Debug)]
pub struct WorkItem<'a> {
    gid: [usize; 3],
    gsize: [usize; 3],
    lsize: [usize; 3],
    slots: &'a mut [Slot],
}

impl WorkItem<'_> {
    /// Global position of this work item in dimension `dim`.
    pub fn global_id(&self, dim: usize) -> usize {
        self.gid.get(dim).copied().unwrap_or(0)
    }

    /// Global dispatch extent in dimension `dim`.
    pub fn global_size(&self, dim: usize) -> usize {
        self.gsize.get(dim).copied().unwrap_or(1)
    }

    /// Workgroup extent in dimension `dim`.
    pub fn local_size(&self, dim: usize) -> usize {
        self.lsize.get(dim).copied().unwrap_or(1)
    }

    /// Read a scalar argument bound at position `index`.
    pub fn scalar<T: bytemuck::Pod>(&self, index: usize) -> Result<T> {
        match self.slots.get(index) {
            Some(Slot::Scalar(bytes)) => bytemuck::try_pod_read_unaligned(bytes)
                .map_err(|e| Error::invalid_arg(format!("argument {index}: {e}"))),
            Some(Slot::Buf { .. }) => {
                Err(Error::invalid_arg(format!("argument {index} is a buffer, not a scalar")))
            }
            None => Err(Error::invalid_arg(format!("argument {index} out of range"))),
        }
    }

    /// Borrow the bytes of a buffer argument. Rejected for write-only
    /// buffers, whose kernel-side reads are undefined on real devices.
    pub fn buffer(&self, index: usize) -> Result<&[u8]> {
        match self.slots.get(index) {
            Some(Slot::Buf { data, access, .. }) => {
                if *access == Access::WriteOnly {
                    return Err(Error::invalid_arg(format!(
                        "argument {index}: cannot read a write-only buffer"
                    )));
                }
                Ok(data)
            }
            Some(Slot::Scalar(_)) => {
                Err(Error::invalid_arg(format!("argument {index} is a scalar, not a buffer")))
            }
            None => Err(Error::invalid_arg(format!("argument {index} out of range"))),
        }
    }

    /// Mutably borrow the bytes of a buffer argument. Rejected for
    /// read-only buffers.
    pub fn buffer_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        match self.slots.get_mut(index) {
            Some(Slot::Buf { data, access, .. }) => {
                if *access == Access::ReadOnly {
                    return Err(Error::invalid_arg(format!(
                        "argument {index}: cannot write a read-only buffer"
                    )));
                }
                Ok(data)
            }
            Some(Slot::Scalar(_)) => {
                Err(Error::invalid_arg(format!("argument {index} is a scalar, not a buffer")))
            }
            None => Err(Error::invalid_arg(format!("argument {index} out of range"))),
        }
    }

    /// Read element `elem` of a buffer argument as `T`.
    pub fn read_elem<T: bytemuck::Pod>(&self, index: usize, elem: usize) -> Result<T> {
        let size = std::mem::size_of::<T>();
        let bytes = self.buffer(index)?;
        let range = bytes.get(elem * size..(elem + 1) * size).ok_or_else(|| {
            Error::invalid_arg(format!("argument {index}: element {elem} out of range"))
        })?;
        Ok(bytemuck::pod_read_unaligned(range))
    }

    /// Write element `elem` of a buffer argument.
    pub fn write_elem<T: bytemuck::Pod>(&mut self, index: usize, elem: usize, value: T) -> Result<()> {
        let size = std::mem::size_of::<T>();
        let bytes = self.buffer_mut(index)?;
        let range = bytes.get_mut(elem * size..(elem + 1) * size).ok_or_else(|| {
            Error::invalid_arg(format!("argument {index}: element {elem} out of range"))
        })?;
        range.copy_from_slice(bytemuck::bytes_of(&value));
        Ok(())
    }
}

/// Argument storage materialized for the duration of one dispatch. Buffer
/// contents are moved out of the buffer table before the first work item and
/// moved back after the last, so payloads get unlocked slice access.
#[derive(Debug)]
enum Slot {
    Scalar(Vec<u8>),
    Buf { id: RawBuffer, data: Vec<u8>, access: Access },
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    arity: usize,
}

/// Scan kernel source for `__kernel void <name>(<params>)` declarations.
/// Returns the entry list, or the build log on malformed source.
fn parse_entries(source: &str) -> std::result::Result<Vec<Entry>, String> {
    let mut entries: Vec<Entry> = Vec::new();
    let mut log = String::new();
    let mut found_any = false;

    for (pos, _) in source.match_indices("__kernel") {
        found_any = true;
        let decl = source[pos + "__kernel".len()..].trim_start();

        let decl = match decl.strip_prefix("void") {
            Some(rest) if rest.starts_with(char::is_whitespace) => rest.trim_start(),
            _ => {
                log.push_str("error: expected 'void' after __kernel\n");
                continue;
            }
        };

        let name_len = decl
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(decl.len());
        let name = &decl[..name_len];
        if name.is_empty() {
            log.push_str("error: missing kernel name after '__kernel void'\n");
            continue;
        }

        let after_name = decl[name_len..].trim_start();
        let Some(param_text) = after_name.strip_prefix('(') else {
            log.push_str(&format!("error: expected '(' after kernel name '{name}'\n"));
            continue;
        };

        let mut depth = 1usize;
        let mut arity = 0usize;
        let mut seen_token = false;
        let mut closed = false;
        for c in param_text.chars() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        closed = true;
                        break;
                    }
                }
                ',' if depth == 1 => arity += 1,
                c if !c.is_whitespace() => seen_token = true,
                _ => {}
            }
        }
        if !closed {
            log.push_str(&format!("error: unterminated parameter list for kernel '{name}'\n"));
            continue;
        }
        if seen_token {
            arity += 1;
        }

        if entries.iter().any(|e| e.name == name) {
            log.push_str(&format!("error: duplicate kernel entry '{name}'\n"));
            continue;
        }
        entries.push(Entry { name: name.to_string(), arity });
    }

    if !found_any {
        log.push_str("error: no __kernel entry points found\n");
    }
    if log.is_empty() {
        Ok(entries)
    } else {
        Err(log)
    }
}

#[derive(Debug)]
struct PlatformInfo {
    id: PlatformId,
    name: String,
    devices: Vec<DeviceId>,
}

#[derive(Debug)]
struct DeviceInfo {
    platform: PlatformId,
    name: String,
    vendor: String,
    kind: DeviceKind,
}

struct ContextEntry {
    platform: PlatformId,
    devices: Vec<DeviceId>,
}

struct ProgramEntry {
    context: RawContext,
    source: String,
    built: bool,
    entries: Vec<Entry>,
    log: String,
}

struct KernelEntry {
    func: KernelFn,
    arity: usize,
    args: Vec<Option<ArgValue>>,
}

struct BufferEntry {
    data: Vec<u8>,
    access: Access,
}

struct QueueEntry {
    device: DeviceId,
    props: QueueProps,
    /// Present for in-order queues; dropping it shuts the worker down after
    /// it drains the channel.
    sender: Option<Sender<Task>>,
    pending: Vec<Arc<EventState>>,
}

struct EventInner {
    status: EventStatus,
    error: Option<String>,
    /// Indexed queued / submitted / start / end.
    times: [Option<u64>; 4],
}

struct EventState {
    profiled: bool,
    inner: Mutex<EventInner>,
    cond: Condvar,
}

impl EventState {
    fn new(profiled: bool, queued_at: Option<u64>) -> Self {
        Self {
            profiled,
            inner: Mutex::new(EventInner {
                status: EventStatus::Queued,
                error: None,
                times: [queued_at, None, None, None],
            }),
            cond: Condvar::new(),
        }
    }

    fn mark(&self, status: EventStatus, time: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.status = status;
        if let Some(t) = time {
            let slot = match status {
                EventStatus::Queued => 0,
                EventStatus::Submitted => 1,
                EventStatus::Running => 2,
                EventStatus::Complete => 3,
            };
            inner.times[slot] = Some(t);
        }
        if status == EventStatus::Complete {
            self.cond.notify_all();
        }
    }

    fn fail(&self, message: String, time: Option<u64>) {
        let mut inner = self.inner.lock();
        inner.status = EventStatus::Complete;
        inner.error = Some(message);
        if let Some(t) = time {
            inner.times[3] = Some(t);
        }
        self.cond.notify_all();
    }

    fn wait(&self) -> std::result::Result<(), String> {
        let mut inner = self.inner.lock();
        while inner.status != EventStatus::Complete {
            self.cond.wait(&mut inner);
        }
        match &inner.error {
            Some(message) => Err(message.clone()),
            None => Ok(()),
        }
    }

    fn status(&self) -> EventStatus {
        self.inner.lock().status
    }

    fn time(&self, point: ProfilingPoint) -> Option<u64> {
        let slot = match point {
            ProfilingPoint::Queued => 0,
            ProfilingPoint::Submitted => 1,
            ProfilingPoint::Start => 2,
            ProfilingPoint::End => 3,
        };
        self.inner.lock().times[slot]
    }
}

enum Job {
    Kernel { func: KernelFn, args: Vec<ArgValue>, dispatch: Dispatch },
    Write { buffer: RawBuffer, offset: usize, data: Vec<u8> },
    Read { buffer: RawBuffer, offset: usize, len: usize, slot: ReadSlot },
    Marker,
}

struct Task {
    event: Arc<EventState>,
    wait: Vec<Arc<EventState>>,
    job: Job,
}

fn kind_index(kind: ObjectKind) -> usize {
    match kind {
        ObjectKind::Context => 0,
        ObjectKind::Program => 1,
        ObjectKind::Kernel => 2,
        ObjectKind::Buffer => 3,
        ObjectKind::Queue => 4,
    }
}

struct HostState {
    epoch: Instant,
    platforms: Vec<PlatformInfo>,
    devices: HashMap<u64, DeviceInfo>,
    native: RwLock<HashMap<String, KernelFn>>,
    next_id: AtomicU64,
    contexts: Mutex<HashMap<u64, ContextEntry>>,
    programs: Mutex<HashMap<u64, ProgramEntry>>,
    kernels: Mutex<HashMap<u64, KernelEntry>>,
    buffers: Mutex<HashMap<u64, BufferEntry>>,
    queues: Mutex<HashMap<u64, QueueEntry>>,
    events: Mutex<HashMap<u64, Arc<EventState>>>,
    releases: [AtomicUsize; 5],
}

impl HostState {
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn new_event(&self, profiled: bool) -> (RawEvent, Arc<EventState>) {
        let state = Arc::new(EventState::new(profiled, profiled.then(|| self.now())));
        let id = self.alloc_id();
        self.events.lock().insert(id, Arc::clone(&state));
        (RawEvent(id), state)
    }

    fn event(&self, event: RawEvent) -> Result<Arc<EventState>> {
        self.events
            .lock()
            .get(&event.0)
            .cloned()
            .ok_or(Error::Released("event"))
    }

    fn wait_states(&self, wait: &[RawEvent]) -> Result<Vec<Arc<EventState>>> {
        wait.iter().map(|e| self.event(*e)).collect()
    }

    /// Run one task to completion, honoring its wait list and recording
    /// timestamps when the owning queue profiles.
    fn execute(self: &Arc<Self>, task: Task) {
        let profiled = task.event.profiled;
        task.event.mark(EventStatus::Submitted, profiled.then(|| self.now()));

        for dep in &task.wait {
            if let Err(message) = dep.wait() {
                task.event.fail(
                    format!("wait-list dependency failed: {message}"),
                    profiled.then(|| self.now()),
                );
                return;
            }
        }

        task.event.mark(EventStatus::Running, profiled.then(|| self.now()));
        match self.run_job(task.job) {
            Ok(()) => task.event.mark(EventStatus::Complete, profiled.then(|| self.now())),
            Err(e) => task.event.fail(e.to_string(), profiled.then(|| self.now())),
        }
    }

    fn run_job(&self, job: Job) -> Result<()> {
        match job {
            Job::Marker => Ok(()),
            Job::Write { buffer, offset, data } => {
                let mut buffers = self.buffers.lock();
                let entry = buffers.get_mut(&buffer.0).ok_or(Error::Released("buffer"))?;
                let size = entry.data.len();
                let dst = entry
                    .data
                    .get_mut(offset..offset + data.len())
                    .ok_or(Error::OutOfBounds { offset, len: data.len(), size })?;
                dst.copy_from_slice(&data);
                Ok(())
            }
            Job::Read { buffer, offset, len, slot } => {
                let buffers = self.buffers.lock();
                let entry = buffers.get(&buffer.0).ok_or(Error::Released("buffer"))?;
                let size = entry.data.len();
                let src = entry
                    .data
                    .get(offset..offset + len)
                    .ok_or(Error::OutOfBounds { offset, len, size })?;
                *slot.lock() = Some(src.to_vec());
                Ok(())
            }
            Job::Kernel { func, args, dispatch } => self.run_kernel(&func, args, &dispatch),
        }
    }

    fn run_kernel(&self, func: &KernelFn, args: Vec<ArgValue>, dispatch: &Dispatch) -> Result<()> {
        // Materialize argument slots, moving buffer contents out of the
        // table so work items get direct slice access.
        let mut slots = Vec::with_capacity(args.len());
        {
            let mut buffers = self.buffers.lock();
            for arg in args {
                match arg {
                    ArgValue::Scalar(bytes) => slots.push(Slot::Scalar(bytes)),
                    ArgValue::Buffer(id) => {
                        let entry = buffers.get_mut(&id.0).ok_or(Error::Released("buffer"))?;
                        slots.push(Slot::Buf {
                            id,
                            data: std::mem::take(&mut entry.data),
                            access: entry.access,
                        });
                    }
                }
            }
        }

        let global = dispatch.global;
        let local = dispatch.local.unwrap_or([1, 1, 1]);
        let offset = dispatch.offset;

        let mut result = Ok(());
        'dispatch: for z in 0..global[2] {
            for y in 0..global[1] {
                for x in 0..global[0] {
                    let mut item = WorkItem {
                        gid: [x + offset[0], y + offset[1], z + offset[2]],
                        gsize: global,
                        lsize: local,
                        slots: &mut slots,
                    };
                    if let Err(e) = func(&mut item) {
                        result = Err(e);
                        break 'dispatch;
                    }
                }
            }
        }

        // Return buffer contents to the table even when the payload failed
        // partway; partial writes stay visible, as on a real device.
        let mut buffers = self.buffers.lock();
        for slot in slots {
            if let Slot::Buf { id, data, .. } = slot {
                if let Some(entry) = buffers.get_mut(&id.0) {
                    entry.data = data;
                }
            }
        }
        result
    }

    fn submit(self: &Arc<Self>, queue: RawQueue, task: Task) -> Result<()> {
        let mut queues = self.queues.lock();
        let entry = queues.get_mut(&queue.0).ok_or(Error::Released("queue"))?;
        entry.pending.retain(|e| e.status() != EventStatus::Complete);
        entry.pending.push(Arc::clone(&task.event));

        match &entry.sender {
            Some(sender) => sender
                .send(task)
                .map_err(|_| Error::driver("queue worker terminated")),
            None => {
                let state = Arc::clone(self);
                std::thread::Builder::new()
                    .name("kiln-dispatch".to_string())
                    .spawn(move || state.execute(task))
                    .map_err(|e| Error::driver(format!("failed to spawn dispatch thread: {e}")))?;
                Ok(())
            }
        }
    }

    fn queue_props(&self, queue: RawQueue) -> Result<QueueProps> {
        self.queues
            .lock()
            .get(&queue.0)
            .map(|q| q.props)
            .ok_or(Error::Released("queue"))
    }

    fn bump_release(&self, kind: ObjectKind) {
        self.releases[kind_index(kind)].fetch_add(1, Ordering::Relaxed);
    }
}

/// The in-process driver. Cheap to share behind an `Arc`; all methods take
/// `&self`.
pub struct HostDriver {
    state: Arc<HostState>,
}

impl fmt::Debug for HostDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDriver")
            .field("platforms", &self.state.platforms.len())
            .field("devices", &self.state.devices.len())
            .finish_non_exhaustive()
    }
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    /// Driver with the default topology: one platform carrying one
    /// CPU-class device.
    pub fn new() -> Self {
        let cpu = DeviceSpec::new(format!("host-cpu ({} cores)", num_cpus::get()), DeviceKind::Cpu);
        Self::with_topology(vec![PlatformSpec::new("kiln-host").device(cpu)])
    }

    /// Driver with a caller-defined platform/device topology. Devices of any
    /// kind execute on host threads; the kind only affects classification
    /// and selection.
    pub fn with_topology(specs: Vec<PlatformSpec>) -> Self {
        let mut platforms = Vec::with_capacity(specs.len());
        let mut devices = HashMap::new();
        let mut next = 1u64;

        for spec in specs {
            let pid = PlatformId(next);
            next += 1;
            let mut ids = Vec::with_capacity(spec.devices.len());
            for dev in spec.devices {
                let did = DeviceId(next);
                next += 1;
                devices.insert(
                    did.0,
                    DeviceInfo { platform: pid, name: dev.name, vendor: dev.vendor, kind: dev.kind },
                );
                ids.push(did);
            }
            platforms.push(PlatformInfo { id: pid, name: spec.name, devices: ids });
        }

        Self {
            state: Arc::new(HostState {
                epoch: Instant::now(),
                platforms,
                devices,
                native: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(next),
                contexts: Mutex::new(HashMap::new()),
                programs: Mutex::new(HashMap::new()),
                kernels: Mutex::new(HashMap::new()),
                buffers: Mutex::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                releases: Default::default(),
            }),
        }
    }

    /// Register the native payload behind a kernel entry name. Programs
    /// resolve entries against this table at kernel creation time.
    pub fn register_kernel<F>(&self, name: &str, func: F)
    where
        F: Fn(&mut WorkItem<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.state.native.write().insert(name.to_string(), Arc::new(func));
    }

    /// Number of live objects of one kind. Diagnostic aid for lifetime
    /// accounting in tests.
    pub fn live(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Context => self.state.contexts.lock().len(),
            ObjectKind::Program => self.state.programs.lock().len(),
            ObjectKind::Kernel => self.state.kernels.lock().len(),
            ObjectKind::Buffer => self.state.buffers.lock().len(),
            ObjectKind::Queue => self.state.queues.lock().len(),
        }
    }

    /// Total successful releases of one object kind.
    pub fn releases(&self, kind: ObjectKind) -> usize {
        self.state.releases[kind_index(kind)].load(Ordering::Relaxed)
    }

    fn platform(&self, platform: PlatformId) -> Result<&PlatformInfo> {
        self.state
            .platforms
            .iter()
            .find(|p| p.id == platform)
            .ok_or_else(|| Error::discovery("unknown platform"))
    }

    fn device(&self, device: DeviceId) -> Result<&DeviceInfo> {
        self.state
            .devices
            .get(&device.0)
            .ok_or_else(|| Error::discovery("unknown device"))
    }
}

impl Driver for HostDriver {
    fn platforms(&self) -> Result<Vec<PlatformId>> {
        Ok(self.state.platforms.iter().map(|p| p.id).collect())
    }

    fn platform_name(&self, platform: PlatformId) -> Result<String> {
        Ok(self.platform(platform)?.name.clone())
    }

    fn devices(&self, platform: PlatformId) -> Result<Vec<DeviceId>> {
        Ok(self.platform(platform)?.devices.clone())
    }

    fn device_kind(&self, device: DeviceId) -> Result<DeviceKind> {
        Ok(self.device(device)?.kind)
    }

    fn device_name(&self, device: DeviceId) -> Result<String> {
        Ok(self.device(device)?.name.clone())
    }

    fn device_vendor(&self, device: DeviceId) -> Result<String> {
        Ok(self.device(device)?.vendor.clone())
    }

    fn create_context(&self, platform: PlatformId, selector: DeviceKind) -> Result<RawContext> {
        let info = self.platform(platform)?;
        let devices: Vec<DeviceId> = info
            .devices
            .iter()
            .copied()
            .filter(|d| {
                self.state
                    .devices
                    .get(&d.0)
                    .is_some_and(|info| selector.matches(info.kind))
            })
            .collect();
        if devices.is_empty() {
            return Err(Error::creation(
                "context",
                format!("no devices matching selector {selector:?} on platform"),
            ));
        }
        let id = self.state.alloc_id();
        self.state.contexts.lock().insert(id, ContextEntry { platform, devices });
        Ok(RawContext(id))
    }

    fn context_devices(&self, context: RawContext) -> Result<Vec<DeviceId>> {
        self.state
            .contexts
            .lock()
            .get(&context.0)
            .map(|c| c.devices.clone())
            .ok_or(Error::Released("context"))
    }

    fn release_context(&self, context: RawContext) -> Result<()> {
        self.state
            .contexts
            .lock()
            .remove(&context.0)
            .ok_or(Error::Released("context"))?;
        self.state.bump_release(ObjectKind::Context);
        Ok(())
    }

    fn create_program(&self, context: RawContext, source: &str) -> Result<RawProgram> {
        if !self.state.contexts.lock().contains_key(&context.0) {
            return Err(Error::Released("context"));
        }
        let id = self.state.alloc_id();
        self.state.programs.lock().insert(
            id,
            ProgramEntry {
                context,
                source: source.to_string(),
                built: false,
                entries: Vec::new(),
                log: String::new(),
            },
        );
        Ok(RawProgram(id))
    }

    fn build_program(&self, program: RawProgram, _options: Option<&str>) -> Result<()> {
        let mut programs = self.state.programs.lock();
        let entry = programs.get_mut(&program.0).ok_or(Error::Released("program"))?;
        match parse_entries(&entry.source) {
            Ok(entries) => {
                entry.entries = entries;
                entry.built = true;
                entry.log.clear();
                Ok(())
            }
            Err(log) => {
                entry.built = false;
                entry.log = log;
                Err(Error::BuildFailed)
            }
        }
    }

    fn build_log(&self, program: RawProgram, _device: DeviceId) -> Result<String> {
        // One host compiler serves every device, so the log is shared.
        self.state
            .programs
            .lock()
            .get(&program.0)
            .map(|p| p.log.clone())
            .ok_or(Error::Released("program"))
    }

    fn release_program(&self, program: RawProgram) -> Result<()> {
        self.state
            .programs
            .lock()
            .remove(&program.0)
            .ok_or(Error::Released("program"))?;
        self.state.bump_release(ObjectKind::Program);
        Ok(())
    }

    fn create_kernel(&self, program: RawProgram, name: &str) -> Result<RawKernel> {
        let programs = self.state.programs.lock();
        let entry = programs.get(&program.0).ok_or(Error::Released("program"))?;
        if !entry.built {
            return Err(Error::creation("kernel", "program is not built"));
        }
        let decl = entry
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::creation("kernel", format!("no kernel named '{name}' in program")))?;
        let func = self
            .state
            .native
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                Error::creation("kernel", format!("no native implementation registered for entry '{name}'"))
            })?;
        let arity = decl.arity;
        drop(programs);

        let id = self.state.alloc_id();
        self.state
            .kernels
            .lock()
            .insert(id, KernelEntry { func, arity, args: vec![None; arity] });
        Ok(RawKernel(id))
    }

    fn kernel_arg_count(&self, kernel: RawKernel) -> Result<usize> {
        self.state
            .kernels
            .lock()
            .get(&kernel.0)
            .map(|k| k.arity)
            .ok_or(Error::Released("kernel"))
    }

    fn set_kernel_arg(&self, kernel: RawKernel, index: usize, value: ArgValue) -> Result<()> {
        if let ArgValue::Buffer(id) = &value {
            if !self.state.buffers.lock().contains_key(&id.0) {
                return Err(Error::Released("buffer"));
            }
        }
        let mut kernels = self.state.kernels.lock();
        let entry = kernels.get_mut(&kernel.0).ok_or(Error::Released("kernel"))?;
        let slot = entry.args.get_mut(index).ok_or_else(|| {
            Error::invalid_arg(format!(
                "argument index {index} out of range for kernel with {} parameters",
                entry.arity
            ))
        })?;
        *slot = Some(value);
        Ok(())
    }

    fn release_kernel(&self, kernel: RawKernel) -> Result<()> {
        self.state
            .kernels
            .lock()
            .remove(&kernel.0)
            .ok_or(Error::Released("kernel"))?;
        self.state.bump_release(ObjectKind::Kernel);
        Ok(())
    }

    fn create_buffer(
        &self,
        context: RawContext,
        size: usize,
        init: Option<&[u8]>,
        flags: MemFlags,
    ) -> Result<RawBuffer> {
        if !self.state.contexts.lock().contains_key(&context.0) {
            return Err(Error::Released("context"));
        }
        let data = match init {
            Some(bytes) => {
                if !flags.copy_host {
                    return Err(Error::invalid_arg("host data supplied without copy_host flag"));
                }
                if bytes.len() != size {
                    return Err(Error::invalid_arg(format!(
                        "host data length {} does not match buffer size {size}",
                        bytes.len()
                    )));
                }
                bytes.to_vec()
            }
            None => vec![0u8; size],
        };
        let id = self.state.alloc_id();
        self.state
            .buffers
            .lock()
            .insert(id, BufferEntry { data, access: flags.access });
        Ok(RawBuffer(id))
    }

    fn buffer_size(&self, buffer: RawBuffer) -> Result<usize> {
        self.state
            .buffers
            .lock()
            .get(&buffer.0)
            .map(|b| b.data.len())
            .ok_or(Error::Released("buffer"))
    }

    fn release_buffer(&self, buffer: RawBuffer) -> Result<()> {
        self.state
            .buffers
            .lock()
            .remove(&buffer.0)
            .ok_or(Error::Released("buffer"))?;
        self.state.bump_release(ObjectKind::Buffer);
        Ok(())
    }

    fn create_queue(
        &self,
        context: RawContext,
        device: DeviceId,
        props: QueueProps,
    ) -> Result<RawQueue> {
        {
            let contexts = self.state.contexts.lock();
            let entry = contexts.get(&context.0).ok_or(Error::Released("context"))?;
            if !entry.devices.contains(&device) {
                return Err(Error::creation("queue", "device is not part of the context"));
            }
        }

        let sender = if props.out_of_order {
            None
        } else {
            let (tx, rx) = unbounded::<Task>();
            let state = Arc::clone(&self.state);
            std::thread::Builder::new()
                .name("kiln-queue".to_string())
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        state.execute(task);
                    }
                })
                .map_err(|e| Error::creation("queue", format!("failed to spawn worker: {e}")))?;
            Some(tx)
        };

        let id = self.state.alloc_id();
        self.state
            .queues
            .lock()
            .insert(id, QueueEntry { device, props, sender, pending: Vec::new() });
        Ok(RawQueue(id))
    }

    fn finish_queue(&self, queue: RawQueue) -> Result<()> {
        let pending = {
            let mut queues = self.state.queues.lock();
            let entry = queues.get_mut(&queue.0).ok_or(Error::Released("queue"))?;
            std::mem::take(&mut entry.pending)
        };
        // Payload failures surface through their own events, not finish.
        for event in pending {
            let _ = event.wait();
        }
        Ok(())
    }

    fn release_queue(&self, queue: RawQueue) -> Result<()> {
        // Removing the entry drops the sender; the worker drains whatever
        // was already submitted and exits.
        self.state
            .queues
            .lock()
            .remove(&queue.0)
            .ok_or(Error::Released("queue"))?;
        self.state.bump_release(ObjectKind::Queue);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: RawQueue,
        kernel: RawKernel,
        dispatch: &Dispatch,
        wait: &[RawEvent],
    ) -> Result<RawEvent> {
        if !(1..=3).contains(&dispatch.work_dim) {
            return Err(Error::invalid_arg(format!(
                "work dimension must be 1..=3, got {}",
                dispatch.work_dim
            )));
        }
        for d in 0..dispatch.work_dim {
            if dispatch.global[d] == 0 {
                return Err(Error::invalid_arg(format!("global size is zero in dimension {d}")));
            }
            if let Some(local) = dispatch.local {
                if local[d] == 0 || dispatch.global[d] % local[d] != 0 {
                    return Err(Error::invalid_arg(format!(
                        "global size {} not divisible by local size {} in dimension {d}",
                        dispatch.global[d], local[d]
                    )));
                }
            }
        }

        let (func, args) = {
            let kernels = self.state.kernels.lock();
            let entry = kernels.get(&kernel.0).ok_or(Error::Released("kernel"))?;
            let mut args = Vec::with_capacity(entry.arity);
            let mut bound_buffers = HashSet::new();
            for (i, arg) in entry.args.iter().enumerate() {
                let arg = arg
                    .clone()
                    .ok_or_else(|| Error::invalid_arg(format!("kernel argument {i} not bound")))?;
                if let ArgValue::Buffer(id) = &arg {
                    if !bound_buffers.insert(id.0) {
                        return Err(Error::invalid_arg(
                            "buffer bound to multiple kernel arguments",
                        ));
                    }
                }
                args.push(arg);
            }
            (Arc::clone(&entry.func), args)
        };

        let props = self.state.queue_props(queue)?;
        let wait = self.state.wait_states(wait)?;
        let (id, event) = self.state.new_event(props.profiling);
        self.state.submit(
            queue,
            Task { event, wait, job: Job::Kernel { func, args, dispatch: *dispatch } },
        )?;
        Ok(id)
    }

    fn enqueue_write(
        &self,
        queue: RawQueue,
        buffer: RawBuffer,
        blocking: bool,
        offset: usize,
        data: Vec<u8>,
        wait: &[RawEvent],
    ) -> Result<RawEvent> {
        let size = self.buffer_size(buffer)?;
        if offset + data.len() > size {
            return Err(Error::OutOfBounds { offset, len: data.len(), size });
        }
        let props = self.state.queue_props(queue)?;
        let wait = self.state.wait_states(wait)?;
        let (id, event) = self.state.new_event(props.profiling);
        self.state.submit(
            queue,
            Task {
                event: Arc::clone(&event),
                wait,
                job: Job::Write { buffer, offset, data },
            },
        )?;
        if blocking {
            event.wait().map_err(Error::dispatch)?;
        }
        Ok(id)
    }

    fn enqueue_read(
        &self,
        queue: RawQueue,
        buffer: RawBuffer,
        blocking: bool,
        offset: usize,
        len: usize,
        wait: &[RawEvent],
    ) -> Result<(RawEvent, ReadSlot)> {
        let size = self.buffer_size(buffer)?;
        if offset + len > size {
            return Err(Error::OutOfBounds { offset, len, size });
        }
        let props = self.state.queue_props(queue)?;
        let wait = self.state.wait_states(wait)?;
        let (id, event) = self.state.new_event(props.profiling);
        let slot: ReadSlot = Arc::new(Mutex::new(None));
        self.state.submit(
            queue,
            Task {
                event: Arc::clone(&event),
                wait,
                job: Job::Read { buffer, offset, len, slot: Arc::clone(&slot) },
            },
        )?;
        if blocking {
            event.wait().map_err(Error::dispatch)?;
        }
        Ok((id, slot))
    }

    fn wait_event(&self, event: RawEvent) -> Result<()> {
        self.state.event(event)?.wait().map_err(Error::dispatch)
    }

    fn event_status(&self, event: RawEvent) -> Result<EventStatus> {
        Ok(self.state.event(event)?.status())
    }

    fn event_profile(&self, event: RawEvent, point: ProfilingPoint) -> Result<u64> {
        let state = self.state.event(event)?;
        if !state.profiled {
            return Err(Error::profiling("queue was not created with profiling enabled"));
        }
        if state.status() != EventStatus::Complete {
            return Err(Error::profiling("operation has not completed"));
        }
        state
            .time(point)
            .ok_or_else(|| Error::profiling("timestamp unavailable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_entry() {
        let entries = parse_entries(
            "__kernel void x2(__global const uint *in, __global uint *out, uint width) {}",
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "x2");
        assert_eq!(entries[0].arity, 3);
    }

    #[test]
    fn parse_multiple_entries_and_empty_params() {
        let src = "__kernel void a() {}\n__kernel void b(int x) {}";
        let entries = parse_entries(src).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].arity, 0);
        assert_eq!(entries[1].arity, 1);
    }

    #[test]
    fn parse_rejects_sourceless_module() {
        let log = parse_entries("int helper(int x) { return x; }").unwrap_err();
        assert!(log.contains("no __kernel entry points"));
    }

    #[test]
    fn parse_rejects_missing_void() {
        let log = parse_entries("__kernel int bad(int x) {}").unwrap_err();
        assert!(log.contains("expected 'void'"));
    }

    #[test]
    fn parse_rejects_unterminated_params() {
        let log = parse_entries("__kernel void bad(int x").unwrap_err();
        assert!(log.contains("unterminated parameter list"));
    }

    #[test]
    fn default_topology_is_one_cpu_platform() {
        let driver = HostDriver::new();
        let platforms = driver.platforms().unwrap();
        assert_eq!(platforms.len(), 1);
        let devices = driver.devices(platforms[0]).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(driver.device_kind(devices[0]).unwrap(), DeviceKind::Cpu);
    }

    #[test]
    fn context_respects_selector() {
        let driver = HostDriver::with_topology(vec![PlatformSpec::new("mixed")
            .device(DeviceSpec::new("cpu0", DeviceKind::Cpu))
            .device(DeviceSpec::new("gpu0", DeviceKind::Gpu))]);
        let platform = driver.platforms().unwrap()[0];

        let ctx = driver.create_context(platform, DeviceKind::Gpu).unwrap();
        let devices = driver.context_devices(ctx).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(driver.device_kind(devices[0]).unwrap(), DeviceKind::Gpu);

        let err = driver.create_context(platform, DeviceKind::Accelerator);
        assert!(err.is_err());
    }

    #[test]
    fn release_accounting() {
        let driver = HostDriver::new();
        let platform = driver.platforms().unwrap()[0];
        let ctx = driver.create_context(platform, DeviceKind::All).unwrap();
        assert_eq!(driver.live(ObjectKind::Context), 1);

        driver.release_context(ctx).unwrap();
        assert_eq!(driver.live(ObjectKind::Context), 0);
        assert_eq!(driver.releases(ObjectKind::Context), 1);

        // A second raw release of the same handle is a driver error; the
        // owning wrappers never issue it.
        assert!(driver.release_context(ctx).is_err());
        assert_eq!(driver.releases(ObjectKind::Context), 1);
    }

    #[test]
    fn queue_membership_checked() {
        let driver = HostDriver::with_topology(vec![
            PlatformSpec::new("a").device(DeviceSpec::new("cpu-a", DeviceKind::Cpu)),
            PlatformSpec::new("b").device(DeviceSpec::new("cpu-b", DeviceKind::Cpu)),
        ]);
        let platforms = driver.platforms().unwrap();
        let ctx = driver.create_context(platforms[0], DeviceKind::All).unwrap();
        let foreign = driver.devices(platforms[1]).unwrap()[0];
        assert!(driver.create_queue(ctx, foreign, QueueProps::default()).is_err());
    }
}
