//! Object table and command execution of the host runtime.
//!
//! Every object lives in one table keyed by its handle. Child objects hold a
//! reference on their parent (context → device, queue/program/memory →
//! context, kernel → program) that is dropped when the child is destroyed.
//!
//! Queues are in-order and deferred: commands run when the queue is
//! finished, when a blocking transfer or an event wait needs them, or when the
//! queue itself is destroyed.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use super::compiler::KernelDecl;
use super::library::{DeviceMemory, HostArgs, HostKernel};
use crate::runtime::types::execution_status;
use crate::runtime::{NdRange, QueueProperties, RawHandle, ResourceKind, Status};

pub(super) type Outcome<T> = std::result::Result<T, Status>;

pub(super) struct PlatformState {
    pub(super) index: usize,
}

pub(super) struct DeviceState {
    pub(super) platform: RawHandle,
    pub(super) platform_index: usize,
    pub(super) index: usize,
}

pub(super) struct ContextState {
    pub(super) device: RawHandle,
}

pub(super) struct QueueState {
    pub(super) context: RawHandle,
    pub(super) device: RawHandle,
    pub(super) properties: QueueProperties,
    pending: VecDeque<Command>,
}

pub(super) struct BuildRecord {
    pub(super) status: i32,
    pub(super) options: String,
    pub(super) log: String,
}

pub(super) struct ProgramState {
    pub(super) context: RawHandle,
    pub(super) device: RawHandle,
    pub(super) source: String,
    pub(super) build: Option<BuildRecord>,
    pub(super) kernels: Vec<KernelDecl>,
    /// Kernel objects created from this program and still alive.
    pub(super) attached: usize,
}

pub(super) struct KernelState {
    pub(super) program: RawHandle,
    pub(super) decl: KernelDecl,
    pub(super) implementation: Arc<dyn HostKernel>,
    pub(super) args: Vec<Option<LaunchArg>>,
}

pub(super) struct MemoryState {
    pub(super) context: RawHandle,
    pub(super) data: DeviceMemory,
}

pub(super) struct EventState {
    pub(super) queue: RawHandle,
    pub(super) profiling: bool,
    pub(super) status: i32,
    /// Queued, submit, start and end times in nanoseconds.
    pub(super) stamps: [u64; 4],
}

enum Body {
    Platform(PlatformState),
    Device(DeviceState),
    Context(ContextState),
    Queue(QueueState),
    Program(ProgramState),
    Kernel(KernelState),
    Memory(MemoryState),
    Event(EventState),
}

impl Body {
    fn kind(&self) -> ResourceKind {
        match self {
            Body::Platform(_) => ResourceKind::Platform,
            Body::Device(_) => ResourceKind::Device,
            Body::Context(_) => ResourceKind::Context,
            Body::Queue(_) => ResourceKind::CommandQueue,
            Body::Program(_) => ResourceKind::Program,
            Body::Kernel(_) => ResourceKind::Kernel,
            Body::Memory(_) => ResourceKind::Memory,
            Body::Event(_) => ResourceKind::Event,
        }
    }
}

struct Object {
    refs: u32,
    body: Body,
}

/// A kernel argument as captured when it was set.
#[derive(Debug, Clone)]
pub(super) enum LaunchArg {
    Bytes(Vec<u8>),
    Memory(RawHandle),
    Local(usize),
}

/// Destination of a deferred read.
pub(super) struct HostPtr(pub(super) *mut u8);

// The enqueue contract makes the pointer valid until the command completes,
// and commands only run while the state lock is held.
unsafe impl Send for HostPtr {}

pub(super) enum Work {
    Write { memory: RawHandle, offset: usize, data: Vec<u8> },
    Read { memory: RawHandle, offset: usize, dst: HostPtr, len: usize },
    Launch { name: String, implementation: Arc<dyn HostKernel>, args: Vec<LaunchArg>, range: NdRange },
}

impl Work {
    fn memories(&self) -> Vec<RawHandle> {
        match self {
            Work::Write { memory, .. } | Work::Read { memory, .. } => vec![*memory],
            Work::Launch { args, .. } => args
                .iter()
                .filter_map(|a| match a {
                    LaunchArg::Memory(m) => Some(*m),
                    _ => None,
                })
                .collect(),
        }
    }
}

struct Command {
    work: Work,
    wait: Vec<RawHandle>,
    event: RawHandle,
}

macro_rules! accessors {
    ($($get:ident, $get_mut:ident => $variant:ident($ty:ty), $kind:ident;)*) => {
        $(
            pub(super) fn $get(&self, handle: RawHandle) -> Outcome<&$ty> {
                match self.objects.get(&handle).map(|o| &o.body) {
                    Some(Body::$variant(state)) => Ok(state),
                    _ => Err(ResourceKind::$kind.invalid_status()),
                }
            }

            #[allow(dead_code)]
            pub(super) fn $get_mut(&mut self, handle: RawHandle) -> Outcome<&mut $ty> {
                match self.objects.get_mut(&handle).map(|o| &mut o.body) {
                    Some(Body::$variant(state)) => Ok(state),
                    _ => Err(ResourceKind::$kind.invalid_status()),
                }
            }
        )*
    };
}

pub(super) struct HostState {
    next: NonZeroUsize,
    objects: HashMap<RawHandle, Object>,
    pub(super) platforms: Vec<RawHandle>,
    pub(super) devices: Vec<Vec<RawHandle>>,
    pub(super) release_failures: usize,
    epoch: Instant,
}

impl HostState {
    /// Create platform and device objects; `layout[p]` is the device count of
    /// platform `p`.
    pub(super) fn new(layout: &[usize]) -> Outcome<Self> {
        let mut state = HostState {
            next: NonZeroUsize::MIN,
            objects: HashMap::new(),
            platforms: Vec::with_capacity(layout.len()),
            devices: Vec::with_capacity(layout.len()),
            release_failures: 0,
            epoch: Instant::now(),
        };
        for (p, &count) in layout.iter().enumerate() {
            let platform = state.insert(Body::Platform(PlatformState { index: p }))?;
            let mut devices = Vec::with_capacity(count);
            for d in 0..count {
                devices.push(state.insert(Body::Device(DeviceState { platform, platform_index: p, index: d }))?);
            }
            state.platforms.push(platform);
            state.devices.push(devices);
        }
        Ok(state)
    }

    accessors! {
        platform, platform_mut => Platform(PlatformState), Platform;
        device, device_mut => Device(DeviceState), Device;
        context, context_mut => Context(ContextState), Context;
        queue, queue_mut => Queue(QueueState), CommandQueue;
        program, program_mut => Program(ProgramState), Program;
        kernel, kernel_mut => Kernel(KernelState), Kernel;
        memory, memory_mut => Memory(MemoryState), Memory;
        event, event_mut => Event(EventState), Event;
    }

    pub(super) fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn insert(&mut self, body: Body) -> Outcome<RawHandle> {
        let id = self.next;
        self.next = id.checked_add(1).ok_or(Status::OUT_OF_HOST_MEMORY)?;
        let handle = RawHandle::new(id);
        self.objects.insert(handle, Object { refs: 1, body });
        Ok(handle)
    }

    pub(super) fn reference_count(&self, handle: RawHandle) -> Option<u32> {
        self.objects.get(&handle).map(|o| o.refs)
    }

    /// Objects other than platforms and devices.
    pub(super) fn live_objects(&self) -> usize {
        self.objects
            .values()
            .filter(|o| !matches!(o.body, Body::Platform(_) | Body::Device(_)))
            .count()
    }

    pub(super) fn pending_commands(&self, queue: RawHandle) -> Outcome<usize> {
        Ok(self.queue(queue)?.pending.len())
    }

    // -- reference counting -------------------------------------------------

    fn checked(&mut self, kind: ResourceKind, handle: RawHandle) -> Outcome<&mut Object> {
        self.objects
            .get_mut(&handle)
            .filter(|o| o.body.kind() == kind)
            .ok_or_else(|| kind.invalid_status())
    }

    pub(super) fn retain(&mut self, kind: ResourceKind, handle: RawHandle) -> Outcome<()> {
        let object = self.checked(kind, handle)?;
        if kind != ResourceKind::Platform {
            object.refs += 1;
        }
        Ok(())
    }

    pub(super) fn release(&mut self, kind: ResourceKind, handle: RawHandle) -> Outcome<()> {
        self.checked(kind, handle)?;
        self.unref(handle)
    }

    /// Drop one reference. Root devices keep a permanent base reference and
    /// platforms are not counted.
    fn unref(&mut self, handle: RawHandle) -> Outcome<()> {
        let object = self.objects.get_mut(&handle).ok_or(Status::INVALID_VALUE)?;
        match object.body {
            Body::Platform(_) => return Ok(()),
            Body::Device(_) if object.refs <= 1 => return Err(Status::INVALID_DEVICE),
            _ => {}
        }
        object.refs -= 1;
        if object.refs == 0 {
            self.destroy(handle)?;
        }
        Ok(())
    }

    fn destroy(&mut self, handle: RawHandle) -> Outcome<()> {
        if matches!(self.objects.get(&handle).map(|o| &o.body), Some(Body::Queue(_))) {
            if let Err(status) = self.drain(handle, None) {
                tracing::warn!("commands failed while releasing queue {}: {}", handle, status);
            }
        }
        let Some(object) = self.objects.remove(&handle) else {
            return Ok(());
        };
        tracing::trace!("host: destroyed {} {}", object.body.kind(), handle);
        match object.body {
            Body::Context(c) => self.unref(c.device),
            Body::Queue(q) => self.unref(q.context),
            Body::Program(p) => self.unref(p.context),
            Body::Memory(m) => self.unref(m.context),
            Body::Kernel(k) => {
                if let Ok(program) = self.program_mut(k.program) {
                    program.attached -= 1;
                }
                self.unref(k.program)
            }
            Body::Platform(_) | Body::Device(_) | Body::Event(_) => Ok(()),
        }
    }

    // -- creation -------------------------------------------------------------

    /// Hand out one more reference to each device of a platform.
    pub(super) fn scan_devices(&mut self, platform: usize) -> Outcome<Vec<RawHandle>> {
        let devices = self.devices.get(platform).cloned().unwrap_or_default();
        for &device in &devices {
            self.retain(ResourceKind::Device, device)?;
        }
        Ok(devices)
    }

    pub(super) fn create_context(&mut self, platform: RawHandle, device: RawHandle) -> Outcome<RawHandle> {
        self.platform(platform)?;
        if self.device(device)?.platform != platform {
            return Err(Status::INVALID_DEVICE);
        }
        self.retain(ResourceKind::Device, device)?;
        self.insert(Body::Context(ContextState { device }))
    }

    pub(super) fn create_queue(
        &mut self,
        context: RawHandle,
        device: RawHandle,
        properties: QueueProperties,
    ) -> Outcome<RawHandle> {
        if self.context(context)?.device != device {
            return Err(Status::INVALID_DEVICE);
        }
        self.retain(ResourceKind::Context, context)?;
        self.insert(Body::Queue(QueueState { context, device, properties, pending: VecDeque::new() }))
    }

    pub(super) fn create_program(&mut self, context: RawHandle, source: String) -> Outcome<RawHandle> {
        let device = self.context(context)?.device;
        self.retain(ResourceKind::Context, context)?;
        self.insert(Body::Program(ProgramState {
            context,
            device,
            source,
            build: None,
            kernels: Vec::new(),
            attached: 0,
        }))
    }

    pub(super) fn create_kernel(
        &mut self,
        program: RawHandle,
        decl: KernelDecl,
        implementation: Arc<dyn HostKernel>,
    ) -> Outcome<RawHandle> {
        self.retain(ResourceKind::Program, program)?;
        self.program_mut(program)?.attached += 1;
        let args = vec![None; decl.params.len()];
        self.insert(Body::Kernel(KernelState { program, decl, implementation, args }))
    }

    pub(super) fn create_memory(&mut self, context: RawHandle, size: usize) -> Outcome<RawHandle> {
        self.retain(ResourceKind::Context, context)?;
        self.insert(Body::Memory(MemoryState { context, data: DeviceMemory::zeroed(size) }))
    }

    // -- commands -------------------------------------------------------------

    /// Append a command to `queue` and return its event.
    ///
    /// The memory objects the command touches and the events it waits on are
    /// retained until it has run.
    pub(super) fn enqueue(&mut self, queue: RawHandle, work: Work, wait: &[RawHandle]) -> Outcome<RawHandle> {
        let profiling = self.queue(queue)?.properties.contains(QueueProperties::PROFILING);
        for &event in wait {
            self.event(event).map_err(|_| Status::INVALID_EVENT_WAIT_LIST)?;
        }
        for &event in wait {
            self.retain(ResourceKind::Event, event)?;
        }
        for memory in work.memories() {
            self.retain(ResourceKind::Memory, memory)?;
        }
        let queued = self.now();
        let event = self.insert(Body::Event(EventState {
            queue,
            profiling,
            status: execution_status::QUEUED,
            stamps: [queued, 0, 0, 0],
        }))?;
        self.queue_mut(queue)?
            .pending
            .push_back(Command { work, wait: wait.to_vec(), event });
        Ok(event)
    }

    /// Run commands of `queue` in order until `until` has completed, or
    /// until the queue is empty. Returns the first command failure.
    pub(super) fn drain(&mut self, queue: RawHandle, until: Option<RawHandle>) -> Outcome<()> {
        let mut first_failure = None;
        loop {
            if let Some(event) = until {
                if self.event(event).map_or(true, |e| e.status != execution_status::QUEUED) {
                    break;
                }
            }
            let Some(command) = self.queue_mut(queue)?.pending.pop_front() else {
                break;
            };
            if let Err(status) = self.execute(command) {
                first_failure.get_or_insert(status);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Block until every event has completed.
    pub(super) fn wait(&mut self, events: &[RawHandle]) -> Outcome<()> {
        if events.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        for &event in events {
            self.event(event)?;
        }
        let mut failed = false;
        for &event in events {
            failed |= self.settle(event) < 0;
        }
        if failed {
            Err(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
        } else {
            Ok(())
        }
    }

    /// Run whatever `event` depends on and return its final status.
    fn settle(&mut self, event: RawHandle) -> i32 {
        let Ok(&EventState { queue, status, .. }) = self.event(event) else {
            return execution_status::COMPLETE;
        };
        if status != execution_status::QUEUED {
            return status;
        }
        if let Err(status) = self.drain(queue, Some(event)) {
            tracing::debug!("host: queue {} reported {} while settling {}", queue, status, event);
        }
        self.event(event).map_or(execution_status::COMPLETE, |e| e.status)
    }

    fn execute(&mut self, command: Command) -> Outcome<()> {
        let Command { work, wait, event } = command;

        let mut result = Ok(());
        for &dependency in &wait {
            if self.settle(dependency) < 0 {
                result = Err(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
            }
        }
        let start = self.now();
        if result.is_ok() {
            result = self.run(&work);
        }
        let end = self.now();

        if let Ok(state) = self.event_mut(event) {
            state.status = match result {
                Ok(()) => execution_status::COMPLETE,
                Err(status) => status.0,
            };
            state.stamps[1] = start;
            state.stamps[2] = start;
            state.stamps[3] = end;
        }
        for memory in work.memories() {
            self.unref(memory)?;
        }
        for dependency in wait {
            self.unref(dependency)?;
        }
        result
    }

    fn run(&mut self, work: &Work) -> Outcome<()> {
        match work {
            Work::Write { memory, offset, data } => {
                let bytes = self.memory_mut(*memory)?.data.as_bytes_mut();
                bytes
                    .get_mut(*offset..*offset + data.len())
                    .ok_or(Status::INVALID_VALUE)?
                    .copy_from_slice(data);
                Ok(())
            }
            Work::Read { memory, offset, dst, len } => {
                let bytes = self.memory(*memory)?.data.as_bytes();
                let src = bytes.get(*offset..*offset + *len).ok_or(Status::INVALID_VALUE)?;
                // SAFETY: the caller of the enqueue guaranteed `dst` valid for
                // `len` bytes of writes until this command completes.
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst.0, *len) };
                Ok(())
            }
            Work::Launch { name, implementation, args, range } => {
                self.launch(name, implementation.as_ref(), args, range)
            }
        }
    }

    fn launch(&mut self, name: &str, kernel: &dyn HostKernel, args: &[LaunchArg], range: &NdRange) -> Outcome<()> {
        // Move each bound memory object out of the table for the duration of
        // the call. A buffer bound to several arguments is handed out through
        // the first of them; the later slots name that one.
        let mut first_slot: HashMap<RawHandle, usize> = HashMap::new();
        let mut taken: Vec<Option<(RawHandle, DeviceMemory)>> = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            match arg {
                LaunchArg::Memory(m) if !first_slot.contains_key(m) => {
                    first_slot.insert(*m, index);
                    let state = self.memory_mut(*m)?;
                    taken.push(Some((*m, std::mem::replace(&mut state.data, DeviceMemory::zeroed(0)))));
                }
                _ => taken.push(None),
            }
        }

        let result = {
            let mut host_args = HostArgs::new();
            for (index, (arg, slot)) in args.iter().zip(taken.iter_mut()).enumerate() {
                match (arg, slot) {
                    (LaunchArg::Bytes(bytes), _) => host_args.push_scalar(bytes),
                    (LaunchArg::Local(size), _) => host_args.push_local(*size),
                    (LaunchArg::Memory(_), Some((_, data))) => host_args.push_memory(data.as_bytes_mut()),
                    (LaunchArg::Memory(m), None) => host_args.push_alias(first_slot.get(m).copied().unwrap_or(index)),
                }
            }
            kernel.execute(range, &mut host_args)
        };

        for (handle, data) in taken.into_iter().flatten() {
            if let Ok(state) = self.memory_mut(handle) {
                state.data = data;
            }
        }
        result.map_err(|message| {
            tracing::error!("host kernel '{}' failed over {}: {}", name, range, message);
            Status::OUT_OF_RESOURCES
        })
    }
}
