//! In-process reference runtime.
//!
//! [`HostRuntime`] implements [`ComputeRuntime`] entirely on the host: the
//! platforms and devices it reports come from a [`HostConfig`], program
//! builds are checked by a small front end, and kernels execute through the
//! host implementations registered in a [`KernelLibrary`]. It follows the
//! OpenCL object model closely (reference counts, implicit parent retention,
//! in-order queues, events with profiling timestamps, status codes), so the
//! wrapper layer behaves the same on both runtimes.

mod compiler;
mod library;
mod state;

use std::fmt;

use parking_lot::Mutex;

pub use library::{HostArgs, HostKernel, KernelLibrary};

use self::compiler::{CompileError, ParamKind};
use self::state::{BuildRecord, HostPtr, HostState, LaunchArg, Outcome, Work};
use crate::error::KilnError;
use crate::runtime::types::{build_status, device_type, execution_status};
use crate::runtime::{
    ArgValue, BuildInfo, ComputeRuntime, DeviceInfo, EventInfo, KernelInfo, MemFlags, NdRange, PlatformInfo,
    ProfilingInfo, QueueProperties, RawHandle, ResourceKind, Status,
};

/// Prefix of the program binaries the host runtime accepts.
pub const BINARY_MAGIC: &[u8; 8] = b"KILNBIN\0";

/// Encode program source as a host runtime binary.
pub fn encode_binary(source: &str) -> Vec<u8> {
    let mut binary = Vec::with_capacity(BINARY_MAGIC.len() + source.len());
    binary.extend_from_slice(BINARY_MAGIC);
    binary.extend_from_slice(source.as_bytes());
    binary
}

fn decode_binary(binary: &[u8]) -> Option<&str> {
    binary.strip_prefix(BINARY_MAGIC.as_slice()).and_then(|rest| std::str::from_utf8(rest).ok())
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Properties reported by one simulated device.
#[derive(Debug, Clone)]
pub struct HostDeviceSpec {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub driver_version: String,
    pub device_type: u64,
    pub compute_units: u32,
    pub clock_mhz: u32,
    pub max_work_group_size: usize,
    pub max_work_item_sizes: Vec<usize>,
    pub global_mem_size: u64,
    pub max_mem_alloc_size: u64,
    pub local_mem_size: u64,
    pub extensions: String,
}

impl HostDeviceSpec {
    /// The host CPU, with one compute unit per rayon worker.
    pub fn cpu() -> Self {
        Self {
            name: "Kiln Host CPU".into(),
            vendor: "kiln".into(),
            version: "OpenCL 1.2 kiln-host".into(),
            driver_version: env!("CARGO_PKG_VERSION").into(),
            device_type: device_type::CPU,
            compute_units: rayon::current_num_threads() as u32,
            clock_mhz: 1000,
            max_work_group_size: 1024,
            max_work_item_sizes: vec![1024, 1024, 1024],
            global_mem_size: 1 << 30,
            max_mem_alloc_size: 256 << 20,
            local_mem_size: 32 << 10,
            extensions: "cl_khr_fp64 cl_khr_byte_addressable_store".into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::cpu() }
    }
}

impl Default for HostDeviceSpec {
    fn default() -> Self {
        Self::cpu()
    }
}

/// Properties and devices of one simulated platform.
#[derive(Debug, Clone)]
pub struct HostPlatformSpec {
    pub name: String,
    pub vendor: String,
    pub version: String,
    pub profile: String,
    pub extensions: String,
    pub devices: Vec<HostDeviceSpec>,
}

impl HostPlatformSpec {
    /// A platform with no devices.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vendor: "kiln".into(),
            version: "OpenCL 1.2 kiln-host".into(),
            profile: "FULL_PROFILE".into(),
            extensions: String::new(),
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: HostDeviceSpec) -> Self {
        self.devices.push(device);
        self
    }
}

impl Default for HostPlatformSpec {
    fn default() -> Self {
        Self::new("Kiln Host Platform").with_device(HostDeviceSpec::cpu())
    }
}

/// The platforms a [`HostRuntime`] reports.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub platforms: Vec<HostPlatformSpec>,
}

impl HostConfig {
    /// No platforms at all.
    pub fn empty() -> Self {
        Self { platforms: Vec::new() }
    }

    pub fn with_platform(mut self, platform: HostPlatformSpec) -> Self {
        self.platforms.push(platform);
        self
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::empty().with_platform(HostPlatformSpec::default())
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// The in-process runtime.
pub struct HostRuntime {
    config: HostConfig,
    library: KernelLibrary,
    state: Mutex<HostState>,
}

impl HostRuntime {
    /// # Panics
    /// Panics if `config` describes an unusable device; use
    /// [`HostRuntime::try_new`] to handle that as an error.
    pub fn new(config: HostConfig, library: KernelLibrary) -> Self {
        match Self::try_new(config, library) {
            Ok(rt) => rt,
            Err(e) => panic!("host runtime initialization failed: {}", e),
        }
    }

    /// Every device needs at least one work-item dimension and a non-zero
    /// work-group size.
    pub fn try_new(config: HostConfig, library: KernelLibrary) -> crate::error::Result<Self> {
        let init = |status| KilnError::resource("host runtime initialization", status);
        for spec in config.platforms.iter().flat_map(|p| p.devices.iter()) {
            if spec.max_work_item_sizes.is_empty() || spec.max_work_group_size == 0 {
                return Err(init(Status::INVALID_DEVICE));
            }
        }
        let layout: Vec<usize> = config.platforms.iter().map(|p| p.devices.len()).collect();
        let state = HostState::new(&layout).map_err(init)?;
        Ok(Self { config, library, state: Mutex::new(state) })
    }

    /// Default platform layout with the given kernels.
    pub fn with_library(library: KernelLibrary) -> Self {
        Self::new(HostConfig::default(), library)
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn library(&self) -> &KernelLibrary {
        &self.library
    }

    /// Current reference count of an object, `None` once it is destroyed.
    pub fn reference_count(&self, handle: RawHandle) -> Option<u32> {
        self.state.lock().reference_count(handle)
    }

    /// Number of objects other than platforms and devices still alive.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live_objects()
    }

    /// Number of release calls the runtime rejected.
    pub fn release_failures(&self) -> usize {
        self.state.lock().release_failures
    }

    /// Commands enqueued on `queue` that have not run yet.
    pub fn pending_commands(&self, queue: RawHandle) -> Option<usize> {
        self.state.lock().pending_commands(queue).ok()
    }

    fn platform_spec(&self, state: &HostState, platform: RawHandle) -> Outcome<&HostPlatformSpec> {
        let index = state.platform(platform)?.index;
        self.config.platforms.get(index).ok_or(Status::INVALID_PLATFORM)
    }

    fn device_spec(&self, state: &HostState, device: RawHandle) -> Outcome<&HostDeviceSpec> {
        let d = state.device(device)?;
        self.config
            .platforms
            .get(d.platform_index)
            .and_then(|p| p.devices.get(d.index))
            .ok_or(Status::INVALID_DEVICE)
    }

    /// Enqueue a transfer and, when blocking, run the queue up to it.
    fn transfer(
        state: &mut HostState,
        queue: RawHandle,
        work: Work,
        blocking: bool,
        wait: &[RawHandle],
    ) -> Outcome<RawHandle> {
        let event = state.enqueue(queue, work, wait)?;
        if blocking {
            if let Err(status) = state.drain(queue, Some(event)) {
                tracing::debug!("host: queue {} reported {} before blocking transfer", queue, status);
            }
            let status = state.event(event)?.status;
            if status < 0 {
                state.release(ResourceKind::Event, event)?;
                return Err(Status(status));
            }
        }
        Ok(event)
    }

    /// Check a memory object can be used on `queue` and that `[offset, offset
    /// + len)` lies inside it.
    fn check_transfer(
        state: &HostState,
        queue: RawHandle,
        memory: RawHandle,
        offset: usize,
        len: usize,
    ) -> Outcome<()> {
        let context = state.queue(queue)?.context;
        let mem = state.memory(memory)?;
        if mem.context != context {
            return Err(Status::INVALID_CONTEXT);
        }
        match offset.checked_add(len) {
            Some(end) if end <= mem.data.len() => Ok(()),
            _ => Err(Status::INVALID_VALUE),
        }
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new(HostConfig::default(), KernelLibrary::new())
    }
}

impl fmt::Debug for HostRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRuntime")
            .field("platforms", &self.config.platforms.len())
            .field("library", &self.library)
            .finish()
    }
}

/// Copy an info value into `out` (when given) and return its size.
fn write_info(out: Option<&mut [u8]>, bytes: &[u8]) -> Outcome<usize> {
    if let Some(out) = out {
        let dst = out.get_mut(..bytes.len()).ok_or(Status::INVALID_VALUE)?;
        dst.copy_from_slice(bytes);
    }
    Ok(bytes.len())
}

fn write_str(out: Option<&mut [u8]>, s: &str) -> Outcome<usize> {
    let mut bytes = Vec::with_capacity(s.len() + 1);
    bytes.extend_from_slice(s.as_bytes());
    bytes.push(0);
    write_info(out, &bytes)
}

fn validate_range(spec: &HostDeviceSpec, range: &NdRange) -> Outcome<()> {
    if range.global().iter().any(|&g| g == 0) {
        return Err(Status::INVALID_GLOBAL_WORK_SIZE);
    }
    if let Some(local) = range.local() {
        for (dim, (&l, &g)) in local.iter().zip(range.global()).enumerate() {
            let limit = spec.max_work_item_sizes.get(dim).copied().unwrap_or(1);
            if l == 0 || l > limit {
                return Err(Status::INVALID_WORK_ITEM_SIZE);
            }
            if g % l != 0 {
                return Err(Status::INVALID_WORK_GROUP_SIZE);
            }
        }
        if local.iter().product::<usize>() > spec.max_work_group_size {
            return Err(Status::INVALID_WORK_GROUP_SIZE);
        }
    }
    Ok(())
}

impl ComputeRuntime for HostRuntime {
    fn name(&self) -> &str {
        "host"
    }

    fn platform_ids(&self) -> Outcome<Vec<RawHandle>> {
        Ok(self.state.lock().platforms.clone())
    }

    fn platform_info(&self, platform: RawHandle, param: PlatformInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        let state = self.state.lock();
        let spec = self.platform_spec(&state, platform)?;
        let value = match param {
            PlatformInfo::Profile => &spec.profile,
            PlatformInfo::Version => &spec.version,
            PlatformInfo::Name => &spec.name,
            PlatformInfo::Vendor => &spec.vendor,
            PlatformInfo::Extensions => &spec.extensions,
        };
        write_str(out, value)
    }

    fn num_devices(&self, platform: RawHandle) -> Outcome<usize> {
        let state = self.state.lock();
        let index = state.platform(platform)?.index;
        Ok(state.devices.get(index).map_or(0, Vec::len))
    }

    fn device_ids(&self, platform: RawHandle) -> Outcome<Vec<RawHandle>> {
        let mut state = self.state.lock();
        let index = state.platform(platform)?.index;
        let devices = state.scan_devices(index)?;
        if devices.is_empty() {
            return Err(Status::DEVICE_NOT_FOUND);
        }
        Ok(devices)
    }

    fn device_info(&self, device: RawHandle, param: DeviceInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        let state = self.state.lock();
        let spec = self.device_spec(&state, device)?;
        match param {
            DeviceInfo::Type => write_info(out, bytemuck::bytes_of(&spec.device_type)),
            DeviceInfo::MaxComputeUnits => write_info(out, bytemuck::bytes_of(&spec.compute_units)),
            DeviceInfo::MaxWorkItemDimensions => {
                write_info(out, bytemuck::bytes_of(&(spec.max_work_item_sizes.len() as u32)))
            }
            DeviceInfo::MaxWorkGroupSize => write_info(out, bytemuck::bytes_of(&spec.max_work_group_size)),
            DeviceInfo::MaxWorkItemSizes => write_info(out, bytemuck::cast_slice(spec.max_work_item_sizes.as_slice())),
            DeviceInfo::MaxClockFrequency => write_info(out, bytemuck::bytes_of(&spec.clock_mhz)),
            DeviceInfo::MaxMemAllocSize => write_info(out, bytemuck::bytes_of(&spec.max_mem_alloc_size)),
            DeviceInfo::GlobalMemSize => write_info(out, bytemuck::bytes_of(&spec.global_mem_size)),
            DeviceInfo::LocalMemSize => write_info(out, bytemuck::bytes_of(&spec.local_mem_size)),
            DeviceInfo::Name => write_str(out, &spec.name),
            DeviceInfo::Vendor => write_str(out, &spec.vendor),
            DeviceInfo::DriverVersion => write_str(out, &spec.driver_version),
            DeviceInfo::Version => write_str(out, &spec.version),
            DeviceInfo::Extensions => write_str(out, &spec.extensions),
            DeviceInfo::Platform => {
                let platform = state.device(device)?.platform.as_usize();
                write_info(out, bytemuck::bytes_of(&platform))
            }
        }
    }

    fn retain(&self, kind: ResourceKind, handle: RawHandle) -> Outcome<()> {
        self.state.lock().retain(kind, handle)
    }

    fn release(&self, kind: ResourceKind, handle: RawHandle) -> Outcome<()> {
        let mut state = self.state.lock();
        let result = state.release(kind, handle);
        if result.is_err() {
            state.release_failures += 1;
        }
        result
    }

    fn create_context(&self, platform: RawHandle, device: RawHandle) -> Outcome<RawHandle> {
        self.state.lock().create_context(platform, device)
    }

    fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        properties: QueueProperties,
    ) -> Outcome<RawHandle> {
        let known = QueueProperties::OUT_OF_ORDER | QueueProperties::PROFILING;
        if properties.0 & !known.0 != 0 {
            return Err(Status::INVALID_QUEUE_PROPERTIES);
        }
        self.state.lock().create_queue(context, device, properties)
    }

    fn flush(&self, queue: RawHandle) -> Outcome<()> {
        // Commands are already submitted; they run on finish or wait.
        self.state.lock().queue(queue).map(|_| ())
    }

    fn finish(&self, queue: RawHandle) -> Outcome<()> {
        self.state.lock().drain(queue, None)
    }

    fn create_program_with_source(&self, context: RawHandle, source: &str) -> Outcome<RawHandle> {
        if source.is_empty() {
            return Err(Status::INVALID_VALUE);
        }
        self.state.lock().create_program(context, source.to_string())
    }

    fn create_program_with_binary(&self, context: RawHandle, device: RawHandle, binary: &[u8]) -> Outcome<RawHandle> {
        let mut state = self.state.lock();
        if state.context(context)?.device != device {
            return Err(Status::INVALID_DEVICE);
        }
        let source = decode_binary(binary).ok_or(Status::INVALID_BINARY)?;
        state.create_program(context, source.to_string())
    }

    fn build_program(&self, program: RawHandle, device: RawHandle, options: &str) -> Outcome<()> {
        let mut state = self.state.lock();
        let p = state.program(program)?;
        if p.device != device {
            return Err(Status::INVALID_DEVICE);
        }
        if p.attached > 0 {
            return Err(Status::INVALID_OPERATION);
        }

        let outcome = compiler::compile(&p.source, options, &self.library);
        let p = state.program_mut(program)?;
        let (status, log, result) = match outcome {
            Ok(compiled) => {
                p.kernels = compiled.kernels;
                (build_status::SUCCESS, compiled.log, Ok(()))
            }
            Err(CompileError::Options(message)) => {
                p.kernels.clear();
                (build_status::ERROR, message, Err(Status::INVALID_BUILD_OPTIONS))
            }
            Err(CompileError::Failed(log)) => {
                p.kernels.clear();
                (build_status::ERROR, log, Err(Status::BUILD_PROGRAM_FAILURE))
            }
        };
        p.build = Some(BuildRecord { status, options: options.to_string(), log });
        tracing::debug!("host: built program {} ({} kernels)", program, p.kernels.len());
        result
    }

    fn program_build_info(
        &self,
        program: RawHandle,
        device: RawHandle,
        param: BuildInfo,
        out: Option<&mut [u8]>,
    ) -> Outcome<usize> {
        let state = self.state.lock();
        let p = state.program(program)?;
        if p.device != device {
            return Err(Status::INVALID_DEVICE);
        }
        match (param, &p.build) {
            (BuildInfo::Status, Some(b)) => write_info(out, bytemuck::bytes_of(&b.status)),
            (BuildInfo::Status, None) => write_info(out, bytemuck::bytes_of(&build_status::NONE)),
            (BuildInfo::Options, Some(b)) => write_str(out, &b.options),
            (BuildInfo::Log, Some(b)) => write_str(out, &b.log),
            (BuildInfo::Options | BuildInfo::Log, None) => write_str(out, ""),
        }
    }

    fn create_kernel(&self, program: RawHandle, name: &str) -> Outcome<RawHandle> {
        let mut state = self.state.lock();
        let p = state.program(program)?;
        if !matches!(&p.build, Some(b) if b.status == build_status::SUCCESS) {
            return Err(Status::INVALID_PROGRAM_EXECUTABLE);
        }
        let decl = p.kernels.iter().find(|k| k.name == name).cloned().ok_or(Status::INVALID_KERNEL_NAME)?;
        let implementation = self.library.get(name).ok_or(Status::INVALID_KERNEL_NAME)?;
        state.create_kernel(program, decl, implementation)
    }

    fn kernel_info(&self, kernel: RawHandle, param: KernelInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        let state = self.state.lock();
        let k = state.kernel(kernel)?;
        match param {
            KernelInfo::FunctionName => write_str(out, &k.decl.name),
            KernelInfo::NumArgs => write_info(out, bytemuck::bytes_of(&(k.decl.params.len() as u32))),
        }
    }

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, value: ArgValue<'_>) -> Outcome<()> {
        let mut state = self.state.lock();
        let k = state.kernel(kernel)?;
        let param = k.decl.params.get(index as usize).ok_or(Status::INVALID_ARG_INDEX)?;
        let arg = match (param.kind, value) {
            (ParamKind::Global, ArgValue::Memory(memory)) => {
                state.memory(memory)?;
                LaunchArg::Memory(memory)
            }
            (ParamKind::Global, ArgValue::Bytes(_)) => return Err(Status::INVALID_MEM_OBJECT),
            (ParamKind::Local, ArgValue::Local(0)) => return Err(Status::INVALID_ARG_SIZE),
            (ParamKind::Local, ArgValue::Local(size)) => LaunchArg::Local(size),
            (ParamKind::Scalar(Some(size)), ArgValue::Bytes(bytes)) if size != bytes.len() => {
                return Err(Status::INVALID_ARG_SIZE)
            }
            (ParamKind::Scalar(_), ArgValue::Bytes(bytes)) => LaunchArg::Bytes(bytes.to_vec()),
            (ParamKind::Scalar(_), ArgValue::Memory(_)) => return Err(Status::INVALID_ARG_SIZE),
            (ParamKind::Global, ArgValue::Local(_))
            | (ParamKind::Local, _)
            | (ParamKind::Scalar(_), ArgValue::Local(_)) => return Err(Status::INVALID_ARG_VALUE),
        };
        tracing::trace!("host: kernel {} arg {} = {:?}", kernel, index, arg);
        state.kernel_mut(kernel)?.args[index as usize] = Some(arg);
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: RawHandle,
        kernel: RawHandle,
        range: &NdRange,
        wait: &[RawHandle],
    ) -> Outcome<RawHandle> {
        let mut state = self.state.lock();
        let q = state.queue(queue)?;
        let (context, device) = (q.context, q.device);
        let k = state.kernel(kernel)?;
        if state.program(k.program)?.context != context {
            return Err(Status::INVALID_CONTEXT);
        }

        let mut args = Vec::with_capacity(k.args.len());
        for arg in &k.args {
            let arg = arg.clone().ok_or(Status::INVALID_KERNEL_ARGS)?;
            if let LaunchArg::Memory(memory) = arg {
                let mem = state.memory(memory).map_err(|_| Status::INVALID_KERNEL_ARGS)?;
                if mem.context != context {
                    return Err(Status::INVALID_CONTEXT);
                }
            }
            args.push(arg);
        }
        validate_range(self.device_spec(&state, device)?, range)?;

        let work = Work::Launch {
            name: k.decl.name.clone(),
            implementation: k.implementation.clone(),
            args,
            range: *range,
        };
        state.enqueue(queue, work, wait)
    }

    fn create_buffer(&self, context: RawHandle, flags: MemFlags, size: usize) -> Outcome<RawHandle> {
        let mut state = self.state.lock();
        let device = state.context(context)?.device;
        let access = flags.0 & (MemFlags::READ_WRITE.0 | MemFlags::WRITE_ONLY.0 | MemFlags::READ_ONLY.0);
        if flags.0 != access || access.count_ones() > 1 {
            return Err(Status::INVALID_VALUE);
        }
        let limit = self.device_spec(&state, device)?.max_mem_alloc_size;
        if size == 0 || size as u64 > limit {
            return Err(Status::INVALID_BUFFER_SIZE);
        }
        state.create_memory(context, size)
    }

    unsafe fn enqueue_write_buffer(
        &self,
        queue: RawHandle,
        memory: RawHandle,
        blocking: bool,
        offset: usize,
        src: *const u8,
        len: usize,
        wait: &[RawHandle],
    ) -> Outcome<RawHandle> {
        if src.is_null() && len > 0 {
            return Err(Status::INVALID_VALUE);
        }
        let mut state = self.state.lock();
        Self::check_transfer(&state, queue, memory, offset, len)?;
        let data = if len == 0 { Vec::new() } else { std::slice::from_raw_parts(src, len).to_vec() };
        Self::transfer(&mut state, queue, Work::Write { memory, offset, data }, blocking, wait)
    }

    unsafe fn enqueue_read_buffer(
        &self,
        queue: RawHandle,
        memory: RawHandle,
        blocking: bool,
        offset: usize,
        dst: *mut u8,
        len: usize,
        wait: &[RawHandle],
    ) -> Outcome<RawHandle> {
        if dst.is_null() && len > 0 {
            return Err(Status::INVALID_VALUE);
        }
        let mut state = self.state.lock();
        Self::check_transfer(&state, queue, memory, offset, len)?;
        Self::transfer(&mut state, queue, Work::Read { memory, offset, dst: HostPtr(dst), len }, blocking, wait)
    }

    fn wait_for_events(&self, events: &[RawHandle]) -> Outcome<()> {
        self.state.lock().wait(events)
    }

    fn event_info(&self, event: RawHandle, param: EventInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        let state = self.state.lock();
        let e = state.event(event)?;
        match param {
            EventInfo::ExecutionStatus => write_info(out, bytemuck::bytes_of(&e.status)),
        }
    }

    fn event_profiling_info(&self, event: RawHandle, param: ProfilingInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        let state = self.state.lock();
        let e = state.event(event)?;
        if !e.profiling || e.status != execution_status::COMPLETE {
            return Err(Status::PROFILING_INFO_NOT_AVAILABLE);
        }
        let stamp = match param {
            ProfilingInfo::Queued => e.stamps[0],
            ProfilingInfo::Submit => e.stamps[1],
            ProfilingInfo::Start => e.stamps[2],
            ProfilingInfo::End => e.stamps[3],
        };
        write_info(out, bytemuck::bytes_of(&stamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCALE_SRC: &str =
        "__kernel void scale(const float factor, __global float* data) {\n    data[get_global_id(0)] *= factor;\n}\n";

    fn scale_library() -> KernelLibrary {
        KernelLibrary::new().with("scale", |range: &NdRange, args: &mut HostArgs<'_>| {
            let factor: f32 = args.scalar(0)?;
            let data: &mut [f32] = args.buffer(1)?;
            for x in data.iter_mut().take(range.global_items()) {
                *x *= factor;
            }
            Ok(())
        })
    }

    struct Fixture {
        rt: HostRuntime,
        device: RawHandle,
        context: RawHandle,
        queue: RawHandle,
    }

    fn fixture(library: KernelLibrary) -> Fixture {
        let rt = HostRuntime::with_library(library);
        let platform = rt.platform_ids().unwrap()[0];
        let device = rt.device_ids(platform).unwrap()[0];
        let context = rt.create_context(platform, device).unwrap();
        let queue = rt.create_command_queue(context, device, QueueProperties::PROFILING).unwrap();
        Fixture { rt, device, context, queue }
    }

    fn read_f32(rt: &HostRuntime, queue: RawHandle, memory: RawHandle, n: usize) -> Vec<f32> {
        let mut out = vec![0f32; n];
        let event = unsafe {
            rt.enqueue_read_buffer(queue, memory, true, 0, out.as_mut_ptr().cast(), n * 4, &[])
                .unwrap()
        };
        rt.release(ResourceKind::Event, event).unwrap();
        out
    }

    #[test]
    fn test_platform_and_device_info() {
        let f = fixture(KernelLibrary::new());
        let platform = f.rt.platform_ids().unwrap()[0];
        let size = f.rt.platform_info(platform, PlatformInfo::Name, None).unwrap();
        let mut buf = vec![0u8; size];
        f.rt.platform_info(platform, PlatformInfo::Name, Some(&mut buf)).unwrap();
        assert_eq!(&buf, b"Kiln Host Platform\0");

        let mut units = [0u8; 4];
        f.rt.device_info(f.device, DeviceInfo::MaxComputeUnits, Some(&mut units)).unwrap();
        assert!(u32::from_ne_bytes(units) >= 1);

        let mut short = [0u8; 2];
        assert_eq!(
            f.rt.device_info(f.device, DeviceInfo::MaxComputeUnits, Some(&mut short)),
            Err(Status::INVALID_VALUE)
        );
    }

    #[test]
    fn test_unusable_device_config() {
        let flat = HostDeviceSpec { max_work_item_sizes: Vec::new(), ..HostDeviceSpec::cpu() };
        let config = HostConfig::empty().with_platform(HostPlatformSpec::new("Flat").with_device(flat));
        let err = HostRuntime::try_new(config, KernelLibrary::new()).unwrap_err();
        assert!(matches!(err, KilnError::Resource { .. }));
        assert_eq!(err.status(), Some(Status::INVALID_DEVICE));

        let rt = HostRuntime::try_new(HostConfig::empty(), KernelLibrary::new()).unwrap();
        assert!(rt.platform_ids().unwrap().is_empty());
    }

    #[test]
    fn test_scanned_device_references() {
        let rt = HostRuntime::default();
        let platform = rt.platform_ids().unwrap()[0];
        let device = rt.device_ids(platform).unwrap()[0];
        assert_eq!(rt.reference_count(device), Some(2));
        rt.release(ResourceKind::Device, device).unwrap();
        assert_eq!(rt.reference_count(device), Some(1));
        assert_eq!(rt.release(ResourceKind::Device, device), Err(Status::INVALID_DEVICE));
        assert_eq!(rt.release_failures(), 1);
    }

    #[test]
    fn test_children_keep_parents_alive() {
        let f = fixture(KernelLibrary::new());
        assert_eq!(f.rt.reference_count(f.context), Some(2));
        let mem = f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 16).unwrap();
        f.rt.release(ResourceKind::Context, f.context).unwrap();
        assert_eq!(f.rt.reference_count(f.context), Some(2));

        f.rt.release(ResourceKind::Memory, mem).unwrap();
        f.rt.release(ResourceKind::CommandQueue, f.queue).unwrap();
        assert_eq!(f.rt.reference_count(f.context), None);
        assert_eq!(f.rt.live_objects(), 0);
    }

    #[test]
    fn test_build_and_dispatch() {
        let f = fixture(scale_library());
        let program = f.rt.create_program_with_source(f.context, SCALE_SRC).unwrap();
        f.rt.build_program(program, f.device, "").unwrap();
        let kernel = f.rt.create_kernel(program, "scale").unwrap();

        let data = [1.0f32, 2.0, 3.0, 4.0];
        let mem = f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 16).unwrap();
        let write = unsafe {
            f.rt.enqueue_write_buffer(f.queue, mem, false, 0, data.as_ptr().cast(), 16, &[]).unwrap()
        };
        f.rt.set_kernel_arg(kernel, 0, ArgValue::Bytes(&2.0f32.to_ne_bytes())).unwrap();
        f.rt.set_kernel_arg(kernel, 1, ArgValue::Memory(mem)).unwrap();
        let run = f.rt.enqueue_kernel(f.queue, kernel, &NdRange::d1(4), &[write]).unwrap();
        assert_eq!(f.rt.pending_commands(f.queue), Some(2));

        f.rt.wait_for_events(&[run]).unwrap();
        assert_eq!(f.rt.pending_commands(f.queue), Some(0));
        assert_eq!(read_f32(&f.rt, f.queue, mem, 4), vec![2.0, 4.0, 6.0, 8.0]);

        let mut start = [0u8; 8];
        let mut end = [0u8; 8];
        f.rt.event_profiling_info(run, ProfilingInfo::Start, Some(&mut start)).unwrap();
        f.rt.event_profiling_info(run, ProfilingInfo::End, Some(&mut end)).unwrap();
        assert!(u64::from_ne_bytes(end) >= u64::from_ne_bytes(start));
    }

    #[test]
    fn test_same_buffer_in_two_slots() {
        let lib = KernelLibrary::new().with("square", |range: &NdRange, args: &mut HostArgs<'_>| {
            let src: &mut [f32] = args.buffer(0)?;
            let n = range.global_items().min(src.len());
            match args.alias_of(1) {
                Some(0) => src[..n].iter_mut().for_each(|x| *x *= *x),
                Some(other) => return Err(format!("unexpected alias of {}", other)),
                None => {
                    let dst: &mut [f32] = args.buffer(1)?;
                    for i in 0..n {
                        dst[i] = src[i] * src[i];
                    }
                }
            }
            Ok(())
        });
        let f = fixture(lib);
        let src = "__kernel void square(__global const float* src, __global float* dst) {\n}\n";
        let program = f.rt.create_program_with_source(f.context, src).unwrap();
        f.rt.build_program(program, f.device, "").unwrap();
        let kernel = f.rt.create_kernel(program, "square").unwrap();

        let data = [1.0f32, 2.0, 3.0];
        let mem = f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 12).unwrap();
        let write = unsafe { f.rt.enqueue_write_buffer(f.queue, mem, true, 0, data.as_ptr().cast(), 12, &[]).unwrap() };
        f.rt.set_kernel_arg(kernel, 0, ArgValue::Memory(mem)).unwrap();
        f.rt.set_kernel_arg(kernel, 1, ArgValue::Memory(mem)).unwrap();
        let run = f.rt.enqueue_kernel(f.queue, kernel, &NdRange::d1(3), &[write]).unwrap();
        f.rt.wait_for_events(&[run]).unwrap();
        assert_eq!(read_f32(&f.rt, f.queue, mem, 3), vec![1.0, 4.0, 9.0]);
    }

    #[test]
    fn test_argument_validation() {
        let f = fixture(scale_library());
        let program = f.rt.create_program_with_source(f.context, SCALE_SRC).unwrap();
        assert_eq!(f.rt.create_kernel(program, "scale"), Err(Status::INVALID_PROGRAM_EXECUTABLE));
        f.rt.build_program(program, f.device, "").unwrap();
        assert_eq!(f.rt.create_kernel(program, "nope"), Err(Status::INVALID_KERNEL_NAME));
        let kernel = f.rt.create_kernel(program, "scale").unwrap();

        assert_eq!(f.rt.set_kernel_arg(kernel, 2, ArgValue::Local(4)), Err(Status::INVALID_ARG_INDEX));
        assert_eq!(f.rt.set_kernel_arg(kernel, 0, ArgValue::Bytes(&[0u8; 8])), Err(Status::INVALID_ARG_SIZE));
        assert_eq!(
            f.rt.set_kernel_arg(kernel, 1, ArgValue::Bytes(&[0u8; 4])),
            Err(Status::INVALID_MEM_OBJECT)
        );
        assert_eq!(
            f.rt.enqueue_kernel(f.queue, kernel, &NdRange::d1(4), &[]),
            Err(Status::INVALID_KERNEL_ARGS)
        );
        assert_eq!(f.rt.build_program(program, f.device, ""), Err(Status::INVALID_OPERATION));
    }

    #[test]
    fn test_work_group_validation() {
        let spec =
            HostDeviceSpec { max_work_group_size: 16, max_work_item_sizes: vec![8, 8, 8], ..HostDeviceSpec::cpu() };
        assert!(validate_range(&spec, &NdRange::d2(8, 8).with_local([2, 2, 1])).is_ok());
        assert_eq!(validate_range(&spec, &NdRange::d1(0)), Err(Status::INVALID_GLOBAL_WORK_SIZE));
        assert_eq!(
            validate_range(&spec, &NdRange::d2(8, 8).with_local([3, 2, 1])),
            Err(Status::INVALID_WORK_GROUP_SIZE)
        );
        assert_eq!(
            validate_range(&spec, &NdRange::d1(32).with_local([16, 1, 1])),
            Err(Status::INVALID_WORK_ITEM_SIZE)
        );
        assert_eq!(
            validate_range(&spec, &NdRange::d2(8, 8).with_local([8, 8, 1])),
            Err(Status::INVALID_WORK_GROUP_SIZE)
        );
    }

    #[test]
    fn test_failed_build_log() {
        let f = fixture(scale_library());
        let program = f.rt.create_program_with_source(f.context, "__kernel void scale(").unwrap();
        assert_eq!(f.rt.build_program(program, f.device, ""), Err(Status::BUILD_PROGRAM_FAILURE));

        let mut status = [0u8; 4];
        f.rt.program_build_info(program, f.device, BuildInfo::Status, Some(&mut status)).unwrap();
        assert_eq!(i32::from_ne_bytes(status), build_status::ERROR);

        let size = f.rt.program_build_info(program, f.device, BuildInfo::Log, None).unwrap();
        let mut log = vec![0u8; size];
        f.rt.program_build_info(program, f.device, BuildInfo::Log, Some(&mut log)).unwrap();
        let log = String::from_utf8_lossy(&log[..size - 1]).into_owned();
        assert!(log.contains("error: expected ')'"), "{}", log);

        assert_eq!(
            f.rt.build_program(program, f.device, "--bogus"),
            Err(Status::INVALID_BUILD_OPTIONS)
        );
    }

    #[test]
    fn test_binary_programs() {
        let f = fixture(scale_library());
        let program = f.rt.create_program_with_binary(f.context, f.device, &encode_binary(SCALE_SRC)).unwrap();
        f.rt.build_program(program, f.device, "").unwrap();
        assert_eq!(
            f.rt.create_program_with_binary(f.context, f.device, b"\x7fELF"),
            Err(Status::INVALID_BINARY)
        );
    }

    #[test]
    fn test_failed_kernel_poisons_dependents() {
        let lib = KernelLibrary::new().with("boom", |_: &NdRange, _: &mut HostArgs<'_>| Err("boom".to_string()));
        let f = fixture(lib);
        let program = f.rt.create_program_with_source(f.context, "__kernel void boom() {}").unwrap();
        f.rt.build_program(program, f.device, "").unwrap();
        let kernel = f.rt.create_kernel(program, "boom").unwrap();
        let first = f.rt.enqueue_kernel(f.queue, kernel, &NdRange::d1(1), &[]).unwrap();
        let second = f.rt.enqueue_kernel(f.queue, kernel, &NdRange::d1(1), &[first]).unwrap();

        assert_eq!(f.rt.finish(f.queue), Err(Status::OUT_OF_RESOURCES));
        let mut status = [0u8; 4];
        f.rt.event_info(second, EventInfo::ExecutionStatus, Some(&mut status)).unwrap();
        assert_eq!(i32::from_ne_bytes(status), Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST.0);
        assert_eq!(
            f.rt.wait_for_events(&[first]),
            Err(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST)
        );
    }

    #[test]
    fn test_transfer_bounds() {
        let f = fixture(KernelLibrary::new());
        let mem = f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 8).unwrap();
        let src = [0u8; 8];
        let result = unsafe { f.rt.enqueue_write_buffer(f.queue, mem, true, 4, src.as_ptr(), 8, &[]) };
        assert_eq!(result, Err(Status::INVALID_VALUE));
        assert_eq!(f.rt.create_buffer(f.context, MemFlags::READ_WRITE, 0), Err(Status::INVALID_BUFFER_SIZE));
        assert_eq!(
            f.rt.create_buffer(f.context, MemFlags(MemFlags::READ_ONLY.0 | MemFlags::WRITE_ONLY.0), 8),
            Err(Status::INVALID_VALUE)
        );
    }
}
