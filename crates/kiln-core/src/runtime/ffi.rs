//! Runtime-loaded OpenCL entry points via dlopen.
//!
//! Binding the ICD loader at run time keeps OpenCL out of the build: any
//! install that provides the loader library works, and machines without one
//! still run through the host runtime.

use std::ffi::{c_char, c_void};
use std::sync::OnceLock;

use libloading::Library;

pub type ClInt = i32;
pub type ClUint = u32;
pub type ClBool = u32;
pub type ClBitfield = u64;

pub const CL_TRUE: ClBool = 1;
pub const CL_FALSE: ClBool = 0;

// Opaque handles
pub type ClPlatformId = *mut c_void;
pub type ClDeviceId = *mut c_void;
pub type ClContext = *mut c_void;
pub type ClCommandQueue = *mut c_void;
pub type ClProgram = *mut c_void;
pub type ClKernel = *mut c_void;
pub type ClMem = *mut c_void;
pub type ClEvent = *mut c_void;

pub type ContextNotify = Option<unsafe extern "C" fn(*const c_char, *const c_void, usize, *mut c_void)>;
pub type BuildNotify = Option<unsafe extern "C" fn(ClProgram, *mut c_void)>;

/// Candidate loader names, tried in order.
pub const LOADER_NAMES: &[&str] = &[
    "libOpenCL.so.1",
    "libOpenCL.so",
    "OpenCL.dll",
    "/System/Library/Frameworks/OpenCL.framework/OpenCL",
];

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

type FnGetPlatformIds = unsafe extern "C" fn(ClUint, *mut ClPlatformId, *mut ClUint) -> ClInt;
type FnGetPlatformInfo = unsafe extern "C" fn(ClPlatformId, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type FnGetDeviceIds = unsafe extern "C" fn(ClPlatformId, ClBitfield, ClUint, *mut ClDeviceId, *mut ClUint) -> ClInt;
type FnGetDeviceInfo = unsafe extern "C" fn(ClDeviceId, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type FnRefcount = unsafe extern "C" fn(*mut c_void) -> ClInt;
type FnCreateContext = unsafe extern "C" fn(
    *const isize,       // properties
    ClUint,             // num_devices
    *const ClDeviceId,  // devices
    ContextNotify,
    *mut c_void,        // user data
    *mut ClInt,         // errcode
) -> ClContext;
type FnCreateCommandQueue = unsafe extern "C" fn(ClContext, ClDeviceId, ClBitfield, *mut ClInt) -> ClCommandQueue;
type FnQueueOp = unsafe extern "C" fn(ClCommandQueue) -> ClInt;
type FnCreateProgramWithSource = unsafe extern "C" fn(
    ClContext,
    ClUint,
    *const *const c_char,
    *const usize,
    *mut ClInt,
) -> ClProgram;
type FnCreateProgramWithBinary = unsafe extern "C" fn(
    ClContext,
    ClUint,
    *const ClDeviceId,
    *const usize,
    *const *const u8,
    *mut ClInt,         // per-device binary status
    *mut ClInt,         // errcode
) -> ClProgram;
type FnBuildProgram = unsafe extern "C" fn(
    ClProgram,
    ClUint,
    *const ClDeviceId,
    *const c_char,      // options
    BuildNotify,
    *mut c_void,
) -> ClInt;
type FnGetProgramBuildInfo =
    unsafe extern "C" fn(ClProgram, ClDeviceId, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type FnCreateKernel = unsafe extern "C" fn(ClProgram, *const c_char, *mut ClInt) -> ClKernel;
type FnGetKernelInfo = unsafe extern "C" fn(ClKernel, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type FnSetKernelArg = unsafe extern "C" fn(ClKernel, ClUint, usize, *const c_void) -> ClInt;
type FnEnqueueNdRangeKernel = unsafe extern "C" fn(
    ClCommandQueue,
    ClKernel,
    ClUint,             // work_dim
    *const usize,       // global offset
    *const usize,       // global size
    *const usize,       // local size (null = runtime choice)
    ClUint,
    *const ClEvent,
    *mut ClEvent,
) -> ClInt;
type FnCreateBuffer = unsafe extern "C" fn(ClContext, ClBitfield, usize, *mut c_void, *mut ClInt) -> ClMem;
type FnEnqueueWriteBuffer = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    ClBool,
    usize,              // offset
    usize,              // size
    *const c_void,
    ClUint,
    *const ClEvent,
    *mut ClEvent,
) -> ClInt;
type FnEnqueueReadBuffer = unsafe extern "C" fn(
    ClCommandQueue,
    ClMem,
    ClBool,
    usize,
    usize,
    *mut c_void,
    ClUint,
    *const ClEvent,
    *mut ClEvent,
) -> ClInt;
type FnWaitForEvents = unsafe extern "C" fn(ClUint, *const ClEvent) -> ClInt;
type FnGetEventInfo = unsafe extern "C" fn(ClEvent, ClUint, usize, *mut c_void, *mut usize) -> ClInt;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

pub struct ClApi {
    _lib: Library,
    pub loader: &'static str,
    pub get_platform_ids: FnGetPlatformIds,
    pub get_platform_info: FnGetPlatformInfo,
    pub get_device_ids: FnGetDeviceIds,
    pub get_device_info: FnGetDeviceInfo,
    /// OpenCL 1.2; absent from 1.1 loaders, where root devices are not counted.
    pub retain_device: Option<FnRefcount>,
    pub release_device: Option<FnRefcount>,
    pub create_context: FnCreateContext,
    pub retain_context: FnRefcount,
    pub release_context: FnRefcount,
    pub create_command_queue: FnCreateCommandQueue,
    pub retain_command_queue: FnRefcount,
    pub release_command_queue: FnRefcount,
    pub flush: FnQueueOp,
    pub finish: FnQueueOp,
    pub create_program_with_source: FnCreateProgramWithSource,
    pub create_program_with_binary: FnCreateProgramWithBinary,
    pub build_program: FnBuildProgram,
    pub get_program_build_info: FnGetProgramBuildInfo,
    pub retain_program: FnRefcount,
    pub release_program: FnRefcount,
    pub create_kernel: FnCreateKernel,
    pub get_kernel_info: FnGetKernelInfo,
    pub set_kernel_arg: FnSetKernelArg,
    pub retain_kernel: FnRefcount,
    pub release_kernel: FnRefcount,
    pub enqueue_nd_range_kernel: FnEnqueueNdRangeKernel,
    pub create_buffer: FnCreateBuffer,
    pub retain_mem_object: FnRefcount,
    pub release_mem_object: FnRefcount,
    pub enqueue_write_buffer: FnEnqueueWriteBuffer,
    pub enqueue_read_buffer: FnEnqueueReadBuffer,
    pub wait_for_events: FnWaitForEvents,
    pub get_event_info: FnGetEventInfo,
    pub get_event_profiling_info: FnGetEventInfo,
    pub retain_event: FnRefcount,
    pub release_event: FnRefcount,
}

// Safety: OpenCL API calls are thread-safe except clSetKernelArg on one
// cl_kernel. `Kernel` owns its cl_kernel alone (it is not `Clone`, and
// `Kernel::try_clone` creates a new object), so `&mut Kernel` serializes it.
unsafe impl Send for ClApi {}
unsafe impl Sync for ClApi {}

static CL_API: OnceLock<Option<ClApi>> = OnceLock::new();

impl ClApi {
    fn try_load() -> Option<Self> {
        LOADER_NAMES.iter().find_map(|&name| {
            let lib = unsafe { Library::new(name) }.ok()?;
            let api = unsafe { Self::bind(lib, name) };
            match &api {
                Some(_) => tracing::debug!("loaded OpenCL from {}", name),
                None => tracing::debug!("{} is missing required OpenCL 1.1 entry points", name),
            }
            api
        })
    }

    unsafe fn bind(lib: Library, loader: &'static str) -> Option<Self> {
        Some(ClApi {
            loader,
            get_platform_ids: *lib.get::<FnGetPlatformIds>(b"clGetPlatformIDs\0").ok()?,
            get_platform_info: *lib.get::<FnGetPlatformInfo>(b"clGetPlatformInfo\0").ok()?,
            get_device_ids: *lib.get::<FnGetDeviceIds>(b"clGetDeviceIDs\0").ok()?,
            get_device_info: *lib.get::<FnGetDeviceInfo>(b"clGetDeviceInfo\0").ok()?,
            retain_device: lib.get::<FnRefcount>(b"clRetainDevice\0").ok().map(|f| *f),
            release_device: lib.get::<FnRefcount>(b"clReleaseDevice\0").ok().map(|f| *f),
            create_context: *lib.get::<FnCreateContext>(b"clCreateContext\0").ok()?,
            retain_context: *lib.get::<FnRefcount>(b"clRetainContext\0").ok()?,
            release_context: *lib.get::<FnRefcount>(b"clReleaseContext\0").ok()?,
            create_command_queue: *lib.get::<FnCreateCommandQueue>(b"clCreateCommandQueue\0").ok()?,
            retain_command_queue: *lib.get::<FnRefcount>(b"clRetainCommandQueue\0").ok()?,
            release_command_queue: *lib.get::<FnRefcount>(b"clReleaseCommandQueue\0").ok()?,
            flush: *lib.get::<FnQueueOp>(b"clFlush\0").ok()?,
            finish: *lib.get::<FnQueueOp>(b"clFinish\0").ok()?,
            create_program_with_source: *lib.get::<FnCreateProgramWithSource>(b"clCreateProgramWithSource\0").ok()?,
            create_program_with_binary: *lib.get::<FnCreateProgramWithBinary>(b"clCreateProgramWithBinary\0").ok()?,
            build_program: *lib.get::<FnBuildProgram>(b"clBuildProgram\0").ok()?,
            get_program_build_info: *lib.get::<FnGetProgramBuildInfo>(b"clGetProgramBuildInfo\0").ok()?,
            retain_program: *lib.get::<FnRefcount>(b"clRetainProgram\0").ok()?,
            release_program: *lib.get::<FnRefcount>(b"clReleaseProgram\0").ok()?,
            create_kernel: *lib.get::<FnCreateKernel>(b"clCreateKernel\0").ok()?,
            get_kernel_info: *lib.get::<FnGetKernelInfo>(b"clGetKernelInfo\0").ok()?,
            set_kernel_arg: *lib.get::<FnSetKernelArg>(b"clSetKernelArg\0").ok()?,
            retain_kernel: *lib.get::<FnRefcount>(b"clRetainKernel\0").ok()?,
            release_kernel: *lib.get::<FnRefcount>(b"clReleaseKernel\0").ok()?,
            enqueue_nd_range_kernel: *lib.get::<FnEnqueueNdRangeKernel>(b"clEnqueueNDRangeKernel\0").ok()?,
            create_buffer: *lib.get::<FnCreateBuffer>(b"clCreateBuffer\0").ok()?,
            retain_mem_object: *lib.get::<FnRefcount>(b"clRetainMemObject\0").ok()?,
            release_mem_object: *lib.get::<FnRefcount>(b"clReleaseMemObject\0").ok()?,
            enqueue_write_buffer: *lib.get::<FnEnqueueWriteBuffer>(b"clEnqueueWriteBuffer\0").ok()?,
            enqueue_read_buffer: *lib.get::<FnEnqueueReadBuffer>(b"clEnqueueReadBuffer\0").ok()?,
            wait_for_events: *lib.get::<FnWaitForEvents>(b"clWaitForEvents\0").ok()?,
            get_event_info: *lib.get::<FnGetEventInfo>(b"clGetEventInfo\0").ok()?,
            get_event_profiling_info: *lib.get::<FnGetEventInfo>(b"clGetEventProfilingInfo\0").ok()?,
            retain_event: *lib.get::<FnRefcount>(b"clRetainEvent\0").ok()?,
            release_event: *lib.get::<FnRefcount>(b"clReleaseEvent\0").ok()?,
            _lib: lib,
        })
    }
}

/// The runtime-loaded OpenCL API, or `None` when no loader is installed.
pub fn cl_api() -> Option<&'static ClApi> {
    CL_API.get_or_init(ClApi::try_load).as_ref()
}

pub fn cl_bool(value: bool) -> ClBool {
    if value {
        CL_TRUE
    } else {
        CL_FALSE
    }
}
