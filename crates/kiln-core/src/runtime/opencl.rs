//! [`ComputeRuntime`] over a system OpenCL installation.

use std::ffi::{c_char, c_void, CString};
use std::fmt;
use std::ptr;

use super::ffi::{cl_api, cl_bool, ClApi, ClEvent, ClInt, ClMem, ClUint, LOADER_NAMES};
use super::types::device_type;
use super::{
    ArgValue, BuildInfo, ComputeRuntime, DeviceInfo, EventInfo, KernelInfo, MemFlags, NdRange, PlatformInfo,
    ProfilingInfo, QueueProperties, RawHandle, ResourceKind, Status,
};
use crate::error::{KilnError, Result};

type Outcome<T> = std::result::Result<T, Status>;

const CL_CONTEXT_PLATFORM: isize = 0x1084;

/// Runtime backed by the OpenCL ICD loader found at run time.
pub struct OpenClRuntime {
    api: &'static ClApi,
}

impl OpenClRuntime {
    /// Bind the system loader.
    pub fn load() -> Result<Self> {
        cl_api().map(|api| Self { api }).ok_or_else(|| {
            KilnError::RuntimeUnavailable(format!("no OpenCL loader found (tried {})", LOADER_NAMES.join(", ")))
        })
    }

    /// The loader library that was bound.
    pub fn loader(&self) -> &'static str {
        self.api.loader
    }
}

impl fmt::Debug for OpenClRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenClRuntime").field("loader", &self.api.loader).finish()
    }
}

/// Turn a create call's result into a handle.
fn created(raw: *mut c_void, code: ClInt) -> Outcome<RawHandle> {
    Status::check(code)?;
    RawHandle::from_ptr(raw).ok_or(Status::INVALID_VALUE)
}

/// Run a `clGet*Info` style call against `out`.
fn query(out: Option<&mut [u8]>, call: impl FnOnce(usize, *mut c_void, *mut usize) -> ClInt) -> Outcome<usize> {
    let mut size = 0usize;
    let (len, dst) = match out {
        Some(buf) => (buf.len(), buf.as_mut_ptr().cast::<c_void>()),
        None => (0, ptr::null_mut()),
    };
    Status::check(call(len, dst, &mut size))?;
    Ok(size)
}

fn event_list(wait: &[RawHandle]) -> Vec<ClEvent> {
    wait.iter().map(|e| e.as_ptr()).collect()
}

fn list_ptr(list: &[ClEvent]) -> (ClUint, *const ClEvent) {
    if list.is_empty() {
        (0, ptr::null())
    } else {
        (list.len() as ClUint, list.as_ptr())
    }
}

impl ComputeRuntime for OpenClRuntime {
    fn name(&self) -> &str {
        "opencl"
    }

    fn platform_ids(&self) -> Outcome<Vec<RawHandle>> {
        let mut count: ClUint = 0;
        let code = unsafe { (self.api.get_platform_ids)(0, ptr::null_mut(), &mut count) };
        if code == Status::PLATFORM_NOT_FOUND_KHR.0 || count == 0 {
            return Ok(Vec::new());
        }
        Status::check(code)?;

        let mut ids = vec![ptr::null_mut(); count as usize];
        Status::check(unsafe { (self.api.get_platform_ids)(count, ids.as_mut_ptr(), ptr::null_mut()) })?;
        Ok(ids.into_iter().filter_map(RawHandle::from_ptr).collect())
    }

    fn platform_info(&self, platform: RawHandle, param: PlatformInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        query(out, |len, dst, size| unsafe {
            (self.api.get_platform_info)(platform.as_ptr(), param.code(), len, dst, size)
        })
    }

    fn num_devices(&self, platform: RawHandle) -> Outcome<usize> {
        let mut count: ClUint = 0;
        let code =
            unsafe { (self.api.get_device_ids)(platform.as_ptr(), device_type::ALL, 0, ptr::null_mut(), &mut count) };
        if code == Status::DEVICE_NOT_FOUND.0 {
            return Ok(0);
        }
        Status::check(code)?;
        Ok(count as usize)
    }

    fn device_ids(&self, platform: RawHandle) -> Outcome<Vec<RawHandle>> {
        let count = self.num_devices(platform)?;
        if count == 0 {
            return Err(Status::DEVICE_NOT_FOUND);
        }
        let mut ids = vec![ptr::null_mut(); count];
        Status::check(unsafe {
            (self.api.get_device_ids)(
                platform.as_ptr(),
                device_type::ALL,
                count as ClUint,
                ids.as_mut_ptr(),
                ptr::null_mut(),
            )
        })?;
        let ids: Vec<RawHandle> = ids.into_iter().filter_map(RawHandle::from_ptr).collect();
        super::retain_all(
            &ids,
            |id| self.retain(ResourceKind::Device, id),
            |id| self.release(ResourceKind::Device, id),
        )?;
        Ok(ids)
    }

    fn device_info(&self, device: RawHandle, param: DeviceInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        query(out, |len, dst, size| unsafe {
            (self.api.get_device_info)(device.as_ptr(), param.code(), len, dst, size)
        })
    }

    fn retain(&self, kind: ResourceKind, handle: RawHandle) -> Outcome<()> {
        let f = match kind {
            ResourceKind::Platform => return Ok(()),
            ResourceKind::Device => match self.api.retain_device {
                Some(f) => f,
                None => return Ok(()),
            },
            ResourceKind::Context => self.api.retain_context,
            ResourceKind::CommandQueue => self.api.retain_command_queue,
            ResourceKind::Program => self.api.retain_program,
            ResourceKind::Kernel => self.api.retain_kernel,
            ResourceKind::Memory => self.api.retain_mem_object,
            ResourceKind::Event => self.api.retain_event,
        };
        Status::check(unsafe { f(handle.as_ptr()) })
    }

    fn release(&self, kind: ResourceKind, handle: RawHandle) -> Outcome<()> {
        let f = match kind {
            ResourceKind::Platform => return Ok(()),
            ResourceKind::Device => match self.api.release_device {
                Some(f) => f,
                None => return Ok(()),
            },
            ResourceKind::Context => self.api.release_context,
            ResourceKind::CommandQueue => self.api.release_command_queue,
            ResourceKind::Program => self.api.release_program,
            ResourceKind::Kernel => self.api.release_kernel,
            ResourceKind::Memory => self.api.release_mem_object,
            ResourceKind::Event => self.api.release_event,
        };
        Status::check(unsafe { f(handle.as_ptr()) })
    }

    fn create_context(&self, platform: RawHandle, device: RawHandle) -> Outcome<RawHandle> {
        let properties = [CL_CONTEXT_PLATFORM, platform.as_usize() as isize, 0];
        let devices = [device.as_ptr::<c_void>()];
        let mut code: ClInt = 0;
        let raw = unsafe {
            (self.api.create_context)(properties.as_ptr(), 1, devices.as_ptr(), None, ptr::null_mut(), &mut code)
        };
        created(raw, code)
    }

    fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        properties: QueueProperties,
    ) -> Outcome<RawHandle> {
        let mut code: ClInt = 0;
        let raw =
            unsafe { (self.api.create_command_queue)(context.as_ptr(), device.as_ptr(), properties.0, &mut code) };
        created(raw, code)
    }

    fn flush(&self, queue: RawHandle) -> Outcome<()> {
        Status::check(unsafe { (self.api.flush)(queue.as_ptr()) })
    }

    fn finish(&self, queue: RawHandle) -> Outcome<()> {
        Status::check(unsafe { (self.api.finish)(queue.as_ptr()) })
    }

    fn create_program_with_source(&self, context: RawHandle, source: &str) -> Outcome<RawHandle> {
        let strings = [source.as_ptr().cast::<c_char>()];
        let lengths = [source.len()];
        let mut code: ClInt = 0;
        let raw = unsafe {
            (self.api.create_program_with_source)(context.as_ptr(), 1, strings.as_ptr(), lengths.as_ptr(), &mut code)
        };
        created(raw, code)
    }

    fn create_program_with_binary(&self, context: RawHandle, device: RawHandle, binary: &[u8]) -> Outcome<RawHandle> {
        let devices = [device.as_ptr::<c_void>()];
        let lengths = [binary.len()];
        let binaries = [binary.as_ptr()];
        let mut binary_status: ClInt = 0;
        let mut code: ClInt = 0;
        let raw = unsafe {
            (self.api.create_program_with_binary)(
                context.as_ptr(),
                1,
                devices.as_ptr(),
                lengths.as_ptr(),
                binaries.as_ptr(),
                &mut binary_status,
                &mut code,
            )
        };
        let program = created(raw, code)?;
        if let Err(status) = Status::check(binary_status) {
            self.release(ResourceKind::Program, program)?;
            return Err(status);
        }
        Ok(program)
    }

    fn build_program(&self, program: RawHandle, device: RawHandle, options: &str) -> Outcome<()> {
        let options = CString::new(options).map_err(|_| Status::INVALID_BUILD_OPTIONS)?;
        let devices = [device.as_ptr::<c_void>()];
        Status::check(unsafe {
            (self.api.build_program)(program.as_ptr(), 1, devices.as_ptr(), options.as_ptr(), None, ptr::null_mut())
        })
    }

    fn program_build_info(
        &self,
        program: RawHandle,
        device: RawHandle,
        param: BuildInfo,
        out: Option<&mut [u8]>,
    ) -> Outcome<usize> {
        query(out, |len, dst, size| unsafe {
            (self.api.get_program_build_info)(program.as_ptr(), device.as_ptr(), param.code(), len, dst, size)
        })
    }

    fn create_kernel(&self, program: RawHandle, name: &str) -> Outcome<RawHandle> {
        let name = CString::new(name).map_err(|_| Status::INVALID_KERNEL_NAME)?;
        let mut code: ClInt = 0;
        let raw = unsafe { (self.api.create_kernel)(program.as_ptr(), name.as_ptr(), &mut code) };
        created(raw, code)
    }

    fn kernel_info(&self, kernel: RawHandle, param: KernelInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        query(out, |len, dst, size| unsafe {
            (self.api.get_kernel_info)(kernel.as_ptr(), param.code(), len, dst, size)
        })
    }

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, value: ArgValue<'_>) -> Outcome<()> {
        let mem: ClMem;
        let (size, value_ptr) = match value {
            ArgValue::Bytes(bytes) => (bytes.len(), bytes.as_ptr().cast::<c_void>()),
            ArgValue::Memory(memory) => {
                mem = memory.as_ptr();
                (std::mem::size_of::<ClMem>(), (&mem as *const ClMem).cast::<c_void>())
            }
            ArgValue::Local(size) => (size, ptr::null()),
        };
        Status::check(unsafe { (self.api.set_kernel_arg)(kernel.as_ptr(), index, size, value_ptr) })
    }

    fn enqueue_kernel(
        &self,
        queue: RawHandle,
        kernel: RawHandle,
        range: &NdRange,
        wait: &[RawHandle],
    ) -> Outcome<RawHandle> {
        let wait = event_list(wait);
        let (num_wait, wait_ptr) = list_ptr(&wait);
        let local = range.local().map_or(ptr::null(), |l| l.as_ptr());
        let mut event: ClEvent = ptr::null_mut();
        let code = unsafe {
            (self.api.enqueue_nd_range_kernel)(
                queue.as_ptr(),
                kernel.as_ptr(),
                range.dims() as ClUint,
                range.offset().as_ptr(),
                range.global().as_ptr(),
                local,
                num_wait,
                wait_ptr,
                &mut event,
            )
        };
        created(event, code)
    }

    fn create_buffer(&self, context: RawHandle, flags: MemFlags, size: usize) -> Outcome<RawHandle> {
        let mut code: ClInt = 0;
        let raw = unsafe { (self.api.create_buffer)(context.as_ptr(), flags.0, size, ptr::null_mut(), &mut code) };
        created(raw, code)
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
        let wait = event_list(wait);
        let (num_wait, wait_ptr) = list_ptr(&wait);
        let mut event: ClEvent = ptr::null_mut();
        let code = (self.api.enqueue_write_buffer)(
            queue.as_ptr(),
            memory.as_ptr(),
            cl_bool(blocking),
            offset,
            len,
            src.cast(),
            num_wait,
            wait_ptr,
            &mut event,
        );
        created(event, code)
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
        let wait = event_list(wait);
        let (num_wait, wait_ptr) = list_ptr(&wait);
        let mut event: ClEvent = ptr::null_mut();
        let code = (self.api.enqueue_read_buffer)(
            queue.as_ptr(),
            memory.as_ptr(),
            cl_bool(blocking),
            offset,
            len,
            dst.cast(),
            num_wait,
            wait_ptr,
            &mut event,
        );
        created(event, code)
    }

    fn wait_for_events(&self, events: &[RawHandle]) -> Outcome<()> {
        let events = event_list(events);
        let (count, list) = list_ptr(&events);
        Status::check(unsafe { (self.api.wait_for_events)(count, list) })
    }

    fn event_info(&self, event: RawHandle, param: EventInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        query(out, |len, dst, size| unsafe {
            (self.api.get_event_info)(event.as_ptr(), param.code(), len, dst, size)
        })
    }

    fn event_profiling_info(&self, event: RawHandle, param: ProfilingInfo, out: Option<&mut [u8]>) -> Outcome<usize> {
        query(out, |len, dst, size| unsafe {
            (self.api.get_event_profiling_info)(event.as_ptr(), param.code(), len, dst, size)
        })
    }
}
