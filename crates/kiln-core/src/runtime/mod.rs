//! The compute-runtime seam.
//!
//! [`ComputeRuntime`] is the raw, status-returning API every wrapper type in
//! this crate is built on. Two implementations ship with the crate:
//!
//! - [`OpenClRuntime`] binds a system OpenCL ICD loader at run time
//!   (feature `opencl`, no build-time OpenCL dependency).
//! - [`HostRuntime`] is an in-process reference runtime that executes kernels
//!   through host implementations registered in a [`KernelLibrary`].
//!
//! Handles cross the seam as [`RawHandle`]s; ownership of the reference
//! counts behind them is managed by [`crate::handle::Handle`].

pub mod host;
pub mod status;
pub mod types;

#[cfg(feature = "opencl")]
pub mod ffi;
#[cfg(feature = "opencl")]
pub mod opencl;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use host::{
    encode_binary, HostArgs, HostConfig, HostDeviceSpec, HostKernel, HostPlatformSpec, HostRuntime, KernelLibrary,
};
#[cfg(feature = "opencl")]
pub use opencl::OpenClRuntime;
pub use status::Status;
pub use types::{
    ArgValue, BuildInfo, DeviceInfo, EventInfo, KernelInfo, MemFlags, NdRange, PlatformInfo, ProfilingInfo,
    QueueProperties, RawHandle, ResourceKind,
};

use crate::error::{KilnError, Result};

/// Shared, thread-safe reference to a runtime. Every handle keeps one.
pub type SharedRuntime = Arc<dyn ComputeRuntime>;

/// The raw compute API.
///
/// Info queries are two-phase: called with `out == None` they return the
/// number of bytes the value needs; called with a buffer of at least that
/// size they fill it and return the same count.
///
/// Create calls hand out one reference to the new object; `retain` and
/// `release` adjust that count. Enqueue calls return a new event handle that
/// the caller owns.
pub trait ComputeRuntime: Send + Sync + fmt::Debug {
    /// Short human-readable runtime name, e.g. `"opencl"` or `"host"`.
    fn name(&self) -> &str;

    // -- enumeration ------------------------------------------------------

    fn platform_ids(&self) -> std::result::Result<Vec<RawHandle>, Status>;

    fn platform_info(
        &self,
        platform: RawHandle,
        param: PlatformInfo,
        out: Option<&mut [u8]>,
    ) -> std::result::Result<usize, Status>;

    fn num_devices(&self, platform: RawHandle) -> std::result::Result<usize, Status>;

    /// Scan the devices of a platform. Each returned id carries one
    /// reference that the caller must release.
    fn device_ids(&self, platform: RawHandle) -> std::result::Result<Vec<RawHandle>, Status>;

    fn device_info(&self, device: RawHandle, param: DeviceInfo, out: Option<&mut [u8]>)
        -> std::result::Result<usize, Status>;

    // -- reference counting -----------------------------------------------

    fn retain(&self, kind: ResourceKind, handle: RawHandle) -> std::result::Result<(), Status>;

    fn release(&self, kind: ResourceKind, handle: RawHandle) -> std::result::Result<(), Status>;

    // -- contexts and queues ----------------------------------------------

    fn create_context(&self, platform: RawHandle, device: RawHandle) -> std::result::Result<RawHandle, Status>;

    fn create_command_queue(
        &self,
        context: RawHandle,
        device: RawHandle,
        properties: QueueProperties,
    ) -> std::result::Result<RawHandle, Status>;

    fn flush(&self, queue: RawHandle) -> std::result::Result<(), Status>;

    fn finish(&self, queue: RawHandle) -> std::result::Result<(), Status>;

    // -- programs and kernels ---------------------------------------------

    fn create_program_with_source(&self, context: RawHandle, source: &str) -> std::result::Result<RawHandle, Status>;

    fn create_program_with_binary(
        &self,
        context: RawHandle,
        device: RawHandle,
        binary: &[u8],
    ) -> std::result::Result<RawHandle, Status>;

    fn build_program(&self, program: RawHandle, device: RawHandle, options: &str) -> std::result::Result<(), Status>;

    fn program_build_info(
        &self,
        program: RawHandle,
        device: RawHandle,
        param: BuildInfo,
        out: Option<&mut [u8]>,
    ) -> std::result::Result<usize, Status>;

    fn create_kernel(&self, program: RawHandle, name: &str) -> std::result::Result<RawHandle, Status>;

    fn kernel_info(&self, kernel: RawHandle, param: KernelInfo, out: Option<&mut [u8]>)
        -> std::result::Result<usize, Status>;

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, value: ArgValue<'_>) -> std::result::Result<(), Status>;

    fn enqueue_kernel(
        &self,
        queue: RawHandle,
        kernel: RawHandle,
        range: &NdRange,
        wait: &[RawHandle],
    ) -> std::result::Result<RawHandle, Status>;

    // -- memory -----------------------------------------------------------

    fn create_buffer(&self, context: RawHandle, flags: MemFlags, size: usize) -> std::result::Result<RawHandle, Status>;

    /// Enqueue a host → device copy of `len` bytes at `offset`.
    ///
    /// # Safety
    /// `src` must be valid for `len` bytes of reads until the returned event
    /// completes (immediately, when `blocking`).
    unsafe fn enqueue_write_buffer(
        &self,
        queue: RawHandle,
        memory: RawHandle,
        blocking: bool,
        offset: usize,
        src: *const u8,
        len: usize,
        wait: &[RawHandle],
    ) -> std::result::Result<RawHandle, Status>;

    /// Enqueue a device → host copy of `len` bytes at `offset`.
    ///
    /// # Safety
    /// `dst` must be valid for `len` bytes of writes, and not otherwise
    /// accessed, until the returned event completes.
    unsafe fn enqueue_read_buffer(
        &self,
        queue: RawHandle,
        memory: RawHandle,
        blocking: bool,
        offset: usize,
        dst: *mut u8,
        len: usize,
        wait: &[RawHandle],
    ) -> std::result::Result<RawHandle, Status>;

    // -- events -----------------------------------------------------------

    fn wait_for_events(&self, events: &[RawHandle]) -> std::result::Result<(), Status>;

    fn event_info(&self, event: RawHandle, param: EventInfo, out: Option<&mut [u8]>)
        -> std::result::Result<usize, Status>;

    fn event_profiling_info(
        &self,
        event: RawHandle,
        param: ProfilingInfo,
        out: Option<&mut [u8]>,
    ) -> std::result::Result<usize, Status>;
}

// ---------------------------------------------------------------------------
// Runtime selection
// ---------------------------------------------------------------------------

/// Environment variable consulted by [`RuntimeChoice::from_env`].
pub const RUNTIME_ENV: &str = "KILN_RUNTIME";

/// Which runtime to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeChoice {
    /// OpenCL when a loader with at least one platform is present, else host.
    #[default]
    Auto,
    OpenCl,
    Host,
}

impl RuntimeChoice {
    /// Read [`RUNTIME_ENV`]; unset or unparsable values give `Auto`.
    pub fn from_env() -> Self {
        match std::env::var(RUNTIME_ENV) {
            Ok(value) => value.parse().unwrap_or_else(|_| {
                tracing::warn!("ignoring unrecognized {}={:?}", RUNTIME_ENV, value);
                RuntimeChoice::Auto
            }),
            Err(_) => RuntimeChoice::Auto,
        }
    }

    /// Open the chosen runtime. `host` builds the fallback/explicit host
    /// runtime so callers can register their kernel library.
    pub fn open(self, host: impl FnOnce() -> HostRuntime) -> Result<SharedRuntime> {
        match self {
            RuntimeChoice::Host => Ok(Arc::new(host())),
            RuntimeChoice::OpenCl => open_opencl(),
            RuntimeChoice::Auto => match open_opencl() {
                Ok(rt) => Ok(rt),
                Err(e) => {
                    tracing::warn!("OpenCL unavailable ({}), falling back to host runtime", e);
                    Ok(Arc::new(host()))
                }
            },
        }
    }
}

/// Retain each of `ids` in order. If one is rejected, the ids retained
/// before it are released again and the rejection is returned.
#[cfg_attr(not(feature = "opencl"), allow(dead_code))]
pub(crate) fn retain_all(
    ids: &[RawHandle],
    mut retain: impl FnMut(RawHandle) -> std::result::Result<(), Status>,
    mut release: impl FnMut(RawHandle) -> std::result::Result<(), Status>,
) -> std::result::Result<(), Status> {
    for (i, &id) in ids.iter().enumerate() {
        if let Err(status) = retain(id) {
            for &done in &ids[..i] {
                if let Err(e) = release(done) {
                    tracing::error!("failed to release {} after rejected retain: {}", done, e);
                }
            }
            return Err(status);
        }
    }
    Ok(())
}

#[cfg(feature = "opencl")]
fn open_opencl() -> Result<SharedRuntime> {
    let rt = OpenClRuntime::load()?;
    let platforms = rt
        .platform_ids()
        .map_err(|status| KilnError::resource("clGetPlatformIDs", status))?;
    if platforms.is_empty() {
        return Err(KilnError::RuntimeUnavailable("no OpenCL platforms installed".into()));
    }
    Ok(Arc::new(rt))
}

#[cfg(not(feature = "opencl"))]
fn open_opencl() -> Result<SharedRuntime> {
    Err(KilnError::RuntimeUnavailable("built without the `opencl` feature".into()))
}

impl FromStr for RuntimeChoice {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(RuntimeChoice::Auto),
            "opencl" | "cl" => Ok(RuntimeChoice::OpenCl),
            "host" | "cpu" => Ok(RuntimeChoice::Host),
            other => Err(KilnError::RuntimeUnavailable(format!(
                "unknown runtime '{}' (expected auto, opencl or host)",
                other
            ))),
        }
    }
}

impl fmt::Display for RuntimeChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeChoice::Auto => write!(f, "auto"),
            RuntimeChoice::OpenCl => write!(f, "opencl"),
            RuntimeChoice::Host => write!(f, "host"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_choice() {
        assert_eq!("auto".parse::<RuntimeChoice>().unwrap(), RuntimeChoice::Auto);
        assert_eq!("OpenCL".parse::<RuntimeChoice>().unwrap(), RuntimeChoice::OpenCl);
        assert_eq!(" host ".parse::<RuntimeChoice>().unwrap(), RuntimeChoice::Host);
        assert!("cuda".parse::<RuntimeChoice>().is_err());
    }

    #[test]
    fn test_open_host() {
        let rt = RuntimeChoice::Host.open(HostRuntime::default).unwrap();
        assert_eq!(rt.name(), "host");
    }

    #[test]
    fn test_retain_all_unwinds_on_failure() {
        use std::cell::RefCell;

        let ids: Vec<RawHandle> = (1..=4).filter_map(RawHandle::from_usize).collect();
        let held = RefCell::new(Vec::new());
        let err = retain_all(
            &ids,
            |id| {
                if id.as_usize() == 3 {
                    return Err(Status::OUT_OF_HOST_MEMORY);
                }
                held.borrow_mut().push(id);
                Ok(())
            },
            |id| {
                held.borrow_mut().retain(|&h| h != id);
                Ok(())
            },
        )
        .unwrap_err();
        assert_eq!(err, Status::OUT_OF_HOST_MEMORY);
        assert!(held.borrow().is_empty());

        let mut count = 0;
        retain_all(
            &ids,
            |_| {
                count += 1;
                Ok(())
            },
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_display_round_trip() {
        for choice in [RuntimeChoice::Auto, RuntimeChoice::OpenCl, RuntimeChoice::Host] {
            assert_eq!(choice.to_string().parse::<RuntimeChoice>().unwrap(), choice);
        }
    }
}
