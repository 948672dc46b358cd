//! Compute devices and their capability queries.

use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::{KilnError, Result};
use crate::handle::{DeviceKind, Handle};
use crate::info;
use crate::platform::Platform;
use crate::runtime::types::device_type;
use crate::runtime::{DeviceInfo, RawHandle, SharedRuntime, Status};

/// Coarse device class reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
    Default,
    Unknown(u64),
}

impl DeviceType {
    fn from_bits(bits: u64) -> Self {
        if bits & device_type::GPU != 0 {
            DeviceType::Gpu
        } else if bits & device_type::CPU != 0 {
            DeviceType::Cpu
        } else if bits & device_type::ACCELERATOR != 0 {
            DeviceType::Accelerator
        } else if bits & device_type::DEFAULT != 0 {
            DeviceType::Default
        } else {
            DeviceType::Unknown(bits)
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => f.write_str("CPU"),
            DeviceType::Gpu => f.write_str("GPU"),
            DeviceType::Accelerator => f.write_str("accelerator"),
            DeviceType::Default => f.write_str("default"),
            DeviceType::Unknown(_) => f.write_str("unknown"),
        }
    }
}

/// One device of a platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    handle: Handle<DeviceKind>,
}

impl Device {
    /// Device number `index` on `platform`.
    ///
    /// Scans every device of the platform, keeps the reference to the chosen
    /// one and releases the rest before returning.
    pub fn new(platform: &Platform, index: usize) -> Result<Device> {
        let (raw_platform, rt) = platform.handle().parts()?;
        let count = rt
            .num_devices(raw_platform)
            .map_err(|status| KilnError::resource("clGetDeviceIDs(count)", status))?;
        if count == 0 {
            return Err(KilnError::NoDevices);
        }
        if index >= count {
            return Err(KilnError::InvalidIndex { what: "device", index, count });
        }

        let ids = rt
            .device_ids(raw_platform)
            .map_err(|status| KilnError::resource("clGetDeviceIDs", status))?;
        let mut scanned: Vec<Handle<DeviceKind>> =
            ids.into_iter().map(|raw| Handle::adopt(Arc::clone(rt), raw)).collect();
        if index >= scanned.len() {
            return Err(KilnError::InvalidIndex { what: "device", index, count: scanned.len() });
        }
        let handle = scanned.swap_remove(index);
        for mut other in scanned {
            other.release()?;
        }
        tracing::debug!("selected device {} of {} on platform {}", index, count, raw_platform);
        Ok(Device { handle })
    }

    pub fn handle(&self) -> &Handle<DeviceKind> {
        &self.handle
    }

    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.handle.runtime()
    }

    /// The platform this device belongs to.
    pub fn platform(&self) -> Result<Platform> {
        let (_, rt) = self.handle.parts()?;
        let raw: usize = self.pod(DeviceInfo::Platform)?;
        let raw = RawHandle::from_usize(raw)
            .ok_or_else(|| KilnError::query("clGetDeviceInfo(Platform)", Status::INVALID_PLATFORM))?;
        Ok(Platform::from_raw(Arc::clone(rt), raw))
    }

    pub fn name(&self) -> Result<String> {
        self.string(DeviceInfo::Name)
    }

    pub fn vendor(&self) -> Result<String> {
        self.string(DeviceInfo::Vendor)
    }

    /// Full version string, `OpenCL <major>.<minor> <vendor-specific>`.
    pub fn version(&self) -> Result<String> {
        self.string(DeviceInfo::Version)
    }

    /// Version as `major * 100 + minor * 10`, e.g. 120 for OpenCL 1.2.
    pub fn version_number(&self) -> Result<u32> {
        let version = self.version()?;
        parse_version_number(&version)
            .ok_or_else(|| KilnError::query(format!("device version {:?}", version), Status::INVALID_VALUE))
    }

    pub fn driver_version(&self) -> Result<String> {
        self.string(DeviceInfo::DriverVersion)
    }

    pub fn device_type(&self) -> Result<DeviceType> {
        self.pod::<u64>(DeviceInfo::Type).map(DeviceType::from_bits)
    }

    /// Maximum clock frequency in MHz.
    pub fn core_clock(&self) -> Result<u32> {
        self.pod(DeviceInfo::MaxClockFrequency)
    }

    pub fn compute_units(&self) -> Result<u32> {
        self.pod(DeviceInfo::MaxComputeUnits)
    }

    pub fn global_mem_size(&self) -> Result<u64> {
        self.pod(DeviceInfo::GlobalMemSize)
    }

    /// Largest single allocation in bytes.
    pub fn max_alloc_size(&self) -> Result<u64> {
        self.pod(DeviceInfo::MaxMemAllocSize)
    }

    pub fn local_mem_size(&self) -> Result<u64> {
        self.pod(DeviceInfo::LocalMemSize)
    }

    pub fn max_work_group_size(&self) -> Result<usize> {
        self.pod(DeviceInfo::MaxWorkGroupSize)
    }

    pub fn max_work_item_dimensions(&self) -> Result<u32> {
        self.pod(DeviceInfo::MaxWorkItemDimensions)
    }

    pub fn max_work_item_sizes(&self) -> Result<Vec<usize>> {
        let (raw, rt) = self.handle.parts()?;
        info::read_vec("clGetDeviceInfo(MaxWorkItemSizes)", |out| {
            rt.device_info(raw, DeviceInfo::MaxWorkItemSizes, out)
        })
    }

    pub fn extensions(&self) -> Result<String> {
        self.string(DeviceInfo::Extensions)
    }

    /// Substring match against the extension string.
    pub fn has_extension(&self, extension: &str) -> Result<bool> {
        Ok(self.extensions()?.contains(extension))
    }

    pub fn supports_fp64(&self) -> Result<bool> {
        self.has_extension("cl_khr_fp64")
    }

    /// The Mali-T628 handles half precision without advertising
    /// `cl_khr_fp16`.
    pub fn supports_fp16(&self) -> Result<bool> {
        if self.name()? == "Mali-T628" {
            return Ok(true);
        }
        self.has_extension("cl_khr_fp16")
    }

    /// Whether `bytes` of work-group local memory fit on the device.
    pub fn is_local_memory_valid(&self, bytes: u64) -> Result<bool> {
        Ok(bytes <= self.local_mem_size()?)
    }

    /// Whether `local_sizes` is an acceptable work-group shape: no more
    /// dimensions than the device supports, each within its per-dimension
    /// limit, and the product within the work-group limit.
    pub fn is_thread_config_valid(&self, local_sizes: &[usize]) -> Result<bool> {
        let max_dims = self.max_work_item_dimensions()? as usize;
        let max_sizes = self.max_work_item_sizes()?;
        let max_group = self.max_work_group_size()?;
        Ok(thread_config_fits(local_sizes, max_dims, &max_sizes, max_group))
    }

    fn string(&self, param: DeviceInfo) -> Result<String> {
        let (raw, rt) = self.handle.parts()?;
        info::read_string(&format!("clGetDeviceInfo({:?})", param), |out| rt.device_info(raw, param, out))
    }

    fn pod<T: Pod>(&self, param: DeviceInfo) -> Result<T> {
        let (raw, rt) = self.handle.parts()?;
        info::read_pod(&format!("clGetDeviceInfo({:?})", param), |out| rt.device_info(raw, param, out))
    }
}

/// `"OpenCL 1.2 vendor"` → 120.
fn parse_version_number(version: &str) -> Option<u32> {
    let rest = version.strip_prefix("OpenCL ")?;
    let number = rest.split(' ').next()?;
    let value: f64 = number.parse().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some((value * 100.0).round() as u32)
    } else {
        None
    }
}

fn thread_config_fits(local: &[usize], max_dims: usize, max_sizes: &[usize], max_group: usize) -> bool {
    if local.len() > max_dims {
        return false;
    }
    let mut product: usize = 1;
    for (dim, &size) in local.iter().enumerate() {
        match max_sizes.get(dim) {
            Some(&limit) if size <= limit => {}
            _ => return false,
        }
        product = match product.checked_mul(size) {
            Some(p) => p,
            None => return false,
        };
    }
    product <= max_group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HostConfig, HostDeviceSpec, HostPlatformSpec, HostRuntime, KernelLibrary};

    fn small_gpu() -> HostDeviceSpec {
        let mut spec = HostDeviceSpec::named("Small GPU");
        spec.device_type = device_type::GPU;
        spec.max_work_group_size = 256;
        spec.max_work_item_sizes = vec![256, 16, 4];
        spec.local_mem_size = 16 * 1024;
        spec.extensions = "cl_khr_fp16 cl_khr_global_int32_base_atomics".into();
        spec
    }

    fn host() -> (Arc<HostRuntime>, SharedRuntime) {
        let config = HostConfig::empty()
            .with_platform(HostPlatformSpec::new("Two").with_device(HostDeviceSpec::cpu()).with_device(small_gpu()))
            .with_platform(HostPlatformSpec::new("None"));
        let host = Arc::new(HostRuntime::new(config, KernelLibrary::new()));
        let rt: SharedRuntime = host.clone();
        (host, rt)
    }

    #[test]
    fn test_capabilities() {
        let (_host, rt) = host();
        let platform = Platform::new(&rt, 0).unwrap();
        let cpu = Device::new(&platform, 0).unwrap();
        assert!(cpu.compute_units().unwrap() > 0);
        assert_eq!(cpu.max_work_item_dimensions().unwrap(), 3);
        assert_eq!(cpu.max_work_item_sizes().unwrap(), vec![1024, 1024, 1024]);
        assert_eq!(cpu.device_type().unwrap(), DeviceType::Cpu);
        assert_eq!(cpu.version_number().unwrap(), 120);
        assert!(cpu.supports_fp64().unwrap());
        assert!(!cpu.supports_fp16().unwrap());
        assert_eq!(cpu.platform().unwrap(), platform);

        let gpu = Device::new(&platform, 1).unwrap();
        assert_eq!(gpu.name().unwrap(), "Small GPU");
        assert_eq!(gpu.device_type().unwrap().to_string(), "GPU");
        assert!(gpu.supports_fp16().unwrap());
        assert!(gpu.is_local_memory_valid(16 * 1024).unwrap());
        assert!(!gpu.is_local_memory_valid(16 * 1024 + 1).unwrap());
    }

    #[test]
    fn test_thread_config() {
        let (_host, rt) = host();
        let gpu = Device::new(&Platform::new(&rt, 0).unwrap(), 1).unwrap();
        assert!(gpu.is_thread_config_valid(&[16, 16]).unwrap());
        assert!(gpu.is_thread_config_valid(&[256]).unwrap());
        // product over the group limit
        assert!(!gpu.is_thread_config_valid(&[32, 16]).unwrap());
        // per-dimension limit
        assert!(!gpu.is_thread_config_valid(&[1, 32]).unwrap());
        // too many dimensions
        assert!(!gpu.is_thread_config_valid(&[1, 1, 1, 1]).unwrap());
    }

    #[test]
    fn test_index_boundaries() {
        let (_host, rt) = host();
        let two = Platform::new(&rt, 0).unwrap();
        let err = Device::new(&two, 2).unwrap_err();
        assert!(matches!(err, KilnError::InvalidIndex { what: "device", index: 2, count: 2 }));

        let none = Platform::new(&rt, 1).unwrap();
        assert!(matches!(Device::new(&none, 0), Err(KilnError::NoDevices)));
    }

    #[test]
    fn test_scan_keeps_only_chosen_reference() {
        let (host, rt) = host();
        let platform = Platform::new(&rt, 0).unwrap();
        let chosen = Device::new(&platform, 1).unwrap();
        let other = Device::new(&platform, 0).unwrap();
        let chosen_raw = chosen.handle().get().unwrap();
        let other_raw = other.handle().get().unwrap();
        // base reference plus the wrapper's
        assert_eq!(host.reference_count(chosen_raw), Some(2));
        assert_eq!(host.reference_count(other_raw), Some(2));
        drop(other);
        assert_eq!(host.reference_count(other_raw), Some(1));
    }

    #[test]
    fn test_parse_version_number() {
        assert_eq!(parse_version_number("OpenCL 1.2 CUDA"), Some(120));
        assert_eq!(parse_version_number("OpenCL 2.0 AMD-APP (3240.6)"), Some(200));
        assert_eq!(parse_version_number("OpenCL 3.0"), Some(300));
        assert_eq!(parse_version_number("CUDA 12"), None);
    }
}
