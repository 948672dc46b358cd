//! Compute platform enumeration.

use std::sync::Arc;

use crate::error::{KilnError, Result};
use crate::handle::{Handle, PlatformKind};
use crate::info;
use crate::runtime::{PlatformInfo, RawHandle, SharedRuntime};

/// One installed compute runtime (an ICD, or the host runtime's platforms).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    handle: Handle<PlatformKind>,
}

impl Platform {
    /// All platforms visible right now, in runtime order. None found is an
    /// empty vector, not an error.
    pub fn all(runtime: &SharedRuntime) -> Result<Vec<Platform>> {
        let ids = runtime
            .platform_ids()
            .map_err(|status| KilnError::resource("clGetPlatformIDs", status))?;
        Ok(ids.into_iter().map(|raw| Platform::from_raw(Arc::clone(runtime), raw)).collect())
    }

    /// Platform number `index`.
    pub fn new(runtime: &SharedRuntime, index: usize) -> Result<Platform> {
        let mut platforms = Self::all(runtime)?;
        let count = platforms.len();
        if index >= count {
            return Err(KilnError::InvalidIndex { what: "platform", index, count });
        }
        Ok(platforms.swap_remove(index))
    }

    pub(crate) fn from_raw(runtime: SharedRuntime, raw: RawHandle) -> Platform {
        Platform { handle: Handle::adopt(runtime, raw) }
    }

    pub fn handle(&self) -> &Handle<PlatformKind> {
        &self.handle
    }

    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.handle.runtime()
    }

    pub fn num_devices(&self) -> Result<usize> {
        let (raw, rt) = self.handle.parts()?;
        rt.num_devices(raw)
            .map_err(|status| KilnError::query("clGetDeviceIDs(count)", status))
    }

    pub fn name(&self) -> Result<String> {
        self.string(PlatformInfo::Name)
    }

    pub fn vendor(&self) -> Result<String> {
        self.string(PlatformInfo::Vendor)
    }

    pub fn version(&self) -> Result<String> {
        self.string(PlatformInfo::Version)
    }

    /// `FULL_PROFILE` or `EMBEDDED_PROFILE`.
    pub fn profile(&self) -> Result<String> {
        self.string(PlatformInfo::Profile)
    }

    /// Space-separated extension names.
    pub fn extensions(&self) -> Result<String> {
        self.string(PlatformInfo::Extensions)
    }

    fn string(&self, param: PlatformInfo) -> Result<String> {
        let (raw, rt) = self.handle.parts()?;
        info::read_string(&format!("clGetPlatformInfo({:?})", param), |out| {
            rt.platform_info(raw, param, out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HostConfig, HostDeviceSpec, HostPlatformSpec, HostRuntime, KernelLibrary};

    fn runtime() -> SharedRuntime {
        let config = HostConfig::empty()
            .with_platform(HostPlatformSpec::default())
            .with_platform(HostPlatformSpec::new("Empty"));
        Arc::new(HostRuntime::new(config, KernelLibrary::new()))
    }

    #[test]
    fn test_all_and_index() {
        let rt = runtime();
        let platforms = Platform::all(&rt).unwrap();
        assert_eq!(platforms.len(), 2);
        assert_eq!(Platform::new(&rt, 1).unwrap(), platforms[1]);
        assert_eq!(platforms[0].name().unwrap(), "Kiln Host Platform");
        assert_eq!(platforms[1].num_devices().unwrap(), 0);
    }

    #[test]
    fn test_index_out_of_range() {
        let rt = runtime();
        let err = Platform::new(&rt, 2).unwrap_err();
        assert!(matches!(err, KilnError::InvalidIndex { what: "platform", index: 2, count: 2 }));
    }

    #[test]
    fn test_no_platforms_is_empty() {
        let rt: SharedRuntime = Arc::new(HostRuntime::new(HostConfig::empty(), KernelLibrary::new()));
        assert!(Platform::all(&rt).unwrap().is_empty());
    }

    #[test]
    fn test_descriptive_fields() {
        let rt: SharedRuntime = Arc::new(HostRuntime::new(
            HostConfig::empty().with_platform(HostPlatformSpec::new("Other").with_device(HostDeviceSpec::cpu())),
            KernelLibrary::new(),
        ));
        let p = Platform::new(&rt, 0).unwrap();
        assert_eq!(p.name().unwrap(), "Other");
        assert_eq!(p.profile().unwrap(), "FULL_PROFILE");
        assert!(p.version().unwrap().starts_with("OpenCL "));
        assert_eq!(p.num_devices().unwrap(), 1);
    }
}
