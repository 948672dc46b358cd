//! Execution contexts.

use std::sync::Arc;

use crate::device::Device;
use crate::error::{KilnError, Result};
use crate::handle::{ContextKind, Handle};
use crate::runtime::SharedRuntime;

/// A context scoped to exactly one device. Programs, buffers and queues
/// created against that device share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    handle: Handle<ContextKind>,
}

impl Context {
    pub fn new(device: &Device) -> Result<Context> {
        let platform = device.platform()?;
        let (raw_device, rt) = device.handle().parts()?;
        let raw = rt
            .create_context(platform.handle().get()?, raw_device)
            .map_err(|status| KilnError::resource("clCreateContext", status))?;
        tracing::debug!("created context {} for device {}", raw, raw_device);
        Ok(Context { handle: Handle::adopt(Arc::clone(rt), raw) })
    }

    pub fn handle(&self) -> &Handle<ContextKind> {
        &self.handle
    }

    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.handle.runtime()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use crate::runtime::HostRuntime;

    #[test]
    fn test_context_lifetime() {
        let host = Arc::new(HostRuntime::default());
        let rt: SharedRuntime = host.clone();
        let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
        let context = Context::new(&device).unwrap();
        let raw = context.handle().get().unwrap();
        assert_eq!(host.reference_count(raw), Some(1));

        let copy = context.clone();
        assert_eq!(copy, context);
        assert_eq!(host.reference_count(raw), Some(2));
        drop(context);
        drop(copy);
        assert_eq!(host.reference_count(raw), None);
        assert_eq!(host.live_objects(), 0);
    }
}
