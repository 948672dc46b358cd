//! Command queues.

use std::sync::Arc;

use crate::context::Context;
use crate::device::Device;
use crate::error::{KilnError, Result};
use crate::handle::{Handle, QueueKind};
use crate::runtime::{QueueProperties, SharedRuntime};

/// An ordered stream of transfers and dispatches for one (context, device)
/// pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandQueue {
    handle: Handle<QueueKind>,
    properties: QueueProperties,
}

impl CommandQueue {
    /// In-order queue with profiling enabled.
    pub fn new(context: &Context, device: &Device) -> Result<CommandQueue> {
        Self::with_properties(context, device, QueueProperties::PROFILING)
    }

    pub fn with_properties(context: &Context, device: &Device, properties: QueueProperties) -> Result<CommandQueue> {
        let (raw_context, rt) = context.handle().parts()?;
        let raw = rt
            .create_command_queue(raw_context, device.handle().get()?, properties)
            .map_err(|status| KilnError::resource("clCreateCommandQueue", status))?;
        tracing::debug!("created command queue {} (properties {:#x})", raw, properties.0);
        Ok(CommandQueue { handle: Handle::adopt(Arc::clone(rt), raw), properties })
    }

    pub fn handle(&self) -> &Handle<QueueKind> {
        &self.handle
    }

    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.handle.runtime()
    }

    pub fn properties(&self) -> QueueProperties {
        self.properties
    }

    /// Block until every command enqueued so far has completed.
    pub fn finish(&self) -> Result<()> {
        let (raw, rt) = self.handle.parts()?;
        rt.finish(raw).map_err(|status| KilnError::dispatch("clFinish", status))
    }

    /// Submit enqueued commands to the device without waiting.
    pub fn flush(&self) -> Result<()> {
        let (raw, rt) = self.handle.parts()?;
        rt.flush(raw).map_err(|status| KilnError::dispatch("clFlush", status))
    }
}
