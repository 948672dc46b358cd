//! # kiln-core
//!
//! Reference-counted handles and the dispatch protocol over OpenCL-style
//! compute runtimes.
//!
//! Provides:
//! - [`Handle`] ownership with per-kind acquire/release policies
//! - Platform and device enumeration with capability queries
//! - Contexts, command queues, programs (with build logs) and kernels
//! - Typed device buffers and completion events
//! - Two runtimes behind [`ComputeRuntime`]: a system OpenCL loader
//!   (`opencl` feature) and the in-process [`HostRuntime`]
//!
//! The call sequence is: enumerate → select device → create context and
//! queue → build program → create kernel → allocate buffers → transfer →
//! bind arguments → dispatch → synchronize → transfer back.

pub mod buffer;
pub mod context;
pub mod device;
pub mod error;
pub mod event;
pub mod handle;
mod info;
pub mod kernel;
pub mod platform;
pub mod program;
pub mod queue;
pub mod runtime;
pub mod source;

pub use buffer::Buffer;
pub use context::Context;
pub use device::{Device, DeviceType};
pub use error::{KilnError, Result};
pub use event::{Event, EventProfile, EventStatus};
pub use handle::Handle;
pub use kernel::{Kernel, KernelArg, LocalMemory, Scalar};
pub use platform::Platform;
pub use program::{BuildState, Program};
pub use queue::CommandQueue;
pub use runtime::{
    ComputeRuntime, HostArgs, HostRuntime, KernelLibrary, MemFlags, NdRange, QueueProperties, RuntimeChoice,
    SharedRuntime, Status,
};
pub use source::read_kernel_source;
