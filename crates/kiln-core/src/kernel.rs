//! Kernel entry points, argument binding and dispatch.

use std::sync::Arc;

use bytemuck::Pod;

use crate::buffer::Buffer;
use crate::error::{KilnError, Result};
use crate::event::{self, Event};
use crate::handle::{Handle, KernelKind, ProgramKind};
use crate::info;
use crate::program::{BuildState, Program};
use crate::queue::CommandQueue;
use crate::runtime::{ArgValue, KernelInfo, NdRange, SharedRuntime, Status};

/// A value that can be bound to a kernel parameter slot.
///
/// Plain values bind by their bytes, buffers by their device handle.
pub trait KernelArg {
    fn arg_value(&self) -> Result<ArgValue<'_>>;
}

macro_rules! scalar_args {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KernelArg for $ty {
                fn arg_value(&self) -> Result<ArgValue<'_>> {
                    Ok(ArgValue::Bytes(bytemuck::bytes_of(self)))
                }
            }
        )*
    };
}

scalar_args!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Any other plain-old-data value (vector types, packed structs).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scalar<T: Pod>(pub T);

impl<T: Pod> KernelArg for Scalar<T> {
    fn arg_value(&self) -> Result<ArgValue<'_>> {
        Ok(ArgValue::Bytes(bytemuck::bytes_of(&self.0)))
    }
}

impl<T: Pod> KernelArg for Buffer<T> {
    fn arg_value(&self) -> Result<ArgValue<'_>> {
        Ok(ArgValue::Memory(self.handle().get()?))
    }
}

/// A `__local` parameter: `bytes` of work-group local memory, allocated
/// per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalMemory(pub usize);

impl LocalMemory {
    /// Room for `count` elements of `T`.
    pub fn of<T>(count: usize) -> LocalMemory {
        LocalMemory(count * std::mem::size_of::<T>())
    }
}

impl KernelArg for LocalMemory {
    fn arg_value(&self) -> Result<ArgValue<'_>> {
        Ok(ArgValue::Local(self.0))
    }
}

/// A named entry point of a built program.
///
/// Argument slots live in the kernel object, so a `Kernel` is not `Clone`:
/// [`Kernel::try_clone`] creates a second object with its own slots.
#[derive(Debug)]
pub struct Kernel {
    handle: Handle<KernelKind>,
    program: Handle<ProgramKind>,
    name: String,
    num_args: usize,
    /// A rebind was rejected partway; some slots hold the rejected values.
    stale: bool,
}

impl Kernel {
    pub fn new(program: &Program, name: &str) -> Result<Kernel> {
        if program.state() == BuildState::Failed {
            return Err(KilnError::resource(
                format!("clCreateKernel({})", name),
                Status::INVALID_PROGRAM_EXECUTABLE,
            ));
        }
        Self::create(program.handle().try_clone()?, name)
    }

    fn create(program: Handle<ProgramKind>, name: &str) -> Result<Kernel> {
        let (raw_program, rt) = program.parts()?;
        let raw = rt
            .create_kernel(raw_program, name)
            .map_err(|status| KilnError::resource(format!("clCreateKernel({})", name), status))?;
        let handle: Handle<KernelKind> = Handle::adopt(Arc::clone(rt), raw);
        let num_args: u32 = info::read_pod("clGetKernelInfo(NumArgs)", |out| {
            rt.kernel_info(raw, KernelInfo::NumArgs, out)
        })?;
        tracing::debug!("created kernel {} '{}' ({} args)", raw, name, num_args);
        Ok(Kernel { handle, program, name: name.to_string(), num_args: num_args as usize, stale: false })
    }

    /// A new kernel object for the same entry point, with nothing bound.
    pub fn try_clone(&self) -> Result<Kernel> {
        Self::create(self.program.try_clone()?, &self.name)
    }

    pub fn handle(&self) -> &Handle<KernelKind> {
        &self.handle
    }

    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.handle.runtime()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of parameters in the kernel's signature.
    pub fn num_args(&self) -> usize {
        self.num_args
    }

    /// Bind `args` to slots `0..args.len()`, replacing every previous
    /// binding. The count must match the kernel's signature; the types are
    /// checked by the runtime as far as it can.
    ///
    /// Every argument is resolved before any slot is touched. If the runtime
    /// rejects a slot, the kernel refuses to dispatch until a later call
    /// succeeds.
    pub fn set_arguments(&mut self, args: &[&dyn KernelArg]) -> Result<()> {
        if args.len() != self.num_args {
            return Err(KilnError::ArgumentCount {
                kernel: self.name.clone(),
                expected: self.num_args,
                got: args.len(),
            });
        }
        let values = args.iter().map(|arg| arg.arg_value()).collect::<Result<Vec<_>>>()?;
        let (raw, rt) = self.handle.parts()?;
        for (index, value) in values.into_iter().enumerate() {
            if let Err(status) = rt.set_kernel_arg(raw, index as u32, value) {
                self.stale = true;
                return Err(KilnError::dispatch(format!("clSetKernelArg({}, {})", self.name, index), status));
            }
        }
        self.stale = false;
        Ok(())
    }

    /// Enqueue a dispatch over `range` after the events in `wait`.
    /// Returns without waiting; the event completes with the dispatch.
    pub fn run(&self, queue: &CommandQueue, range: &NdRange, wait: &[Event]) -> Result<Event> {
        if self.stale {
            return Err(KilnError::dispatch(
                format!("clEnqueueNDRangeKernel({})", self.name),
                Status::INVALID_KERNEL_ARGS,
            ));
        }
        let (raw, rt) = self.handle.parts()?;
        let waits = event::raw_list(wait)?;
        let raw_event = rt
            .enqueue_kernel(queue.handle().get()?, raw, range, &waits)
            .map_err(|status| KilnError::dispatch(format!("clEnqueueNDRangeKernel({})", self.name), status))?;
        tracing::debug!("dispatched '{}' over {}", self.name, range);
        Ok(Event::adopt(Arc::clone(rt), raw_event))
    }

    /// [`Kernel::run`] taking the index space as slices; the dimensionality
    /// is `global.len()`.
    pub fn launch(
        &self,
        queue: &CommandQueue,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        wait: &[Event],
    ) -> Result<Event> {
        let range = NdRange::from_slices(offset, global, local).ok_or_else(|| {
            KilnError::dispatch(format!("clEnqueueNDRangeKernel({})", self.name), Status::INVALID_WORK_DIMENSION)
        })?;
        self.run(queue, &range, wait)
    }
}
