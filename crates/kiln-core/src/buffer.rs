//! Typed device memory.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytemuck::Pod;

use crate::context::Context;
use crate::error::{KilnError, Result};
use crate::event::{self, Event};
use crate::handle::{Handle, MemoryKind};
use crate::queue::CommandQueue;
use crate::runtime::{MemFlags, SharedRuntime, Status};

/// `len` elements of `T` in device memory.
///
/// Contents are only reachable through copies enqueued on a
/// [`CommandQueue`]. Offsets are in bytes; transfers that would run past
/// the allocation fail with [`KilnError::TransferOutOfBounds`] before
/// anything is enqueued.
pub struct Buffer<T: Pod> {
    handle: Handle<MemoryKind>,
    len: usize,
    flags: MemFlags,
    _elem: PhantomData<T>,
}

impl<T: Pod> Buffer<T> {
    /// Read-write buffer of `len` elements.
    pub fn new(context: &Context, len: usize) -> Result<Self> {
        Self::with_flags(context, len, MemFlags::READ_WRITE)
    }

    pub fn with_flags(context: &Context, len: usize, flags: MemFlags) -> Result<Self> {
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| KilnError::resource("clCreateBuffer", Status::INVALID_BUFFER_SIZE))?;
        let (raw_context, rt) = context.handle().parts()?;
        let raw = rt
            .create_buffer(raw_context, flags, size)
            .map_err(|status| KilnError::resource("clCreateBuffer", status))?;
        tracing::debug!("allocated buffer {} ({} bytes)", raw, size);
        Ok(Self { handle: Handle::adopt(Arc::clone(rt), raw), len, flags, _elem: PhantomData })
    }

    /// Allocate a buffer sized for `data` and copy it in, blocking.
    pub fn from_host(context: &Context, queue: &CommandQueue, data: &[T]) -> Result<Self> {
        let buffer = Self::new(context, data.len())?;
        buffer.copy_from_host(queue, data, 0, &[])?;
        Ok(buffer)
    }

    pub fn handle(&self) -> &Handle<MemoryKind> {
        &self.handle
    }

    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.handle.runtime()
    }

    /// Drop this buffer's reference now; later use fails with
    /// [`KilnError::Released`].
    pub fn release(&mut self) -> Result<()> {
        self.handle.release()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    /// Copy `src` into the buffer at byte `offset`, blocking until done.
    pub fn copy_from_host(&self, queue: &CommandQueue, src: &[T], offset: usize, wait: &[Event]) -> Result<Event> {
        // SAFETY: blocking; `src` outlives the transfer.
        unsafe { self.write(queue, true, src, offset, wait) }
    }

    /// Copy from the buffer at byte `offset` into `dst`, blocking until done.
    pub fn copy_from_device(
        &self,
        queue: &CommandQueue,
        dst: &mut [T],
        offset: usize,
        wait: &[Event],
    ) -> Result<Event> {
        // SAFETY: blocking; `dst` is exclusively borrowed for the whole transfer.
        unsafe { self.read(queue, true, dst, offset, wait) }
    }

    /// Enqueue a host → device copy and return immediately.
    ///
    /// # Safety
    /// `src` must stay alive and unmodified until the returned event has
    /// completed (wait on it, or `finish` the queue).
    pub unsafe fn copy_from_host_async(
        &self,
        queue: &CommandQueue,
        src: &[T],
        offset: usize,
        wait: &[Event],
    ) -> Result<Event> {
        self.write(queue, false, src, offset, wait)
    }

    /// Enqueue a device → host copy and return immediately.
    ///
    /// # Safety
    /// `dst` must stay alive and must not be read or written until the
    /// returned event has completed.
    pub unsafe fn copy_from_device_async(
        &self,
        queue: &CommandQueue,
        dst: &mut [T],
        offset: usize,
        wait: &[Event],
    ) -> Result<Event> {
        self.read(queue, false, dst, offset, wait)
    }

    /// The whole buffer as a host vector.
    pub fn read_to_vec(&self, queue: &CommandQueue) -> Result<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len];
        self.copy_from_device(queue, &mut out, 0, &[])?;
        Ok(out)
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        let capacity = self.size_bytes();
        match offset.checked_add(len) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(KilnError::TransferOutOfBounds { offset, len, capacity }),
        }
    }

    unsafe fn write(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        src: &[T],
        offset: usize,
        wait: &[Event],
    ) -> Result<Event> {
        let bytes: &[u8] = bytemuck::cast_slice(src);
        self.check_bounds(offset, bytes.len())?;
        let (raw, rt) = self.handle.parts()?;
        let waits = event::raw_list(wait)?;
        let raw_event = rt
            .enqueue_write_buffer(queue.handle().get()?, raw, blocking, offset, bytes.as_ptr(), bytes.len(), &waits)
            .map_err(|status| KilnError::dispatch("clEnqueueWriteBuffer", status))?;
        tracing::trace!("write {} bytes to buffer {} at {}", bytes.len(), raw, offset);
        Ok(Event::adopt(Arc::clone(rt), raw_event))
    }

    unsafe fn read(
        &self,
        queue: &CommandQueue,
        blocking: bool,
        dst: &mut [T],
        offset: usize,
        wait: &[Event],
    ) -> Result<Event> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(dst);
        self.check_bounds(offset, bytes.len())?;
        let (raw, rt) = self.handle.parts()?;
        let waits = event::raw_list(wait)?;
        let raw_event = rt
            .enqueue_read_buffer(queue.handle().get()?, raw, blocking, offset, bytes.as_mut_ptr(), bytes.len(), &waits)
            .map_err(|status| KilnError::dispatch("clEnqueueReadBuffer", status))?;
        tracing::trace!("read {} bytes from buffer {} at {}", bytes.len(), raw, offset);
        Ok(Event::adopt(Arc::clone(rt), raw_event))
    }
}

impl<T: Pod> Clone for Buffer<T> {
    /// Shares the same device memory.
    fn clone(&self) -> Self {
        Self { handle: self.handle.clone(), len: self.len, flags: self.flags, _elem: PhantomData }
    }
}

impl<T: Pod> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .field("elem", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::platform::Platform;
    use crate::runtime::HostRuntime;

    fn setup() -> (Arc<HostRuntime>, Context, CommandQueue) {
        let host = Arc::new(HostRuntime::default());
        let rt: SharedRuntime = host.clone();
        let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
        let context = Context::new(&device).unwrap();
        let queue = CommandQueue::new(&context, &device).unwrap();
        (host, context, queue)
    }

    #[test]
    fn test_partial_copies_with_offset() {
        let (_host, context, queue) = setup();
        let buffer = Buffer::<u32>::new(&context, 8).unwrap();
        assert_eq!(buffer.size_bytes(), 32);
        buffer.copy_from_host(&queue, &[1, 2, 3, 4, 5, 6, 7, 8], 0, &[]).unwrap();
        buffer.copy_from_host(&queue, &[40, 50], 12, &[]).unwrap();

        let mut middle = [0u32; 4];
        buffer.copy_from_device(&queue, &mut middle, 8, &[]).unwrap();
        assert_eq!(middle, [3, 40, 50, 6]);
    }

    #[test]
    fn test_out_of_bounds_rejected_before_enqueue() {
        let (host, context, queue) = setup();
        let buffer = Buffer::<f32>::new(&context, 4).unwrap();
        let err = buffer.copy_from_host(&queue, &[0.0; 4], 4, &[]).unwrap_err();
        assert!(matches!(err, KilnError::TransferOutOfBounds { offset: 4, len: 16, capacity: 16 }));
        let mut big = [0.0f32; 5];
        assert!(buffer.copy_from_device(&queue, &mut big, 0, &[]).is_err());
        assert_eq!(host.pending_commands(queue.handle().get().unwrap()), Some(0));
    }

    #[test]
    fn test_async_copies_complete_on_finish() {
        let (host, context, queue) = setup();
        let src = vec![7i64; 16];
        let mut dst = vec![0i64; 16];
        let buffer = Buffer::<i64>::new(&context, 16).unwrap();
        unsafe {
            let written = buffer.copy_from_host_async(&queue, &src, 0, &[]).unwrap();
            buffer.copy_from_device_async(&queue, &mut dst, 0, &[written]).unwrap();
        }
        assert_eq!(host.pending_commands(queue.handle().get().unwrap()), Some(2));
        queue.finish().unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_oversized_allocation() {
        let (_host, context, _queue) = setup();
        let err = Buffer::<u8>::new(&context, usize::MAX).unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_BUFFER_SIZE));
        let err = Buffer::<u8>::new(&context, 0).unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_BUFFER_SIZE));
    }

    #[test]
    fn test_buffer_keeps_context_alive() {
        let (host, context, queue) = setup();
        let buffer = Buffer::<f32>::from_host(&context, &queue, &[1.5, 2.5]).unwrap();
        drop(context);
        drop(queue);
        assert_eq!(host.live_objects(), 2);
        drop(buffer);
        assert_eq!(host.live_objects(), 0);
    }
}
