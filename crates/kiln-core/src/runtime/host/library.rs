//! Host implementations of device kernels.
//!
//! The host runtime cannot run device code, so every `__kernel` a program
//! declares must have a host implementation registered under the same name.
//! Implementations receive the dispatch range and the bound arguments.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytemuck::Pod;

use crate::runtime::NdRange;

/// A kernel body executed by the host runtime.
pub trait HostKernel: Send + Sync {
    fn execute(&self, range: &NdRange, args: &mut HostArgs<'_>) -> Result<(), String>;
}

impl<F> HostKernel for F
where
    F: Fn(&NdRange, &mut HostArgs<'_>) -> Result<(), String> + Send + Sync,
{
    fn execute(&self, range: &NdRange, args: &mut HostArgs<'_>) -> Result<(), String> {
        self(range, args)
    }
}

/// Named host kernel implementations.
#[derive(Clone, Default)]
pub struct KernelLibrary {
    kernels: HashMap<String, Arc<dyn HostKernel>>,
}

impl KernelLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, kernel: F) -> &mut Self
    where
        F: Fn(&NdRange, &mut HostArgs<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(kernel))
    }

    /// Builder form of [`KernelLibrary::register`].
    pub fn with<F>(mut self, name: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&NdRange, &mut HostArgs<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.register(name, kernel);
        self
    }

    /// Register any [`HostKernel`] implementation.
    pub fn insert(&mut self, name: impl Into<String>, kernel: Arc<dyn HostKernel>) -> &mut Self {
        self.kernels.insert(name.into(), kernel);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn HostKernel>> {
        self.kernels.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

impl fmt::Debug for KernelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelLibrary").field("kernels", &self.names()).finish()
    }
}

// ---------------------------------------------------------------------------
// Device memory storage
// ---------------------------------------------------------------------------

/// Backing store of a host memory object.
///
/// Stored as `u64` words so views of any `Pod` element type up to 8 bytes
/// are correctly aligned.
#[derive(Debug, Clone)]
pub(crate) struct DeviceMemory {
    words: Vec<u64>,
    len: usize,
}

impl DeviceMemory {
    pub(crate) fn zeroed(len: usize) -> Self {
        Self { words: vec![0u64; (len + 7) / 8], len }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }
}

// ---------------------------------------------------------------------------
// Kernel arguments
// ---------------------------------------------------------------------------

enum ArgSlot<'a> {
    Scalar(&'a [u8]),
    Memory(&'a mut [u8]),
    Local(usize),
    /// The same memory object as an earlier slot.
    Alias(usize),
    Taken,
}

/// Arguments of one dispatch, in declaration order.
///
/// Memory arguments are handed out once each through [`HostArgs::buffer`],
/// so a kernel can hold its inputs and outputs at the same time. When one
/// buffer is bound to several slots, only the first slot yields it and
/// [`HostArgs::alias_of`] maps the others back to that slot.
pub struct HostArgs<'a> {
    slots: Vec<ArgSlot<'a>>,
}

impl<'a> HostArgs<'a> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn push_scalar(&mut self, bytes: &'a [u8]) {
        self.slots.push(ArgSlot::Scalar(bytes));
    }

    pub(crate) fn push_memory(&mut self, bytes: &'a mut [u8]) {
        self.slots.push(ArgSlot::Memory(bytes));
    }

    pub(crate) fn push_local(&mut self, size: usize) {
        self.slots.push(ArgSlot::Local(size));
    }

    pub(crate) fn push_alias(&mut self, first: usize) {
        self.slots.push(ArgSlot::Alias(first));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Read a plain-value argument.
    pub fn scalar<T: Pod>(&self, index: usize) -> Result<T, String> {
        match self.slots.get(index) {
            Some(ArgSlot::Scalar(bytes)) => bytemuck::try_pod_read_unaligned(bytes).map_err(|_| {
                format!(
                    "argument {} is {} bytes, expected {}",
                    index,
                    bytes.len(),
                    std::mem::size_of::<T>()
                )
            }),
            Some(_) => Err(format!("argument {} is not a plain value", index)),
            None => Err(format!("argument {} is out of range", index)),
        }
    }

    /// The earlier slot holding the same memory object as `index`, if any.
    pub fn alias_of(&self, index: usize) -> Option<usize> {
        match self.slots.get(index) {
            Some(ArgSlot::Alias(first)) => Some(*first),
            _ => None,
        }
    }

    /// Take the memory bound at `index` as a typed slice.
    ///
    /// Each memory object is handed out once. For a slot that aliases an
    /// earlier one this fails; take the first slot instead (see
    /// [`HostArgs::alias_of`]).
    pub fn buffer<T: Pod>(&mut self, index: usize) -> Result<&'a mut [T], String> {
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| format!("argument {} is out of range", index))?;
        match std::mem::replace(slot, ArgSlot::Taken) {
            ArgSlot::Memory(bytes) => bytemuck::try_cast_slice_mut(bytes)
                .map_err(|e| format!("argument {} cannot be viewed as the requested type: {}", index, e)),
            ArgSlot::Taken => Err(format!("argument {} was already taken", index)),
            ArgSlot::Alias(first) => {
                *slot = ArgSlot::Alias(first);
                Err(format!("argument {} is the same memory object as argument {}", index, first))
            }
            other => {
                *slot = other;
                Err(format!("argument {} is not a memory object", index))
            }
        }
    }

    /// Size in bytes of a local-memory argument.
    pub fn local_size(&self, index: usize) -> Result<usize, String> {
        match self.slots.get(index) {
            Some(ArgSlot::Local(size)) => Ok(*size),
            Some(_) => Err(format!("argument {} is not local memory", index)),
            None => Err(format!("argument {} is out of range", index)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_registration() {
        let lib = KernelLibrary::new()
            .with("b", |_: &NdRange, _: &mut HostArgs<'_>| Ok(()))
            .with("a", |_: &NdRange, _: &mut HostArgs<'_>| Ok(()));
        assert_eq!(lib.names(), vec!["a", "b"]);
        assert!(lib.contains("a"));
        assert!(lib.get("c").is_none());
        assert_eq!(lib.len(), 2);
    }

    #[test]
    fn test_device_memory_alignment() {
        let mut mem = DeviceMemory::zeroed(12);
        assert_eq!(mem.len(), 12);
        let floats: &mut [f32] = bytemuck::cast_slice_mut(mem.as_bytes_mut());
        floats[2] = 1.5;
        assert_eq!(&mem.as_bytes()[8..12], &1.5f32.to_ne_bytes());
    }

    #[test]
    fn test_args_access() {
        let n = 7i32.to_ne_bytes();
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        let mut args = HostArgs::new();
        args.push_scalar(&n);
        args.push_memory(&mut a);
        args.push_memory(&mut b);
        args.push_local(64);

        assert_eq!(args.scalar::<i32>(0).unwrap(), 7);
        assert!(args.scalar::<i64>(0).is_err());
        assert!(args.scalar::<i32>(1).is_err());
        assert_eq!(args.local_size(3).unwrap(), 64);

        let first: &mut [u32] = args.buffer(1).unwrap();
        let second: &mut [u32] = args.buffer(2).unwrap();
        first[0] = 1;
        second[0] = 2;
        assert!(args.buffer::<u32>(1).is_err());
        assert!(args.buffer::<u32>(0).is_err());
        assert_eq!(args.scalar::<i32>(0).unwrap(), 7);
    }

    #[test]
    fn test_aliased_memory_slot() {
        let mut a = vec![0u8; 8];
        let mut args = HostArgs::new();
        args.push_memory(&mut a);
        args.push_alias(0);

        assert_eq!(args.alias_of(1), Some(0));
        assert_eq!(args.alias_of(0), None);
        let err = args.buffer::<f32>(1).unwrap_err();
        assert!(err.contains("same memory object as argument 0"), "{}", err);
        // still an alias after the failed take
        assert_eq!(args.alias_of(1), Some(0));
        let shared: &mut [f32] = args.buffer(0).unwrap();
        assert_eq!(shared.len(), 2);
    }
}
