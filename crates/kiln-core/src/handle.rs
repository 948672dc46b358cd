//! Reference-counted ownership of runtime handles.
//!
//! A [`Handle<K>`] owns exactly one reference to a runtime object (or none,
//! when unbound). The kind marker `K` selects the acquire/release policy at
//! compile time:
//!
//! | operation            | effect on the runtime count            |
//! |----------------------|----------------------------------------|
//! | [`Handle::adopt`]    | none: takes over a create call's reference |
//! | [`Handle::bind`]     | `acquire`                              |
//! | `clone`              | `acquire` on the source's handle       |
//! | move / assignment    | none (Rust moves transfer ownership)   |
//! | [`Handle::release`]  | `release` once, then the handle is null |
//! | drop                 | `release` unless already released      |
//!
//! Platforms are not reference counted by the runtime, so [`PlatformKind`]'s
//! policy is a no-op.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{KilnError, Result};
use crate::runtime::{ComputeRuntime, RawHandle, ResourceKind, SharedRuntime, Status};

/// Per-kind acquire/release policy.
pub trait HandleKind: 'static {
    const KIND: ResourceKind;

    fn acquire(runtime: &dyn ComputeRuntime, raw: RawHandle) -> std::result::Result<(), Status> {
        runtime.retain(Self::KIND, raw)
    }

    fn release(runtime: &dyn ComputeRuntime, raw: RawHandle) -> std::result::Result<(), Status> {
        runtime.release(Self::KIND, raw)
    }
}

macro_rules! counted_kinds {
    ($($(#[$meta:meta])* $name:ident => $kind:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug)]
            pub enum $name {}

            impl HandleKind for $name {
                const KIND: ResourceKind = ResourceKind::$kind;
            }
        )*
    };
}

counted_kinds! {
    DeviceKind => Device,
    ContextKind => Context,
    QueueKind => CommandQueue,
    ProgramKind => Program,
    KernelKind => Kernel,
    MemoryKind => Memory,
    /// Completion tokens returned by enqueue calls.
    EventKind => Event,
}

#[derive(Debug)]
pub enum PlatformKind {}

impl HandleKind for PlatformKind {
    const KIND: ResourceKind = ResourceKind::Platform;

    fn acquire(_: &dyn ComputeRuntime, _: RawHandle) -> std::result::Result<(), Status> {
        Ok(())
    }

    fn release(_: &dyn ComputeRuntime, _: RawHandle) -> std::result::Result<(), Status> {
        Ok(())
    }
}

struct Bound {
    raw: RawHandle,
    runtime: SharedRuntime,
}

/// Owner of one reference to a runtime object of kind `K`.
pub struct Handle<K: HandleKind> {
    bound: Option<Bound>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: HandleKind> Handle<K> {
    /// Take ownership of a reference the runtime just handed out.
    pub fn adopt(runtime: SharedRuntime, raw: RawHandle) -> Self {
        tracing::trace!("adopt {} {}", K::KIND, raw);
        Self { bound: Some(Bound { raw, runtime }), _kind: PhantomData }
    }

    /// Acquire an additional reference to `raw` and own it.
    pub fn bind(runtime: SharedRuntime, raw: RawHandle) -> Result<Self> {
        K::acquire(runtime.as_ref(), raw).map_err(|status| KilnError::resource(acquire_op::<K>(), status))?;
        tracing::trace!("bind {} {}", K::KIND, raw);
        Ok(Self { bound: Some(Bound { raw, runtime }), _kind: PhantomData })
    }

    /// The raw handle, or `None` once unbound/released.
    pub fn as_raw(&self) -> Option<RawHandle> {
        self.bound.as_ref().map(|b| b.raw)
    }

    /// The raw handle, failing on an unbound/released wrapper.
    pub fn get(&self) -> Result<RawHandle> {
        self.as_raw().ok_or_else(|| KilnError::Released(K::KIND))
    }

    /// The runtime this handle belongs to.
    pub fn runtime(&self) -> Result<&SharedRuntime> {
        self.bound
            .as_ref()
            .map(|b| &b.runtime)
            .ok_or_else(|| KilnError::Released(K::KIND))
    }

    /// Raw handle and runtime together.
    pub(crate) fn parts(&self) -> Result<(RawHandle, &SharedRuntime)> {
        self.bound
            .as_ref()
            .map(|b| (b.raw, &b.runtime))
            .ok_or_else(|| KilnError::Released(K::KIND))
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Copy the handle, acquiring one more reference.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.bound {
            None => Ok(Self::default()),
            Some(b) => Self::bind(Arc::clone(&b.runtime), b.raw),
        }
    }

    /// Release this wrapper's reference now. Further calls are no-ops.
    pub fn release(&mut self) -> Result<()> {
        match self.bound.take() {
            None => Ok(()),
            Some(b) => {
                tracing::trace!("release {} {}", K::KIND, b.raw);
                K::release(b.runtime.as_ref(), b.raw).map_err(|status| KilnError::resource(release_op::<K>(), status))
            }
        }
    }
}

impl<K: HandleKind> Default for Handle<K> {
    fn default() -> Self {
        Self { bound: None, _kind: PhantomData }
    }
}

impl<K: HandleKind> Clone for Handle<K> {
    /// # Panics
    /// Panics if the runtime rejects the retain; use [`Handle::try_clone`]
    /// to handle that as an error.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(handle) => handle,
            Err(e) => panic!("failed to clone {} handle: {}", K::KIND, e),
        }
    }
}

impl<K: HandleKind> Drop for Handle<K> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::error!("{}", e);
        }
    }
}

impl<K: HandleKind> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl<K: HandleKind> Eq for Handle<K> {}

impl<K: HandleKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bound {
            Some(b) => write!(f, "Handle<{}>({})", K::KIND, b.raw),
            None => write!(f, "Handle<{}>(null)", K::KIND),
        }
    }
}

fn acquire_op<K: HandleKind>() -> &'static str {
    match K::KIND {
        ResourceKind::Platform => "retain platform",
        ResourceKind::Device => "clRetainDevice",
        ResourceKind::Context => "clRetainContext",
        ResourceKind::CommandQueue => "clRetainCommandQueue",
        ResourceKind::Program => "clRetainProgram",
        ResourceKind::Kernel => "clRetainKernel",
        ResourceKind::Memory => "clRetainMemObject",
        ResourceKind::Event => "clRetainEvent",
    }
}

fn release_op<K: HandleKind>() -> &'static str {
    match K::KIND {
        ResourceKind::Platform => "release platform",
        ResourceKind::Device => "clReleaseDevice",
        ResourceKind::Context => "clReleaseContext",
        ResourceKind::CommandQueue => "clReleaseCommandQueue",
        ResourceKind::Program => "clReleaseProgram",
        ResourceKind::Kernel => "clReleaseKernel",
        ResourceKind::Memory => "clReleaseMemObject",
        ResourceKind::Event => "clReleaseEvent",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{HostRuntime, MemFlags};

    fn setup() -> (Arc<HostRuntime>, SharedRuntime, RawHandle) {
        let host = Arc::new(HostRuntime::default());
        let rt: SharedRuntime = host.clone();
        let platform = rt.platform_ids().unwrap()[0];
        let device = rt.device_ids(platform).unwrap()[0];
        let context = rt.create_context(platform, device).unwrap();
        rt.release(ResourceKind::Device, device).unwrap();
        (host, rt, context)
    }

    fn memory(rt: &SharedRuntime, context: RawHandle) -> Handle<MemoryKind> {
        Handle::adopt(Arc::clone(rt), rt.create_buffer(context, MemFlags::READ_WRITE, 64).unwrap())
    }

    #[test]
    fn test_clone_then_drop_original_keeps_copy_alive() {
        let (host, rt, ctx) = setup();
        let original = memory(&rt, ctx);
        let raw = original.get().unwrap();
        let copy = original.clone();
        assert_eq!(host.reference_count(raw), Some(2));

        drop(original);
        assert_eq!(host.reference_count(raw), Some(1));
        assert_eq!(copy.get().unwrap(), raw);

        drop(copy);
        assert_eq!(host.reference_count(raw), None);
    }

    #[test]
    fn test_move_does_not_touch_count() {
        let (host, rt, ctx) = setup();
        let a = memory(&rt, ctx);
        let raw = a.get().unwrap();
        let b = a;
        assert_eq!(host.reference_count(raw), Some(1));
        let mut slot: Handle<MemoryKind> = Handle::default();
        assert!(!slot.is_bound());
        slot = b;
        assert_eq!(host.reference_count(raw), Some(1));
        assert!(slot.is_bound());
    }

    #[test]
    fn test_release_is_idempotent() {
        let (host, rt, ctx) = setup();
        let mut h = memory(&rt, ctx);
        let raw = h.get().unwrap();
        h.release().unwrap();
        assert!(!h.is_bound());
        assert_eq!(host.reference_count(raw), None);
        h.release().unwrap();
        assert!(matches!(h.get(), Err(KilnError::Released(_))));
        drop(h);
        assert_eq!(host.release_failures(), 0);
    }

    #[test]
    fn test_default_is_unbound() {
        let h: Handle<ContextKind> = Handle::default();
        assert!(!h.is_bound());
        assert_eq!(h.as_raw(), None);
        assert!(h.try_clone().unwrap().as_raw().is_none());
        assert_eq!(format!("{:?}", h), "Handle<context>(null)");
    }

    #[test]
    fn test_bind_acquires() {
        let (host, rt, ctx) = setup();
        let bound: Handle<ContextKind> = Handle::bind(Arc::clone(&rt), ctx).unwrap();
        assert_eq!(host.reference_count(ctx), Some(2));
        drop(bound);
        assert_eq!(host.reference_count(ctx), Some(1));
        rt.release(ResourceKind::Context, ctx).unwrap();
    }

    #[test]
    fn test_bind_unknown_handle_fails() {
        let (_host, rt, _ctx) = setup();
        let bogus = RawHandle::from_usize(0xdead_0000).unwrap();
        let err = Handle::<KernelKind>::bind(rt, bogus).unwrap_err();
        assert_eq!(err.status(), Some(Status::INVALID_KERNEL));
    }

    #[test]
    fn test_platform_policy_is_noop() {
        let (_host, rt, _ctx) = setup();
        let platform = rt.platform_ids().unwrap()[0];
        let mut a: Handle<PlatformKind> = Handle::bind(Arc::clone(&rt), platform).unwrap();
        let b = a.clone();
        a.release().unwrap();
        assert_eq!(b.get().unwrap(), platform);
    }
}
