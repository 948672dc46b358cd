//! Plain data passed across the runtime seam.

use std::fmt;
use std::num::NonZeroUsize;

use super::status::Status;

/// Opaque, pointer-sized identifier for a runtime-owned object.
///
/// Never null; `Option<RawHandle>` is the null sentinel and has the same size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(NonZeroUsize);

impl RawHandle {
    pub const fn new(value: NonZeroUsize) -> Self {
        RawHandle(value)
    }

    pub fn from_usize(value: usize) -> Option<Self> {
        NonZeroUsize::new(value).map(RawHandle)
    }

    pub fn from_ptr<T>(ptr: *mut T) -> Option<Self> {
        Self::from_usize(ptr as usize)
    }

    pub fn as_usize(self) -> usize {
        self.0.get()
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0.get() as *mut T
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:#x})", self.0)
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The kinds of object a runtime hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Platform,
    Device,
    Context,
    CommandQueue,
    Program,
    Kernel,
    Memory,
    Event,
}

impl ResourceKind {
    /// Status a runtime reports when handed a handle of this kind that it
    /// does not recognize.
    pub fn invalid_status(self) -> Status {
        match self {
            ResourceKind::Platform => Status::INVALID_PLATFORM,
            ResourceKind::Device => Status::INVALID_DEVICE,
            ResourceKind::Context => Status::INVALID_CONTEXT,
            ResourceKind::CommandQueue => Status::INVALID_COMMAND_QUEUE,
            ResourceKind::Program => Status::INVALID_PROGRAM,
            ResourceKind::Kernel => Status::INVALID_KERNEL,
            ResourceKind::Memory => Status::INVALID_MEM_OBJECT,
            ResourceKind::Event => Status::INVALID_EVENT,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Platform => "platform",
            ResourceKind::Device => "device",
            ResourceKind::Context => "context",
            ResourceKind::CommandQueue => "command queue",
            ResourceKind::Program => "program",
            ResourceKind::Kernel => "kernel",
            ResourceKind::Memory => "memory object",
            ResourceKind::Event => "event",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Info query parameters
// ---------------------------------------------------------------------------

macro_rules! info_params {
    ($(#[$meta:meta])* $ty:ident { $($variant:ident = $code:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $ty {
            $($variant),*
        }

        impl $ty {
            /// The runtime's numeric parameter code.
            pub fn code(self) -> u32 {
                match self {
                    $($ty::$variant => $code),*
                }
            }
        }
    };
}

info_params! {
    /// Platform properties, all reported as NUL-terminated strings.
    PlatformInfo {
        Profile = 0x0900,
        Version = 0x0901,
        Name = 0x0902,
        Vendor = 0x0903,
        Extensions = 0x0904,
    }
}

info_params! {
    /// Device properties.
    DeviceInfo {
        Type = 0x1000,
        MaxComputeUnits = 0x1002,
        MaxWorkItemDimensions = 0x1003,
        MaxWorkGroupSize = 0x1004,
        MaxWorkItemSizes = 0x1005,
        MaxClockFrequency = 0x100C,
        MaxMemAllocSize = 0x1010,
        GlobalMemSize = 0x101F,
        LocalMemSize = 0x1023,
        Name = 0x102B,
        Vendor = 0x102C,
        DriverVersion = 0x102D,
        Version = 0x102F,
        Extensions = 0x1030,
        Platform = 0x1031,
    }
}

info_params! {
    /// Per-device program build properties.
    BuildInfo {
        Status = 0x1181,
        Options = 0x1182,
        Log = 0x1183,
    }
}

info_params! {
    KernelInfo {
        FunctionName = 0x1190,
        NumArgs = 0x1191,
    }
}

info_params! {
    EventInfo {
        ExecutionStatus = 0x11D3,
    }
}

info_params! {
    /// Device-clock timestamps in nanoseconds, reported as `u64`.
    ProfilingInfo {
        Queued = 0x1280,
        Submit = 0x1281,
        Start = 0x1282,
        End = 0x1283,
    }
}

/// Device type bitfield values reported for [`DeviceInfo::Type`].
pub mod device_type {
    pub const DEFAULT: u64 = 1 << 0;
    pub const CPU: u64 = 1 << 1;
    pub const GPU: u64 = 1 << 2;
    pub const ACCELERATOR: u64 = 1 << 3;
    pub const ALL: u64 = 0xFFFF_FFFF;
}

/// Program build status values reported for [`BuildInfo::Status`].
pub mod build_status {
    pub const NONE: i32 = -1;
    pub const ERROR: i32 = -2;
    pub const SUCCESS: i32 = 0;
    pub const IN_PROGRESS: i32 = -3;
}

/// Command execution status values reported for [`EventInfo::ExecutionStatus`].
/// Negative values are error statuses.
pub mod execution_status {
    pub const COMPLETE: i32 = 0;
    pub const RUNNING: i32 = 1;
    pub const SUBMITTED: i32 = 2;
    pub const QUEUED: i32 = 3;
}

// ---------------------------------------------------------------------------
// Creation flags
// ---------------------------------------------------------------------------

/// Command queue creation properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueProperties(pub u64);

impl QueueProperties {
    pub const NONE: QueueProperties = QueueProperties(0);
    pub const OUT_OF_ORDER: QueueProperties = QueueProperties(1 << 0);
    pub const PROFILING: QueueProperties = QueueProperties(1 << 1);

    pub fn contains(self, other: QueueProperties) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for QueueProperties {
    type Output = QueueProperties;

    fn bitor(self, rhs: Self) -> Self {
        QueueProperties(self.0 | rhs.0)
    }
}

impl Default for QueueProperties {
    fn default() -> Self {
        QueueProperties::PROFILING
    }
}

/// Memory object access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemFlags(pub u64);

impl MemFlags {
    pub const READ_WRITE: MemFlags = MemFlags(1 << 0);
    pub const WRITE_ONLY: MemFlags = MemFlags(1 << 1);
    pub const READ_ONLY: MemFlags = MemFlags(1 << 2);
}

impl Default for MemFlags {
    fn default() -> Self {
        MemFlags::READ_WRITE
    }
}

// ---------------------------------------------------------------------------
// Dispatch description
// ---------------------------------------------------------------------------

/// An N-dimensional index space for a kernel dispatch.
///
/// Unused trailing dimensions hold `1` for sizes and `0` for offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    dims: usize,
    offset: [usize; 3],
    global: [usize; 3],
    local: Option<[usize; 3]>,
}

impl NdRange {
    pub fn d1(x: usize) -> Self {
        Self { dims: 1, offset: [0; 3], global: [x, 1, 1], local: None }
    }

    pub fn d2(x: usize, y: usize) -> Self {
        Self { dims: 2, offset: [0; 3], global: [x, y, 1], local: None }
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Self {
        Self { dims: 3, offset: [0; 3], global: [x, y, z], local: None }
    }

    /// Build from slices; the dimensionality is `global.len()`.
    ///
    /// Returns `None` unless `1 <= global.len() <= 3` and `offset`/`local`
    /// (when given) have the same length as `global`.
    pub fn from_slices(offset: Option<&[usize]>, global: &[usize], local: Option<&[usize]>) -> Option<Self> {
        let dims = global.len();
        if !(1..=3).contains(&dims) {
            return None;
        }
        let pad = |values: &[usize], fill: usize| {
            let mut out = [fill; 3];
            out[..values.len()].copy_from_slice(values);
            out
        };
        let offset = match offset {
            Some(o) if o.len() != dims => return None,
            Some(o) => pad(o, 0),
            None => [0; 3],
        };
        let local = match local {
            Some(l) if l.len() != dims => return None,
            Some(l) => Some(pad(l, 1)),
            None => None,
        };
        Some(Self { dims, offset, global: pad(global, 1), local })
    }

    pub fn with_offset(mut self, offset: [usize; 3]) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_local(mut self, local: [usize; 3]) -> Self {
        self.local = Some(local);
        self
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn offset(&self) -> &[usize] {
        &self.offset[..self.dims]
    }

    pub fn global(&self) -> &[usize] {
        &self.global[..self.dims]
    }

    pub fn local(&self) -> Option<&[usize]> {
        self.local.as_ref().map(|l| &l[..self.dims])
    }

    /// Total number of work-items.
    pub fn global_items(&self) -> usize {
        self.global().iter().product()
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "global {:?}", self.global())?;
        if self.offset().iter().any(|&o| o != 0) {
            write!(f, " offset {:?}", self.offset())?;
        }
        if let Some(local) = self.local() {
            write!(f, " local {:?}", local)?;
        }
        Ok(())
    }
}

/// One kernel argument value as the runtime receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgValue<'a> {
    /// Plain value, bound by its raw bytes.
    Bytes(&'a [u8]),
    /// Device memory, bound by handle.
    Memory(RawHandle),
    /// Work-group local memory of the given size in bytes.
    Local(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_handle_null_sentinel() {
        assert!(RawHandle::from_usize(0).is_none());
        assert_eq!(RawHandle::from_usize(16).map(RawHandle::as_usize), Some(16));
        assert_eq!(std::mem::size_of::<Option<RawHandle>>(), std::mem::size_of::<usize>());
    }

    #[test]
    fn test_info_codes() {
        assert_eq!(DeviceInfo::MaxComputeUnits.code(), 0x1002);
        assert_eq!(PlatformInfo::Name.code(), 0x0902);
        assert_eq!(BuildInfo::Log.code(), 0x1183);
    }

    #[test]
    fn test_nd_range_from_slices() {
        let r = NdRange::from_slices(Some(&[0, 0]), &[64, 32], Some(&[2, 2])).unwrap();
        assert_eq!(r.dims(), 2);
        assert_eq!(r.global(), &[64, 32]);
        assert_eq!(r.local(), Some(&[2usize, 2][..]));
        assert_eq!(r.global_items(), 2048);

        assert!(NdRange::from_slices(None, &[], None).is_none());
        assert!(NdRange::from_slices(None, &[1, 2, 3, 4], None).is_none());
        assert!(NdRange::from_slices(Some(&[0]), &[4, 4], None).is_none());
    }

    #[test]
    fn test_queue_properties() {
        let props = QueueProperties::PROFILING | QueueProperties::OUT_OF_ORDER;
        assert!(props.contains(QueueProperties::PROFILING));
        assert!(!QueueProperties::NONE.contains(QueueProperties::PROFILING));
        assert_eq!(QueueProperties::default(), QueueProperties::PROFILING);
    }
}
