//! Runtime status codes.
//!
//! Every call across the runtime seam reports an `i32` status using the
//! OpenCL numbering, so the host runtime and a real ICD produce identical
//! diagnostics.

use std::fmt;

/// A status code reported by a compute runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

macro_rules! statuses {
    ($($name:ident = $code:literal),* $(,)?) => {
        impl Status {
            $(pub const $name: Status = Status($code);)*

            /// Symbolic name of the status, e.g. `CL_INVALID_VALUE`.
            pub fn name(self) -> Option<&'static str> {
                match self.0 {
                    $($code => Some(concat!("CL_", stringify!($name))),)*
                    _ => None,
                }
            }
        }
    };
}

statuses! {
    SUCCESS = 0,
    DEVICE_NOT_FOUND = -1,
    DEVICE_NOT_AVAILABLE = -2,
    COMPILER_NOT_AVAILABLE = -3,
    MEM_OBJECT_ALLOCATION_FAILURE = -4,
    OUT_OF_RESOURCES = -5,
    OUT_OF_HOST_MEMORY = -6,
    PROFILING_INFO_NOT_AVAILABLE = -7,
    BUILD_PROGRAM_FAILURE = -11,
    EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST = -14,
    INVALID_VALUE = -30,
    INVALID_DEVICE_TYPE = -31,
    INVALID_PLATFORM = -32,
    INVALID_DEVICE = -33,
    INVALID_CONTEXT = -34,
    INVALID_QUEUE_PROPERTIES = -35,
    INVALID_COMMAND_QUEUE = -36,
    INVALID_HOST_PTR = -37,
    INVALID_MEM_OBJECT = -38,
    INVALID_BINARY = -42,
    INVALID_BUILD_OPTIONS = -43,
    INVALID_PROGRAM = -44,
    INVALID_PROGRAM_EXECUTABLE = -45,
    INVALID_KERNEL_NAME = -46,
    INVALID_KERNEL_DEFINITION = -47,
    INVALID_KERNEL = -48,
    INVALID_ARG_INDEX = -49,
    INVALID_ARG_VALUE = -50,
    INVALID_ARG_SIZE = -51,
    INVALID_KERNEL_ARGS = -52,
    INVALID_WORK_DIMENSION = -53,
    INVALID_WORK_GROUP_SIZE = -54,
    INVALID_WORK_ITEM_SIZE = -55,
    INVALID_GLOBAL_OFFSET = -56,
    INVALID_EVENT_WAIT_LIST = -57,
    INVALID_EVENT = -58,
    INVALID_OPERATION = -59,
    INVALID_BUFFER_SIZE = -61,
    INVALID_GLOBAL_WORK_SIZE = -63,
    PLATFORM_NOT_FOUND_KHR = -1001,
}

impl Status {
    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Convert a raw status into `Ok(())` / `Err(status)`.
    pub fn check(code: i32) -> Result<(), Status> {
        if code == 0 {
            Ok(())
        } else {
            Err(Status(code))
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "unknown status ({})", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_names() {
        assert_eq!(Status::SUCCESS.name(), Some("CL_SUCCESS"));
        assert_eq!(Status::INVALID_VALUE.name(), Some("CL_INVALID_VALUE"));
        assert_eq!(Status(-9999).name(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Status::BUILD_PROGRAM_FAILURE.to_string(), "CL_BUILD_PROGRAM_FAILURE (-11)");
        assert_eq!(Status(-9999).to_string(), "unknown status (-9999)");
    }

    #[test]
    fn test_check() {
        assert!(Status::check(0).is_ok());
        assert_eq!(Status::check(-30), Err(Status::INVALID_VALUE));
    }
}
