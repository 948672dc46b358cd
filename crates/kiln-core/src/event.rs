//! Completion tokens for enqueued commands.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{KilnError, Result};
use crate::handle::{EventKind, Handle};
use crate::info;
use crate::runtime::types::execution_status;
use crate::runtime::{EventInfo, ProfilingInfo, RawHandle, SharedRuntime, Status};

/// Execution state of the command behind an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// The command was abandoned with this status.
    Error(Status),
}

/// Device timestamps of a command, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventProfile {
    pub queued: u64,
    pub submitted: u64,
    pub started: u64,
    pub ended: u64,
}

impl EventProfile {
    /// Execution time on the device.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.ended.saturating_sub(self.started))
    }
}

/// Marks the completion of one enqueued transfer or dispatch; pass it in a
/// later call's wait list to order that call after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    handle: Handle<EventKind>,
}

impl Event {
    pub(crate) fn adopt(runtime: SharedRuntime, raw: RawHandle) -> Event {
        Event { handle: Handle::adopt(runtime, raw) }
    }

    pub fn handle(&self) -> &Handle<EventKind> {
        &self.handle
    }

    /// Block until the command has finished.
    pub fn wait(&self) -> Result<()> {
        let (raw, rt) = self.handle.parts()?;
        rt.wait_for_events(&[raw])
            .map_err(|status| KilnError::dispatch("clWaitForEvents", status))
    }

    /// Block until every event in `events` has finished. An empty list
    /// returns at once.
    pub fn wait_all(events: &[Event]) -> Result<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let rt = Arc::clone(first.handle.runtime()?);
        let raws = raw_list(events)?;
        rt.wait_for_events(&raws)
            .map_err(|status| KilnError::dispatch("clWaitForEvents", status))
    }

    pub fn status(&self) -> Result<EventStatus> {
        let (raw, rt) = self.handle.parts()?;
        let code: i32 = info::read_pod("clGetEventInfo(ExecutionStatus)", |out| {
            rt.event_info(raw, EventInfo::ExecutionStatus, out)
        })?;
        Ok(match code {
            execution_status::COMPLETE => EventStatus::Complete,
            execution_status::RUNNING => EventStatus::Running,
            execution_status::SUBMITTED => EventStatus::Submitted,
            execution_status::QUEUED => EventStatus::Queued,
            other => EventStatus::Error(Status(other)),
        })
    }

    /// Timestamps of a completed command on a profiling queue.
    pub fn profile(&self) -> Result<EventProfile> {
        Ok(EventProfile {
            queued: self.stamp(ProfilingInfo::Queued)?,
            submitted: self.stamp(ProfilingInfo::Submit)?,
            started: self.stamp(ProfilingInfo::Start)?,
            ended: self.stamp(ProfilingInfo::End)?,
        })
    }

    fn stamp(&self, param: ProfilingInfo) -> Result<u64> {
        let (raw, rt) = self.handle.parts()?;
        info::read_pod(&format!("clGetEventProfilingInfo({:?})", param), |out| {
            rt.event_profiling_info(raw, param, out)
        })
    }
}

pub(crate) fn raw_list(events: &[Event]) -> Result<Vec<RawHandle>> {
    events.iter().map(|e| e.handle.get()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::context::Context;
    use crate::device::Device;
    use crate::platform::Platform;
    use crate::queue::CommandQueue;
    use crate::runtime::{HostRuntime, QueueProperties};

    fn setup(properties: QueueProperties) -> (Context, CommandQueue) {
        let rt: SharedRuntime = Arc::new(HostRuntime::default());
        let device = Device::new(&Platform::new(&rt, 0).unwrap(), 0).unwrap();
        let context = Context::new(&device).unwrap();
        let queue = CommandQueue::with_properties(&context, &device, properties).unwrap();
        (context, queue)
    }

    #[test]
    fn test_status_progression() {
        let (context, queue) = setup(QueueProperties::PROFILING);
        let buffer = Buffer::<f32>::new(&context, 4).unwrap();
        let src = [1.0f32; 4];
        let event = unsafe { buffer.copy_from_host_async(&queue, &src, 0, &[]).unwrap() };
        assert_eq!(event.status().unwrap(), EventStatus::Queued);
        event.wait().unwrap();
        assert_eq!(event.status().unwrap(), EventStatus::Complete);

        let profile = event.profile().unwrap();
        assert!(profile.queued <= profile.submitted);
        assert!(profile.submitted <= profile.started);
        assert!(profile.started <= profile.ended);
    }

    #[test]
    fn test_profile_needs_profiling_queue() {
        let (context, queue) = setup(QueueProperties::NONE);
        let buffer = Buffer::<u8>::new(&context, 4).unwrap();
        let event = buffer.copy_from_host(&queue, &[1, 2, 3, 4], 0, &[]).unwrap();
        let err = event.profile().unwrap_err();
        assert!(matches!(err, KilnError::Query { .. }));
        assert_eq!(err.status(), Some(Status::PROFILING_INFO_NOT_AVAILABLE));
    }

    #[test]
    fn test_wait_all() {
        let (context, queue) = setup(QueueProperties::PROFILING);
        Event::wait_all(&[]).unwrap();
        let a = Buffer::<u16>::new(&context, 2).unwrap();
        let b = Buffer::<u16>::new(&context, 2).unwrap();
        let (sa, sb) = ([1u16, 2], [3u16, 4]);
        let events = unsafe {
            vec![
                a.copy_from_host_async(&queue, &sa, 0, &[]).unwrap(),
                b.copy_from_host_async(&queue, &sb, 0, &[]).unwrap(),
            ]
        };
        Event::wait_all(&events).unwrap();
        assert!(events.iter().all(|e| e.status().unwrap() == EventStatus::Complete));
        assert_eq!(b.read_to_vec(&queue).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_profile_duration() {
        let p = EventProfile { queued: 1, submitted: 2, started: 10, ended: 25 };
        assert_eq!(p.duration(), Duration::from_nanos(15));
    }
}
