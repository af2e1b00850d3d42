//! Completion and timing handles.

use crate::driver::{EventStatus, ProfilingPoint, RawEvent};
use crate::error::Result;
use crate::registry::Shared;
use std::sync::Arc;

/// Observer of one enqueued operation's completion and timing.
///
/// Unlike the owning resource wrappers, an `Event` is cheaply clonable and
/// does not own the operation it observes; dropping it has no effect on the
/// operation.
#[derive(Debug, Clone)]
pub struct Event {
    shared: Arc<Shared>,
    raw: RawEvent,
}

impl Event {
    pub(crate) fn new(shared: Arc<Shared>, raw: RawEvent) -> Self {
        Self { shared, raw }
    }

    pub(crate) fn raw(&self) -> RawEvent {
        self.raw
    }

    /// Block until the observed operation completes. No timeout: a hung
    /// device blocks forever. A failed operation surfaces here as an error.
    pub fn wait(&self) -> Result<()> {
        self.shared.guard(self.shared.driver.wait_event(self.raw))
    }

    /// Non-blocking completion query.
    pub fn status(&self) -> Result<EventStatus> {
        self.shared.guard(self.shared.driver.event_status(self.raw))
    }

    /// One of the four profiling timestamps, in nanoseconds on the driver's
    /// clock. Only valid once the operation has completed on a queue that
    /// was created with profiling enabled.
    pub fn profile(&self, point: ProfilingPoint) -> Result<u64> {
        self.shared.guard(self.shared.driver.event_profile(self.raw, point))
    }
}

pub(crate) fn raw_wait_list(wait: &[Event]) -> Vec<RawEvent> {
    wait.iter().map(Event::raw).collect()
}
