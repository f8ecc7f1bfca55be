//! Per-descriptor event state
//!
//! One `FdContext` per raw fd, held by the IoManager's table. The mask
//! mirrors the kernel's registration for the fd; each registered event
//! owns an `EventContext` naming who to wake. Registrations are strictly
//! one-shot: triggering an event clears its bit and empties its slot, and
//! the user re-registers on the next `add_event`.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use weft_core::{Event, EventSet};

use crate::fiber::Fiber;
use crate::scheduler::{Dispatch, Task};
use crate::Callback;

/// Who to wake when one (fd, event) pair becomes ready: a callback or a
/// parked fiber, scheduled onto the dispatcher captured at registration.
#[derive(Default)]
pub(crate) struct EventContext {
    pub scheduler: Option<Weak<dyn Dispatch>>,
    pub fiber: Option<Arc<Fiber>>,
    pub callback: Option<Callback>,
}

impl EventContext {
    pub fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.callback.is_none()
    }

    pub fn reset(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.callback = None;
    }
}

/// Table entry for one descriptor.
pub(crate) struct FdContext {
    pub inner: Mutex<FdInner>,
}

impl FdContext {
    pub fn new(fd: RawFd) -> FdContext {
        FdContext {
            inner: Mutex::new(FdInner {
                fd,
                events: EventSet::NONE,
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        }
    }
}

/// Mask plus both event slots, guarded by the per-fd mutex.
pub(crate) struct FdInner {
    pub fd: RawFd,
    pub events: EventSet,
    read: EventContext,
    write: EventContext,
}

impl FdInner {
    pub fn event_context_mut(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }

    /// Fire one registered event: clear its bit, schedule the callback
    /// (or, failing that, the parked fiber) onto the captured dispatcher,
    /// and empty the slot.
    pub fn trigger(&mut self, event: Event) {
        debug_assert!(
            self.events.contains(event),
            "trigger: fd={} event={} not in mask {}",
            self.fd,
            event,
            self.events
        );
        self.events.remove(event);

        let fd = self.fd;
        let ctx = self.event_context_mut(event);
        let scheduler = ctx.scheduler.take().and_then(|weak| weak.upgrade());
        let fiber = ctx.fiber.take();
        let callback = ctx.callback.take();

        let Some(scheduler) = scheduler else {
            tracing::error!("trigger: fd={} event={} has no live scheduler", fd, event);
            return;
        };
        if let Some(callback) = callback {
            scheduler.schedule_task(Task::call_boxed(callback));
        } else if let Some(fiber) = fiber {
            scheduler.schedule_task(Task::fiber(fiber));
        } else {
            tracing::error!("trigger: fd={} event={} has neither callback nor fiber", fd, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_is_empty() {
        let fd_ctx = FdContext::new(3);
        let mut inner = fd_ctx.inner.lock();
        assert!(inner.events.is_empty());
        assert!(inner.event_context_mut(Event::Read).is_empty());
        assert!(inner.event_context_mut(Event::Write).is_empty());
    }

    #[test]
    fn test_event_context_selection() {
        let fd_ctx = FdContext::new(3);
        let mut inner = fd_ctx.inner.lock();
        inner.event_context_mut(Event::Read).callback = Some(Box::new(|| {}));
        assert!(!inner.event_context_mut(Event::Read).is_empty());
        assert!(inner.event_context_mut(Event::Write).is_empty());

        inner.event_context_mut(Event::Read).reset();
        assert!(inner.event_context_mut(Event::Read).is_empty());
    }
}
