//! Thread-local runtime state
//!
//! Each OS thread tracks: the fiber it is currently running, its main
//! fiber (the thread's original stack), its scheduling fiber (the fiber
//! running the scheduler's pick loop), the dispatcher it works for, and
//! its worker id. Accessors hand out clones of the `Arc`s; raw pointers
//! never cross this API.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crate::fiber::Fiber;
use crate::scheduler::Dispatch;

thread_local! {
    /// Fiber currently executing on this thread.
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's main fiber (created on first access).
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's scheduling fiber. On plain workers this is the main
    /// fiber; on a caller-enrolled thread it is the root fiber.
    static SCHEDULING_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Dispatcher this thread is working for.
    static DISPATCHER: RefCell<Option<Arc<dyn Dispatch>>> = const { RefCell::new(None) };

    /// Worker id within the dispatcher's thread pool.
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_current_fiber(fiber: Arc<Fiber>) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline]
pub fn main_fiber() -> Option<Arc<Fiber>> {
    MAIN_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_main_fiber(fiber: Arc<Fiber>) {
    MAIN_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline]
pub fn scheduling_fiber() -> Option<Arc<Fiber>> {
    SCHEDULING_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_scheduling_fiber(fiber: Arc<Fiber>) {
    SCHEDULING_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline]
pub fn dispatcher() -> Option<Arc<dyn Dispatch>> {
    DISPATCHER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_dispatcher(dispatch: Arc<dyn Dispatch>) {
    DISPATCHER.with(|cell| *cell.borrow_mut() = Some(dispatch));
}

/// Detach this thread from its dispatcher (it is shutting down).
#[inline]
pub fn clear_dispatcher() {
    DISPATCHER.with(|cell| *cell.borrow_mut() = None);
}

/// Drop this thread's scheduling fiber (caller un-enrollment).
#[inline]
pub fn clear_scheduling_fiber() {
    SCHEDULING_FIBER.with(|cell| *cell.borrow_mut() = None);
}

/// Worker id for this thread, or `None` off the pool.
#[inline]
pub fn worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|cell| cell.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

#[inline]
pub fn set_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}
