//! # weft - stackful coroutines over epoll
//!
//! A Linux server-framework core: M:N stackful fibers scheduled across a
//! fixed thread pool, with a monotonic timer manager and an epoll-driven
//! readiness reactor that make blocking-style code cooperative.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{Event, IoManager};
//!
//! fn main() -> anyhow::Result<()> {
//!     let io = IoManager::new(4, false, "weft")?;
//!
//!     // Plain callback on the pool.
//!     io.schedule(|| println!("hello from a fiber"));
//!
//!     // Cooperative sleep inside a fiber.
//!     io.schedule(|| {
//!         weft::sleep_ms(100);
//!         println!("100ms later, without blocking a thread");
//!     });
//!
//!     // One-shot readiness callback.
//!     // io.add_event_with(fd, Event::Read, move || { /* read fd */ })?;
//!
//!     IoManager::stop(&io);
//!     Ok(())
//! }
//! ```
//!
//! ## Pieces
//!
//! - [`Fiber`] - resume/yield/reset over hand-written context-switch
//!   assembly and mmap'd, guard-paged stacks
//! - [`Scheduler`] - shared FIFO task queue, worker threads, optional
//!   caller enrollment, thread-affinity hints
//! - [`TimerManager`] / [`TimerHandle`] - one-shot, recurring, and
//!   witness-gated timers on CLOCK_MONOTONIC
//! - [`IoManager`] - the composite: epoll, wake pipe, per-fd event
//!   table, and timers fused into the scheduler's idle path

pub use weft_core::{Event, EventSet, FiberId, FiberState, WeftError, WeftResult};

pub use weft_runtime::config::{self, RuntimeConfig};
pub use weft_runtime::{
    sleep, sleep_ms, Callback, Dispatch, Fiber, IoManager, Scheduler, Task, TimerCallback,
    TimerHandle, TimerManager, NO_TIMEOUT,
};
