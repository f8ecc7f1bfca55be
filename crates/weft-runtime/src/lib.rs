//! # weft-runtime
//!
//! M:N stackful coroutine runtime for Linux.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - mmap-backed fiber stacks with guard pages
//! - The `Fiber` primitive (resume / yield / reset)
//! - A multi-threaded cooperative scheduler with a shared FIFO task queue
//! - A monotonic timer manager (one-shot, recurring, conditional)
//! - An epoll-driven I/O scheduler (`IoManager`) that makes readiness
//!   waits look like ordinary fiber suspensions
//!
//! # Architecture
//!
//! ```text
//!                 schedule() / add_event() / add_timer()
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                       IoManager                         │
//! │    Scheduler (task queue, workers) + TimerManager       │
//! │    + epoll instance + wake pipe + fd-context table      │
//! └─────────────────────────────────────────────────────────┘
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌───────────┐        ┌───────────┐         ┌───────────┐
//!  │  Worker   │        │  Worker   │   ...   │  Worker   │
//!  │ sched fib │        │ sched fib │         │ sched fib │
//!  └───────────┘        └───────────┘         └───────────┘
//!        │ resume/yield        │                     │
//!        ▼                     ▼                     ▼
//!      task fibers, callback fibers, and one idle fiber per
//!      worker; the IoManager's idle fiber blocks in epoll_wait
//! ```
//!
//! Linux-only: the reactor is epoll, stacks are mmap, time is
//! CLOCK_MONOTONIC.

pub mod config;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod stack;
pub mod timer;
pub mod tls;

pub mod arch;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::Fiber;
pub use io::IoManager;
pub use scheduler::{Dispatch, Scheduler, Task};
pub use timer::{sleep, sleep_ms, TimerHandle, TimerManager, NO_TIMEOUT};

pub use weft_core::{Event, EventSet, FiberId, FiberState, WeftError, WeftResult};

/// Callback type accepted by the scheduler and the event table.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Callback type accepted by the timer manager. Timers may be recurring,
/// so their callbacks must be re-invocable and cheap to clone.
pub type TimerCallback = std::sync::Arc<dyn Fn() + Send + Sync + 'static>;
