//! Stackful cooperative fiber
//!
//! A `Fiber` owns a guard-paged stack and a saved register context, and
//! switches symmetrically: `resume` saves the resumer's context and loads
//! the fiber's; a yield does the reverse. The swap partner depends on how
//! the fiber was built: a fiber with `run_in_scheduler` swaps with the
//! thread's scheduling fiber, an ad-hoc fiber swaps with the thread's
//! main fiber. The main fiber is the OS thread's original stack and is
//! materialized lazily on first access.
//!
//! A fiber never migrates once it has been resumed: whichever thread
//! performs the first resume owns every later swap.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use weft_core::{FiberId, FiberState, WeftError, WeftResult};

use crate::arch;
use crate::config;
use crate::stack::Stack;
use crate::tls;
use crate::Callback;

/// Id generator; 0 is the "no fiber" sentinel.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Live fibers in the process (main fibers included).
static LIVE_FIBERS: AtomicU64 = AtomicU64::new(0);

/// A stackful coroutine.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    /// Swap with the scheduling fiber instead of the thread main fiber.
    run_in_scheduler: bool,
    /// None for a thread's main fiber.
    stack: Option<Stack>,
    ctx: UnsafeCell<arch::Context>,
    entry: Mutex<Option<Callback>>,
    /// Back-reference to the owning Arc, so `&self` methods can install
    /// the fiber as the thread's current one.
    self_weak: std::sync::Weak<Fiber>,
}

// The saved context and stack are only touched through resume and yield,
// and the state machine admits one RUNNING owner at a time; suspended
// fibers are inert data.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `entry` on its own stack.
    ///
    /// A `stack_size` of 0 selects the configured default
    /// (`RuntimeConfig::stack_size`). With `run_in_scheduler` set, resume
    /// and yield swap against the thread's scheduling fiber; otherwise
    /// against the thread's main fiber.
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> WeftResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            config::global().stack_size
        } else {
            stack_size
        };
        let stack = Stack::alloc(size)?;
        let stack_top = stack.top();

        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            stack: Some(stack),
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            entry: Mutex::new(Some(Box::new(entry))),
            self_weak: weak.clone(),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                stack_top,
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }

        tracing::trace!("fiber {} created, stack {} bytes", fiber.id, size);
        Ok(fiber)
    }

    /// The thread's main fiber, materialized on first access. Its saved
    /// context is the OS thread's original stack; it is RUNNING until the
    /// first switch away and never reaches TERM.
    fn new_main() -> Arc<Fiber> {
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            stack: None,
            ctx: UnsafeCell::new(arch::Context::zeroed()),
            entry: Mutex::new(None),
            self_weak: weak.clone(),
        });
        LIVE_FIBERS.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("main fiber {} created", fiber.id);
        fiber
    }

    /// The fiber currently running on this thread, creating the thread's
    /// main fiber on first access.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = tls::current_fiber() {
            return fiber;
        }
        let main = Self::thread_main();
        tls::set_current_fiber(main.clone());
        main
    }

    /// Id of the current fiber, or the sentinel if this thread has never
    /// run one.
    pub fn current_id() -> FiberId {
        tls::current_fiber().map(|f| f.id).unwrap_or(FiberId::NONE)
    }

    /// Number of live fibers in the process.
    pub fn count() -> u64 {
        LIVE_FIBERS.load(Ordering::Relaxed)
    }

    /// This thread's main fiber, creating it if needed.
    pub(crate) fn thread_main() -> Arc<Fiber> {
        if let Some(main) = tls::main_fiber() {
            return main;
        }
        let main = Self::new_main();
        tls::set_main_fiber(main.clone());
        main
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switch from the current context into this fiber.
    ///
    /// The fiber must be READY. The resumer's context is saved into the
    /// thread's scheduling fiber (for `run_in_scheduler` fibers) or main
    /// fiber, so this must be called from that fiber.
    pub fn resume(&self) -> WeftResult<()> {
        let state = self.state();
        if state != FiberState::Ready {
            return Err(WeftError::FiberState {
                expected: FiberState::Ready,
                found: state,
            });
        }

        // Ensure the main fiber exists before the first switch away from
        // the thread's original stack.
        let _ = Self::current();
        let save_into = if self.run_in_scheduler {
            tls::scheduling_fiber().ok_or(WeftError::NoScheduler)?
        } else {
            Self::thread_main()
        };

        let this = self.self_weak.upgrade().expect("fiber without a live Arc");
        tls::set_current_fiber(this);
        self.set_state(FiberState::Running);
        unsafe {
            arch::switch_context(save_into.ctx.get(), self.ctx.get());
        }
        // Back here once the fiber yields or terminates. A yield leaves
        // the fiber RUNNING so that no picker can resume it before its
        // context save completed; commit READY now that it has.
        if self.state() == FiberState::Running {
            self.set_state(FiberState::Ready);
        }
        Ok(())
    }

    /// Yield the current fiber back to its swap partner. Off-fiber (or on
    /// a thread's main fiber) this degrades to `thread::yield_now`.
    pub fn yield_now() {
        let Some(current) = tls::current_fiber() else {
            std::thread::yield_now();
            return;
        };
        let on_main = tls::main_fiber().is_some_and(|m| Arc::ptr_eq(&m, &current));
        if on_main {
            std::thread::yield_now();
            return;
        }
        current.yield_back();
    }

    /// Rebuild a TERM fiber around a new entry, reusing its stack.
    pub fn reset<F>(&self, entry: F) -> WeftResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let state = self.state();
        let Some(stack) = self.stack.as_ref() else {
            return Err(WeftError::FiberState {
                expected: FiberState::Term,
                found: state,
            });
        };
        if state != FiberState::Term {
            return Err(WeftError::FiberState {
                expected: FiberState::Term,
                found: state,
            });
        }

        *self.entry.lock() = Some(Box::new(entry));
        unsafe {
            arch::init_context(
                self.ctx.get(),
                stack.top(),
                fiber_entry as usize,
                self as *const Fiber as usize,
            );
        }
        self.set_state(FiberState::Ready);
        Ok(())
    }

    /// Switch away from this (currently running) fiber to its swap
    /// partner. By the time the resumer regains control the state reads
    /// READY, unless the trampoline already marked the fiber TERM.
    fn yield_back(&self) {
        let state = self.state();
        debug_assert!(
            matches!(state, FiberState::Running | FiberState::Term),
            "yield from fiber {} in state {}",
            self.id,
            state
        );

        let back = if self.run_in_scheduler {
            tls::scheduling_fiber().expect("scheduled fiber yielded without a scheduling fiber")
        } else {
            Self::thread_main()
        };

        tls::set_current_fiber(back.clone());
        // A yielding fiber stays RUNNING across the switch; the resumer
        // flips it to READY once the save is complete (see resume).
        unsafe {
            arch::switch_context(self.ctx.get(), back.ctx.get());
        }
        // Back here once someone resumes this fiber again.
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        // Main fibers (no stack) stay RUNNING for their thread's lifetime
        // and drop with the thread's TLS.
        debug_assert!(
            self.stack.is_none() || self.state() != FiberState::Running,
            "fiber {} dropped while RUNNING",
            self.id
        );
        LIVE_FIBERS.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!("fiber {} dropped", self.id);
    }
}

/// Entry shim called by the architecture trampoline on the fiber's own
/// stack. Runs the entry closure, marks the fiber TERM, and switches
/// away. Never returns.
extern "C" fn fiber_entry(arg: usize) {
    let fiber = unsafe { &*(arg as *const Fiber) };

    let entry = fiber.entry.lock().take();
    if let Some(entry) = entry {
        // Unwinding must not cross the assembly switch frame.
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("non-string panic payload");
            tracing::error!("fiber {} panicked: {}", fiber.id(), msg);
        }
    }

    fiber.set_state(FiberState::Term);
    fiber.yield_back();
    unreachable!("TERM fiber {} was resumed", fiber.id());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_resume_yield_resume() {
        let log = Arc::new(StdMutex::new(Vec::new()));

        let log2 = log.clone();
        let fiber = Fiber::new(
            move || {
                log2.lock().unwrap().push(1);
                Fiber::yield_now();
                log2.lock().unwrap().push(3);
            },
            0,
            false,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        log.lock().unwrap().push(2);
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_resume_term_is_error() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);

        let err = fiber.resume().unwrap_err();
        assert_eq!(
            err,
            WeftError::FiberState {
                expected: FiberState::Ready,
                found: FiberState::Term,
            }
        );
    }

    #[test]
    fn test_reset_reuses_stack() {
        let ran = Arc::new(StdMutex::new(0u32));

        let r = ran.clone();
        let fiber = Fiber::new(move || *r.lock().unwrap() += 1, 0, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(*ran.lock().unwrap(), 1);

        let r = ran.clone();
        fiber.reset(move || *r.lock().unwrap() += 10).unwrap();
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume().unwrap();
        assert_eq!(*ran.lock().unwrap(), 11);
    }

    #[test]
    fn test_reset_requires_term() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        assert!(fiber.reset(|| {}).is_err());
    }

    #[test]
    fn test_current_inside_fiber() {
        let seen = Arc::new(StdMutex::new(FiberId::NONE));

        let s = seen.clone();
        let fiber = Fiber::new(
            move || {
                *s.lock().unwrap() = Fiber::current_id();
            },
            0,
            false,
        )
        .unwrap();
        let id = fiber.id();
        fiber.resume().unwrap();

        assert_eq!(*seen.lock().unwrap(), id);
    }

    #[test]
    fn test_panicking_fiber_terminates() {
        let fiber = Fiber::new(|| panic!("boom"), 0, false).unwrap();
        fiber.resume().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_current_id_off_fiber() {
        // Fresh test thread: no fiber has run here yet.
        std::thread::spawn(|| {
            assert_eq!(Fiber::current_id(), FiberId::NONE);
        })
        .join()
        .unwrap();
    }
}
