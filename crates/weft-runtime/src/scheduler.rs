//! Cooperative M:N scheduler
//!
//! Multiplexes READY fibers and callbacks across a fixed pool of worker
//! threads. Every worker runs the same loop: scan the shared FIFO queue
//! for an eligible task, resume it, and fall back to the idle fiber when
//! the queue is empty. Dispatch-specific behavior (what "idle" does, how
//! sleeping workers are woken, when the scheduler may stop) hangs off the
//! [`Dispatch`] trait so the I/O manager can compose with the base
//! scheduler instead of inheriting from it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use weft_core::{FiberState, WeftError, WeftResult};

use crate::fiber::Fiber;
use crate::io::IoManager;
use crate::tls;
use crate::Callback;

/// A unit of schedulable work: a fiber to resume or a callback to run on
/// a fresh fiber, optionally pinned to one worker.
pub struct Task {
    kind: TaskKind,
    hint: Option<usize>,
}

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

impl Task {
    /// Task that resumes an existing fiber.
    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
            hint: None,
        }
    }

    /// Task that runs a callback on a (possibly reused) fiber.
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            kind: TaskKind::Call(Box::new(f)),
            hint: None,
        }
    }

    /// `call` for an already-boxed callback.
    pub(crate) fn call_boxed(cb: Callback) -> Task {
        Task {
            kind: TaskKind::Call(cb),
            hint: None,
        }
    }

    /// Pin this task to the worker with the given id.
    pub fn with_hint(mut self, worker_id: usize) -> Task {
        self.hint = Some(worker_id);
        self
    }
}

/// The dispatch seam between the base scheduler and its embedders.
///
/// The base [`Scheduler`] implements this directly; [`IoManager`] embeds
/// a `Scheduler` and overrides `tickle`/`idle`/`stopping` to fuse epoll
/// and timers into the same worker loop.
pub trait Dispatch: Send + Sync + 'static {
    /// The embedded base scheduler.
    fn base(&self) -> &Scheduler;

    /// Wake one sleeping worker. The base scheduler's idle fiber
    /// spin-yields, so nothing needs waking.
    fn tickle(&self) {
        tracing::trace!("tickle (base)");
    }

    /// Whether the dispatcher has fully drained and may shut down.
    fn stopping(&self) -> bool {
        self.base().base_stopping()
    }

    /// Body of the per-worker idle fiber. Runs whenever the task queue is
    /// empty; must yield regularly and return once `stopping()` holds.
    fn idle(self: Arc<Self>) {
        tracing::trace!("idle (base)");
        while !self.stopping() {
            Fiber::yield_now();
        }
    }

    /// Downcast hook for the current-scheduler lookup.
    fn as_io(self: Arc<Self>) -> Option<Arc<IoManager>> {
        None
    }

    /// Append a task to the shared queue, waking a worker if the queue
    /// was empty.
    fn schedule_task(&self, task: Task) {
        if self.base().enqueue(task) {
            self.tickle();
        }
    }
}

/// Multi-threaded fiber scheduler with a shared FIFO task queue.
pub struct Scheduler {
    name: String,
    /// Worker threads to spawn (excludes an enrolled caller).
    spawned_threads: usize,
    use_caller: bool,
    /// Worker id taken by the caller thread in `use_caller` mode.
    caller_worker_id: usize,

    tasks: Mutex<VecDeque<Task>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Scheduling fiber of the enrolled caller thread.
    root_fiber: Mutex<Option<Arc<Fiber>>>,

    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    started: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler running `threads` workers.
    ///
    /// With `use_caller`, the calling thread is enrolled as one of the
    /// workers (it participates only while `stop` drains) and one fewer
    /// thread is spawned. Fails if `threads` is zero.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> WeftResult<Scheduler> {
        if threads < 1 {
            return Err(WeftError::Config("scheduler needs at least one thread"));
        }
        let spawned = if use_caller { threads - 1 } else { threads };

        Ok(Scheduler {
            name: name.to_string(),
            spawned_threads: spawned,
            use_caller,
            caller_worker_id: spawned,
            tasks: Mutex::new(VecDeque::new()),
            handles: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the worker threads. Idempotent; a no-op once `stop` has been
    /// requested.
    pub fn start(this: &Arc<impl Dispatch>) -> WeftResult<()> {
        Self::start_dyn(this.clone())
    }

    /// Stop the scheduler: request shutdown, drain the queue (on the
    /// caller thread too in `use_caller` mode), and join the workers.
    pub fn stop(this: &Arc<impl Dispatch>) {
        Self::stop_dyn(this.clone());
    }

    /// The dispatcher driving the current thread, if any.
    pub fn current() -> Option<Arc<dyn Dispatch>> {
        tls::dispatcher()
    }

    /// Worker id of the current thread within its pool.
    pub fn current_worker_id() -> Option<usize> {
        tls::worker_id()
    }

    /// Schedule a callback on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::call(f));
    }

    /// Schedule a fiber on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::fiber(fiber));
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total workers, the enrolled caller included.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.spawned_threads + usize::from(self.use_caller)
    }

    #[inline]
    pub fn idle_thread_count(&self) -> usize {
        self.idle_threads.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn active_thread_count(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn has_idle_threads(&self) -> bool {
        self.idle_thread_count() > 0
    }

    /// Whether `stop` has been requested (the queue may still hold work).
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// The base stopping condition: stop requested, queue empty, nothing
    /// mid-flight.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.active_threads.load(Ordering::SeqCst) == 0
            && self.tasks.lock().is_empty()
    }

    /// Push a task; true if the queue was empty beforehand (the caller
    /// should tickle).
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        let mut queue = self.tasks.lock();
        let was_empty = queue.is_empty();
        queue.push_back(task);
        was_empty
    }

    fn start_dyn(this: Arc<dyn Dispatch>) -> WeftResult<()> {
        let base = this.base();
        if base.stopping.load(Ordering::SeqCst) {
            tracing::error!("start on a stopping scheduler '{}'", base.name);
            return Ok(());
        }
        if base.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tracing::trace!("scheduler '{}' starting {} workers", base.name, base.spawned_threads);
        {
            let mut handles = base.handles.lock();
            for id in 0..base.spawned_threads {
                let dispatch = this.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-{}", base.name, id))
                    .spawn(move || run_worker(dispatch, id))
                    .map_err(|e| WeftError::Syscall {
                        call: "spawn",
                        errno: e.raw_os_error().unwrap_or(0),
                    })?;
                handles.push(handle);
            }
        }

        if base.use_caller {
            // Enroll the caller: it gets the dispatcher and a dedicated
            // root scheduling fiber, resumed by stop() to drain.
            tls::set_dispatcher(this.clone());
            let _ = Fiber::current();
            let dispatch = this.clone();
            let id = base.caller_worker_id;
            let root = Fiber::new(move || run_worker(dispatch, id), 0, false)?;
            tls::set_scheduling_fiber(root.clone());
            tls::set_worker_id(id);
            *base.root_fiber.lock() = Some(root);
        }
        Ok(())
    }

    fn stop_dyn(this: Arc<dyn Dispatch>) {
        if this.stopping() {
            return;
        }
        let base = this.base();
        tracing::trace!("scheduler '{}' stopping", base.name);
        base.stopping.store(true, Ordering::SeqCst);

        for _ in 0..base.spawned_threads {
            this.tickle();
        }

        let root = base.root_fiber.lock().take();
        if root.is_some() {
            this.tickle();
        }
        if let Some(root) = root {
            // Drain on the caller thread until the stopping condition
            // holds; the root fiber returns to the thread main fiber.
            if let Err(e) = root.resume() {
                tracing::error!("root fiber resume failed: {}", e);
            }
            tracing::trace!("root fiber drained");
        }

        let handles = std::mem::take(&mut *base.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }

        // If this thread was the enrolled caller, detach it so later
        // current-scheduler lookups don't resolve to a stopped pool.
        if tls::dispatcher().is_some_and(|d| Arc::ptr_eq(&d, &this)) {
            tls::clear_dispatcher();
            if base.use_caller {
                tls::clear_scheduling_fiber();
            }
        }
    }
}

impl Dispatch for Scheduler {
    fn base(&self) -> &Scheduler {
        self
    }
}

/// The per-worker scheduling loop.
///
/// Runs on each spawned worker thread, and inside the root fiber of an
/// enrolled caller. Picks tasks FIFO, honoring thread hints and skipping
/// fibers that are still RUNNING on another worker (a schedule racing a
/// not-yet-completed yield).
fn run_worker(this: Arc<dyn Dispatch>, worker_id: usize) {
    tls::set_dispatcher(this.clone());
    tls::set_worker_id(worker_id);
    if tls::scheduling_fiber().is_none() {
        tls::set_scheduling_fiber(Fiber::thread_main());
    }
    let _ = Fiber::current();
    tracing::trace!("worker {} of '{}' running", worker_id, this.base().name());

    let idle = {
        let dispatch = this.clone();
        match Fiber::new(move || dispatch.idle(), 0, true) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("worker {}: idle fiber allocation failed: {}", worker_id, e);
                return;
            }
        }
    };

    // Spare TERM fiber reused across callback tasks.
    let mut spare: Option<Arc<Fiber>> = None;

    loop {
        let mut picked: Option<Task> = None;
        let mut tickle_me = false;
        {
            let base = this.base();
            let mut queue = base.tasks.lock();
            let mut i = 0;
            while i < queue.len() {
                let task = &queue[i];
                if let Some(hint) = task.hint {
                    if hint != worker_id {
                        // Bound to some other worker; make sure one wakes.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                }
                if let TaskKind::Fiber(fiber) = &task.kind {
                    if fiber.state() == FiberState::Running {
                        i += 1;
                        continue;
                    }
                }
                picked = queue.remove(i);
                base.active_threads.fetch_add(1, Ordering::SeqCst);
                break;
            }
            tickle_me |= !queue.is_empty();
        }
        if tickle_me {
            this.tickle();
        }

        match picked.map(|t| t.kind) {
            Some(TaskKind::Fiber(fiber)) => {
                if let Err(e) = fiber.resume() {
                    tracing::error!("worker {}: fiber resume failed: {}", worker_id, e);
                }
                this.base().active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            Some(TaskKind::Call(cb)) => {
                let fiber = match spare.take() {
                    Some(f) => {
                        f.reset(cb).expect("spare fiber must be TERM");
                        f
                    }
                    None => match Fiber::new(cb, 0, true) {
                        Ok(f) => f,
                        Err(e) => {
                            tracing::error!("worker {}: callback fiber allocation failed: {}", worker_id, e);
                            this.base().active_threads.fetch_sub(1, Ordering::SeqCst);
                            continue;
                        }
                    },
                };
                if let Err(e) = fiber.resume() {
                    tracing::error!("worker {}: callback resume failed: {}", worker_id, e);
                }
                this.base().active_threads.fetch_sub(1, Ordering::SeqCst);
                // Keep the fiber for the next callback unless it parked
                // itself mid-run (some waiter holds it now).
                if fiber.state() == FiberState::Term {
                    spare = Some(fiber);
                }
            }
            None => {
                if idle.state() == FiberState::Term {
                    tracing::trace!("worker {}: idle fiber TERM, exiting", worker_id);
                    break;
                }
                this.base().idle_threads.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = idle.resume() {
                    tracing::error!("worker {}: idle resume failed: {}", worker_id, e);
                }
                this.base().idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_for(deadline_ms: u64, cond: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(Scheduler::new(0, false, "bad").is_err());
    }

    #[test]
    fn test_schedule_callbacks_drain() {
        let sched = Arc::new(Scheduler::new(2, false, "test").unwrap());
        Scheduler::start(&sched).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = count.clone();
            sched.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(wait_for(2000, || count.load(Ordering::SeqCst) == 100));
        Scheduler::stop(&sched);
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_stop_drains_pending_tasks() {
        let sched = Arc::new(Scheduler::new(2, false, "drain").unwrap());
        Scheduler::start(&sched).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let count = count.clone();
            sched.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        Scheduler::stop(&sched);
        assert_eq!(count.load(Ordering::SeqCst), 500);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Arc::new(Scheduler::new(1, true, "caller").unwrap());
        Scheduler::start(&sched).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            sched.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        // No spawned workers: everything runs during stop, on this thread.
        Scheduler::stop(&sched);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_thread_hint_binding() {
        let sched = Arc::new(Scheduler::new(4, false, "hint").unwrap());
        Scheduler::start(&sched).unwrap();

        let wrong = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let wrong = wrong.clone();
            let done = done.clone();
            sched.schedule_task(
                Task::call(move || {
                    if Scheduler::current_worker_id() != Some(2) {
                        wrong.fetch_add(1, Ordering::SeqCst);
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .with_hint(2),
            );
        }

        assert!(wait_for(3000, || done.load(Ordering::SeqCst) == 100));
        Scheduler::stop(&sched);
        assert_eq!(wrong.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_scheduled_fiber_runs() {
        let sched = Arc::new(Scheduler::new(1, false, "fib").unwrap());
        Scheduler::start(&sched).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        )
        .unwrap();

        sched.schedule_fiber(fiber.clone());
        assert!(wait_for(1000, || hits.load(Ordering::SeqCst) == 1));
        // Parked after its yield; resuming is the waiter's job.
        assert!(wait_for(1000, || fiber.state() == FiberState::Ready));

        sched.schedule_fiber(fiber.clone());
        assert!(wait_for(1000, || hits.load(Ordering::SeqCst) == 2));
        assert!(wait_for(1000, || fiber.state() == FiberState::Term));
        Scheduler::stop(&sched);
    }
}
