//! Epoll-driven I/O scheduler
//!
//! `IoManager` fuses the base [`Scheduler`] with a [`TimerManager`] and
//! one epoll instance so that a fiber awaiting readiness is exactly a
//! fiber that has yielded and left its event slot pointing at itself.
//! Workers that run out of tasks block in `epoll_wait` inside the idle
//! fiber; a wake pipe breaks them out when new work or a nearer timer
//! deadline arrives.

mod epoll;
mod fd_context;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use weft_core::{Event, EventSet, FiberState, WeftError, WeftResult};

use crate::fiber::Fiber;
use crate::scheduler::{Dispatch, Scheduler, Task};
use crate::timer::{TimerHandle, TimerManager, NO_TIMEOUT};
use crate::tls;
use crate::Callback;

use epoll::{Epoll, WakePipe, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, ET};
use fd_context::FdContext;

/// epoll user token reserved for the wake pipe.
const WAKE_TOKEN: u64 = u64::MAX;

/// Readiness events handled per epoll cycle; the rest wait a cycle.
const EVENT_BATCH: usize = 256;

/// Ceiling on one epoll_wait, so shutdown and late tickles are never
/// stalled longer than this.
const MAX_TIMEOUT_MS: u64 = 5000;

/// Initial fd-context table capacity.
const INITIAL_CONTEXTS: usize = 32;

/// Scheduler + timers + epoll under one roof.
pub struct IoManager {
    sched: Scheduler,
    timers: Arc<TimerManager>,
    epoll: Epoll,
    wake: WakePipe,
    /// (fd, event) pairs registered and not yet delivered.
    pending_events: AtomicUsize,
    /// Lazily grown table indexed by raw fd.
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    self_weak: Weak<IoManager>,
}

impl IoManager {
    /// Create the manager and start its workers.
    ///
    /// See [`Scheduler::new`] for `threads`/`use_caller` semantics; in
    /// `use_caller` mode call [`IoManager::stop`] from the same thread.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> WeftResult<Arc<IoManager>> {
        let epoll = Epoll::new()?;
        let wake = WakePipe::new()?;
        epoll.ctl(
            libc::EPOLL_CTL_ADD,
            wake.read_fd(),
            EPOLLIN | ET,
            WAKE_TOKEN,
        )?;
        let sched = Scheduler::new(threads, use_caller, name)?;

        let io = Arc::new_cyclic(|weak| IoManager {
            sched,
            timers: TimerManager::new(),
            epoll,
            wake,
            pending_events: AtomicUsize::new(0),
            fd_contexts: RwLock::new(Vec::new()),
            self_weak: weak.clone(),
        });

        io.grow_table(INITIAL_CONTEXTS);
        {
            let weak = Arc::downgrade(&io);
            io.timers.set_front_notifier(move || {
                if let Some(io) = weak.upgrade() {
                    io.tickle();
                }
            });
        }
        Scheduler::start(&io)?;
        Ok(io)
    }

    /// The IoManager driving the current thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current().and_then(|d| d.as_io())
    }

    /// Stop the manager: drain tasks, deliver nothing new, join workers.
    pub fn stop(this: &Arc<IoManager>) {
        Scheduler::stop(this);
    }

    /// Register one-shot interest in `event` on `fd`.
    ///
    /// With a callback, readiness schedules the callback; without one,
    /// readiness reschedules the fiber calling this (which is expected to
    /// yield afterwards). Registering an already-registered (fd, event)
    /// pair is an error and changes nothing.
    pub fn add_event(&self, fd: RawFd, event: Event, callback: Option<Callback>) -> WeftResult<()> {
        if fd < 0 {
            return Err(WeftError::Syscall {
                call: "epoll_ctl",
                errno: libc::EBADF,
            });
        }
        let fd_ctx = self.context_for(fd);
        let mut inner = fd_ctx.inner.lock();

        if inner.events.contains(event) {
            tracing::error!(
                "add_event: fd={} event={} already registered (mask={})",
                fd,
                event,
                inner.events
            );
            return Err(WeftError::EventExists { fd, event });
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = ET | inner.events.bits() | event.bits();
        if let Err(e) = self.epoll.ctl(op, fd, mask, fd as u64) {
            tracing::error!(
                "add_event: epoll_ctl(op={}, fd={}, events={:#x}) failed: {}",
                op,
                fd,
                mask,
                e
            );
            return Err(e);
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events.insert(event);

        // Readiness wakes go to the caller's scheduler; off-runtime
        // callers fall back to this manager.
        let scheduler: Weak<dyn Dispatch> = match tls::dispatcher() {
            Some(d) => Arc::downgrade(&d),
            None => self.self_weak.clone(),
        };
        let ctx = inner.event_context_mut(event);
        debug_assert!(ctx.is_empty());
        ctx.scheduler = Some(scheduler);
        if let Some(callback) = callback {
            ctx.callback = Some(callback);
        } else {
            let fiber = Fiber::current();
            debug_assert_eq!(fiber.state(), FiberState::Running);
            ctx.fiber = Some(fiber);
        }
        Ok(())
    }

    /// `add_event` with a callback, without the boxing at the call site.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, callback: F) -> WeftResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event(fd, event, Some(Box::new(callback)))
    }

    /// Unregister `event` from `fd` without firing its waiter; the event
    /// slot is cleared. Returns false if it was not registered.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events.difference(event.into());
        if !self.update_registration(fd, remaining) {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.events = remaining;
        inner.event_context_mut(event).reset();
        true
    }

    /// Unregister `event` from `fd` and fire its waiter once, so a
    /// parked fiber wakes and can observe the cancellation. Returns false
    /// if it was not registered.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if !inner.events.contains(event) {
            return false;
        }

        let remaining = inner.events.difference(event.into());
        if !self.update_registration(fd, remaining) {
            return false;
        }

        inner.trigger(event);
        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Unregister everything on `fd`, firing each registered event once.
    /// Returns false if nothing was registered.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = fd_ctx.inner.lock();
        if inner.events.is_empty() {
            return false;
        }

        if let Err(e) = self.epoll.ctl(libc::EPOLL_CTL_DEL, fd, 0, fd as u64) {
            tracing::error!("cancel_all: epoll_ctl(DEL, fd={}) failed: {}", fd, e);
            return false;
        }

        if inner.events.contains(Event::Read) {
            inner.trigger(Event::Read);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.contains(Event::Write) {
            inner.trigger(Event::Write);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(inner.events.is_empty());
        true
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

    /// Add a timer; see [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, callback, recurring)
    }

    /// Add a witness-gated timer; see [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        witness: &Arc<T>,
        recurring: bool,
    ) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, callback, witness, recurring)
    }

    /// The embedded timer manager.
    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Registered-and-undelivered (fd, event) pairs.
    pub fn pending_event_count(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    /// Registered mask for `fd` (empty when past the table).
    pub fn registered_events(&self, fd: RawFd) -> EventSet {
        match self.lookup(fd) {
            Some(fd_ctx) => fd_ctx.inner.lock().events,
            None => EventSet::NONE,
        }
    }

    /// Issue the MOD-or-DEL that leaves only `remaining` registered.
    fn update_registration(&self, fd: RawFd, remaining: EventSet) -> bool {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = ET | remaining.bits();
        if let Err(e) = self.epoll.ctl(op, fd, mask, fd as u64) {
            tracing::error!(
                "epoll_ctl(op={}, fd={}, events={:#x}) failed: {}",
                op,
                fd,
                mask,
                e
            );
            return false;
        }
        true
    }

    /// Table entry for `fd`, growing the table 1.5x past it if needed.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.fd_contexts.read();
            if idx < table.len() {
                return table[idx].clone();
            }
        }
        self.grow_table(idx + idx / 2 + 1);
        self.fd_contexts.read()[idx].clone()
    }

    fn grow_table(&self, target: usize) {
        let mut table = self.fd_contexts.write();
        let target = target.max(INITIAL_CONTEXTS);
        while table.len() < target {
            let fd = table.len() as RawFd;
            table.push(Arc::new(FdContext::new(fd)));
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let table = self.fd_contexts.read();
        table.get(fd as usize).cloned()
    }

    /// One reactor cycle: wait, harvest timers, dispatch readiness.
    /// Returns false when the idle fiber should exit.
    fn reactor_cycle(&self, events: &mut [libc::epoll_event]) -> bool {
        let next = self.timers.next_timeout();
        if self.sched.base_stopping()
            && self.pending_events.load(Ordering::SeqCst) == 0
            && next == NO_TIMEOUT
        {
            tracing::trace!("'{}' idle exiting", self.sched.name());
            return false;
        }

        let timeout_ms = next.min(MAX_TIMEOUT_MS) as i32;
        let n = match self.epoll.wait(events, timeout_ms) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("epoll_wait failed, idle exiting: {}", e);
                return false;
            }
        };

        let mut expired = Vec::new();
        self.timers.collect_expired(&mut expired);
        for callback in expired {
            self.schedule_task(Task::call_boxed(callback));
        }

        for ev in &events[..n] {
            if ev.u64 == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }
            self.dispatch_ready(ev);
        }
        true
    }

    /// Deliver one ready epoll event to its fd context.
    fn dispatch_ready(&self, ev: &libc::epoll_event) {
        let fd = ev.u64 as RawFd;
        let Some(fd_ctx) = self.lookup(fd) else {
            return;
        };
        let mut inner = fd_ctx.inner.lock();

        // An error or hangup must wake every waiter on the fd, or a
        // registration could linger forever.
        let mut ready = ev.events;
        if ready & (EPOLLERR | EPOLLHUP) != 0 {
            ready |= (EPOLLIN | EPOLLOUT) & inner.events.bits();
        }
        let fired = EventSet::from_bits_truncate(ready).intersection(inner.events);
        if fired.is_empty() {
            return;
        }

        let remaining = inner.events.difference(fired);
        if !self.update_registration(fd, remaining) {
            return;
        }

        if fired.contains(Event::Read) {
            inner.trigger(Event::Read);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
        if fired.contains(Event::Write) {
            inner.trigger(Event::Write);
            self.pending_events.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Dispatch for IoManager {
    fn base(&self) -> &Scheduler {
        &self.sched
    }

    /// Break one worker out of `epoll_wait`. Pointless unless someone is
    /// actually parked there.
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        tracing::trace!("'{}' tickle", self.sched.name());
        self.wake.notify();
    }

    /// The base condition, plus: no undelivered events, no timers.
    fn stopping(&self) -> bool {
        self.timers.next_timeout() == NO_TIMEOUT
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }

    /// Reactor loop: block in `epoll_wait`, then yield so the scheduling
    /// fiber can drain whatever the cycle scheduled.
    fn idle(self: Arc<Self>) {
        tracing::trace!("'{}' idle fiber up on worker {:?}", self.sched.name(), tls::worker_id());
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        loop {
            if !self.reactor_cycle(&mut events) {
                break;
            }
            Fiber::yield_now();
        }
    }

    fn as_io(self: Arc<Self>) -> Option<Arc<IoManager>> {
        Some(self)
    }
}
