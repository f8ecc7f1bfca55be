//! Monotonic timer manager
//!
//! Timers live in an ordered map keyed by (deadline, sequence): earlier
//! deadlines first, insertion order breaking ties. The owning reactor
//! polls `next_timeout()` to size its wait and `collect_expired()` to
//! harvest due callbacks; a notifier installed at setup fires whenever a
//! new timer lands at the front of the queue so a blocked reactor can
//! re-shrink its wait.
//!
//! Time is CLOCK_MONOTONIC milliseconds. A rollback of more than one hour
//! (a rewound platform clock) expires every pending timer once rather
//! than stalling them forever.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::io::IoManager;
use crate::{Callback, TimerCallback};

/// Sentinel returned by `next_timeout` when no timer is pending.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Clock rollbacks larger than this expire everything.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Current CLOCK_MONOTONIC time in milliseconds.
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct TimerKey {
    deadline: u64,
    seq: u64,
}

struct TimerNode {
    seq: u64,
    /// Deadline and period; mutated only under the manager's set lock.
    when: Mutex<TimerWhen>,
    recurring: bool,
    /// Emptied by cancel; a fire after cancel is a no-op.
    callback: Mutex<Option<TimerCallback>>,
}

#[derive(Clone, Copy)]
struct TimerWhen {
    deadline: u64,
    period: u64,
}

impl TimerNode {
    fn key(&self) -> TimerKey {
        TimerKey {
            deadline: self.when.lock().deadline,
            seq: self.seq,
        }
    }
}

/// Cancellable handle to a pending timer.
///
/// Dropping the handle does not cancel the timer.
#[derive(Clone)]
pub struct TimerHandle {
    node: Arc<TimerNode>,
    manager: Weak<TimerManager>,
}

impl TimerHandle {
    /// Cancel the timer. Atomically empties the callback, so a timer
    /// already selected for firing becomes a no-op. Returns false if the
    /// timer already fired, was cancelled, or its manager is gone.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.set.write();
        let had_callback = self.node.callback.lock().take().is_some();
        if had_callback {
            set.remove(&self.node.key());
        }
        had_callback
    }

    /// Push the deadline out to now + period, keeping the period.
    /// Returns false if the timer is no longer pending.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.set.write();
        if self.node.callback.lock().is_none() {
            return false;
        }
        if set.remove(&self.node.key()).is_none() {
            return false;
        }
        {
            let mut when = self.node.when.lock();
            when.deadline = now_ms() + when.period;
        }
        set.insert(self.node.key(), self.node.clone());
        true
    }

    /// Change the period to `ms`. With `from_now`, the new deadline is
    /// now + ms; otherwise it is anchored at the previous scheduled
    /// start. Returns false if the timer is no longer pending.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        {
            let when = self.node.when.lock();
            if when.period == ms && !from_now {
                return true;
            }
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.set.write();
        if self.node.callback.lock().is_none() {
            return false;
        }
        if set.remove(&self.node.key()).is_none() {
            return false;
        }
        {
            let mut when = self.node.when.lock();
            let start = if from_now {
                now_ms()
            } else {
                when.deadline.saturating_sub(when.period)
            };
            when.period = ms;
            when.deadline = start + ms;
        }
        // Re-insertion may make this the earliest timer; notify like a
        // fresh add.
        manager.insert_locked(self.node.clone(), set);
        true
    }
}

/// Ordered collection of pending timers.
pub struct TimerManager {
    set: RwLock<BTreeMap<TimerKey, Arc<TimerNode>>>,
    next_seq: AtomicU64,
    /// Set when the front of the queue changed and the notifier ran;
    /// cleared by `next_timeout`.
    tickled: AtomicBool,
    /// Last observed monotonic time, for rollback detection.
    previous_ms: AtomicU64,
    /// Front-insertion hook, installed by the owning reactor.
    notifier: parking_lot::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    /// Back-reference handed to timer handles.
    self_weak: Weak<TimerManager>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new_cyclic(|weak| TimerManager {
            set: RwLock::new(BTreeMap::new()),
            next_seq: AtomicU64::new(1),
            tickled: AtomicBool::new(false),
            previous_ms: AtomicU64::new(now_ms()),
            notifier: Mutex::new(None),
            self_weak: weak.clone(),
        })
    }

    /// Install the hook invoked (outside the set lock) whenever a timer
    /// is inserted at the front of the queue.
    pub fn set_front_notifier<F>(&self, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.notifier.lock() = Some(Box::new(notify));
    }

    /// Add a timer firing no earlier than `ms` milliseconds from now.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_callback(ms, Arc::new(callback), recurring)
    }

    /// Add a timer whose callback only fires while `witness` can still be
    /// upgraded; dropping the witness silently disarms it.
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
        let weak = Arc::downgrade(witness);
        self.add_timer(
            ms,
            move || {
                if weak.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    pub(crate) fn add_timer_callback(
        &self,
        ms: u64,
        callback: TimerCallback,
        recurring: bool,
    ) -> TimerHandle {
        let node = Arc::new(TimerNode {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            when: Mutex::new(TimerWhen {
                deadline: now_ms() + ms,
                period: ms,
            }),
            recurring,
            callback: Mutex::new(Some(callback)),
        });
        let set = self.set.write();
        self.insert_locked(node.clone(), set);
        TimerHandle {
            node,
            manager: self.self_weak.clone(),
        }
    }

    /// Milliseconds until the earliest deadline: 0 if one is already due,
    /// [`NO_TIMEOUT`] if none is pending. Clears the tickled flag.
    pub fn next_timeout(&self) -> u64 {
        self.tickled.store(false, Ordering::SeqCst);
        let set = self.set.read();
        let Some((key, _)) = set.iter().next() else {
            return NO_TIMEOUT;
        };
        let now = now_ms();
        if now >= key.deadline {
            0
        } else {
            key.deadline - now
        }
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.set.read().is_empty()
    }

    /// Remove every timer with deadline <= now, appending their callbacks
    /// to `out` in deadline order. Recurring timers are re-armed at
    /// now + period. A clock rollback beyond one hour expires everything.
    pub fn collect_expired(&self, out: &mut Vec<Callback>) {
        self.collect_expired_at(now_ms(), out);
    }

    fn collect_expired_at(&self, now: u64, out: &mut Vec<Callback>) {
        {
            let set = self.set.read();
            if set.is_empty() {
                // Keep the rollback baseline fresh even when idle.
                self.previous_ms.store(now, Ordering::SeqCst);
                return;
            }
        }

        let mut set = self.set.write();
        let rollover = self.detect_clock_rollover(now);
        match set.keys().next() {
            Some(first) if !rollover && first.deadline > now => return,
            Some(_) => {}
            None => return,
        }

        // Everything strictly after `now` stays; on rollback nothing does.
        let remaining = if rollover {
            BTreeMap::new()
        } else {
            set.split_off(&TimerKey {
                deadline: now + 1,
                seq: 0,
            })
        };
        let expired = std::mem::replace(&mut *set, remaining);

        out.reserve(expired.len());
        for node in expired.into_values() {
            if self.recurring_rearm(&node, now) {
                set.insert(node.key(), node.clone());
            }
            // The callback is re-read at invocation so a cancel landing
            // between collection and firing still wins. One-shot timers
            // give theirs up at that point; recurring timers keep it.
            let recurring = node.recurring;
            out.push(Box::new(move || {
                let callback = if recurring {
                    node.callback.lock().clone()
                } else {
                    node.callback.lock().take()
                };
                if let Some(callback) = callback {
                    callback();
                }
            }));
        }
    }

    /// Re-arm a recurring timer at now + period. Returns false for
    /// one-shot or cancelled timers.
    fn recurring_rearm(&self, node: &Arc<TimerNode>, now: u64) -> bool {
        if !node.recurring || node.callback.lock().is_none() {
            return false;
        }
        let mut when = node.when.lock();
        when.deadline = now + when.period;
        true
    }

    fn insert_locked(
        &self,
        node: Arc<TimerNode>,
        mut set: parking_lot::RwLockWriteGuard<'_, BTreeMap<TimerKey, Arc<TimerNode>>>,
    ) {
        let key = node.key();
        set.insert(key, node);
        let at_front = set.keys().next() == Some(&key)
            && !self.tickled.swap(true, Ordering::SeqCst);
        drop(set);
        if at_front {
            self.on_timer_inserted_at_front();
        }
    }

    fn on_timer_inserted_at_front(&self) {
        if let Some(notify) = self.notifier.lock().as_ref() {
            notify();
        }
    }

    /// True when `now` sits more than an hour before the previously
    /// observed time. Updates the baseline either way.
    fn detect_clock_rollover(&self, now: u64) -> bool {
        let previous = self.previous_ms.swap(now, Ordering::SeqCst);
        now < previous.saturating_sub(ROLLOVER_WINDOW_MS)
    }
}

/// Suspend the current fiber for at least `ms` milliseconds.
///
/// The sleep primitive layered on the core: arm a one-shot timer that
/// reschedules the current fiber, then yield. Off the runtime (no
/// IoManager on this thread, or called from a thread's main fiber, which
/// must not be handed to the scheduler) it degrades to `thread::sleep`.
pub fn sleep_ms(ms: u64) {
    let blocking_sleep = || std::thread::sleep(std::time::Duration::from_millis(ms));

    let Some(io) = IoManager::current() else {
        blocking_sleep();
        return;
    };
    let fiber = crate::fiber::Fiber::current();
    if crate::tls::main_fiber().is_some_and(|m| Arc::ptr_eq(&m, &fiber)) {
        blocking_sleep();
        return;
    }

    let weak = Arc::downgrade(&io);
    let parked = Mutex::new(Some(fiber));
    io.add_timer(
        ms,
        move || {
            if let (Some(io), Some(fiber)) = (weak.upgrade(), parked.lock().take()) {
                io.schedule_fiber(fiber);
            }
        },
        false,
    );
    crate::fiber::Fiber::yield_now();
}

/// `sleep_ms` over a `Duration`.
pub fn sleep(d: std::time::Duration) {
    sleep_ms(d.as_millis() as u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_next_timeout_empty_is_sentinel() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timeout(), NO_TIMEOUT);
    }

    #[test]
    fn test_next_timeout_tracks_front() {
        let manager = TimerManager::new();
        manager.add_timer(5000, || {}, false);
        let t = manager.next_timeout();
        assert!(t > 4000 && t <= 5000, "t = {}", t);

        manager.add_timer(100, || {}, false);
        let t = manager.next_timeout();
        assert!(t <= 100, "t = {}", t);
    }

    #[test]
    fn test_collect_in_deadline_order() {
        let manager = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (ms, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
            let order = order.clone();
            manager.add_timer(ms, move || order.lock().push(tag), false);
        }

        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms() + 100, &mut cbs);
        assert_eq!(cbs.len(), 3);
        for cb in cbs {
            cb();
        }
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        assert_eq!(manager.next_timeout(), NO_TIMEOUT);
    }

    #[test]
    fn test_cancel_before_fire() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let handle = manager.add_timer(10, move || { f.fetch_add(1, Ordering::SeqCst); }, false);
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms() + 100, &mut cbs);
        assert!(cbs.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_between_collect_and_fire_wins() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let handle = manager.add_timer(
            10,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms() + 100, &mut cbs);
        assert_eq!(cbs.len(), 1);

        // Selected but not yet invoked; cancellation must still win.
        assert!(handle.cancel());
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancel_after_fire_reports_false() {
        let manager = TimerManager::new();
        let handle = manager.add_timer(10, || {}, false);

        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms() + 100, &mut cbs);
        for cb in cbs {
            cb();
        }
        assert!(!handle.cancel());
    }

    #[test]
    fn test_recurring_rearms() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        manager.add_timer(10, move || { f.fetch_add(1, Ordering::SeqCst); }, true);

        for round in 1..=3u64 {
            let mut cbs = Vec::new();
            manager.collect_expired_at(now_ms() + round * 1000, &mut cbs);
            assert_eq!(cbs.len(), 1, "round {}", round);
            for cb in cbs {
                cb();
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(manager.has_timer());
    }

    #[test]
    fn test_recurring_cancel_stops() {
        let manager = TimerManager::new();
        let handle = manager.add_timer(10, || {}, true);

        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms() + 100, &mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(manager.has_timer());

        assert!(handle.cancel());
        assert!(!manager.has_timer());
    }

    #[test]
    fn test_refresh_pushes_deadline() {
        let manager = TimerManager::new();
        let handle = manager.add_timer(50, || {}, false);

        assert!(handle.refresh());
        let t = manager.next_timeout();
        assert!(t > 0 && t <= 50, "t = {}", t);

        // Refreshed past this collection point.
        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms(), &mut cbs);
        assert!(cbs.is_empty());
    }

    #[test]
    fn test_reset_changes_period() {
        let manager = TimerManager::new();
        let handle = manager.add_timer(50, || {}, false);

        assert!(handle.reset(5000, true));
        let t = manager.next_timeout();
        assert!(t > 4000 && t <= 5000, "t = {}", t);
    }

    #[test]
    fn test_condition_timer_dropped_witness() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let witness = Arc::new(());
        let f = fired.clone();
        manager.add_condition_timer(
            10,
            move || { f.fetch_add(1, Ordering::SeqCst); },
            &witness,
            false,
        );
        drop(witness);

        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms() + 100, &mut cbs);
        assert_eq!(cbs.len(), 1);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_condition_timer_live_witness() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let witness = Arc::new(());
        let f = fired.clone();
        manager.add_condition_timer(
            10,
            move || { f.fetch_add(1, Ordering::SeqCst); },
            &witness,
            false,
        );

        let mut cbs = Vec::new();
        manager.collect_expired_at(now_ms() + 100, &mut cbs);
        for cb in cbs {
            cb();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(witness);
    }

    #[test]
    fn test_clock_rollover_expires_all() {
        let manager = TimerManager::new();
        let far = now_ms() + 10_000_000;

        // Establish a late baseline, then observe a rewound clock.
        let mut cbs = Vec::new();
        manager.collect_expired_at(far, &mut cbs);
        manager.add_timer(60_000, || {}, false);
        manager.add_timer(120_000, || {}, false);

        manager.collect_expired_at(far - 2 * ROLLOVER_WINDOW_MS, &mut cbs);
        assert_eq!(cbs.len(), 2);
        assert!(!manager.has_timer());
    }

    #[test]
    fn test_front_notifier_fires_once_until_consumed() {
        let manager = TimerManager::new();
        let notified = Arc::new(AtomicUsize::new(0));

        let n = notified.clone();
        manager.set_front_notifier(move || { n.fetch_add(1, Ordering::SeqCst); });

        manager.add_timer(1000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Not at the front: no notification.
        manager.add_timer(5000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // New front, but the last notification is still unconsumed.
        manager.add_timer(500, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // Consuming the hint re-arms the notification.
        let _ = manager.next_timeout();
        manager.add_timer(100, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }
}
