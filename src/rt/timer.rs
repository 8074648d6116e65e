//! Absolute-deadline timers over an ordered set, with cancellation,
//! rescheduling and wall-clock rollover handling.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

/// Source of process-wide unique timer IDs, used as the ordering tiebreaker.
static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// A wall-clock regression of at least this much is treated as a clock reset.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Current wall time in milliseconds, via `gettimeofday(2)`.
///
/// The timer layer deliberately runs on this clock rather than a monotonic
/// one; backwards jumps are handled by rollover detection in
/// [`TimerManager::list_expired_at`].
pub(crate) fn current_ms() -> u64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };

    // SAFETY: `tv` is a valid out-pointer; a null timezone is permitted.
    unsafe { libc::gettimeofday(&mut tv, ptr::null_mut()) };

    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

/// Hook invoked when a timer insertion advances the earliest deadline, so
/// whoever is sleeping until the (old) earliest deadline can recompute.
pub(crate) trait TimerNotify: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerInner {
    id: u64,
    /// Requested interval in milliseconds.
    ms: AtomicU64,
    /// Absolute deadline in wall milliseconds. Only mutated while the timer
    /// is out of the ordered set, under the manager's write lock.
    next: AtomicU64,
    recurring: bool,
    /// `Some` while armed; cleared when a one-shot fires or on cancel.
    callback: Mutex<Option<TimerCallback>>,
}

impl TimerInner {
    fn key(&self) -> (u64, u64) {
        (self.next.load(Ordering::Relaxed), self.id)
    }
}

/// Handle to a scheduled timer, supporting cancellation and rescheduling.
///
/// All operations take the owning manager's write lock; a handle whose
/// manager has been dropped is inert and every operation returns `false`.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
    manager: Weak<TimerManager>,
}

impl Timer {
    /// Disarms the timer and removes it from the ordered set.
    ///
    /// Returns whether the timer was still armed.
    pub fn cancel(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.set.write().unwrap();

        let mut callback = self.inner.callback.lock().unwrap();
        if callback.is_none() {
            return false;
        }
        *callback = None;
        set.timers.remove(&self.inner.key());
        true
    }

    /// Pushes the deadline out to now + interval, keeping the interval.
    ///
    /// Returns `false` if the timer is no longer armed.
    pub fn refresh(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.set.write().unwrap();

        if self.inner.callback.lock().unwrap().is_none() {
            return false;
        }
        if set.timers.remove(&self.inner.key()).is_none() {
            return false;
        }

        self.inner
            .next
            .store(current_ms() + self.inner.ms.load(Ordering::Relaxed), Ordering::Relaxed);
        set.timers.insert(self.inner.key(), Arc::clone(&self.inner));
        true
    }

    /// Changes the interval to `ms`, re-anchoring the deadline at the current
    /// time if `from_now`, else at the timer's original start.
    ///
    /// Keeping the same interval with `from_now == false` is a no-op
    /// returning `true`. Returns `false` if the timer is no longer armed.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.inner.ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut set = manager.set.write().unwrap();

        if self.inner.callback.lock().unwrap().is_none() {
            return false;
        }
        if set.timers.remove(&self.inner.key()).is_none() {
            return false;
        }

        let start = if from_now {
            current_ms()
        } else {
            self.inner.next.load(Ordering::Relaxed) - self.inner.ms.load(Ordering::Relaxed)
        };
        self.inner.ms.store(ms, Ordering::Relaxed);
        self.inner.next.store(start + ms, Ordering::Relaxed);

        let at_front = insert_locked(&mut set, &self.inner);
        drop(set);
        if at_front {
            manager.notify_front_insert();
        }
        true
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("ms", &self.inner.ms.load(Ordering::Relaxed))
            .field("next", &self.inner.next.load(Ordering::Relaxed))
            .field("recurring", &self.inner.recurring)
            .finish()
    }
}

struct TimerSet {
    /// Total order by (deadline, id); the id tiebreaker makes removal by
    /// identity exact.
    timers: BTreeMap<(u64, u64), Arc<TimerInner>>,
    /// Set once a front insertion has been signalled; cleared when the idle
    /// loop next reads the deadline, so sleepers are re-tickled at most once
    /// per budget computation.
    tickled: bool,
    /// Last wall time observed by expiry collection, for rollover detection.
    previous_ms: u64,
}

/// Inserts `inner` under the write lock and reports whether the insertion
/// advanced the earliest deadline (and the sleeper has not been signalled
/// since it last read the deadline).
fn insert_locked(set: &mut TimerSet, inner: &Arc<TimerInner>) -> bool {
    let key = inner.key();
    set.timers.insert(key, Arc::clone(inner));

    let at_front = set.timers.first_key_value().map(|(k, _)| *k) == Some(key) && !set.tickled;
    if at_front {
        set.tickled = true;
    }
    at_front
}

/// Ordered collection of absolute-deadline timers.
pub(crate) struct TimerManager {
    set: RwLock<TimerSet>,
    notify: OnceLock<Weak<dyn TimerNotify>>,
}

impl TimerManager {
    pub(crate) fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            set: RwLock::new(TimerSet {
                timers: BTreeMap::new(),
                tickled: false,
                previous_ms: current_ms(),
            }),
            notify: OnceLock::new(),
        })
    }

    /// Installs the front-insertion hook. May only be done once.
    pub(crate) fn set_notify(&self, notify: Weak<dyn TimerNotify>) {
        if self.notify.set(notify).is_err() {
            panic!("timer notify hook already installed");
        }
    }

    fn notify_front_insert(&self) {
        if let Some(notify) = self.notify.get().and_then(Weak::upgrade) {
            notify.on_timer_inserted_at_front();
        }
    }

    /// Schedules `cb` to fire `ms` milliseconds from now, rescheduling itself
    /// every `ms` if `recurring`.
    pub(crate) fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Timer {
        let inner = Arc::new(TimerInner {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            ms: AtomicU64::new(ms),
            next: AtomicU64::new(current_ms() + ms),
            recurring,
            callback: Mutex::new(Some(cb)),
        });

        let mut set = self.set.write().unwrap();
        let at_front = insert_locked(&mut set, &inner);
        drop(set);
        if at_front {
            self.notify_front_insert();
        }

        Timer {
            inner,
            manager: Arc::downgrade(self),
        }
    }

    /// Like [`add_timer`](TimerManager::add_timer), but the callback only
    /// runs if `cond` still resolves to a live owner at firing time; a dead
    /// owner turns the firing into a no-op (lazy cancellation).
    pub(crate) fn add_condition_timer<T>(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerCallback,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        T: Send + Sync + 'static,
    {
        let guarded: TimerCallback = Arc::new(move || {
            if cond.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, guarded, recurring)
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// `u64::MAX` if no timer is scheduled.
    ///
    /// Also re-arms the front-insertion hook for the caller's next sleep.
    pub(crate) fn next_timer(&self) -> u64 {
        let mut set = self.set.write().unwrap();
        set.tickled = false;

        match set.timers.first_key_value() {
            None => u64::MAX,
            Some(((next, _), _)) => {
                let now = current_ms();
                if now >= *next {
                    0
                } else {
                    next - now
                }
            }
        }
    }

    /// Whether any timer is scheduled.
    pub(crate) fn has_timer(&self) -> bool {
        !self.set.read().unwrap().timers.is_empty()
    }

    /// Collects the callbacks of all expired timers into `out`, re-inserting
    /// recurring timers with a fresh deadline and disarming one-shot ones.
    pub(crate) fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        self.list_expired_at(current_ms(), out);
    }

    /// [`list_expired`](TimerManager::list_expired) against an explicit
    /// clock reading. If the clock has rolled back past the rollover window,
    /// every timer is treated as expired once.
    pub(crate) fn list_expired_at(&self, now_ms: u64, out: &mut Vec<TimerCallback>) {
        {
            let set = self.set.read().unwrap();
            if set.timers.is_empty() {
                return;
            }
        }

        let mut set = self.set.write().unwrap();
        if set.timers.is_empty() {
            return;
        }

        let rollover = detect_clock_rollover(&mut set, now_ms);
        if !rollover {
            if let Some(((next, _), _)) = set.timers.first_key_value() {
                if *next > now_ms {
                    return;
                }
            }
        }

        let mut expired = Vec::new();
        while let Some((&key, _)) = set.timers.first_key_value() {
            if !rollover && key.0 > now_ms {
                break;
            }
            expired.push(set.timers.remove(&key).unwrap());
        }

        out.reserve(expired.len());
        for inner in expired {
            let cb = inner.callback.lock().unwrap().clone();
            if let Some(cb) = cb {
                out.push(cb);
            }

            if inner.recurring {
                inner.next.store(now_ms + inner.ms.load(Ordering::Relaxed), Ordering::Relaxed);
                set.timers.insert(inner.key(), inner);
            } else {
                *inner.callback.lock().unwrap() = None;
            }
        }
    }
}

impl fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = self.set.read().unwrap();
        f.debug_struct("TimerManager")
            .field("timers", &set.timers.len())
            .field("tickled", &set.tickled)
            .finish()
    }
}

/// A clock reading more than [`ROLLOVER_WINDOW_MS`] behind the previous one
/// means the wall clock was reset. Updates the stored previous reading.
fn detect_clock_rollover(set: &mut TimerSet, now_ms: u64) -> bool {
    let rollover =
        now_ms < set.previous_ms && now_ms < set.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
    set.previous_ms = now_ms;
    rollover
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_cb(hits: &Arc<AtomicUsize>) -> TimerCallback {
        let hits = Arc::clone(hits);
        Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_earliest_deadline_wins() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        mgr.add_timer(5000, counting_cb(&hits), false);
        mgr.add_timer(1000, counting_cb(&hits), false);
        mgr.add_timer(3000, counting_cb(&hits), false);

        let next = mgr.next_timer();
        assert!(next <= 1000, "next timer should be the 1s one, got {next}");
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_empty_manager() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer(), u64::MAX);
        assert!(!mgr.has_timer());

        let mut cbs = Vec::new();
        mgr.list_expired(&mut cbs);
        assert!(cbs.is_empty());
    }

    #[test]
    fn test_cancel_disarms() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(10_000, counting_cb(&hits), false);
        assert!(timer.cancel());
        assert!(!mgr.has_timer());

        // Everything on a cancelled timer is a no-op returning false, except
        // the same-interval reset which short-circuits before the arm check.
        assert!(!timer.cancel());
        assert!(!timer.refresh());
        assert!(!timer.reset(20_000, true));
        assert!(timer.reset(10_000, false));
    }

    #[test]
    fn test_refresh_pushes_deadline_out() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(2000, counting_cb(&hits), false);
        assert!(timer.refresh());
        let next = mgr.next_timer();
        assert!(next > 1900 && next <= 2000, "refreshed deadline: {next}");
    }

    #[test]
    fn test_reset_rebases_interval() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(1000, counting_cb(&hits), false);
        assert!(timer.reset(1000, false));
        assert!(timer.reset(5000, true));

        let next = mgr.next_timer();
        assert!(next > 4900 && next <= 5000, "reset deadline: {next}");
    }

    #[test]
    fn test_expiry_collects_and_disarms_one_shot() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(100, counting_cb(&hits), false);

        let mut cbs = Vec::new();
        mgr.list_expired_at(current_ms() + 200, &mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(!mgr.has_timer());

        for cb in &cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Fired one-shot timers are dead.
        assert!(!timer.cancel());
        assert!(!timer.refresh());
    }

    #[test]
    fn test_recurring_reinserts() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let timer = mgr.add_timer(100, counting_cb(&hits), true);

        let mut cbs = Vec::new();
        mgr.list_expired_at(current_ms() + 150, &mut cbs);
        assert_eq!(cbs.len(), 1);
        assert!(mgr.has_timer(), "recurring timer must be re-inserted");

        assert!(timer.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_clock_rollover_expires_everything_once() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        mgr.add_timer(1_000_000, counting_cb(&hits), false);
        mgr.add_timer(2_000_000, counting_cb(&hits), false);

        // Normal reading: nothing is due.
        let mut cbs = Vec::new();
        mgr.list_expired_at(current_ms(), &mut cbs);
        assert!(cbs.is_empty());

        // The clock jumps back more than an hour: everything expires once.
        mgr.list_expired_at(current_ms() - ROLLOVER_WINDOW_MS - 60_000, &mut cbs);
        assert_eq!(cbs.len(), 2);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_requires_live_owner() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let owner = Arc::new(());
        mgr.add_condition_timer(50, counting_cb(&hits), Arc::downgrade(&owner), false);

        let mut cbs = Vec::new();
        drop(owner);
        mgr.list_expired_at(current_ms() + 100, &mut cbs);

        // Still collected as expired, but firing is a no-op.
        assert_eq!(cbs.len(), 1);
        for cb in &cbs {
            cb();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
