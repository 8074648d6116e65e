use std::cell::RefCell;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{error, warn};

use crate::rt::fiber::{Callback, Fiber, State};
use crate::rt::io::errno;
use crate::rt::scheduler::{Parker, Scheduler, Task};
use crate::rt::timer::{Timer, TimerCallback, TimerManager, TimerNotify};

thread_local! {
    /// The I/O manager this thread dispatches for, installed when a worker
    /// enters its dispatch loop (and on the caller thread in `use_caller`
    /// mode).
    static CURRENT_IO: RefCell<Option<Weak<IoManager>>> = const { RefCell::new(None) };
}

/// I/O direction of interest on a file descriptor.
///
/// The discriminants overlay the epoll event masks, so no remapping happens
/// on the way in or out of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Event {
    /// Read readiness (`EPOLLIN`).
    Read = libc::EPOLLIN as u32,
    /// Write readiness (`EPOLLOUT`).
    Write = libc::EPOLLOUT as u32,
}

impl Event {
    fn mask(self) -> u32 {
        self as u32
    }
}

/// What runs when an armed direction fires: exactly one of a parked fiber to
/// reschedule or a callback to submit.
enum EventTask {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

/// Per-direction registration state.
struct EventContext {
    /// Scheduler the task is submitted to on firing, captured at arm time.
    scheduler: Option<Weak<Scheduler>>,
    /// `Some` exactly while the direction is armed.
    task: Option<EventTask>,
}

impl EventContext {
    const fn empty() -> EventContext {
        EventContext {
            scheduler: None,
            task: None,
        }
    }
}

/// Mutable part of an [`FdContext`], guarded by its mutex.
struct FdState {
    /// Mask of armed directions.
    events: u32,
    read: EventContext,
    write: EventContext,
}

impl FdState {
    fn event_context(&mut self, event: Event) -> &mut EventContext {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// Per-file-descriptor record: the armed event mask plus one registration
/// slot per direction.
///
/// The address of an `FdContext` is stored in `epoll_event.data.ptr`, so the
/// fd table holds them behind `Arc`s and never frees a slot while the manager
/// lives.
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            state: Mutex::new(FdState {
                events: 0,
                read: EventContext::empty(),
                write: EventContext::empty(),
            }),
        })
    }

    /// Disarms `event` and hands its registered task to the scheduler that
    /// was captured at arm time. The caller holds the state lock and owns the
    /// pending-count decrement.
    fn trigger_event(state: &mut FdState, event: Event) {
        assert_ne!(
            state.events & event.mask(),
            0,
            "triggering an unarmed direction"
        );
        state.events &= !event.mask();

        let ctx = state.event_context(event);
        let scheduler = ctx.scheduler.take().and_then(|weak| weak.upgrade());
        let task = ctx.task.take().expect("armed direction without a task");

        let Some(scheduler) = scheduler else {
            warn!("dropping triggered event: its scheduler is gone");
            return;
        };
        match task {
            EventTask::Fiber(fiber) => scheduler.schedule_task(Task::from_fiber(fiber), None),
            EventTask::Call(cb) => scheduler.schedule_task(Task::from_boxed(cb), None),
        }
    }
}

/// Scheduler extension driving non-blocking I/O and timers through a single
/// `epoll` instance.
///
/// Idle workers park in `epoll_wait`, bounded by the earliest timer deadline;
/// ready events and expired timers are pushed back into the task queue, and
/// submissions from outside wake a parked worker through a self-pipe.
///
/// `IoManager` dereferences to its [`Scheduler`], so `schedule`, `stop`,
/// `stopping` and friends are called directly on it.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// Self-pipe used by `tickle`; index 0 is the read end, 1 the write end.
    tickle_fds: [RawFd; 2],
    /// Count of armed directions across all fd contexts.
    pending_events: AtomicUsize,
    /// Fd table indexed by fd number, grown by 1.5x on demand. The lock is
    /// never held while touching epoll or an `FdContext`.
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    weak_self: Weak<IoManager>,
}

impl IoManager {
    /// Number of ready events harvested per `epoll_wait`.
    const MAX_EVENTS: usize = 256;

    /// Upper bound on one idle park, in milliseconds.
    const MAX_TIMEOUT_MS: u64 = 5000;

    /// Creates an I/O manager and starts its scheduler.
    ///
    /// `threads`, `use_caller` and `name` are passed through to
    /// [`Scheduler::new`].
    ///
    /// # Panics
    ///
    /// Panics if the epoll instance or the self-pipe cannot be set up.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let manager = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let scheduler = Scheduler::new(threads, use_caller, name);
            scheduler.set_parker(weak.clone());

            let timers = TimerManager::new();
            timers.set_notify(weak.clone());

            // SAFETY: Plain syscalls; every return value is checked.
            let (epfd, tickle_fds) = unsafe {
                let epfd = libc::epoll_create1(0);
                assert!(epfd >= 0, "{}", errno!("failed to create epoll instance"));

                let mut fds = [0; 2];
                let rc = libc::pipe(fds.as_mut_ptr());
                assert_eq!(rc, 0, "{}", errno!("failed to create self-pipe"));

                // The read end is drained in a loop inside `idle`, so it must
                // not block.
                let rc = libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
                assert_eq!(rc, 0, "{}", errno!("failed to set self-pipe non-blocking"));

                // Level-triggered on purpose: the only registration that is
                // not edge-triggered. The fd number doubles as the cookie.
                let mut event = libc::epoll_event {
                    events: libc::EPOLLIN as u32,
                    u64: fds[0] as u64,
                };
                let rc = libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut event);
                assert_eq!(rc, 0, "{}", errno!("failed to register self-pipe"));

                (epfd, fds)
            };

            let mut contexts = Vec::new();
            grow_table(&mut contexts, 32);

            IoManager {
                scheduler,
                timers,
                epfd,
                tickle_fds,
                pending_events: AtomicUsize::new(0),
                fd_contexts: RwLock::new(contexts),
                weak_self: weak.clone(),
            }
        });

        if use_caller {
            CURRENT_IO.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&manager)));
        }
        manager.scheduler.start();
        manager
    }

    /// Returns the I/O manager the calling thread dispatches for, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT_IO.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Number of armed `(fd, direction)` registrations.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    /// Arms `event` on `fd`, submitting `cb` as a task once it fires.
    ///
    /// Registration is edge-triggered: after firing, the direction is
    /// disarmed and must be re-armed to observe further readiness.
    ///
    /// # Errors
    ///
    /// Returns the `epoll_ctl` error with all state rolled back.
    ///
    /// # Panics
    ///
    /// Panics if `event` is already armed on `fd`; double-arming is a
    /// programming error.
    pub fn add_event<F>(&self, fd: RawFd, event: Event, cb: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Some(Box::new(cb)))
    }

    /// Arms `event` on `fd`, capturing the currently running fiber as the
    /// task to reschedule once it fires. The fiber is expected to yield
    /// after arming and is resumed on readiness.
    ///
    /// # Errors and panics
    ///
    /// As for [`add_event`](IoManager::add_event); additionally panics when
    /// called outside a running fiber.
    pub fn add_fiber_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        self.add_event_inner(fd, event, None)
    }

    fn add_event_inner(&self, fd: RawFd, event: Event, cb: Option<Callback>) -> io::Result<()> {
        let fd_ctx = self.context_for(fd, true).expect("fd table not grown");
        let mut state = fd_ctx.state.lock().unwrap();

        assert_eq!(
            state.events & event.mask(),
            0,
            "event {event:?} already armed on fd {fd}"
        );

        let op = if state.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | state.events | event.mask(),
            u64: Arc::as_ptr(&fd_ctx) as u64,
        };

        // SAFETY: `ep` is a valid epoll_event; the cookie pointer stays valid
        // for the registration's lifetime because the fd table never frees
        // slots while the manager lives.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) };
        if rc != 0 {
            return Err(errno!("failed to arm {event:?} on fd {fd}"));
        }

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        state.events |= event.mask();

        let ctx = state.event_context(event);
        debug_assert!(ctx.scheduler.is_none() && ctx.task.is_none());

        // Fire back into whichever scheduler armed the event; callers outside
        // any dispatch loop get this manager's own scheduler.
        ctx.scheduler = Some(match Scheduler::current() {
            Some(scheduler) => Arc::downgrade(&scheduler),
            None => Arc::downgrade(&self.scheduler),
        });
        ctx.task = Some(match cb {
            Some(cb) => EventTask::Call(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    State::Running,
                    "captured fiber must be RUNNING"
                );
                EventTask::Fiber(fiber)
            }
        });

        Ok(())
    }

    /// Disarms `event` on `fd` without firing its task.
    ///
    /// Contrast with [`cancel_event`](IoManager::cancel_event), which fires
    /// the armed task exactly once. Returns whether the direction was armed.
    pub fn remove_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.context_for(fd, false) else {
            return false;
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if state.events & event.mask() == 0 {
            return false;
        }

        let left = state.events & !event.mask();
        if !self.epoll_rearm(fd_ctx.as_ref(), left) {
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        state.events = left;
        let ctx = state.event_context(event);
        ctx.scheduler = None;
        ctx.task = None;
        true
    }

    /// Disarms `event` on `fd` and fires its task exactly once, so a parked
    /// waiter is released rather than abandoned.
    ///
    /// Returns whether the direction was armed.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(fd_ctx) = self.context_for(fd, false) else {
            return false;
        };
        let mut state = fd_ctx.state.lock().unwrap();
        if state.events & event.mask() == 0 {
            return false;
        }

        let left = state.events & !event.mask();
        if !self.epoll_rearm(fd_ctx.as_ref(), left) {
            return false;
        }

        FdContext::trigger_event(&mut state, event);
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Removes `fd` from epoll entirely and fires every armed direction
    /// once. Returns `false`, without a syscall, if nothing was armed.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(fd_ctx) = self.context_for(fd, false) else {
            return false;
        };
        let mut fd_state = fd_ctx.state.lock().unwrap();
        if fd_state.events == 0 {
            return false;
        }

        let mut ep = libc::epoll_event {
            events: 0,
            u64: Arc::as_ptr(&fd_ctx) as u64,
        };
        // SAFETY: As in `add_event_inner`.
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd_ctx.fd, &mut ep) };
        if rc != 0 {
            error!("{}", errno!("failed to delete fd {fd} from epoll"));
            return false;
        }

        if fd_state.events & Event::Read.mask() != 0 {
            FdContext::trigger_event(&mut fd_state, Event::Read);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }
        if fd_state.events & Event::Write.mask() != 0 {
            FdContext::trigger_event(&mut fd_state, Event::Write);
            self.pending_events.fetch_sub(1, Ordering::AcqRel);
        }

        assert_eq!(fd_state.events, 0);
        true
    }

    /// Schedules `cb` to run on a worker in `ms` milliseconds; recurring
    /// timers re-arm themselves with the same interval each firing.
    pub fn add_timer<F>(&self, ms: u64, cb: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, Arc::new(cb), recurring)
    }

    /// Like [`add_timer`](IoManager::add_timer), but the callback only runs
    /// if `cond` still resolves to a live owner at firing time, giving lazy
    /// cancellation tied to that owner's lifetime.
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers
            .add_condition_timer(ms, Arc::new(cb), cond, recurring)
    }

    /// Whether any timer is scheduled.
    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Looks up the context for `fd`, growing the table to
    /// `ceil(fd * 1.5)` slots when `grow` is set and the fd is beyond it.
    fn context_for(&self, fd: RawFd, grow: bool) -> Option<Arc<FdContext>> {
        assert!(fd >= 0, "invalid fd {fd}");
        let idx = fd as usize;

        {
            let table = self.fd_contexts.read().unwrap();
            if idx < table.len() {
                return Some(Arc::clone(&table[idx]));
            }
        }
        if !grow {
            return None;
        }

        let mut table = self.fd_contexts.write().unwrap();
        if idx >= table.len() {
            grow_table(&mut table, (idx * 3).div_ceil(2));
        }
        Some(Arc::clone(&table[idx]))
    }

    /// Applies the remaining mask for an fd: MOD when directions stay armed,
    /// DEL when none do. Logs and reports failure on the caller paths.
    fn epoll_rearm(&self, fd_ctx: &FdContext, left: u32) -> bool {
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | left,
            u64: fd_ctx as *const FdContext as u64,
        };

        // SAFETY: As in `add_event_inner`.
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd_ctx.fd, &mut ep) };
        if rc != 0 {
            error!(
                "{}",
                errno!("failed to re-arm fd {} with mask {left:#x}", fd_ctx.fd)
            );
            return false;
        }
        true
    }

    /// One round of idle work: park in `epoll_wait` bounded by the earliest
    /// timer deadline, then harvest expired timers and ready events into the
    /// task queue. Returns `false` once the manager may stop.
    fn run_idle_round(&self) -> bool {
        let next_timeout = self.timers.next_timer();
        if self.stopping_with(next_timeout) {
            return false;
        }

        let timeout = next_timeout.min(Self::MAX_TIMEOUT_MS) as i32;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; Self::MAX_EVENTS];

        let ready = loop {
            // SAFETY: The buffer is valid for MAX_EVENTS entries.
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    Self::MAX_EVENTS as i32,
                    timeout,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            panic!("{}", errno!("epoll_wait failed"));
        };

        let mut expired: Vec<TimerCallback> = Vec::new();
        self.timers.list_expired(&mut expired);
        for cb in expired {
            self.scheduler
                .schedule_task(Task::from_boxed(Box::new(move || cb())), None);
        }

        for ev in &events[..ready] {
            let cookie = ev.u64;
            if cookie == self.tickle_fds[0] as u64 {
                self.drain_tickle_pipe();
                continue;
            }

            // SAFETY: The cookie was produced from an `Arc<FdContext>` held
            // by the fd table, which keeps every slot alive while the
            // manager exists.
            let fd_ctx = unsafe { &*(cookie as usize as *const FdContext) };
            let mut state = fd_ctx.state.lock().unwrap();

            let mut incoming = ev.events;
            if incoming & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // On error or hangup, every registered direction must fire,
                // or its waiter would be stranded forever.
                incoming |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events;
            }

            let mut fired = 0u32;
            if incoming & libc::EPOLLIN as u32 != 0 {
                fired |= Event::Read.mask();
            }
            if incoming & libc::EPOLLOUT as u32 != 0 {
                fired |= Event::Write.mask();
            }
            if state.events & fired == 0 {
                continue;
            }

            let left = state.events & !fired;
            let op = if left != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_DEL
            };
            let mut ep = libc::epoll_event {
                events: libc::EPOLLET as u32 | left,
                u64: cookie,
            };
            // SAFETY: As in `add_event_inner`.
            let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd_ctx.fd, &mut ep) };
            if rc != 0 {
                // Soft failure: skip this fd's triggers for this wake and
                // keep the loop running.
                error!(
                    "{}",
                    errno!("epoll_ctl({op}) failed for fd {} in idle", fd_ctx.fd)
                );
                continue;
            }

            if state.events & fired & Event::Read.mask() != 0 {
                FdContext::trigger_event(&mut state, Event::Read);
                self.pending_events.fetch_sub(1, Ordering::AcqRel);
            }
            if state.events & fired & Event::Write.mask() != 0 {
                FdContext::trigger_event(&mut state, Event::Write);
                self.pending_events.fetch_sub(1, Ordering::AcqRel);
            }
        }

        // Yield back to the dispatch loop (the idle fiber's caller) so the
        // tasks scheduled above get drained.
        true
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: Valid buffer; the read end is non-blocking.
            let n = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn stopping_with(&self, next_timeout: u64) -> bool {
        next_timeout == u64::MAX
            && self.pending_events.load(Ordering::Acquire) == 0
            && self.scheduler.base_stopping()
    }
}

impl Parker for IoManager {
    fn bind_thread(&self) {
        CURRENT_IO.with(|c| *c.borrow_mut() = Some(self.weak_self.clone()));
    }

    fn tickle(&self) {
        if !self.scheduler.has_idle_workers() {
            return;
        }

        // SAFETY: Writing one byte from a valid buffer to our own pipe.
        let rc = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        assert_eq!(rc, 1, "{}", errno!("failed to write to self-pipe"));
    }

    fn idle_round(&self) -> bool {
        self.run_idle_round()
    }

    fn stopping(&self) -> bool {
        self.pending_events.load(Ordering::Acquire) == 0
            && !self.timers.has_timer()
            && self.scheduler.base_stopping()
    }
}

impl TimerNotify for IoManager {
    fn on_timer_inserted_at_front(&self) {
        // The parked worker must recompute its sleep budget.
        Parker::tickle(self);
    }
}

impl std::ops::Deref for IoManager {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl fmt::Debug for IoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoManager")
            .field("scheduler", &*self.scheduler)
            .field("epfd", &self.epfd)
            .field("pending_events", &self.pending_events.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.scheduler.stop();

        // SAFETY: Closing fds owned by this manager; workers are joined.
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

/// Extends the fd table to `size` slots, populating every new slot. Existing
/// `Arc`s (and therefore registered cookies) are untouched.
fn grow_table(table: &mut Vec<Arc<FdContext>>, size: usize) {
    for fd in table.len()..size {
        table.push(FdContext::new(fd as RawFd));
    }
}
