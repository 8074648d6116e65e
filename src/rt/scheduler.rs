//! M:N cooperative scheduling of fibers and callables over a worker pool.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::{debug, error};

use crate::rt::fiber::{Callback, Fiber, Partner, State};
use crate::rt::thread::{thread_id, Thread};

thread_local! {
    /// The scheduler this thread is dispatching for, while inside `run`.
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
    /// The fiber that task fibers on this thread switch against: the worker's
    /// thread-main fiber, or the root dispatch fiber on a `use_caller` thread.
    static DISPATCH_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Returns the dispatch fiber installed on this thread, if any.
pub(crate) fn dispatch_fiber() -> Option<Arc<Fiber>> {
    DISPATCH_FIBER.with(|c| c.borrow().clone())
}

/// Hooks through which an extension (the I/O manager) overrides the
/// scheduler's parking behavior.
pub(crate) trait Parker: Send + Sync {
    /// Called once per worker as it enters its dispatch loop.
    fn bind_thread(&self) {}

    /// Wake one idle worker out of its blocking wait.
    fn tickle(&self);

    /// Runs one round of idle work (e.g. one `epoll_wait`). Returns `false`
    /// once the dispatch loop may exit; the idle fiber yields between rounds.
    fn idle_round(&self) -> bool;

    /// Whether the scheduler, including extension state, may stop.
    fn stopping(&self) -> bool;
}

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(Callback),
}

/// A schedulable unit of work: either a fiber to resume or a callable that a
/// worker wraps in a reusable callback fiber.
pub struct Task {
    kind: TaskKind,
}

impl Task {
    /// A task that resumes `fiber`. The fiber must be `Ready` by the time a
    /// worker dequeues it.
    pub fn from_fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            kind: TaskKind::Fiber(fiber),
        }
    }

    /// A task that invokes `cb` once on some worker.
    pub fn from_fn<F>(cb: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::from_boxed(Box::new(cb))
    }

    pub(crate) fn from_boxed(cb: Callback) -> Task {
        Task {
            kind: TaskKind::Call(cb),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TaskKind::Fiber(fiber) => f.debug_tuple("Task::Fiber").field(&fiber.id()).finish(),
            TaskKind::Call(_) => f.debug_tuple("Task::Call").finish(),
        }
    }
}

/// A queued task plus its optional worker pinning.
struct ScheduleTask {
    kind: TaskKind,
    /// `None` means any worker may take it; otherwise only the worker with
    /// this kernel thread ID.
    thread: Option<libc::pid_t>,
}

/// M:N cooperative scheduler dispatching [`Task`]s to a fixed worker pool.
///
/// Workers pull from a single FIFO queue and run each task as a fiber; when
/// the queue is empty a worker resumes its idle fiber, which by default spins
/// yielding and is overridden by the I/O manager to park in `epoll_wait`.
///
/// With `use_caller` the constructing thread itself participates: dispatch
/// for that thread runs on a dedicated root fiber which [`stop`] resumes, so
/// only `threads - 1` extra OS threads are spawned.
///
/// [`stop`]: Scheduler::stop
pub struct Scheduler {
    name: String,
    /// FIFO task queue; the mutex also orders the counters below with it.
    queue: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<libc::pid_t>>,
    /// Number of worker OS threads `start` spawns.
    thread_count: usize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stopping: AtomicBool,
    use_caller: bool,
    /// Kernel thread ID of the caller thread, -1 unless `use_caller`.
    root_thread: libc::pid_t,
    /// Dispatch fiber for the caller thread in `use_caller` mode.
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    parker: OnceLock<Weak<dyn Parker>>,
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` total dispatchers.
    ///
    /// With `use_caller`, the constructing thread counts as one dispatcher
    /// and [`stop`](Scheduler::stop) must later be invoked from it.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero, or if `use_caller` is set on a thread
    /// that already drives another scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler requires at least one thread");

        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_thread = -1;
            let mut root_fiber = None;

            if use_caller {
                thread_count -= 1;

                // The caller thread becomes a worker: give it a main fiber
                // and a dedicated root fiber to dispatch on.
                Fiber::current();
                assert!(
                    Scheduler::current().is_none(),
                    "thread already participates in a scheduler"
                );
                CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(weak.clone()));

                let w = weak.clone();
                let fiber = Fiber::with_options(
                    Box::new(move || {
                        if let Some(sched) = w.upgrade() {
                            sched.run();
                        }
                    }),
                    0,
                    // The root fiber is not itself scheduled; when its
                    // dispatch loop ends it returns to the caller's stack.
                    Partner::ThreadMain,
                );
                DISPATCH_FIBER.with(|c| *c.borrow_mut() = Some(Arc::clone(&fiber)));

                root_thread = thread_id();
                root_fiber = Some(fiber);
            }

            Scheduler {
                name: name.to_owned(),
                queue: Mutex::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_ids: Mutex::new(if use_caller { vec![root_thread] } else { Vec::new() }),
                thread_count,
                active_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                use_caller,
                root_thread,
                root_fiber: Mutex::new(root_fiber),
                parker: OnceLock::new(),
                weak_self: weak.clone(),
            }
        })
    }

    /// Returns the scheduler the calling thread is dispatching for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread IDs of all dispatchers, caller thread included.
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.thread_ids.lock().unwrap().clone()
    }

    /// Installs the extension hooks. May only be done once, before `start`.
    pub(crate) fn set_parker(&self, parker: Weak<dyn Parker>) {
        if self.parker.set(parker).is_err() {
            panic!("scheduler hooks already installed");
        }
    }

    fn parker(&self) -> Option<Arc<dyn Parker>> {
        self.parker.get().and_then(Weak::upgrade)
    }

    /// Spawns the worker pool. Idempotent while running; rejected with an
    /// error log once the scheduler has been stopped.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();

        if self.stopping.load(Ordering::Acquire) {
            error!("scheduler {:?}: start rejected, already stopped", self.name);
            return;
        }
        if !threads.is_empty() {
            return;
        }

        let mut ids = self.thread_ids.lock().unwrap();
        for i in 0..self.thread_count {
            let sched = self.weak_self.upgrade().expect("scheduler vanished during start");
            let name = format!("{}_{}", self.name, i);
            let thread = Thread::new(move || sched.run(), &name);
            ids.push(thread.id());
            threads.push(thread);
        }
    }

    /// Appends a callable to the task queue, waking an idle worker if any.
    pub fn schedule<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::from_fn(cb), None);
    }

    /// Appends a fiber to the task queue, waking an idle worker if any.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.schedule_task(Task::from_fiber(fiber), None);
    }

    /// Appends `task`, optionally pinned to the worker with kernel thread ID
    /// `thread`. Tasks are dispatched FIFO within their eligible subset.
    pub fn schedule_task(&self, task: Task, thread: Option<libc::pid_t>) {
        {
            let mut queue = self.queue.lock().unwrap();
            queue.push_back(ScheduleTask {
                kind: task.kind,
                thread,
            });
        }

        if self.idle_count.load(Ordering::Acquire) > 0 {
            self.tickle();
        }
    }

    /// Wakes one idle worker. A no-op unless the I/O manager installed its
    /// self-pipe hook.
    pub(crate) fn tickle(&self) {
        if let Some(parker) = self.parker() {
            parker.tickle();
        }
    }

    /// True iff a stop was requested, the queue has drained, and no worker is
    /// running a task. Extensions add their own conditions on top.
    pub fn stopping(&self) -> bool {
        match self.parker() {
            Some(parker) => parker.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Whether at least one worker is parked in its idle fiber.
    pub(crate) fn has_idle_workers(&self) -> bool {
        self.idle_count.load(Ordering::Acquire) > 0
    }

    /// The scheduler-only part of [`stopping`](Scheduler::stopping).
    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
            && self.queue.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }

    /// Requests a cooperative stop and waits for it to complete: the queue
    /// drains, every worker's idle fiber terminates, and all worker threads
    /// are joined. In `use_caller` mode the remaining work is dispatched on
    /// the calling thread via the root fiber.
    ///
    /// Idempotent once stopping has completed.
    ///
    /// # Panics
    ///
    /// Panics when called from the wrong thread: `use_caller` schedulers must
    /// be stopped from the constructing thread, others from outside the pool.
    pub fn stop(&self) {
        if self.stopping() {
            return;
        }
        debug!("scheduler {:?}: stopping", self.name);
        self.stopping.store(true, Ordering::Release);

        let is_current = Scheduler::current()
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(&s), self as *const Scheduler));
        if self.use_caller {
            assert!(
                is_current,
                "a use_caller scheduler must be stopped from its caller thread"
            );
        } else {
            assert!(
                !is_current,
                "stop must not be called from a worker of this scheduler"
            );
        }

        for _ in 0..self.thread_count {
            self.tickle();
        }

        let root_fiber = self.root_fiber.lock().unwrap().clone();
        if root_fiber.is_some() {
            self.tickle();
        }

        if let Some(root) = root_fiber {
            // Dispatch the remaining work on the caller thread; returns once
            // this thread's idle fiber has terminated.
            root.resume();
        }

        let mut threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in &mut threads {
            thread.join();
        }
        debug!("scheduler {:?}: stopped", self.name);
    }

    /// Per-worker dispatch loop.
    fn run(self: &Arc<Self>) {
        let tid = thread_id();
        debug!("scheduler {:?}: worker {} dispatching", self.name, tid);

        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(Arc::downgrade(self)));
        if tid != self.root_thread {
            // Ordinary workers dispatch directly on their thread-main fiber;
            // only the use_caller thread dispatches on a dedicated root fiber.
            DISPATCH_FIBER.with(|c| *c.borrow_mut() = Some(Fiber::current()));
        }
        if let Some(parker) = self.parker() {
            parker.bind_thread();
        }

        let weak = Arc::downgrade(self);
        let idle_fiber =
            Fiber::with_options(Box::new(move || idle_main(weak)), 0, Partner::Dispatch);
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut queue = self.queue.lock().unwrap();
                let mut picked = None;
                for (i, t) in queue.iter().enumerate() {
                    // Pinned to another worker: leave it, but make sure that
                    // worker gets woken.
                    if t.thread.is_some_and(|target| target != tid) {
                        tickle_me = true;
                        continue;
                    }

                    if let TaskKind::Fiber(fiber) = &t.kind {
                        assert_eq!(fiber.state(), State::Ready, "queued fiber must be READY");
                    }
                    picked = Some(i);
                    break;
                }

                if let Some(i) = picked {
                    task = queue.remove(i);
                    self.active_count.fetch_add(1, Ordering::AcqRel);
                    tickle_me |= !queue.is_empty();
                }
            }

            if tickle_me {
                self.tickle();
            }

            match task.map(|t| t.kind) {
                Some(TaskKind::Fiber(fiber)) => {
                    // Returns when the fiber yields or terminates; a yielded
                    // fiber re-enters the queue only via an external
                    // reschedule (e.g. an I/O event trigger).
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::AcqRel);
                }
                Some(TaskKind::Call(cb)) => {
                    match &cb_fiber {
                        Some(fiber) => fiber.reset_boxed(cb),
                        None => cb_fiber = Some(Fiber::with_options(cb, 0, Partner::Dispatch)),
                    }
                    let fiber = cb_fiber.as_ref().unwrap();
                    fiber.resume();
                    self.active_count.fetch_sub(1, Ordering::AcqRel);

                    if fiber.state() == State::Ready {
                        // The callback parked itself mid-run; whoever wakes it
                        // owns it now, so stop reusing this fiber.
                        cb_fiber = None;
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        break;
                    }
                    self.idle_count.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.resume();
                    self.idle_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        debug!("scheduler {:?}: worker {} exiting", self.name, tid);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("thread_count", &self.thread_count)
            .field("use_caller", &self.use_caller)
            .field("stopping", &self.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        assert!(
            self.stopping.load(Ordering::Acquire),
            "scheduler {:?} dropped without stop()",
            self.name
        );
    }
}

/// Body of every worker's idle fiber: run extension idle rounds (or check the
/// stop predicate) and yield back to the dispatch loop in between, until the
/// scheduler may stop. Strong references are confined to one round so workers
/// never pin the extension alive while parked.
fn idle_main(weak: Weak<Scheduler>) {
    loop {
        let proceed = {
            let Some(sched) = weak.upgrade() else { break };
            match sched.parker() {
                Some(parker) => parker.idle_round(),
                None => !sched.base_stopping(),
            }
        };

        if !proceed {
            break;
        }
        Fiber::yield_current();
    }
}
