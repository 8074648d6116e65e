//! Stackful coroutines with explicit resume/yield switching, built on
//! `ucontext(3)`.

use std::alloc::{self, Layout};
use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::{fmt, mem, ptr};

use crate::rt::io::errno;
use crate::rt::scheduler;

/// Default stack size for a [`Fiber`], in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Source of process-wide unique fiber IDs.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// Number of live fibers across the whole process.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// The fiber currently holding the CPU on this thread.
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// The fiber representing this OS thread's original stack, lazily created
    /// the first time [`Fiber::current`] runs on the thread.
    static THREAD_MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Execution state of a [`Fiber`].
///
/// Only three states are distinguished: a fiber is either runnable, running,
/// or finished. A freshly created fiber starts out `Ready`, and a fiber whose
/// callback has returned is `Term` regardless of how it got there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Runnable, either newly created or parked by a yield.
    Ready = 0,
    /// Holding the CPU of some worker thread.
    Running = 1,
    /// Callback returned; the stack may be reused via [`Fiber::reset`].
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Term,
            _ => unreachable!("invalid fiber state: {v}"),
        }
    }
}

/// Which saved context a fiber switches against on `resume`/yield.
///
/// Task fibers swap with the worker's dispatch fiber so the dispatch loop
/// regains control between tasks; the dispatch fiber itself (and standalone
/// fibers driven outside any scheduler) swap with the thread-main fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Partner {
    /// The scheduler's dispatch fiber for this worker, falling back to the
    /// thread-main fiber on threads that run no dispatch loop.
    Dispatch,
    /// Strictly the thread-main fiber.
    ThreadMain,
}

pub(crate) type Callback = Box<dyn FnOnce() + Send>;

/// Contiguous stack region owned by a fiber.
struct Stack {
    base: *mut u8,
    layout: Layout,
}

impl Stack {
    fn alloc(size: usize) -> Stack {
        let layout = Layout::from_size_align(size, 16).expect("invalid stack layout");

        // SAFETY: `layout` has non-zero size.
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }

        Stack { base, layout }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated with `layout` in `Stack::alloc`.
        unsafe { alloc::dealloc(self.base, self.layout) };
    }
}

// SAFETY: The stack is a raw allocation only ever touched by the thread that
// is currently driving the owning fiber.
unsafe impl Send for Stack {}

/// A stackful coroutine with explicit [`resume`]/[`yield_current`] switching.
///
/// Each fiber owns a machine context and (except for thread-main fibers) a
/// dedicated stack. Switching is O(1) and entirely in user space: `resume`
/// swaps the caller out and the fiber in, and the fiber runs until it yields
/// or its callback returns. A fiber whose callback has returned is `Term` and
/// may be given a new callback with [`reset`], reusing the same stack.
///
/// Fibers are driven by one thread at a time but may migrate between threads
/// across suspensions, which is how the scheduler moves them between workers.
///
/// [`resume`]: Fiber::resume
/// [`yield_current`]: Fiber::yield_current
/// [`reset`]: Fiber::reset
pub struct Fiber {
    /// Process-wide unique, monotonically increasing.
    id: u64,
    state: AtomicU8,
    /// Saved machine context; valid whenever the fiber is not running.
    ctx: UnsafeCell<libc::ucontext_t>,
    /// Absent for thread-main fibers, which run on the OS thread's own stack.
    stack: Option<Stack>,
    /// Consumed by the entry trampoline; `None` once the fiber has entered.
    callback: Mutex<Option<Callback>>,
    partner: Partner,
}

// SAFETY: A fiber is only ever executed (and its context/stack only ever
// touched) by one thread at a time; handoff between workers goes through the
// scheduler's queue mutex, which provides the necessary synchronization.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber running `cb` with the default stack size.
    ///
    /// The fiber participates in scheduler dispatch: when resumed by a worker
    /// it yields back to that worker's dispatch fiber. Outside a scheduler it
    /// swaps with the calling thread's main fiber instead.
    pub fn new<F>(cb: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::with_options(Box::new(cb), 0, Partner::Dispatch)
    }

    /// Creates a fiber like [`Fiber::new`] with an explicit stack size in
    /// bytes. A `stack_size` of 0 selects [`DEFAULT_STACK_SIZE`].
    pub fn with_stack_size<F>(cb: F, stack_size: usize) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Fiber::with_options(Box::new(cb), stack_size, Partner::Dispatch)
    }

    pub(crate) fn with_options(cb: Callback, stack_size: usize, partner: Partner) -> Arc<Fiber> {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };

        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Ready as u8),
            // SAFETY: `ucontext_t` is a plain C struct; it is fully
            // initialized by `init_context` before the first switch.
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            stack: Some(Stack::alloc(stack_size)),
            callback: Mutex::new(Some(cb)),
            partner,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        fiber.init_context();

        fiber
    }

    /// Creates the fiber standing in for the OS thread's original stack. It
    /// is born `Running` and never carries a stack or callback of its own.
    fn main_fiber() -> Arc<Fiber> {
        let fiber = Arc::new(Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Running as u8),
            // SAFETY: Zero is a valid placeholder; the slot is captured below.
            ctx: UnsafeCell::new(unsafe { mem::zeroed() }),
            stack: None,
            callback: Mutex::new(None),
            partner: Partner::ThreadMain,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        // Capture the live context so the slot holds a valid snapshot even
        // before the first switch saves into it.
        //
        // SAFETY: The context pointer is valid and exclusively ours here.
        if unsafe { libc::getcontext(fiber.ctx.get()) } != 0 {
            panic!("{}", errno!("failed to capture thread-main context"));
        }

        fiber
    }

    /// (Re)initializes the machine context to enter [`fiber_entry`] on this
    /// fiber's stack at the next switch-in.
    fn init_context(&self) {
        let stack = self
            .stack
            .as_ref()
            .expect("cannot initialize a context without a stack");

        // SAFETY: The context pointer is valid; the stack region stays alive
        // for as long as the context can be switched into, because both are
        // owned by this fiber.
        unsafe {
            let ctx = self.ctx.get();
            if libc::getcontext(ctx) != 0 {
                panic!("{}", errno!("failed to capture fiber context"));
            }

            (*ctx).uc_link = ptr::null_mut();
            (*ctx).uc_stack.ss_sp = stack.base as *mut libc::c_void;
            (*ctx).uc_stack.ss_size = stack.layout.size();

            libc::makecontext(ctx, fiber_entry, 0);
        }
    }

    /// Returns the fiber currently holding the CPU on this thread.
    ///
    /// If the thread has no fiber yet, its main fiber is created first, so
    /// this is also the entry point that turns a plain OS thread into one
    /// that can host fibers.
    pub fn current() -> Arc<Fiber> {
        CURRENT_FIBER.with(|cell| {
            let mut current = cell.borrow_mut();
            if current.is_none() {
                let main = Fiber::main_fiber();
                THREAD_MAIN_FIBER.with(|m| *m.borrow_mut() = Some(Arc::clone(&main)));
                *current = Some(main);
            }
            Arc::clone(current.as_ref().unwrap())
        })
    }

    /// Returns the ID of the fiber currently running on this thread.
    pub fn current_id() -> u64 {
        Fiber::current().id()
    }

    /// Number of live fibers in the process, thread-main fibers included.
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// Switches the calling context out and this fiber in.
    ///
    /// The fiber must be `Ready`. Control returns to the caller when the
    /// fiber yields or terminates, by which point its state is `Ready` or
    /// `Term` respectively.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is not `Ready`, including the case of resuming a
    /// fiber that has already terminated.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            State::Ready,
            "resume requires a READY fiber (id={})",
            self.id
        );

        let partner = self.partner_fiber();
        set_current(Arc::clone(self));
        self.set_state(State::Running);

        // SAFETY: Both context slots are valid. The partner slot belongs to
        // the context executing this call, so saving into it is sound; the
        // `partner` handle on this stack keeps it alive across the switch.
        let rc = unsafe { libc::swapcontext(partner.ctx.get(), self.ctx.get()) };
        assert_eq!(rc, 0, "{}", errno!("swapcontext failed in resume"));
    }

    /// Yields the CPU from the currently running fiber back to its partner
    /// context, marking it `Ready` so it can be resumed again later.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not running a fiber.
    pub fn yield_current() {
        let raw = CURRENT_FIBER
            .with(|c| c.borrow().as_ref().map(Arc::as_ptr))
            .expect("yield_current called outside of a fiber");

        // SAFETY: The fiber is kept alive for the duration of the switch by
        // its external owner (the dispatch loop, the task queue, or the
        // caller that resumed it); no handle is held on this stack.
        unsafe { (*raw).yield_now() };
    }

    /// Switches this fiber out in favor of its partner context.
    ///
    /// `Term` is a legal state here because the entry trampoline performs one
    /// final yield after the user callback returns.
    fn yield_now(&self) {
        let current = CURRENT_FIBER.with(|c| c.borrow().as_ref().map(Arc::as_ptr));
        assert_eq!(
            current,
            Some(self as *const Fiber),
            "only the running fiber may yield"
        );

        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "yield requires a RUNNING or TERM fiber (id={})",
            self.id
        );

        let partner = self.partner_fiber();
        set_current(Arc::clone(&partner));
        if state != State::Term {
            self.set_state(State::Ready);
        }

        // SAFETY: Saving into our own slot from our own stack is sound, and
        // the partner context was saved by the reciprocal switch that resumed
        // us (or captured at thread-main creation).
        let rc = unsafe { libc::swapcontext(self.ctx.get(), partner.ctx.get()) };
        assert_eq!(rc, 0, "{}", errno!("swapcontext failed in yield"));
    }

    /// Reinitializes a terminated fiber with a new callback, reusing its
    /// stack. The fiber becomes `Ready` again.
    ///
    /// # Panics
    ///
    /// Panics if the fiber has no stack or is not `Term`.
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_boxed(Box::new(cb));
    }

    pub(crate) fn reset_boxed(&self, cb: Callback) {
        assert!(self.stack.is_some(), "reset requires a fiber with a stack");
        assert_eq!(self.state(), State::Term, "reset requires a TERM fiber");

        *self.callback.lock().unwrap() = Some(cb);
        self.init_context();
        self.set_state(State::Ready);
    }

    /// Unique ID of this fiber.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current execution state.
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn partner_fiber(&self) -> Arc<Fiber> {
        match self.partner {
            Partner::ThreadMain => thread_main_fiber(),
            Partner::Dispatch => scheduler::dispatch_fiber().unwrap_or_else(thread_main_fiber),
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("partner", &self.partner)
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);

        // Thread-main fibers die with their thread while nominally RUNNING;
        // a stack-owning fiber must never be freed out from under itself.
        if self.stack.is_some() {
            assert_ne!(
                self.state(),
                State::Running,
                "fiber dropped while running (id={})",
                self.id
            );
        }
    }
}

/// Installs `fiber` as this thread's current fiber.
fn set_current(fiber: Arc<Fiber>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(fiber));
}

/// Returns this thread's main fiber, creating it if the thread has never
/// hosted a fiber before.
fn thread_main_fiber() -> Arc<Fiber> {
    THREAD_MAIN_FIBER
        .with(|m| m.borrow().clone())
        .unwrap_or_else(Fiber::current)
}

/// Entry trampoline shared by every stackful fiber.
///
/// Runs the user callback, marks the fiber `Term`, then performs the final
/// yield back to the partner context. The trampoline drops its own handle
/// before that switch: the last strong owner must never be this stack, since
/// nothing ever unwinds it.
extern "C" fn fiber_entry() {
    let current = Fiber::current();

    let cb = current
        .callback
        .lock()
        .unwrap()
        .take()
        .expect("fiber entered without a callback");
    cb();

    current.set_state(State::Term);

    let raw = Arc::as_ptr(&current);
    drop(current);

    // SAFETY: An external owner (scheduler queue, dispatch loop, or the
    // resuming caller) still holds a strong reference, so the fiber outlives
    // this final switch.
    unsafe { (*raw).yield_now() };

    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_resume_runs_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let fiber = Fiber::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_suspends_and_resumes() {
        let steps = Arc::new(Mutex::new(Vec::new()));
        let steps2 = Arc::clone(&steps);

        let fiber = Fiber::new(move || {
            steps2.lock().unwrap().push("a");
            Fiber::yield_current();
            steps2.lock().unwrap().push("b");
        });

        fiber.resume();
        assert_eq!(*steps.lock().unwrap(), vec!["a"]);
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(*steps.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    #[should_panic(expected = "resume requires a READY fiber")]
    fn test_resume_terminated_panics() {
        let fiber = Fiber::new(|| {});
        fiber.resume();
        fiber.resume();
    }

    #[test]
    fn test_reset_reuses_stack() {
        let hits = Arc::new(AtomicUsize::new(0));

        let hits2 = Arc::clone(&hits);
        let fiber = Fiber::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let hits3 = Arc::clone(&hits);
        fiber.reset(move || {
            hits3.fetch_add(10, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Ready);

        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Fiber::new(|| {});
        let b = Fiber::new(|| {});
        assert_ne!(a.id(), b.id());

        a.resume();
        b.resume();
    }

    #[test]
    fn test_current_creates_main_fiber() {
        std::thread::spawn(|| {
            let main = Fiber::current();
            assert_eq!(main.state(), State::Running);
            // The main fiber is stable across calls on the same thread.
            assert_eq!(main.id(), Fiber::current().id());
        })
        .join()
        .unwrap();
    }
}
