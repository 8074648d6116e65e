//! The `silk` runtime.
//!
//! One core feature of modern operating systems is `multitasking`, the
//! ability to interleave the execution of multiple tasks concurrently. The
//! two main forms of multitasking are `preemptive` and `cooperative`.
//!
//! Preemptive multitasking is the approach used by operating systems to
//! control the execution of tasks (`threads`), including when they are
//! scheduled and the duration of their execution. Since threads can be
//! interrupted at arbitrary points, the OS must be able to save and restore
//! their full execution state behind their backs, and every thread pays for
//! its own kernel-managed call stack and for crossing the kernel boundary on
//! each switch.
//!
//! Cooperative multitasking instead gives the responsibility of yielding CPU
//! time to the tasks themselves. This crate takes the *stackful coroutine*
//! flavor of that idea: each task is a [`Fiber`] owning a real call stack and
//! a saved machine context, and switching between fibers is a plain
//! user-space context swap, with no kernel involvement and no poll-based
//! state machines. A fiber runs until it explicitly yields or returns; the
//! price is that a misbehaving fiber which never yields starves its worker.
//!
//! Because the OS is not involved in this scheduling, a runtime is required
//! to multiplex fibers onto OS threads. The [`Scheduler`] dispatches fibers
//! and plain callables onto a fixed worker pool from a single FIFO queue,
//! and the [`IoManager`] extends it so that idle workers park in
//! `epoll_wait(7)` — bounded by the earliest [`Timer`] deadline — instead of
//! spinning, waking through a self-pipe whenever new work arrives.
//!
//! [`Fiber`]: fiber::Fiber
//! [`Scheduler`]: scheduler::Scheduler
//! [`IoManager`]: io::IoManager
//! [`Timer`]: timer::Timer

#[cfg(not(target_os = "linux"))]
compile_error!("silk only supports Linux systems with ucontext(3) and epoll(7).");

pub mod fiber;
pub mod io;
pub mod logging;
pub mod scheduler;
pub mod timer;

pub(crate) mod thread;

pub use fiber::{Fiber, State, DEFAULT_STACK_SIZE};
pub use io::{Event, IoManager};
pub use scheduler::{Scheduler, Task};
pub use timer::Timer;
