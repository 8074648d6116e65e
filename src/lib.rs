//! M:N stackful coroutine scheduling runtime driven by `epoll(7)`.

#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]
#![deny(unused_must_use)]

pub mod rt;
pub use rt::{Event, Fiber, IoManager, Scheduler, State, Task, Timer};
