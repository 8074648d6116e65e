//! I/O event management backed by `epoll(7)`.
//!
//! Extends the scheduler with edge-triggered readiness registration per file
//! descriptor and an ordered timer set, parking idle workers in `epoll_wait`
//! instead of a spin loop.

mod manager;
pub use manager::{Event, IoManager};

/// Creates an [`std::io::Error`] with a message prefixed to the `errno`
/// value.
macro_rules! errno {
    ($($arg:tt)+) => {{
        let errno = ::std::io::Error::last_os_error();
        let prefix = format!($($arg)+);
        ::std::io::Error::new(errno.kind(), format!("{prefix}: {errno}"))
    }};
}

pub(crate) use errno;
