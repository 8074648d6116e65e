use std::cell::Cell;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::error;

thread_local! {
    /// Cached kernel thread ID, fetched once per thread.
    static THREAD_ID: Cell<libc::pid_t> = const { Cell::new(-1) };
}

/// Returns the kernel-visible thread ID (`gettid(2)`) of the calling thread.
pub(crate) fn thread_id() -> libc::pid_t {
    THREAD_ID.with(|cell| {
        let mut tid = cell.get();
        if tid == -1 {
            // SAFETY: `gettid` takes no arguments and cannot fail.
            tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
            cell.set(tid);
        }
        tid
    })
}

/// Counting semaphore built on a mutex and condition variable.
///
/// Used for the thread start handshake; the count starts at zero so the
/// constructor blocks until the spawned thread posts.
pub(crate) struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub(crate) fn new(count: u32) -> Semaphore {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the count is positive, then decrements it.
    pub(crate) fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Increments the count, waking one waiter.
    pub(crate) fn notify(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

/// OS worker thread with a synchronous start handshake.
///
/// Construction does not return until the spawned thread has recorded its
/// kernel thread ID, so [`Thread::id`] is valid the instant `new` returns.
pub(crate) struct Thread {
    handle: Option<JoinHandle<()>>,
    id: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawns a named OS thread running `cb`.
    pub(crate) fn new<F>(cb: F, name: &str) -> Thread
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid = Arc::new(Mutex::new(-1));

        let sem2 = Arc::clone(&sem);
        let tid2 = Arc::clone(&tid);
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                *tid2.lock().unwrap() = thread_id();
                // The constructor is parked on this post; it must happen
                // before the callback so `id()` is valid on return.
                sem2.notify();

                cb();
            })
            .unwrap_or_else(|e| panic!("failed to spawn thread {name:?}: {e}"));

        sem.wait();
        let id = *tid.lock().unwrap();

        Thread {
            handle: Some(handle),
            id,
            name: name.to_owned(),
        }
    }

    /// Kernel thread ID of the spawned thread.
    pub(crate) fn id(&self) -> libc::pid_t {
        self.id
    }

    /// Waits for the thread to finish.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("worker thread {:?} panicked", self.name);
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Detach if never joined; the scheduler joins every worker in `stop`.
        drop(self.handle.take());
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
