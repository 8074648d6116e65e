//! End-to-end I/O manager behavior: timers, event arming, cancellation, and
//! a socket echo driven entirely by readiness dispatch.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use silk::{Event, Fiber, IoManager};

/// Creates a connected `AF_UNIX` stream pair for readiness tests.
fn socket_pair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    // SAFETY: Valid out-array; return value checked.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn close_fd(fd: RawFd) {
    // SAFETY: The test owns the descriptor.
    unsafe { libc::close(fd) };
}

fn wait_until(deadline_msg: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out: {deadline_msg}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn recurring_timer_fires_on_interval() {
    let io = IoManager::new(2, false, "timer_io");

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    let timer = io.add_timer(
        50,
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    std::thread::sleep(Duration::from_millis(275));
    assert!(timer.cancel());
    io.stop();

    // 275 ms / 50 ms => 5 firings, with one of slack for OS jitter.
    let fired = hits.load(Ordering::SeqCst);
    assert!((4..=6).contains(&fired), "timer fired {fired} times");
}

#[test]
fn condition_timer_with_dead_owner_is_a_noop() {
    let io = IoManager::new(1, false, "cond_io");

    let hits = Arc::new(AtomicUsize::new(0));
    let owner = Arc::new(());

    let hits2 = Arc::clone(&hits);
    io.add_condition_timer(
        80,
        move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&owner),
        false,
    );
    drop(owner);

    std::thread::sleep(Duration::from_millis(200));

    // The timer was still collected as expired, so nothing blocks the stop.
    io.stop();
    assert!(!io.has_timer());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_event_fires_exactly_once() {
    let io = IoManager::new(2, false, "cancel_io");
    let (a, b) = socket_pair();
    let baseline = io.pending_events();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    io.add_event(a, Event::Read, move || {
        hits2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_events(), baseline + 1);

    // No data ever arrives; the callback must not run on its own.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    assert!(io.cancel_event(a, Event::Read));
    wait_until("cancelled callback ran", || hits.load(Ordering::SeqCst) == 1);
    assert_eq!(io.pending_events(), baseline);

    // The direction is disarmed now; a second cancel finds nothing.
    assert!(!io.cancel_event(a, Event::Read));

    io.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    close_fd(a);
    close_fd(b);
}

#[test]
fn remove_event_disarms_without_firing() {
    let io = IoManager::new(1, false, "remove_io");
    let (a, b) = socket_pair();
    let baseline = io.pending_events();

    // Nothing armed yet: no-ops all around, and no syscall for cancel_all.
    assert!(!io.remove_event(a, Event::Read));
    assert!(!io.cancel_all(a));

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    io.add_event(a, Event::Read, move || {
        hits2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(io.pending_events(), baseline + 1);

    assert!(io.remove_event(a, Event::Read));
    assert_eq!(io.pending_events(), baseline);
    assert!(!io.remove_event(a, Event::Read));

    io.stop();
    assert_eq!(hits.load(Ordering::SeqCst), 0, "remove_event must not fire");
    close_fd(a);
    close_fd(b);
}

#[test]
fn cancel_all_fires_every_armed_direction() {
    let io = IoManager::new(2, false, "cancel_all_io");
    let (a, b) = socket_pair();
    let baseline = io.pending_events();

    let fired = Arc::new(Mutex::new(Vec::new()));

    let fired2 = Arc::clone(&fired);
    io.add_event(a, Event::Read, move || {
        fired2.lock().unwrap().push("read");
    })
    .unwrap();
    let fired3 = Arc::clone(&fired);
    io.add_event(a, Event::Write, move || {
        fired3.lock().unwrap().push("write");
    })
    .unwrap();

    // The socket is writable, so the write direction fires immediately;
    // wait for it so cancel_all races nothing.
    wait_until("write readiness fired", || {
        fired.lock().unwrap().contains(&"write")
    });
    assert_eq!(io.pending_events(), baseline + 1);

    assert!(io.cancel_all(a));
    assert_eq!(io.pending_events(), baseline);
    wait_until("read callback force-fired", || {
        fired.lock().unwrap().contains(&"read")
    });

    io.stop();
    assert_eq!(fired.lock().unwrap().len(), 2);
    close_fd(a);
    close_fd(b);
}

#[test]
fn fd_table_grows_past_initial_capacity() {
    let io = IoManager::new(1, false, "grow_io");

    // Burn descriptors until one lands beyond the initial 32-slot table.
    let mut pairs = Vec::new();
    loop {
        let pair = socket_pair();
        let past_table = pair.0 >= 32;
        pairs.push(pair);
        if past_table {
            break;
        }
    }
    let (a, _b) = *pairs.last().unwrap();

    let baseline = io.pending_events();
    io.add_event(a, Event::Read, || {}).unwrap();
    assert_eq!(io.pending_events(), baseline + 1);
    assert!(io.remove_event(a, Event::Read));
    assert_eq!(io.pending_events(), baseline);

    io.stop();
    for (x, y) in pairs {
        close_fd(x);
        close_fd(y);
    }
}

#[test]
fn fiber_event_resumes_parked_fiber() {
    let io = IoManager::new(2, false, "fiber_io");
    let (a, b) = socket_pair();

    let received = Arc::new(AtomicUsize::new(0));
    let received2 = Arc::clone(&received);
    io.schedule(move || {
        // Runs as a fiber on a worker; park it on read readiness.
        let io = IoManager::current().expect("worker thread has an I/O manager");
        io.add_fiber_event(a, Event::Read).unwrap();
        Fiber::yield_current();

        // Resumed by the readiness trigger.
        let mut buf = [0u8; 8];
        // SAFETY: Valid buffer; `a` stays open until the test ends.
        let n = unsafe { libc::recv(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        assert!(n > 0, "expected readable data after resume");
        received2.store(n as usize, Ordering::SeqCst);
    });

    // Give the fiber time to park, then make the socket readable.
    std::thread::sleep(Duration::from_millis(50));
    // SAFETY: Valid one-byte buffer.
    let sent = unsafe { libc::send(b, b"!".as_ptr() as *const libc::c_void, 1, 0) };
    assert_eq!(sent, 1);

    wait_until("parked fiber was resumed", || {
        received.load(Ordering::SeqCst) == 1
    });

    io.stop();
    close_fd(a);
    close_fd(b);
}

/// Arms the listener for read readiness; each firing accepts everything
/// pending and re-arms through the task queue.
fn arm_accept(io: &Arc<IoManager>, listener: &Arc<TcpListener>) {
    let io2 = Arc::clone(io);
    let ln = Arc::clone(listener);
    io.add_event(listener.as_raw_fd(), Event::Read, move || {
        accept_pending(&io2, &ln);
    })
    .unwrap();
}

fn accept_pending(io: &Arc<IoManager>, listener: &Arc<TcpListener>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true).unwrap();
                arm_echo(io, stream.into_raw_fd());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => panic!("accept failed: {e}"),
        }
    }

    let io2 = Arc::clone(io);
    let ln = Arc::clone(listener);
    io.schedule(move || arm_accept(&io2, &ln));
}

fn arm_echo(io: &Arc<IoManager>, fd: RawFd) {
    let io2 = Arc::clone(io);
    io.add_event(fd, Event::Read, move || echo_pending(&io2, fd))
        .unwrap();
}

/// Echoes until the socket would block (re-arm) or closes (tear down without
/// leaving a direction armed).
fn echo_pending(io: &Arc<IoManager>, fd: RawFd) {
    let mut buf = [0u8; 1024];
    loop {
        // SAFETY: Valid buffer; the fd is owned by this connection.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n > 0 {
            // SAFETY: Echoing back the bytes just read.
            let sent = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, n as usize, 0) };
            assert_eq!(sent, n, "short echo write");
            continue;
        }
        if n == 0 {
            // Peer closed; exit without re-arming.
            close_fd(fd);
            return;
        }
        if std::io::Error::last_os_error().raw_os_error() == Some(libc::EAGAIN) {
            arm_echo(io, fd);
            return;
        }
        close_fd(fd);
        return;
    }
}

#[test]
fn echo_roundtrip_through_event_dispatch() {
    silk::rt::logging::init();
    let io = IoManager::new(2, false, "echo_io");

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let listen_fd = listener.as_raw_fd();
    let listener = Arc::new(listener);

    let baseline = io.pending_events();
    arm_accept(&io, &listener);
    let pre_connection = io.pending_events();
    assert_eq!(pre_connection, baseline + 1);

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"x").unwrap();

    let mut byte = [0u8; 1];
    client.read_exact(&mut byte).unwrap();
    assert_eq!(&byte, b"x");

    // Closing the client drives the echo callback to close its fd and exit
    // without leaving a direction armed.
    drop(client);
    wait_until("armed directions returned to pre-connection level", || {
        io.pending_events() == pre_connection
    });

    // Disarm the listener (no trigger) so the manager can drain and stop.
    assert!(io.remove_event(listen_fd, Event::Read));
    assert_eq!(io.pending_events(), baseline);

    io.stop();
}
