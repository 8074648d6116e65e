//! Scheduler dispatch behavior: FIFO ordering, caller participation, and
//! fiber rescheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use silk::{Fiber, Scheduler, State};

#[test]
fn function_tasks_run_fifo_on_caller_thread() {
    let order = Arc::new(Mutex::new(Vec::new()));

    let sched = Scheduler::new(1, true, "fifo");
    sched.start();

    for i in 0..10 {
        let order = Arc::clone(&order);
        sched.schedule(move || {
            order.lock().unwrap().push(i);
        });
    }

    sched.stop();
    assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    assert!(sched.stopping());
}

#[test]
fn stop_drains_queue_before_returning() {
    let sched = Scheduler::new(3, false, "drain");
    sched.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..64 {
        let order = Arc::clone(&order);
        sched.schedule(move || {
            order.lock().unwrap().push(i);
        });
    }

    sched.stop();
    let mut ran = order.lock().unwrap().clone();
    ran.sort_unstable();
    assert_eq!(ran, (0..64).collect::<Vec<_>>());
}

#[test]
fn yielded_fiber_resumes_where_it_left_off() {
    let sched = Scheduler::new(1, false, "requeue");
    sched.start();

    let first_half = Arc::new(AtomicBool::new(false));
    let second_half = Arc::new(AtomicBool::new(false));

    let f1 = Arc::clone(&first_half);
    let f2 = Arc::clone(&second_half);
    let fiber = Fiber::new(move || {
        f1.store(true, Ordering::SeqCst);
        Fiber::yield_current();
        f2.store(true, Ordering::SeqCst);
    });

    sched.schedule_fiber(Arc::clone(&fiber));

    // Wait for the first half, then hand the parked fiber back to the queue.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(first_half.load(Ordering::SeqCst) && fiber.state() == State::Ready) {
        assert!(Instant::now() < deadline, "fiber never reached its yield");
        std::thread::yield_now();
    }
    assert!(!second_half.load(Ordering::SeqCst));

    sched.schedule_fiber(Arc::clone(&fiber));
    sched.stop();

    assert!(second_half.load(Ordering::SeqCst));
    assert_eq!(fiber.state(), State::Term);
}

#[test]
fn scheduling_from_inside_a_task_works() {
    let sched = Scheduler::new(2, false, "nested");
    sched.start();

    let order = Arc::new(Mutex::new(Vec::new()));
    let order2 = Arc::clone(&order);
    sched.schedule(move || {
        order2.lock().unwrap().push("outer");

        let inner = Scheduler::current().expect("task runs inside a scheduler");
        let order3 = Arc::clone(&order2);
        inner.schedule(move || {
            order3.lock().unwrap().push("inner");
        });
    });

    sched.stop();
    assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
}
