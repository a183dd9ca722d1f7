mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use uthread::{
    Current, ThreadError, ThreadState,
    cancel::{self, CancelState, CancelType},
    io,
    sync::Mutex,
    thread::{self, Tid},
};

fn flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[test]
fn deferred_cancel_interrupts_sleep() {
    common::runtime()
        .block_on(|| {
            let cleaned = flag();
            let start = Instant::now();
            let sleeper = {
                let cleaned = cleaned.clone();
                thread::spawn(move || {
                    cancel::cleanup_push(move || cleaned.store(true, Ordering::SeqCst));
                    io::sleep(Duration::from_secs(10))
                })
                .unwrap()
            };
            Current::yield_now();
            assert_eq!(sleeper.state(), ThreadState::WaitSleep);
            sleeper.cancel().unwrap();
            assert!(sleeper.join().unwrap().is_canceled());
            assert!(cleaned.load(Ordering::SeqCst));
            assert!(start.elapsed() < Duration::from_secs(5));
        })
        .unwrap();
}

#[test]
fn pending_request_waits_for_a_cancellation_point() {
    common::runtime()
        .block_on(|| {
            let (ran, after) = (flag(), flag());
            let worker = {
                let (ran, after) = (ran.clone(), after.clone());
                thread::spawn(move || {
                    ran.store(true, Ordering::SeqCst);
                    cancel::test_cancel();
                    after.store(true, Ordering::SeqCst);
                })
                .unwrap()
            };
            // Requested before the worker ever ran.
            worker.cancel().unwrap();
            assert!(worker.join().unwrap().is_canceled());
            assert!(ran.load(Ordering::SeqCst));
            assert!(!after.load(Ordering::SeqCst));
        })
        .unwrap();
}

#[test]
fn disabled_cancellation_stays_pending() {
    common::runtime()
        .block_on(|| {
            let (slept, enabled, after) = (flag(), flag(), flag());
            let worker = {
                let (slept, enabled, after) = (slept.clone(), enabled.clone(), after.clone());
                thread::spawn(move || {
                    let old = cancel::set_cancel_state(CancelState::Disabled).unwrap();
                    assert_eq!(old, CancelState::Enabled);
                    io::sleep(Duration::from_millis(20)).unwrap();
                    slept.store(true, Ordering::SeqCst);

                    let old = cancel::set_cancel_state(CancelState::Enabled).unwrap();
                    assert_eq!(old, CancelState::Disabled);
                    enabled.store(true, Ordering::SeqCst);
                    cancel::test_cancel();
                    after.store(true, Ordering::SeqCst);
                })
                .unwrap()
            };
            Current::yield_now();
            worker.cancel().unwrap();
            assert_eq!(worker.state(), ThreadState::WaitSleep);
            assert!(worker.join().unwrap().is_canceled());
            assert!(slept.load(Ordering::SeqCst));
            assert!(enabled.load(Ordering::SeqCst));
            assert!(!after.load(Ordering::SeqCst));
        })
        .unwrap();
}

#[test]
fn asynchronous_cancel_interrupts_a_mutex_wait() {
    common::runtime()
        .block_on(|| {
            let mutex = Arc::new(Mutex::new(0));
            let cleaned = flag();
            let guard = mutex.lock().unwrap();
            let waiter = {
                let (mutex, cleaned) = (mutex.clone(), cleaned.clone());
                thread::spawn(move || {
                    cancel::set_cancel_type(CancelType::Asynchronous).unwrap();
                    cancel::cleanup_push(move || cleaned.store(true, Ordering::SeqCst));
                    *mutex.lock().unwrap() += 1;
                })
                .unwrap()
            };
            Current::yield_now();
            assert_eq!(waiter.state(), ThreadState::WaitMutex);
            waiter.cancel().unwrap();
            assert!(waiter.join().unwrap().is_canceled());
            assert!(cleaned.load(Ordering::SeqCst));

            // Still ours, and nobody queued behind us.
            drop(guard);
            assert_eq!(*mutex.try_lock().unwrap(), 0);
        })
        .unwrap();
}

#[test]
fn deferred_cancel_does_not_interrupt_a_mutex_wait() {
    common::runtime()
        .block_on(|| {
            let mutex = Arc::new(Mutex::new(0));
            let (locked, after) = (flag(), flag());
            let guard = mutex.lock().unwrap();
            let waiter = {
                let (mutex, locked, after) = (mutex.clone(), locked.clone(), after.clone());
                thread::spawn(move || {
                    *mutex.lock().unwrap() += 1;
                    locked.store(true, Ordering::SeqCst);
                    cancel::test_cancel();
                    after.store(true, Ordering::SeqCst);
                })
                .unwrap()
            };
            Current::yield_now();
            waiter.cancel().unwrap();
            assert_eq!(waiter.state(), ThreadState::WaitMutex);
            drop(guard);
            assert!(waiter.join().unwrap().is_canceled());
            assert!(locked.load(Ordering::SeqCst));
            assert!(!after.load(Ordering::SeqCst));
            assert_eq!(*mutex.lock().unwrap(), 1);
        })
        .unwrap();
}

#[test]
fn cleanup_handlers_run_last_in_first_out() {
    let order = common::runtime()
        .block_on(|| {
            let log = Arc::new(Mutex::new(Vec::new()));
            let worker = {
                let log = log.clone();
                thread::spawn(move || {
                    let push = |name: &'static str| {
                        let log = log.clone();
                        cancel::cleanup_push(move || log.lock().unwrap().push(name));
                    };
                    push("a");
                    push("b");
                    push("c");
                    assert!(cancel::cleanup_pop(true));
                    assert!(cancel::cleanup_pop(false));
                    push("d");
                    io::sleep(Duration::from_secs(10))
                })
                .unwrap()
            };
            Current::yield_now();
            worker.cancel().unwrap();
            assert!(worker.join().unwrap().is_canceled());
            assert!(!cancel::cleanup_pop(true));
            let order = log.lock().unwrap().clone();
            order
        })
        .unwrap();
    assert_eq!(order, ["c", "d", "a"]);
}

#[test]
fn exit_from_a_cleanup_handler_replaces_the_status() {
    let (status, order) = common::runtime()
        .block_on(|| {
            let log = Arc::new(Mutex::new(Vec::new()));
            let worker = {
                let log = log.clone();
                thread::spawn(move || {
                    let first = log.clone();
                    cancel::cleanup_push(move || first.lock().unwrap().push("first"));
                    cancel::cleanup_push(move || {
                        log.lock().unwrap().push("exit");
                        Current::exit(7u8)
                    });
                    io::sleep(Duration::from_secs(10))
                })
                .unwrap()
            };
            Current::yield_now();
            worker.cancel().unwrap();
            let status = worker.join().unwrap();
            let order = log.lock().unwrap().clone();
            (status.value::<u8>().copied(), order)
        })
        .unwrap();
    assert_eq!(status, Some(7));
    assert_eq!(order, ["exit", "first"]);
}

#[test]
fn a_panicking_cleanup_handler_keeps_the_status() {
    common::runtime()
        .block_on(|| {
            let ran = flag();
            let worker = {
                let ran = ran.clone();
                thread::spawn(move || {
                    cancel::cleanup_push(move || ran.store(true, Ordering::SeqCst));
                    cancel::cleanup_push(|| panic!("cleanup failed"));
                    Current::exit(3u8)
                })
                .unwrap()
            };
            let status = worker.join().unwrap();
            assert_eq!(status.value::<u8>(), Some(&3));
            assert!(ran.load(Ordering::SeqCst));
        })
        .unwrap();
}

#[test]
fn asynchronous_self_cancel_acts_immediately() {
    common::runtime()
        .block_on(|| {
            let after = flag();
            let worker = {
                let after = after.clone();
                thread::spawn(move || {
                    assert_eq!(
                        cancel::set_cancel_type(CancelType::Asynchronous).unwrap(),
                        CancelType::Deferred
                    );
                    let _ = cancel::cancel(Current::get_tid());
                    after.store(true, Ordering::SeqCst);
                })
                .unwrap()
            };
            assert!(worker.join().unwrap().is_canceled());
            assert!(!after.load(Ordering::SeqCst));
        })
        .unwrap();
}

#[test]
fn switching_to_asynchronous_acts_on_a_pending_request() {
    common::runtime()
        .block_on(|| {
            let (pending, after) = (flag(), flag());
            let worker = {
                let (pending, after) = (pending.clone(), after.clone());
                thread::spawn(move || {
                    cancel::cancel(Current::get_tid()).unwrap();
                    pending.store(true, Ordering::SeqCst);
                    let _ = cancel::set_cancel_type(CancelType::Asynchronous);
                    after.store(true, Ordering::SeqCst);
                })
                .unwrap()
            };
            assert!(worker.join().unwrap().is_canceled());
            assert!(pending.load(Ordering::SeqCst));
            assert!(!after.load(Ordering::SeqCst));
        })
        .unwrap();
}

#[test]
fn cancelling_a_finished_thread() {
    common::runtime()
        .block_on(|| {
            let worker = thread::spawn(|| 1u8).unwrap();
            let tid = worker.tid;
            Current::yield_now();
            assert_eq!(worker.state(), ThreadState::Dead);
            cancel::cancel(tid).unwrap();
            assert_eq!(worker.join().unwrap().value::<u8>(), Some(&1));
            assert_eq!(cancel::cancel(tid), Err(ThreadError::NoSuchThread));
        })
        .unwrap();
}

#[test]
fn cancel_while_joining() {
    common::runtime()
        .block_on(|| {
            let sleeper = thread::spawn(|| io::sleep(Duration::from_secs(10))).unwrap();
            let target = sleeper.tid;
            let joiner = thread::spawn(move || thread::join(target)).unwrap();
            Current::yield_now();
            assert_eq!(joiner.state(), ThreadState::WaitJoin);

            joiner.cancel().unwrap();
            assert!(joiner.join().unwrap().is_canceled());
            // The canceled joiner no longer waits for the sleeper.
            sleeper.cancel().unwrap();
            assert!(sleeper.join().unwrap().is_canceled());
        })
        .unwrap();
}

#[test]
fn remote_cancel_through_a_handle() {
    let rt = common::runtime();
    let handle = rt.handle();
    let target = Arc::new(AtomicU64::new(u64::MAX));
    let remote = {
        let target = target.clone();
        std::thread::spawn(move || {
            let tid = loop {
                match target.load(Ordering::SeqCst) {
                    u64::MAX => std::thread::sleep(Duration::from_millis(1)),
                    raw => break Tid::from_raw(raw),
                }
            };
            handle.cancel(tid)
        })
    };
    let canceled = rt
        .block_on(move || {
            let sleeper = thread::spawn(|| io::sleep(Duration::from_secs(10))).unwrap();
            target.store(sleeper.tid.into_raw(), Ordering::SeqCst);
            sleeper.join().unwrap().is_canceled()
        })
        .unwrap();
    assert!(canceled);
    assert_eq!(remote.join().unwrap(), Ok(()));
}
