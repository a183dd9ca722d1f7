mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use uthread::{
    Current, ExitStatus, ThreadBuilder, ThreadError, ThreadState, cancel, io,
    thread::{self, Tid},
};

#[test]
fn join_after_exit_reaps_the_thread() {
    common::runtime()
        .block_on(|| {
            let handle = thread::spawn(|| 5u32).unwrap();
            let tid = handle.tid;
            Current::yield_now();
            assert_eq!(handle.state(), ThreadState::Dead);
            assert_eq!(thread::state_of(tid), Ok(ThreadState::Dead));

            let status = handle.join().unwrap();
            assert_eq!(status.value::<u32>(), Some(&5));
            assert_eq!(thread::join(tid).unwrap_err(), ThreadError::NoSuchThread);
            assert_eq!(thread::state_of(tid), Err(ThreadError::NoSuchThread));
        })
        .unwrap();
}

#[test]
fn join_waits_for_the_target() {
    common::runtime()
        .block_on(|| {
            let start = Instant::now();
            let handle = thread::spawn(|| {
                io::sleep(Duration::from_millis(20)).unwrap();
                "late"
            })
            .unwrap();
            let status = handle.join().unwrap();
            assert_eq!(status.value::<&str>(), Some(&"late"));
            assert!(start.elapsed() >= Duration::from_millis(20));
        })
        .unwrap();
}

#[test]
fn every_joiner_sees_the_status() {
    common::runtime()
        .block_on(|| {
            let target = thread::spawn(|| {
                io::sleep(Duration::from_millis(20)).unwrap();
                7i32
            })
            .unwrap()
            .tid;
            let joiners: Vec<_> = (0..2)
                .map(|_| {
                    thread::spawn(move || thread::join(target).map(|s| s.value::<i32>().copied()))
                        .unwrap()
                })
                .collect();
            Current::yield_now();
            assert_eq!(thread::state_of(target), Ok(ThreadState::WaitSleep));
            for joiner in joiners {
                let status = joiner.join().unwrap();
                assert_eq!(
                    status.value::<Result<Option<i32>, ThreadError>>(),
                    Some(&Ok(Some(7)))
                );
            }
            assert_eq!(thread::state_of(target), Err(ThreadError::NoSuchThread));
        })
        .unwrap();
}

#[test]
fn join_rejections() {
    common::runtime()
        .block_on(|| {
            assert_eq!(
                thread::join(Current::get_tid()).unwrap_err(),
                ThreadError::Deadlock
            );
            assert_eq!(
                thread::join(Tid::from_raw(u64::MAX)).unwrap_err(),
                ThreadError::NoSuchThread
            );

            let detached = ThreadBuilder::new("detached")
                .detached(true)
                .spawn(|| ())
                .unwrap();
            let tid = detached.tid;
            assert_eq!(thread::join(tid).unwrap_err(), ThreadError::InvalidArgument);
            assert_eq!(thread::detach(tid), Err(ThreadError::InvalidArgument));
            Current::yield_now();
            // Reaped as soon as it exited.
            assert_eq!(thread::state_of(tid), Err(ThreadError::NoSuchThread));
        })
        .unwrap();
}

#[test]
fn detaching_a_dead_thread_reaps_it() {
    common::runtime()
        .block_on(|| {
            let handle = thread::spawn(|| ()).unwrap();
            let tid = handle.tid;
            Current::yield_now();
            assert_eq!(thread::state_of(tid), Ok(ThreadState::Dead));
            handle.detach().unwrap();
            assert_eq!(thread::state_of(tid), Err(ThreadError::NoSuchThread));
        })
        .unwrap();
}

#[test]
fn panic_becomes_the_exit_status() {
    common::runtime()
        .block_on(|| {
            let handle = thread::spawn(|| -> u32 { panic!("boom") }).unwrap();
            match handle.join().unwrap() {
                ExitStatus::Panicked(msg) => assert_eq!(&*msg, "boom"),
                other => panic!("unexpected status {other:?}"),
            }
        })
        .unwrap();
}

#[test]
fn exit_runs_cleanup_and_carries_the_value() {
    common::runtime()
        .block_on(|| {
            let cleaned = Arc::new(AtomicBool::new(false));
            let handle = {
                let cleaned = cleaned.clone();
                thread::spawn(move || -> u32 {
                    cancel::cleanup_push(move || cleaned.store(true, Ordering::SeqCst));
                    Current::exit(9u8)
                })
                .unwrap()
            };
            let status = handle.join().unwrap();
            assert_eq!(status.value::<u8>(), Some(&9));
            assert_eq!(status.value::<u32>(), None);
            assert!(cleaned.load(Ordering::SeqCst));
        })
        .unwrap();
}

#[test]
fn thread_limit() {
    common::builder()
        .max_threads(2)
        .build()
        .unwrap()
        .block_on(|| {
            let first = thread::spawn(|| ()).unwrap();
            assert_eq!(thread::spawn(|| ()).unwrap_err(), ThreadError::Again);
            first.join().unwrap();
            thread::spawn(|| ()).unwrap().join().unwrap();
        })
        .unwrap();
}

#[test]
fn thread_names() {
    common::runtime()
        .block_on(|| {
            assert_eq!(Current::name().as_deref(), Some("main"));
            let named = ThreadBuilder::new("worker").spawn(Current::name).unwrap();
            let unnamed = thread::spawn(Current::name).unwrap();
            assert_eq!(
                named.join().unwrap().value::<Option<String>>(),
                Some(&Some("worker".to_string()))
            );
            assert_eq!(unnamed.join().unwrap().value::<Option<String>>(), Some(&None));
        })
        .unwrap();
}

#[test]
fn block_on_waits_for_every_thread() {
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    common::runtime()
        .block_on(move || {
            ThreadBuilder::unnamed()
                .detached(true)
                .spawn(move || {
                    io::sleep(Duration::from_millis(30)).unwrap();
                    flag.store(true, Ordering::SeqCst);
                })
                .unwrap();
        })
        .unwrap();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn main_that_exits_early_terminates() {
    let result = common::runtime().block_on(|| -> u32 { Current::exit(()) });
    assert_eq!(result, Err(ThreadError::Terminated));
}

#[test]
fn canceled_main_terminates() {
    let result = common::runtime().block_on(|| {
        cancel::cancel(Current::get_tid()).unwrap();
        cancel::test_cancel();
        "unreachable"
    });
    assert_eq!(result, Err(ThreadError::Terminated));
}

#[test]
#[should_panic(expected = "kaboom")]
fn main_panic_resumes_in_the_caller() {
    let _ = common::runtime().block_on(|| -> u32 { panic!("kaboom") });
}
