mod common;

use nix::sys::signal::Signal;
use std::{env, os::unix::process::ExitStatusExt, process::Command, sync::Arc};
use uthread::{Current, sync::RawMutex, thread};

const TEST: &str = "deadlock_aborts_the_process";
/// Set in the child process that runs the deadlocking program.
const CHILD: &str = "UTHREAD_DEADLOCK_CHILD";

/// Two threads that each hold one mutex and wait for the other's.
fn lock_in_opposite_orders() {
    common::runtime()
        .block_on(|| {
            let (m1, m2) = (Arc::new(RawMutex::new()), Arc::new(RawMutex::new()));
            let a = {
                let (m1, m2) = (m1.clone(), m2.clone());
                thread::spawn(move || {
                    m1.lock().unwrap();
                    Current::yield_now();
                    m2.lock().unwrap();
                })
                .unwrap()
            };
            let b = thread::spawn(move || {
                m2.lock().unwrap();
                Current::yield_now();
                m1.lock().unwrap();
            })
            .unwrap();
            a.join().unwrap();
            b.join().unwrap();
        })
        .unwrap();
}

#[test]
fn deadlock_aborts_the_process() {
    if env::var_os(CHILD).is_some() {
        lock_in_opposite_orders();
        panic!("the deadlocked runtime returned");
    }

    let output = Command::new(env::current_exe().unwrap())
        .args(["--exact", TEST, "--nocapture", "--test-threads=1"])
        .env(CHILD, "1")
        .env("RUST_LOG", "error")
        .output()
        .unwrap();
    assert_eq!(
        output.status.signal(),
        Some(Signal::SIGABRT as i32),
        "child exited with {:?}",
        output.status
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("deadlock"), "stderr: {stderr}");
}
