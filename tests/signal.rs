mod common;

use uthread::{
    Current, ThreadError, ThreadState,
    signal::{self, SigSet, Signal},
    thread,
};

fn set_of(signals: &[Signal]) -> SigSet {
    signals.iter().copied().collect()
}

#[test]
fn sigwait_receives_a_sent_signal() {
    common::runtime()
        .block_on(|| {
            let waiter =
                thread::spawn(|| signal::sigwait(&set_of(&[Signal::SIGUSR1, Signal::SIGUSR2])))
                    .unwrap();
            Current::yield_now();
            assert_eq!(waiter.state(), ThreadState::WaitSigwait);

            // Not in the wait set: stays pending.
            signal::kill(waiter.tid, Signal::SIGHUP).unwrap();
            assert_eq!(waiter.state(), ThreadState::WaitSigwait);
            signal::kill(waiter.tid, Signal::SIGUSR2).unwrap();
            let status = waiter.join().unwrap();
            assert_eq!(
                status.value::<Result<Signal, ThreadError>>(),
                Some(&Ok(Signal::SIGUSR2))
            );
        })
        .unwrap();
}

#[test]
fn pending_signals_are_consumed_lowest_first() {
    common::runtime()
        .block_on(|| {
            let me = Current::get_tid();
            signal::kill(me, Signal::SIGUSR2).unwrap();
            signal::kill(me, Signal::SIGHUP).unwrap();
            let pending = signal::pending().unwrap();
            assert!(pending.contains(Signal::SIGHUP) && pending.contains(Signal::SIGUSR2));

            let set = set_of(&[Signal::SIGHUP, Signal::SIGUSR2]);
            assert_eq!(signal::sigwait(&set), Ok(Signal::SIGHUP));
            assert_eq!(signal::sigwait(&set), Ok(Signal::SIGUSR2));
            assert_eq!(signal::pending().unwrap(), SigSet::empty());
            assert!(signal::pending().unwrap().is_empty());
        })
        .unwrap();
}

#[test]
fn sigsuspend_leaves_masked_signals_pending() {
    common::runtime()
        .block_on(|| {
            let suspender = thread::spawn(|| {
                let sig = signal::sigsuspend(&set_of(&[Signal::SIGUSR1])).unwrap();
                let still_pending = signal::pending().unwrap().contains(Signal::SIGUSR1);
                let mask = signal::set_sigmask(&SigSet::empty()).unwrap();
                (sig, still_pending, mask == SigSet::empty())
            })
            .unwrap();
            Current::yield_now();
            assert_eq!(suspender.state(), ThreadState::WaitSigsuspend);

            signal::kill(suspender.tid, Signal::SIGUSR1).unwrap();
            assert_eq!(suspender.state(), ThreadState::WaitSigsuspend);
            signal::kill(suspender.tid, Signal::SIGTERM).unwrap();

            let status = suspender.join().unwrap();
            assert_eq!(
                status.value::<(Signal, bool, bool)>(),
                Some(&(Signal::SIGTERM, true, true))
            );
        })
        .unwrap();
}

#[test]
fn sigwait_is_a_cancellation_point() {
    common::runtime()
        .block_on(|| {
            let waiter = thread::spawn(|| signal::sigwait(&set_of(&[Signal::SIGUSR1]))).unwrap();
            Current::yield_now();
            waiter.cancel().unwrap();
            assert!(waiter.join().unwrap().is_canceled());
        })
        .unwrap();
}

#[test]
fn signal_mask_and_stale_targets() {
    common::runtime()
        .block_on(|| {
            let mask = set_of(&[Signal::SIGINT]);
            assert_eq!(signal::set_sigmask(&mask), Ok(SigSet::empty()));
            assert_eq!(signal::set_sigmask(&SigSet::empty()), Ok(mask));

            let gone = thread::spawn(|| ()).unwrap();
            let tid = gone.tid;
            gone.join().unwrap();
            assert_eq!(
                signal::kill(tid, Signal::SIGUSR1),
                Err(ThreadError::NoSuchThread)
            );
        })
        .unwrap();
}

#[test]
fn signals_outside_a_runtime() {
    assert_eq!(signal::pending(), Err(ThreadError::NoRuntime));
}
