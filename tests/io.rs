mod common;

use nix::{
    errno::Errno,
    sys::socket::{AddressFamily, SockFlag, SockType, SockaddrIn, socket},
    unistd,
};
use std::{
    net::{SocketAddr, TcpListener},
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
    time::{Duration, Instant},
};
use uthread::{
    Current, ThreadError, ThreadState,
    io::{self, Direction, PollEntry, PollFlags},
    sync::Mutex,
    thread,
};

fn close(fds: &[RawFd]) {
    for &fd in fds {
        let _ = unistd::close(fd);
    }
}

#[test]
fn reader_blocks_until_data_arrives() {
    common::runtime()
        .block_on(|| {
            let (rx, tx) = unistd::pipe().unwrap();
            let reader = thread::spawn(move || {
                let mut buf = [0u8; 16];
                io::read(rx, &mut buf).map(|n| buf[..n].to_vec())
            })
            .unwrap();
            Current::yield_now();
            assert_eq!(reader.state(), ThreadState::WaitFdRead);

            assert_eq!(io::write(tx, b"hello"), Ok(5));
            let status = reader.join().unwrap();
            assert_eq!(
                status.value::<Result<Vec<u8>, ThreadError>>(),
                Some(&Ok(b"hello".to_vec()))
            );
            close(&[rx, tx]);
        })
        .unwrap();
}

#[test]
fn end_of_file_reads_zero() {
    common::runtime()
        .block_on(|| {
            let (rx, tx) = unistd::pipe().unwrap();
            let reader = thread::spawn(move || io::read(rx, &mut [0u8; 4])).unwrap();
            Current::yield_now();
            close(&[tx]);
            let status = reader.join().unwrap();
            assert_eq!(status.value::<Result<usize, ThreadError>>(), Some(&Ok(0)));
            close(&[rx]);
        })
        .unwrap();
}

#[test]
fn wait_fd_times_out_and_sets_errno() {
    common::runtime()
        .block_on(|| {
            let (rx, tx) = unistd::pipe().unwrap();
            let start = Instant::now();
            assert_eq!(
                io::wait_fd(rx, Direction::Read, Some(Duration::from_millis(20))),
                Err(ThreadError::Sys(Errno::ETIMEDOUT))
            );
            assert!(start.elapsed() >= Duration::from_millis(20));
            assert_eq!(Current::errno(), Errno::ETIMEDOUT as i32);

            // The error slot is per thread.
            let other = thread::spawn(Current::errno).unwrap();
            assert_eq!(other.join().unwrap().value::<i32>(), Some(&0));
            Current::set_errno(0);
            assert_eq!(Current::errno(), 0);

            assert_eq!(io::wait_fd(tx, Direction::Write, None), Ok(()));
            close(&[rx, tx]);
        })
        .unwrap();
}

#[test]
fn wait_fd_rejects_a_descriptor_that_is_not_open() {
    // Above any open-file limit, so never a valid fd.
    const NOT_OPEN: RawFd = RawFd::MAX;
    common::runtime()
        .block_on(|| {
            let waiter = thread::spawn(|| {
                io::wait_fd(NOT_OPEN, Direction::Read, Some(Duration::from_secs(5)))
                    .map_err(|e| (e, Current::errno()))
            })
            .unwrap();
            let start = Instant::now();
            let status = waiter.join().unwrap();
            assert_eq!(
                status.value::<Result<(), (ThreadError, i32)>>(),
                Some(&Err((
                    ThreadError::Sys(Errno::EBADF),
                    Errno::EBADF as i32
                )))
            );
            assert!(start.elapsed() < Duration::from_secs(5));

            assert_eq!(
                io::wait_fd(NOT_OPEN, Direction::Write, None),
                Err(ThreadError::Sys(Errno::EBADF))
            );
        })
        .unwrap();
}

#[test]
fn poll_wakes_on_any_entry() {
    common::runtime()
        .block_on(|| {
            let (r1, w1) = unistd::pipe().unwrap();
            let (r2, w2) = unistd::pipe().unwrap();
            let poller = thread::spawn(move || {
                let mut fds = [
                    PollEntry::new(r1, PollFlags::POLLIN),
                    PollEntry::new(r2, PollFlags::POLLIN),
                ];
                let n = io::poll(&mut fds, None).unwrap();
                (n, fds[0].revents.is_empty(), fds[1].revents.contains(PollFlags::POLLIN))
            })
            .unwrap();
            Current::yield_now();
            assert_eq!(poller.state(), ThreadState::WaitPoll);

            unistd::write(w2, b"x").unwrap();
            let status = poller.join().unwrap();
            assert_eq!(status.value::<(usize, bool, bool)>(), Some(&(1, true, true)));
            close(&[r1, w1, r2, w2]);
        })
        .unwrap();
}

#[test]
fn poll_timeout_reports_nothing() {
    common::runtime()
        .block_on(|| {
            let (rx, tx) = unistd::pipe().unwrap();
            let mut fds = [PollEntry::new(rx, PollFlags::POLLIN)];
            let start = Instant::now();
            assert_eq!(io::poll(&mut fds, Some(Duration::from_millis(10))), Ok(0));
            assert!(start.elapsed() >= Duration::from_millis(10));
            assert!(fds[0].revents.is_empty());
            close(&[rx, tx]);
        })
        .unwrap();
}

#[test]
fn sleepers_wake_in_deadline_order() {
    let order = common::runtime()
        .block_on(|| {
            let log = Arc::new(Mutex::new(Vec::new()));
            let sleepers: Vec<_> = [30u64, 10, 20]
                .into_iter()
                .map(|ms| {
                    let log = log.clone();
                    thread::spawn(move || {
                        io::sleep(Duration::from_millis(ms)).unwrap();
                        log.lock().unwrap().push(ms);
                    })
                    .unwrap()
                })
                .collect();
            for sleeper in sleepers {
                sleeper.join().unwrap();
            }
            let order = log.lock().unwrap().clone();
            order
        })
        .unwrap();
    assert_eq!(order, [10, 20, 30]);
}

#[test]
fn tcp_accept_and_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
        unreachable!("bound to an IPv4 address");
    };
    common::runtime()
        .block_on(move || {
            let server = thread::spawn(move || {
                let conn = io::accept(listener.as_raw_fd()).unwrap();
                let mut buf = [0u8; 4];
                let n = io::read(conn, &mut buf).unwrap();
                close(&[conn]);
                buf[..n].to_vec()
            })
            .unwrap();
            Current::yield_now();
            assert_eq!(server.state(), ThreadState::WaitFdRead);

            let fd = socket(
                AddressFamily::Inet,
                SockType::Stream,
                SockFlag::empty(),
                None,
            )
            .unwrap();
            io::connect(fd, &SockaddrIn::from(addr)).unwrap();
            assert_eq!(io::write(fd, b"ping"), Ok(4));
            let status = server.join().unwrap();
            assert_eq!(status.value::<Vec<u8>>(), Some(&b"ping".to_vec()));
            close(&[fd]);
        })
        .unwrap();
}
