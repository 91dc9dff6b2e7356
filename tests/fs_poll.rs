use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use vigil::fs::FsPoll;
use vigil::{Errno, Error, Reactor, Timer};

/// Turns the loop for roughly `ms` milliseconds, then stops it.
fn run_for(reactor: &Reactor, ms: u64) {
    let stopper = Timer::new(reactor);
    let r = reactor.clone();
    stopper.start(move || r.stop(), ms, 0).unwrap();
    reactor.run().unwrap();
}

fn temp_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[test]
fn first_sample_is_silent() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "watched");
    std::fs::write(&path, b"contents").unwrap();

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    poll.start(move |_, _, _| count.set(count.get() + 1), &path, 10)
        .unwrap();

    run_for(&reactor, 60);

    assert_eq!(calls.get(), 0, "an unchanged path must stay silent");
}

#[test]
fn modification_is_detected_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "watched");
    std::fs::write(&path, b"").unwrap();

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let deliveries = Rc::new(RefCell::new(Vec::new()));
    let log = deliveries.clone();
    poll.start(
        move |status, previous, current| {
            log.borrow_mut()
                .push((status.map_err(Errno::raw), previous.size, current.size));
        },
        &path,
        20,
    )
    .unwrap();

    // Grow the file after the baseline sample has been taken.
    let mutator = Timer::new(&reactor);
    let target = path.clone();
    mutator
        .start(move || std::fs::write(&target, b"x").unwrap(), 35, 0)
        .unwrap();

    run_for(&reactor, 150);

    let deliveries = deliveries.borrow();
    assert_eq!(
        deliveries.len(),
        1,
        "one metadata change must produce one notification"
    );
    let (status, prev_size, curr_size) = deliveries[0];
    assert_eq!(status, Ok(()));
    assert_eq!(prev_size, 0, "previous snapshot should be the baseline");
    assert_eq!(curr_size, 1, "current snapshot should reflect the write");
}

#[test]
fn persistent_stat_error_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "does_not_exist");

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let deliveries = Rc::new(RefCell::new(Vec::new()));
    let log = deliveries.clone();
    poll.start(
        move |status, _, current| {
            log.borrow_mut().push((status.map_err(Errno::raw), current.size));
        },
        &path,
        10,
    )
    .unwrap();

    run_for(&reactor, 100);

    let deliveries = deliveries.borrow();
    assert_eq!(
        deliveries.len(),
        1,
        "a persistently failing path must report its error once, not once per interval"
    );
    let (status, curr_size) = deliveries[0];
    assert_eq!(status, Err(-libc::ENOENT));
    assert_eq!(curr_size, 0, "error deliveries carry a zero current snapshot");
}

#[test]
fn success_after_error_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "late");

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let deliveries = Rc::new(RefCell::new(Vec::new()));
    let log = deliveries.clone();
    poll.start(
        move |status, _, _| log.borrow_mut().push(status.map_err(Errno::raw)),
        &path,
        10,
    )
    .unwrap();

    // Create the file once the ENOENT report is sticky.
    let creator = Timer::new(&reactor);
    let target = path.clone();
    creator
        .start(move || std::fs::write(&target, b"here").unwrap(), 40, 0)
        .unwrap();

    run_for(&reactor, 120);

    let deliveries = deliveries.borrow();
    assert_eq!(
        *deliveries,
        vec![Err(-libc::ENOENT), Ok(())],
        "recovery from a sticky error must be reported even once metadata is stable"
    );
}

#[test]
fn stop_during_inflight_stat_quiesces() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "watched");
    std::fs::write(&path, b"contents").unwrap();

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    poll.start(move |_, _, _| count.set(count.get() + 1), &path, 10)
        .unwrap();

    // The first stat is still in flight; its completion must observe
    // the stopped handle and clean up without a notification.
    poll.stop();
    assert!(!poll.active());

    let closed = Rc::new(Cell::new(false));
    let flag = closed.clone();
    poll.close(move || flag.set(true));

    run_for(&reactor, 80);

    assert_eq!(calls.get(), 0, "no callback may fire after stop");
    assert!(closed.get(), "close must complete once the context drains");
}

#[test]
fn restart_while_stat_inflight_switches_paths() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = temp_path(&dir, "a");
    let path_b = temp_path(&dir, "b");
    std::fs::write(&path_a, b"a").unwrap();
    std::fs::write(&path_b, b"b").unwrap();

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let calls_a = Rc::new(Cell::new(0));
    let count = calls_a.clone();
    poll.start(move |_, _, _| count.set(count.get() + 1), &path_a, 10)
        .unwrap();

    // Starting an active watcher is a no-op.
    poll.start(|_, _, _| panic!("no-op start must not install a callback"), &path_b, 10)
        .unwrap();
    assert_eq!(getpath(&poll), path_a.as_os_str().as_bytes());

    // Stop and restart while the first context's stat is in flight:
    // the old context drains behind the new one.
    poll.stop();
    let calls_b = Rc::new(Cell::new(0));
    let count = calls_b.clone();
    poll.start(move |_, _, _| count.set(count.get() + 1), &path_b, 10)
        .unwrap();
    assert_eq!(getpath(&poll), path_b.as_os_str().as_bytes());

    run_for(&reactor, 60);

    assert_eq!(calls_a.get(), 0, "stopped context must not deliver");
    assert_eq!(calls_b.get(), 0, "unchanged path must stay silent");

    let closed = Rc::new(Cell::new(false));
    let flag = closed.clone();
    poll.close(move || flag.set(true));

    run_for(&reactor, 40);
    assert!(closed.get(), "close must complete after all contexts drained");
}

#[test]
fn getpath_reports_required_buffer_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "watched");
    std::fs::write(&path, b"contents").unwrap();

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let mut buffer = [0u8; 4];
    match poll.getpath(&mut buffer) {
        Err(Error::NotActive) => {}
        other => panic!("getpath on an idle watcher: {:?}", other.err()),
    }

    poll.start(|_, _, _| {}, &path, 100).unwrap();

    let expected = path.as_os_str().as_bytes();

    match poll.getpath(&mut buffer) {
        Err(Error::NoBuffer { required }) => {
            assert_eq!(required, expected.len() + 1, "required size includes the terminator")
        }
        other => panic!("short buffer must fail: {:?}", other.err()),
    }

    let mut buffer = vec![0u8; expected.len() + 1];
    let len = poll.getpath(&mut buffer).unwrap();
    assert_eq!(len, expected.len());
    assert_eq!(&buffer[..len], expected);
    assert_eq!(buffer[len], 0, "path copy is NUL terminated");
}

#[test]
fn zero_interval_is_coerced_to_one() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "watched");
    std::fs::write(&path, b"").unwrap();

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    poll.start(move |_, _, _| count.set(count.get() + 1), &path, 0)
        .unwrap();

    let mutator = Timer::new(&reactor);
    let target = path.clone();
    mutator
        .start(move || std::fs::write(&target, b"grown").unwrap(), 20, 0)
        .unwrap();

    run_for(&reactor, 80);

    assert!(
        calls.get() >= 1,
        "a zero interval must poll (coerced to one millisecond), not wedge"
    );
}

#[test]
fn samples_stay_on_the_start_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "watched");
    std::fs::write(&path, b"").unwrap();

    let reactor = Reactor::new();
    let poll = FsPoll::new(&reactor);

    // Grow the file faster than the poll interval so every sample
    // observes a change and the delivery times trace the tick times.
    let ticks = Rc::new(RefCell::new(Vec::new()));
    let start = Instant::now();

    let log = ticks.clone();
    poll.start(
        move |status, _, _| {
            if status.is_ok() {
                log.borrow_mut().push(start.elapsed());
            }
        },
        &path,
        50,
    )
    .unwrap();

    let mutator = Timer::new(&reactor);
    let target = path.clone();
    mutator
        .start(
            move || {
                let mut file = OpenOptions::new().append(true).open(&target).unwrap();
                file.write_all(b"x").unwrap();
            },
            15,
            15,
        )
        .unwrap();

    run_for(&reactor, 240);
    mutator.stop();

    let ticks = ticks.borrow();
    assert!(
        ticks.len() >= 3,
        "expected at least three deliveries, got {}",
        ticks.len()
    );

    // Tick k lands near start + (k + 1) * interval. The tolerance
    // covers one stat round-trip and scheduler jitter; it must not
    // grow with k, which is what drift compensation guarantees.
    for (k, tick) in ticks.iter().enumerate() {
        let expected = 50 * (k as i64 + 1);
        let actual = tick.as_millis() as i64;
        let skew = actual - expected;
        assert!(
            (-15..=45).contains(&skew),
            "tick {} at {}ms, expected about {}ms",
            k,
            actual,
            expected
        );
    }
}

fn getpath(poll: &FsPoll) -> Vec<u8> {
    let mut buffer = [0u8; 512];
    let len = poll.getpath(&mut buffer).unwrap();
    buffer[..len].to_vec()
}
