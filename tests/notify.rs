use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use vigil::notify::Async;
use vigil::{Reactor, Timer};

/// Turns the loop for roughly `ms` milliseconds, then stops it.
fn run_for(reactor: &Reactor, ms: u64) {
    let stopper = Timer::new(reactor);
    let r = reactor.clone();
    stopper.start(move || r.stop(), ms, 0).unwrap();
    reactor.run().unwrap();
}

#[test]
fn send_from_another_thread_runs_callback() {
    let reactor = Reactor::new();

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    let r = reactor.clone();
    let handle = Async::new(&reactor, move || {
        count.set(count.get() + 1);
        r.stop();
    })
    .unwrap();

    let sender = handle.sender();
    let producer = thread::spawn(move || sender.send());

    reactor.run().unwrap();
    producer.join().unwrap();

    assert_eq!(calls.get(), 1, "one send must produce one callback");
    handle.close();
}

#[test]
fn send_on_the_loop_thread_works() {
    let reactor = Reactor::new();

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    let r = reactor.clone();
    let handle = Async::new(&reactor, move || {
        count.set(count.get() + 1);
        r.stop();
    })
    .unwrap();

    handle.send();
    reactor.run().unwrap();

    assert_eq!(calls.get(), 1);
    handle.close();
}

#[test]
fn concurrent_sends_coalesce() {
    const PRODUCERS: usize = 4;
    const SENDS: usize = 100_000;

    let reactor = Reactor::new();

    let calls = Rc::new(Cell::new(0usize));
    let count = calls.clone();
    let handle = Async::new(&reactor, move || count.set(count.get() + 1)).unwrap();

    let finished = Arc::new(AtomicUsize::new(0));
    let mut producers = Vec::new();
    for _ in 0..PRODUCERS {
        let sender = handle.sender();
        let finished = finished.clone();
        producers.push(thread::spawn(move || {
            for _ in 0..SENDS {
                sender.send();
            }
            finished.fetch_add(1, Ordering::Release);
        }));
    }

    // Poll for producer completion from the loop side.
    let checker = Timer::new(&reactor);
    let r = reactor.clone();
    let finished_check = finished.clone();
    checker
        .start(
            move || {
                if finished_check.load(Ordering::Acquire) == PRODUCERS {
                    r.stop();
                }
            },
            5,
            5,
        )
        .unwrap();

    reactor.run().unwrap();
    for producer in producers {
        producer.join().unwrap();
    }
    checker.stop();

    // One more turn picks up a signal sent after the final drain.
    run_for(&reactor, 20);

    let calls = calls.get();
    assert!(calls >= 1, "at least one send must be delivered");
    assert!(
        calls < PRODUCERS * SENDS,
        "sends between drains must coalesce, got {} callbacks",
        calls
    );
    handle.close();
}

#[test]
fn no_callback_after_close() {
    let reactor = Reactor::new();

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    let handle = Async::new(&reactor, move || count.set(count.get() + 1)).unwrap();

    handle.send();
    handle.close();

    // The wake-up byte is still in the descriptor; draining it must
    // not reach the closed handle.
    run_for(&reactor, 40);

    assert_eq!(calls.get(), 0, "a closed handle must not see callbacks");
}

#[test]
fn close_from_sibling_callback_suppresses_pending_delivery() {
    let reactor = Reactor::new();

    let victim_calls = Rc::new(Cell::new(0));
    let victim_slot: Rc<RefCell<Option<Async>>> = Rc::new(RefCell::new(None));

    // Registered first, so the drain visits this handle while the
    // victim is still parked in the drain's local queue, not on the
    // global list.
    let r = reactor.clone();
    let slot = victim_slot.clone();
    let closer = Async::new(&reactor, move || {
        if let Some(victim) = slot.borrow_mut().take() {
            victim.close();
        }
        r.stop();
    })
    .unwrap();

    let count = victim_calls.clone();
    let victim = Async::new(&reactor, move || count.set(count.get() + 1)).unwrap();
    let victim_sender = victim.sender();
    *victim_slot.borrow_mut() = Some(victim);

    // Both handles are signalled before the drain starts, so the
    // victim's pending state is set when the closer's callback closes
    // it mid-drain.
    closer.send();
    victim_sender.send();

    reactor.run().unwrap();

    // Extra turns would deliver any signal the close failed to
    // suppress, and a post-close send must find no registration left
    // to resurrect.
    victim_sender.send();
    run_for(&reactor, 30);

    assert_eq!(
        victim_calls.get(),
        0,
        "a handle closed from a sibling's callback must not deliver any signal"
    );
    closer.close();
}

#[test]
fn send_from_own_callback_fires_once_per_turn() {
    let reactor = Reactor::new();

    let calls = Rc::new(Cell::new(0));
    let sender_slot = Rc::new(Cell::new(None));

    let count = calls.clone();
    let slot = sender_slot.clone();
    let r = reactor.clone();
    let handle = Async::new(&reactor, move || {
        count.set(count.get() + 1);
        if count.get() < 5 {
            let sender: vigil::notify::AsyncSender = slot.take().unwrap();
            sender.send();
            slot.set(Some(sender));
        } else {
            r.stop();
        }
    })
    .unwrap();

    sender_slot.set(Some(handle.sender()));

    handle.send();
    reactor.run().unwrap();

    assert_eq!(
        calls.get(),
        5,
        "a handle re-signalled from its own callback must fire once per turn"
    );
    handle.close();
}

#[test]
fn self_signalling_handle_does_not_starve_others() {
    let reactor = Reactor::new();

    let noisy_calls = Rc::new(Cell::new(0));
    let quiet_calls = Rc::new(Cell::new(0));

    // The noisy handle re-signals itself on every callback.
    let noisy_slot: Rc<Cell<Option<vigil::notify::AsyncSender>>> = Rc::new(Cell::new(None));
    let count = noisy_calls.clone();
    let slot = noisy_slot.clone();
    let quiet_watch = quiet_calls.clone();
    let r = reactor.clone();
    let noisy = Async::new(&reactor, move || {
        count.set(count.get() + 1);
        if quiet_watch.get() >= 1 && count.get() >= 3 {
            r.stop();
            return;
        }
        let sender = slot.take().unwrap();
        sender.send();
        slot.set(Some(sender));
    })
    .unwrap();
    noisy_slot.set(Some(noisy.sender()));

    let count = quiet_calls.clone();
    let quiet = Async::new(&reactor, move || count.set(count.get() + 1)).unwrap();

    noisy.send();
    quiet.send();

    reactor.run().unwrap();

    assert!(
        quiet_calls.get() >= 1,
        "a busy sibling must not starve other handles"
    );
    assert!(noisy_calls.get() >= 3);

    noisy.close();
    quiet.close();
}

#[test]
fn post_fork_recreates_the_dispatcher() {
    let reactor = Reactor::new();

    let calls = Rc::new(Cell::new(0));
    let count = calls.clone();
    let r = reactor.clone();
    let handle = Async::new(&reactor, move || {
        count.set(count.get() + 1);
        r.stop();
    })
    .unwrap();

    // Simulate the child side of a fork: descriptors are replaced,
    // the handle registration survives.
    reactor.post_fork().unwrap();

    let sender = handle.sender();
    let producer = thread::spawn(move || sender.send());

    reactor.run().unwrap();
    producer.join().unwrap();

    assert_eq!(
        calls.get(),
        1,
        "a handle registered before the fork must keep working"
    );
    handle.close();
}
