use super::*;
use std::sync::{mpsc, Arc};

#[test]
fn same_thread_reenters_and_frees_after_matching_releases() {
    let lock = ReentrantLock::new("session");

    let outer = lock.acquire();
    let inner = lock.acquire();
    assert_eq!(lock.hold_count(), 2);
    assert!(lock.is_held_by_current_thread());

    drop(inner);
    assert_eq!(lock.hold_count(), 1);
    assert!(lock.is_held_by_current_thread());

    drop(outer);
    assert_eq!(lock.hold_count(), 0);
    assert!(!lock.is_held_by_current_thread());
    assert_eq!(lock.owner_name(), None);
}

#[test]
fn other_thread_cannot_enter_until_every_level_is_released() {
    let lock = Arc::new(ReentrantLock::new("session"));
    let outer = lock.acquire();
    let inner = lock.acquire();

    let contender = Arc::clone(&lock);
    let handle = thread::spawn(move || {
        contender
            .try_acquire_for(Duration::from_millis(50))
            .is_ok()
    });
    assert!(!handle.join().expect("join"));

    drop(inner);
    let contender = Arc::clone(&lock);
    let handle = thread::spawn(move || {
        contender
            .try_acquire_for(Duration::from_millis(50))
            .is_ok()
    });
    assert!(!handle.join().expect("join"));

    drop(outer);
    let contender = Arc::clone(&lock);
    let handle = thread::spawn(move || {
        contender
            .try_acquire_for(Duration::from_millis(50))
            .is_ok()
    });
    assert!(handle.join().expect("join"));
}

#[test]
fn blocked_acquire_proceeds_once_owner_releases() {
    let lock = Arc::new(ReentrantLock::new("session"));
    let (acquired_tx, acquired_rx) = mpsc::channel();

    let guard = lock.acquire();
    let waiter = Arc::clone(&lock);
    let handle = thread::spawn(move || {
        let _guard = waiter.acquire();
        acquired_tx.send(()).expect("send");
    });

    assert!(acquired_rx
        .recv_timeout(Duration::from_millis(100))
        .is_err());
    drop(guard);
    acquired_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("waiter acquires after release");
    handle.join().expect("join");
}

#[test]
fn owner_name_reports_the_holding_thread() {
    let lock = Arc::new(ReentrantLock::new("session"));
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder = Arc::clone(&lock);
    let handle = thread::Builder::new()
        .name("protocol-writer".into())
        .spawn(move || {
            let _guard = holder.acquire();
            held_tx.send(()).expect("send");
            release_rx.recv().expect("release signal");
        })
        .expect("spawn");

    held_rx.recv().expect("held");
    assert_eq!(lock.owner_name().as_deref(), Some("protocol-writer"));
    assert!(!lock.is_held_by_current_thread());

    release_tx.send(()).expect("send");
    handle.join().expect("join");
    assert_eq!(lock.owner_name(), None);
}

#[test]
fn interrupted_wait_reports_interruption() {
    let lock = Arc::new(ReentrantLock::new("session"));
    let _guard = lock.acquire();

    let interrupt = Interrupt::new();
    let waiter_lock = Arc::clone(&lock);
    let waiter_interrupt = interrupt.clone();
    let handle = thread::spawn(move || {
        waiter_lock
            .try_acquire_interruptible(Duration::from_secs(10), &waiter_interrupt)
            .map(|_| ())
    });

    thread::sleep(Duration::from_millis(50));
    interrupt.interrupt();
    let err = handle.join().expect("join").expect_err("interrupted");
    assert!(matches!(err, AcquireError::Interrupted { .. }));
    assert_eq!(err.owner(), thread::current().name());
}

#[test]
fn timeout_names_the_owner_seen_when_giving_up() {
    let lock = Arc::new(ReentrantLock::new("session"));
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let holder_lock = Arc::clone(&lock);
    let holder = thread::Builder::new()
        .name("session-writer".into())
        .spawn(move || {
            let _guard = holder_lock.acquire();
            held_tx.send(()).expect("send");
            let _ = release_rx.recv();
        })
        .expect("spawn");
    held_rx.recv().expect("held");

    let err = lock
        .try_acquire_for(Duration::from_millis(30))
        .map(|_| ())
        .expect_err("timed out");

    release_tx.send(()).expect("release");
    holder.join().expect("join");
    assert_eq!(lock.owner_name(), None);

    assert_eq!(
        err,
        AcquireError::TimedOut {
            owner: Some("session-writer".into())
        }
    );
}
