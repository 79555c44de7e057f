use super::*;
use crate::nesting::{
    mark_current_thread_latency_critical, NoopNestingChecker, StrictNestingChecker,
    TransactionProbe,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::Instant,
};

#[derive(Default)]
struct FakeTransactions {
    open: AtomicBool,
}

impl TransactionProbe for FakeTransactions {
    fn in_transaction(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct Fixture {
    transactions: Arc<FakeTransactions>,
    protocol_lock: Arc<ReentrantLock>,
    group_lock: Arc<GroupProcessingLock>,
}

fn strict_fixture(timeout: Duration) -> Fixture {
    let transactions = Arc::new(FakeTransactions::default());
    let protocol_lock = Arc::new(ReentrantLock::new("session"));
    let checker = Arc::new(StrictNestingChecker::new(
        transactions.clone(),
        Arc::clone(&protocol_lock),
    ));
    Fixture {
        transactions,
        protocol_lock,
        group_lock: Arc::new(GroupProcessingLock::new(timeout, checker)),
    }
}

fn hold_on_named_thread(
    lock: &Arc<GroupProcessingLock>,
    name: &str,
    hold_for: Duration,
) -> thread::JoinHandle<()> {
    let (held_tx, held_rx) = mpsc::channel();
    let holder = Arc::clone(lock);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _guard = holder
                .acquire_group_processing_lock()
                .expect("holder acquires");
            held_tx.send(()).expect("send");
            thread::sleep(hold_for);
        })
        .expect("spawn");
    held_rx.recv().expect("holder signalled");
    handle
}

#[test]
fn unheld_lock_reports_no_owner() {
    let fixture = strict_fixture(DEFAULT_GROUP_LOCK_TIMEOUT);
    assert_eq!(fixture.group_lock.owner_name(), NO_OWNER);
    assert_eq!(fixture.group_lock.timeout(), Duration::from_millis(5000));
}

#[test]
fn owner_reenters_without_tripping_nesting_checks() {
    let fixture = strict_fixture(Duration::from_millis(100));
    let outer = fixture
        .group_lock
        .acquire_group_processing_lock()
        .expect("outer");

    // Once the group lock is held, nested protocol work is the allowed order.
    let _protocol = fixture.protocol_lock.acquire();
    let inner = fixture
        .group_lock
        .acquire_group_processing_lock()
        .expect("reentrant acquire skips the ordering check");
    inner.release();
    outer.release();
    assert_eq!(fixture.group_lock.owner_name(), NO_OWNER);
}

#[test]
fn second_owner_waits_and_succeeds_after_release() {
    let fixture = strict_fixture(Duration::from_secs(5));
    let holder = hold_on_named_thread(&fixture.group_lock, "owner-a", Duration::from_millis(150));

    let started = Instant::now();
    let guard = fixture
        .group_lock
        .acquire_group_processing_lock()
        .expect("second owner eventually acquires");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(fixture.group_lock.is_held_by_current_thread());
    drop(guard);
    holder.join().expect("join");
}

#[test]
fn second_owner_times_out_with_busy_error_naming_holder() {
    let fixture = strict_fixture(Duration::from_millis(100));
    let holder = hold_on_named_thread(&fixture.group_lock, "owner-a", Duration::from_millis(500));

    let err = fixture
        .group_lock
        .acquire_group_processing_lock()
        .expect_err("times out");
    assert!(matches!(err, BusyError::Timeout { waited_ms: 100, .. }));
    assert_eq!(err.owner(), "owner-a");
    assert!(err.is_retryable());
    holder.join().expect("join");
}

#[test]
fn busy_error_names_holder_even_when_release_races_the_deadline() {
    let fixture = strict_fixture(Duration::from_millis(40));
    for _ in 0..10 {
        let holder =
            hold_on_named_thread(&fixture.group_lock, "owner-b", Duration::from_millis(40));
        match fixture.group_lock.acquire_group_processing_lock() {
            Ok(guard) => drop(guard),
            Err(err) => assert_eq!(err.owner(), "owner-b"),
        }
        holder.join().expect("join");
    }
}

#[test]
fn default_timeout_expires_while_holder_keeps_lock_for_six_seconds() {
    let fixture = strict_fixture(DEFAULT_GROUP_LOCK_TIMEOUT);
    let holder = hold_on_named_thread(&fixture.group_lock, "owner-a", Duration::from_millis(6000));

    let started = Instant::now();
    let err = fixture
        .group_lock
        .acquire_group_processing_lock()
        .expect_err("busy after the default timeout");
    assert!(started.elapsed() >= Duration::from_millis(5000));
    assert!(err.to_string().contains("owner-a"), "message: {err}");
    holder.join().expect("join");
}

#[test]
fn interrupted_wait_surfaces_as_busy_error() {
    let fixture = strict_fixture(Duration::from_secs(10));
    let holder = hold_on_named_thread(&fixture.group_lock, "owner-a", Duration::from_millis(300));

    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.interrupt();
    });

    let err = fixture
        .group_lock
        .acquire_group_processing_lock_interruptible(&interrupt)
        .expect_err("interrupted");
    assert!(matches!(err, BusyError::Interrupted { .. }));
    assert_eq!(err.owner(), "owner-a");
    interrupter.join().expect("join");
    holder.join().expect("join");
}

#[test]
#[should_panic(expected = "data-store transaction is open")]
fn acquiring_inside_open_transaction_is_an_ordering_violation() {
    let fixture = strict_fixture(Duration::from_millis(100));
    fixture.transactions.open.store(true, Ordering::SeqCst);
    let _ = fixture.group_lock.acquire_group_processing_lock();
}

#[test]
#[should_panic(expected = "holds the 'session' lock")]
fn acquiring_while_holding_protocol_lock_is_an_ordering_violation() {
    let fixture = strict_fixture(Duration::from_millis(100));
    let _protocol = fixture.protocol_lock.acquire();
    let _ = fixture.group_lock.acquire_group_processing_lock();
}

#[test]
fn ordering_violation_panics_even_when_another_thread_holds_the_lock() {
    let fixture = strict_fixture(Duration::from_millis(100));
    let holder = hold_on_named_thread(&fixture.group_lock, "owner-a", Duration::from_millis(300));

    let transactions = Arc::clone(&fixture.transactions);
    let group_lock = Arc::clone(&fixture.group_lock);
    let outcome = thread::spawn(move || {
        transactions.open.store(true, Ordering::SeqCst);
        group_lock.acquire_group_processing_lock().map(|_| ())
    })
    .join();

    // A panic, never a BusyError.
    assert!(outcome.is_err());
    holder.join().expect("join");
}

#[test]
fn latency_critical_thread_may_not_block_on_group_lock() {
    let fixture = strict_fixture(Duration::from_millis(100));
    let group_lock = Arc::clone(&fixture.group_lock);
    let outcome = thread::spawn(move || {
        mark_current_thread_latency_critical();
        group_lock.acquire_group_processing_lock().map(|_| ())
    })
    .join();
    assert!(outcome.is_err());
}

#[test]
fn noop_checker_skips_ordering_checks() {
    let lock = GroupProcessingLock::new(Duration::from_millis(100), Arc::new(NoopNestingChecker));
    let protocol_lock = ReentrantLock::new("session");
    let _protocol = protocol_lock.acquire();
    lock.acquire_group_processing_lock()
        .expect("no-op checker admits any nesting")
        .release();
}
