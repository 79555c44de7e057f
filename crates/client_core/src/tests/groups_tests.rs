use super::*;
use locks::{nesting_checker, ReentrantLock};
use std::sync::mpsc;
use storage::MemoryStore;
use uuid::Uuid;

struct Fixture {
    store: MemoryStore,
    lock: Arc<GroupProcessingLock>,
    processor: GroupProcessor,
}

fn fixture(timeout: Duration) -> Fixture {
    let protocol_lock = Arc::new(ReentrantLock::new("protocol-store"));
    let store = MemoryStore::new(protocol_lock.clone());
    let checker = nesting_checker(true, Arc::new(store.clone()), protocol_lock);
    let lock = Arc::new(GroupProcessingLock::new(timeout, checker));
    let processor = GroupProcessor::new(lock.clone(), Arc::new(store.clone()));
    Fixture {
        store,
        lock,
        processor,
    }
}

fn member() -> Aci {
    Aci(Uuid::new_v4())
}

/// Holds the group lock on a named thread until the returned sender fires.
fn hold_lock(
    lock: &Arc<GroupProcessingLock>,
    name: &str,
) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = Arc::clone(lock);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _guard = holder
                .acquire_group_processing_lock()
                .expect("holder acquires");
            held_tx.send(()).expect("send");
            let _ = release_rx.recv();
        })
        .expect("spawn");
    held_rx.recv().expect("holder signalled");
    (release_tx, handle)
}

#[test]
fn adding_and_removing_members_bumps_revision() {
    let fx = fixture(Duration::from_millis(200));
    let group = GroupId(7);
    let (alice, bob) = (member(), member());

    let record = fx
        .processor
        .apply(group, &MembershipChange::Add(vec![alice, bob]))
        .expect("add");
    assert_eq!(record.revision, 1);
    assert_eq!(record.members.len(), 2);

    let record = fx
        .processor
        .apply(group, &MembershipChange::Remove(vec![alice]))
        .expect("remove");
    assert_eq!(record.revision, 2);
    assert!(record.members.contains(&bob));
    assert!(!record.members.contains(&alice));

    let stored = fx.store.groups().group(group).expect("load").expect("group");
    assert_eq!(stored, record);
}

#[test]
fn no_op_change_keeps_revision() {
    let fx = fixture(Duration::from_millis(200));
    let group = GroupId(1);
    let alice = member();
    fx.processor
        .apply(group, &MembershipChange::Add(vec![alice]))
        .expect("add");

    let record = fx
        .processor
        .apply(group, &MembershipChange::Add(vec![alice]))
        .expect("re-add");
    assert_eq!(record.revision, 1);

    let record = fx
        .processor
        .apply(group, &MembershipChange::Remove(vec![member()]))
        .expect("remove stranger");
    assert_eq!(record.revision, 1);
}

#[test]
fn contention_surfaces_busy_with_owner_name() {
    let fx = fixture(Duration::from_millis(100));
    let (release, handle) = hold_lock(&fx.lock, "group-sync-worker");

    let err = fx
        .processor
        .apply(GroupId(3), &MembershipChange::Add(vec![member()]))
        .expect_err("busy");
    assert!(err.is_retryable());
    assert!(err.to_string().contains("group-sync-worker"));
    match err {
        GroupUpdateError::Busy(busy) => assert_eq!(busy.owner(), "group-sync-worker"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(fx.store.groups().group(GroupId(3)).expect("load").is_none());

    release.send(()).expect("release");
    handle.join().expect("join");
}

#[test]
fn retry_succeeds_once_the_holder_releases() {
    let fx = fixture(Duration::from_millis(50));
    let (release, handle) = hold_lock(&fx.lock, "slow-holder");

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(120));
        release.send(()).expect("release");
    });
    let record = fx
        .processor
        .apply_with_retry(
            GroupId(4),
            &MembershipChange::Add(vec![member()]),
            20,
            Duration::from_millis(25),
        )
        .expect("eventually applied");
    assert_eq!(record.revision, 1);

    releaser.join().expect("join releaser");
    handle.join().expect("join holder");
}

#[test]
fn retry_gives_up_after_the_last_attempt() {
    let fx = fixture(Duration::from_millis(20));
    let (release, handle) = hold_lock(&fx.lock, "stuck-holder");

    let err = fx
        .processor
        .apply_with_retry(
            GroupId(5),
            &MembershipChange::Add(vec![member()]),
            3,
            Duration::from_millis(5),
        )
        .expect_err("still busy");
    assert!(matches!(err, GroupUpdateError::Busy(_)));

    release.send(()).expect("release");
    handle.join().expect("join");
}

#[test]
#[should_panic(expected = "lock ordering violation")]
fn applying_inside_a_transaction_is_an_ordering_violation() {
    let fx = fixture(Duration::from_millis(100));
    let _tx = fx.store.begin_transaction();
    let _ = fx
        .processor
        .apply(GroupId(6), &MembershipChange::Add(vec![member()]));
}

#[test]
#[should_panic(expected = "lock ordering violation")]
fn applying_while_holding_the_protocol_lock_is_an_ordering_violation() {
    let fx = fixture(Duration::from_millis(100));
    let _protocol = fx.store.protocol_lock().acquire();
    let _ = fx
        .processor
        .apply(GroupId(6), &MembershipChange::Add(vec![member()]));
}
