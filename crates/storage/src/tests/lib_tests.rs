use super::*;
use chrono::Utc;
use locks::ReentrantLock;
use shared::domain::{
    Aci, DeviceId, GroupId, PhoneNumberDiscoverability, Pni, PreKeyId, ServiceId, ServiceIdKind,
    E164,
};
use std::{
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};
use uuid::Uuid;

fn store() -> MemoryStore {
    MemoryStore::new(Arc::new(ReentrantLock::new("session")))
}

fn e164() -> E164 {
    E164::parse("+14155550123").expect("e164")
}

fn address(device: u32) -> SessionAddress {
    SessionAddress {
        service_id: ServiceId::Aci(Aci(Uuid::new_v4())),
        device_id: DeviceId(device),
    }
}

fn signed_key(id: u32) -> SignedKeyRecord {
    SignedKeyRecord {
        id: PreKeyId(id),
        public_key: vec![1; 32],
        private_key: vec![2; 32],
        signature: vec![3; 64],
        created_at: Utc::now(),
    }
}

#[test]
fn account_values_round_trip_typed_fields() {
    let store = store();
    let aci = Aci(Uuid::new_v4());
    store.account().set_aci(aci).expect("set aci");
    store.account().set_e164(&e164()).expect("set e164");

    assert_eq!(store.account().aci().expect("aci"), Some(aci));
    assert_eq!(store.account().pni().expect("pni"), None);
    assert_eq!(store.account().e164().expect("e164"), Some(e164()));
    assert!(!store.account().is_registered().expect("registered"));
}

#[test]
fn pre_key_metadata_is_tracked_per_namespace() {
    let store = store();
    store
        .account()
        .update_pre_key_metadata(ServiceIdKind::Aci, |metadata| {
            metadata.next_signed_pre_key_id = Some(PreKeyId(10));
            metadata.signed_pre_key_registered = true;
        })
        .expect("update aci");

    let aci = store
        .account()
        .pre_key_metadata(ServiceIdKind::Aci)
        .expect("aci metadata");
    let pni = store
        .account()
        .pre_key_metadata(ServiceIdKind::Pni)
        .expect("pni metadata");
    assert_eq!(aci.next_signed_pre_key_id, Some(PreKeyId(10)));
    assert!(aci.signed_pre_key_registered);
    assert_eq!(pni, PreKeyMetadata::default());
}

#[test]
fn malformed_value_surfaces_key_in_error() {
    let store = store();
    store
        .put_raw("account.registered", serde_json::json!("yes"))
        .expect("put");
    let err = store.account().is_registered().expect_err("malformed");
    assert!(err.to_string().contains("account.registered"));
}

#[test]
fn blank_profile_name_does_not_count_as_set() {
    let store = store();
    assert!(!store.profile().is_profile_name_set().expect("unset"));
    store.profile().set_profile_name("   ").expect("set blank");
    assert!(!store.profile().is_profile_name_set().expect("blank"));
    store.profile().set_profile_name("Ada").expect("set");
    assert!(store.profile().is_profile_name_set().expect("set"));
}

#[test]
fn pin_and_opt_out_are_mutually_exclusive() {
    let store = store();
    store.svr().opt_out().expect("opt out");
    assert!(store.svr().has_opted_out().expect("opted out"));
    store.svr().set_pin_established().expect("pin");
    assert!(store.svr().has_pin().expect("pin"));
    assert!(!store.svr().has_opted_out().expect("no longer opted out"));
}

#[test]
fn discoverability_defaults_to_undecided() {
    let store = store();
    assert_eq!(
        store.phone_number_privacy().discoverability().expect("mode"),
        PhoneNumberDiscoverability::Undecided
    );
}

#[test]
fn archiving_sessions_only_touches_the_requested_namespace() {
    let store = store();
    let first = address(1);
    let second = address(2);
    store
        .store_session(ServiceIdKind::Aci, first, b"aci-1".to_vec())
        .expect("store");
    store
        .store_session(ServiceIdKind::Aci, second, b"aci-2".to_vec())
        .expect("store");
    store
        .store_session(ServiceIdKind::Pni, first, b"pni-1".to_vec())
        .expect("store");

    assert_eq!(store.archive_all_sessions(ServiceIdKind::Aci).expect("archive"), 2);
    assert_eq!(store.archive_all_sessions(ServiceIdKind::Aci).expect("again"), 0);

    let archived = store
        .load_session(ServiceIdKind::Aci, first)
        .expect("load")
        .expect("present");
    assert!(!archived.has_current_state());
    assert_eq!(archived.previous, vec![b"aci-1".to_vec()]);

    let untouched = store
        .load_session(ServiceIdKind::Pni, first)
        .expect("load")
        .expect("present");
    assert!(untouched.has_current_state());
}

#[test]
fn clearing_sender_keys_reports_count() {
    let store = store();
    store
        .store_sender_key(address(1), Uuid::new_v4(), b"sk".to_vec())
        .expect("store");
    store
        .store_sender_key(address(2), Uuid::new_v4(), b"sk".to_vec())
        .expect("store");
    assert_eq!(store.clear_sender_keys().expect("clear"), 2);
    assert_eq!(store.sender_key_count().expect("count"), 0);
}

#[test]
fn prekeys_are_isolated_by_namespace() {
    let store = store();
    store
        .store_signed_pre_key(ServiceIdKind::Aci, &signed_key(5))
        .expect("store");
    assert!(store
        .load_signed_pre_key(ServiceIdKind::Aci, PreKeyId(5))
        .expect("load")
        .is_some());
    assert!(store
        .load_signed_pre_key(ServiceIdKind::Pni, PreKeyId(5))
        .expect("load")
        .is_none());
}

#[test]
fn self_recipient_is_reused_and_rebound() {
    let store = store();
    let aci = Aci(Uuid::new_v4());
    let pni = Pni(Uuid::new_v4());

    let first = store.get_or_create_self(aci, pni, &e164()).expect("create");
    let again = store.get_or_create_self(aci, pni, &e164()).expect("reuse");
    assert_eq!(first, again);

    let new_pni = Pni(Uuid::new_v4());
    let rebound = store
        .get_or_create_self(aci, new_pni, &e164())
        .expect("rebind");
    assert_eq!(rebound, first);
    let record = store.recipient(first).expect("load").expect("present");
    assert_eq!(record.pni, Some(new_pni));
    assert_eq!(record.registered, RegisteredState::Unknown);
}

#[test]
fn recipient_updates_fail_for_unknown_rows() {
    let store = store();
    assert!(store
        .mark_registered(shared::domain::RecipientId(99))
        .is_err());
}

#[test]
fn groups_round_trip() {
    let store = store();
    let mut record = GroupRecord::new(GroupId(4));
    record.members.insert(Aci(Uuid::new_v4()));
    store.upsert_group(&record).expect("upsert");
    assert_eq!(store.group(GroupId(4)).expect("load"), Some(record));
}

#[test]
fn transactions_are_tracked_per_thread_and_nest() {
    let store = store();
    assert!(!store.in_transaction());

    let outer = store.begin_transaction();
    let inner = store.begin_transaction();
    assert!(store.in_transaction());

    let other = store.clone();
    let seen_elsewhere = thread::spawn(move || other.in_transaction())
        .join()
        .expect("join");
    assert!(!seen_elsewhere);

    drop(inner);
    assert!(store.in_transaction());
    drop(outer);
    assert!(!store.in_transaction());
}

#[test]
fn protocol_writes_wait_for_the_protocol_lock() {
    let store = store();
    let (done_tx, done_rx) = mpsc::channel();

    let guard = store.protocol_lock().acquire();
    let writer = store.clone();
    let handle = thread::spawn(move || {
        writer
            .store_signed_pre_key(ServiceIdKind::Aci, &signed_key(1))
            .expect("store");
        done_tx.send(()).expect("send");
    });

    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    drop(guard);
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("write completes after release");
    handle.join().expect("join");
}

#[test]
fn protocol_access_reenters_when_caller_already_holds_lock() {
    let store = store();
    let _guard = store.protocol_lock().acquire();
    store
        .store_signed_pre_key(ServiceIdKind::Pni, &signed_key(2))
        .expect("nested write does not deadlock");
    assert_eq!(store.protocol_lock().hold_count(), 1);
}
