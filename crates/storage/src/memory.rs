use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

use anyhow::{anyhow, Result};
use locks::{ReentrantLock, TransactionProbe};
use serde_json::Value;
use shared::domain::{Aci, GroupId, Pni, PreKeyId, ProfileKey, RecipientId, ServiceIdKind, E164};
use tracing::debug;
use uuid::Uuid;

use crate::{
    groups::{GroupRecord, GroupStore},
    kv::KeyValueStore,
    protocol::{
        IdentityKeyPair, KyberPreKeyRecord, ProtocolStore, SessionAddress, SessionRecord,
        SignedKeyRecord,
    },
    recipients::{RecipientRecord, RecipientStore, RegisteredState},
    DataStore,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ProtocolTables {
    identities: HashMap<ServiceIdKind, IdentityKeyPair>,
    signed_pre_keys: HashMap<(ServiceIdKind, PreKeyId), SignedKeyRecord>,
    kyber_pre_keys: HashMap<(ServiceIdKind, PreKeyId), KyberPreKeyRecord>,
    sessions: HashMap<(ServiceIdKind, SessionAddress), SessionRecord>,
    sender_keys: HashMap<(SessionAddress, Uuid), Vec<u8>>,
}

#[derive(Default)]
struct RecipientTables {
    next_id: i64,
    rows: HashMap<RecipientId, RecipientRecord>,
}

impl RecipientTables {
    fn find(&self, aci: Aci, pni: Pni, e164: &E164) -> Option<RecipientId> {
        self.rows
            .values()
            .find(|row| row.aci == Some(aci))
            .or_else(|| self.rows.values().find(|row| row.pni == Some(pni)))
            .or_else(|| {
                self.rows
                    .values()
                    .find(|row| row.e164.as_ref() == Some(e164))
            })
            .map(|row| row.id)
    }

    fn row_mut(&mut self, id: RecipientId) -> Result<&mut RecipientRecord> {
        self.rows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("recipient {} does not exist", id.0))
    }
}

struct Inner {
    protocol_lock: Arc<ReentrantLock>,
    key_values: Mutex<HashMap<String, Value>>,
    protocol: Mutex<ProtocolTables>,
    recipients: Mutex<RecipientTables>,
    groups: Mutex<HashMap<GroupId, GroupRecord>>,
    open_transactions: Mutex<HashMap<ThreadId, u32>>,
}

/// In-memory data store. Protocol-state access is serialized by the shared
/// protocol lock; open transactions are tracked per thread.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(protocol_lock: Arc<ReentrantLock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                protocol_lock,
                key_values: Mutex::new(HashMap::new()),
                protocol: Mutex::new(ProtocolTables::default()),
                recipients: Mutex::new(RecipientTables::default()),
                groups: Mutex::new(HashMap::new()),
                open_transactions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn protocol_lock(&self) -> &Arc<ReentrantLock> {
        &self.inner.protocol_lock
    }

    /// Opens a transaction on the calling thread; it stays open until the
    /// returned guard is dropped. Transactions nest.
    pub fn begin_transaction(&self) -> TransactionGuard<'_> {
        let me = thread::current().id();
        *lock(&self.inner.open_transactions).entry(me).or_insert(0) += 1;
        TransactionGuard {
            store: self,
            _not_send: PhantomData,
        }
    }

    fn end_transaction(&self) {
        let me = thread::current().id();
        let mut open = lock(&self.inner.open_transactions);
        if let Some(depth) = open.get_mut(&me) {
            *depth -= 1;
            if *depth == 0 {
                open.remove(&me);
            }
        }
    }

    fn with_protocol<T>(&self, f: impl FnOnce(&mut ProtocolTables) -> T) -> T {
        let _guard = self.inner.protocol_lock.acquire();
        let mut tables = lock(&self.inner.protocol);
        f(&mut tables)
    }
}

#[must_use = "the transaction closes as soon as the guard is dropped"]
pub struct TransactionGuard<'a> {
    store: &'a MemoryStore,
    _not_send: PhantomData<*const ()>,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.store.end_transaction();
    }
}

impl TransactionProbe for MemoryStore {
    fn in_transaction(&self) -> bool {
        lock(&self.inner.open_transactions).contains_key(&thread::current().id())
    }
}

impl KeyValueStore for MemoryStore {
    fn get_raw(&self, key: &str) -> Result<Option<Value>> {
        Ok(lock(&self.inner.key_values).get(key).cloned())
    }

    fn put_raw(&self, key: &str, value: Value) -> Result<()> {
        lock(&self.inner.key_values).insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        lock(&self.inner.key_values).remove(key);
        Ok(())
    }
}

impl ProtocolStore for MemoryStore {
    fn identity_key_pair(&self, kind: ServiceIdKind) -> Result<Option<IdentityKeyPair>> {
        Ok(self.with_protocol(|tables| tables.identities.get(&kind).cloned()))
    }

    fn store_identity_key_pair(&self, kind: ServiceIdKind, pair: &IdentityKeyPair) -> Result<()> {
        self.with_protocol(|tables| tables.identities.insert(kind, pair.clone()));
        Ok(())
    }

    fn store_signed_pre_key(&self, kind: ServiceIdKind, record: &SignedKeyRecord) -> Result<()> {
        self.with_protocol(|tables| {
            tables
                .signed_pre_keys
                .insert((kind, record.id), record.clone())
        });
        Ok(())
    }

    fn load_signed_pre_key(
        &self,
        kind: ServiceIdKind,
        id: PreKeyId,
    ) -> Result<Option<SignedKeyRecord>> {
        Ok(self.with_protocol(|tables| tables.signed_pre_keys.get(&(kind, id)).cloned()))
    }

    fn store_kyber_pre_key(&self, kind: ServiceIdKind, record: &KyberPreKeyRecord) -> Result<()> {
        self.with_protocol(|tables| {
            tables
                .kyber_pre_keys
                .insert((kind, record.key.id), record.clone())
        });
        Ok(())
    }

    fn load_kyber_pre_key(
        &self,
        kind: ServiceIdKind,
        id: PreKeyId,
    ) -> Result<Option<KyberPreKeyRecord>> {
        Ok(self.with_protocol(|tables| tables.kyber_pre_keys.get(&(kind, id)).cloned()))
    }

    fn store_session(
        &self,
        kind: ServiceIdKind,
        address: SessionAddress,
        state: Vec<u8>,
    ) -> Result<()> {
        self.with_protocol(|tables| {
            let record = tables.sessions.entry((kind, address)).or_default();
            record.archive_current_state();
            record.current = Some(state);
        });
        Ok(())
    }

    fn load_session(
        &self,
        kind: ServiceIdKind,
        address: SessionAddress,
    ) -> Result<Option<SessionRecord>> {
        Ok(self.with_protocol(|tables| tables.sessions.get(&(kind, address)).cloned()))
    }

    fn archive_all_sessions(&self, kind: ServiceIdKind) -> Result<usize> {
        let archived = self.with_protocol(|tables| {
            let mut archived = 0;
            for ((session_kind, _), record) in tables.sessions.iter_mut() {
                if *session_kind == kind && record.archive_current_state() {
                    archived += 1;
                }
            }
            archived
        });
        debug!(namespace = %kind, archived, "storage: archived sessions");
        Ok(archived)
    }

    fn store_sender_key(
        &self,
        sender: SessionAddress,
        distribution_id: Uuid,
        record: Vec<u8>,
    ) -> Result<()> {
        self.with_protocol(|tables| tables.sender_keys.insert((sender, distribution_id), record));
        Ok(())
    }

    fn sender_key_count(&self) -> Result<usize> {
        Ok(self.with_protocol(|tables| tables.sender_keys.len()))
    }

    fn clear_sender_keys(&self) -> Result<usize> {
        let cleared = self.with_protocol(|tables| {
            let cleared = tables.sender_keys.len();
            tables.sender_keys.clear();
            cleared
        });
        debug!(cleared, "storage: cleared sender keys");
        Ok(cleared)
    }
}

impl RecipientStore for MemoryStore {
    fn get_or_create_self(&self, aci: Aci, pni: Pni, e164: &E164) -> Result<RecipientId> {
        let mut tables = lock(&self.inner.recipients);
        let id = match tables.find(aci, pni, e164) {
            Some(id) => id,
            None => {
                tables.next_id += 1;
                let id = RecipientId(tables.next_id);
                tables.rows.insert(id, RecipientRecord::new(id));
                id
            }
        };
        let row = tables.row_mut(id)?;
        row.aci = Some(aci);
        row.pni = Some(pni);
        row.e164 = Some(e164.clone());
        Ok(id)
    }

    fn recipient(&self, id: RecipientId) -> Result<Option<RecipientRecord>> {
        Ok(lock(&self.inner.recipients).rows.get(&id).cloned())
    }

    fn mark_registered(&self, id: RecipientId) -> Result<()> {
        lock(&self.inner.recipients).row_mut(id)?.registered = RegisteredState::Registered;
        Ok(())
    }

    fn set_profile_sharing(&self, id: RecipientId, enabled: bool) -> Result<()> {
        lock(&self.inner.recipients).row_mut(id)?.profile_sharing = enabled;
        Ok(())
    }

    fn set_profile_key(&self, id: RecipientId, key: ProfileKey) -> Result<()> {
        lock(&self.inner.recipients).row_mut(id)?.profile_key = Some(key);
        Ok(())
    }
}

impl GroupStore for MemoryStore {
    fn group(&self, id: GroupId) -> Result<Option<GroupRecord>> {
        Ok(lock(&self.inner.groups).get(&id).cloned())
    }

    fn upsert_group(&self, record: &GroupRecord) -> Result<()> {
        lock(&self.inner.groups).insert(record.id, record.clone());
        Ok(())
    }
}

impl DataStore for MemoryStore {
    fn key_values(&self) -> &dyn KeyValueStore {
        self
    }

    fn protocol(&self) -> &dyn ProtocolStore {
        self
    }

    fn recipients(&self) -> &dyn RecipientStore {
        self
    }

    fn groups(&self) -> &dyn GroupStore {
        self
    }
}
