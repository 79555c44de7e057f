use std::{
    collections::{BTreeSet, HashMap},
    fs,
    future::Future,
    marker::PhantomData,
    panic,
    path::{Path, PathBuf},
    pin::Pin,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use locks::{ReentrantLock, TransactionProbe};
use serde_json::Value;
use shared::domain::{Aci, GroupId, Pni, PreKeyId, ProfileKey, RecipientId, ServiceIdKind, E164};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow},
    Connection, Pool, Row, Sqlite, Transaction,
};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info, warn};
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

type ConnFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives `fut` to completion on the storage runtime from synchronous code.
fn block_on<F>(handle: &Handle, fut: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    if Handle::try_current().is_err() {
        return handle.block_on(fut);
    }
    // Tokio refuses to block a thread that is already driving a runtime.
    thread::scope(|scope| match scope.spawn(|| handle.block_on(fut)).join() {
        Ok(output) => output,
        Err(payload) => panic::resume_unwind(payload),
    })
}

/// An open `sqlx` transaction owned by one thread.
struct TxScope {
    tx: Transaction<'static, Sqlite>,
    depth: u32,
    rollback_only: bool,
}

struct Inner {
    handle: Handle,
    runtime: Option<Runtime>,
    pool: Pool<Sqlite>,
    protocol_lock: Arc<ReentrantLock>,
    transactions: Mutex<HashMap<ThreadId, TxScope>>,
}

impl Inner {
    fn block_on<F>(&self, fut: F) -> F::Output
    where
        F: Future + Send,
        F::Output: Send,
    {
        block_on(&self.handle, fut)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let open: Vec<TxScope> = self
            .transactions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, scope)| scope)
            .collect();
        let pool = self.pool.clone();
        block_on(&self.handle, async move {
            for scope in open {
                if let Err(err) = scope.tx.rollback().await {
                    warn!("storage: rollback of abandoned transaction failed: {err}");
                }
            }
            pool.close().await;
        });
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// SQLite-backed data store.
///
/// The store exposes the same synchronous traits as [`crate::MemoryStore`];
/// queries run on a small private runtime. Protocol-state access is
/// serialized by the shared protocol lock, and every query a thread issues
/// while it has a transaction open runs inside that transaction.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

impl SqliteStore {
    pub fn open(database_url: &str, protocol_lock: Arc<ReentrantLock>) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true);
        let in_memory = sqlite_path(database_url).is_none();
        let pool_options = if in_memory {
            // Each connection to an in-memory url gets its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("storage-sqlite")
            .enable_all()
            .build()
            .context("failed to start the storage runtime")?;
        let handle = runtime.handle().clone();

        let opened = block_on(&handle, async move {
            let pool = pool_options.connect_with(connect_options).await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            Ok::<_, anyhow::Error>(pool)
        });
        let pool = match opened {
            Ok(pool) => pool,
            Err(err) => {
                runtime.shutdown_background();
                return Err(err.context(format!("failed to open database '{database_url}'")));
            }
        };
        info!(database_url, in_memory, "storage: database opened");

        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                runtime: Some(runtime),
                pool,
                protocol_lock,
                transactions: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn protocol_lock(&self) -> &Arc<ReentrantLock> {
        &self.inner.protocol_lock
    }

    /// Opens a transaction on the calling thread. Nested calls join the
    /// outer transaction, which commits only when the outermost guard does.
    /// A guard dropped without `commit` rolls the whole transaction back.
    pub fn begin_transaction(&self) -> Result<SqliteTransaction<'_>> {
        let me = thread::current().id();
        if let Some(scope) = lock(&self.inner.transactions).get_mut(&me) {
            scope.depth += 1;
            return Ok(SqliteTransaction::new(self));
        }

        let pool = self.inner.pool.clone();
        let tx = self
            .inner
            .block_on(async move { pool.begin().await })
            .context("failed to begin transaction")?;
        lock(&self.inner.transactions).insert(
            me,
            TxScope {
                tx,
                depth: 1,
                rollback_only: false,
            },
        );
        debug!("storage: transaction opened");
        Ok(SqliteTransaction::new(self))
    }

    fn finish_transaction(&self, commit: bool) -> Result<()> {
        let me = thread::current().id();
        let scope = {
            let mut open = lock(&self.inner.transactions);
            let Some(scope) = open.get_mut(&me) else {
                return Ok(());
            };
            scope.depth = scope.depth.saturating_sub(1);
            scope.rollback_only |= !commit;
            if scope.depth > 0 {
                return Ok(());
            }
            open.remove(&me)
        };
        let Some(TxScope {
            tx, rollback_only, ..
        }) = scope
        else {
            return Ok(());
        };

        if rollback_only {
            self.inner
                .block_on(async move { tx.rollback().await })
                .context("failed to roll back transaction")?;
            debug!("storage: transaction rolled back");
            if commit {
                return Err(anyhow!("transaction was rolled back by an inner scope"));
            }
            return Ok(());
        }
        self.inner
            .block_on(async move { tx.commit().await })
            .context("failed to commit transaction")?;
        debug!("storage: transaction committed");
        Ok(())
    }

    /// Runs `op` on this thread's open transaction, or on a pooled
    /// connection when there is none.
    fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> ConnFuture<'c, T> + Send,
    {
        let me = thread::current().id();
        let scope = lock(&self.inner.transactions).remove(&me);
        match scope {
            Some(mut scope) => {
                let (scope, result) = self.inner.block_on(async move {
                    let result = op(&mut *scope.tx).await;
                    (scope, result)
                });
                lock(&self.inner.transactions).insert(me, scope);
                result
            }
            None => {
                let pool = self.inner.pool.clone();
                self.inner.block_on(async move {
                    let mut conn = pool.acquire().await?;
                    op(&mut *conn).await
                })
            }
        }
    }

    fn with_protocol<T, F>(&self, op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> ConnFuture<'c, T> + Send,
    {
        let _guard = self.inner.protocol_lock.acquire();
        self.with_conn(op)
    }
}

#[must_use = "the transaction rolls back unless committed"]
pub struct SqliteTransaction<'a> {
    store: &'a SqliteStore,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl<'a> SqliteTransaction<'a> {
    fn new(store: &'a SqliteStore) -> Self {
        Self {
            store,
            finished: false,
            _not_send: PhantomData,
        }
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.store.finish_transaction(true)
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.store.finish_transaction(false)
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.store.finish_transaction(false) {
            warn!("storage: rollback on drop failed: {err:#}");
        }
    }
}

impl TransactionProbe for SqliteStore {
    fn in_transaction(&self) -> bool {
        lock(&self.inner.transactions).contains_key(&thread::current().id())
    }
}

impl KeyValueStore for SqliteStore {
    fn get_raw(&self, key: &str) -> Result<Option<Value>> {
        let name = key.to_string();
        let raw = self.with_conn(move |conn| Box::pin(kv_get(conn, name)))?;
        raw.map(|raw| {
            serde_json::from_str(&raw).with_context(|| format!("malformed json under '{key}'"))
        })
        .transpose()
    }

    fn put_raw(&self, key: &str, value: Value) -> Result<()> {
        let name = key.to_string();
        let raw = value.to_string();
        self.with_conn(move |conn| Box::pin(kv_put(conn, name, raw)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let name = key.to_string();
        self.with_conn(move |conn| Box::pin(kv_remove(conn, name)))
    }
}

impl ProtocolStore for SqliteStore {
    fn identity_key_pair(&self, kind: ServiceIdKind) -> Result<Option<IdentityKeyPair>> {
        self.with_protocol(move |conn| Box::pin(identity_get(conn, kind)))
    }

    fn store_identity_key_pair(&self, kind: ServiceIdKind, pair: &IdentityKeyPair) -> Result<()> {
        let pair = pair.clone();
        self.with_protocol(move |conn| Box::pin(identity_put(conn, kind, pair)))
    }

    fn store_signed_pre_key(&self, kind: ServiceIdKind, record: &SignedKeyRecord) -> Result<()> {
        let record = record.clone();
        self.with_protocol(move |conn| Box::pin(signed_pre_key_put(conn, kind, record)))
    }

    fn load_signed_pre_key(
        &self,
        kind: ServiceIdKind,
        id: PreKeyId,
    ) -> Result<Option<SignedKeyRecord>> {
        self.with_protocol(move |conn| Box::pin(signed_pre_key_get(conn, kind, id)))
    }

    fn store_kyber_pre_key(&self, kind: ServiceIdKind, record: &KyberPreKeyRecord) -> Result<()> {
        let record = record.clone();
        self.with_protocol(move |conn| Box::pin(kyber_pre_key_put(conn, kind, record)))
    }

    fn load_kyber_pre_key(
        &self,
        kind: ServiceIdKind,
        id: PreKeyId,
    ) -> Result<Option<KyberPreKeyRecord>> {
        self.with_protocol(move |conn| Box::pin(kyber_pre_key_get(conn, kind, id)))
    }

    fn store_session(
        &self,
        kind: ServiceIdKind,
        address: SessionAddress,
        state: Vec<u8>,
    ) -> Result<()> {
        let address = address_key(&address)?;
        self.with_protocol(move |conn| Box::pin(session_push_state(conn, kind, address, state)))
    }

    fn load_session(
        &self,
        kind: ServiceIdKind,
        address: SessionAddress,
    ) -> Result<Option<SessionRecord>> {
        let address = address_key(&address)?;
        self.with_protocol(move |conn| Box::pin(session_get(conn, kind, address)))
    }

    fn archive_all_sessions(&self, kind: ServiceIdKind) -> Result<usize> {
        let archived = self.with_protocol(move |conn| Box::pin(sessions_archive(conn, kind)))?;
        debug!(namespace = %kind, archived, "storage: archived sessions");
        Ok(archived)
    }

    fn store_sender_key(
        &self,
        sender: SessionAddress,
        distribution_id: Uuid,
        record: Vec<u8>,
    ) -> Result<()> {
        let sender = address_key(&sender)?;
        self.with_protocol(move |conn| {
            Box::pin(sender_key_put(conn, sender, distribution_id, record))
        })
    }

    fn sender_key_count(&self) -> Result<usize> {
        self.with_protocol(|conn| Box::pin(sender_key_count(conn)))
    }

    fn clear_sender_keys(&self) -> Result<usize> {
        let cleared = self.with_protocol(|conn| Box::pin(sender_keys_clear(conn)))?;
        debug!(cleared, "storage: cleared sender keys");
        Ok(cleared)
    }
}

impl RecipientStore for SqliteStore {
    fn get_or_create_self(&self, aci: Aci, pni: Pni, e164: &E164) -> Result<RecipientId> {
        let e164 = e164.clone();
        self.with_conn(move |conn| Box::pin(recipient_get_or_create(conn, aci, pni, e164)))
    }

    fn recipient(&self, id: RecipientId) -> Result<Option<RecipientRecord>> {
        self.with_conn(move |conn| Box::pin(recipient_get(conn, id)))
    }

    fn mark_registered(&self, id: RecipientId) -> Result<()> {
        self.with_conn(move |conn| {
            Box::pin(recipient_update(
                conn,
                id,
                RecipientUpdate::Registered(RegisteredState::Registered),
            ))
        })
    }

    fn set_profile_sharing(&self, id: RecipientId, enabled: bool) -> Result<()> {
        self.with_conn(move |conn| {
            Box::pin(recipient_update(
                conn,
                id,
                RecipientUpdate::ProfileSharing(enabled),
            ))
        })
    }

    fn set_profile_key(&self, id: RecipientId, key: ProfileKey) -> Result<()> {
        self.with_conn(move |conn| {
            Box::pin(recipient_update(conn, id, RecipientUpdate::ProfileKey(key)))
        })
    }
}

impl GroupStore for SqliteStore {
    fn group(&self, id: GroupId) -> Result<Option<GroupRecord>> {
        self.with_conn(move |conn| Box::pin(group_get(conn, id)))
    }

    fn upsert_group(&self, record: &GroupRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| Box::pin(group_upsert(conn, record)))
    }
}

impl DataStore for SqliteStore {
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

async fn kv_get(conn: &mut SqliteConnection, name: String) -> Result<Option<String>> {
    let row = sqlx::query("SELECT value FROM key_values WHERE name = ?1")
        .bind(name.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|row| row.try_get("value")).transpose()?)
}

async fn kv_put(conn: &mut SqliteConnection, name: String, value: String) -> Result<()> {
    sqlx::query(
        "INSERT INTO key_values (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
    )
    .bind(name.as_str())
    .bind(value.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn kv_remove(conn: &mut SqliteConnection, name: String) -> Result<()> {
    sqlx::query("DELETE FROM key_values WHERE name = ?1")
        .bind(name.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn identity_get(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
) -> Result<Option<IdentityKeyPair>> {
    let row =
        sqlx::query("SELECT public_key, private_key FROM identity_keys WHERE namespace = ?1")
            .bind(kind.as_str())
            .fetch_optional(&mut *conn)
            .await?;
    row.map(|row| {
        Ok(IdentityKeyPair {
            public_key: row.try_get("public_key")?,
            private_key: row.try_get("private_key")?,
        })
    })
    .transpose()
}

async fn identity_put(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    pair: IdentityKeyPair,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO identity_keys (namespace, public_key, private_key) VALUES (?1, ?2, ?3)
         ON CONFLICT(namespace) DO UPDATE SET
           public_key = excluded.public_key,
           private_key = excluded.private_key",
    )
    .bind(kind.as_str())
    .bind(pair.public_key.as_slice())
    .bind(pair.private_key.as_slice())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn signed_key_from_row(row: &SqliteRow) -> Result<SignedKeyRecord> {
    Ok(SignedKeyRecord {
        id: PreKeyId(u32::try_from(row.try_get::<i64, _>("key_id")?)?),
        public_key: row.try_get("public_key")?,
        private_key: row.try_get("private_key")?,
        signature: row.try_get("signature")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn signed_pre_key_put(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    record: SignedKeyRecord,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO signed_pre_keys
           (namespace, key_id, public_key, private_key, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(namespace, key_id) DO UPDATE SET
           public_key = excluded.public_key,
           private_key = excluded.private_key,
           signature = excluded.signature,
           created_at = excluded.created_at",
    )
    .bind(kind.as_str())
    .bind(i64::from(record.id.0))
    .bind(record.public_key.as_slice())
    .bind(record.private_key.as_slice())
    .bind(record.signature.as_slice())
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn signed_pre_key_get(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    id: PreKeyId,
) -> Result<Option<SignedKeyRecord>> {
    let row = sqlx::query(
        "SELECT key_id, public_key, private_key, signature, created_at
         FROM signed_pre_keys WHERE namespace = ?1 AND key_id = ?2",
    )
    .bind(kind.as_str())
    .bind(i64::from(id.0))
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(signed_key_from_row).transpose()
}

async fn kyber_pre_key_put(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    record: KyberPreKeyRecord,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO kyber_pre_keys
           (namespace, key_id, public_key, private_key, signature, created_at, last_resort)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(namespace, key_id) DO UPDATE SET
           public_key = excluded.public_key,
           private_key = excluded.private_key,
           signature = excluded.signature,
           created_at = excluded.created_at,
           last_resort = excluded.last_resort",
    )
    .bind(kind.as_str())
    .bind(i64::from(record.key.id.0))
    .bind(record.key.public_key.as_slice())
    .bind(record.key.private_key.as_slice())
    .bind(record.key.signature.as_slice())
    .bind(record.key.created_at)
    .bind(record.last_resort)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn kyber_pre_key_get(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    id: PreKeyId,
) -> Result<Option<KyberPreKeyRecord>> {
    let row = sqlx::query(
        "SELECT key_id, public_key, private_key, signature, created_at, last_resort
         FROM kyber_pre_keys WHERE namespace = ?1 AND key_id = ?2",
    )
    .bind(kind.as_str())
    .bind(i64::from(id.0))
    .fetch_optional(&mut *conn)
    .await?;
    row.map(|row| {
        Ok(KyberPreKeyRecord {
            key: signed_key_from_row(&row)?,
            last_resort: row.try_get("last_resort")?,
        })
    })
    .transpose()
}

fn address_key(address: &SessionAddress) -> Result<String> {
    serde_json::to_string(address).context("failed to encode session address")
}

async fn session_get(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    address: String,
) -> Result<Option<SessionRecord>> {
    let row = sqlx::query("SELECT record FROM sessions WHERE namespace = ?1 AND address = ?2")
        .bind(kind.as_str())
        .bind(address.as_str())
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| {
        let raw: String = row.try_get("record")?;
        serde_json::from_str(&raw).context("malformed session record")
    })
    .transpose()
}

async fn session_put(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    address: &str,
    record: &SessionRecord,
) -> Result<()> {
    let raw = serde_json::to_string(record).context("failed to encode session record")?;
    sqlx::query(
        "INSERT INTO sessions (namespace, address, record) VALUES (?1, ?2, ?3)
         ON CONFLICT(namespace, address) DO UPDATE SET record = excluded.record",
    )
    .bind(kind.as_str())
    .bind(address)
    .bind(raw.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn session_push_state(
    conn: &mut SqliteConnection,
    kind: ServiceIdKind,
    address: String,
    state: Vec<u8>,
) -> Result<()> {
    let mut record = session_get(conn, kind, address.clone())
        .await?
        .unwrap_or_default();
    record.archive_current_state();
    record.current = Some(state);
    session_put(conn, kind, &address, &record).await
}

async fn sessions_archive(conn: &mut SqliteConnection, kind: ServiceIdKind) -> Result<usize> {
    let mut tx = conn.begin().await?;
    let rows = sqlx::query("SELECT address, record FROM sessions WHERE namespace = ?1")
        .bind(kind.as_str())
        .fetch_all(&mut *tx)
        .await?;

    let mut archived = 0;
    for row in rows {
        let address: String = row.try_get("address")?;
        let raw: String = row.try_get("record")?;
        let mut record: SessionRecord =
            serde_json::from_str(&raw).context("malformed session record")?;
        if record.archive_current_state() {
            session_put(&mut tx, kind, &address, &record).await?;
            archived += 1;
        }
    }
    tx.commit().await?;
    Ok(archived)
}

async fn sender_key_put(
    conn: &mut SqliteConnection,
    sender: String,
    distribution_id: Uuid,
    record: Vec<u8>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sender_keys (sender, distribution_id, record) VALUES (?1, ?2, ?3)
         ON CONFLICT(sender, distribution_id) DO UPDATE SET record = excluded.record",
    )
    .bind(sender.as_str())
    .bind(distribution_id.to_string())
    .bind(record.as_slice())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn sender_key_count(conn: &mut SqliteConnection) -> Result<usize> {
    let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM sender_keys")
        .fetch_one(&mut *conn)
        .await?
        .try_get("count")?;
    Ok(usize::try_from(count)?)
}

async fn sender_keys_clear(conn: &mut SqliteConnection) -> Result<usize> {
    let result = sqlx::query("DELETE FROM sender_keys")
        .execute(&mut *conn)
        .await?;
    Ok(usize::try_from(result.rows_affected())?)
}

fn registered_state_str(state: RegisteredState) -> &'static str {
    match state {
        RegisteredState::Unknown => "unknown",
        RegisteredState::Registered => "registered",
        RegisteredState::NotRegistered => "not_registered",
    }
}

fn parse_registered_state(raw: &str) -> Result<RegisteredState> {
    match raw {
        "unknown" => Ok(RegisteredState::Unknown),
        "registered" => Ok(RegisteredState::Registered),
        "not_registered" => Ok(RegisteredState::NotRegistered),
        other => Err(anyhow!("unknown registered state '{other}'")),
    }
}

fn parse_uuid_column(row: &SqliteRow, column: &str) -> Result<Option<Uuid>> {
    row.try_get::<Option<String>, _>(column)?
        .map(|raw| {
            Uuid::parse_str(&raw).with_context(|| format!("malformed uuid in '{column}'"))
        })
        .transpose()
}

async fn recipient_id_where(
    conn: &mut SqliteConnection,
    sql: &str,
    value: &str,
) -> Result<Option<RecipientId>> {
    let row = sqlx::query(sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row
        .map(|row| row.try_get::<i64, _>("id"))
        .transpose()?
        .map(RecipientId))
}

async fn recipient_get_or_create(
    conn: &mut SqliteConnection,
    aci: Aci,
    pni: Pni,
    e164: E164,
) -> Result<RecipientId> {
    let (aci, pni) = (aci.0.to_string(), pni.0.to_string());
    let mut tx = conn.begin().await?;

    let mut found = recipient_id_where(
        &mut tx,
        "SELECT id FROM recipients WHERE aci = ?1 ORDER BY id LIMIT 1",
        &aci,
    )
    .await?;
    if found.is_none() {
        found = recipient_id_where(
            &mut tx,
            "SELECT id FROM recipients WHERE pni = ?1 ORDER BY id LIMIT 1",
            &pni,
        )
        .await?;
    }
    if found.is_none() {
        found = recipient_id_where(
            &mut tx,
            "SELECT id FROM recipients WHERE e164 = ?1 ORDER BY id LIMIT 1",
            e164.as_str(),
        )
        .await?;
    }

    let id = match found {
        Some(id) => {
            sqlx::query("UPDATE recipients SET aci = ?1, pni = ?2, e164 = ?3 WHERE id = ?4")
                .bind(aci.as_str())
                .bind(pni.as_str())
                .bind(e164.as_str())
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
            id
        }
        None => {
            let result = sqlx::query("INSERT INTO recipients (aci, pni, e164) VALUES (?1, ?2, ?3)")
                .bind(aci.as_str())
                .bind(pni.as_str())
                .bind(e164.as_str())
                .execute(&mut *tx)
                .await?;
            RecipientId(result.last_insert_rowid())
        }
    };
    tx.commit().await?;
    Ok(id)
}

async fn recipient_get(
    conn: &mut SqliteConnection,
    id: RecipientId,
) -> Result<Option<RecipientRecord>> {
    let row = sqlx::query(
        "SELECT id, aci, pni, e164, registered, profile_sharing, profile_key
         FROM recipients WHERE id = ?1",
    )
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let e164 = row
        .try_get::<Option<String>, _>("e164")?
        .map(|raw| E164::parse(&raw))
        .transpose()?;
    let registered: String = row.try_get("registered")?;
    let profile_key = row
        .try_get::<Option<Vec<u8>>, _>("profile_key")?
        .map(|raw| {
            <[u8; 32]>::try_from(raw.as_slice())
                .map(ProfileKey)
                .map_err(|_| anyhow!("profile key for recipient {} is not 32 bytes", id.0))
        })
        .transpose()?;

    Ok(Some(RecipientRecord {
        id: RecipientId(row.try_get("id")?),
        aci: parse_uuid_column(&row, "aci")?.map(Aci),
        pni: parse_uuid_column(&row, "pni")?.map(Pni),
        e164,
        registered: parse_registered_state(&registered)?,
        profile_sharing: row.try_get("profile_sharing")?,
        profile_key,
    }))
}

enum RecipientUpdate {
    Registered(RegisteredState),
    ProfileSharing(bool),
    ProfileKey(ProfileKey),
}

async fn recipient_update(
    conn: &mut SqliteConnection,
    id: RecipientId,
    update: RecipientUpdate,
) -> Result<()> {
    let query = match &update {
        RecipientUpdate::Registered(state) => {
            sqlx::query("UPDATE recipients SET registered = ?1 WHERE id = ?2")
                .bind(registered_state_str(*state))
        }
        RecipientUpdate::ProfileSharing(enabled) => {
            sqlx::query("UPDATE recipients SET profile_sharing = ?1 WHERE id = ?2").bind(*enabled)
        }
        RecipientUpdate::ProfileKey(key) => {
            sqlx::query("UPDATE recipients SET profile_key = ?1 WHERE id = ?2")
                .bind(key.0.as_slice())
        }
    };
    let result = query.bind(id.0).execute(&mut *conn).await?;
    if result.rows_affected() == 0 {
        return Err(anyhow!("recipient {} does not exist", id.0));
    }
    Ok(())
}

async fn group_get(conn: &mut SqliteConnection, id: GroupId) -> Result<Option<GroupRecord>> {
    let row = sqlx::query("SELECT id, revision, members FROM group_records WHERE id = ?1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|row| {
        let members: String = row.try_get("members")?;
        let members: BTreeSet<Aci> =
            serde_json::from_str(&members).context("malformed group members")?;
        Ok(GroupRecord {
            id: GroupId(row.try_get("id")?),
            revision: u32::try_from(row.try_get::<i64, _>("revision")?)?,
            members,
        })
    })
    .transpose()
}

async fn group_upsert(conn: &mut SqliteConnection, record: GroupRecord) -> Result<()> {
    let members = serde_json::to_string(&record.members).context("failed to encode members")?;
    sqlx::query(
        "INSERT INTO group_records (id, revision, members) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET revision = excluded.revision, members = excluded.members",
    )
    .bind(record.id.0)
    .bind(i64::from(record.revision))
    .bind(members.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/sqlite_tests.rs"]
mod tests;
