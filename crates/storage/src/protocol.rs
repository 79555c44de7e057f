use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::domain::{DeviceId, PreKeyId, ServiceId, ServiceIdKind};
use uuid::Uuid;
use zeroize::Zeroize;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Drop for IdentityKeyPair {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Shared shape of the signed prekey and the last-resort KEM prekey.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedKeyRecord {
    pub id: PreKeyId,
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for SignedKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedKeyRecord")
            .field("id", &self.id)
            .field("public_key", &self.public_key)
            .field("signature", &self.signature)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Drop for SignedKeyRecord {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KyberPreKeyRecord {
    pub key: SignedKeyRecord,
    pub last_resort: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionAddress {
    pub service_id: ServiceId,
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub current: Option<Vec<u8>>,
    pub previous: Vec<Vec<u8>>,
}

impl SessionRecord {
    pub fn has_current_state(&self) -> bool {
        self.current.is_some()
    }

    /// Moves the current state into the previous list. Returns whether there
    /// was anything to archive.
    pub fn archive_current_state(&mut self) -> bool {
        match self.current.take() {
            Some(state) => {
                self.previous.insert(0, state);
                true
            }
            None => false,
        }
    }
}

/// Cryptographic protocol storage, keyed by the local identity namespace.
///
/// Implementations serialize access with the process-wide protocol lock.
pub trait ProtocolStore: Send + Sync {
    fn identity_key_pair(&self, kind: ServiceIdKind) -> Result<Option<IdentityKeyPair>>;
    fn store_identity_key_pair(&self, kind: ServiceIdKind, pair: &IdentityKeyPair) -> Result<()>;

    fn store_signed_pre_key(&self, kind: ServiceIdKind, record: &SignedKeyRecord) -> Result<()>;
    fn load_signed_pre_key(
        &self,
        kind: ServiceIdKind,
        id: PreKeyId,
    ) -> Result<Option<SignedKeyRecord>>;

    fn store_kyber_pre_key(&self, kind: ServiceIdKind, record: &KyberPreKeyRecord) -> Result<()>;
    fn load_kyber_pre_key(
        &self,
        kind: ServiceIdKind,
        id: PreKeyId,
    ) -> Result<Option<KyberPreKeyRecord>>;

    fn store_session(
        &self,
        kind: ServiceIdKind,
        address: SessionAddress,
        state: Vec<u8>,
    ) -> Result<()>;
    fn load_session(
        &self,
        kind: ServiceIdKind,
        address: SessionAddress,
    ) -> Result<Option<SessionRecord>>;
    /// Returns how many sessions had a current state archived.
    fn archive_all_sessions(&self, kind: ServiceIdKind) -> Result<usize>;

    fn store_sender_key(
        &self,
        sender: SessionAddress,
        distribution_id: Uuid,
        record: Vec<u8>,
    ) -> Result<()>;
    fn sender_key_count(&self) -> Result<usize>;
    fn clear_sender_keys(&self) -> Result<usize>;
}
