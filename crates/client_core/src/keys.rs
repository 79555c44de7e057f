//! Key material generation.
//!
//! Identity keys are Ed25519. Signed prekeys are X25519 agreement keys signed
//! by the identity key. The last-resort KEM prekey is carried as an opaque
//! signed public key; the bundled factory derives it the same way as the
//! signed prekey.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use shared::domain::{PreKeyId, ProfileKey, RegistrationId, MAX_PREKEY_ID, MAX_REGISTRATION_ID};
use storage::{IdentityKeyPair, KyberPreKeyRecord, SignedKeyRecord};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

pub trait KeyFactory: Send + Sync {
    fn generate_identity_key_pair(&self) -> Result<IdentityKeyPair>;
    fn generate_signed_pre_key(
        &self,
        id: PreKeyId,
        identity: &IdentityKeyPair,
    ) -> Result<SignedKeyRecord>;
    fn generate_last_resort_kyber_pre_key(
        &self,
        id: PreKeyId,
        identity: &IdentityKeyPair,
    ) -> Result<KyberPreKeyRecord>;
    /// Starting point for a namespace's prekey counter.
    fn random_pre_key_id(&self) -> Result<PreKeyId>;
    fn random_registration_id(&self) -> Result<RegistrationId>;
    fn random_password(&self) -> Result<String>;
    fn random_profile_key(&self) -> Result<ProfileKey>;
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::fill(&mut buf).map_err(|err| anyhow!("system randomness unavailable: {err}"))?;
    Ok(buf)
}

fn random_u32() -> Result<u32> {
    Ok(u32::from_le_bytes(random_bytes::<4>()?))
}

fn signing_key(identity: &IdentityKeyPair) -> Result<SigningKey> {
    let mut seed: [u8; 32] = identity
        .private_key
        .as_slice()
        .try_into()
        .context("identity private key must be 32 bytes")?;
    let key = SigningKey::from_bytes(&seed);
    seed.zeroize();
    Ok(key)
}

pub fn verify_signature(identity_public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(public): Result<[u8; 32], _> = identity_public_key.try_into() else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&public) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(message, &signature).is_ok()
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DalekKeyFactory;

impl DalekKeyFactory {
    fn signed_agreement_key(id: PreKeyId, identity: &IdentityKeyPair) -> Result<SignedKeyRecord> {
        let secret = StaticSecret::from(random_bytes::<32>()?);
        let public = PublicKey::from(&secret);
        let signature = signing_key(identity)?.sign(public.as_bytes());
        Ok(SignedKeyRecord {
            id,
            public_key: public.as_bytes().to_vec(),
            private_key: secret.to_bytes().to_vec(),
            signature: signature.to_bytes().to_vec(),
            created_at: Utc::now(),
        })
    }
}

impl KeyFactory for DalekKeyFactory {
    fn generate_identity_key_pair(&self) -> Result<IdentityKeyPair> {
        let mut seed = random_bytes::<32>()?;
        let key = SigningKey::from_bytes(&seed);
        let pair = IdentityKeyPair {
            public_key: key.verifying_key().to_bytes().to_vec(),
            private_key: seed.to_vec(),
        };
        seed.zeroize();
        Ok(pair)
    }

    fn generate_signed_pre_key(
        &self,
        id: PreKeyId,
        identity: &IdentityKeyPair,
    ) -> Result<SignedKeyRecord> {
        Self::signed_agreement_key(id, identity)
    }

    fn generate_last_resort_kyber_pre_key(
        &self,
        id: PreKeyId,
        identity: &IdentityKeyPair,
    ) -> Result<KyberPreKeyRecord> {
        Ok(KyberPreKeyRecord {
            key: Self::signed_agreement_key(id, identity)?,
            last_resort: true,
        })
    }

    fn random_pre_key_id(&self) -> Result<PreKeyId> {
        // Lower half of the id space, so a fresh counter has room to advance
        // for a long time before it wraps.
        Ok(PreKeyId(random_u32()? % (MAX_PREKEY_ID / 2) + 1))
    }

    fn random_registration_id(&self) -> Result<RegistrationId> {
        Ok(RegistrationId(random_u32()? % MAX_REGISTRATION_ID + 1))
    }

    fn random_password(&self) -> Result<String> {
        Ok(STANDARD.encode(random_bytes::<18>()?))
    }

    fn random_profile_key(&self) -> Result<ProfileKey> {
        Ok(ProfileKey(random_bytes::<32>()?))
    }
}
