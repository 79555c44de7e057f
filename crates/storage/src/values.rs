use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::domain::{
    Aci, DeviceId, PhoneNumberDiscoverability, Pni, PreKeyId, ProfileKey, RegistrationId,
    ServiceIdKind, E164,
};

use crate::kv::{KeyValueExt, KeyValueStore};

mod keys {
    pub const ACI: &str = "account.aci";
    pub const PNI: &str = "account.pni";
    pub const E164: &str = "account.e164";
    pub const SERVICE_PASSWORD: &str = "account.service_password";
    pub const PUSH_TOKEN: &str = "account.push_token";
    pub const DEVICE_ID: &str = "account.device_id";
    pub const REGISTERED: &str = "account.registered";
    pub const PROFILE_KEY: &str = "account.profile_key";
    pub const REGISTRATION_COMPLETE: &str = "registration.complete";
    pub const PROFILE_NAME: &str = "profile.given_name";
    pub const PIN_SET: &str = "svr.pin_set";
    pub const PIN_OPTED_OUT: &str = "svr.opted_out";
    pub const RECOVERY_PASSWORD: &str = "svr.recovery_password";
    pub const REGISTRATION_LOCK: &str = "svr.registration_lock_enabled";
    pub const DISCOVERABILITY: &str = "phone_number_privacy.discoverability";
}

fn registration_id_key(kind: ServiceIdKind) -> String {
    format!("account.{kind}.registration_id")
}

fn pre_key_metadata_key(kind: ServiceIdKind) -> String {
    format!("account.{kind}.pre_keys")
}

/// Per-namespace prekey counters and flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyMetadata {
    pub next_signed_pre_key_id: Option<PreKeyId>,
    pub active_signed_pre_key_id: Option<PreKeyId>,
    pub next_kyber_pre_key_id: Option<PreKeyId>,
    pub last_resort_kyber_pre_key_id: Option<PreKeyId>,
    pub signed_pre_key_registered: bool,
}

pub struct AccountValues<'a> {
    kv: &'a dyn KeyValueStore,
}

impl<'a> AccountValues<'a> {
    pub fn new(kv: &'a dyn KeyValueStore) -> Self {
        Self { kv }
    }

    pub fn aci(&self) -> Result<Option<Aci>> {
        self.kv.get(keys::ACI)
    }

    pub fn set_aci(&self, aci: Aci) -> Result<()> {
        self.kv.put(keys::ACI, &aci)
    }

    pub fn pni(&self) -> Result<Option<Pni>> {
        self.kv.get(keys::PNI)
    }

    pub fn set_pni(&self, pni: Pni) -> Result<()> {
        self.kv.put(keys::PNI, &pni)
    }

    pub fn e164(&self) -> Result<Option<E164>> {
        self.kv.get(keys::E164)
    }

    pub fn set_e164(&self, e164: &E164) -> Result<()> {
        self.kv.put(keys::E164, e164)
    }

    pub fn service_password(&self) -> Result<Option<String>> {
        self.kv.get(keys::SERVICE_PASSWORD)
    }

    pub fn set_service_password(&self, password: &str) -> Result<()> {
        self.kv.put(keys::SERVICE_PASSWORD, &password)
    }

    pub fn push_token(&self) -> Result<Option<String>> {
        self.kv.get(keys::PUSH_TOKEN)
    }

    pub fn set_push_token(&self, token: Option<&str>) -> Result<()> {
        match token {
            Some(token) => self.kv.put(keys::PUSH_TOKEN, &token),
            None => self.kv.remove(keys::PUSH_TOKEN),
        }
    }

    pub fn device_id(&self) -> Result<Option<DeviceId>> {
        self.kv.get(keys::DEVICE_ID)
    }

    pub fn set_device_id(&self, device_id: DeviceId) -> Result<()> {
        self.kv.put(keys::DEVICE_ID, &device_id)
    }

    pub fn registration_id(&self, kind: ServiceIdKind) -> Result<Option<RegistrationId>> {
        self.kv.get(&registration_id_key(kind))
    }

    pub fn set_registration_id(&self, kind: ServiceIdKind, id: RegistrationId) -> Result<()> {
        self.kv.put(&registration_id_key(kind), &id)
    }

    pub fn is_registered(&self) -> Result<bool> {
        self.kv.get_or(keys::REGISTERED, false)
    }

    pub fn set_registered(&self, registered: bool) -> Result<()> {
        self.kv.put(keys::REGISTERED, &registered)
    }

    pub fn profile_key(&self) -> Result<Option<ProfileKey>> {
        self.kv.get(keys::PROFILE_KEY)
    }

    pub fn set_profile_key(&self, key: ProfileKey) -> Result<()> {
        self.kv.put(keys::PROFILE_KEY, &key)
    }

    pub fn pre_key_metadata(&self, kind: ServiceIdKind) -> Result<PreKeyMetadata> {
        self.kv.get_or(&pre_key_metadata_key(kind), PreKeyMetadata::default())
    }

    pub fn update_pre_key_metadata(
        &self,
        kind: ServiceIdKind,
        update: impl FnOnce(&mut PreKeyMetadata),
    ) -> Result<PreKeyMetadata> {
        let mut metadata = self.pre_key_metadata(kind)?;
        update(&mut metadata);
        self.kv.put(&pre_key_metadata_key(kind), &metadata)?;
        Ok(metadata)
    }
}

pub struct RegistrationValues<'a> {
    kv: &'a dyn KeyValueStore,
}

impl<'a> RegistrationValues<'a> {
    pub fn new(kv: &'a dyn KeyValueStore) -> Self {
        Self { kv }
    }

    pub fn is_registration_complete(&self) -> Result<bool> {
        self.kv.get_or(keys::REGISTRATION_COMPLETE, false)
    }

    /// One-way: there is deliberately no setter back to `false`.
    pub fn mark_registration_complete(&self) -> Result<()> {
        self.kv.put(keys::REGISTRATION_COMPLETE, &true)
    }
}

pub struct ProfileValues<'a> {
    kv: &'a dyn KeyValueStore,
}

impl<'a> ProfileValues<'a> {
    pub fn new(kv: &'a dyn KeyValueStore) -> Self {
        Self { kv }
    }

    pub fn profile_name(&self) -> Result<Option<String>> {
        self.kv.get(keys::PROFILE_NAME)
    }

    pub fn set_profile_name(&self, name: &str) -> Result<()> {
        self.kv.put(keys::PROFILE_NAME, &name)
    }

    pub fn is_profile_name_set(&self) -> Result<bool> {
        Ok(self
            .profile_name()?
            .is_some_and(|name| !name.trim().is_empty()))
    }
}

/// PIN and recovery credential state.
pub struct SvrValues<'a> {
    kv: &'a dyn KeyValueStore,
}

impl<'a> SvrValues<'a> {
    pub fn new(kv: &'a dyn KeyValueStore) -> Self {
        Self { kv }
    }

    pub fn has_pin(&self) -> Result<bool> {
        self.kv.get_or(keys::PIN_SET, false)
    }

    pub fn has_opted_out(&self) -> Result<bool> {
        self.kv.get_or(keys::PIN_OPTED_OUT, false)
    }

    pub fn set_pin_established(&self) -> Result<()> {
        self.kv.put(keys::PIN_SET, &true)?;
        self.kv.put(keys::PIN_OPTED_OUT, &false)
    }

    pub fn opt_out(&self) -> Result<()> {
        self.kv.put(keys::PIN_OPTED_OUT, &true)?;
        self.kv.put(keys::PIN_SET, &false)
    }

    pub fn recovery_password(&self) -> Result<Option<String>> {
        self.kv.get(keys::RECOVERY_PASSWORD)
    }

    pub fn set_recovery_password(&self, password: &str) -> Result<()> {
        self.kv.put(keys::RECOVERY_PASSWORD, &password)
    }

    pub fn is_registration_lock_enabled(&self) -> Result<bool> {
        self.kv.get_or(keys::REGISTRATION_LOCK, false)
    }

    pub fn set_registration_lock_enabled(&self, enabled: bool) -> Result<()> {
        self.kv.put(keys::REGISTRATION_LOCK, &enabled)
    }
}

pub struct PhoneNumberPrivacyValues<'a> {
    kv: &'a dyn KeyValueStore,
}

impl<'a> PhoneNumberPrivacyValues<'a> {
    pub fn new(kv: &'a dyn KeyValueStore) -> Self {
        Self { kv }
    }

    pub fn discoverability(&self) -> Result<PhoneNumberDiscoverability> {
        self.kv
            .get_or(keys::DISCOVERABILITY, PhoneNumberDiscoverability::default())
    }

    pub fn set_discoverability(&self, mode: PhoneNumberDiscoverability) -> Result<()> {
        self.kv.put(keys::DISCOVERABILITY, &mode)
    }
}
