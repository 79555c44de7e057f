//! Account registration.
//!
//! After the server has verified control of a phone number, the coordinator
//! binds the returned identifiers to the local account, provisions key
//! material for both identity namespaces, links the self recipient, commits
//! the local account state and schedules follow-up work.
//!
//! Nothing is written locally until verification succeeds. Every step after
//! that overwrites fields with equivalent values or advances monotonic
//! counters, so a failed attempt is recovered by running the whole
//! coordinator again.

use std::{fmt, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::Serialize;
use shared::{
    domain::{
        Aci, Pni, PreKeyId, ProfileKey, RecipientId, RegistrationId, ServiceIdKind, E164,
        PRIMARY_DEVICE_ID,
    },
    protocol::{
        AccountAttributes, PreKeyUploadRequest, SignedPreKeyEntity, VerifyAccountRequest,
    },
};
use storage::DataStore;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
    completion::RegistrationCompletionGate,
    jobs::{Job, JobScheduler},
    keys::KeyFactory,
    network::{Credentials, NetworkError, RegistrationApi},
};

#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    pub e164: E164,
    /// Verification session that proved control of the number.
    pub session_id: Option<String>,
    /// Alternative proof when re-registering from a stored PIN.
    pub recovery_password: Option<String>,
    pub registration_lock: Option<String>,
    /// Account password. Generated when absent.
    pub password: Option<String>,
    pub push_token: Option<String>,
    /// Generated when absent and the account has none yet.
    pub profile_key: Option<ProfileKey>,
}

impl RegistrationRequest {
    pub fn new(e164: E164) -> Self {
        Self {
            e164,
            session_id: None,
            recovery_password: None,
            registration_lock: None,
            password: None,
            push_token: None,
            profile_key: None,
        }
    }

    fn establishes_pin(&self) -> bool {
        self.registration_lock.is_some() || self.recovery_password.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStep {
    IdentityBinding,
    KeyProvisioning,
    RecipientLinking,
    LocalStateCommit,
    FollowUpScheduling,
}

impl fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::IdentityBinding => "identity_binding",
            Self::KeyProvisioning => "key_provisioning",
            Self::RecipientLinking => "recipient_linking",
            Self::LocalStateCommit => "local_state_commit",
            Self::FollowUpScheduling => "follow_up_scheduling",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid registration request: {0}")]
    InvalidRequest(String),
    #[error("failed to prepare registration: {0:#}")]
    Preparation(#[source] anyhow::Error),
    /// Verification failed. No local state was touched.
    #[error(transparent)]
    Network(#[from] NetworkError),
    /// A step after verification failed. Retry by running the coordinator again.
    #[error("registration stopped during {step}: {source:#}")]
    Partial {
        step: RegistrationStep,
        #[source]
        source: anyhow::Error,
    },
}

impl RegistrationError {
    pub fn step(&self) -> Option<RegistrationStep> {
        match self {
            Self::Partial { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProvisionedKeys {
    pub kind: ServiceIdKind,
    pub signed_pre_key_id: PreKeyId,
    pub kyber_pre_key_id: PreKeyId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationOutcome {
    pub aci: Aci,
    pub pni: Pni,
    pub recipient_id: RecipientId,
    pub provisioned: Vec<ProvisionedKeys>,
    pub reregistration: bool,
    /// Whether this attempt also flipped the registration-complete flag.
    pub completed: bool,
}

/// Values derived before verification. Held in memory only until
/// [`AccountRegistrationCoordinator::commit_local_state`] persists them.
#[derive(Debug, Clone)]
struct Prepared {
    password: String,
    aci_registration_id: RegistrationId,
    pni_registration_id: RegistrationId,
    profile_key: ProfileKey,
}

pub struct AccountRegistrationCoordinator {
    store: Arc<dyn DataStore>,
    api: Arc<dyn RegistrationApi>,
    jobs: Arc<dyn JobScheduler>,
    keys: Arc<dyn KeyFactory>,
    gate: Arc<RegistrationCompletionGate>,
}

impl AccountRegistrationCoordinator {
    pub fn new(
        store: Arc<dyn DataStore>,
        api: Arc<dyn RegistrationApi>,
        jobs: Arc<dyn JobScheduler>,
        keys: Arc<dyn KeyFactory>,
        gate: Arc<RegistrationCompletionGate>,
    ) -> Self {
        Self {
            store,
            api,
            jobs,
            keys,
            gate,
        }
    }

    /// Runs verification and then every registration step in order.
    ///
    /// The caller guarantees this is the only registration attempt running
    /// for the local account.
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        if request.session_id.is_none() && request.recovery_password.is_none() {
            return Err(RegistrationError::InvalidRequest(
                "either a verification session or a recovery password is required".into(),
            ));
        }
        let prepared = self.prepare(&request).map_err(RegistrationError::Preparation)?;

        let verify = VerifyAccountRequest {
            number: request.e164.clone(),
            session_id: request.session_id.clone(),
            recovery_password: request.recovery_password.clone(),
            account_attributes: AccountAttributes {
                registration_id: prepared.aci_registration_id,
                pni_registration_id: prepared.pni_registration_id,
                fetches_messages: request.push_token.is_none(),
                registration_lock: request.registration_lock.clone(),
                discoverable_by_phone_number: false,
            },
            skip_device_transfer: true,
            push_token: request.push_token.clone(),
        };
        let verify_credentials = Credentials {
            username: request.e164.to_string(),
            password: prepared.password.clone(),
        };
        let verified = self
            .api
            .verify_account(&verify, &verify_credentials)
            .await
            .inspect_err(|err| {
                warn!("registration: verification failed, nothing was written: {err}");
            })?;

        let (aci, pni) = (verified.aci, verified.pni);
        info!(
            aci = %aci.0,
            reregistration = verified.reregistration,
            "registration: number verified"
        );

        self.bind_identity(aci, pni)
            .map_err(|source| partial(RegistrationStep::IdentityBinding, source))?;

        let account_credentials = Credentials {
            username: format!("{}.{}", aci.0, PRIMARY_DEVICE_ID.0),
            password: prepared.password.clone(),
        };
        let mut provisioned = Vec::with_capacity(ServiceIdKind::ALL.len());
        for kind in ServiceIdKind::ALL {
            let keys = self
                .provision_keys(kind, &account_credentials)
                .await
                .map_err(|source| partial(RegistrationStep::KeyProvisioning, source))?;
            provisioned.push(keys);
        }

        let recipient_id = self
            .link_recipient(aci, pni, &request.e164, prepared.profile_key)
            .map_err(|source| partial(RegistrationStep::RecipientLinking, source))?;

        self.commit_local_state(&request, &prepared)
            .map_err(|source| partial(RegistrationStep::LocalStateCommit, source))?;

        let completed = self
            .schedule_follow_ups(&request)
            .map_err(|source| partial(RegistrationStep::FollowUpScheduling, source))?;

        info!(aci = %aci.0, completed, "registration: finished");
        Ok(RegistrationOutcome {
            aci,
            pni,
            recipient_id,
            provisioned,
            reregistration: verified.reregistration,
            completed,
        })
    }

    /// Reads or generates everything verification needs, without writing.
    fn prepare(&self, request: &RegistrationRequest) -> Result<Prepared> {
        let account = self.store.account();
        let password = match &request.password {
            Some(password) => password.clone(),
            None => self.keys.random_password()?,
        };
        let aci_registration_id = match account.registration_id(ServiceIdKind::Aci)? {
            Some(id) => id,
            None => self.keys.random_registration_id()?,
        };
        let pni_registration_id = match account.registration_id(ServiceIdKind::Pni)? {
            Some(id) => id,
            None => self.keys.random_registration_id()?,
        };
        let profile_key = match (request.profile_key, account.profile_key()?) {
            (Some(key), _) | (None, Some(key)) => key,
            (None, None) => self.keys.random_profile_key()?,
        };
        Ok(Prepared {
            password,
            aci_registration_id,
            pni_registration_id,
            profile_key,
        })
    }

    /// Binds both identifiers to the local account and drops state that
    /// belonged to the previous key material: every session in both
    /// namespaces is archived, every sender key is cleared, and both
    /// namespaces are marked as not having a registered signed prekey.
    ///
    /// Runs before any key is generated. Repeating it is harmless: the
    /// identifiers are overwritten with the same values and there is nothing
    /// left to archive or clear.
    pub fn bind_identity(&self, aci: Aci, pni: Pni) -> Result<()> {
        let account = self.store.account();
        account
            .set_registered(false)
            .context("clearing registered flag")?;
        account.set_aci(aci).context("storing aci")?;
        account.set_pni(pni).context("storing pni")?;

        let protocol = self.store.protocol();
        for kind in ServiceIdKind::ALL {
            let archived = protocol
                .archive_all_sessions(kind)
                .with_context(|| format!("archiving {kind} sessions"))?;
            account.update_pre_key_metadata(kind, |metadata| {
                metadata.signed_pre_key_registered = false;
            })?;
            debug!(namespace = %kind, archived, "registration: sessions archived");
        }
        let cleared = protocol
            .clear_sender_keys()
            .context("clearing sender keys")?;

        info!(cleared_sender_keys = cleared, "registration: identity bound");
        Ok(())
    }

    /// Provisions one namespace: the identity key pair if there is none, a
    /// fresh signed prekey and a fresh last-resort KEM prekey, then uploads
    /// them.
    ///
    /// Counters are advanced before the upload, so a retry after a failed
    /// upload generates keys under strictly larger ids and never reuses one.
    /// The namespace is marked registered only after the server accepted the
    /// upload.
    pub async fn provision_keys(
        &self,
        kind: ServiceIdKind,
        credentials: &Credentials,
    ) -> Result<ProvisionedKeys> {
        let account = self.store.account();
        let protocol = self.store.protocol();

        let identity = match protocol.identity_key_pair(kind)? {
            Some(identity) => identity,
            None => {
                let identity = self
                    .keys
                    .generate_identity_key_pair()
                    .with_context(|| format!("generating {kind} identity key"))?;
                protocol.store_identity_key_pair(kind, &identity)?;
                info!(namespace = %kind, "registration: identity key generated");
                identity
            }
        };

        let metadata = account.pre_key_metadata(kind)?;
        let signed_id = match metadata.next_signed_pre_key_id {
            Some(id) => id,
            None => self.keys.random_pre_key_id()?,
        };
        let kyber_id = match metadata.next_kyber_pre_key_id {
            Some(id) => id,
            None => self.keys.random_pre_key_id()?,
        };

        let signed = self
            .keys
            .generate_signed_pre_key(signed_id, &identity)
            .with_context(|| format!("generating {kind} signed prekey"))?;
        let kyber = self
            .keys
            .generate_last_resort_kyber_pre_key(kyber_id, &identity)
            .with_context(|| format!("generating {kind} last-resort prekey"))?;
        protocol.store_signed_pre_key(kind, &signed)?;
        protocol.store_kyber_pre_key(kind, &kyber)?;

        account.update_pre_key_metadata(kind, |metadata| {
            metadata.active_signed_pre_key_id = Some(signed_id);
            metadata.next_signed_pre_key_id = Some(signed_id.next());
            metadata.last_resort_kyber_pre_key_id = Some(kyber_id);
            metadata.next_kyber_pre_key_id = Some(kyber_id.next());
        })?;

        let upload = PreKeyUploadRequest::new(
            &identity.public_key,
            SignedPreKeyEntity::new(signed.id, &signed.public_key, &signed.signature),
            SignedPreKeyEntity::new(kyber.key.id, &kyber.key.public_key, &kyber.key.signature),
        );
        self.api
            .set_pre_keys(kind, &upload, credentials)
            .await
            .with_context(|| format!("uploading {kind} prekeys"))?;

        account.update_pre_key_metadata(kind, |metadata| {
            metadata.signed_pre_key_registered = true;
        })?;

        info!(
            namespace = %kind,
            signed_pre_key_id = signed_id.0,
            kyber_pre_key_id = kyber_id.0,
            "registration: prekeys provisioned"
        );
        Ok(ProvisionedKeys {
            kind,
            signed_pre_key_id: signed_id,
            kyber_pre_key_id: kyber_id,
        })
    }

    /// Resolves the self recipient, binding it to both identifiers and the
    /// number, and records it as registered with profile sharing on. Lookup is
    /// by identifier, so repeating it lands on the same recipient.
    pub fn link_recipient(
        &self,
        aci: Aci,
        pni: Pni,
        e164: &E164,
        profile_key: ProfileKey,
    ) -> Result<RecipientId> {
        let recipients = self.store.recipients();
        let id = recipients
            .get_or_create_self(aci, pni, e164)
            .context("resolving self recipient")?;
        recipients.mark_registered(id)?;
        recipients.set_profile_sharing(id, true)?;
        recipients.set_profile_key(id, profile_key)?;
        self.store.account().set_profile_key(profile_key)?;

        debug!(recipient = id.0, "registration: self recipient linked");
        Ok(id)
    }

    /// Persists the account fields and flips `registered` as the last write,
    /// so an interrupted attempt still reads as unregistered.
    fn commit_local_state(&self, request: &RegistrationRequest, prepared: &Prepared) -> Result<()> {
        let account = self.store.account();
        account.set_e164(&request.e164)?;
        account.set_push_token(request.push_token.as_deref())?;
        account.set_service_password(&prepared.password)?;
        account.set_registration_id(ServiceIdKind::Aci, prepared.aci_registration_id)?;
        account.set_registration_id(ServiceIdKind::Pni, prepared.pni_registration_id)?;
        account.set_device_id(PRIMARY_DEVICE_ID)?;
        account
            .set_registered(true)
            .context("marking account registered")?;

        info!(e164 = %request.e164, "registration: local state committed");
        Ok(())
    }

    /// Enqueues maintenance work, records PIN state when the request carried
    /// one, then re-evaluates the completion gate. Returns whether the gate
    /// flipped.
    fn schedule_follow_ups(&self, request: &RegistrationRequest) -> Result<bool> {
        // Work that was backing off while unregistered can run right away.
        self.jobs
            .update(&mut |spec| spec.retry_interval = Duration::ZERO);

        for job in [
            Job::DirectoryRefresh,
            Job::RotateSenderCertificate,
            Job::ScheduleSignedPreKeyRotation,
            Job::ScheduleDirectoryRefresh,
        ] {
            self.jobs.enqueue(job.into());
        }

        if request.establishes_pin() {
            let svr = self.store.svr();
            svr.set_pin_established()?;
            if let Some(recovery_password) = &request.recovery_password {
                svr.set_recovery_password(recovery_password)?;
            }
            svr.set_registration_lock_enabled(request.registration_lock.is_some())?;
            debug!("registration: recovery credential state recorded");
        }

        self.gate.evaluate()
    }
}

fn partial(step: RegistrationStep, source: anyhow::Error) -> RegistrationError {
    error!(%step, "registration: step failed: {source:#}");
    RegistrationError::Partial { step, source }
}

#[cfg(test)]
#[path = "tests/registration_tests.rs"]
mod tests;
