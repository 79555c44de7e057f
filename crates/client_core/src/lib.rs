//! Client-side account coordination: registration, the completion gate and
//! lock-guarded group processing, wired over one shared data store.

use std::sync::Arc;

use anyhow::{Context, Result};
use locks::{nesting_checker, GroupProcessingLock, ReentrantLock};
use storage::{DataStore, SqliteStore};
use tracing::info;

pub mod completion;
pub mod config;
pub mod groups;
pub mod jobs;
pub mod keys;
pub mod network;
pub mod registration;

pub use completion::{should_mark_complete, CompletionInputs, RegistrationCompletionGate};
pub use config::{load_settings, load_settings_from, Settings};
pub use groups::{GroupProcessor, GroupUpdateError, MembershipChange};
pub use jobs::{Job, JobChain, JobScheduler, JobSpec, MemoryJobQueue};
pub use keys::{DalekKeyFactory, KeyFactory};
pub use network::{Credentials, HttpRegistrationApi, NetworkError, RegistrationApi};
pub use registration::{
    AccountRegistrationCoordinator, ProvisionedKeys, RegistrationError, RegistrationOutcome,
    RegistrationRequest, RegistrationStep,
};

pub const PROTOCOL_LOCK_NAME: &str = "protocol-store";

/// Owns the locks and the store and hands them to every component that needs
/// them.
pub struct ClientCore {
    settings: Settings,
    store: SqliteStore,
    protocol_lock: Arc<ReentrantLock>,
    group_lock: Arc<GroupProcessingLock>,
    gate: Arc<RegistrationCompletionGate>,
    registration: AccountRegistrationCoordinator,
    groups: Arc<GroupProcessor>,
}

impl ClientCore {
    pub fn new(
        settings: Settings,
        api: Arc<dyn RegistrationApi>,
        jobs: Arc<dyn JobScheduler>,
    ) -> Result<Self> {
        Self::with_key_factory(settings, api, jobs, Arc::new(DalekKeyFactory))
    }

    /// Builds a core that talks to `settings.server_url` over HTTP.
    pub fn connect(settings: Settings, jobs: Arc<dyn JobScheduler>) -> Result<Self> {
        let api = HttpRegistrationApi::new(&settings.server_url, settings.http_timeout())?;
        Self::new(settings, Arc::new(api), jobs)
    }

    /// Opens the account database at `settings.database_url` and wires every
    /// component over it.
    pub fn with_key_factory(
        settings: Settings,
        api: Arc<dyn RegistrationApi>,
        jobs: Arc<dyn JobScheduler>,
        keys: Arc<dyn KeyFactory>,
    ) -> Result<Self> {
        let protocol_lock = Arc::new(ReentrantLock::new(PROTOCOL_LOCK_NAME));
        let store = SqliteStore::open(&settings.database_url, protocol_lock.clone())
            .context("failed to open the account database")?;
        let shared_store: Arc<dyn DataStore> = Arc::new(store.clone());

        let checker = nesting_checker(
            settings.strict_lock_checks,
            Arc::new(store.clone()),
            protocol_lock.clone(),
        );
        let group_lock = Arc::new(GroupProcessingLock::new(
            settings.group_lock_timeout(),
            checker,
        ));

        let gate = Arc::new(RegistrationCompletionGate::new(
            shared_store.clone(),
            jobs.clone(),
        ));
        let registration = AccountRegistrationCoordinator::new(
            shared_store.clone(),
            api,
            jobs,
            keys,
            gate.clone(),
        );
        let groups = Arc::new(GroupProcessor::new(group_lock.clone(), shared_store));

        info!(
            database_url = %settings.database_url,
            strict_lock_checks = settings.strict_lock_checks,
            group_lock_timeout_ms = settings.group_lock_timeout_ms,
            "client: core initialized"
        );
        Ok(Self {
            settings,
            store,
            protocol_lock,
            group_lock,
            gate,
            registration,
            groups,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn protocol_lock(&self) -> &Arc<ReentrantLock> {
        &self.protocol_lock
    }

    pub fn group_lock(&self) -> &Arc<GroupProcessingLock> {
        &self.group_lock
    }

    pub fn completion_gate(&self) -> &Arc<RegistrationCompletionGate> {
        &self.gate
    }

    pub fn registration(&self) -> &AccountRegistrationCoordinator {
        &self.registration
    }

    pub fn groups(&self) -> &Arc<GroupProcessor> {
        &self.groups
    }
}
