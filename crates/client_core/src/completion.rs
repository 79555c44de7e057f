use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use shared::domain::PhoneNumberDiscoverability;
use storage::DataStore;
use tracing::{debug, info};

use crate::jobs::{Job, JobChain, JobScheduler};

/// Snapshot of everything the completion decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionInputs {
    pub is_account_registered: bool,
    pub profile_name_is_set: bool,
    pub has_pin: bool,
    pub has_opted_out_of_pin: bool,
    pub already_marked_complete: bool,
}

impl CompletionInputs {
    pub fn read(store: &dyn DataStore) -> Result<Self> {
        let svr = store.svr();
        Ok(Self {
            is_account_registered: store.account().is_registered()?,
            profile_name_is_set: store.profile().is_profile_name_set()?,
            has_pin: svr.has_pin()?,
            has_opted_out_of_pin: svr.has_opted_out()?,
            already_marked_complete: store.registration().is_registration_complete()?,
        })
    }
}

pub fn should_mark_complete(inputs: &CompletionInputs) -> bool {
    !inputs.already_marked_complete
        && inputs.is_account_registered
        && inputs.profile_name_is_set
        && (inputs.has_pin || inputs.has_opted_out_of_pin)
}

/// Flips the one-way registration-complete flag once its preconditions hold.
///
/// Call [`Self::evaluate`] after anything that can change the inputs. It is
/// never driven by a timer.
pub struct RegistrationCompletionGate {
    store: Arc<dyn DataStore>,
    jobs: Arc<dyn JobScheduler>,
    evaluation: Mutex<()>,
}

impl RegistrationCompletionGate {
    pub fn new(store: Arc<dyn DataStore>, jobs: Arc<dyn JobScheduler>) -> Self {
        Self {
            store,
            jobs,
            evaluation: Mutex::new(()),
        }
    }

    /// Returns `true` only for the evaluation that performed the transition.
    ///
    /// On that transition an undecided phone-number discoverability becomes
    /// discoverable and the attribute refresh, storage sync and directory
    /// refresh jobs are enqueued as one ordered chain. Evaluations are
    /// serialized, so concurrent callers cannot enqueue the chain twice.
    pub fn evaluate(&self) -> Result<bool> {
        let _serialized = self
            .evaluation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let inputs = CompletionInputs::read(self.store.as_ref())?;
        if !should_mark_complete(&inputs) {
            debug!(?inputs, "completion: not marking complete");
            return Ok(false);
        }

        self.store.registration().mark_registration_complete()?;

        let privacy = self.store.phone_number_privacy();
        if privacy.discoverability()? == PhoneNumberDiscoverability::Undecided {
            privacy.set_discoverability(PhoneNumberDiscoverability::Discoverable)?;
            info!("completion: phone number discoverability defaulted to discoverable");
        }

        JobChain::start(self.jobs.as_ref(), Job::RefreshAttributes)
            .then(Job::StorageSync)
            .then(Job::DirectoryRefresh)
            .enqueue();

        info!("completion: registration marked complete");
        Ok(true)
    }
}

#[cfg(test)]
#[path = "tests/completion_tests.rs"]
mod tests;
