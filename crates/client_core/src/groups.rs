use std::{panic, sync::Arc, thread, time::Duration};

use locks::{BusyError, GroupProcessingLock};
use shared::domain::{Aci, GroupId};
use storage::{DataStore, GroupRecord};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(Vec<Aci>),
    Remove(Vec<Aci>),
}

#[derive(Debug, Error)]
pub enum GroupUpdateError {
    #[error(transparent)]
    Busy(#[from] BusyError),
    #[error("group store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl GroupUpdateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

/// Applies membership changes while holding the group-processing lock.
///
/// Must not be called from a thread that holds an open store transaction or
/// the protocol-store lock.
pub struct GroupProcessor {
    lock: Arc<GroupProcessingLock>,
    store: Arc<dyn DataStore>,
}

impl GroupProcessor {
    pub fn new(lock: Arc<GroupProcessingLock>, store: Arc<dyn DataStore>) -> Self {
        Self { lock, store }
    }

    /// Bumps the revision only when membership actually changed.
    pub fn apply(
        &self,
        group: GroupId,
        change: &MembershipChange,
    ) -> Result<GroupRecord, GroupUpdateError> {
        let _guard = self.lock.acquire_group_processing_lock()?;

        let groups = self.store.groups();
        let mut record = groups
            .group(group)?
            .unwrap_or_else(|| GroupRecord::new(group));
        let changed = match change {
            MembershipChange::Add(members) => members
                .iter()
                .fold(false, |changed, aci| record.members.insert(*aci) || changed),
            MembershipChange::Remove(members) => members
                .iter()
                .fold(false, |changed, aci| record.members.remove(aci) || changed),
        };
        if changed {
            record.revision += 1;
            groups.upsert_group(&record)?;
        }

        debug!(
            group = group.0,
            revision = record.revision,
            changed,
            "groups: membership change applied"
        );
        Ok(record)
    }

    /// Runs [`Self::apply`] on tokio's blocking pool.
    pub async fn apply_in_background(
        self: Arc<Self>,
        group: GroupId,
        change: MembershipChange,
    ) -> Result<GroupRecord, GroupUpdateError> {
        match tokio::task::spawn_blocking(move || self.apply(group, &change)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
            Err(err) => Err(GroupUpdateError::Store(anyhow::anyhow!(
                "group update task did not finish: {err}"
            ))),
        }
    }

    /// Retries [`Self::apply`] on [`BusyError`], sleeping `backoff` between
    /// attempts. Store failures are returned immediately.
    pub fn apply_with_retry(
        &self,
        group: GroupId,
        change: &MembershipChange,
        attempts: u32,
        backoff: Duration,
    ) -> Result<GroupRecord, GroupUpdateError> {
        let mut attempt = 1;
        loop {
            match self.apply(group, change) {
                Err(GroupUpdateError::Busy(err)) if attempt < attempts => {
                    warn!(
                        group = group.0,
                        attempt,
                        owner = err.owner(),
                        "groups: lock busy, backing off"
                    );
                    thread::sleep(backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/groups_tests.rs"]
mod tests;
