use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    nesting::NestingChecker,
    reentrant::{AcquireError, Interrupt, ReentrantGuard, ReentrantLock},
};

pub const DEFAULT_GROUP_LOCK_TIMEOUT: Duration = Duration::from_millis(5000);
pub const GROUP_LOCK_NAME: &str = "group-processing";
pub const NO_OWNER: &str = "none";

/// The group lock could not be obtained. Callers back off and retry the whole
/// group operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusyError {
    #[error("group processing lock busy: held by '{owner}' after waiting {waited_ms} ms")]
    Timeout { owner: String, waited_ms: u64 },
    #[error("interrupted while waiting for group processing lock held by '{owner}'")]
    Interrupted { owner: String },
}

impl BusyError {
    pub fn owner(&self) -> &str {
        match self {
            Self::Timeout { owner, .. } | Self::Interrupted { owner } => owner,
        }
    }

    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Serializes group membership and state mutations.
///
/// There is a single shared lock; the name exists for diagnostics only.
#[derive(Debug)]
pub struct GroupProcessingLock {
    lock: ReentrantLock,
    timeout: Duration,
    checker: Arc<dyn NestingChecker>,
}

impl GroupProcessingLock {
    pub fn new(timeout: Duration, checker: Arc<dyn NestingChecker>) -> Self {
        Self {
            lock: ReentrantLock::new(GROUP_LOCK_NAME),
            timeout,
            checker,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn acquire_group_processing_lock(&self) -> Result<GroupLockGuard<'_>, BusyError> {
        self.acquire_group_processing_lock_for(self.timeout)
    }

    pub fn acquire_group_processing_lock_for(
        &self,
        timeout: Duration,
    ) -> Result<GroupLockGuard<'_>, BusyError> {
        self.check_nesting();
        self.lock
            .try_acquire_for(timeout)
            .map(|inner| self.granted(inner))
            .map_err(|err| self.busy(err, timeout))
    }

    /// Like [`Self::acquire_group_processing_lock`], abandoning the wait once
    /// `interrupt` fires.
    pub fn acquire_group_processing_lock_interruptible(
        &self,
        interrupt: &Interrupt,
    ) -> Result<GroupLockGuard<'_>, BusyError> {
        self.check_nesting();
        self.lock
            .try_acquire_interruptible(self.timeout, interrupt)
            .map(|inner| self.granted(inner))
            .map_err(|err| self.busy(err, self.timeout))
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.lock.is_held_by_current_thread()
    }

    pub fn owner_name(&self) -> String {
        self.lock
            .owner_name()
            .unwrap_or_else(|| NO_OWNER.to_string())
    }

    fn check_nesting(&self) {
        if !self.lock.is_held_by_current_thread() {
            self.checker.check_before_acquire(GROUP_LOCK_NAME);
        }
    }

    fn granted<'a>(&'a self, inner: ReentrantGuard<'a>) -> GroupLockGuard<'a> {
        debug!(hold_count = self.lock.hold_count(), "group lock: acquired");
        GroupLockGuard { _inner: inner }
    }

    fn busy(&self, reason: AcquireError, waited: Duration) -> BusyError {
        let owner = reason.owner().unwrap_or(NO_OWNER).to_string();
        let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
        warn!(owner = %owner, waited_ms, ?reason, "group lock: busy");
        match reason {
            AcquireError::TimedOut { .. } => BusyError::Timeout { owner, waited_ms },
            AcquireError::Interrupted { .. } => BusyError::Interrupted { owner },
        }
    }
}

#[must_use = "the group lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct GroupLockGuard<'a> {
    _inner: ReentrantGuard<'a>,
}

impl GroupLockGuard<'_> {
    pub fn release(self) {}
}

#[cfg(test)]
#[path = "tests/group_tests.rs"]
mod tests;
