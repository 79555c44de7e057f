use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    /// Refresh whether our own number is present in the contact directory.
    DirectoryRefresh,
    RotateSenderCertificate,
    ScheduleSignedPreKeyRotation,
    ScheduleDirectoryRefresh,
    RefreshAttributes,
    StorageSync,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DirectoryRefresh => "directory_refresh",
            Self::RotateSenderCertificate => "rotate_sender_certificate",
            Self::ScheduleSignedPreKeyRotation => "schedule_signed_pre_key_rotation",
            Self::ScheduleDirectoryRefresh => "schedule_directory_refresh",
            Self::RefreshAttributes => "refresh_attributes",
            Self::StorageSync => "storage_sync",
        };
        f.write_str(name)
    }
}

/// A unit of retryable work plus its retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub job: Job,
    pub max_attempts: u32,
    pub retry_interval: Duration,
}

impl From<Job> for JobSpec {
    fn from(job: Job) -> Self {
        Self {
            job,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

pub trait JobScheduler: Send + Sync {
    fn enqueue(&self, job: JobSpec);
    /// Enqueues jobs that run strictly one after another, each only after the
    /// previous one succeeded.
    fn enqueue_chain(&self, chain: Vec<JobSpec>);
    /// Edits every pending job in place.
    fn update(&self, mutator: &mut dyn FnMut(&mut JobSpec));
}

#[must_use = "a chain does nothing until it is enqueued"]
pub struct JobChain<'a> {
    scheduler: &'a dyn JobScheduler,
    jobs: Vec<JobSpec>,
}

impl<'a> JobChain<'a> {
    pub fn start(scheduler: &'a dyn JobScheduler, job: impl Into<JobSpec>) -> Self {
        Self {
            scheduler,
            jobs: vec![job.into()],
        }
    }

    pub fn then(mut self, job: impl Into<JobSpec>) -> Self {
        self.jobs.push(job.into());
        self
    }

    pub fn enqueue(self) {
        self.scheduler.enqueue_chain(self.jobs);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Single(JobSpec),
    Chain(Vec<JobSpec>),
}

impl Enqueued {
    pub fn jobs(&self) -> Vec<Job> {
        match self {
            Self::Single(spec) => vec![spec.job],
            Self::Chain(specs) => specs.iter().map(|spec| spec.job).collect(),
        }
    }
}

/// Records work in submission order without running it.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    pending: Mutex<Vec<Enqueued>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<Enqueued> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn chains(&self) -> Vec<Vec<Job>> {
        self.pending()
            .into_iter()
            .filter_map(|entry| match entry {
                Enqueued::Chain(_) => Some(entry.jobs()),
                Enqueued::Single(_) => None,
            })
            .collect()
    }

    pub fn count_of(&self, job: Job) -> usize {
        self.pending()
            .iter()
            .flat_map(Enqueued::jobs)
            .filter(|queued| *queued == job)
            .count()
    }

    pub fn drain(&self) -> Vec<Enqueued> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl JobScheduler for MemoryJobQueue {
    fn enqueue(&self, job: JobSpec) {
        debug!(job = %job.job, "jobs: enqueued");
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Enqueued::Single(job));
    }

    fn enqueue_chain(&self, chain: Vec<JobSpec>) {
        if chain.is_empty() {
            return;
        }
        debug!(length = chain.len(), first = %chain[0].job, "jobs: enqueued chain");
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Enqueued::Chain(chain));
    }

    fn update(&self, mutator: &mut dyn FnMut(&mut JobSpec)) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in pending.iter_mut() {
            match entry {
                Enqueued::Single(spec) => mutator(spec),
                Enqueued::Chain(specs) => specs.iter_mut().for_each(&mut *mutator),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_preserves_order_and_is_one_entry() {
        let queue = MemoryJobQueue::new();
        JobChain::start(&queue, Job::RefreshAttributes)
            .then(Job::StorageSync)
            .then(Job::DirectoryRefresh)
            .enqueue();

        assert_eq!(
            queue.chains(),
            vec![vec![
                Job::RefreshAttributes,
                Job::StorageSync,
                Job::DirectoryRefresh
            ]]
        );
        assert_eq!(queue.pending().len(), 1);
    }

    #[test]
    fn update_edits_singles_and_chain_members() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(Job::DirectoryRefresh.into());
        JobChain::start(&queue, Job::RefreshAttributes)
            .then(Job::StorageSync)
            .enqueue();

        queue.update(&mut |spec| spec.retry_interval = Duration::ZERO);

        for entry in queue.drain() {
            let specs = match entry {
                Enqueued::Single(spec) => vec![spec],
                Enqueued::Chain(specs) => specs,
            };
            assert!(specs
                .iter()
                .all(|spec| spec.retry_interval == Duration::ZERO));
        }
        assert!(queue.pending().is_empty());
    }

    #[test]
    fn count_of_spans_singles_and_chains() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(Job::DirectoryRefresh.into());
        JobChain::start(&queue, Job::StorageSync)
            .then(Job::DirectoryRefresh)
            .enqueue();
        assert_eq!(queue.count_of(Job::DirectoryRefresh), 2);
        assert_eq!(queue.count_of(Job::RotateSenderCertificate), 0);
    }
}
