use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use tracing::trace;

/// Upper bound on a single condvar wait when an [`Interrupt`] is being watched.
const INTERRUPT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    owner_name: Option<String>,
    hold_count: u32,
}

impl OwnerState {
    fn can_enter(&self, me: ThreadId) -> bool {
        self.owner.map_or(true, |owner| owner == me)
    }

    fn enter(&mut self, me: ThreadId) {
        if self.owner.is_none() {
            self.owner = Some(me);
            self.owner_name = Some(current_thread_name());
        }
        self.hold_count += 1;
    }
}

fn current_thread_name() -> String {
    let current = thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

/// Why a bounded acquisition gave up. `owner` names the thread that held the
/// lock at that moment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    TimedOut { owner: Option<String> },
    Interrupted { owner: Option<String> },
}

impl AcquireError {
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::TimedOut { owner } | Self::Interrupted { owner } => owner.as_deref(),
        }
    }
}

/// Cancels a pending bounded acquisition from another thread.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Reentrant mutual-exclusion lock owned by a thread.
///
/// The owning thread may acquire it any number of times; it becomes free once
/// every guard has been dropped. `acquire` never times out, so holders must not
/// block on anything that can cycle back into this lock.
#[derive(Debug)]
pub struct ReentrantLock {
    name: &'static str,
    state: Mutex<OwnerState>,
    released: Condvar,
}

impl ReentrantLock {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(OwnerState::default()),
            released: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, OwnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn acquire(&self) -> ReentrantGuard<'_> {
        let me = thread::current().id();
        let mut state = self.lock_state();
        while !state.can_enter(me) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.enter(me);
        trace!(lock = self.name, hold_count = state.hold_count, "lock: acquired");
        ReentrantGuard::new(self)
    }

    pub fn try_acquire_for(&self, timeout: Duration) -> Result<ReentrantGuard<'_>, AcquireError> {
        self.acquire_within(timeout, None)
    }

    pub fn try_acquire_interruptible(
        &self,
        timeout: Duration,
        interrupt: &Interrupt,
    ) -> Result<ReentrantGuard<'_>, AcquireError> {
        self.acquire_within(timeout, Some(interrupt))
    }

    fn acquire_within(
        &self,
        timeout: Duration,
        interrupt: Option<&Interrupt>,
    ) -> Result<ReentrantGuard<'_>, AcquireError> {
        let me = thread::current().id();
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock_state();
        while !state.can_enter(me) {
            if interrupt.is_some_and(Interrupt::is_interrupted) {
                return Err(AcquireError::Interrupted {
                    owner: state.owner_name.clone(),
                });
            }
            let remaining = match deadline {
                Some(deadline) => deadline
                    .checked_duration_since(Instant::now())
                    .filter(|remaining| !remaining.is_zero()),
                None => Some(INTERRUPT_POLL),
            };
            let Some(remaining) = remaining else {
                return Err(AcquireError::TimedOut {
                    owner: state.owner_name.clone(),
                });
            };
            let slice = if interrupt.is_some() {
                remaining.min(INTERRUPT_POLL)
            } else {
                remaining
            };
            let (next, _) = self
                .released
                .wait_timeout(state, slice)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        state.enter(me);
        trace!(lock = self.name, hold_count = state.hold_count, "lock: acquired");
        Ok(ReentrantGuard::new(self))
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.lock_state().owner == Some(thread::current().id())
    }

    pub fn hold_count(&self) -> u32 {
        self.lock_state().hold_count
    }

    pub fn owner_name(&self) -> Option<String> {
        self.lock_state().owner_name.clone()
    }

    fn release(&self) {
        let mut state = self.lock_state();
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        state.hold_count = state.hold_count.saturating_sub(1);
        if state.hold_count == 0 {
            state.owner = None;
            state.owner_name = None;
            drop(state);
            self.released.notify_all();
            trace!(lock = self.name, "lock: released");
        }
    }
}

/// One level of ownership. Dropping it releases that level. Not `Send`, since
/// ownership belongs to the thread that acquired it.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ReentrantGuard<'a> {
    lock: &'a ReentrantLock,
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReentrantGuard<'a> {
    fn new(lock: &'a ReentrantLock) -> Self {
        Self {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ReentrantGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
#[path = "tests/reentrant_tests.rs"]
mod tests;
