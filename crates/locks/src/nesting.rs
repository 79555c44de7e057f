//! Lock-ordering checks run before the group-processing lock is taken.
//!
//! The only safe order is group lock first. A thread that already holds an
//! open data-store transaction or the protocol-store lock and then asks for
//! the group lock can deadlock against a thread doing the opposite, so the
//! strict checker treats that as a programming error and panics.

use std::{cell::Cell, fmt, sync::Arc};

use tracing::error;

use crate::reentrant::ReentrantLock;

thread_local! {
    static LATENCY_CRITICAL: Cell<bool> = const { Cell::new(false) };
}

/// Marks the calling thread as one that must never block on coordination locks.
pub fn mark_current_thread_latency_critical() {
    LATENCY_CRITICAL.with(|flag| flag.set(true));
}

pub fn is_latency_critical_thread() -> bool {
    LATENCY_CRITICAL.with(Cell::get)
}

/// Reports whether the calling thread is inside an open data-store transaction.
pub trait TransactionProbe: Send + Sync {
    fn in_transaction(&self) -> bool;
}

pub trait NestingChecker: Send + Sync + fmt::Debug {
    /// Called before a thread that does not already own `lock_name` blocks on it.
    fn check_before_acquire(&self, lock_name: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNestingChecker;

impl NestingChecker for NoopNestingChecker {
    fn check_before_acquire(&self, _lock_name: &str) {}
}

pub struct StrictNestingChecker {
    transactions: Arc<dyn TransactionProbe>,
    protocol_lock: Arc<ReentrantLock>,
}

impl StrictNestingChecker {
    pub fn new(transactions: Arc<dyn TransactionProbe>, protocol_lock: Arc<ReentrantLock>) -> Self {
        Self {
            transactions,
            protocol_lock,
        }
    }
}

impl fmt::Debug for StrictNestingChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrictNestingChecker")
            .field("protocol_lock", &self.protocol_lock.name())
            .finish_non_exhaustive()
    }
}

impl NestingChecker for StrictNestingChecker {
    fn check_before_acquire(&self, lock_name: &str) {
        if is_latency_critical_thread() {
            violation(lock_name, "the calling thread is latency-critical");
        }
        if self.transactions.in_transaction() {
            violation(
                lock_name,
                "a data-store transaction is open on the calling thread",
            );
        }
        if self.protocol_lock.is_held_by_current_thread() {
            let held = self.protocol_lock.name();
            violation(
                lock_name,
                &format!("the calling thread holds the '{held}' lock"),
            );
        }
    }
}

fn violation(lock_name: &str, reason: &str) -> ! {
    error!(lock = lock_name, reason, "lock: ordering violation");
    panic!("lock ordering violation: '{lock_name}' requested while {reason}");
}

/// Strict checks in diagnostic mode, no-op otherwise.
pub fn nesting_checker(
    strict: bool,
    transactions: Arc<dyn TransactionProbe>,
    protocol_lock: Arc<ReentrantLock>,
) -> Arc<dyn NestingChecker> {
    if strict {
        Arc::new(StrictNestingChecker::new(transactions, protocol_lock))
    } else {
        Arc::new(NoopNestingChecker)
    }
}
