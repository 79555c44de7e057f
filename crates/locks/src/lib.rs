//! Coordination locks for protocol storage and group processing.

pub mod group;
pub mod nesting;
pub mod reentrant;

pub use group::{
    BusyError, GroupLockGuard, GroupProcessingLock, DEFAULT_GROUP_LOCK_TIMEOUT, GROUP_LOCK_NAME,
    NO_OWNER,
};
pub use nesting::{
    is_latency_critical_thread, mark_current_thread_latency_critical, nesting_checker,
    NestingChecker, NoopNestingChecker, StrictNestingChecker, TransactionProbe,
};
pub use reentrant::{AcquireError, Interrupt, ReentrantGuard, ReentrantLock};
