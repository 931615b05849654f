//! Job state machine and persistence
//!
//! Job states: BUILT → STAGED → SUBMITTED → POLLING → RETRIEVED → COMPLETED,
//! with FAILED reachable from every non-terminal state. Every transition is
//! written to disk before the orchestrator moves on.

mod job_state;
mod store;

pub use job_state::{
    FailureRecord, JobRunState, JobState, JobStateError, RetrievedFile, Transition,
};
pub use store::{FileJobStore, JobStore, StoreError};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global sequence counter for ordering events within a single machine
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Get the next sequence number for ordering
pub fn next_seq() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::SeqCst)
}

pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
