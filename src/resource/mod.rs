//! Keyed cache of typed resources with a state machine, priority-driven
//! fetching and budgeted eviction.
//!
//! # Lifecycle
//!
//! ```text
//!            ┌──────────────► ErrorRetry ──(back-off elapsed)──┐
//!            │                                                 ▼
//! Initializing ──► Downloading ──► Downloaded ──► Finalizing ──► Ready
//!            │                                                 ▲
//!            └──────────────► ErrorFatal          (immutable) ─┘
//! ```
//!
//! The render thread polls validity and never blocks; fetch workers own
//! the download transitions; the decode step runs inside
//! [`ResourceStore::tick`] on the render thread. Eviction scans in
//! ascending last-access order when the configured budget is exceeded and
//! never removes worker-owned or infinitely prioritised entries.

mod payload;
mod state;
mod store;

pub use payload::{DecodeContext, DecodeError, PayloadKind, ResourceKind, ResourcePayload};
pub use state::{ResourceState, RetryState, Validity, BACKOFF_AUTH, BACKOFF_INITIAL, BACKOFF_MAX};
pub use store::{Handle, Resource, ResourceError, ResourceStore, StoreBudget};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use super::Resource;

    /// Forces an entry to `Ready` without decoding, for unit tests that
    /// only exercise validity-driven logic.
    pub(crate) fn set_ready(entry: &Arc<Resource>) {
        entry.force_ready_for_tests();
    }
}
