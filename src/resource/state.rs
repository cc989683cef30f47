//! Resource state machine and retry bookkeeping.

use std::time::{Duration, Instant};

use rand::Rng;

/// Lifecycle state of a cached resource.
///
/// Transitions are strictly monotone along
/// `Initializing -> Downloading -> Downloaded -> Finalizing -> Ready`,
/// with the two error states branching off and `ErrorRetry` looping back
/// to `Initializing` once its back-off elapses. A `Ready` payload is
/// immutable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourceState {
    /// Stub created, fetch not yet started.
    Initializing = 0,
    /// A fetch worker owns the entry.
    Downloading = 1,
    /// Raw bytes stored, awaiting decode.
    Downloaded = 2,
    /// Decode in progress.
    Finalizing = 3,
    /// Decoded payload available.
    Ready = 4,
    /// Transient failure; re-attempted after the back-off deadline.
    ErrorRetry = 5,
    /// Permanent failure; surfaced to callers as `Invalid`.
    ErrorFatal = 6,
}

impl ResourceState {
    pub fn from_u8(v: u8) -> ResourceState {
        match v {
            0 => Self::Initializing,
            1 => Self::Downloading,
            2 => Self::Downloaded,
            3 => Self::Finalizing,
            4 => Self::Ready,
            5 => Self::ErrorRetry,
            _ => Self::ErrorFatal,
        }
    }

    /// True while a data thread owns the entry; eviction must skip it.
    pub fn owned_by_worker(self) -> bool {
        matches!(self, Self::Downloading | Self::Finalizing)
    }
}

/// Tri-valued readiness outcome of a resource-dependent query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    /// Not decided yet; ask again next tick.
    Indeterminate,
    /// The resource is `Ready`.
    Valid,
    /// The resource failed fatally.
    Invalid,
}

/// Initial back-off after the first transient failure.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Back-off ceiling.
pub const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Short back-off used while an auth refresh is pending.
pub const BACKOFF_AUTH: Duration = Duration::from_millis(250);

/// Retry bookkeeping of one resource.
#[derive(Clone, Debug, Default)]
pub struct RetryState {
    /// Transient failures so far.
    pub attempts: u32,
    /// Earliest instant the next attempt may start.
    pub next_attempt: Option<Instant>,
}

impl RetryState {
    /// Schedules the next attempt with exponential back-off and jitter.
    ///
    /// Delay doubles per attempt from [`BACKOFF_INITIAL`] up to
    /// [`BACKOFF_MAX`], multiplied by a random factor in `0.5..1.5`.
    pub fn schedule_backoff(&mut self, now: Instant) {
        let exp = BACKOFF_INITIAL.as_secs_f64() * 2f64.powi(self.attempts.min(16) as i32);
        let base = exp.min(BACKOFF_MAX.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        self.attempts += 1;
        self.next_attempt = Some(now + Duration::from_secs_f64(base * jitter));
    }

    /// Schedules a short retry behind a pending auth refresh.
    pub fn schedule_auth_retry(&mut self, now: Instant) {
        self.attempts += 1;
        self.next_attempt = Some(now + BACKOFF_AUTH);
    }

    /// True when the back-off deadline has passed.
    pub fn elapsed(&self, now: Instant) -> bool {
        self.next_attempt.map(|t| t <= now).unwrap_or(true)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for s in [
            ResourceState::Initializing,
            ResourceState::Downloading,
            ResourceState::Downloaded,
            ResourceState::Finalizing,
            ResourceState::Ready,
            ResourceState::ErrorRetry,
            ResourceState::ErrorFatal,
        ] {
            assert_eq!(ResourceState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn test_worker_ownership() {
        assert!(ResourceState::Downloading.owned_by_worker());
        assert!(ResourceState::Finalizing.owned_by_worker());
        assert!(!ResourceState::Ready.owned_by_worker());
        assert!(!ResourceState::Initializing.owned_by_worker());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let now = Instant::now();
        let mut retry = RetryState::default();
        retry.schedule_backoff(now);
        let first = retry.next_attempt.unwrap() - now;
        // jittered around 1s
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(1500));

        retry.attempts = 20;
        retry.schedule_backoff(now);
        let capped = retry.next_attempt.unwrap() - now;
        assert!(capped <= Duration::from_secs(90));
    }

    #[test]
    fn test_backoff_elapsed() {
        let now = Instant::now();
        let mut retry = RetryState::default();
        assert!(retry.elapsed(now));
        retry.schedule_auth_retry(now);
        assert!(!retry.elapsed(now));
        assert!(retry.elapsed(now + Duration::from_secs(1)));
    }
}
