//! Bounded polling until a remote system reaches a terminal state.
//!
//! [`poll_until`] drives a caller-supplied probe. Each call returns a
//! [`ProbeResult`]: ready, not yet ready, a transient error worth retrying,
//! or a fatal error. The loop sleeps a fixed interval between probes, never
//! runs two probes at once, and stops at the first of: ready, fatal error,
//! cancellation, or the timeout budget running out.
//!
//! [`StatusWaiter`] builds the common probe on top of it: describe the
//! resource, compare its status against pending and target sets.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use hemmer_converge::cancel::CancelToken;
//! use hemmer_converge::poll::{poll_until, PollConfig, PollOutcome, ProbeResult};
//!
//! # tokio_test::block_on(async {
//! let config = PollConfig::new(Duration::from_secs(10)).with_poll_interval(Duration::from_millis(10));
//! let outcome = poll_until(
//!     || async { ProbeResult::<u32, String>::Ready(42) },
//!     &config,
//!     &CancelToken::never(),
//! )
//! .await;
//! assert_eq!(outcome.success(), Some(42));
//! # });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::classify::ErrorClass;

/// Sleeps between probes are never shorter than this.
pub const MIN_SLEEP: Duration = Duration::from_millis(10);

/// The result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult<T, E> {
    /// The target state was reached.
    Ready(T),
    /// Still converging. Carries the observed status when one is known.
    NotYetReady(Option<String>),
    /// A failure that may resolve on its own; retried.
    TransientError(E),
    /// A failure that will not resolve without changing the request.
    FatalError(E),
}

impl<T, E> ProbeResult<T, E> {
    /// Not ready, with no status to report.
    pub fn not_yet_ready() -> Self {
        Self::NotYetReady(None)
    }

    /// Not ready, currently in the given status.
    pub fn pending(status: impl Into<String>) -> Self {
        Self::NotYetReady(Some(status.into()))
    }
}

/// Why a poll loop stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Abort<E> {
    /// The probe returned a fatal error.
    Fatal(E),
    /// The caller cancelled the loop while it was waiting.
    Cancelled,
}

/// The last thing a timed-out loop saw go wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LastError<E> {
    /// The most recent transient error.
    Transient(E),
    /// No transient error was seen; the target simply was not reached.
    StillNotReady,
}

impl<E> LastError<E> {
    /// The transient error, if there was one.
    pub fn transient(&self) -> Option<&E> {
        match self {
            Self::Transient(e) => Some(e),
            Self::StillNotReady => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for LastError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(e) => write!(f, "{}", e),
            Self::StillNotReady => f.write_str("still not ready"),
        }
    }
}

/// Diagnostics for a loop that ran out of time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTimeout<E> {
    /// Time since the loop started.
    pub elapsed: Duration,
    /// Number of probes issued.
    pub attempts: u32,
    /// The last transient error, or the still-not-ready marker.
    pub last_error: LastError<E>,
    /// The last status any probe reported.
    pub last_status: Option<String>,
}

/// The terminal result of a poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T, E> {
    /// The probe reported ready.
    Success(T),
    /// The budget ran out first.
    TimedOut(PollTimeout<E>),
    /// A fatal error or cancellation stopped the loop.
    Aborted(Abort<E>),
}

impl<T, E> PollOutcome<T, E> {
    /// Whether the loop succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The success payload, if any.
    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    /// Transform the success payload.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> PollOutcome<U, E> {
        match self {
            Self::Success(value) => PollOutcome::Success(f(value)),
            Self::TimedOut(timeout) => PollOutcome::TimedOut(timeout),
            Self::Aborted(abort) => PollOutcome::Aborted(abort),
        }
    }
}

/// Timing of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Total budget, measured from the start of the loop.
    pub timeout: Duration,
    /// Requested sleep between probes.
    pub poll_interval: Duration,
    /// Lower bound on the sleep between probes.
    pub min_poll_interval: Duration,
    /// Wait before the first probe.
    pub delay: Duration,
}

impl PollConfig {
    /// Default sleep between probes.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

    /// A loop with the given budget, polling every ten seconds.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            min_poll_interval: Duration::ZERO,
            delay: Duration::ZERO,
        }
    }

    /// Set the sleep between probes.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lower bound on the sleep between probes.
    pub fn with_min_poll_interval(mut self, interval: Duration) -> Self {
        self.min_poll_interval = interval;
        self
    }

    /// Set the wait before the first probe.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the total budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The effective sleep between probes.
    pub fn interval(&self) -> Duration {
        self.poll_interval.max(self.min_poll_interval).max(MIN_SLEEP)
    }
}

/// Drive `probe` until it reports ready, fails fatally, the budget runs
/// out, or `cancel` fires.
///
/// The probe is never called concurrently with itself. Cancellation is
/// observed before each probe and during every sleep, so it takes effect
/// promptly without abandoning a probe mid-flight.
pub async fn poll_until<T, E, F, Fut>(
    mut probe: F,
    config: &PollConfig,
    cancel: &CancelToken,
) -> PollOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProbeResult<T, E>>,
{
    let start = Instant::now();
    let interval = config.interval();
    let mut attempts: u32 = 0;
    let mut last_error = LastError::StillNotReady;
    let mut last_status = None;

    if !config.delay.is_zero() && !nap(config.delay.min(config.timeout), cancel).await {
        return PollOutcome::Aborted(Abort::Cancelled);
    }

    loop {
        if cancel.is_cancelled() {
            debug!(attempts, "Poll cancelled");
            return PollOutcome::Aborted(Abort::Cancelled);
        }

        attempts += 1;
        match probe().await {
            ProbeResult::Ready(value) => {
                debug!(attempts, elapsed = ?start.elapsed(), "Probe ready");
                return PollOutcome::Success(value);
            },
            ProbeResult::FatalError(e) => {
                debug!(attempts, "Probe failed fatally");
                return PollOutcome::Aborted(Abort::Fatal(e));
            },
            ProbeResult::TransientError(e) => {
                debug!(attempts, "Probe hit a transient error, retrying");
                last_error = LastError::Transient(e);
            },
            ProbeResult::NotYetReady(status) => {
                debug!(attempts, status = ?status, "Probe not ready yet");
                if status.is_some() {
                    last_status = status;
                }
            },
        }

        let elapsed = start.elapsed();
        if elapsed >= config.timeout {
            break;
        }
        if !nap(interval.min(config.timeout - elapsed), cancel).await {
            debug!(attempts, "Poll cancelled while waiting");
            return PollOutcome::Aborted(Abort::Cancelled);
        }
        if start.elapsed() >= config.timeout {
            break;
        }
    }

    PollOutcome::TimedOut(PollTimeout {
        elapsed: start.elapsed(),
        attempts,
        last_error,
        last_status,
    })
}

/// Sleep, returning false if cancelled first.
async fn nap(duration: Duration, cancel: &CancelToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Anything a status probe can report a status string for.
pub trait StatusReport {
    /// The current status as the remote API names it.
    fn status(&self) -> &str;
}

impl StatusReport for String {
    fn status(&self) -> &str {
        self
    }
}

impl StatusReport for &str {
    fn status(&self) -> &str {
        self
    }
}

/// Why a status wait failed fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError<E> {
    /// The describe call failed.
    Remote(E),
    /// The status was in neither the pending nor the target set.
    UnexpectedState {
        /// The observed status.
        status: String,
    },
    /// The resource stayed missing for more consecutive checks than allowed.
    NotFound {
        /// How many consecutive not-found observations were made.
        checks: u32,
    },
}

impl<E: fmt::Display> fmt::Display for WaitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(e) => write!(f, "{}", e),
            Self::UnexpectedState { status } => write!(f, "unexpected state '{}'", status),
            Self::NotFound { checks } => {
                write!(f, "resource not found after {} consecutive checks", checks)
            },
        }
    }
}

/// Waits for a described status to move from a pending set into a target set.
///
/// An empty `target` means the wait is for the resource to disappear: a
/// not-found observation is then success rather than a problem. A waiter
/// with a target can be told to accept absence as well, see
/// [`StatusWaiter::accepting_absence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWaiter {
    /// Statuses that mean "still converging".
    pub pending: Vec<String>,
    /// Statuses that mean "done".
    pub target: Vec<String>,
    /// Consecutive not-found observations tolerated while waiting for presence.
    pub not_found_checks: u32,
    /// Consecutive target observations required before declaring success.
    pub continuous_target_occurrence: u32,
    /// Whether a not-found observation ends the wait successfully even though
    /// `target` is not empty.
    pub absent_is_target: bool,
}

impl StatusWaiter {
    /// Default tolerance for not-found observations right after a mutation.
    pub const DEFAULT_NOT_FOUND_CHECKS: u32 = 20;

    /// Wait for the status to reach one of `target`, passing through `pending`.
    pub fn new<S: Into<String>>(
        pending: impl IntoIterator<Item = S>,
        target: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            not_found_checks: Self::DEFAULT_NOT_FOUND_CHECKS,
            continuous_target_occurrence: 1,
            absent_is_target: false,
        }
    }

    /// Wait for the resource to disappear, passing through `pending`.
    pub fn gone<S: Into<String>>(pending: impl IntoIterator<Item = S>) -> Self {
        Self::new(pending, Vec::<S>::new())
    }

    /// Set the not-found tolerance.
    pub fn with_not_found_checks(mut self, checks: u32) -> Self {
        self.not_found_checks = checks;
        self
    }

    /// Require the target to be observed this many times in a row.
    pub fn with_continuous_target_occurrence(mut self, times: u32) -> Self {
        self.continuous_target_occurrence = times.max(1);
        self
    }

    /// Treat a resource that no longer exists as having reached the target.
    ///
    /// Deletes use this: an API may report `DELETED` for a while or drop the
    /// resource straight away, and both mean the delete is done.
    pub fn accepting_absence(mut self) -> Self {
        self.absent_is_target = true;
        self
    }

    /// Whether a not-found observation ends the wait successfully.
    pub fn waits_for_absence(&self) -> bool {
        self.target.is_empty() || self.absent_is_target
    }

    /// Poll `describe` until the status is in the target set.
    ///
    /// `describe` returns `Ok(None)` when the resource does not exist.
    /// Its errors are sorted by `classify`. On success the payload is the
    /// last description, or `None` when waiting for absence.
    pub async fn wait<T, E, D, Fut, C>(
        &self,
        mut describe: D,
        classify: C,
        config: &PollConfig,
        cancel: &CancelToken,
    ) -> PollOutcome<Option<T>, WaitError<E>>
    where
        T: StatusReport,
        D: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        let not_found = AtomicU32::new(0);
        let on_target = AtomicU32::new(0);
        let classify = &classify;

        poll_until(
            || {
                let described = describe();
                let (not_found, on_target) = (&not_found, &on_target);
                async move { self.judge(described.await, classify, not_found, on_target) }
            },
            config,
            cancel,
        )
        .await
    }

    fn judge<T, E, C>(
        &self,
        described: Result<Option<T>, E>,
        classify: &C,
        not_found: &AtomicU32,
        on_target: &AtomicU32,
    ) -> ProbeResult<Option<T>, WaitError<E>>
    where
        T: StatusReport,
        C: Fn(&E) -> ErrorClass,
    {
        let observed = match described {
            Err(e) => {
                return match classify(&e) {
                    ErrorClass::Transient => ProbeResult::TransientError(WaitError::Remote(e)),
                    ErrorClass::Fatal => ProbeResult::FatalError(WaitError::Remote(e)),
                };
            },
            Ok(None) => {
                on_target.store(0, Ordering::Relaxed);
                if self.waits_for_absence() {
                    return ProbeResult::Ready(None);
                }
                let checks = not_found.fetch_add(1, Ordering::Relaxed) + 1;
                if checks > self.not_found_checks {
                    return ProbeResult::FatalError(WaitError::NotFound { checks });
                }
                return ProbeResult::NotYetReady(None);
            },
            Ok(Some(observed)) => observed,
        };

        not_found.store(0, Ordering::Relaxed);
        let status = observed.status().to_string();

        if self.target.contains(&status) {
            let seen = on_target.fetch_add(1, Ordering::Relaxed) + 1;
            if seen >= self.continuous_target_occurrence {
                return ProbeResult::Ready(Some(observed));
            }
            return ProbeResult::NotYetReady(Some(status));
        }

        on_target.store(0, Ordering::Relaxed);
        if self.pending.contains(&status) {
            ProbeResult::NotYetReady(Some(status))
        } else {
            ProbeResult::FatalError(WaitError::UnexpectedState { status })
        }
    }
}
