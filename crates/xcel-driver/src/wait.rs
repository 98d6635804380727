//! Completion wait
//!
//! Busy-polls the control word until `ap_done`. By default the wait is
//! unbounded and never yields, which gives the lowest completion latency on a
//! dedicated core. A [`WaitPolicy`] can add a deadline, a cancellation token
//! and periodic yielding.

use crate::error::{Result, XcelError};
use crate::platform::RegisterIo;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xcel_chip::ctrl;

/// Shared flag that aborts a completion wait.
///
/// Cloneable and `Send`, so it can be set from a signal handler thread or a
/// supervisor while the session thread spins.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// `true` once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How long and how politely to wait for completion.
#[derive(Debug, Clone, Default)]
pub struct WaitPolicy {
    deadline: Option<Duration>,
    cancel: Option<CancelToken>,
    yield_every: Option<u32>,
}

impl WaitPolicy {
    /// Unbounded busy-wait.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Fail with [`XcelError::Timeout`] once `deadline` has elapsed.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Fail with [`XcelError::Cancelled`] when `token` is set.
    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Yield the thread every `polls` polls.
    #[must_use]
    pub const fn with_yield_every(mut self, polls: u32) -> Self {
        self.yield_every = Some(polls);
        self
    }

    /// Configured deadline.
    pub const fn deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

/// Result of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Control register reads, including the one that saw `ap_done`.
    pub polls: u64,
    /// Time spent in the poll loop.
    pub elapsed: Duration,
}

/// Poll the control word at `control` until `ap_done` is observed.
///
/// `ap_done` is clear-on-read, so the read that observes it is the only one
/// that will; the loop returns immediately on that read.
///
/// # Errors
///
/// Returns [`XcelError::Timeout`] or [`XcelError::Cancelled`] per `policy`, and
/// propagates register access failures.
pub fn wait_for_done(
    io: &mut dyn RegisterIo,
    control: usize,
    policy: &WaitPolicy,
) -> Result<Completion> {
    let start = Instant::now();
    let mut polls: u64 = 0;
    loop {
        let word = io.read32(control)?;
        polls += 1;
        if ctrl::is_done(word) {
            let elapsed = start.elapsed();
            tracing::debug!(
                "{}: done after {polls} polls in {elapsed:?} ({})",
                io.name(),
                ctrl::describe(word)
            );
            return Ok(Completion { polls, elapsed });
        }

        if let Some(deadline) = policy.deadline {
            if start.elapsed() >= deadline {
                tracing::warn!(
                    "{}: no ap_done after {deadline:?}, last control {}",
                    io.name(),
                    ctrl::describe(word)
                );
                return Err(XcelError::Timeout {
                    duration_ms: u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    polls,
                });
            }
        }
        if policy.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(XcelError::Cancelled { polls });
        }
        if let Some(every) = policy.yield_every {
            if every > 0 && polls % u64::from(every) == 0 {
                std::thread::yield_now();
            }
        }
    }
}
