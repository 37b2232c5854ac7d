//! Bounded retry with linear backoff.
//!
//! [`Retry::run`] calls an async operation until it yields a value, up to a fixed
//! number of attempts. Between attempts it waits `min(attempt * wait, 120s)`.
//! The wait races a [`CancellationToken`]: cancellation ends the loop at once
//! and the driver returns `None`. Failures never escape as errors; each one is
//! reported to a sink and the caller only sees `Some(value)` or `None`.
//!
//! The driver does not know what it retries. Logins, folder creation and file
//! transfers all go through the same loop; deciding which outcomes count as
//! "done" is the caller's job (see [`Attempt`]).

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Upper bound on a single backoff wait.
pub const MAX_WAIT: Duration = Duration::from_secs(120);

pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Receives one line per failed attempt and per scheduled retry.
pub type RetrySink = Arc<dyn Fn(&str) + Send + Sync>;

/// What an operation's return value means to the driver.
///
/// `Ok(value)` stops the loop. `Err(Some(message))` is a failed attempt with a
/// message for the sink; `Err(None)` is a failed attempt with nothing to say.
pub trait Attempt {
    type Output;

    fn into_attempt(self) -> Result<Self::Output, Option<String>>;
}

impl<T> Attempt for Option<T> {
    type Output = T;

    fn into_attempt(self) -> Result<T, Option<String>> {
        self.ok_or(None)
    }
}

impl<T, E: Display> Attempt for Result<T, E> {
    type Output = T;

    fn into_attempt(self) -> Result<T, Option<String>> {
        self.map_err(|e| Some(e.to_string()))
    }
}

#[derive(Clone)]
pub struct Retry {
    max_attempts: u32,
    wait: Duration,
    cancel: CancellationToken,
    sink: RetrySink,
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("max_attempts", &self.max_attempts)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl Retry {
    /// Non-positive counts are clamped: `0` means one attempt, `-3` means three.
    pub fn new(max_attempts: i32) -> Self {
        Self {
            max_attempts: max_attempts.unsigned_abs().max(1),
            wait: DEFAULT_WAIT,
            cancel: CancellationToken::new(),
            sink: Arc::new(|line: &str| warn!("[RETRY] {line}")),
        }
    }

    /// Base wait between attempts. Zero disables waiting entirely.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sink(mut self, sink: RetrySink) -> Self {
        self.sink = sink;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.wait.saturating_mul(attempt).min(MAX_WAIT)
    }

    pub async fn run<F, Fut, A>(&self, mut operation: F) -> Option<A::Output>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = A>,
        A: Attempt,
    {
        for attempt in 1..=self.max_attempts {
            match operation().await.into_attempt() {
                Ok(value) => return Some(value),
                Err(Some(message)) if !message.is_empty() => (self.sink)(&message),
                Err(_) => {}
            }
            if attempt == self.max_attempts {
                break;
            }
            if self.wait.is_zero() {
                if self.cancel.is_cancelled() {
                    return None;
                }
                continue;
            }
            let wait = self.backoff(attempt);
            (self.sink)(&format!(
                "Retrying in {} seconds... {}/{}",
                wait.as_secs(),
                attempt,
                self.max_attempts
            ));
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        None
    }
}
