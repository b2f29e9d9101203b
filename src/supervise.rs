//! Supervision for long-lived loops.
//!
//! Workers, the discovery watcher and the sink all share the same policy:
//! run the loop body; a clean pass resets the backoff, a failure is
//! reported and retried after a bounded exponential delay, and nothing
//! short of cancellation (or the body deciding it is finished) stops the
//! loop.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What a supervised body wants next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Flow {
    /// Run another pass immediately, with backoff reset.
    Continue,
    /// The loop is done; leave without retrying.
    Finished,
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap)
    }
}

/// Drive `body` until it reports [`Flow::Finished`] or `token` is
/// cancelled. Errors go to `on_error` (metrics live there, not here) and
/// consecutive failures back off exponentially.
pub async fn run_supervised<F, Fut, E>(
    label: &str,
    token: &CancellationToken,
    policy: BackoffPolicy,
    mut body: F,
    mut on_error: impl FnMut(&E),
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Flow, E>>,
{
    let mut failures: u32 = 0;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            outcome = body() => outcome,
        };

        match outcome {
            Ok(Flow::Finished) => return,
            Ok(Flow::Continue) => {
                failures = 0;
            }
            Err(error) => {
                on_error(&error);
                let delay = policy.delay(failures);
                failures = failures.saturating_add(1);
                debug!(message = "Supervised loop backing off.", label, delay_ms = delay.as_millis() as u64);
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
