//! Waiting for the response that belongs to one request.
//!
//! Every outstanding request shares a single reply queue, so the queue
//! holds other callers' responses alongside ours, in no particular order.
//! [`await_response`] runs in poll cycles:
//!
//! 1. Fetch messages one at a time until the queue is empty or our
//!    correlation id shows up. Foreign messages stay unacknowledged (and
//!    therefore invisible to others) only for the rest of the cycle, so
//!    the scan can see past them.
//! 2. Requeue every foreign message held by the cycle.
//! 3. On a match, acknowledge it exactly once and decode it.
//! 4. Otherwise suspend until a new reply is published or the current
//!    poll interval elapses, whichever comes first, and repeat.
//!
//! The interval grows after every cycle and drops back to its initial value
//! only when a cycle turns up a foreign correlation id not seen before in
//! this wait. Orphaned responses therefore do not pin the poll rate.
//!
//! The wait is bounded by an optional deadline and interrupted by a
//! [`CancellationToken`]. Neither path acknowledges anything.

use std::collections::HashSet;
use std::time::Duration;

use hpc_broker::{Delivery, DeliveryTag, Session};
use hpc_core::envelope::parse_envelope;
use hpc_core::{CorrelationId, NamedBlobs, REPLY_QUEUE};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

/// Backoff parameters for the poll loop.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Wait after the first empty cycle, and after any cycle that saw a
    /// response for a request not seen earlier in the wait.
    pub initial_interval: Duration,
    /// Upper bound on the wait between cycles.
    pub max_interval: Duration,
    /// Factor by which the wait grows after each quiet cycle.
    pub multiplier: f64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next poll interval from the current one.
///
/// The result is clamped to [`PollConfig::max_interval`].
pub fn next_interval(current: Duration, config: &PollConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_interval)
}

/// Bounds and cancellation for [`await_response`].
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    pub poll: PollConfig,
    /// Give up with [`JobError::Timeout`] after this long. `None` waits
    /// until a response or cancellation.
    pub max_wait: Option<Duration>,
    pub cancel: CancellationToken,
}

/// Result of one pass over the reply queue.
enum Scan {
    Matched(Delivery),
    /// `fresh` counts foreign responses whose correlation id this wait had
    /// not seen in any earlier cycle.
    NoMatch { foreign: usize, fresh: usize },
}

/// Wait for the response tagged with `correlation_id` and decode the
/// `expected` outputs from it.
///
/// Returns only after a message carrying exactly `correlation_id` has been
/// observed (or on error). That message is acknowledged once; a body that
/// fails to parse is then a [`JobError::Protocol`], since no other caller
/// can own it.
pub async fn await_response(
    session: &mut dyn Session,
    correlation_id: &CorrelationId,
    expected: &[&str],
    options: &WaitOptions,
) -> Result<NamedBlobs, JobError> {
    let started = Instant::now();
    let deadline = options.max_wait.map(|limit| started + limit);
    let mut interval = options.poll.initial_interval;
    let mut cycle = 0u32;
    let mut seen_foreign: HashSet<CorrelationId> = HashSet::new();

    loop {
        if options.cancel.is_cancelled() {
            tracing::info!(correlation_id = %correlation_id, cycle, "Response wait cancelled");
            return Err(JobError::Cancelled(correlation_id.clone()));
        }

        cycle += 1;
        match scan_reply_queue(session, correlation_id, &mut seen_foreign).await? {
            Scan::Matched(delivery) => {
                tracing::info!(
                    correlation_id = %correlation_id,
                    cycle,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Matching response received",
                );
                return consume_match(session, correlation_id, delivery, expected).await;
            }
            Scan::NoMatch { foreign, fresh } => {
                // Responses left behind by timed-out or cancelled callers
                // stay on the queue; only new traffic restarts the backoff.
                if fresh > 0 {
                    interval = options.poll.initial_interval;
                }
                tracing::debug!(
                    correlation_id = %correlation_id,
                    cycle,
                    foreign,
                    fresh,
                    interval_ms = interval.as_millis() as u64,
                    "No matching response yet",
                );
            }
        }

        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(correlation_id = %correlation_id, cycle, "Response wait timed out");
                    return Err(JobError::Timeout {
                        correlation_id: correlation_id.clone(),
                        waited: started.elapsed(),
                    });
                }
                interval.min(deadline - now)
            }
            None => interval,
        };

        tokio::select! {
            _ = options.cancel.cancelled() => {
                tracing::info!(correlation_id = %correlation_id, cycle, "Response wait cancelled");
                return Err(JobError::Cancelled(correlation_id.clone()));
            }
            _ = session.wait_for_delivery(REPLY_QUEUE, wait) => {}
        }

        interval = next_interval(interval, &options.poll);
    }
}

// ---- private helpers ----

/// Fetch from the reply queue until it is empty or our response appears,
/// then requeue everything else that was fetched.
async fn scan_reply_queue(
    session: &mut dyn Session,
    correlation_id: &CorrelationId,
    seen_foreign: &mut HashSet<CorrelationId>,
) -> Result<Scan, JobError> {
    let mut held: Vec<DeliveryTag> = Vec::new();
    let mut fresh = 0;

    let outcome = loop {
        match session.try_receive(REPLY_QUEUE).await {
            Ok(Some(delivery)) => {
                if delivery.properties.correlation_id.as_ref() == Some(correlation_id) {
                    break Ok(Scan::Matched(delivery));
                }
                tracing::trace!(
                    correlation_id = %correlation_id,
                    other = ?delivery.properties.correlation_id,
                    "Holding response owned by another request",
                );
                if let Some(other) = delivery.properties.correlation_id {
                    if seen_foreign.insert(other) {
                        fresh += 1;
                    }
                }
                held.push(delivery.tag);
            }
            Ok(None) => {
                break Ok(Scan::NoMatch {
                    foreign: held.len(),
                    fresh,
                })
            }
            Err(e) => break Err(JobError::Transport(e)),
        }
    };

    // Release in reverse so requeue-to-head restores the original order.
    for tag in held.iter().rev() {
        if let Err(e) = session.requeue(*tag).await {
            // Still unacked, so the broker returns it when the session closes.
            tracing::warn!(delivery_tag = tag, error = %e, "Failed to requeue foreign response");
        }
    }

    outcome
}

async fn consume_match(
    session: &mut dyn Session,
    correlation_id: &CorrelationId,
    delivery: Delivery,
    expected: &[&str],
) -> Result<NamedBlobs, JobError> {
    session.acknowledge(delivery.tag).await?;

    parse_envelope(&delivery.body, expected).map_err(|source| {
        tracing::error!(
            correlation_id = %correlation_id,
            error = %source,
            "Matching response is malformed",
        );
        JobError::Protocol {
            correlation_id: correlation_id.clone(),
            source,
        }
    })
}
