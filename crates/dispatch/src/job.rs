//! The job facade: one request, one response, one broker session.
//!
//! [`JobRunner::run_job`] opens a session, declares the work and reply
//! queues, dispatches the request, waits for the matching response and
//! closes the session. The session is closed on every exit path: success,
//! error, timeout and cancellation. If the future itself is dropped
//! mid-wait, the session's `Drop` hands unacknowledged messages back to
//! the broker.

use std::sync::Arc;
use std::time::Duration;

use hpc_broker::{BrokerConfig, Connector, Session};
use hpc_core::{CorrelationId, NamedBlobs, Settings, REPLY_QUEUE, WORK_QUEUE};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::dispatch_with_id;
use crate::error::JobError;
use crate::matcher::{await_response, PollConfig, WaitOptions};

/// Runs offloaded jobs against one broker.
///
/// Cheap to share behind an `Arc`; every call to [`run_job`](Self::run_job)
/// opens its own session and generates its own correlation id, so
/// concurrent jobs never share a channel.
pub struct JobRunner {
    connector: Arc<dyn Connector>,
    config: BrokerConfig,
    poll: PollConfig,
    max_wait: Option<Duration>,
    /// Master cancellation token; every job waits on a child of it.
    cancel: CancellationToken,
}

impl JobRunner {
    /// Create a runner with the default poll backoff and no deadline.
    pub fn new(connector: Arc<dyn Connector>, config: BrokerConfig) -> Self {
        Self {
            connector,
            config,
            poll: PollConfig::default(),
            max_wait: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Fail jobs with [`JobError::Timeout`] after `max_wait` without a
    /// matching response.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Cancel every job currently waiting on this runner, and all future
    /// ones.
    pub fn shutdown(&self) {
        tracing::info!("Cancelling all pending jobs");
        self.cancel.cancel();
    }

    /// Run one job and return its decoded outputs.
    ///
    /// `expected_outputs` names the output fields the response must carry;
    /// pass an empty slice to accept whatever the response contains.
    pub async fn run_job(
        &self,
        inputs: &NamedBlobs,
        settings: &Settings,
        expected_outputs: &[&str],
    ) -> Result<NamedBlobs, JobError> {
        self.run_job_until(inputs, settings, expected_outputs, self.cancel.child_token())
            .await
    }

    /// Like [`run_job`](Self::run_job), but also stops waiting when
    /// `cancel` fires.
    ///
    /// If either token is already cancelled, nothing is published and the
    /// job fails with [`JobError::Cancelled`] under an id no request was
    /// ever sent with.
    pub async fn run_job_until(
        &self,
        inputs: &NamedBlobs,
        settings: &Settings,
        expected_outputs: &[&str],
        cancel: CancellationToken,
    ) -> Result<NamedBlobs, JobError> {
        let started = Instant::now();
        if self.cancel.is_cancelled() || cancel.is_cancelled() {
            tracing::info!("Job cancelled before dispatch");
            return Err(JobError::Cancelled(CorrelationId::generate()));
        }

        let mut session = self
            .connector
            .open(&self.config)
            .await
            .map_err(JobError::Connection)?;

        let linked = self.linked_token(cancel);
        // Cancelling on scope exit also stops the token's watcher task.
        let _watcher_guard = linked.clone().drop_guard();
        let options = WaitOptions {
            poll: self.poll.clone(),
            max_wait: self.max_wait,
            cancel: linked,
        };

        let result = run_on_session(session.as_mut(), inputs, settings, expected_outputs, &options)
            .await;

        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "Failed to close broker session");
        }

        match &result {
            Ok((correlation_id, outputs)) => tracing::info!(
                correlation_id = %correlation_id,
                outputs = outputs.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job completed",
            ),
            Err(e) => tracing::error!(error = %e, "Job failed"),
        }

        result.map(|(_, outputs)| outputs)
    }

    /// A token cancelled by either the runner's master token or `external`.
    fn linked_token(&self, external: CancellationToken) -> CancellationToken {
        let linked = self.cancel.child_token();
        let watcher = linked.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = external.cancelled() => watcher.cancel(),
                _ = watcher.cancelled() => {}
            }
        });
        linked
    }
}

async fn run_on_session(
    session: &mut dyn Session,
    inputs: &NamedBlobs,
    settings: &Settings,
    expected_outputs: &[&str],
    options: &WaitOptions,
) -> Result<(CorrelationId, NamedBlobs), JobError> {
    session.declare_queue(WORK_QUEUE).await?;
    session.declare_queue(REPLY_QUEUE).await?;

    // Nothing may reach the work queue once the job is cancelled.
    let correlation_id = CorrelationId::generate();
    if options.cancel.is_cancelled() {
        tracing::info!(correlation_id = %correlation_id, "Job cancelled before dispatch");
        return Err(JobError::Cancelled(correlation_id));
    }

    let correlation_id = dispatch_with_id(session, inputs, settings, correlation_id).await?;
    let outputs = await_response(session, &correlation_id, expected_outputs, options).await?;

    Ok((correlation_id, outputs))
}
