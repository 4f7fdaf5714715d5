//! Request publication.

use hpc_broker::Session;
use hpc_core::envelope::assemble_envelope;
use hpc_core::{CorrelationId, NamedBlobs, Settings, WORK_QUEUE};

use crate::error::JobError;

/// Publish a job request under a freshly generated correlation id.
///
/// Returns the id the caller must wait on. The request's `reply_to` is the
/// shared reply queue. A failed publish is returned immediately as
/// [`JobError::Dispatch`]; nothing is retried.
pub async fn dispatch(
    session: &mut dyn Session,
    inputs: &NamedBlobs,
    settings: &Settings,
) -> Result<CorrelationId, JobError> {
    dispatch_with_id(session, inputs, settings, CorrelationId::generate()).await
}

/// Publish a job request under a caller-chosen correlation id.
///
/// The caller is responsible for the id being unique among outstanding
/// requests.
pub async fn dispatch_with_id(
    session: &mut dyn Session,
    inputs: &NamedBlobs,
    settings: &Settings,
    correlation_id: CorrelationId,
) -> Result<CorrelationId, JobError> {
    let message = assemble_envelope(inputs, settings, &correlation_id);
    let body_len = message.body.len();

    session
        .publish(WORK_QUEUE, message)
        .await
        .map_err(JobError::Dispatch)?;

    tracing::info!(
        correlation_id = %correlation_id,
        queue = WORK_QUEUE,
        inputs = inputs.len(),
        body_len,
        "Job request published",
    );

    Ok(correlation_id)
}
