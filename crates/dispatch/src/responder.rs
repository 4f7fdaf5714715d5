//! Worker-side half of the protocol.
//!
//! A worker takes one request at a time from the work queue, computes its
//! outputs, and publishes them to the request's `reply_to` queue tagged
//! with the request's correlation id. The request is acknowledged only
//! after the reply has been published, so a worker that dies mid-job
//! leaves the request for another worker.

use std::future::Future;

use hpc_broker::{Session, TransportError};
use hpc_core::envelope::{assemble_response, parse_request, JobRequest};
use hpc_core::{CorrelationId, MessageProperties, NamedBlobs, OutboundMessage, WORK_QUEUE};

/// What [`serve_next`] did with the work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Served {
    /// A request was handled and its reply published.
    Replied(CorrelationId),
    /// A request could not be answered (missing reply metadata or a
    /// malformed body) and was discarded.
    Dropped,
    /// The work queue was empty.
    Idle,
}

/// Take at most one request from the work queue and answer it.
///
/// Poison requests are acknowledged and dropped so they cannot block the
/// queue. A failed reply publish leaves the request unacknowledged; it is
/// redelivered once the session closes.
pub async fn serve_next<F, Fut>(
    session: &mut dyn Session,
    handler: F,
) -> Result<Served, TransportError>
where
    F: FnOnce(JobRequest) -> Fut,
    Fut: Future<Output = NamedBlobs>,
{
    let Some(delivery) = session.try_receive(WORK_QUEUE).await? else {
        return Ok(Served::Idle);
    };

    let (Some(correlation_id), Some(reply_to)) = (
        delivery.properties.correlation_id.clone(),
        delivery.properties.reply_to.clone(),
    ) else {
        tracing::warn!(
            delivery_tag = delivery.tag,
            "Dropping request without correlation id or reply queue",
        );
        session.acknowledge(delivery.tag).await?;
        return Ok(Served::Dropped);
    };

    let request = match parse_request(&delivery.body) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(correlation_id = %correlation_id, error = %e, "Dropping malformed request");
            session.acknowledge(delivery.tag).await?;
            return Ok(Served::Dropped);
        }
    };

    tracing::info!(
        correlation_id = %correlation_id,
        inputs = request.inputs.len(),
        settings = request.settings.len(),
        "Handling job request",
    );

    let outputs = handler(request).await;
    let reply = OutboundMessage {
        body: assemble_response(&outputs),
        properties: MessageProperties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: None,
        },
    };

    session.publish(&reply_to, reply).await?;
    session.acknowledge(delivery.tag).await?;

    tracing::info!(
        correlation_id = %correlation_id,
        reply_to = %reply_to,
        outputs = outputs.len(),
        "Reply published",
    );

    Ok(Served::Replied(correlation_id))
}
