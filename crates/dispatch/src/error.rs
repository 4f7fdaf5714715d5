use std::time::Duration;

use hpc_broker::TransportError;
use hpc_core::{CodecError, CorrelationId};

/// Errors surfaced by a job invocation.
///
/// None of them are retried internally; each one ends the invocation and
/// is returned to the caller as raised by the failing stage.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The broker session could not be opened.
    #[error("Connection error: {0}")]
    Connection(#[source] TransportError),

    /// Publishing the request failed after the session was established.
    #[error("Dispatch failed: {0}")]
    Dispatch(#[source] TransportError),

    /// A broker operation failed while setting up or waiting.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The response carrying our correlation id could not be parsed.
    #[error("Protocol error for {correlation_id}: {source}")]
    Protocol {
        correlation_id: CorrelationId,
        #[source]
        source: CodecError,
    },

    /// No matching response arrived within the configured bound.
    #[error("No response for {correlation_id} after {waited:?}")]
    Timeout {
        correlation_id: CorrelationId,
        waited: Duration,
    },

    /// The wait was cancelled by the caller.
    #[error("Wait for {0} was cancelled")]
    Cancelled(CorrelationId),
}
