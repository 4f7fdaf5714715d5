//! Protocol building blocks shared by the orchestrator and the worker side.
//!
//! - [`types`] -- correlation ids, setting scalars, queue names.
//! - [`codec`] -- text-safe encoding of binary payloads.
//! - [`envelope`] -- request/response message bodies and their metadata.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod types;

pub use envelope::{MessageProperties, OutboundMessage};
pub use error::CodecError;
pub use types::{CorrelationId, NamedBlobs, SettingValue, Settings, REPLY_QUEUE, WORK_QUEUE};
