//! Request/reply correlation over the broker.
//!
//! - [`dispatcher`] publishes a job request tagged with a fresh
//!   correlation id.
//! - [`matcher`] waits on the shared reply queue for the response carrying
//!   that id, leaving every other caller's response in place.
//! - [`job`] composes both into [`JobRunner::run_job`], the single entry
//!   point used by tasks.
//! - [`responder`] is the worker-side mirror: take a request, reply with
//!   the same correlation id.

pub mod dispatcher;
pub mod error;
pub mod job;
pub mod matcher;
pub mod responder;

pub use dispatcher::{dispatch, dispatch_with_id};
pub use error::JobError;
pub use job::JobRunner;
pub use matcher::{await_response, PollConfig, WaitOptions};
pub use responder::{serve_next, Served};
