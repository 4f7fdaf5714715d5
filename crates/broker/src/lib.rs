//! Broker transport sessions.
//!
//! A [`Session`] is one connection plus one channel to the message broker,
//! owned by exactly one job invocation. Sessions are opened through a
//! [`Connector`]:
//!
//! - [`AmqpConnector`] talks to a real AMQP 0-9-1 broker.
//! - [`InMemoryBroker`] is an in-process broker with the same delivery
//!   semantics (manual acknowledgement, requeue, redelivery on close),
//!   used by tests and dry runs.

pub mod amqp;
pub mod config;
pub mod memory;
pub mod session;

pub use amqp::{AmqpConnector, AmqpSession};
pub use config::{BrokerConfig, ConfigError, Credentials};
pub use memory::InMemoryBroker;
pub use session::{Connector, Delivery, DeliveryTag, Session, TransportError};
