//! AMQP 0-9-1 sessions backed by [`lapin`].
//!
//! Every session opens its own connection and a single channel. Queues are
//! declared durable, messages are published persistent through the default
//! exchange (routing key = queue name), and fetches use `basic.get` with
//! manual acknowledgement.

use async_trait::async_trait;
use hpc_core::{CorrelationId, MessageProperties, OutboundMessage};
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ConnectionStatus};

use crate::config::BrokerConfig;
use crate::session::{Connector, Delivery, DeliveryTag, Session, TransportError};

/// AMQP `delivery_mode` value for persistent messages.
const PERSISTENT: u8 = 2;

/// Reply code sent with a normal channel/connection close.
const REPLY_SUCCESS: u16 = 200;

/// Opens [`AmqpSession`]s against a real broker.
#[derive(Debug, Default, Clone)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

/// Build the connection URI from explicit config values.
///
/// Assembled field by field so user names, passwords and virtual hosts
/// never need percent-encoding.
fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.credentials.username.clone(),
                password: config.credentials.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.virtual_host.clone(),
        ..Default::default()
    }
}

impl AmqpConnector {
    /// Open a session and return it as its concrete type.
    pub async fn connect(&self, config: &BrokerConfig) -> Result<AmqpSession, TransportError> {
        let connection = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default())
            .await
            .map_err(|e| {
                TransportError::Connection(format!(
                    "Failed to connect to broker at {}:{}: {e}",
                    config.host, config.port
                ))
            })?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close(REPLY_SUCCESS, "OK").await {
                    tracing::warn!(error = %close_err, "Failed to close connection after channel error");
                }
                return Err(TransportError::Connection(format!("Failed to open channel: {e}")));
            }
        };

        tracing::info!(
            host = %config.host,
            port = config.port,
            vhost = %config.virtual_host,
            channel_id = channel.id(),
            "Connected to broker",
        );

        Ok(AmqpSession {
            connection: Some(connection),
            channel,
            closed: false,
        })
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn open(&self, config: &BrokerConfig) -> Result<Box<dyn Session>, TransportError> {
        Ok(Box::new(self.connect(config).await?))
    }
}

/// A connection plus one channel on an AMQP broker.
pub struct AmqpSession {
    /// Taken by `Drop` so the close can outlive the session.
    connection: Option<Connection>,
    channel: Channel,
    closed: bool,
}

impl AmqpSession {
    /// Live status of the underlying connection. The handle stays valid
    /// after the session is closed or dropped.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.connection.as_ref().map(|c| c.status().clone())
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

fn channel_error(e: lapin::Error) -> TransportError {
    TransportError::Channel(e.to_string())
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default().with_delivery_mode(PERSISTENT);
    if let Some(id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(ShortString::from(id.to_string()));
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(ShortString::from(reply_to.clone()));
    }
    amqp
}

fn from_amqp_properties(properties: &BasicProperties) -> MessageProperties {
    MessageProperties {
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|id| CorrelationId::from(id.as_str())),
        reply_to: properties
            .reply_to()
            .as_ref()
            .map(|queue| queue.as_str().to_string()),
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_queue(&mut self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        let options = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(channel_error)?;
        tracing::debug!(queue = name, "Queue declared");
        Ok(())
    }

    async fn publish(
        &mut self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        // Publisher confirms are not enabled on this channel.
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                to_amqp_properties(&message.properties),
            )
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn try_receive(&mut self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        self.ensure_open()?;
        let fetched = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(channel_error)?;

        Ok(fetched.map(|message| Delivery {
            tag: message.delivery.delivery_tag,
            properties: from_amqp_properties(&message.delivery.properties),
            body: message.delivery.data,
        }))
    }

    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn requeue(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        let options = BasicNackOptions {
            multiple: false,
            requeue: true,
        };
        self.channel
            .basic_nack(tag, options)
            .await
            .map_err(channel_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let connection = self.connection.take();
        close_channel_and_connection(&self.channel, connection.as_ref())
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to close connection: {e}")))
    }
}

impl Drop for AmqpSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped without `close` (e.g. the owning task was aborted). Closing
        // the channel makes the broker requeue everything still unacked.
        self.closed = true;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            let connection = self.connection.take();
            handle.spawn(async move {
                if let Err(e) = close_channel_and_connection(&channel, connection.as_ref()).await {
                    tracing::warn!(error = %e, "Failed to close abandoned session");
                }
            });
        }
    }
}

/// Close the channel, then the connection. Both are attempted; the first
/// error is returned.
async fn close_channel_and_connection(
    channel: &Channel,
    connection: Option<&Connection>,
) -> Result<(), lapin::Error> {
    let channel_result = channel.close(REPLY_SUCCESS, "OK").await;
    let connection_result = match connection {
        Some(connection) => connection.close(REPLY_SUCCESS, "OK").await,
        None => Ok(()),
    };
    tracing::debug!("Broker connection closed");
    channel_result.and(connection_result)
}
