//! In-process broker with AMQP-like delivery semantics.
//!
//! Queues live in a shared [`InMemoryBroker`]; every [`MemorySession`]
//! opened from it sees the same queues. Fetched messages stay invisible
//! until they are acknowledged, requeued, or the owning session closes
//! (or is dropped), at which point they return to the head of their
//! queue in their original order.
//!
//! The broker only accepts connections for the host and credentials it
//! was created with, so authentication failures can be exercised without
//! a real server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use hpc_core::{MessageProperties, OutboundMessage};
use tokio::sync::Notify;

use crate::config::{BrokerConfig, Credentials};
use crate::session::{Connector, Delivery, DeliveryTag, Session, TransportError};

type SessionId = u64;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    properties: MessageProperties,
}

struct QueueState {
    ready: VecDeque<StoredMessage>,
    /// Woken on every publish to this queue.
    published: Arc<Notify>,
    /// Bumped on every publish. Requeues leave it alone.
    publish_seq: u64,
}

struct Unacked {
    session: SessionId,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<DeliveryTag, Unacked>,
    next_tag: DeliveryTag,
    next_session: SessionId,
    sessions_opened: usize,
    sessions_closed: usize,
    acknowledged: usize,
}

impl BrokerState {
    /// Return every message held by `session` to the head of its queue,
    /// preserving fetch order.
    fn release_session(&mut self, session: SessionId) -> usize {
        let mut tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.session == session)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        for tag in tags.iter().rev() {
            if let Some(held) = self.unacked.remove(tag) {
                if let Some(queue) = self.queues.get_mut(&held.queue) {
                    queue.ready.push_front(held.message);
                }
            }
        }
        tags.len()
    }
}

struct Inner {
    host: String,
    credentials: Credentials,
    state: Mutex<BrokerState>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared handle to an in-process broker. Cheap to clone.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    /// Create a broker reachable as `host` that only accepts `credentials`.
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                credentials,
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    /// A [`BrokerConfig`] that this broker accepts.
    pub fn config(&self) -> BrokerConfig {
        BrokerConfig::new(self.inner.host.clone(), self.inner.credentials.clone())
    }

    /// Names of all declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of messages ready for delivery on `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Number of messages from `queue` fetched but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.inner
            .state()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Total number of acknowledgements the broker has accepted.
    pub fn acknowledged_count(&self) -> usize {
        self.inner.state().acknowledged
    }

    /// Correlation ids of the ready messages on `queue`, in queue order.
    pub fn ready_correlation_ids(&self, queue: &str) -> Vec<Option<String>> {
        self.inner
            .state()
            .queues
            .get(queue)
            .map(|q| {
                q.ready
                    .iter()
                    .map(|m| m.properties.correlation_id.as_ref().map(|id| id.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.inner.state().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.inner.state().sessions_closed
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn open(&self, config: &BrokerConfig) -> Result<Box<dyn Session>, TransportError> {
        if config.host != self.inner.host {
            return Err(TransportError::Connection(format!(
                "host {} is unreachable",
                config.host
            )));
        }
        if config.credentials != self.inner.credentials {
            return Err(TransportError::Connection(format!(
                "authentication refused for user {}",
                config.credentials.username
            )));
        }

        let id = {
            let mut state = self.inner.state();
            state.next_session += 1;
            state.sessions_opened += 1;
            state.next_session
        };

        tracing::debug!(session = id, host = %config.host, "In-memory session opened");

        Ok(Box::new(MemorySession {
            inner: Arc::clone(&self.inner),
            id,
            closed: false,
            seen_publishes: HashMap::new(),
        }))
    }
}

/// A session on an [`InMemoryBroker`].
pub struct MemorySession {
    inner: Arc<Inner>,
    id: SessionId,
    closed: bool,
    /// Publish sequence of each queue as of this session's last fetch.
    seen_publishes: HashMap<String, u64>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Remove `tag` from the unacked set if this session owns it.
    fn take_unacked(
        &self,
        state: &mut BrokerState,
        tag: DeliveryTag,
    ) -> Result<Unacked, TransportError> {
        match state.unacked.get(&tag) {
            Some(held) if held.session == self.id => {}
            _ => return Err(TransportError::UnknownDelivery(tag)),
        }
        state
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDelivery(tag))
    }

    /// Whether `queue` has been published to since this session last
    /// looked. Marks the current sequence as seen.
    fn take_unseen_publish(&mut self, queue: &str) -> bool {
        let current = self
            .inner
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.publish_seq);
        let seen = self.seen_publishes.entry(queue.to_string()).or_insert(0);
        let unseen = current > *seen;
        *seen = current;
        unseen
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = self.inner.state();
        let returned = state.release_session(self.id);
        state.sessions_closed += 1;

        tracing::debug!(session = self.id, returned, "In-memory session closed");
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_queue(&mut self, name: &str) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.inner
            .state()
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                ready: VecDeque::new(),
                published: Arc::new(Notify::new()),
                publish_seq: 0,
            });
        Ok(())
    }

    async fn publish(
        &mut self,
        queue: &str,
        message: OutboundMessage,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let notify = {
            let mut state = self.inner.state();
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
            target.ready.push_back(StoredMessage {
                body: message.body,
                properties: message.properties,
            });
            target.publish_seq += 1;
            Arc::clone(&target.published)
        };
        notify.notify_waiters();
        Ok(())
    }

    async fn try_receive(&mut self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        self.seen_publishes
            .insert(queue.to_string(), target.publish_seq);
        let message = target.ready.pop_front();

        let Some(message) = message else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let delivery = Delivery {
            tag,
            body: message.body.clone(),
            properties: message.properties.clone(),
        };
        state.unacked.insert(
            tag,
            Unacked {
                session: self.id,
                queue: queue.to_string(),
                message,
            },
        );
        Ok(Some(delivery))
    }

    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        self.take_unacked(&mut state, tag)?;
        state.acknowledged += 1;
        Ok(())
    }

    async fn requeue(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        let held = self.take_unacked(&mut state, tag)?;
        if let Some(queue) = state.queues.get_mut(&held.queue) {
            queue.ready.push_front(held.message);
        }
        Ok(())
    }

    async fn wait_for_delivery(&mut self, queue: &str, limit: Duration) {
        let notify = self
            .inner
            .state()
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.published));

        let Some(notify) = notify else {
            tokio::time::sleep(limit).await;
            return;
        };

        // A `Notified` sees every `notify_waiters` from the moment it is
        // created, so checking the sequence after creating it leaves no gap
        // for a publish that landed after the caller's last fetch.
        let notified = notify.notified();
        if self.take_unseen_publish(queue) {
            return;
        }
        let _ = tokio::time::timeout(limit, notified).await;
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}
