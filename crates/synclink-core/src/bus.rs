//! Bus transport seam.
//!
//! [`BusTransport`] is the minimal contract the messaging bridge needs from a
//! topic-based publish/subscribe system with an optional durable layer.
//! [`crate::memory_bus`] provides an in-process implementation.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::topic::DurabilityPolicy;

/// Transport-assigned subscription identifier.
pub type SubscriptionId = u64;

/// Position in the bus's global durable sequence.
pub type Sequence = u64;

/// Transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Bus link is down")]
    NotConnected,

    #[error("Stream not provisioned: {0}")]
    StreamNotFound(String),

    #[error("Subject {subject} is not captured by stream {stream}")]
    SubjectNotInStream { stream: String, subject: String },

    #[error("Bus rejected the request: {0}")]
    Rejected(String),
}

/// Where a new subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverFrom {
    /// Only messages published from now on.
    New,
    /// Replay persisted messages with a greater sequence, then continue live.
    After(Sequence),
}

/// Acknowledgement of a durable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub sequence: Sequence,
    /// The message id was already seen inside the stream's dedup window.
    pub duplicate: bool,
}

/// A message as delivered by the transport.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Publisher-supplied dedup id, present on durable messages.
    pub msg_id: Option<String>,
    /// Durable sequence; `None` for memory-tier messages.
    pub sequence: Option<Sequence>,
}

/// A live transport subscription.
#[derive(Debug)]
pub struct TransportSubscription {
    pub id: SubscriptionId,
    /// Highest durable sequence at the moment the subscription started.
    pub head: Sequence,
    pub receiver: mpsc::UnboundedReceiver<RawMessage>,
}

/// A topic-based publish/subscribe transport.
///
/// Implementations must be internally thread-safe; the bridge shares one
/// instance across every publisher and subscriber.
#[async_trait]
pub trait BusTransport: Send + Sync + 'static {
    /// Establish (or re-establish) the link.
    async fn connect(&self) -> Result<(), BusError>;

    /// Resolve once the link is down. Resolves immediately if it already is.
    async fn disconnected(&self);

    /// Create the stream described by `policy` if it does not exist.
    async fn ensure_stream(&self, policy: &DurabilityPolicy) -> Result<(), BusError>;

    /// Fire-and-forget publish, no persistence.
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;

    /// Persist into `stream` and return once the write is acknowledged.
    async fn publish_durable(
        &self,
        stream: &str,
        subject: &str,
        msg_id: &str,
        payload: Bytes,
    ) -> Result<PublishAck, BusError>;

    /// Subscribe to a pattern. With a queue group, each message goes to exactly
    /// one member of the group.
    async fn subscribe(
        &self,
        pattern: &str,
        queue_group: Option<&str>,
        deliver: DeliverFrom,
    ) -> Result<TransportSubscription, BusError>;

    /// Cancel a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;
}
