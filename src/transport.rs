//! Broker capability traits
//!
//! The engine talks to the broker through these narrow seams so the
//! reliability logic is independent of the concrete wire client. The
//! [`crate::amqp`] module implements them over lapin; [`crate::memory`]
//! implements them in-process for the test suite and local development.
//!
//! Each publisher/consumer worker exclusively owns one [`BrokerChannel`];
//! channels are never shared between workers.

use crate::config::{BrokerAddress, ClusterDescriptor, ExchangeSpec, QueueSpec};
use crate::error::Result;
use crate::message::{InboundDelivery, OutboundMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// One queue-to-exchange binding
#[derive(Debug, Clone)]
pub struct Binding {
    /// Queue name
    pub queue: String,
    /// Routing key
    pub routing_key: String,
}

/// Exchange/queue/binding declarations performed once per channel
#[derive(Debug, Clone)]
pub struct Topology {
    /// Exchange to declare
    pub exchange: ExchangeSpec,
    /// Queue to declare, for consumers
    pub queue: Option<QueueSpec>,
    /// Bindings to establish
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// Topology for a publisher: just the exchange
    pub fn publish_only(exchange: ExchangeSpec) -> Self {
        Self {
            exchange,
            queue: None,
            bindings: Vec::new(),
        }
    }

    /// Topology for a consumer: exchange, queue and its bindings
    pub fn consume(exchange: ExchangeSpec, queue: QueueSpec, routing_keys: &[String]) -> Self {
        let bindings = routing_keys
            .iter()
            .map(|key| Binding {
                queue: queue.name.clone(),
                routing_key: key.clone(),
            })
            .collect();
        Self {
            exchange,
            queue: Some(queue),
            bindings,
        }
    }
}

/// Consumer registration parameters
#[derive(Debug, Clone)]
pub struct ConsumeSpec {
    /// Queue to consume from
    pub queue: String,
    /// Consumer tag reported to the broker
    pub consumer_tag: String,
    /// Acknowledge deliveries explicitly; when false the broker considers
    /// a delivery settled as soon as it is sent
    pub manual_ack: bool,
    /// Request exclusive consumption
    pub exclusive: bool,
}

/// Broker acknowledgement of published messages
///
/// `multiple` acknowledges every outstanding sequence up to and including
/// `sequence`, matching AMQP basic.ack/basic.nack batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmEvent {
    /// Message(s) durably accepted
    Ack {
        /// Publish sequence number the confirmation refers to
        sequence: u64,
        /// Confirm all sequences up to and including `sequence`
        multiple: bool,
    },
    /// Message(s) refused by the broker
    Nack {
        /// Publish sequence number the confirmation refers to
        sequence: u64,
        /// Refuse all sequences up to and including `sequence`
        multiple: bool,
    },
}

/// A logical broker channel owned by exactly one worker
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare exchanges, queues and bindings
    async fn declare_topology(&self, topology: &Topology) -> Result<()>;

    /// Put the channel in publisher-confirm mode
    async fn enable_confirms(&self) -> Result<()>;

    /// Publish a message, returning its per-channel monotonically
    /// increasing sequence number
    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<u64>;

    /// Next confirm event, waiting up to `wait`; `None` when none arrived
    async fn next_confirm(&self, wait: Duration) -> Result<Option<ConfirmEvent>>;

    /// Bound the number of unacknowledged deliveries
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Register this channel as a consumer
    async fn start_consumer(&self, spec: &ConsumeSpec) -> Result<()>;

    /// Next delivery, waiting up to `wait`; `None` when none arrived
    async fn next_delivery(&self, wait: Duration) -> Result<Option<InboundDelivery>>;

    /// Acknowledge a delivery
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negatively acknowledge a delivery, optionally requeueing it
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Delete a queue (used by delete-on-close consumers)
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Whether the channel is still usable
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

/// A physical broker connection multiplexing many channels
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a new logical channel on this connection
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;

    /// Whether the connection is still usable
    fn is_open(&self) -> bool;

    /// Close the connection and every channel on it
    async fn close(&self) -> Result<()>;
}

/// Factory opening physical connections to one broker node
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect to a single address of the cluster
    async fn connect(
        &self,
        descriptor: &ClusterDescriptor,
        address: &BrokerAddress,
    ) -> Result<Arc<dyn BrokerConnection>>;
}
