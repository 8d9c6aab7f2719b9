//! # tradewire
//!
//! Client-side reliability layer for submitting trading tickets to a remote
//! backend over AMQP 0-9-1 and correlating asynchronously delivered
//! responses back to the originating call.
//!
//! ## Features
//!
//! - **Connection pooling**: lease-counted channels multiplexed over few
//!   physical connections, with transparent failover across cluster nodes
//! - **Confirmed publishing**: broker publisher confirms tracked per
//!   channel sequence, bounded retry on nacks, exponential backoff on
//!   channel loss
//! - **Bounded-retry consuming**: handler verdicts translated into
//!   ack/retry actions with a bounded local retry buffer
//! - **Request/response correlation**: listener-driven and
//!   blocking-with-timeout sends matched to responses by business id,
//!   with an independent timeout watchdog
//! - **Backpressure**: a full outbound buffer rejects synchronously
//!   instead of blocking or dropping silently
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tradewire::{
//!     AmqpConnector, BrokerAddress, ClusterDescriptor, ConsumerSettings,
//!     OutboundMessage, PublisherSettings, SenderSettings, TicketSender, WorkerPool,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let descriptor = ClusterDescriptor::new(
//!         "trader",
//!         "secret",
//!         "/",
//!         vec![
//!             BrokerAddress::new("broker1.example.com", 5671),
//!             BrokerAddress::new("broker2.example.com", 5671),
//!         ],
//!         true,
//!     )?;
//!
//!     let sender = TicketSender::new(
//!         SenderSettings::default(),
//!         descriptor,
//!         PublisherSettings::default(),
//!         ConsumerSettings::default(),
//!         Arc::new(AmqpConnector),
//!         WorkerPool::new(4),
//!     )?;
//!     sender.open().await?;
//!
//!     let ticket = OutboundMessage::new("ticket.submit", b"{...}".to_vec())
//!         .with_business_id("ticket-42");
//!     let reply = sender.call(ticket, Duration::from_secs(15)).await?;
//!     println!("backend replied with {} bytes", reply.payload.len());
//!
//!     sender.close().await;
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod config;
pub mod consumer;
pub mod correlator;
pub mod error;
pub mod memory;
pub mod message;
pub mod pool;
pub mod publisher;
pub mod rate_limiter;
pub mod timeout_monitor;
pub mod transport;
pub mod worker_pool;

// Re-export main types for convenience
pub use amqp::AmqpConnector;
pub use config::{
    BrokerAddress, ClusterDescriptor, ConsumerSettings, ExchangeSpec, ExchangeType,
    PublisherSettings, QueueSpec, SenderSettings,
};
pub use consumer::{ConsumerStats, DeliveryHandler, HandlerVerdict, ReliableConsumer};
pub use correlator::{ResponseListener, TicketSender};
pub use error::{Result, TradewireError};
pub use memory::{ConfirmBehavior, MemoryBroker};
pub use message::{
    InboundDelivery, OutboundMessage, ReplyEnvelope, BUSINESS_ID_HEADER, REPLY_ROUTING_HEADER,
};
pub use pool::{ChannelLease, ConnectionPool};
pub use publisher::{PublishHandle, PublishOutcome, PublisherStats, ReliablePublisher};
pub use rate_limiter::RateLimiter;
pub use timeout_monitor::{ResponseTimeoutMonitor, TimeoutListener};
pub use transport::{
    Binding, BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, ConsumeSpec, Topology,
};
pub use worker_pool::{WorkerGuard, WorkerPool};

/// Common lifecycle of the engine's long-running components
#[allow(async_fn_in_trait)]
pub trait Lifecycle {
    /// Start background workers; idempotent while open
    async fn open(&self) -> Result<()>;

    /// Stop accepting work and drain; idempotent
    async fn close(&self) -> Result<()>;

    /// Whether the component currently accepts work
    fn is_open(&self) -> bool;
}

impl Lifecycle for ReliablePublisher {
    async fn open(&self) -> Result<()> {
        ReliablePublisher::open(self).await
    }

    async fn close(&self) -> Result<()> {
        ReliablePublisher::close(self).await;
        Ok(())
    }

    fn is_open(&self) -> bool {
        ReliablePublisher::is_open(self)
    }
}

impl Lifecycle for ReliableConsumer {
    async fn open(&self) -> Result<()> {
        ReliableConsumer::open(self).await
    }

    async fn close(&self) -> Result<()> {
        ReliableConsumer::close(self).await;
        Ok(())
    }

    fn is_open(&self) -> bool {
        ReliableConsumer::is_open(self)
    }
}

impl Lifecycle for TicketSender {
    async fn open(&self) -> Result<()> {
        TicketSender::open(self).await
    }

    async fn close(&self) -> Result<()> {
        TicketSender::close(self).await;
        Ok(())
    }

    fn is_open(&self) -> bool {
        TicketSender::is_open(self)
    }
}
