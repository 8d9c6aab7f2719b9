//! In-process broker transport
//!
//! Implements the [`crate::transport`] traits against shared in-memory
//! state: routing-key bindings, per-queue delivery buffers and scriptable
//! publisher-confirm behavior. The test suite and local development run
//! against this transport; production uses [`crate::amqp`].

use crate::config::{BrokerAddress, ClusterDescriptor};
use crate::error::{Result, TradewireError};
use crate::message::{InboundDelivery, OutboundMessage};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, ConsumeSpec, Topology,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// How the in-process broker confirms published messages
#[derive(Debug, Clone, Copy)]
pub enum ConfirmBehavior {
    /// Ack every publish immediately
    AckAll,
    /// Nack the first `n` publishes, ack the rest
    NackFirst(u64),
    /// Ack with `multiple = true` once every `n` publishes, confirming the
    /// whole outstanding batch at once
    AckBatched(u64),
}

/// A message captured by the in-process broker
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    /// Exchange published to
    pub exchange: String,
    /// The outbound message
    pub message: OutboundMessage,
}

#[derive(Default)]
struct BrokerState {
    /// (exchange, routing key) -> bound queue names
    bindings: HashMap<(String, String), Vec<String>>,
    /// queue name -> waiting deliveries
    queues: HashMap<String, VecDeque<InboundDelivery>>,
    /// delivery tag -> (queue, delivery) held until ack/nack (manual ack)
    unacked: HashMap<u64, (String, InboundDelivery)>,
    /// everything ever published
    published: Vec<PublishedMessage>,
    /// delivery tags acknowledged so far
    acked: Vec<u64>,
    /// queues removed via delete-on-close
    deleted_queues: Vec<String>,
    /// remaining publishes to fail with a transport error
    publish_failures: u64,
    /// remaining connection attempts to fail
    connect_failures: u64,
    /// physical connections opened so far
    connections_opened: u64,
    /// physical connections closed so far
    connections_closed: u64,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    confirm_behavior: Mutex<ConfirmBehavior>,
    next_delivery_tag: AtomicU64,
}

/// Shared in-process broker backing any number of connections
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty in-process broker
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                confirm_behavior: Mutex::new(ConfirmBehavior::AckAll),
                next_delivery_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Connector handing out connections to this broker
    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(MemoryConnector {
            broker: self.inner.clone(),
        })
    }

    /// Change how publishes are confirmed
    pub async fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        *self.inner.confirm_behavior.lock().await = behavior;
    }

    /// Fail the next `n` publishes with a transport error
    pub async fn fail_next_publishes(&self, n: u64) {
        self.inner.state.lock().await.publish_failures = n;
    }

    /// Fail the next `n` connection attempts
    pub async fn fail_next_connects(&self, n: u64) {
        self.inner.state.lock().await.connect_failures = n;
    }

    /// Push a delivery straight into a queue, as if routed by the broker
    pub async fn inject(&self, queue: &str, mut delivery: InboundDelivery) {
        delivery.delivery_tag = self.inner.next_delivery_tag.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(delivery);
    }

    /// Everything published so far
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().await.published.clone()
    }

    /// Delivery tags acknowledged so far
    pub async fn acked(&self) -> Vec<u64> {
        self.inner.state.lock().await.acked.clone()
    }

    /// Messages currently waiting in a queue
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Queues deleted via delete-on-close
    pub async fn deleted_queues(&self) -> Vec<String> {
        self.inner.state.lock().await.deleted_queues.clone()
    }

    /// Physical connections opened so far
    pub async fn connections_opened(&self) -> u64 {
        self.inner.state.lock().await.connections_opened
    }

    /// Physical connections closed so far
    pub async fn connections_closed(&self) -> u64 {
        self.inner.state.lock().await.connections_closed
    }
}

struct MemoryConnector {
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(
        &self,
        _descriptor: &ClusterDescriptor,
        address: &BrokerAddress,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.broker.state.lock().await;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(TradewireError::connection(format!(
                "connection refused by {}:{}",
                address.host, address.port
            )));
        }
        state.connections_opened += 1;
        debug!("in-process connection opened to {}:{}", address.host, address.port);
        Ok(Arc::new(MemoryConnection {
            broker: self.broker.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TradewireError::connection("connection is closed"));
        }
        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            connection_open: self.open.clone(),
            open: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            confirms: Mutex::new(VecDeque::new()),
            consume: Mutex::new(None),
        }))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.state.lock().await.connections_closed += 1;
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: Arc<BrokerInner>,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    sequence: AtomicU64,
    confirms: Mutex<VecDeque<ConfirmEvent>>,
    consume: Mutex<Option<ConsumeSpec>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TradewireError::transport("channel is closed"))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        if let Some(queue) = &topology.queue {
            state.queues.entry(queue.name.clone()).or_default();
        }
        for binding in &topology.bindings {
            let key = (topology.exchange.name.clone(), binding.routing_key.clone());
            let queues = state.bindings.entry(key).or_default();
            if !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<u64> {
        self.ensure_open()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.broker.state.lock().await;
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(TradewireError::transport("injected publish failure"));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            message: message.clone(),
        });
        let key = (exchange.to_string(), message.routing_key.clone());
        if let Some(queues) = state.bindings.get(&key).cloned() {
            for queue in queues {
                let delivery = InboundDelivery {
                    delivery_tag: self.broker.next_delivery_tag.fetch_add(1, Ordering::SeqCst),
                    routing_key: message.routing_key.clone(),
                    correlation_id: Some(message.correlation_id.clone()),
                    headers: message.wire_headers(),
                    payload: message.payload.clone(),
                    redelivered: false,
                };
                state.queues.entry(queue).or_default().push_back(delivery);
            }
        }
        drop(state);

        let behavior = *self.broker.confirm_behavior.lock().await;
        let event = match behavior {
            ConfirmBehavior::AckAll => Some(ConfirmEvent::Ack {
                sequence,
                multiple: false,
            }),
            ConfirmBehavior::NackFirst(n) => {
                if sequence <= n {
                    Some(ConfirmEvent::Nack {
                        sequence,
                        multiple: false,
                    })
                } else {
                    Some(ConfirmEvent::Ack {
                        sequence,
                        multiple: false,
                    })
                }
            }
            ConfirmBehavior::AckBatched(n) => {
                if n > 0 && sequence % n == 0 {
                    Some(ConfirmEvent::Ack {
                        sequence,
                        multiple: true,
                    })
                } else {
                    None
                }
            }
        };
        if let Some(event) = event {
            self.confirms.lock().await.push_back(event);
        }
        Ok(sequence)
    }

    async fn next_confirm(&self, wait: Duration) -> Result<Option<ConfirmEvent>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(event) = self.confirms.lock().await.pop_front() {
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(5))).await;
        }
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn start_consumer(&self, spec: &ConsumeSpec) -> Result<()> {
        self.ensure_open()?;
        *self.consume.lock().await = Some(spec.clone());
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<InboundDelivery>> {
        let spec = self
            .consume
            .lock()
            .await
            .clone()
            .ok_or_else(|| TradewireError::transport("channel has no consumer registered"))?;
        let deadline = Instant::now() + wait;
        loop {
            self.ensure_open()?;
            {
                let mut state = self.broker.state.lock().await;
                if let Some(queue) = state.queues.get_mut(&spec.queue) {
                    if let Some(delivery) = queue.pop_front() {
                        if spec.manual_ack {
                            state
                                .unacked
                                .insert(delivery.delivery_tag, (spec.queue.clone(), delivery.clone()));
                        }
                        return Ok(Some(delivery));
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(10))).await;
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        state.unacked.remove(&delivery_tag);
        state.acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        if let Some((queue, mut delivery)) = state.unacked.remove(&delivery_tag) {
            if requeue {
                delivery.redelivered = true;
                state.queues.entry(queue).or_default().push_back(delivery);
            }
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().await;
        state.queues.remove(queue);
        state.deleted_queues.push(queue.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExchangeSpec;
    use crate::config::QueueSpec;

    fn descriptor() -> ClusterDescriptor {
        ClusterDescriptor::new(
            "guest",
            "guest",
            "/",
            vec![BrokerAddress::new("localhost", 5672)],
            false,
        )
        .unwrap()
    }

    async fn channel(broker: &MemoryBroker) -> Box<dyn BrokerChannel> {
        let connector = broker.connector();
        let descriptor = descriptor();
        let connection = connector
            .connect(&descriptor, &descriptor.addresses[0])
            .await
            .unwrap();
        connection.open_channel().await.unwrap()
    }

    #[tokio::test]
    async fn publish_routes_to_bound_queue() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        let topology = Topology::consume(
            ExchangeSpec::direct("ex"),
            QueueSpec::durable("q"),
            &["rk".to_string()],
        );
        ch.declare_topology(&topology).await.unwrap();

        let msg = OutboundMessage::new("rk", b"hello".to_vec());
        ch.publish("ex", &msg).await.unwrap();
        assert_eq!(broker.queue_depth("q").await, 1);

        ch.start_consumer(&ConsumeSpec {
            queue: "q".to_string(),
            consumer_tag: "t".to_string(),
            manual_ack: true,
            exclusive: false,
        })
        .await
        .unwrap();
        let delivery = ch
            .next_delivery(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("delivery");
        assert_eq!(delivery.payload, b"hello");
        assert_eq!(delivery.correlation_id.as_deref(), Some(msg.correlation_id.as_str()));
    }

    #[tokio::test]
    async fn nack_requeue_marks_redelivered() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        let topology = Topology::consume(
            ExchangeSpec::direct("ex"),
            QueueSpec::durable("q"),
            &["rk".to_string()],
        );
        ch.declare_topology(&topology).await.unwrap();
        ch.start_consumer(&ConsumeSpec {
            queue: "q".to_string(),
            consumer_tag: "t".to_string(),
            manual_ack: true,
            exclusive: false,
        })
        .await
        .unwrap();

        ch.publish("ex", &OutboundMessage::new("rk", Vec::new()))
            .await
            .unwrap();
        let delivery = ch
            .next_delivery(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("delivery");
        ch.nack(delivery.delivery_tag, true).await.unwrap();

        let redelivered = ch
            .next_delivery(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("redelivery");
        assert!(redelivered.redelivered);
    }

    #[tokio::test]
    async fn nack_first_behavior_confirms_in_order() {
        let broker = MemoryBroker::new();
        broker.set_confirm_behavior(ConfirmBehavior::NackFirst(1)).await;
        let ch = channel(&broker).await;

        ch.publish("ex", &OutboundMessage::new("rk", Vec::new()))
            .await
            .unwrap();
        ch.publish("ex", &OutboundMessage::new("rk", Vec::new()))
            .await
            .unwrap();

        let first = ch.next_confirm(Duration::from_millis(50)).await.unwrap();
        let second = ch.next_confirm(Duration::from_millis(50)).await.unwrap();
        assert!(matches!(first, Some(ConfirmEvent::Nack { sequence: 1, .. })));
        assert!(matches!(second, Some(ConfirmEvent::Ack { sequence: 2, .. })));
    }

    #[tokio::test]
    async fn closed_connection_rejects_channels() {
        let broker = MemoryBroker::new();
        let connector = broker.connector();
        let descriptor = descriptor();
        let connection = connector
            .connect(&descriptor, &descriptor.addresses[0])
            .await
            .unwrap();
        connection.close().await.unwrap();
        assert!(!connection.is_open());
        assert!(connection.open_channel().await.is_err());
        assert_eq!(broker.connections_closed().await, 1);
    }
}
