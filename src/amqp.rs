//! lapin-backed AMQP 0-9-1 transport
//!
//! Maps the [`crate::transport`] capability traits onto lapin: durable
//! exchange/queue declaration, publisher confirms translated into
//! per-sequence [`ConfirmEvent`]s, and a consumer stream pulled with a
//! bounded wait so worker loops can service their local retry buffers.

use crate::config::{BrokerAddress, ClusterDescriptor, ExchangeType};
use crate::error::{Result, TradewireError};
use crate::message::{InboundDelivery, OutboundMessage};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, ConfirmEvent, ConsumeSpec, Topology,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Connector opening lapin connections to cluster nodes
#[derive(Debug, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(
        &self,
        descriptor: &ClusterDescriptor,
        address: &BrokerAddress,
    ) -> Result<std::sync::Arc<dyn BrokerConnection>> {
        let uri = descriptor.amqp_uri(address);
        debug!("connecting to {}:{}", address.host, address.port);
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                TradewireError::connection(format!(
                    "connect to {}:{} failed: {}",
                    address.host, address.port, e
                ))
            })?;
        Ok(std::sync::Arc::new(AmqpConnection { connection }))
    }
}

/// One physical AMQP connection
pub struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Box::new(AmqpChannel::new(channel)))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.connection.close(200, "client closing").await?;
        Ok(())
    }
}

/// One logical AMQP channel
pub struct AmqpChannel {
    channel: Channel,
    sequence: AtomicU64,
    confirms_enabled: AtomicBool,
    confirm_tx: mpsc::UnboundedSender<ConfirmEvent>,
    confirm_rx: Mutex<mpsc::UnboundedReceiver<ConfirmEvent>>,
    consumer: Mutex<Option<lapin::Consumer>>,
}

impl AmqpChannel {
    fn new(channel: Channel) -> Self {
        let (confirm_tx, confirm_rx) = mpsc::unbounded_channel();
        Self {
            channel,
            sequence: AtomicU64::new(0),
            confirms_enabled: AtomicBool::new(false),
            confirm_tx,
            confirm_rx: Mutex::new(confirm_rx),
            consumer: Mutex::new(None),
        }
    }
}

fn exchange_kind(exchange_type: ExchangeType) -> ExchangeKind {
    match exchange_type {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
    }
}

fn headers_to_field_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers {
        table.insert(
            ShortString::from(name.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn field_table_to_headers(table: &FieldTable) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in table.inner() {
        let value = match value {
            AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            AMQPValue::ShortString(s) => s.as_str().to_string(),
            // Non-string header values are not produced by this engine.
            _ => continue,
        };
        headers.insert(name.as_str().to_string(), value);
    }
    headers
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        self.channel
            .exchange_declare(
                &topology.exchange.name,
                exchange_kind(topology.exchange.exchange_type),
                ExchangeDeclareOptions {
                    durable: topology.exchange.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        if let Some(queue) = &topology.queue {
            self.channel
                .queue_declare(
                    &queue.name,
                    QueueDeclareOptions {
                        durable: queue.durable,
                        exclusive: queue.exclusive,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        for binding in &topology.bindings {
            self.channel
                .queue_bind(
                    &binding.queue,
                    &topology.exchange.name,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        self.confirms_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, exchange: &str, message: &OutboundMessage) -> Result<u64> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(message.correlation_id.clone()))
            .with_headers(headers_to_field_table(&message.wire_headers()))
            .with_delivery_mode(2);
        if let Some(reply) = &message.reply_routing_key {
            properties = properties.with_reply_to(ShortString::from(reply.clone()));
        }

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?;

        if self.confirms_enabled.load(Ordering::SeqCst) {
            // lapin resolves confirms per publish; translate to sequence
            // events so the publisher can resolve them under one lock.
            let tx = self.confirm_tx.clone();
            tokio::spawn(async move {
                let event = match confirm.await {
                    Ok(Confirmation::Nack(_)) => ConfirmEvent::Nack {
                        sequence,
                        multiple: false,
                    },
                    Ok(Confirmation::Ack(_)) | Ok(Confirmation::NotRequested) => {
                        ConfirmEvent::Ack {
                            sequence,
                            multiple: false,
                        }
                    }
                    Err(e) => {
                        warn!("publisher confirm failed for sequence {}: {}", sequence, e);
                        ConfirmEvent::Nack {
                            sequence,
                            multiple: false,
                        }
                    }
                };
                let _ = tx.send(event);
            });
        }
        Ok(sequence)
    }

    async fn next_confirm(&self, wait: Duration) -> Result<Option<ConfirmEvent>> {
        let mut rx = self.confirm_rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn start_consumer(&self, spec: &ConsumeSpec) -> Result<()> {
        let consumer = self
            .channel
            .basic_consume(
                &spec.queue,
                &spec.consumer_tag,
                BasicConsumeOptions {
                    no_ack: !spec.manual_ack,
                    exclusive: spec.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        *self.consumer.lock().await = Some(consumer);
        Ok(())
    }

    async fn next_delivery(&self, wait: Duration) -> Result<Option<InboundDelivery>> {
        let mut guard = self.consumer.lock().await;
        let consumer = guard
            .as_mut()
            .ok_or_else(|| TradewireError::transport("channel has no consumer registered"))?;
        match tokio::time::timeout(wait, consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(TradewireError::transport("consumer stream ended")),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(delivery))) => {
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(field_table_to_headers)
                    .unwrap_or_default();
                let correlation_id = delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|s| s.as_str().to_string());
                Ok(Some(InboundDelivery {
                    delivery_tag: delivery.delivery_tag,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    correlation_id,
                    headers,
                    payload: delivery.data,
                    redelivered: delivery.redelivered,
                }))
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(200, "client closing").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut headers = HashMap::new();
        headers.insert("business-id".to_string(), "ticket-7".to_string());
        headers.insert("reply-routing-key".to_string(), "ticket.reply".to_string());

        let table = headers_to_field_table(&headers);
        let back = field_table_to_headers(&table);
        assert_eq!(back, headers);
    }

    #[test]
    fn exchange_kinds_map_one_to_one() {
        assert!(matches!(exchange_kind(ExchangeType::Direct), ExchangeKind::Direct));
        assert!(matches!(exchange_kind(ExchangeType::Fanout), ExchangeKind::Fanout));
        assert!(matches!(exchange_kind(ExchangeType::Topic), ExchangeKind::Topic));
    }
}
