//! Shared helpers for the integration tests
//!
//! Tests run against the in-process broker transport; `respond_after`
//! plays the remote backend, answering published requests on the reply
//! queue after a configurable delay.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tradewire::{
    BrokerAddress, ClusterDescriptor, ConsumerSettings, ExchangeSpec, InboundDelivery,
    MemoryBroker, OutboundMessage, PublisherSettings, QueueSpec, ReplyEnvelope, ResponseListener,
    SenderSettings, TicketSender, WorkerPool, BUSINESS_ID_HEADER,
};

pub const REPLY_QUEUE: &str = "replies";

pub fn descriptor() -> ClusterDescriptor {
    ClusterDescriptor::new(
        "guest",
        "guest",
        "/",
        vec![BrokerAddress::new("node1", 5672)],
        false,
    )
    .unwrap()
}

pub fn build_sender(broker: &MemoryBroker, sender_settings: SenderSettings) -> TicketSender {
    build_sender_with(broker, sender_settings, PublisherSettings::default())
}

pub fn build_sender_with(
    broker: &MemoryBroker,
    sender_settings: SenderSettings,
    publisher_settings: PublisherSettings,
) -> TicketSender {
    let consumer_settings = ConsumerSettings {
        exchange: ExchangeSpec::direct("tradewire.confirm"),
        queue: QueueSpec::durable(REPLY_QUEUE),
        bindings: vec![sender_settings.reply_routing_key.clone()],
        ..Default::default()
    };
    TicketSender::new(
        sender_settings,
        descriptor(),
        publisher_settings,
        consumer_settings,
        broker.connector(),
        WorkerPool::new(2),
    )
    .unwrap()
}

/// Build the backend's reply to one published request
pub fn reply_to(request: &OutboundMessage, payload: &[u8]) -> InboundDelivery {
    let mut headers = HashMap::new();
    headers.insert(
        BUSINESS_ID_HEADER.to_string(),
        request.business_id.clone(),
    );
    InboundDelivery {
        delivery_tag: 0,
        routing_key: request
            .reply_routing_key
            .clone()
            .unwrap_or_else(|| "ticket.reply".to_string()),
        correlation_id: Some(request.correlation_id.clone()),
        headers,
        payload: payload.to_vec(),
        redelivered: false,
    }
}

/// Answer every published request with `payload` after `delay`
pub fn respond_after(broker: &MemoryBroker, delay: Duration, payload: &'static [u8]) {
    let broker = broker.clone();
    tokio::spawn(async move {
        let mut answered = 0usize;
        loop {
            let published = broker.published().await;
            for entry in published.iter().skip(answered) {
                let reply = reply_to(&entry.message, payload);
                let broker = broker.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    broker.inject(REPLY_QUEUE, reply).await;
                });
            }
            answered = published.len();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
}

/// Listener recording every notification it receives
#[derive(Default)]
pub struct RecordingListener {
    pub responses: Mutex<Vec<ReplyEnvelope>>,
    pub timeouts: Mutex<Vec<String>>,
    pub publish_failures: Mutex<Vec<String>>,
}

impl RecordingListener {
    pub fn response_count(&self) -> usize {
        self.responses.lock().unwrap().len()
    }

    pub fn timeout_count(&self) -> usize {
        self.timeouts.lock().unwrap().len()
    }

    pub fn publish_failure_count(&self) -> usize {
        self.publish_failures.lock().unwrap().len()
    }
}

impl ResponseListener for RecordingListener {
    fn on_response(&self, reply: ReplyEnvelope) {
        self.responses.lock().unwrap().push(reply);
    }

    fn on_response_timeout(&self, correlation_id: &str) {
        self.timeouts.lock().unwrap().push(correlation_id.to_string());
    }

    fn on_publish_failure(&self, correlation_id: &str) {
        self.publish_failures
            .lock()
            .unwrap()
            .push(correlation_id.to_string());
    }
}

/// Poll `check` until it holds or `deadline` passes
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < end {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
