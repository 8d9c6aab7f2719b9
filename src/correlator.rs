//! Request/response correlation façade
//!
//! One `TicketSender` serves one message type: it publishes requests
//! through the reliable publisher, consumes the reply queue, and matches
//! responses back to the originating call by business id. Listener-driven
//! (`send`) and blocking-with-timeout (`call`) usage share the same
//! pending-request bookkeeping; every request receives exactly one
//! terminal notification — response, publish failure or timeout — through
//! exactly one channel.

use crate::config::{ClusterDescriptor, ConsumerSettings, PublisherSettings, SenderSettings};
use crate::consumer::{DeliveryHandler, HandlerVerdict, ReliableConsumer};
use crate::error::{Result, TradewireError};
use crate::message::{InboundDelivery, OutboundMessage, ReplyEnvelope};
use crate::pool::ConnectionPool;
use crate::publisher::ReliablePublisher;
use crate::timeout_monitor::{ResponseTimeoutMonitor, TimeoutListener};
use crate::transport::BrokerConnector;
use crate::worker_pool::{WorkerGuard, WorkerPool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Channel leases multiplexed per physical connection
const CHANNELS_PER_CONNECTION: usize = 16;

/// Sleep between close() drain polls
const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Listener receiving asynchronous request outcomes
pub trait ResponseListener: Send + Sync {
    /// A correlated response arrived
    fn on_response(&self, reply: ReplyEnvelope);

    /// No response arrived within the configured window
    fn on_response_timeout(&self, correlation_id: &str) {
        let _ = correlation_id;
    }

    /// The request could not be published
    fn on_publish_failure(&self, correlation_id: &str) {
        let _ = correlation_id;
    }
}

/// Signal released to a blocking caller
enum WaitSignal {
    Response(ReplyEnvelope),
    PublishFailed(TradewireError),
    TimedOut,
}

/// One in-flight request awaiting its response
struct PendingRequest {
    correlation_id: String,
    listener: Option<Arc<dyn ResponseListener>>,
    waiter: Option<oneshot::Sender<WaitSignal>>,
}

/// Short-TTL cache entry for a resolved response
struct ResponseRecord {
    reply: ReplyEnvelope,
    stored_at: Instant,
}

#[derive(Default)]
struct PendingState {
    by_business: HashMap<String, PendingRequest>,
    by_correlation: HashMap<String, String>,
}

struct SenderShared {
    settings: SenderSettings,
    monitor: ResponseTimeoutMonitor,
    worker_pool: WorkerPool,
    pending: std::sync::Mutex<PendingState>,
    responses: std::sync::Mutex<HashMap<String, ResponseRecord>>,
    default_listener: std::sync::Mutex<Option<Arc<dyn ResponseListener>>>,
    accepting: AtomicBool,
}

impl SenderShared {
    fn pending_mut(&self) -> std::sync::MutexGuard<'_, PendingState> {
        self.pending.lock().expect("pending lock poisoned")
    }

    fn responses_mut(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResponseRecord>> {
        self.responses.lock().expect("responses lock poisoned")
    }

    fn default_listener(&self) -> Option<Arc<dyn ResponseListener>> {
        self.default_listener
            .lock()
            .expect("listener lock poisoned")
            .clone()
    }

    fn register_pending(&self, business_id: &str, request: PendingRequest) -> Result<()> {
        let mut pending = self.pending_mut();
        if pending.by_business.contains_key(business_id) {
            return Err(TradewireError::DuplicateRequest {
                business_id: business_id.to_string(),
            });
        }
        pending
            .by_correlation
            .insert(request.correlation_id.clone(), business_id.to_string());
        pending.by_business.insert(business_id.to_string(), request);
        Ok(())
    }

    fn take_pending_by_business(&self, business_id: &str) -> Option<PendingRequest> {
        let mut pending = self.pending_mut();
        let request = pending.by_business.remove(business_id)?;
        pending.by_correlation.remove(&request.correlation_id);
        Some(request)
    }

    fn take_pending_by_correlation(&self, correlation_id: &str) -> Option<PendingRequest> {
        let mut pending = self.pending_mut();
        let business_id = pending.by_correlation.remove(correlation_id)?;
        pending.by_business.remove(&business_id)
    }

    fn pending_len(&self) -> usize {
        self.pending_mut().by_business.len()
    }

    /// Store a response record, purging naturally expired entries; returns
    /// whether a live record for the business id already existed
    fn store_response(&self, reply: &ReplyEnvelope) -> bool {
        let ttl = self.settings.response_cache_ttl;
        let mut responses = self.responses_mut();
        responses.retain(|_, record| record.stored_at.elapsed() <= ttl);
        responses
            .insert(
                reply.business_id.clone(),
                ResponseRecord {
                    reply: reply.clone(),
                    stored_at: Instant::now(),
                },
            )
            .is_some()
    }

    fn take_response(&self, business_id: &str) -> Option<ReplyEnvelope> {
        self.responses_mut()
            .remove(business_id)
            .map(|record| record.reply)
    }

    /// A correlated response arrived off the reply queue
    fn on_response_received(&self, reply: ReplyEnvelope) {
        self.monitor.on_response_received(&reply.correlation_id);
        let duplicate = self.store_response(&reply);

        match self.take_pending_by_business(&reply.business_id) {
            Some(request) => {
                debug!("response matched pending request {}", reply.business_id);
                if let Some(waiter) = request.waiter {
                    let _ = waiter.send(WaitSignal::Response(reply.clone()));
                }
                if let Some(listener) = request.listener {
                    self.worker_pool
                        .dispatch(move || listener.on_response(reply));
                }
            }
            None if duplicate => {
                debug!(
                    "duplicate response for business id {}, dropping",
                    reply.business_id
                );
            }
            None => match self.default_listener() {
                Some(listener) => {
                    self.worker_pool
                        .dispatch(move || listener.on_response(reply));
                }
                None => warn!(
                    "response for business id {} arrived with no listener configured",
                    reply.business_id
                ),
            },
        }
    }

    /// The publish of a request failed terminally
    fn on_publish_failure(&self, correlation_id: &str, error: TradewireError) {
        self.monitor.on_publish_failure(correlation_id);
        match self.take_pending_by_correlation(correlation_id) {
            Some(request) => {
                if let Some(waiter) = request.waiter {
                    let _ = waiter.send(WaitSignal::PublishFailed(error));
                } else if let Some(listener) = request.listener {
                    let correlation_id = correlation_id.to_string();
                    self.worker_pool
                        .dispatch(move || listener.on_publish_failure(&correlation_id));
                }
            }
            None => {
                if let Some(listener) = self.default_listener() {
                    let correlation_id = correlation_id.to_string();
                    self.worker_pool
                        .dispatch(move || listener.on_publish_failure(&correlation_id));
                }
            }
        }
    }

    /// The timeout monitor evicted an unanswered request
    fn on_monitor_timeout(&self, correlation_id: &str) {
        match self.take_pending_by_correlation(correlation_id) {
            Some(request) => {
                if let Some(waiter) = request.waiter {
                    let _ = waiter.send(WaitSignal::TimedOut);
                } else if let Some(listener) = request.listener {
                    let correlation_id = correlation_id.to_string();
                    self.worker_pool
                        .dispatch(move || listener.on_response_timeout(&correlation_id));
                }
            }
            None => {
                if let Some(listener) = self.default_listener() {
                    let correlation_id = correlation_id.to_string();
                    self.worker_pool
                        .dispatch(move || listener.on_response_timeout(&correlation_id));
                }
            }
        }
    }
}

/// Routes timeout monitor evictions back into the correlator
struct MonitorAdapter {
    shared: Weak<SenderShared>,
}

impl TimeoutListener for MonitorAdapter {
    fn on_timeout(&self, correlation_id: &str) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_monitor_timeout(correlation_id);
        }
    }
}

/// Feeds reply-queue deliveries into the correlator
struct ReplyDispatchHandler {
    shared: Arc<SenderShared>,
}

#[async_trait]
impl DeliveryHandler for ReplyDispatchHandler {
    async fn handle(&self, delivery: &InboundDelivery) -> HandlerVerdict {
        match ReplyEnvelope::from_delivery(delivery) {
            Some(reply) => self.shared.on_response_received(reply),
            None => warn!(
                "reply delivery {} carries no correlation id, dropping",
                delivery.delivery_tag
            ),
        }
        HandlerVerdict::Consumed
    }
}

/// Per message-type request/response sender
pub struct TicketSender {
    shared: Arc<SenderShared>,
    publisher: Arc<ReliablePublisher>,
    consumer: Arc<ReliableConsumer>,
    pool: Arc<ConnectionPool>,
    guard: std::sync::Mutex<Option<WorkerGuard>>,
}

impl TicketSender {
    /// Wire up a sender against one cluster; fails fast on invalid settings
    pub fn new(
        settings: SenderSettings,
        descriptor: ClusterDescriptor,
        publisher_settings: PublisherSettings,
        consumer_settings: ConsumerSettings,
        connector: Arc<dyn BrokerConnector>,
        worker_pool: WorkerPool,
    ) -> Result<Self> {
        settings.validate()?;
        let pool = Arc::new(ConnectionPool::new(
            connector,
            descriptor,
            CHANNELS_PER_CONNECTION,
        ));
        let monitor = ResponseTimeoutMonitor::new(settings.response_timeout, worker_pool.clone());

        let shared = Arc::new(SenderShared {
            settings,
            monitor,
            worker_pool,
            pending: std::sync::Mutex::new(PendingState::default()),
            responses: std::sync::Mutex::new(HashMap::new()),
            default_listener: std::sync::Mutex::new(None),
            accepting: AtomicBool::new(false),
        });
        shared.monitor.set_listener(Arc::new(MonitorAdapter {
            shared: Arc::downgrade(&shared),
        }));

        let publisher = Arc::new(ReliablePublisher::new(publisher_settings, pool.clone())?);
        let consumer = Arc::new(ReliableConsumer::new(
            consumer_settings,
            pool.clone(),
            Arc::new(ReplyDispatchHandler {
                shared: shared.clone(),
            }),
        )?);

        Ok(Self {
            shared,
            publisher,
            consumer,
            pool,
            guard: std::sync::Mutex::new(None),
        })
    }

    /// Register the listener receiving asynchronous outcomes
    pub fn set_response_listener(&self, listener: Arc<dyn ResponseListener>) {
        *self
            .shared
            .default_listener
            .lock()
            .expect("listener lock poisoned") = Some(listener);
    }

    /// Open the publisher, reply consumer and timeout monitor; idempotent
    pub async fn open(&self) -> Result<()> {
        if self.shared.accepting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.guard.lock().expect("guard lock poisoned") =
            Some(self.shared.worker_pool.attach());
        self.shared.monitor.open().await;
        let opened = async {
            self.publisher.open().await?;
            self.consumer.open().await
        }
        .await;
        if let Err(e) = opened {
            self.shared.accepting.store(false, Ordering::SeqCst);
            self.guard.lock().expect("guard lock poisoned").take();
            self.shared.monitor.close().await;
            return Err(e);
        }
        info!("ticket sender opened");
        Ok(())
    }

    /// Whether the sender accepts new requests
    pub fn is_open(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// Fire-and-forget send; the outcome arrives through the configured
    /// response listener
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.shared.default_listener().is_none() {
            return Err(TradewireError::configuration(
                "send requires a response listener to be configured first",
            ));
        }
        self.submit(message, None).await
    }

    /// Fire-and-forget send with a per-call listener for this request only
    pub async fn send_with_listener(
        &self,
        message: OutboundMessage,
        listener: Arc<dyn ResponseListener>,
    ) -> Result<()> {
        let business_id = message.business_id.clone();
        let request = PendingRequest {
            correlation_id: message.correlation_id.clone(),
            listener: Some(listener),
            waiter: None,
        };
        self.shared.register_pending(&business_id, request)?;
        if let Err(e) = self.submit(message, None).await {
            self.shared.take_pending_by_business(&business_id);
            return Err(e);
        }
        Ok(())
    }

    /// Send and block the caller until the response arrives or `timeout`
    /// elapses
    ///
    /// Always returns either the response or an error; a timeout is
    /// surfaced explicitly, never as an empty result.
    pub async fn call(
        &self,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<ReplyEnvelope> {
        let business_id = message.business_id.clone();
        let correlation_id = message.correlation_id.clone();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let request = PendingRequest {
            correlation_id: correlation_id.clone(),
            listener: None,
            waiter: Some(waiter_tx),
        };
        self.shared.register_pending(&business_id, request)?;

        if let Err(e) = self.submit(message, Some(&business_id)).await {
            return Err(e);
        }

        match tokio::time::timeout(timeout, waiter_rx).await {
            Ok(Ok(WaitSignal::Response(reply))) => {
                // Read the matching response record; the signal payload is
                // the fallback if the record already aged out.
                Ok(self
                    .shared
                    .take_response(&reply.business_id)
                    .unwrap_or(reply))
            }
            Ok(Ok(WaitSignal::PublishFailed(error))) => Err(error),
            Ok(Ok(WaitSignal::TimedOut)) | Ok(Err(_)) => {
                self.shared.take_pending_by_business(&business_id);
                self.shared.monitor.on_response_received(&correlation_id);
                Err(TradewireError::response_timeout(correlation_id))
            }
            Err(_) => {
                // The caller's deadline fired first; deregister so the
                // monitor cannot deliver a second terminal notification.
                self.shared.take_pending_by_business(&business_id);
                self.shared.monitor.on_response_received(&correlation_id);
                Err(TradewireError::response_timeout(correlation_id))
            }
        }
    }

    /// Publish one request and watch its handle for terminal failure
    async fn submit(&self, mut message: OutboundMessage, cleanup: Option<&str>) -> Result<()> {
        if !self.is_open() {
            if let Some(business_id) = cleanup {
                self.shared.take_pending_by_business(business_id);
            }
            return Err(TradewireError::shutdown("ticket sender is closed"));
        }
        message.routing_key = self.shared.settings.routing_key.clone();
        message.reply_routing_key = Some(self.shared.settings.reply_routing_key.clone());
        let correlation_id = message.correlation_id.clone();

        self.shared.monitor.on_sent(&correlation_id);
        let handle = self.publisher.enqueue(message);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.outcome().await {
                warn!("publish of {} failed: {}", correlation_id, e);
                shared.on_publish_failure(&correlation_id, e);
            }
        });
        Ok(())
    }

    /// Stop accepting sends, drain in-flight requests, then close every
    /// component
    pub async fn close(&self) {
        if !self.shared.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let deadline = Instant::now() + self.shared.settings.drain_timeout;
        while Instant::now() < deadline {
            if self.shared.pending_len() == 0 && self.shared.monitor.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if self.shared.pending_len() > 0 {
            warn!(
                "closing with {} requests still pending",
                self.shared.pending_len()
            );
        }

        self.consumer.close().await;
        self.publisher.close().await;
        self.shared.monitor.close().await;
        self.pool.close_all().await;
        self.guard.lock().expect("guard lock poisoned").take();
        info!("ticket sender closed");
    }

    /// Publisher statistics
    pub fn publisher_stats(&self) -> crate::publisher::PublisherStats {
        self.publisher.stats()
    }

    /// Reply consumer statistics
    pub fn consumer_stats(&self) -> crate::consumer::ConsumerStats {
        self.consumer.stats()
    }
}
