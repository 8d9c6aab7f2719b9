//! Reliable consumer with bounded local retry
//!
//! Background workers pull deliveries with a bounded wait, invoke the user
//! handler and translate its verdict into acknowledge/retry actions. A
//! bounded local retry buffer holds deliveries awaiting another attempt;
//! overflow evicts the oldest entry back to the broker so local memory
//! stays bounded even when the handler keeps failing.

use crate::config::ConsumerSettings;
use crate::error::{Result, TradewireError};
use crate::message::InboundDelivery;
use crate::pool::{ChannelLease, ConnectionPool};
use crate::transport::{ConsumeSpec, Topology};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Broker wait per loop iteration while the retry buffer is empty
const DELIVERY_POLL: Duration = Duration::from_millis(250);

/// Broker wait per loop iteration while retries are waiting to be drained
const DELIVERY_POLL_BUSY: Duration = Duration::from_millis(25);

/// Initial reconnect backoff after a channel failure
const BACKOFF_START: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling
const BACKOFF_CAP: Duration = Duration::from_secs(64);

/// Handler's verdict for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerVerdict {
    /// Delivery handled; acknowledge it
    Consumed,
    /// Retry with no budget; the delivery stays in rotation until it
    /// succeeds or is evicted back to the broker
    RetryForever,
    /// Retry against the configured budget; past it the delivery is
    /// acknowledged, reported once via `after_limit_reached` and dropped
    RetryLimited,
}

/// User handler invoked for every delivery
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handle one delivery and return the verdict
    async fn handle(&self, delivery: &InboundDelivery) -> HandlerVerdict;

    /// Called exactly once when a `RetryLimited` delivery exhausts its
    /// budget and is dropped
    async fn after_limit_reached(&self, delivery: &InboundDelivery) {
        let _ = delivery;
    }
}

/// A delivery held in the local retry buffer with its retry counter
struct RetryEnvelope {
    delivery: InboundDelivery,
    retries: u32,
}

/// Consumer statistics
#[derive(Debug, Clone, Default)]
pub struct ConsumerStats {
    /// Deliveries received from the broker
    pub delivered: u64,
    /// Deliveries handled successfully
    pub consumed: u64,
    /// Deliveries put back into the local retry buffer
    pub retried: u64,
    /// Oldest entries evicted to the broker on buffer overflow
    pub evicted: u64,
    /// Deliveries dropped after exhausting the retry budget
    pub dropped: u64,
}

struct ConsumerCore {
    settings: ConsumerSettings,
    pool: Arc<ConnectionPool>,
    handler: Arc<dyn DeliveryHandler>,
    accepting: AtomicBool,
    closing: AtomicBool,
    stats: std::sync::Mutex<ConsumerStats>,
}

impl ConsumerCore {
    fn stats_mut(&self) -> std::sync::MutexGuard<'_, ConsumerStats> {
        self.stats.lock().expect("consumer stats lock poisoned")
    }
}

/// Bounded-retry consumer feeding a [`DeliveryHandler`]
pub struct ReliableConsumer {
    core: Arc<ConsumerCore>,
    workers: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReliableConsumer {
    /// Create a consumer; fails fast on invalid settings
    pub fn new(
        settings: ConsumerSettings,
        pool: Arc<ConnectionPool>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            core: Arc::new(ConsumerCore {
                settings,
                pool,
                handler,
                accepting: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                stats: std::sync::Mutex::new(ConsumerStats::default()),
            }),
            workers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Start the worker loops; idempotent while open
    pub async fn open(&self) -> Result<()> {
        if self.core.accepting.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.core.closing.load(Ordering::SeqCst) {
            self.core.accepting.store(false, Ordering::SeqCst);
            return Err(TradewireError::shutdown("consumer was already closed"));
        }
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.core.settings.concurrency {
            let core = self.core.clone();
            workers.push(tokio::spawn(run_worker(core, worker_id)));
        }
        info!(
            "consumer opened with {} workers on queue {}",
            self.core.settings.concurrency, self.core.settings.queue.name
        );
        Ok(())
    }

    /// Whether the consumer is running
    pub fn is_open(&self) -> bool {
        self.core.accepting.load(Ordering::SeqCst)
    }

    /// Stop the workers and, when configured, delete the queue
    pub async fn close(&self) {
        if !self.core.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.core.closing.store(true, Ordering::SeqCst);

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }

        if self.core.settings.queue.delete_on_close {
            match self.core.pool.get_channel().await {
                Ok(lease) => {
                    if let Err(e) = lease.channel().delete_queue(&self.core.settings.queue.name).await
                    {
                        warn!("queue delete on close failed: {}", e);
                    }
                    self.core.pool.release(lease).await;
                }
                Err(e) => warn!("could not lease a channel to delete the queue: {}", e),
            }
        }
        info!("consumer closed");
    }

    /// Snapshot of consumer statistics
    pub fn stats(&self) -> ConsumerStats {
        self.core.stats_mut().clone()
    }
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        BACKOFF_START
    } else {
        (current * 2).min(BACKOFF_CAP)
    }
}

enum ServeExit {
    Broken,
    Closing,
}

async fn run_worker(core: Arc<ConsumerCore>, worker_id: usize) {
    let mut backoff = Duration::ZERO;
    loop {
        if core.closing.load(Ordering::SeqCst) {
            break;
        }
        let lease = match core.pool.get_channel().await {
            Ok(lease) => lease,
            Err(e) => {
                if core.closing.load(Ordering::SeqCst) {
                    break;
                }
                backoff = next_backoff(backoff);
                warn!(
                    "consumer worker {} could not lease a channel: {}; retrying in {:?}",
                    worker_id, e, backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        match prepare_channel(&core, &lease, worker_id).await {
            Ok(()) => {}
            Err(e) => {
                warn!("consumer worker {} channel setup failed: {}", worker_id, e);
                core.pool.release(lease).await;
                backoff = next_backoff(backoff);
                tokio::time::sleep(backoff).await;
                continue;
            }
        }

        let exit = serve_channel(&core, &lease, &mut backoff).await;
        core.pool.release(lease).await;
        match exit {
            ServeExit::Closing => break,
            ServeExit::Broken => {
                backoff = next_backoff(backoff);
                debug!(
                    "consumer worker {} lost its channel; backing off {:?}",
                    worker_id, backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
    debug!("consumer worker {} stopped", worker_id);
}

async fn prepare_channel(core: &ConsumerCore, lease: &ChannelLease, worker_id: usize) -> Result<()> {
    let topology = Topology::consume(
        core.settings.exchange.clone(),
        core.settings.queue.clone(),
        &core.settings.bindings,
    );
    lease.channel().declare_topology(&topology).await?;
    lease.channel().set_prefetch(core.settings.prefetch_count).await?;
    lease
        .channel()
        .start_consumer(&ConsumeSpec {
            queue: core.settings.queue.name.clone(),
            consumer_tag: format!("{}-{}", core.settings.queue.name, worker_id),
            manual_ack: core.settings.manual_ack,
            exclusive: core.settings.exclusive,
        })
        .await
}

async fn serve_channel(
    core: &ConsumerCore,
    lease: &ChannelLease,
    backoff: &mut Duration,
) -> ServeExit {
    let mut buffer: VecDeque<RetryEnvelope> = VecDeque::new();
    let mut forced_evictions: u32 = 0;

    loop {
        if core.closing.load(Ordering::SeqCst) {
            // Hand buffered retries back to the broker for redelivery.
            for envelope in buffer.drain(..) {
                if core.settings.manual_ack {
                    let _ = lease.channel().nack(envelope.delivery.delivery_tag, true).await;
                }
            }
            return ServeExit::Closing;
        }

        let wait = if buffer.is_empty() {
            DELIVERY_POLL
        } else {
            DELIVERY_POLL_BUSY
        };
        let envelope = match lease.channel().next_delivery(wait).await {
            Ok(Some(delivery)) => {
                core.stats_mut().delivered += 1;
                *backoff = Duration::ZERO;
                RetryEnvelope {
                    delivery,
                    retries: 0,
                }
            }
            Ok(None) => match buffer.pop_front() {
                Some(envelope) => envelope,
                None => continue,
            },
            Err(e) => {
                warn!("delivery read failed: {}", e);
                return ServeExit::Broken;
            }
        };

        match core.handler.handle(&envelope.delivery).await {
            HandlerVerdict::Consumed => {
                if core.settings.manual_ack {
                    if let Err(e) = lease.channel().ack(envelope.delivery.delivery_tag).await {
                        warn!("ack failed: {}", e);
                        return ServeExit::Broken;
                    }
                }
                core.stats_mut().consumed += 1;
                forced_evictions = 0;
            }
            HandlerVerdict::RetryForever => {
                buffer_retry(core, lease, &mut buffer, &mut forced_evictions, envelope).await;
            }
            HandlerVerdict::RetryLimited => {
                if envelope.retries >= core.settings.max_retry_count {
                    if core.settings.manual_ack {
                        if let Err(e) = lease.channel().ack(envelope.delivery.delivery_tag).await {
                            warn!("ack of retry-exhausted delivery failed: {}", e);
                            return ServeExit::Broken;
                        }
                    }
                    core.stats_mut().dropped += 1;
                    notify_limit_reached(core, envelope.delivery).await;
                } else {
                    let envelope = RetryEnvelope {
                        delivery: envelope.delivery,
                        retries: envelope.retries + 1,
                    };
                    buffer_retry(core, lease, &mut buffer, &mut forced_evictions, envelope).await;
                }
            }
        }

        if forced_evictions > core.settings.eviction_threshold {
            // Too many forced evictions in a row: the broker or handler is
            // distressed, pause instead of spinning against it.
            warn!(
                "{} forced evictions, cooling down for {:?}",
                forced_evictions, core.settings.eviction_cooldown
            );
            tokio::time::sleep(core.settings.eviction_cooldown).await;
            forced_evictions = 0;
        }
    }
}

/// Put a delivery back into the local retry buffer, evicting the oldest
/// entry to the broker when the buffer is at capacity
async fn buffer_retry(
    core: &ConsumerCore,
    lease: &ChannelLease,
    buffer: &mut VecDeque<RetryEnvelope>,
    forced_evictions: &mut u32,
    envelope: RetryEnvelope,
) {
    core.stats_mut().retried += 1;
    if buffer.len() >= core.settings.retry_buffer_size {
        if let Some(evicted) = buffer.pop_front() {
            core.stats_mut().evicted += 1;
            *forced_evictions += 1;
            debug!(
                "retry buffer full, returning delivery {} to the broker",
                evicted.delivery.delivery_tag
            );
            if core.settings.manual_ack {
                let _ = lease.channel().nack(evicted.delivery.delivery_tag, true).await;
            }
        }
    }
    buffer.push_back(envelope);
}

/// Report an exhausted delivery exactly once; handler panics are caught
/// and logged, never propagated into the worker loop
async fn notify_limit_reached(core: &ConsumerCore, delivery: InboundDelivery) {
    let handler = core.handler.clone();
    let joined = tokio::spawn(async move {
        handler.after_limit_reached(&delivery).await;
    })
    .await;
    if joined.is_err() {
        error!("after_limit_reached panicked; continuing");
    }
}
