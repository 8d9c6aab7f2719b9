//! Reliable publisher with confirm tracking and bounded retry
//!
//! Background workers drain a bounded outbound queue and publish each
//! message on an exclusively owned channel lease. In confirmed mode every
//! publish is tracked against the channel's monotonically increasing
//! sequence number until the broker acks it (singly or batched); nacks
//! consume retry budget and re-queue the message. Exactly one terminal
//! outcome is ever reported per enqueued message.

use crate::config::PublisherSettings;
use crate::error::{Result, TradewireError};
use crate::message::OutboundMessage;
use crate::pool::{ChannelLease, ConnectionPool};
use crate::rate_limiter::RateLimiter;
use crate::transport::{ConfirmEvent, Topology};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long a worker waits on the outbound queue per iteration
const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Initial reconnect backoff after a channel failure
const BACKOFF_START: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling
const BACKOFF_CAP: Duration = Duration::from_secs(64);

/// How long a closing worker keeps waiting for outstanding confirms
const CONFIRM_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal outcome of one enqueued publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker durably accepted the message (or the channel accepted it,
    /// in unconfirmed mode)
    Confirmed,
    /// The message was never accepted: buffer full or publisher closed
    Rejected(String),
    /// The broker nacked the message past its retry budget
    RetryExhausted {
        /// Retries performed before giving up
        attempts: u32,
    },
}

/// Completion handle for one enqueued publish
pub struct PublishHandle {
    rx: oneshot::Receiver<PublishOutcome>,
}

impl PublishHandle {
    /// Wait for the terminal outcome, mapping failures onto the error
    /// taxonomy
    pub async fn outcome(self) -> Result<()> {
        match self.rx.await {
            Ok(PublishOutcome::Confirmed) => Ok(()),
            Ok(PublishOutcome::Rejected(reason)) => Err(TradewireError::PublishRejected(reason)),
            Ok(PublishOutcome::RetryExhausted { attempts }) => {
                Err(TradewireError::PublishRetryExhausted { attempts })
            }
            Err(_) => Err(TradewireError::shutdown("publisher dropped without resolving")),
        }
    }
}

/// An enqueued message plus its completion handle and retry counter
struct PendingPublish {
    message: OutboundMessage,
    completion: Option<oneshot::Sender<PublishOutcome>>,
    retries: u32,
}

impl PendingPublish {
    fn resolve(mut self, outcome: PublishOutcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Publisher statistics
#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    /// Messages accepted into the outbound queue
    pub enqueued: u64,
    /// Messages rejected synchronously (buffer full or closed)
    pub rejected: u64,
    /// Publish calls handed to a channel
    pub published: u64,
    /// Messages confirmed by the broker
    pub confirmed: u64,
    /// Negative acknowledgements received
    pub nacked: u64,
    /// Messages re-queued after a nack or channel failure
    pub requeued: u64,
    /// Messages failed after exhausting the retry budget
    pub retry_exhausted: u64,
}

struct PublisherCore {
    settings: PublisherSettings,
    pool: Arc<ConnectionPool>,
    rate_limiter: Option<RateLimiter>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<PendingPublish>>,
    retry_queue: std::sync::Mutex<VecDeque<PendingPublish>>,
    accepting: AtomicBool,
    closing: AtomicBool,
    stats: std::sync::Mutex<PublisherStats>,
}

impl PublisherCore {
    fn stats_mut(&self) -> std::sync::MutexGuard<'_, PublisherStats> {
        self.stats.lock().expect("publisher stats lock poisoned")
    }

    fn pop_retry(&self) -> Option<PendingPublish> {
        self.retry_queue
            .lock()
            .expect("publisher retry lock poisoned")
            .pop_front()
    }

    fn push_retry(&self, pending: PendingPublish) {
        self.stats_mut().requeued += 1;
        self.retry_queue
            .lock()
            .expect("publisher retry lock poisoned")
            .push_back(pending);
    }
}

/// Confirmed/retrying publisher draining a bounded outbound queue
pub struct ReliablePublisher {
    core: Arc<PublisherCore>,
    queue_tx: mpsc::Sender<PendingPublish>,
    workers: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReliablePublisher {
    /// Create a publisher; fails fast on invalid settings
    pub fn new(settings: PublisherSettings, pool: Arc<ConnectionPool>) -> Result<Self> {
        settings.validate()?;
        let (queue_tx, queue_rx) = mpsc::channel(settings.max_buffer_size);
        let rate_limiter = settings.messages_per_second.map(RateLimiter::new);
        Ok(Self {
            core: Arc::new(PublisherCore {
                settings,
                pool,
                rate_limiter,
                queue_rx: tokio::sync::Mutex::new(queue_rx),
                retry_queue: std::sync::Mutex::new(VecDeque::new()),
                accepting: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                stats: std::sync::Mutex::new(PublisherStats::default()),
            }),
            queue_tx,
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
            return Err(TradewireError::shutdown("publisher was already closed"));
        }
        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.core.settings.concurrency {
            let core = self.core.clone();
            workers.push(tokio::spawn(run_worker(core, worker_id)));
        }
        info!(
            "publisher opened with {} workers on exchange {}",
            self.core.settings.concurrency, self.core.settings.exchange.name
        );
        Ok(())
    }

    /// Whether the publisher currently accepts new messages
    pub fn is_open(&self) -> bool {
        self.core.accepting.load(Ordering::SeqCst)
    }

    /// Append a message to the outbound queue
    ///
    /// Never blocks: a full buffer or a closed publisher resolves the
    /// returned handle as rejected immediately.
    pub fn enqueue(&self, message: OutboundMessage) -> PublishHandle {
        let (tx, rx) = oneshot::channel();
        let handle = PublishHandle { rx };

        if !self.is_open() {
            self.core.stats_mut().rejected += 1;
            let _ = tx.send(PublishOutcome::Rejected("publisher is closed".to_string()));
            return handle;
        }

        let pending = PendingPublish {
            message,
            completion: Some(tx),
            retries: 0,
        };
        match self.queue_tx.try_send(pending) {
            Ok(()) => {
                self.core.stats_mut().enqueued += 1;
            }
            Err(mpsc::error::TrySendError::Full(pending)) => {
                self.core.stats_mut().rejected += 1;
                warn!("outbound buffer full, rejecting publish");
                pending.resolve(PublishOutcome::Rejected("outbound buffer full".to_string()));
            }
            Err(mpsc::error::TrySendError::Closed(pending)) => {
                self.core.stats_mut().rejected += 1;
                pending.resolve(PublishOutcome::Rejected("publisher is closed".to_string()));
            }
        }
        handle
    }

    /// Stop accepting new messages, drain workers and resolve leftovers
    pub async fn close(&self) {
        if !self.core.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        self.core.closing.store(true, Ordering::SeqCst);

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }

        // Anything the workers never picked up resolves as rejected.
        let mut leftovers = Vec::new();
        {
            let mut queue_rx = self.core.queue_rx.lock().await;
            while let Ok(pending) = queue_rx.try_recv() {
                leftovers.push(pending);
            }
        }
        leftovers.extend(
            self.core
                .retry_queue
                .lock()
                .expect("publisher retry lock poisoned")
                .drain(..),
        );
        for pending in leftovers {
            self.core.stats_mut().rejected += 1;
            pending.resolve(PublishOutcome::Rejected("publisher closed".to_string()));
        }
        info!("publisher closed");
    }

    /// Snapshot of publisher statistics
    pub fn stats(&self) -> PublisherStats {
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
    /// Channel failed; lease a fresh one after backoff
    Broken,
    /// Closing and fully drained
    Drained,
}

async fn run_worker(core: Arc<PublisherCore>, worker_id: usize) {
    let mut backoff = Duration::ZERO;
    loop {
        if core.closing.load(Ordering::SeqCst) && outbound_drained(&core).await {
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
                    "publisher worker {} could not lease a channel: {}; retrying in {:?}",
                    worker_id, e, backoff
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        match prepare_channel(&core, &lease).await {
            Ok(()) => {}
            Err(e) => {
                warn!("publisher worker {} channel setup failed: {}", worker_id, e);
                core.pool.release(lease).await;
                backoff = next_backoff(backoff);
                tokio::time::sleep(backoff).await;
                continue;
            }
        }

        let exit = serve_channel(&core, &lease, &mut backoff).await;
        core.pool.release(lease).await;
        match exit {
            ServeExit::Drained => break,
            ServeExit::Broken => {
                backoff = next_backoff(backoff);
                debug!(
                    "publisher worker {} lost its channel; backing off {:?}",
                    worker_id, backoff
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
    debug!("publisher worker {} stopped", worker_id);
}

async fn outbound_drained(core: &PublisherCore) -> bool {
    if !core
        .retry_queue
        .lock()
        .expect("publisher retry lock poisoned")
        .is_empty()
    {
        return false;
    }
    let polled = {
        let mut queue_rx = core.queue_rx.lock().await;
        queue_rx.try_recv()
    };
    match polled {
        Ok(pending) => {
            // Keep the message; it only proves the queue is not drained.
            core.retry_queue
                .lock()
                .expect("publisher retry lock poisoned")
                .push_back(pending);
            false
        }
        Err(_) => true,
    }
}

async fn prepare_channel(core: &PublisherCore, lease: &ChannelLease) -> Result<()> {
    let topology = Topology::publish_only(core.settings.exchange.clone());
    lease.channel().declare_topology(&topology).await?;
    if core.settings.confirm_publishes {
        lease.channel().enable_confirms().await?;
    }
    Ok(())
}

/// Serve one channel until it breaks or the publisher fully drains
///
/// The per-channel pending map is single-owner state of this worker, so
/// batched acknowledgements resolve all their entries in one step without
/// racing other workers.
async fn serve_channel(
    core: &PublisherCore,
    lease: &ChannelLease,
    backoff: &mut Duration,
) -> ServeExit {
    let mut pending: BTreeMap<u64, PendingPublish> = BTreeMap::new();
    let mut drain_deadline: Option<Instant> = None;

    loop {
        // Resolve whatever confirms have arrived.
        loop {
            match lease.channel().next_confirm(Duration::ZERO).await {
                Ok(Some(event)) => handle_confirm(core, &mut pending, event),
                Ok(None) => break,
                Err(e) => {
                    warn!("confirm read failed: {}", e);
                    requeue_pending(core, pending);
                    return ServeExit::Broken;
                }
            }
        }

        let closing = core.closing.load(Ordering::SeqCst);
        if closing && drain_deadline.is_none() {
            drain_deadline = Some(Instant::now() + CONFIRM_DRAIN_TIMEOUT);
        }

        let next = match core.pop_retry() {
            Some(pending) => Some(pending),
            None => {
                let mut queue_rx = core.queue_rx.lock().await;
                if closing {
                    queue_rx.try_recv().ok()
                } else {
                    match tokio::time::timeout(QUEUE_POLL, queue_rx.recv()).await {
                        Ok(Some(pending)) => Some(pending),
                        _ => None,
                    }
                }
            }
        };

        match next {
            Some(entry) => {
                if let Some(limiter) = &core.rate_limiter {
                    limiter.acquire().await;
                }
                match lease
                    .channel()
                    .publish(&core.settings.exchange.name, &entry.message)
                    .await
                {
                    Ok(sequence) => {
                        core.stats_mut().published += 1;
                        *backoff = Duration::ZERO;
                        if core.settings.confirm_publishes {
                            pending.insert(sequence, entry);
                        } else {
                            core.stats_mut().confirmed += 1;
                            entry.resolve(PublishOutcome::Confirmed);
                        }
                    }
                    Err(e) => {
                        warn!(
                            "publish of {} failed: {}; re-queueing",
                            entry.message.correlation_id, e
                        );
                        core.push_retry(entry);
                        requeue_pending(core, pending);
                        return ServeExit::Broken;
                    }
                }
            }
            None if closing => {
                if pending.is_empty() {
                    return ServeExit::Drained;
                }
                if drain_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    warn!(
                        "closing with {} publishes still unconfirmed; failing them",
                        pending.len()
                    );
                    for (_, entry) in pending {
                        core.stats_mut().rejected += 1;
                        entry.resolve(PublishOutcome::Rejected(
                            "publisher closed before broker confirmation".to_string(),
                        ));
                    }
                    return ServeExit::Drained;
                }
                // Wait out the remaining confirms.
                match lease.channel().next_confirm(QUEUE_POLL).await {
                    Ok(Some(event)) => handle_confirm(core, &mut pending, event),
                    Ok(None) => {}
                    Err(e) => {
                        warn!("confirm read failed during drain: {}", e);
                        requeue_pending(core, pending);
                        return ServeExit::Broken;
                    }
                }
            }
            None => {}
        }
    }
}

fn handle_confirm(
    core: &PublisherCore,
    pending: &mut BTreeMap<u64, PendingPublish>,
    event: ConfirmEvent,
) {
    match event {
        ConfirmEvent::Ack { sequence, multiple } => {
            for entry in take_confirmed(pending, sequence, multiple) {
                core.stats_mut().confirmed += 1;
                entry.resolve(PublishOutcome::Confirmed);
            }
        }
        ConfirmEvent::Nack { sequence, multiple } => {
            for mut entry in take_confirmed(pending, sequence, multiple) {
                core.stats_mut().nacked += 1;
                entry.retries += 1;
                if entry.retries > core.settings.max_retry_count {
                    core.stats_mut().retry_exhausted += 1;
                    let attempts = entry.retries;
                    warn!(
                        "message {} nacked past retry budget",
                        entry.message.correlation_id
                    );
                    entry.resolve(PublishOutcome::RetryExhausted { attempts });
                } else {
                    core.push_retry(entry);
                }
            }
        }
    }
}

/// Remove the entries a confirm refers to; `multiple` covers every
/// outstanding sequence up to and including `sequence`
fn take_confirmed(
    pending: &mut BTreeMap<u64, PendingPublish>,
    sequence: u64,
    multiple: bool,
) -> Vec<PendingPublish> {
    if multiple {
        let rest = pending.split_off(&(sequence + 1));
        std::mem::replace(pending, rest).into_values().collect()
    } else {
        pending.remove(&sequence).into_iter().collect()
    }
}

/// Channel died with unconfirmed publishes outstanding: re-queue them for
/// a fresh channel (at-least-once; channel failures do not consume retry
/// budget)
fn requeue_pending(core: &PublisherCore, pending: BTreeMap<u64, PendingPublish>) {
    for (_, entry) in pending {
        core.push_retry(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrokerAddress, ClusterDescriptor, ExchangeSpec};
    use crate::memory::{ConfirmBehavior, MemoryBroker};

    fn pool(broker: &MemoryBroker) -> Arc<ConnectionPool> {
        let descriptor = ClusterDescriptor::new(
            "guest",
            "guest",
            "/",
            vec![BrokerAddress::new("node1", 5672)],
            false,
        )
        .unwrap();
        Arc::new(ConnectionPool::new(broker.connector(), descriptor, 8))
    }

    fn settings() -> PublisherSettings {
        PublisherSettings {
            concurrency: 1,
            max_buffer_size: 16,
            max_retry_count: 3,
            messages_per_second: None,
            confirm_publishes: true,
            exchange: ExchangeSpec::direct("ex"),
        }
    }

    #[tokio::test]
    async fn confirmed_publish_resolves_success() {
        let broker = MemoryBroker::new();
        let publisher = ReliablePublisher::new(settings(), pool(&broker)).unwrap();
        publisher.open().await.unwrap();

        let handle = publisher.enqueue(OutboundMessage::new("rk", b"t1".to_vec()));
        handle.outcome().await.unwrap();

        let stats = publisher.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.confirmed, 1);
        publisher.close().await;
    }

    #[tokio::test]
    async fn nack_consumes_retry_budget_then_succeeds() {
        let broker = MemoryBroker::new();
        broker.set_confirm_behavior(ConfirmBehavior::NackFirst(1)).await;
        let publisher = ReliablePublisher::new(settings(), pool(&broker)).unwrap();
        publisher.open().await.unwrap();

        let handle = publisher.enqueue(OutboundMessage::new("rk", b"t1".to_vec()));
        handle.outcome().await.unwrap();

        let stats = publisher.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.nacked, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.confirmed, 1);
        publisher.close().await;
    }

    #[tokio::test]
    async fn nacks_past_budget_resolve_retry_exhausted() {
        let broker = MemoryBroker::new();
        broker
            .set_confirm_behavior(ConfirmBehavior::NackFirst(u64::MAX))
            .await;
        let mut s = settings();
        s.max_retry_count = 2;
        let publisher = ReliablePublisher::new(s, pool(&broker)).unwrap();
        publisher.open().await.unwrap();

        let handle = publisher.enqueue(OutboundMessage::new("rk", b"t1".to_vec()));
        let err = handle.outcome().await.unwrap_err();
        assert!(matches!(
            err,
            TradewireError::PublishRetryExhausted { attempts: 3 }
        ));

        let stats = publisher.stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.retry_exhausted, 1);
        publisher.close().await;
    }

    #[tokio::test]
    async fn batched_ack_resolves_all_outstanding() {
        let broker = MemoryBroker::new();
        broker.set_confirm_behavior(ConfirmBehavior::AckBatched(3)).await;
        let publisher = ReliablePublisher::new(settings(), pool(&broker)).unwrap();
        publisher.open().await.unwrap();

        let handles: Vec<PublishHandle> = (0..3)
            .map(|i| publisher.enqueue(OutboundMessage::new("rk", vec![i])))
            .collect();
        for handle in handles {
            handle.outcome().await.unwrap();
        }
        assert_eq!(publisher.stats().confirmed, 3);
        publisher.close().await;
    }

    #[tokio::test]
    async fn unconfirmed_mode_resolves_on_handoff() {
        let broker = MemoryBroker::new();
        broker
            .set_confirm_behavior(ConfirmBehavior::NackFirst(u64::MAX))
            .await;
        let mut s = settings();
        s.confirm_publishes = false;
        let publisher = ReliablePublisher::new(s, pool(&broker)).unwrap();
        publisher.open().await.unwrap();

        // Broker-side rejection is invisible in unconfirmed mode.
        let handle = publisher.enqueue(OutboundMessage::new("rk", b"t1".to_vec()));
        handle.outcome().await.unwrap();
        publisher.close().await;
    }

    #[tokio::test]
    async fn closed_publisher_rejects_synchronously() {
        let broker = MemoryBroker::new();
        let publisher = ReliablePublisher::new(settings(), pool(&broker)).unwrap();
        let handle = publisher.enqueue(OutboundMessage::new("rk", Vec::new()));
        let err = handle.outcome().await.unwrap_err();
        assert!(matches!(err, TradewireError::PublishRejected(_)));
    }

    #[tokio::test]
    async fn transport_failure_retries_on_fresh_channel() {
        let broker = MemoryBroker::new();
        broker.fail_next_publishes(1).await;
        let publisher = ReliablePublisher::new(settings(), pool(&broker)).unwrap();
        publisher.open().await.unwrap();

        let handle = publisher.enqueue(OutboundMessage::new("rk", b"t1".to_vec()));
        // First publish attempt fails, the worker backs off ~1s, leases a
        // fresh channel and republishes.
        tokio::time::timeout(Duration::from_secs(5), handle.outcome())
            .await
            .expect("publish should retry within the backoff window")
            .unwrap();

        let stats = publisher.stats();
        assert_eq!(stats.confirmed, 1);
        assert_eq!(stats.requeued, 1);
        publisher.close().await;
    }
}
