//! Independent response-timeout watchdog
//!
//! Observes sends and completions independently of the data path. Each
//! registered correlation id carries a deadline held in an explicit
//! min-heap; one maintenance tick task evicts expired entries and delivers
//! exactly one timeout notification per evicted id through the shared
//! worker pool. The whole component is a no-op when the response timeout
//! feature is disabled.

use crate::worker_pool::{WorkerGuard, WorkerPool};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

/// Maintenance tick period
const TICK: Duration = Duration::from_millis(500);

/// Listener notified when a request times out without a response
pub trait TimeoutListener: Send + Sync {
    /// Called once per timed-out correlation id
    fn on_timeout(&self, correlation_id: &str);
}

#[derive(Default)]
struct MonitorState {
    /// (deadline, generation, id) min-heap; stale entries are skipped when
    /// their generation no longer matches `by_id`
    deadlines: BinaryHeap<Reverse<(Instant, u64, String)>>,
    /// Live correlation ids and the generation of their current entry
    by_id: HashMap<String, u64>,
}

struct MonitorShared {
    timeout: Duration,
    state: std::sync::Mutex<MonitorState>,
    listener: std::sync::Mutex<Option<Arc<dyn TimeoutListener>>>,
    worker_pool: WorkerPool,
    generation: AtomicU64,
}

impl MonitorShared {
    fn state_mut(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().expect("timeout monitor lock poisoned")
    }

    fn expire_due(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut state = self.state_mut();
            while let Some(Reverse((deadline, generation, id))) = state.deadlines.peek().cloned() {
                if deadline > now {
                    break;
                }
                state.deadlines.pop();
                if state.by_id.get(&id) == Some(&generation) {
                    state.by_id.remove(&id);
                    expired.push(id);
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        let listener = self
            .listener
            .lock()
            .expect("timeout listener lock poisoned")
            .clone();
        for id in expired {
            debug!("response timeout for correlation id {}", id);
            if let Some(listener) = listener.clone() {
                self.worker_pool.dispatch(move || listener.on_timeout(&id));
            }
        }
    }
}

/// Watchdog firing timeout notifications for unanswered requests
pub struct ResponseTimeoutMonitor {
    shared: Option<Arc<MonitorShared>>,
    shutdown_tx: std::sync::Mutex<Option<broadcast::Sender<()>>>,
    tick_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    guard: std::sync::Mutex<Option<WorkerGuard>>,
}

impl ResponseTimeoutMonitor {
    /// Create a monitor; `None` disables the feature entirely
    pub fn new(timeout: Option<Duration>, worker_pool: WorkerPool) -> Self {
        Self {
            shared: timeout.map(|timeout| {
                Arc::new(MonitorShared {
                    timeout,
                    state: std::sync::Mutex::new(MonitorState::default()),
                    listener: std::sync::Mutex::new(None),
                    worker_pool,
                    generation: AtomicU64::new(0),
                })
            }),
            shutdown_tx: std::sync::Mutex::new(None),
            tick_task: tokio::sync::Mutex::new(None),
            guard: std::sync::Mutex::new(None),
        }
    }

    /// Register the timeout listener
    pub fn set_listener(&self, listener: Arc<dyn TimeoutListener>) {
        if let Some(shared) = &self.shared {
            *shared
                .listener
                .lock()
                .expect("timeout listener lock poisoned") = Some(listener);
        }
    }

    /// Start the maintenance tick task
    pub async fn open(&self) {
        let Some(shared) = &self.shared else {
            return;
        };
        let mut tick_task = self.tick_task.lock().await;
        if tick_task.is_some() {
            return;
        }
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *self
            .shutdown_tx
            .lock()
            .expect("timeout shutdown lock poisoned") = Some(shutdown_tx);
        *self.guard.lock().expect("timeout guard lock poisoned") =
            Some(shared.worker_pool.attach());

        let shared = shared.clone();
        *tick_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            loop {
                tokio::select! {
                    _ = interval.tick() => shared.expire_due(),
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("timeout monitor tick task stopped");
        }));
        info!("timeout monitor opened");
    }

    /// Stop the maintenance tick task
    pub async fn close(&self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("timeout shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
        if let Some(task) = self.tick_task.lock().await.take() {
            let _ = task.await;
        }
        self.guard
            .lock()
            .expect("timeout guard lock poisoned")
            .take();
    }

    /// Track a sent request; a timeout fires if no completion arrives
    /// within the configured window
    pub fn on_sent(&self, correlation_id: &str) {
        let Some(shared) = &self.shared else {
            return;
        };
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst);
        let deadline = Instant::now() + shared.timeout;
        let mut state = shared.state_mut();
        state.by_id.insert(correlation_id.to_string(), generation);
        state
            .deadlines
            .push(Reverse((deadline, generation, correlation_id.to_string())));
    }

    /// A response arrived; suppress the timeout
    pub fn on_response_received(&self, correlation_id: &str) {
        if let Some(shared) = &self.shared {
            shared.state_mut().by_id.remove(correlation_id);
        }
    }

    /// The publish failed; a timeout would be spurious, suppress it
    pub fn on_publish_failure(&self, correlation_id: &str) {
        if let Some(shared) = &self.shared {
            shared.state_mut().by_id.remove(correlation_id);
        }
    }

    /// Number of requests currently awaiting a response
    pub fn pending_count(&self) -> usize {
        self.shared
            .as_ref()
            .map(|shared| shared.state_mut().by_id.len())
            .unwrap_or(0)
    }
}
