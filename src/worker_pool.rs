//! Shared callback worker pool
//!
//! Listener callbacks (response, timeout, publish-failure) run here instead
//! of on the I/O path, so a slow application callback never blocks broker
//! reads. The pool is reference-counted across every producer/consumer
//! attached to one cluster: the first attach spawns the runner tasks, the
//! last detach stops them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolCore {
    job_tx: mpsc::UnboundedSender<Job>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

struct PoolState {
    attachments: usize,
    core: Option<PoolCore>,
}

struct PoolInner {
    workers: usize,
    state: Mutex<PoolState>,
}

/// Reference-counted pool of callback runner tasks
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Attachment to the pool; dropping the last guard stops the runners
pub struct WorkerGuard {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool that will run `workers` runner tasks while attached
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                workers: workers.max(1),
                state: Mutex::new(PoolState {
                    attachments: 0,
                    core: None,
                }),
            }),
        }
    }

    /// Attach a component; spawns the runners on the first attachment
    pub fn attach(&self) -> WorkerGuard {
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        state.attachments += 1;
        if state.core.is_none() {
            let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
            let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
            let mut handles = Vec::with_capacity(self.inner.workers);
            for id in 0..self.inner.workers {
                let job_rx = job_rx.clone();
                handles.push(tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = job_rx.lock().await;
                            rx.recv().await
                        };
                        match job {
                            Some(job) => run_job(job),
                            None => break,
                        }
                    }
                    debug!("callback worker {} stopped", id);
                }));
            }
            state.core = Some(PoolCore { job_tx, handles });
            debug!("worker pool opened with {} runners", self.inner.workers);
        }
        WorkerGuard {
            inner: self.inner.clone(),
        }
    }

    /// Run a callback on the pool
    ///
    /// Falls back to running inline when no component is attached, so a
    /// notification is never lost across shutdown races.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        let boxed: Job = Box::new(job);
        let state = self.inner.state.lock().expect("worker pool lock poisoned");
        let boxed = if let Some(core) = &state.core {
            match core.job_tx.send(boxed) {
                Ok(()) => return,
                Err(err) => err.0,
            }
        } else {
            boxed
        };
        drop(state);
        debug!("worker pool not attached, running callback inline");
        run_job(boxed);
    }

    /// Number of currently attached components
    pub fn attachments(&self) -> usize {
        self.inner.state.lock().expect("worker pool lock poisoned").attachments
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("worker pool lock poisoned");
        state.attachments = state.attachments.saturating_sub(1);
        if state.attachments == 0 {
            // Dropping the sender lets the runners drain queued jobs and exit.
            if let Some(core) = state.core.take() {
                drop(core.job_tx);
                drop(core.handles);
                debug!("worker pool closed");
            }
        }
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("listener callback panicked; continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_runs_jobs_off_caller() {
        let pool = WorkerPool::new(2);
        let _guard = pool.attach();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.dispatch(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[tracing_test::traced_test]
    async fn panicking_job_does_not_kill_runner() {
        let pool = WorkerPool::new(1);
        let _guard = pool.attach();
        let counter = Arc::new(AtomicUsize::new(0));

        pool.dispatch(|| panic!("listener blew up"));
        let c = counter.clone();
        pool.dispatch(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(logs_contain("listener callback panicked"));
    }

    #[tokio::test]
    async fn refcount_opens_once_and_closes_on_last_detach() {
        let pool = WorkerPool::new(1);
        let first = pool.attach();
        let second = pool.attach();
        assert_eq!(pool.attachments(), 2);

        drop(first);
        assert_eq!(pool.attachments(), 1);
        drop(second);
        assert_eq!(pool.attachments(), 0);

        // Detached pool still delivers callbacks, inline.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.dispatch(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
