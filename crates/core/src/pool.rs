//! Fixed-size worker pool with blocking handoff.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    tokio::sync::Notify,
    tracing::{debug, error, warn},
};

use crate::error::{Result, SchedulerError};

/// A unit of work handed to the pool.
pub type WorkerTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Execution slots for fired jobs. The dispatcher reserves capacity with
/// [`block_for_available_workers`](WorkerPool::block_for_available_workers)
/// before acquiring triggers, then hands each run shell to
/// [`run`](WorkerPool::run).
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Hand a task to a worker, blocking until one is free. During shutdown
    /// the task still runs, on one extra task outside the fixed set. Returns
    /// false only if the pool could not take the task at all.
    async fn run(&self, task: WorkerTask) -> Result<bool>;

    /// Block until at least one worker is free and no handoff is in flight;
    /// returns the free count. The next [`run`](Self::run) from the same
    /// caller is then guaranteed not to block behind other consumers.
    async fn block_for_available_workers(&self) -> Result<usize>;

    /// Stop accepting work. With `wait_for_jobs`, drain busy workers first.
    async fn shutdown(&self, wait_for_jobs: bool);

    fn size(&self) -> usize;
}

#[derive(Debug)]
struct PoolState {
    available: usize,
    busy: usize,
    handoff_pending: bool,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<PoolState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The standard pool: `size` slots, eagerly available, transitions under one
/// lock. Worker bodies run as tokio tasks; a panicking task is logged and
/// its slot returned.
#[derive(Debug, Clone)]
pub struct FixedWorkerPool {
    size: usize,
    shared: Arc<Shared>,
}

impl FixedWorkerPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            size,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    available: size,
                    busy: 0,
                    handoff_pending: false,
                    shutdown: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.shared.lock().available
    }

    /// Run the task on its own tokio task, catching panics so a broken job
    /// cannot leak a worker slot.
    fn spawn_worker(&self, task: WorkerTask) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(task).await {
                error!(error = %e, "worker task panicked");
            }
            {
                let mut state = shared.lock();
                state.busy -= 1;
                state.available += 1;
            }
            shared.notify.notify_waiters();
        });
    }

    /// One extra worker for a handoff caught by shutdown. `busy` still
    /// counts it so a draining shutdown waits for it, but the slot is not
    /// returned to `available`.
    fn spawn_extra_worker(&self, task: WorkerTask) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(task).await {
                error!(error = %e, "one-shot worker task panicked");
            }
            {
                let mut state = shared.lock();
                state.busy -= 1;
            }
            debug!("one-shot shutdown worker finished");
            shared.notify.notify_waiters();
        });
    }
}

#[async_trait]
impl WorkerPool for FixedWorkerPool {
    async fn run(&self, task: WorkerTask) -> Result<bool> {
        self.shared.lock().handoff_pending = true;
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                if state.shutdown {
                    // Last handoff during shutdown: run on an extra task.
                    state.handoff_pending = false;
                    state.busy += 1;
                    drop(state);
                    warn!("pool shutting down; running task on an extra worker");
                    self.spawn_extra_worker(task);
                    self.shared.notify.notify_waiters();
                    return Ok(true);
                }
                if state.available > 0 {
                    state.available -= 1;
                    state.busy += 1;
                    state.handoff_pending = false;
                    drop(state);
                    self.spawn_worker(task);
                    self.shared.notify.notify_waiters();
                    return Ok(true);
                }
            }
            notified.await;
        }
    }

    async fn block_for_available_workers(&self) -> Result<usize> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let state = self.shared.lock();
                if state.shutdown {
                    return Ok(0);
                }
                if state.available > 0 && !state.handoff_pending {
                    return Ok(state.available);
                }
            }
            notified.await;
        }
    }

    async fn shutdown(&self, wait_for_jobs: bool) {
        self.shared.lock().shutdown = true;
        self.shared.notify.notify_waiters();
        if wait_for_jobs {
            loop {
                let notified = self.shared.notify.notified();
                if self.shared.lock().busy == 0 {
                    break;
                }
                notified.await;
            }
        }
        debug!("worker pool shut down");
    }

    fn size(&self) -> usize {
        self.size
    }
}

/// Pool with no workers. Only useful for a scheduler instance that manages
/// definitions but is never started.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroSizeWorkerPool;

#[async_trait]
impl WorkerPool for ZeroSizeWorkerPool {
    async fn run(&self, _task: WorkerTask) -> Result<bool> {
        Err(SchedulerError::Unsupported(
            "zero-size worker pool cannot run tasks",
        ))
    }

    async fn block_for_available_workers(&self) -> Result<usize> {
        Err(SchedulerError::Unsupported(
            "zero-size worker pool has no workers",
        ))
    }

    async fn shutdown(&self, _wait_for_jobs: bool) {}

    fn size(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_runs_tasks_and_returns_slots() {
        let p = FixedWorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            p.run(Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }
        p.shutdown(true).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(p.available(), 2);
    }

    #[tokio::test]
    async fn test_block_for_available_returns_count() {
        let p = FixedWorkerPool::new(3);
        assert_eq!(p.block_for_available_workers().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_run_blocks_until_worker_free() {
        let p = FixedWorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        p.run(Box::pin(async move {
            let _ = release_rx.await;
        }))
        .await
        .unwrap();

        // Second task must wait for the first to finish.
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let p2 = p.clone();
        let submit = tokio::spawn(async move {
            p2.run(Box::pin(async move {
                d.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!submit.is_finished(), "run should block while pool is full");

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), submit)
            .await
            .expect("run should unblock")
            .unwrap();
        p.shutdown(true).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_handoff_runs_on_extra_worker() {
        let p = FixedWorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        p.run(Box::pin(async move {
            let _ = release_rx.await;
        }))
        .await
        .unwrap();

        // Pool is full and shutting down; the handoff must still run.
        p.shared.lock().shutdown = true;
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let accepted = p
            .run(Box::pin(async move {
                r.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        assert!(accepted);

        release_tx.send(()).unwrap();
        p.shutdown(true).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_returns_slot() {
        let p = FixedWorkerPool::new(1);
        p.run(Box::pin(async {
            panic!("job blew up");
        }))
        .await
        .unwrap();
        // The slot must come back despite the panic.
        let n = tokio::time::timeout(Duration::from_secs(2), p.block_for_available_workers())
            .await
            .expect("slot should be returned")
            .unwrap();
        assert_eq!(n, 1);
        p.shutdown(true).await;
    }

    #[tokio::test]
    async fn test_zero_size_pool_is_unsupported() {
        let p = ZeroSizeWorkerPool;
        assert!(matches!(
            p.block_for_available_workers().await,
            Err(SchedulerError::Unsupported(_))
        ));
        assert!(matches!(
            p.run(Box::pin(async {})).await,
            Err(SchedulerError::Unsupported(_))
        ));
    }
}
