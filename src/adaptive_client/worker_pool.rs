//! A resizable pool of worker tasks draining one bounded queue.
//!
//! Workers share the receiving half of the queue. Growing the pool spawns workers right away.
//! Shrinking only lowers the target: a worker retires after it finishes its current job, or at
//! once if it is idle, so in-flight work is never cut short.

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::FutureExt;
use parking_lot::Mutex;
use snafu::Snafu;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, oneshot, watch},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum PoolError {
    #[snafu(display("worker pool is shut down"))]
    Closed,

    #[snafu(display("job was abandoned before it completed"))]
    Abandoned,
}

struct Shared {
    queue: AsyncMutex<mpsc::Receiver<Job>>,
    core: AtomicUsize,
    max: AtomicUsize,
    live: AtomicUsize,
    active: AtomicUsize,
}

impl Shared {
    /// Takes one worker out of the live count if the pool is above its target.
    fn try_retire(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > self.core.load(Ordering::Acquire)).then(|| live - 1)
            })
            .is_ok()
    }
}

pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    shared: Arc<Shared>,
    workers: Mutex<JoinSet<()>>,
    resized: watch::Sender<usize>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Starts `size` workers (at least one) behind a queue holding up to `queue_capacity` jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(size: usize, queue_capacity: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (resized, _) = watch::channel(size);

        let pool = Self {
            sender,
            shared: Arc::new(Shared {
                queue: AsyncMutex::new(receiver),
                core: AtomicUsize::new(size),
                max: AtomicUsize::new(size),
                live: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
            }),
            workers: Mutex::new(JoinSet::new()),
            resized,
            shutdown: CancellationToken::new(),
        };
        pool.spawn_missing_workers();
        pool
    }

    /// Runs `job` on a worker and waits for its output.
    ///
    /// Waits for queue space when the queue is full. Dropping the returned future does not
    /// cancel a job that was already queued.
    pub async fn execute<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(job.await);
        });

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return ClosedSnafu.fail(),
            sent = self.sender.send(job) => sent.map_err(|_| PoolError::Closed)?,
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => AbandonedSnafu.fail(),
            output = rx => output.map_err(|_| PoolError::Abandoned),
        }
    }

    /// Sets the target number of workers.
    ///
    /// The upper bound is raised before the target so a growing pool never sees a target above
    /// its bound. Returns `false` if the size was already `size`.
    pub fn resize(&self, size: usize) -> bool {
        let size = size.max(1);
        if self.shutdown.is_cancelled() {
            return false;
        }
        if self.core_size() == size && self.max_size() == size {
            return false;
        }

        if size > self.max_size() {
            self.shared.max.store(size, Ordering::Release);
        }
        self.shared.core.store(size, Ordering::Release);
        self.shared.max.store(size, Ordering::Release);

        self.spawn_missing_workers();
        // Wakes idle workers so surplus ones retire.
        self.resized.send_replace(size);
        true
    }

    /// Target number of workers.
    pub fn core_size(&self) -> usize {
        self.shared.core.load(Ordering::Acquire)
    }

    /// Upper bound on the number of workers.
    pub fn max_size(&self) -> usize {
        self.shared.max.load(Ordering::Acquire)
    }

    /// Workers currently alive. Lags behind `core_size` while surplus workers finish their jobs.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Workers currently running a job.
    pub fn active_workers(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Stops every worker without waiting for queued or running jobs.
    ///
    /// Callers still waiting on [`WorkerPool::execute`] get [`PoolError::Abandoned`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.workers.lock().abort_all();
    }

    fn spawn_missing_workers(&self) {
        let mut workers = self.workers.lock();
        while workers.try_join_next().is_some() {}

        let target = self.core_size().min(self.max_size());
        let live = self.live_workers();
        for _ in live..target {
            self.shared.live.fetch_add(1, Ordering::AcqRel);
            workers.spawn(run_worker(
                Arc::clone(&self.shared),
                self.resized.subscribe(),
                self.shutdown.clone(),
            ));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("core_size", &self.core_size())
            .field("max_size", &self.max_size())
            .field("live_workers", &self.live_workers())
            .field("active_workers", &self.active_workers())
            .finish_non_exhaustive()
    }
}

async fn next_job(shared: &Shared) -> Option<Job> {
    shared.queue.lock().await.recv().await
}

async fn run_worker(
    shared: Arc<Shared>,
    mut resized: watch::Receiver<usize>,
    shutdown: CancellationToken,
) {
    loop {
        if shared.try_retire() {
            trace!(message = "Worker retired.");
            return;
        }

        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = resized.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break,
            },
            job = next_job(&shared) => match job {
                Some(job) => job,
                None => break,
            },
        };

        shared.active.fetch_add(1, Ordering::AcqRel);
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!(message = "Job panicked on a pool worker.");
        }
        shared.active.fetch_sub(1, Ordering::AcqRel);
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
}
