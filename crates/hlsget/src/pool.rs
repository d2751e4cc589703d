// Bounded map/reduce worker pool.
//
// A job supplies {dispatch, map, fail, reduce}; the pool supplies W workers
// fed from the dispatch stream and a retry queue, ticket-based termination
// and cooperative shutdown. Output order is unspecified; jobs that care
// reorder downstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::DownloadError;

/// Work item that carries its own retry budget.
pub trait Budgeted {
    fn retries_remaining(&self) -> u32;
    fn consume_retry(&mut self);
}

/// Progress notifications emitted while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolProgress {
    /// Number of tasks the dispatcher will produce in its first pass,
    /// announced exactly once so a progress UI can size itself.
    Total(usize),
    /// One task completed successfully.
    Tick,
}

/// A job the pool can run: produce tasks, work them, handle exhaustion,
/// fold the outputs.
#[async_trait]
pub trait MapReduceJob: Send + Sync + 'static {
    type Task: Budgeted + Send + 'static;
    type Output: Send + 'static;
    type Reduced: Send + 'static;

    /// Start producing tasks. Returns the task stream and a channel carrying
    /// the total task count, emitted exactly once before the first task.
    fn dispatch(self: Arc<Self>) -> (flume::Receiver<Self::Task>, flume::Receiver<usize>);

    /// Perform one unit of work. A retryable error asks the pool to
    /// reschedule while the task still has budget.
    async fn map(&self, task: &Self::Task) -> Result<Vec<Self::Output>, DownloadError>;

    /// Called once a task has exhausted its retries. May synthesize a
    /// replacement task (e.g. the same segment aimed at another origin).
    async fn fail(&self, task: Self::Task) -> Option<Self::Task>;

    /// Invoked once, after all work has drained, with the accumulated
    /// outputs in arbitrary order.
    async fn reduce(&self, outputs: Vec<Self::Output>) -> Result<Self::Reduced, DownloadError>;
}

/// Counts outstanding units of work and wakes waiters when they drain.
#[derive(Debug, Default)]
pub struct PendingCounter {
    count: AtomicI64,
    drained: Notify,
}

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) <= 1 {
            self.drained.notify_waiters();
        }
    }

    pub fn outstanding(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Resolve once the count reaches zero. Counts that were never raised
    /// resolve immediately.
    pub async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.count.load(Ordering::Acquire) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Shared termination state: tickets cover every task visible to a worker
/// (queued retries included); `dispatch_done` flips when the dispatch
/// stream is exhausted.
#[derive(Debug, Default)]
struct PoolState {
    tickets: AtomicI64,
    dispatch_done: AtomicBool,
    notify: Notify,
}

impl PoolState {
    fn charge(&self) {
        self.tickets.fetch_add(1, Ordering::AcqRel);
    }

    fn settle(&self) {
        if self.tickets.fetch_sub(1, Ordering::AcqRel) <= 1 {
            self.notify.notify_waiters();
        }
    }

    fn dispatch_finished(&self) {
        self.dispatch_done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn drained(&self) {
        loop {
            let notified = self.notify.notified();
            if self.dispatch_done.load(Ordering::Acquire)
                && self.tickets.load(Ordering::Acquire) <= 0
            {
                return;
            }
            notified.await;
        }
    }
}

/// Run a job to completion on `config.workers` workers.
///
/// Terminates once the dispatch stream is exhausted and every ticket has
/// drained: each produced task resolves by emitting outputs, being
/// rescheduled (which charges a new ticket) or being dropped by `fail`.
pub async fn run_job<J: MapReduceJob>(
    job: Arc<J>,
    config: &PoolConfig,
    progress: Option<mpsc::UnboundedSender<PoolProgress>>,
    token: CancellationToken,
) -> Result<J::Reduced, DownloadError> {
    let started = Instant::now();
    let state = Arc::new(PoolState::default());
    let stop = token.child_token();

    let (task_rx, total_rx) = Arc::clone(&job).dispatch();
    let (work_tx, work_rx) = flume::bounded::<J::Task>(config.dispatch_queue_depth);
    // The retry queue is unbounded: workers push to it while also being its
    // only consumers, so a bounded queue could wedge the whole pool.
    let (retry_tx, retry_rx) = flume::unbounded::<J::Task>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<J::Output>();

    // Forward dispatch into the work queue, charging the ticket before the
    // task becomes visible so shutdown can never race a queued task.
    let forwarder = {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok(task) = task_rx.recv_async().await {
                state.charge();
                if work_tx.send_async(task).await.is_err() {
                    break;
                }
            }
            state.dispatch_finished();
        })
    };

    let announce = {
        let progress = progress.clone();
        tokio::spawn(async move {
            if let Ok(total) = total_rx.recv_async().await {
                info!(total, "job dispatched");
                if let Some(progress) = progress {
                    let _ = progress.send(PoolProgress::Total(total));
                }
            }
        })
    };

    let mut workers = Vec::with_capacity(config.workers);
    for _ in 0..config.workers {
        let job = Arc::clone(&job);
        let state = Arc::clone(&state);
        let stop = stop.clone();
        let work_rx = work_rx.clone();
        let retry_rx = retry_rx.clone();
        let retry_tx = retry_tx.clone();
        let out_tx = out_tx.clone();
        let progress = progress.clone();
        workers.push(tokio::spawn(worker_loop(
            job, state, stop, work_rx, retry_rx, retry_tx, out_tx, progress,
        )));
    }
    drop(out_tx);
    drop(retry_tx);
    drop(work_rx);
    drop(retry_rx);

    tokio::select! {
        _ = token.cancelled() => {
            stop.cancel();
            forwarder.abort();
            announce.abort();
            for worker in workers {
                let _ = worker.await;
            }
            return Err(DownloadError::Cancelled);
        }
        _ = state.drained() => {}
    }

    stop.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    let _ = forwarder.await;
    let _ = announce.await;

    let mut outputs = Vec::new();
    while let Some(output) = out_rx.recv().await {
        outputs.push(output);
    }
    info!(
        elapsed = ?started.elapsed(),
        outputs = outputs.len(),
        "all tasks drained, reducing"
    );
    job.reduce(outputs).await
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop<J: MapReduceJob>(
    job: Arc<J>,
    state: Arc<PoolState>,
    stop: CancellationToken,
    work_rx: flume::Receiver<J::Task>,
    retry_rx: flume::Receiver<J::Task>,
    retry_tx: flume::Sender<J::Task>,
    out_tx: mpsc::UnboundedSender<J::Output>,
    progress: Option<mpsc::UnboundedSender<PoolProgress>>,
) {
    let mut dispatch_open = true;
    loop {
        let task = if dispatch_open {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                task = retry_rx.recv_async() => task.ok(),
                task = work_rx.recv_async() => match task {
                    Ok(task) => Some(task),
                    Err(_) => {
                        dispatch_open = false;
                        continue;
                    }
                },
            }
        } else {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                task = retry_rx.recv_async() => task.ok(),
            }
        };
        let Some(mut task) = task else { break };

        // Trap panics from the download path and treat them as one more
        // transient failure.
        let result = match std::panic::AssertUnwindSafe(job.map(&task))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DownloadError::internal("map panicked")),
        };

        match result {
            Ok(outputs) => {
                for output in outputs {
                    let _ = out_tx.send(output);
                }
                if let Some(progress) = &progress {
                    let _ = progress.send(PoolProgress::Tick);
                }
                state.settle();
            }
            Err(error) if error.is_retryable() && task.retries_remaining() > 0 => {
                task.consume_retry();
                debug!(%error, left = task.retries_remaining(), "rescheduling task");
                state.charge();
                let _ = retry_tx.send(task);
                state.settle();
            }
            Err(error) => {
                warn!(%error, "task exhausted its retries");
                if let Some(replacement) = job.fail(task).await {
                    state.charge();
                    let _ = retry_tx.send(replacement);
                }
                state.settle();
            }
        }
    }
}
