// Drives the worker pool and the segment writer together, without any
// network: a stub job serves segment bytes from memory, flaking where the
// scenario demands, and the assertions check the on-disk layout and the
// final concatenation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use hlsget_engine::{
    Budgeted, DownloadError, MapReduceJob, PoolConfig, SegmentWriter, WriterConfig,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct FakeTask {
    index: u64,
    budget: u32,
}

impl Budgeted for FakeTask {
    fn retries_remaining(&self) -> u32 {
        self.budget
    }
    fn consume_retry(&mut self) {
        self.budget -= 1;
    }
}

/// Serves per-index payloads, failing each index the planned number of
/// times first. Successful payloads go straight to a real segment writer.
struct FakeOrigin {
    payloads: HashMap<u64, Bytes>,
    failures_planned: HashMap<u64, u32>,
    attempts: parking_lot::Mutex<HashMap<u64, u32>>,
    fetches: AtomicU32,
    writer: SegmentWriter,
}

impl FakeOrigin {
    fn new(writer: SegmentWriter, count: u64) -> Self {
        let payloads = (1..=count)
            .map(|index| (index, Bytes::from(format!("<segment {index}>"))))
            .collect();
        Self {
            payloads,
            failures_planned: HashMap::new(),
            attempts: parking_lot::Mutex::new(HashMap::new()),
            fetches: AtomicU32::new(0),
            writer,
        }
    }
}

#[async_trait]
impl MapReduceJob for FakeOrigin {
    type Task = FakeTask;
    type Output = u64;
    type Reduced = Vec<u64>;

    fn dispatch(self: Arc<Self>) -> (flume::Receiver<FakeTask>, flume::Receiver<usize>) {
        let (task_tx, task_rx) = flume::bounded(16);
        let (total_tx, total_rx) = flume::bounded(1);
        let job = self;
        tokio::spawn(async move {
            let pending: Vec<u64> = job
                .payloads
                .keys()
                .copied()
                .filter(|&index| !job.writer.check_exists(index))
                .collect();
            let _ = total_tx.send(pending.len());
            for index in pending {
                let _ = task_tx.send_async(FakeTask { index, budget: 5 }).await;
            }
        });
        (task_rx, total_rx)
    }

    async fn map(&self, task: &FakeTask) -> Result<Vec<u64>, DownloadError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let attempt = attempts.entry(task.index).or_insert(0);
            *attempt += 1;
            *attempt
        };
        let planned = self.failures_planned.get(&task.index).copied().unwrap_or(0);
        if attempt <= planned {
            return Err(DownloadError::segment_fetch("HTTP 500", true));
        }
        let data = self.payloads[&task.index].clone();
        self.writer.write(task.index, data).await?;
        Ok(vec![task.index])
    }

    async fn fail(&self, _task: FakeTask) -> Option<FakeTask> {
        None
    }

    async fn reduce(&self, mut outputs: Vec<u64>) -> Result<Vec<u64>, DownloadError> {
        outputs.sort_unstable();
        Ok(outputs)
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        workers: 6,
        max_task_retries: 5,
        dispatch_queue_depth: 16,
    }
}

fn writer_in(dir: &Path) -> SegmentWriter {
    SegmentWriter::spawn(dir, WriterConfig::default()).unwrap()
}

#[tokio::test]
async fn clean_run_merges_into_one_range_file() {
    let dir = tempfile::tempdir().unwrap();
    let job = Arc::new(FakeOrigin::new(writer_in(dir.path()), 3));

    let done = hlsget_engine::pool::run_job(
        Arc::clone(&job),
        &pool_config(),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(done, vec![1, 2, 3]);

    let merged = job.writer.flush().await.unwrap();
    assert!(dir.path().join("1_4.ts").is_file());
    let bytes = std::fs::read(merged).unwrap();
    assert_eq!(bytes, b"<segment 1><segment 2><segment 3>");
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut origin = FakeOrigin::new(writer_in(dir.path()), 3);
    // Segment 2 returns HTTP 500 four times, then succeeds.
    origin.failures_planned.insert(2, 4);
    let job = Arc::new(origin);

    let done = hlsget_engine::pool::run_job(
        Arc::clone(&job),
        &pool_config(),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(done, vec![1, 2, 3]);
    assert_eq!(job.attempts.lock()[&2], 5);

    let merged = job.writer.flush().await.unwrap();
    assert!(dir.path().join("1_4.ts").is_file());
    let bytes = std::fs::read(merged).unwrap();
    assert_eq!(bytes, b"<segment 1><segment 2><segment 3>");
}

#[tokio::test]
async fn exhausted_segment_leaves_a_gap_but_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut origin = FakeOrigin::new(writer_in(dir.path()), 3);
    origin.failures_planned.insert(2, u32::MAX);
    let job = Arc::new(origin);

    let done = hlsget_engine::pool::run_job(
        Arc::clone(&job),
        &pool_config(),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(done, vec![1, 3]);

    let merged = job.writer.flush().await.unwrap();
    assert!(dir.path().join("1_2.ts").is_file());
    assert!(dir.path().join("3_4.ts").is_file());
    let bytes = std::fs::read(merged).unwrap();
    assert_eq!(bytes, b"<segment 1><segment 3>");
}

#[tokio::test]
async fn second_run_skips_materialized_segments() {
    let dir = tempfile::tempdir().unwrap();

    {
        let job = Arc::new(FakeOrigin::new(writer_in(dir.path()), 3));
        hlsget_engine::pool::run_job(
            Arc::clone(&job),
            &pool_config(),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        job.writer.flush().await.unwrap();
        std::fs::remove_file(dir.path().join("merge.ts")).unwrap();
    }

    // A fresh writer over the same directory recovers 1_4.ts, so dispatch
    // finds nothing to do.
    let job = Arc::new(FakeOrigin::new(writer_in(dir.path()), 3));
    let done = hlsget_engine::pool::run_job(
        Arc::clone(&job),
        &pool_config(),
        None,
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(done.is_empty());
    assert_eq!(job.fetches.load(Ordering::Relaxed), 0);

    let merged = job.writer.flush().await.unwrap();
    let bytes = std::fs::read(merged).unwrap();
    assert_eq!(bytes, b"<segment 1><segment 2><segment 3>");
}
