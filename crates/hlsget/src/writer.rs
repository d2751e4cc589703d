// Segment writer: serializes an unordered stream of (index, bytes) into a
// small number of contiguous on-disk range files, then concatenates them.
//
// Range files are named `<start>_<end>.ts` for the half-open interval
// [start, end). A fresh writer rescans its directory, which is what makes an
// interrupted download resumable at segment granularity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::error::DownloadError;

const MERGE_FILE: &str = "merge.ts";

/// Half-open index interval `[start, end)` materialized as one range file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeRange {
    pub start: u64,
    pub end: u64,
}

impl MergeRange {
    pub fn file_name(&self) -> String {
        format!("{}_{}.ts", self.start, self.end)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index < self.end
    }
}

/// Sorted, pairwise-disjoint set of materialized intervals.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    ranges: Vec<MergeRange>,
}

impl RangeSet {
    pub fn contains(&self, index: u64) -> bool {
        let at = self.ranges.partition_point(|range| range.end <= index);
        self.ranges.get(at).is_some_and(|range| range.contains(index))
    }

    /// Insert at the position that keeps the set sorted by start. Callers
    /// only ever insert intervals disjoint from every member.
    fn insert(&mut self, range: MergeRange) {
        let at = self.ranges.partition_point(|existing| existing.start < range.start);
        self.ranges.insert(at, range);
    }

    pub fn iter(&self) -> impl Iterator<Item = &MergeRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_range_name(name: &str) -> Option<MergeRange> {
    let stem = name.strip_suffix(".ts")?;
    let (start, end) = stem.split_once('_')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = end.parse().ok()?;
    (start < end).then_some(MergeRange { start, end })
}

fn scan_ranges(dir: &Path) -> Result<RangeSet, DownloadError> {
    let mut set = RangeSet::default();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(range) = parse_range_name(name) {
            set.insert(range);
        }
    }
    Ok(set)
}

struct SegmentData {
    index: u64,
    data: Bytes,
}

pub struct SegmentWriter {
    base_dir: PathBuf,
    recovered: RangeSet,
    tx: Mutex<Option<mpsc::Sender<SegmentData>>>,
    ingest: Mutex<Option<JoinHandle<IngestState>>>,
}

impl SegmentWriter {
    /// Scan `base_dir` for range files left by an earlier run and start the
    /// ingest loop.
    pub fn spawn(base_dir: impl Into<PathBuf>, config: WriterConfig) -> Result<Self, DownloadError> {
        let base_dir = base_dir.into();
        let recovered = scan_ranges(&base_dir)?;
        if !recovered.is_empty() {
            info!(ranges = recovered.len(), "recovered range files from a previous run");
        }

        let (tx, rx) = mpsc::channel(64);
        let state = IngestState {
            base_dir: base_dir.clone(),
            config,
            segments: recovered.clone(),
            buffer: BTreeMap::new(),
            bytes_since_merge: 0,
        };
        let ingest = tokio::spawn(run_ingest(state, rx));
        Ok(Self {
            base_dir,
            recovered,
            tx: Mutex::new(Some(tx)),
            ingest: Mutex::new(Some(ingest)),
        })
    }

    /// True iff some range file covered `index` when the writer was opened.
    /// The dispatcher snapshots existence before any new merges happen, so
    /// the ingest loop's later inserts are deliberately not visible here.
    pub fn check_exists(&self, index: u64) -> bool {
        self.recovered.contains(index)
    }

    /// Queue one completed segment for merging.
    pub async fn write(&self, index: u64, data: Bytes) -> Result<(), DownloadError> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| DownloadError::writer("writer already flushed"))?;
        tx.send(SegmentData { index, data })
            .await
            .map_err(|_| DownloadError::writer("ingest loop is gone"))
    }

    /// Stop the ingest loop, run one final merge pass and concatenate every
    /// range file in ascending order into `merge.ts`.
    ///
    /// Indices never handed to the writer leave a gap in the output; the
    /// file is still produced.
    pub async fn flush(&self) -> Result<PathBuf, DownloadError> {
        // Dropping the sender closes the channel and stops the loop.
        self.tx.lock().take();
        let ingest = self
            .ingest
            .lock()
            .take()
            .ok_or_else(|| DownloadError::writer("writer already flushed"))?;
        let state = ingest
            .await
            .map_err(|e| DownloadError::writer(format!("ingest loop failed: {e}")))?;

        let merge_path = self.base_dir.join(MERGE_FILE);
        let mut out = BufWriter::new(File::create(&merge_path).await?);
        for range in state.segments.iter() {
            let mut part = File::open(self.base_dir.join(range.file_name())).await?;
            tokio::io::copy(&mut part, &mut out).await?;
        }
        out.flush().await?;
        info!(
            ranges = state.segments.len(),
            merged = %merge_path.display(),
            "flushed segment writer"
        );
        Ok(merge_path)
    }
}

struct IngestState {
    base_dir: PathBuf,
    config: WriterConfig,
    segments: RangeSet,
    buffer: BTreeMap<u64, Bytes>,
    bytes_since_merge: usize,
}

impl IngestState {
    /// Write every maximal consecutive run in the buffer to its own range
    /// file. With `skip_small`, runs shorter than `min_run_len` stay
    /// buffered for a later pass; runs are judged independently, so a long
    /// run may flush while a short one behind a gap stays behind.
    async fn merge_buffered(&mut self, skip_small: bool) -> Result<(), DownloadError> {
        let before = self.buffer.len();
        if before == 0 {
            return Ok(());
        }
        let indices: Vec<u64> = self.buffer.keys().copied().collect();
        let mut start = indices[0];
        let mut end = start + 1;
        for &index in &indices[1..] {
            if index == end {
                end += 1;
                continue;
            }
            self.write_run(start, end, skip_small).await?;
            start = index;
            end = start + 1;
        }
        self.write_run(start, end, skip_small).await?;
        debug!(
            merged = before - self.buffer.len(),
            buffered = self.buffer.len(),
            "merge pass"
        );
        Ok(())
    }

    /// Materialize the run `[start, end)` as one range file. Buffer entries
    /// are only removed after the file is fully written, so a failed write
    /// loses nothing.
    async fn write_run(&mut self, start: u64, end: u64, skip_small: bool) -> Result<(), DownloadError> {
        if skip_small && end - start < self.config.min_run_len {
            return Ok(());
        }
        let range = MergeRange { start, end };
        let path = self.base_dir.join(range.file_name());
        let mut out = BufWriter::new(File::create(&path).await?);
        for index in start..end {
            if let Some(data) = self.buffer.get(&index) {
                out.write_all(data).await?;
            }
        }
        out.flush().await?;
        for index in start..end {
            self.buffer.remove(&index);
        }
        self.segments.insert(range);
        Ok(())
    }
}

async fn run_ingest(mut state: IngestState, mut rx: mpsc::Receiver<SegmentData>) -> IngestState {
    let mut ticker = tokio::time::interval(state.config.merge_tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_merge = Instant::now();

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(SegmentData { index, data }) = received else { break };
                state.bytes_since_merge += data.len();
                if state.buffer.insert(index, data).is_some() {
                    warn!(index, "segment delivered twice, keeping the newer bytes");
                }
                if state.bytes_since_merge >= state.config.buffer_threshold_bytes
                    && state.buffer.len() > 1
                {
                    if let Err(error) = state.merge_buffered(true).await {
                        warn!(%error, "merge pass failed, segments stay buffered");
                    }
                    state.bytes_since_merge = 0;
                    last_merge = Instant::now();
                }
            }
            _ = ticker.tick() => {
                if state.buffer.len() > 1
                    && last_merge.elapsed() > state.config.idle_flush_after
                {
                    if let Err(error) = state.merge_buffered(false).await {
                        warn!(%error, "idle merge pass failed, segments stay buffered");
                    }
                    state.bytes_since_merge = 0;
                    last_merge = Instant::now();
                }
            }
        }
    }

    // Final pass so flush sees every buffered index.
    if let Err(error) = state.merge_buffered(false).await {
        warn!(%error, "final merge pass failed");
    }
    state
}
