// Download job: the worker pool plugged into playlist parsing, segment
// decryption and the segment writer, with per-segment failover to a backup
// origin delivered mid-run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DownloadConfig;
use crate::crypto;
use crate::error::DownloadError;
use crate::http::HttpClient;
use crate::meta::VideoMeta;
use crate::playlist::{PlaylistParser, PlaylistView, Segment, host_v2};
use crate::pool::{self, Budgeted, MapReduceJob, PendingCounter, PoolProgress};
use crate::writer::SegmentWriter;

const FFMPEG: &str = if cfg!(windows) { "ffmpeg.exe" } else { "ffmpeg" };

/// Which origin a task is currently aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOrigin {
    Primary,
    Backup,
}

/// Key material a task decrypts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelection {
    /// The primary view's key.
    Default,
    /// An explicit key, set when the task was redirected at the backup
    /// origin.
    Override([u8; 16]),
    /// No decryption. Init segments are plain regardless of origin.
    Plain,
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub struct SegmentTask {
    pub segment: Segment,
    pub max_retry: u32,
    pub key: KeySelection,
    pub origin: TaskOrigin,
}

impl Budgeted for SegmentTask {
    fn retries_remaining(&self) -> u32 {
        self.max_retry
    }

    fn consume_retry(&mut self) {
        self.max_retry = self.max_retry.saturating_sub(1);
    }
}

#[derive(Debug, Clone)]
struct BackupView {
    host: String,
    key: Option<[u8; 16]>,
}

/// Shared failover state. The mutex is held only for short, non-async
/// critical sections.
#[derive(Debug, Default)]
struct FailoverState {
    fail_list: Vec<Segment>,
    backup: Option<BackupView>,
}

#[derive(Debug)]
pub struct DownloadSummary {
    pub output: PathBuf,
    /// Indices that exhausted every origin and were left out of the output.
    pub dropped: Vec<u64>,
    pub remuxed: bool,
}

pub struct HlsDownloader {
    meta: VideoMeta,
    output_dir: PathBuf,
    config: DownloadConfig,
    http: HttpClient,
    primary: PlaylistView,
    failover: Mutex<FailoverState>,
    writer: SegmentWriter,
    /// Primary segments not yet succeeded or escalated through `fail`. The
    /// fail-list pass in dispatch waits on this before consulting the
    /// backup view.
    primary_outstanding: PendingCounter,
}

impl HlsDownloader {
    /// Run one download job to completion.
    ///
    /// `backup_rx` may deliver, at most once, an alternate playlist URL used
    /// to retry segments that exhausted the primary origin. Dropping the
    /// sender simply means no backup for this run.
    pub async fn run(
        meta: VideoMeta,
        output_dir: impl Into<PathBuf>,
        config: DownloadConfig,
        backup_rx: oneshot::Receiver<String>,
        progress: Option<mpsc::UnboundedSender<PoolProgress>>,
    ) -> Result<DownloadSummary, DownloadError> {
        let output_dir = output_dir.into();
        let output = output_dir.join(format!("{}.mp4", meta.title));
        if output.exists() {
            info!(output = %output.display(), "output already exists, skipping download");
            return Ok(DownloadSummary {
                output,
                dropped: Vec::new(),
                remuxed: false,
            });
        }

        let tmp_dir = std::env::temp_dir().join(&meta.video_id);
        std::fs::create_dir_all(&tmp_dir)?;
        debug!(tmp = %tmp_dir.display(), "job directory ready");

        let referer = Url::parse(&meta.m3u8_url).ok().map(|url| host_v2(&url));
        let http = HttpClient::new(&config.http, referer.as_deref())?;
        let primary = PlaylistParser::new(&http).parse(&meta.m3u8_url).await?;
        let writer = SegmentWriter::spawn(&tmp_dir, config.writer.clone())?;

        let pool_config = config.pool.clone();
        let job = Arc::new(Self {
            meta,
            output_dir,
            config,
            http,
            primary,
            failover: Mutex::new(FailoverState::default()),
            writer,
            primary_outstanding: PendingCounter::new(),
        });

        let listener = tokio::spawn(Arc::clone(&job).listen_for_backup(backup_rx));
        let result = pool::run_job(job, &pool_config, progress, CancellationToken::new()).await;
        // The job is settled; a backup URL arriving now has nothing to rescue.
        listener.abort();
        result
    }

    async fn listen_for_backup(self: Arc<Self>, backup_rx: oneshot::Receiver<String>) {
        let Ok(url) = backup_rx.await else { return };
        info!(url = %url, "received backup playlist URL");
        match PlaylistParser::new(&self.http).parse(&url).await {
            Ok(view) => {
                let mut failover = self.failover.lock();
                if failover.backup.is_some() {
                    warn!("backup view already populated, ignoring");
                    return;
                }
                failover.backup = Some(BackupView {
                    host: view.host,
                    key: view.key,
                });
            }
            Err(error) => warn!(%error, "failed to parse backup playlist"),
        }
    }

    fn primary_task(&self, segment: Segment) -> SegmentTask {
        let key = if segment.is_init {
            KeySelection::Plain
        } else {
            KeySelection::Default
        };
        SegmentTask {
            segment,
            max_retry: self.config.pool.max_task_retries,
            key,
            origin: TaskOrigin::Primary,
        }
    }

    /// Rewrite a segment at the backup origin with a fresh retry budget.
    fn backup_task(&self, mut segment: Segment, backup: &BackupView) -> SegmentTask {
        segment.url_prefix = backup.host.clone();
        let key = match (segment.is_init, backup.key) {
            (true, _) | (false, None) => KeySelection::Plain,
            (false, Some(key)) => KeySelection::Override(key),
        };
        SegmentTask {
            segment,
            max_retry: self.config.pool.max_task_retries,
            key,
            origin: TaskOrigin::Backup,
        }
    }

    fn effective_key(&self, task: &SegmentTask) -> Option<[u8; 16]> {
        match &task.key {
            KeySelection::Default => self.primary.key,
            KeySelection::Override(key) => Some(*key),
            KeySelection::Plain => None,
        }
    }
}

#[async_trait]
impl MapReduceJob for HlsDownloader {
    type Task = SegmentTask;
    type Output = ();
    type Reduced = DownloadSummary;

    fn dispatch(self: Arc<Self>) -> (flume::Receiver<SegmentTask>, flume::Receiver<usize>) {
        let (task_tx, task_rx) = flume::bounded(self.config.pool.dispatch_queue_depth);
        let (total_tx, total_rx) = flume::bounded(1);
        let job = self;

        tokio::spawn(async move {
            let pending: Vec<Segment> = job
                .primary
                .segments
                .iter()
                .filter(|segment| !job.writer.check_exists(segment.index))
                .cloned()
                .collect();
            let _ = total_tx.send(pending.len());
            info!(
                total = pending.len(),
                materialized = job.primary.segments.len() - pending.len(),
                "dispatching segment tasks"
            );

            for segment in pending {
                job.primary_outstanding.add(1);
                if task_tx.send_async(job.primary_task(segment)).await.is_err() {
                    return;
                }
            }

            // Rendezvous with the backup path: only after every primary
            // segment has succeeded or escalated may the fail list be
            // replayed against the backup origin.
            job.primary_outstanding.drained().await;

            let redirects: Vec<SegmentTask> = {
                let failover = job.failover.lock();
                if failover.fail_list.is_empty() {
                    return;
                }
                match failover.backup.as_ref().filter(|backup| backup.key.is_some()) {
                    Some(backup) => {
                        info!(
                            failed = failover.fail_list.len(),
                            backup = %backup.host,
                            "replaying failed segments against the backup origin"
                        );
                        failover
                            .fail_list
                            .iter()
                            .map(|segment| job.backup_task(segment.clone(), backup))
                            .collect()
                    }
                    None => {
                        warn!(
                            failed = failover.fail_list.len(),
                            "no backup available, failed segments will be missing from the output"
                        );
                        return;
                    }
                }
            };
            for task in redirects {
                if task_tx.send_async(task).await.is_err() {
                    return;
                }
            }
        });

        (task_rx, total_rx)
    }

    async fn map(&self, task: &SegmentTask) -> Result<Vec<()>, DownloadError> {
        let url = task.segment.url();
        let body = self.http.fetch_segment(&url).await?;

        let data = match self.effective_key(task) {
            Some(key) => {
                let iv = crypto::derive_iv(self.config.iv_policy, &key, task.segment.index);
                crypto::trim_to_sync_byte(crypto::decrypt(body, &key, &iv)?)
            }
            None => body,
        };

        self.writer.write(task.segment.index, data).await?;
        if task.origin == TaskOrigin::Primary {
            self.primary_outstanding.done();
        }
        Ok(Vec::new())
    }

    async fn fail(&self, task: SegmentTask) -> Option<SegmentTask> {
        let replacement = {
            let mut failover = self.failover.lock();
            match task.origin {
                TaskOrigin::Backup => {
                    warn!(
                        index = task.segment.index,
                        "segment failed on both origins, giving up"
                    );
                    None
                }
                TaskOrigin::Primary => {
                    match failover.backup.as_ref().filter(|backup| backup.key.is_some()) {
                        Some(backup) => {
                            debug!(
                                index = task.segment.index,
                                "redirecting exhausted segment at the backup origin"
                            );
                            Some(self.backup_task(task.segment.clone(), backup))
                        }
                        None => {
                            debug!(index = task.segment.index, "recording failed segment");
                            failover.fail_list.push(task.segment.clone());
                            None
                        }
                    }
                }
            }
        };
        if task.origin == TaskOrigin::Primary {
            self.primary_outstanding.done();
        }
        replacement
    }

    async fn reduce(&self, _outputs: Vec<()>) -> Result<DownloadSummary, DownloadError> {
        let merged = self.writer.flush().await?;
        let dropped: Vec<u64> = {
            let failover = self.failover.lock();
            failover.fail_list.iter().map(|s| s.index).collect()
        };
        if !dropped.is_empty() {
            warn!(?dropped, "segments missing from the final file");
        }

        let output = self.output_dir.join(format!("{}.mp4", self.meta.title));
        let remuxed = match find_ffmpeg() {
            Some(ffmpeg) => {
                remux(&ffmpeg, &merged, &output).await?;
                true
            }
            None => {
                warn!(
                    "ffmpeg not found on PATH, renaming the raw concatenation; \
                     container conformance is not guaranteed"
                );
                rename_across(&merged, &output).await?;
                false
            }
        };

        info!(output = %output.display(), remuxed, "download complete");
        Ok(DownloadSummary {
            output,
            dropped,
            remuxed,
        })
    }
}

fn find_ffmpeg() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(FFMPEG))
        .find(|candidate| candidate.is_file())
}

/// Stream-copy the merged transport stream into an MP4 container.
async fn remux(ffmpeg: &Path, merged: &Path, output: &Path) -> Result<(), DownloadError> {
    info!("remuxing with ffmpeg");
    let status = tokio::process::Command::new(ffmpeg)
        .arg("-i")
        .arg(merged)
        .arg("-c")
        .arg("copy")
        .arg(output)
        .stdout(std::process::Stdio::null())
        .status()
        .await
        .map_err(|e| DownloadError::remux(format!("failed to launch ffmpeg: {e}")))?;
    if !status.success() {
        return Err(DownloadError::remux(format!("ffmpeg exited with {status}")));
    }
    tokio::fs::remove_file(merged).await?;
    Ok(())
}

/// `rename` first; tmp and the output directory commonly live on different
/// filesystems, where a copy is required.
async fn rename_across(from: &Path, to: &Path) -> Result<(), DownloadError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
