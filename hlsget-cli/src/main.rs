mod input;

use std::path::{Path, PathBuf};

use clap::Parser;
use hlsget_engine::{DownloadConfig, DownloadError, HlsDownloader, IvPolicy, PoolProgress, VideoMeta};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use mimalloc::MiMalloc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Concurrent HLS (m3u8) video downloader.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// A `<m3u8-url>;<title>` pair, or a path to a file of such lines.
    input: String,

    /// Directory the final `.mp4` files are written to.
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Concurrent segment downloads.
    #[arg(short = 'n', long, default_value_t = 24)]
    concurrency: usize,

    /// Retries per segment before failing over.
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// Alternate playlist URL used to rescue segments the primary origin
    /// cannot serve.
    #[arg(long)]
    backup_url: Option<String>,

    /// Derive the AES IV from the segment sequence number instead of
    /// reusing the key bytes.
    #[arg(long)]
    iv_from_sequence: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(error) = run(args).await {
        error!(%error, "fatal");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), DownloadError> {
    let mut config = DownloadConfig::default();
    config.pool.workers = args.concurrency;
    config.pool.max_task_retries = args.retries;
    if args.iv_from_sequence {
        config.iv_policy = IvPolicy::SequenceNumber;
    }

    let inputs = if args.input.starts_with("http") {
        vec![args.input.clone()]
    } else {
        input::load_urls(Path::new(&args.input))?
    };

    let total = inputs.len();
    for (at, line) in inputs.iter().enumerate() {
        info!("processing {}/{}: {}", at + 1, total, line);
        let meta = match parse_meta(line) {
            Ok(meta) => meta,
            Err(error) => {
                warn!(%error, "skipping input");
                continue;
            }
        };

        let (backup_tx, backup_rx) = oneshot::channel();
        match &args.backup_url {
            Some(url) => {
                let _ = backup_tx.send(url.clone());
            }
            // Dropping the sender tells the job there is no backup.
            None => drop(backup_tx),
        }

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let bar = tokio::spawn(draw_progress(progress_rx));

        match HlsDownloader::run(
            meta,
            args.output_dir.clone(),
            config.clone(),
            backup_rx,
            Some(progress_tx),
        )
        .await
        {
            Ok(summary) => {
                if summary.dropped.is_empty() {
                    info!(output = %summary.output.display(), "done");
                } else {
                    warn!(
                        output = %summary.output.display(),
                        dropped = ?summary.dropped,
                        "finished with gaps"
                    );
                }
            }
            // One failed job does not abort the rest of the list.
            Err(error) => error!(%error, input = %line, "download failed"),
        }
        let _ = bar.await;
    }
    Ok(())
}

async fn draw_progress(mut progress_rx: mpsc::UnboundedReceiver<PoolProgress>) {
    let bar = ProgressBar::hidden();
    let style = ProgressStyle::with_template("[{bar:30}] {pos}/{len} segments {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style.progress_chars("=> "));
    while let Some(event) = progress_rx.recv().await {
        match event {
            PoolProgress::Total(total) => {
                bar.set_length(total as u64);
                bar.set_draw_target(ProgressDrawTarget::stderr());
            }
            PoolProgress::Tick => bar.inc(1),
        }
    }
    bar.finish_and_clear();
}

/// `<m3u8-url>;<title>` becomes a [`VideoMeta`] keyed by the hash of the
/// manifest URL.
fn parse_meta(line: &str) -> Result<VideoMeta, DownloadError> {
    if !line.contains(".m3u8") {
        return Err(DownloadError::invalid_url(
            line,
            "only direct m3u8 inputs are supported",
        ));
    }
    let (url, title) = line
        .split_once(';')
        .ok_or_else(|| DownloadError::invalid_url(line, "expected `<m3u8-url>;<title>`"))?;
    if title.trim().is_empty() {
        return Err(DownloadError::invalid_url(line, "empty title"));
    }
    Ok(VideoMeta::from_manifest_url(url.trim(), title.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_from_url_title_pair() {
        let meta = parse_meta("https://cdn.example.com/v/index.m3u8;My Clip").unwrap();
        assert_eq!(meta.m3u8_url, "https://cdn.example.com/v/index.m3u8");
        assert_eq!(meta.title, "My Clip");
        assert_eq!(meta.video_id.len(), 8);
    }

    #[test]
    fn rejects_inputs_without_manifest_or_title() {
        assert!(parse_meta("https://cdn.example.com/v/page.html;x").is_err());
        assert!(parse_meta("https://cdn.example.com/v/index.m3u8").is_err());
        assert!(parse_meta("https://cdn.example.com/v/index.m3u8; ").is_err());
    }
}
