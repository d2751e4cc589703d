use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_13_6) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.88 Safari/537.36";

/// IV selection for AES-128-CBC segment decryption.
///
/// The playlists this tool targets never carry an `IV=` attribute on their
/// `#EXT-X-KEY` tags; their servers reuse the key bytes as the IV.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IvPolicy {
    /// Reuse the 16 key bytes as the IV.
    #[default]
    KeyAsIv,
    /// Big-endian segment index in the low 8 IV bytes (RFC 8216 behavior
    /// when the key tag specifies no IV).
    SequenceNumber,
}

/// HTTP request surface shared by playlist, key and segment fetches.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Total per-request timeout (default: 10s).
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            accept_language: "zh-CN,zh;q=0.9, en;q=0.8, de;q=0.7, *;q=0.5".to_owned(),
        }
    }
}

/// Worker pool sizing and retry budget.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Concurrent workers (default: 24).
    pub workers: usize,
    /// Retries granted to each task before it escalates to `fail` (default: 5).
    pub max_task_retries: u32,
    /// Depth of the dispatch queue between the producer and the workers
    /// (default: 128).
    pub dispatch_queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 24,
            max_task_retries: 5,
            dispatch_queue_depth: 128,
        }
    }
}

/// Buffer-flush policy of the segment writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Buffered bytes that trigger an eager merge pass (default: 40 MiB).
    pub buffer_threshold_bytes: usize,
    /// Period of the background merge timer (default: 10s).
    pub merge_tick: Duration,
    /// A timer tick merges only when no merge happened for this long
    /// (default: 30s).
    pub idle_flush_after: Duration,
    /// Consecutive runs shorter than this stay buffered during an eager
    /// (`skip_small`) pass (default: 10).
    pub min_run_len: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            buffer_threshold_bytes: 40 * 1024 * 1024,
            merge_tick: Duration::from_secs(10),
            idle_flush_after: Duration::from_secs(30),
            min_run_len: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadConfig {
    pub http: HttpConfig,
    pub pool: PoolConfig,
    pub writer: WriterConfig,
    pub iv_policy: IvPolicy,
}
