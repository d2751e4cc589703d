//! Concurrent HLS (HTTP Live Streaming) VOD downloader engine.
//!
//! Given a playlist URL, the engine parses the manifest (descending master
//! playlists to their last variant), fetches and decrypts every media
//! segment through a bounded map/reduce worker pool, and assembles the
//! segments into a single file via crash-resumable on-disk range files.
//! Segments that exhaust the primary origin can be replayed against a
//! backup playlist delivered mid-run.

pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod http;
pub mod meta;
pub mod playlist;
pub mod pool;
pub mod writer;

pub use config::{DownloadConfig, HttpConfig, IvPolicy, PoolConfig, WriterConfig};
pub use download::{DownloadSummary, HlsDownloader, KeySelection, SegmentTask, TaskOrigin};
pub use error::DownloadError;
pub use meta::VideoMeta;
pub use playlist::{PlaylistView, Segment};
pub use pool::{Budgeted, MapReduceJob, PendingCounter, PoolProgress};
pub use writer::SegmentWriter;
