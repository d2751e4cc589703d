// Manifest parser: turns one media playlist (following master playlists down
// to their last variant) into an ordered segment list plus optional AES key.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};
use url::Url;

use crate::error::DownloadError;
use crate::http::HttpClient;

static KEY_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"#EXT-X-KEY.*URI="(.*?)""#).unwrap());
static MAP_URI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"#EXT-X-MAP.*URI="(.*?)""#).unwrap());

/// One media chunk referenced by an `#EXTINF` entry (or the `#EXT-X-MAP`
/// init object). Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 1-based position in playlist order.
    pub index: u64,
    /// Absolute base URL, no trailing slash.
    pub url_prefix: String,
    /// File name relative to `url_prefix`.
    pub url_last: String,
    /// fMP4 init object: fetched like any segment but never decrypted.
    pub is_init: bool,
}

impl Segment {
    pub fn url(&self) -> String {
        format!("{}/{}", self.url_prefix, self.url_last)
    }
}

/// Parsed form of one media playlist.
#[derive(Debug, Clone)]
pub struct PlaylistView {
    /// Scheme + authority + directory of the playlist URL; base for
    /// relative URIs.
    pub host: String,
    pub segments: Vec<Segment>,
    /// AES-128 key fetched from `#EXT-X-KEY`, when the playlist is encrypted.
    pub key: Option<[u8; 16]>,
}

/// Scheme + authority + directory of the path, no trailing slash.
pub fn host_v1(url: &Url) -> String {
    let path = url.path();
    let dir = match path.rfind('/') {
        Some(at) => &path[..at],
        None => "",
    };
    format!("{}://{}{}", url.scheme(), url.authority(), dir)
}

/// Scheme + authority only. Sent as the `Referer` on every fetch.
pub fn host_v2(url: &Url) -> String {
    format!("{}://{}", url.scheme(), url.authority())
}

fn file_name(url: &Url) -> String {
    url.path()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_owned()
}

#[derive(Debug, Default)]
struct ScannedPlaylist {
    segments: Vec<Segment>,
    key_uri: Option<String>,
    streams: Vec<String>,
}

/// Line scanner over one playlist body.
///
/// Recognizes `#EXTINF`, `#EXT-X-STREAM-INF`, `#EXT-X-KEY` and `#EXT-X-MAP`;
/// every other tag is ignored. `expect_*` flags are one-shot: the next
/// non-tag line is consumed as the pending URI.
fn scan(text: &str, host: &str) -> Result<ScannedPlaylist, DownloadError> {
    let mut out = ScannedPlaylist::default();
    let mut expect_segment = false;
    let mut expect_stream_uri = false;
    let mut index = 0u64;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if !line.starts_with('#') {
            if expect_stream_uri {
                expect_stream_uri = false;
                if line.starts_with("http") {
                    out.streams.push(line.to_owned());
                } else {
                    out.streams.push(format!("{host}/{line}"));
                }
            } else if expect_segment {
                expect_segment = false;
                index += 1;
                out.segments.push(resolve_segment(line, host, index, false)?);
            }
            continue;
        }

        if line.starts_with("#EXT-X-KEY") && line.contains("URI") {
            let uri = KEY_URI_RE
                .captures(line)
                .and_then(|captures| captures.get(1))
                .ok_or_else(|| DownloadError::playlist(format!("no key URI in `{line}`")))?;
            out.key_uri = Some(uri.as_str().to_owned());
        } else if line.starts_with("#EXTINF:") {
            expect_segment = true;
        } else if line.starts_with("#EXT-X-STREAM-INF:") {
            expect_stream_uri = true;
        } else if line.starts_with("#EXT-X-MAP") && line.contains("URI") {
            let uri = MAP_URI_RE
                .captures(line)
                .and_then(|captures| captures.get(1))
                .ok_or_else(|| DownloadError::playlist(format!("no init URI in `{line}`")))?;
            index += 1;
            out.segments
                .push(resolve_segment(uri.as_str(), host, index, true)?);
        }
    }

    Ok(out)
}

fn resolve_segment(
    uri: &str,
    host: &str,
    index: u64,
    is_init: bool,
) -> Result<Segment, DownloadError> {
    if uri.starts_with("http") {
        let url = Url::parse(uri)
            .map_err(|e| DownloadError::playlist(format!("bad segment URI `{uri}`: {e}")))?;
        Ok(Segment {
            index,
            url_prefix: host_v1(&url),
            url_last: file_name(&url),
            is_init,
        })
    } else {
        Ok(Segment {
            index,
            url_prefix: host.to_owned(),
            url_last: uri.to_owned(),
            is_init,
        })
    }
}

pub struct PlaylistParser<'a> {
    http: &'a HttpClient,
}

impl<'a> PlaylistParser<'a> {
    pub fn new(http: &'a HttpClient) -> Self {
        Self { http }
    }

    /// Fetch and parse `m3u8_url` into a [`PlaylistView`].
    ///
    /// A master playlist descends into its last-listed variant (highest
    /// bitrate by the convention of this format); variants contain `#EXTINF`
    /// entries, so the descent terminates.
    pub async fn parse(&self, m3u8_url: &str) -> Result<PlaylistView, DownloadError> {
        let mut target = m3u8_url.to_owned();
        loop {
            let url = Url::parse(&target)
                .map_err(|e| DownloadError::invalid_url(&target, e.to_string()))?;
            let host = host_v1(&url);
            let body = self.http.fetch_text(&target, "playlist fetch").await?;
            let scanned = scan(&body, &host)?;

            if let Some(variant) = scanned.streams.last() {
                debug!(variant = %variant, "master playlist, descending into last variant");
                target = variant.clone();
                continue;
            }

            let key = match &scanned.key_uri {
                Some(uri) => Some(self.fetch_key(uri, &host).await?),
                None => None,
            };
            info!(
                segments = scanned.segments.len(),
                encrypted = key.is_some(),
                "parsed media playlist"
            );
            return Ok(PlaylistView {
                host,
                segments: scanned.segments,
                key,
            });
        }
    }

    async fn fetch_key(&self, uri: &str, host: &str) -> Result<[u8; 16], DownloadError> {
        let key_url = if uri.starts_with("http") {
            uri.to_owned()
        } else {
            format!("{host}/{uri}")
        };
        let bytes = self.http.fetch_key(&key_url).await?;
        <[u8; 16]>::try_from(bytes.as_ref()).map_err(|_| {
            DownloadError::playlist(format!(
                "key from {key_url} has length {} (expected 16)",
                bytes.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "https://cdn.example.com/vod";

    #[test]
    fn host_forms() {
        let url = Url::parse("https://cdn.example.com:8443/vod/hd/index.m3u8").unwrap();
        assert_eq!(host_v1(&url), "https://cdn.example.com:8443/vod/hd");
        assert_eq!(host_v2(&url), "https://cdn.example.com:8443");
    }

    #[test]
    fn relative_segments_inherit_the_host() {
        let body = "#EXTM3U\n#EXTINF:4.0,\na.ts\n#EXTINF:4.0,\nb.ts\n#EXT-X-ENDLIST\n";
        let scanned = scan(body, HOST).unwrap();
        assert_eq!(scanned.segments.len(), 2);
        assert_eq!(scanned.segments[0].index, 1);
        assert_eq!(scanned.segments[0].url_prefix, HOST);
        assert_eq!(scanned.segments[0].url_last, "a.ts");
        assert_eq!(scanned.segments[1].index, 2);
        assert_eq!(
            scanned.segments[1].url(),
            "https://cdn.example.com/vod/b.ts"
        );
    }

    #[test]
    fn absolute_segments_are_split_into_prefix_and_name() {
        let body = "#EXTINF:4.0,\nhttps://mirror.example.net/stash/chunk7.ts\n";
        let scanned = scan(body, HOST).unwrap();
        let segment = &scanned.segments[0];
        assert_eq!(segment.url_prefix, "https://mirror.example.net/stash");
        assert_eq!(segment.url_last, "chunk7.ts");
        assert_eq!(segment.url(), "https://mirror.example.net/stash/chunk7.ts");
    }

    #[test]
    fn init_map_becomes_index_one() {
        let body = concat!(
            "#EXT-X-MAP:URI=\"init.mp4\"\n",
            "#EXTINF:4.0,\nseg1.m4s\n",
            "#EXTINF:4.0,\nseg2.m4s\n",
        );
        let scanned = scan(body, HOST).unwrap();
        let indices: Vec<u64> = scanned.segments.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(scanned.segments[0].is_init);
        assert_eq!(scanned.segments[0].url_last, "init.mp4");
        assert!(!scanned.segments[1].is_init);
    }

    #[test]
    fn master_playlist_collects_variants() {
        let body = concat!(
            "#EXT-X-STREAM-INF:BANDWIDTH=800000\n",
            "low/index.m3u8\n",
            "#EXT-X-STREAM-INF:BANDWIDTH=2500000\n",
            "https://cdn.example.com/vod/high/index.m3u8\n",
        );
        let scanned = scan(body, HOST).unwrap();
        assert!(scanned.segments.is_empty());
        assert_eq!(
            scanned.streams,
            vec![
                "https://cdn.example.com/vod/low/index.m3u8",
                "https://cdn.example.com/vod/high/index.m3u8",
            ]
        );
    }

    #[test]
    fn key_uri_is_captured_by_regex() {
        let body = "#EXT-X-KEY:METHOD=AES-128,URI=\"enc.key\"\n#EXTINF:4.0,\na.ts\n";
        let scanned = scan(body, HOST).unwrap();
        assert_eq!(scanned.key_uri.as_deref(), Some("enc.key"));
    }

    #[test]
    fn key_tag_without_capturable_uri_is_fatal() {
        let body = "#EXT-X-KEY:METHOD=AES-128,URI=broken\n";
        let err = scan(body, HOST).unwrap_err();
        assert!(matches!(err, DownloadError::Playlist { .. }));
    }

    #[test]
    fn unknown_tags_between_extinf_and_uri_are_skipped() {
        let body = concat!(
            "#EXTINF:4.0,\n",
            "#EXT-X-PROGRAM-DATE-TIME:2024-01-01T00:00:00Z\n",
            "a.ts\n",
        );
        let scanned = scan(body, HOST).unwrap();
        assert_eq!(scanned.segments.len(), 1);
        assert_eq!(scanned.segments[0].url_last, "a.ts");
    }

    #[test]
    fn indices_are_contiguous_from_one() {
        let body = "#EXTINF:4,\na.ts\n#EXTINF:4,\nb.ts\n#EXTINF:4,\nc.ts\n";
        let scanned = scan(body, HOST).unwrap();
        for (at, segment) in scanned.segments.iter().enumerate() {
            assert_eq!(segment.index, at as u64 + 1);
        }
    }
}
