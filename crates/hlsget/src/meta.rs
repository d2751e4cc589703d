use std::io::Cursor;

/// Metadata for one video, as handed over by an upstream extractor or the
/// `<m3u8-url>;<title>` input form.
#[derive(Debug, Clone)]
pub struct VideoMeta {
    /// Page URL the manifest was discovered on.
    pub url: String,
    /// Hex-encoded 32-bit MurmurHash3 of the manifest URL. Keys the per-job
    /// tmp directory so concurrent jobs never collide.
    pub video_id: String,
    /// Final filename stem.
    pub title: String,
    pub m3u8_url: String,
}

impl VideoMeta {
    /// Build metadata straight from a manifest URL, for inputs that skip the
    /// extractor step.
    pub fn from_manifest_url(m3u8_url: impl Into<String>, title: impl Into<String>) -> Self {
        let m3u8_url = m3u8_url.into();
        Self {
            url: m3u8_url.clone(),
            video_id: video_id(&m3u8_url),
            title: title.into(),
            m3u8_url,
        }
    }
}

pub fn video_id(m3u8_url: &str) -> String {
    let digest = murmur3::murmur3_32(&mut Cursor::new(m3u8_url.as_bytes()), 0)
        .expect("reading from an in-memory cursor cannot fail");
    hex::encode(digest.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_id_is_stable_and_hex() {
        let id = video_id("https://cdn.example.com/vod/playlist.m3u8");
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, video_id("https://cdn.example.com/vod/playlist.m3u8"));
    }

    #[test]
    fn distinct_urls_get_distinct_ids() {
        assert_ne!(
            video_id("https://a.example.com/x.m3u8"),
            video_id("https://b.example.com/x.m3u8")
        );
    }

    #[test]
    fn from_manifest_url_fills_every_field() {
        let meta = VideoMeta::from_manifest_url("https://cdn.example.com/v/index.m3u8", "clip");
        assert_eq!(meta.url, meta.m3u8_url);
        assert_eq!(meta.title, "clip");
        assert_eq!(meta.video_id, video_id(&meta.m3u8_url));
    }
}
