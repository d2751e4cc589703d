use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("segment fetch error: {reason}")]
    SegmentFetch { reason: String, retryable: bool },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("segment writer error: {reason}")]
    Writer { reason: String },

    #[error("remux error: {reason}")]
    Remux { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn segment_fetch(reason: impl Into<String>, retryable: bool) -> Self {
        Self::SegmentFetch {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn writer(reason: impl Into<String>) -> Self {
        Self::Writer {
            reason: reason.into(),
        }
    }

    pub fn remux(reason: impl Into<String>) -> Self {
        Self::Remux {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether the pool may reschedule a task that failed with this error.
    ///
    /// Transport failures, short bodies and decrypt mismatches are transient;
    /// parse errors, 4xx statuses on playlist resources and local filesystem
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. }
            | Self::Playlist { .. }
            | Self::Writer { .. }
            | Self::Remux { .. }
            | Self::Io { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::SegmentFetch { retryable, .. } => *retryable,
            Self::Network { .. } | Self::Decryption { .. } | Self::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_fetch_carries_retryability() {
        assert!(DownloadError::segment_fetch("HTTP 500", true).is_retryable());
        assert!(!DownloadError::segment_fetch("unsupported", false).is_retryable());
    }

    #[test]
    fn decrypt_mismatch_is_transient() {
        assert!(DownloadError::decryption("length not a multiple of 16").is_retryable());
    }

    #[test]
    fn playlist_errors_are_fatal() {
        assert!(!DownloadError::playlist("no key URI").is_retryable());
        assert!(
            !DownloadError::http_status(StatusCode::NOT_FOUND, "http://a/k.key", "key fetch")
                .is_retryable()
        );
    }
}
