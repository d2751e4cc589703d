// HTTP fetcher: one shared client per job, carrying the browser-style
// request surface every origin expects.

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tracing::trace;

use crate::config::HttpConfig;
use crate::error::DownloadError;

pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    /// Build a client with the configured user agent, a hard per-request
    /// timeout and, when given, a `Referer` pinned to the manifest's origin.
    pub fn new(config: &HttpConfig, referer: Option<&str>) -> Result<Self, DownloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        if let Ok(value) = HeaderValue::from_str(&config.accept_language) {
            headers.insert(header::ACCEPT_LANGUAGE, value);
        }
        if let Some(referer) = referer
            && let Ok(value) = HeaderValue::from_str(referer)
        {
            headers.insert(header::REFERER, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client })
    }

    /// GET one media segment.
    ///
    /// A completion is valid iff the status is 200, the body is non-empty and
    /// at least as long as any advertised `Content-Length`. Everything else
    /// is a transient failure the pool may retry.
    pub async fn fetch_segment(&self, url: &str) -> Result<Bytes, DownloadError> {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                return Err(DownloadError::segment_fetch(
                    format!("transport error for {url}: {e}"),
                    true,
                ));
            }
        };

        if response.status() != StatusCode::OK {
            return Err(DownloadError::segment_fetch(
                format!("HTTP {} for {url}", response.status()),
                true,
            ));
        }

        let advertised = response.content_length();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                return Err(DownloadError::segment_fetch(
                    format!("body read failed for {url}: {e}"),
                    true,
                ));
            }
        };

        if body.is_empty() {
            return Err(DownloadError::segment_fetch(
                format!("empty body for {url}"),
                true,
            ));
        }
        if let Some(expected) = advertised
            && (body.len() as u64) < expected
        {
            return Err(DownloadError::segment_fetch(
                format!("short body for {url}: {} of {expected} bytes", body.len()),
                true,
            ));
        }

        trace!(url, bytes = body.len(), "fetched segment");
        Ok(body)
    }

    /// GET a playlist body as text. Any failure here is fatal to the parse.
    pub async fn fetch_text(
        &self,
        url: &str,
        operation: &'static str,
    ) -> Result<String, DownloadError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, url, operation));
        }
        Ok(response.text().await?)
    }

    /// GET raw key bytes. Any non-200 status fails the parse.
    pub async fn fetch_key(&self, url: &str) -> Result<Bytes, DownloadError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(DownloadError::http_status(status, url, "key fetch"));
        }
        Ok(response.bytes().await?)
    }
}
