pub mod csv;

use crate::http::build_client_with_timeout;
use crate::models::{SourceDescriptor, SourceKind};
use crate::normalize::RawRecord;
use reqwest::{Client, header};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("feed responded with HTTP {0}")]
    Status(u16),
    #[error("feed request timed out")]
    Timeout,
    #[error("feed could not be parsed: {0}")]
    Parse(String),
    #[error("source kind `{}` is not supported for automated sync", .0.as_str())]
    UnsupportedSource(SourceKind),
}

impl FetchError {
    pub fn code(&self) -> &'static str {
        match self {
            FetchError::Transport(_) | FetchError::Status(_) | FetchError::Timeout => {
                "fetch_failed"
            }
            FetchError::Parse(_) => "parse_failed",
            FetchError::UnsupportedSource(_) => "unsupported_source",
        }
    }
}

/// Retrieves one dealer source document and hands it to the matching parser.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    http: Client,
}

impl FeedFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: build_client_with_timeout(timeout),
        }
    }

    pub async fn fetch(&self, source: &SourceDescriptor) -> Result<Vec<RawRecord>, FetchError> {
        match source.kind {
            SourceKind::Csv => {
                let body = self.fetch_body(&source.url).await?;
                let records =
                    csv::parse_records(&body).map_err(|err| FetchError::Parse(err.to_string()))?;
                debug!(
                    target = "dealer_sync.feed",
                    url = %source.url,
                    records = records.len(),
                    "csv feed parsed"
                );
                Ok(records)
            }
            kind @ (SourceKind::Sitemap | SourceKind::Page) => {
                Err(FetchError::UnsupportedSource(kind))
            }
        }
    }

    async fn fetch_body(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .http
            .get(url)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::PRAGMA, "no-cache")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}
