use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

use crate::core::model::FetchPriority;
use crate::plugins::registry::FetchContext;

/// Tells the update server whether a user is waiting on the request.
pub const INTERACTIVITY_HEADER: &str = "x-goog-update-interactivity";

#[derive(thiserror::Error, Debug)]
pub enum HttpFetchError {
    #[error("http status error: {0}")]
    Status(StatusCode),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid user agent: {0}")]
    UserAgent(#[from] reqwest::header::InvalidHeaderValue),
}

impl HttpFetchError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            HttpFetchError::Status(s) => Some(s.as_u16()),
            HttpFetchError::Transport(e) => e.status().map(|s| s.as_u16()),
            HttpFetchError::UserAgent(_) => None,
        }
    }
}

/// Whole-body GETs with retry on transient failures.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    ctx: FetchContext,
}

impl HttpFetcher {
    pub fn new(ctx: FetchContext) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client, ctx })
    }

    fn build_headers(&self, priority: FetchPriority) -> Result<HeaderMap, HttpFetchError> {
        let mut h = HeaderMap::new();
        h.insert(USER_AGENT, HeaderValue::from_str(&self.ctx.user_agent)?);
        let interactivity = match priority {
            FetchPriority::Foreground => "fg",
            FetchPriority::Background => "bg",
        };
        h.insert(HeaderName::from_static(INTERACTIVITY_HEADER), HeaderValue::from_static(interactivity));
        Ok(h)
    }

    fn should_retry_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
    }

    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let base = self.ctx.retry_backoff_ms.max(1);
        let mul = 1u64 << attempt.min(16);
        Duration::from_millis(base.saturating_mul(mul).min(30_000))
    }

    /// Returns the body and how many attempts it took.
    pub async fn get(&self, url: &Url, priority: FetchPriority) -> Result<(Bytes, u32), (HttpFetchError, u32)> {
        let headers = self.build_headers(priority).map_err(|e| (e, 0))?;

        let mut last_err: Option<HttpFetchError> = None;
        let mut tries = 0;
        for attempt in 0..=self.ctx.retries {
            if attempt > 0 {
                sleep(self.backoff(attempt - 1)).await;
            }
            tries += 1;

            let resp = match self
                .client
                .get(url.clone())
                .headers(headers.clone())
                .timeout(Duration::from_secs(self.ctx.timeout_secs))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return resp.bytes().await.map(|b| (b, tries)).map_err(|e| (e.into(), tries));
            }
            if Self::should_retry_status(status) {
                last_err = Some(HttpFetchError::Status(status));
                continue;
            }
            return Err((HttpFetchError::Status(status), tries));
        }

        Err((last_err.unwrap_or(HttpFetchError::Status(StatusCode::REQUEST_TIMEOUT)), tries))
    }
}
