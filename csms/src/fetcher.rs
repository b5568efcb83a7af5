const BASE_DELAY: u64 = 500;
const MAX_RETRIES: u32 = 3;

use crate::criteria::ManifestFilter;
use crate::metrics_defs::CSMS_PAGE_FETCHES;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use shared::auth::{AuthError, TokenSource};
use shared::counter;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

/// Records are kept raw so one malformed manifest does not fail its page.
#[derive(Deserialize)]
struct ManifestPage {
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("CSMS request failed: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("could not authorize CSMS request: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("CSMS returned status {0}")]
    BadStatus(StatusCode),
    #[error("CSMS unavailable")]
    RetriesExceeded,
}

/// Paged access to manifest records.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches the page of at most `page_size()` undecoded manifest records
    /// starting at `offset`.
    async fn fetch_page(
        &self,
        filter: &ManifestFilter,
        offset: usize,
    ) -> Result<Vec<Value>, FetchError>;

    fn page_size(&self) -> usize;
}

/// Walks a [`ManifestSource`] one page at a time.
pub struct Pager<'a> {
    source: &'a dyn ManifestSource,
    filter: &'a ManifestFilter,
    offset: usize,
    pages: usize,
    done: bool,
}

impl<'a> Pager<'a> {
    pub fn new(source: &'a dyn ManifestSource, filter: &'a ManifestFilter) -> Self {
        Pager {
            source,
            filter,
            offset: 0,
            pages: 0,
            done: false,
        }
    }

    /// Returns the next non-empty page, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, FetchError> {
        if self.done {
            return Ok(None);
        }

        let page = self.source.fetch_page(self.filter, self.offset).await?;
        self.pages += 1;
        self.offset += page.len();
        if page.len() < self.source.page_size() {
            self.done = true;
        }

        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }
}

/// Client for the CSMS manifests listing.
pub struct CsmsClient {
    client: reqwest::Client,
    full_url: String,
    page_size: usize,
    base_delay: Duration,
    tokens: Arc<dyn TokenSource>,
}

impl CsmsClient {
    pub fn new(base_url: &Url, page_size: usize, tokens: Arc<dyn TokenSource>) -> Self {
        let full_url = format!("{}/{}", base_url.as_str().trim_end_matches('/'), "manifests");

        CsmsClient {
            client: reqwest::Client::new(),
            full_url,
            page_size,
            base_delay: Duration::from_millis(BASE_DELAY),
            tokens,
        }
    }

    /// Sets the first backoff delay; later retries double it.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn page_url(&self, filter: &ManifestFilter, offset: usize) -> Result<Url, FetchError> {
        let mut url =
            Url::parse(&self.full_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("limit", &self.page_size.to_string())
                .append_pair("offset", &offset.to_string());
            for (key, value) in filter.query_pairs() {
                pairs.append_pair(key, &value);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ManifestSource for CsmsClient {
    async fn fetch_page(
        &self,
        filter: &ManifestFilter,
        offset: usize,
    ) -> Result<Vec<Value>, FetchError> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,     // 429
            StatusCode::INTERNAL_SERVER_ERROR, // 500
            StatusCode::BAD_GATEWAY,           // 502
            StatusCode::SERVICE_UNAVAILABLE,   // 503
            StatusCode::GATEWAY_TIMEOUT,       // 504
        ];

        let url = self.page_url(filter, offset)?;
        let mut retries = 0;

        loop {
            let token = self.tokens.token().await?;
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(token)
                .send()
                .await?;
            let status = response.status();

            if status.is_success() {
                let page = response.json::<ManifestPage>().await?;
                counter!(CSMS_PAGE_FETCHES).increment(1);
                tracing::debug!(offset, count = page.data.len(), "Fetched manifest page");
                return Ok(page.data);
            }

            if !RETRIABLE_STATUS_CODES.contains(&status) {
                return Err(FetchError::BadStatus(status));
            }
            if retries >= MAX_RETRIES {
                return Err(FetchError::RetriesExceeded);
            }

            // Backoff between retries
            let delay = self.base_delay * 2_u32.pow(retries);
            tracing::warn!(%status, offset, retry_millis = delay.as_millis() as u64, "Retrying manifest page");
            sleep(delay).await;
            retries += 1;
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
