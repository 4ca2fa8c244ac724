// src/utils/http.rs

//! HTTP client utilities for the archive server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CACHE_CONTROL, HeaderMap, HeaderValue};
use serde_json::Value;

use crate::error::{AppError, Result, is_retryable_status};
use crate::models::{ArchiveConfig, Listing};

/// Read access to the archive server.
///
/// A missing document is `Ok(None)`, never an error.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    /// Fetch and decode a JSON document.
    async fn get_json(&self, url: &str) -> Result<Option<Value>>;

    /// Fetch a plain-text document.
    async fn get_text(&self, url: &str) -> Result<Option<String>>;
}

/// Fetch a directory listing; a missing or malformed listing is an error.
pub async fn fetch_listing(client: &dyn ArchiveClient, url: &str) -> Result<Listing> {
    let value = client
        .get_json(url)
        .await?
        .ok_or_else(|| AppError::listing(url, "not found"))?;
    serde_json::from_value(value).map_err(|e| AppError::listing(url, e))
}

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &ArchiveConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.timeout())
        .default_headers(headers)
        .build()?;
    Ok(client)
}

/// Archive client with bounded exponential backoff.
#[derive(Clone)]
pub struct HttpArchiveClient {
    client: reqwest::Client,
    max_attempts: u32,
    config: ArchiveConfig,
}

impl HttpArchiveClient {
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        Ok(Self {
            client: create_async_client(config)?,
            max_attempts: config.max_retries.max(1),
            config: config.clone(),
        })
    }

    /// GET a body, retrying timeouts and transient statuses.
    pub async fn get_bytes(&self, url: &str) -> Result<Option<Vec<u8>>> {
        get_with_retry(
            url,
            self.max_attempts,
            |attempt| self.config.backoff(attempt),
            || self.fetch_once(url),
        )
        .await
    }

    /// One GET: the status, and the body of a successful response.
    async fn fetch_once(&self, url: &str) -> Result<(u16, Vec<u8>)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Ok((status, Vec::new()));
        }
        let body = response.bytes().await.map_err(|e| classify(url, e))?;
        Ok((status, body.to_vec()))
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }
}

/// Run `fetch` until it yields a final answer, sleeping `backoff(attempt)` between tries.
///
/// Timeouts and retryable statuses are tried again, at most `max_attempts` times in
/// total. A 404 is a final `None`.
pub(crate) async fn get_with_retry<F, Fut>(
    url: &str,
    max_attempts: u32,
    backoff: impl Fn(u32) -> Duration,
    mut fetch: F,
) -> Result<Option<Vec<u8>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(u16, Vec<u8>)>>,
{
    let mut attempt = 0;
    loop {
        let outcome = fetch()
            .await
            .and_then(|(status, body)| response_body(url, status, body));
        match outcome {
            Ok(body) => return Ok(body),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = backoff(attempt);
                log::debug!(
                    "Retrying {} in {:?} (attempt {}/{}): {}",
                    url,
                    delay,
                    attempt + 1,
                    max_attempts,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn response_body(url: &str, status: u16, body: Vec<u8>) -> Result<Option<Vec<u8>>> {
    if status == 404 {
        return Ok(None);
    }
    if is_retryable_status(status) {
        return Err(AppError::TransientHttp {
            url: url.to_string(),
            status,
        });
    }
    if status >= 400 {
        return Err(AppError::HttpStatus {
            url: url.to_string(),
            status,
        });
    }
    Ok(Some(body))
}

fn classify(url: &str, error: reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::FetchTimeout {
            url: url.to_string(),
        }
    } else {
        AppError::Http(error)
    }
}

#[async_trait]
impl ArchiveClient for HttpArchiveClient {
    async fn get_json(&self, url: &str) -> Result<Option<Value>> {
        // Content-Type is ignored: some JSON is served as application/octet-stream.
        match self.get_bytes(url).await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }

    async fn get_text(&self, url: &str) -> Result<Option<String>> {
        Ok(self
            .get_bytes(url)
            .await?
            .map(|body| String::from_utf8_lossy(&body).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use serde_json::json;

    struct StaticArchive(HashMap<&'static str, Value>);

    #[async_trait]
    impl ArchiveClient for StaticArchive {
        async fn get_json(&self, url: &str) -> Result<Option<Value>> {
            Ok(self.0.get(url).cloned())
        }

        async fn get_text(&self, _url: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn test_create_async_client() {
        assert!(create_async_client(&ArchiveConfig::default()).is_ok());
        let client = HttpArchiveClient::new(&ArchiveConfig::default()).unwrap();
        assert_eq!(client.timeout(), Duration::from_secs(300));
    }

    /// Replays canned responses and counts the requests made.
    async fn replay(responses: Vec<Result<(u16, Vec<u8>)>>) -> (Result<Option<Vec<u8>>>, usize) {
        let mut responses = responses.into_iter();
        let mut requests = 0;
        let result = get_with_retry(
            "https://a/file.json",
            3,
            |_| Duration::ZERO,
            || {
                requests += 1;
                let next = responses.next().unwrap_or(Ok((200, b"late".to_vec())));
                async move { next }
            },
        )
        .await;
        (result, requests)
    }

    #[tokio::test]
    async fn test_transient_statuses_are_retried() {
        let (result, requests) = replay(vec![
            Ok((503, Vec::new())),
            Err(AppError::FetchTimeout {
                url: "https://a/file.json".into(),
            }),
            Ok((200, b"{}".to_vec())),
        ])
        .await;
        assert_eq!(result.unwrap(), Some(b"{}".to_vec()));
        assert_eq!(requests, 3);
    }

    #[tokio::test]
    async fn test_not_found_is_never_retried() {
        let (result, requests) = replay(vec![Ok((404, Vec::new()))]).await;
        assert_eq!(result.unwrap(), None);
        assert_eq!(requests, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let (result, requests) = replay(vec![
            Ok((502, Vec::new())),
            Ok((503, Vec::new())),
            Ok((429, Vec::new())),
        ])
        .await;
        assert!(matches!(result, Err(AppError::TransientHttp { status: 429, .. })));
        assert_eq!(requests, 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_final() {
        let (result, requests) = replay(vec![Ok((403, Vec::new()))]).await;
        assert!(matches!(result, Err(AppError::HttpStatus { status: 403, .. })));
        assert_eq!(requests, 1);
    }

    #[tokio::test]
    async fn test_fetch_listing_shapes() {
        let archive = StaticArchive(HashMap::from([
            (
                "https://a/ok/",
                json!({"prefixes": ["build1/"], "files": []}),
            ),
            ("https://a/bad/", json!({"error": "nope"})),
        ]));

        let listing = fetch_listing(&archive, "https://a/ok/").await.unwrap();
        assert_eq!(listing.prefixes, vec!["build1/"]);

        assert!(matches!(
            fetch_listing(&archive, "https://a/bad/").await,
            Err(AppError::Listing { .. })
        ));
        assert!(matches!(
            fetch_listing(&archive, "https://a/missing/").await,
            Err(AppError::Listing { .. })
        ));
    }
}
