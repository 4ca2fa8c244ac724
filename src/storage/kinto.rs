// src/storage/kinto.rs

//! HTTP client for the remote record store.
//!
//! Speaks the subset of the Kinto API the job needs: server settings, paginated record
//! listing with a `_since` cursor, and batched writes.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{AppError, Result, is_retryable_status};
use crate::models::PublishConfig;
use crate::storage::{BatchItemStatus, PublishOp, RecordStore, ServerInfo, WriteMode};

/// Record store reached over HTTP.
pub struct KintoStore {
    client: Client,
    server_url: String,
    bucket: String,
    collection: String,
    auth: Option<(String, String)>,
}

#[derive(Debug, Deserialize)]
struct ServerRoot {
    settings: ServerSettings,
}

#[derive(Debug, Deserialize)]
struct ServerSettings {
    batch_max_requests: usize,
}

#[derive(Debug, Deserialize)]
struct RecordPage {
    data: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct BatchRequest {
    defaults: BatchDefaults,
    requests: Vec<BatchSubrequest>,
}

#[derive(Debug, Serialize)]
struct BatchDefaults {
    method: &'static str,
}

#[derive(Debug, Serialize)]
struct BatchSubrequest {
    path: String,
    body: Value,
    #[serde(skip_serializing_if = "Map::is_empty")]
    headers: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    responses: Vec<BatchSubresponse>,
}

#[derive(Debug, Deserialize)]
struct BatchSubresponse {
    status: u16,
    #[serde(default)]
    body: Value,
}

impl KintoStore {
    pub fn new(config: &PublishConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .user_agent(concat!("buildhub/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            server_url: config.server_url.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
            collection: config.collection.clone(),
            auth: config.auth.as_deref().and_then(split_auth),
        })
    }

    fn records_path(&self) -> String {
        format!(
            "/buckets/{}/collections/{}/records",
            self.bucket, self.collection
        )
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(url))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    fn batch_request(&self, ops: &[PublishOp]) -> BatchRequest {
        let records_path = self.records_path();
        let requests = ops
            .iter()
            .map(|op| {
                let mut headers = Map::new();
                if op.mode == WriteMode::CreateIfNotExists {
                    headers.insert("If-None-Match".into(), Value::String("*".into()));
                }
                BatchSubrequest {
                    path: format!("{records_path}/{}", op.id),
                    body: json!({ "data": op.data }),
                    headers,
                }
            })
            .collect();

        BatchRequest {
            defaults: BatchDefaults { method: "PUT" },
            requests,
        }
    }
}

/// `user:password` into its two halves.
fn split_auth(auth: &str) -> Option<(String, String)> {
    auth.split_once(':')
        .map(|(user, password)| (user.to_string(), password.to_string()))
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    if is_retryable_status(status.as_u16()) {
        return Err(AppError::TransientHttp {
            url,
            status: status.as_u16(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::remote(format!("{url} returned {status}: {body}")))
}

#[async_trait]
impl RecordStore for KintoStore {
    async fn server_info(&self) -> Result<ServerInfo> {
        let url = format!("{}/", self.server_url);
        let response = error_for_status(self.get(&url).send().await?).await?;
        let root: ServerRoot = response.json().await?;
        Ok(ServerInfo {
            batch_max_requests: root.settings.batch_max_requests,
        })
    }

    async fn fetch_records(&self, since: Option<u64>) -> Result<Vec<Value>> {
        let mut url = format!("{}{}", self.server_url, self.records_path());
        if let Some(since) = since {
            url = format!("{url}?_since={since}");
        }

        let mut records = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next.take() {
            let response = error_for_status(self.get(&url).send().await?).await?;
            next = response
                .headers()
                .get("Next-Page")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let page: RecordPage = response.json().await?;
            log::debug!("Fetched {} records from {}", page.data.len(), url);
            records.extend(page.data);
        }
        Ok(records)
    }

    async fn latest_record(&self, product: &str, channel: &str) -> Result<Option<Value>> {
        let url = format!("{}{}", self.server_url, self.records_path());
        let request = self.get(&url).query(&[
            ("source.product", product),
            ("target.channel", channel),
            ("_sort", "-download.date"),
            ("_limit", "1"),
        ]);
        let response = error_for_status(request.send().await?).await?;
        let page: RecordPage = response.json().await?;
        Ok(page.data.into_iter().next())
    }

    async fn publish_batch(&self, ops: &[PublishOp]) -> Result<Vec<BatchItemStatus>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/batch", self.server_url);
        let request = self.authorize(self.client.post(&url)).json(&self.batch_request(ops));
        let response = error_for_status(request.send().await?).await?;
        let batch: BatchResponse = response.json().await?;

        if batch.responses.len() != ops.len() {
            return Err(AppError::remote(format!(
                "batch returned {} responses for {} requests",
                batch.responses.len(),
                ops.len()
            )));
        }

        Ok(ops
            .iter()
            .zip(batch.responses)
            .map(|(op, item)| BatchItemStatus {
                id: op.id.clone(),
                status: item.status,
                body: item.body,
            })
            .collect())
    }

    fn cache_name(&self) -> String {
        let raw = format!("{}-{}-{}", self.server_url, self.bucket, self.collection);
        raw.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect()
    }
}
