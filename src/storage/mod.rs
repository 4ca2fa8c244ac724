// src/storage/mod.rs

//! Storage abstractions.
//!
//! - [`RecordStore`]: the remote document store records are published to
//! - [`LocalStorage`]: cache files kept between runs
//! - `s3` (feature `s3`): bulk inventory deliveries

pub mod kinto;
pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

pub use kinto::KintoStore;
pub use local::{LocalStorage, file_chunks};

/// Limits advertised by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerInfo {
    /// Maximum requests in one batch call
    pub batch_max_requests: usize,
}

/// How a record write treats an existing record with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Fail with 412 if the record exists
    CreateIfNotExists,
    /// Create or replace
    Upsert,
}

/// One record write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOp {
    pub id: String,
    pub data: Value,
    pub mode: WriteMode,
}

/// Per-item outcome of a batch call, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemStatus {
    pub id: String,
    pub status: u16,
    pub body: Value,
}

impl BatchItemStatus {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Record-oriented access to the remote document store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Server limits, read once per run.
    async fn server_info(&self) -> Result<ServerInfo>;

    /// Records modified after `since` (all records when `None`).
    async fn fetch_records(&self, since: Option<u64>) -> Result<Vec<Value>>;

    /// Newest record of `product` on `channel`, by download date.
    async fn latest_record(&self, product: &str, channel: &str) -> Result<Option<Value>>;

    /// Submit writes as one batch; statuses follow the order of `ops`.
    async fn publish_batch(&self, ops: &[PublishOp]) -> Result<Vec<BatchItemStatus>>;

    /// Stable name of the target, used to key local cache files.
    fn cache_name(&self) -> String;
}
