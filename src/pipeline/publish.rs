// src/pipeline/publish.rs

//! Batched publishing of records to the remote store.
//!
//! A producer sends records into a bounded channel; [`Publisher::run`] groups them into
//! batches and hands each batch to one of a few concurrent upload tasks. A batch is
//! flushed when it is full, when no record arrived for `wait_timeout`, or when the
//! channel closes. Records already stored with the same content are skipped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{PublishConfig, Record};
use crate::pipeline::changes::ChangeIndex;
use crate::storage::{BatchItemStatus, PublishOp, RecordStore, WriteMode};

/// Attempts for one batch call before its records count as failed.
const BATCH_ATTEMPTS: u32 = 3;

/// Delay before the first batch retry; doubled on each attempt.
const BATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Bounded producer side of the publish queue.
pub fn record_channel(config: &PublishConfig) -> (mpsc::Sender<Record>, mpsc::Receiver<Record>) {
    mpsc::channel(config.queue_capacity.max(1))
}

/// Counters of one publishing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// Records taken from the queue
    pub received: usize,
    /// Records identical to what the store holds
    pub unchanged: usize,
    pub published: usize,
    pub failed: usize,
    pub batches: usize,
    /// Per-item and per-batch error messages
    pub errors: Vec<String>,
}

impl PublishSummary {
    fn absorb(&mut self, outcome: BatchOutcome) {
        self.published += outcome.published;
        self.failed += outcome.failed;
        self.errors.extend(outcome.errors);
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    published: usize,
    failed: usize,
    errors: Vec<String>,
}

/// Batching consumer of the publish queue.
pub struct Publisher {
    store: Arc<dyn RecordStore>,
    index: Arc<ChangeIndex>,
    batch_size: usize,
    workers: usize,
    wait_timeout: Duration,
    retry_delay: Duration,
}

impl Publisher {
    /// Ask the store for its batch limit and size batches accordingly.
    pub async fn connect(
        store: Arc<dyn RecordStore>,
        index: Arc<ChangeIndex>,
        config: &PublishConfig,
    ) -> Result<Self> {
        let info = store.server_info().await?;
        let batch_size = config.max_batch_size.min(info.batch_max_requests).max(1);
        log::info!(
            "Publishing in batches of {} with {} workers",
            batch_size,
            config.workers
        );

        Ok(Self {
            store,
            index,
            batch_size,
            workers: config.workers.max(1),
            wait_timeout: config.wait_timeout(),
            retry_delay: BATCH_RETRY_DELAY,
        })
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Delay before the first retry of a failed batch call.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Write operation for a record, `None` when the store is already up to date.
    fn prepare(&self, record: &Record) -> Result<Option<PublishOp>> {
        let data = serde_json::to_value(record)?;
        if self.index.is_unchanged(&record.id, &data) {
            return Ok(None);
        }
        let mode = if self.index.contains(&record.id) {
            WriteMode::Upsert
        } else {
            WriteMode::CreateIfNotExists
        };
        Ok(Some(PublishOp {
            id: record.id.clone(),
            data,
            mode,
        }))
    }

    /// Consume the queue until it is closed and every batch has been answered.
    pub async fn run(&self, mut records: mpsc::Receiver<Record>) -> PublishSummary {
        let mut summary = PublishSummary::default();
        let mut uploads: JoinSet<BatchOutcome> = JoinSet::new();
        let mut open = true;

        while open {
            let mut batch = Vec::with_capacity(self.batch_size);
            let deadline = Instant::now() + self.wait_timeout;

            while batch.len() < self.batch_size {
                match tokio::time::timeout_at(deadline, records.recv()).await {
                    Ok(Some(record)) => {
                        summary.received += 1;
                        match self.prepare(&record) {
                            Ok(Some(op)) => batch.push(op),
                            Ok(None) => summary.unchanged += 1,
                            Err(e) => {
                                log::warn!("Cannot serialize {}: {}", record.id, e);
                                summary.failed += 1;
                                summary.errors.push(format!("{}: {e}", record.id));
                            }
                        }
                    }
                    Ok(None) => {
                        open = false;
                        break;
                    }
                    Err(_) => {
                        if !batch.is_empty() {
                            log::debug!("Stop waiting, proceed with {} records", batch.len());
                        }
                        break;
                    }
                }
            }

            while let Some(finished) = uploads.try_join_next() {
                summary.absorb(join_outcome(finished));
            }
            if batch.is_empty() {
                continue;
            }

            while uploads.len() >= self.workers {
                if let Some(finished) = uploads.join_next().await {
                    summary.absorb(join_outcome(finished));
                }
            }
            summary.batches += 1;
            let store = Arc::clone(&self.store);
            let retry_delay = self.retry_delay;
            uploads.spawn(async move { publish_batch(store.as_ref(), batch, retry_delay).await });
        }

        while let Some(finished) = uploads.join_next().await {
            summary.absorb(join_outcome(finished));
        }
        summary
    }
}

fn join_outcome(result: std::result::Result<BatchOutcome, JoinError>) -> BatchOutcome {
    result.unwrap_or_else(|e| BatchOutcome {
        published: 0,
        failed: 0,
        errors: vec![format!("publish task aborted: {e}")],
    })
}

/// Upload one batch, retrying transient failures of the whole call.
async fn publish_batch(
    store: &dyn RecordStore,
    ops: Vec<PublishOp>,
    retry_delay: Duration,
) -> BatchOutcome {
    let mut attempt = 0;
    let statuses = loop {
        match store.publish_batch(&ops).await {
            Ok(statuses) => break statuses,
            Err(e) if e.is_transient() && attempt + 1 < BATCH_ATTEMPTS => {
                let delay = retry_delay * 2u32.pow(attempt);
                log::warn!("Batch of {} failed ({}), retrying in {:?}", ops.len(), e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!("Batch of {} records failed: {}", ops.len(), e);
                return BatchOutcome {
                    published: 0,
                    failed: ops.len(),
                    errors: vec![e.to_string()],
                };
            }
        }
    };

    let mut outcome = BatchOutcome::default();
    for status in &statuses {
        match item_error(status) {
            None => outcome.published += 1,
            Some(message) => {
                outcome.failed += 1;
                outcome.errors.push(message);
            }
        }
    }

    if outcome.errors.is_empty() {
        log::info!("Pushed {} records", outcome.published);
    } else {
        let error = AppError::PublishBatch {
            errors: outcome.errors.clone(),
        };
        log::error!("{error}");
    }
    outcome
}

/// Message for a failed batch item; batches never fail as a whole on a 4xx.
fn item_error(status: &BatchItemStatus) -> Option<String> {
    if status.is_success() {
        return None;
    }
    Some(match status.status {
        409 | 412 => {
            let existing = status
                .body
                .pointer("/details/existing")
                .map(|v| v.to_string())
                .unwrap_or_default();
            format!("Record '{}' already exists: {existing}", status.id)
        }
        400 => format!("Invalid record '{}': {}", status.id, status.body),
        code => format!("Error {code} for '{}': {}", status.id, status.body),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::services::canonical::record_from_url;
    use crate::storage::ServerInfo;

    /// In-memory record store.
    struct MemoryStore {
        batch_max_requests: usize,
        records: Mutex<HashMap<String, Value>>,
        calls: Mutex<Vec<Vec<PublishOp>>>,
        rejected: HashSet<String>,
        clock: Mutex<u64>,
        /// Batch calls left to fail with a 503
        outages: Mutex<u32>,
        attempts: Mutex<u32>,
    }

    impl MemoryStore {
        fn new(batch_max_requests: usize) -> Self {
            Self {
                batch_max_requests,
                records: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                rejected: HashSet::new(),
                clock: Mutex::new(0),
                outages: Mutex::new(0),
                attempts: Mutex::new(0),
            }
        }

        fn unavailable_for(self, calls: u32) -> Self {
            *self.outages.lock().unwrap() = calls;
            self
        }

        fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }

        fn rejecting(mut self, id: &str) -> Self {
            self.rejected.insert(id.to_string());
            self
        }

        fn calls(&self) -> Vec<Vec<PublishOp>> {
            self.calls.lock().unwrap().clone()
        }

        fn stored(&self) -> Vec<Value> {
            self.records.lock().unwrap().values().cloned().collect()
        }
    }

    #[async_trait]
    impl RecordStore for MemoryStore {
        async fn server_info(&self) -> Result<ServerInfo> {
            Ok(ServerInfo {
                batch_max_requests: self.batch_max_requests,
            })
        }

        async fn fetch_records(&self, _since: Option<u64>) -> Result<Vec<Value>> {
            Ok(self.stored())
        }

        async fn latest_record(&self, _product: &str, _channel: &str) -> Result<Option<Value>> {
            Ok(None)
        }

        async fn publish_batch(&self, ops: &[PublishOp]) -> Result<Vec<BatchItemStatus>> {
            *self.attempts.lock().unwrap() += 1;
            {
                let mut outages = self.outages.lock().unwrap();
                if *outages > 0 {
                    *outages -= 1;
                    return Err(AppError::TransientHttp {
                        url: "memory://batch".into(),
                        status: 503,
                    });
                }
            }
            self.calls.lock().unwrap().push(ops.to_vec());
            let mut records = self.records.lock().unwrap();
            let mut clock = self.clock.lock().unwrap();
            Ok(ops
                .iter()
                .map(|op| {
                    let exists = records.contains_key(&op.id);
                    let status = if self.rejected.contains(&op.id) {
                        400
                    } else if exists && op.mode == WriteMode::CreateIfNotExists {
                        412
                    } else {
                        *clock += 1;
                        let mut data = op.data.clone();
                        data["last_modified"] = json!(*clock);
                        records.insert(op.id.clone(), data);
                        if exists { 200 } else { 201 }
                    };
                    BatchItemStatus {
                        id: op.id.clone(),
                        status,
                        body: json!({}),
                    }
                })
                .collect())
        }

        fn cache_name(&self) -> String {
            "memory".into()
        }
    }

    fn records(locales: &[&str]) -> Vec<Record> {
        locales
            .iter()
            .map(|locale| {
                record_from_url(&format!(
                    "https://archive.mozilla.org/pub/firefox/releases/51.0/linux-x86_64/{locale}/firefox-51.0.tar.bz2"
                ))
                .unwrap()
            })
            .collect()
    }

    async fn publish(
        store: Arc<MemoryStore>,
        index: ChangeIndex,
        records: Vec<Record>,
    ) -> PublishSummary {
        let config = PublishConfig::default();
        let publisher = Publisher::connect(store, Arc::new(index), &config)
            .await
            .unwrap()
            .with_wait_timeout(Duration::from_millis(50))
            .with_retry_delay(Duration::from_millis(1));
        let (tx, rx) = record_channel(&config);
        let producer = tokio::spawn(async move {
            for record in records {
                tx.send(record).await.unwrap();
            }
        });
        let summary = publisher.run(rx).await;
        producer.await.unwrap();
        summary
    }

    #[tokio::test]
    async fn test_batch_size_respects_server_limit() {
        let store = Arc::new(MemoryStore::new(2));
        let summary = publish(
            store.clone(),
            ChangeIndex::default(),
            records(&["de", "fr", "it", "ja", "nl"]),
        )
        .await;

        assert_eq!(summary.received, 5);
        assert_eq!(summary.published, 5);
        assert!(store.calls().iter().all(|batch| batch.len() <= 2));
        assert!(summary.batches >= 3);
        assert_eq!(store.stored().len(), 5);
    }

    #[tokio::test]
    async fn test_second_run_publishes_nothing() {
        let store = Arc::new(MemoryStore::new(25));
        publish(store.clone(), ChangeIndex::default(), records(&["de", "fr"])).await;
        let first_calls = store.calls().len();

        let index = ChangeIndex::from_records(store.stored());
        let summary = publish(store.clone(), index, records(&["de", "fr"])).await;

        assert_eq!(summary.unchanged, 2);
        assert_eq!(summary.published, 0);
        assert_eq!(store.calls().len(), first_calls);
    }

    #[tokio::test]
    async fn test_changed_record_is_updated_once() {
        let store = Arc::new(MemoryStore::new(25));
        publish(store.clone(), ChangeIndex::default(), records(&["de", "fr"])).await;
        let first_calls = store.calls().len();

        let index = ChangeIndex::from_records(store.stored());
        let mut changed = records(&["de", "fr"]);
        changed[1].download.size = Some(42);
        let summary = publish(store.clone(), index, changed).await;

        assert_eq!(summary.published, 1);
        assert_eq!(summary.unchanged, 1);
        let calls = store.calls();
        assert_eq!(calls.len(), first_calls + 1);
        let update = &calls[first_calls];
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].id, "firefox_51-0_linux-x86_64_fr");
        assert_eq!(update[0].mode, WriteMode::Upsert);
    }

    #[tokio::test]
    async fn test_item_errors_are_aggregated() {
        let store = Arc::new(MemoryStore::new(25).rejecting("firefox_51-0_linux-x86_64_fr"));
        let summary = publish(store.clone(), ChangeIndex::default(), records(&["de", "fr", "it"])).await;

        assert_eq!(summary.published, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].starts_with("Invalid record 'firefox_51-0_linux-x86_64_fr'"));
    }

    #[tokio::test]
    async fn test_transient_batch_failure_is_retried() {
        let store = Arc::new(MemoryStore::new(25).unavailable_for(2));
        let summary = publish(store.clone(), ChangeIndex::default(), records(&["de", "fr"])).await;

        assert_eq!(store.attempts(), 3);
        assert_eq!(summary.published, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(store.stored().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_batch() {
        let store = Arc::new(MemoryStore::new(25).unavailable_for(BATCH_ATTEMPTS));
        let summary =
            publish(store.clone(), ChangeIndex::default(), records(&["de", "fr", "it"])).await;

        assert_eq!(store.attempts(), BATCH_ATTEMPTS);
        assert_eq!(summary.published, 0);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.errors.len(), 1);
        assert!(store.stored().is_empty());
    }

    #[tokio::test]
    async fn test_partial_batch_flushes_before_close() {
        let store = Arc::new(MemoryStore::new(25));
        let config = PublishConfig::default();
        let publisher = Publisher::connect(store.clone(), Arc::new(ChangeIndex::default()), &config)
            .await
            .unwrap()
            .with_wait_timeout(Duration::from_millis(20));
        let (tx, rx) = record_channel(&config);
        let consumer = tokio::spawn(async move { publisher.run(rx).await });

        tx.send(records(&["de"]).remove(0)).await.unwrap();
        let mut waited = 0;
        while store.calls().is_empty() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert_eq!(store.calls().len(), 1);

        drop(tx);
        let summary = consumer.await.unwrap();
        assert_eq!(summary.published, 1);
    }

    #[test]
    fn test_item_error_messages() {
        let conflict = BatchItemStatus {
            id: "a".into(),
            status: 412,
            body: json!({"details": {"existing": {"id": "a"}}}),
        };
        assert_eq!(
            item_error(&conflict).unwrap(),
            r#"Record 'a' already exists: {"id":"a"}"#
        );
        let ok = BatchItemStatus {
            id: "a".into(),
            status: 201,
            body: json!({}),
        };
        assert!(item_error(&ok).is_none());
    }
}
