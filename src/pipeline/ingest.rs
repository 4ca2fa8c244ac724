// src/pipeline/ingest.rs

//! Run entry points.
//!
//! Both runs share one shape: load the change-detection mirror and the metadata memo,
//! start the publisher, produce enriched records into its queue, then persist the memo
//! and report. The producer and the publisher run concurrently on the same task.

use std::sync::Arc;

use chrono::Utc;
use futures::future;
use futures::pin_mut;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tokio::sync::mpsc;

use crate::error::{AppError, Result};
use crate::models::{Config, Record};
use crate::pipeline::changes::fetch_existing;
use crate::pipeline::inventory::{InventoryFilter, decode_inventory, records_from_group};
use crate::pipeline::publish::{PublishSummary, Publisher, record_channel};
use crate::pipeline::scrape::{ArchiveScraper, ScrapeResume};
use crate::services::canonical::{check_record, merge_metadata};
use crate::services::metadata::{MetadataCaches, MetadataFetcher, MetadataSnapshot};
use crate::storage::{LocalStorage, RecordStore};
use crate::utils::http::ArchiveClient;
use crate::utils::log;

/// End-of-run counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Records built from the input
    pub processed: usize,
    /// Records not published: unchanged, or dropped by strict validation
    pub skipped: usize,
    /// Records without complete build metadata
    pub incomplete: usize,
    pub published: usize,
    pub failed: usize,
}

impl RunSummary {
    fn from_parts(produced: &ProducerStats, published: &PublishSummary) -> Self {
        Self {
            processed: produced.processed,
            skipped: produced.dropped + published.unchanged,
            incomplete: produced.incomplete,
            published: published.published,
            failed: published.failed,
        }
    }

    pub fn log(&self, title: &str) {
        log::summary(
            title,
            &[
                ("Processed", self.processed.to_string()),
                ("Skipped", self.skipped.to_string()),
                ("Incomplete", self.incomplete.to_string()),
                ("Published", self.published.to_string()),
                ("Failed", self.failed.to_string()),
            ],
        );
    }
}

#[derive(Debug, Default)]
struct ProducerStats {
    processed: usize,
    incomplete: usize,
    dropped: usize,
}

/// File holding the metadata memo of this crate version.
fn metadata_cache_key() -> String {
    format!(".metadata-{}.json", env!("CARGO_PKG_VERSION"))
}

/// Enriches records and feeds them to the publish queue.
struct Enricher {
    fetcher: MetadataFetcher,
    concurrency: usize,
    strict: bool,
}

impl Enricher {
    async fn enrich_one(&self, record: Record) -> Record {
        match self.fetcher.fetch_metadata(&record).await {
            Ok(metadata) => merge_metadata(record, metadata.as_ref()),
            Err(e) => {
                ::log::warn!("No metadata for {}: {}", record.download.url, e);
                record
            }
        }
    }

    /// Enrich records concurrently, validate, and queue the survivors.
    ///
    /// Up to `concurrency` records are enriched at once, across folder or listing
    /// boundaries of the input. An input error ends the run.
    async fn forward<S>(
        &self,
        records: S,
        queue: &mpsc::Sender<Record>,
        stats: &mut ProducerStats,
    ) -> Result<()>
    where
        S: Stream<Item = Result<Record>>,
    {
        let enriched = records
            .map(|item| async move {
                match item {
                    Ok(record) => Ok(self.enrich_one(record).await),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(self.concurrency);
        pin_mut!(enriched);

        while let Some(record) = enriched.next().await {
            let record = record?;
            stats.processed += 1;
            if let Err(e) = check_record(&record) {
                stats.incomplete += 1;
                if self.strict {
                    ::log::warn!("Dropping {}: {}", record.id, e);
                    stats.dropped += 1;
                    continue;
                }
                ::log::debug!("Publishing incomplete {}: {}", record.id, e);
            }
            queue
                .send(record)
                .await
                .map_err(|_| AppError::remote("publish queue closed"))?;
        }
        Ok(())
    }
}

/// State shared by the run entry points.
struct Ingest {
    config: Config,
    local: LocalStorage,
    enricher: Enricher,
    publisher: Publisher,
}

impl Ingest {
    async fn start(
        config: &Config,
        archive: Arc<dyn ArchiveClient>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        let local = LocalStorage::new(&config.cache.folder);
        let index = fetch_existing(store.as_ref(), &local).await?;

        let caches = if config.cache.persist_metadata {
            load_metadata_caches(&local).await
        } else {
            MetadataCaches::new()
        };
        let fetcher = MetadataFetcher::new(archive, &config.archive, Arc::new(caches));
        let publisher = Publisher::connect(store, Arc::new(index), &config.publish).await?;

        Ok(Self {
            config: config.clone(),
            local,
            enricher: Enricher {
                fetcher,
                concurrency: config.archive.max_concurrent.max(1),
                strict: config.publish.strict,
            },
            publisher,
        })
    }

    async fn finish(
        &self,
        title: &str,
        produced: Result<ProducerStats>,
        published: PublishSummary,
    ) -> Result<RunSummary> {
        if self.config.cache.persist_metadata {
            let snapshot = self.enricher.fetcher.caches().snapshot();
            if let Err(e) = self.local.write_json(&metadata_cache_key(), &snapshot).await {
                ::log::warn!("Cannot save metadata cache: {e}");
            }
        }

        let produced = produced?;
        let summary = RunSummary::from_parts(&produced, &published);
        summary.log(title);
        Ok(summary)
    }
}

/// Restore the memo of a previous run; an unreadable file starts empty.
async fn load_metadata_caches(local: &LocalStorage) -> MetadataCaches {
    match local.read_json::<MetadataSnapshot>(&metadata_cache_key()).await {
        Ok(Some(snapshot)) => {
            ::log::info!(
                "Loaded metadata cache: {} nightly, {} rc, {} release",
                snapshot.nightly.len(),
                snapshot.rc.len(),
                snapshot.release.len()
            );
            MetadataCaches::from_snapshot(snapshot)
        }
        Ok(None) => MetadataCaches::new(),
        Err(e) => {
            ::log::warn!("Ignoring metadata cache: {e}");
            MetadataCaches::new()
        }
    }
}

/// Ingest a gzip CSV inventory given as a byte-chunk stream.
pub async fn run_inventory<S>(
    config: &Config,
    archive: Arc<dyn ArchiveClient>,
    store: Arc<dyn RecordStore>,
    chunks: S,
) -> Result<RunSummary>
where
    S: Stream<Item = Result<Vec<u8>>>,
{
    log::header("Inventory ingestion");
    log::sub_item(&format!("Products: {}", config.archive.products.join(", ")));
    let ingest = Ingest::start(config, archive, store).await?;
    let filter = InventoryFilter::from_config(&config.inventory, &config.archive.products);
    let base_url = config.archive.base_url.as_str();

    let (queue, records) = record_channel(&config.publish);
    let producer = async {
        let queue = queue;
        let mut stats = ProducerStats::default();
        let found = decode_inventory(chunks, filter)
            .map_ok(|group| {
                stream::iter(records_from_group(base_url, &group).into_iter().map(Ok::<_, AppError>))
            })
            .try_flatten();
        ingest.enricher.forward(found, &queue, &mut stats).await?;
        Ok::<_, AppError>(stats)
    };

    let (produced, published) = tokio::join!(producer, ingest.publisher.run(records));
    ingest.finish("Inventory ingestion", produced, published).await
}

/// Pass records through; a failed listing is logged and ends that part of the scrape.
fn skip_failed<'s, S>(
    what: &'s str,
    product: &'s str,
    records: S,
) -> impl Stream<Item = Result<Record>> + 's
where
    S: Stream<Item = Result<Record>> + 's,
{
    records.filter_map(move |item| {
        future::ready(match item {
            Ok(record) => Some(Ok(record)),
            Err(e) => {
                ::log::warn!("Cannot scrape {product} {what}: {e}");
                None
            }
        })
    })
}

/// Scrape the current nightlies and the new release folders of `products`.
///
/// Each product resumes after the newest version and nightly the store holds.
pub async fn run_scrape(
    config: &Config,
    archive: Arc<dyn ArchiveClient>,
    store: Arc<dyn RecordStore>,
    products: &[String],
) -> Result<RunSummary> {
    log::header("Archive scrape");
    log::sub_item(&format!("Products: {}", products.join(", ")));
    let ingest = Ingest::start(config, Arc::clone(&archive), Arc::clone(&store)).await?;
    let scraper = ArchiveScraper::new(
        archive.as_ref(),
        &config.archive.base_url,
        config.archive.max_concurrent,
    );
    let month = Utc::now().format("%Y/%m").to_string();

    let (queue, records) = record_channel(&config.publish);
    let producer = async {
        let queue = queue;
        let mut stats = ProducerStats::default();
        for product in products {
            let resume = ScrapeResume::from_store(store.as_ref(), product).await;
            let nightlies =
                skip_failed("nightlies", product, scraper.nightlies(product, &month, &resume));
            let releases =
                skip_failed("releases", product, scraper.releases(product, &resume));
            ingest
                .enricher
                .forward(nightlies.chain(releases), &queue, &mut stats)
                .await?;
        }
        Ok::<_, AppError>(stats)
    };

    let (produced, published) = tokio::join!(producer, ingest.publisher.run(records));
    ingest.finish("Archive scrape", produced, published).await
}
