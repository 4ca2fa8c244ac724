// src/pipeline/scrape.rs

//! Archive scraper.
//!
//! Walks `pub/<product>/releases/<version>/<platform>/<locale>/` and the nightly folders
//! of one month, one level at a time with bounded concurrency. Records are yielded as
//! soon as the listing of their folder arrives. Versions and nightlies older than what
//! the store already holds are skipped.

use std::cmp::Ordering;

use async_stream::try_stream;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use futures::pin_mut;

use crate::error::Result;
use crate::models::{Listing, ListingFile, Record};
use crate::services::canonical::{DATETIME_FORMAT, is_build_url, record_from_url};
use crate::storage::RecordStore;
use crate::utils::http::{ArchiveClient, fetch_listing};
use crate::utils::url::{ArchiveFolder, archive_url};

/// Platform folders that never hold builds.
const SKIPPED_PLATFORMS: [&str; 3] = ["source", "update", "contrib"];

/// Nightly day folders start with their build time in this format.
const NIGHTLY_FOLDER_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
const NIGHTLY_STAMP_LEN: usize = 19;

/// Where earlier runs stopped, read from the newest records of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeResume {
    /// Newest known beta version; version folders up to it are skipped
    pub latest_version: Option<String>,
    /// Build time of the newest known nightly, as a day folder prefix
    pub latest_nightly: Option<String>,
}

impl ScrapeResume {
    /// Query the store; a failed lookup scrapes everything.
    pub async fn from_store(store: &dyn RecordStore, product: &str) -> Self {
        let product = if product == "mobile" { "fennec" } else { product };

        let latest_version = match store.latest_record(product, "beta").await {
            Ok(record) => record.and_then(|r| {
                r.pointer("/target/version")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            }),
            Err(e) => {
                log::warn!("Cannot read latest {product} version: {e}");
                None
            }
        };

        let latest_nightly = match store.latest_record(product, "nightly").await {
            Ok(record) => record.and_then(|r| {
                let date = r.pointer("/download/date")?.as_str()?;
                NaiveDateTime::parse_from_str(date, DATETIME_FORMAT)
                    .ok()
                    .map(|date| date.format(NIGHTLY_FOLDER_FORMAT).to_string())
            }),
            Err(e) => {
                log::warn!("Cannot read latest {product} nightly: {e}");
                None
            }
        };

        log::info!(
            "Resuming {} after version {} and nightly {}",
            product,
            latest_version.as_deref().unwrap_or("-"),
            latest_nightly.as_deref().unwrap_or("-")
        );
        Self {
            latest_version,
            latest_nightly,
        }
    }

    fn wants_version(&self, version: &str) -> bool {
        self.latest_version
            .as_deref()
            .is_none_or(|known| compare_versions(version, known) == Ordering::Greater)
    }

    fn wants_nightly(&self, folder: &str) -> bool {
        match self.latest_nightly.as_deref() {
            Some(known) => folder
                .get(..NIGHTLY_STAMP_LEN)
                .is_some_and(|stamp| stamp > known),
            None => true,
        }
    }
}

/// Scraper for the release and nightly folders of one archive.
pub struct ArchiveScraper<'a> {
    client: &'a dyn ArchiveClient,
    base_url: &'a str,
    concurrency: usize,
}

impl<'a> ArchiveScraper<'a> {
    pub fn new(client: &'a dyn ArchiveClient, base_url: &'a str, concurrency: usize) -> Self {
        Self {
            client,
            base_url,
            concurrency: concurrency.max(1),
        }
    }

    /// Listings of `urls` in completion order; failed folders are logged and left out.
    fn listings(&self, urls: Vec<String>) -> impl Stream<Item = (String, Listing)> + '_ {
        let client = self.client;
        stream::iter(urls)
            .map(move |url| async move {
                let result = fetch_listing(client, &url).await;
                (url, result)
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|(url, result)| async move {
                match result {
                    Ok(listing) => Some((url, listing)),
                    Err(e) => {
                        log::warn!("Skipping folder {url}: {e}");
                        None
                    }
                }
            })
    }

    /// Sub-folder URLs of every listed folder, keeping those `keep` accepts.
    async fn subfolders(&self, urls: Vec<String>, keep: fn(&str) -> bool) -> Vec<String> {
        self.listings(urls)
            .flat_map(|(url, listing)| {
                stream::iter(
                    listing
                        .prefixes
                        .into_iter()
                        .filter(move |p| keep(p.trim_end_matches('/')))
                        .map(move |p| format!("{url}{p}")),
                )
            })
            .collect()
            .await
    }

    /// Build records of the release folders newer than `resume`, newest version first.
    pub fn releases<'s>(
        &'s self,
        product: &'s str,
        resume: &'s ScrapeResume,
    ) -> impl Stream<Item = Result<Record>> + 's {
        try_stream! {
            let root = archive_url(self.base_url, product, None, None, None, ArchiveFolder::Releases);
            let mut versions: Vec<String> = fetch_listing(self.client, &root)
                .await?
                .prefixes
                .into_iter()
                .map(|v| v.trim_end_matches('/').to_string())
                .filter(|v| v.starts_with(|c: char| c.is_ascii_digit()))
                .filter(|v| !v.contains("funnelcake"))
                .filter(|v| resume.wants_version(v))
                .collect();
            versions.sort_by(|a, b| compare_versions(b, a));
            log::info!("Scraping {} {} versions", versions.len(), product);

            for version in versions {
                let platforms = self
                    .subfolders(vec![format!("{root}{version}/")], |p| {
                        !SKIPPED_PLATFORMS.contains(&p)
                    })
                    .await;
                let locales = self.subfolders(platforms, |l| l != "xpi").await;

                let listings = self.listings(locales);
                pin_mut!(listings);
                while let Some((url, listing)) = listings.next().await {
                    for file in &listing.files {
                        if let Some(record) = record_from_listing(product, &url, file) {
                            yield record;
                        }
                    }
                }
            }
        }
    }

    /// Build records of the mozilla-central nightlies of `month` (`YYYY/MM`).
    pub fn nightlies<'s>(
        &'s self,
        product: &'s str,
        month: &'s str,
        resume: &'s ScrapeResume,
    ) -> impl Stream<Item = Result<Record>> + 's {
        try_stream! {
            let month_url = archive_url(
                self.base_url,
                product,
                None,
                None,
                None,
                ArchiveFolder::Nightly(month),
            );
            let days: Vec<String> = fetch_listing(self.client, &month_url)
                .await?
                .prefixes
                .into_iter()
                .filter(|f| f.contains("mozilla-central"))
                .filter(|f| resume.wants_nightly(f))
                .map(|f| format!("{month_url}{f}"))
                .collect();
            log::info!("Scraping {} {} nightly folders of {}", days.len(), product, month);

            let listings = self.listings(days);
            pin_mut!(listings);
            while let Some((url, listing)) = listings.next().await {
                for file in &listing.files {
                    if let Some(record) = record_from_listing(product, &url, file) {
                        yield record;
                    }
                }
            }
        }
    }
}

/// Record for a listed file, when it is a build of `product`.
fn record_from_listing(product: &str, folder_url: &str, file: &ListingFile) -> Option<Record> {
    let url = format!("{folder_url}{}", file.name);
    if !is_build_url(product, &url) {
        return None;
    }
    match record_from_url(&url) {
        Ok(mut record) => {
            record.download.size = file.size;
            record.download.date = file.last_modified.as_deref().map(normalize_date);
            Some(record)
        }
        Err(e) => {
            log::warn!("Skipping {url}: {e}");
            None
        }
    }
}

/// Listing dates in the record date format; unknown formats pass through.
fn normalize_date(raw: &str) -> String {
    DateTime::parse_from_rfc3339(raw)
        .map(|date| date.with_timezone(&Utc).format(DATETIME_FORMAT).to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Order of version folders: `51.0a1 < 51.0b2 < 51.0rc1 < 51.0 < 51.0.1`.
///
/// Trailing zero components do not count, so `51` equals `51.0`. Unknown suffixes
/// such as `esr` sort as final releases.
fn compare_versions(a: &str, b: &str) -> Ordering {
    version_key(a).cmp(&version_key(b))
}

fn version_key(version: &str) -> (Vec<u32>, u8, u32) {
    let split = version
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(version.len());
    let (numbers, suffix) = version.split_at(split);

    let mut numbers: Vec<u32> = numbers
        .split('.')
        .filter_map(|n| n.parse().ok())
        .collect();
    while numbers.last() == Some(&0) {
        numbers.pop();
    }

    let (stage, serial) = if let Some(n) = suffix.strip_prefix("rc") {
        (2, n)
    } else if let Some(n) = suffix.strip_prefix('b') {
        (1, n)
    } else if let Some(n) = suffix.strip_prefix('a') {
        (0, n)
    } else {
        (3, "")
    };
    (numbers, stage, serial.parse().unwrap_or(0))
}
