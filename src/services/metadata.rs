// src/services/metadata.rs

//! Metadata fetcher.
//!
//! Looks up the build metadata published next to an artifact. Three strategies, picked
//! by [`BuildKind`]:
//!
//! - nightly: `<artifact>.json` of the en-US build, or a legacy `.txt`
//! - candidate: `<product>-<version>.json` in the en-US folder of the build
//! - release: the candidate build that was promoted, found through [`MetadataFetcher::scan_candidates`]
//!
//! Every lookup is memoized, including "checked, not found".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{ArchiveConfig, Metadata, Record};
use crate::services::canonical::{build_number_from_url, is_release_build_metadata};
use crate::services::memo::MemoCache;
use crate::utils::http::{ArchiveClient, fetch_listing};
use crate::utils::url::{
    ArchiveFolder, archive_url, localize_nightly_url, localize_release_candidate_url,
    replace_artifact_extension,
};

static LEGACY_WITH_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\n(http.+)/rev/(.+)$").expect("static legacy metadata pattern")
});
static LEGACY_STAMP_ONLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+) (.+)$").expect("static legacy metadata pattern"));
static PLATFORM_VARIANT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-(eme-free|sha1)").expect("static platform pattern"));

/// Repository assumed by legacy nightly files that only carry a revision.
const LEGACY_REPOSITORY: &str = "http://hg.mozilla.org/mozilla-central";

/// Which metadata strategy applies to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Nightly,
    Candidate,
    Release,
}

impl BuildKind {
    pub fn of(record: &Record) -> Self {
        if record.target.channel.contains("nightly") {
            BuildKind::Nightly
        } else if record.target.version.contains("rc") {
            BuildKind::Candidate
        } else {
            BuildKind::Release
        }
    }
}

/// Shared memo maps, injected into the fetcher.
#[derive(Default)]
pub struct MetadataCaches {
    /// Keyed by localized nightly URL
    pub nightly: MemoCache<String, Option<Metadata>>,
    /// Keyed by localized candidate URL
    pub candidate: MemoCache<String, Option<Metadata>>,
    /// Keyed by en-US candidate folder URL
    pub release: MemoCache<String, Option<Metadata>>,
    /// Product to `{version: build folder}`
    pub candidate_folders: MemoCache<String, Arc<HashMap<String, String>>>,
}

/// On-disk form of the metadata memo maps.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    #[serde(default)]
    pub nightly: HashMap<String, Option<Metadata>>,
    #[serde(default)]
    pub rc: HashMap<String, Option<Metadata>>,
    #[serde(default)]
    pub release: HashMap<String, Option<Metadata>>,
}

impl MetadataCaches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: MetadataSnapshot) -> Self {
        let caches = Self::default();
        caches.nightly.extend(snapshot.nightly);
        caches.candidate.extend(snapshot.rc);
        caches.release.extend(snapshot.release);
        caches
    }

    pub fn snapshot(&self) -> MetadataSnapshot {
        MetadataSnapshot {
            nightly: self.nightly.snapshot(),
            rc: self.candidate.snapshot(),
            release: self.release.snapshot(),
        }
    }
}

/// Fetches and memoizes build metadata.
pub struct MetadataFetcher {
    client: Arc<dyn ArchiveClient>,
    base_url: String,
    concurrency: usize,
    caches: Arc<MetadataCaches>,
}

impl MetadataFetcher {
    pub fn new(
        client: Arc<dyn ArchiveClient>,
        config: &ArchiveConfig,
        caches: Arc<MetadataCaches>,
    ) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            concurrency: config.max_concurrent.max(1),
            caches,
        }
    }

    pub fn caches(&self) -> &Arc<MetadataCaches> {
        &self.caches
    }

    /// Metadata for a record, `None` when the archive has none.
    pub async fn fetch_metadata(&self, record: &Record) -> Result<Option<Metadata>> {
        match BuildKind::of(record) {
            BuildKind::Nightly => self.fetch_nightly_metadata(record).await,
            BuildKind::Candidate => self.fetch_candidate_metadata(record).await,
            BuildKind::Release => self.fetch_release_metadata(record).await,
        }
    }

    async fn fetch_nightly_metadata(&self, record: &Record) -> Result<Option<Metadata>> {
        let key = localize_nightly_url(&record.download.url);
        self.caches
            .nightly
            .get_or_try_init(key.clone(), || self.lookup_nightly(&key))
            .await
    }

    async fn lookup_nightly(&self, url: &str) -> Result<Option<Metadata>> {
        let json_url = replace_artifact_extension(url, "json");
        if let Some(value) = self.client.get_json(&json_url).await? {
            return Ok(Metadata::from_value(value));
        }

        let txt_url = replace_artifact_extension(url, "txt");
        let metadata = self
            .client
            .get_text(&txt_url)
            .await?
            .and_then(|text| parse_legacy_metadata(&text));
        if metadata.is_none() {
            log::debug!("No nightly metadata for {url}");
        }
        Ok(metadata)
    }

    async fn fetch_candidate_metadata(&self, record: &Record) -> Result<Option<Metadata>> {
        let key = localize_release_candidate_url(&record.download.url);
        self.caches
            .candidate
            .get_or_try_init(key.clone(), || self.lookup_candidate(record, &key))
            .await
    }

    async fn lookup_candidate(&self, record: &Record, url: &str) -> Result<Option<Metadata>> {
        let product = record.source.product.as_str();
        let metadata_url = if product == "fennec" {
            replace_artifact_extension(url, "json")
        } else {
            let version = &record.target.version;
            let major = version.split("rc").next().unwrap_or(version);
            let product = if product == "devedition" {
                "firefox"
            } else {
                product
            };
            match url.rsplit_once('/') {
                Some((folder, _)) => format!("{folder}/{product}-{major}.json"),
                None => return Ok(None),
            }
        };

        match self.client.get_json(&metadata_url).await? {
            Some(value) => Ok(Metadata::from_value(value).map(|mut metadata| {
                if let Some(number) = build_number_from_url(url) {
                    metadata.insert("buildnumber", number);
                }
                metadata
            })),
            None => {
                log::warn!("No candidate metadata at {metadata_url}");
                Ok(None)
            }
        }
    }

    async fn fetch_release_metadata(&self, record: &Record) -> Result<Option<Metadata>> {
        let product = record.source.product.as_str();
        let version = record.target.version.as_str();

        let folders = self.scan_candidates(product).await?;
        let Some(folder) = folders.get(version) else {
            return Ok(None);
        };
        let build_number = folder_build_number(folder);

        let platform = PLATFORM_VARIANT.replace_all(&record.target.platform, "");
        let suffix = format!("/{folder}");
        let url = archive_url(
            &self.base_url,
            product,
            Some(version),
            Some(platform.as_ref()),
            Some("en-US"),
            ArchiveFolder::Candidates(&suffix),
        );

        let missing = AtomicBool::new(false);
        let metadata = self
            .caches
            .release
            .get_or_try_init(url.clone(), || {
                self.lookup_release(&url, product, version, build_number, &missing)
            })
            .await?;

        if missing.load(Ordering::SeqCst) {
            return Err(AppError::MissingMetadata { url });
        }
        Ok(metadata)
    }

    async fn lookup_release(
        &self,
        url: &str,
        product: &str,
        version: &str,
        build_number: Option<u32>,
        missing: &AtomicBool,
    ) -> Result<Option<Metadata>> {
        let listing = match fetch_listing(self.client.as_ref(), url).await {
            Ok(listing) => listing,
            // Partial updates never got a build folder listing
            Err(e) if !e.is_transient() => {
                log::debug!("No candidate listing at {url}: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        for file in listing
            .files
            .iter()
            .filter(|f| is_release_build_metadata(product, version, &f.name))
        {
            let file_url = format!("{url}{}", file.name);
            if let Some(mut metadata) = self
                .client
                .get_json(&file_url)
                .await?
                .and_then(Metadata::from_value)
            {
                if let Some(number) = build_number {
                    metadata.insert("buildnumber", number);
                }
                return Ok(Some(metadata));
            }
        }

        missing.store(true, Ordering::SeqCst);
        Ok(None)
    }

    /// Resolve `{version: latest build folder}` for a product, once per product.
    pub async fn scan_candidates(&self, product: &str) -> Result<Arc<HashMap<String, String>>> {
        let product = if product == "mobile" { "fennec" } else { product };
        self.caches
            .candidate_folders
            .get_or_try_init(product.to_string(), || self.list_candidate_builds(product))
            .await
    }

    async fn list_candidate_builds(&self, product: &str) -> Result<Arc<HashMap<String, String>>> {
        let client = self.client.as_ref();
        let base_url = self.base_url.as_str();

        let root = archive_url(base_url, product, None, None, None, ArchiveFolder::Candidates("/"));
        let listing = fetch_listing(client, &root).await?;
        let versions: Vec<String> = listing
            .prefixes
            .iter()
            .filter(|p| p.contains("-candidates"))
            .map(|p| p.trim_end_matches('/').trim_end_matches("-candidates").to_string())
            .collect();
        log::info!("Scanning {} candidate versions of {}", versions.len(), product);

        let mut builds = stream::iter(versions)
            .map(|version| async move {
                let url = archive_url(
                    base_url,
                    product,
                    Some(&version),
                    None,
                    None,
                    ArchiveFolder::Candidates("/"),
                );
                let result = fetch_listing(client, &url).await;
                (version, result)
            })
            .buffer_unordered(self.concurrency);

        let mut folders = HashMap::new();
        while let Some((version, result)) = builds.next().await {
            match result {
                Ok(listing) => {
                    if let Some(latest) = latest_build_folder(&listing.prefixes) {
                        folders.insert(version, latest);
                    }
                }
                Err(e) => log::warn!("Cannot list {product} {version} candidates: {e}"),
            }
        }
        Ok(Arc::new(folders))
    }
}

/// Latest `build<N>/` folder, compared by build number.
pub fn latest_build_folder(folders: &[String]) -> Option<String> {
    folders
        .iter()
        .filter(|f| f.starts_with("build"))
        .max_by(|a, b| {
            folder_build_number(a)
                .cmp(&folder_build_number(b))
                .then_with(|| a.cmp(b))
        })
        .cloned()
}

/// Digits of a `build<N>/` folder.
fn folder_build_number(folder: &str) -> Option<u32> {
    let digits: String = folder.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Parse the plain-text nightly metadata used before JSON files existed.
pub fn parse_legacy_metadata(text: &str) -> Option<Metadata> {
    let text = text.trim_end();
    let (buildid, repository, revision) = if let Some(caps) = LEGACY_WITH_REPO.captures(text) {
        (caps[1].to_string(), caps[2].to_string(), caps[3].to_string())
    } else if let Some(caps) = LEGACY_STAMP_ONLY.captures(text) {
        (
            caps[1].to_string(),
            LEGACY_REPOSITORY.to_string(),
            caps[2].to_string(),
        )
    } else {
        return None;
    };

    let mut metadata = Metadata::new();
    metadata.insert("buildid", buildid);
    metadata.insert("moz_source_repo", repository);
    metadata.insert("moz_source_stamp", revision);
    Some(metadata)
}
