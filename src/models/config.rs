//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Archive server access settings
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Bulk inventory decoding settings
    #[serde(default)]
    pub inventory: InventoryConfig,

    /// Remote record store settings
    #[serde(default)]
    pub publish: PublishConfig,

    /// Local cache files
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Override file values with deployment environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SERVER_URL") {
            self.publish.server_url = v;
        }
        if let Some(v) = lookup("BUCKET") {
            self.publish.bucket = v;
        }
        if let Some(v) = lookup("COLLECTION") {
            self.publish.collection = v;
        }
        if let Some(v) = lookup("AUTH") {
            self.publish.auth = Some(v);
        }
        if let Some(v) = lookup("CACHE_FOLDER") {
            self.cache.folder = PathBuf::from(v);
        }
        override_parsed(&lookup, "NB_RETRY_REQUEST", &mut self.archive.max_retries);
        override_parsed(&lookup, "TIMEOUT_SECONDS", &mut self.archive.timeout_secs);
        override_parsed(&lookup, "NB_PARALLEL_REQUESTS", &mut self.archive.max_concurrent);
        override_parsed(
            &lookup,
            "MIN_AGE_LAST_MODIFIED_HOURS",
            &mut self.inventory.min_age_last_modified_hours,
        );
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.archive.user_agent.trim().is_empty() {
            return Err(AppError::validation("archive.user_agent is empty"));
        }
        if self.archive.timeout_secs == 0 {
            return Err(AppError::validation("archive.timeout_secs must be > 0"));
        }
        if self.archive.max_concurrent == 0 {
            return Err(AppError::validation("archive.max_concurrent must be > 0"));
        }
        if self.archive.products.is_empty() {
            return Err(AppError::validation("No products defined"));
        }
        url::Url::parse(&self.archive.base_url)
            .map_err(|e| AppError::validation(format!("archive.base_url: {e}")))?;
        if !self.archive.base_url.ends_with('/') {
            return Err(AppError::validation("archive.base_url must end with '/'"));
        }
        if self.inventory.chunk_size == 0 {
            return Err(AppError::validation("inventory.chunk_size must be > 0"));
        }
        url::Url::parse(&self.publish.server_url)
            .map_err(|e| AppError::validation(format!("publish.server_url: {e}")))?;
        if self.publish.max_batch_size == 0 {
            return Err(AppError::validation("publish.max_batch_size must be > 0"));
        }
        if self.publish.workers == 0 {
            return Err(AppError::validation("publish.workers must be > 0"));
        }
        if self.publish.timeout_secs == 0 {
            return Err(AppError::validation("publish.timeout_secs must be > 0"));
        }
        if self.publish.queue_capacity == 0 {
            return Err(AppError::validation("publish.queue_capacity must be > 0"));
        }
        if let Some(auth) = &self.publish.auth {
            if !auth.contains(':') {
                return Err(AppError::validation(
                    "publish.auth must be in the form user:password",
                ));
            }
        }
        Ok(())
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("Ignoring {key}={raw:?}: not a valid number"),
        }
    }
}

/// Archive server access settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Archive root, ending with a slash
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Attempts before a transient failure is surfaced
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "defaults::backoff_base")]
    pub backoff_base_ms: u64,

    /// Backoff delay ceiling in milliseconds
    #[serde(default = "defaults::backoff_max")]
    pub backoff_max_ms: u64,

    /// Maximum concurrent listing/metadata requests
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Product folders to ingest
    #[serde(default = "defaults::products")]
    pub products: Vec<String>,
}

impl ArchiveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let delay = self.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            max_retries: defaults::max_retries(),
            backoff_base_ms: defaults::backoff_base(),
            backoff_max_ms: defaults::backoff_max(),
            max_concurrent: defaults::max_concurrent(),
            products: defaults::products(),
        }
    }
}

/// Bulk inventory decoding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Bytes read per chunk from the compressed inventory
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: usize,

    /// Only keep rows modified within this many hours (0 keeps everything)
    #[serde(default)]
    pub min_age_last_modified_hours: u64,

    /// Bucket holding the inventory deliveries
    #[serde(default = "defaults::s3_bucket")]
    pub s3_bucket: String,

    /// Folder template, `{inventory}` is replaced by the inventory name
    #[serde(default = "defaults::s3_prefix_template")]
    pub s3_prefix_template: String,

    /// Inventories read by a full run
    #[serde(default = "defaults::inventories")]
    pub inventories: Vec<String>,
}

impl InventoryConfig {
    /// Folder holding the deliveries of one inventory.
    pub fn s3_prefix(&self, inventory: &str) -> String {
        self.s3_prefix_template.replace("{inventory}", inventory)
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: defaults::chunk_size(),
            min_age_last_modified_hours: 0,
            s3_bucket: defaults::s3_bucket(),
            s3_prefix_template: defaults::s3_prefix_template(),
            inventories: defaults::inventories(),
        }
    }
}

/// Remote record store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Store root URL, e.g. `http://localhost:8888/v1`
    #[serde(default = "defaults::server_url")]
    pub server_url: String,

    #[serde(default = "defaults::bucket")]
    pub bucket: String,

    #[serde(default = "defaults::collection")]
    pub collection: String,

    /// Basic auth as `user:password`
    #[serde(default)]
    pub auth: Option<String>,

    /// Upper bound for records per batch; the server limit also applies
    #[serde(default = "defaults::max_batch_size")]
    pub max_batch_size: usize,

    /// Concurrent batch uploads
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Seconds to wait for more records before flushing a partial batch
    #[serde(default = "defaults::wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Records buffered between producer and publisher
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Drop records failing validation instead of publishing them
    #[serde(default = "defaults::strict")]
    pub strict: bool,

    /// Request timeout for store calls, in seconds
    #[serde(default = "defaults::publish_timeout")]
    pub timeout_secs: u64,
}

impl PublishConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            server_url: defaults::server_url(),
            bucket: defaults::bucket(),
            collection: defaults::collection(),
            auth: None,
            max_batch_size: defaults::max_batch_size(),
            workers: defaults::workers(),
            wait_timeout_secs: defaults::wait_timeout(),
            queue_capacity: defaults::queue_capacity(),
            strict: defaults::strict(),
            timeout_secs: defaults::publish_timeout(),
        }
    }
}

/// Local cache files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for change-detection and metadata caches
    #[serde(default = "defaults::cache_folder")]
    pub folder: PathBuf,

    /// Keep fetched metadata between runs
    #[serde(default = "defaults::persist_metadata")]
    pub persist_metadata: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            folder: defaults::cache_folder(),
            persist_metadata: defaults::persist_metadata(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Archive defaults
    pub fn base_url() -> String {
        "https://archive.mozilla.org/".into()
    }
    pub fn user_agent() -> String {
        "BuildHub;storage-team@mozilla.com".into()
    }
    pub fn timeout() -> u64 {
        300
    }
    pub fn max_retries() -> u32 {
        9
    }
    pub fn backoff_base() -> u64 {
        500
    }
    pub fn backoff_max() -> u64 {
        60_000
    }
    pub fn max_concurrent() -> usize {
        8
    }
    pub fn products() -> Vec<String> {
        ["firefox", "thunderbird", "mobile", "devedition"]
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    // Inventory defaults
    pub fn chunk_size() -> usize {
        1024 * 256
    }
    pub fn s3_bucket() -> String {
        "net-mozaws-prod-delivery-inventory-us-east-1".into()
    }
    pub fn s3_prefix_template() -> String {
        "public/inventories/net-mozaws-prod-delivery-{inventory}/delivery-{inventory}/".into()
    }
    pub fn inventories() -> Vec<String> {
        vec!["firefox".into(), "archive".into()]
    }

    // Publish defaults
    pub fn server_url() -> String {
        "http://localhost:8888/v1".into()
    }
    pub fn bucket() -> String {
        "build-hub".into()
    }
    pub fn collection() -> String {
        "releases".into()
    }
    pub fn max_batch_size() -> usize {
        25
    }
    pub fn workers() -> usize {
        3
    }
    pub fn wait_timeout() -> u64 {
        5
    }
    pub fn queue_capacity() -> usize {
        1000
    }
    pub fn strict() -> bool {
        true
    }
    pub fn publish_timeout() -> u64 {
        60
    }

    // Cache defaults
    pub fn cache_folder() -> PathBuf {
        PathBuf::from(".cache")
    }
    pub fn persist_metadata() -> bool {
        true
    }
}
