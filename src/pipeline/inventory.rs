// src/pipeline/inventory.rs

//! Streaming inventory decoder.
//!
//! Turns a gzip-compressed, header-less CSV byte stream into groups of entries sharing
//! one folder, without holding more than one chunk of the input in memory:
//!
//! ```text
//! bytes ─▶ gunzip ─▶ complete lines ─▶ CSV rows ─▶ filter ─▶ folder groups ─▶ dedup
//! ```

use std::collections::{HashMap, HashSet};
use std::io::Write;

use async_stream::try_stream;
use chrono::{DateTime, Duration, Utc};
use flate2::write::MultiGzDecoder;
use futures::{Stream, StreamExt, pin_mut};

use crate::error::{AppError, Result};
use crate::models::{InventoryConfig, InventoryEntry, Record};
use crate::services::canonical::{DATETIME_FORMAT, is_build_url, record_from_url};
use crate::utils::url::{has_artifact_extension, key_to_archive_url};

/// Incremental gzip decompressor.
///
/// A fed chunk may decompress to nothing while a deflate block is incomplete; that is
/// not the end of the stream. Gzip members may follow each other, as when the files of
/// one inventory delivery are streamed back to back.
pub struct GzipStreamDecoder {
    decoder: MultiGzDecoder<Vec<u8>>,
}

impl Default for GzipStreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipStreamDecoder {
    pub fn new() -> Self {
        Self {
            decoder: MultiGzDecoder::new(Vec::new()),
        }
    }

    /// Decompress one chunk, returning whatever output it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.decoder.write_all(chunk)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    /// Flush the remaining output at end of input.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.decoder.try_finish()?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }
}

/// Decompress a stream of gzip chunks; an empty input chunk ends the stream.
pub fn gunzip_chunks<S>(chunks: S) -> impl Stream<Item = Result<Vec<u8>>>
where
    S: Stream<Item = Result<Vec<u8>>>,
{
    try_stream! {
        pin_mut!(chunks);
        let mut decoder = GzipStreamDecoder::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                break;
            }
            let output = decoder.feed(&chunk)?;
            if !output.is_empty() {
                yield output;
            }
        }
        let tail = decoder.finish()?;
        if !tail.is_empty() {
            yield tail;
        }
    }
}

/// Buffers decompressed bytes and hands out complete lines only.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append bytes and take everything up to the last newline.
    fn push(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(bytes);
        match self.pending.iter().rposition(|b| *b == b'\n') {
            Some(end) => {
                let rest = self.pending.split_off(end + 1);
                std::mem::replace(&mut self.pending, rest)
            }
            None => Vec::new(),
        }
    }

    /// The final line, when the input does not end with a newline.
    fn finish(self) -> Vec<u8> {
        self.pending
    }
}

/// Parse complete CSV lines; a malformed row is logged and skipped.
fn parse_rows(lines: &[u8]) -> Vec<InventoryEntry> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(lines);

    let mut entries = Vec::new();
    for row in reader.records() {
        match row
            .map_err(AppError::from)
            .and_then(|fields| InventoryEntry::from_fields(&fields))
        {
            Ok(entry) => entries.push(entry),
            Err(e) => log::warn!("Skipping inventory row: {e}"),
        }
    }
    entries
}

/// Cheap checks applied to every row before any URL parsing.
#[derive(Debug, Clone, Default)]
pub struct InventoryFilter {
    /// Product folders to keep; empty keeps all
    pub products: HashSet<String>,
    /// Rows modified before this instant are dropped
    pub min_last_modified: Option<DateTime<Utc>>,
}

impl InventoryFilter {
    pub fn new(products: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            products: products.into_iter().map(Into::into).collect(),
            min_last_modified: None,
        }
    }

    /// Watermark from `min_age_last_modified_hours`, relative to `now`.
    pub fn with_max_age(mut self, hours: u64, now: DateTime<Utc>) -> Self {
        if hours > 0 {
            self.min_last_modified = i64::try_from(hours)
                .ok()
                .and_then(Duration::try_hours)
                .and_then(|age| now.checked_sub_signed(age));
        }
        self
    }

    pub fn from_config(config: &InventoryConfig, products: &[String]) -> Self {
        Self::new(products.iter().cloned())
            .with_max_age(config.min_age_last_modified_hours, Utc::now())
    }

    /// Extension, then watermark, then product.
    pub fn accepts(&self, entry: &InventoryEntry) -> bool {
        if !has_artifact_extension(&entry.key) {
            return false;
        }
        if self
            .min_last_modified
            .is_some_and(|watermark| entry.last_modified < watermark)
        {
            return false;
        }
        match entry.product() {
            Some(product) => self.products.is_empty() || self.products.contains(product),
            None => false,
        }
    }
}

/// Collects consecutive entries of one folder.
#[derive(Debug, Default)]
struct FolderGrouper {
    current: Vec<InventoryEntry>,
}

impl FolderGrouper {
    /// Add an entry; returns the previous group when the folder changes.
    fn push(&mut self, entry: InventoryEntry) -> Option<Vec<InventoryEntry>> {
        let changed = self
            .current
            .first()
            .is_some_and(|first| first.folder() != entry.folder());
        let done = if changed {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        };
        self.current.push(entry);
        done
    }

    fn finish(self) -> Option<Vec<InventoryEntry>> {
        (!self.current.is_empty()).then_some(self.current)
    }
}

/// Key of a Windows artifact with its installer/archive suffix removed.
fn windows_stem(key: &str) -> Option<String> {
    let (folder, filename) = key.rsplit_once('/').unwrap_or(("", key));
    if !folder.contains("win") && !filename.contains("win") {
        return None;
    }
    let normalized = filename.to_lowercase().replace(' ', "-");
    [".installer.exe", ".exe", ".zip"]
        .iter()
        .find_map(|suffix| normalized.strip_suffix(suffix))
        .map(str::to_string)
}

/// Keep one entry per Windows build published as both `.zip` and `.exe`.
///
/// The longest key of a variant set wins; other entries pass through in order.
pub fn dedup_installers(group: Vec<InventoryEntry>) -> Vec<InventoryEntry> {
    let mut chosen: HashMap<(String, String), usize> = HashMap::new();
    let mut kept: Vec<InventoryEntry> = Vec::with_capacity(group.len());

    for entry in group {
        let Some(stem) = windows_stem(&entry.key) else {
            kept.push(entry);
            continue;
        };
        let slot = (entry.folder().to_string(), stem);
        match chosen.get(&slot) {
            Some(&index) => {
                let dropped = if entry.key.len() > kept[index].key.len() {
                    std::mem::replace(&mut kept[index], entry)
                } else {
                    entry
                };
                log::debug!("Dropping duplicate Windows artifact {}", dropped.key);
            }
            None => {
                chosen.insert(slot, kept.len());
                kept.push(entry);
            }
        }
    }
    kept
}

/// Decode an inventory into filtered, deduplicated folder groups.
pub fn decode_inventory<S>(
    chunks: S,
    filter: InventoryFilter,
) -> impl Stream<Item = Result<Vec<InventoryEntry>>>
where
    S: Stream<Item = Result<Vec<u8>>>,
{
    try_stream! {
        let csv = gunzip_chunks(chunks);
        pin_mut!(csv);

        let mut lines = LineBuffer::default();
        let mut grouper = FolderGrouper::default();
        while let Some(bytes) = csv.next().await {
            let complete = lines.push(&bytes?);
            for entry in parse_rows(&complete) {
                if !filter.accepts(&entry) {
                    continue;
                }
                if let Some(group) = grouper.push(entry) {
                    yield dedup_installers(group);
                }
            }
        }

        for entry in parse_rows(&lines.finish()) {
            if !filter.accepts(&entry) {
                continue;
            }
            if let Some(group) = grouper.push(entry) {
                yield dedup_installers(group);
            }
        }
        if let Some(group) = grouper.finish() {
            yield dedup_installers(group);
        }
    }
}

/// Records for the build artifacts of one folder group.
///
/// Size and date come from the inventory row. Unparsable keys are logged and skipped.
pub fn records_from_group(base_url: &str, group: &[InventoryEntry]) -> Vec<Record> {
    let mut records = Vec::with_capacity(group.len());
    for entry in group {
        let Some(product) = entry.product() else {
            continue;
        };
        let url = key_to_archive_url(base_url, &entry.key);
        if !is_build_url(product, &url) {
            continue;
        }
        match record_from_url(&url) {
            Ok(mut record) => {
                record.download.size = Some(entry.size);
                record.download.date =
                    Some(entry.last_modified.format(DATETIME_FORMAT).to_string());
                records.push(record);
            }
            Err(e) => log::warn!("Skipping {url}: {e}"),
        }
    }
    records
}
