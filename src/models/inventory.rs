//! Bulk inventory rows and archive listings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// One header-less inventory CSV row: `Bucket,Key,Size,LastModifiedDate,md5`.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryEntry {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub md5: Option<String>,
}

impl InventoryEntry {
    /// Build an entry from CSV fields.
    pub fn from_fields(fields: &csv::StringRecord) -> Result<Self> {
        let field = |index: usize, name: &str| {
            fields
                .get(index)
                .ok_or_else(|| AppError::validation(format!("inventory row lacks {name}")))
        };

        let bucket = field(0, "Bucket")?.to_string();
        let key = field(1, "Key")?.to_string();
        // Sizes are sometimes written in float notation
        let size = field(2, "Size")?
            .trim()
            .parse::<f64>()
            .map_err(|e| AppError::validation(format!("bad size for {key}: {e}")))?;
        let last_modified = DateTime::parse_from_rfc3339(field(3, "LastModifiedDate")?.trim())
            .map_err(|e| AppError::validation(format!("bad date for {key}: {e}")))?
            .with_timezone(&Utc);
        let md5 = fields
            .get(4)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        Ok(Self {
            bucket,
            key,
            size: size.max(0.0) as u64,
            last_modified,
            md5,
        })
    }

    /// Directory part of the key.
    pub fn folder(&self) -> &str {
        self.key.rsplit_once('/').map_or("", |(dir, _)| dir)
    }

    /// Second path segment of the key (`pub/<product>/...`).
    pub fn product(&self) -> Option<&str> {
        self.key.split('/').nth(1)
    }
}

/// Archive directory listing: `{prefixes: [...], files: [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub prefixes: Vec<String>,
    pub files: Vec<ListingFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingFile {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified: Option<String>,
}
