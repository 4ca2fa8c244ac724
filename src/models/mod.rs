// src/models/mod.rs

//! Domain models for the ingestion job.

mod config;
mod inventory;
mod metadata;
mod record;

// Re-export all public types
pub use config::{ArchiveConfig, CacheConfig, Config, InventoryConfig, PublishConfig};
pub use inventory::{InventoryEntry, Listing, ListingFile};
pub use metadata::Metadata;
pub use record::{
    Build, Channel, ChannelKind, Download, Os, Record, RecordBuilder, Source, SystemAddon,
    Target, build_record_id, normalized_platform,
};
