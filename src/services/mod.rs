//! Service layer for the ingestion job.
//!
//! - Canonical record construction (`canonical`)
//! - Build metadata lookup (`MetadataFetcher`)
//! - Single-flight memoization (`MemoCache`)

pub mod canonical;
mod memo;
pub mod metadata;

pub use memo::MemoCache;
pub use metadata::{MetadataCaches, MetadataFetcher};
