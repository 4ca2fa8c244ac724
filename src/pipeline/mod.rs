//! Pipeline stages and run entry points.
//!
//! - `run_inventory`: Decode a gzip CSV inventory and publish its builds
//! - `run_scrape`: Walk the archive nightly and release folders and publish their builds

pub mod changes;
pub mod ingest;
pub mod inventory;
pub mod publish;
pub mod scrape;

pub use changes::{ChangeIndex, fetch_existing};
pub use ingest::{RunSummary, run_inventory, run_scrape};
pub use inventory::{InventoryFilter, decode_inventory};
pub use publish::{PublishSummary, Publisher, record_channel};
