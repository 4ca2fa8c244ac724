//! Buildhub CLI
//!
//! Local execution entry point for inventory ingestion and archive scraping.

use std::path::PathBuf;
use std::sync::Arc;

use buildhub::{
    error::{AppError, Result},
    models::Config,
    pipeline,
    storage::{KintoStore, RecordStore, file_chunks},
    utils::http::{ArchiveClient, HttpArchiveClient},
};
use clap::{Parser, Subcommand};

/// Buildhub - release record ingestion
#[derive(Parser, Debug)]
#[command(
    name = "buildhub",
    version,
    about = "Publish canonical build records from archive inventories"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "buildhub.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a gzip CSV inventory
    Inventory {
        /// Local inventory file
        #[arg(long)]
        file: Option<PathBuf>,

        /// Read the latest S3 deliveries instead of a file
        #[cfg(feature = "s3")]
        #[arg(long)]
        s3: bool,

        /// Inventories to read from S3 (default: configured inventories)
        #[cfg(feature = "s3")]
        #[arg(long = "inventory", requires = "s3")]
        inventories: Vec<String>,
    },

    /// Scrape release folders of the archive
    Scrape {
        /// Products to scrape (default: configured products)
        #[arg(long = "product")]
        products: Vec<String>,
    },

    /// Validate configuration
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn clients(config: &Config) -> Result<(Arc<dyn ArchiveClient>, Arc<dyn RecordStore>)> {
    let archive: Arc<dyn ArchiveClient> = Arc::new(HttpArchiveClient::new(&config.archive)?);
    let store: Arc<dyn RecordStore> = Arc::new(KintoStore::new(&config.publish)?);
    Ok((archive, store))
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::load_or_default(&cli.config);
    config.apply_env_overrides();
    log::info!("Loaded configuration from {}", cli.config.display());

    if let Err(e) = config.validate() {
        log::error!("Config validation failed: {}", e);
        return Err(e);
    }

    match cli.command {
        #[cfg(feature = "s3")]
        Command::Inventory {
            s3: true,
            inventories,
            ..
        } => {
            let inventories = if inventories.is_empty() {
                config.inventory.inventories.clone()
            } else {
                inventories
            };
            let (archive, store) = clients(&config)?;
            let bucket = buildhub::storage::s3::S3Inventory::from_config(&config.inventory).await;
            for inventory in &inventories {
                log::info!("Reading inventory {inventory}");
                let chunks = bucket.inventory_chunks(&config.inventory, inventory);
                pipeline::run_inventory(&config, Arc::clone(&archive), Arc::clone(&store), chunks)
                    .await?;
            }
        }

        Command::Inventory { file, .. } => {
            let Some(path) = file else {
                return Err(AppError::config("inventory needs --file or --s3"));
            };
            let (archive, store) = clients(&config)?;
            let chunks = file_chunks(path, config.inventory.chunk_size);
            pipeline::run_inventory(&config, archive, store, chunks).await?;
        }

        Command::Scrape { products } => {
            let products = if products.is_empty() {
                config.archive.products.clone()
            } else {
                products
            };
            let (archive, store) = clients(&config)?;
            pipeline::run_scrape(&config, archive, store, &products).await?;
        }

        Command::Validate => {
            log::info!("✓ Config OK");
        }
    }

    log::info!("Done!");

    Ok(())
}
