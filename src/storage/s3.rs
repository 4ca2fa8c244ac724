// src/storage/s3.rs

//! S3 inventory deliveries.
//!
//! Each inventory folder holds one dated sub-folder per delivery. The latest one has a
//! `manifest.json` naming the gzip CSV files of the delivery, which are streamed back
//! to back as raw byte chunks.

use std::sync::LazyLock;

use async_stream::try_stream;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use futures::Stream;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::InventoryConfig;

/// Delivery folder names, e.g. `2017-07-01T03-09Z/`.
static DELIVERY_FOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/(\d{4}-\d{2}-\d{2}T\d{2}-\d{2}Z)/$").expect("static delivery folder pattern")
});

const INVENTORY_REGION: &str = "us-east-1";

#[derive(Debug, Deserialize)]
struct Manifest {
    files: Vec<ManifestFile>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    key: String,
}

/// Reader for the inventory bucket.
pub struct S3Inventory {
    client: Client,
    bucket: String,
}

impl S3Inventory {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Anonymous client for the public inventory bucket.
    pub async fn from_config(config: &InventoryConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(INVENTORY_REGION))
            .no_credentials()
            .load()
            .await;
        Self::new(Client::new(&sdk_config), &config.s3_bucket)
    }

    /// Folder of the most recent delivery under `prefix`.
    pub async fn latest_delivery(&self, prefix: &str) -> Result<String> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .delimiter("/")
            .send()
            .await
            .map_err(|e| AppError::S3(e.into_service_error().to_string()))?;

        let folders: Vec<String> = output
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .map(str::to_string)
            .collect();
        latest_dated_folder(&folders)
            .ok_or_else(|| AppError::S3(format!("no delivery under s3://{}/{prefix}", self.bucket)))
    }

    async fn manifest(&self, folder: &str) -> Result<Manifest> {
        let key = format!("{folder}manifest.json");
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| AppError::S3(e.into_service_error().to_string()))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| AppError::S3(e.to_string()))?;
        Ok(serde_json::from_slice(&bytes.into_bytes())?)
    }

    /// Raw gzip chunks of every file in the latest delivery of `inventory`.
    pub fn inventory_chunks<'a>(
        &'a self,
        config: &'a InventoryConfig,
        inventory: &'a str,
    ) -> impl Stream<Item = Result<Vec<u8>>> + 'a {
        try_stream! {
            let folder = self.latest_delivery(&config.s3_prefix(inventory)).await?;
            let manifest = self.manifest(&folder).await?;
            info!("Reading {} files of s3://{}/{}", manifest.files.len(), self.bucket, folder);

            for file in manifest.files {
                let key = format!("public/{}", file.key);
                debug!("Streaming s3://{}/{}", self.bucket, key);
                let output = self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| AppError::S3(e.into_service_error().to_string()))?;

                let mut body = output.body;
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(|e| AppError::S3(e.to_string()))?;
                    yield chunk.to_vec();
                }
            }
        }
    }
}

/// Latest folder named after a delivery timestamp.
fn latest_dated_folder(folders: &[String]) -> Option<String> {
    folders
        .iter()
        .filter_map(|f| {
            DELIVERY_FOLDER
                .captures(f)
                .and_then(|c| c.get(1))
                .map(|stamp| (stamp.as_str().to_string(), f))
        })
        .max()
        .map(|(_, folder)| folder.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_dated_folder() {
        let prefix = "public/inventories/net-mozaws-prod-delivery-firefox/delivery-firefox/";
        let folders = vec![
            format!("{prefix}2017-07-01T03-09Z/"),
            format!("{prefix}data/"),
            format!("{prefix}2017-08-02T03-09Z/"),
            format!("{prefix}hive/"),
        ];
        assert_eq!(
            latest_dated_folder(&folders),
            Some(format!("{prefix}2017-08-02T03-09Z/"))
        );
        assert_eq!(latest_dated_folder(&[format!("{prefix}data/")]), None);
    }

    #[test]
    fn test_manifest_shape() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"sourceBucket": "x", "files": [{"key": "inventories/a.csv.gz", "size": 1}]}"#,
        )
        .unwrap();
        assert_eq!(manifest.files[0].key, "inventories/a.csv.gz");
    }
}
