#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use arrow::array::{ArrayRef, Int64Array, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use tokio::sync::{Notify, Semaphore};

use du_inventory::fs::FsBlobFetcher;
use du_inventory::resolver::{manifest_stamp, publication_instant};
use du_inventory::{BlobFetcher, FetchError};

pub const INVENTORY_BUCKET: &str = "inventory-bucket";
pub const SOURCE_BUCKET: &str = "attachments";
pub const PREFIX: &str = "inv/attachments/SizesInventory";

pub fn temp_dir(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "du-runtime-{test_name}-{}-{}",
        std::process::id(),
        du_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

pub fn inventory_path() -> String {
    format!("s3://{INVENTORY_BUCKET}/{PREFIX}")
}

/// Parquet file shaped like an inventory report: bucket, key, size (nullable), storage class.
pub fn inventory_parquet(rows: &[(&str, Option<i64>)]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("bucket", DataType::Utf8, false),
        Field::new("key", DataType::Utf8, false),
        Field::new("size", DataType::Int64, true),
        Field::new("storage_class", DataType::Utf8, true),
    ]));
    let buckets: ArrayRef = Arc::new(StringArray::from(vec![SOURCE_BUCKET; rows.len()]));
    let keys: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
    ));
    let sizes: ArrayRef = Arc::new(Int64Array::from(
        rows.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
    ));
    let classes: ArrayRef = Arc::new(StringArray::from(vec![Some("STANDARD"); rows.len()]));
    let batch = RecordBatch::try_new(schema.clone(), vec![buckets, keys, sizes, classes])?;
    write_parquet(schema, batch)
}

/// Inventory file whose size column is unsigned 64-bit.
pub fn unsigned_sizes_parquet(rows: &[(&str, u64)]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("key", DataType::Utf8, false),
        Field::new("size", DataType::UInt64, false),
    ]));
    let keys: ArrayRef = Arc::new(StringArray::from(
        rows.iter().map(|(k, _)| *k).collect::<Vec<_>>(),
    ));
    let sizes: ArrayRef = Arc::new(UInt64Array::from(
        rows.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
    ));
    let batch = RecordBatch::try_new(schema.clone(), vec![keys, sizes])?;
    write_parquet(schema, batch)
}

/// Parquet file that carries object keys but no size column.
pub fn keys_only_parquet(keys: &[&str]) -> Result<Vec<u8>> {
    let schema = Arc::new(Schema::new(vec![Field::new("key", DataType::Utf8, false)]));
    let keys: ArrayRef = Arc::new(StringArray::from(keys.to_vec()));
    let batch = RecordBatch::try_new(schema.clone(), vec![keys])?;
    write_parquet(schema, batch)
}

fn write_parquet(schema: Arc<Schema>, batch: RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buf)
}

pub fn stamp_for(now: DateTime<Utc>) -> Result<String> {
    Ok(manifest_stamp(publication_instant(now, 1)?))
}

/// An inventory delivery laid out on disk the way the object store holds it.
pub struct InventoryFixture {
    pub fs: FsBlobFetcher,
    pub root: PathBuf,
}

impl InventoryFixture {
    pub fn new(test_name: &str) -> Result<Self> {
        let root = temp_dir(test_name)?;
        Ok(Self {
            fs: FsBlobFetcher::new(&root),
            root,
        })
    }

    /// Stores a data file in the source bucket and returns its manifest entry.
    pub fn put_data(&self, key: &str, bytes: &[u8]) -> Result<(String, u64)> {
        self.fs.put(SOURCE_BUCKET, key, bytes)?;
        Ok((key.to_string(), bytes.len() as u64))
    }

    pub fn put_manifest(&self, stamp: &str, files: &[(String, u64)]) -> Result<String> {
        let files: Vec<serde_json::Value> = files
            .iter()
            .map(|(key, size)| serde_json::json!({"key": key, "size": size, "MD5checksum": "x"}))
            .collect();
        let body = serde_json::json!({
            "sourceBucket": SOURCE_BUCKET,
            "destinationBucket": format!("arn:aws:s3:::{INVENTORY_BUCKET}"),
            "version": "2016-11-30",
            "creationTimestamp": "1709600400000",
            "fileFormat": "Parquet",
            "fileSchema": "message s3.inventory { required binary key (UTF8); optional int64 size; }",
            "files": files,
        })
        .to_string();
        let key = format!("{PREFIX}/{stamp}/manifest.json");
        self.fs.put(INVENTORY_BUCKET, &key, body.as_bytes())?;
        Ok(key)
    }
}

/// Passes fetches through, but once armed holds every data file fetch until released.
pub struct GatedFetcher {
    inner: FsBlobFetcher,
    armed: AtomicBool,
    gate: Semaphore,
    pub entered: Notify,
}

impl GatedFetcher {
    pub fn new(inner: FsBlobFetcher) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            gate: Semaphore::new(0),
            entered: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl BlobFetcher for GatedFetcher {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
        if bucket == SOURCE_BUCKET && self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            drop(permit);
        }
        self.inner.fetch(bucket, key).await
    }
}
