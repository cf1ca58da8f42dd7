use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};

use du_core::location::InventoryLocation;
use du_core::types::ErrorClass;
use du_inventory::fs::FsBlobFetcher;
use du_inventory::resolver::{ManifestResolver, ManifestSource, ResolveError, ResolverConfig};
use du_inventory::{BlobFetcher, FetchError};

const INVENTORY_BUCKET: &str = "inventory-bucket";
const PREFIX: &str = "inv/attachments/SizesInventory";

fn temp_dir(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "du-inventory-{test_name}-{}-{}",
        std::process::id(),
        du_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

fn manifest_json(format: &str, files: &[(&str, u64)]) -> String {
    let files: Vec<serde_json::Value> = files
        .iter()
        .map(|(key, size)| serde_json::json!({"key": key, "size": size, "MD5checksum": "x"}))
        .collect();
    serde_json::json!({
        "sourceBucket": "attachments",
        "destinationBucket": "arn:aws:s3:::inventory-bucket",
        "version": "2016-11-30",
        "creationTimestamp": "1709600400000",
        "fileFormat": format,
        "fileSchema": "message s3.inventory { required binary key (UTF8); optional int64 size; }",
        "files": files,
    })
    .to_string()
}

fn location() -> InventoryLocation {
    InventoryLocation::parse(&format!("s3://{INVENTORY_BUCKET}/{PREFIX}")).unwrap()
}

fn resolver(fetcher: Arc<dyn BlobFetcher>) -> ManifestResolver {
    ManifestResolver::new(fetcher, location(), ResolverConfig::default()).unwrap()
}

#[derive(Default)]
struct RecordingFetcher {
    calls: Mutex<Vec<String>>,
    failure: Option<fn(&str, &str) -> FetchError>,
}

#[async_trait]
impl BlobFetcher for RecordingFetcher {
    async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
        self.calls
            .lock()
            .expect("calls mutex poisoned")
            .push(key.to_string());
        match self.failure {
            Some(f) => Err(f(bucket, key)),
            None => Err(FetchError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
        }
    }
}

fn access_denied(bucket: &str, key: &str) -> FetchError {
    FetchError::AccessDenied {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

#[tokio::test]
async fn scheduled_manifest_is_preferred() -> Result<()> {
    let root = temp_dir("scheduled")?;
    let fs = FsBlobFetcher::new(&root);
    fs.put(
        INVENTORY_BUCKET,
        &format!("{PREFIX}/2024-03-05T01-00Z/manifest.json"),
        manifest_json("Parquet", &[("data/a.parquet", 10)]).as_bytes(),
    )?;
    fs.put(
        INVENTORY_BUCKET,
        &format!("{PREFIX}/2024-03-04T01-00Z/manifest.json"),
        manifest_json("Parquet", &[("data/old.parquet", 10)]).as_bytes(),
    )?;

    let now = Utc.with_ymd_and_hms(2024, 3, 5, 9, 15, 0).unwrap();
    let resolved = resolver(Arc::new(fs)).resolve(now).await?;
    assert_eq!(resolved.source, ManifestSource::Scheduled);
    assert_eq!(
        resolved.manifest_key,
        format!("{PREFIX}/2024-03-05T01-00Z/manifest.json")
    );
    assert_eq!(resolved.manifest.files[0].key, "data/a.parquet");
    assert_eq!(resolved.manifest.source_bucket, "attachments");
    Ok(())
}

#[tokio::test]
async fn absent_scheduled_manifest_falls_back_to_prior_day() -> Result<()> {
    let root = temp_dir("fallback")?;
    let fs = FsBlobFetcher::new(&root);
    fs.put(
        INVENTORY_BUCKET,
        &format!("{PREFIX}/2024-03-04T01-00Z/manifest.json"),
        manifest_json("Parquet", &[("data/old.parquet", 10)]).as_bytes(),
    )?;

    let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 30, 0).unwrap();
    let resolved = resolver(Arc::new(fs)).resolve(now).await?;
    assert_eq!(resolved.source, ManifestSource::PriorDay);
    assert_eq!(
        resolved.manifest_key,
        format!("{PREFIX}/2024-03-04T01-00Z/manifest.json")
    );
    assert_eq!(resolved.manifest.files[0].key, "data/old.parquet");
    Ok(())
}

#[tokio::test]
async fn both_manifests_absent_is_not_found_after_exactly_two_fetches() -> Result<()> {
    let fetcher = Arc::new(RecordingFetcher::default());
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
    let err = resolver(fetcher.clone()).resolve(now).await.unwrap_err();

    match &err {
        ResolveError::NotFound {
            scheduled_key,
            prior_key,
        } => {
            assert!(scheduled_key.contains("2024-03-05T01-00Z"));
            assert!(prior_key.contains("2024-03-04T01-00Z"));
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert_eq!(fetcher.calls.lock().expect("calls mutex poisoned").len(), 2);
    Ok(())
}

#[tokio::test]
async fn access_denied_is_surfaced_without_fallback() -> Result<()> {
    let fetcher = Arc::new(RecordingFetcher {
        calls: Mutex::new(Vec::new()),
        failure: Some(access_denied as fn(&str, &str) -> FetchError),
    });
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
    let err = resolver(fetcher.clone()).resolve(now).await.unwrap_err();

    assert!(matches!(
        err,
        ResolveError::Fetch {
            source: FetchError::AccessDenied { .. },
            ..
        }
    ));
    assert_eq!(err.class(), ErrorClass::Transport);
    assert_eq!(fetcher.calls.lock().expect("calls mutex poisoned").len(), 1);
    Ok(())
}

#[tokio::test]
async fn missing_bucket_is_not_treated_as_absent_manifest() -> Result<()> {
    let root = temp_dir("no-bucket")?;
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
    let err = resolver(Arc::new(FsBlobFetcher::new(&root)))
        .resolve(now)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ResolveError::Fetch {
            source: FetchError::NoSuchBucket(_),
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn malformed_manifest_is_terminal() -> Result<()> {
    let root = temp_dir("malformed")?;
    let fs = FsBlobFetcher::new(&root);
    fs.put(
        INVENTORY_BUCKET,
        &format!("{PREFIX}/2024-03-05T01-00Z/manifest.json"),
        b"{\"sourceBucket\": ",
    )?;
    // A well-formed prior-day manifest must not rescue a malformed scheduled one.
    fs.put(
        INVENTORY_BUCKET,
        &format!("{PREFIX}/2024-03-04T01-00Z/manifest.json"),
        manifest_json("Parquet", &[]).as_bytes(),
    )?;

    let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
    let err = resolver(Arc::new(fs)).resolve(now).await.unwrap_err();
    assert!(matches!(err, ResolveError::Malformed { .. }));
    assert_eq!(err.class(), ErrorClass::Malformed);
    Ok(())
}

#[tokio::test]
async fn csv_inventory_is_rejected() -> Result<()> {
    let root = temp_dir("csv")?;
    let fs = FsBlobFetcher::new(&root);
    fs.put(
        INVENTORY_BUCKET,
        &format!("{PREFIX}/2024-03-05T01-00Z/manifest.json"),
        manifest_json("CSV", &[("data/a.csv.gz", 10)]).as_bytes(),
    )?;

    let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
    let err = resolver(Arc::new(fs)).resolve(now).await.unwrap_err();
    match err {
        ResolveError::UnsupportedFormat { format, .. } => assert_eq!(format, "CSV"),
        other => panic!("expected UnsupportedFormat, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn custom_cutoff_hour_changes_folder_name() -> Result<()> {
    let fetcher = Arc::new(RecordingFetcher::default());
    let r = ManifestResolver::new(
        fetcher.clone(),
        location(),
        ResolverConfig { cutoff_hour_utc: 6 },
    )?;
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
    let _ = r.resolve(now).await;
    let calls = fetcher.calls.lock().expect("calls mutex poisoned").clone();
    assert_eq!(
        calls,
        vec![
            format!("{PREFIX}/2024-03-05T06-00Z/manifest.json"),
            format!("{PREFIX}/2024-03-04T06-00Z/manifest.json"),
        ]
    );
    Ok(())
}

#[test]
fn cutoff_hour_is_validated_at_construction() {
    let err = ManifestResolver::new(
        Arc::new(RecordingFetcher::default()),
        location(),
        ResolverConfig {
            cutoff_hour_utc: 25,
        },
    )
    .err()
    .expect("expected invalid config");
    assert!(matches!(err, ResolveError::InvalidConfig(_)));
}

#[tokio::test]
async fn fs_fetcher_distinguishes_missing_key_from_missing_bucket() -> Result<()> {
    let root = temp_dir("fs-fetcher")?;
    let fs = FsBlobFetcher::new(&root);
    fs.put("present", "a/b.bin", b"hello")?;

    assert_eq!(&fs.fetch("present", "a/b.bin").await?[..], b"hello");
    assert!(fs.fetch("present", "a/missing.bin").await.unwrap_err().is_not_found());
    assert!(matches!(
        fs.fetch("absent", "a/b.bin").await.unwrap_err(),
        FetchError::NoSuchBucket(_)
    ));
    assert!(matches!(
        fs.fetch("present", "../escape").await.unwrap_err(),
        FetchError::InvalidKey(_)
    ));
    Ok(())
}

#[tokio::test]
async fn counting_fetcher_sees_single_fetch_on_hit() -> Result<()> {
    struct Counting {
        inner: FsBlobFetcher,
        calls: AtomicU64,
    }

    #[async_trait]
    impl BlobFetcher for Counting {
        async fn fetch(&self, bucket: &str, key: &str) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.inner.fetch(bucket, key).await
        }
    }

    let root = temp_dir("single-fetch")?;
    let inner = FsBlobFetcher::new(&root);
    inner.put(
        INVENTORY_BUCKET,
        &format!("{PREFIX}/2024-03-05T01-00Z/manifest.json"),
        manifest_json("parquet", &[]).as_bytes(),
    )?;
    let fetcher = Arc::new(Counting {
        inner,
        calls: AtomicU64::new(0),
    });
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap();
    let resolved = resolver(fetcher.clone()).resolve(now).await?;
    assert!(resolved.manifest.files.is_empty());
    assert_eq!(fetcher.calls.load(Ordering::Relaxed), 1);
    Ok(())
}
