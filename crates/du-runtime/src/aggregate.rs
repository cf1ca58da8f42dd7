//! Parquet inventory decoding and per-owner folding.
//!
//! Only two columns of an inventory data file matter here: the object key and its size.
//! Everything else is left out of the projection so it is never decoded.

use std::collections::HashMap;

use arrow::array::{Array, ArrayRef, Int64Array, StringArray, UInt64Array};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use du_core::owner::owner_key;
use du_core::types::{ErrorClass, UsageRecord};
use du_inventory::FetchError;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ProjectionMask;
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: usize = 8192;
pub const KEY_COLUMN: &str = "key";
pub const SIZE_COLUMN: &str = "size";

/// Skipped-row diagnostics kept per file; the rest are only counted.
const MAX_ROW_DIAGNOSTICS: usize = 8;

#[derive(Debug, Clone)]
pub struct AggregateConfig {
    /// Rows per decoded record batch.
    pub batch_size: usize,
    pub key_column: String,
    pub size_column: String,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            key_column: KEY_COLUMN.to_string(),
            size_column: SIZE_COLUMN.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("downloaded {actual} bytes but manifest lists {expected}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("parquet decode failed: {0}")]
    Malformed(String),
    #[error("column {column:?} has unsupported type {data_type}")]
    UnsupportedColumnType { column: String, data_type: String },
    #[error("column length mismatch: {keys} key values vs {sizes} size values")]
    ColumnMismatch { keys: u64, sizes: u64 },
    #[error("decode task failed: {0}")]
    Task(String),
}

impl FileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FileError::Fetch(e) => e.class(),
            FileError::SizeMismatch { .. } | FileError::ColumnMismatch { .. } => {
                ErrorClass::Inconsistent
            }
            FileError::Malformed(_)
            | FileError::UnsupportedColumnType { .. }
            | FileError::Task(_) => ErrorClass::Malformed,
        }
    }
}

/// Owner → usage map built during one cycle (or for one file).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageAccumulator {
    records: HashMap<String, UsageRecord>,
}

impl UsageAccumulator {
    pub fn add(&mut self, owner: &str, size_bytes: u64) {
        match self.records.get_mut(owner) {
            Some(rec) => rec.add_object(size_bytes),
            None => {
                let mut rec = UsageRecord::new(owner);
                rec.add_object(size_bytes);
                self.records.insert(owner.to_string(), rec);
            }
        }
    }

    pub fn merge(&mut self, other: UsageAccumulator) {
        for (owner, rec) in other.records {
            match self.records.get_mut(&owner) {
                Some(existing) => existing.merge(&rec),
                None => {
                    self.records.insert(owner, rec);
                }
            }
        }
    }

    pub fn get(&self, owner: &str) -> Option<&UsageRecord> {
        self.records.get(owner)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> HashMap<String, UsageRecord> {
        self.records
    }
}

/// Contribution of one inventory data file.
#[derive(Debug, Clone, Default)]
pub struct FileUsage {
    pub usage: UsageAccumulator,
    pub rows_folded: u64,
    pub rows_skipped: u64,
    /// First few reasons rows were skipped.
    pub diagnostics: Vec<String>,
}

impl FileUsage {
    fn skip(&mut self, reason: impl FnOnce() -> String) {
        self.rows_skipped = self.rows_skipped.saturating_add(1);
        if self.diagnostics.len() < MAX_ROW_DIAGNOSTICS {
            self.diagnostics.push(reason());
        }
    }
}

/// Decodes one Parquet inventory file and folds its rows by owner.
///
/// The result is all-or-nothing for the file: if the key and size columns disagree on
/// cardinality nothing is returned. Individual bad rows (null values, negative sizes, keys
/// without an owner segment) are skipped and counted.
pub fn fold_parquet(bytes: Bytes, cfg: &AggregateConfig) -> Result<FileUsage, FileError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .map_err(|e| FileError::Malformed(format!("parquet reader init failed: {e}")))?;

    let schema = builder.schema().clone();
    let key_idx = schema.index_of(&cfg.key_column).ok();
    let size_idx = schema.index_of(&cfg.size_column).ok();
    if key_idx.is_none() && size_idx.is_none() {
        return Err(FileError::Malformed(format!(
            "neither {:?} nor {:?} column present",
            cfg.key_column, cfg.size_column
        )));
    }
    if let Some(idx) = key_idx {
        ensure_text(&cfg.key_column, schema.field(idx).data_type())?;
    }
    // Unsigned sizes are widened to UInt64 so values above i64::MAX survive the cast.
    let size_type = match size_idx {
        Some(idx) => {
            let dt = schema.field(idx).data_type();
            ensure_integer(&cfg.size_column, dt)?;
            if dt.is_unsigned_integer() {
                DataType::UInt64
            } else {
                DataType::Int64
            }
        }
        None => DataType::Int64,
    };

    let roots: Vec<usize> = key_idx.into_iter().chain(size_idx).collect();
    let mask = ProjectionMask::roots(builder.parquet_schema(), roots);
    let reader = builder
        .with_projection(mask)
        .with_batch_size(cfg.batch_size.max(1))
        .build()
        .map_err(|e| FileError::Malformed(format!("parquet reader build failed: {e}")))?;

    let mut out = FileUsage::default();
    let mut key_values: u64 = 0;
    let mut size_values: u64 = 0;

    for batch in reader {
        let batch =
            batch.map_err(|e| FileError::Malformed(format!("parquet read batch failed: {e}")))?;

        let keys = project(&batch, &cfg.key_column, &DataType::Utf8)?;
        let sizes = project(&batch, &cfg.size_column, &size_type)?;
        key_values += keys.as_ref().map_or(0, |a| a.len() as u64);
        size_values += sizes.as_ref().map_or(0, |a| a.len() as u64);

        let (Some(keys), Some(sizes)) = (keys, sizes) else {
            continue;
        };
        let keys = keys
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| FileError::Malformed("key column is not StringArray".to_string()))?;
        let sizes = SizeValues::from_array(&sizes)?;

        fold_rows(keys, &sizes, &mut out);
    }

    if key_values != size_values {
        return Err(FileError::ColumnMismatch {
            keys: key_values,
            sizes: size_values,
        });
    }
    Ok(out)
}

/// Size column after casting: signed sources land in Int64, unsigned ones in UInt64.
enum SizeValues<'a> {
    Signed(&'a Int64Array),
    Unsigned(&'a UInt64Array),
}

impl<'a> SizeValues<'a> {
    fn from_array(array: &'a ArrayRef) -> Result<Self, FileError> {
        let any = array.as_any();
        if let Some(a) = any.downcast_ref::<Int64Array>() {
            return Ok(SizeValues::Signed(a));
        }
        any.downcast_ref::<UInt64Array>()
            .map(SizeValues::Unsigned)
            .ok_or_else(|| FileError::Malformed("size column is not a 64-bit integer".to_string()))
    }

    fn len(&self) -> usize {
        match self {
            SizeValues::Signed(a) => a.len(),
            SizeValues::Unsigned(a) => a.len(),
        }
    }

    fn is_null(&self, i: usize) -> bool {
        match self {
            SizeValues::Signed(a) => a.is_null(i),
            SizeValues::Unsigned(a) => a.is_null(i),
        }
    }

    /// `Err` carries a negative signed value.
    fn value(&self, i: usize) -> Result<u64, i64> {
        match self {
            SizeValues::Signed(a) => {
                let v = a.value(i);
                u64::try_from(v).map_err(|_| v)
            }
            SizeValues::Unsigned(a) => Ok(a.value(i)),
        }
    }
}

fn fold_rows(keys: &StringArray, sizes: &SizeValues<'_>, out: &mut FileUsage) {
    for i in 0..keys.len().min(sizes.len()) {
        if keys.is_null(i) || sizes.is_null(i) {
            out.skip(|| format!("row with null key or size at batch offset {i}"));
            continue;
        }
        let key = keys.value(i);
        let size = match sizes.value(i) {
            Ok(size) => size,
            Err(negative) => {
                out.skip(|| format!("negative size {negative} for {key:?}"));
                continue;
            }
        };
        match owner_key(key) {
            Ok(owner) => {
                out.usage.add(owner, size);
                out.rows_folded = out.rows_folded.saturating_add(1);
            }
            Err(e) => out.skip(|| e.to_string()),
        }
    }
}

/// Column `name` of `batch` cast to `to`, or `None` when the file lacks it.
fn project(batch: &RecordBatch, name: &str, to: &DataType) -> Result<Option<ArrayRef>, FileError> {
    let Some(col) = batch.column_by_name(name) else {
        return Ok(None);
    };
    if col.data_type() == to {
        return Ok(Some(col.clone()));
    }
    cast(col.as_ref(), to)
        .map(Some)
        .map_err(|e| FileError::Malformed(format!("cast column {name:?} to {to} failed: {e}")))
}

fn ensure_text(column: &str, dt: &DataType) -> Result<(), FileError> {
    let ok = match dt {
        DataType::Utf8 | DataType::LargeUtf8 => true,
        DataType::Dictionary(_, value) => matches!(**value, DataType::Utf8 | DataType::LargeUtf8),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(FileError::UnsupportedColumnType {
            column: column.to_string(),
            data_type: dt.to_string(),
        })
    }
}

fn ensure_integer(column: &str, dt: &DataType) -> Result<(), FileError> {
    if dt.is_integer() {
        Ok(())
    } else {
        Err(FileError::UnsupportedColumnType {
            column: column.to_string(),
            data_type: dt.to_string(),
        })
    }
}
