//! Audit record construction.
//!
//! Builds the [`LoadMetadata`] row written after a successful bulk copy.
//! Writing it is the warehouse's job ([`crate::warehouse::Warehouse::record_load`]),
//! always through a parameterized insert.

use chrono::{NaiveDateTime, Timelike, Utc};
use sha2::{Digest, Sha256};

use crate::error::{LoadError, Step};
use crate::models::{FileFormat, LoadMetadata, TableName};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Hex SHA-256 of the raw object bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Number of data records: CSV records after the header, or JSON array
/// length (a lone object counts as one).
pub fn record_count(content: &str, format: FileFormat) -> Result<u64, LoadError> {
    match format {
        FileFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .flexible(true)
                .from_reader(content.as_bytes());
            let mut count = 0u64;
            for record in reader.records() {
                record.map_err(|e| LoadError::fatal(Step::Infer, format!("malformed CSV: {}", e)))?;
                count += 1;
            }
            Ok(count)
        }
        FileFormat::Json => {
            let value: serde_json::Value = serde_json::from_str(content)
                .map_err(|e| LoadError::fatal(Step::Infer, format!("invalid JSON: {}", e)))?;
            Ok(match value {
                serde_json::Value::Array(items) => items.len() as u64,
                _ => 1,
            })
        }
    }
}

pub fn size_in_mb(size: u64) -> f64 {
    size as f64 / BYTES_PER_MB
}

/// Current UTC time truncated to whole seconds.
pub fn load_timestamp() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}

pub fn build_record(
    key: &str,
    size: u64,
    table: &TableName,
    load_timestamp: NaiveDateTime,
    file_hash: String,
    record_count: u64,
) -> LoadMetadata {
    LoadMetadata {
        file_name: key.to_string(),
        file_size_mb: size_in_mb(size),
        table_name: table.to_string(),
        load_timestamp,
        file_hash,
        record_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_record_count_handles_quoted_newlines() {
        let content = "id,note\n1,\"line one\nline two\"\n2,plain\n";
        assert_eq!(record_count(content, FileFormat::Csv).unwrap(), 2);
    }

    #[test]
    fn json_record_count() {
        assert_eq!(record_count("[{}, {}, {}]", FileFormat::Json).unwrap(), 3);
        assert_eq!(record_count("{\"a\": 1}", FileFormat::Json).unwrap(), 1);
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn record_carries_qualified_table_and_mb() {
        let table = TableName::for_key("in/sales.csv", Some("RAW"));
        let ts = load_timestamp();
        let record = build_record("in/sales.csv", 300 * 1024 * 1024, &table, ts, "h".into(), 7);
        assert_eq!(record.table_name, "RAW.SALES");
        assert!((record.file_size_mb - 300.0).abs() < f64::EPSILON);
        assert_eq!(record.load_timestamp.nanosecond(), 0);
    }
}
