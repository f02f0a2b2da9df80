//! Content validation statistics.
//!
//! `wload validate` fetches objects and reports, per object, how many rows
//! and columns it has and how many cells are null. A CSV cell is null when
//! it is empty or missing from a short row; a JSON cell is null when the
//! value is `null` or the member is absent from that record. Nothing is
//! written to the warehouse.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::config::Config;
use crate::error::{LoadError, Step};
use crate::models::{FileFormat, ValidationStats};
use crate::schema::decode_utf8;
use crate::storage::create_store;

pub fn validation_stats(content: &str, format: FileFormat) -> Result<ValidationStats, LoadError> {
    match format {
        FileFormat::Csv => csv_stats(content),
        FileFormat::Json => json_stats(content),
    }
}

fn csv_stats(content: &str) -> Result<ValidationStats, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());
    let width = reader
        .headers()
        .map_err(|e| LoadError::fatal(Step::Infer, format!("malformed CSV header: {}", e)))?
        .len();

    let mut stats = ValidationStats {
        column_count: width as u64,
        ..Default::default()
    };
    for record in reader.records() {
        let record =
            record.map_err(|e| LoadError::fatal(Step::Infer, format!("malformed CSV: {}", e)))?;
        stats.row_count += 1;
        let present = record.len().min(width);
        stats.null_count += record.iter().take(present).filter(|f| f.is_empty()).count() as u64;
        stats.null_count += (width - present) as u64;
    }
    Ok(stats)
}

fn json_stats(content: &str) -> Result<ValidationStats, LoadError> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| LoadError::fatal(Step::Infer, format!("invalid JSON: {}", e)))?;
    let records = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut columns: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for record in &records {
        let serde_json::Value::Object(map) = record else {
            return Err(LoadError::fatal(Step::Infer, "JSON record is not an object"));
        };
        for key in map.keys() {
            if seen.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }

    let mut stats = ValidationStats {
        row_count: records.len() as u64,
        column_count: columns.len() as u64,
        ..Default::default()
    };
    for record in &records {
        if let serde_json::Value::Object(map) = record {
            stats.null_count += columns
                .iter()
                .filter(|c| matches!(map.get(c.as_str()), None | Some(serde_json::Value::Null)))
                .count() as u64;
        }
    }
    Ok(stats)
}

/// Run the validate command over every listed object, or just `key`.
pub async fn run_validate(config: &Config, key: Option<&str>) -> Result<()> {
    let store = create_store(config)?;
    let keys: Vec<String> = match key {
        Some(k) => vec![k.to_string()],
        None => store
            .list()
            .await
            .context("listing objects")?
            .into_iter()
            .map(|o| o.key)
            .collect(),
    };

    println!("validate {}", config.source_label());
    let mut failures = 0usize;
    for key in &keys {
        let format = FileFormat::from_key(key);
        let result = async {
            let bytes = store.fetch(key).await?;
            validation_stats(decode_utf8(&bytes)?, format)
        }
        .await;
        match result {
            Ok(stats) => println!(
                "  {}: rows={} columns={} nulls={}",
                key, stats.row_count, stats.column_count, stats.null_count
            ),
            Err(err) => {
                warn!(key = %key, error = %err, "validation failed");
                println!("  {}: error: {}", key, err);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} object(s) could not be validated", failures, keys.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_counts_empty_and_missing_cells() {
        let stats = validation_stats("a,b,c\n1,,3\n4\n7,8,9\n", FileFormat::Csv).unwrap();
        assert_eq!(
            stats,
            ValidationStats {
                null_count: 3,
                row_count: 3,
                column_count: 3,
            }
        );
    }

    #[test]
    fn json_uses_union_of_keys() {
        let stats = validation_stats(
            r#"[{"a": 1, "b": null}, {"a": 2, "c": "x"}]"#,
            FileFormat::Json,
        )
        .unwrap();
        assert_eq!(stats.row_count, 2);
        assert_eq!(stats.column_count, 3);
        // b null, c missing in first; b missing in second
        assert_eq!(stats.null_count, 3);
    }

    #[test]
    fn json_scalar_records_are_rejected() {
        assert!(validation_stats("[1]", FileFormat::Json).is_err());
    }
}
