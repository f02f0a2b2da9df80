//! Schema inference.
//!
//! Samples the head of an object and derives a flat, ordered column list.
//! Every column is declared as generic text; no type detection happens.
//! Each run replaces the destination's definition, so there is no merge or
//! evolution logic either.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{LoadError, Step};
use crate::models::{Column, FileFormat, InferredSchema};

/// Infer a schema from decoded object content.
///
/// CSV reads the header plus up to `sample_rows` records so that ragged
/// rows near the top surface as errors; JSON takes the first element of a
/// top-level array (or the top-level object itself).
pub fn infer_schema(
    content: &str,
    format: FileFormat,
    sample_rows: usize,
) -> Result<InferredSchema, LoadError> {
    let raw = match format {
        FileFormat::Csv => csv_header(content, sample_rows)?,
        FileFormat::Json => json_keys(content)?,
    };
    if raw.is_empty() {
        return Err(LoadError::fatal(Step::Infer, "no columns found"));
    }

    let names = dedupe(
        raw.iter()
            .enumerate()
            .map(|(i, name)| {
                let normalized = normalize_column_name(name);
                if normalized.is_empty() {
                    format!("column_{}", i + 1)
                } else {
                    normalized
                }
            })
            .collect(),
    );
    debug!(format = format.as_str(), columns = ?names, "inferred schema");
    if format == FileFormat::Json {
        // Bulk copy matches JSON members to columns by name, ignoring case only.
        for (member, column) in raw.iter().zip(&names) {
            if !member.eq_ignore_ascii_case(column) {
                warn!(member = %member, column = %column, "JSON member does not match its column name; it will load as NULL");
            }
        }
    }

    Ok(InferredSchema {
        columns: names.into_iter().map(Column::text).collect(),
    })
}

/// Trim, replace whitespace with `_`, lowercase.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect::<String>()
        .to_lowercase()
}

/// Decode object bytes as UTF-8.
pub fn decode_utf8(bytes: &[u8]) -> Result<&str, LoadError> {
    std::str::from_utf8(bytes)
        .map_err(|e| LoadError::fatal(Step::Infer, format!("content is not valid UTF-8: {}", e)))
}

fn csv_header(content: &str, sample_rows: usize) -> Result<Vec<String>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| LoadError::fatal(Step::Infer, format!("invalid CSV header: {}", e)))?
        .iter()
        .map(str::to_string)
        .collect();

    for record in reader.records().take(sample_rows) {
        record.map_err(|e| LoadError::fatal(Step::Infer, format!("malformed CSV sample: {}", e)))?;
    }

    Ok(headers)
}

fn json_keys(content: &str) -> Result<Vec<String>, LoadError> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| LoadError::fatal(Step::Infer, format!("invalid JSON: {}", e)))?;

    let sample = match &value {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| LoadError::fatal(Step::Infer, "JSON array is empty"))?,
        other => other,
    };

    match sample {
        Value::Object(map) => Ok(map.keys().cloned().collect()),
        _ => Err(LoadError::fatal(
            Step::Infer,
            "JSON sample is not an object",
        )),
    }
}

/// Suffix repeated names with `_2`, `_3`, ... so the DDL stays valid.
fn dedupe(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                name
            } else {
                format!("{}_{}", name, count)
            }
        })
        .collect()
}
