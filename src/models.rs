//! Core data models used throughout the loader.
//!
//! These types are transient: each is created and consumed within a single
//! load pass. Nothing here is persisted in-process across runs.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// A storage object as returned by the listing call. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Full key (path within bucket, or path relative to the filesystem root).
    pub key: String,
    /// Size in bytes as reported by the listing.
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Input format of an object, detected from its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    /// `.json` keys are JSON; everything else is treated as CSV.
    pub fn from_key(key: &str) -> Self {
        if key.to_ascii_lowercase().ends_with(".json") {
            FileFormat::Json
        } else {
            FileFormat::Csv
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "CSV",
            FileFormat::Json => "JSON",
        }
    }
}

/// The only declared column type. Inference performs no type detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::Text,
        }
    }
}

/// Ordered column list derived from sampling an object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InferredSchema {
    pub columns: Vec<Column>,
}

impl InferredSchema {
    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Destination table, optionally qualified by a warehouse schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// Derive the destination table for an object key.
    ///
    /// Takes the base filename up to its first `.`, replaces every byte
    /// outside `[A-Za-z0-9]` with `_` and uppercases the result. Distinct
    /// keys may map to the same name (`a/sales.csv`, `b/sales.json`).
    pub fn for_key(key: &str, schema: Option<&str>) -> Self {
        let base = key.rsplit('/').next().unwrap_or(key);
        let stem = base.split('.').next().unwrap_or(base);
        let mut name: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        if name.is_empty() {
            name.push('_');
        }
        Self {
            schema: schema.map(str::to_string),
            name,
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One audit row describing a completed load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadMetadata {
    pub file_name: String,
    pub file_size_mb: f64,
    pub table_name: String,
    pub load_timestamp: NaiveDateTime,
    pub file_hash: String,
    pub record_count: u64,
}

/// What happened to one listed object.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Skipped { key: String, size: u64 },
    Loaded(LoadMetadata),
}

#[derive(Debug, Clone)]
pub struct ObjectFailure {
    pub key: String,
    pub error: String,
}

/// Result of one full pass.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub listed: usize,
    pub skipped: usize,
    pub loaded: Vec<LoadMetadata>,
    pub failed: Vec<ObjectFailure>,
    /// Destination tables targeted by more than one object in this run.
    pub collisions: Vec<String>,
}

/// Per-table aggregate from the audit table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub table_name: String,
    pub load_count: i64,
    pub avg_size_mb: f64,
}

/// Content statistics for one object, produced by `wload validate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub null_count: u64,
    pub row_count: u64,
    pub column_count: u64,
}
