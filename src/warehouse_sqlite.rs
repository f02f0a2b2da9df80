//! SQLite warehouse for local runs and tests.
//!
//! SQLite cannot pull from object storage, so [`SqliteWarehouse::copy_into`]
//! fetches the object through the same [`ObjectStore`] the loader lists
//! from, parses it, and inserts every row with bound parameters inside one
//! transaction. Column matching follows the bulk-copy options used on
//! Snowflake: CSV fields map by position (extra fields dropped, missing
//! ones NULL, empty ones NULL), JSON members map to the column whose name
//! equals the member name ignoring case, so a member that column-name
//! normalization renamed loads as NULL here just as it does on Snowflake.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Row, Sqlite};
use tracing::debug;

use crate::config::SqliteConfig;
use crate::error::{LoadError, Step};
use crate::models::{FileFormat, InferredSchema, LoadMetadata, ReportRow, TableName};
use crate::retry::Attempt;
use crate::schema::decode_utf8;
use crate::sql::{self, Dialect, SqlValue, Statement};
use crate::storage::ObjectStore;
use crate::warehouse::{CopyReport, CopySource, Warehouse};

const STAMP_COLUMNS: [&str; 2] = ["load_timestamp", "file_hash"];

pub struct SqliteWarehouse {
    pool: SqlitePool,
    audit_table: TableName,
    store: Arc<dyn ObjectStore>,
}

impl SqliteWarehouse {
    pub async fn connect(
        config: &SqliteConfig,
        audit_table: &str,
        max_connections: u32,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let db_path = &config.path;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Ok(Self::with_pool(pool, audit_table, store))
    }

    pub fn with_pool(pool: SqlitePool, audit_table: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            pool,
            audit_table: TableName {
                schema: None,
                name: audit_table.to_string(),
            },
            store,
        }
    }

    async fn execute(&self, step: Step, stmt: &Statement) -> Result<u64, LoadError> {
        let done = bind_all(sqlx::query(&stmt.sql), &stmt.params)
            .execute(&self.pool)
            .await
            .map_err(|e| LoadError::from_sqlx(step, e))?;
        Ok(done.rows_affected())
    }

    /// Data columns of `table` in declaration order, without the stamp columns.
    async fn data_columns(&self, table: &TableName) -> Result<Vec<String>, LoadError> {
        let rows = sqlx::query("SELECT name FROM pragma_table_info(?) ORDER BY cid")
            .bind(table.name.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LoadError::from_sqlx(Step::Copy, e))?;
        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get(0)
                .map_err(|e| LoadError::from_sqlx(Step::Copy, e))?;
            if !STAMP_COLUMNS.contains(&name.as_str()) {
                columns.push(name);
            }
        }
        if columns.is_empty() {
            return Err(LoadError::fatal(
                Step::Copy,
                format!("table {} does not exist", table),
            ));
        }
        Ok(columns)
    }
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn ensure_audit_table(&self) -> Result<(), LoadError> {
        let stmt = sql::create_audit_table(Dialect::Sqlite, &self.audit_table);
        self.execute(Step::Provision, &stmt).await?;
        Ok(())
    }

    async fn create_or_replace_table(
        &self,
        table: &TableName,
        schema: &InferredSchema,
        _attempt: Attempt,
    ) -> Result<(), LoadError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LoadError::from_sqlx(Step::Provision, e))?;
        for stmt in sql::create_or_replace_table(Dialect::Sqlite, table, schema) {
            bind_all(sqlx::query(&stmt.sql), &stmt.params)
                .execute(&mut *tx)
                .await
                .map_err(|e| LoadError::from_sqlx(Step::Provision, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| LoadError::from_sqlx(Step::Provision, e))
    }

    async fn copy_into(
        &self,
        table: &TableName,
        source: &CopySource,
        _attempt: Attempt,
    ) -> Result<CopyReport, LoadError> {
        let columns = self.data_columns(table).await?;
        let bytes = self.store.fetch(&source.key).await?;
        let content = decode_utf8(&bytes).map_err(|e| LoadError::fatal(Step::Copy, e.to_string()))?;
        let rows = match source.format {
            FileFormat::Csv => csv_rows(content, columns.len())?,
            FileFormat::Json => json_rows(content, &columns)?,
        };

        let column_refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        let insert = sql::insert_row(Dialect::Sqlite, table, &column_refs);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LoadError::from_sqlx(Step::Copy, e))?;
        for row in &rows {
            let mut query = sqlx::query(&insert);
            for value in row {
                query = query.bind(value.as_deref());
            }
            query
                .execute(&mut *tx)
                .await
                .map_err(|e| LoadError::from_sqlx(Step::Copy, e))?;
        }
        tx.commit()
            .await
            .map_err(|e| LoadError::from_sqlx(Step::Copy, e))?;

        debug!(table = %table, rows = rows.len(), key = %source.key, "copied rows");
        Ok(CopyReport {
            rows_loaded: Some(rows.len() as u64),
        })
    }

    async fn stamp_rows(
        &self,
        table: &TableName,
        load_timestamp: &str,
        file_hash: &str,
        _attempt: Attempt,
    ) -> Result<(), LoadError> {
        let stmt = sql::stamp_rows(Dialect::Sqlite, table, load_timestamp, file_hash);
        self.execute(Step::Stamp, &stmt).await?;
        Ok(())
    }

    async fn record_load(&self, record: &LoadMetadata, _attempt: Attempt) -> Result<(), LoadError> {
        let stmt = sql::insert_audit(Dialect::Sqlite, &self.audit_table, record);
        self.execute(Step::Record, &stmt).await?;
        Ok(())
    }

    async fn load_report(&self) -> Result<Vec<ReportRow>, LoadError> {
        let stmt = sql::load_report(Dialect::Sqlite, &self.audit_table);
        let rows = sqlx::query(&stmt.sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LoadError::from_sqlx(Step::Report, e))?;
        rows.iter()
            .map(|row| -> Result<ReportRow, LoadError> {
                Ok(ReportRow {
                    table_name: row
                        .try_get(0)
                        .map_err(|e| LoadError::from_sqlx(Step::Report, e))?,
                    load_count: row
                        .try_get(1)
                        .map_err(|e| LoadError::from_sqlx(Step::Report, e))?,
                    avg_size_mb: row
                        .try_get::<Option<f64>, _>(2)
                        .map_err(|e| LoadError::from_sqlx(Step::Report, e))?
                        .unwrap_or(0.0),
                })
            })
            .collect()
    }
}

fn bind_all<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Int(n) => query.bind(*n),
            SqlValue::Null => query.bind(None::<String>),
        };
    }
    query
}

/// CSV data rows padded or truncated to `width` fields.
fn csv_rows(content: &str, width: usize) -> Result<Vec<Vec<Option<String>>>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| LoadError::fatal(Step::Copy, format!("malformed CSV: {}", e)))?;
        let row = (0..width)
            .map(|i| {
                record
                    .get(i)
                    .filter(|field| !field.is_empty())
                    .map(str::to_string)
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// JSON records projected onto `columns`. A member fills the column whose
/// name equals it ignoring case.
fn json_rows(content: &str, columns: &[String]) -> Result<Vec<Vec<Option<String>>>, LoadError> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| LoadError::fatal(Step::Copy, format!("invalid JSON: {}", e)))?;
    let records = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let serde_json::Value::Object(map) = record else {
            return Err(LoadError::fatal(Step::Copy, "JSON record is not an object"));
        };
        let by_name: HashMap<String, serde_json::Value> = map
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        let row = columns
            .iter()
            .map(|column| match by_name.get(&column.to_lowercase()) {
                None | Some(serde_json::Value::Null) => None,
                Some(serde_json::Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            })
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_pad_and_truncate() {
        let rows = csv_rows("a,b\n1,2,3\n4\n5,\n", 2).unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Some("1".to_string()), Some("2".to_string())],
                vec![Some("4".to_string()), None],
                vec![Some("5".to_string()), None],
            ]
        );
    }

    #[test]
    fn json_rows_match_names_ignoring_case_only() {
        let columns = vec!["id".to_string(), "full_name".to_string(), "tags".to_string()];
        let rows = json_rows(
            r#"[{"ID": 1, "Full Name": "Ann", "tags": ["x"]}, {"id": 2, "extra": true}]"#,
            &columns,
        )
        .unwrap();
        // "Full Name" is not "full_name" ignoring case, same as a Snowflake copy.
        assert_eq!(
            rows[0],
            vec![Some("1".to_string()), None, Some("[\"x\"]".to_string())]
        );
        assert_eq!(rows[1], vec![Some("2".to_string()), None, None]);
    }

    #[test]
    fn json_rows_reject_scalars() {
        let err = json_rows("[1, 2]", &["a".to_string()]).unwrap_err();
        assert!(!err.is_retryable());
    }
}
