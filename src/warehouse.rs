//! Warehouse abstraction.
//!
//! A [`Warehouse`] provisions destination tables, bulk-copies objects into
//! them, and keeps the audit table. Implementations must be safe to call
//! from many workers at once: the Snowflake backend issues independent
//! HTTP statements over a pooled client, the SQLite backend checks a
//! connection out of a `sqlx` pool per statement.
//!
//! ```text
//!  worker ─┐
//!  worker ─┼─▶ DestinationLocks ─▶ Warehouse ─▶ Snowflake SQL API / SQLite
//!  worker ─┘   (one lock per table)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::Config;
use crate::error::LoadError;
use crate::models::{FileFormat, InferredSchema, LoadMetadata, ReportRow, TableName};
use crate::retry::Attempt;
use crate::sql::Dialect;
use crate::storage::ObjectStore;
use crate::warehouse_snowflake::SnowflakeWarehouse;
use crate::warehouse_sqlite::SqliteWarehouse;

/// What the bulk loader hands to [`Warehouse::copy_into`].
#[derive(Debug, Clone)]
pub struct CopySource {
    /// Object key within the store.
    pub key: String,
    /// Location the warehouse reads from (e.g. `s3://bucket/key`).
    pub location: String,
    pub format: FileFormat,
}

/// Result of a bulk copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Rows the warehouse says it loaded, when it reports that.
    pub rows_loaded: Option<u64>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Create the audit table if it does not exist. Also serves as the
    /// startup connectivity check.
    async fn ensure_audit_table(&self) -> Result<(), LoadError>;

    /// Destroy and recreate `table` with `schema` plus the
    /// `load_timestamp` / `file_hash` columns.
    ///
    /// The write methods take the [`Attempt`] they run under; a backend
    /// that can deduplicate resubmitted requests keys them on it.
    async fn create_or_replace_table(
        &self,
        table: &TableName,
        schema: &InferredSchema,
        attempt: Attempt,
    ) -> Result<(), LoadError>;

    /// Load one object into `table`. The warehouse pulls the data itself.
    async fn copy_into(
        &self,
        table: &TableName,
        source: &CopySource,
        attempt: Attempt,
    ) -> Result<CopyReport, LoadError>;

    /// Fill `load_timestamp` / `file_hash` on rows that do not have them yet.
    async fn stamp_rows(
        &self,
        table: &TableName,
        load_timestamp: &str,
        file_hash: &str,
        attempt: Attempt,
    ) -> Result<(), LoadError>;

    /// Append one audit row.
    async fn record_load(&self, record: &LoadMetadata, attempt: Attempt) -> Result<(), LoadError>;

    /// Per-table load counts and average sizes from the audit table.
    async fn load_report(&self) -> Result<Vec<ReportRow>, LoadError>;
}

/// Build the warehouse named by `warehouse.backend`.
///
/// The SQLite backend needs the object store because it performs the
/// bulk copy locally.
pub async fn create_warehouse(
    config: &Config,
    store: Arc<dyn ObjectStore>,
) -> Result<Arc<dyn Warehouse>> {
    match config.warehouse.backend.as_str() {
        "snowflake" => {
            let sf = config
                .warehouse
                .snowflake
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Snowflake warehouse not configured"))?;
            Ok(Arc::new(SnowflakeWarehouse::from_env(
                sf,
                &config.warehouse.audit_table,
            )?))
        }
        "sqlite" => {
            let sqlite = config
                .warehouse
                .sqlite
                .clone()
                .ok_or_else(|| anyhow::anyhow!("SQLite warehouse not configured"))?;
            Ok(Arc::new(
                SqliteWarehouse::connect(
                    &sqlite,
                    &config.warehouse.audit_table,
                    config.load.max_workers as u32,
                    store,
                )
                .await?,
            ))
        }
        other => anyhow::bail!("Unknown warehouse backend: '{}'", other),
    }
}

/// Per-destination serialization for one run.
///
/// Provisioning, copying and stamping for a destination happen while
/// holding its lock. The guard also holds the schema the destination was
/// provisioned with in this run, so a second object mapping to the same
/// table appends instead of replacing the first object's rows.
#[derive(Default)]
pub struct DestinationLocks {
    locks: Mutex<HashMap<TableName, Arc<AsyncMutex<Option<InferredSchema>>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `table`. The guarded value is the
    /// provisioned schema, `None` until the table is created in this run.
    pub async fn acquire(&self, table: &TableName) -> OwnedMutexGuard<Option<InferredSchema>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(table.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;
    use std::time::Duration;

    #[tokio::test]
    async fn second_holder_sees_provisioned_schema() {
        let locks = Arc::new(DestinationLocks::new());
        let table = TableName::for_key("a/orders.csv", None);
        let schema = InferredSchema {
            columns: vec![Column::text("id")],
        };

        let mut first = locks.acquire(&table).await;
        assert!(first.is_none());

        let waiter = {
            let locks = locks.clone();
            let table = table.clone();
            tokio::spawn(async move { locks.acquire(&table).await.clone() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        *first = Some(schema.clone());
        drop(first);
        assert_eq!(waiter.await.unwrap(), Some(schema));
    }

    #[tokio::test]
    async fn distinct_tables_do_not_block() {
        let locks = DestinationLocks::new();
        let _a = locks.acquire(&TableName::for_key("a.csv", None)).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(&TableName::for_key("b.csv", None)),
        )
        .await;
        assert!(b.is_ok());
    }
}
