//! Warehouse bootstrap for `wload init`.

use anyhow::{Context, Result};

use crate::config::Config;
use crate::storage::create_store;
use crate::warehouse::create_warehouse;

/// Connect to the configured warehouse and create the audit table if it is
/// missing. Existing audit rows are kept.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let store = create_store(config)?;
    let warehouse = create_warehouse(config, store).await?;
    warehouse
        .ensure_audit_table()
        .await
        .with_context(|| format!("creating audit table on {}", warehouse.name()))?;
    Ok(())
}
