//! Load report from the audit table.
//!
//! Summarizes what has been loaded so far: one line per destination table
//! with its load count and average object size. `--json` produces the
//! dashboard form consumed by external charting.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::models::ReportRow;
use crate::storage::create_store;
use crate::warehouse::create_warehouse;

/// Dashboard entry: loads per table.
#[derive(Debug, Serialize, PartialEq)]
pub struct DashboardEntry {
    pub table: String,
    pub count: i64,
}

pub fn render_text(rows: &[ReportRow]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&format!(
            "Table: {}, Loads: {}, Avg_Size_MB: {:.2}\n",
            row.table_name, row.load_count, row.avg_size_mb
        ));
    }
    out
}

pub fn render_json(rows: &[ReportRow]) -> Result<String> {
    let entries: Vec<DashboardEntry> = rows
        .iter()
        .map(|r| DashboardEntry {
            table: r.table_name.clone(),
            count: r.load_count,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}

/// Run the report command: query the audit table and print or write the result.
pub async fn run_report(config: &Config, json: bool, output: Option<&Path>) -> Result<()> {
    let store = create_store(config)?;
    let warehouse = create_warehouse(config, store).await?;
    let rows = warehouse
        .load_report()
        .await
        .context("querying audit table")?;

    let rendered = if json {
        render_json(&rows)?
    } else if rows.is_empty() {
        "No loads recorded.\n".to_string()
    } else {
        render_text(&rows)
    };

    match output {
        Some(path) => {
            std::fs::write(path, &rendered)
                .with_context(|| format!("writing report to {}", path.display()))?;
            println!("Report written to {}", path.display());
        }
        None => {
            print!("{}", rendered);
            if json {
                println!();
            }
        }
    }
    Ok(())
}
