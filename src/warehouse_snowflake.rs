//! Snowflake warehouse over the SQL API v2.
//!
//! Every statement is a `POST /api/v2/statements` request carrying the
//! statement text and its positional bindings. Long-running statements
//! answer `202 Accepted` with a handle that is polled until the result is
//! ready, and cancelled if it outlives `statement_timeout_secs`. The API
//! is stateless, so concurrent workers share one pooled `reqwest::Client`
//! instead of a cursor. Resubmissions reuse the request id with
//! `retry=true`, so Snowflake never runs the same write twice.
//!
//! # Environment Variables
//!
//! - the variable named by `token_env` (default `SNOWFLAKE_TOKEN`): an
//!   OAuth access token or a key-pair JWT, matching `token_type`.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::SnowflakeConfig;
use crate::error::{LoadError, Step};
use crate::models::{InferredSchema, LoadMetadata, ReportRow, TableName};
use crate::retry::Attempt;
use crate::sql::{self, Dialect, SqlValue, Statement};
use crate::warehouse::{CopyReport, CopySource, Warehouse};

pub struct SnowflakeWarehouse {
    config: SnowflakeConfig,
    token: String,
    audit_table: TableName,
    base_url: String,
    client: reqwest::Client,
}

/// Rows returned by one statement, every cell as Snowflake's string form.
#[derive(Debug, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

impl SnowflakeWarehouse {
    pub fn from_env(config: SnowflakeConfig, audit_table: &str) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .with_context(|| format!("{} environment variable not set", config.token_env))?;
        Self::new(config, token, audit_table)
    }

    pub fn new(config: SnowflakeConfig, token: String, audit_table: &str) -> Result<Self> {
        let base_url = config
            .endpoint_url
            .clone()
            .unwrap_or_else(|| format!("https://{}.snowflakecomputing.com", config.account))
            .trim_end_matches('/')
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let audit_table = TableName {
            schema: Some(config.schema.clone()),
            name: audit_table.to_string(),
        };
        Ok(Self {
            config,
            token,
            audit_table,
            base_url,
            client,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("X-Snowflake-Authorization-Token-Type", &self.config.token_type)
            .header("Accept", "application/json")
    }

    /// Submit a statement and wait for its result.
    ///
    /// The request id comes from `attempt`, so a resubmission after a lost
    /// response carries the same id plus `retry=true` and Snowflake returns
    /// the earlier result instead of running the statement again.
    async fn execute(
        &self,
        step: Step,
        stmt: &Statement,
        attempt: Attempt,
    ) -> Result<ResultSet, LoadError> {
        let request_id = attempt.request_id;
        debug!(
            %request_id,
            retry = attempt.is_retry(),
            sql = %stmt.sql,
            params = stmt.params.len(),
            "submitting statement"
        );

        let resp = self
            .authorized(self.client.post(submit_url(&self.base_url, attempt)))
            .json(&request_body(&self.config, stmt))
            .send()
            .await
            .map_err(|e| LoadError::from_reqwest(step, e))?;

        let mut body = self.read_body(step, resp).await?;
        let deadline = Instant::now() + Duration::from_secs(self.config.statement_timeout_secs);

        // 202 bodies carry only the handle; poll until the result is ready.
        while body.get("data").is_none() && body.get("resultSetMetaData").is_none() {
            let handle = statement_handle(&body)
                .ok_or_else(|| {
                    LoadError::fatal(step, "response has neither data nor a statement handle")
                })?
                .to_string();
            if Instant::now() >= deadline {
                self.cancel(&handle).await;
                return Err(LoadError::retryable(
                    step,
                    format!("statement {} still running after timeout, cancelled", handle),
                ));
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
            let resp = self
                .authorized(
                    self.client
                        .get(format!("{}/api/v2/statements/{}", self.base_url, handle)),
                )
                .send()
                .await
                .map_err(|e| LoadError::from_reqwest(step, e))?;
            body = self.read_body(step, resp).await?;
        }

        let mut result = parse_result_set(&body);

        // Large results are split into partitions; partition 0 came inline.
        let partitions = body
            .pointer("/resultSetMetaData/partitionInfo")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(1);
        if partitions > 1 {
            let handle = statement_handle(&body)
                .ok_or_else(|| LoadError::fatal(step, "partitioned result without handle"))?;
            for partition in 1..partitions {
                let resp = self
                    .authorized(self.client.get(format!(
                        "{}/api/v2/statements/{}?partition={}",
                        self.base_url, handle, partition
                    )))
                    .send()
                    .await
                    .map_err(|e| LoadError::from_reqwest(step, e))?;
                let page = self.read_body(step, resp).await?;
                result.rows.extend(parse_result_set(&page).rows);
            }
        }

        Ok(result)
    }

    /// Best effort: a failed cancel is logged, the caller's error stands.
    async fn cancel(&self, handle: &str) {
        let url = format!("{}/api/v2/statements/{}/cancel", self.base_url, handle);
        match self.authorized(self.client.post(url)).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(handle, "cancelled statement");
            }
            Ok(resp) => warn!(handle, status = %resp.status(), "statement cancel rejected"),
            Err(e) => warn!(handle, error = %e, "statement cancel failed"),
        }
    }

    async fn read_body(&self, step: Step, resp: reqwest::Response) -> Result<Value, LoadError> {
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LoadError::from_reqwest(step, e))?;
        if !status.is_success() {
            return Err(LoadError::from_status(step, status, &text));
        }
        serde_json::from_str(&text)
            .map_err(|e| LoadError::fatal(step, format!("invalid SQL API response: {}", e)))
    }
}

#[async_trait]
impl Warehouse for SnowflakeWarehouse {
    fn name(&self) -> &str {
        "snowflake"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Snowflake
    }

    async fn ensure_audit_table(&self) -> Result<(), LoadError> {
        let stmt = sql::create_audit_table(Dialect::Snowflake, &self.audit_table);
        self.execute(Step::Provision, &stmt, Attempt::first()).await?;
        Ok(())
    }

    async fn create_or_replace_table(
        &self,
        table: &TableName,
        schema: &InferredSchema,
        attempt: Attempt,
    ) -> Result<(), LoadError> {
        // A single CREATE OR REPLACE on this dialect, so one request id.
        for stmt in sql::create_or_replace_table(Dialect::Snowflake, table, schema) {
            self.execute(Step::Provision, &stmt, attempt).await?;
        }
        Ok(())
    }

    async fn copy_into(
        &self,
        table: &TableName,
        source: &CopySource,
        attempt: Attempt,
    ) -> Result<CopyReport, LoadError> {
        let stmt = sql::copy_into(
            table,
            &source.location,
            source.format,
            self.config.storage_integration.as_deref(),
        );
        let result = self.execute(Step::Copy, &stmt, attempt).await?;
        Ok(copy_report(&result))
    }

    async fn stamp_rows(
        &self,
        table: &TableName,
        load_timestamp: &str,
        file_hash: &str,
        attempt: Attempt,
    ) -> Result<(), LoadError> {
        let stmt = sql::stamp_rows(Dialect::Snowflake, table, load_timestamp, file_hash);
        self.execute(Step::Stamp, &stmt, attempt).await?;
        Ok(())
    }

    async fn record_load(&self, record: &LoadMetadata, attempt: Attempt) -> Result<(), LoadError> {
        let stmt = sql::insert_audit(Dialect::Snowflake, &self.audit_table, record);
        self.execute(Step::Record, &stmt, attempt).await?;
        Ok(())
    }

    async fn load_report(&self) -> Result<Vec<ReportRow>, LoadError> {
        let stmt = sql::load_report(Dialect::Snowflake, &self.audit_table);
        let result = self.execute(Step::Report, &stmt, Attempt::first()).await?;
        result
            .rows
            .iter()
            .map(|row| -> Result<ReportRow, LoadError> {
                let cell = |i: usize| row.get(i).cloned().flatten().unwrap_or_default();
                let load_count = cell(1).parse::<i64>().map_err(|e| {
                    LoadError::fatal(Step::Report, format!("bad load_count: {}", e))
                })?;
                let avg_size_mb = cell(2).parse::<f64>().unwrap_or(0.0);
                Ok(ReportRow {
                    table_name: cell(0),
                    load_count,
                    avg_size_mb,
                })
            })
            .collect()
    }
}

/// JSON body for `POST /api/v2/statements`.
pub fn request_body(config: &SnowflakeConfig, stmt: &Statement) -> Value {
    let mut body = json!({
        "statement": stmt.sql,
        "timeout": config.statement_timeout_secs,
        "database": config.database,
        "schema": config.schema,
        "warehouse": config.warehouse,
    });
    if let Some(role) = &config.role {
        body["role"] = json!(role);
    }
    if !stmt.params.is_empty() {
        let mut bindings = Map::new();
        for (i, value) in stmt.params.iter().enumerate() {
            let (kind, value) = match value {
                SqlValue::Text(s) => ("TEXT", json!(s)),
                SqlValue::Float(f) => ("REAL", json!(f.to_string())),
                SqlValue::Int(n) => ("FIXED", json!(n.to_string())),
                SqlValue::Null => ("TEXT", Value::Null),
            };
            bindings.insert((i + 1).to_string(), json!({ "type": kind, "value": value }));
        }
        body["bindings"] = Value::Object(bindings);
    }
    body
}

fn submit_url(base_url: &str, attempt: Attempt) -> String {
    let mut url = format!("{}/api/v2/statements?requestId={}", base_url, attempt.request_id);
    if attempt.is_retry() {
        url.push_str("&retry=true");
    }
    url
}

fn statement_handle(body: &Value) -> Option<&str> {
    body.get("statementHandle").and_then(Value::as_str)
}

fn parse_result_set(body: &Value) -> ResultSet {
    let columns = body
        .pointer("/resultSetMetaData/rowType")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(|c| c.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    let rows = body
        .get("data")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| {
                    row.as_array()
                        .map(|cells| {
                            cells
                                .iter()
                                .map(|cell| match cell {
                                    Value::Null => None,
                                    Value::String(s) => Some(s.clone()),
                                    other => Some(other.to_string()),
                                })
                                .collect()
                        })
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();
    ResultSet { columns, rows }
}

/// Sum `rows_loaded` across the per-file rows `COPY INTO` returns.
fn copy_report(result: &ResultSet) -> CopyReport {
    let Some(idx) = result.column_index("rows_loaded") else {
        return CopyReport { rows_loaded: None };
    };
    let mut total = 0u64;
    for row in &result.rows {
        match row.get(idx).cloned().flatten().map(|v| v.parse::<u64>()) {
            Some(Ok(n)) => total += n,
            _ => {
                warn!(row = ?row, "unparseable rows_loaded in COPY result");
                return CopyReport { rows_loaded: None };
            }
        }
    }
    CopyReport {
        rows_loaded: Some(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SnowflakeConfig {
        SnowflakeConfig {
            account: "xy12345".to_string(),
            database: "ANALYTICS".to_string(),
            schema: "RAW".to_string(),
            warehouse: "LOAD_WH".to_string(),
            role: Some("LOADER".to_string()),
            endpoint_url: None,
            token_env: "SNOWFLAKE_TOKEN".to_string(),
            token_type: "OAUTH".to_string(),
            storage_integration: None,
            timeout_secs: 60,
            statement_timeout_secs: 600,
            poll_interval_ms: 10,
        }
    }

    #[test]
    fn body_carries_positional_bindings() {
        let stmt = Statement::new("INSERT INTO T (a, b, c) VALUES (?, ?, ?)")
            .bind(SqlValue::Text("o'brien".to_string()))
            .bind(SqlValue::Float(1.5))
            .bind(SqlValue::Int(7));
        let body = request_body(&config(), &stmt);
        assert_eq!(body["statement"], "INSERT INTO T (a, b, c) VALUES (?, ?, ?)");
        assert_eq!(body["role"], "LOADER");
        assert_eq!(body["timeout"], 600);
        assert_eq!(body["bindings"]["1"]["type"], "TEXT");
        assert_eq!(body["bindings"]["1"]["value"], "o'brien");
        assert_eq!(body["bindings"]["2"]["type"], "REAL");
        assert_eq!(body["bindings"]["3"]["value"], "7");
    }

    #[test]
    fn resubmission_url_keeps_request_id() {
        let first = Attempt::first();
        let url = submit_url("https://x.snowflakecomputing.com", first);
        assert_eq!(
            url,
            format!("https://x.snowflakecomputing.com/api/v2/statements?requestId={}", first.request_id)
        );
        let again = Attempt { number: 2, ..first };
        assert_eq!(submit_url("https://x.snowflakecomputing.com", again), format!("{}&retry=true", url));
    }

    #[test]
    fn body_omits_empty_bindings() {
        let body = request_body(&config(), &Statement::new("SELECT 1"));
        assert!(body.get("bindings").is_none());
    }

    #[test]
    fn copy_result_rows_loaded_are_summed() {
        let body = json!({
            "resultSetMetaData": {
                "rowType": [{"name": "file"}, {"name": "status"}, {"name": "rows_loaded"}]
            },
            "data": [
                ["s3://b/a.csv", "LOADED", "10"],
                ["s3://b/a.csv", "LOADED", "5"]
            ]
        });
        let result = parse_result_set(&body);
        assert_eq!(copy_report(&result).rows_loaded, Some(15));
    }

    #[test]
    fn copy_result_without_counts() {
        let body = json!({
            "resultSetMetaData": {"rowType": [{"name": "status"}]},
            "data": [["Copy executed with 0 files processed."]]
        });
        assert_eq!(copy_report(&parse_result_set(&body)).rows_loaded, None);
    }

    #[test]
    fn audit_table_is_schema_qualified() {
        let wh = SnowflakeWarehouse::new(config(), "token".to_string(), "METADATA_TABLE").unwrap();
        assert_eq!(wh.audit_table.to_string(), "RAW.METADATA_TABLE");
        assert_eq!(wh.base_url, "https://xy12345.snowflakecomputing.com");
    }
}
