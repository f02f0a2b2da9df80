//! Statement rendering for both warehouse dialects.
//!
//! Values always travel as bound parameters (`?` placeholders plus a
//! [`SqlValue`] list). Identifiers cannot be bound, so they are quoted here;
//! the one literal that cannot be bound (the storage location in
//! `COPY INTO`) goes through [`quote_literal`].

use crate::models::{ColumnType, FileFormat, InferredSchema, LoadMetadata, TableName};

/// SQL flavour of the destination warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Snowflake,
    Sqlite,
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Float(f64),
    Int(i64),
    Null,
}

/// Statement text with positional `?` placeholders and their values.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: SqlValue) -> Self {
        self.params.push(value);
        self
    }
}

/// Timestamp text format used for audit rows and bindings.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_simple_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Quote an identifier.
///
/// On Snowflake, simple identifiers are uppercased before quoting so that
/// `"FULL_NAME"` resolves the same as an unquoted `full_name`. Anything
/// else is quoted verbatim with embedded `"` doubled.
pub fn quote_ident(dialect: Dialect, ident: &str) -> String {
    let body = match dialect {
        Dialect::Snowflake if is_simple_identifier(ident) => ident.to_ascii_uppercase(),
        _ => ident.to_string(),
    };
    format!("\"{}\"", body.replace('"', "\"\""))
}

pub fn qualified(dialect: Dialect, table: &TableName) -> String {
    match (&table.schema, dialect) {
        (Some(schema), Dialect::Snowflake) => {
            format!("{}.{}", quote_ident(dialect, schema), quote_ident(dialect, &table.name))
        }
        _ => quote_ident(dialect, &table.name),
    }
}

/// Render a string literal. Snowflake treats `\` as an escape inside
/// single-quoted strings, so it is doubled there as well as `'`.
pub fn quote_literal(dialect: Dialect, value: &str) -> String {
    let escaped = match dialect {
        Dialect::Snowflake => value.replace('\\', "\\\\").replace('\'', "''"),
        Dialect::Sqlite => value.replace('\'', "''"),
    };
    format!("'{}'", escaped)
}

fn type_name(dialect: Dialect, column_type: ColumnType) -> &'static str {
    match (dialect, column_type) {
        (Dialect::Snowflake, ColumnType::Text) => "VARCHAR",
        (Dialect::Sqlite, ColumnType::Text) => "TEXT",
    }
}

/// Create-or-replace DDL for a data table, with the `load_timestamp` and
/// `file_hash` columns appended.
///
/// SQLite has no `CREATE OR REPLACE`, so it gets a drop followed by a
/// create; callers run both in one transaction.
pub fn create_or_replace_table(
    dialect: Dialect,
    table: &TableName,
    schema: &InferredSchema,
) -> Vec<Statement> {
    let mut columns: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(dialect, &c.name), type_name(dialect, c.column_type)))
        .collect();
    columns.push(format!("{} TIMESTAMP", quote_ident(dialect, "load_timestamp")));
    columns.push(format!(
        "{} {}",
        quote_ident(dialect, "file_hash"),
        type_name(dialect, ColumnType::Text)
    ));
    let target = qualified(dialect, table);

    match dialect {
        Dialect::Snowflake => vec![Statement::new(format!(
            "CREATE OR REPLACE TABLE {} ({})",
            target,
            columns.join(", ")
        ))],
        Dialect::Sqlite => vec![
            Statement::new(format!("DROP TABLE IF EXISTS {}", target)),
            Statement::new(format!("CREATE TABLE {} ({})", target, columns.join(", "))),
        ],
    }
}

/// Snowflake bulk copy pulling straight from the storage location.
pub fn copy_into(
    table: &TableName,
    location: &str,
    format: FileFormat,
    storage_integration: Option<&str>,
) -> Statement {
    let dialect = Dialect::Snowflake;
    let integration = storage_integration
        .map(|i| format!(" STORAGE_INTEGRATION = {}", quote_ident(dialect, i)))
        .unwrap_or_default();
    let options = match format {
        FileFormat::Csv => {
            "FILE_FORMAT = (TYPE = CSV SKIP_HEADER = 1 ERROR_ON_COLUMN_COUNT_MISMATCH = FALSE)"
        }
        FileFormat::Json => {
            "FILE_FORMAT = (TYPE = JSON STRIP_OUTER_ARRAY = TRUE) MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE"
        }
    };
    Statement::new(format!(
        "COPY INTO {} FROM {}{} {}",
        qualified(dialect, table),
        quote_literal(dialect, location),
        integration,
        options
    ))
}

/// Stamp freshly copied rows with the load timestamp and content hash.
pub fn stamp_rows(dialect: Dialect, table: &TableName, timestamp: &str, hash: &str) -> Statement {
    Statement::new(format!(
        "UPDATE {} SET {} = ?, {} = ? WHERE {} IS NULL",
        qualified(dialect, table),
        quote_ident(dialect, "load_timestamp"),
        quote_ident(dialect, "file_hash"),
        quote_ident(dialect, "load_timestamp"),
    ))
    .bind(SqlValue::Text(timestamp.to_string()))
    .bind(SqlValue::Text(hash.to_string()))
}

pub fn create_audit_table(dialect: Dialect, audit_table: &TableName) -> Statement {
    let (float, int) = match dialect {
        Dialect::Snowflake => ("FLOAT", "INT"),
        Dialect::Sqlite => ("REAL", "INTEGER"),
    };
    let text = type_name(dialect, ColumnType::Text);
    Statement::new(format!(
        "CREATE TABLE IF NOT EXISTS {} (file_name {text}, file_size_mb {float}, table_name {text}, \
         load_timestamp TIMESTAMP, file_hash {text}, record_count {int})",
        qualified(dialect, audit_table),
    ))
}

/// Parameterized audit insert. No value is interpolated into the text.
pub fn insert_audit(dialect: Dialect, audit_table: &TableName, record: &LoadMetadata) -> Statement {
    Statement::new(format!(
        "INSERT INTO {} (file_name, file_size_mb, table_name, load_timestamp, file_hash, record_count) \
         VALUES (?, ?, ?, ?, ?, ?)",
        qualified(dialect, audit_table)
    ))
    .bind(SqlValue::Text(record.file_name.clone()))
    .bind(SqlValue::Float(record.file_size_mb))
    .bind(SqlValue::Text(record.table_name.clone()))
    .bind(SqlValue::Text(
        record.load_timestamp.format(TIMESTAMP_FORMAT).to_string(),
    ))
    .bind(SqlValue::Text(record.file_hash.clone()))
    .bind(SqlValue::Int(record.record_count as i64))
}

pub fn load_report(dialect: Dialect, audit_table: &TableName) -> Statement {
    Statement::new(format!(
        "SELECT table_name, COUNT(*) AS load_count, AVG(file_size_mb) AS avg_size_mb \
         FROM {} GROUP BY table_name ORDER BY table_name",
        qualified(dialect, audit_table)
    ))
}

/// Row insert used by the SQLite backend's local bulk copy.
pub fn insert_row(dialect: Dialect, table: &TableName, columns: &[&str]) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(dialect, c)).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified(dialect, table),
        names.join(", "),
        placeholders
    )
}
