//! TOML configuration.
//!
//! Loaded once at startup by [`load_config`] and passed by reference to
//! every component. Secrets are never read from this file; see
//! [`crate::storage_s3`] and [`crate::warehouse_snowflake`] for the
//! environment variables they use.
//!
//! ```toml
//! [storage]
//! backend = "s3"
//!
//! [storage.s3]
//! bucket = "acme-landing"
//! prefix = "data/input/"
//! region = "us-east-1"
//!
//! [warehouse]
//! backend = "snowflake"
//!
//! [warehouse.snowflake]
//! account = "xy12345.us-east-1"
//! database = "ANALYTICS"
//! schema = "RAW"
//! warehouse = "LOAD_WH"
//!
//! [load]
//! size_threshold_bytes = 209715200
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::sql::is_simple_identifier;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub backend: String,
    pub s3: Option<S3StorageConfig>,
    pub filesystem: Option<FilesystemStorageConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3StorageConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemStorageConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub prefix: String,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WarehouseConfig {
    pub backend: String,
    #[serde(default = "default_audit_table")]
    pub audit_table: String,
    pub snowflake: Option<SnowflakeConfig>,
    pub sqlite: Option<SqliteConfig>,
}

fn default_audit_table() -> String {
    "METADATA_TABLE".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnowflakeConfig {
    /// Account identifier, e.g. `xy12345.us-east-1` or `myorg-myaccount`.
    pub account: String,
    pub database: String,
    pub schema: String,
    pub warehouse: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Overrides `https://<account>.snowflakecomputing.com`.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// `OAUTH` or `KEYPAIR_JWT`.
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Storage integration named in `COPY INTO ... STORAGE_INTEGRATION = <name>`.
    #[serde(default)]
    pub storage_integration: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_token_env() -> String {
    "SNOWFLAKE_TOKEN".to_string()
}
fn default_token_type() -> String {
    "OAUTH".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_statement_timeout_secs() -> u64 {
    3600
}
fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoadConfig {
    /// Objects at or below this size are skipped.
    #[serde(default = "default_size_threshold")]
    pub size_threshold_bytes: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// CSV records sampled for schema inference.
    #[serde(default = "default_sample_rows")]
    pub sample_rows: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Abort the run once more than this many objects have failed.
    #[serde(default)]
    pub max_failures: Option<usize>,
    /// When set, loaded objects are moved to `<archive_prefix><key>`.
    #[serde(default)]
    pub archive_prefix: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            size_threshold_bytes: default_size_threshold(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            sample_rows: default_sample_rows(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_failures: None,
            archive_prefix: None,
        }
    }
}

fn default_size_threshold() -> u64 {
    200 * 1024 * 1024
}
fn default_batch_size() -> usize {
    100
}
fn default_max_workers() -> usize {
    10
}
fn default_sample_rows() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Append logs to this file instead of stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Warehouse schema that qualifies destination tables, if the backend has one.
    pub fn target_schema(&self) -> Option<&str> {
        match self.warehouse.backend.as_str() {
            "snowflake" => self.warehouse.snowflake.as_ref().map(|s| s.schema.as_str()),
            _ => None,
        }
    }

    /// Key prefix every listed object starts with. Filesystem prefixes are
    /// directories, so they end in `/` unless empty.
    pub fn listing_prefix(&self) -> String {
        match self.storage.backend.as_str() {
            "s3" => self
                .storage
                .s3
                .as_ref()
                .map(|s3| s3.prefix.clone())
                .unwrap_or_default(),
            _ => match &self.storage.filesystem {
                Some(fs) if !fs.prefix.trim_matches('/').is_empty() => {
                    format!("{}/", fs.prefix.trim_matches('/'))
                }
                _ => String::new(),
            },
        }
    }

    /// Human-readable description of the configured source, e.g. `s3://bucket/prefix`.
    pub fn source_label(&self) -> String {
        match (&self.storage.s3, &self.storage.filesystem) {
            (Some(s3), _) if self.storage.backend == "s3" => {
                format!("s3://{}/{}", s3.bucket, s3.prefix)
            }
            (_, Some(fs)) => format!("{}/{}", fs.root.display(), fs.prefix),
            _ => self.storage.backend.clone(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    match config.storage.backend.as_str() {
        "s3" => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .context("storage.backend is 's3' but [storage.s3] is missing")?;
            if s3.bucket.is_empty() {
                bail!("storage.s3.bucket must not be empty");
            }
        }
        "filesystem" => {
            if config.storage.filesystem.is_none() {
                bail!("storage.backend is 'filesystem' but [storage.filesystem] is missing");
            }
        }
        other => bail!(
            "Unknown storage backend: '{}'. Must be s3 or filesystem.",
            other
        ),
    }

    if !is_simple_identifier(&config.warehouse.audit_table) {
        bail!(
            "warehouse.audit_table '{}' must match [A-Za-z_][A-Za-z0-9_]*",
            config.warehouse.audit_table
        );
    }

    match config.warehouse.backend.as_str() {
        "snowflake" => {
            let sf = config
                .warehouse
                .snowflake
                .as_ref()
                .context("warehouse.backend is 'snowflake' but [warehouse.snowflake] is missing")?;
            if config.storage.backend != "s3" {
                bail!("the snowflake warehouse can only bulk-copy from s3 storage");
            }
            for (field, value) in [
                ("database", Some(&sf.database)),
                ("schema", Some(&sf.schema)),
                ("warehouse", Some(&sf.warehouse)),
                ("role", sf.role.as_ref()),
                ("storage_integration", sf.storage_integration.as_ref()),
            ] {
                if let Some(v) = value {
                    if !is_simple_identifier(v) {
                        bail!(
                            "warehouse.snowflake.{} '{}' must match [A-Za-z_][A-Za-z0-9_]*",
                            field,
                            v
                        );
                    }
                }
            }
            match sf.token_type.as_str() {
                "OAUTH" | "KEYPAIR_JWT" => {}
                other => bail!(
                    "Unknown warehouse.snowflake.token_type: '{}'. Must be OAUTH or KEYPAIR_JWT.",
                    other
                ),
            }
        }
        "sqlite" => {
            if config.warehouse.sqlite.is_none() {
                bail!("warehouse.backend is 'sqlite' but [warehouse.sqlite] is missing");
            }
        }
        other => bail!(
            "Unknown warehouse backend: '{}'. Must be snowflake or sqlite.",
            other
        ),
    }

    if config.load.batch_size == 0 {
        bail!("load.batch_size must be > 0");
    }
    if config.load.max_workers == 0 {
        bail!("load.max_workers must be > 0");
    }
    if config.load.sample_rows == 0 {
        bail!("load.sample_rows must be > 0");
    }

    if tracing::Level::from_str(&config.logging.level).is_err() {
        bail!(
            "Unknown logging.level: '{}'. Must be trace, debug, info, warn or error.",
            config.logging.level
        );
    }

    if let Some(archive) = &config.load.archive_prefix {
        // Archived keys are `<archive_prefix><key>`; they must fall outside the listing.
        let listed = config.listing_prefix();
        if format!("{}{}", archive, listed).starts_with(&listed) {
            bail!(
                "load.archive_prefix '{}' would archive objects under the listing prefix '{}', \
                 so they would be loaded again on the next run",
                archive,
                listed
            );
        }
    }

    Ok(())
}
