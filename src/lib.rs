//! # Warehouse Loader
//!
//! A batch loader that moves large objects from storage into warehouse
//! tables.
//!
//! Each pass lists the objects under a storage prefix and skips those at or
//! below a size threshold. For every remaining object it infers a flat
//! all-text schema from the object's head, recreates a destination table
//! named after the file, and bulk-copies the object into it. Finally it
//! appends an audit row describing the load.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌─────────────────┐
//! │ ObjectStore │──▶│  Fan-out driver  │──▶│    Warehouse    │
//! │  S3 / FS    │   │ chunks × workers │   │ Snowflake/SQLite│
//! └─────────────┘   └────────┬─────────┘   └────────┬────────┘
//!                            │                      │
//!                            ▼                      ▼
//!                     ┌────────────┐         ┌─────────────┐
//!                     │ CLI summary│         │ audit table │
//!                     │  (wload)   │         │  (report)   │
//!                     └────────────┘         └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! wload init                    # create the audit table
//! wload load --dry-run          # preview skip/load decisions
//! wload load                    # run one pass
//! wload report                  # loads per table
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Per-object error taxonomy |
//! | [`storage`] | Object store abstraction |
//! | [`storage_s3`] | Amazon S3 store |
//! | [`storage_fs`] | Local filesystem store |
//! | [`schema`] | Schema inference |
//! | [`sql`] | Statement rendering |
//! | [`warehouse`] | Warehouse abstraction and destination locks |
//! | [`warehouse_snowflake`] | Snowflake SQL API backend |
//! | [`warehouse_sqlite`] | SQLite backend |
//! | [`audit`] | Audit record construction |
//! | [`retry`] | Retry policy |
//! | [`load`] | Fan-out load pipeline |
//! | [`report`] | Audit table report |
//! | [`validate`] | Content statistics |
//! | [`progress`] | Progress reporting |
//! | [`logging`] | Tracing setup |
//! | [`migrate`] | Audit table bootstrap |

pub mod audit;
pub mod config;
pub mod error;
pub mod load;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod report;
pub mod retry;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod storage_fs;
pub mod storage_s3;
pub mod validate;
pub mod warehouse;
pub mod warehouse_snowflake;
pub mod warehouse_sqlite;
