//! Integration tests for the SQLite warehouse backend.
//!
//! Runs the loader end to end against a temporary filesystem store and a
//! temporary SQLite database.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tempfile::TempDir;
use warehouse_loader::config::{load_config, Config, FilesystemStorageConfig};
use warehouse_loader::load::{load_objects, LoadContext};
use warehouse_loader::models::{LoadMetadata, TableName};
use warehouse_loader::progress::NoProgress;
use warehouse_loader::retry::Attempt;
use warehouse_loader::sql::{create_audit_table, Dialect};
use warehouse_loader::storage::{create_store, ObjectStore};
use warehouse_loader::storage_fs::FsStore;
use warehouse_loader::warehouse::{create_warehouse, Warehouse};
use warehouse_loader::warehouse_sqlite::SqliteWarehouse;

fn fs_store(root: &Path) -> Arc<dyn ObjectStore> {
    Arc::new(
        FsStore::new(FilesystemStorageConfig {
            root: root.to_path_buf(),
            prefix: String::new(),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: vec![],
            follow_symlinks: false,
        })
        .unwrap(),
    )
}

fn record(table_name: &str) -> LoadMetadata {
    LoadMetadata {
        file_name: "data/o'brien.csv".to_string(),
        file_size_mb: 256.0,
        table_name: table_name.to_string(),
        load_timestamp: NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap(),
        file_hash: "deadbeef".to_string(),
        record_count: 12,
    }
}

#[tokio::test]
async fn apostrophe_breaks_interpolated_insert_but_not_bound_one() {
    let tmp = TempDir::new().unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let audit = TableName {
        schema: None,
        name: "METADATA_TABLE".to_string(),
    };
    sqlx::query(&create_audit_table(Dialect::Sqlite, &audit).sql)
        .execute(&pool)
        .await
        .unwrap();

    // String-built insert: the quote in the name terminates the literal.
    let r = record("O'BRIEN");
    let interpolated = format!(
        "INSERT INTO METADATA_TABLE (file_name, file_size_mb, table_name, load_timestamp, file_hash, record_count) \
         VALUES ('{}', {}, '{}', '{}', '{}', {})",
        "x.csv", r.file_size_mb, r.table_name, r.load_timestamp, r.file_hash, r.record_count
    );
    assert!(sqlx::query(&interpolated).execute(&pool).await.is_err());

    let warehouse = SqliteWarehouse::with_pool(pool.clone(), "METADATA_TABLE", fs_store(tmp.path()));
    warehouse.record_load(&r, Attempt::first()).await.unwrap();

    let row = sqlx::query("SELECT file_name, table_name, record_count FROM METADATA_TABLE")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>(0), "data/o'brien.csv");
    assert_eq!(row.get::<String, _>(1), "O'BRIEN");
    assert_eq!(row.get::<i64, _>(2), 12);
}

fn write_config(root: &Path, threshold: u64) -> PathBuf {
    let content = format!(
        r#"[storage]
backend = "filesystem"

[storage.filesystem]
root = "{root}/landing"
include_globs = ["**/*.csv", "**/*.json"]

[warehouse]
backend = "sqlite"

[warehouse.sqlite]
path = "{root}/data/warehouse.sqlite"

[load]
size_threshold_bytes = {threshold}
max_workers = 4
retry_base_delay_ms = 1
"#,
        root = root.display(),
        threshold = threshold
    );
    let path = root.join("wload.toml");
    fs::write(&path, content).unwrap();
    path
}

async fn open(root: &Path) -> SqlitePool {
    SqlitePool::connect(&format!("sqlite:{}/data/warehouse.sqlite", root.display()))
        .await
        .unwrap()
}

async fn run(config: &Config) -> warehouse_loader::models::LoadSummary {
    let store = create_store(config).unwrap();
    let objects = store.list().await.unwrap();
    let warehouse = create_warehouse(config, store.clone()).await.unwrap();
    warehouse.ensure_audit_table().await.unwrap();
    let ctx = LoadContext::new(config, store, warehouse);
    load_objects(&ctx, objects, "landing", &NoProgress)
        .await
        .unwrap()
}

#[tokio::test]
async fn filesystem_to_sqlite_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let landing = tmp.path().join("landing");
    fs::create_dir_all(landing.join("2024")).unwrap();
    fs::write(
        landing.join("2024/daily sales.csv"),
        "id,Full Name,Notes\n1,Ann,\"multi\nline\"\n2,O'Brien,\n",
    )
    .unwrap();
    fs::write(
        landing.join("people.json"),
        r#"[{"ID": 1, "Full_Name": "Ann", "Home City": "Oslo"}, {"id": 2, "Full_Name": null, "Home City": "Rome"}]"#,
    )
    .unwrap();
    fs::write(landing.join("tiny.csv"), "a\n1\n").unwrap();

    let config = load_config(&write_config(tmp.path(), 10)).unwrap();
    let summary = run(&config).await;

    assert_eq!(summary.listed, 3);
    assert_eq!(summary.skipped, 1);
    assert!(summary.failed.is_empty(), "failures: {:?}", summary.failed);
    assert_eq!(summary.loaded.len(), 2);

    let pool = open(tmp.path()).await;

    let sales = sqlx::query(
        "SELECT id, full_name, notes, load_timestamp, file_hash FROM DAILY_SALES ORDER BY id",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(sales.len(), 2);
    assert_eq!(sales[0].get::<String, _>(2), "multi\nline");
    assert_eq!(sales[1].get::<String, _>(1), "O'Brien");
    assert_eq!(sales[1].get::<Option<String>, _>(2), None);
    assert!(sales[0].get::<Option<String>, _>(3).is_some());
    assert_eq!(sales[0].get::<String, _>(4).len(), 64);

    let people = sqlx::query("SELECT id, full_name, home_city FROM PEOPLE ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(people.len(), 2);
    assert_eq!(people[0].get::<String, _>(0), "1");
    assert_eq!(people[0].get::<String, _>(1), "Ann");
    assert_eq!(people[1].get::<Option<String>, _>(1), None);
    // Bulk copy matches member names ignoring case only; a key with a space
    // does not match its normalized column.
    assert_eq!(people[0].get::<Option<String>, _>(2), None);
    assert_eq!(people[1].get::<Option<String>, _>(2), None);

    let audit = sqlx::query(
        "SELECT file_name, table_name, record_count FROM METADATA_TABLE ORDER BY file_name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].get::<String, _>(0), "2024/daily sales.csv");
    assert_eq!(audit[0].get::<String, _>(1), "DAILY_SALES");
    assert_eq!(audit[0].get::<i64, _>(2), 2);
    assert_eq!(audit[1].get::<String, _>(1), "PEOPLE");
}

#[tokio::test]
async fn rerun_replaces_tables_and_appends_audit_rows() {
    let tmp = TempDir::new().unwrap();
    let landing = tmp.path().join("landing");
    fs::create_dir_all(&landing).unwrap();
    fs::write(landing.join("orders.csv"), "id,total\n1,10\n2,20\n").unwrap();

    let config = load_config(&write_config(tmp.path(), 5)).unwrap();
    run(&config).await;
    run(&config).await;

    let pool = open(tmp.path()).await;
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ORDERS")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 2);

    let store = create_store(&config).unwrap();
    let warehouse = create_warehouse(&config, store).await.unwrap();
    let report = warehouse.load_report().await.unwrap();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].table_name, "ORDERS");
    assert_eq!(report[0].load_count, 2);
}

#[tokio::test]
async fn colliding_objects_share_one_table() {
    let tmp = TempDir::new().unwrap();
    let landing = tmp.path().join("landing");
    fs::create_dir_all(landing.join("a")).unwrap();
    fs::create_dir_all(landing.join("b")).unwrap();
    fs::write(landing.join("a/orders.csv"), "id,total\n1,10\n").unwrap();
    fs::write(landing.join("b/orders.csv"), "id,total\n2,20\n").unwrap();

    let config = load_config(&write_config(tmp.path(), 5)).unwrap();
    let summary = run(&config).await;
    assert_eq!(summary.collisions, vec!["ORDERS".to_string()]);
    assert_eq!(summary.loaded.len(), 2);

    let pool = open(tmp.path()).await;
    let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM ORDERS ORDER BY id")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(ids, vec!["1", "2"]);
}

#[tokio::test]
async fn colliding_object_with_other_columns_fails_without_touching_table() {
    let tmp = TempDir::new().unwrap();
    let landing = tmp.path().join("landing");
    fs::create_dir_all(landing.join("a")).unwrap();
    fs::create_dir_all(landing.join("b")).unwrap();
    fs::write(landing.join("a/orders.csv"), "id,total\n1,10\n").unwrap();
    fs::write(landing.join("b/orders.csv"), "customer,city\nann,paris\n").unwrap();

    let config = load_config(&write_config(tmp.path(), 5)).unwrap();
    let summary = run(&config).await;
    assert_eq!(summary.loaded.len(), 1);
    assert_eq!(summary.failed.len(), 1);
    assert!(summary.failed[0].error.contains("provision"), "{}", summary.failed[0].error);

    let pool = open(tmp.path()).await;
    // Whichever object won the lock owns the table; the other left no rows.
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ORDERS")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    let columns: Vec<String> =
        sqlx::query_scalar("SELECT name FROM pragma_table_info('ORDERS') ORDER BY cid")
            .fetch_all(&pool)
            .await
            .unwrap();
    let winner = &summary.loaded[0].file_name;
    let expected = if winner == "a/orders.csv" {
        ["id", "total"]
    } else {
        ["customer", "city"]
    };
    assert_eq!(&columns[..2], &expected);
    let audited: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM METADATA_TABLE")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(audited, 1);
}

#[tokio::test]
async fn archived_objects_are_not_loaded_again() {
    let tmp = TempDir::new().unwrap();
    let landing = tmp.path().join("landing");
    fs::create_dir_all(landing.join("in")).unwrap();
    fs::write(landing.join("in/orders.csv"), "id,total\n1,10\n2,20\n").unwrap();

    let config_path = tmp.path().join("wload.toml");
    fs::write(
        &config_path,
        format!(
            r#"[storage]
backend = "filesystem"

[storage.filesystem]
root = "{root}/landing"
prefix = "in"

[warehouse]
backend = "sqlite"

[warehouse.sqlite]
path = "{root}/data/warehouse.sqlite"

[load]
size_threshold_bytes = 5
retry_base_delay_ms = 1
archive_prefix = "archive/"
"#,
            root = tmp.path().display()
        ),
    )
    .unwrap();
    let config = load_config(&config_path).unwrap();

    let first = run(&config).await;
    assert_eq!(first.loaded.len(), 1);
    assert!(landing.join("archive/in/orders.csv").exists());

    let second = run(&config).await;
    assert_eq!(second.listed, 0);

    let pool = open(tmp.path()).await;
    let audited: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM METADATA_TABLE")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(audited, 1);
    assert!(!landing.join("archive/archive").exists());
}

#[test]
fn archive_prefix_inside_the_listing_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = write_config(tmp.path(), 5);
    let mut content = fs::read_to_string(&config_path).unwrap();
    content.push_str("archive_prefix = \"archive/\"\n");
    fs::write(&config_path, content).unwrap();

    let err = load_config(&config_path).unwrap_err();
    assert!(err.to_string().contains("archive_prefix"), "{}", err);
}
