//! Integration tests for the fan-out load pipeline.
//!
//! These run the real driver against an in-memory object store and a
//! recording warehouse, so statement order, chunk barriers and collision
//! handling can be observed directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use warehouse_loader::error::{LoadError, Step};
use warehouse_loader::load::{load_objects, process_object, LoadContext};
use warehouse_loader::models::{
    FileFormat, InferredSchema, LoadMetadata, LoadOutcome, ObjectDescriptor, ReportRow, TableName,
};
use warehouse_loader::progress::{LoadProgressEvent, LoadProgressReporter, LoadTally, NoProgress};
use warehouse_loader::retry::{Attempt, RetryPolicy};
use warehouse_loader::schema::infer_schema;
use warehouse_loader::sql::Dialect;
use warehouse_loader::storage::ObjectStore;
use warehouse_loader::warehouse::{CopyReport, CopySource, DestinationLocks, Warehouse};

type Log = Arc<Mutex<Vec<String>>>;

const THRESHOLD: u64 = 100;
const BIG: u64 = 1_000;

// ─── In-memory store ────────────────────────────────────────────────

#[derive(Default)]
struct MemoryStore {
    /// key → (reported size, content)
    objects: Vec<(String, u64, Vec<u8>)>,
    fail_size: HashSet<String>,
    flaky_fetch: Mutex<HashMap<String, u32>>,
    panic_on_fetch: HashSet<String>,
    archived: Mutex<Vec<(String, String)>>,
    log: Log,
}

impl MemoryStore {
    fn new(log: Log) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    fn with(mut self, key: &str, size: u64, content: &str) -> Self {
        self.objects
            .push((key.to_string(), size, content.as_bytes().to_vec()));
        self
    }

    fn descriptors(&self) -> Vec<ObjectDescriptor> {
        self.objects
            .iter()
            .map(|(key, size, _)| ObjectDescriptor {
                key: key.clone(),
                size: *size,
                last_modified: None,
            })
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self) -> Result<Vec<ObjectDescriptor>, LoadError> {
        Ok(self.descriptors())
    }

    async fn size_of(&self, key: &str) -> Result<u64, LoadError> {
        self.log.lock().unwrap().push(format!("begin:{}", key));
        if self.fail_size.contains(key) {
            return Err(LoadError::fatal(Step::Size, "HTTP 403 Forbidden"));
        }
        self.objects
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, size, _)| *size)
            .ok_or_else(|| LoadError::fatal(Step::Size, "no such key"))
    }

    async fn fetch(&self, key: &str) -> Result<Vec<u8>, LoadError> {
        if self.panic_on_fetch.contains(key) {
            panic!("simulated worker crash for {}", key);
        }
        {
            let mut flaky = self.flaky_fetch.lock().unwrap();
            if let Some(remaining) = flaky.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(LoadError::retryable(Step::Fetch, "connection reset"));
                }
            }
        }
        self.objects
            .iter()
            .find(|(k, _, _)| k == key)
            .map(|(_, _, content)| content.clone())
            .ok_or_else(|| LoadError::fatal(Step::Fetch, "no such key"))
    }

    fn location(&self, key: &str) -> String {
        format!("mem://{}", key)
    }

    async fn archive(&self, key: &str, archive_key: &str) -> Result<(), LoadError> {
        self.archived
            .lock()
            .unwrap()
            .push((key.to_string(), archive_key.to_string()));
        Ok(())
    }
}

// ─── Recording warehouse ────────────────────────────────────────────

/// Keeps one "row" per copied object so replaced tables are visible.
struct RecordingWarehouse {
    log: Log,
    tables: Mutex<HashMap<String, Vec<String>>>,
    audit: Mutex<Vec<LoadMetadata>>,
    copy_delay: Duration,
    /// Record attempts to fail before the audit row is accepted.
    flaky_record: Mutex<u32>,
    record_attempts: Mutex<Vec<Attempt>>,
}

impl RecordingWarehouse {
    fn new(log: Log) -> Self {
        Self {
            log,
            tables: Mutex::new(HashMap::new()),
            audit: Mutex::new(Vec::new()),
            copy_delay: Duration::from_millis(5),
            flaky_record: Mutex::new(0),
            record_attempts: Mutex::new(Vec::new()),
        }
    }

    fn rows(&self, table: &str) -> Vec<String> {
        let mut rows = self
            .tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default();
        rows.sort();
        rows
    }

    fn statements(&self) -> Vec<String> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("create:") || e.starts_with("copy:"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Warehouse for RecordingWarehouse {
    fn name(&self) -> &str {
        "recording"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn ensure_audit_table(&self) -> Result<(), LoadError> {
        Ok(())
    }

    async fn create_or_replace_table(
        &self,
        table: &TableName,
        _schema: &InferredSchema,
        _attempt: Attempt,
    ) -> Result<(), LoadError> {
        self.log.lock().unwrap().push(format!("create:{}", table));
        self.tables
            .lock()
            .unwrap()
            .insert(table.to_string(), Vec::new());
        Ok(())
    }

    async fn copy_into(
        &self,
        table: &TableName,
        source: &CopySource,
        _attempt: Attempt,
    ) -> Result<CopyReport, LoadError> {
        tokio::time::sleep(self.copy_delay).await;
        self.log
            .lock()
            .unwrap()
            .push(format!("copy:{}:{}", table, source.key));
        let mut tables = self.tables.lock().unwrap();
        let rows = tables
            .get_mut(&table.to_string())
            .ok_or_else(|| LoadError::fatal(Step::Copy, "table does not exist"))?;
        rows.push(source.key.clone());
        Ok(CopyReport { rows_loaded: None })
    }

    async fn stamp_rows(
        &self,
        _table: &TableName,
        _load_timestamp: &str,
        _file_hash: &str,
        _attempt: Attempt,
    ) -> Result<(), LoadError> {
        Ok(())
    }

    async fn record_load(&self, record: &LoadMetadata, attempt: Attempt) -> Result<(), LoadError> {
        self.record_attempts.lock().unwrap().push(attempt);
        {
            let mut flaky = self.flaky_record.lock().unwrap();
            if *flaky > 0 {
                *flaky -= 1;
                return Err(LoadError::retryable(Step::Record, "connection reset"));
            }
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("end:{}", record.file_name));
        self.audit.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn load_report(&self) -> Result<Vec<ReportRow>, LoadError> {
        Ok(Vec::new())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn context(
    store: Arc<MemoryStore>,
    warehouse: Arc<RecordingWarehouse>,
    batch_size: usize,
    max_workers: usize,
) -> LoadContext {
    LoadContext {
        store,
        warehouse,
        locks: Arc::new(DestinationLocks::new()),
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        },
        size_threshold: THRESHOLD,
        sample_rows: 10,
        batch_size,
        max_workers,
        max_failures: None,
        target_schema: None,
        archive_prefix: None,
    }
}

fn setup(store: MemoryStore, log: Log) -> (Arc<MemoryStore>, Arc<RecordingWarehouse>) {
    (Arc::new(store), Arc::new(RecordingWarehouse::new(log)))
}

const CSV: &str = "id,Full Name,Price\n1,Ann,3.50\n2,Bob,4.00\n";

#[derive(Default)]
struct CollectingProgress {
    loading: Mutex<Vec<(LoadTally, u64)>>,
    chunks: Mutex<Vec<(usize, usize)>>,
}

impl LoadProgressReporter for CollectingProgress {
    fn report(&self, event: LoadProgressEvent) {
        match event {
            LoadProgressEvent::Loading { tally, total, .. } => {
                self.loading.lock().unwrap().push((tally, total));
            }
            LoadProgressEvent::Chunk { chunk, chunks, .. } => {
                self.chunks.lock().unwrap().push((chunk, chunks));
            }
            LoadProgressEvent::Listing { .. } => {}
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn small_objects_issue_no_statements() {
    let log: Log = Default::default();
    let (store, warehouse) = setup(
        MemoryStore::new(log.clone())
            .with("in/tiny.csv", 10, CSV)
            .with("in/edge.csv", THRESHOLD, CSV),
        log.clone(),
    );
    let ctx = context(store.clone(), warehouse.clone(), 100, 10);

    let summary = load_objects(&ctx, store.descriptors(), "mem", &NoProgress)
        .await
        .unwrap();

    assert_eq!(summary.skipped, 2);
    assert!(summary.loaded.is_empty());
    assert!(warehouse.statements().is_empty());
    assert!(warehouse.audit.lock().unwrap().is_empty());
}

#[tokio::test]
async fn large_object_is_provisioned_then_copied_once() {
    let log: Log = Default::default();
    let (store, warehouse) = setup(
        MemoryStore::new(log.clone()).with("in/sales.csv", BIG, CSV),
        log.clone(),
    );
    let ctx = context(store.clone(), warehouse.clone(), 100, 10);

    let outcome = process_object(&ctx, &store.descriptors()[0]).await.unwrap();

    let LoadOutcome::Loaded(record) = outcome else {
        panic!("expected a load");
    };
    assert_eq!(record.table_name, "SALES");
    assert_eq!(record.record_count, 2);
    assert_eq!(record.file_hash.len(), 64);
    assert_eq!(
        warehouse.statements(),
        vec!["create:SALES".to_string(), "copy:SALES:in/sales.csv".to_string()]
    );
}

#[tokio::test]
async fn inferred_columns_are_normalized_text() {
    let schema = infer_schema(CSV, FileFormat::Csv, 10).unwrap();
    assert_eq!(schema.names(), vec!["id", "full_name", "price"]);
}

#[tokio::test]
async fn unguarded_interleaving_loses_first_objects_rows() {
    let log: Log = Default::default();
    let warehouse = RecordingWarehouse::new(log);
    let table = TableName::for_key("a/orders.csv", None);
    let schema = infer_schema("id\n1\n", FileFormat::Csv, 10).unwrap();
    let source = |key: &str| CopySource {
        key: key.to_string(),
        location: format!("mem://{}", key),
        format: FileFormat::Csv,
    };

    // Two workers each provisioning their own destination, as the
    // unsynchronized pipeline would.
    let once = Attempt::first;
    warehouse.create_or_replace_table(&table, &schema, once()).await.unwrap();
    warehouse.copy_into(&table, &source("a/orders.csv"), once()).await.unwrap();
    warehouse.create_or_replace_table(&table, &schema, once()).await.unwrap();
    warehouse.copy_into(&table, &source("b/orders.csv"), once()).await.unwrap();

    assert_eq!(warehouse.rows("ORDERS"), vec!["b/orders.csv"]);
}

#[tokio::test]
async fn driver_keeps_rows_of_colliding_objects() {
    let log: Log = Default::default();
    let (store, warehouse) = setup(
        MemoryStore::new(log.clone())
            .with("a/orders.csv", BIG, "id\n1\n")
            .with("b/orders.csv", BIG, "id\n2\n")
            .with("c/items.csv", BIG, "id\n3\n"),
        log.clone(),
    );
    let ctx = context(store.clone(), warehouse.clone(), 100, 10);

    let summary = load_objects(&ctx, store.descriptors(), "mem", &NoProgress)
        .await
        .unwrap();

    assert_eq!(summary.loaded.len(), 3);
    assert_eq!(summary.collisions, vec!["ORDERS".to_string()]);
    assert_eq!(
        warehouse.rows("ORDERS"),
        vec!["a/orders.csv", "b/orders.csv"]
    );
    let creates = warehouse
        .statements()
        .into_iter()
        .filter(|s| s == "create:ORDERS")
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn next_chunk_waits_for_previous_chunk() {
    let log: Log = Default::default();
    let mut store = MemoryStore::new(log.clone());
    for i in 0..7 {
        store = store.with(&format!("in/file_{}.csv", i), BIG, CSV);
    }
    let (store, warehouse) = setup(store, log.clone());
    let ctx = context(store.clone(), warehouse.clone(), 3, 2);
    let descriptors = store.descriptors();

    let summary = load_objects(&ctx, descriptors.clone(), "mem", &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.loaded.len(), 7);

    let events = log.lock().unwrap().clone();
    let position = |event: String| events.iter().position(|e| *e == event).unwrap();
    let chunks: Vec<&[ObjectDescriptor]> = descriptors.chunks(3).collect();
    for pair in chunks.windows(2) {
        let last_end = pair[0]
            .iter()
            .map(|o| position(format!("end:{}", o.key)))
            .max()
            .unwrap();
        let first_begin = pair[1]
            .iter()
            .map(|o| position(format!("begin:{}", o.key)))
            .min()
            .unwrap();
        assert!(
            last_end < first_begin,
            "chunk started before previous chunk finished: {:?}",
            events
        );
    }
}

#[tokio::test]
async fn failures_are_isolated_and_reported() {
    let log: Log = Default::default();
    let mut store = MemoryStore::new(log.clone())
        .with("in/good.csv", BIG, CSV)
        .with("in/broken.json", BIG, "{not json")
        .with("in/forbidden.csv", BIG, CSV)
        .with("in/flaky.csv", BIG, CSV);
    store.fail_size.insert("in/forbidden.csv".to_string());
    store
        .flaky_fetch
        .lock()
        .unwrap()
        .insert("in/flaky.csv".to_string(), 2);
    let (store, warehouse) = setup(store, log.clone());
    let ctx = context(store.clone(), warehouse.clone(), 100, 4);

    let summary = load_objects(&ctx, store.descriptors(), "mem", &NoProgress)
        .await
        .unwrap();

    let mut loaded: Vec<&str> = summary.loaded.iter().map(|r| r.file_name.as_str()).collect();
    loaded.sort();
    assert_eq!(loaded, vec!["in/flaky.csv", "in/good.csv"]);

    let mut failed: Vec<&str> = summary.failed.iter().map(|f| f.key.as_str()).collect();
    failed.sort();
    // A failed size lookup is a failure, never a silent skip.
    assert_eq!(failed, vec!["in/broken.json", "in/forbidden.csv"]);
    assert_eq!(summary.skipped, 0);
}

#[tokio::test]
async fn panicking_worker_fails_only_its_object() {
    let log: Log = Default::default();
    let mut store = MemoryStore::new(log.clone())
        .with("in/a.csv", BIG, CSV)
        .with("in/crash.csv", BIG, CSV)
        .with("in/b.csv", BIG, CSV);
    store.panic_on_fetch.insert("in/crash.csv".to_string());
    let (store, warehouse) = setup(store, log.clone());
    let ctx = context(store.clone(), warehouse, 100, 3);
    let progress = CollectingProgress::default();

    let summary = load_objects(&ctx, store.descriptors(), "mem", &progress)
        .await
        .unwrap();

    assert_eq!(summary.loaded.len(), 2);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].key, "in/crash.csv");
    let (tally, _) = progress.loading.lock().unwrap().last().copied().unwrap();
    assert_eq!(tally.failed, 1);
    assert_eq!(tally.finished(), 3);
}

#[tokio::test]
async fn max_failures_aborts_after_chunk() {
    let log: Log = Default::default();
    let mut store = MemoryStore::new(log.clone())
        .with("in/bad.json", BIG, "[1, 2]")
        .with("in/never.csv", BIG, CSV);
    store.fail_size.insert("in/bad.json".to_string());
    let (store, warehouse) = setup(store, log.clone());
    let mut ctx = context(store.clone(), warehouse.clone(), 1, 1);
    ctx.max_failures = Some(0);

    let err = load_objects(&ctx, store.descriptors(), "mem", &NoProgress)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("max_failures"));
    assert!(!log
        .lock()
        .unwrap()
        .iter()
        .any(|e| e == "begin:in/never.csv"));
}

#[tokio::test]
async fn loaded_objects_are_archived_and_progress_completes() {
    let log: Log = Default::default();
    let (store, warehouse) = setup(
        MemoryStore::new(log.clone())
            .with("in/sales.csv", BIG, CSV)
            .with("in/tiny.csv", 1, CSV),
        log.clone(),
    );
    let mut ctx = context(store.clone(), warehouse, 100, 2);
    ctx.archive_prefix = Some("archive/".to_string());
    let progress = CollectingProgress::default();

    load_objects(&ctx, store.descriptors(), "mem", &progress)
        .await
        .unwrap();

    assert_eq!(
        *store.archived.lock().unwrap(),
        vec![("in/sales.csv".to_string(), "archive/in/sales.csv".to_string())]
    );
    let reports = progress.loading.lock().unwrap();
    let (tally, total) = reports.last().copied().unwrap();
    assert_eq!(total, 2);
    assert_eq!(
        tally,
        LoadTally {
            loaded: 1,
            skipped: 1,
            failed: 0
        }
    );
    assert_eq!(*progress.chunks.lock().unwrap(), vec![(1, 1)]);
}

#[tokio::test]
async fn retried_audit_insert_reuses_its_request_id() {
    let log: Log = Default::default();
    let (store, warehouse) = setup(
        MemoryStore::new(log.clone()).with("in/sales.csv", BIG, CSV),
        log.clone(),
    );
    *warehouse.flaky_record.lock().unwrap() = 1;
    let ctx = context(store.clone(), warehouse.clone(), 100, 1);

    process_object(&ctx, &store.descriptors()[0]).await.unwrap();

    let attempts = warehouse.record_attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].is_retry());
    assert!(attempts[1].is_retry());
    assert_eq!(attempts[0].request_id, attempts[1].request_id);
    assert_eq!(warehouse.audit.lock().unwrap().len(), 1);
}
