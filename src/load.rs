//! Load pipeline orchestration.
//!
//! Coordinates one full pass: list → size filter → fetch → infer schema →
//! provision table → bulk copy → stamp rows → audit row → archive.
//!
//! Objects are processed in chunks of `batch_size`. Inside a chunk at most
//! `max_workers` objects are in flight; the next chunk starts only after
//! every task of the current one has finished. One object's failure never
//! affects its siblings.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audit;
use crate::config::Config;
use crate::error::{LoadError, Step};
use crate::models::{
    FileFormat, LoadOutcome, LoadSummary, ObjectDescriptor, ObjectFailure, TableName,
};
use crate::progress::{LoadProgressEvent, LoadProgressReporter, LoadTally, ProgressMode};
use crate::retry::RetryPolicy;
use crate::schema::{decode_utf8, infer_schema};
use crate::sql::TIMESTAMP_FORMAT;
use crate::storage::{create_store, ObjectStore};
use crate::warehouse::{create_warehouse, CopySource, DestinationLocks, Warehouse};

/// Objects strictly larger than `threshold` bytes are loaded.
pub fn passes_size_filter(size: u64, threshold: u64) -> bool {
    size > threshold
}

/// Everything a worker needs to load one object. Cheap to clone.
#[derive(Clone)]
pub struct LoadContext {
    pub store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub locks: Arc<DestinationLocks>,
    pub retry: RetryPolicy,
    pub size_threshold: u64,
    pub sample_rows: usize,
    pub batch_size: usize,
    pub max_workers: usize,
    pub max_failures: Option<usize>,
    pub target_schema: Option<String>,
    pub archive_prefix: Option<String>,
}

impl LoadContext {
    pub fn new(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            store,
            warehouse,
            locks: Arc::new(DestinationLocks::new()),
            retry: RetryPolicy::from_config(&config.load),
            size_threshold: config.load.size_threshold_bytes,
            sample_rows: config.load.sample_rows,
            batch_size: config.load.batch_size,
            max_workers: config.load.max_workers,
            max_failures: config.load.max_failures,
            target_schema: config.target_schema().map(str::to_string),
            archive_prefix: config.load.archive_prefix.clone(),
        }
    }

    pub fn table_for(&self, key: &str) -> TableName {
        TableName::for_key(key, self.target_schema.as_deref())
    }
}

/// Load a single object end to end.
pub async fn process_object(
    ctx: &LoadContext,
    object: &ObjectDescriptor,
) -> Result<LoadOutcome, LoadError> {
    let key = object.key.as_str();
    let retry = &ctx.retry;

    let size = retry.run("size", |_| ctx.store.size_of(key)).await?;
    if !passes_size_filter(size, ctx.size_threshold) {
        debug!(key, size, threshold = ctx.size_threshold, "skipping small object");
        return Ok(LoadOutcome::Skipped {
            key: key.to_string(),
            size,
        });
    }

    let bytes = retry.run("fetch", |_| ctx.store.fetch(key)).await?;
    let format = FileFormat::from_key(key);
    let content = decode_utf8(&bytes)?;
    let schema = infer_schema(content, format, ctx.sample_rows)?;
    let record_count = audit::record_count(content, format)?;
    let file_hash = audit::content_hash(&bytes);
    drop(bytes);

    let table = ctx.table_for(key);
    let load_timestamp = audit::load_timestamp();
    let stamp = load_timestamp.format(TIMESTAMP_FORMAT).to_string();
    let source = CopySource {
        key: key.to_string(),
        location: ctx.store.location(key),
        format,
    };

    {
        let mut provisioned = ctx.locks.acquire(&table).await;
        match provisioned.as_ref() {
            Some(existing) if *existing == schema => {
                info!(key, table = %table, "table already provisioned in this run, appending");
            }
            Some(existing) => {
                return Err(LoadError::fatal(
                    Step::Provision,
                    format!(
                        "table {} was provisioned in this run with columns ({}), object has ({})",
                        table,
                        existing.names().join(", "),
                        schema.names().join(", ")
                    ),
                ));
            }
            None => {
                retry
                    .run("provision", |attempt| {
                        ctx.warehouse.create_or_replace_table(&table, &schema, attempt)
                    })
                    .await?;
                *provisioned = Some(schema.clone());
            }
        }

        let report = retry
            .run("copy", |attempt| ctx.warehouse.copy_into(&table, &source, attempt))
            .await?;
        if let Some(rows_loaded) = report.rows_loaded {
            if rows_loaded != record_count {
                warn!(
                    key,
                    table = %table,
                    rows_loaded,
                    record_count,
                    "warehouse row count differs from local count"
                );
            }
        }

        retry
            .run("stamp", |attempt| {
                ctx.warehouse.stamp_rows(&table, &stamp, &file_hash, attempt)
            })
            .await?;
    }

    let record = audit::build_record(key, size, &table, load_timestamp, file_hash, record_count);
    retry
        .run("record", |attempt| ctx.warehouse.record_load(&record, attempt))
        .await?;

    if let Some(prefix) = &ctx.archive_prefix {
        let archive_key = format!("{}{}", prefix, key);
        retry
            .run("archive", |_| ctx.store.archive(key, &archive_key))
            .await?;
        debug!(key, archive_key = %archive_key, "archived object");
    }

    info!(key, table = %table, records = record_count, "loaded object");
    Ok(LoadOutcome::Loaded(record))
}

/// Destination tables that more than one loadable object maps to, judged
/// by listing sizes.
pub fn find_collisions(
    objects: &[ObjectDescriptor],
    threshold: u64,
    schema: Option<&str>,
) -> Vec<String> {
    let mut counts: HashMap<TableName, usize> = HashMap::new();
    for object in objects {
        if passes_size_filter(object.size, threshold) {
            *counts.entry(TableName::for_key(&object.key, schema)).or_default() += 1;
        }
    }
    let mut shared: Vec<String> = counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(t, _)| t.to_string())
        .collect();
    shared.sort();
    shared
}

/// Run every object through [`process_object`], chunk by chunk.
pub async fn load_objects(
    ctx: &LoadContext,
    objects: Vec<ObjectDescriptor>,
    source: &str,
    progress: &dyn LoadProgressReporter,
) -> Result<LoadSummary> {
    let mut summary = LoadSummary {
        listed: objects.len(),
        collisions: find_collisions(&objects, ctx.size_threshold, ctx.target_schema.as_deref()),
        ..Default::default()
    };
    for table in &summary.collisions {
        warn!(table = %table, "several objects map to this table; later ones append when their columns match");
    }

    let semaphore = Arc::new(Semaphore::new(ctx.max_workers.max(1)));
    let total = objects.len() as u64;
    let batch_size = ctx.batch_size.max(1);
    let chunks = objects.len().div_ceil(batch_size);
    let mut tally = LoadTally::default();

    for (index, chunk) in objects.chunks(batch_size).enumerate() {
        debug!(chunk = index, objects = chunk.len(), "starting chunk");
        progress.report(LoadProgressEvent::Chunk {
            source: source.to_string(),
            chunk: index + 1,
            chunks,
            objects: chunk.len(),
        });
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        for object in chunk {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .context("worker pool closed")?;
            let ctx = ctx.clone();
            let object = object.clone();
            pending.insert(object.key.clone());
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let result = process_object(&ctx, &object).await;
                    (object.key, result)
                }
                .in_current_span(),
            );
        }

        // Barrier: drain the whole chunk before dispatching the next one.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, result)) => {
                    pending.remove(&key);
                    match result {
                        Ok(LoadOutcome::Skipped { .. }) => {
                            summary.skipped += 1;
                            tally.skipped += 1;
                        }
                        Ok(LoadOutcome::Loaded(record)) => {
                            summary.loaded.push(record);
                            tally.loaded += 1;
                        }
                        Err(err) => {
                            tally.failed += 1;
                            error!(key = %key, step = %err.step(), error = %err, "object failed");
                            summary.failed.push(ObjectFailure {
                                key,
                                error: err.to_string(),
                            });
                        }
                    }
                }
                Err(join_err) => {
                    // Recorded against its key once the chunk has drained.
                    error!(error = %join_err, "worker task aborted");
                    tally.failed += 1;
                }
            }
            progress.report(LoadProgressEvent::Loading {
                source: source.to_string(),
                tally,
                total,
            });
        }

        // Keys that never reported back belong to tasks that panicked.
        for key in pending {
            summary.failed.push(ObjectFailure {
                key,
                error: "worker task panicked".to_string(),
            });
        }

        if let Some(max) = ctx.max_failures {
            if summary.failed.len() > max {
                bail!(
                    "aborting after chunk {}: {} failures exceed max_failures = {}",
                    index + 1,
                    summary.failed.len(),
                    max
                );
            }
        }
    }

    info!(
        loaded = summary.loaded.len(),
        skipped = summary.skipped,
        failed = summary.failed.len(),
        "completed"
    );
    Ok(summary)
}

pub async fn run_load(
    config: &Config,
    dry_run: bool,
    limit: Option<usize>,
    progress: ProgressMode,
) -> Result<()> {
    let run_id = Uuid::new_v4();
    let reporter = progress.reporter();
    load_pass(config, dry_run, limit, reporter.as_ref())
        .instrument(info_span!("load", %run_id))
        .await
}

async fn load_pass(
    config: &Config,
    dry_run: bool,
    limit: Option<usize>,
    reporter: &dyn LoadProgressReporter,
) -> Result<()> {
    let source = config.source_label();
    let store = create_store(config)?;
    reporter.report(LoadProgressEvent::Listing {
        source: source.clone(),
    });
    let mut objects = store.list().await.context("listing objects")?;
    info!(store = store.name(), objects = objects.len(), "listed objects");
    if let Some(lim) = limit {
        objects.truncate(lim);
    }

    if dry_run {
        print_dry_run(config, &source, &objects);
        return Ok(());
    }

    let warehouse = create_warehouse(config, store.clone()).await?;
    warehouse
        .ensure_audit_table()
        .await
        .with_context(|| format!("creating audit table on {}", warehouse.name()))?;

    debug!(warehouse = warehouse.name(), dialect = ?warehouse.dialect(), "warehouse ready");

    let ctx = LoadContext::new(config, store, warehouse);
    let summary = load_objects(&ctx, objects, &source, reporter).await?;
    print_summary(&source, &summary);

    if !summary.failed.is_empty() {
        bail!("{} object(s) failed to load", summary.failed.len());
    }
    Ok(())
}

fn print_dry_run(config: &Config, source: &str, objects: &[ObjectDescriptor]) {
    let threshold = config.load.size_threshold_bytes;
    let schema = config.target_schema();
    println!("load {} (dry-run)", source);
    println!("  objects found: {}", objects.len());
    let mut to_load = 0usize;
    for object in objects {
        if passes_size_filter(object.size, threshold) {
            to_load += 1;
            println!(
                "  load  {} -> {} ({:.2} MB)",
                object.key,
                TableName::for_key(&object.key, schema),
                audit::size_in_mb(object.size)
            );
        } else {
            println!("  skip  {} ({} bytes)", object.key, object.size);
        }
    }
    println!("  would load: {}", to_load);
    for table in find_collisions(objects, threshold, schema) {
        println!("  shared table: {}", table);
    }
}

fn print_summary(source: &str, summary: &LoadSummary) {
    println!("load {}", source);
    println!("  listed: {}", summary.listed);
    println!("  skipped (at or below threshold): {}", summary.skipped);
    println!("  loaded: {}", summary.loaded.len());
    for record in &summary.loaded {
        println!(
            "    {} -> {} ({} records)",
            record.file_name, record.table_name, record.record_count
        );
    }
    if !summary.collisions.is_empty() {
        println!("  shared tables: {}", summary.collisions.join(", "));
    }
    println!("  failed: {}", summary.failed.len());
    for failure in &summary.failed {
        println!("    {}: {}", failure.key, failure.error);
    }
    if summary.failed.is_empty() {
        println!("ok");
    }
}
