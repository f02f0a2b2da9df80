//! Load progress reporting.
//!
//! Reports observable progress during `wload load` so operators can see how
//! far the fan-out has got and how the finished objects split between
//! loaded, skipped and failed. Progress is emitted on **stderr** so stdout
//! stays parseable for scripts.

use std::io::Write;

use serde_json::{json, Value};

/// Outcomes of the objects finished so far in a pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LoadTally {
    pub loaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl LoadTally {
    pub fn finished(&self) -> u64 {
        self.loaded + self.skipped + self.failed
    }
}

/// A single progress event for a load pass.
#[derive(Clone, Debug)]
pub enum LoadProgressEvent {
    /// Listing the source. Total unknown.
    Listing { source: String },
    /// Chunk `chunk` (1-based) of `chunks` is being dispatched.
    Chunk {
        source: String,
        chunk: usize,
        chunks: usize,
        objects: usize,
    },
    /// One more object finished; `tally` covers every finished object.
    Loading {
        source: String,
        tally: LoadTally,
        total: u64,
    },
}

/// Reports load progress. Implementations write to stderr (human or JSON).
pub trait LoadProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the fan-out driver.
    fn report(&self, event: LoadProgressEvent);
}

/// Human-friendly progress on stderr, e.g.
/// `load s3://landing/in/  120 / 1,000 objects  loaded 100  skipped 15  failed 5`.
pub struct StderrProgress;

impl LoadProgressReporter for StderrProgress {
    fn report(&self, event: LoadProgressEvent) {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", human_line(&event));
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl LoadProgressReporter for JsonProgress {
    fn report(&self, event: LoadProgressEvent) {
        if let Ok(line) = serde_json::to_string(&json_event(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl LoadProgressReporter for NoProgress {
    fn report(&self, _event: LoadProgressEvent) {}
}

fn human_line(event: &LoadProgressEvent) -> String {
    match event {
        LoadProgressEvent::Listing { source } => format!("load {}  listing...", source),
        LoadProgressEvent::Chunk {
            source,
            chunk,
            chunks,
            objects,
        } => format!(
            "load {}  chunk {} / {}  ({} objects)",
            source,
            chunk,
            chunks,
            format_number(*objects as u64)
        ),
        LoadProgressEvent::Loading {
            source,
            tally,
            total,
        } => format!(
            "load {}  {} / {} objects  loaded {}  skipped {}  failed {}",
            source,
            format_number(tally.finished()),
            format_number(*total),
            format_number(tally.loaded),
            format_number(tally.skipped),
            format_number(tally.failed)
        ),
    }
}

fn json_event(event: &LoadProgressEvent) -> Value {
    match event {
        LoadProgressEvent::Listing { source } => json!({
            "event": "progress",
            "source": source,
            "phase": "listing"
        }),
        LoadProgressEvent::Chunk {
            source,
            chunk,
            chunks,
            objects,
        } => json!({
            "event": "progress",
            "source": source,
            "phase": "chunk",
            "chunk": chunk,
            "chunks": chunks,
            "objects": objects
        }),
        LoadProgressEvent::Loading {
            source,
            tally,
            total,
        } => json!({
            "event": "progress",
            "source": source,
            "phase": "loading",
            "n": tally.finished(),
            "total": total,
            "loaded": tally.loaded,
            "skipped": tally.skipped,
            "failed": tally.failed
        }),
    }
}

fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn LoadProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
