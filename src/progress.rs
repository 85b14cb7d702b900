//! Sync and thumbnail progress reporting.
//!
//! Reports observable progress during `gcv sync` and `gcv thumbnails refresh`
//! so users see what is being scanned and how much is left. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Enumeration of `filter` has started. Total unknown.
    Discovering { filter: String },
    /// Descriptors merged into the store: n out of total in scope.
    Ingesting { filter: String, n: u64, total: u64 },
    /// Render commands answered: n out of total candidates.
    Rendering { filter: String, n: u64, total: u64 },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync and thumbnail pipelines.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "sync /Game/  ingesting  1,234 / 5,000 assets".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovering { filter } => {
                format!("sync {}  discovering...\n", display_filter(filter))
            }
            ProgressEvent::Ingesting { filter, n, total } => format!(
                "sync {}  ingesting  {} / {} assets\n",
                display_filter(filter),
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Rendering { filter, n, total } => format!(
                "thumbnails {}  rendering  {} / {} assets\n",
                display_filter(filter),
                format_number(*n),
                format_number(*total)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovering { filter } => serde_json::json!({
                "event": "progress",
                "filter": filter,
                "phase": "discovering"
            }),
            ProgressEvent::Ingesting { filter, n, total } => serde_json::json!({
                "event": "progress",
                "filter": filter,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
            ProgressEvent::Rendering { filter, n, total } => serde_json::json!({
                "event": "progress",
                "filter": filter,
                "phase": "rendering",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn display_filter(filter: &str) -> &str {
    if filter.is_empty() {
        "<all>"
    } else {
        filter
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
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

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
