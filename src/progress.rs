//! Build progress reporting.
//!
//! Reports observable progress during `kb rebuild` so users see what is
//! being scanned, how many documents need work, and when the new index is
//! published. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;

/// A single progress event for an index build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildProgressEvent {
    /// Walking the corpus directory. Total unknown.
    Scanning { root: String },
    /// Scan compared against the previous build.
    Classified {
        unchanged: u64,
        changed: u64,
        new: u64,
        removed: u64,
    },
    /// Document `n` of `total` needing extraction/embedding was processed.
    Processing { doc: String, n: u64, total: u64 },
    /// Writing the new generation.
    Publishing { chunks: u64 },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait BuildProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the builder.
    fn report(&self, event: BuildProgressEvent);
}

/// Human-friendly progress on stderr: "rebuild  processing  12 / 40 documents".
pub struct StderrProgress;

impl BuildProgressReporter for StderrProgress {
    fn report(&self, event: BuildProgressEvent) {
        let line = match &event {
            BuildProgressEvent::Scanning { root } => format!("rebuild  scanning {}...\n", root),
            BuildProgressEvent::Classified {
                unchanged,
                changed,
                new,
                removed,
            } => format!(
                "rebuild  {} unchanged, {} changed, {} new, {} removed\n",
                format_number(*unchanged),
                format_number(*changed),
                format_number(*new),
                format_number(*removed)
            ),
            BuildProgressEvent::Processing { doc, n, total } => format!(
                "rebuild  processing  {} / {} documents  ({})\n",
                format_number(*n),
                format_number(*total),
                doc
            ),
            BuildProgressEvent::Publishing { chunks } => {
                format!("rebuild  publishing {} chunks\n", format_number(*chunks))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl BuildProgressReporter for JsonProgress {
    fn report(&self, event: BuildProgressEvent) {
        let obj = match &event {
            BuildProgressEvent::Scanning { root } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "root": root
            }),
            BuildProgressEvent::Classified {
                unchanged,
                changed,
                new,
                removed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "classified",
                "unchanged": unchanged,
                "changed": changed,
                "new": new,
                "removed": removed
            }),
            BuildProgressEvent::Processing { doc, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "processing",
                "doc": doc,
                "n": n,
                "total": total
            }),
            BuildProgressEvent::Publishing { chunks } => serde_json::json!({
                "event": "progress",
                "phase": "publishing",
                "chunks": chunks
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl BuildProgressReporter for NoProgress {
    fn report(&self, _event: BuildProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
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
    pub fn reporter(&self) -> Box<dyn BuildProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    struct Recorder(Mutex<Vec<BuildProgressEvent>>);

    impl BuildProgressReporter for Recorder {
        fn report(&self, event: BuildProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn reporter_is_object_safe() {
        let recorder = Recorder(Mutex::new(Vec::new()));
        let dyn_reporter: &dyn BuildProgressReporter = &recorder;
        dyn_reporter.report(BuildProgressEvent::Publishing { chunks: 3 });
        assert_eq!(
            recorder.0.lock().unwrap().as_slice(),
            &[BuildProgressEvent::Publishing { chunks: 3 }]
        );
    }
}
