// src/goals.rs
//
// =============================================================================
// VOXLOGICA: GOAL RUNNER
// =============================================================================
//
// Executes the side-effecting terminal instructions of a plan after their
// target's computation subtree completes.
//
// - print: one line per goal, "<label>=<rendered value>", to a pluggable
//   sink (stdout, file, or an in-memory buffer for tests and dashboards).
// - save: one file per goal; the serializer is picked by longest-suffix,
//   case-insensitive match against a registry, with a textual fallback.
//   Files are written to a temp path and renamed into place so partial
//   writes never appear under the target name.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::plan::{Goal, GoalKind};
use crate::value::Value;

// ============================================================================
// 1. PRINT SINKS
// ============================================================================

pub trait PrintSink: Send + Sync {
    fn write_line(&self, line: &str);
}

pub struct StdoutSink;

impl PrintSink for StdoutSink {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

/// Appends goal output to a file, one line per goal.
pub struct FileSink {
    file: Mutex<fs::File>,
}

impl FileSink {
    pub fn open(path: impl AsRef<Path>) -> Result<FileSink, std::io::Error> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(FileSink {
            file: Mutex::new(file),
        })
    }
}

impl PrintSink for FileSink {
    fn write_line(&self, line: &str) {
        let mut file = self.file.lock().unwrap();
        if let Err(e) = writeln!(file, "{line}") {
            log::warn!("print sink write failed: {e}");
        }
    }
}

/// A thread-safe bounded buffer capturing goal output in memory. Decouples
/// output generation from rendering; tests and embedders read snapshots.
#[derive(Clone)]
pub struct MemorySink {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl MemorySink {
    pub fn new(capacity: usize) -> MemorySink {
        MemorySink {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Returns a snapshot of the captured lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().iter().cloned().collect()
    }
}

impl PrintSink for MemorySink {
    fn write_line(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }
}

// ============================================================================
// 2. SAVE SERIALIZERS
// ============================================================================

pub type SerializeFn = Arc<dyn Fn(&Value, &Path) -> Result<(), String> + Send + Sync>;

/// Suffix-keyed serializer registry. Entries are matched longest suffix
/// first, case-insensitively, so ".nii.gz" beats ".gz".
#[derive(Clone, Default)]
pub struct SerializerRegistry {
    entries: Vec<(String, SerializeFn)>,
}

impl SerializerRegistry {
    pub fn new() -> SerializerRegistry {
        SerializerRegistry::default()
    }

    /// Registry with the builtin `.json` and `.txt` serializers.
    pub fn with_defaults() -> SerializerRegistry {
        let mut registry = SerializerRegistry::new();
        registry.register(".json", Arc::new(save_json));
        registry.register(".txt", Arc::new(save_text));
        registry
    }

    pub fn register(&mut self, suffix: impl Into<String>, f: SerializeFn) {
        self.entries.push((suffix.into().to_lowercase(), f));
        self.entries
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    pub fn select(&self, filename: &str) -> Option<&SerializeFn> {
        let lower = filename.to_lowercase();
        self.entries
            .iter()
            .find(|(suffix, _)| lower.ends_with(suffix))
            .map(|(_, f)| f)
    }
}

fn save_json(value: &Value, path: &Path) -> Result<(), String> {
    let blob = value
        .to_blob()
        .ok_or_else(|| "value is not serializable as JSON".to_string())?;
    // Round-trip through serde_json for human-readable output.
    let parsed: serde_json::Value =
        serde_json::from_slice(&blob).map_err(|e| e.to_string())?;
    let pretty = serde_json::to_vec_pretty(&parsed).map_err(|e| e.to_string())?;
    write_atomic(path, &pretty)
}

fn save_text(value: &Value, path: &Path) -> Result<(), String> {
    write_atomic(path, format!("{value}\n").as_bytes())
}

/// Write to a temp sibling, then rename: the target never holds a partial
/// file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
    }
    let tmp = path.with_extension(format!(
        "tmp-{}",
        &Uuid::new_v4().to_string()[..8]
    ));
    {
        let mut f = fs::File::create(&tmp).map_err(|e| e.to_string())?;
        f.write_all(data).map_err(|e| e.to_string())?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        e.to_string()
    })
}

// ============================================================================
// 3. THE RUNNER
// ============================================================================

#[derive(Clone)]
pub struct GoalRunner {
    sink: Arc<dyn PrintSink>,
    serializers: SerializerRegistry,
}

impl GoalRunner {
    pub fn new(sink: Arc<dyn PrintSink>, serializers: SerializerRegistry) -> GoalRunner {
        GoalRunner { sink, serializers }
    }

    /// Stdout printing and the default serializers.
    pub fn stdout() -> GoalRunner {
        GoalRunner::new(Arc::new(StdoutSink), SerializerRegistry::with_defaults())
    }

    /// Consumes a goal's value. Serializer failures are reported to the
    /// caller; they never corrupt the store.
    pub fn run_goal(&self, goal: &Goal, value: &Value) -> Result<(), String> {
        match goal.kind {
            GoalKind::Print => {
                self.sink.write_line(&format!("{}={}", goal.label, value));
                Ok(())
            }
            GoalKind::Save => {
                let path = Path::new(&goal.label);
                match self.serializers.select(&goal.label) {
                    Some(f) => f(value, path),
                    // No registered serializer: default textual dump.
                    None => save_text(value, path),
                }
                .map_err(|e| format!("save '{}' failed: {e}", goal.label))?;
                log::info!("saved {}", goal.label);
                Ok(())
            }
        }
    }
}
