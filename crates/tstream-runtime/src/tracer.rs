use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

use tstream_pipeline::Tracer;
use tstream_types::{TraceTarget, mask_secrets};

/// Bounded ring of records persisted as a JSON array. Each write
/// rewrites the file; traces are small by design (`maxRecords`
/// defaults to 10).
pub struct FileTracer {
    path: PathBuf,
    max_records: usize,
    records: Mutex<VecDeque<Value>>,
}

impl FileTracer {
    pub fn new(target: &TraceTarget) -> Self {
        Self {
            path: PathBuf::from(&target.path),
            max_records: target.max_records.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    fn flush(&self, records: &VecDeque<Value>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let snapshot: Vec<&Value> = records.iter().collect();
        fs::write(&self.path, serde_json::to_string_pretty(&snapshot)?)
    }
}

impl Tracer for FileTracer {
    fn write(&self, record: &Value) {
        let mut records = self.records.lock().expect("tracer lock poisoned");
        // Secret-keyed fields never reach disk in plain form
        records.push_back(mask_secrets(record));
        while records.len() > self.max_records {
            records.pop_front();
        }
        if let Err(error) = self.flush(&records) {
            warn!(path = %self.path.display(), %error, "trace write failed");
        }
    }
}
