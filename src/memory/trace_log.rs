//! Append-only JSON-lines log of processed documents.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::store::StoreError;
use crate::models::{Classification, Fields};

/// One line of the trace log.
#[derive(Debug, Serialize)]
pub struct TraceEntry<'a> {
    pub timestamp: String,
    pub source: &'a str,
    pub classification: &'a Classification,
    pub extracted_fields: &'a Fields,
    pub actions_triggered: &'a Value,
    pub agent_trace: &'a Value,
}

impl<'a> TraceEntry<'a> {
    pub fn new(
        source: &'a str,
        classification: &'a Classification,
        extracted_fields: &'a Fields,
        actions_triggered: &'a Value,
        agent_trace: &'a Value,
    ) -> Self {
        Self {
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            source,
            classification,
            extracted_fields,
            actions_triggered,
            agent_trace,
        }
    }
}

pub struct TraceLog {
    path: PathBuf,
    // serializes writers so lines never interleave
    lock: Mutex<()>,
}

impl TraceLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &TraceEntry<'_>) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
