//! JSONL mirror of the audit trail.
//!
//! The events table is the source of truth; these files exist so operators
//! can tail a run's history without opening the database. Mirror writes
//! happen after the store commit and a mirror failure never rolls back the
//! committed event.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use subm_core::events::SubmissionEvent;

use crate::persistence::{PersistenceError, SqliteStore};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlEventLog {
    pub root: PathBuf,
    pub global_file: PathBuf,
    pub run_dir: PathBuf,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let global_file = root.join("global.jsonl");
        let run_dir = root.join("runs");
        Self {
            root,
            global_file,
            run_dir,
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        fs::create_dir_all(&self.root).map_err(|source| EventLogError::CreateDir {
            path: self.root.clone(),
            source,
        })?;
        fs::create_dir_all(&self.run_dir).map_err(|source| EventLogError::CreateDir {
            path: self.run_dir.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn append_global(&self, event: &SubmissionEvent) -> Result<(), EventLogError> {
        append_json_line(&self.global_file, event)
    }

    pub fn append_run(&self, event: &SubmissionEvent) -> Result<(), EventLogError> {
        if let Some(run_id) = &event.run_id {
            let file = self.run_dir.join(format!("{}.jsonl", run_id.0));
            append_json_line(&file, event)?;
        }
        Ok(())
    }

    pub fn append_both(&self, event: &SubmissionEvent) -> Result<(), EventLogError> {
        self.ensure_layout()?;
        self.append_global(event)?;
        self.append_run(event)?;
        Ok(())
    }

    pub fn run_log_path(&self, run_id: &str) -> PathBuf {
        self.run_dir.join(format!("{run_id}.jsonl"))
    }

    pub fn global_log_path(&self) -> &Path {
        self.global_file.as_path()
    }
}

fn append_json_line(path: &Path, event: &SubmissionEvent) -> Result<(), EventLogError> {
    let line =
        serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;

    file.write_all(line.as_bytes())
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(b"\n")
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

/// Persist an event to the store, then mirror it to JSONL.
pub fn record_event(
    store: &SqliteStore,
    log: &JsonlEventLog,
    event: &SubmissionEvent,
) -> Result<(), PersistenceError> {
    store.append_event(event)?;
    if let Err(error) = log.append_both(event) {
        tracing::warn!(%error, "event mirror append failed");
    }
    Ok(())
}

/// Mirror events that were already committed inside a store transaction.
pub fn mirror_events(log: &JsonlEventLog, events: &[SubmissionEvent]) {
    for event in events {
        if let Err(error) = log.append_both(event) {
            tracing::warn!(%error, "event mirror append failed");
        }
    }
}
