//! SQLite persistence for targets, runs, events, and artifacts.
//!
//! Runs are stored column-wise so the lock triple and status can be mutated
//! by single conditional writes. Coordination between worker processes
//! happens entirely through these conditional writes: every read-then-write
//! sequence runs inside an `Immediate` transaction, which serializes
//! writers, and the final `UPDATE` re-checks the observed status anyway.
//! Events and artifacts are append-only `payload_json` rows.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use subm_core::artifact::SubmissionArtifact;
use subm_core::events::{event_kind_tag, SubmissionEvent};
use subm_core::status::RunStatus;
use subm_core::types::{
    ActionNeeded, BusinessId, BusinessProfile, Directory, DirectoryId, ErrorDetail, RunId,
    RunLock, SubmissionRun, SubmissionTarget, TargetId, WorkerId,
};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("timestamp parse error for value '{value}': {source}")]
    TimestampParse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid {column} tag '{value}'")]
    InvalidTag { column: &'static str, value: String },
    #[error("run {run_id} has a partially populated lock triple")]
    PartialLock { run_id: String },
    #[error("sqlite connection mutex poisoned")]
    Poisoned,
}

/// Result of a conditional lock acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired {
        lease_expires_at: DateTime<Utc>,
    },
    /// Same worker already holds a live lease. No event is written.
    AlreadyHeld {
        lease_expires_at: DateTime<Utc>,
    },
    /// Contended: another worker's lease is still live (or within grace).
    Held {
        locked_by: WorkerId,
        lease_expires_at: DateTime<Utc>,
    },
    InvalidStatus(RunStatus),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseAttempt {
    Released,
    /// The caller does not hold the lock (or no lock is held).
    NotHeld,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendAttempt {
    Extended { lease_expires_at: DateTime<Utc> },
    NotHeld,
    NotFound,
}

/// A status transition to apply conditionally.
#[derive(Debug)]
pub struct TransitionWrite<'a> {
    pub run_id: &'a RunId,
    pub expected_from: RunStatus,
    pub to: RunStatus,
    pub updated_at: DateTime<Utc>,
    pub set_error: Option<&'a ErrorDetail>,
    pub set_external_submission_id: Option<&'a str>,
    pub set_action: Option<&'a ActionNeeded>,
    pub set_next_run_at: Option<DateTime<Utc>>,
    pub clear_next_run_at: bool,
    pub clear_lock: bool,
    /// Appended in the same transaction as the status write.
    pub events: &'a [SubmissionEvent],
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(SubmissionRun),
    /// The database-observed status differs from what the caller expected.
    Stale { actual: RunStatus },
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Applied(SubmissionRun),
    InvalidStatus(RunStatus),
    NotFound,
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const RUN_COLUMNS: &str = "run_id, target_id, status, attempt_no, triggered_by, \
     triggered_by_id, previous_run_id, correlation_id, locked_at, locked_by, \
     lease_expires_at, error_type, error_code, error_message, \
     external_submission_id, next_run_at, action_type, action_url, \
     action_instructions, action_deadline, changes_acknowledged, created_at, \
     updated_at";

/// Raw column values before enum/timestamp decoding.
struct RawRun {
    run_id: String,
    target_id: String,
    status: String,
    attempt_no: i64,
    triggered_by: String,
    triggered_by_id: Option<String>,
    previous_run_id: Option<String>,
    correlation_id: String,
    locked_at: Option<String>,
    locked_by: Option<String>,
    lease_expires_at: Option<String>,
    error_type: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    external_submission_id: Option<String>,
    next_run_at: Option<String>,
    action_type: Option<String>,
    action_url: Option<String>,
    action_instructions: Option<String>,
    action_deadline: Option<String>,
    changes_acknowledged: bool,
    created_at: String,
    updated_at: String,
}

fn read_raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        target_id: row.get(1)?,
        status: row.get(2)?,
        attempt_no: row.get(3)?,
        triggered_by: row.get(4)?,
        triggered_by_id: row.get(5)?,
        previous_run_id: row.get(6)?,
        correlation_id: row.get(7)?,
        locked_at: row.get(8)?,
        locked_by: row.get(9)?,
        lease_expires_at: row.get(10)?,
        error_type: row.get(11)?,
        error_code: row.get(12)?,
        error_message: row.get(13)?,
        external_submission_id: row.get(14)?,
        next_run_at: row.get(15)?,
        action_type: row.get(16)?,
        action_url: row.get(17)?,
        action_instructions: row.get(18)?,
        action_deadline: row.get(19)?,
        changes_acknowledged: row.get(20)?,
        created_at: row.get(21)?,
        updated_at: row.get(22)?,
    })
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| PersistenceError::TimestampParse {
            value: value.to_string(),
            source,
        })
}

fn parse_opt_ts(value: &Option<String>) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    value.as_deref().map(parse_ts).transpose()
}

fn run_from_raw(raw: RawRun) -> Result<SubmissionRun, PersistenceError> {
    let status: RunStatus = raw
        .status
        .parse()
        .map_err(|_| PersistenceError::InvalidTag {
            column: "status",
            value: raw.status.clone(),
        })?;
    let triggered_by = raw
        .triggered_by
        .parse()
        .map_err(|_| PersistenceError::InvalidTag {
            column: "triggered_by",
            value: raw.triggered_by.clone(),
        })?;

    let lock = match (&raw.locked_at, &raw.locked_by, &raw.lease_expires_at) {
        (Some(locked_at), Some(locked_by), Some(lease_expires_at)) => Some(RunLock {
            locked_at: parse_ts(locked_at)?,
            locked_by: WorkerId::new(locked_by.clone()),
            lease_expires_at: parse_ts(lease_expires_at)?,
        }),
        (None, None, None) => None,
        _ => {
            return Err(PersistenceError::PartialLock {
                run_id: raw.run_id,
            })
        }
    };

    let last_error = match &raw.error_type {
        Some(tag) => Some(ErrorDetail {
            error_type: tag.parse().map_err(|_| PersistenceError::InvalidTag {
                column: "error_type",
                value: tag.clone(),
            })?,
            code: raw.error_code.clone(),
            message: raw.error_message.clone().unwrap_or_default(),
        }),
        None => None,
    };

    let action_needed = match &raw.action_type {
        Some(tag) => {
            let action_type = tag.parse().map_err(|_| PersistenceError::InvalidTag {
                column: "action_type",
                value: tag.clone(),
            })?;
            let deadline = raw
                .action_deadline
                .as_deref()
                .ok_or_else(|| PersistenceError::InvalidTag {
                    column: "action_deadline",
                    value: "NULL".to_string(),
                })?;
            Some(ActionNeeded {
                action_type,
                url: raw.action_url.clone(),
                instructions: raw.action_instructions.clone(),
                deadline: parse_ts(deadline)?,
            })
        }
        None => None,
    };

    Ok(SubmissionRun {
        id: RunId::new(raw.run_id),
        target_id: TargetId::new(raw.target_id),
        status,
        attempt_no: raw.attempt_no as u32,
        triggered_by,
        triggered_by_id: raw.triggered_by_id,
        previous_run_id: raw.previous_run_id.map(RunId::new),
        correlation_id: raw.correlation_id,
        lock,
        last_error,
        external_submission_id: raw.external_submission_id,
        next_run_at: parse_opt_ts(&raw.next_run_at)?,
        action_needed,
        changes_acknowledged: raw.changes_acknowledged,
        created_at: parse_ts(&raw.created_at)?,
        updated_at: parse_ts(&raw.updated_at)?,
    })
}

fn load_run_tx(
    conn: &Connection,
    run_id: &RunId,
) -> Result<Option<SubmissionRun>, PersistenceError> {
    let raw = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![run_id.0],
            read_raw_run,
        )
        .optional()?;
    raw.map(run_from_raw).transpose()
}

fn insert_event_tx(conn: &Connection, event: &SubmissionEvent) -> Result<(), PersistenceError> {
    let payload = serde_json::to_string(event)?;
    conn.execute(
        r#"
INSERT INTO events (event_id, run_id, target_id, at, kind_tag, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
        params![
            event.id.0,
            event.run_id.as_ref().map(|id| id.0.clone()),
            event.target_id.as_ref().map(|id| id.0.clone()),
            event.at.to_rfc3339(),
            event_kind_tag(&event.kind),
            payload,
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "busy_timeout", 5_000)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::Poisoned)
    }

    pub fn migrate(&self) -> Result<(), PersistenceError> {
        self.conn()?.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS businesses (
    business_id TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS directories (
    directory_id TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS targets (
    target_id TEXT PRIMARY KEY,
    business_id TEXT NOT NULL,
    directory_id TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_targets_business ON targets(business_id);
CREATE INDEX IF NOT EXISTS idx_targets_directory ON targets(directory_id);

CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    target_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt_no INTEGER NOT NULL,
    triggered_by TEXT NOT NULL,
    triggered_by_id TEXT,
    previous_run_id TEXT,
    correlation_id TEXT NOT NULL,
    locked_at TEXT,
    locked_by TEXT,
    lease_expires_at TEXT,
    error_type TEXT,
    error_code TEXT,
    error_message TEXT,
    external_submission_id TEXT,
    next_run_at TEXT,
    action_type TEXT,
    action_url TEXT,
    action_instructions TEXT,
    action_deadline TEXT,
    changes_acknowledged INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_target ON runs(target_id, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_status_created ON runs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_next_run_at ON runs(next_run_at);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    run_id TEXT,
    target_id TEXT,
    at TEXT NOT NULL,
    kind_tag TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, at);
CREATE INDEX IF NOT EXISTS idx_events_target ON events(target_id, at);

CREATE TABLE IF NOT EXISTS artifacts (
    artifact_id TEXT PRIMARY KEY,
    run_id TEXT,
    target_id TEXT,
    type_tag TEXT NOT NULL,
    created_at TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id, created_at);
CREATE INDEX IF NOT EXISTS idx_artifacts_target ON artifacts(target_id, created_at);
"#,
        )?;
        Ok(())
    }

    // --- Businesses / directories / targets ---

    pub fn upsert_business(&self, business: &BusinessProfile) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(business)?;
        self.conn()?.execute(
            r#"
INSERT INTO businesses (business_id, payload_json, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(business_id) DO UPDATE SET
  payload_json = excluded.payload_json,
  updated_at = excluded.updated_at
"#,
            params![business.id.0, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_business(
        &self,
        business_id: &BusinessId,
    ) -> Result<Option<BusinessProfile>, PersistenceError> {
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload_json FROM businesses WHERE business_id = ?1",
                params![business_id.0],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(PersistenceError::from)
    }

    pub fn upsert_directory(&self, directory: &Directory) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(directory)?;
        self.conn()?.execute(
            r#"
INSERT INTO directories (directory_id, payload_json, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(directory_id) DO UPDATE SET
  payload_json = excluded.payload_json,
  updated_at = excluded.updated_at
"#,
            params![directory.id.0, payload, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_directory(
        &self,
        directory_id: &DirectoryId,
    ) -> Result<Option<Directory>, PersistenceError> {
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload_json FROM directories WHERE directory_id = ?1",
                params![directory_id.0],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(PersistenceError::from)
    }

    pub fn upsert_target(&self, target: &SubmissionTarget) -> Result<(), PersistenceError> {
        let guard = self.conn()?;
        upsert_target_tx(&guard, target)
    }

    pub fn load_target(
        &self,
        target_id: &TargetId,
    ) -> Result<Option<SubmissionTarget>, PersistenceError> {
        let payload: Option<String> = self
            .conn()?
            .query_row(
                "SELECT payload_json FROM targets WHERE target_id = ?1",
                params![target_id.0],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(PersistenceError::from)
    }

    // --- Runs ---

    pub fn insert_run(&self, run: &SubmissionRun) -> Result<(), PersistenceError> {
        let guard = self.conn()?;
        insert_run_tx(&guard, run)
    }

    pub fn load_run(&self, run_id: &RunId) -> Result<Option<SubmissionRun>, PersistenceError> {
        let guard = self.conn()?;
        load_run_tx(&guard, run_id)
    }

    /// Insert a new run, repoint its target, and append the creation event
    /// in one transaction.
    pub fn create_run_with_event(
        &self,
        run: &SubmissionRun,
        target: &SubmissionTarget,
        event: &SubmissionEvent,
    ) -> Result<(), PersistenceError> {
        let mut guard = self.conn()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_run_tx(&tx, run)?;
        upsert_target_tx(&tx, target)?;
        insert_event_tx(&tx, event)?;
        tx.commit()?;
        Ok(())
    }

    /// Apply a status transition conditionally on the observed status, with
    /// its events, in one transaction. Never partially applies.
    pub fn apply_transition(
        &self,
        write: &TransitionWrite<'_>,
    ) -> Result<TransitionOutcome, PersistenceError> {
        let mut guard = self.conn()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(run) = load_run_tx(&tx, write.run_id)? else {
            return Ok(TransitionOutcome::NotFound);
        };
        if run.status != write.expected_from {
            return Ok(TransitionOutcome::Stale { actual: run.status });
        }

        let mut next = run;
        next.status = write.to;
        next.updated_at = write.updated_at;
        if write.clear_lock {
            next.lock = None;
        }
        if let Some(error) = write.set_error {
            next.last_error = Some(error.clone());
        }
        if let Some(external_id) = write.set_external_submission_id {
            next.external_submission_id = Some(external_id.to_string());
        }
        if let Some(action) = write.set_action {
            next.action_needed = Some(action.clone());
        }
        if let Some(next_run_at) = write.set_next_run_at {
            next.next_run_at = Some(next_run_at);
        } else if write.clear_next_run_at {
            next.next_run_at = None;
        }

        let changed = tx.execute(
            r#"
UPDATE runs SET
  status = ?2,
  locked_at = ?3,
  locked_by = ?4,
  lease_expires_at = ?5,
  error_type = ?6,
  error_code = ?7,
  error_message = ?8,
  external_submission_id = ?9,
  next_run_at = ?10,
  action_type = ?11,
  action_url = ?12,
  action_instructions = ?13,
  action_deadline = ?14,
  updated_at = ?15
WHERE run_id = ?1 AND status = ?16
"#,
            params![
                next.id.0,
                next.status.as_str(),
                next.lock.as_ref().map(|l| l.locked_at.to_rfc3339()),
                next.lock.as_ref().map(|l| l.locked_by.0.clone()),
                next.lock.as_ref().map(|l| l.lease_expires_at.to_rfc3339()),
                next.last_error.as_ref().map(|e| e.error_type.as_str()),
                next.last_error.as_ref().and_then(|e| e.code.clone()),
                next.last_error.as_ref().map(|e| e.message.clone()),
                next.external_submission_id,
                next.next_run_at.map(|at| at.to_rfc3339()),
                next.action_needed.as_ref().map(|a| a.action_type.as_str()),
                next.action_needed.as_ref().and_then(|a| a.url.clone()),
                next.action_needed
                    .as_ref()
                    .and_then(|a| a.instructions.clone()),
                next.action_needed
                    .as_ref()
                    .map(|a| a.deadline.to_rfc3339()),
                next.updated_at.to_rfc3339(),
                write.expected_from.as_str(),
            ],
        )?;
        // The status was read in this transaction; zero rows here means the
        // table changed underneath an Immediate transaction, which SQLite
        // does not allow.
        debug_assert_eq!(changed, 1);

        for event in write.events {
            insert_event_tx(&tx, event)?;
        }
        tx.commit()?;
        Ok(TransitionOutcome::Applied(next))
    }

    /// Set `changes_acknowledged` for a NEEDS_CHANGES run.
    pub fn acknowledge_changes(
        &self,
        run_id: &RunId,
        event: &SubmissionEvent,
    ) -> Result<AckOutcome, PersistenceError> {
        let mut guard = self.conn()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(run) = load_run_tx(&tx, run_id)? else {
            return Ok(AckOutcome::NotFound);
        };
        if run.status != RunStatus::NeedsChanges {
            return Ok(AckOutcome::InvalidStatus(run.status));
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE runs SET changes_acknowledged = 1, updated_at = ?2 WHERE run_id = ?1",
            params![run_id.0, now.to_rfc3339()],
        )?;
        insert_event_tx(&tx, event)?;
        tx.commit()?;

        let mut next = run;
        next.changes_acknowledged = true;
        next.updated_at = now;
        Ok(AckOutcome::Applied(next))
    }

    // --- Lock triple ---

    /// One atomic conditional lock acquisition.
    ///
    /// Succeeds only while the run is QUEUED and either unlocked or holding
    /// a lease expired past the grace period. The `event` is written only
    /// on the `Acquired` outcome.
    pub fn try_acquire_lock(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
        grace_ms: i64,
        event: &SubmissionEvent,
    ) -> Result<LockAttempt, PersistenceError> {
        let mut guard = self.conn()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(run) = load_run_tx(&tx, run_id)? else {
            return Ok(LockAttempt::NotFound);
        };
        if run.status != RunStatus::Queued {
            return Ok(LockAttempt::InvalidStatus(run.status));
        }

        if let Some(lock) = &run.lock {
            let reclaimable =
                lock.lease_expires_at + Duration::milliseconds(grace_ms) < now;
            if lock.locked_by == *worker_id && lock.lease_expires_at > now {
                return Ok(LockAttempt::AlreadyHeld {
                    lease_expires_at: lock.lease_expires_at,
                });
            }
            if lock.locked_by != *worker_id && !reclaimable {
                return Ok(LockAttempt::Held {
                    locked_by: lock.locked_by.clone(),
                    lease_expires_at: lock.lease_expires_at,
                });
            }
            // Same worker with an expired lease, or a lease expired past the
            // grace period: fall through and take a fresh lease.
        }

        tx.execute(
            r#"
UPDATE runs SET
  locked_at = ?2,
  locked_by = ?3,
  lease_expires_at = ?4,
  updated_at = ?2
WHERE run_id = ?1 AND status = 'QUEUED'
"#,
            params![
                run_id.0,
                now.to_rfc3339(),
                worker_id.0,
                lease_expires_at.to_rfc3339(),
            ],
        )?;
        insert_event_tx(&tx, event)?;
        tx.commit()?;
        Ok(LockAttempt::Acquired { lease_expires_at })
    }

    pub fn try_release_lock(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        event: &SubmissionEvent,
    ) -> Result<ReleaseAttempt, PersistenceError> {
        let mut guard = self.conn()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(run) = load_run_tx(&tx, run_id)? else {
            return Ok(ReleaseAttempt::NotFound);
        };
        match &run.lock {
            Some(lock) if lock.locked_by == *worker_id => {
                tx.execute(
                    r#"
UPDATE runs SET
  locked_at = NULL,
  locked_by = NULL,
  lease_expires_at = NULL,
  updated_at = ?2
WHERE run_id = ?1 AND locked_by = ?3
"#,
                    params![run_id.0, now.to_rfc3339(), worker_id.0],
                )?;
                insert_event_tx(&tx, event)?;
                tx.commit()?;
                Ok(ReleaseAttempt::Released)
            }
            _ => Ok(ReleaseAttempt::NotHeld),
        }
    }

    pub fn try_extend_lease(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
        event: &SubmissionEvent,
    ) -> Result<ExtendAttempt, PersistenceError> {
        let mut guard = self.conn()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(run) = load_run_tx(&tx, run_id)? else {
            return Ok(ExtendAttempt::NotFound);
        };
        match &run.lock {
            Some(lock) if lock.locked_by == *worker_id => {
                tx.execute(
                    r#"
UPDATE runs SET lease_expires_at = ?2, updated_at = ?3
WHERE run_id = ?1 AND locked_by = ?4
"#,
                    params![
                        run_id.0,
                        lease_expires_at.to_rfc3339(),
                        now.to_rfc3339(),
                        worker_id.0,
                    ],
                )?;
                insert_event_tx(&tx, event)?;
                tx.commit()?;
                Ok(ExtendAttempt::Extended { lease_expires_at })
            }
            _ => Ok(ExtendAttempt::NotHeld),
        }
    }

    // --- Scheduling queries ---

    /// DEFERRED runs whose `next_run_at` has elapsed, in due order.
    pub fn list_due_deferred(&self, now: DateTime<Utc>) -> Result<Vec<RunId>, PersistenceError> {
        let guard = self.conn()?;
        let mut stmt = guard.prepare(
            "SELECT run_id FROM runs \
             WHERE status = 'DEFERRED' AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             ORDER BY next_run_at ASC, run_id ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(RunId::new(row?));
        }
        Ok(ids)
    }

    /// Unlocked (or reclaimably locked) QUEUED runs in creation order.
    pub fn list_claimable_queued(
        &self,
        now: DateTime<Utc>,
        grace_ms: i64,
        limit: usize,
    ) -> Result<Vec<RunId>, PersistenceError> {
        let threshold = now - Duration::milliseconds(grace_ms);
        let guard = self.conn()?;
        let mut stmt = guard.prepare(
            "SELECT run_id FROM runs \
             WHERE status = 'QUEUED' AND (locked_by IS NULL OR lease_expires_at < ?1) \
             ORDER BY created_at ASC, run_id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![threshold.to_rfc3339(), limit as i64],
            |row| row.get::<_, String>(0),
        )?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(RunId::new(row?));
        }
        Ok(ids)
    }

    /// IN_PROGRESS runs whose lease expired past the grace period.
    pub fn list_expired_in_progress(
        &self,
        now: DateTime<Utc>,
        grace_ms: i64,
    ) -> Result<Vec<RunId>, PersistenceError> {
        let threshold = now - Duration::milliseconds(grace_ms);
        let guard = self.conn()?;
        let mut stmt = guard.prepare(
            "SELECT run_id FROM runs \
             WHERE status = 'IN_PROGRESS' AND lease_expires_at IS NOT NULL \
               AND lease_expires_at < ?1 \
             ORDER BY lease_expires_at ASC, run_id ASC",
        )?;
        let rows = stmt.query_map(params![threshold.to_rfc3339()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(RunId::new(row?));
        }
        Ok(ids)
    }

    /// ACTION_NEEDED runs whose deadline has elapsed.
    pub fn list_overdue_actions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunId>, PersistenceError> {
        let guard = self.conn()?;
        let mut stmt = guard.prepare(
            "SELECT run_id FROM runs \
             WHERE status = 'ACTION_NEEDED' AND action_deadline IS NOT NULL \
               AND action_deadline <= ?1 \
             ORDER BY action_deadline ASC, run_id ASC",
        )?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(RunId::new(row?));
        }
        Ok(ids)
    }

    pub fn count_runs_by_status(&self) -> Result<Vec<(String, i64)>, PersistenceError> {
        let guard = self.conn()?;
        let mut stmt = guard
            .prepare("SELECT status, COUNT(*) FROM runs GROUP BY status ORDER BY status ASC")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    // --- Events ---

    pub fn append_event(&self, event: &SubmissionEvent) -> Result<(), PersistenceError> {
        let guard = self.conn()?;
        insert_event_tx(&guard, event)
    }

    pub fn list_events_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<SubmissionEvent>, PersistenceError> {
        let guard = self.conn()?;
        let mut stmt = guard.prepare(
            "SELECT payload_json FROM events WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![run_id.0], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(events)
    }

    pub fn list_events_global(&self) -> Result<Vec<SubmissionEvent>, PersistenceError> {
        let guard = self.conn()?;
        let mut stmt = guard.prepare("SELECT payload_json FROM events ORDER BY rowid ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str(&row?)?);
        }
        Ok(events)
    }

    // --- Artifacts ---

    /// Insert an artifact row and its events in one transaction, so an
    /// artifact never exists without the events that announce it.
    pub fn insert_artifact_with_events(
        &self,
        artifact: &SubmissionArtifact,
        events: &[SubmissionEvent],
    ) -> Result<(), PersistenceError> {
        let payload = serde_json::to_string(artifact)?;
        let mut guard = self.conn()?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
INSERT INTO artifacts (artifact_id, run_id, target_id, type_tag, created_at, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
            params![
                artifact.id.0,
                artifact.run_id.as_ref().map(|id| id.0.clone()),
                artifact.target_id.as_ref().map(|id| id.0.clone()),
                artifact.artifact_type.as_str(),
                artifact.created_at.to_rfc3339(),
                payload,
            ],
        )?;
        for event in events {
            insert_event_tx(&tx, event)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_artifacts_for_run(
        &self,
        run_id: &RunId,
    ) -> Result<Vec<SubmissionArtifact>, PersistenceError> {
        let guard = self.conn()?;
        let mut stmt = guard.prepare(
            "SELECT payload_json FROM artifacts WHERE run_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![run_id.0], |row| row.get::<_, String>(0))?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(serde_json::from_str(&row?)?);
        }
        Ok(artifacts)
    }

    pub fn list_artifacts_for_target(
        &self,
        target_id: &TargetId,
    ) -> Result<Vec<SubmissionArtifact>, PersistenceError> {
        let guard = self.conn()?;
        let mut stmt = guard.prepare(
            "SELECT payload_json FROM artifacts WHERE target_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![target_id.0], |row| row.get::<_, String>(0))?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(serde_json::from_str(&row?)?);
        }
        Ok(artifacts)
    }

    /// Raw lock columns for a run. Test/diagnostic helper for checking the
    /// all-or-nothing lock triple at the storage level.
    pub fn raw_lock_columns(
        &self,
        run_id: &RunId,
    ) -> Result<Option<(Option<String>, Option<String>, Option<String>)>, PersistenceError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT locked_at, locked_by, lease_expires_at FROM runs WHERE run_id = ?1",
                params![run_id.0],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }
}

fn insert_run_tx(conn: &Connection, run: &SubmissionRun) -> Result<(), PersistenceError> {
    conn.execute(
        &format!(
            "INSERT INTO runs ({RUN_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, \
              ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)"
        ),
        params![
            run.id.0,
            run.target_id.0,
            run.status.as_str(),
            run.attempt_no,
            run.triggered_by.as_str(),
            run.triggered_by_id,
            run.previous_run_id.as_ref().map(|id| id.0.clone()),
            run.correlation_id,
            run.lock.as_ref().map(|l| l.locked_at.to_rfc3339()),
            run.lock.as_ref().map(|l| l.locked_by.0.clone()),
            run.lock.as_ref().map(|l| l.lease_expires_at.to_rfc3339()),
            run.last_error.as_ref().map(|e| e.error_type.as_str()),
            run.last_error.as_ref().and_then(|e| e.code.clone()),
            run.last_error.as_ref().map(|e| e.message.clone()),
            run.external_submission_id,
            run.next_run_at.map(|at| at.to_rfc3339()),
            run.action_needed.as_ref().map(|a| a.action_type.as_str()),
            run.action_needed.as_ref().and_then(|a| a.url.clone()),
            run.action_needed
                .as_ref()
                .and_then(|a| a.instructions.clone()),
            run.action_needed.as_ref().map(|a| a.deadline.to_rfc3339()),
            run.changes_acknowledged,
            run.created_at.to_rfc3339(),
            run.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn upsert_target_tx(conn: &Connection, target: &SubmissionTarget) -> Result<(), PersistenceError> {
    let payload = serde_json::to_string(target)?;
    conn.execute(
        r#"
INSERT INTO targets (target_id, business_id, directory_id, payload_json, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(target_id) DO UPDATE SET
  business_id = excluded.business_id,
  directory_id = excluded.directory_id,
  payload_json = excluded.payload_json,
  updated_at = excluded.updated_at
"#,
        params![
            target.id.0,
            target.business_id.0,
            target.directory_id.0,
            payload,
            target.created_at.to_rfc3339(),
            target.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use subm_core::events::EventKind;
    use subm_core::policy::StatusReason;
    use subm_core::types::TriggeredBy;

    fn mk_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        store.migrate().expect("migrate");
        store
    }

    fn mk_run(id: &str, status: RunStatus) -> SubmissionRun {
        let now = Utc::now();
        SubmissionRun {
            id: RunId::new(id),
            target_id: TargetId::new("T1"),
            status,
            attempt_no: 1,
            triggered_by: TriggeredBy::Scheduler,
            triggered_by_id: None,
            previous_run_id: None,
            correlation_id: "corr-1".to_string(),
            lock: None,
            last_error: None,
            external_submission_id: None,
            next_run_at: None,
            action_needed: None,
            changes_acknowledged: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn lock_event(run_id: &str, worker: &WorkerId, expires: DateTime<Utc>) -> SubmissionEvent {
        SubmissionEvent::for_run(
            RunId::new(run_id),
            TriggeredBy::Worker,
            Some(worker.0.clone()),
            EventKind::LockAcquired {
                worker_id: worker.clone(),
                lease_expires_at: expires,
            },
        )
    }

    fn release_event(run_id: &str, worker: &WorkerId) -> SubmissionEvent {
        SubmissionEvent::for_run(
            RunId::new(run_id),
            TriggeredBy::Worker,
            Some(worker.0.clone()),
            EventKind::LockReleased {
                worker_id: worker.clone(),
            },
        )
    }

    #[test]
    fn insert_and_load_run_round_trips() {
        let store = mk_store();
        let run = mk_run("R1", RunStatus::Queued);
        store.insert_run(&run).expect("insert run");
        let loaded = store
            .load_run(&RunId::new("R1"))
            .expect("load run")
            .expect("run exists");
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(loaded.attempt_no, 1);
        assert!(loaded.lock.is_none());
    }

    #[test]
    fn acquire_lock_on_unlocked_queued_run_succeeds() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");

        let worker = WorkerId::new("w1");
        let now = Utc::now();
        let expires = now + Duration::milliseconds(30_000);
        let attempt = store
            .try_acquire_lock(
                &RunId::new("R1"),
                &worker,
                now,
                expires,
                5_000,
                &lock_event("R1", &worker, expires),
            )
            .expect("acquire");
        assert!(matches!(attempt, LockAttempt::Acquired { .. }));

        let (locked_at, locked_by, lease) = store
            .raw_lock_columns(&RunId::new("R1"))
            .expect("raw columns")
            .expect("row");
        assert!(locked_at.is_some());
        assert_eq!(locked_by.as_deref(), Some("w1"));
        assert!(lease.is_some());
    }

    #[test]
    fn contended_lock_reports_holder() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");

        let now = Utc::now();
        let expires = now + Duration::milliseconds(30_000);
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        store
            .try_acquire_lock(
                &RunId::new("R1"),
                &w1,
                now,
                expires,
                5_000,
                &lock_event("R1", &w1, expires),
            )
            .expect("first acquire");

        let attempt = store
            .try_acquire_lock(
                &RunId::new("R1"),
                &w2,
                now,
                expires,
                5_000,
                &lock_event("R1", &w2, expires),
            )
            .expect("second acquire");
        match attempt {
            LockAttempt::Held {
                locked_by,
                lease_expires_at,
            } => {
                assert_eq!(locked_by.0, "w1");
                assert_eq!(lease_expires_at.timestamp(), expires.timestamp());
            }
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn expired_lease_past_grace_is_reclaimable() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");

        let now = Utc::now();
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        // Lease that expired 10 seconds ago, against a 5-second grace.
        let stale_expiry = now - Duration::milliseconds(10_000);
        store
            .try_acquire_lock(
                &RunId::new("R1"),
                &w1,
                now - Duration::milliseconds(40_000),
                stale_expiry,
                5_000,
                &lock_event("R1", &w1, stale_expiry),
            )
            .expect("first acquire");

        let fresh_expiry = now + Duration::milliseconds(30_000);
        let attempt = store
            .try_acquire_lock(
                &RunId::new("R1"),
                &w2,
                now,
                fresh_expiry,
                5_000,
                &lock_event("R1", &w2, fresh_expiry),
            )
            .expect("reclaim");
        assert!(matches!(attempt, LockAttempt::Acquired { .. }));
    }

    #[test]
    fn expired_lease_within_grace_is_not_reclaimable() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");

        let now = Utc::now();
        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        // Expired 2 seconds ago; grace is 5 seconds.
        let stale_expiry = now - Duration::milliseconds(2_000);
        store
            .try_acquire_lock(
                &RunId::new("R1"),
                &w1,
                now - Duration::milliseconds(32_000),
                stale_expiry,
                5_000,
                &lock_event("R1", &w1, stale_expiry),
            )
            .expect("first acquire");

        let attempt = store
            .try_acquire_lock(
                &RunId::new("R1"),
                &w2,
                now,
                now + Duration::milliseconds(30_000),
                5_000,
                &lock_event("R1", &w2, now),
            )
            .expect("contended acquire");
        assert!(matches!(attempt, LockAttempt::Held { .. }));
    }

    #[test]
    fn release_clears_the_whole_triple() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");

        let worker = WorkerId::new("w1");
        let now = Utc::now();
        let expires = now + Duration::milliseconds(30_000);
        store
            .try_acquire_lock(
                &RunId::new("R1"),
                &worker,
                now,
                expires,
                5_000,
                &lock_event("R1", &worker, expires),
            )
            .expect("acquire");

        let released = store
            .try_release_lock(
                &RunId::new("R1"),
                &worker,
                now,
                &release_event("R1", &worker),
            )
            .expect("release");
        assert_eq!(released, ReleaseAttempt::Released);

        let (locked_at, locked_by, lease) = store
            .raw_lock_columns(&RunId::new("R1"))
            .expect("raw columns")
            .expect("row");
        assert!(locked_at.is_none());
        assert!(locked_by.is_none());
        assert!(lease.is_none());
    }

    #[test]
    fn release_by_non_holder_is_rejected() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");

        let w1 = WorkerId::new("w1");
        let w2 = WorkerId::new("w2");
        let now = Utc::now();
        let expires = now + Duration::milliseconds(30_000);
        store
            .try_acquire_lock(
                &RunId::new("R1"),
                &w1,
                now,
                expires,
                5_000,
                &lock_event("R1", &w1, expires),
            )
            .expect("acquire");

        let released = store
            .try_release_lock(&RunId::new("R1"), &w2, now, &release_event("R1", &w2))
            .expect("release attempt");
        assert_eq!(released, ReleaseAttempt::NotHeld);
        let (_, locked_by, _) = store
            .raw_lock_columns(&RunId::new("R1"))
            .expect("raw columns")
            .expect("row");
        assert_eq!(locked_by.as_deref(), Some("w1"));
    }

    #[test]
    fn apply_transition_is_conditional_on_observed_status() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");

        let event = SubmissionEvent::for_run(
            RunId::new("R1"),
            TriggeredBy::Worker,
            None,
            EventKind::StatusChanged {
                from: "QUEUED".to_string(),
                to: "IN_PROGRESS".to_string(),
                reason: StatusReason::SubmissionStarted,
            },
        );
        let outcome = store
            .apply_transition(&TransitionWrite {
                run_id: &RunId::new("R1"),
                expected_from: RunStatus::Queued,
                to: RunStatus::InProgress,
                updated_at: Utc::now(),
                set_error: None,
                set_external_submission_id: None,
                set_action: None,
                set_next_run_at: None,
                clear_next_run_at: false,
                clear_lock: false,
                events: std::slice::from_ref(&event),
            })
            .expect("transition");
        assert!(matches!(outcome, TransitionOutcome::Applied(_)));

        // Second identical write observes IN_PROGRESS and reports stale.
        let outcome = store
            .apply_transition(&TransitionWrite {
                run_id: &RunId::new("R1"),
                expected_from: RunStatus::Queued,
                to: RunStatus::InProgress,
                updated_at: Utc::now(),
                set_error: None,
                set_external_submission_id: None,
                set_action: None,
                set_next_run_at: None,
                clear_next_run_at: false,
                clear_lock: false,
                events: &[],
            })
            .expect("stale transition");
        assert_eq!(
            outcome,
            TransitionOutcome::Stale {
                actual: RunStatus::InProgress
            }
        );

        let events = store
            .list_events_for_run(&RunId::new("R1"))
            .expect("events");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn claimable_queued_respects_creation_order_and_limit() {
        let store = mk_store();
        let base = Utc::now();
        for (id, offset) in [("R2", 2), ("R1", 1), ("R3", 3)] {
            let mut run = mk_run(id, RunStatus::Queued);
            run.created_at = base + Duration::seconds(offset);
            run.updated_at = run.created_at;
            store.insert_run(&run).expect("insert run");
        }

        let ids = store
            .list_claimable_queued(base + Duration::seconds(10), 5_000, 2)
            .expect("claimable");
        let ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        assert_eq!(ids, vec!["R1", "R2"]);
    }

    #[test]
    fn due_deferred_excludes_future_retries() {
        let store = mk_store();
        let now = Utc::now();

        let mut due = mk_run("R-DUE", RunStatus::Deferred);
        due.next_run_at = Some(now - Duration::seconds(1));
        store.insert_run(&due).expect("insert due");

        let mut future = mk_run("R-FUTURE", RunStatus::Deferred);
        future.next_run_at = Some(now + Duration::seconds(3600));
        store.insert_run(&future).expect("insert future");

        let ids = store.list_due_deferred(now).expect("due deferred");
        let ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        assert_eq!(ids, vec!["R-DUE"]);
    }

    #[test]
    fn expired_in_progress_honors_grace() {
        let store = mk_store();
        let now = Utc::now();

        let mut expired = mk_run("R-EXPIRED", RunStatus::InProgress);
        expired.lock = Some(RunLock {
            locked_at: now - Duration::seconds(60),
            locked_by: WorkerId::new("w-dead"),
            lease_expires_at: now - Duration::seconds(30),
        });
        store.insert_run(&expired).expect("insert expired");

        let mut recent = mk_run("R-RECENT", RunStatus::InProgress);
        recent.lock = Some(RunLock {
            locked_at: now - Duration::seconds(31),
            locked_by: WorkerId::new("w-live"),
            lease_expires_at: now - Duration::seconds(1),
        });
        store.insert_run(&recent).expect("insert recent");

        let ids = store
            .list_expired_in_progress(now, 5_000)
            .expect("expired in progress");
        let ids: Vec<&str> = ids.iter().map(|id| id.0.as_str()).collect();
        assert_eq!(ids, vec!["R-EXPIRED"]);
    }

    #[test]
    fn partial_lock_triple_is_rejected_on_read() {
        let store = mk_store();
        store
            .insert_run(&mk_run("R1", RunStatus::Queued))
            .expect("insert run");
        store
            .conn()
            .expect("conn")
            .execute(
                "UPDATE runs SET locked_by = 'w1' WHERE run_id = 'R1'",
                [],
            )
            .expect("corrupt row");

        let err = store.load_run(&RunId::new("R1")).expect_err("load fails");
        assert!(matches!(err, PersistenceError::PartialLock { .. }));
    }
}
