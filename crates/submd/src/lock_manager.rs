//! Optimistic per-run leases.
//!
//! A worker claims a QUEUED run by writing the lock triple conditionally;
//! losing the race is an ordinary outcome, not an error. Leases are short
//! and extended while work is in flight, so a crashed worker's run becomes
//! reclaimable once the lease (plus a grace period) lapses.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use subm_core::config::WorkerConfig;
use subm_core::events::{EventKind, SubmissionEvent};
use subm_core::status::RunStatus;
use subm_core::types::{RunId, TriggeredBy, WorkerId};

use crate::event_log::{mirror_events, JsonlEventLog};
use crate::persistence::{
    ExtendAttempt, LockAttempt, PersistenceError, ReleaseAttempt, SqliteStore,
};

/// What an acquisition attempt came back with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Fresh lease taken; LOCK_ACQUIRED was recorded.
    Acquired { lease_expires_at: DateTime<Utc> },
    /// This worker already holds a live lease. Idempotent, no new event.
    AlreadyHeld { lease_expires_at: DateTime<Utc> },
    /// Another worker holds a live (or in-grace) lease.
    LockHeld {
        locked_by: WorkerId,
        lease_expires_at: DateTime<Utc>,
    },
    /// The run is not QUEUED, so it cannot be claimed.
    InvalidStatus(RunStatus),
    NotFound,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    store: Arc<SqliteStore>,
    log: JsonlEventLog,
    worker_id: WorkerId,
    lease_duration_ms: i64,
    lease_grace_ms: i64,
}

impl LockManager {
    pub fn new(
        store: Arc<SqliteStore>,
        log: JsonlEventLog,
        worker_id: WorkerId,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            store,
            log,
            worker_id,
            lease_duration_ms: config.lease_duration_ms,
            lease_grace_ms: config.lease_grace_ms,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn lease_grace_ms(&self) -> i64 {
        self.lease_grace_ms
    }

    /// Try to claim a QUEUED run with a fresh lease.
    pub fn acquire(&self, run_id: &RunId) -> Result<AcquireOutcome, PersistenceError> {
        let now = Utc::now();
        let lease_expires_at = now + Duration::milliseconds(self.lease_duration_ms);
        let event = self.run_event(
            run_id,
            EventKind::LockAcquired {
                worker_id: self.worker_id.clone(),
                lease_expires_at,
            },
        );

        let attempt = self.store.try_acquire_lock(
            run_id,
            &self.worker_id,
            now,
            lease_expires_at,
            self.lease_grace_ms,
            &event,
        )?;
        Ok(match attempt {
            LockAttempt::Acquired { lease_expires_at } => {
                mirror_events(&self.log, std::slice::from_ref(&event));
                AcquireOutcome::Acquired { lease_expires_at }
            }
            LockAttempt::AlreadyHeld { lease_expires_at } => {
                AcquireOutcome::AlreadyHeld { lease_expires_at }
            }
            LockAttempt::Held {
                locked_by,
                lease_expires_at,
            } => AcquireOutcome::LockHeld {
                locked_by,
                lease_expires_at,
            },
            LockAttempt::InvalidStatus(status) => AcquireOutcome::InvalidStatus(status),
            LockAttempt::NotFound => AcquireOutcome::NotFound,
        })
    }

    /// Release this worker's lease. Releasing a lock held by someone else
    /// (or by nobody) is a no-op reported as `false`.
    pub fn release(&self, run_id: &RunId) -> Result<bool, PersistenceError> {
        let event = self.run_event(
            run_id,
            EventKind::LockReleased {
                worker_id: self.worker_id.clone(),
            },
        );
        let attempt =
            self.store
                .try_release_lock(run_id, &self.worker_id, Utc::now(), &event)?;
        Ok(match attempt {
            ReleaseAttempt::Released => {
                mirror_events(&self.log, std::slice::from_ref(&event));
                true
            }
            ReleaseAttempt::NotHeld | ReleaseAttempt::NotFound => false,
        })
    }

    /// Push this worker's lease expiry forward by one lease duration.
    pub fn extend(&self, run_id: &RunId) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let now = Utc::now();
        let lease_expires_at = now + Duration::milliseconds(self.lease_duration_ms);
        let event = self.run_event(
            run_id,
            EventKind::LeaseExtended {
                worker_id: self.worker_id.clone(),
                lease_expires_at,
            },
        );
        let attempt = self.store.try_extend_lease(
            run_id,
            &self.worker_id,
            now,
            lease_expires_at,
            &event,
        )?;
        Ok(match attempt {
            ExtendAttempt::Extended { lease_expires_at } => {
                mirror_events(&self.log, std::slice::from_ref(&event));
                Some(lease_expires_at)
            }
            ExtendAttempt::NotHeld | ExtendAttempt::NotFound => None,
        })
    }

    fn run_event(&self, run_id: &RunId, kind: EventKind) -> SubmissionEvent {
        SubmissionEvent::for_run(
            run_id.clone(),
            TriggeredBy::Worker,
            Some(self.worker_id.0.clone()),
            kind,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subm_core::types::{SubmissionRun, TargetId};

    fn mk_store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().expect("open store");
        store.migrate().expect("migrate");
        Arc::new(store)
    }

    fn mk_manager(
        store: Arc<SqliteStore>,
        dir: &tempfile::TempDir,
        worker: &str,
    ) -> LockManager {
        LockManager::new(
            store,
            JsonlEventLog::new(dir.path().join("events")),
            WorkerId::new(worker),
            &WorkerConfig::default(),
        )
    }

    fn queued_run(id: &str) -> SubmissionRun {
        let now = Utc::now();
        SubmissionRun {
            id: RunId::new(id),
            target_id: TargetId::new("T1"),
            status: RunStatus::Queued,
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

    #[test]
    fn two_workers_racing_yields_one_acquire_and_one_lock_held() {
        let store = mk_store();
        store.insert_run(&queued_run("R1")).expect("insert run");
        let dir = tempfile::tempdir().expect("tempdir");
        let w1 = mk_manager(Arc::clone(&store), &dir, "w1");
        let w2 = mk_manager(Arc::clone(&store), &dir, "w2");

        let first = w1.acquire(&RunId::new("R1")).expect("w1 acquire");
        assert!(matches!(first, AcquireOutcome::Acquired { .. }));

        let second = w2.acquire(&RunId::new("R1")).expect("w2 acquire");
        match second {
            AcquireOutcome::LockHeld { locked_by, .. } => assert_eq!(locked_by.0, "w1"),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn reacquire_by_holder_is_idempotent_with_a_single_event() {
        let store = mk_store();
        store.insert_run(&queued_run("R1")).expect("insert run");
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = mk_manager(Arc::clone(&store), &dir, "w1");

        let first = manager.acquire(&RunId::new("R1")).expect("first acquire");
        assert!(matches!(first, AcquireOutcome::Acquired { .. }));
        let second = manager.acquire(&RunId::new("R1")).expect("second acquire");
        assert!(matches!(second, AcquireOutcome::AlreadyHeld { .. }));

        let events = store
            .list_events_for_run(&RunId::new("R1"))
            .expect("events");
        let acquired: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::LockAcquired { .. }))
            .collect();
        assert_eq!(acquired.len(), 1);
    }

    #[test]
    fn acquire_on_non_queued_run_reports_invalid_status() {
        let store = mk_store();
        let mut run = queued_run("R1");
        run.status = RunStatus::InProgress;
        store.insert_run(&run).expect("insert run");
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = mk_manager(store, &dir, "w1");

        let outcome = manager.acquire(&RunId::new("R1")).expect("acquire");
        assert_eq!(
            outcome,
            AcquireOutcome::InvalidStatus(RunStatus::InProgress)
        );
    }

    #[test]
    fn extend_moves_the_lease_forward_for_the_holder_only() {
        let store = mk_store();
        store.insert_run(&queued_run("R1")).expect("insert run");
        let dir = tempfile::tempdir().expect("tempdir");
        let w1 = mk_manager(Arc::clone(&store), &dir, "w1");
        let w2 = mk_manager(Arc::clone(&store), &dir, "w2");

        let AcquireOutcome::Acquired { lease_expires_at } =
            w1.acquire(&RunId::new("R1")).expect("acquire")
        else {
            panic!("expected acquire");
        };

        let extended = w1.extend(&RunId::new("R1")).expect("extend");
        let new_expiry = extended.expect("holder can extend");
        assert!(new_expiry >= lease_expires_at);

        let denied = w2.extend(&RunId::new("R1")).expect("extend by non-holder");
        assert!(denied.is_none());
    }

    #[test]
    fn release_by_holder_emits_lock_released() {
        let store = mk_store();
        store.insert_run(&queued_run("R1")).expect("insert run");
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = mk_manager(Arc::clone(&store), &dir, "w1");

        manager.acquire(&RunId::new("R1")).expect("acquire");
        assert!(manager.release(&RunId::new("R1")).expect("release"));
        assert!(!manager.release(&RunId::new("R1")).expect("second release"));

        let events = store
            .list_events_for_run(&RunId::new("R1"))
            .expect("events");
        let released: Vec<_> = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::LockReleased { .. }))
            .collect();
        assert_eq!(released.len(), 1);
    }
}
