//! User-initiated operations: pause, resume, cancel, acknowledge, retry,
//! complete-action.
//!
//! Ownership checks live in the HTTP layer above; these functions validate
//! the run's current status and route every mutation through the state
//! machine. Retrying never mutates the old run: it spawns a successor.

use std::sync::Arc;

use subm_core::events::{EventKind, SubmissionEvent};
use subm_core::policy::StatusReason;
use subm_core::status::RunStatus;
use subm_core::types::{RunId, SubmissionRun, TriggeredBy};

use crate::event_log::{mirror_events, JsonlEventLog};
use crate::persistence::{AckOutcome, PersistenceError, SqliteStore};
use crate::state_machine::{StateMachineError, StateMachineService, TransitionRequest};

#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("run {0} not found")]
    RunNotFound(RunId),
    #[error("cannot {operation} run {run_id} in status {status}")]
    InvalidStatus {
        run_id: RunId,
        status: RunStatus,
        operation: &'static str,
    },
    #[error("run {0} needs its requested changes acknowledged before retry")]
    ChangesNotAcknowledged(RunId),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[derive(Debug, Clone)]
pub struct Operations {
    store: Arc<SqliteStore>,
    log: JsonlEventLog,
    state_machine: StateMachineService,
}

impl Operations {
    pub fn new(store: Arc<SqliteStore>, log: JsonlEventLog) -> Self {
        Self {
            state_machine: StateMachineService::new(Arc::clone(&store), log.clone()),
            store,
            log,
        }
    }

    fn load(&self, run_id: &RunId) -> Result<SubmissionRun, OpsError> {
        self.store
            .load_run(run_id)?
            .ok_or_else(|| OpsError::RunNotFound(run_id.clone()))
    }

    /// Pause a run that is queued, deferred, in progress, or awaiting action.
    pub fn pause(&self, run_id: &RunId, user_id: &str) -> Result<SubmissionRun, OpsError> {
        let run = self.load(run_id)?;
        if !run.status.can_pause() {
            return Err(OpsError::InvalidStatus {
                run_id: run_id.clone(),
                status: run.status,
                operation: "pause",
            });
        }
        let mut request = TransitionRequest::new(
            run.id.clone(),
            run.status,
            RunStatus::Paused,
            StatusReason::UserPaused,
            TriggeredBy::User,
        );
        request.triggered_by_id = Some(user_id.to_string());
        request.clear_lock = true;
        Ok(self.state_machine.transition(request)?)
    }

    /// Resume a paused run back into the queue.
    pub fn resume(&self, run_id: &RunId, user_id: &str) -> Result<SubmissionRun, OpsError> {
        let run = self.load(run_id)?;
        if run.status != RunStatus::Paused {
            return Err(OpsError::InvalidStatus {
                run_id: run_id.clone(),
                status: run.status,
                operation: "resume",
            });
        }
        let mut request = TransitionRequest::new(
            run.id.clone(),
            RunStatus::Paused,
            RunStatus::Queued,
            StatusReason::UserResumed,
            TriggeredBy::User,
        );
        request.triggered_by_id = Some(user_id.to_string());
        Ok(self.state_machine.transition(request)?)
    }

    /// Cancel any non-terminal run.
    pub fn cancel(&self, run_id: &RunId, user_id: &str) -> Result<SubmissionRun, OpsError> {
        let run = self.load(run_id)?;
        if run.status.is_terminal() {
            return Err(OpsError::InvalidStatus {
                run_id: run_id.clone(),
                status: run.status,
                operation: "cancel",
            });
        }
        let mut request = TransitionRequest::new(
            run.id.clone(),
            run.status,
            RunStatus::Cancelled,
            StatusReason::UserCancelled,
            TriggeredBy::User,
        );
        request.triggered_by_id = Some(user_id.to_string());
        request.clear_lock = true;
        Ok(self.state_machine.transition(request)?)
    }

    /// Record that the user has seen and addressed requested changes.
    /// The only path that sets `changes_acknowledged`.
    pub fn acknowledge_changes(
        &self,
        run_id: &RunId,
        user_id: &str,
    ) -> Result<SubmissionRun, OpsError> {
        let event = SubmissionEvent::for_run(
            run_id.clone(),
            TriggeredBy::User,
            Some(user_id.to_string()),
            EventKind::ChangesAcknowledged {
                user_id: user_id.to_string(),
            },
        );
        match self.store.acknowledge_changes(run_id, &event)? {
            AckOutcome::Applied(run) => {
                mirror_events(&self.log, std::slice::from_ref(&event));
                Ok(run)
            }
            AckOutcome::InvalidStatus(status) => Err(OpsError::InvalidStatus {
                run_id: run_id.clone(),
                status,
                operation: "acknowledge changes for",
            }),
            AckOutcome::NotFound => Err(OpsError::RunNotFound(run_id.clone())),
        }
    }

    /// Spawn a successor run for a retry-eligible run.
    ///
    /// NEEDS_CHANGES additionally requires the changes to be acknowledged
    /// first, so a retry never resubmits content the directory objected to.
    pub fn retry(&self, run_id: &RunId, user_id: &str) -> Result<SubmissionRun, OpsError> {
        let run = self.load(run_id)?;
        if !run.status.is_retry_entry_point() {
            return Err(OpsError::InvalidStatus {
                run_id: run_id.clone(),
                status: run.status,
                operation: "retry",
            });
        }
        if run.status == RunStatus::NeedsChanges && !run.changes_acknowledged {
            return Err(OpsError::ChangesNotAcknowledged(run_id.clone()));
        }
        Ok(self.state_machine.create_run(
            &run.target_id,
            TriggeredBy::User,
            Some(user_id.to_string()),
            Some(&run),
        )?)
    }

    /// Mark an out-of-band action as completed by the user.
    pub fn complete_action(
        &self,
        run_id: &RunId,
        user_id: &str,
        external_submission_id: Option<String>,
    ) -> Result<SubmissionRun, OpsError> {
        let run = self.load(run_id)?;
        if run.status != RunStatus::ActionNeeded {
            return Err(OpsError::InvalidStatus {
                run_id: run_id.clone(),
                status: run.status,
                operation: "complete action for",
            });
        }
        let mut request = TransitionRequest::new(
            run.id.clone(),
            RunStatus::ActionNeeded,
            RunStatus::Submitted,
            StatusReason::SubmissionAccepted,
            TriggeredBy::User,
        );
        request.triggered_by_id = Some(user_id.to_string());
        request.external_submission_id = external_submission_id;
        Ok(self.state_machine.transition(request)?)
    }

    pub fn run_events(&self, run_id: &RunId) -> Result<Vec<SubmissionEvent>, OpsError> {
        Ok(self.store.list_events_for_run(run_id)?)
    }

    pub fn status_counts(&self) -> Result<Vec<(String, i64)>, OpsError> {
        Ok(self.store.count_runs_by_status()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use subm_core::types::{
        BusinessId, DirectoryId, SubmissionMode, SubmissionTarget, TargetId, TargetPriority,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        ops: Operations,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open_in_memory().expect("open store");
        store.migrate().expect("migrate");
        let store = Arc::new(store);
        let ops = Operations::new(
            Arc::clone(&store),
            JsonlEventLog::new(dir.path().join("events")),
        );

        let now = Utc::now();
        store
            .upsert_target(&SubmissionTarget {
                id: TargetId::new("T1"),
                business_id: BusinessId::new("B1"),
                directory_id: DirectoryId::new("D1"),
                submission_mode: SubmissionMode::Auto,
                priority: TargetPriority::Normal,
                current_status: None,
                current_run_id: None,
                created_at: now,
                updated_at: now,
            })
            .expect("target");

        Fixture {
            _dir: dir,
            store,
            ops,
        }
    }

    fn insert_run(fixture: &Fixture, id: &str, status: RunStatus) -> SubmissionRun {
        let now = Utc::now();
        let run = SubmissionRun {
            id: RunId::new(id),
            target_id: TargetId::new("T1"),
            status,
            attempt_no: 1,
            triggered_by: TriggeredBy::User,
            triggered_by_id: Some("u1".to_string()),
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
        };
        fixture.store.insert_run(&run).expect("insert run");
        run
    }

    #[test]
    fn pause_and_resume_round_trip_through_queued() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::Queued);

        let paused = fixture.ops.pause(&run.id, "u1").expect("pause");
        assert_eq!(paused.status, RunStatus::Paused);

        let resumed = fixture.ops.resume(&run.id, "u1").expect("resume");
        assert_eq!(resumed.status, RunStatus::Queued);
    }

    #[test]
    fn pause_is_rejected_outside_pausable_statuses() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::Submitted);

        let err = fixture.ops.pause(&run.id, "u1").expect_err("pause rejected");
        assert!(matches!(err, OpsError::InvalidStatus { .. }));
    }

    #[test]
    fn cancel_is_rejected_on_terminal_runs() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::Failed);

        let err = fixture
            .ops
            .cancel(&run.id, "u1")
            .expect_err("cancel rejected");
        assert!(matches!(err, OpsError::InvalidStatus { .. }));
    }

    #[test]
    fn cancel_works_from_action_needed() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::ActionNeeded);

        let cancelled = fixture.ops.cancel(&run.id, "u1").expect("cancel");
        assert_eq!(cancelled.status, RunStatus::Cancelled);
    }

    #[test]
    fn complete_action_lands_in_submitted_with_accepted_reason() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::ActionNeeded);

        let completed = fixture
            .ops
            .complete_action(&run.id, "u1", Some("X900".to_string()))
            .expect("complete action");
        assert_eq!(completed.status, RunStatus::Submitted);
        assert_eq!(completed.external_submission_id.as_deref(), Some("X900"));

        let events = fixture.ops.run_events(&run.id).expect("events");
        let accepted = events.iter().any(|e| {
            matches!(
                &e.kind,
                EventKind::StatusChanged { reason, .. }
                    if *reason == StatusReason::SubmissionAccepted
            )
        });
        assert!(accepted);
    }

    #[test]
    fn needs_changes_retry_requires_acknowledgement() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::NeedsChanges);

        let err = fixture.ops.retry(&run.id, "u1").expect_err("retry blocked");
        assert!(matches!(err, OpsError::ChangesNotAcknowledged(_)));

        fixture
            .ops
            .acknowledge_changes(&run.id, "u1")
            .expect("acknowledge");
        let successor = fixture.ops.retry(&run.id, "u1").expect("retry");
        assert_eq!(successor.status, RunStatus::Queued);
        assert_eq!(successor.attempt_no, 2);
        assert_eq!(successor.previous_run_id, Some(run.id.clone()));
        assert_eq!(successor.correlation_id, run.correlation_id);
    }

    #[test]
    fn failed_run_retries_into_a_new_run() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::Failed);

        let successor = fixture.ops.retry(&run.id, "u1").expect("retry");
        assert_ne!(successor.id, run.id);
        assert_eq!(successor.status, RunStatus::Queued);

        let original = fixture
            .store
            .load_run(&run.id)
            .expect("load run")
            .expect("run exists");
        assert_eq!(original.status, RunStatus::Failed);
    }

    #[test]
    fn retry_is_rejected_from_non_entry_points() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::Submitted);

        let err = fixture.ops.retry(&run.id, "u1").expect_err("retry rejected");
        assert!(matches!(err, OpsError::InvalidStatus { .. }));
    }

    #[test]
    fn acknowledge_changes_only_applies_to_needs_changes() {
        let fixture = fixture();
        let run = insert_run(&fixture, "R1", RunStatus::Queued);

        let err = fixture
            .ops
            .acknowledge_changes(&run.id, "u1")
            .expect_err("ack rejected");
        assert!(matches!(err, OpsError::InvalidStatus { .. }));
    }
}
