//! Sole writer of run statuses.
//!
//! Every status change in the system goes through [`StateMachineService`]:
//! it validates the transition against the lifecycle table, applies it
//! conditionally on the status the caller observed, and writes the
//! STATUS_CHANGED event in the same transaction. Retries never rewind a
//! run; they spawn a fresh run linked by `previous_run_id`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use subm_core::events::{EventKind, SubmissionEvent};
use subm_core::policy::StatusReason;
use subm_core::status::{is_transition_allowed, RunStatus};
use subm_core::types::{ActionNeeded, ErrorDetail, RunId, SubmissionRun, TargetId, TriggeredBy};

use crate::event_log::{mirror_events, JsonlEventLog};
use crate::persistence::{PersistenceError, SqliteStore, TransitionOutcome, TransitionWrite};

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid run status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error("run {run_id} status changed underneath: expected {expected}, found {actual}")]
    StaleStatus {
        run_id: RunId,
        expected: RunStatus,
        actual: RunStatus,
    },
    #[error("run {0} not found")]
    RunNotFound(RunId),
    #[error("target {0} not found")]
    TargetNotFound(TargetId),
    #[error("run {run_id} in status {status} is not a retry entry point")]
    NotRetryable { run_id: RunId, status: RunStatus },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// One requested status change, conditional on the status the caller saw.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub run_id: RunId,
    pub from: RunStatus,
    pub to: RunStatus,
    pub reason: StatusReason,
    pub triggered_by: TriggeredBy,
    pub triggered_by_id: Option<String>,
    pub error: Option<ErrorDetail>,
    pub external_submission_id: Option<String>,
    pub action: Option<ActionNeeded>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub clear_next_run_at: bool,
    pub clear_lock: bool,
    /// Extra events written atomically with the STATUS_CHANGED event,
    /// e.g. RETRY_SCHEDULED or ACTION_REQUIRED.
    pub extra_events: Vec<EventKind>,
}

impl TransitionRequest {
    pub fn new(
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        reason: StatusReason,
        triggered_by: TriggeredBy,
    ) -> Self {
        Self {
            run_id,
            from,
            to,
            reason,
            triggered_by,
            triggered_by_id: None,
            error: None,
            external_submission_id: None,
            action: None,
            next_run_at: None,
            clear_next_run_at: false,
            clear_lock: false,
            extra_events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateMachineService {
    store: Arc<SqliteStore>,
    log: JsonlEventLog,
}

impl StateMachineService {
    pub fn new(store: Arc<SqliteStore>, log: JsonlEventLog) -> Self {
        Self { store, log }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Apply one validated, conditional status transition.
    pub fn transition(
        &self,
        request: TransitionRequest,
    ) -> Result<SubmissionRun, StateMachineError> {
        if !is_transition_allowed(request.from, request.to) {
            return Err(StateMachineError::InvalidTransition {
                from: request.from,
                to: request.to,
            });
        }

        let mut events = Vec::with_capacity(1 + request.extra_events.len());
        events.push(SubmissionEvent::for_run(
            request.run_id.clone(),
            request.triggered_by,
            request.triggered_by_id.clone(),
            EventKind::StatusChanged {
                from: request.from.as_str().to_string(),
                to: request.to.as_str().to_string(),
                reason: request.reason,
            },
        ));
        for kind in &request.extra_events {
            events.push(SubmissionEvent::for_run(
                request.run_id.clone(),
                request.triggered_by,
                request.triggered_by_id.clone(),
                kind.clone(),
            ));
        }

        let outcome = self.store.apply_transition(&TransitionWrite {
            run_id: &request.run_id,
            expected_from: request.from,
            to: request.to,
            updated_at: Utc::now(),
            set_error: request.error.as_ref(),
            set_external_submission_id: request.external_submission_id.as_deref(),
            set_action: request.action.as_ref(),
            set_next_run_at: request.next_run_at,
            clear_next_run_at: request.clear_next_run_at,
            clear_lock: request.clear_lock,
            events: &events,
        })?;

        let run = match outcome {
            TransitionOutcome::Applied(run) => run,
            TransitionOutcome::Stale { actual } => {
                return Err(StateMachineError::StaleStatus {
                    run_id: request.run_id,
                    expected: request.from,
                    actual,
                })
            }
            TransitionOutcome::NotFound => {
                return Err(StateMachineError::RunNotFound(request.run_id))
            }
        };

        mirror_events(&self.log, &events);
        self.mirror_target_status(&run)?;
        Ok(run)
    }

    /// Create a fresh QUEUED run for a target.
    ///
    /// When `previous` is given it must be a retry entry point; the new run
    /// continues its lineage (attempt number and correlation id). Otherwise
    /// this starts attempt 1 with a new correlation id.
    pub fn create_run(
        &self,
        target_id: &TargetId,
        triggered_by: TriggeredBy,
        triggered_by_id: Option<String>,
        previous: Option<&SubmissionRun>,
    ) -> Result<SubmissionRun, StateMachineError> {
        let mut target = self
            .store
            .load_target(target_id)?
            .ok_or_else(|| StateMachineError::TargetNotFound(target_id.clone()))?;

        if let Some(previous) = previous {
            if !previous.status.is_retry_entry_point() {
                return Err(StateMachineError::NotRetryable {
                    run_id: previous.id.clone(),
                    status: previous.status,
                });
            }
        }

        let now = Utc::now();
        let run = SubmissionRun {
            id: RunId::generate(),
            target_id: target_id.clone(),
            status: RunStatus::Queued,
            attempt_no: previous.map_or(1, |p| p.attempt_no + 1),
            triggered_by,
            triggered_by_id: triggered_by_id.clone(),
            previous_run_id: previous.map(|p| p.id.clone()),
            correlation_id: previous.map_or_else(
                || uuid::Uuid::new_v4().to_string(),
                |p| p.correlation_id.clone(),
            ),
            lock: None,
            last_error: None,
            external_submission_id: None,
            next_run_at: None,
            action_needed: None,
            changes_acknowledged: false,
            created_at: now,
            updated_at: now,
        };

        target.current_run_id = Some(run.id.clone());
        target.current_status = Some(RunStatus::Queued);
        target.updated_at = now;

        let event = SubmissionEvent::for_run(
            run.id.clone(),
            triggered_by,
            triggered_by_id,
            EventKind::RunCreated {
                attempt_no: run.attempt_no,
                previous_run_id: run.previous_run_id.clone(),
                correlation_id: run.correlation_id.clone(),
            },
        );
        self.store.create_run_with_event(&run, &target, &event)?;
        mirror_events(&self.log, std::slice::from_ref(&event));
        Ok(run)
    }

    /// Keep the target's status mirror in step with its current run.
    fn mirror_target_status(&self, run: &SubmissionRun) -> Result<(), StateMachineError> {
        let Some(mut target) = self.store.load_target(&run.target_id)? else {
            return Ok(());
        };
        if target.current_run_id.as_ref() != Some(&run.id) {
            return Ok(());
        }
        target.current_status = Some(run.status);
        target.updated_at = run.updated_at;
        self.store.upsert_target(&target)?;
        Ok(())
    }
}
