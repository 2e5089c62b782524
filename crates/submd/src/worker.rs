//! Run processing: claim, submit, classify, settle.
//!
//! `process_run` drives one run through a single attempt; `tick_once` is the
//! deterministic, timer-free step the daemon loop (and the tests) call.
//! Connector failures never escape this module as errors: they are
//! converted into DEFERRED or FAILED transitions. Only infrastructure
//! failures propagate, and the batch loop logs and skips those per run.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use subm_connectors::{ConnectorFailure, ConnectorRegistry, SubmitContext, SubmitOutcome};
use subm_core::artifact::ArtifactType;
use subm_core::config::EngineConfig;
use subm_core::events::EventKind;
use subm_core::policy::{ErrorType, RetryPolicy, StatusReason};
use subm_core::status::RunStatus;
use subm_core::types::{
    ActionNeeded, ErrorDetail, RunId, SubmissionPayload, SubmissionRun, TriggeredBy, WorkerId,
};

use crate::artifacts::{ArtifactError, ArtifactRequest, ArtifactWriter};
use crate::event_log::JsonlEventLog;
use crate::lock_manager::{AcquireOutcome, LockManager};
use crate::persistence::{PersistenceError, SqliteStore};
use crate::state_machine::{StateMachineError, StateMachineService, TransitionRequest};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Per-run result of one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The run was claimed and settled into `status`.
    Processed { run_id: RunId, status: RunStatus },
    /// Another worker holds the lease; not an error.
    LockContended { run_id: RunId, locked_by: WorkerId },
    /// The run was no longer claimable at pull time.
    InvalidStatus { run_id: RunId, status: RunStatus },
    NotFound { run_id: RunId },
}

/// Aggregate counts for one `tick_once` step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub requeued: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub results: Vec<ProcessOutcome>,
}

/// Failure inside the locked section of `process_run`.
enum AttemptError {
    Connector(ConnectorFailure),
    /// Anything else; routed through the retry decision as UNKNOWN.
    Other(String),
}

#[derive(Debug, Clone)]
pub struct WorkerService {
    store: Arc<SqliteStore>,
    state_machine: StateMachineService,
    locks: LockManager,
    artifacts: ArtifactWriter,
    registry: Arc<ConnectorRegistry>,
    retry: RetryPolicy,
    action_deadline_days: i64,
    batch_size: usize,
}

impl WorkerService {
    pub fn new(
        store: Arc<SqliteStore>,
        log: JsonlEventLog,
        registry: Arc<ConnectorRegistry>,
        config: &EngineConfig,
        worker_id: WorkerId,
    ) -> Self {
        Self {
            state_machine: StateMachineService::new(Arc::clone(&store), log.clone()),
            locks: LockManager::new(Arc::clone(&store), log.clone(), worker_id, &config.worker),
            artifacts: ArtifactWriter::new(Arc::clone(&store), log),
            store,
            registry,
            retry: config.retry,
            action_deadline_days: config.action_deadline_days,
            batch_size: config.worker.batch_size,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.locks.worker_id()
    }

    pub fn state_machine(&self) -> &StateMachineService {
        &self.state_machine
    }

    /// Claim one run and drive it through a single submission attempt.
    pub fn process_run(&self, run_id: &RunId) -> Result<ProcessOutcome, WorkerError> {
        match self.locks.acquire(run_id)? {
            AcquireOutcome::Acquired { .. } | AcquireOutcome::AlreadyHeld { .. } => {}
            AcquireOutcome::LockHeld { locked_by, .. } => {
                return Ok(ProcessOutcome::LockContended {
                    run_id: run_id.clone(),
                    locked_by,
                })
            }
            AcquireOutcome::InvalidStatus(status) => {
                return Ok(ProcessOutcome::InvalidStatus {
                    run_id: run_id.clone(),
                    status,
                })
            }
            AcquireOutcome::NotFound => {
                return Ok(ProcessOutcome::NotFound {
                    run_id: run_id.clone(),
                })
            }
        }

        let result = self.process_locked(run_id);
        // Settled transitions clear the lock themselves; this release covers
        // paths that aborted before any transition.
        if let Err(error) = self.locks.release(run_id) {
            tracing::warn!(run_id = %run_id, %error, "lock release failed");
        }
        result
    }

    fn process_locked(&self, run_id: &RunId) -> Result<ProcessOutcome, WorkerError> {
        let Some(run) = self.store.load_run(run_id)? else {
            return Ok(ProcessOutcome::NotFound {
                run_id: run_id.clone(),
            });
        };
        if run.status != RunStatus::Queued {
            return Ok(ProcessOutcome::InvalidStatus {
                run_id: run_id.clone(),
                status: run.status,
            });
        }

        let run = self.state_machine.transition(self.request(
            &run,
            RunStatus::InProgress,
            StatusReason::SubmissionStarted,
        ))?;

        let status = match self.attempt(&run) {
            Ok(status) => status,
            Err(AttemptError::Connector(failure)) => {
                let detail = ErrorDetail {
                    error_type: failure.error_type,
                    code: failure.code.clone(),
                    message: failure.message.clone(),
                };
                self.settle_failure(&run, detail, failure.retryable)?
            }
            Err(AttemptError::Other(message)) => {
                tracing::warn!(run_id = %run.id, message, "attempt failed outside the connector");
                let detail = ErrorDetail {
                    error_type: ErrorType::Unknown,
                    code: None,
                    message,
                };
                self.settle_failure(&run, detail, true)?
            }
        };
        Ok(ProcessOutcome::Processed {
            run_id: run.id,
            status,
        })
    }

    /// Steps 3-7: build the payload, call the connector, settle the outcome.
    fn attempt(&self, run: &SubmissionRun) -> Result<RunStatus, AttemptError> {
        let target = self
            .store
            .load_target(&run.target_id)
            .map_err(other)?
            .ok_or_else(|| AttemptError::Other(format!("target {} not found", run.target_id)))?;
        let business = self
            .store
            .load_business(&target.business_id)
            .map_err(other)?
            .ok_or_else(|| {
                AttemptError::Other(format!("business {} not found", target.business_id))
            })?;
        let directory = self
            .store
            .load_directory(&target.directory_id)
            .map_err(other)?
            .ok_or_else(|| {
                AttemptError::Other(format!("directory {} not found", target.directory_id))
            })?;

        let payload = SubmissionPayload::from_parts(&business, &directory);
        let payload_json = serde_json::to_value(&payload).map_err(other)?;
        // Persisted before the connector call so a crash mid-call still
        // leaves evidence of intent.
        self.store_run_artifact(run, ArtifactType::RequestPayload, payload_json)
            .map_err(other)?;

        let connector = self.registry.get(directory.connector_key.as_deref());
        let context = SubmitContext {
            run_id: run.id.clone(),
            target_id: run.target_id.clone(),
            attempt_no: run.attempt_no,
            correlation_id: run.correlation_id.clone(),
        };
        let outcome = connector
            .submit(&payload, &context)
            .map_err(AttemptError::Connector)?;

        match outcome {
            SubmitOutcome::Submitted {
                external_id,
                response,
            } => {
                // Connectors without a response body still yield a minimal
                // one, so every accepted run carries a response artifact.
                let response =
                    response.unwrap_or_else(|| json!({ "external_id": external_id }));
                self.store_run_artifact(run, ArtifactType::ResponsePayload, response)
                    .map_err(other)?;
                let mut request =
                    self.request(run, RunStatus::Submitted, StatusReason::SubmissionAccepted);
                request.external_submission_id = Some(external_id);
                request.clear_lock = true;
                self.state_machine.transition(request).map_err(other)?;
                Ok(RunStatus::Submitted)
            }
            SubmitOutcome::AlreadyListed { listing_url } => {
                self.store_run_artifact(
                    run,
                    ArtifactType::ResponsePayload,
                    json!({ "listing_url": listing_url }),
                )
                .map_err(other)?;
                let mut request =
                    self.request(run, RunStatus::AlreadyListed, StatusReason::AlreadyListed);
                request.clear_lock = true;
                self.state_machine.transition(request).map_err(other)?;
                Ok(RunStatus::AlreadyListed)
            }
            SubmitOutcome::ActionNeeded {
                action,
                packet,
                response,
            } => {
                if let Some(packet) = packet {
                    self.store_run_artifact(run, ArtifactType::SubmissionPacket, packet)
                        .map_err(other)?;
                }
                if let Some(instructions) = &action.instructions {
                    let mut request = ArtifactRequest::for_run(
                        run.id.clone(),
                        ArtifactType::Instructions,
                        json!(null),
                    );
                    request.content = None;
                    request.content_text = Some(instructions.clone());
                    request.content_type = Some("text/plain".to_string());
                    request.triggered_by_id = Some(self.worker_id().0.clone());
                    self.artifacts.store(request).map_err(other)?;
                }
                if let Some(response) = response {
                    self.store_run_artifact(run, ArtifactType::ResponsePayload, response)
                        .map_err(other)?;
                }

                let deadline = Utc::now() + Duration::days(self.action_deadline_days);
                let mut request = self.request(
                    run,
                    RunStatus::ActionNeeded,
                    StatusReason::from_action_needed(action.action_type),
                );
                request.action = Some(ActionNeeded {
                    action_type: action.action_type,
                    url: action.url.clone(),
                    instructions: action.instructions.clone(),
                    deadline,
                });
                request.clear_lock = true;
                request.extra_events.push(EventKind::ActionRequired {
                    action_type: action.action_type,
                    deadline,
                });
                self.state_machine.transition(request).map_err(other)?;
                Ok(RunStatus::ActionNeeded)
            }
        }
    }

    /// Retry-or-fail decision for a classified failure.
    ///
    /// Retryable and under the attempt cap: one direct IN_PROGRESS->DEFERRED
    /// transition with the retry schedule. Otherwise IN_PROGRESS->FAILED.
    fn settle_failure(
        &self,
        run: &SubmissionRun,
        detail: ErrorDetail,
        connector_retryable: bool,
    ) -> Result<RunStatus, WorkerError> {
        self.store_run_artifact(
            run,
            ArtifactType::ErrorLog,
            json!({
                "error_type": detail.error_type.as_str(),
                "code": detail.code,
                "message": detail.message,
                "attempt_no": run.attempt_no,
            }),
        )?;

        let retryable = connector_retryable && detail.error_type.is_retryable();
        if retryable && self.retry.allows_retry(run.attempt_no) {
            let delay_ms = self.retry.delay_for_attempt(run.attempt_no);
            let next_run_at = Utc::now() + Duration::milliseconds(delay_ms);
            let mut request = self.request(
                run,
                RunStatus::Deferred,
                StatusReason::from_error_type(detail.error_type),
            );
            request.error = Some(detail);
            request.next_run_at = Some(next_run_at);
            request.clear_lock = true;
            request.extra_events.push(EventKind::RetryScheduled {
                attempt_no: run.attempt_no,
                delay_ms,
                next_run_at,
            });
            self.state_machine.transition(request)?;
            Ok(RunStatus::Deferred)
        } else {
            let reason = if retryable {
                StatusReason::RetriesExhausted
            } else {
                StatusReason::from_error_type(detail.error_type)
            };
            let mut request = self.request(run, RunStatus::Failed, reason);
            request.error = Some(detail);
            request.clear_lock = true;
            self.state_machine.transition(request)?;
            Ok(RunStatus::Failed)
        }
    }

    /// One deterministic execution step: requeue due retries, then process a
    /// batch of claimable QUEUED runs in creation order.
    pub fn tick_once(&self) -> Result<TickReport, WorkerError> {
        let mut report = TickReport::default();
        let now = Utc::now();

        for run_id in self.store.list_due_deferred(now)? {
            match self.requeue_deferred(&run_id) {
                Ok(()) => report.requeued += 1,
                Err(error) => {
                    tracing::warn!(run_id = %run_id, %error, "requeue failed, skipping run");
                }
            }
        }

        let claimable =
            self.store
                .list_claimable_queued(now, self.locks.lease_grace_ms(), self.batch_size)?;
        for run_id in claimable {
            let outcome = match self.process_run(&run_id) {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(run_id = %run_id, %error, "processing failed, skipping run");
                    continue;
                }
            };
            match &outcome {
                ProcessOutcome::Processed { status, .. } => {
                    report.processed += 1;
                    match status {
                        RunStatus::Submitted
                        | RunStatus::AlreadyListed
                        | RunStatus::ActionNeeded => report.succeeded += 1,
                        _ => report.failed += 1,
                    }
                }
                ProcessOutcome::LockContended { .. }
                | ProcessOutcome::InvalidStatus { .. }
                | ProcessOutcome::NotFound { .. } => report.skipped += 1,
            }
            report.results.push(outcome);
        }
        Ok(report)
    }

    fn requeue_deferred(&self, run_id: &RunId) -> Result<(), WorkerError> {
        let Some(run) = self.store.load_run(run_id)? else {
            return Ok(());
        };
        if run.status != RunStatus::Deferred {
            return Ok(());
        }
        let mut request = TransitionRequest::new(
            run.id.clone(),
            RunStatus::Deferred,
            RunStatus::Queued,
            StatusReason::RetryDue,
            TriggeredBy::Scheduler,
        );
        request.clear_next_run_at = true;
        self.state_machine.transition(request)?;
        Ok(())
    }

    /// Reclaim IN_PROGRESS runs whose lease lapsed past the grace period.
    ///
    /// Each run is routed to DEFERRED through the state machine with a
    /// forced retry; one run's failure never aborts the sweep.
    pub fn cleanup_expired_locks(&self) -> Result<usize, WorkerError> {
        let now = Utc::now();
        let mut reclaimed = 0;
        for run_id in self
            .store
            .list_expired_in_progress(now, self.locks.lease_grace_ms())?
        {
            match self.reclaim_expired(&run_id) {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(run_id = %run_id, %error, "lease reclaim failed, skipping run");
                }
            }
        }
        Ok(reclaimed)
    }

    fn reclaim_expired(&self, run_id: &RunId) -> Result<bool, WorkerError> {
        let Some(run) = self.store.load_run(run_id)? else {
            return Ok(false);
        };
        if run.status != RunStatus::InProgress {
            return Ok(false);
        }

        let holder = run.lock.as_ref().map(|l| l.locked_by.0.clone());
        let delay_ms = self.retry.delay_for_attempt(run.attempt_no);
        let next_run_at = Utc::now() + Duration::milliseconds(delay_ms);
        let mut request = TransitionRequest::new(
            run.id.clone(),
            RunStatus::InProgress,
            RunStatus::Deferred,
            StatusReason::LockExpired,
            TriggeredBy::System,
        );
        request.error = Some(ErrorDetail {
            error_type: ErrorType::LockError,
            code: None,
            message: match holder {
                Some(holder) => format!("lease held by {holder} expired"),
                None => "lease expired".to_string(),
            },
        });
        request.next_run_at = Some(next_run_at);
        request.clear_lock = true;
        request.extra_events.push(EventKind::RetryScheduled {
            attempt_no: run.attempt_no,
            delay_ms,
            next_run_at,
        });
        self.state_machine.transition(request)?;
        Ok(true)
    }

    /// Expire ACTION_NEEDED runs whose deadline has elapsed.
    pub fn expire_overdue_actions(&self) -> Result<usize, WorkerError> {
        let mut expired = 0;
        for run_id in self.store.list_overdue_actions(Utc::now())? {
            let request = TransitionRequest::new(
                run_id.clone(),
                RunStatus::ActionNeeded,
                RunStatus::Expired,
                StatusReason::ActionDeadlineExpired,
                TriggeredBy::System,
            );
            match self.state_machine.transition(request) {
                Ok(_) => expired += 1,
                Err(error) => {
                    tracing::warn!(run_id = %run_id, %error, "action expiry failed, skipping run");
                }
            }
        }
        Ok(expired)
    }

    fn request(
        &self,
        run: &SubmissionRun,
        to: RunStatus,
        reason: StatusReason,
    ) -> TransitionRequest {
        let mut request =
            TransitionRequest::new(run.id.clone(), run.status, to, reason, TriggeredBy::Worker);
        request.triggered_by_id = Some(self.worker_id().0.clone());
        request
    }

    fn store_run_artifact(
        &self,
        run: &SubmissionRun,
        artifact_type: ArtifactType,
        content: serde_json::Value,
    ) -> Result<(), ArtifactError> {
        let mut request = ArtifactRequest::for_run(run.id.clone(), artifact_type, content);
        request.triggered_by_id = Some(self.worker_id().0.clone());
        self.artifacts.store(request)?;
        Ok(())
    }
}

fn other(error: impl std::fmt::Display) -> AttemptError {
    AttemptError::Other(error.to_string())
}
