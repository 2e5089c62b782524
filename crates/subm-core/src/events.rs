//! Append-only audit events for the submission lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::StatusReason;
use crate::types::{
    ActionNeededType, ArtifactId, EventId, RunId, TargetId, TriggeredBy, WorkerId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunCreated {
        attempt_no: u32,
        previous_run_id: Option<RunId>,
        correlation_id: String,
    },
    StatusChanged {
        from: String,
        to: String,
        reason: StatusReason,
    },
    LockAcquired {
        worker_id: WorkerId,
        lease_expires_at: DateTime<Utc>,
    },
    LockReleased {
        worker_id: WorkerId,
    },
    LeaseExtended {
        worker_id: WorkerId,
        lease_expires_at: DateTime<Utc>,
    },
    RetryScheduled {
        attempt_no: u32,
        delay_ms: i64,
        next_run_at: DateTime<Utc>,
    },
    ActionRequired {
        action_type: ActionNeededType,
        deadline: DateTime<Utc>,
    },
    ChangesAcknowledged {
        user_id: String,
    },
    ArtifactStored {
        artifact_id: ArtifactId,
        artifact_type: String,
        size_bytes: u64,
    },
    ArtifactRedacted {
        artifact_id: ArtifactId,
        leaks_scrubbed: u32,
    },
    RedactionFailed {
        artifact_type: String,
        leaks_remaining: u32,
    },
}

/// Stable tag for the indexed `kind_tag` column.
pub fn event_kind_tag(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::RunCreated { .. } => "RUN_CREATED",
        EventKind::StatusChanged { .. } => "STATUS_CHANGED",
        EventKind::LockAcquired { .. } => "LOCK_ACQUIRED",
        EventKind::LockReleased { .. } => "LOCK_RELEASED",
        EventKind::LeaseExtended { .. } => "LEASE_EXTENDED",
        EventKind::RetryScheduled { .. } => "RETRY_SCHEDULED",
        EventKind::ActionRequired { .. } => "ACTION_REQUIRED",
        EventKind::ChangesAcknowledged { .. } => "CHANGES_ACKNOWLEDGED",
        EventKind::ArtifactStored { .. } => "ARTIFACT_STORED",
        EventKind::ArtifactRedacted { .. } => "ARTIFACT_REDACTED",
        EventKind::RedactionFailed { .. } => "REDACTION_FAILED",
    }
}

/// One audit record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionEvent {
    pub id: EventId,
    pub run_id: Option<RunId>,
    pub target_id: Option<TargetId>,
    pub at: DateTime<Utc>,
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub triggered_by_id: Option<String>,
    pub kind: EventKind,
}

impl SubmissionEvent {
    /// Convenience constructor for run-scoped events.
    pub fn for_run(
        run_id: RunId,
        triggered_by: TriggeredBy,
        triggered_by_id: Option<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            id: EventId::generate(),
            run_id: Some(run_id),
            target_id: None,
            at: Utc::now(),
            triggered_by,
            triggered_by_id,
            kind,
        }
    }

    /// Convenience constructor for target-scoped events.
    pub fn for_target(
        target_id: TargetId,
        triggered_by: TriggeredBy,
        triggered_by_id: Option<String>,
        kind: EventKind,
    ) -> Self {
        Self {
            id: EventId::generate(),
            run_id: None,
            target_id: Some(target_id),
            at: Utc::now(),
            triggered_by,
            triggered_by_id,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RunStatus;

    #[test]
    fn status_changed_event_serde_round_trips() {
        let event = SubmissionEvent::for_run(
            RunId::new("R1"),
            TriggeredBy::Worker,
            Some("worker-1".to_string()),
            EventKind::StatusChanged {
                from: RunStatus::Queued.as_str().to_string(),
                to: RunStatus::InProgress.as_str().to_string(),
                reason: StatusReason::SubmissionStarted,
            },
        );
        let json = serde_json::to_string(&event).expect("serialize event");
        let back: SubmissionEvent = serde_json::from_str(&json).expect("deserialize event");
        assert_eq!(back, event);
        assert_eq!(event_kind_tag(&back.kind), "STATUS_CHANGED");
    }

    #[test]
    fn kind_tags_are_stable() {
        let kind = EventKind::LockAcquired {
            worker_id: WorkerId::new("w1"),
            lease_expires_at: Utc::now(),
        };
        assert_eq!(event_kind_tag(&kind), "LOCK_ACQUIRED");

        let kind = EventKind::RetryScheduled {
            attempt_no: 1,
            delay_ms: 60_000,
            next_run_at: Utc::now(),
        };
        assert_eq!(event_kind_tag(&kind), "RETRY_SCHEDULED");
    }
}
