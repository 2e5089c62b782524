//! Run lifecycle statuses and the legal transition table.
//!
//! The `StateMachineService` in `submd` is the only writer of run status;
//! everything here is pure so it can be exhaustively tested.

use serde::{Deserialize, Serialize};

/// Status of a single submission run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Waiting for a worker to pick it up.
    Queued,
    /// A worker holds the lease and is executing the connector.
    InProgress,
    /// Accepted by the directory.
    Submitted,
    /// The directory already carries this listing.
    AlreadyListed,
    /// A human operator must complete an out-of-band step.
    ActionNeeded,
    /// The directory requested changes to the listing content.
    NeedsChanges,
    /// Awaiting a scheduled retry (`next_run_at`).
    Deferred,
    /// Permanently failed for this run.
    Failed,
    /// User-initiated hold.
    Paused,
    /// User-initiated cancellation.
    Cancelled,
    /// Blocked by the directory (e.g. category not accepted).
    Blocked,
    /// Submissions disabled for this directory.
    Disabled,
    /// The action-needed deadline elapsed without completion.
    Expired,
    /// The directory rejected the listing.
    Rejected,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Submitted => "SUBMITTED",
            RunStatus::AlreadyListed => "ALREADY_LISTED",
            RunStatus::ActionNeeded => "ACTION_NEEDED",
            RunStatus::NeedsChanges => "NEEDS_CHANGES",
            RunStatus::Deferred => "DEFERRED",
            RunStatus::Failed => "FAILED",
            RunStatus::Paused => "PAUSED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Blocked => "BLOCKED",
            RunStatus::Disabled => "DISABLED",
            RunStatus::Expired => "EXPIRED",
            RunStatus::Rejected => "REJECTED",
        }
    }

    /// Terminal for this run. A target may still spawn a new run later.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Submitted
                | RunStatus::AlreadyListed
                | RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Blocked
                | RunStatus::Disabled
                | RunStatus::Expired
                | RunStatus::Rejected
        )
    }

    /// Statuses from which a brand-new run may be created via `create_run`.
    pub fn is_retry_entry_point(self) -> bool {
        matches!(
            self,
            RunStatus::NeedsChanges
                | RunStatus::Failed
                | RunStatus::Blocked
                | RunStatus::Disabled
                | RunStatus::Expired
        )
    }

    /// Statuses a user may pause from.
    pub fn can_pause(self) -> bool {
        matches!(
            self,
            RunStatus::Queued
                | RunStatus::Deferred
                | RunStatus::InProgress
                | RunStatus::ActionNeeded
        )
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "QUEUED" => Ok(RunStatus::Queued),
            "IN_PROGRESS" => Ok(RunStatus::InProgress),
            "SUBMITTED" => Ok(RunStatus::Submitted),
            "ALREADY_LISTED" => Ok(RunStatus::AlreadyListed),
            "ACTION_NEEDED" => Ok(RunStatus::ActionNeeded),
            "NEEDS_CHANGES" => Ok(RunStatus::NeedsChanges),
            "DEFERRED" => Ok(RunStatus::Deferred),
            "FAILED" => Ok(RunStatus::Failed),
            "PAUSED" => Ok(RunStatus::Paused),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            "BLOCKED" => Ok(RunStatus::Blocked),
            "DISABLED" => Ok(RunStatus::Disabled),
            "EXPIRED" => Ok(RunStatus::Expired),
            "REJECTED" => Ok(RunStatus::Rejected),
            other => Err(format!("invalid run status '{other}'")),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check if a status transition is valid.
///
/// ```text
/// QUEUED → IN_PROGRESS → {SUBMITTED, ALREADY_LISTED, ACTION_NEEDED,
///                          NEEDS_CHANGES, DEFERRED, FAILED}
/// DEFERRED → QUEUED                    (scheduler requeue)
/// {QUEUED, DEFERRED, IN_PROGRESS, ACTION_NEEDED} → PAUSED → QUEUED
/// ACTION_NEEDED → {SUBMITTED, EXPIRED}
/// any non-terminal → CANCELLED
/// ```
///
/// Same-state transitions are rejected: every STATUS_CHANGED event must
/// record an actual change.
pub fn is_transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    use RunStatus::*;

    if from == to {
        return false;
    }

    match (from, to) {
        (Queued, InProgress) => true,
        (
            InProgress,
            Submitted | AlreadyListed | ActionNeeded | NeedsChanges | Deferred | Failed,
        ) => true,
        // Scheduler requeue once next_run_at elapses.
        (Deferred, Queued) => true,
        (from, Paused) if from.can_pause() => true,
        (Paused, Queued) => true,
        // User completes the out-of-band action, or the deadline elapses.
        (ActionNeeded, Submitted | Expired) => true,
        (from, Cancelled) if !from.is_terminal() => true,
        _ => false,
    }
}
