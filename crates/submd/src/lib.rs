//! Submission orchestration engine: persistence, locking, state machine,
//! artifact store, and the worker that drives runs through their lifecycle.

pub mod artifacts;
pub mod event_log;
pub mod lock_manager;
pub mod ops;
pub mod persistence;
pub mod redaction;
pub mod state_machine;
pub mod worker;

pub use artifacts::{ArtifactError, ArtifactRequest, ArtifactWriter};
pub use event_log::{record_event, EventLogError, JsonlEventLog};
pub use lock_manager::{AcquireOutcome, LockManager};
pub use ops::{Operations, OpsError};
pub use persistence::{PersistenceError, SqliteStore};
pub use state_machine::{StateMachineError, StateMachineService, TransitionRequest};
pub use worker::{ProcessOutcome, TickReport, WorkerError, WorkerService};
