//! The connector contract: one strategy object per directory family.

use serde::{Deserialize, Serialize};

use subm_core::policy::ErrorType;
use subm_core::types::{ActionNeededType, RunId, SubmissionPayload, TargetId};

/// Capabilities a connector actually implements. Never advertise more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    AutomatedSubmit,
    Validate,
    PacketGeneration,
    StatusCheck,
}

/// Pre-submission validation output.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

/// The out-of-band step an `ActionNeeded` outcome asks an operator for.
///
/// `action_type` is mandatory by construction; a connector cannot return an
/// action-needed result without saying what kind of action it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub action_type: ActionNeededType,
    pub url: Option<String>,
    pub instructions: Option<String>,
}

/// Successful connector outcomes. Failures travel as `ConnectorFailure`.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The directory accepted the submission.
    Submitted {
        external_id: String,
        response: Option<serde_json::Value>,
    },
    /// A human must complete an out-of-band step; the connector may supply
    /// a ready-to-use submission packet.
    ActionNeeded {
        action: ActionRequest,
        packet: Option<serde_json::Value>,
        response: Option<serde_json::Value>,
    },
    /// The directory already carries this listing.
    AlreadyListed { listing_url: Option<String> },
}

/// A classified connector failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type}: {message}")]
pub struct ConnectorFailure {
    pub error_type: ErrorType,
    pub code: Option<String>,
    pub message: String,
    pub retryable: bool,
}

impl ConnectorFailure {
    /// Failure with retryability taken from the error type's policy default.
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            code: None,
            message: message.into(),
            retryable: error_type.is_retryable(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorType::ValidationError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NetworkError, message)
    }
}

/// Per-invocation context handed to `Connector::submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitContext {
    pub run_id: RunId,
    pub target_id: TargetId,
    pub attempt_no: u32,
    pub correlation_id: String,
}

/// A pluggable strategy that knows how to talk to one directory family.
pub trait Connector: Send + Sync {
    /// Registry key directories reference via `connector_key`.
    fn key(&self) -> &'static str;

    /// Only capabilities that are actually implemented.
    fn capabilities(&self) -> &[Capability];

    /// Pre-submission check against the directory's constraints.
    fn validate(&self, _payload: &SubmissionPayload) -> ValidationReport {
        ValidationReport::ok()
    }

    fn submit(
        &self,
        payload: &SubmissionPayload,
        context: &SubmitContext,
    ) -> Result<SubmitOutcome, ConnectorFailure>;
}
