//! Error taxonomy, status reasons, and the retry/backoff policy.
//!
//! `StatusReason::from_error_type` and `StatusReason::from_action_needed`
//! are exhaustive matches over closed enums — an unmapped case is a compile
//! error, never a silent fallback string.

use serde::{Deserialize, Serialize};

use crate::types::ActionNeededType;

/// Classification of a connector or worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    NetworkError,
    ValidationError,
    ConnectorError,
    RateLimited,
    AuthError,
    LockError,
    Unknown,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::NetworkError => "NETWORK_ERROR",
            ErrorType::ValidationError => "VALIDATION_ERROR",
            ErrorType::ConnectorError => "CONNECTOR_ERROR",
            ErrorType::RateLimited => "RATE_LIMITED",
            ErrorType::AuthError => "AUTH_ERROR",
            ErrorType::LockError => "LOCK_ERROR",
            ErrorType::Unknown => "UNKNOWN",
        }
    }

    /// Whether a failure of this type is ever worth retrying.
    ///
    /// Validation and auth failures are deterministic: resubmitting the same
    /// payload cannot succeed, so they are terminal.
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorType::ValidationError | ErrorType::AuthError => false,
            ErrorType::NetworkError
            | ErrorType::ConnectorError
            | ErrorType::RateLimited
            | ErrorType::LockError
            | ErrorType::Unknown => true,
        }
    }
}

impl std::str::FromStr for ErrorType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "NETWORK_ERROR" => Ok(ErrorType::NetworkError),
            "VALIDATION_ERROR" => Ok(ErrorType::ValidationError),
            "CONNECTOR_ERROR" => Ok(ErrorType::ConnectorError),
            "RATE_LIMITED" => Ok(ErrorType::RateLimited),
            "AUTH_ERROR" => Ok(ErrorType::AuthError),
            "LOCK_ERROR" => Ok(ErrorType::LockError),
            "UNKNOWN" => Ok(ErrorType::Unknown),
            other => Err(format!("invalid error type '{other}'")),
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run landed in its current status. Recorded on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusReason {
    SubmissionStarted,
    SubmissionAccepted,
    AlreadyListed,
    VerificationRequired,
    AccountRequired,
    PaymentRequired,
    ManualStepRequired,
    CaptchaRequired,
    ValidationFailed,
    NetworkFailure,
    ConnectorFailure,
    RateLimited,
    AuthFailed,
    LockExpired,
    RetryDue,
    RetriesExhausted,
    UserPaused,
    UserResumed,
    UserCancelled,
    ChangesRequested,
    ActionDeadlineExpired,
    UnknownError,
}

impl StatusReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusReason::SubmissionStarted => "SUBMISSION_STARTED",
            StatusReason::SubmissionAccepted => "SUBMISSION_ACCEPTED",
            StatusReason::AlreadyListed => "ALREADY_LISTED",
            StatusReason::VerificationRequired => "VERIFICATION_REQUIRED",
            StatusReason::AccountRequired => "ACCOUNT_REQUIRED",
            StatusReason::PaymentRequired => "PAYMENT_REQUIRED",
            StatusReason::ManualStepRequired => "MANUAL_STEP_REQUIRED",
            StatusReason::CaptchaRequired => "CAPTCHA_REQUIRED",
            StatusReason::ValidationFailed => "VALIDATION_FAILED",
            StatusReason::NetworkFailure => "NETWORK_FAILURE",
            StatusReason::ConnectorFailure => "CONNECTOR_FAILURE",
            StatusReason::RateLimited => "RATE_LIMITED",
            StatusReason::AuthFailed => "AUTH_FAILED",
            StatusReason::LockExpired => "LOCK_EXPIRED",
            StatusReason::RetryDue => "RETRY_DUE",
            StatusReason::RetriesExhausted => "RETRIES_EXHAUSTED",
            StatusReason::UserPaused => "USER_PAUSED",
            StatusReason::UserResumed => "USER_RESUMED",
            StatusReason::UserCancelled => "USER_CANCELLED",
            StatusReason::ChangesRequested => "CHANGES_REQUESTED",
            StatusReason::ActionDeadlineExpired => "ACTION_DEADLINE_EXPIRED",
            StatusReason::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Map a connector error classification to the recorded reason.
    pub fn from_error_type(error_type: ErrorType) -> Self {
        match error_type {
            ErrorType::NetworkError => StatusReason::NetworkFailure,
            ErrorType::ValidationError => StatusReason::ValidationFailed,
            ErrorType::ConnectorError => StatusReason::ConnectorFailure,
            ErrorType::RateLimited => StatusReason::RateLimited,
            ErrorType::AuthError => StatusReason::AuthFailed,
            ErrorType::LockError => StatusReason::LockExpired,
            ErrorType::Unknown => StatusReason::UnknownError,
        }
    }

    /// Map an action-needed type to the recorded reason.
    pub fn from_action_needed(action_type: ActionNeededType) -> Self {
        match action_type {
            ActionNeededType::EmailVerification | ActionNeededType::PhoneVerification => {
                StatusReason::VerificationRequired
            }
            ActionNeededType::AccountCreation => StatusReason::AccountRequired,
            ActionNeededType::PaymentRequired => StatusReason::PaymentRequired,
            ActionNeededType::ManualSubmission => StatusReason::ManualStepRequired,
            ActionNeededType::Captcha => StatusReason::CaptchaRequired,
        }
    }
}

impl std::fmt::Display for StatusReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry scheduling knobs.
///
/// The backoff is deterministic exponential: `base * 2^(attempt_no - 1)`,
/// capped at `max_delay_ms`. Strictly monotonic in the attempt number until
/// the cap, with no jitter, so scheduling stays reproducible in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_base_delay_ms")]
    pub base_delay_ms: i64,
    #[serde(default = "RetryPolicy::default_max_delay_ms")]
    pub max_delay_ms: i64,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        5
    }

    fn default_base_delay_ms() -> i64 {
        60_000
    }

    fn default_max_delay_ms() -> i64 {
        3_600_000
    }

    /// Delay before the retry that follows the given (1-based) attempt.
    pub fn delay_for_attempt(&self, attempt_no: u32) -> i64 {
        let shift = attempt_no.saturating_sub(1).min(31);
        let delay = self.base_delay_ms.saturating_mul(1_i64 << shift);
        delay.min(self.max_delay_ms)
    }

    /// A run may retry only while its attempt number is under the cap.
    pub fn allows_retry(&self, attempt_no: u32) -> bool {
        attempt_no < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}
