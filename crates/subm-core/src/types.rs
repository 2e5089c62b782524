//! Core domain types for the submission orchestration engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::policy::ErrorType;
use crate::status::RunStatus;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub String);

macro_rules! id_impls {
    ($($name:ident),+) => {
        $(
            impl $name {
                pub fn new(id: impl Into<String>) -> Self {
                    Self(id.into())
                }

                pub fn generate() -> Self {
                    Self(uuid::Uuid::new_v4().to_string())
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str(&self.0)
                }
            }
        )+
    };
}

id_impls!(BusinessId, DirectoryId, TargetId, RunId, EventId, ArtifactId);

/// Process-unique worker identity.
///
/// Injected wherever a component claims or releases leases, so tests can run
/// many "workers" in one process deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Production identity: prefix + pid + millisecond timestamp.
    pub fn generate(prefix: &str) -> Self {
        Self(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_millis()
        ))
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who caused a status change or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    User,
    Worker,
    System,
    Scheduler,
}

impl TriggeredBy {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggeredBy::User => "user",
            TriggeredBy::Worker => "worker",
            TriggeredBy::System => "system",
            TriggeredBy::Scheduler => "scheduler",
        }
    }
}

impl std::str::FromStr for TriggeredBy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "user" => Ok(TriggeredBy::User),
            "worker" => Ok(TriggeredBy::Worker),
            "system" => Ok(TriggeredBy::System),
            "scheduler" => Ok(TriggeredBy::Scheduler),
            other => Err(format!("invalid triggered-by '{other}'")),
        }
    }
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionMode {
    /// Connector submits without human involvement where possible.
    #[default]
    Auto,
    /// Connector prepares packets; a human completes the submission.
    Assisted,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TargetPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Out-of-band step a human operator must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionNeededType {
    EmailVerification,
    PhoneVerification,
    AccountCreation,
    ManualSubmission,
    PaymentRequired,
    Captcha,
}

impl ActionNeededType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionNeededType::EmailVerification => "EMAIL_VERIFICATION",
            ActionNeededType::PhoneVerification => "PHONE_VERIFICATION",
            ActionNeededType::AccountCreation => "ACCOUNT_CREATION",
            ActionNeededType::ManualSubmission => "MANUAL_SUBMISSION",
            ActionNeededType::PaymentRequired => "PAYMENT_REQUIRED",
            ActionNeededType::Captcha => "CAPTCHA",
        }
    }
}

impl std::str::FromStr for ActionNeededType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "EMAIL_VERIFICATION" => Ok(ActionNeededType::EmailVerification),
            "PHONE_VERIFICATION" => Ok(ActionNeededType::PhoneVerification),
            "ACCOUNT_CREATION" => Ok(ActionNeededType::AccountCreation),
            "MANUAL_SUBMISSION" => Ok(ActionNeededType::ManualSubmission),
            "PAYMENT_REQUIRED" => Ok(ActionNeededType::PaymentRequired),
            "CAPTCHA" => Ok(ActionNeededType::Captcha),
            other => Err(format!("invalid action-needed type '{other}'")),
        }
    }
}

impl std::fmt::Display for ActionNeededType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action block attached to an ACTION_NEEDED run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNeeded {
    pub action_type: ActionNeededType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    pub deadline: DateTime<Utc>,
}

/// The lease a worker holds while processing a run.
///
/// The triple is modeled as one value so "all three fields null or all three
/// set" holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLock {
    pub locked_at: DateTime<Utc>,
    pub locked_by: WorkerId,
    pub lease_expires_at: DateTime<Utc>,
}

/// One (business profile × directory) pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionTarget {
    pub id: TargetId,
    pub business_id: BusinessId,
    pub directory_id: DirectoryId,
    pub submission_mode: SubmissionMode,
    pub priority: TargetPriority,
    /// Mirror of the latest run's status.
    pub current_status: Option<RunStatus>,
    pub current_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recorded error detail on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub error_type: ErrorType,
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

/// One lifecycle attempt at submitting a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRun {
    pub id: RunId,
    pub target_id: TargetId,
    pub status: RunStatus,
    /// Monotonic per target lineage, 1-based.
    pub attempt_no: u32,
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub triggered_by_id: Option<String>,
    /// Retry lineage: the run this one replaces.
    #[serde(default)]
    pub previous_run_id: Option<RunId>,
    /// Shared across the whole retry chain.
    pub correlation_id: String,
    #[serde(default)]
    pub lock: Option<RunLock>,
    #[serde(default)]
    pub last_error: Option<ErrorDetail>,
    #[serde(default)]
    pub external_submission_id: Option<String>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub action_needed: Option<ActionNeeded>,
    #[serde(default)]
    pub changes_acknowledged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Address {
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

/// Listing source data for one business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessProfile {
    pub id: BusinessId,
    pub name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Address,
}

/// Field constraints a directory imposes on submissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConstraints {
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default = "DirectoryConstraints::default_max_name_len")]
    pub max_name_len: usize,
    #[serde(default = "DirectoryConstraints::default_max_description_len")]
    pub max_description_len: usize,
    #[serde(default = "DirectoryConstraints::default_max_categories")]
    pub max_categories: usize,
}

impl DirectoryConstraints {
    fn default_max_name_len() -> usize {
        120
    }

    fn default_max_description_len() -> usize {
        2000
    }

    fn default_max_categories() -> usize {
        5
    }
}

impl Default for DirectoryConstraints {
    fn default() -> Self {
        Self {
            required_fields: Vec::new(),
            max_name_len: Self::default_max_name_len(),
            max_description_len: Self::default_max_description_len(),
            max_categories: Self::default_max_categories(),
        }
    }
}

/// A third-party directory listings are submitted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub id: DirectoryId,
    pub name: String,
    pub submission_url: String,
    /// Registry key for the connector that handles this directory.
    /// Unset falls back to the generic manual-packet connector.
    #[serde(default)]
    pub connector_key: Option<String>,
    #[serde(default)]
    pub constraints: DirectoryConstraints,
}

/// Connector-agnostic submission payload built by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPayload {
    pub business_name: String,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Address,
    pub directory_name: String,
    pub submission_url: String,
    #[serde(default)]
    pub constraints: DirectoryConstraints,
}

impl SubmissionPayload {
    pub fn from_parts(business: &BusinessProfile, directory: &Directory) -> Self {
        Self {
            business_name: business.name.clone(),
            website: business.website.clone(),
            description: business.description.clone(),
            categories: business.categories.clone(),
            phone: business.phone.clone(),
            email: business.email.clone(),
            address: business.address.clone(),
            directory_name: directory.name.clone(),
            submission_url: directory.submission_url.clone(),
            constraints: directory.constraints.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RunStatus;

    fn business() -> BusinessProfile {
        BusinessProfile {
            id: BusinessId::new("B1"),
            name: "Acme Plumbing".to_string(),
            website: Some("https://acme.example".to_string()),
            description: Some("Emergency plumbing".to_string()),
            categories: vec!["plumbing".to_string()],
            phone: Some("+1 555 0100".to_string()),
            email: Some("contact@acme.example".to_string()),
            address: Address::default(),
        }
    }

    fn directory() -> Directory {
        Directory {
            id: DirectoryId::new("D1"),
            name: "City Index".to_string(),
            submission_url: "https://cityindex.example/submit".to_string(),
            connector_key: None,
            constraints: DirectoryConstraints::default(),
        }
    }

    #[test]
    fn payload_carries_business_and_directory_fields() {
        let payload = SubmissionPayload::from_parts(&business(), &directory());
        assert_eq!(payload.business_name, "Acme Plumbing");
        assert_eq!(payload.directory_name, "City Index");
        assert_eq!(payload.submission_url, "https://cityindex.example/submit");
        assert_eq!(payload.constraints.max_categories, 5);
    }

    #[test]
    fn run_serde_round_trips_with_lock_triple() {
        let now = Utc::now();
        let run = SubmissionRun {
            id: RunId::new("R1"),
            target_id: TargetId::new("T1"),
            status: RunStatus::InProgress,
            attempt_no: 2,
            triggered_by: TriggeredBy::Worker,
            triggered_by_id: Some("worker-1".to_string()),
            previous_run_id: Some(RunId::new("R0")),
            correlation_id: "corr-1".to_string(),
            lock: Some(RunLock {
                locked_at: now,
                locked_by: WorkerId::new("worker-1"),
                lease_expires_at: now + chrono::Duration::seconds(30),
            }),
            last_error: None,
            external_submission_id: None,
            next_run_at: None,
            action_needed: None,
            changes_acknowledged: false,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_string(&run).expect("serialize run");
        let back: SubmissionRun = serde_json::from_str(&json).expect("deserialize run");
        assert_eq!(back, run);
    }

    #[test]
    fn generated_worker_id_carries_the_prefix() {
        let id = WorkerId::generate("worker");
        assert!(id.0.starts_with("worker-"));
    }
}
