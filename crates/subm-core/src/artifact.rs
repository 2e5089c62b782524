//! Immutable content blobs recorded during submission processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ArtifactId, RunId, TargetId};

/// What a stored artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    /// The outbound payload, stored before the connector is invoked.
    RequestPayload,
    /// The connector's raw response.
    ResponsePayload,
    /// Error type/code/message/attempt captured on failure.
    ErrorLog,
    /// Operator instructions for an action-needed run.
    Instructions,
    /// Field-mapped packet ready for manual submission.
    SubmissionPacket,
    /// Pre-run validation output, recorded against the target.
    ValidationReport,
}

/// Which entity an artifact type is recorded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    Run,
    Target,
}

impl ArtifactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactType::RequestPayload => "REQUEST_PAYLOAD",
            ArtifactType::ResponsePayload => "RESPONSE_PAYLOAD",
            ArtifactType::ErrorLog => "ERROR_LOG",
            ArtifactType::Instructions => "INSTRUCTIONS",
            ArtifactType::SubmissionPacket => "SUBMISSION_PACKET",
            ArtifactType::ValidationReport => "VALIDATION_REPORT",
        }
    }

    /// Exactly one of run/target is populated on a stored artifact; the
    /// type dictates which.
    pub fn linkage(self) -> Linkage {
        match self {
            ArtifactType::RequestPayload
            | ArtifactType::ResponsePayload
            | ArtifactType::ErrorLog
            | ArtifactType::Instructions
            | ArtifactType::SubmissionPacket => Linkage::Run,
            ArtifactType::ValidationReport => Linkage::Target,
        }
    }
}

impl std::str::FromStr for ArtifactType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "REQUEST_PAYLOAD" => Ok(ArtifactType::RequestPayload),
            "RESPONSE_PAYLOAD" => Ok(ArtifactType::ResponsePayload),
            "ERROR_LOG" => Ok(ArtifactType::ErrorLog),
            "INSTRUCTIONS" => Ok(ArtifactType::Instructions),
            "SUBMISSION_PACKET" => Ok(ArtifactType::SubmissionPacket),
            "VALIDATION_REPORT" => Ok(ArtifactType::ValidationReport),
            other => Err(format!("invalid artifact type '{other}'")),
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How aggressively PII is scrubbed before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedactionMode {
    /// No scanning at all.
    Skip,
    /// Scrub matches, continue, record the leak count.
    #[default]
    BestEffort,
    /// Abort the store if anything still leaks after scrubbing.
    StrictFailOnLeak,
}

impl RedactionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RedactionMode::Skip => "skip",
            RedactionMode::BestEffort => "best_effort",
            RedactionMode::StrictFailOnLeak => "strict_fail_on_leak",
        }
    }
}

impl std::str::FromStr for RedactionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "skip" => Ok(RedactionMode::Skip),
            "best_effort" => Ok(RedactionMode::BestEffort),
            "strict_fail_on_leak" => Ok(RedactionMode::StrictFailOnLeak),
            other => Err(format!("invalid redaction mode '{other}'")),
        }
    }
}

impl std::fmt::Display for RedactionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored artifact row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionArtifact {
    pub id: ArtifactId,
    pub run_id: Option<RunId>,
    pub target_id: Option<TargetId>,
    pub artifact_type: ArtifactType,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
    #[serde(default)]
    pub content_text: Option<String>,
    #[serde(default)]
    pub content_url: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub size_bytes: u64,
    /// Hex sha256 of the persisted content bytes.
    pub checksum: String,
    pub redaction_mode: RedactionMode,
    pub redaction_applied: bool,
    pub redaction_leaks_count: u32,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
