//! Artifact persistence with PII redaction.
//!
//! The writer resolves run-vs-target linkage from the artifact type,
//! scrubs content per the requested redaction mode, and records the
//! checksum, size, and scrub count with the row. `content_url` is a
//! reference, not content: it is scanned but never rewritten, so a URL
//! carrying PII is exactly the kind of residual leak strict mode exists
//! to catch.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

use subm_core::artifact::{ArtifactType, Linkage, RedactionMode, SubmissionArtifact};
use subm_core::events::{EventKind, SubmissionEvent};
use subm_core::types::{ArtifactId, RunId, TargetId, TriggeredBy};

use crate::event_log::{mirror_events, record_event, JsonlEventLog};
use crate::persistence::{PersistenceError, SqliteStore};
use crate::redaction::{scan_text, scan_value, scrub_text, scrub_value};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("artifact type {0} is run-linked but no run id was given")]
    MissingRunLink(ArtifactType),
    #[error("artifact type {0} is target-linked but no target id was given")]
    MissingTargetLink(ArtifactType),
    #[error("{artifact_type} artifact still leaks {leaks_remaining} PII match(es) after scrubbing")]
    RedactionLeak {
        artifact_type: ArtifactType,
        leaks_remaining: u32,
    },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// One store request. Exactly one of run/target is consulted, per the
/// artifact type's declared linkage.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub run_id: Option<RunId>,
    pub target_id: Option<TargetId>,
    pub artifact_type: ArtifactType,
    pub content: Option<Value>,
    pub content_text: Option<String>,
    pub content_url: Option<String>,
    pub content_type: Option<String>,
    pub redaction_mode: RedactionMode,
    pub metadata: Option<Value>,
    pub triggered_by: TriggeredBy,
    pub triggered_by_id: Option<String>,
}

impl ArtifactRequest {
    pub fn for_run(run_id: RunId, artifact_type: ArtifactType, content: Value) -> Self {
        Self {
            run_id: Some(run_id),
            target_id: None,
            artifact_type,
            content: Some(content),
            content_text: None,
            content_url: None,
            content_type: Some("application/json".to_string()),
            redaction_mode: RedactionMode::default(),
            metadata: None,
            triggered_by: TriggeredBy::Worker,
            triggered_by_id: None,
        }
    }

    pub fn for_target(target_id: TargetId, artifact_type: ArtifactType, content: Value) -> Self {
        Self {
            target_id: Some(target_id),
            run_id: None,
            artifact_type,
            content: Some(content),
            content_text: None,
            content_url: None,
            content_type: Some("application/json".to_string()),
            redaction_mode: RedactionMode::default(),
            metadata: None,
            triggered_by: TriggeredBy::Worker,
            triggered_by_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    store: Arc<SqliteStore>,
    log: JsonlEventLog,
}

impl ArtifactWriter {
    pub fn new(store: Arc<SqliteStore>, log: JsonlEventLog) -> Self {
        Self { store, log }
    }

    /// Redact, checksum, and persist one artifact, emitting its events.
    pub fn store(&self, request: ArtifactRequest) -> Result<SubmissionArtifact, ArtifactError> {
        let link = match request.artifact_type.linkage() {
            Linkage::Run => LinkedId::Run(
                request
                    .run_id
                    .clone()
                    .ok_or(ArtifactError::MissingRunLink(request.artifact_type))?,
            ),
            Linkage::Target => LinkedId::Target(
                request
                    .target_id
                    .clone()
                    .ok_or(ArtifactError::MissingTargetLink(request.artifact_type))?,
            ),
        };

        let mut content = request.content.clone();
        let mut content_text = request.content_text.clone();
        let mut leaks_scrubbed: u32 = 0;

        if request.redaction_mode != RedactionMode::Skip {
            if let Some(value) = content.as_mut() {
                leaks_scrubbed += scrub_value(value);
            }
            if let Some(text) = content_text.as_mut() {
                let (scrubbed, count) = scrub_text(text);
                if count > 0 {
                    *text = scrubbed;
                    leaks_scrubbed += count;
                }
            }
        }

        if request.redaction_mode == RedactionMode::StrictFailOnLeak {
            let mut remaining: u32 = 0;
            if let Some(value) = content.as_ref() {
                remaining += scan_value(value);
            }
            if let Some(text) = content_text.as_deref() {
                remaining += scan_text(text);
            }
            if let Some(url) = request.content_url.as_deref() {
                remaining += scan_text(url);
            }
            if remaining > 0 {
                let event = self.linked_event(
                    &link,
                    &request,
                    EventKind::RedactionFailed {
                        artifact_type: request.artifact_type.as_str().to_string(),
                        leaks_remaining: remaining,
                    },
                );
                record_event(&self.store, &self.log, &event)?;
                return Err(ArtifactError::RedactionLeak {
                    artifact_type: request.artifact_type,
                    leaks_remaining: remaining,
                });
            }
        }

        let bytes = content_bytes(&content, &content_text, &request.content_url)?;
        let (run_id, target_id) = match &link {
            LinkedId::Run(run_id) => (Some(run_id.clone()), None),
            LinkedId::Target(target_id) => (None, Some(target_id.clone())),
        };
        let artifact = SubmissionArtifact {
            id: ArtifactId::generate(),
            run_id,
            target_id,
            artifact_type: request.artifact_type,
            content,
            content_text,
            content_url: request.content_url.clone(),
            content_type: request.content_type.clone(),
            size_bytes: bytes.len() as u64,
            checksum: hex::encode(Sha256::digest(&bytes)),
            redaction_mode: request.redaction_mode,
            redaction_applied: leaks_scrubbed > 0,
            redaction_leaks_count: leaks_scrubbed,
            metadata: request.metadata.clone(),
            created_at: Utc::now(),
        };
        let mut events = vec![self.linked_event(
            &link,
            &request,
            EventKind::ArtifactStored {
                artifact_id: artifact.id.clone(),
                artifact_type: artifact.artifact_type.as_str().to_string(),
                size_bytes: artifact.size_bytes,
            },
        )];
        if artifact.redaction_applied {
            events.push(self.linked_event(
                &link,
                &request,
                EventKind::ArtifactRedacted {
                    artifact_id: artifact.id.clone(),
                    leaks_scrubbed,
                },
            ));
        }
        // Row and events land in one transaction; the JSONL mirror follows.
        self.store.insert_artifact_with_events(&artifact, &events)?;
        mirror_events(&self.log, &events);
        Ok(artifact)
    }

    fn linked_event(
        &self,
        link: &LinkedId,
        request: &ArtifactRequest,
        kind: EventKind,
    ) -> SubmissionEvent {
        match link {
            LinkedId::Run(run_id) => SubmissionEvent::for_run(
                run_id.clone(),
                request.triggered_by,
                request.triggered_by_id.clone(),
                kind,
            ),
            LinkedId::Target(target_id) => SubmissionEvent::for_target(
                target_id.clone(),
                request.triggered_by,
                request.triggered_by_id.clone(),
                kind,
            ),
        }
    }
}

/// Resolved linkage: exactly one entity id per artifact.
#[derive(Debug, Clone)]
enum LinkedId {
    Run(RunId),
    Target(TargetId),
}

fn content_bytes(
    content: &Option<Value>,
    content_text: &Option<String>,
    content_url: &Option<String>,
) -> Result<Vec<u8>, PersistenceError> {
    if let Some(value) = content {
        return Ok(serde_json::to_vec(value)?);
    }
    if let Some(text) = content_text {
        return Ok(text.clone().into_bytes());
    }
    if let Some(url) = content_url {
        return Ok(url.clone().into_bytes());
    }
    Ok(Vec::new())
}
