//! Generic fallback connector: every directory is submittable even without
//! a bespoke integration.
//!
//! Produces a field-by-field submission packet plus operator instructions
//! and returns `ActionNeeded { MANUAL_SUBMISSION }`. It never attempts an
//! automated submission.

use serde_json::json;

use subm_core::types::{ActionNeededType, SubmissionPayload};

use crate::connector::{
    ActionRequest, Capability, Connector, ConnectorFailure, SubmitContext, SubmitOutcome,
};

pub const MANUAL_PACKET_KEY: &str = "manual_packet";

#[derive(Debug, Clone, Copy, Default)]
pub struct ManualPacketConnector;

impl ManualPacketConnector {
    fn build_packet(payload: &SubmissionPayload) -> serde_json::Value {
        json!({
            "business_name": payload.business_name,
            "website": payload.website,
            "description": payload.description,
            "categories": payload.categories,
            "phone": payload.phone,
            "email": payload.email,
            "address": {
                "street": payload.address.street,
                "city": payload.address.city,
                "region": payload.address.region,
                "postal_code": payload.address.postal_code,
                "country": payload.address.country,
            },
        })
    }

    fn build_instructions(payload: &SubmissionPayload) -> String {
        let mut lines = vec![
            format!("1. Open {}", payload.submission_url),
            format!(
                "2. Fill the listing form for '{}' using the values in the submission packet",
                payload.business_name
            ),
            "3. Copy each packet field into the matching form field".to_string(),
            "4. Submit the form and note any confirmation id shown".to_string(),
            "5. Mark the action complete with the confirmation id".to_string(),
        ];
        if payload.email.is_some() {
            lines.push("6. Watch the business inbox for a verification email".to_string());
        }
        lines.join("\n")
    }
}

impl Connector for ManualPacketConnector {
    fn key(&self) -> &'static str {
        MANUAL_PACKET_KEY
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::PacketGeneration]
    }

    fn submit(
        &self,
        payload: &SubmissionPayload,
        _context: &SubmitContext,
    ) -> Result<SubmitOutcome, ConnectorFailure> {
        Ok(SubmitOutcome::ActionNeeded {
            action: ActionRequest {
                action_type: ActionNeededType::ManualSubmission,
                url: Some(payload.submission_url.clone()),
                instructions: Some(Self::build_instructions(payload)),
            },
            packet: Some(Self::build_packet(payload)),
            response: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subm_core::types::{
        Address, BusinessId, BusinessProfile, Directory, DirectoryConstraints, DirectoryId,
        RunId, TargetId,
    };

    fn payload() -> SubmissionPayload {
        let business = BusinessProfile {
            id: BusinessId::new("B1"),
            name: "Acme Plumbing".to_string(),
            website: Some("https://acme.example".to_string()),
            description: Some("Emergency plumbing".to_string()),
            categories: vec!["plumbing".to_string()],
            phone: Some("+1 555 0100".to_string()),
            email: Some("contact@acme.example".to_string()),
            address: Address::default(),
        };
        let directory = Directory {
            id: DirectoryId::new("D1"),
            name: "City Index".to_string(),
            submission_url: "https://cityindex.example/submit".to_string(),
            connector_key: None,
            constraints: DirectoryConstraints::default(),
        };
        SubmissionPayload::from_parts(&business, &directory)
    }

    fn context() -> SubmitContext {
        SubmitContext {
            run_id: RunId::new("R1"),
            target_id: TargetId::new("T1"),
            attempt_no: 1,
            correlation_id: "corr-1".to_string(),
        }
    }

    #[test]
    fn always_returns_manual_submission_action() {
        let connector = ManualPacketConnector;
        let outcome = connector.submit(&payload(), &context()).expect("submit");
        match outcome {
            SubmitOutcome::ActionNeeded { action, packet, .. } => {
                assert_eq!(action.action_type, ActionNeededType::ManualSubmission);
                assert_eq!(
                    action.url.as_deref(),
                    Some("https://cityindex.example/submit")
                );
                let packet = packet.expect("packet");
                assert_eq!(packet["business_name"], "Acme Plumbing");
                assert_eq!(packet["address"]["street"], serde_json::Value::Null);
            }
            other => panic!("expected action needed, got {other:?}"),
        }
    }

    #[test]
    fn instructions_reference_the_submission_url() {
        let connector = ManualPacketConnector;
        let outcome = connector.submit(&payload(), &context()).expect("submit");
        let SubmitOutcome::ActionNeeded { action, .. } = outcome else {
            panic!("expected action needed");
        };
        let instructions = action.instructions.expect("instructions");
        assert!(instructions.contains("https://cityindex.example/submit"));
        assert!(instructions.contains("verification email"));
    }

    #[test]
    fn advertises_only_packet_generation() {
        let connector = ManualPacketConnector;
        assert_eq!(connector.capabilities(), &[Capability::PacketGeneration]);
    }
}
