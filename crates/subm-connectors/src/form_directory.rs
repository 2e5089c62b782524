//! Connector for form-only directories with no public API.
//!
//! Deliberately does not drive the target site's form: that would violate
//! most directories' terms of service. Instead it maps and validates fields
//! against the directory's constraints and hands back an operator-ready
//! packet, reducing the manual step to "copy these values".

use serde_json::json;

use subm_core::types::{ActionNeededType, SubmissionPayload};

use crate::connector::{
    ActionRequest, Capability, Connector, ConnectorFailure, SubmitContext, SubmitOutcome,
    ValidationReport,
};

pub const GENERIC_FORM_KEY: &str = "generic_form";

#[derive(Debug, Clone, Copy, Default)]
pub struct FormDirectoryConnector;

impl FormDirectoryConnector {
    fn constraint_violations(payload: &SubmissionPayload) -> Vec<String> {
        let constraints = &payload.constraints;
        let mut violations = Vec::new();

        if payload.business_name.trim().is_empty() {
            violations.push("business name is required".to_string());
        } else if payload.business_name.chars().count() > constraints.max_name_len {
            violations.push(format!(
                "business name exceeds {} characters",
                constraints.max_name_len
            ));
        }

        if let Some(description) = &payload.description {
            if description.chars().count() > constraints.max_description_len {
                violations.push(format!(
                    "description exceeds {} characters",
                    constraints.max_description_len
                ));
            }
        }

        if payload.categories.len() > constraints.max_categories {
            violations.push(format!(
                "too many categories ({} > {})",
                payload.categories.len(),
                constraints.max_categories
            ));
        }

        for field in &constraints.required_fields {
            let present = match field.as_str() {
                "website" => payload.website.is_some(),
                "description" => payload.description.is_some(),
                "phone" => payload.phone.is_some(),
                "email" => payload.email.is_some(),
                "categories" => !payload.categories.is_empty(),
                "street" => payload.address.street.is_some(),
                "city" => payload.address.city.is_some(),
                "postal_code" => payload.address.postal_code.is_some(),
                // Unknown required-field names are a directory-seed problem,
                // not a payload problem.
                _ => true,
            };
            if !present {
                violations.push(format!("required field '{field}' is missing"));
            }
        }

        violations
    }

    fn build_packet(payload: &SubmissionPayload) -> serde_json::Value {
        let mut fields = vec![
            json!({"field": "name", "value": payload.business_name}),
        ];
        if let Some(website) = &payload.website {
            fields.push(json!({"field": "website", "value": website}));
        }
        if let Some(description) = &payload.description {
            fields.push(json!({"field": "description", "value": description}));
        }
        if !payload.categories.is_empty() {
            fields.push(json!({"field": "categories", "value": payload.categories.join(", ")}));
        }
        if let Some(phone) = &payload.phone {
            fields.push(json!({"field": "phone", "value": phone}));
        }
        if let Some(email) = &payload.email {
            fields.push(json!({"field": "email", "value": email}));
        }
        json!({
            "directory": payload.directory_name,
            "form_url": payload.submission_url,
            "fields": fields,
        })
    }
}

impl Connector for FormDirectoryConnector {
    fn key(&self) -> &'static str {
        GENERIC_FORM_KEY
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Validate, Capability::PacketGeneration]
    }

    fn validate(&self, payload: &SubmissionPayload) -> ValidationReport {
        let errors = Self::constraint_violations(payload);
        let mut warnings = Vec::new();
        if payload.description.is_none() {
            warnings.push("directories rank listings with descriptions higher".to_string());
        }
        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    fn submit(
        &self,
        payload: &SubmissionPayload,
        _context: &SubmitContext,
    ) -> Result<SubmitOutcome, ConnectorFailure> {
        let violations = Self::constraint_violations(payload);
        if !violations.is_empty() {
            return Err(ConnectorFailure::validation(violations.join("; "))
                .with_code("FIELD_CONSTRAINTS"));
        }

        let instructions = [
            format!("1. Open the form at {}", payload.submission_url),
            "2. Paste each field from the packet into the matching form input".to_string(),
            "3. Leave unlisted form fields at their defaults".to_string(),
            "4. Submit and record the confirmation id".to_string(),
        ]
        .join("\n");

        Ok(SubmitOutcome::ActionNeeded {
            action: ActionRequest {
                action_type: ActionNeededType::ManualSubmission,
                url: Some(payload.submission_url.clone()),
                instructions: Some(instructions),
            },
            packet: Some(Self::build_packet(payload)),
            response: None,
        })
    }
}
