//! Validation for engine configuration and submission payloads.

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::types::SubmissionPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

impl Validate for EngineConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.worker.lease_duration_ms <= 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worker.lease_duration.nonpositive",
                message: "lease duration must be positive".to_string(),
            });
        }

        if self.worker.lease_grace_ms < 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worker.lease_grace.negative",
                message: "lease grace period must not be negative".to_string(),
            });
        }

        if self.worker.batch_size == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "worker.batch_size.zero",
                message: "batch size of zero means tick_once can never process a run".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "retry.max_attempts.zero",
                message: "max attempts of zero disables all submissions".to_string(),
            });
        }

        if self.retry.base_delay_ms <= 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "retry.base_delay.nonpositive",
                message: "retry base delay must be positive".to_string(),
            });
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "retry.max_delay.below_base",
                message: "max delay below base delay caps every retry at max_delay_ms".to_string(),
            });
        }

        if self.action_deadline_days <= 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "action_deadline_days.nonpositive",
                message: "action deadline must be at least one day".to_string(),
            });
        }

        issues
    }
}

impl Validate for SubmissionPayload {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.business_name.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "payload.business_name.empty",
                message: "business name is required".to_string(),
            });
        }

        if let Some(website) = &self.website {
            if !website.starts_with("http://") && !website.starts_with("https://") {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "payload.website.scheme",
                    message: format!("website '{website}' is not an http(s) url"),
                });
            }
        }

        if self.submission_url.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "payload.submission_url.empty",
                message: "directory submission url is required".to_string(),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, DirectoryConstraints};

    fn payload() -> SubmissionPayload {
        SubmissionPayload {
            business_name: "Acme Plumbing".to_string(),
            website: Some("https://acme.example".to_string()),
            description: None,
            categories: Vec::new(),
            phone: None,
            email: None,
            address: Address::default(),
            directory_name: "City Index".to_string(),
            submission_url: "https://cityindex.example/submit".to_string(),
            constraints: DirectoryConstraints::default(),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_empty());
    }

    #[test]
    fn zero_batch_size_is_an_error() {
        let mut config = EngineConfig::default();
        config.worker.batch_size = 0;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.code == "worker.batch_size.zero"));
    }

    #[test]
    fn payload_without_name_is_an_error() {
        let mut payload = payload();
        payload.business_name = "  ".to_string();
        let issues = payload.validate();
        assert!(issues
            .iter()
            .any(|i| i.code == "payload.business_name.empty"));
    }

    #[test]
    fn non_http_website_is_a_warning() {
        let mut payload = payload();
        payload.website = Some("ftp://acme.example".to_string());
        let issues = payload.validate();
        assert!(issues.iter().any(|i| i.code == "payload.website.scheme"
            && i.level == ValidationLevel::Warning));
    }
}
