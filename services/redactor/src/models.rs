//! Wire types for the remote analyze-documents job protocol.
//!
//! Request types are exact: every field is always sent. Response types are
//! tolerant: every field may be absent and unknown fields are ignored, so a
//! newer service version never breaks decoding.

use crate::grants::AccessGrant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Task kind for PII recognition
pub const PII_TASK_KIND: &str = "PiiEntityRecognition";

/// Name given to the single task of every job
pub const PII_TASK_NAME: &str = "PiiTask";

/// Categories detected when none are configured
pub const DEFAULT_PII_CATEGORIES: [&str; 10] = [
    "Person",
    "Organization",
    "Email",
    "USSocialSecurityNumber",
    "CreditCardNumber",
    "PhoneNumber",
    "Address",
    "DateTime",
    "IPAddress",
    "URL",
];

/// Job submission body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    pub display_name: String,
    pub analysis_input: AnalysisInput,
    pub tasks: Vec<JobTask>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisInput {
    pub documents: Vec<DocumentInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentInput {
    pub id: String,
    pub language: String,
    pub source: Location,
    pub target: Location,
}

#[derive(Clone, Serialize)]
pub struct Location {
    pub location: String,
}

// Locations are signed grant URLs
impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible = self.location.split('?').next().unwrap_or_default();
        f.debug_struct("Location").field("location", &visible).finish()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTask {
    pub kind: String,
    pub task_name: String,
    pub parameters: PiiParameters,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PiiParameters {
    pub redaction_policy: RedactionPolicy,
    pub pii_categories: Vec<String>,
    pub exclude_extraction_data: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactionPolicy {
    pub policy_kind: RedactionPolicyKind,
}

/// How detected entities are redacted in the output document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RedactionPolicyKind {
    /// Replace each entity with its category name
    #[default]
    EntityMask,
    /// Replace each character with a fixed mask character
    CharacterMask,
    /// Leave the text untouched; only report entities
    NoMask,
}

impl JobRequest {
    /// Build the request for one document: read from `source`, write the
    /// redacted output and its sidecars under `target`.
    pub fn for_document(
        file_name: &str,
        language: &str,
        source: &AccessGrant,
        target: &AccessGrant,
        categories: &[String],
        policy: RedactionPolicyKind,
    ) -> Self {
        Self {
            display_name: format!("PII Detection for {}", file_name),
            analysis_input: AnalysisInput {
                documents: vec![DocumentInput {
                    id: Uuid::new_v4().to_string(),
                    language: language.to_string(),
                    source: Location {
                        location: source.url().to_string(),
                    },
                    target: Location {
                        location: target.url().to_string(),
                    },
                }],
            },
            tasks: vec![JobTask {
                kind: PII_TASK_KIND.to_string(),
                task_name: PII_TASK_NAME.to_string(),
                parameters: PiiParameters {
                    redaction_policy: RedactionPolicy {
                        policy_kind: policy,
                    },
                    pii_categories: categories.to_vec(),
                    exclude_extraction_data: false,
                },
            }],
        }
    }
}

/// Lifecycle state reported by the job service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobState {
    NotStarted,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
    Cancelled,
    Cancelling,
    Unknown(String),
}

impl JobState {
    /// Whether polling should stop. Only `succeeded` and `failed` end a job;
    /// anything else keeps the poll loop going until its deadline.
    pub fn is_complete(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobState::NotStarted => "notStarted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::PartiallyFailed => "partiallyCompleted",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Cancelling => "cancelling",
            JobState::Unknown(raw) => raw,
        }
    }
}

impl From<String> for JobState {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "notstarted" => JobState::NotStarted,
            "running" => JobState::Running,
            "succeeded" => JobState::Succeeded,
            "partiallycompleted" | "partiallysucceeded" => JobState::PartiallyFailed,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            "cancelling" => JobState::Cancelling,
            _ => JobState::Unknown(raw),
        }
    }
}

impl From<JobState> for String {
    fn from(state: JobState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status envelope returned by a job GET
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub job_id: Option<String>,
    pub status: JobState,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_updated_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: Option<TaskProgress>,
    #[serde(default, deserialize_with = "error_messages::deserialize")]
    pub errors: Vec<String>,
}

/// Task counters of a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    #[serde(default)]
    pub completed: u32,
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub in_progress: u32,
    #[serde(default)]
    pub total: u32,
}

/// Service errors arrive either as plain strings or as `{code, message}`
/// objects; both are flattened to display strings.
mod error_messages {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawError {
        Text(String),
        Detailed {
            #[serde(default)]
            code: Option<String>,
            #[serde(default)]
            message: Option<String>,
        },
        Other(serde_json::Value),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<Vec<RawError>> = Option::deserialize(deserializer)?;
        Ok(raw
            .unwrap_or_default()
            .into_iter()
            .map(|error| match error {
                RawError::Text(text) => text,
                RawError::Detailed {
                    code: Some(code),
                    message: Some(message),
                } => format!("{}: {}", code, message),
                RawError::Detailed {
                    code,
                    message,
                } => message.or(code).unwrap_or_default(),
                RawError::Other(value) => value.to_string(),
            })
            .collect())
    }
}

/// Full result payload of a finished job
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobState>,
    #[serde(default)]
    pub tasks: Option<TaskResults>,
    #[serde(default, deserialize_with = "error_messages::deserialize")]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskResults {
    #[serde(default)]
    pub items: Option<Vec<TaskItem>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskItem {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub status: Option<JobState>,
    #[serde(default)]
    pub results: Option<TaskItemResults>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskItemResults {
    #[serde(default)]
    pub documents: Option<Vec<DocumentResult>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub targets: Option<Vec<TargetArtifact>>,
    #[serde(default)]
    pub entities: Option<Vec<PiiEntity>>,
}

/// One file the job wrote to the target container
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetArtifact {
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// A detected entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PiiEntity {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, alias = "subcategory")]
    pub sub_category: Option<String>,
    /// Confidence between 0.0 and 1.0
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub length: u64,
}

/// A submitted job. The id comes from the service and never changes.
#[derive(Debug, Clone)]
pub struct RedactionJob {
    pub job_id: String,
    pub display_name: String,
    pub source: AccessGrant,
    pub target: AccessGrant,
    pub categories: Vec<String>,
    pub policy: RedactionPolicyKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_state_parses_case_insensitively() {
        for (raw, expected) in [
            ("succeeded", JobState::Succeeded),
            ("SUCCEEDED", JobState::Succeeded),
            ("Failed", JobState::Failed),
            ("notStarted", JobState::NotStarted),
            ("partiallyCompleted", JobState::PartiallyFailed),
            ("cancelling", JobState::Cancelling),
        ] {
            assert_eq!(JobState::from(raw.to_string()), expected, "{}", raw);
        }

        assert_eq!(
            JobState::from("paused".to_string()),
            JobState::Unknown("paused".to_string())
        );
    }

    #[test]
    fn test_only_succeeded_and_failed_complete() {
        assert!(JobState::Succeeded.is_complete());
        assert!(JobState::Failed.is_complete());
        assert!(!JobState::PartiallyFailed.is_complete());
        assert!(!JobState::Cancelled.is_complete());
        assert!(!JobState::Running.is_complete());
        assert!(!JobState::Unknown("done".into()).is_complete());
    }

    #[test]
    fn test_job_status_decodes_service_envelope() {
        let status: JobStatus = serde_json::from_value(json!({
            "jobId": "abc-123",
            "status": "running",
            "displayName": "PII Detection for a.pdf",
            "createdDateTime": "2024-03-01T12:00:00Z",
            "lastUpdatedDateTime": "2024-03-01T12:00:05Z",
            "tasks": {"completed": 0, "failed": 0, "inProgress": 1, "total": 1},
            "errors": [
                "plain",
                {"code": "InvalidDocument", "message": "Document is encrypted"}
            ],
            "somethingNew": true
        }))
        .unwrap();

        assert_eq!(status.status, JobState::Running);
        assert_eq!(status.tasks.unwrap().in_progress, 1);
        assert_eq!(
            status.errors,
            vec!["plain", "InvalidDocument: Document is encrypted"]
        );
    }

    #[test]
    fn test_job_status_errors_may_be_null() {
        let status: JobStatus =
            serde_json::from_value(json!({"status": "failed", "errors": null})).unwrap();
        assert!(status.errors.is_empty());
        assert!(status.status.is_complete());
    }

    #[test]
    fn test_entity_accepts_lowercase_subcategory() {
        let entity: PiiEntity = serde_json::from_value(json!({
            "text": "555-0100",
            "category": "PhoneNumber",
            "subcategory": "Mobile",
            "confidenceScore": 0.8,
            "offset": 10,
            "length": 8
        }))
        .unwrap();
        assert_eq!(entity.sub_category.as_deref(), Some("Mobile"));
    }
}
