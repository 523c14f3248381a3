use crate::error::{Error, Result};
use crate::models::{DocumentResult, JobResult, PiiEntity};

/// Extensions recognized as the redacted document among a job's targets
pub const DOCUMENT_EXTENSIONS: [&str; 2] = [".pdf", ".docx"];

/// Decode a raw result payload. Only non-JSON input is an error; any
/// JSON object, however incomplete, decodes.
pub fn parse_result(raw: &serde_json::Value) -> Result<JobResult> {
    serde_json::from_value(raw.clone())
        .map_err(|e| Error::MalformedResponse(format!("job result: {}", e)))
}

/// Decode a raw result body
pub fn parse_result_bytes(raw: &[u8]) -> Result<JobResult> {
    serde_json::from_slice(raw).map_err(|e| Error::MalformedResponse(format!("job result: {}", e)))
}

fn first_document(result: &JobResult) -> Option<&DocumentResult> {
    result
        .tasks
        .as_ref()?
        .items
        .as_ref()?
        .first()?
        .results
        .as_ref()?
        .documents
        .as_ref()?
        .first()
}

/// Location of the redacted document: the first target of the first
/// document whose path ends in a recognized extension.
///
/// `None` when any level is missing or empty. Metadata sidecars and other
/// artifacts are skipped.
pub fn extract_redacted_location(result: &JobResult) -> Option<&str> {
    first_document(result)?
        .targets
        .as_ref()?
        .iter()
        .filter_map(|target| target.location.as_deref())
        .find(|location| is_document(location))
}

/// Entities found in the first document
pub fn extract_entities(result: &JobResult) -> Vec<PiiEntity> {
    first_document(result)
        .and_then(|document| document.entities.clone())
        .unwrap_or_default()
}

fn is_document(location: &str) -> bool {
    // Signed locations carry a query string after the path
    let path = location
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    DOCUMENT_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
