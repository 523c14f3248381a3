use crate::grants::GrantError;
use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Something the caller asked for that does not exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Object { container: String, name: String },
    Container { container: String },
    Job { job_id: String },
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Object { container, name } => write!(f, "object {}/{}", container, name),
            Resource::Container { container } => write!(f, "container {}", container),
            Resource::Job { job_id } => write!(f, "job {}", job_id),
        }
    }
}

/// Errors surfaced by the grant issuer, storage gateway, job client and pipeline
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(Resource),

    #[error("Access grants are not supported: {0}")]
    CapabilityUnsupported(String),

    #[error("Job submission rejected with status {status}: {body}")]
    SubmissionRejected { status: u16, body: String },

    #[error("Status query for job {job_id} failed with status {status}: {body}")]
    JobQueryFailed {
        job_id: String,
        status: u16,
        body: String,
    },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Transport failure ({context})")]
    TransportFailure {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("Requested range {range} not satisfiable")]
    InvalidRange { range: String },

    #[error("Job {job_id} did not reach a terminal state after {attempts} polls")]
    PollTimeout { job_id: String, attempts: u32 },

    #[error("Job {job_id} was abandoned by the caller")]
    Cancelled { job_id: String },

    /// Cancelled before a job existed, during `operation`
    #[error("Redaction abandoned by the caller during {operation}")]
    Aborted { operation: &'static str },

    #[error("Access grant rejected: {0}")]
    Grant(#[from] GrantError),
}

impl Error {
    pub fn object_not_found(container: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound(Resource::Object {
            container: container.into(),
            name: name.into(),
        })
    }

    pub fn transport(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Error::TransportFailure {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Wrap a reqwest error without the request URL, which may carry a grant
    pub fn http(context: impl Into<String>, err: reqwest::Error) -> Self {
        Error::transport(context, err.without_url())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether a retry of the same operation could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransportFailure { .. } => true,
            Error::SubmissionRejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display_names_the_object() {
        let err = Error::object_not_found("uploads", "a b.pdf");
        assert_eq!(err.to_string(), "object uploads/a b.pdf not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_transient_classification() {
        let throttled = Error::SubmissionRejected {
            status: 429,
            body: String::new(),
        };
        let bad_request = Error::SubmissionRejected {
            status: 400,
            body: String::new(),
        };
        let io = Error::transport("put uploads/x", std::io::Error::other("reset"));

        assert!(throttled.is_transient());
        assert!(!bad_request.is_transient());
        assert!(io.is_transient());
        assert!(!Error::MalformedResponse("x".into()).is_transient());
    }

    #[test]
    fn test_transport_display_hides_source_detail() {
        let err = Error::transport(
            "get uploads/x",
            std::io::Error::other("https://host/blob?sig=secret"),
        );
        assert!(!err.to_string().contains("sig="));
    }
}
