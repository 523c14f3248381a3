//! Redactor Service
//!
//! PII redaction for uploaded documents. Detection and redaction are done by a
//! remote analyze-documents job service; this service stores the documents,
//! hands the job service short-lived access grants to read the original and
//! write the redacted output, drives the job to completion and reports where
//! the redacted document landed.
//!
//! ## Features
//!
//! - **Scoped Access Grants**: HMAC-signed, time-limited URLs for a single
//!   object (read) or a whole container (read/add/create/write)
//! - **Pluggable Object Storage**: S3-compatible buckets or an in-memory store,
//!   with paginated listing and range reads
//! - **Bounded Job Polling**: attempt and deadline limits, cancellation, retry
//!   of transient submission failures
//! - **Tolerant Result Parsing**: every level of the result payload is optional
//!
//! ## Architecture
//!
//! ```text
//!  POST /api/v1/redactions
//!        │
//!        ▼
//! ┌──────────────┐  upload   ┌──────────────┐  GET/PUT /blob  ┌──────────────┐
//! │ Redaction    │──────────▶│ Object Store │◀────────────────│ Remote Job   │
//! │ Pipeline     │           │ Gateway      │   (grants)      │ Service      │
//! └──────────────┘           └──────────────┘                 └──────────────┘
//!        │                          ▲                                ▲
//!        │ issue                    │ ensure container               │
//!        ▼                          │                                │
//! ┌──────────────┐                  │                                │
//! │ Grant        │──────────────────┘                                │
//! │ Issuer       │                                                   │
//! └──────────────┘                                                   │
//!        │                                                           │
//!        ▼ submit / poll / results                                   │
//! ┌──────────────┐                                                   │
//! │ Job Client   │───────────────────────────────────────────────────┘
//! └──────────────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ Result       │──▶ redacted document location
//! │ Extractor    │
//! └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod extractor;
pub mod grants;
pub mod job_client;
pub mod models;
pub mod pipeline;
pub mod storage;

pub use api::{AppState, ErrorResponse};
pub use config::Config;
pub use error::{Error, Resource, Result};
pub use extractor::{extract_entities, extract_redacted_location, parse_result};
pub use grants::{
    AccessGrant, Clock, GrantError, GrantIssuer, GrantScope, GrantVerifier, Permission,
    Permissions, SigningKey, SystemClock,
};
pub use job_client::{is_complete, terminal_state, JobApi, RedactionJobClient};
pub use models::{JobResult, JobState, JobStatus, PiiEntity, RedactionJob, RedactionPolicyKind};
pub use pipeline::{RedactionOutcome, RedactionPipeline};
pub use storage::{ObjectStore, ObjectStoreGateway, StorageObjectRef};
