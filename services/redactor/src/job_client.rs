use crate::config::LanguageConfig;
use crate::error::{Error, Resource, Result};
use crate::grants::AccessGrant;
use crate::models::{JobRequest, JobState, JobStatus, RedactionJob, RedactionPolicyKind};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Response, StatusCode, Url};
use tracing::{debug, info, instrument, warn};

const JOBS_PATH: &str = "language/analyze-documents/jobs";
const OPERATION_LOCATION: &str = "operation-location";
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Remote analyze-documents job API
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Submit a redaction job for one document and return the job
    async fn submit(
        &self,
        file_name: &str,
        source: &AccessGrant,
        target: &AccessGrant,
    ) -> Result<RedactionJob>;

    /// Current status of a job
    async fn get_status(&self, job_id: &str) -> Result<JobStatus>;

    /// Full result payload of a job, as returned by the service
    async fn get_results(&self, job_id: &str) -> Result<serde_json::Value>;
}

/// Whether the job has reached `succeeded` or `failed`.
///
/// Never fails: any error is logged and reported as "not complete" so the
/// caller's poll loop simply tries again.
pub async fn is_complete(api: &dyn JobApi, job_id: &str) -> bool {
    terminal_state(api, job_id).await.is_some()
}

/// The job's state if it is terminal, with the same error handling as
/// [`is_complete`]
pub async fn terminal_state(api: &dyn JobApi, job_id: &str) -> Option<JobState> {
    match api.get_status(job_id).await {
        Ok(status) if status.status.is_complete() => Some(status.status),
        Ok(_) => None,
        Err(e) => {
            warn!(job_id = %job_id, error = %e, "Status check failed, treating job as incomplete");
            None
        }
    }
}

/// The job id is the last non-empty path segment of `operation-location`
pub fn job_id_from_operation_location(location: &str) -> Option<String> {
    let url = Url::parse(location).ok()?;
    url.path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(String::from)
}

/// Error body as it may be logged and returned to callers.
///
/// The service echoes request fields in validation errors, including the
/// signed source and target locations, so query strings are dropped. The
/// result is capped at `MAX_ERROR_BODY_CHARS`.
fn sanitize_error_body(body: &str) -> String {
    let mut sanitized = String::new();
    let mut kept = 0;
    let mut in_query = false;

    for c in body.chars() {
        if in_query {
            if c.is_whitespace() || matches!(c, '"' | '\'' | '<' | '>' | ',' | ')' | ']' | '}') {
                in_query = false;
            } else {
                continue;
            }
        } else if c == '?' {
            in_query = true;
            continue;
        }

        if kept == MAX_ERROR_BODY_CHARS {
            sanitized.push_str("...");
            break;
        }
        sanitized.push(c);
        kept += 1;
    }

    sanitized
}

async fn error_body(response: Response) -> String {
    let text = response.text().await.unwrap_or_default();
    sanitize_error_body(&text)
}

/// HTTP client for the remote language service
pub struct RedactionJobClient {
    client: reqwest::Client,
    jobs_url: Url,
    api_version: String,
    key_header: HeaderName,
    key: HeaderValue,
    language: String,
    categories: Vec<String>,
    policy: RedactionPolicyKind,
}

impl RedactionJobClient {
    /// Create a new job client
    pub fn new(config: &LanguageConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        let endpoint = Url::parse(&format!("{}/", config.endpoint.trim_end_matches('/')))
            .context("Invalid language service endpoint")?;
        let jobs_url = endpoint
            .join(JOBS_PATH)
            .context("Invalid language service endpoint")?;

        let key_header = HeaderName::from_bytes(config.subscription_key_header.as_bytes())
            .context("Invalid subscription key header name")?;
        let mut key =
            HeaderValue::from_str(&config.api_key).context("Invalid subscription key")?;
        key.set_sensitive(true);

        info!(endpoint = %endpoint, api_version = %config.api_version, "Job client initialized");

        Ok(Self {
            client,
            jobs_url,
            api_version: config.api_version.clone(),
            key_header,
            key,
            language: config.language.clone(),
            categories: config.pii_categories.clone(),
            policy: RedactionPolicyKind::EntityMask,
        })
    }

    fn job_url(&self, job_id: &str) -> Url {
        let mut url = self.jobs_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(job_id);
        }
        url
    }

    /// GET a job; shared by status and result queries
    async fn fetch_job(&self, job_id: &str) -> Result<Response> {
        let response = self
            .client
            .get(self.job_url(job_id))
            .query(&[("api-version", self.api_version.as_str())])
            .header(self.key_header.clone(), self.key.clone())
            .send()
            .await
            .map_err(|e| Error::http(format!("query job {}", job_id), e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(Resource::Job {
                job_id: job_id.to_string(),
            }));
        }
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::JobQueryFailed {
                job_id: job_id.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl JobApi for RedactionJobClient {
    #[instrument(skip(self, source, target), fields(source = %source.redacted_url()))]
    async fn submit(
        &self,
        file_name: &str,
        source: &AccessGrant,
        target: &AccessGrant,
    ) -> Result<RedactionJob> {
        let request = JobRequest::for_document(
            file_name,
            &self.language,
            source,
            target,
            &self.categories,
            self.policy,
        );

        let response = self
            .client
            .post(self.jobs_url.clone())
            .query(&[("api-version", self.api_version.as_str())])
            .header(self.key_header.clone(), self.key.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::http(format!("submit job for {}", file_name), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            metrics::counter!("redactor.jobs.submitted", "outcome" => "rejected").increment(1);
            return Err(Error::SubmissionRejected {
                status: status.as_u16(),
                body,
            });
        }

        let location = response
            .headers()
            .get(OPERATION_LOCATION)
            .ok_or_else(|| {
                Error::MalformedResponse(format!(
                    "job accepted with status {} but no {} header",
                    status, OPERATION_LOCATION
                ))
            })?
            .to_str()
            .map_err(|_| {
                Error::MalformedResponse(format!("{} header is not valid text", OPERATION_LOCATION))
            })?;

        let job_id = job_id_from_operation_location(location).ok_or_else(|| {
            Error::MalformedResponse(format!("{} header has no job id", OPERATION_LOCATION))
        })?;

        metrics::counter!("redactor.jobs.submitted", "outcome" => "accepted").increment(1);
        info!(job_id = %job_id, file_name = %file_name, "Redaction job submitted");

        Ok(RedactionJob {
            job_id,
            display_name: request.display_name,
            source: source.clone(),
            target: target.clone(),
            categories: self.categories.clone(),
            policy: self.policy,
        })
    }

    #[instrument(skip(self))]
    async fn get_status(&self, job_id: &str) -> Result<JobStatus> {
        let response = self.fetch_job(job_id).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::http(format!("read status of job {}", job_id), e))?;

        let status: JobStatus = serde_json::from_slice(&body).map_err(|e| {
            Error::MalformedResponse(format!("status of job {}: {}", job_id, e))
        })?;

        debug!(job_id = %job_id, status = %status.status, "Job status");

        Ok(status)
    }

    #[instrument(skip(self))]
    async fn get_results(&self, job_id: &str) -> Result<serde_json::Value> {
        let response = self.fetch_job(job_id).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::http(format!("read results of job {}", job_id), e))?;

        serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedResponse(format!("results of job {}: {}", job_id, e)))
    }
}
