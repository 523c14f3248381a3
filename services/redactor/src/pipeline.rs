//! Redaction orchestration.
//!
//! One call to [`RedactionPipeline::redact`] runs a whole job lifecycle:
//!
//! ```text
//! upload ──► source grant (r) ──► submit ──► poll until terminal ──► fetch results ──► extract
//!            target grant (racw)
//! ```
//!
//! Uploads and submissions are retried on transient failures. Polling is
//! bounded by an attempt count and a deadline and stops as soon as the
//! caller cancels.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extractor::{extract_entities, extract_redacted_location, parse_result};
use crate::grants::{GrantIssuer, Permissions};
use crate::job_client::{terminal_state, JobApi};
use crate::models::{JobState, PiiEntity};
use crate::storage::{ObjectStoreGateway, StorageObjectRef};
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// How a submitted job is polled
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub deadline: Duration,
}

/// How transient upload and submission failures are retried
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None, // bounded by `attempts`
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub input_container: String,
    pub output_container: String,
    pub source_ttl: Duration,
    pub target_ttl: Duration,
    pub poll: PollPolicy,
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            input_container: config.storage.input_container.clone(),
            output_container: config.storage.output_container.clone(),
            source_ttl: config.source_grant_ttl(),
            target_ttl: config.target_grant_ttl(),
            poll: PollPolicy {
                interval: config.pipeline.poll_interval(),
                max_attempts: config.pipeline.max_poll_attempts,
                deadline: config.pipeline.poll_deadline(),
            },
            retry: RetryPolicy {
                attempts: config.pipeline.retry_attempts,
                initial_interval: config.pipeline.retry_initial_interval(),
                max_interval: config.pipeline.retry_max_interval(),
            },
        }
    }
}

/// What a finished job produced
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactionOutcome {
    pub job_id: String,
    pub status: JobState,
    /// The uploaded original
    pub source: StorageObjectRef,
    /// Location of the redacted document, without any access token
    pub redacted_location: Option<String>,
    /// The redacted document, when its location maps to a stored object
    pub redacted_object: Option<StorageObjectRef>,
    pub entities: Vec<PiiEntity>,
    pub errors: Vec<String>,
}

/// Drives documents through upload, redaction and result extraction
pub struct RedactionPipeline {
    gateway: Arc<ObjectStoreGateway>,
    grants: Arc<GrantIssuer>,
    jobs: Arc<dyn JobApi>,
    settings: PipelineSettings,
}

impl RedactionPipeline {
    pub fn new(
        gateway: Arc<ObjectStoreGateway>,
        grants: Arc<GrantIssuer>,
        jobs: Arc<dyn JobApi>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gateway,
            grants,
            jobs,
            settings,
        }
    }

    /// Redact one document end to end
    #[instrument(skip(self, data, cancel), fields(size_bytes = data.len()))]
    pub async fn redact(
        &self,
        data: Bytes,
        file_name: &str,
        cancel: &CancellationToken,
    ) -> Result<RedactionOutcome> {
        let started = Instant::now();

        let source = self
            .with_retry("upload", cancel, || {
                let chunk = futures::stream::once(futures::future::ready(Ok::<_, Infallible>(
                    data.clone(),
                )));
                self.gateway
                    .upload(chunk, file_name, &self.settings.input_container)
            })
            .await?;

        let source_grant =
            self.grants
                .issue_object_grant(&source, self.settings.source_ttl, Permissions::READ)?;
        let target_grant = self
            .grants
            .issue_container_grant(
                &self.settings.output_container,
                self.settings.target_ttl,
                Permissions::all(),
            )
            .await?;

        let job = self
            .with_retry("submit", cancel, || {
                self.jobs.submit(file_name, &source_grant, &target_grant)
            })
            .await?;

        let (status, attempts) = self.poll_until_terminal(&job.job_id, cancel).await?;
        debug!(
            job_id = %job.job_id,
            status = %status,
            attempts = attempts,
            "Job reached a terminal state"
        );

        let raw = self.jobs.get_results(&job.job_id).await?;
        let result = parse_result(&raw)?;

        let redacted_location = extract_redacted_location(&result).map(strip_token);
        let redacted_object = redacted_location
            .as_deref()
            .and_then(StorageObjectRef::from_location);

        if let Some(reported) = result.status.as_ref().filter(|reported| **reported != status) {
            debug!(
                job_id = %job.job_id,
                polled = %status,
                reported = %reported,
                "Result status differs from polled status"
            );
        }

        metrics::counter!("redactor.jobs.completed", "status" => status.to_string()).increment(1);
        metrics::histogram!("redactor.jobs.duration_seconds").record(started.elapsed().as_secs_f64());

        if redacted_location.is_none() {
            warn!(job_id = %job.job_id, status = %status, "Job result names no redacted document");
        }

        info!(
            job_id = %job.job_id,
            status = %status,
            source = %source,
            redacted = ?redacted_object,
            "Redaction finished"
        );

        Ok(RedactionOutcome {
            job_id: job.job_id,
            status,
            source,
            redacted_location,
            redacted_object,
            entities: extract_entities(&result),
            errors: result.errors,
        })
    }

    /// Poll until the job succeeds or fails. Returns the terminal state and
    /// the number of polls.
    async fn poll_until_terminal(
        &self,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(JobState, u32)> {
        let policy = &self.settings.poll;
        let deadline = Instant::now() + policy.deadline;
        let mut attempts = 0u32;

        loop {
            if attempts >= policy.max_attempts || Instant::now() >= deadline {
                return Err(Error::PollTimeout {
                    job_id: job_id.to_string(),
                    attempts,
                });
            }

            attempts += 1;
            metrics::counter!("redactor.jobs.poll_attempts").increment(1);

            let check =
                tokio::time::timeout_at(deadline, terminal_state(self.jobs.as_ref(), job_id));
            let terminal = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { job_id: job_id.to_string() });
                }
                outcome = check => outcome.unwrap_or(None),
            };

            if let Some(state) = terminal {
                return Ok((state, attempts));
            }

            let wake = (Instant::now() + policy.interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::Cancelled { job_id: job_id.to_string() });
                }
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Run `operation`, retrying transient failures with exponential backoff.
    /// Fails with `Aborted` once `cancel` fires, before an attempt or while
    /// waiting out a backoff.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.settings.retry;
        let mut backoff = policy.backoff();
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Aborted { operation });
            }
            attempt += 1;

            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < policy.attempts => {
                    let delay = backoff.next_backoff().unwrap_or(policy.max_interval);
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Aborted { operation }),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Drop the query string, which carries the access token
fn strip_token(location: &str) -> String {
    location.split('?').next().unwrap_or_default().to_string()
}
