use crate::config::ApiConfig;
use crate::error::Error;
use crate::grants::{GrantError, GrantParams, GrantVerifier, Permission};
use crate::pipeline::{RedactionOutcome, RedactionPipeline};
use crate::storage::{content_type_for, ByteRange, ObjectBody, ObjectStoreGateway, StorageObjectRef};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Number of names returned by the container diagnostic
const TEST_LISTING_LIMIT: usize = 10;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ObjectStoreGateway>,
    pub pipeline: Arc<RedactionPipeline>,
    /// `None` when no signing key is configured; `/blob` then refuses everything
    pub verifier: Option<Arc<GrantVerifier>>,
    /// Cancelled on shutdown; in-flight redactions stop polling
    pub shutdown: CancellationToken,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: code.to_string(),
        }),
    )
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::InvalidRange { .. } => (StatusCode::RANGE_NOT_SATISFIABLE, "INVALID_RANGE"),
            Error::Grant(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            Error::PollTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "POLL_TIMEOUT"),
            Error::Cancelled { .. } | Error::Aborted { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED")
            }
            Error::CapabilityUnsupported(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CAPABILITY_UNSUPPORTED")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        if status.is_server_error() {
            error!(error = %err, "Request failed");
        } else {
            warn!(error = %err, "Request rejected");
        }

        api_error(status, code, err.to_string())
    }
}

/// Query parameters for a redaction request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactionQuery {
    pub file_name: String,
}

/// Container diagnostic response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub container: String,
    pub blob_count: usize,
    pub blobs: Vec<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/view/:container/*name", get(view_document))
        .route("/download/:container/*name", get(download_document))
        .route("/test/:container", get(test_container))
        .route("/blob/:container/*name", get(read_blob).put(write_blob))
        .route("/api/v1/redactions", post(create_redaction))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "redactor"
    }))
}

fn requested_range(headers: &HeaderMap) -> Option<ByteRange> {
    headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(ByteRange::parse)
}

fn object_response(
    body: ObjectBody,
    content_type: HeaderValue,
    disposition: Option<HeaderValue>,
) -> Response {
    let status = if body.content_range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.content_length));
    if let Some(range) = body.content_range {
        if let Ok(value) = HeaderValue::from_str(&range.to_string()) {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
    if let Some(disposition) = disposition {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    (status, headers, Body::from_stream(body.stream)).into_response()
}

/// `attachment` with an ASCII fallback name and the exact name in `filename*`
fn attachment_disposition(name: &str) -> HeaderValue {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded = utf8_percent_encode(file_name, NON_ALPHANUMERIC);

    HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback, encoded
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Stream a stored document inline
#[instrument(skip(state, headers))]
async fn view_document(
    State(state): State<AppState>,
    Path((container, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let object = StorageObjectRef::new(container, name);
    let body = state
        .gateway
        .download(&object, requested_range(&headers))
        .await?;

    Ok(object_response(
        body,
        HeaderValue::from_static("application/pdf"),
        None,
    ))
}

/// Stream a stored document as an attachment
#[instrument(skip(state, headers))]
async fn download_document(
    State(state): State<AppState>,
    Path((container, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let object = StorageObjectRef::new(container, name);
    let body = state
        .gateway
        .download(&object, requested_range(&headers))
        .await?;

    Ok(object_response(
        body,
        HeaderValue::from_static("application/pdf"),
        Some(attachment_disposition(&object.name)),
    ))
}

/// Storage connectivity check: count and sample a container
#[instrument(skip(state))]
async fn test_container(
    State(state): State<AppState>,
    Path(container): Path<String>,
) -> Result<Json<ContainerSummary>, ApiError> {
    let names = state.gateway.list(&container, "").await?;

    Ok(Json(ContainerSummary {
        container,
        blob_count: names.len(),
        blobs: names.into_iter().take(TEST_LISTING_LIMIT).collect(),
    }))
}

fn verifier(state: &AppState) -> Result<&GrantVerifier, ApiError> {
    state.verifier.as_deref().ok_or_else(|| {
        api_error(
            StatusCode::FORBIDDEN,
            "GRANTS_DISABLED",
            "Access grants are not configured",
        )
    })
}

/// Read an object with an access grant
#[instrument(skip(state, params, headers))]
async fn read_blob(
    State(state): State<AppState>,
    Path((container, name)): Path<(String, String)>,
    Query(params): Query<GrantParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let object = StorageObjectRef::new(container, name);
    verifier(&state)?
        .authorize(&params, &object, Permission::Read)
        .map_err(Error::from)?;

    let body = state
        .gateway
        .download(&object, requested_range(&headers))
        .await?;

    let content_type = body
        .content_type
        .as_deref()
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static(content_type_for(&object.name)));

    Ok(object_response(body, content_type, None))
}

/// Create or replace an object with an access grant.
///
/// Replacing needs `w`; creating needs `w` or `c`.
#[instrument(skip(state, params, body), fields(size_bytes = body.len()))]
async fn write_blob(
    State(state): State<AppState>,
    Path((container, name)): Path<(String, String)>,
    Query(params): Query<GrantParams>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let object = StorageObjectRef::new(container, name);
    let permissions = verifier(&state)?
        .validate(&params, &object)
        .map_err(Error::from)?;

    if !permissions.contains(Permission::Write) {
        let creating = permissions.contains(Permission::Create)
            && !state.gateway.exists(&object).await?;
        if !creating {
            metrics::counter!("redactor.grants.rejected", "reason" => "permission").increment(1);
            return Err(Error::from(GrantError::PermissionDenied(Permission::Write)).into());
        }
    }

    state.gateway.put(&object, body).await?;

    Ok(StatusCode::CREATED)
}

/// Upload a document and run it through redaction
#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn create_redaction(
    State(state): State<AppState>,
    Query(query): Query<RedactionQuery>,
    body: Bytes,
) -> Result<Json<RedactionOutcome>, ApiError> {
    if query.file_name.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "fileName must not be empty",
        ));
    }
    if body.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "Request body is empty",
        ));
    }

    let cancel = state.shutdown.child_token();
    let outcome = state
        .pipeline
        .redact(body, query.file_name.trim(), &cancel)
        .await?;

    Ok(Json(outcome))
}

/// Start the API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting redaction API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
