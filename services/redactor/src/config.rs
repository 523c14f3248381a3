use crate::models::DEFAULT_PII_CATEGORIES;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the redaction service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Access grant signing configuration
    #[serde(default)]
    pub grants: GrantsConfig,
    /// Remote language service configuration
    pub language: LanguageConfig,
    /// Polling and retry configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Which object store backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    S3,
    Memory,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Container uploads are written to
    #[serde(default = "default_input_container")]
    pub input_container: String,
    /// Container the remote service writes redacted output to
    #[serde(default = "default_output_container")]
    pub output_container: String,
    /// Page size of the in-memory backend's listings
    #[serde(default = "default_list_page_size")]
    pub list_page_size: usize,
    #[serde(default)]
    pub s3: S3Config,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Grant signing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GrantsConfig {
    /// Account name bound into every signature
    #[serde(default = "default_account_name")]
    pub account_name: String,
    /// Base64 account key. Without it grants cannot be issued.
    pub account_key: Option<String>,
    /// Externally reachable base URL of this service
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    /// Lifetime of the read grant on the uploaded document
    #[serde(default = "default_grant_ttl_secs")]
    pub source_ttl_secs: u64,
    /// Lifetime of the write grant on the output container
    #[serde(default = "default_grant_ttl_secs")]
    pub target_ttl_secs: u64,
}

/// Remote language service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    /// Service endpoint, e.g. `https://myresource.cognitiveservices.azure.com`
    pub endpoint: String,
    /// Subscription key
    pub api_key: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Header carrying the subscription key
    #[serde(default = "default_subscription_key_header")]
    pub subscription_key_header: String,
    /// Document language
    #[serde(default = "default_language")]
    pub language: String,
    /// PII categories to detect
    #[serde(default = "default_pii_categories")]
    pub pii_categories: Vec<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Polling and retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Delay between status polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum number of status polls per job
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    /// Overall polling deadline per job
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,
    /// Attempts for uploads and submissions, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,
    #[serde(default = "default_retry_max_interval_ms")]
    pub retry_max_interval_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Largest accepted request body
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

// Default value functions
fn default_service_name() -> String {
    "redactor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_input_container() -> String {
    "uploads".to_string()
}

fn default_output_container() -> String {
    "redacted".to_string()
}

fn default_list_page_size() -> usize {
    1000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_account_name() -> String {
    "redactor".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_grant_ttl_secs() -> u64 {
    3600
}

fn default_api_version() -> String {
    "2024-11-15-preview".to_string()
}

fn default_subscription_key_header() -> String {
    "Ocp-Apim-Subscription-Key".to_string()
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_pii_categories() -> Vec<String> {
    DEFAULT_PII_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_poll_attempts() -> u32 {
    120
}

fn default_poll_deadline_secs() -> u64 {
    600 // 10 minutes
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_interval_ms() -> u64 {
    500
}

fn default_retry_max_interval_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024 // 50MB
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "redactor")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/redactor").required(false))
            .add_source(config::File::with_name("/etc/redactor/redactor").required(false))
            // Override with environment variables
            // REDACTOR__LANGUAGE__API_KEY -> language.api_key
            .add_source(
                config::Environment::with_prefix("REDACTOR")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("language.pii_categories")
                    .with_list_parse_key("api.cors_origins"),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.language.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "language.endpoint".to_string(),
            ));
        }
        if reqwest::Url::parse(&self.language.endpoint).is_err() {
            return Err(ConfigValidationError::InvalidValue {
                field: "language.endpoint".to_string(),
                message: "must be an absolute URL".to_string(),
            });
        }
        if self.language.api_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "language.api_key".to_string(),
            ));
        }
        if self.language.pii_categories.is_empty() {
            return Err(ConfigValidationError::InvalidValue {
                field: "language.pii_categories".to_string(),
                message: "at least one category is required".to_string(),
            });
        }

        if self.storage.input_container.is_empty() || self.storage.output_container.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.input_container/output_container".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::S3
            && self.storage.s3.part_size_bytes < 5 * 1024 * 1024
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.s3.part_size_bytes".to_string(),
                message: "S3 parts must be at least 5MB".to_string(),
            });
        }

        if reqwest::Url::parse(&self.grants.public_base_url).is_err() {
            return Err(ConfigValidationError::InvalidValue {
                field: "grants.public_base_url".to_string(),
                message: "must be an absolute URL".to_string(),
            });
        }

        if self.pipeline.max_poll_attempts == 0 || self.pipeline.poll_deadline_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.max_poll_attempts/poll_deadline_secs".to_string(),
                message: "polling must be bounded by a non-zero limit".to_string(),
            });
        }
        if self.pipeline.retry_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "pipeline.retry_attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Get source grant lifetime as Duration
    pub fn source_grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grants.source_ttl_secs)
    }

    /// Get target grant lifetime as Duration
    pub fn target_grant_ttl(&self) -> Duration {
        Duration::from_secs(self.grants.target_ttl_secs)
    }
}

impl LanguageConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn poll_deadline(&self) -> Duration {
        Duration::from_secs(self.poll_deadline_secs)
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            input_container: default_input_container(),
            output_container: default_output_container(),
            list_page_size: default_list_page_size(),
            s3: S3Config::default(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

impl Default for GrantsConfig {
    fn default() -> Self {
        Self {
            account_name: default_account_name(),
            account_key: None,
            public_base_url: default_public_base_url(),
            source_ttl_secs: default_grant_ttl_secs(),
            target_ttl_secs: default_grant_ttl_secs(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_attempts: default_max_poll_attempts(),
            poll_deadline_secs: default_poll_deadline_secs(),
            retry_attempts: default_retry_attempts(),
            retry_initial_interval_ms: default_retry_initial_interval_ms(),
            retry_max_interval_ms: default_retry_max_interval_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn language_config(endpoint: &str) -> LanguageConfig {
        LanguageConfig {
            endpoint: endpoint.to_string(),
            api_key: "test-key".to_string(),
            api_version: default_api_version(),
            subscription_key_header: default_subscription_key_header(),
            language: default_language(),
            pii_categories: default_pii_categories(),
            request_timeout_secs: 5,
        }
    }

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            storage: StorageConfig::default(),
            grants: GrantsConfig::default(),
            language: language_config("https://language.example.com"),
            pipeline: PipelineConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_poll_interval_secs(), 5);
        assert_eq!(default_max_poll_attempts(), 120);
        assert_eq!(default_grant_ttl_secs(), 3600);
        assert_eq!(default_pii_categories().len(), 10);
        assert_eq!(default_subscription_key_header(), "Ocp-Apim-Subscription-Key");
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = create_test_config();
        config.language.api_key = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_relative_endpoint() {
        let mut config = create_test_config();
        config.language.endpoint = "language.example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unbounded_polling_rejected() {
        let mut config = create_test_config();
        config.pipeline.max_poll_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_small_s3_parts_rejected_only_for_s3() {
        let mut config = create_test_config();
        config.storage.s3.part_size_bytes = 1024;
        assert!(config.validate().is_err());

        config.storage.backend = StorageBackend::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_minimal_file() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [storage]
                backend = "memory"

                [language]
                endpoint = "https://language.example.com"
                api_key = "k"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.input_container, "uploads");
        assert_eq!(config.pipeline.poll_interval(), Duration::from_secs(5));
        assert!(config.grants.account_key.is_none());
    }
}
