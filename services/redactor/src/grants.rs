//! Scoped access grants.
//!
//! A grant is a URL carrying a signed token that allows a fixed set of
//! operations on one object (`sr=b`) or on every object of a container
//! (`sr=c`) until its expiry. Tokens are HMAC-SHA256 signatures made with the
//! storage account key, so nothing but the signature leaves the service.
//! There is no revocation: expiry is the only way a grant ends.
//!
//! ```text
//! {base}/blob/{container}[/{name}]?sv={version}&sr={b|c}&sp={racw}&se={expiry}&sig={signature}
//!
//! signature = base64(HMAC-SHA256(key, sp \n se \n /{account}/{container}[/{name}] \n sr \n sv))
//! ```

use crate::error::{Error, Result};
use crate::storage::{encode_path_component, ObjectStoreGateway, StorageObjectRef};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, SubsecRound, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

type HmacSha256 = Hmac<Sha256>;

/// Token format version carried in `sv`
pub const GRANT_VERSION: &str = "2024-01-01";

const EXPIRY_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Reasons a presented grant is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrantError {
    #[error("Missing grant parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Malformed grant parameter {field}: {value}")]
    Malformed { field: &'static str, value: String },

    #[error("Unsupported grant version: {0}")]
    UnsupportedVersion(String),

    #[error("Grant signature does not match the requested resource")]
    InvalidSignature,

    #[error("Grant expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("Grant does not allow {0}")]
    PermissionDenied(Permission),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

/// A single storage capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Add,
    Create,
    Write,
}

impl Permission {
    /// Canonical order of permission letters in a token
    const ALL: [Permission; 4] = [
        Permission::Read,
        Permission::Add,
        Permission::Create,
        Permission::Write,
    ];

    fn letter(self) -> char {
        match self {
            Permission::Read => 'r',
            Permission::Add => 'a',
            Permission::Create => 'c',
            Permission::Write => 'w',
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "read",
            Permission::Add => "add",
            Permission::Create => "create",
            Permission::Write => "write",
        };
        f.write_str(name)
    }
}

/// A set of permissions
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u8);

impl Permissions {
    pub const READ: Permissions = Permissions(1 << Permission::Read as u8);

    /// Read, add, create and write
    pub const fn all() -> Self {
        Permissions(0b1111)
    }

    pub fn with(self, permission: Permission) -> Self {
        Permissions(self.0 | permission.bit())
    }

    pub fn contains(&self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    /// Letters in canonical `racw` order
    pub fn letters(&self) -> String {
        Permission::ALL
            .iter()
            .filter(|p| self.contains(**p))
            .map(|p| p.letter())
            .collect()
    }

    /// Parse letters; they must appear in canonical order without repeats
    pub fn parse(letters: &str) -> Option<Self> {
        let parsed = letters.chars().try_fold(Permissions::default(), |acc, c| {
            Permission::ALL
                .iter()
                .find(|p| p.letter() == c)
                .map(|p| acc.with(*p))
        })?;
        (parsed.letters() == letters).then_some(parsed)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Permissions({})", self.letters())
    }
}

/// What a grant covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantScope {
    Object,
    Container,
}

impl GrantScope {
    fn code(self) -> &'static str {
        match self {
            GrantScope::Object => "b",
            GrantScope::Container => "c",
        }
    }
}

/// A signed, time-limited URL. Never logged with its signature.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessGrant {
    url: String,
    scope: GrantScope,
    permissions: Permissions,
    expires_at: DateTime<Utc>,
}

impl AccessGrant {
    /// The full signed URL. Treat as a secret.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scope(&self) -> GrantScope {
        self.scope
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The URL without its token, safe for logs
    pub fn redacted_url(&self) -> &str {
        self.url.split('?').next().unwrap_or_default()
    }
}

impl fmt::Debug for AccessGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGrant")
            .field("url", &self.redacted_url())
            .field("scope", &self.scope)
            .field("permissions", &self.permissions)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Account-key credential able to sign and check grants
pub struct SigningKey {
    account: String,
    key: Vec<u8>,
}

impl SigningKey {
    /// `key` is the base64-encoded account key
    pub fn from_base64(account: impl Into<String>, key: &str) -> Result<Self, GrantError> {
        let key = STANDARD
            .decode(key.trim())
            .map_err(|e| GrantError::InvalidKey(e.to_string()))?;
        if key.is_empty() {
            return Err(GrantError::InvalidKey("key is empty".to_string()));
        }
        Ok(Self {
            account: account.into(),
            key,
        })
    }

    fn mac(&self, string_to_sign: &str) -> Result<HmacSha256, GrantError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| GrantError::InvalidKey(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(mac)
    }

    fn sign(&self, string_to_sign: &str) -> Result<String, GrantError> {
        let mac = self.mac(string_to_sign)?;
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, string_to_sign: &str, signature: &str) -> Result<bool, GrantError> {
        let Ok(signature) = STANDARD.decode(signature) else {
            return Ok(false);
        };
        Ok(self.mac(string_to_sign)?.verify_slice(&signature).is_ok())
    }

    fn canonical_resource(&self, container: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("/{}/{}/{}", self.account, container, name),
            None => format!("/{}/{}", self.account, container),
        }
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

fn string_to_sign(permissions: &str, expiry: &str, resource: &str, scope: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}\n{}",
        permissions, expiry, resource, scope, GRANT_VERSION
    )
}

fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Issues object and container grants
pub struct GrantIssuer {
    gateway: Arc<ObjectStoreGateway>,
    key: Option<Arc<SigningKey>>,
    public_base_url: String,
    clock: Arc<dyn Clock>,
}

impl GrantIssuer {
    /// `key` is `None` when the configured credential cannot sign; every
    /// issuance then fails with `CapabilityUnsupported`.
    pub fn new(
        gateway: Arc<ObjectStoreGateway>,
        key: Option<Arc<SigningKey>>,
        public_base_url: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway,
            key,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            clock,
        }
    }

    /// Grant access to a single object for `ttl` from now
    #[instrument(skip(self, object), fields(object = %object))]
    pub fn issue_object_grant(
        &self,
        object: &StorageObjectRef,
        ttl: Duration,
        permissions: Permissions,
    ) -> Result<AccessGrant> {
        let key = self.signing_key()?;
        let url_path = format!(
            "{}/blob/{}",
            self.public_base_url,
            object.url_path()
        );
        let resource = key.canonical_resource(&object.container, Some(&object.name));

        self.sign(key, url_path, resource, GrantScope::Object, ttl, permissions)
    }

    /// Grant access to every object in a container for `ttl` from now.
    /// The container is created first if needed.
    #[instrument(skip(self))]
    pub async fn issue_container_grant(
        &self,
        container: &str,
        ttl: Duration,
        permissions: Permissions,
    ) -> Result<AccessGrant> {
        let key = self.signing_key()?;

        self.gateway.ensure_container(container).await?;

        let url_path = format!(
            "{}/blob/{}",
            self.public_base_url,
            encode_path_component(container)
        );
        let resource = key.canonical_resource(container, None);

        self.sign(key, url_path, resource, GrantScope::Container, ttl, permissions)
    }

    fn signing_key(&self) -> Result<&SigningKey> {
        self.key.as_deref().ok_or_else(|| {
            Error::CapabilityUnsupported(
                "storage credential has no account key to sign grants with".to_string(),
            )
        })
    }

    fn sign(
        &self,
        key: &SigningKey,
        url_path: String,
        resource: String,
        scope: GrantScope,
        ttl: Duration,
        permissions: Permissions,
    ) -> Result<AccessGrant> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| {
            Error::CapabilityUnsupported(format!("grant lifetime {:?} is out of range", ttl))
        })?;

        // Second precision: the window is never longer than requested
        let expires_at = self.clock.now().trunc_subsecs(0) + ttl;
        let expiry = expires_at.format(EXPIRY_FORMAT).to_string();
        let letters = permissions.letters();

        let signature = key.sign(&string_to_sign(&letters, &expiry, &resource, scope.code()))?;

        let url = format!(
            "{}?sv={}&sr={}&sp={}&se={}&sig={}",
            url_path,
            GRANT_VERSION,
            scope.code(),
            letters,
            encode_query_value(&expiry),
            encode_query_value(&signature)
        );

        metrics::counter!("redactor.grants.issued", "scope" => scope.code()).increment(1);
        debug!(scope = ?scope, permissions = %letters, expires_at = %expires_at, "Issued grant");

        Ok(AccessGrant {
            url,
            scope,
            permissions,
            expires_at,
        })
    }
}

/// Grant token fields as they arrive in a query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GrantParams {
    pub sv: Option<String>,
    pub sr: Option<String>,
    pub sp: Option<String>,
    pub se: Option<String>,
    pub sig: Option<String>,
}

/// Checks grants presented to the store
pub struct GrantVerifier {
    key: Arc<SigningKey>,
    clock: Arc<dyn Clock>,
}

impl GrantVerifier {
    pub fn new(key: Arc<SigningKey>, clock: Arc<dyn Clock>) -> Self {
        Self { key, clock }
    }

    /// Validate a grant for access to `object` and return what it allows.
    ///
    /// Fails if the signature does not cover the object, or if the grant has
    /// expired. Permissions are checked by the caller (see [`Self::authorize`]).
    pub fn validate(
        &self,
        params: &GrantParams,
        object: &StorageObjectRef,
    ) -> Result<Permissions, GrantError> {
        let version = params
            .sv
            .as_deref()
            .ok_or(GrantError::MissingParameter("sv"))?;
        if version != GRANT_VERSION {
            return Err(GrantError::UnsupportedVersion(version.to_string()));
        }

        let scope = params.sr.as_deref().ok_or(GrantError::MissingParameter("sr"))?;
        let letters = params.sp.as_deref().ok_or(GrantError::MissingParameter("sp"))?;
        let expiry = params.se.as_deref().ok_or(GrantError::MissingParameter("se"))?;
        let signature = params
            .sig
            .as_deref()
            .ok_or(GrantError::MissingParameter("sig"))?;

        let resource = match scope {
            "b" => self
                .key
                .canonical_resource(&object.container, Some(&object.name)),
            "c" => self.key.canonical_resource(&object.container, None),
            other => {
                return Err(GrantError::Malformed {
                    field: "sr",
                    value: other.to_string(),
                })
            }
        };

        let permissions = Permissions::parse(letters).ok_or_else(|| GrantError::Malformed {
            field: "sp",
            value: letters.to_string(),
        })?;

        let expires_at = DateTime::parse_from_rfc3339(expiry)
            .map_err(|_| GrantError::Malformed {
                field: "se",
                value: expiry.to_string(),
            })?
            .with_timezone(&Utc);

        if !self
            .key
            .verify(&string_to_sign(letters, expiry, &resource, scope), signature)?
        {
            metrics::counter!("redactor.grants.rejected", "reason" => "signature").increment(1);
            return Err(GrantError::InvalidSignature);
        }

        if self.clock.now() >= expires_at {
            metrics::counter!("redactor.grants.rejected", "reason" => "expired").increment(1);
            return Err(GrantError::Expired(expires_at));
        }

        Ok(permissions)
    }

    /// Validate a grant and require one permission
    pub fn authorize(
        &self,
        params: &GrantParams,
        object: &StorageObjectRef,
        required: Permission,
    ) -> Result<Permissions, GrantError> {
        let permissions = self.validate(params, object)?;
        if !permissions.contains(required) {
            metrics::counter!("redactor.grants.rejected", "reason" => "permission").increment(1);
            return Err(GrantError::PermissionDenied(required));
        }
        Ok(permissions)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Clock that only moves when told to
    pub(crate) struct FakeClock(Mutex<DateTime<Utc>>);

    impl FakeClock {
        pub(crate) fn at(time: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(time)))
        }

        pub(crate) fn advance(&self, by: Duration) {
            let mut now = self.0.lock();
            *now = *now + chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    pub(crate) const TEST_KEY: &str = "c2VjcmV0LWFjY291bnQta2V5LWZvci10ZXN0cw==";

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (GrantIssuer, GrantVerifier, Arc<FakeClock>) {
        let clock = FakeClock::at(start());
        let key = Arc::new(SigningKey::from_base64("acct", TEST_KEY).unwrap());
        let gateway = Arc::new(ObjectStoreGateway::new(Arc::new(MemoryStore::new())));
        let issuer = GrantIssuer::new(
            gateway,
            Some(key.clone()),
            "https://redactor.example/",
            clock.clone(),
        );
        let verifier = GrantVerifier::new(key, clock.clone());
        (issuer, verifier, clock)
    }

    /// Token fields of a grant URL
    pub(crate) fn params_of(grant: &AccessGrant) -> GrantParams {
        let url = reqwest::Url::parse(grant.url()).unwrap();
        let mut params = GrantParams::default();
        for (key, value) in url.query_pairs() {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "sv" => params.sv = value,
                "sr" => params.sr = value,
                "sp" => params.sp = value,
                "se" => params.se = value,
                "sig" => params.sig = value,
                _ => {}
            }
        }
        params
    }

    #[test]
    fn test_object_grant_allows_read_until_expiry() {
        let (issuer, verifier, clock) = setup();
        let object = StorageObjectRef::new("uploads", "abc_report 1.pdf");

        let grant = issuer
            .issue_object_grant(&object, Duration::from_secs(600), Permissions::READ)
            .unwrap();

        assert_eq!(grant.scope(), GrantScope::Object);
        assert_eq!(grant.expires_at(), start() + chrono::Duration::seconds(600));
        assert!(grant
            .url()
            .starts_with("https://redactor.example/blob/uploads/abc_report%201.pdf?sv="));

        let params = params_of(&grant);
        assert_ok!(verifier.authorize(&params, &object, Permission::Read));

        clock.advance(Duration::from_secs(599));
        assert_ok!(verifier.authorize(&params, &object, Permission::Read));

        clock.advance(Duration::from_secs(1));
        assert!(matches!(
            verifier.authorize(&params, &object, Permission::Read),
            Err(GrantError::Expired(_))
        ));
    }

    #[test]
    fn test_zero_ttl_grant_is_unusable_immediately() {
        let (issuer, verifier, _clock) = setup();
        let object = StorageObjectRef::new("uploads", "a.pdf");

        let grant = issuer
            .issue_object_grant(&object, Duration::ZERO, Permissions::READ)
            .unwrap();

        assert!(matches!(
            verifier.authorize(&params_of(&grant), &object, Permission::Read),
            Err(GrantError::Expired(_))
        ));
    }

    #[test]
    fn test_object_grant_does_not_cover_other_objects() {
        let (issuer, verifier, _clock) = setup();
        let object = StorageObjectRef::new("uploads", "a.pdf");
        let grant = issuer
            .issue_object_grant(&object, Duration::from_secs(60), Permissions::READ)
            .unwrap();

        let other = StorageObjectRef::new("uploads", "b.pdf");
        assert_eq!(
            verifier.authorize(&params_of(&grant), &other, Permission::Read),
            Err(GrantError::InvalidSignature)
        );
    }

    #[test]
    fn test_object_grant_denies_write() {
        let (issuer, verifier, _clock) = setup();
        let object = StorageObjectRef::new("uploads", "a.pdf");
        let grant = issuer
            .issue_object_grant(&object, Duration::from_secs(60), Permissions::READ)
            .unwrap();

        assert_eq!(
            verifier.authorize(&params_of(&grant), &object, Permission::Write),
            Err(GrantError::PermissionDenied(Permission::Write))
        );
    }

    #[tokio::test]
    async fn test_container_grant_covers_every_name() {
        let (issuer, verifier, _clock) = setup();
        let grant = issuer
            .issue_container_grant("redacted", Duration::from_secs(60), Permissions::all())
            .await
            .unwrap();

        assert_eq!(grant.scope(), GrantScope::Container);
        assert_eq!(grant.permissions().letters(), "racw");

        let params = params_of(&grant);
        for name in ["job-1/out.pdf", "job-1/meta.json"] {
            let object = StorageObjectRef::new("redacted", name);
            assert_ok!(verifier.authorize(&params, &object, Permission::Write));
        }

        let elsewhere = StorageObjectRef::new("uploads", "job-1/out.pdf");
        assert_eq!(
            verifier.authorize(&params, &elsewhere, Permission::Read),
            Err(GrantError::InvalidSignature)
        );
    }

    #[tokio::test]
    async fn test_container_grant_creates_container() {
        let (issuer, _verifier, _clock) = setup();
        issuer
            .issue_container_grant("new-container", Duration::from_secs(60), Permissions::all())
            .await
            .unwrap();

        assert!(issuer.gateway.list("new-container", "").await.unwrap().is_empty());
    }

    #[test]
    fn test_tampered_permissions_are_rejected() {
        let (issuer, verifier, _clock) = setup();
        let object = StorageObjectRef::new("uploads", "a.pdf");
        let grant = issuer
            .issue_object_grant(&object, Duration::from_secs(60), Permissions::READ)
            .unwrap();

        let mut params = params_of(&grant);
        params.sp = Some("rw".to_string());

        assert_eq!(
            verifier.authorize(&params, &object, Permission::Write),
            Err(GrantError::InvalidSignature)
        );
    }

    #[test]
    fn test_extended_expiry_is_rejected() {
        let (issuer, verifier, clock) = setup();
        let object = StorageObjectRef::new("uploads", "a.pdf");
        let grant = issuer
            .issue_object_grant(&object, Duration::from_secs(60), Permissions::READ)
            .unwrap();

        clock.advance(Duration::from_secs(120));
        let mut params = params_of(&grant);
        params.se = Some("2099-01-01T00:00:00Z".to_string());

        assert_eq!(
            verifier.authorize(&params, &object, Permission::Read),
            Err(GrantError::InvalidSignature)
        );
    }

    #[test]
    fn test_missing_parameters() {
        let (_issuer, verifier, _clock) = setup();
        let object = StorageObjectRef::new("uploads", "a.pdf");

        assert_eq!(
            verifier.validate(&GrantParams::default(), &object),
            Err(GrantError::MissingParameter("sv"))
        );
    }

    #[tokio::test]
    async fn test_without_key_grants_are_unsupported() {
        let gateway = Arc::new(ObjectStoreGateway::new(Arc::new(MemoryStore::new())));
        let issuer = GrantIssuer::new(gateway, None, "https://x", Arc::new(SystemClock));
        let object = StorageObjectRef::new("uploads", "a.pdf");

        assert!(matches!(
            issuer.issue_object_grant(&object, Duration::from_secs(60), Permissions::READ),
            Err(Error::CapabilityUnsupported(_))
        ));
        assert!(matches!(
            issuer
                .issue_container_grant("out", Duration::from_secs(60), Permissions::all())
                .await,
            Err(Error::CapabilityUnsupported(_))
        ));
    }

    #[test]
    fn test_permissions_parse() {
        assert_eq!(Permissions::parse("r"), Some(Permissions::READ));
        assert_eq!(Permissions::parse("racw"), Some(Permissions::all()));
        assert_eq!(Permissions::parse("wr"), None);
        assert_eq!(Permissions::parse("rr"), None);
        assert_eq!(Permissions::parse("x"), None);
    }

    #[test]
    fn test_debug_output_hides_signature() {
        let (issuer, _verifier, _clock) = setup();
        let grant = issuer
            .issue_object_grant(
                &StorageObjectRef::new("uploads", "a.pdf"),
                Duration::from_secs(60),
                Permissions::READ,
            )
            .unwrap();

        let printed = format!("{:?}", grant);
        assert!(!printed.contains("sig="));
        assert!(printed.contains("/blob/uploads/a.pdf"));
    }

    #[test]
    fn test_invalid_key_is_rejected() {
        assert_err!(SigningKey::from_base64("acct", "not base64!"));
        assert_err!(SigningKey::from_base64("acct", ""));
    }
}
