//! Object storage gateway.
//!
//! [`ObjectStoreGateway`] is what the rest of the service talks to. It owns
//! naming (every upload gets a fresh UUID prefix), buffering and pagination,
//! and delegates the actual I/O to an [`ObjectStore`] backend:
//!
//! - [`s3::S3Store`] for S3-compatible storage (buckets are containers)
//! - [`memory::MemoryStore`] for tests and local development

pub mod memory;
pub mod s3;

use crate::error::{BoxError, Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Characters left as-is in a URL path segment. `/` is escaped so a whole
/// object name is one segment and URL parsers never resolve `.`/`..` in it.
const SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Identifies a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageObjectRef {
    pub container: String,
    pub name: String,
}

impl StorageObjectRef {
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            name: name.into(),
        }
    }

    /// `container/name` percent-encoded for use in a URL path. The name is
    /// a single segment, separators included.
    pub fn url_path(&self) -> String {
        format!(
            "{}/{}",
            encode_path_component(&self.container),
            encode_path_component(&self.name)
        )
    }

    /// Map a storage URL back to an object reference.
    ///
    /// Accepts this service's grant-checked form (`…/blob/{container}/{name}`)
    /// and plain `…/{container}/{name}` URLs. Query strings are ignored.
    pub fn from_location(location: &str) -> Option<Self> {
        let url = reqwest::Url::parse(location).ok()?;
        let segments: Vec<&str> = url.path_segments()?.collect();

        let rest = match segments.iter().position(|s| *s == "blob") {
            Some(idx) => &segments[idx + 1..],
            None => &segments[..],
        };

        let (container, name) = rest.split_first()?;
        if container.is_empty() || name.is_empty() || name.iter().all(|s| s.is_empty()) {
            return None;
        }

        let container = percent_decode_str(container).decode_utf8().ok()?.into_owned();
        let name = percent_decode_str(&name.join("/"))
            .decode_utf8()
            .ok()?
            .into_owned();

        Some(Self { container, name })
    }
}

impl fmt::Display for StorageObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// Percent-encode a single path segment (no `/` allowed through)
pub fn encode_path_component(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT_ENCODE_SET).to_string()
}

/// A byte range as requested through an HTTP `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=start-`
    From(u64),
    /// `bytes=start-end`, end inclusive
    Span { start: u64, end: u64 },
    /// `bytes=-len`
    Suffix(u64),
}

impl ByteRange {
    /// Parse a single-range `Range` header value. Multi-range requests are
    /// not supported and yield `None` (the caller serves the whole object).
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?;
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, false) => end.parse().ok().map(ByteRange::Suffix),
            (false, true) => start.parse().ok().map(ByteRange::From),
            (false, false) => {
                let start: u64 = start.parse().ok()?;
                let end: u64 = end.parse().ok()?;
                (start <= end).then_some(ByteRange::Span { start, end })
            }
            (true, true) => None,
        }
    }

    /// Resolve against an object size into an inclusive `(start, end)` pair
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        match *self {
            ByteRange::From(start) => (start < size).then_some((start, size - 1)),
            ByteRange::Span { start, end } => (start < size).then_some((start, end.min(size - 1))),
            ByteRange::Suffix(len) => (len > 0).then(|| (size - len.min(size), size - 1)),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteRange::From(start) => write!(f, "bytes={}-", start),
            ByteRange::Span { start, end } => write!(f, "bytes={}-{}", start, end),
            ByteRange::Suffix(len) => write!(f, "bytes=-{}", len),
        }
    }
}

/// The range actually served, as reported in `Content-Range`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

impl ContentRange {
    /// Parse `bytes start-end/total`
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes ")?;
        let (range, total) = spec.split_once('/')?;
        let (start, end) = range.split_once('-')?;
        Some(Self {
            start: start.parse().ok()?,
            end: end.parse().ok()?,
            total: total.parse().ok()?,
        })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// A streaming object body
pub struct ObjectBody {
    pub stream: BodyStream,
    /// Number of bytes the stream will yield
    pub content_length: u64,
    /// Set when only part of the object is being served
    pub content_range: Option<ContentRange>,
    pub content_type: Option<String>,
}

impl ObjectBody {
    /// Drain the stream into memory
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(self.content_length as usize);
        while let Some(chunk) = self.stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// One page of a container listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub names: Vec<String>,
    /// Token for the next page; `None` on the last page
    pub continuation: Option<String>,
}

/// Storage backend operations. Implementations never retry internally.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the container if it does not exist yet
    async fn ensure_container(&self, container: &str) -> Result<()>;

    /// Store an object, replacing any existing one with the same name
    async fn put(&self, object: &StorageObjectRef, data: Bytes, content_type: &str) -> Result<()>;

    /// List one page of names under `prefix`
    async fn list_page(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage>;

    /// Stream an object, optionally a single byte range of it
    async fn get(&self, object: &StorageObjectRef, range: Option<ByteRange>) -> Result<ObjectBody>;

    async fn exists(&self, object: &StorageObjectRef) -> Result<bool>;
}

/// Uploads, lists and streams documents
pub struct ObjectStoreGateway {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreGateway {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Upload a document under a collision-free name.
    ///
    /// The whole stream is buffered before the upload starts: request body
    /// streams cannot be replayed, so a failed upload could not be retried
    /// otherwise. File size is bounded by available memory.
    #[instrument(skip_all, fields(container = %container, desired_name = %desired_name))]
    pub async fn upload<S, E>(
        &self,
        data: S,
        desired_name: &str,
        container: &str,
    ) -> Result<StorageObjectRef>
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send,
        E: Into<BoxError>,
    {
        self.store.ensure_container(container).await?;

        let object = StorageObjectRef::new(container, unique_name(desired_name));

        let mut buffer = BytesMut::new();
        futures::pin_mut!(data);
        while let Some(chunk) = data.next().await {
            let chunk = chunk
                .map_err(|e| Error::transport(format!("read upload body for {}", object), e))?;
            buffer.extend_from_slice(&chunk);
        }
        let size = buffer.len();

        self.store
            .put(&object, buffer.freeze(), content_type_for(&object.name))
            .await?;

        metrics::counter!("redactor.uploads").increment(1);
        metrics::counter!("redactor.bytes.uploaded").increment(size as u64);

        info!(object = %object, size_bytes = size, "Document uploaded");

        Ok(object)
    }

    /// Store bytes under an exact name (no prefixing)
    pub async fn put(&self, object: &StorageObjectRef, data: Bytes) -> Result<()> {
        self.store
            .put(object, data, content_type_for(&object.name))
            .await
    }

    /// List every name in a container, following continuation tokens
    #[instrument(skip(self))]
    pub async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation = None;
        let mut pages = 0u32;

        loop {
            let page = self
                .store
                .list_page(container, prefix, continuation.take())
                .await?;
            pages += 1;
            names.extend(page.names);

            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        debug!(count = names.len(), pages = pages, "Listed container");

        Ok(names)
    }

    /// Stream an object; `NotFound` when it does not exist
    #[instrument(skip(self, object), fields(object = %object))]
    pub async fn download(
        &self,
        object: &StorageObjectRef,
        range: Option<ByteRange>,
    ) -> Result<ObjectBody> {
        self.store.get(object, range).await
    }

    pub async fn exists(&self, object: &StorageObjectRef) -> Result<bool> {
        self.store.exists(object).await
    }

    pub async fn ensure_container(&self, container: &str) -> Result<()> {
        self.store.ensure_container(container).await
    }
}

/// `{uuid}_{desired_name}`
fn unique_name(desired_name: &str) -> String {
    format!("{}_{}", Uuid::new_v4(), desired_name)
}

/// Get content type for a document name
pub fn content_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;
    use std::collections::HashSet;
    use std::convert::Infallible;

    fn gateway_with_page_size(page_size: usize) -> ObjectStoreGateway {
        ObjectStoreGateway::new(Arc::new(MemoryStore::with_page_size(page_size)))
    }

    fn once(data: &'static [u8]) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> {
        futures::stream::once(async move { Ok(Bytes::from_static(data)) })
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trips() {
        let gateway = gateway_with_page_size(100);
        let chunks = futures::stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from_static(b"%PDF-1.7 ")),
            Ok(Bytes::from_static(b"contents")),
        ]);

        let object = gateway
            .upload(chunks, "quarterly report #2 (final)%.pdf", "uploads")
            .await
            .unwrap();

        let body = gateway.download(&object, None).await.unwrap();
        assert_eq!(body.content_length, 17);
        assert_eq!(body.collect().await.unwrap(), Bytes::from_static(b"%PDF-1.7 contents"));
    }

    #[tokio::test]
    async fn test_upload_prefixes_fresh_identifier() {
        let gateway = gateway_with_page_size(100);

        let first = gateway.upload(once(b"a"), "report.pdf", "uploads").await.unwrap();
        let second = gateway.upload(once(b"b"), "report.pdf", "uploads").await.unwrap();

        assert_ne!(first.name, second.name);
        for object in [&first, &second] {
            let (prefix, rest) = object.name.split_once('_').unwrap();
            assert!(Uuid::parse_str(prefix).is_ok());
            assert_eq!(rest, "report.pdf");
        }
    }

    #[tokio::test]
    async fn test_upload_creates_missing_container() {
        let gateway = gateway_with_page_size(100);
        gateway.upload(once(b"x"), "a.pdf", "fresh").await.unwrap();
        assert_eq!(gateway.list("fresh", "").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_surfaces_body_errors() {
        let gateway = gateway_with_page_size(100);
        let failing = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(std::io::Error::other("client went away")),
        ]);

        let err = gateway.upload(failing, "a.pdf", "uploads").await.unwrap_err();
        assert!(matches!(err, Error::TransportFailure { .. }));
        assert!(gateway.list("uploads", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_follows_pagination() {
        let gateway = gateway_with_page_size(1000);
        gateway.ensure_container("bulk").await.unwrap();
        for i in 0..1500 {
            let object = StorageObjectRef::new("bulk", format!("doc-{:05}.pdf", i));
            gateway.put(&object, Bytes::from_static(b"x")).await.unwrap();
        }

        let names = gateway.list("bulk", "").await.unwrap();
        let distinct: HashSet<_> = names.iter().collect();

        assert_eq!(names.len(), 1500);
        assert_eq!(distinct.len(), 1500);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let gateway = gateway_with_page_size(2);
        gateway.ensure_container("c").await.unwrap();
        for name in ["a/1", "a/2", "a/3", "b/1"] {
            gateway
                .put(&StorageObjectRef::new("c", name), Bytes::new())
                .await
                .unwrap();
        }

        assert_eq!(gateway.list("c", "a/").await.unwrap(), vec!["a/1", "a/2", "a/3"]);
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let gateway = gateway_with_page_size(100);
        gateway.ensure_container("uploads").await.unwrap();

        let err = gateway
            .download(&StorageObjectRef::new("uploads", "nope.pdf"), None)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(!matches!(err, Error::TransportFailure { .. }));
    }

    #[tokio::test]
    async fn test_download_range() {
        let gateway = gateway_with_page_size(100);
        let object = gateway.upload(once(b"0123456789"), "a.pdf", "c").await.unwrap();

        let body = gateway
            .download(&object, Some(ByteRange::Span { start: 2, end: 5 }))
            .await
            .unwrap();

        assert_eq!(
            body.content_range,
            Some(ContentRange { start: 2, end: 5, total: 10 })
        );
        assert_eq!(body.collect().await.unwrap(), Bytes::from_static(b"2345"));
    }

    #[test]
    fn test_byte_range_parse() {
        assert_eq!(ByteRange::parse("bytes=0-99"), Some(ByteRange::Span { start: 0, end: 99 }));
        assert_eq!(ByteRange::parse("bytes=100-"), Some(ByteRange::From(100)));
        assert_eq!(ByteRange::parse("bytes=-500"), Some(ByteRange::Suffix(500)));
        assert_eq!(ByteRange::parse("bytes=5-1"), None);
        assert_eq!(ByteRange::parse("bytes=0-1,4-5"), None);
        assert_eq!(ByteRange::parse("items=0-1"), None);
    }

    #[test]
    fn test_byte_range_resolve() {
        assert_eq!(ByteRange::From(3).resolve(10), Some((3, 9)));
        assert_eq!(ByteRange::Span { start: 8, end: 20 }.resolve(10), Some((8, 9)));
        assert_eq!(ByteRange::Suffix(4).resolve(10), Some((6, 9)));
        assert_eq!(ByteRange::Suffix(40).resolve(10), Some((0, 9)));
        assert_eq!(ByteRange::From(10).resolve(10), None);
        assert_eq!(ByteRange::Suffix(0).resolve(10), None);
    }

    #[test]
    fn test_content_range_parse() {
        assert_eq!(
            ContentRange::parse("bytes 0-99/1000"),
            Some(ContentRange { start: 0, end: 99, total: 1000 })
        );
        assert_eq!(ContentRange::parse("bytes */1000"), None);
    }

    #[test]
    fn test_url_path_encodes_reserved_characters() {
        let object = StorageObjectRef::new("uploads", "dir/a b#1?.pdf");
        assert_eq!(object.url_path(), "uploads/dir%2Fa%20b%231%3F.pdf");
    }

    #[test]
    fn test_dot_segments_survive_url_parsing() {
        for name in ["id_a/../b.pdf", "id_./x.pdf", "id_a//b.pdf"] {
            let object = StorageObjectRef::new("uploads", name);
            let location = format!("https://redactor.local/blob/{}", object.url_path());

            assert_eq!(StorageObjectRef::from_location(&location), Some(object));
        }
    }

    #[test]
    fn test_from_location() {
        let ours = StorageObjectRef::from_location(
            "https://redactor.local/blob/redacted/job-1/a%20b.pdf?sv=2024-01-01&sig=x",
        );
        assert_eq!(ours, Some(StorageObjectRef::new("redacted", "job-1/a b.pdf")));

        let plain = StorageObjectRef::from_location("https://acct.blob.example/out/x.pdf");
        assert_eq!(plain, Some(StorageObjectRef::new("out", "x.pdf")));

        assert_eq!(StorageObjectRef::from_location("https://host/only-container"), None);
        assert_eq!(StorageObjectRef::from_location("not a url"), None);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.PDF"), "application/pdf");
        assert_eq!(
            content_type_for("b.docx"),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        );
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
