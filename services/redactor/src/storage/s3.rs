use super::{ByteRange, ContentRange, ListPage, ObjectBody, ObjectStore, StorageObjectRef};
use crate::config::S3Config;
use crate::error::{Error, Resource, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::create_bucket::CreateBucketError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

/// S3-compatible object store; buckets play the role of containers
pub struct S3Store {
    client: S3Client,
    config: S3Config,
}

impl S3Store {
    /// Create a new S3 store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        if config.part_size_bytes < 5 * 1024 * 1024 {
            anyhow::bail!("S3 multipart part size must be at least 5MB");
        }

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 store initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        object: &StorageObjectRef,
        data: Bytes,
        content_type: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(&object.container)
            .key(&object.name)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| put_error(object, e))?;

        Ok(())
    }

    /// Multipart upload for large files; aborted if any part fails
    async fn multipart_upload(
        &self,
        object: &StorageObjectRef,
        data: Bytes,
        content_type: &str,
    ) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&object.container)
            .key(&object.name)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| put_error(object, e))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| {
                Error::MalformedResponse(format!("no multipart upload id for {}", object))
            })?
            .to_string();

        match self.upload_parts(object, &upload_id, data).await {
            Ok(parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(&object.container)
                    .key(&object.name)
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| put_error(object, e))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&object.container)
                    .key(&object.name)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(object = %object, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        object: &StorageObjectRef,
        upload_id: &str,
        data: Bytes,
    ) -> Result<Vec<CompletedPart>> {
        let part_size = self.config.part_size_bytes;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < data.len() {
            let end = (offset + part_size).min(data.len());
            let body = ByteStream::from(data.slice(offset..end));

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&object.container)
                .key(&object.name)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| put_error(object, e))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn ensure_container(&self, container: &str) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(container);

        // us-east-1 rejects an explicit location constraint
        if self.config.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(
                        self.config.region.as_str(),
                    ))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %container, "Created bucket");
                Ok(())
            }
            Err(e) if is_existing_bucket(e.as_service_error()) => Ok(()),
            Err(e) => Err(Error::transport(format!("create bucket {}", container), e)),
        }
    }

    #[instrument(skip(self, object, data), fields(object = %object, size_bytes = data.len()))]
    async fn put(&self, object: &StorageObjectRef, data: Bytes, content_type: &str) -> Result<()> {
        if data.len() > self.config.multipart_threshold_bytes {
            self.multipart_upload(object, data, content_type).await
        } else {
            self.simple_upload(object, data, content_type).await
        }
    }

    async fn list_page(
        &self,
        container: &str,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<ListPage> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(container)
            .set_continuation_token(continuation);

        if !prefix.is_empty() {
            request = request.prefix(prefix);
        }

        let response = request.send().await.map_err(|e| {
            if is_missing_bucket(e.as_service_error(), http_status(&e)) {
                Error::NotFound(Resource::Container {
                    container: container.to_string(),
                })
            } else {
                Error::transport(format!("list {}/{}*", container, prefix), e)
            }
        })?;

        let names = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(String::from))
            .collect();

        let continuation = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(String::from)
        } else {
            None
        };

        Ok(ListPage {
            names,
            continuation,
        })
    }

    async fn get(&self, object: &StorageObjectRef, range: Option<ByteRange>) -> Result<ObjectBody> {
        let response = self
            .client
            .get_object()
            .bucket(&object.container)
            .key(&object.name)
            .set_range(range.map(|r| r.to_string()))
            .send()
            .await
            .map_err(|e| {
                classify_get_failure(object, range, e.as_service_error(), http_status(&e))
                    .unwrap_or_else(|| Error::transport(format!("get {}", object), e))
            })?;

        let content_length = response.content_length().unwrap_or_default().max(0) as u64;
        let content_range = response.content_range().and_then(ContentRange::parse);
        let content_type = response.content_type().map(String::from);

        debug!(object = %object, content_length = content_length, "Streaming object");

        let context = format!("read {}", object);
        let stream = futures::stream::try_unfold(response.body, move |mut body| {
            let context = context.clone();
            async move {
                match body.next().await {
                    Some(Ok(chunk)) => Ok(Some((chunk, body))),
                    Some(Err(e)) => Err(Error::transport(context, e)),
                    None => Ok(None),
                }
            }
        });

        Ok(ObjectBody {
            stream: Box::pin(stream),
            content_length,
            content_range,
            content_type,
        })
    }

    async fn exists(&self, object: &StorageObjectRef) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&object.container)
            .key(&object.name)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_missing_object(e.as_service_error(), http_status(&e)) => Ok(false),
            Err(e) => Err(Error::transport(format!("head {}", object), e)),
        }
    }
}

fn http_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

/// Missing keys and unsatisfiable ranges; anything else is a transport failure
fn classify_get_failure(
    object: &StorageObjectRef,
    range: Option<ByteRange>,
    service: Option<&GetObjectError>,
    status: Option<u16>,
) -> Option<Error> {
    if service.map(GetObjectError::is_no_such_key).unwrap_or(false) || status == Some(404) {
        return Some(Error::object_not_found(&object.container, &object.name));
    }
    if status == Some(416) {
        return Some(Error::InvalidRange {
            range: range.map(|r| r.to_string()).unwrap_or_default(),
        });
    }
    None
}

// HEAD responses carry no body, so the status is all there may be
fn is_missing_object(service: Option<&HeadObjectError>, status: Option<u16>) -> bool {
    service.map(HeadObjectError::is_not_found).unwrap_or(false) || status == Some(404)
}

fn is_missing_bucket(service: Option<&ListObjectsV2Error>, status: Option<u16>) -> bool {
    service.map(ListObjectsV2Error::is_no_such_bucket).unwrap_or(false) || status == Some(404)
}

fn is_existing_bucket(service: Option<&CreateBucketError>) -> bool {
    service
        .map(|e| e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists())
        .unwrap_or(false)
}

fn put_error<E>(object: &StorageObjectRef, err: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    Error::transport(format!("put {}", object), err)
}
