//! S3 backend implementation
//!
//! Wraps aws-sdk-s3 and implements the StorageBackend trait from sx-core.
//! Every SDK failure is converted into a backend error carrying the service
//! error code, so the core retry layer can classify it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use jiff::Timestamp;
use sx_core::error::UNKNOWN_CODE;
use sx_core::{
    BackendConfig, BucketSummary, DeleteOutcome, DirectorySummary, Error, ListRequest, ListingPage, ObjectMeta,
    ObjectReader, ObjectRef, ObjectSummary, ObjectWriter, ProgressFn, PutOptions, Result,
    StorageBackend,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// S3 allows at most this many parts per multipart upload
const MAX_PARTS: u64 = 10_000;

/// How often in-flight requests poll the progress callback for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// S3 storage backend
pub struct S3Backend {
    inner: aws_sdk_s3::Client,
    multipart_threshold: u64,
    part_size: u64,
}

impl S3Backend {
    /// Create a new backend from the `[backend]` configuration table
    pub async fn new(config: &BackendConfig) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials = aws_credential_types::Credentials::new(
                access_key,
                secret_key,
                None, // session token
                None, // expiry
                "sx-static-credentials",
            );
            loader = loader.credentials_provider(credentials);
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.path_style)
            .build();

        tracing::debug!(
            endpoint = config.endpoint.as_deref().unwrap_or("default"),
            path_style = config.path_style,
            "S3 backend configured"
        );

        Ok(Self {
            inner: aws_sdk_s3::Client::from_conf(s3_config),
            multipart_threshold: config.multipart_threshold,
            part_size: config.part_size,
        })
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.inner
    }

    async fn put_single(
        &self,
        bucket: &str,
        key: &str,
        mut src: ObjectReader,
        size: u64,
        progress: &ProgressFn,
        options: &PutOptions,
    ) -> Result<()> {
        let mut data = Vec::with_capacity(size as usize);
        src.read_to_end(&mut data).await?;
        let sent = data.len() as u64;

        let mut request = self
            .inner
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_length(sent as i64)
            .body(ByteStream::from(data));
        if let Some(ct) = &options.content_type {
            request = request.content_type(ct);
        }

        // Dropping the request before the body is complete leaves nothing behind
        until_cancelled(
            async { request.send().await.map_err(map_sdk_error) },
            progress,
            0,
        )
        .await?;
        progress(sent);
        Ok(())
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        mut src: ObjectReader,
        size: u64,
        progress: &ProgressFn,
        options: &PutOptions,
    ) -> Result<()> {
        let mut request = self.inner.create_multipart_upload().bucket(bucket).key(key);
        if let Some(ct) = &options.content_type {
            request = request.content_type(ct);
        }
        let created = request.send().await.map_err(map_sdk_error)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::backend(UNKNOWN_CODE, "Multipart upload returned no upload id"))?
            .to_string();

        let part_size = effective_part_size(size, self.part_size);
        tracing::debug!(bucket, key, size, part_size, upload_id = %upload_id, "Started multipart upload");

        let result = self
            .upload_parts(bucket, key, &upload_id, &mut src, part_size, progress)
            .await;

        match result {
            Ok(parts) => {
                let completed = CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build();
                let outcome = self
                    .inner
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(completed)
                    .send()
                    .await
                    .map_err(map_sdk_error);
                if let Err(e) = outcome {
                    self.abort_multipart(bucket, key, &upload_id).await;
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => {
                self.abort_multipart(bucket, key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        src: &mut ObjectReader,
        part_size: u64,
        progress: &ProgressFn,
    ) -> Result<Vec<CompletedPart>> {
        let mut parts = Vec::new();
        let mut sent = 0u64;
        let mut part_number = 1i32;

        loop {
            let mut buf = Vec::with_capacity(part_size as usize);
            AsyncReadExt::take(&mut *src, part_size)
                .read_to_end(&mut buf)
                .await?;
            if buf.is_empty() && part_number > 1 {
                break;
            }
            let len = buf.len() as u64;

            let request = self
                .inner
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(len as i64)
                .body(ByteStream::from(buf));
            let response = until_cancelled(
                async { request.send().await.map_err(map_sdk_error) },
                progress,
                sent,
            )
            .await?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(response.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            sent += len;
            if !progress(sent) {
                return Err(Error::Cancelled);
            }
            if len < part_size {
                break;
            }
            part_number += 1;
        }

        Ok(parts)
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        match self
            .inner
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => tracing::debug!(bucket, key, upload_id, "Aborted multipart upload"),
            Err(e) => {
                tracing::warn!(bucket, key, upload_id, error = %map_sdk_error(e), "Failed to abort multipart upload")
            }
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn list_buckets(&self) -> Result<Vec<BucketSummary>> {
        let mut buckets = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let response = self
                .inner
                .list_buckets()
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(map_sdk_error)?;

            buckets.extend(response.buckets().iter().map(|bucket| BucketSummary {
                name: bucket.name().unwrap_or_default().to_string(),
                created: bucket
                    .creation_date()
                    .and_then(|dt| Timestamp::from_second(dt.secs()).ok()),
            }));

            match response.continuation_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(buckets)
    }

    async fn list_objects(&self, request: ListRequest) -> Result<ListingPage> {
        let mut builder = self.inner.list_objects_v2().bucket(&request.bucket);

        if !request.prefix.is_empty() {
            builder = builder.prefix(&request.prefix);
        }
        if let Some(delimiter) = &request.delimiter {
            builder = builder.delimiter(delimiter);
        }
        if let Some(max) = request.max_keys {
            builder = builder.max_keys(max);
        }
        if let Some(token) = &request.continuation_token {
            builder = builder.continuation_token(token);
        }

        let response = builder.send().await.map_err(map_sdk_error)?;

        let objects = response
            .contents()
            .iter()
            .map(|object| ObjectSummary {
                key: object.key().unwrap_or_default().to_string(),
                size: object.size().unwrap_or(0).max(0) as u64,
                last_modified: object
                    .last_modified()
                    .and_then(|dt| Timestamp::from_second(dt.secs()).ok()),
                etag: object.e_tag().map(trim_etag),
                storage_class: object.storage_class().map(|sc| sc.as_str().to_string()),
            })
            .collect();

        let prefixes = response
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix())
            .map(|p| DirectorySummary {
                prefix: p.to_string(),
            })
            .collect();

        Ok(ListingPage {
            objects,
            prefixes,
            continuation_token: response.next_continuation_token().map(str::to_string),
            is_truncated: response.is_truncated().unwrap_or(false),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let response = self
            .inner
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;

        Ok(ObjectMeta {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            content_type: response.content_type().map(str::to_string),
            etag: response.e_tag().map(trim_etag),
            last_modified: response
                .last_modified()
                .and_then(|dt| Timestamp::from_second(dt.secs()).ok()),
            storage_class: response.storage_class().map(|sc| sc.as_str().to_string()),
        })
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        mut dest: ObjectWriter,
        progress: ProgressFn,
    ) -> Result<()> {
        let response = until_cancelled(
            async {
                self.inner
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(map_sdk_error)
            },
            &progress,
            0,
        )
        .await?;

        let mut body = response.body;
        let mut received = 0u64;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| Error::backend("ConnectionError", format!("Reading body failed: {e}")))?
        {
            dest.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if !progress(received) {
                return Err(Error::Cancelled);
            }
        }

        dest.flush().await?;
        dest.shutdown().await?;
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        src: ObjectReader,
        size: u64,
        progress: ProgressFn,
        options: PutOptions,
    ) -> Result<()> {
        if size >= self.multipart_threshold {
            self.put_multipart(bucket, key, src, size, &progress, &options)
                .await
        } else {
            self.put_single(bucket, key, src, size, &progress, &options)
                .await
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.inner
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<Vec<DeleteOutcome>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let objects = keys
            .iter()
            .map(|k| {
                ObjectIdentifier::builder()
                    .key(k)
                    .build()
                    .map_err(|e| Error::backend("InvalidArgument", e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        let delete = Delete::builder()
            .set_objects(Some(objects))
            .build()
            .map_err(|e| Error::backend("InvalidArgument", e.to_string()))?;

        let response = self
            .inner
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(map_sdk_error)?;

        let mut failed: HashMap<&str, (String, String)> = HashMap::new();
        for error in response.errors() {
            if let Some(key) = error.key() {
                failed.insert(
                    key,
                    (
                        error.code().unwrap_or(UNKNOWN_CODE).to_string(),
                        error.message().unwrap_or_default().to_string(),
                    ),
                );
            }
        }
        if !failed.is_empty() {
            tracing::warn!(bucket, failed = failed.len(), "Some objects were not deleted");
        }

        Ok(keys
            .iter()
            .map(|key| match failed.get(key.as_str()) {
                Some(error) => DeleteOutcome {
                    key: key.clone(),
                    error: Some(error.clone()),
                },
                None => DeleteOutcome::deleted(key.clone()),
            })
            .collect())
    }

    async fn copy_object(&self, src: &ObjectRef, dest: &ObjectRef) -> Result<()> {
        self.inner
            .copy_object()
            .copy_source(copy_source(src))
            .bucket(&dest.bucket)
            .key(&dest.key)
            .send()
            .await
            .map_err(map_sdk_error)?;
        Ok(())
    }

    async fn presign_url(&self, bucket: &str, key: &str, expiry_secs: u64) -> Result<String> {
        let config = aws_sdk_s3::presigning::PresigningConfig::builder()
            .expires_in(Duration::from_secs(expiry_secs))
            .build()
            .map_err(|e| Error::backend("InvalidArgument", format!("presign config: {e}")))?;

        let request = self
            .inner
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(map_sdk_error)?;

        Ok(request.uri().to_string())
    }

    /// Multipart uploads are aborted on failure, single puts are all-or-nothing
    fn supports_atomic_upload(&self) -> bool {
        true
    }
}

/// Drive `fut` while polling `progress` for cancellation
async fn until_cancelled<T, F>(fut: F, progress: &ProgressFn, done: u64) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::pin!(fut);
    let mut poll = tokio::time::interval(CANCEL_POLL);
    loop {
        tokio::select! {
            result = &mut fut => return result,
            _ = poll.tick() => {
                if !progress(done) {
                    return Err(Error::Cancelled);
                }
            }
        }
    }
}

/// Convert an SDK error into a backend error tagged with the service code
pub(crate) fn map_sdk_error<E>(err: SdkError<E, HttpResponse>) -> Error
where
    E: ProvideErrorMetadata,
{
    match &err {
        SdkError::TimeoutError(_) => Error::backend("RequestTimeout", "Request timed out"),
        SdkError::DispatchFailure(failure) => {
            let code = if failure.is_timeout() {
                "RequestTimeout"
            } else {
                "ConnectionError"
            };
            Error::backend(code, format!("Network dispatch error: {failure:?}"))
        }
        SdkError::ResponseError(_) => {
            Error::backend("ConnectionError", format!("Invalid response: {err}"))
        }
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            let code = err
                .code()
                .map(str::to_string)
                .unwrap_or_else(|| status_code_name(status).to_string());
            let message = err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            Error::backend(code, message)
        }
        _ => Error::backend(UNKNOWN_CODE, err.to_string()),
    }
}

/// Error code for service responses without a body (e.g. HEAD)
fn status_code_name(status: u16) -> &'static str {
    match status {
        400 => "InvalidArgument",
        403 => "AccessDenied",
        404 => "NoSuchKey",
        408 => "RequestTimeout",
        429 => "TooManyRequests",
        500 => "InternalError",
        503 => "ServiceUnavailable",
        _ => UNKNOWN_CODE,
    }
}

/// Part size that keeps the upload within the part-count limit
fn effective_part_size(size: u64, configured: u64) -> u64 {
    configured.max(size.div_ceil(MAX_PARTS))
}

/// URL-encoded `bucket/key` for the copy-source header
fn copy_source(src: &ObjectRef) -> String {
    let key = src
        .key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", src.bucket, key)
}

fn trim_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
