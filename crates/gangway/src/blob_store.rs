use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{RequestChecksumCalculation, ResponseChecksumValidation};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types::byte_stream::ByteStream;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::{Config, S3Config};

/// Part size for multipart transfers. S3 requires every part except the
/// last to be at least 5 MiB.
const PART_SIZE: usize = 8 * 1024 * 1024;
/// Read granularity when streaming bodies into the backend.
const READ_CHUNK: usize = 64 * 1024;

/// Byte source for upload operations.
pub type BlobReader<'a> = dyn tokio::io::AsyncRead + Unpin + Send + 'a;
/// Byte sink for download operations.
pub type BlobWriter<'a> = dyn tokio::io::AsyncWrite + Unpin + Send + 'a;
/// Callback invoked with cumulative bytes committed to the backend.
pub type CommitCallback = Box<dyn Fn(u64) + Send + Sync>;

/// Errors from the blob storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The blob does not exist.
    #[error("not found")]
    NotFound,

    /// The backend did not answer within the operation deadline.
    #[error("storage backend timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Any other backend failure, carrying the backend's own message.
    #[error("{0}")]
    Backend(String),
}

/// Metadata for a single blob.
#[derive(Debug, Clone)]
pub struct BlobStat {
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// One entry in a namespace listing. `path` is the backend's own key.
#[derive(Debug, Clone)]
pub struct BlobEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Narrow client interface to the external blob storage backend.
///
/// Callers bound every operation with [`with_deadline`]; implementations map
/// a missing blob to [`StoreError::NotFound`] rather than an opaque failure.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create an empty blob, replacing any existing content under the name.
    async fn create_blob(&self, ns: &str, name: &str) -> Result<(), StoreError>;

    /// Stream the reader's bytes into a blob, returning bytes written.
    async fn append_from(
        &self,
        ns: &str,
        name: &str,
        reader: &mut BlobReader<'_>,
    ) -> Result<u64, StoreError>;

    /// Prepare a size-declared upload so the backend can pick its write
    /// strategy up front and report commit progress while streaming.
    async fn prepare_sized_upload(
        &self,
        ns: &str,
        name: &str,
        total: u64,
    ) -> Result<Box<dyn SizedUpload>, StoreError>;

    /// Stream a blob's bytes into the writer, returning bytes copied.
    async fn read_into(
        &self,
        ns: &str,
        name: &str,
        writer: &mut BlobWriter<'_>,
    ) -> Result<u64, StoreError>;

    /// Fetch size and timestamps for a single blob.
    async fn stat_blob(&self, ns: &str, name: &str) -> Result<BlobStat, StoreError>;

    /// List blobs under a namespace whose names start with `prefix`.
    async fn list_blobs(&self, ns: &str, prefix: &str) -> Result<Vec<BlobEntry>, StoreError>;

    /// Delete a blob. Removing a missing blob is not an error, which keeps
    /// multi-blob purge retries idempotent.
    async fn delete_blob(&self, ns: &str, name: &str) -> Result<(), StoreError>;
}

/// Handle for one size-declared upload.
#[async_trait]
pub trait SizedUpload: Send {
    /// Install a callback invoked with cumulative bytes committed to the
    /// backend — not bytes read off the wire.
    fn on_progress(&mut self, callback: CommitCallback);

    /// Stream the upload body into the backend, returning bytes written.
    /// A body longer than the declared size fails without being drained.
    async fn append_from(&mut self, reader: &mut BlobReader<'_>) -> Result<u64, StoreError>;
}

/// Run a storage call under a deadline, mapping elapsed time to
/// [`StoreError::Timeout`].
pub async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

fn backend_err<E>(op: &str, bucket: &str, key: &str, err: &SdkError<E>) -> StoreError
where
    E: ProvideErrorMetadata,
{
    let code = err.code().unwrap_or("unknown");
    let message = err.message().unwrap_or("unknown");
    StoreError::Backend(format!(
        "s3 {op} failed for bucket={bucket} key={key}: code={code} message={message}"
    ))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    if let SdkError::ServiceError(service_err) = err {
        service_err.raw().status().as_u16() == 404
    } else {
        false
    }
}

fn timestamp_to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now)
}

/// S3-compatible blob store (works against R2, MinIO, and plain S3).
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BlobStore {
    pub async fn new(config: &S3Config) -> Result<Self, StoreError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| StoreError::Backend("S3_ENDPOINT is not set".to_string()))?;
        let access_key_id = config
            .access_key_id
            .clone()
            .ok_or_else(|| StoreError::Backend("S3_ACCESS_KEY_ID is not set".to_string()))?;
        let secret_access_key = config
            .secret_access_key
            .clone()
            .ok_or_else(|| StoreError::Backend("S3_SECRET_ACCESS_KEY is not set".to_string()))?;

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key_id,
                secret_access_key,
                None,
                None,
                "gangway-s3",
            ))
            .endpoint_url(endpoint)
            .load()
            .await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            // Some S3-compatible stores reject the optional checksum behavior
            // of newer SDK defaults.
            .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
            .response_checksum_validation(ResponseChecksumValidation::WhenRequired)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn blob_key(&self, ns: &str, name: &str) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}", ns, name)
        } else {
            format!("{}/{}/{}", self.prefix, ns, name)
        }
    }
}

/// Best-effort abort of an open multipart session.
async fn abort_multipart(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    if let Err(e) = client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await
    {
        tracing::warn!(key = %key, error = %e, "failed to abort multipart upload");
    }
}

/// Aborts an open multipart session on drop unless disarmed. The abort runs
/// from a detached task, so a stream future dropped at an await point (a hit
/// deadline, a vanished client) still cleans up its session.
struct MultipartGuard {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    armed: bool,
}

impl MultipartGuard {
    fn new(client: &Client, bucket: &str, key: &str, upload_id: &str) -> Self {
        Self {
            client: client.clone(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for MultipartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        tokio::spawn(async move {
            abort_multipart(&client, &bucket, &key, &upload_id).await;
        });
    }
}

/// Start a multipart upload and return its id.
async fn init_multipart(client: &Client, bucket: &str, key: &str) -> Result<String, StoreError> {
    let response = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| backend_err("multipart init", bucket, key, &e))?;
    response
        .upload_id()
        .map(|id| id.to_string())
        .ok_or_else(|| StoreError::Backend("s3 multipart init returned no upload_id".to_string()))
}

/// Stream `reader` into an open multipart upload, invoking `on_commit` with
/// the cumulative byte count after each part the backend has accepted.
/// `initial` holds bytes already read off the wire by the caller; `limit`
/// caps the body when the caller declared a size. Until the upload
/// completes, a [`MultipartGuard`] keeps the session from leaking: every
/// early return and every drop of this future aborts it.
async fn multipart_stream(
    client: &Client,
    bucket: &str,
    key: &str,
    upload_id: &str,
    initial: Vec<u8>,
    limit: Option<u64>,
    reader: &mut BlobReader<'_>,
    on_commit: Option<&CommitCallback>,
) -> Result<u64, StoreError> {
    let mut guard = MultipartGuard::new(client, bucket, key, upload_id);
    let mut part_data = initial;
    let mut received = part_data.len() as u64;
    let mut parts: Vec<CompletedPart> = Vec::new();
    let mut part_number: i32 = 1;
    let mut committed: u64 = 0;
    let mut buf = vec![0u8; READ_CHUNK];

    let mut eof = false;
    while !eof {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| StoreError::Backend(format!("reading upload body failed: {e}")))?;
        if n == 0 {
            eof = true;
        } else {
            received += n as u64;
            if let Some(limit) = limit
                && received > limit
            {
                return Err(StoreError::Backend(format!(
                    "upload body exceeds declared size of {limit} bytes"
                )));
            }
            part_data.extend_from_slice(&buf[..n]);
        }
        if part_data.len() >= PART_SIZE || (eof && !part_data.is_empty()) {
            let data = std::mem::take(&mut part_data);
            let len = data.len() as u64;
            let response = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data))
                .send()
                .await
                .map_err(|e| backend_err("multipart part upload", bucket, key, &e))?;
            parts.push(
                CompletedPart::builder()
                    .e_tag(response.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;
            committed += len;
            if let Some(callback) = on_commit {
                callback(committed);
            }
        }
    }

    if parts.is_empty() {
        // S3 multipart needs at least one part; write the empty object
        // directly and let the still-armed guard drop the session.
        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| backend_err("put", bucket, key, &e))?;
        return Ok(0);
    }

    let completed = CompletedMultipartUpload::builder()
        .set_parts(Some(parts))
        .build();
    client
        .complete_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .multipart_upload(completed)
        .send()
        .await
        .map_err(|e| backend_err("multipart complete", bucket, key, &e))?;
    guard.disarm();
    Ok(committed)
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn create_blob(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        let key = self.blob_key(ns, name);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| backend_err("put", &self.bucket, &key, &e))?;
        Ok(())
    }

    async fn append_from(
        &self,
        ns: &str,
        name: &str,
        reader: &mut BlobReader<'_>,
    ) -> Result<u64, StoreError> {
        let key = self.blob_key(ns, name);

        // Buffer up to one part first; payloads that fit skip the multipart
        // round trips entirely.
        let mut head: Vec<u8> = Vec::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut eof = false;
        while head.len() < PART_SIZE {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::Backend(format!("reading upload body failed: {e}")))?;
            if n == 0 {
                eof = true;
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }

        if eof {
            let len = head.len() as u64;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .content_length(len as i64)
                .body(ByteStream::from(head))
                .send()
                .await
                .map_err(|e| backend_err("put", &self.bucket, &key, &e))?;
            return Ok(len);
        }

        let upload_id = init_multipart(&self.client, &self.bucket, &key).await?;
        multipart_stream(
            &self.client,
            &self.bucket,
            &key,
            &upload_id,
            head,
            None,
            reader,
            None,
        )
        .await
    }

    async fn prepare_sized_upload(
        &self,
        ns: &str,
        name: &str,
        total: u64,
    ) -> Result<Box<dyn SizedUpload>, StoreError> {
        let key = self.blob_key(ns, name);
        // Pick the write strategy from the declared size: a single put for
        // anything that fits in one part, an eagerly opened multipart
        // session otherwise.
        let upload_id = if total > PART_SIZE as u64 {
            Some(init_multipart(&self.client, &self.bucket, &key).await?)
        } else {
            None
        };
        Ok(Box::new(S3SizedUpload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            upload_id,
            total,
            callback: None,
        }))
    }

    async fn read_into(
        &self,
        ns: &str,
        name: &str,
        writer: &mut BlobWriter<'_>,
    ) -> Result<u64, StoreError> {
        let key = self.blob_key(ns, name);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    StoreError::NotFound
                } else {
                    backend_err("get", &self.bucket, &key, &e)
                }
            })?;

        let mut body = response.body.into_async_read();
        let copied = tokio::io::copy(&mut body, writer)
            .await
            .map_err(|e| StoreError::Backend(format!("s3 read stream failed for {key}: {e}")))?;
        Ok(copied)
    }

    async fn stat_blob(&self, ns: &str, name: &str) -> Result<BlobStat, StoreError> {
        let key = self.blob_key(ns, name);
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    StoreError::NotFound
                } else {
                    backend_err("head", &self.bucket, &key, &e)
                }
            })?;

        // S3 tracks only the last modification instant.
        let modified_at = response
            .last_modified()
            .map(|dt| timestamp_to_datetime(dt.secs()))
            .unwrap_or_else(Utc::now);
        Ok(BlobStat {
            size: response.content_length().unwrap_or(0) as u64,
            created_at: modified_at,
            modified_at,
        })
    }

    async fn list_blobs(&self, ns: &str, prefix: &str) -> Result<Vec<BlobEntry>, StoreError> {
        let full_prefix = self.blob_key(ns, prefix);
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| backend_err("list", &self.bucket, &full_prefix, &e))?;

            for obj in output.contents() {
                let Some(key) = obj.key() else { continue };
                let name = key.rsplit('/').next().unwrap_or_default().to_string();
                let modified_at = obj
                    .last_modified()
                    .map(|dt| timestamp_to_datetime(dt.secs()))
                    .unwrap_or_else(Utc::now);
                entries.push(BlobEntry {
                    name,
                    path: key.to_string(),
                    size: obj.size().unwrap_or(0) as u64,
                    created_at: modified_at,
                    modified_at,
                });
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(entries)
    }

    async fn delete_blob(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        let key = self.blob_key(ns, name);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| backend_err("delete", &self.bucket, &key, &e))?;
        Ok(())
    }
}

/// Size-declared upload into S3.
struct S3SizedUpload {
    client: Client,
    bucket: String,
    key: String,
    /// Present when the declared size requires a multipart session.
    upload_id: Option<String>,
    total: u64,
    callback: Option<CommitCallback>,
}

#[async_trait]
impl SizedUpload for S3SizedUpload {
    fn on_progress(&mut self, callback: CommitCallback) {
        self.callback = Some(callback);
    }

    async fn append_from(&mut self, reader: &mut BlobReader<'_>) -> Result<u64, StoreError> {
        match &self.upload_id {
            Some(upload_id) => {
                multipart_stream(
                    &self.client,
                    &self.bucket,
                    &self.key,
                    upload_id,
                    Vec::new(),
                    Some(self.total),
                    reader,
                    self.callback.as_ref(),
                )
                .await
            }
            None => {
                // The declared size bounds the buffer; a longer body is an
                // error, not a bigger allocation.
                let mut data = Vec::with_capacity(self.total as usize);
                let mut limited = reader.take(self.total.saturating_add(1));
                limited.read_to_end(&mut data).await.map_err(|e| {
                    StoreError::Backend(format!("reading upload body failed: {e}"))
                })?;
                if data.len() as u64 > self.total {
                    return Err(StoreError::Backend(format!(
                        "upload body exceeds declared size of {} bytes",
                        self.total
                    )));
                }
                let len = data.len() as u64;
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(&self.key)
                    .content_length(len as i64)
                    .body(ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| backend_err("put", &self.bucket, &self.key, &e))?;
                if let Some(callback) = &self.callback {
                    callback(len);
                }
                Ok(len)
            }
        }
    }
}

struct StoredBlob {
    data: Vec<u8>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

/// In-memory blob store used for tests and when S3 is not configured.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, StoredBlob>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blob_key(ns: &str, name: &str) -> String {
        format!("{}/{}", ns, name)
    }

    fn lock_blobs(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredBlob>>, StoreError> {
        self.blobs
            .lock()
            .map_err(|_| StoreError::Backend("memory blob store lock poisoned".to_string()))
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_blob(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.lock_blobs()?.insert(
            Self::blob_key(ns, name),
            StoredBlob {
                data: Vec::new(),
                created_at: now,
                modified_at: now,
            },
        );
        Ok(())
    }

    async fn append_from(
        &self,
        ns: &str,
        name: &str,
        reader: &mut BlobReader<'_>,
    ) -> Result<u64, StoreError> {
        let key = Self::blob_key(ns, name);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut written: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::Backend(format!("reading upload body failed: {e}")))?;
            if n == 0 {
                break;
            }
            let mut blobs = self.lock_blobs()?;
            let blob = blobs.get_mut(&key).ok_or(StoreError::NotFound)?;
            blob.data.extend_from_slice(&buf[..n]);
            blob.modified_at = Utc::now();
            written += n as u64;
        }
        Ok(written)
    }

    async fn prepare_sized_upload(
        &self,
        ns: &str,
        name: &str,
        total: u64,
    ) -> Result<Box<dyn SizedUpload>, StoreError> {
        let key = Self::blob_key(ns, name);
        let now = Utc::now();
        self.lock_blobs()?.insert(
            key.clone(),
            StoredBlob {
                data: Vec::new(),
                created_at: now,
                modified_at: now,
            },
        );
        Ok(Box::new(MemorySizedUpload {
            blobs: Arc::clone(&self.blobs),
            key,
            total,
            callback: None,
        }))
    }

    async fn read_into(
        &self,
        ns: &str,
        name: &str,
        writer: &mut BlobWriter<'_>,
    ) -> Result<u64, StoreError> {
        let data = {
            let blobs = self.lock_blobs()?;
            let blob = blobs
                .get(&Self::blob_key(ns, name))
                .ok_or(StoreError::NotFound)?;
            blob.data.clone()
        };
        for chunk in data.chunks(READ_CHUNK) {
            writer
                .write_all(chunk)
                .await
                .map_err(|e| StoreError::Backend(format!("writing download body failed: {e}")))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| StoreError::Backend(format!("writing download body failed: {e}")))?;
        Ok(data.len() as u64)
    }

    async fn stat_blob(&self, ns: &str, name: &str) -> Result<BlobStat, StoreError> {
        let blobs = self.lock_blobs()?;
        let blob = blobs
            .get(&Self::blob_key(ns, name))
            .ok_or(StoreError::NotFound)?;
        Ok(BlobStat {
            size: blob.data.len() as u64,
            created_at: blob.created_at,
            modified_at: blob.modified_at,
        })
    }

    async fn list_blobs(&self, ns: &str, prefix: &str) -> Result<Vec<BlobEntry>, StoreError> {
        let ns_prefix = format!("{}/", ns);
        let blobs = self.lock_blobs()?;
        let mut entries: Vec<BlobEntry> = blobs
            .iter()
            .filter_map(|(key, blob)| {
                let name = key.strip_prefix(&ns_prefix)?;
                if !name.starts_with(prefix) {
                    return None;
                }
                Some(BlobEntry {
                    name: name.to_string(),
                    path: key.clone(),
                    size: blob.data.len() as u64,
                    created_at: blob.created_at,
                    modified_at: blob.modified_at,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete_blob(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        self.lock_blobs()?.remove(&Self::blob_key(ns, name));
        Ok(())
    }
}

/// Size-declared upload into the in-memory store.
struct MemorySizedUpload {
    blobs: Arc<Mutex<HashMap<String, StoredBlob>>>,
    key: String,
    total: u64,
    callback: Option<CommitCallback>,
}

#[async_trait]
impl SizedUpload for MemorySizedUpload {
    fn on_progress(&mut self, callback: CommitCallback) {
        self.callback = Some(callback);
    }

    async fn append_from(&mut self, reader: &mut BlobReader<'_>) -> Result<u64, StoreError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let mut committed: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::Backend(format!("reading upload body failed: {e}")))?;
            if n == 0 {
                break;
            }
            if committed + n as u64 > self.total {
                // A failed sized upload leaves no partial object behind.
                if let Ok(mut blobs) = self.blobs.lock() {
                    blobs.remove(&self.key);
                }
                return Err(StoreError::Backend(format!(
                    "upload body exceeds declared size of {} bytes",
                    self.total
                )));
            }
            {
                let mut blobs = self.blobs.lock().map_err(|_| {
                    StoreError::Backend("memory blob store lock poisoned".to_string())
                })?;
                let blob = blobs.get_mut(&self.key).ok_or(StoreError::NotFound)?;
                blob.data.extend_from_slice(&buf[..n]);
                blob.modified_at = Utc::now();
            }
            committed += n as u64;
            if let Some(callback) = &self.callback {
                callback(committed);
            }
        }
        Ok(committed)
    }
}

/// Build the blob store from configuration, falling back to the in-memory
/// store when S3 credentials are absent.
pub async fn build_blob_store(config: &Config) -> Result<Arc<dyn BlobStore>, StoreError> {
    if config.is_s3_configured() {
        let store = S3BlobStore::new(&config.s3).await?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(MemoryBlobStore::new()))
    }
}
