//! S3-compatible object store adapter for document bytes.
//!
//! A thin port over `aws-sdk-s3` supporting custom endpoints (MinIO
//! and friends) via path-style addressing. The pipeline and server
//! depend on the [`ObjectStore`] trait so tests can substitute an
//! in-memory store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;

use crate::config::ObjectStoreConfig;
use crate::error::ObjectStoreError;

/// Default TTL for signed read URLs.
pub const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// Uploads above this size go through multipart.
pub const MULTIPART_THRESHOLD: usize = 5 * 1024 * 1024;

/// Port over document byte storage.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a key.
    async fn put(&self, key: &str, bytes: Vec<u8>, mime_type: &str)
        -> Result<(), ObjectStoreError>;

    /// Fetch the bytes stored under a key.
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Delete the object under a key.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;

    /// Generate a signed read URL.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError>;
}

/// Build the object key for an uploaded document:
/// `documents/<user_id>/<unix_millis>_<sanitized>.<ext>`.
pub fn object_key(user_id: &str, filename: &str, uploaded_at_millis: i64) -> String {
    let (stem, ext) = split_filename(filename);
    let sanitized = sanitize(stem);
    let ext = sanitize(ext);
    if ext.is_empty() {
        format!("documents/{user_id}/{uploaded_at_millis}_{sanitized}")
    } else {
        format!("documents/{user_id}/{uploaded_at_millis}_{sanitized}.{ext}")
    }
}

/// Infer a MIME type from a filename extension.
pub fn mime_from_filename(filename: &str) -> Option<&'static str> {
    let (_, ext) = split_filename(filename);
    match ext.to_ascii_lowercase().as_str() {
        "pdf" => Some("application/pdf"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

fn split_filename(filename: &str) -> (&str, &str) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (filename, ""),
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Object store backed by an S3-compatible service.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client from configuration.
    ///
    /// A custom endpoint plus `force_path_style` targets S3-compatible
    /// stores; without an endpoint the ambient AWS environment is used.
    pub async fn from_config(config: &ObjectStoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "docpipe-config",
            ));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let size = bytes.len();
        if size > MULTIPART_THRESHOLD {
            return self.put_multipart(key, bytes, mime_type).await;
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(mime_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| ObjectStoreError::Upload {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        tracing::debug!(key, size, "object stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Download {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Download {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(bytes.into_bytes().to_vec())
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Delete {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        let presigning =
            PresigningConfig::expires_in(ttl).map_err(|e| ObjectStoreError::Presign {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| ObjectStoreError::Presign {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(request.uri().to_string())
    }
}

impl S3ObjectStore {
    async fn put_multipart(
        &self,
        key: &str,
        bytes: Vec<u8>,
        mime_type: &str,
    ) -> Result<(), ObjectStoreError> {
        let upload_err = |e: String| ObjectStoreError::Upload {
            key: key.to_string(),
            message: e,
        };

        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(mime_type)
            .send()
            .await
            .map_err(|e| upload_err(e.to_string()))?;
        let upload_id = multipart
            .upload_id()
            .ok_or_else(|| upload_err("missing upload id".to_string()))?
            .to_string();

        let mut completed = Vec::new();
        for (index, chunk) in bytes.chunks(MULTIPART_THRESHOLD).enumerate() {
            let part_number = index as i32 + 1;
            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| upload_err(e.to_string()))?;
            completed.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| upload_err(e.to_string()))?;

        tracing::debug!(key, size = bytes.len(), "object stored via multipart");
        Ok(())
    }
}

/// In-memory store for tests and local development.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("store lock").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _mime_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.objects
            .lock()
            .expect("store lock")
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .lock()
            .expect("store lock")
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::Download {
                key: key.to_string(),
                message: "no such object".to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().expect("store lock").remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_sanitizes_filename() {
        let key = object_key("user-1", "Q1 Report (final).pdf", 1_700_000_000_000);
        assert_eq!(key, "documents/user-1/1700000000000_Q1_Report__final_.pdf");
    }

    #[test]
    fn key_format_without_extension() {
        let key = object_key("user-1", "scan", 1_700_000_000_000);
        assert_eq!(key, "documents/user-1/1700000000000_scan");
    }

    #[test]
    fn key_format_hidden_file_keeps_name() {
        // ".env" has no stem; the whole name is treated as the stem.
        let key = object_key("u", ".env", 42);
        assert_eq!(key, "documents/u/42_.env");
    }

    #[test]
    fn mime_inference() {
        assert_eq!(mime_from_filename("a.pdf"), Some("application/pdf"));
        assert_eq!(mime_from_filename("a.JPG"), Some("image/jpeg"));
        assert_eq!(mime_from_filename("a.jpeg"), Some("image/jpeg"));
        assert_eq!(mime_from_filename("a.png"), Some("image/png"));
        assert_eq!(mime_from_filename("a.webp"), Some("image/webp"));
        assert_eq!(mime_from_filename("a.gif"), None);
        assert_eq!(mime_from_filename("noext"), None);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryObjectStore::new();
        store
            .put("documents/u/1_a.pdf", vec![1, 2, 3], "application/pdf")
            .await
            .expect("put");
        assert_eq!(store.len(), 1);

        let bytes = store.get("documents/u/1_a.pdf").await.expect("get");
        assert_eq!(bytes, vec![1, 2, 3]);

        store.delete("documents/u/1_a.pdf").await.expect("delete");
        assert!(store.is_empty());
        assert!(store.get("documents/u/1_a.pdf").await.is_err());
    }

    #[tokio::test]
    async fn memory_presign_embeds_ttl() {
        let store = MemoryObjectStore::new();
        let url = store
            .presign_get("documents/u/1_a.pdf", DEFAULT_SIGNED_URL_TTL)
            .await
            .expect("presign");
        assert!(url.contains("ttl=900"));
    }
}
