//! Blob storage against an S3-compatible object store.

use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::{
    config::Credentials,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use tokio::{fs, io::AsyncReadExt};
use tracing::{debug, warn};

use super::{normalize_key, StorageBackend};
use crate::{
    config::{S3Settings, MULTIPART_MAX_PARTS, MULTIPART_MIN_PART_BYTES},
    utils::sibling_temp_path,
    CubicleError, CubicleResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A storage backend over an S3-compatible object store.
///
/// Objects at or above the multipart threshold are uploaded with multipart
/// upload; any part failure aborts the upload before the error is returned, so
/// half-written objects are never observable.
pub struct S3Storage {
    client: Client,
    bucket: String,
    multipart_threshold: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl S3Storage {
    /// Builds a client from the configured endpoint and static credentials.
    pub async fn new(settings: &S3Settings, multipart_threshold: u64) -> CubicleResult<Self> {
        let bucket = settings
            .get_bucket()
            .clone()
            .ok_or_else(|| CubicleError::InvalidArgument("s3 bucket is not configured".into()))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.get_region().clone()));

        if let Some(endpoint) = settings.get_endpoint() {
            loader = loader.endpoint_url(endpoint.clone());
        }
        if let (Some(access), Some(secret)) = (settings.get_access_key(), settings.get_secret_key())
        {
            loader = loader.credentials_provider(Credentials::new(
                access.clone(),
                secret.clone(),
                None,
                None,
                "cubicle-static",
            ));
        }

        let shared = loader.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket,
            multipart_threshold,
        })
    }

    /// Streams a large file through multipart upload.
    ///
    /// Part size is the smallest multiple of the provider minimum that keeps the
    /// part count under the provider cap.
    async fn put_file_multipart(&self, key: &str, source: &Path, size: u64) -> CubicleResult<()> {
        let part_size = MULTIPART_MIN_PART_BYTES.max(size.div_ceil(MULTIPART_MAX_PARTS));

        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| CubicleError::Transient(format!("create_multipart_upload: {}", e)))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| CubicleError::Fatal("multipart upload id missing".into()))?
            .to_string();

        match self
            .upload_parts(key, source, &upload_id, part_size as usize)
            .await
        {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| {
                        CubicleError::Transient(format!("complete_multipart_upload: {}", e))
                    })?;
                Ok(())
            }
            Err(e) => {
                // Abort before surfacing the failure so the provider drops the
                // uncommitted parts.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        source: &Path,
        upload_id: &str,
        part_size: usize,
    ) -> CubicleResult<Vec<CompletedPart>> {
        let mut file = fs::File::open(source).await?;
        let mut parts = Vec::new();
        let mut part_number = 1i32;

        loop {
            let mut buf = vec![0u8; part_size];
            let mut filled = 0usize;
            while filled < part_size {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            buf.truncate(filled);

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| {
                    CubicleError::Transient(format!("upload_part {}: {}", part_number, e))
                })?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
            debug!(key, part_number, bytes = filled, "uploaded part");
            part_number += 1;

            if filled < part_size {
                break;
            }
        }

        Ok(parts)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StorageBackend for S3Storage {
    async fn put(&self, key: &str, data: Bytes) -> CubicleResult<()> {
        let key = normalize_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| CubicleError::Transient(format!("put_object: {}", e)))?;
        Ok(())
    }

    async fn put_file(&self, key: &str, source: &Path) -> CubicleResult<()> {
        let key = normalize_key(key)?;
        let size = fs::metadata(source).await?.len();

        if size >= self.multipart_threshold {
            return self.put_file_multipart(&key, source, size).await;
        }

        let body = ByteStream::from_path(source)
            .await
            .map_err(CubicleError::custom)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| CubicleError::Transient(format!("put_object: {}", e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> CubicleResult<Bytes> {
        let key = normalize_key(key)?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    CubicleError::NotFound(format!("no such key: {}", key))
                } else {
                    CubicleError::Transient(format!("get_object: {}", service))
                }
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| CubicleError::Transient(format!("get_object body: {}", e)))?;
        Ok(data.into_bytes())
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> CubicleResult<()> {
        let key = normalize_key(key)?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    CubicleError::NotFound(format!("no such key: {}", key))
                } else {
                    CubicleError::Transient(format!("get_object: {}", service))
                }
            })?;

        let tmp = sibling_temp_path(dest);
        let result: CubicleResult<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            let mut body = resp.body;
            while let Some(chunk) = body
                .try_next()
                .await
                .map_err(|e| CubicleError::Transient(format!("get_object body: {}", e)))?
            {
                tokio::io::AsyncWriteExt::write_all(&mut file, &chunk).await?;
            }
            tokio::io::AsyncWriteExt::flush(&mut file).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                fs::rename(&tmp, dest).await?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn list(&self, prefix: &str) -> CubicleResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| CubicleError::Transient(format!("list_objects: {}", e)))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }

        // Providers return keys in lexicographic order per page; keep the
        // contract explicit across pages.
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> CubicleResult<()> {
        let key = normalize_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| CubicleError::Transient(format!("delete_object: {}", e)))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> CubicleResult<bool> {
        let key = normalize_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(CubicleError::Transient(format!("head_object: {}", service)))
                }
            }
        }
    }

    async fn probe(&self) -> CubicleResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| CubicleError::Transient(format!("head_bucket: {}", e)))?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_size_respects_provider_limits() {
        // Small files use the provider minimum.
        let size: u64 = 64 * 1024 * 1024;
        let part = MULTIPART_MIN_PART_BYTES.max(size.div_ceil(MULTIPART_MAX_PARTS));
        assert_eq!(part, MULTIPART_MIN_PART_BYTES);

        // Huge files scale the part size to stay under the part cap.
        let size: u64 = 100 * 1024 * 1024 * 1024;
        let part = MULTIPART_MIN_PART_BYTES.max(size.div_ceil(MULTIPART_MAX_PARTS));
        assert!(size.div_ceil(part) <= MULTIPART_MAX_PARTS);
        assert!(part >= MULTIPART_MIN_PART_BYTES);
    }
}
