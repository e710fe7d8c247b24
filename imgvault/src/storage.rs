use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use opendal::Operator;
use opendal::services::{Fs, Memory};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::sync::Mutex;

use ocikit::Digest;

use crate::config::{AppConfig, StorageBackend};
use crate::error::{AppError, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadStatus {
    pub name: String,
    pub uuid: String,
    pub size: u64,
}

/// Blob and manifest storage over an opendal operator (filesystem or
/// memory), with per-repository tag locks and upload sessions.
///
/// Blobs live at `blobs/<alg>/<hex>` (prefixed per-repo in split mode);
/// manifests at `manifests/<repo>/<tag-or-digest>`. A manifest PUT always
/// stores the digest key, so digest fetches never miss.
pub struct Storage {
    operator: Operator,
    split_repositories: bool,
    tag_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    bytes_received: AtomicU64,
}

impl Storage {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        let operator = match config.storage.backend {
            StorageBackend::Fs => {
                let root = config.storage.fs_root.clone().ok_or_else(|| {
                    AppError::Config("missing fs_root configuration".to_string())
                })?;
                let mut builder = Fs::default();
                builder.root(&root.to_string_lossy());
                Operator::new(builder).map_err(AppError::Storage)?.finish()
            }
            StorageBackend::Memory => {
                let builder = Memory::default();
                Operator::new(builder).map_err(AppError::Storage)?.finish()
            }
        };
        Ok(Self {
            operator,
            split_repositories: config.storage.split_repositories,
            tag_locks: Mutex::new(HashMap::new()),
            bytes_received: AtomicU64::new(0),
        })
    }

    /// Total blob payload bytes accepted through upload sessions. Lets
    /// tests (and metrics) observe that mounts and existence checks moved
    /// no bytes.
    pub fn blob_bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn parse_digest(digest: &str) -> Result<Digest> {
        Digest::from_str(digest).map_err(|e| AppError::DigestInvalid(e.to_string()))
    }

    fn blob_path(&self, repo: &str, digest: &Digest) -> String {
        if self.split_repositories {
            format!(
                "repos/{repo}/blobs/{}/{}",
                digest.algorithm().as_str(),
                digest.hex()
            )
        } else {
            format!("blobs/{}/{}", digest.algorithm().as_str(), digest.hex())
        }
    }

    async fn repo_lock(&self, repo: &str) -> Arc<Mutex<()>> {
        let mut locks = self.tag_locks.lock().await;
        locks.entry(repo.to_string()).or_default().clone()
    }

    // Blob operations

    pub async fn blob_exists(&self, repo: &str, digest: &str) -> Result<bool> {
        let digest = Self::parse_digest(digest)?;
        self.operator
            .is_exist(&self.blob_path(repo, &digest))
            .await
            .map_err(AppError::Storage)
    }

    pub async fn get_blob(&self, repo: &str, digest: &str) -> Result<Bytes> {
        let parsed = Self::parse_digest(digest)?;
        let path = self.blob_path(repo, &parsed);
        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::BlobUnknown(digest.to_string()));
        }
        let data = self.operator.read(&path).await.map_err(AppError::Storage)?;
        Ok(Bytes::from(data))
    }

    pub async fn get_blob_size(&self, repo: &str, digest: &str) -> Result<u64> {
        let parsed = Self::parse_digest(digest)?;
        let path = self.blob_path(repo, &parsed);
        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::BlobUnknown(digest.to_string()));
        }
        let metadata = self.operator.stat(&path).await.map_err(AppError::Storage)?;
        Ok(metadata.content_length())
    }

    pub async fn delete_blob(&self, repo: &str, digest: &str) -> Result<()> {
        let parsed = Self::parse_digest(digest)?;
        let path = self.blob_path(repo, &parsed);
        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::BlobUnknown(digest.to_string()));
        }
        self.operator.delete(&path).await.map_err(AppError::Storage)
    }

    /// Whether a mount of `digest` from `from` into `repo` can be served
    /// without an upload. In split mode blobs are invisible across repos,
    /// so mounts always degrade to uploads.
    pub async fn can_mount(&self, _repo: &str, from: &str, digest: &str) -> Result<bool> {
        if self.split_repositories {
            return Ok(false);
        }
        self.blob_exists(from, digest).await
    }

    // Upload sessions

    fn upload_status_path(repo: &str, uuid: &str) -> String {
        format!("uploads/{repo}/{uuid}-status.json")
    }

    fn upload_part_path(repo: &str, uuid: &str) -> String {
        format!("uploads/{repo}/{uuid}.part")
    }

    pub async fn start_upload(&self, repo: &str, uuid: &str) -> Result<()> {
        let status = UploadStatus {
            name: repo.to_string(),
            uuid: uuid.to_string(),
            size: 0,
        };
        self.operator
            .write(
                &Self::upload_status_path(repo, uuid),
                serde_json::to_vec(&status)?,
            )
            .await
            .map_err(AppError::Storage)?;
        self.operator
            .write(&Self::upload_part_path(repo, uuid), Bytes::new())
            .await
            .map_err(AppError::Storage)?;
        Ok(())
    }

    pub async fn upload_status(&self, repo: &str, uuid: &str) -> Result<UploadStatus> {
        let path = Self::upload_status_path(repo, uuid);
        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::BlobUploadUnknown(format!("{repo}/{uuid}")));
        }
        let data = self.operator.read(&path).await.map_err(AppError::Storage)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Append a chunk and return the new committed size.
    pub async fn append_chunk(&self, repo: &str, uuid: &str, content: Bytes) -> Result<u64> {
        let mut status = self.upload_status(repo, uuid).await?;
        let part_path = Self::upload_part_path(repo, uuid);
        let mut data = self.operator.read(&part_path).await.map_err(AppError::Storage)?;
        data.extend_from_slice(&content);
        self.operator
            .write(&part_path, data)
            .await
            .map_err(AppError::Storage)?;

        self.bytes_received
            .fetch_add(content.len() as u64, Ordering::Relaxed);
        status.size += content.len() as u64;
        self.operator
            .write(
                &Self::upload_status_path(repo, uuid),
                serde_json::to_vec(&status)?,
            )
            .await
            .map_err(AppError::Storage)?;
        Ok(status.size)
    }

    /// Commit a session: append the final chunk, verify the digest, and
    /// promote the bytes to content-addressed storage.
    pub async fn complete_upload(
        &self,
        repo: &str,
        uuid: &str,
        expected_digest: &str,
        final_chunk: Bytes,
    ) -> Result<String> {
        let expected = Self::parse_digest(expected_digest)?;
        // Validates the session exists.
        self.upload_status(repo, uuid).await?;

        let part_path = Self::upload_part_path(repo, uuid);
        let mut data = self.operator.read(&part_path).await.map_err(AppError::Storage)?;
        if !final_chunk.is_empty() {
            self.bytes_received
                .fetch_add(final_chunk.len() as u64, Ordering::Relaxed);
            data.extend_from_slice(&final_chunk);
        }

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != expected.to_string() {
            self.cancel_upload(repo, uuid).await?;
            return Err(AppError::DigestInvalid(format!(
                "expected {expected}, computed {computed}"
            )));
        }

        self.operator
            .write(&self.blob_path(repo, &expected), data)
            .await
            .map_err(AppError::Storage)?;
        self.cancel_upload(repo, uuid).await?;
        Ok(computed)
    }

    pub async fn cancel_upload(&self, repo: &str, uuid: &str) -> Result<()> {
        for path in [
            Self::upload_part_path(repo, uuid),
            Self::upload_status_path(repo, uuid),
        ] {
            if self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
                self.operator.delete(&path).await.map_err(AppError::Storage)?;
            }
        }
        Ok(())
    }

    // Manifest operations

    fn manifest_path(repo: &str, reference: &str) -> String {
        format!("manifests/{repo}/{reference}")
    }

    pub async fn manifest_exists(&self, repo: &str, reference: &str) -> Result<bool> {
        self.operator
            .is_exist(&Self::manifest_path(repo, reference))
            .await
            .map_err(AppError::Storage)
    }

    pub async fn get_manifest(&self, repo: &str, reference: &str) -> Result<Bytes> {
        let path = Self::manifest_path(repo, reference);
        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::ManifestUnknown(format!("{repo}/{reference}")));
        }
        let data = self.operator.read(&path).await.map_err(AppError::Storage)?;
        Ok(Bytes::from(data))
    }

    /// Store a manifest under its digest key and, when `reference` is a
    /// tag, under the tag key too. Tag updates serialize per repository.
    pub async fn put_manifest(&self, repo: &str, reference: &str, content: Bytes) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(&content);
        let digest = format!("sha256:{}", hex::encode(hasher.finalize()));

        let lock = self.repo_lock(repo).await;
        let _guard = lock.lock().await;
        self.operator
            .write(&Self::manifest_path(repo, &digest), content.clone())
            .await
            .map_err(AppError::Storage)?;
        if reference != digest {
            self.operator
                .write(&Self::manifest_path(repo, reference), content)
                .await
                .map_err(AppError::Storage)?;
        }
        Ok(digest)
    }

    /// Delete a tag (just the mapping) or a digest (the bytes plus any
    /// tags that resolve to them).
    pub async fn delete_manifest(&self, repo: &str, reference: &str) -> Result<()> {
        let lock = self.repo_lock(repo).await;
        let _guard = lock.lock().await;

        let path = Self::manifest_path(repo, reference);
        if !self.operator.is_exist(&path).await.map_err(AppError::Storage)? {
            return Err(AppError::ManifestUnknown(format!("{repo}/{reference}")));
        }

        if Digest::from_str(reference).is_ok() {
            // Digest deletion also unlinks tags pointing at these bytes.
            let tags = self.list_tags_unsorted(repo).await?;
            for tag in tags {
                let tag_path = Self::manifest_path(repo, &tag);
                let data = self.operator.read(&tag_path).await.map_err(AppError::Storage)?;
                let mut hasher = Sha256::new();
                hasher.update(&data);
                let tag_digest = format!("sha256:{}", hex::encode(hasher.finalize()));
                if tag_digest == reference {
                    self.operator.delete(&tag_path).await.map_err(AppError::Storage)?;
                }
            }
        }
        self.operator.delete(&path).await.map_err(AppError::Storage)
    }

    async fn list_tags_unsorted(&self, repo: &str) -> Result<Vec<String>> {
        let path = format!("manifests/{repo}/");
        let entries = match self.operator.list(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => {
                return Err(AppError::NameUnknown(repo.to_string()));
            }
            Err(e) => return Err(AppError::Storage(e)),
        };
        Ok(entries
            .iter()
            .filter(|e| !e.metadata().is_dir())
            .map(|e| e.name().to_string())
            .filter(|name| Digest::from_str(name).is_err())
            .collect())
    }

    pub async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        let mut tags = self.list_tags_unsorted(repo).await?;
        tags.sort();
        Ok(tags)
    }

    /// All repositories holding at least one manifest, sorted.
    pub async fn list_repositories(&self) -> Result<Vec<String>> {
        let mut repositories = Vec::new();
        let mut stack = vec!["manifests/".to_string()];
        while let Some(dir) = stack.pop() {
            let entries = match self.operator.list(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => continue,
                Err(e) => return Err(AppError::Storage(e)),
            };
            let mut has_file = false;
            for entry in entries {
                if entry.metadata().is_dir() {
                    stack.push(entry.path().to_string());
                } else {
                    has_file = true;
                }
            }
            if has_file {
                let repo = dir
                    .trim_start_matches("manifests/")
                    .trim_end_matches('/')
                    .to_string();
                if !repo.is_empty() {
                    repositories.push(repo);
                }
            }
        }
        repositories.sort();
        Ok(repositories)
    }

    /// Digest-keyed manifests of a repository, as (digest, bytes) pairs.
    /// Used by the referrers endpoint.
    pub async fn digest_manifests(&self, repo: &str) -> Result<Vec<(String, Bytes)>> {
        let path = format!("manifests/{repo}/");
        let entries = match self.operator.list(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Storage(e)),
        };
        let mut manifests = Vec::new();
        for entry in entries {
            if entry.metadata().is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if Digest::from_str(&name).is_err() {
                continue;
            }
            let data = self
                .operator
                .read(entry.path())
                .await
                .map_err(AppError::Storage)?;
            manifests.push((name, Bytes::from(data)));
        }
        Ok(manifests)
    }
}
