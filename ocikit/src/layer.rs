use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::mediatype::MediaType;
use crate::reference::Repository;

/// One filesystem delta: a tar archive, optionally gzipped.
///
/// `digest` addresses the compressed bytes, `diff_id` the uncompressed tar.
/// Implementations compute both lazily.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Digest of the blob as stored in a registry (the compressed form).
    async fn digest(&self) -> Result<Digest>;

    /// Digest of the uncompressed tar, as listed in `rootfs.diff_ids`.
    async fn diff_id(&self) -> Result<Digest>;

    /// Size in bytes of the compressed blob.
    async fn size(&self) -> Result<i64>;

    fn media_type(&self) -> MediaType;

    /// The blob bytes as addressed by `digest`.
    async fn compressed(&self) -> Result<Bytes>;

    /// The inflated tar bytes as addressed by `diff_id`.
    async fn uncompressed(&self) -> Result<Bytes>;

    /// Where this layer's blob already lives, for cross-repo mounting.
    fn mount_source(&self) -> Option<(Repository, Digest)> {
        None
    }
}

/// Gzip magic sniff.
pub fn is_gzipped(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Deterministic gzip: flate2 writes no mtime into the header, so equal
/// input yields equal output.
pub fn gzip(data: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    Ok(Bytes::from(encoder.finish()?))
}

pub fn gunzip(data: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

/// A layer over in-memory bytes. `content` is the blob exactly as it would
/// be addressed in a registry; whether it is a gzip stream is decided by the
/// media type (with a magic-byte fallback for `Other` types).
pub struct StaticLayer {
    content: Bytes,
    media_type: MediaType,
    digest: OnceLock<Digest>,
    diff_id: OnceLock<Digest>,
}

impl StaticLayer {
    pub fn new(content: impl Into<Bytes>, media_type: MediaType) -> Self {
        Self {
            content: content.into(),
            media_type,
            digest: OnceLock::new(),
            diff_id: OnceLock::new(),
        }
    }

    /// Build a gzipped layer from a raw tar.
    pub fn from_uncompressed_tar(tar: impl Into<Bytes>, media_type: MediaType) -> Result<Self> {
        let tar = tar.into();
        let content = if media_type.is_gzipped() {
            gzip(&tar)?
        } else {
            tar
        };
        Ok(Self::new(content, media_type))
    }

    fn inflate(&self) -> Result<Bytes> {
        if is_gzipped(&self.content) {
            Ok(gunzip(&self.content)?)
        } else {
            Ok(self.content.clone())
        }
    }
}

#[async_trait]
impl Layer for StaticLayer {
    async fn digest(&self) -> Result<Digest> {
        Ok(self
            .digest
            .get_or_init(|| Digest::sha256_of(&self.content))
            .clone())
    }

    async fn diff_id(&self) -> Result<Digest> {
        if let Some(d) = self.diff_id.get() {
            return Ok(d.clone());
        }
        let inflated = self.inflate()?;
        let d = Digest::sha256_of(&inflated);
        Ok(self.diff_id.get_or_init(|| d).clone())
    }

    async fn size(&self) -> Result<i64> {
        Ok(self.content.len() as i64)
    }

    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn compressed(&self) -> Result<Bytes> {
        Ok(self.content.clone())
    }

    async fn uncompressed(&self) -> Result<Bytes> {
        self.inflate()
    }
}

/// A layer backed by a tar (or tar.gz) file on disk. The file is re-read on
/// each access; digests are computed once and cached.
pub struct FileLayer {
    path: PathBuf,
    media_type: MediaType,
    meta: tokio::sync::OnceCell<(Digest, Digest, i64)>,
}

impl FileLayer {
    /// Open lazily; already-gzipped files are used as-is, raw tars are
    /// gzipped on the fly. The media type defaults to the Docker layer type.
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        // Probe now so a bad path fails at construction, not first read.
        tokio::fs::metadata(&path).await?;
        Ok(Self {
            path,
            media_type: MediaType::DockerLayer,
            meta: tokio::sync::OnceCell::new(),
        })
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    async fn blob(&self) -> Result<Bytes> {
        let raw = Bytes::from(tokio::fs::read(&self.path).await?);
        if is_gzipped(&raw) || !self.media_type.is_gzipped() {
            Ok(raw)
        } else {
            Ok(gzip(&raw)?)
        }
    }

    async fn meta(&self) -> Result<&(Digest, Digest, i64)> {
        self.meta
            .get_or_try_init(|| async {
                let blob = self.blob().await?;
                let digest = Digest::sha256_of(&blob);
                let inflated = if is_gzipped(&blob) {
                    gunzip(&blob)?
                } else {
                    blob.clone()
                };
                let diff_id = Digest::sha256_of(&inflated);
                Ok::<_, Error>((digest, diff_id, blob.len() as i64))
            })
            .await
    }
}

#[async_trait]
impl Layer for FileLayer {
    async fn digest(&self) -> Result<Digest> {
        Ok(self.meta().await?.0.clone())
    }

    async fn diff_id(&self) -> Result<Digest> {
        Ok(self.meta().await?.1.clone())
    }

    async fn size(&self) -> Result<i64> {
        Ok(self.meta().await?.2)
    }

    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn compressed(&self) -> Result<Bytes> {
        self.blob().await
    }

    async fn uncompressed(&self) -> Result<Bytes> {
        let blob = self.blob().await?;
        if is_gzipped(&blob) {
            Ok(gunzip(&blob)?)
        } else {
            Ok(blob)
        }
    }
}

struct StreamMeta {
    digest: Digest,
    diff_id: Digest,
    size: i64,
}

struct StreamState {
    source: Option<Box<dyn Read + Send>>,
    computed: Option<StreamMeta>,
}

/// A one-shot layer over an uncompressed tar stream.
///
/// `compressed` (or `uncompressed`) may be called exactly once; before that,
/// `digest`/`diff_id`/`size` fail with `NotComputed`, and afterwards they
/// return the values observed while consuming the stream.
pub struct StreamLayer {
    media_type: MediaType,
    state: Mutex<StreamState>,
}

impl StreamLayer {
    pub fn new(source: Box<dyn Read + Send>) -> Self {
        Self {
            media_type: MediaType::OciLayer,
            state: Mutex::new(StreamState {
                source: Some(source),
                computed: None,
            }),
        }
    }

    pub fn with_media_type(mut self, media_type: MediaType) -> Self {
        self.media_type = media_type;
        self
    }

    /// Drain the source, record metadata, and return (compressed, raw).
    fn consume(&self) -> Result<(Bytes, Bytes)> {
        let mut state = self.state.lock().expect("stream layer lock poisoned");
        let Some(mut source) = state.source.take() else {
            return Err(Error::StreamConsumed);
        };
        let mut raw = Vec::new();
        source.read_to_end(&mut raw)?;
        let raw = Bytes::from(raw);
        let compressed = if self.media_type.is_gzipped() {
            gzip(&raw)?
        } else {
            raw.clone()
        };
        state.computed = Some(StreamMeta {
            digest: Digest::sha256_of(&compressed),
            diff_id: Digest::sha256_of(&raw),
            size: compressed.len() as i64,
        });
        Ok((compressed, raw))
    }

    fn meta<T>(&self, f: impl FnOnce(&StreamMeta) -> T) -> Result<T> {
        let state = self.state.lock().expect("stream layer lock poisoned");
        state.computed.as_ref().map(f).ok_or(Error::NotComputed)
    }
}

#[async_trait]
impl Layer for StreamLayer {
    async fn digest(&self) -> Result<Digest> {
        self.meta(|m| m.digest.clone())
    }

    async fn diff_id(&self) -> Result<Digest> {
        self.meta(|m| m.diff_id.clone())
    }

    async fn size(&self) -> Result<i64> {
        self.meta(|m| m.size)
    }

    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn compressed(&self) -> Result<Bytes> {
        Ok(self.consume()?.0)
    }

    async fn uncompressed(&self) -> Result<Bytes> {
        Ok(self.consume()?.1)
    }
}

/// Wraps a layer and persists its compressed bytes under
/// `<root>/<alg>/<hex>` on first read.
pub struct CachedLayer {
    inner: Arc<dyn Layer>,
    root: PathBuf,
}

impl CachedLayer {
    pub fn new(inner: Arc<dyn Layer>, root: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            root: root.into(),
        }
    }

    async fn cache_path(&self) -> Result<PathBuf> {
        let digest = self.inner.digest().await?;
        Ok(self
            .root
            .join(digest.algorithm().as_str())
            .join(digest.hex()))
    }
}

#[async_trait]
impl Layer for CachedLayer {
    async fn digest(&self) -> Result<Digest> {
        self.inner.digest().await
    }

    async fn diff_id(&self) -> Result<Digest> {
        self.inner.diff_id().await
    }

    async fn size(&self) -> Result<i64> {
        self.inner.size().await
    }

    fn media_type(&self) -> MediaType {
        self.inner.media_type()
    }

    async fn compressed(&self) -> Result<Bytes> {
        let path = self.cache_path().await?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => return Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let bytes = self.inner.compressed().await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a concurrent reader never sees a short file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(bytes)
    }

    async fn uncompressed(&self) -> Result<Bytes> {
        let compressed = self.compressed().await?;
        if is_gzipped(&compressed) {
            Ok(gunzip(&compressed)?)
        } else {
            Ok(compressed)
        }
    }

    fn mount_source(&self) -> Option<(Repository, Digest)> {
        self.inner.mount_source()
    }
}

struct RetypedLayer {
    inner: Arc<dyn Layer>,
    media_type: MediaType,
}

/// The same bytes under a different media type; digests are unchanged.
/// Used by the OCI↔Docker conversions.
pub fn with_media_type(inner: Arc<dyn Layer>, media_type: MediaType) -> Arc<dyn Layer> {
    Arc::new(RetypedLayer { inner, media_type })
}

#[async_trait]
impl Layer for RetypedLayer {
    async fn digest(&self) -> Result<Digest> {
        self.inner.digest().await
    }

    async fn diff_id(&self) -> Result<Digest> {
        self.inner.diff_id().await
    }

    async fn size(&self) -> Result<i64> {
        self.inner.size().await
    }

    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn compressed(&self) -> Result<Bytes> {
        self.inner.compressed().await
    }

    async fn uncompressed(&self) -> Result<Bytes> {
        self.inner.uncompressed().await
    }

    fn mount_source(&self) -> Option<(Repository, Digest)> {
        self.inner.mount_source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_layer_digests() {
        let layer = StaticLayer::from_uncompressed_tar(
            Bytes::from_static(b"not really a tar"),
            MediaType::OciLayer,
        )
        .unwrap();
        let compressed = layer.compressed().await.unwrap();
        assert!(is_gzipped(&compressed));
        assert_eq!(layer.digest().await.unwrap(), Digest::sha256_of(&compressed));
        assert_eq!(
            layer.diff_id().await.unwrap(),
            Digest::sha256_of(b"not really a tar")
        );
        assert_eq!(layer.size().await.unwrap(), compressed.len() as i64);
    }

    #[tokio::test]
    async fn uncompressed_media_type_is_not_gzipped() {
        let layer = StaticLayer::from_uncompressed_tar(
            Bytes::from_static(b"raw tar"),
            MediaType::OciUncompressedLayer,
        )
        .unwrap();
        assert_eq!(layer.compressed().await.unwrap(), Bytes::from_static(b"raw tar"));
        assert_eq!(layer.digest().await.unwrap(), layer.diff_id().await.unwrap());
    }

    #[tokio::test]
    async fn stream_layer_is_one_shot() {
        let layer = StreamLayer::new(Box::new(std::io::Cursor::new(b"streamed".to_vec())));
        assert!(matches!(layer.digest().await, Err(Error::NotComputed)));

        let compressed = layer.compressed().await.unwrap();
        assert!(is_gzipped(&compressed));
        assert_eq!(
            layer.diff_id().await.unwrap(),
            Digest::sha256_of(b"streamed")
        );
        assert_eq!(layer.size().await.unwrap(), compressed.len() as i64);

        assert!(matches!(layer.compressed().await, Err(Error::StreamConsumed)));
    }

    #[tokio::test]
    async fn cached_layer_persists_blob() {
        let dir = tempfile::tempdir().unwrap();
        let inner = Arc::new(
            StaticLayer::from_uncompressed_tar(Bytes::from_static(b"cache me"), MediaType::OciLayer)
                .unwrap(),
        );
        let cached = CachedLayer::new(inner.clone(), dir.path());
        let first = cached.compressed().await.unwrap();
        let digest = cached.digest().await.unwrap();
        let on_disk = dir.path().join("sha256").join(digest.hex());
        assert!(on_disk.exists());
        assert_eq!(cached.compressed().await.unwrap(), first);
    }

    #[tokio::test]
    async fn retyped_layer_keeps_bytes() {
        let inner: Arc<dyn Layer> = Arc::new(
            StaticLayer::from_uncompressed_tar(Bytes::from_static(b"x"), MediaType::DockerLayer)
                .unwrap(),
        );
        let oci = with_media_type(inner.clone(), MediaType::OciLayer);
        assert_eq!(oci.media_type(), MediaType::OciLayer);
        assert_eq!(oci.digest().await.unwrap(), inner.digest().await.unwrap());
    }

    #[test]
    fn gzip_round_trip_is_deterministic() {
        let a = gzip(b"same input").unwrap();
        let b = gzip(b"same input").unwrap();
        assert_eq!(a, b);
        assert_eq!(gunzip(&a).unwrap(), Bytes::from_static(b"same input"));
    }
}
