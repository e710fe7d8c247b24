use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::{Image, ImageIndex, descriptor_of, index_descriptor_of};
use crate::layer::{Layer, StaticLayer};
use crate::mediatype::MediaType;
use crate::types::{Descriptor, IndexManifest, Platform};

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;
const INDEX_FILE: &str = "index.json";

/// An OCI image layout on disk: `oci-layout` marker, `index.json`, and
/// content-addressed blobs under `blobs/<alg>/<hex>`.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Initialize an empty layout (idempotent for an existing one).
    pub async fn write(root: impl Into<PathBuf>) -> Result<Layout> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("blobs")).await?;
        tokio::fs::write(root.join(LAYOUT_FILE), LAYOUT_CONTENT).await?;
        let index_path = root.join(INDEX_FILE);
        if tokio::fs::metadata(&index_path).await.is_err() {
            let empty = IndexManifest::empty(MediaType::OciImageIndex);
            tokio::fs::write(&index_path, serde_json::to_vec(&empty)?).await?;
        }
        Ok(Layout { root })
    }

    /// Open an existing layout, validating the marker file.
    pub async fn from_path(root: impl Into<PathBuf>) -> Result<Layout> {
        let root = root.into();
        if tokio::fs::metadata(root.join(LAYOUT_FILE)).await.is_err() {
            return Err(Error::Validation(format!(
                "{} is not an OCI image layout (missing {LAYOUT_FILE})",
                root.display()
            )));
        }
        Ok(Layout { root })
    }

    pub fn path(&self) -> &PathBuf {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Write a blob, deduplicating by digest.
    pub async fn write_blob(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::sha256_of(bytes);
        let path = self.blob_path(&digest);
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(digest)
    }

    pub async fn blob(&self, digest: &Digest) -> Result<Bytes> {
        match tokio::fs::read(self.blob_path(digest)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("blob {digest} not in layout")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_image_blobs(&self, img: &dyn Image) -> Result<()> {
        for layer in img.layers().await? {
            self.write_blob(&layer.compressed().await?).await?;
        }
        self.write_blob(&img.raw_config_file().await?).await?;
        self.write_blob(&img.raw_manifest().await?).await?;
        Ok(())
    }

    /// Append an image to the top-level index.
    pub async fn append_image(
        &self,
        img: &dyn Image,
        platform: Option<Platform>,
    ) -> Result<Descriptor> {
        self.write_image_blobs(img).await?;
        let mut desc = descriptor_of(img).await?;
        desc.platform = platform;
        self.append_descriptor(desc.clone()).await?;
        Ok(desc)
    }

    /// Append an index (and all its children) to the top-level index.
    pub async fn append_index(&self, idx: &dyn ImageIndex) -> Result<Descriptor> {
        self.write_index_blobs(idx).await?;
        let desc = index_descriptor_of(idx).await?;
        self.append_descriptor(desc.clone()).await?;
        Ok(desc)
    }

    async fn write_index_blobs(&self, idx: &dyn ImageIndex) -> Result<()> {
        let manifest = idx.index_manifest().await?;
        for child in &manifest.manifests {
            if child.media_type.is_index() {
                let sub = idx.image_index(&child.digest).await?;
                Box::pin(self.write_index_blobs(sub.as_ref())).await?;
            } else {
                let img = idx.image(&child.digest).await?;
                self.write_image_blobs(img.as_ref()).await?;
            }
        }
        self.write_blob(&idx.raw_manifest().await?).await?;
        Ok(())
    }

    async fn append_descriptor(&self, desc: Descriptor) -> Result<()> {
        let mut index = self.read_index().await?;
        index.manifests.push(desc);
        tokio::fs::write(self.root.join(INDEX_FILE), serde_json::to_vec(&index)?).await?;
        Ok(())
    }

    async fn read_index(&self) -> Result<IndexManifest> {
        let bytes = tokio::fs::read(self.root.join(INDEX_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The top-level index as an `ImageIndex`.
    pub async fn image_index(&self) -> Result<Arc<dyn ImageIndex>> {
        let raw = Bytes::from(tokio::fs::read(self.root.join(INDEX_FILE)).await?);
        Ok(Arc::new(LayoutIndex {
            layout: self.clone(),
            raw,
            media_type: MediaType::OciImageIndex,
        }))
    }
}

/// Write an index and all its blobs as a fresh layout, replacing the
/// top-level index wholesale.
pub async fn write_index_to(root: impl Into<PathBuf>, idx: &dyn ImageIndex) -> Result<Layout> {
    let layout = Layout::write(root).await?;
    layout.write_index_blobs(idx).await?;
    tokio::fs::write(
        layout.root.join(INDEX_FILE),
        idx.raw_manifest().await?.as_ref(),
    )
    .await?;
    Ok(layout)
}

struct LayoutIndex {
    layout: Layout,
    raw: Bytes,
    media_type: MediaType,
}

#[async_trait]
impl ImageIndex for LayoutIndex {
    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.raw.clone())
    }

    async fn image(&self, digest: &Digest) -> Result<Arc<dyn Image>> {
        let manifest = self.index_manifest().await?;
        let desc = manifest
            .manifests
            .iter()
            .find(|d| &d.digest == digest)
            .ok_or_else(|| Error::NotFound(format!("no descriptor for {digest} in index")))?;
        if desc.media_type.is_index() {
            return Err(Error::UnsupportedMediaType(format!(
                "{digest} is an index, not an image"
            )));
        }
        let raw = self.layout.blob(digest).await?;
        Ok(Arc::new(LayoutImage {
            layout: self.layout.clone(),
            media_type: desc.media_type.clone(),
            raw,
        }))
    }

    async fn image_index(&self, digest: &Digest) -> Result<Arc<dyn ImageIndex>> {
        let raw = self.layout.blob(digest).await?;
        Ok(Arc::new(LayoutIndex {
            layout: self.layout.clone(),
            raw,
            media_type: MediaType::OciImageIndex,
        }))
    }
}

struct LayoutImage {
    layout: Layout,
    media_type: MediaType,
    raw: Bytes,
}

#[async_trait]
impl Image for LayoutImage {
    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.raw.clone())
    }

    async fn raw_config_file(&self) -> Result<Bytes> {
        let manifest = self.manifest().await?;
        self.layout.blob(&manifest.config.digest).await
    }

    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>> {
        let manifest = self.manifest().await?;
        let mut layers: Vec<Arc<dyn Layer>> = Vec::with_capacity(manifest.layers.len());
        for desc in &manifest.layers {
            let blob = self.layout.blob(&desc.digest).await?;
            layers.push(Arc::new(StaticLayer::new(blob, desc.media_type.clone())));
        }
        Ok(layers)
    }
}
