use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::mediatype::MediaType;
use crate::types::{ConfigFile, Descriptor, IndexManifest, Manifest, Platform, RootFs};

/// An OCI image: manifest + config + ordered layers.
///
/// Everything is lazy; implementations only need `raw_manifest`,
/// `raw_config_file` and `layers`, the rest derives.
#[async_trait]
pub trait Image: Send + Sync {
    fn media_type(&self) -> MediaType;

    /// The exact manifest bytes; their sha256 is the image digest.
    async fn raw_manifest(&self) -> Result<Bytes>;

    async fn manifest(&self) -> Result<Manifest> {
        Ok(serde_json::from_slice(&self.raw_manifest().await?)?)
    }

    async fn digest(&self) -> Result<Digest> {
        Ok(Digest::sha256_of(&self.raw_manifest().await?))
    }

    async fn size(&self) -> Result<i64> {
        Ok(self.raw_manifest().await?.len() as i64)
    }

    async fn raw_config_file(&self) -> Result<Bytes>;

    async fn config_file(&self) -> Result<ConfigFile> {
        Ok(serde_json::from_slice(&self.raw_config_file().await?)?)
    }

    async fn config_name(&self) -> Result<Digest> {
        Ok(Digest::sha256_of(&self.raw_config_file().await?))
    }

    /// Layers in manifest order, base first.
    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>>;

    async fn layer_by_digest(&self, digest: &Digest) -> Result<Arc<dyn Layer>> {
        for layer in self.layers().await? {
            if &layer.digest().await? == digest {
                return Ok(layer);
            }
        }
        Err(Error::NotFound(format!("no layer with digest {digest}")))
    }

    async fn layer_by_diff_id(&self, diff_id: &Digest) -> Result<Arc<dyn Layer>> {
        for layer in self.layers().await? {
            if &layer.diff_id().await? == diff_id {
                return Ok(layer);
            }
        }
        Err(Error::NotFound(format!("no layer with diff id {diff_id}")))
    }
}

/// An image index: platform-partitioned child images or sub-indexes.
#[async_trait]
pub trait ImageIndex: Send + Sync {
    fn media_type(&self) -> MediaType;

    async fn raw_manifest(&self) -> Result<Bytes>;

    async fn index_manifest(&self) -> Result<IndexManifest> {
        Ok(serde_json::from_slice(&self.raw_manifest().await?)?)
    }

    async fn digest(&self) -> Result<Digest> {
        Ok(Digest::sha256_of(&self.raw_manifest().await?))
    }

    async fn size(&self) -> Result<i64> {
        Ok(self.raw_manifest().await?.len() as i64)
    }

    /// The child image with the given digest.
    async fn image(&self, digest: &Digest) -> Result<Arc<dyn Image>>;

    /// The child sub-index with the given digest.
    async fn image_index(&self, digest: &Digest) -> Result<Arc<dyn ImageIndex>>;
}

/// Descriptor for an image, as it would appear in an index or referrers
/// response.
pub async fn descriptor_of(img: &dyn Image) -> Result<Descriptor> {
    let raw = img.raw_manifest().await?;
    let manifest = img.manifest().await?;
    let mut desc = Descriptor::new(
        img.media_type(),
        raw.len() as i64,
        Digest::sha256_of(&raw),
    );
    desc.annotations = manifest.annotations.clone();
    // Artifact typing: an explicit artifactType wins, else a non-standard
    // config media type is the artifact type.
    desc.artifact_type = manifest.artifact_type.clone().or_else(|| {
        if manifest.config.media_type.is_config() {
            None
        } else {
            Some(manifest.config.media_type.as_str().to_string())
        }
    });
    Ok(desc)
}

pub async fn index_descriptor_of(idx: &dyn ImageIndex) -> Result<Descriptor> {
    let raw = idx.raw_manifest().await?;
    Ok(Descriptor::new(
        idx.media_type(),
        raw.len() as i64,
        Digest::sha256_of(&raw),
    ))
}

/// Per-layer descriptor extras a mutation may attach.
#[derive(Debug, Clone, Default)]
pub struct LayerExtras {
    pub annotations: Option<BTreeMap<String, String>>,
    pub urls: Option<Vec<String>>,
}

struct ComputedImage {
    raw_config: Bytes,
    raw_manifest: Bytes,
}

/// A concrete image built from a config file and layers.
///
/// This is the value the mutate engine produces: the manifest and config
/// bytes are derived lazily, `rootfs.diff_ids` always restates the layers.
pub struct ImageCore {
    pub(crate) config_file: ConfigFile,
    pub(crate) layers: Vec<Arc<dyn Layer>>,
    pub(crate) layer_extras: Vec<LayerExtras>,
    pub(crate) media_type: MediaType,
    pub(crate) config_media_type: MediaType,
    pub(crate) annotations: Option<BTreeMap<String, String>>,
    pub(crate) subject: Option<Descriptor>,
    computed: OnceCell<ComputedImage>,
}

impl ImageCore {
    /// The empty image: no layers, an empty config. The starting point for
    /// `append` and `attach`.
    pub fn empty() -> Self {
        Self {
            config_file: ConfigFile::default(),
            layers: Vec::new(),
            layer_extras: Vec::new(),
            media_type: MediaType::OciManifest,
            config_media_type: MediaType::OciConfig,
            annotations: None,
            subject: None,
            computed: OnceCell::new(),
        }
    }

    /// Materialize another image into an editable core, sharing its layers.
    pub async fn from_image(img: &dyn Image) -> Result<Self> {
        let manifest = img.manifest().await?;
        let config_file = img.config_file().await?;
        let layers = img.layers().await?;
        let layer_extras = manifest
            .layers
            .iter()
            .map(|d| LayerExtras {
                annotations: d.annotations.clone(),
                urls: d.urls.clone(),
            })
            .collect();
        Ok(Self {
            config_file,
            layers,
            layer_extras,
            media_type: img.media_type(),
            config_media_type: manifest.config.media_type.clone(),
            annotations: manifest.annotations.clone(),
            subject: manifest.subject.clone(),
            computed: OnceCell::new(),
        })
    }

    async fn compute(&self) -> Result<&ComputedImage> {
        self.computed
            .get_or_try_init(|| async {
                let mut config_file = self.config_file.clone();
                let mut diff_ids = Vec::with_capacity(self.layers.len());
                for layer in &self.layers {
                    diff_ids.push(layer.diff_id().await?);
                }
                config_file.rootfs = RootFs {
                    fs_type: "layers".to_string(),
                    diff_ids,
                };
                let raw_config = Bytes::from(serde_json::to_vec(&config_file)?);

                let mut layer_descs = Vec::with_capacity(self.layers.len());
                for (i, layer) in self.layers.iter().enumerate() {
                    let mut desc = Descriptor::new(
                        layer.media_type(),
                        layer.size().await?,
                        layer.digest().await?,
                    );
                    if let Some(extras) = self.layer_extras.get(i) {
                        desc.annotations = extras.annotations.clone();
                        desc.urls = extras.urls.clone();
                    }
                    layer_descs.push(desc);
                }

                let manifest = Manifest {
                    schema_version: 2,
                    media_type: Some(self.media_type.clone()),
                    artifact_type: None,
                    config: Descriptor::new(
                        self.config_media_type.clone(),
                        raw_config.len() as i64,
                        Digest::sha256_of(&raw_config),
                    ),
                    layers: layer_descs,
                    annotations: self.annotations.clone(),
                    subject: self.subject.clone(),
                };
                let raw_manifest = Bytes::from(serde_json::to_vec(&manifest)?);
                Ok::<_, Error>(ComputedImage {
                    raw_config,
                    raw_manifest,
                })
            })
            .await
    }
}

#[async_trait]
impl Image for ImageCore {
    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.compute().await?.raw_manifest.clone())
    }

    async fn raw_config_file(&self) -> Result<Bytes> {
        Ok(self.compute().await?.raw_config.clone())
    }

    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>> {
        Ok(self.layers.clone())
    }
}

/// A child of a built index.
#[derive(Clone)]
pub enum IndexChild {
    Image(Arc<dyn Image>),
    Index(Arc<dyn ImageIndex>),
}

/// Descriptor overrides for an index child (platform and friends).
#[derive(Debug, Clone, Default)]
pub struct ChildExtras {
    pub platform: Option<Platform>,
    pub annotations: Option<BTreeMap<String, String>>,
    pub artifact_type: Option<String>,
}

struct ComputedIndex {
    raw_manifest: Bytes,
}

/// A concrete index built from child images/indexes.
pub struct IndexCore {
    pub(crate) children: Vec<(IndexChild, ChildExtras)>,
    pub(crate) media_type: MediaType,
    pub(crate) annotations: Option<BTreeMap<String, String>>,
    pub(crate) subject: Option<Descriptor>,
    computed: OnceCell<ComputedIndex>,
}

impl IndexCore {
    pub fn empty() -> Self {
        Self {
            children: Vec::new(),
            media_type: MediaType::OciImageIndex,
            annotations: None,
            subject: None,
            computed: OnceCell::new(),
        }
    }

    /// Materialize another index into an editable core, resolving children.
    pub async fn from_index(idx: &dyn ImageIndex) -> Result<Self> {
        let manifest = idx.index_manifest().await?;
        let mut children = Vec::with_capacity(manifest.manifests.len());
        for desc in &manifest.manifests {
            let extras = ChildExtras {
                platform: desc.platform.clone(),
                annotations: desc.annotations.clone(),
                artifact_type: desc.artifact_type.clone(),
            };
            let child = if desc.media_type.is_index() {
                IndexChild::Index(idx.image_index(&desc.digest).await?)
            } else {
                IndexChild::Image(idx.image(&desc.digest).await?)
            };
            children.push((child, extras));
        }
        Ok(Self {
            children,
            media_type: idx.media_type(),
            annotations: manifest.annotations.clone(),
            subject: manifest.subject.clone(),
            computed: OnceCell::new(),
        })
    }

    pub(crate) async fn child_descriptor(
        child: &IndexChild,
        extras: &ChildExtras,
    ) -> Result<Descriptor> {
        let mut desc = match child {
            IndexChild::Image(img) => descriptor_of(img.as_ref()).await?,
            IndexChild::Index(idx) => index_descriptor_of(idx.as_ref()).await?,
        };
        if extras.platform.is_some() {
            desc.platform = extras.platform.clone();
        }
        if extras.annotations.is_some() {
            desc.annotations = extras.annotations.clone();
        }
        if extras.artifact_type.is_some() {
            desc.artifact_type = extras.artifact_type.clone();
        }
        Ok(desc)
    }

    async fn compute(&self) -> Result<&ComputedIndex> {
        self.computed
            .get_or_try_init(|| async {
                let mut descs = Vec::with_capacity(self.children.len());
                for (child, extras) in &self.children {
                    descs.push(Self::child_descriptor(child, extras).await?);
                }
                let manifest = IndexManifest {
                    schema_version: 2,
                    media_type: Some(self.media_type.clone()),
                    artifact_type: None,
                    manifests: descs,
                    annotations: self.annotations.clone(),
                    subject: self.subject.clone(),
                };
                Ok::<_, Error>(ComputedIndex {
                    raw_manifest: Bytes::from(serde_json::to_vec(&manifest)?),
                })
            })
            .await
    }
}

#[async_trait]
impl ImageIndex for IndexCore {
    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.compute().await?.raw_manifest.clone())
    }

    async fn image(&self, digest: &Digest) -> Result<Arc<dyn Image>> {
        for (child, _) in &self.children {
            if let IndexChild::Image(img) = child {
                if &img.digest().await? == digest {
                    return Ok(img.clone());
                }
            }
        }
        Err(Error::NotFound(format!("no child image {digest}")))
    }

    async fn image_index(&self, digest: &Digest) -> Result<Arc<dyn ImageIndex>> {
        for (child, _) in &self.children {
            if let IndexChild::Index(idx) = child {
                if &idx.digest().await? == digest {
                    return Ok(idx.clone());
                }
            }
        }
        Err(Error::NotFound(format!("no child index {digest}")))
    }
}
