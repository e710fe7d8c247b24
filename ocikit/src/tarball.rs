use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::layer::{Layer, StaticLayer, is_gzipped};
use crate::mediatype::MediaType;
use crate::reference::Reference;
use crate::types::{Descriptor, Manifest};

/// One entry of a docker tarball's `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TarballDescriptor {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// Serialize an image as a docker tarball.
///
/// The writer is reproducible: entries are emitted in lexicographic order
/// with zero mtime and uid/gid 0, so equal images yield equal archives.
pub async fn write_image(reference: Option<&Reference>, img: &dyn Image) -> Result<Bytes> {
    let mut entries: BTreeMap<String, Bytes> = BTreeMap::new();

    let raw_config = img.raw_config_file().await?;
    let config_name = format!("{}.json", Digest::sha256_of(&raw_config).hex());
    entries.insert(config_name.clone(), raw_config);

    let mut layer_names = Vec::new();
    for layer in img.layers().await? {
        let blob = layer.compressed().await?;
        let suffix = if is_gzipped(&blob) { "tar.gz" } else { "tar" };
        let name = format!("{}.{}", layer.digest().await?.hex(), suffix);
        entries.insert(name.clone(), blob);
        layer_names.push(name);
    }

    let descriptor = TarballDescriptor {
        config: config_name,
        repo_tags: reference.map(|r| vec![r.to_string()]).unwrap_or_default(),
        layers: layer_names,
    };
    entries.insert(
        "manifest.json".to_string(),
        Bytes::from(serde_json::to_vec(&vec![descriptor])?),
    );

    write_entries(entries)
}

pub async fn write_to_file(
    path: impl AsRef<Path>,
    reference: Option<&Reference>,
    img: &dyn Image,
) -> Result<()> {
    let bytes = write_image(reference, img).await?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

fn write_entries(entries: BTreeMap<String, Bytes>) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_ref())?;
    }
    Ok(Bytes::from(builder.into_inner()?))
}

/// The legacy pre-1.10 docker format: one directory per layer holding
/// `VERSION`, `json` and an uncompressed `layer.tar`, plus a top-level
/// `repositories` file pointing at the last layer.
pub async fn write_legacy_image(reference: &Reference, img: &dyn Image) -> Result<Bytes> {
    #[derive(Serialize)]
    struct LegacyLayerJson {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent: Option<String>,
    }

    let mut entries: BTreeMap<String, Bytes> = BTreeMap::new();
    let mut parent: Option<String> = None;
    let mut last_id = String::new();
    for layer in img.layers().await? {
        let id = layer.diff_id().await?.hex().to_string();
        entries.insert(format!("{id}/VERSION"), Bytes::from_static(b"1.0"));
        entries.insert(
            format!("{id}/json"),
            Bytes::from(serde_json::to_vec(&LegacyLayerJson {
                id: id.clone(),
                parent: parent.take(),
            })?),
        );
        entries.insert(format!("{id}/layer.tar"), layer.uncompressed().await?);
        parent = Some(id.clone());
        last_id = id;
    }

    let mut repositories: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let tag = reference.tag().unwrap_or("latest").to_string();
    repositories.insert(
        reference.context().name().to_string(),
        BTreeMap::from([(tag, last_id)]),
    );
    entries.insert(
        "repositories".to_string(),
        Bytes::from(serde_json::to_vec(&repositories)?),
    );

    write_entries(entries)
}

/// An image read out of a docker tarball. The original config bytes are
/// preserved so digests survive a round trip.
pub struct TarballImage {
    raw_config: Bytes,
    layers: Vec<Arc<dyn Layer>>,
    computed: OnceCell<Bytes>,
}

impl TarballImage {
    async fn manifest_bytes(&self) -> Result<&Bytes> {
        self.computed
            .get_or_try_init(|| async {
                let mut layer_descs = Vec::with_capacity(self.layers.len());
                for layer in &self.layers {
                    layer_descs.push(Descriptor::new(
                        layer.media_type(),
                        layer.size().await?,
                        layer.digest().await?,
                    ));
                }
                let manifest = Manifest {
                    schema_version: 2,
                    media_type: Some(MediaType::DockerManifestSchema2),
                    artifact_type: None,
                    config: Descriptor::new(
                        MediaType::DockerConfig,
                        self.raw_config.len() as i64,
                        Digest::sha256_of(&self.raw_config),
                    ),
                    layers: layer_descs,
                    annotations: None,
                    subject: None,
                };
                Ok::<_, Error>(Bytes::from(serde_json::to_vec(&manifest)?))
            })
            .await
    }
}

#[async_trait]
impl Image for TarballImage {
    fn media_type(&self) -> MediaType {
        MediaType::DockerManifestSchema2
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.manifest_bytes().await?.clone())
    }

    async fn raw_config_file(&self) -> Result<Bytes> {
        Ok(self.raw_config.clone())
    }

    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>> {
        Ok(self.layers.clone())
    }
}

/// Read an image from tarball bytes. `tag` selects among multi-image
/// archives; a single-image archive needs no tag.
pub fn image_from_bytes(archive: Bytes, tag: Option<&str>) -> Result<Arc<dyn Image>> {
    let mut files: BTreeMap<String, Bytes> = BTreeMap::new();
    let mut reader = tar::Archive::new(std::io::Cursor::new(archive.as_ref()));
    for entry in reader.entries()? {
        let mut entry = entry?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(path, Bytes::from(data));
    }

    let manifest_bytes = files
        .get("manifest.json")
        .ok_or_else(|| Error::Validation("tarball has no manifest.json".to_string()))?;
    let descriptors: Vec<TarballDescriptor> = serde_json::from_slice(manifest_bytes)?;

    let descriptor = match tag {
        Some(tag) => {
            let wanted = Reference::parse(tag)?;
            descriptors
                .iter()
                .find(|d| {
                    d.repo_tags.iter().any(|t| {
                        t == tag || Reference::parse(t).map(|r| r == wanted).unwrap_or(false)
                    })
                })
                .ok_or_else(|| Error::NotFound(format!("tag {tag} not present in tarball")))?
        }
        None => {
            if descriptors.len() != 1 {
                return Err(Error::Validation(format!(
                    "tarball holds {} images, a tag is required",
                    descriptors.len()
                )));
            }
            &descriptors[0]
        }
    };

    let raw_config = files
        .get(&descriptor.config)
        .cloned()
        .ok_or_else(|| Error::Validation(format!("missing config {}", descriptor.config)))?;

    let mut layers: Vec<Arc<dyn Layer>> = Vec::with_capacity(descriptor.layers.len());
    for name in &descriptor.layers {
        let blob = files
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("missing layer {name}")))?;
        let media_type = if is_gzipped(&blob) {
            MediaType::DockerLayer
        } else {
            MediaType::DockerUncompressedLayer
        };
        layers.push(Arc::new(StaticLayer::new(blob, media_type)));
    }

    Ok(Arc::new(TarballImage {
        raw_config,
        layers,
        computed: OnceCell::new(),
    }))
}

pub async fn image_from_file(
    path: impl AsRef<Path>,
    tag: Option<&str>,
) -> Result<Arc<dyn Image>> {
    let bytes = tokio::fs::read(path).await?;
    image_from_bytes(Bytes::from(bytes), tag)
}
