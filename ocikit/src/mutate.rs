use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::image::{
    ChildExtras, Image, ImageCore, ImageIndex, IndexChild, IndexCore, LayerExtras,
};
use crate::layer::{self, Layer, StaticLayer};
use crate::mediatype::MediaType;
use crate::types::{Config, ConfigFile, Descriptor, History, Platform};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// One layer (or empty history entry) to add to an image.
pub struct Addendum {
    pub layer: Option<Arc<dyn Layer>>,
    pub history: History,
    pub annotations: Option<BTreeMap<String, String>>,
    pub urls: Option<Vec<String>>,
    pub media_type: Option<MediaType>,
}

impl Addendum {
    pub fn layer(layer: Arc<dyn Layer>) -> Self {
        Self {
            layer: Some(layer),
            history: History::default(),
            annotations: None,
            urls: None,
            media_type: None,
        }
    }
}

/// Append layers with default history entries.
pub async fn append_layers(
    img: &dyn Image,
    layers: Vec<Arc<dyn Layer>>,
) -> Result<ImageCore> {
    let addenda = layers
        .into_iter()
        .map(|layer| Addendum {
            layer: Some(layer),
            history: History {
                created_by: Some("append layer".to_string()),
                ..Default::default()
            },
            annotations: None,
            urls: None,
            media_type: None,
        })
        .collect();
    append(img, addenda).await
}

/// Append addenda: layers extend both the manifest and the config, empty
/// addenda only add history.
pub async fn append(img: &dyn Image, addenda: Vec<Addendum>) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    for add in addenda {
        match add.layer {
            Some(layer) => {
                let layer = match add.media_type {
                    Some(mt) => layer::with_media_type(layer, mt),
                    None => layer,
                };
                if add.history.empty_layer {
                    return Err(Error::Validation(
                        "addendum with a layer must not be marked empty_layer".to_string(),
                    ));
                }
                core.config_file.history.push(add.history);
                core.layers.push(layer);
                core.layer_extras.push(LayerExtras {
                    annotations: add.annotations,
                    urls: add.urls,
                });
            }
            None => {
                if !add.history.empty_layer {
                    return Err(Error::Validation(
                        "addendum without a layer must set history.empty_layer".to_string(),
                    ));
                }
                core.config_file.history.push(add.history);
            }
        }
    }
    Ok(core)
}

/// Replace the execution config subtree.
pub async fn config(img: &dyn Image, cfg: Config) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    core.config_file.config = cfg;
    Ok(core)
}

/// Replace the whole config file. `rootfs.diff_ids` stays authoritative
/// from the layers and is recomputed on serialization.
pub async fn config_file(img: &dyn Image, cf: ConfigFile) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    core.config_file = cf;
    Ok(core)
}

/// Merge annotations into the manifest; new keys supersede.
pub async fn annotations(
    img: &dyn Image,
    new: BTreeMap<String, String>,
) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    let mut merged = core.annotations.take().unwrap_or_default();
    merged.extend(new);
    core.annotations = Some(merged);
    Ok(core)
}

/// Merge annotations into an index manifest.
pub async fn index_annotations(
    idx: &dyn ImageIndex,
    new: BTreeMap<String, String>,
) -> Result<IndexCore> {
    let mut core = IndexCore::from_index(idx).await?;
    let mut merged = core.annotations.take().unwrap_or_default();
    merged.extend(new);
    core.annotations = Some(merged);
    Ok(core)
}

pub async fn media_type(img: &dyn Image, mt: MediaType) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    core.media_type = mt;
    Ok(core)
}

pub async fn config_media_type(img: &dyn Image, mt: MediaType) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    core.config_media_type = mt;
    Ok(core)
}

pub async fn index_media_type(idx: &dyn ImageIndex, mt: MediaType) -> Result<IndexCore> {
    let mut core = IndexCore::from_index(idx).await?;
    core.media_type = mt;
    Ok(core)
}

/// Set the manifest's subject, for attachments and referrers.
pub async fn subject(img: &dyn Image, desc: Descriptor) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    core.subject = Some(desc);
    Ok(core)
}

pub async fn index_subject(idx: &dyn ImageIndex, desc: Descriptor) -> Result<IndexCore> {
    let mut core = IndexCore::from_index(idx).await?;
    core.subject = Some(desc);
    Ok(core)
}

/// Replace the old-base layer prefix of `orig` with `new_base`'s layers,
/// splicing config and history accordingly.
pub async fn rebase(
    orig: &dyn Image,
    old_base: &dyn Image,
    new_base: &dyn Image,
) -> Result<ImageCore> {
    let orig_layers = orig.layers().await?;
    let old_layers = old_base.layers().await?;
    let new_layers = new_base.layers().await?;

    if old_layers.len() > orig_layers.len() {
        return Err(Error::RebaseIncompatible(format!(
            "old base has {} layers but the image only has {}",
            old_layers.len(),
            orig_layers.len()
        )));
    }
    for (i, old) in old_layers.iter().enumerate() {
        let old_digest = old.digest().await?;
        let orig_digest = orig_layers[i].digest().await?;
        if old_digest != orig_digest {
            return Err(Error::NotBased(format!(
                "layer {i} digest {orig_digest} does not match old base layer {old_digest}"
            )));
        }
    }

    let orig_cf = orig.config_file().await?;
    let old_cf = old_base.config_file().await?;
    let new_cf = new_base.config_file().await?;
    if old_cf.history.len() > orig_cf.history.len() {
        return Err(Error::RebaseIncompatible(format!(
            "old base has {} history entries but the image only has {}",
            old_cf.history.len(),
            orig_cf.history.len()
        )));
    }

    // When the bases disagree on layer family (Docker vs OCI), the new
    // base's family dominates and the kept top layers are renamed to it.
    let dominant = new_layers
        .first()
        .map(|l| l.media_type())
        .unwrap_or_else(|| MediaType::OciLayer);
    let top: Vec<Arc<dyn Layer>> = orig_layers[old_layers.len()..]
        .iter()
        .map(|l| {
            let mt = l.media_type();
            let converted = if dominant.to_oci() == dominant {
                mt.to_oci()
            } else {
                mt.to_docker()
            };
            if converted == mt {
                l.clone()
            } else {
                layer::with_media_type(l.clone(), converted)
            }
        })
        .collect();

    let mut core = ImageCore::from_image(orig).await?;
    core.layers = new_layers.into_iter().chain(top).collect();
    core.layer_extras = vec![LayerExtras::default(); core.layers.len()];

    let mut cf = orig_cf.clone();
    cf.architecture = new_cf.architecture.clone();
    cf.os = new_cf.os.clone();
    cf.os_version = new_cf.os_version.clone();
    cf.variant = new_cf.variant.clone();
    let mut history = new_cf.history.clone();
    history.extend(orig_cf.history[old_cf.history.len()..].iter().cloned());
    cf.history = history;
    cf.config = orig_cf.config.clone();
    core.config_file = cf;
    Ok(core)
}

/// Rebase each platform of `orig` against the matching-platform children of
/// the old and new base indexes. Platforms present only in `orig` are kept
/// verbatim; platforms only in the new base are ignored.
pub async fn rebase_index(
    orig: &dyn ImageIndex,
    old_base: &dyn ImageIndex,
    new_base: &dyn ImageIndex,
) -> Result<IndexCore> {
    async fn child_for_platform(
        idx: &dyn ImageIndex,
        platform: &Platform,
    ) -> Result<Option<Arc<dyn Image>>> {
        let manifest = idx.index_manifest().await?;
        for desc in &manifest.manifests {
            if desc.media_type.is_image() {
                if let Some(p) = &desc.platform {
                    if p == platform {
                        return Ok(Some(idx.image(&desc.digest).await?));
                    }
                }
            }
        }
        Ok(None)
    }

    let mut core = IndexCore::from_index(orig).await?;
    let mut rebased: Vec<(IndexChild, ChildExtras)> = Vec::with_capacity(core.children.len());
    for (child, extras) in core.children.drain(..) {
        let platform = extras.platform.clone();
        match (&child, platform) {
            (IndexChild::Image(img), Some(platform)) => {
                let old = child_for_platform(old_base, &platform).await?;
                let new = child_for_platform(new_base, &platform).await?;
                match (old, new) {
                    (Some(old), Some(new)) => {
                        let out = rebase(img.as_ref(), old.as_ref(), new.as_ref()).await?;
                        rebased.push((IndexChild::Image(Arc::new(out)), extras));
                    }
                    _ => rebased.push((child, extras)),
                }
            }
            _ => rebased.push((child, extras)),
        }
    }
    core.children = rebased;
    Ok(core)
}

struct ParsedEntry {
    // Normalized path, no leading "./" and no trailing "/".
    key: String,
    // Path as it appeared in the archive, re-emitted verbatim.
    path: String,
    header: tar::Header,
    data: Vec<u8>,
}

enum LayerItem {
    Entry(ParsedEntry),
    Whiteout(String),
    Opaque(String),
}

fn normalize_path(p: &str) -> String {
    p.trim_start_matches("./").trim_end_matches('/').to_string()
}

fn parent_and_base(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", key),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn is_under(dir: &str, key: &str) -> bool {
    !dir.is_empty() && key.starts_with(dir) && key[dir.len()..].starts_with('/')
}

fn parse_layer_tar(raw: &[u8]) -> Result<Vec<LayerItem>> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(raw));
    let mut items = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        let key = normalize_path(&path);
        if key.is_empty() {
            continue;
        }
        let (dir, base) = parent_and_base(&key);
        if base == OPAQUE_WHITEOUT {
            items.push(LayerItem::Opaque(dir.to_string()));
            continue;
        }
        if let Some(name) = base.strip_prefix(WHITEOUT_PREFIX) {
            items.push(LayerItem::Whiteout(join_path(dir, name)));
            continue;
        }
        let header = entry.header().clone();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        items.push(LayerItem::Entry(ParsedEntry {
            key,
            path,
            header,
            data,
        }));
    }
    Ok(items)
}

/// Materialize the image's filesystem as one tar, applying whiteouts.
///
/// Output order is stable: entries appear by layer (base first), then by
/// in-tar order, with overwritten and deleted entries omitted.
pub async fn extract(img: &dyn Image) -> Result<Bytes> {
    let mut layers_items: Vec<Vec<LayerItem>> = Vec::new();
    for layer in img.layers().await? {
        let raw = layer.uncompressed().await?;
        layers_items.push(parse_layer_tar(&raw)?);
    }

    // Last regular entry per path wins, across and within layers.
    let mut winner: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    for (li, items) in layers_items.iter().enumerate() {
        for (si, item) in items.iter().enumerate() {
            if let LayerItem::Entry(e) = item {
                winner.insert(e.key.clone(), (li, si));
            }
        }
    }

    let deleted_above = |key: &str, layer_idx: usize| -> bool {
        for items in layers_items.iter().skip(layer_idx + 1) {
            for item in items {
                match item {
                    LayerItem::Whiteout(w) => {
                        if w == key || is_under(w, key) {
                            return true;
                        }
                    }
                    LayerItem::Opaque(dir) => {
                        if is_under(dir, key) {
                            return true;
                        }
                    }
                    LayerItem::Entry(_) => {}
                }
            }
        }
        false
    };

    let mut builder = tar::Builder::new(Vec::new());
    for (li, items) in layers_items.iter().enumerate() {
        for (si, item) in items.iter().enumerate() {
            let LayerItem::Entry(e) = item else { continue };
            if winner.get(&e.key) != Some(&(li, si)) {
                continue;
            }
            if deleted_above(&e.key, li) {
                continue;
            }
            let mut header = e.header.clone();
            builder.append_data(&mut header, e.path.clone(), e.data.as_slice())?;
        }
    }
    Ok(Bytes::from(builder.into_inner()?))
}

fn layer_family_of(img_media_type: &MediaType) -> MediaType {
    if matches!(
        img_media_type,
        MediaType::DockerManifestSchema2 | MediaType::DockerManifestList
    ) {
        MediaType::DockerLayer
    } else {
        MediaType::OciLayer
    }
}

/// Collapse all layers into one. The original history is preserved as JSON
/// in the replacement entry's comment.
pub async fn flatten(img: &dyn Image) -> Result<ImageCore> {
    let tar = extract(img).await?;
    let merged = StaticLayer::from_uncompressed_tar(tar, layer_family_of(&img.media_type()))?;

    let mut core = ImageCore::from_image(img).await?;
    let original_history = std::mem::take(&mut core.config_file.history);
    core.config_file.history = vec![History {
        created: core.config_file.created,
        comment: Some(serde_json::to_string(&original_history)?),
        ..Default::default()
    }];
    core.layers = vec![Arc::new(merged)];
    core.layer_extras = vec![LayerExtras::default()];
    Ok(core)
}

/// Keep the first `len - n` layers and merge the last `n` into one.
pub async fn partial_flatten(img: &dyn Image, n: usize) -> Result<ImageCore> {
    let layers = img.layers().await?;
    if n == 0 || n > layers.len() {
        return Err(Error::Validation(format!(
            "cannot merge {n} layers of an image with {}",
            layers.len()
        )));
    }
    let keep = layers.len() - n;

    // A synthetic image over only the top layers drives the merge.
    let mut synthetic = ImageCore::empty();
    synthetic.layers = layers[keep..].to_vec();
    synthetic.layer_extras = vec![LayerExtras::default(); n];
    let tar = extract(&synthetic).await?;
    let merged = StaticLayer::from_uncompressed_tar(tar, layer_family_of(&img.media_type()))?;

    let mut core = ImageCore::from_image(img).await?;
    let history = std::mem::take(&mut core.config_file.history);
    let kept_history: Vec<History> = history.iter().take(keep).cloned().collect();
    let merged_history = History {
        created: core.config_file.created,
        comment: Some(serde_json::to_string(&history[keep.min(history.len())..])?),
        ..Default::default()
    };
    core.config_file.history = kept_history.into_iter().chain([merged_history]).collect();
    core.layers = layers[..keep].to_vec();
    core.layers.push(Arc::new(merged));
    core.layer_extras = vec![LayerExtras::default(); core.layers.len()];
    Ok(core)
}

/// Like `flatten`, but the original history and metadata are retained
/// verbatim instead of being collapsed into a comment.
pub async fn squash(img: &dyn Image) -> Result<ImageCore> {
    let tar = extract(img).await?;
    let merged = StaticLayer::from_uncompressed_tar(tar, layer_family_of(&img.media_type()))?;
    let mut core = ImageCore::from_image(img).await?;
    core.layers = vec![Arc::new(merged)];
    core.layer_extras = vec![LayerExtras::default()];
    Ok(core)
}

async fn retime_layer(layer: &Arc<dyn Layer>, mtime: u64) -> Result<Arc<dyn Layer>> {
    let raw = layer.uncompressed().await?;
    let mut archive = tar::Archive::new(std::io::Cursor::new(raw.as_ref()));
    let mut builder = tar::Builder::new(Vec::new());
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        let mut header = entry.header().clone();
        header.set_mtime(mtime);
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        builder.append_data(&mut header, path, data.as_slice())?;
    }
    let tar = builder.into_inner()?;
    Ok(Arc::new(StaticLayer::from_uncompressed_tar(
        Bytes::from(tar),
        layer.media_type(),
    )?))
}

/// Set the config's `created`, every history timestamp, and every layer
/// entry's mtime to `t`.
pub async fn time(img: &dyn Image, t: DateTime<Utc>) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    core.config_file.created = Some(t);
    for h in &mut core.config_file.history {
        h.created = Some(t);
    }
    let mtime = t.timestamp().max(0) as u64;
    let mut retimed = Vec::with_capacity(core.layers.len());
    for layer in &core.layers {
        retimed.push(retime_layer(layer, mtime).await?);
    }
    core.layers = retimed;
    Ok(core)
}

/// Alias for `time`, matching the verb used at the façade.
pub async fn created_at(img: &dyn Image, t: DateTime<Utc>) -> Result<ImageCore> {
    time(img, t).await
}

/// Zero nondeterministic metadata and pin layer mtimes to the epoch.
pub async fn canonical(img: &dyn Image) -> Result<ImageCore> {
    let epoch = Utc.timestamp_opt(0, 0).single().ok_or_else(|| {
        Error::Validation("epoch timestamp out of range".to_string())
    })?;
    let mut core = time(img, epoch).await?;
    core.config_file.container = None;
    core.config_file.docker_version = None;
    core.config_file.config.hostname = None;
    Ok(core)
}

/// Convert to OCI media types. Layer bytes are untouched (digests keep),
/// Docker-specific config fields are stripped.
pub async fn oci_image(img: &dyn Image) -> Result<ImageCore> {
    let mut core = ImageCore::from_image(img).await?;
    core.media_type = MediaType::OciManifest;
    if core.config_media_type.is_config() {
        core.config_media_type = MediaType::OciConfig;
    }
    core.layers = core
        .layers
        .iter()
        .map(|l| {
            let mt = l.media_type();
            let oci = mt.to_oci();
            if oci == mt {
                l.clone()
            } else {
                layer::with_media_type(l.clone(), oci)
            }
        })
        .collect();
    core.config_file.container = None;
    core.config_file.docker_version = None;
    core.config_file.config.hostname = None;
    core.config_file.config.domainname = None;
    Ok(core)
}

/// Convert an index and its child images to OCI media types.
pub async fn oci_image_index(idx: &dyn ImageIndex) -> Result<IndexCore> {
    let mut core = IndexCore::from_index(idx).await?;
    core.media_type = MediaType::OciImageIndex;
    let mut converted = Vec::with_capacity(core.children.len());
    for (child, extras) in core.children.drain(..) {
        match child {
            IndexChild::Image(img) => {
                let oci = oci_image(img.as_ref()).await?;
                converted.push((IndexChild::Image(Arc::new(oci) as Arc<dyn Image>), extras));
            }
            IndexChild::Index(sub) => {
                let oci = Box::pin(oci_image_index(sub.as_ref())).await?;
                converted.push((IndexChild::Index(Arc::new(oci) as Arc<dyn ImageIndex>), extras));
            }
        }
    }
    core.children = converted;
    Ok(core)
}

/// One child to add to an index.
pub struct IndexAddendum {
    pub child: IndexChild,
    pub platform: Option<Platform>,
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Append children to an index. Images with a non-standard config media
/// type get that type as the descriptor's `artifactType`.
pub async fn append_manifests(
    idx: &dyn ImageIndex,
    addenda: Vec<IndexAddendum>,
) -> Result<IndexCore> {
    let mut core = IndexCore::from_index(idx).await?;
    for add in addenda {
        core.children.push((
            add.child,
            ChildExtras {
                platform: add.platform,
                annotations: add.annotations,
                artifact_type: None,
            },
        ));
    }
    Ok(core)
}

/// Remove children whose computed descriptor matches the predicate.
pub async fn remove_manifests(
    idx: &dyn ImageIndex,
    matcher: impl Fn(&Descriptor) -> bool,
) -> Result<IndexCore> {
    let mut core = IndexCore::from_index(idx).await?;
    let mut kept = Vec::with_capacity(core.children.len());
    for (child, extras) in core.children.drain(..) {
        let desc = IndexCore::child_descriptor(&child, &extras).await?;
        if !matcher(&desc) {
            kept.push((child, extras));
        }
    }
    core.children = kept;
    Ok(core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    fn tar_of(entries: &[(&str, &[u8])]) -> Bytes {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, *path, *data).unwrap();
        }
        Bytes::from(builder.into_inner().unwrap())
    }

    fn layer_of(entries: &[(&str, &[u8])]) -> Arc<dyn Layer> {
        Arc::new(
            StaticLayer::from_uncompressed_tar(tar_of(entries), MediaType::OciLayer).unwrap(),
        )
    }

    async fn image_of(layers: Vec<Arc<dyn Layer>>) -> ImageCore {
        append_layers(&ImageCore::empty(), layers).await.unwrap()
    }

    fn paths_in(tar: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(std::io::Cursor::new(tar));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                String::from_utf8_lossy(&e.unwrap().path_bytes())
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn append_extends_manifest_and_config() {
        let img = image_of(vec![layer_of(&[("a.txt", b"a\n")])]).await;
        let out = append_layers(&img, vec![layer_of(&[("b.txt", b"b\n")])])
            .await
            .unwrap();
        let manifest = out.manifest().await.unwrap();
        let cf = out.config_file().await.unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(cf.rootfs.diff_ids.len(), 2);
        assert_eq!(cf.history.len(), 2);
        assert_eq!(cf.history[1].created_by.as_deref(), Some("append layer"));
    }

    #[tokio::test]
    async fn append_rejects_mismatched_empty_layer() {
        let img = ImageCore::empty();
        let bad = Addendum {
            layer: None,
            history: History::default(),
            annotations: None,
            urls: None,
            media_type: None,
        };
        assert!(append(&img, vec![bad]).await.is_err());
    }

    #[tokio::test]
    async fn annotations_merge_and_supersede() {
        let img = ImageCore::empty();
        let first = annotations(
            &img,
            BTreeMap::from([("k".to_string(), "v1".to_string())]),
        )
        .await
        .unwrap();
        let second = annotations(
            &first,
            BTreeMap::from([
                ("k".to_string(), "v2".to_string()),
                ("other".to_string(), "x".to_string()),
            ]),
        )
        .await
        .unwrap();
        let manifest = second.manifest().await.unwrap();
        let ann = manifest.annotations.unwrap();
        assert_eq!(ann.get("k").map(String::as_str), Some("v2"));
        assert_eq!(ann.len(), 2);
    }

    #[tokio::test]
    async fn extract_overwrites_and_whiteouts() {
        let base = layer_of(&[("a.txt", b"a1"), ("keep.txt", b"keep")]);
        let mid = layer_of(&[("a.txt", b"a2")]);
        // Whiteout deletes keep.txt.
        let top = layer_of(&[(".wh.keep.txt", b""), ("top.txt", b"top")]);
        let img = image_of(vec![base, mid, top]).await;

        let tar = extract(&img).await.unwrap();
        let paths = paths_in(&tar);
        assert_eq!(paths, vec!["a.txt", "top.txt"]);

        // The surviving a.txt content is the upper layer's.
        let mut archive = tar::Archive::new(std::io::Cursor::new(tar.as_ref()));
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == "a.txt" {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                assert_eq!(data, b"a2");
            }
        }
    }

    #[tokio::test]
    async fn extract_respects_opaque_dirs() {
        let base = layer_of(&[("dir/old.txt", b"old"), ("outside.txt", b"x")]);
        let top = layer_of(&[("dir/.wh..wh..opq", b""), ("dir/new.txt", b"new")]);
        let img = image_of(vec![base, top]).await;
        let paths = paths_in(&extract(&img).await.unwrap());
        assert_eq!(paths, vec!["outside.txt", "dir/new.txt"]);
    }

    #[tokio::test]
    async fn whiteout_deletes_subtree() {
        let base = layer_of(&[("dir/a.txt", b"a"), ("dir/sub/b.txt", b"b")]);
        let top = layer_of(&[(".wh.dir", b"")]);
        let img = image_of(vec![base, top]).await;
        let paths = paths_in(&extract(&img).await.unwrap());
        assert!(paths.is_empty(), "got {paths:?}");
    }

    #[tokio::test]
    async fn flatten_produces_single_layer_with_extract_diff_id() {
        let img = image_of(vec![
            layer_of(&[("a.txt", b"a")]),
            layer_of(&[("b.txt", b"b")]),
            layer_of(&[("c.txt", b"c")]),
        ])
        .await;
        let extracted = extract(&img).await.unwrap();
        let flat = flatten(&img).await.unwrap();
        let layers = flat.layers().await.unwrap();
        assert_eq!(layers.len(), 1);
        assert_eq!(
            layers[0].diff_id().await.unwrap(),
            Digest::sha256_of(&extracted)
        );
        // Original history survives as JSON in the comment.
        let cf = flat.config_file().await.unwrap();
        assert_eq!(cf.history.len(), 1);
        let comment = cf.history[0].comment.as_deref().unwrap();
        let original: Vec<History> = serde_json::from_str(comment).unwrap();
        assert_eq!(original.len(), 3);
    }

    #[tokio::test]
    async fn flatten_is_idempotent_by_digest() {
        let img = image_of(vec![
            layer_of(&[("a.txt", b"a")]),
            layer_of(&[("b.txt", b"b")]),
        ])
        .await;
        let once = flatten(&img).await.unwrap();
        let twice = flatten(&once).await.unwrap();
        let once_layers = once.layers().await.unwrap();
        let twice_layers = twice.layers().await.unwrap();
        assert_eq!(
            once_layers[0].digest().await.unwrap(),
            twice_layers[0].digest().await.unwrap()
        );
    }

    #[tokio::test]
    async fn partial_flatten_keeps_prefix() {
        let img = image_of(vec![
            layer_of(&[("a.txt", b"a")]),
            layer_of(&[("b.txt", b"b")]),
            layer_of(&[("c.txt", b"c")]),
        ])
        .await;
        let out = partial_flatten(&img, 2).await.unwrap();
        let layers = out.layers().await.unwrap();
        assert_eq!(layers.len(), 2);
        // First layer untouched.
        let orig_layers = img.layers().await.unwrap();
        assert_eq!(
            layers[0].digest().await.unwrap(),
            orig_layers[0].digest().await.unwrap()
        );
        assert!(partial_flatten(&img, 0).await.is_err());
        assert!(partial_flatten(&img, 4).await.is_err());
    }

    #[tokio::test]
    async fn rebase_swaps_base_layers() {
        let base0 = image_of(vec![layer_of(&[("a.txt", b"a\n")])]).await;
        let app = append_layers(&base0, vec![layer_of(&[("top.txt", b"top\n")])])
            .await
            .unwrap();
        let base1 = image_of(vec![layer_of(&[("b.txt", b"b\n")])]).await;

        let rebased = rebase(&app, &base0, &base1).await.unwrap();
        let paths = paths_in(&extract(&rebased).await.unwrap());
        assert!(paths.contains(&"b.txt".to_string()));
        assert!(paths.contains(&"top.txt".to_string()));
        assert!(!paths.contains(&"a.txt".to_string()));
    }

    #[tokio::test]
    async fn rebase_round_trip_restores_layers() {
        let base_a = image_of(vec![layer_of(&[("a.txt", b"a")])]).await;
        let base_b = image_of(vec![layer_of(&[("b.txt", b"b")])]).await;
        let app = append_layers(&base_a, vec![layer_of(&[("top.txt", b"t")])])
            .await
            .unwrap();

        let there = rebase(&app, &base_a, &base_b).await.unwrap();
        let back = rebase(&there, &base_b, &base_a).await.unwrap();

        let orig_layers = app.layers().await.unwrap();
        let back_layers = back.layers().await.unwrap();
        assert_eq!(orig_layers.len(), back_layers.len());
        for (a, b) in orig_layers.iter().zip(back_layers.iter()) {
            assert_eq!(a.digest().await.unwrap(), b.digest().await.unwrap());
        }
    }

    #[tokio::test]
    async fn rebase_rejects_unrelated_base() {
        let base = image_of(vec![layer_of(&[("a.txt", b"a")])]).await;
        let other = image_of(vec![layer_of(&[("x.txt", b"x")])]).await;
        let app = append_layers(&base, vec![layer_of(&[("top.txt", b"t")])])
            .await
            .unwrap();
        assert!(matches!(
            rebase(&app, &other, &base).await,
            Err(Error::NotBased(_))
        ));
    }

    #[tokio::test]
    async fn time_pins_timestamps() {
        let img = image_of(vec![layer_of(&[("a.txt", b"a")])]).await;
        let t = Utc.timestamp_opt(1_600_000_000, 0).single().unwrap();
        let out = time(&img, t).await.unwrap();
        let cf = out.config_file().await.unwrap();
        assert_eq!(cf.created, Some(t));
        assert!(cf.history.iter().all(|h| h.created == Some(t)));

        // Layer mtimes follow.
        let raw = out.layers().await.unwrap()[0].uncompressed().await.unwrap();
        let mut archive = tar::Archive::new(std::io::Cursor::new(raw.as_ref()));
        for entry in archive.entries().unwrap() {
            assert_eq!(entry.unwrap().header().mtime().unwrap(), 1_600_000_000);
        }
    }

    #[tokio::test]
    async fn oci_conversion_keeps_layer_digests() {
        let docker_layer = Arc::new(
            StaticLayer::from_uncompressed_tar(tar_of(&[("f", b"x")]), MediaType::DockerLayer)
                .unwrap(),
        ) as Arc<dyn Layer>;
        let mut img = ImageCore::empty();
        img.media_type = MediaType::DockerManifestSchema2;
        img.config_media_type = MediaType::DockerConfig;
        let img = append_layers(&img, vec![docker_layer.clone()]).await.unwrap();

        let oci = oci_image(&img).await.unwrap();
        assert_eq!(oci.media_type(), MediaType::OciManifest);
        let manifest = oci.manifest().await.unwrap();
        assert_eq!(manifest.config.media_type, MediaType::OciConfig);
        assert_eq!(manifest.layers[0].media_type, MediaType::OciLayer);
        assert_eq!(
            manifest.layers[0].digest,
            docker_layer.digest().await.unwrap()
        );
    }

    #[tokio::test]
    async fn index_append_and_remove() {
        let img = Arc::new(ImageCore::empty()) as Arc<dyn Image>;
        let digest = img.digest().await.unwrap();
        let idx = IndexCore::empty();
        let idx = append_manifests(
            &idx,
            vec![IndexAddendum {
                child: IndexChild::Image(img),
                platform: Some(Platform::new("linux", "amd64")),
                annotations: None,
            }],
        )
        .await
        .unwrap();
        assert_eq!(idx.index_manifest().await.unwrap().manifests.len(), 1);

        let removed = remove_manifests(&idx, |d| d.digest == digest).await.unwrap();
        assert!(removed.index_manifest().await.unwrap().manifests.is_empty());
    }
}
