use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::{Image, ImageIndex};

/// Check the cross-cutting invariants of an image: layer digests and order
/// match the manifest, diff IDs match the config, the history pairs with
/// the layers, and the config descriptor addresses the config bytes.
pub async fn image(img: &dyn Image) -> Result<()> {
    let raw_manifest = img.raw_manifest().await?;
    let manifest = img.manifest().await?;
    let computed = Digest::sha256_of(&raw_manifest);
    let reported = img.digest().await?;
    if computed != reported {
        return Err(Error::Validation(format!(
            "image digest {reported} does not match manifest bytes {computed}"
        )));
    }

    let raw_config = img.raw_config_file().await?;
    if manifest.config.digest != Digest::sha256_of(&raw_config) {
        return Err(Error::Validation(
            "config descriptor digest does not match config bytes".to_string(),
        ));
    }
    if manifest.config.size != raw_config.len() as i64 {
        return Err(Error::Validation(
            "config descriptor size does not match config bytes".to_string(),
        ));
    }

    let config = img.config_file().await?;
    let layers = img.layers().await?;
    if manifest.layers.len() != layers.len() {
        return Err(Error::Validation(format!(
            "manifest lists {} layers but the image has {}",
            manifest.layers.len(),
            layers.len()
        )));
    }
    if config.rootfs.diff_ids.len() != layers.len() {
        return Err(Error::Validation(format!(
            "rootfs lists {} diff ids but the image has {} layers",
            config.rootfs.diff_ids.len(),
            layers.len()
        )));
    }
    for (i, layer) in layers.iter().enumerate() {
        let digest = layer.digest().await?;
        if manifest.layers[i].digest != digest {
            return Err(Error::Validation(format!(
                "layer {i}: manifest says {} but layer digest is {digest}",
                manifest.layers[i].digest
            )));
        }
        let diff_id = layer.diff_id().await?;
        if config.rootfs.diff_ids[i] != diff_id {
            return Err(Error::Validation(format!(
                "layer {i}: rootfs says {} but layer diff id is {diff_id}",
                config.rootfs.diff_ids[i]
            )));
        }
    }

    if !config.history.is_empty() {
        let non_empty = config.history.iter().filter(|h| !h.empty_layer).count();
        if non_empty != layers.len() {
            return Err(Error::Validation(format!(
                "history has {non_empty} non-empty entries for {} layers",
                layers.len()
            )));
        }
    }
    Ok(())
}

/// Check an index: every child descriptor addresses its child's bytes, and
/// child images validate recursively.
pub async fn index(idx: &dyn ImageIndex) -> Result<()> {
    let manifest = idx.index_manifest().await?;
    for desc in &manifest.manifests {
        if desc.media_type.is_index() {
            let sub = idx.image_index(&desc.digest).await?;
            let digest = sub.digest().await?;
            if digest != desc.digest {
                return Err(Error::Validation(format!(
                    "child index digest {digest} does not match descriptor {}",
                    desc.digest
                )));
            }
            Box::pin(index(sub.as_ref())).await?;
        } else if desc.media_type.is_image() {
            let img = idx.image(&desc.digest).await?;
            let digest = img.digest().await?;
            if digest != desc.digest {
                return Err(Error::Validation(format!(
                    "child image digest {digest} does not match descriptor {}",
                    desc.digest
                )));
            }
            image(img.as_ref()).await?;
        }
    }
    Ok(())
}
