use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::authn::{Authenticator, DefaultKeychain, Keychain};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::{Image, ImageCore, ImageIndex, IndexCore, descriptor_of};
use crate::layer::{FileLayer, Layer, StaticLayer};
use crate::mediatype::MediaType;
use crate::mutate;
use crate::reference::{Reference, Repository};
use crate::remote;
use crate::tarball;
use crate::types::{Descriptor, IndexManifest, Platform};

/// Options recognized by the high-level verbs.
#[derive(Clone, Default)]
pub struct Options {
    /// Resolve all references over plain HTTP without TLS verification.
    pub insecure: bool,
    /// Select this platform's child when an index is encountered.
    pub platform: Option<Platform>,
    pub user_agent: Option<String>,
    /// Allow pushing foreign/nondistributable layer blobs.
    pub allow_nondistributable: bool,
    /// Refuse to overwrite an existing tag.
    pub no_clobber: bool,
    pub auth: Option<Arc<dyn Authenticator>>,
    pub keychain: Option<Arc<dyn Keychain>>,
    pub chunk_size: Option<usize>,
}

impl Options {
    pub fn insecure() -> Self {
        Self {
            insecure: true,
            ..Default::default()
        }
    }

    fn remote(&self) -> remote::Options {
        remote::Options {
            auth: self.auth.clone(),
            // The docker-config keychain is the default at this layer;
            // remote itself stays anonymous unless told otherwise.
            keychain: Some(
                self.keychain
                    .clone()
                    .unwrap_or_else(|| Arc::new(DefaultKeychain)),
            ),
            user_agent: self.user_agent.clone(),
            allow_nondistributable: self.allow_nondistributable,
            chunk_size: self.chunk_size,
        }
    }

    fn parse(&self, s: &str) -> Result<Reference> {
        let reference = Reference::parse(s)?;
        Ok(if self.insecure {
            reference.insecure()
        } else {
            reference
        })
    }

    fn parse_repo(&self, s: &str) -> Result<Repository> {
        let repo = Repository::parse(s)?;
        Ok(if self.insecure { repo.insecure() } else { repo })
    }
}

fn default_platform() -> Platform {
    Platform::new("linux", "amd64")
}

async fn select_platform_child(
    idx: &dyn ImageIndex,
    platform: &Platform,
) -> Result<Arc<dyn Image>> {
    let manifest = idx.index_manifest().await?;
    for desc in &manifest.manifests {
        if !desc.media_type.is_image() {
            continue;
        }
        if desc
            .platform
            .as_ref()
            .map(|p| p.satisfies(platform))
            .unwrap_or(false)
        {
            return idx.image(&desc.digest).await;
        }
    }
    Err(Error::NotFound(format!(
        "no child image for platform {platform}"
    )))
}

/// Pull an image. Indexes resolve to the requested (or default) platform's
/// child.
pub async fn pull(src: &str, opts: &Options) -> Result<Arc<dyn Image>> {
    let reference = opts.parse(src)?;
    let desc = remote::get(&reference, &opts.remote())
        .await
        .map_err(|e| annotate(e, "pulling", src))?;
    if desc.descriptor.media_type.is_index() {
        let idx = desc.index()?;
        let platform = opts.platform.clone().unwrap_or_else(default_platform);
        return select_platform_child(idx.as_ref(), &platform).await;
    }
    desc.image()
}

/// Pull an index without resolving a platform.
pub async fn pull_index(src: &str, opts: &Options) -> Result<Arc<dyn ImageIndex>> {
    let reference = opts.parse(src)?;
    remote::get(&reference, &opts.remote())
        .await
        .map_err(|e| annotate(e, "pulling", src))?
        .index()
}

async fn check_clobber(reference: &Reference, opts: &Options) -> Result<()> {
    if !opts.no_clobber || reference.tag().is_none() {
        return Ok(());
    }
    match remote::head(reference, &opts.remote()).await {
        Ok(_) => Err(Error::AlreadyExists(reference.to_string())),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Push an image to a reference.
pub async fn push(img: &dyn Image, dst: &str, opts: &Options) -> Result<Digest> {
    let reference = opts.parse(dst)?;
    check_clobber(&reference, opts).await?;
    remote::write(&reference, img, &opts.remote())
        .await
        .map_err(|e| annotate(e, "pushing", dst))
}

/// Push an index to a reference.
pub async fn push_index(idx: &dyn ImageIndex, dst: &str, opts: &Options) -> Result<Digest> {
    let reference = opts.parse(dst)?;
    check_clobber(&reference, opts).await?;
    remote::write_index(&reference, idx, &opts.remote())
        .await
        .map_err(|e| annotate(e, "pushing", dst))
}

/// Copy src to dst. Indexes copy whole unless a platform narrows them.
pub async fn copy(src: &str, dst: &str, opts: &Options) -> Result<Digest> {
    let src_ref = opts.parse(src)?;
    let dst_ref = opts.parse(dst)?;
    check_clobber(&dst_ref, opts).await?;
    let desc = remote::get(&src_ref, &opts.remote())
        .await
        .map_err(|e| annotate(e, "copying", src))?;
    info!(%src_ref, %dst_ref, digest = %desc.descriptor.digest, "copying");
    let written = if desc.descriptor.media_type.is_index() {
        let idx = desc.index()?;
        match &opts.platform {
            Some(platform) => {
                let img = select_platform_child(idx.as_ref(), platform).await?;
                remote::write(&dst_ref, img.as_ref(), &opts.remote()).await
            }
            None => remote::write_index(&dst_ref, idx.as_ref(), &opts.remote()).await,
        }
    } else {
        let img = desc.image()?;
        remote::write(&dst_ref, img.as_ref(), &opts.remote()).await
    };
    written.map_err(|e| annotate(e, "copying to", dst))
}

/// The digest a reference resolves to.
pub async fn digest(src: &str, opts: &Options) -> Result<Digest> {
    let reference = opts.parse(src)?;
    Ok(remote::head(&reference, &opts.remote())
        .await
        .map_err(|e| annotate(e, "resolving", src))?
        .digest)
}

/// Raw manifest bytes.
pub async fn manifest(src: &str, opts: &Options) -> Result<Bytes> {
    let reference = opts.parse(src)?;
    Ok(remote::get(&reference, &opts.remote())
        .await
        .map_err(|e| annotate(e, "fetching manifest of", src))?
        .raw_manifest)
}

/// Raw config bytes of the (platform-resolved) image.
pub async fn config(src: &str, opts: &Options) -> Result<Bytes> {
    pull(src, opts).await?.raw_config_file().await
}

/// Tags of a repository.
pub async fn list_tags(repo: &str, opts: &Options) -> Result<Vec<String>> {
    let repo = opts.parse_repo(repo)?;
    remote::list_tags(&repo, &opts.remote()).await
}

/// Repositories of a registry.
pub async fn catalog(registry: &str, opts: &Options) -> Result<Vec<String>> {
    // Only the host matters; the repository name is a placeholder.
    let repo = opts.parse_repo(&format!("{registry}/catalog"))?;
    remote::catalog(&repo, &opts.remote()).await
}

/// Point an additional tag at src's manifest.
pub async fn tag(src: &str, new_tag: &str, opts: &Options) -> Result<Digest> {
    let reference = opts.parse(src)?;
    remote::tag(&reference, new_tag, &opts.remote())
        .await
        .map_err(|e| annotate(e, "tagging", src))
}

/// Delete the manifest a reference points at.
pub async fn delete(src: &str, opts: &Options) -> Result<()> {
    let reference = opts.parse(src)?;
    remote::delete(&reference, &opts.remote())
        .await
        .map_err(|e| annotate(e, "deleting", src))
}

/// Append layer tarballs (gzipped or raw) from disk to a base image.
pub async fn append(base: &dyn Image, layer_files: &[&Path]) -> Result<ImageCore> {
    let mut layers: Vec<Arc<dyn Layer>> = Vec::with_capacity(layer_files.len());
    for path in layer_files {
        layers.push(Arc::new(FileLayer::from_file(*path).await?));
    }
    mutate::append_layers(base, layers).await
}

const BASE_NAME_ANNOTATION: &str = "org.opencontainers.image.base.name";
const BASE_DIGEST_ANNOTATION: &str = "org.opencontainers.image.base.digest";

/// Rebase the image at `orig` from `old_base` onto `new_base`. When
/// `old_base`/`new_base` are None they are discovered from the base-image
/// annotations.
pub async fn rebase(
    orig: &str,
    old_base: Option<&str>,
    new_base: Option<&str>,
    opts: &Options,
) -> Result<ImageCore> {
    let orig_img = pull(orig, opts).await?;

    let (old_ref, new_ref) = match (old_base, new_base) {
        (Some(old), Some(new)) => (old.to_string(), new.to_string()),
        _ => {
            let m = orig_img.manifest().await?;
            let annotations = m.annotations.unwrap_or_default();
            let name = annotations.get(BASE_NAME_ANNOTATION).cloned().ok_or_else(|| {
                Error::Validation(format!(
                    "{orig} has no {BASE_NAME_ANNOTATION} annotation; pass the old base explicitly"
                ))
            })?;
            let old = match annotations.get(BASE_DIGEST_ANNOTATION) {
                Some(digest) => {
                    let repo = Reference::parse(&name)?.context().clone();
                    repo.digest(digest.parse()?).to_string()
                }
                None => name.clone(),
            };
            (
                old_base.map(str::to_string).unwrap_or(old),
                new_base.map(str::to_string).unwrap_or(name),
            )
        }
    };

    let old_img = pull(&old_ref, opts).await?;
    let new_img = pull(&new_ref, opts).await?;
    mutate::rebase(orig_img.as_ref(), old_img.as_ref(), new_img.as_ref()).await
}

/// Flatten the image at src into a single layer and push it to dst.
/// Indexes are refused unless a platform selects a child.
pub async fn flatten(src: &str, dst: &str, opts: &Options) -> Result<Digest> {
    let reference = opts.parse(src)?;
    let desc = remote::get(&reference, &opts.remote()).await?;
    if desc.descriptor.media_type.is_index() && opts.platform.is_none() {
        return Err(Error::UnsupportedMediaType(
            "refusing to flatten an index; pass a platform".to_string(),
        ));
    }
    let img = pull(src, opts).await?;
    let flat = mutate::flatten(img.as_ref()).await?;
    push(&flat, dst, opts).await
}

/// Materialize src's filesystem as a tar stream.
pub async fn export(src: &str, opts: &Options) -> Result<Bytes> {
    let img = pull(src, opts).await?;
    mutate::extract(img.as_ref()).await
}

/// Save an image as a docker tarball on disk.
pub async fn save(img: &dyn Image, reference: &str, path: impl AsRef<Path>) -> Result<()> {
    let reference = Reference::parse(reference)?;
    tarball::write_to_file(path, Some(&reference), img).await
}

/// Save an image in the legacy docker tarball layout.
pub async fn save_legacy(
    img: &dyn Image,
    reference: &str,
    path: impl AsRef<Path>,
) -> Result<()> {
    let reference = Reference::parse(reference)?;
    let bytes = tarball::write_legacy_image(&reference, img).await?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Load an image from a docker tarball on disk.
pub async fn load(path: impl AsRef<Path>, tag: Option<&str>) -> Result<Arc<dyn Image>> {
    tarball::image_from_file(path, tag).await
}

/// Attach `payload` to the manifest at `target` as a referrer with the
/// given media type. The attachment is pushed by digest; it shows up in
/// `referrers(target)`.
pub async fn attach(
    target: &str,
    payload: Bytes,
    media_type: &str,
    opts: &Options,
) -> Result<Digest> {
    let reference = opts.parse(target)?;
    let subject = match (remote::head(&reference, &opts.remote()).await, reference.digest()) {
        (Ok(desc), _) => desc,
        // An attachment may predate its subject when the target is a digest.
        (Err(e), Some(digest)) if e.is_not_found() => {
            Descriptor::new(MediaType::OciManifest, 0, digest.clone())
        }
        (Err(e), _) => return Err(annotate(e, "resolving attach target", target)),
    };

    let layer = Arc::new(StaticLayer::new(
        payload,
        MediaType::Other(media_type.to_string()),
    )) as Arc<dyn Layer>;
    let img = mutate::append(
        &ImageCore::empty(),
        vec![mutate::Addendum::layer(layer)],
    )
    .await?;
    let img = mutate::config_media_type(&img, MediaType::Other(media_type.to_string())).await?;
    let img = mutate::subject(&img, subject).await?;

    let dst = reference.context().digest(img.digest().await?);
    remote::write(&dst, &img, &opts.remote())
        .await
        .map_err(|e| annotate(e, "attaching to", target))
}

/// Descriptors of every manifest that declares `target` as its subject.
pub async fn referrers(
    target: &str,
    artifact_type: Option<&str>,
    opts: &Options,
) -> Result<IndexManifest> {
    let reference = opts.parse(target)?;
    let digest = match reference.digest() {
        Some(d) => d.clone(),
        None => remote::head(&reference, &opts.remote()).await?.digest,
    };
    remote::referrers(reference.context(), &digest, artifact_type, &opts.remote()).await
}

fn reorder_layer_tar(raw: &[u8], prioritize: &[String]) -> Result<Bytes> {
    struct Entry {
        path: String,
        header: tar::Header,
        data: Vec<u8>,
    }
    let mut archive = tar::Archive::new(std::io::Cursor::new(raw));
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).to_string();
        let header = entry.header().clone();
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        entries.push(Entry { path, header, data });
    }

    let rank = |path: &str| -> usize {
        let trimmed = path.trim_start_matches("./").trim_start_matches('/');
        prioritize
            .iter()
            .position(|p| p.trim_start_matches('/') == trimmed)
            .unwrap_or(prioritize.len())
    };
    // Stable: prioritized entries first in priority order, everything else
    // in original order.
    entries.sort_by_key(|e| rank(&e.path));

    let mut builder = tar::Builder::new(Vec::new());
    for mut entry in entries {
        builder.append_data(&mut entry.header, entry.path.clone(), entry.data.as_slice())?;
    }
    Ok(Bytes::from(builder.into_inner()?))
}

async fn optimize_image(img: &dyn Image, prioritize: &[String]) -> Result<ImageCore> {
    // The prioritized paths must exist in the extracted filesystem.
    let extracted = mutate::extract(img).await?;
    let mut present = BTreeSet::new();
    let mut archive = tar::Archive::new(std::io::Cursor::new(extracted.as_ref()));
    for entry in archive.entries()? {
        let entry = entry?;
        present.insert(
            String::from_utf8_lossy(&entry.path_bytes())
                .trim_start_matches("./")
                .trim_end_matches('/')
                .to_string(),
        );
    }
    let missing: Vec<&String> = prioritize
        .iter()
        .filter(|p| !present.contains(p.trim_start_matches('/')))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "prioritized files missing from image: {}",
            missing
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    let mut core = ImageCore::from_image(img).await?;
    let mut rebuilt: Vec<Arc<dyn Layer>> = Vec::with_capacity(core.layers.len());
    for layer in &core.layers {
        let raw = layer.uncompressed().await?;
        let reordered = reorder_layer_tar(&raw, prioritize)?;
        rebuilt.push(Arc::new(StaticLayer::from_uncompressed_tar(
            reordered,
            MediaType::OciLayer,
        )?));
    }
    core.layers = rebuilt;
    core.media_type = MediaType::OciManifest;
    core.config_media_type = MediaType::OciConfig;
    Ok(core)
}

/// Rewrite src's layers so the prioritized paths stream first, then push
/// the result to dst. Missing prioritized paths fail, named.
pub async fn optimize(
    src: &str,
    dst: &str,
    prioritize: Vec<String>,
    opts: &Options,
) -> Result<Digest> {
    let reference = opts.parse(src)?;
    let desc = remote::get(&reference, &opts.remote()).await?;
    if desc.descriptor.media_type.is_index() && opts.platform.is_none() {
        let idx = desc.index()?;
        let mut core = IndexCore::from_index(idx.as_ref()).await?;
        let mut optimized = Vec::with_capacity(core.children.len());
        for (child, extras) in core.children.drain(..) {
            match child {
                crate::image::IndexChild::Image(img) => {
                    let out = optimize_image(img.as_ref(), &prioritize).await?;
                    optimized.push((
                        crate::image::IndexChild::Image(Arc::new(out) as Arc<dyn Image>),
                        extras,
                    ));
                }
                other => optimized.push((other, extras)),
            }
        }
        core.children = optimized;
        return push_index(&core, dst, opts).await;
    }

    let img = pull(src, opts).await?;
    let out = optimize_image(img.as_ref(), &prioritize).await?;
    push(&out, dst, opts).await
}

fn parse_release(tag: &str) -> Option<semver::Version> {
    let version = semver::Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()?;
    if version.pre.is_empty() && version.build.is_empty() {
        Some(version)
    } else {
        None
    }
}

/// Promote src under semver-derived tags: `tag`, `vMAJOR.MINOR`, `vMAJOR`
/// and `latest`, but only when `tag` is newer than every existing release.
/// Returns the tags applied (empty when the bump was a no-op).
pub async fn bump(src: &str, new_tag: &str, opts: &Options) -> Result<Vec<String>> {
    let version = parse_release(new_tag).ok_or_else(|| {
        Error::Validation(format!(
            "{new_tag:?} is not a release tag (prerelease/build metadata not allowed)"
        ))
    })?;

    let reference = opts.parse(src)?;
    let existing = remote::list_tags(reference.context(), &opts.remote())
        .await
        .unwrap_or_default();
    // The incoming tag itself may already be pushed; it does not count as
    // an existing release to beat.
    let newest_existing = existing
        .iter()
        .filter(|t| t.as_str() != new_tag)
        .filter_map(|t| parse_release(t))
        .max();
    if let Some(newest) = newest_existing {
        if version <= newest {
            debug!(%version, %newest, "bump is a no-op, an equal or newer release exists");
            return Ok(Vec::new());
        }
    }

    let targets = vec![
        new_tag.to_string(),
        format!("v{}.{}", version.major, version.minor),
        format!("v{}", version.major),
        "latest".to_string(),
    ];
    let mut applied = Vec::new();
    for target in targets {
        if reference.tag() == Some(target.as_str()) {
            continue;
        }
        remote::tag(&reference, &target, &opts.remote()).await?;
        applied.push(target);
    }
    Ok(applied)
}

/// Descriptor of an image, exposed for callers assembling indexes.
pub async fn descriptor(img: &dyn Image) -> Result<Descriptor> {
    descriptor_of(img).await
}

fn annotate(err: Error, verb: &str, subject: &str) -> Error {
    match err {
        // NotFound keeps its type so callers can still probe existence.
        Error::NotFound(msg) => Error::NotFound(format!("{verb} {subject}: {msg}")),
        other if other.is_not_found() => other,
        Error::Validation(msg) => Error::Validation(format!("{verb} {subject}: {msg}")),
        Error::Auth(msg) => Error::Auth(format!("{verb} {subject}: {msg}")),
        other => other,
    }
}
