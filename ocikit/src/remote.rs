use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use reqwest::{Method, StatusCode, header};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::authn::{Anonymous, Authenticator, Keychain};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::image::{Image, ImageIndex};
use crate::layer::{Layer, gunzip, is_gzipped};
use crate::mediatype::MediaType;
use crate::reference::{Reference, Repository};
use crate::transport::Transport;
use crate::types::{Descriptor, IndexManifest};

const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Options shared by all remote operations.
#[derive(Clone, Default)]
pub struct Options {
    pub auth: Option<Arc<dyn Authenticator>>,
    pub keychain: Option<Arc<dyn Keychain>>,
    pub user_agent: Option<String>,
    pub allow_nondistributable: bool,
    /// Chunk size for chunked blob uploads; mainly tuned down by tests.
    pub chunk_size: Option<usize>,
}

impl Options {
    fn authenticator(&self, registry: &str) -> Result<Arc<dyn Authenticator>> {
        if let Some(auth) = &self.auth {
            return Ok(auth.clone());
        }
        if let Some(keychain) = &self.keychain {
            return keychain.resolve(registry);
        }
        Ok(Arc::new(Anonymous))
    }

    fn transport(&self, repo: &Repository, scopes: Vec<String>) -> Result<Arc<Transport>> {
        let auth = self.authenticator(repo.registry())?;
        Transport::new(repo, auth, scopes, self.user_agent.clone())
    }

    fn pull_transport(&self, repo: &Repository) -> Result<Arc<Transport>> {
        self.transport(repo, vec![repo.scope("pull")])
    }

    fn push_transport(&self, repo: &Repository) -> Result<Arc<Transport>> {
        self.transport(repo, vec![repo.scope("pull,push")])
    }
}

fn accept_header() -> String {
    MediaType::accepted_manifests()
        .iter()
        .map(|m| m.as_str().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn manifest_url(t: &Transport, repo: &Repository, identifier: &str) -> String {
    format!("{}/v2/{}/manifests/{}", t.base_url(), repo.name(), identifier)
}

fn blob_url(t: &Transport, repo: &Repository, digest: &Digest) -> String {
    format!("{}/v2/{}/blobs/{}", t.base_url(), repo.name(), digest)
}

fn append_query(url: &str, query: &str) -> String {
    if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    }
}

/// A fetched manifest plus the descriptor describing it.
pub struct RemoteDescriptor {
    pub descriptor: Descriptor,
    pub raw_manifest: Bytes,
    repository: Repository,
    transport: Arc<Transport>,
}

impl RemoteDescriptor {
    /// Interpret the manifest as an image.
    pub fn image(&self) -> Result<Arc<dyn Image>> {
        if self.descriptor.media_type.is_index() {
            return Err(Error::UnsupportedMediaType(format!(
                "{} is an index; select a platform or use index()",
                self.descriptor.media_type
            )));
        }
        if self.descriptor.media_type.is_schema1() {
            return Err(Error::UnsupportedMediaType(
                "schema 1 manifests can be fetched raw but not interpreted".to_string(),
            ));
        }
        Ok(Arc::new(RemoteImage {
            transport: self.transport.clone(),
            repository: self.repository.clone(),
            media_type: self.descriptor.media_type.clone(),
            raw_manifest: self.raw_manifest.clone(),
            config: OnceCell::new(),
        }))
    }

    /// Interpret the manifest as an index.
    pub fn index(&self) -> Result<Arc<dyn ImageIndex>> {
        if !self.descriptor.media_type.is_index() {
            return Err(Error::UnsupportedMediaType(format!(
                "{} is not an index",
                self.descriptor.media_type
            )));
        }
        Ok(Arc::new(RemoteIndex {
            transport: self.transport.clone(),
            repository: self.repository.clone(),
            media_type: self.descriptor.media_type.clone(),
            raw_manifest: self.raw_manifest.clone(),
        }))
    }
}

/// Fetch the manifest a reference points at.
pub async fn get(reference: &Reference, opts: &Options) -> Result<RemoteDescriptor> {
    let repo = reference.context();
    let t = opts.pull_transport(repo)?;
    let (raw, media_type) = fetch_manifest(&t, repo, reference).await?;
    let digest = Digest::sha256_of(&raw);
    Ok(RemoteDescriptor {
        descriptor: Descriptor::new(media_type, raw.len() as i64, digest),
        raw_manifest: raw,
        repository: repo.clone(),
        transport: t,
    })
}

async fn fetch_manifest(
    t: &Arc<Transport>,
    repo: &Repository,
    reference: &Reference,
) -> Result<(Bytes, MediaType)> {
    let url = manifest_url(t, repo, &reference.identifier());
    let resp = t
        .send(
            Method::GET,
            &url,
            |rb| rb.header(header::ACCEPT, accept_header()),
            &[StatusCode::OK],
        )
        .await?;
    let media_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(MediaType::from)
        .unwrap_or(MediaType::DockerManifestSchema2);
    let raw = resp.bytes().await?;
    if let Some(expected) = reference.digest() {
        let computed = Digest::sha256_of(&raw);
        if &computed != expected {
            return Err(Error::DigestMismatch {
                expected: expected.to_string(),
                computed: computed.to_string(),
            });
        }
    }
    debug!(reference = %reference, size = raw.len(), %media_type, "fetched manifest");
    Ok((raw, media_type))
}

/// HEAD the manifest a reference points at.
pub async fn head(reference: &Reference, opts: &Options) -> Result<Descriptor> {
    let repo = reference.context();
    let t = opts.pull_transport(repo)?;
    let url = manifest_url(&t, repo, &reference.identifier());
    let resp = t
        .send(
            Method::HEAD,
            &url,
            |rb| rb.header(header::ACCEPT, accept_header()),
            &[StatusCode::OK],
        )
        .await?;
    let media_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(MediaType::from);
    let digest = resp
        .headers()
        .get("Docker-Content-Digest")
        .and_then(|v| v.to_str().ok())
        .map(str::parse::<Digest>)
        .transpose()?;
    let size = resp
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    match (media_type, digest, size) {
        (Some(media_type), Some(digest), Some(size)) => {
            Ok(Descriptor::new(media_type, size, digest))
        }
        // Registries that omit headers on HEAD get a full GET instead.
        _ => Ok(get(reference, opts).await?.descriptor),
    }
}

/// Fetch an image, laying layers in lazily.
pub async fn image(reference: &Reference, opts: &Options) -> Result<Arc<dyn Image>> {
    get(reference, opts).await?.image()
}

/// Fetch an index, resolving children lazily by digest.
pub async fn index(reference: &Reference, opts: &Options) -> Result<Arc<dyn ImageIndex>> {
    get(reference, opts).await?.index()
}

struct RemoteImage {
    transport: Arc<Transport>,
    repository: Repository,
    media_type: MediaType,
    raw_manifest: Bytes,
    config: OnceCell<Bytes>,
}

#[async_trait]
impl Image for RemoteImage {
    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.raw_manifest.clone())
    }

    async fn raw_config_file(&self) -> Result<Bytes> {
        self.config
            .get_or_try_init(|| async {
                let manifest = self.manifest().await?;
                fetch_blob(&self.transport, &self.repository, &manifest.config.digest).await
            })
            .await
            .cloned()
    }

    async fn layers(&self) -> Result<Vec<Arc<dyn Layer>>> {
        let manifest = self.manifest().await?;
        Ok(manifest
            .layers
            .iter()
            .map(|desc| {
                Arc::new(RemoteLayer {
                    transport: self.transport.clone(),
                    repository: self.repository.clone(),
                    descriptor: desc.clone(),
                    fetched: OnceCell::new(),
                }) as Arc<dyn Layer>
            })
            .collect())
    }
}

struct RemoteIndex {
    transport: Arc<Transport>,
    repository: Repository,
    media_type: MediaType,
    raw_manifest: Bytes,
}

#[async_trait]
impl ImageIndex for RemoteIndex {
    fn media_type(&self) -> MediaType {
        self.media_type.clone()
    }

    async fn raw_manifest(&self) -> Result<Bytes> {
        Ok(self.raw_manifest.clone())
    }

    async fn image(&self, digest: &Digest) -> Result<Arc<dyn Image>> {
        let reference = self.repository.digest(digest.clone());
        let (raw, media_type) =
            fetch_manifest(&self.transport, &self.repository, &reference).await?;
        Ok(Arc::new(RemoteImage {
            transport: self.transport.clone(),
            repository: self.repository.clone(),
            media_type,
            raw_manifest: raw,
            config: OnceCell::new(),
        }))
    }

    async fn image_index(&self, digest: &Digest) -> Result<Arc<dyn ImageIndex>> {
        let reference = self.repository.digest(digest.clone());
        let (raw, media_type) =
            fetch_manifest(&self.transport, &self.repository, &reference).await?;
        Ok(Arc::new(RemoteIndex {
            transport: self.transport.clone(),
            repository: self.repository.clone(),
            media_type,
            raw_manifest: raw,
        }))
    }
}

struct RemoteLayer {
    transport: Arc<Transport>,
    repository: Repository,
    descriptor: Descriptor,
    fetched: OnceCell<Bytes>,
}

#[async_trait]
impl Layer for RemoteLayer {
    async fn digest(&self) -> Result<Digest> {
        Ok(self.descriptor.digest.clone())
    }

    async fn diff_id(&self) -> Result<Digest> {
        Ok(Digest::sha256_of(&self.uncompressed().await?))
    }

    async fn size(&self) -> Result<i64> {
        Ok(self.descriptor.size)
    }

    fn media_type(&self) -> MediaType {
        self.descriptor.media_type.clone()
    }

    async fn compressed(&self) -> Result<Bytes> {
        self.fetched
            .get_or_try_init(|| async {
                fetch_blob(&self.transport, &self.repository, &self.descriptor.digest).await
            })
            .await
            .cloned()
    }

    async fn uncompressed(&self) -> Result<Bytes> {
        let blob = self.compressed().await?;
        if is_gzipped(&blob) {
            Ok(gunzip(&blob)?)
        } else {
            Ok(blob)
        }
    }

    fn mount_source(&self) -> Option<(Repository, Digest)> {
        Some((self.repository.clone(), self.descriptor.digest.clone()))
    }
}

async fn fetch_blob(t: &Arc<Transport>, repo: &Repository, digest: &Digest) -> Result<Bytes> {
    let url = blob_url(t, repo, digest);
    let resp = t
        .send(Method::GET, &url, |rb| rb, &[StatusCode::OK])
        .await?;
    let bytes = resp.bytes().await?;
    let computed = Digest::sha256_of(&bytes);
    if &computed != digest {
        return Err(Error::DigestMismatch {
            expected: digest.to_string(),
            computed: computed.to_string(),
        });
    }
    debug!(%digest, size = bytes.len(), "fetched blob");
    Ok(bytes)
}

async fn blob_exists(t: &Arc<Transport>, repo: &Repository, digest: &Digest) -> Result<bool> {
    let url = blob_url(t, repo, digest);
    let resp = t
        .send(
            Method::HEAD,
            &url,
            |rb| rb,
            &[StatusCode::OK, StatusCode::NOT_FOUND],
        )
        .await?;
    Ok(resp.status() == StatusCode::OK)
}

fn location_of(t: &Transport, resp: &reqwest::Response) -> Result<String> {
    let location = resp
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::Validation("upload response carried no Location".to_string()))?;
    Ok(t.resolve_location(location))
}

async fn start_upload(t: &Arc<Transport>, repo: &Repository) -> Result<String> {
    let url = format!("{}/v2/{}/blobs/uploads/", t.base_url(), repo.name());
    let resp = t
        .send(Method::POST, &url, |rb| rb, &[StatusCode::ACCEPTED])
        .await?;
    location_of(t, &resp)
}

/// Map a commit-time digest rejection into `DigestMismatch`.
fn classify_commit_error(err: Error) -> Error {
    if let Error::Transport(t) = &err {
        if t.has_code("DIGEST_INVALID") {
            return Error::DigestMismatch {
                expected: "digest sent on commit".to_string(),
                computed: "registry computed a different digest".to_string(),
            };
        }
    }
    err
}

async fn commit_monolithic(
    t: &Arc<Transport>,
    location: &str,
    bytes: Bytes,
    digest: &Digest,
) -> Result<()> {
    let url = append_query(location, &format!("digest={digest}"));
    t.send(
        Method::PUT,
        &url,
        move |rb| {
            rb.header(header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes.clone())
        },
        &[StatusCode::CREATED, StatusCode::NO_CONTENT, StatusCode::OK],
    )
    .await
    .map_err(classify_commit_error)?;
    Ok(())
}

/// The committed offset of an in-progress upload, learned from the
/// server's `Range` header. Authoritative for resume.
async fn upload_offset(t: &Arc<Transport>, location: &str) -> Result<usize> {
    let resp = t
        .send(
            Method::GET,
            location,
            |rb| rb,
            &[StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        )
        .await?;
    let range = resp
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("0-0");
    let end = range
        .rsplit_once('-')
        .and_then(|(_, e)| e.parse::<usize>().ok())
        .unwrap_or(0);
    Ok(if end == 0 { 0 } else { end + 1 })
}

async fn upload_chunked(
    t: &Arc<Transport>,
    mut location: String,
    bytes: Bytes,
    digest: &Digest,
    chunk_size: usize,
) -> Result<()> {
    let mut offset = 0usize;
    let mut retried = false;
    while offset < bytes.len() {
        let end = (offset + chunk_size).min(bytes.len());
        let chunk = bytes.slice(offset..end);
        let result = t
            .send(
                Method::PATCH,
                &location,
                {
                    let chunk = chunk.clone();
                    let range = format!("{}-{}", offset, end - 1);
                    move |rb| {
                        rb.header(header::CONTENT_TYPE, "application/octet-stream")
                            .header("Content-Range", range.clone())
                            .body(chunk.clone())
                    }
                },
                &[StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
            )
            .await;
        match result {
            Ok(resp) => {
                if let Ok(loc) = location_of(t, &resp) {
                    location = loc;
                }
                offset = end;
                retried = false;
            }
            Err(e) if !retried => {
                // Ask the registry how much it has; its Range header is
                // authoritative for where the next chunk starts.
                debug!(error = %e, "chunk upload failed, querying offset to resume");
                offset = upload_offset(t, &location).await?;
                retried = true;
            }
            Err(e) => return Err(e),
        }
    }
    let url = append_query(&location, &format!("digest={digest}"));
    t.send(
        Method::PUT,
        &url,
        |rb| rb,
        &[StatusCode::CREATED, StatusCode::NO_CONTENT, StatusCode::OK],
    )
    .await
    .map_err(classify_commit_error)?;
    Ok(())
}

/// Upload one blob, taking the cheapest path the registry offers:
/// existence check, cross-repo mount, monolithic PUT, or chunked PATCH
/// with resume. Streaming layers (no digest until consumed) always go
/// chunked.
async fn upload_blob(
    t: &Arc<Transport>,
    repo: &Repository,
    layer: &dyn Layer,
    chunk_size: usize,
) -> Result<()> {
    if let Ok(digest) = layer.digest().await {
        if blob_exists(t, repo, &digest).await? {
            debug!(%digest, "blob already present, skipping upload");
            return Ok(());
        }
        if let Some((src_repo, src_digest)) = layer.mount_source() {
            if src_repo.registry() == repo.registry() && src_repo.name() != repo.name() {
                t.add_scope(src_repo.scope("pull"));
                let url = format!(
                    "{}/v2/{}/blobs/uploads/?mount={}&from={}",
                    t.base_url(),
                    repo.name(),
                    src_digest,
                    src_repo.name()
                );
                let resp = t
                    .send(
                        Method::POST,
                        &url,
                        |rb| rb,
                        &[StatusCode::CREATED, StatusCode::ACCEPTED],
                    )
                    .await?;
                if resp.status() == StatusCode::CREATED {
                    debug!(%digest, from = %src_repo, "blob mounted across repositories");
                    return Ok(());
                }
                // Mount refused; the 202 opened a normal upload session.
                let location = location_of(t, &resp)?;
                let bytes = layer.compressed().await?;
                return commit_monolithic(t, &location, bytes, &digest).await;
            }
        }
        let location = start_upload(t, repo).await?;
        let bytes = layer.compressed().await?;
        debug!(%digest, size = bytes.len(), "uploading blob monolithically");
        commit_monolithic(t, &location, bytes, &digest).await
    } else {
        let location = start_upload(t, repo).await?;
        let bytes = layer.compressed().await?;
        let digest = layer.digest().await?;
        debug!(%digest, size = bytes.len(), "uploading streamed blob in chunks");
        upload_chunked(t, location, bytes, &digest, chunk_size).await
    }
}

/// Upload a single layer to a repository.
pub async fn write_layer(repo: &Repository, layer: &dyn Layer, opts: &Options) -> Result<()> {
    let t = opts.push_transport(repo)?;
    upload_blob(&t, repo, layer, opts.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)).await
}

async fn put_manifest(
    t: &Arc<Transport>,
    repo: &Repository,
    identifier: &str,
    raw: Bytes,
    media_type: MediaType,
) -> Result<()> {
    let url = manifest_url(t, repo, identifier);
    t.send(
        Method::PUT,
        &url,
        move |rb| {
            rb.header(header::CONTENT_TYPE, media_type.as_str())
                .body(raw.clone())
        },
        &[
            StatusCode::CREATED,
            StatusCode::OK,
            StatusCode::ACCEPTED,
            StatusCode::NO_CONTENT,
        ],
    )
    .await?;
    Ok(())
}

/// Push an image: all layer blobs and the config blob become visible
/// before the manifest PUT, which is the linearization point.
pub async fn write(reference: &Reference, img: &dyn Image, opts: &Options) -> Result<Digest> {
    let repo = reference.context();
    let t = opts.push_transport(repo)?;
    let chunk_size = opts.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);

    let layers = img.layers().await?;
    // Foreign layers are referenced by URL and stay out of the registry
    // unless the caller opted in; anything else (including custom artifact
    // payload types) is a normal blob.
    let skip_foreign = |mt: &MediaType| mt.is_layer() && !mt.is_distributable();
    let uploads = layers
        .iter()
        .filter(|l| opts.allow_nondistributable || !skip_foreign(&l.media_type()))
        .map(|l| upload_blob(&t, repo, l.as_ref(), chunk_size));
    try_join_all(uploads).await?;

    // The config is serialized after the layers so streamed layers have
    // their diff IDs by now.
    let raw_config = img.raw_config_file().await?;
    let config_layer = crate::layer::StaticLayer::new(raw_config, MediaType::OciConfig);
    upload_blob(&t, repo, &config_layer, chunk_size).await?;

    let raw = img.raw_manifest().await?;
    put_manifest(&t, repo, &reference.identifier(), raw, img.media_type()).await?;
    let digest = img.digest().await?;
    debug!(reference = %reference, %digest, "pushed image");
    Ok(digest)
}

/// Push an index, recursively ensuring every child exists by digest first.
pub async fn write_index(
    reference: &Reference,
    idx: &dyn ImageIndex,
    opts: &Options,
) -> Result<Digest> {
    let repo = reference.context();
    let manifest = idx.index_manifest().await?;
    for child in &manifest.manifests {
        let child_ref = repo.digest(child.digest.clone());
        if child.media_type.is_index() {
            let sub = idx.image_index(&child.digest).await?;
            Box::pin(write_index(&child_ref, sub.as_ref(), opts)).await?;
        } else {
            let img = idx.image(&child.digest).await?;
            write(&child_ref, img.as_ref(), opts).await?;
        }
    }

    let t = opts.push_transport(repo)?;
    let raw = idx.raw_manifest().await?;
    put_manifest(&t, repo, &reference.identifier(), raw, idx.media_type()).await?;
    let digest = idx.digest().await?;
    debug!(reference = %reference, %digest, "pushed index");
    Ok(digest)
}

/// Re-point `tag` at whatever `reference` resolves to, without moving blobs.
pub async fn tag(reference: &Reference, tag: &str, opts: &Options) -> Result<Digest> {
    let desc = get(reference, opts).await?;
    let repo = reference.context();
    let t = opts.push_transport(repo)?;
    let target = repo.tag(tag)?;
    put_manifest(
        &t,
        repo,
        &target.identifier(),
        desc.raw_manifest.clone(),
        desc.descriptor.media_type.clone(),
    )
    .await?;
    Ok(desc.descriptor.digest)
}

/// Delete the manifest a reference points at.
pub async fn delete(reference: &Reference, opts: &Options) -> Result<()> {
    let repo = reference.context();
    let t = opts.push_transport(repo)?;
    let url = manifest_url(&t, repo, &reference.identifier());
    t.send(
        Method::DELETE,
        &url,
        |rb| rb,
        &[StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
    )
    .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    #[serde(default)]
    repositories: Vec<String>,
}

/// The URL of the next page, from a `Link: <url>; rel="next"` header.
fn next_link(t: &Transport, headers: &header::HeaderMap) -> Option<String> {
    let link = headers.get(header::LINK)?.to_str().ok()?;
    if !link.contains(r#"rel="next""#) {
        return None;
    }
    let start = link.find('<')? + 1;
    let end = link.find('>')?;
    Some(t.resolve_location(&link[start..end]))
}

/// All tags of a repository, following pagination.
pub async fn list_tags(repo: &Repository, opts: &Options) -> Result<Vec<String>> {
    let t = opts.pull_transport(repo)?;
    let mut url = format!("{}/v2/{}/tags/list?n=1000", t.base_url(), repo.name());
    let mut tags = Vec::new();
    loop {
        let resp = t
            .send(Method::GET, &url, |rb| rb, &[StatusCode::OK])
            .await?;
        let next = next_link(&t, resp.headers());
        let page: TagsResponse = resp.json().await?;
        tags.extend(page.tags);
        match next {
            Some(n) => url = n,
            None => return Ok(tags),
        }
    }
}

/// All repositories of a registry, following pagination.
pub async fn catalog(registry: &Repository, opts: &Options) -> Result<Vec<String>> {
    let auth = opts.authenticator(registry.registry())?;
    let t = Transport::new(
        registry,
        auth,
        vec!["registry:catalog:*".to_string()],
        opts.user_agent.clone(),
    )?;
    let mut url = format!("{}/v2/_catalog?n=1000", t.base_url());
    let mut repositories = Vec::new();
    loop {
        let resp = t
            .send(Method::GET, &url, |rb| rb, &[StatusCode::OK])
            .await?;
        let next = next_link(&t, resp.headers());
        let page: CatalogResponse = resp.json().await?;
        repositories.extend(page.repositories);
        match next {
            Some(n) => url = n,
            None => return Ok(repositories),
        }
    }
}

/// Manifests that declare `digest` as their subject. Falls back to the
/// referrers tag schema when the endpoint is absent.
pub async fn referrers(
    repo: &Repository,
    digest: &Digest,
    artifact_type: Option<&str>,
    opts: &Options,
) -> Result<IndexManifest> {
    let t = opts.pull_transport(repo)?;
    let mut url = format!("{}/v2/{}/referrers/{}", t.base_url(), repo.name(), digest);
    if let Some(at) = artifact_type {
        url = append_query(&url, &format!("artifactType={at}"));
    }
    let resp = t
        .send(
            Method::GET,
            &url,
            |rb| rb,
            &[StatusCode::OK, StatusCode::NOT_FOUND],
        )
        .await?;

    let mut index: IndexManifest = if resp.status() == StatusCode::OK {
        serde_json::from_slice(&resp.bytes().await?)?
    } else {
        // Fallback: the referrers tag schema, `<alg>-<hex>`.
        let fallback_tag = format!("{}-{}", digest.algorithm().as_str(), digest.hex());
        let url = manifest_url(&t, repo, &fallback_tag);
        let resp = t
            .send(
                Method::GET,
                &url,
                |rb| rb.header(header::ACCEPT, accept_header()),
                &[StatusCode::OK, StatusCode::NOT_FOUND],
            )
            .await?;
        if resp.status() == StatusCode::OK {
            serde_json::from_slice(&resp.bytes().await?)?
        } else {
            IndexManifest::empty(MediaType::OciImageIndex)
        }
    };

    // Filter client-side as well; not every registry applies the filter.
    if let Some(at) = artifact_type {
        index
            .manifests
            .retain(|d| d.artifact_type.as_deref() == Some(at));
    }
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_query_handles_existing_params() {
        assert_eq!(append_query("http://x/u", "digest=d"), "http://x/u?digest=d");
        assert_eq!(
            append_query("http://x/u?session=1", "digest=d"),
            "http://x/u?session=1&digest=d"
        );
    }

    #[test]
    fn accept_header_lists_all_manifest_types() {
        let h = accept_header();
        assert!(h.contains("application/vnd.oci.image.index.v1+json"));
        assert!(h.contains("application/vnd.docker.distribution.manifest.v2+json"));
    }
}
