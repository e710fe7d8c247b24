use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use opentelemetry::metrics::{Counter, Histogram};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use ocikit::{Digest, MediaType};

use crate::error::{AppError, Result};
use crate::storage::Storage;

use super::models::{CatalogResponse, TagsListResponse};

const MAX_BODY_BYTES: usize = 1 << 30;
const DEFAULT_PAGE_SIZE: usize = 1000;

// Application state with storage and metrics
pub struct AppMetrics {
    pub request_counter: Counter<u64>,
    pub blob_upload_counter: Counter<u64>,
    pub blob_size_histogram: Histogram<f64>,
}

// Type alias for our application state
pub type AppState = (Arc<Storage>, Arc<AppMetrics>);

// Query parameters for paginated listings
#[derive(Debug, Deserialize)]
pub struct Pagination {
    n: Option<usize>,
    last: Option<String>,
}

/// The registry router. `/v2/` and `/v2/_catalog` are fixed routes; every
/// other `/v2/...` path goes through `dispatch`, because repository names
/// may span multiple path segments and cannot be route templates.
pub fn registry_router(state: AppState) -> Router {
    Router::new()
        .route("/v2/", get(api_version_check))
        .route("/v2/_catalog", get(list_repositories))
        .fallback(dispatch)
        .with_state(state)
}

/// A parsed `/v2/...` request path.
#[derive(Debug, PartialEq)]
enum RegistryPath {
    Tags { repo: String },
    Manifest { repo: String, reference: String },
    Blob { repo: String, digest: String },
    UploadStart { repo: String },
    UploadSession { repo: String, uuid: String },
    Referrers { repo: String, digest: String },
}

impl RegistryPath {
    fn parse(path: &str) -> Option<RegistryPath> {
        let rest = path.strip_prefix("/v2/")?;
        let segments: Vec<&str> = rest.split('/').collect();
        let n = segments.len();

        // /v2/<repo...>/tags/list
        if n >= 3 && segments[n - 2] == "tags" && segments[n - 1] == "list" {
            return Some(RegistryPath::Tags {
                repo: segments[..n - 2].join("/"),
            });
        }
        // /v2/<repo...>/manifests/<reference>
        if n >= 3 && segments[n - 2] == "manifests" {
            return Some(RegistryPath::Manifest {
                repo: segments[..n - 2].join("/"),
                reference: segments[n - 1].to_string(),
            });
        }
        // /v2/<repo...>/referrers/<digest>
        if n >= 3 && segments[n - 2] == "referrers" {
            return Some(RegistryPath::Referrers {
                repo: segments[..n - 2].join("/"),
                digest: segments[n - 1].to_string(),
            });
        }
        // /v2/<repo...>/blobs/uploads/ and /v2/<repo...>/blobs/uploads/<uuid>
        if n >= 3 && segments[n - 2] == "blobs" && segments[n - 1] == "uploads" {
            return Some(RegistryPath::UploadStart {
                repo: segments[..n - 2].join("/"),
            });
        }
        if n >= 4 && segments[n - 3] == "blobs" && segments[n - 2] == "uploads" {
            let repo = segments[..n - 3].join("/");
            if segments[n - 1].is_empty() {
                return Some(RegistryPath::UploadStart { repo });
            }
            return Some(RegistryPath::UploadSession {
                repo,
                uuid: segments[n - 1].to_string(),
            });
        }
        // /v2/<repo...>/blobs/<digest>
        if n >= 3 && segments[n - 2] == "blobs" {
            return Some(RegistryPath::Blob {
                repo: segments[..n - 2].join("/"),
                digest: segments[n - 1].to_string(),
            });
        }
        None
    }
}

/// Percent-decode a query component. `+` stays literal: these are URI
/// query values, not form fields, and media types contain `+`.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

/// Route a `/v2/...` request to its handler based on path shape + method.
async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let uri = req.uri().clone();
    let query = uri.query().map(parse_query).unwrap_or_default();

    let Some(route) = RegistryPath::parse(uri.path()) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => return AppError::Internal(format!("reading body: {e}")).into_response(),
    };

    state.1.request_counter.add(1, &[]);

    let result: Result<Response> = match (route, method.as_str()) {
        (RegistryPath::Tags { repo }, "GET") => list_tags(&state, &repo, &query).await,
        (RegistryPath::Manifest { repo, reference }, "GET") => {
            get_manifest(&state, &repo, &reference, false).await
        }
        (RegistryPath::Manifest { repo, reference }, "HEAD") => {
            get_manifest(&state, &repo, &reference, true).await
        }
        (RegistryPath::Manifest { repo, reference }, "PUT") => {
            put_manifest(&state, &repo, &reference, &headers, body).await
        }
        (RegistryPath::Manifest { repo, reference }, "DELETE") => {
            delete_manifest(&state, &repo, &reference).await
        }
        (RegistryPath::Blob { repo, digest }, "GET") => {
            get_blob(&state, &repo, &digest, &headers).await
        }
        (RegistryPath::Blob { repo, digest }, "HEAD") => head_blob(&state, &repo, &digest).await,
        (RegistryPath::Blob { repo, digest }, "DELETE") => {
            delete_blob(&state, &repo, &digest).await
        }
        (RegistryPath::UploadStart { repo }, "POST") => start_upload(&state, &repo, &query).await,
        (RegistryPath::UploadSession { repo, uuid }, "PATCH") => {
            patch_upload(&state, &repo, &uuid, &headers, body).await
        }
        (RegistryPath::UploadSession { repo, uuid }, "PUT") => {
            put_upload(&state, &repo, &uuid, &query, body).await
        }
        (RegistryPath::UploadSession { repo, uuid }, "GET") => {
            upload_status(&state, &repo, &uuid).await
        }
        (RegistryPath::UploadSession { repo, uuid }, "DELETE") => {
            cancel_upload(&state, &repo, &uuid).await
        }
        (RegistryPath::Referrers { repo, digest }, "GET") => {
            get_referrers(&state, &repo, &digest, &query).await
        }
        _ => Err(AppError::MethodNotAllowed),
    };

    result.unwrap_or_else(|e| e.into_response())
}

// API Version Check
#[instrument(name = "api_version_check", skip_all)]
async fn api_version_check(State((_, metrics)): State<AppState>) -> Response {
    metrics.request_counter.add(1, &[]);
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(
        "Docker-Distribution-API-Version",
        header::HeaderValue::from_static("registry/2.0"),
    );
    response
}

fn paginate(items: &mut Vec<String>, n: Option<usize>, last: Option<&String>) -> bool {
    if let Some(last) = last {
        if let Some(pos) = items.iter().position(|i| i == last) {
            *items = items.split_off(pos + 1);
        }
    }
    let n = n.unwrap_or(DEFAULT_PAGE_SIZE);
    if items.len() > n {
        items.truncate(n);
        true
    } else {
        false
    }
}

// List repositories
#[instrument(name = "list_repositories", skip(storage, metrics, params), fields(n = ?params.n, last = ?params.last))]
async fn list_repositories(
    State((storage, metrics)): State<AppState>,
    Query(params): Query<Pagination>,
) -> Result<Response> {
    metrics.request_counter.add(1, &[]);

    let mut repositories = storage.list_repositories().await?;
    let truncated = paginate(&mut repositories, params.n, params.last.as_ref());
    info!("found {} repositories", repositories.len());

    let link = truncated.then(|| {
        format!(
            "</v2/_catalog?n={}&last={}>; rel=\"next\"",
            params.n.unwrap_or(DEFAULT_PAGE_SIZE),
            repositories.last().cloned().unwrap_or_default()
        )
    });
    let mut response = axum::Json(CatalogResponse { repositories }).into_response();
    if let Some(link) = link {
        if let Ok(value) = link.parse() {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    Ok(response)
}

// List tags
#[instrument(name = "list_tags", skip(state, query), fields(repository = %repo))]
async fn list_tags(
    state: &AppState,
    repo: &str,
    query: &HashMap<String, String>,
) -> Result<Response> {
    let (storage, _) = state;
    let n = query.get("n").and_then(|v| v.parse::<usize>().ok());
    let last = query.get("last").cloned();

    let mut tags = storage.list_tags(repo).await?;
    let truncated = paginate(&mut tags, n, last.as_ref());
    info!("found {} tags for repository {}", tags.len(), repo);

    let link = truncated.then(|| {
        format!(
            "</v2/{}/tags/list?n={}&last={}>; rel=\"next\"",
            repo,
            n.unwrap_or(DEFAULT_PAGE_SIZE),
            tags.last().cloned().unwrap_or_default()
        )
    });
    let mut response = axum::Json(TagsListResponse {
        name: repo.to_string(),
        tags,
    })
    .into_response();
    if let Some(link) = link {
        if let Ok(value) = link.parse() {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    Ok(response)
}

/// The media type stored in a manifest body, for the Content-Type header.
fn manifest_media_type(content: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(content)
        .ok()
        .and_then(|v| {
            v.get("mediaType")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| MediaType::OciManifest.as_str().to_string())
}

// Get or check a manifest; HEAD shares the lookup and headers.
#[instrument(name = "get_manifest", skip(state), fields(repository = %repo, reference = %reference))]
async fn get_manifest(
    state: &AppState,
    repo: &str,
    reference: &str,
    head_only: bool,
) -> Result<Response> {
    let (storage, metrics) = state;
    let content = storage.get_manifest(repo, reference).await?;
    let digest = format!("sha256:{}", sha256_digest(&content));
    let content_type = manifest_media_type(&content);
    let content_length = content.len();
    metrics.blob_size_histogram.record(content_length as f64, &[]);
    info!(
        "retrieved manifest {}/{}, size {} bytes, digest {}",
        repo, reference, content_length, digest
    );

    let body = if head_only {
        Body::empty()
    } else {
        Body::from(content)
    };
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    insert_header(headers, header::CONTENT_TYPE.as_str(), &content_type)?;
    headers.insert(header::CONTENT_LENGTH, content_length.into());
    insert_header(headers, "Docker-Content-Digest", &digest)?;
    Ok(response)
}

/// A descriptor pointed at by a schema-2 image manifest that must exist
/// as a blob before the manifest may be stored.
fn required_blobs(manifest: &serde_json::Value) -> Vec<String> {
    let mut digests = Vec::new();
    if let Some(config) = manifest.get("config") {
        if let Some(digest) = config.get("digest").and_then(|d| d.as_str()) {
            digests.push(digest.to_string());
        }
    }
    if let Some(layers) = manifest.get("layers").and_then(|l| l.as_array()) {
        for layer in layers {
            // Foreign layers are fetched from their URLs, not the registry.
            if layer.get("urls").map(|u| !u.is_null()).unwrap_or(false) {
                continue;
            }
            let distributable = layer
                .get("mediaType")
                .and_then(|m| m.as_str())
                .map(|m| MediaType::from(m).is_distributable() || !MediaType::from(m).is_layer())
                .unwrap_or(true);
            if !distributable {
                continue;
            }
            if let Some(digest) = layer.get("digest").and_then(|d| d.as_str()) {
                digests.push(digest.to_string());
            }
        }
    }
    digests
}

// Put manifest
#[instrument(name = "put_manifest", skip(state, headers, body), fields(repository = %repo, reference = %reference, size = body.len()))]
async fn put_manifest(
    state: &AppState,
    repo: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let (storage, metrics) = state;
    metrics.blob_size_histogram.record(body.len() as f64, &[]);

    let manifest: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::ManifestInvalid(format!("{repo}/{reference}: {e}")))?;

    // A digest reference must address exactly these bytes.
    if let Ok(expected) = Digest::from_str(reference) {
        let computed = format!("sha256:{}", sha256_digest(&body));
        if computed != expected.to_string() {
            return Err(AppError::DigestInvalid(format!(
                "manifest PUT at {expected} has digest {computed}"
            )));
        }
    }

    // Schema-2 image manifests must only reference blobs we already hold.
    let is_image_manifest = manifest.get("config").is_some() && manifest.get("layers").is_some();
    if is_image_manifest {
        for digest in required_blobs(&manifest) {
            if !storage.blob_exists(repo, &digest).await? {
                return Err(AppError::ManifestBlobUnknown(digest));
            }
        }
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    info!(
        "storing manifest {}/{} ({} bytes, {})",
        repo,
        reference,
        body.len(),
        content_type
    );

    let subject_digest = manifest
        .get("subject")
        .and_then(|s| s.get("digest"))
        .and_then(|d| d.as_str())
        .map(str::to_string);

    let digest = storage.put_manifest(repo, reference, body).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    let headers = response.headers_mut();
    insert_header(
        headers,
        header::LOCATION.as_str(),
        &format!("/v2/{repo}/manifests/{reference}"),
    )?;
    insert_header(headers, "Docker-Content-Digest", &digest)?;
    if let Some(subject) = subject_digest {
        insert_header(headers, "OCI-Subject", &subject)?;
    }
    Ok(response)
}

// Delete manifest: a tag removes the mapping, a digest removes the bytes.
#[instrument(name = "delete_manifest", skip(state), fields(repository = %repo, reference = %reference))]
async fn delete_manifest(state: &AppState, repo: &str, reference: &str) -> Result<Response> {
    let (storage, _) = state;
    storage.delete_manifest(repo, reference).await?;
    info!("deleted manifest {}/{}", repo, reference);
    Ok(StatusCode::ACCEPTED.into_response())
}

// Get blob, honoring single-range requests.
#[instrument(name = "get_blob", skip(state, headers), fields(repository = %repo, digest = %digest))]
async fn get_blob(
    state: &AppState,
    repo: &str,
    digest: &str,
    headers: &HeaderMap,
) -> Result<Response> {
    let (storage, metrics) = state;
    let content = storage.get_blob(repo, digest).await?;
    let total = content.len();
    metrics.blob_size_histogram.record(total as f64, &[]);

    if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        let (start, end) = parse_byte_range(range, total)?;
        let slice = content.slice(start..=end);
        let mut response = Response::new(Body::from(slice));
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        let headers = response.headers_mut();
        insert_header(
            headers,
            header::CONTENT_RANGE.as_str(),
            &format!("bytes {start}-{end}/{total}"),
        )?;
        insert_header(headers, header::CONTENT_TYPE.as_str(), "application/octet-stream")?;
        headers.insert(header::CONTENT_LENGTH, (end - start + 1).into());
        return Ok(response);
    }

    info!("retrieved blob {}/{}, size {} bytes", repo, digest, total);
    let mut response = Response::new(Body::from(content));
    let headers = response.headers_mut();
    insert_header(headers, header::CONTENT_TYPE.as_str(), "application/octet-stream")?;
    headers.insert(header::CONTENT_LENGTH, total.into());
    insert_header(headers, "Docker-Content-Digest", digest)?;
    Ok(response)
}

/// Parse `bytes=a-b` against a blob of `total` bytes.
fn parse_byte_range(range: &str, total: usize) -> Result<(usize, usize)> {
    let spec = range
        .strip_prefix("bytes=")
        .ok_or_else(|| AppError::RangeNotSatisfiable(range.to_string()))?;
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| AppError::RangeNotSatisfiable(range.to_string()))?;
    let start: usize = start
        .parse()
        .map_err(|_| AppError::RangeNotSatisfiable(range.to_string()))?;
    let end: usize = if end.is_empty() {
        total.saturating_sub(1)
    } else {
        end.parse()
            .map_err(|_| AppError::RangeNotSatisfiable(range.to_string()))?
    };
    if start > end || end >= total {
        return Err(AppError::RangeNotSatisfiable(format!(
            "{range} of {total} bytes"
        )));
    }
    Ok((start, end))
}

// Check blob existence
#[instrument(name = "head_blob", skip(state), fields(repository = %repo, digest = %digest))]
async fn head_blob(state: &AppState, repo: &str, digest: &str) -> Result<Response> {
    let (storage, _) = state;
    let size = storage.get_blob_size(repo, digest).await?;
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, size.into());
    insert_header(headers, "Docker-Content-Digest", digest)?;
    Ok(response)
}

// Delete blob
#[instrument(name = "delete_blob", skip(state), fields(repository = %repo, digest = %digest))]
async fn delete_blob(state: &AppState, repo: &str, digest: &str) -> Result<Response> {
    let (storage, _) = state;
    storage.delete_blob(repo, digest).await?;
    info!("deleted blob {}/{}", repo, digest);
    Ok(StatusCode::ACCEPTED.into_response())
}

// Start blob upload, or satisfy a cross-repo mount without one.
#[instrument(name = "start_upload", skip(state, query), fields(repository = %repo))]
async fn start_upload(
    state: &AppState,
    repo: &str,
    query: &HashMap<String, String>,
) -> Result<Response> {
    let (storage, metrics) = state;

    if let (Some(mount), Some(from)) = (query.get("mount"), query.get("from")) {
        if storage.can_mount(repo, from, mount).await? {
            info!("mounted blob {} from {} into {}", mount, from, repo);
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::CREATED;
            let headers = response.headers_mut();
            insert_header(
                headers,
                header::LOCATION.as_str(),
                &format!("/v2/{repo}/blobs/{mount}"),
            )?;
            insert_header(headers, "Docker-Content-Digest", mount)?;
            return Ok(response);
        }
        warn!("mount of {} from {} refused, starting upload", mount, from);
    }

    let uuid = uuid::Uuid::new_v4().to_string();
    storage.start_upload(repo, &uuid).await?;
    metrics.blob_upload_counter.add(1, &[]);
    info!("started upload {}/{}", repo, uuid);

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::ACCEPTED;
    let headers = response.headers_mut();
    insert_header(
        headers,
        header::LOCATION.as_str(),
        &format!("/v2/{repo}/blobs/uploads/{uuid}"),
    )?;
    insert_header(headers, header::RANGE.as_str(), "0-0")?;
    insert_header(headers, "Docker-Upload-UUID", &uuid)?;
    Ok(response)
}

// Upload blob chunk; Content-Range (when present) must continue exactly
// where the session left off.
#[instrument(name = "patch_upload", skip(state, headers, body), fields(repository = %repo, uuid = %uuid, size = body.len()))]
async fn patch_upload(
    state: &AppState,
    repo: &str,
    uuid: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let (storage, _) = state;
    let status = storage.upload_status(repo, uuid).await?;

    if let Some(content_range) = headers.get("Content-Range").and_then(|v| v.to_str().ok()) {
        let start = content_range
            .split_once('-')
            .and_then(|(s, _)| s.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                AppError::BlobUploadInvalid(format!("malformed Content-Range {content_range:?}"))
            })?;
        if start != status.size {
            return Err(AppError::RangeNotSatisfiable(format!(
                "chunk starts at {start} but {} bytes are committed",
                status.size
            )));
        }
    }

    let size = storage.append_chunk(repo, uuid, body).await?;
    info!("chunk accepted, {}/{} now at {} bytes", repo, uuid, size);

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::ACCEPTED;
    let headers_map = response.headers_mut();
    insert_header(
        headers_map,
        header::LOCATION.as_str(),
        &format!("/v2/{repo}/blobs/uploads/{uuid}"),
    )?;
    insert_header(
        headers_map,
        header::RANGE.as_str(),
        &format!("0-{}", size.saturating_sub(1)),
    )?;
    Ok(response)
}

// Complete upload; verifies the declared digest against the bytes.
#[instrument(name = "put_upload", skip(state, query, body), fields(repository = %repo, uuid = %uuid, size = body.len()))]
async fn put_upload(
    state: &AppState,
    repo: &str,
    uuid: &str,
    query: &HashMap<String, String>,
    body: Bytes,
) -> Result<Response> {
    let (storage, metrics) = state;
    let digest = query
        .get("digest")
        .ok_or_else(|| AppError::DigestInvalid("missing digest parameter".to_string()))?;

    let committed = storage.complete_upload(repo, uuid, digest, body).await?;
    metrics
        .blob_size_histogram
        .record(storage.get_blob_size(repo, &committed).await? as f64, &[]);
    info!("completed upload {}/{}, digest {}", repo, uuid, committed);

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    let headers = response.headers_mut();
    insert_header(
        headers,
        header::LOCATION.as_str(),
        &format!("/v2/{repo}/blobs/{committed}"),
    )?;
    insert_header(headers, "Docker-Content-Digest", &committed)?;
    Ok(response)
}

// Upload progress: 204 with the committed range.
#[instrument(name = "upload_status", skip(state), fields(repository = %repo, uuid = %uuid))]
async fn upload_status(state: &AppState, repo: &str, uuid: &str) -> Result<Response> {
    let (storage, _) = state;
    let status = storage.upload_status(repo, uuid).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    insert_header(
        headers,
        header::LOCATION.as_str(),
        &format!("/v2/{repo}/blobs/uploads/{uuid}"),
    )?;
    insert_header(
        headers,
        header::RANGE.as_str(),
        &format!("0-{}", status.size.saturating_sub(1)),
    )?;
    Ok(response)
}

// Cancel upload
#[instrument(name = "cancel_upload", skip(state), fields(repository = %repo, uuid = %uuid))]
async fn cancel_upload(state: &AppState, repo: &str, uuid: &str) -> Result<Response> {
    let (storage, _) = state;
    // 404 for sessions that never existed.
    storage.upload_status(repo, uuid).await?;
    storage.cancel_upload(repo, uuid).await?;
    info!("cancelled upload {}/{}", repo, uuid);
    Ok(StatusCode::NO_CONTENT.into_response())
}

// Referrers: an index of every manifest whose subject is `digest`.
#[instrument(name = "get_referrers", skip(state, query), fields(repository = %repo, digest = %digest))]
async fn get_referrers(
    state: &AppState,
    repo: &str,
    digest: &str,
    query: &HashMap<String, String>,
) -> Result<Response> {
    let (storage, _) = state;
    Digest::from_str(digest).map_err(|e| AppError::DigestInvalid(e.to_string()))?;
    let filter = query.get("artifactType");

    let mut descriptors = Vec::new();
    for (manifest_digest, bytes) in storage.digest_manifests(repo).await? {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            continue;
        };
        let subject = value
            .get("subject")
            .and_then(|s| s.get("digest"))
            .and_then(|d| d.as_str());
        if subject != Some(digest) {
            continue;
        }
        descriptors.push(referrer_descriptor(&manifest_digest, &bytes, &value)?);
    }

    if let Some(filter) = filter {
        descriptors.retain(|d: &serde_json::Value| {
            d.get("artifactType").and_then(|a| a.as_str()) == Some(filter.as_str())
        });
    }

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MediaType::OciImageIndex.as_str(),
        "manifests": descriptors,
    });
    let body = serde_json::to_vec(&index)?;
    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    insert_header(
        headers,
        header::CONTENT_TYPE.as_str(),
        MediaType::OciImageIndex.as_str(),
    )?;
    if filter.is_some() {
        insert_header(headers, "OCI-Filters-Applied", "artifactType")?;
    }
    Ok(response)
}

/// The descriptor a referrers index lists for one subject-bearing
/// manifest. The artifact type falls back to a non-standard config media
/// type, matching how clients artifact-type their attachments.
fn referrer_descriptor(
    manifest_digest: &str,
    bytes: &[u8],
    value: &serde_json::Value,
) -> Result<serde_json::Value> {
    let media_type = value
        .get("mediaType")
        .and_then(|m| m.as_str())
        .unwrap_or(MediaType::OciManifest.as_str());
    let artifact_type = value
        .get("artifactType")
        .and_then(|a| a.as_str())
        .map(str::to_string)
        .or_else(|| {
            let config_type = value
                .get("config")
                .and_then(|c| c.get("mediaType"))
                .and_then(|m| m.as_str())?;
            if MediaType::from(config_type).is_config() {
                None
            } else {
                Some(config_type.to_string())
            }
        });

    let mut descriptor = BTreeMap::new();
    descriptor.insert(
        "mediaType".to_string(),
        serde_json::Value::String(media_type.to_string()),
    );
    descriptor.insert(
        "digest".to_string(),
        serde_json::Value::String(manifest_digest.to_string()),
    );
    descriptor.insert(
        "size".to_string(),
        serde_json::Value::Number(bytes.len().into()),
    );
    if let Some(artifact_type) = artifact_type {
        descriptor.insert(
            "artifactType".to_string(),
            serde_json::Value::String(artifact_type),
        );
    }
    if let Some(annotations) = value.get("annotations") {
        if !annotations.is_null() {
            descriptor.insert("annotations".to_string(), annotations.clone());
        }
    }
    Ok(serde_json::to_value(descriptor)?)
}

// Helper function to calculate SHA256 digest
fn sha256_digest(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = header::HeaderName::from_str(name)
        .map_err(|e| AppError::Internal(format!("bad header name {name:?}: {e}")))?;
    let value = value
        .parse()
        .map_err(|_| AppError::Internal(format!("bad header value for {name:?}")))?;
    headers.insert(name, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_segment_paths() {
        assert_eq!(
            RegistryPath::parse("/v2/test/manifests/latest"),
            Some(RegistryPath::Manifest {
                repo: "test".to_string(),
                reference: "latest".to_string()
            })
        );
        assert_eq!(
            RegistryPath::parse("/v2/test/blobs/uploads/"),
            Some(RegistryPath::UploadStart {
                repo: "test".to_string()
            })
        );
        assert_eq!(
            RegistryPath::parse("/v2/test/blobs/uploads/abc-123"),
            Some(RegistryPath::UploadSession {
                repo: "test".to_string(),
                uuid: "abc-123".to_string()
            })
        );
    }

    #[test]
    fn parses_multi_segment_repositories() {
        assert_eq!(
            RegistryPath::parse("/v2/library/nested/repo/tags/list"),
            Some(RegistryPath::Tags {
                repo: "library/nested/repo".to_string()
            })
        );
        assert_eq!(
            RegistryPath::parse("/v2/a/b/blobs/sha256:abc"),
            Some(RegistryPath::Blob {
                repo: "a/b".to_string(),
                digest: "sha256:abc".to_string()
            })
        );
        assert_eq!(
            RegistryPath::parse("/v2/a/b/referrers/sha256:abc"),
            Some(RegistryPath::Referrers {
                repo: "a/b".to_string(),
                digest: "sha256:abc".to_string()
            })
        );
    }

    #[test]
    fn rejects_junk_paths() {
        assert_eq!(RegistryPath::parse("/v1/test/manifests/latest"), None);
        assert_eq!(RegistryPath::parse("/v2/manifests"), None);
    }

    #[test]
    fn byte_ranges() {
        assert_eq!(parse_byte_range("bytes=0-9", 100).unwrap(), (0, 9));
        assert_eq!(parse_byte_range("bytes=10-", 100).unwrap(), (10, 99));
        assert!(parse_byte_range("bytes=90-100", 100).is_err());
        assert!(parse_byte_range("lines=0-9", 100).is_err());
    }

    #[test]
    fn query_decoding_keeps_plus() {
        let q = parse_query("artifactType=application%2Fvnd.test%2Bjson&digest=sha256%3Aabc");
        assert_eq!(
            q.get("artifactType").map(String::as_str),
            Some("application/vnd.test+json")
        );
        assert_eq!(q.get("digest").map(String::as_str), Some("sha256:abc"));
        let raw = parse_query("artifactType=application/vnd.test+json");
        assert_eq!(
            raw.get("artifactType").map(String::as_str),
            Some("application/vnd.test+json")
        );
    }
}
