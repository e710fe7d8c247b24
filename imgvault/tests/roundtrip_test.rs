use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use opentelemetry::metrics::MeterProvider;

use imgvault::api::routes::{AppMetrics, registry_router};
use imgvault::config::AppConfig;
use imgvault::storage::Storage;

use ocikit::image::{Image, ImageCore};
use ocikit::layer::{Layer, StaticLayer, StreamLayer};
use ocikit::mediatype::MediaType;
use ocikit::mutate;
use ocikit::{Digest, ops};

fn test_router(storage: Arc<Storage>) -> axum::Router {
    let meter = opentelemetry::metrics::noop::NoopMeterProvider::new().meter("test");
    let app_metrics = Arc::new(AppMetrics {
        request_counter: meter.u64_counter("test_requests").init(),
        blob_upload_counter: meter.u64_counter("test_uploads").init(),
        blob_size_histogram: meter.f64_histogram("test_blob_size").init(),
    });
    registry_router((storage, app_metrics))
}

// Helper function to start the registry server for testing
async fn start_test_server() -> (JoinHandle<()>, u16, Arc<Storage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let storage = Arc::new(Storage::new(&AppConfig::in_memory()).await.unwrap());
    let app = test_router(storage.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    sleep(Duration::from_millis(100)).await;
    (server, port, storage)
}

fn opts() -> ops::Options {
    ops::Options {
        insecure: true,
        ..Default::default()
    }
}

fn pseudo_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}

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
    Arc::new(StaticLayer::from_uncompressed_tar(tar_of(entries), MediaType::OciLayer).unwrap())
}

async fn image_of(layers: Vec<Arc<dyn Layer>>) -> ImageCore {
    mutate::append_layers(&ImageCore::empty(), layers)
        .await
        .unwrap()
}

/// Scenario: push a random 3-layer image, pull it back, compare manifests,
/// configs and layer digests byte for byte.
#[tokio::test]
async fn push_pull_round_trip() {
    let (server, port, _) = start_test_server().await;

    let l1 = pseudo_bytes(1, 1024);
    let l2 = pseudo_bytes(2, 1024);
    let l3 = pseudo_bytes(3, 1024);
    let img = image_of(vec![
        layer_of(&[("one.bin", &l1)]),
        layer_of(&[("two.bin", &l2)]),
        layer_of(&[("three.bin", &l3)]),
    ])
    .await;

    let reference = format!("localhost:{port}/test:latest");
    let pushed = ops::push(&img, &reference, &opts()).await.unwrap();
    assert_eq!(pushed, img.digest().await.unwrap());

    // The tag resolves to the pushed digest.
    assert_eq!(ops::digest(&reference, &opts()).await.unwrap(), pushed);

    let pulled = ops::pull(&reference, &opts()).await.unwrap();
    assert_eq!(
        pulled.raw_manifest().await.unwrap(),
        img.raw_manifest().await.unwrap()
    );
    assert_eq!(
        pulled.raw_config_file().await.unwrap(),
        img.raw_config_file().await.unwrap()
    );
    let orig_layers = img.layers().await.unwrap();
    let pulled_layers = pulled.layers().await.unwrap();
    assert_eq!(orig_layers.len(), pulled_layers.len());
    for (a, b) in orig_layers.iter().zip(pulled_layers.iter()) {
        assert_eq!(a.digest().await.unwrap(), b.digest().await.unwrap());
        assert_eq!(
            a.compressed().await.unwrap(),
            b.compressed().await.unwrap()
        );
    }

    server.abort();
}

/// Pushing the same image twice moves no further blob bytes.
#[tokio::test]
async fn push_is_idempotent() {
    let (server, port, storage) = start_test_server().await;

    let img = image_of(vec![layer_of(&[("f.bin", &pseudo_bytes(7, 2048))])]).await;
    let reference = format!("localhost:{port}/idem:latest");

    let first = ops::push(&img, &reference, &opts()).await.unwrap();
    let bytes_after_first = storage.blob_bytes_received();

    let second = ops::push(&img, &reference, &opts()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(storage.blob_bytes_received(), bytes_after_first);

    server.abort();
}

/// Tagging produces a manifest at the new tag with the source's digest.
#[tokio::test]
async fn tag_equals_copy_by_digest() {
    let (server, port, _) = start_test_server().await;

    let img = image_of(vec![layer_of(&[("f", b"x")])]).await;
    let reference = format!("localhost:{port}/tagged:latest");
    let digest = ops::push(&img, &reference, &opts()).await.unwrap();

    ops::tag(&reference, "v2", &opts()).await.unwrap();
    let v2 = ops::digest(&format!("localhost:{port}/tagged:v2"), &opts())
        .await
        .unwrap();
    assert_eq!(v2, digest);

    server.abort();
}

/// Scenario: rebase an app from its annotated old base onto a new base,
/// discovering the old base from annotations.
#[tokio::test]
async fn rebase_preserves_app_layers() {
    let (server, port, _) = start_test_server().await;
    let base_repo = format!("localhost:{port}/base");
    let base_ref = format!("{base_repo}:latest");
    let app_ref = format!("localhost:{port}/app:latest");

    let b0 = image_of(vec![layer_of(&[("a.txt", b"a\n")])]).await;
    let b0_digest = ops::push(&b0, &base_ref, &opts()).await.unwrap();

    let app = mutate::append_layers(&b0, vec![layer_of(&[("top.txt", b"top\n")])])
        .await
        .unwrap();
    let app = mutate::annotations(
        &app,
        [
            (
                "org.opencontainers.image.base.name".to_string(),
                base_repo.clone(),
            ),
            (
                "org.opencontainers.image.base.digest".to_string(),
                b0_digest.to_string(),
            ),
        ]
        .into_iter()
        .collect(),
    )
    .await
    .unwrap();
    ops::push(&app, &app_ref, &opts()).await.unwrap();

    // The new base takes over the tag; B0 stays reachable by digest.
    let b1 = image_of(vec![layer_of(&[("b.txt", b"b\n")])]).await;
    ops::push(&b1, &base_ref, &opts()).await.unwrap();

    let rebased = ops::rebase(&app_ref, None, None, &opts()).await.unwrap();
    let tar = mutate::extract(&rebased).await.unwrap();

    let mut archive = tar::Archive::new(std::io::Cursor::new(tar.as_ref()));
    let paths: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
        .collect();
    assert!(paths.contains(&"b.txt".to_string()), "got {paths:?}");
    assert!(paths.contains(&"top.txt".to_string()));
    assert!(!paths.contains(&"a.txt".to_string()));

    server.abort();
}

/// Scenario: attach a payload and list it through the referrers API.
#[tokio::test]
async fn attach_and_list_referrers() {
    let (server, port, _) = start_test_server().await;
    let target = format!("localhost:{port}/x:latest");

    let img = image_of(vec![layer_of(&[("app", b"bits")])]).await;
    ops::push(&img, &target, &opts()).await.unwrap();

    ops::attach(
        &target,
        Bytes::from_static(b"hello"),
        "application/vnd.test.note",
        &opts(),
    )
    .await
    .unwrap();

    let referrers = ops::referrers(&target, None, &opts()).await.unwrap();
    assert_eq!(referrers.manifests.len(), 1);
    let desc = &referrers.manifests[0];
    assert_eq!(
        desc.artifact_type.as_deref(),
        Some("application/vnd.test.note")
    );

    // The attached manifest's single layer is the payload, content-addressed.
    let attachment = ops::pull(
        &format!("localhost:{port}/x@{}", desc.digest),
        &opts(),
    )
    .await
    .unwrap();
    let manifest = attachment.manifest().await.unwrap();
    assert_eq!(manifest.layers.len(), 1);
    assert_eq!(manifest.layers[0].digest, Digest::sha256_of(b"hello"));
    assert_eq!(
        manifest.subject.as_ref().unwrap().digest,
        img.digest().await.unwrap()
    );

    // Filtering by another artifact type returns nothing.
    let filtered = ops::referrers(&target, Some("application/vnd.other"), &opts())
        .await
        .unwrap();
    assert!(filtered.manifests.is_empty());

    server.abort();
}

/// Scenario: pushing a pulled image into a sibling repo mounts every blob;
/// no blob body crosses the wire again.
#[tokio::test]
async fn cross_repo_push_uses_mounts() {
    let (server, port, storage) = start_test_server().await;

    let img = image_of(vec![
        layer_of(&[("one", &pseudo_bytes(11, 4096))]),
        layer_of(&[("two", &pseudo_bytes(12, 4096))]),
    ])
    .await;
    let src = format!("localhost:{port}/a:latest");
    ops::push(&img, &src, &opts()).await.unwrap();
    let bytes_after_first = storage.blob_bytes_received();

    let pulled = ops::pull(&src, &opts()).await.unwrap();
    let dst = format!("localhost:{port}/b:latest");
    let copied = ops::push(pulled.as_ref(), &dst, &opts()).await.unwrap();

    assert_eq!(copied, img.digest().await.unwrap());
    assert_eq!(storage.blob_bytes_received(), bytes_after_first);

    server.abort();
}

/// Copy an index across repositories child by child.
#[tokio::test]
async fn copy_whole_index() {
    let (server, port, _) = start_test_server().await;

    let amd = image_of(vec![layer_of(&[("bin", b"amd64 bits")])]).await;
    let arm = image_of(vec![layer_of(&[("bin", b"arm64 bits")])]).await;
    let idx = mutate::append_manifests(
        &ocikit::image::IndexCore::empty(),
        vec![
            mutate::IndexAddendum {
                child: ocikit::image::IndexChild::Image(Arc::new(amd)),
                platform: Some(ocikit::Platform::new("linux", "amd64")),
                annotations: None,
            },
            mutate::IndexAddendum {
                child: ocikit::image::IndexChild::Image(Arc::new(arm)),
                platform: Some(ocikit::Platform::new("linux", "arm64")),
                annotations: None,
            },
        ],
    )
    .await
    .unwrap();

    let src = format!("localhost:{port}/multi:latest");
    let pushed = ops::push_index(&idx, &src, &opts()).await.unwrap();

    let dst = format!("localhost:{port}/multi-copy:latest");
    let copied = ops::copy(&src, &dst, &opts()).await.unwrap();
    assert_eq!(pushed, copied);

    // Platform selection pulls the right child.
    let platform_opts = ops::Options {
        insecure: true,
        platform: Some(ocikit::Platform::new("linux", "arm64")),
        ..Default::default()
    };
    let arm_pulled = ops::pull(&dst, &platform_opts).await.unwrap();
    let tar = mutate::extract(arm_pulled.as_ref()).await.unwrap();
    let mut archive = tar::Archive::new(std::io::Cursor::new(tar.as_ref()));
    let mut found_arm_bits = false;
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let mut data = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
        if data == b"arm64 bits" {
            found_arm_bits = true;
        }
    }
    assert!(found_arm_bits);

    server.abort();
}

// Fails the second PATCH request once, to exercise chunk resume.
async fn flaky_patch(
    State(counter): State<Arc<AtomicU32>>,
    req: Request,
    next: Next,
) -> Response {
    if req.method() == Method::PATCH {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n == 1 {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    next.run(req).await
}

/// Scenario: a chunked upload survives a failing chunk by resuming from
/// the server's committed range.
#[tokio::test]
async fn chunked_upload_resumes_after_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let storage = Arc::new(Storage::new(&AppConfig::in_memory()).await.unwrap());
    let counter = Arc::new(AtomicU32::new(0));
    let app = test_router(storage.clone()).layer(axum::middleware::from_fn_with_state(
        counter.clone(),
        flaky_patch,
    ));
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    sleep(Duration::from_millis(100)).await;

    // A streamed layer takes the chunked path; keeping it uncompressed
    // pins the blob size, so small chunks force several PATCH requests.
    let content = tar_of(&[("data.bin", pseudo_bytes(42, 4096).as_slice())]);
    let stream_layer: Arc<dyn Layer> = Arc::new(
        StreamLayer::new(Box::new(std::io::Cursor::new(content.to_vec())))
            .with_media_type(MediaType::OciUncompressedLayer),
    );
    let img = mutate::append_layers(&ImageCore::empty(), vec![stream_layer.clone()])
        .await
        .unwrap();

    let options = ops::Options {
        insecure: true,
        chunk_size: Some(1024),
        ..Default::default()
    };
    let reference = format!("localhost:{port}/resume:latest");
    ops::push(&img, &reference, &options).await.unwrap();

    // The middleware really did interfere.
    assert!(counter.load(Ordering::SeqCst) >= 3);

    // The committed blob matches what the stream produced.
    let digest = stream_layer.digest().await.unwrap();
    let blob = storage
        .get_blob("resume", &digest.to_string())
        .await
        .unwrap();
    assert_eq!(Digest::sha256_of(&blob), digest);

    server.abort();
}

/// Scenario: flattening yields one layer whose diff ID is the digest of
/// the extracted filesystem.
#[tokio::test]
async fn flatten_single_layer_diff_id() {
    let (server, port, _) = start_test_server().await;

    let img = image_of(vec![
        layer_of(&[("a.txt", b"a")]),
        layer_of(&[("b.txt", b"b")]),
        layer_of(&[("c.txt", b"c")]),
    ])
    .await;
    let src = format!("localhost:{port}/fat:latest");
    let dst = format!("localhost:{port}/flat:latest");
    ops::push(&img, &src, &opts()).await.unwrap();

    let extracted = mutate::extract(&img).await.unwrap();
    ops::flatten(&src, &dst, &opts()).await.unwrap();

    let flat = ops::pull(&dst, &opts()).await.unwrap();
    let layers = flat.layers().await.unwrap();
    assert_eq!(layers.len(), 1);
    assert_eq!(
        layers[0].diff_id().await.unwrap(),
        Digest::sha256_of(&extracted)
    );

    server.abort();
}

/// Semver bump re-tags the release, its minor/major aliases and latest.
#[tokio::test]
async fn bump_applies_release_aliases() {
    let (server, port, _) = start_test_server().await;

    let img = image_of(vec![layer_of(&[("app", b"v1")])]).await;
    let src = format!("localhost:{port}/rel:v1.2.3");
    let digest = ops::push(&img, &src, &opts()).await.unwrap();

    let applied = ops::bump(&src, "v1.2.3", &opts()).await.unwrap();
    assert_eq!(
        applied,
        vec!["v1.2".to_string(), "v1".to_string(), "latest".to_string()]
    );
    for tag in ["v1.2", "v1", "latest"] {
        let got = ops::digest(&format!("localhost:{port}/rel:{tag}"), &opts())
            .await
            .unwrap();
        assert_eq!(got, digest);
    }

    // An older release is a no-op.
    let old = image_of(vec![layer_of(&[("app", b"v0")])]).await;
    let old_src = format!("localhost:{port}/rel:v0.9.0");
    ops::push(&old, &old_src, &opts()).await.unwrap();
    let applied = ops::bump(&old_src, "v0.9.0", &opts()).await.unwrap();
    assert!(applied.is_empty());
    assert_eq!(
        ops::digest(&format!("localhost:{port}/rel:latest"), &opts())
            .await
            .unwrap(),
        digest
    );

    // Prerelease tags are rejected outright.
    assert!(ops::bump(&src, "v2.0.0-rc.1", &opts()).await.is_err());

    server.abort();
}

/// Deleting a tag leaves the digest; probing distinguishes 404s.
#[tokio::test]
async fn delete_and_not_found_probe() {
    let (server, port, _) = start_test_server().await;

    let img = image_of(vec![layer_of(&[("f", b"x")])]).await;
    let reference = format!("localhost:{port}/del:latest");
    let digest = ops::push(&img, &reference, &opts()).await.unwrap();

    ops::delete(&reference, &opts()).await.unwrap();

    let err = ops::digest(&reference, &opts()).await.unwrap_err();
    assert!(err.is_not_found(), "expected a not-found error, got {err}");

    // Still there by digest.
    let by_digest = format!("localhost:{port}/del@{digest}");
    assert_eq!(ops::digest(&by_digest, &opts()).await.unwrap(), digest);

    server.abort();
}

/// Client-side listing helpers against the live server.
#[tokio::test]
async fn list_tags_and_catalog() {
    let (server, port, _) = start_test_server().await;

    let img = image_of(vec![layer_of(&[("f", b"x")])]).await;
    for reference in [
        format!("localhost:{port}/one:latest"),
        format!("localhost:{port}/one:v1"),
        format!("localhost:{port}/two:latest"),
    ] {
        ops::push(&img, &reference, &opts()).await.unwrap();
    }

    let mut tags = ops::list_tags(&format!("localhost:{port}/one"), &opts())
        .await
        .unwrap();
    tags.sort();
    assert_eq!(tags, vec!["latest".to_string(), "v1".to_string()]);

    let repos = ops::catalog(&format!("localhost:{port}"), &opts())
        .await
        .unwrap();
    assert_eq!(repos, vec!["one".to_string(), "two".to_string()]);

    server.abort();
}
