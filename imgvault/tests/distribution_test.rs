use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use opentelemetry::metrics::MeterProvider;

use imgvault::api::routes::AppMetrics;
use imgvault::config::AppConfig;
use imgvault::storage::Storage;

// Helper function to start the registry server for testing
async fn start_test_server_with(config: AppConfig) -> (JoinHandle<()>, u16, Arc<Storage>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let storage = Arc::new(Storage::new(&config).await.unwrap());

    let meter = opentelemetry::metrics::noop::NoopMeterProvider::new().meter("test");
    let app_metrics = Arc::new(AppMetrics {
        request_counter: meter.u64_counter("test_requests").init(),
        blob_upload_counter: meter.u64_counter("test_uploads").init(),
        blob_size_histogram: meter.f64_histogram("test_blob_size").init(),
    });

    let app_state = (Arc::clone(&storage), app_metrics);
    let app = imgvault::api::routes::registry_router(app_state);

    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    sleep(Duration::from_millis(100)).await;

    (server, port, storage)
}

async fn start_test_server() -> (JoinHandle<()>, u16, Arc<Storage>) {
    start_test_server_with(AppConfig::in_memory()).await
}

fn sha256_of(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Upload a blob monolithically and return its digest.
async fn upload_blob(client: &reqwest::Client, port: u16, repo: &str, content: &[u8]) -> String {
    let digest = sha256_of(content);
    let start = client
        .post(format!("http://localhost:{port}/v2/{repo}/blobs/uploads/"))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status().as_u16(), 202);
    let location = start.headers().get("location").unwrap().to_str().unwrap();
    let complete = client
        .put(format!("http://localhost:{port}{location}?digest={digest}"))
        .body(content.to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(complete.status().as_u16(), 201, "upload failed: {complete:?}");
    digest
}

/// Upload config + layer and PUT a minimal OCI image manifest at `reference`.
async fn push_simple_manifest(
    client: &reqwest::Client,
    port: u16,
    repo: &str,
    reference: &str,
    layer_content: &[u8],
) -> String {
    let config = b"{}".to_vec();
    let config_digest = upload_blob(client, port, repo, &config).await;
    let layer_digest = upload_blob(client, port, repo, layer_content).await;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": layer_digest,
            "size": layer_content.len(),
        }],
    });
    let body = serde_json::to_vec(&manifest).unwrap();
    let digest = sha256_of(&body);
    let resp = client
        .put(format!("http://localhost:{port}/v2/{repo}/manifests/{reference}"))
        .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 201, "manifest push failed: {resp:?}");
    assert_eq!(
        resp.headers().get("Docker-Content-Digest").unwrap().to_str().unwrap(),
        digest
    );
    digest
}

#[tokio::test]
async fn test_api_version_check() {
    let (server, port, _) = start_test_server().await;

    let response = reqwest::get(format!("http://localhost:{port}/v2/"))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get("Docker-Distribution-API-Version")
            .unwrap(),
        "registry/2.0"
    );

    server.abort();
}

#[tokio::test]
async fn test_blob_round_trip_and_range() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let content = b"some blob content for range reads";
    let digest = upload_blob(&client, port, "test", content).await;

    // HEAD reports size.
    let head = client
        .head(format!("http://localhost:{port}/v2/test/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status().as_u16(), 200);
    assert_eq!(
        head.headers().get("content-length").unwrap().to_str().unwrap(),
        content.len().to_string()
    );

    // Full read matches and carries the digest header.
    let get = client
        .get(format!("http://localhost:{port}/v2/test/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status().as_u16(), 200);
    assert_eq!(
        get.headers().get("Docker-Content-Digest").unwrap().to_str().unwrap(),
        digest
    );
    assert_eq!(get.bytes().await.unwrap().as_ref(), content);

    // Range read returns 206 with the slice.
    let ranged = client
        .get(format!("http://localhost:{port}/v2/test/blobs/{digest}"))
        .header("Range", "bytes=5-8")
        .send()
        .await
        .unwrap();
    assert_eq!(ranged.status().as_u16(), 206);
    assert_eq!(
        ranged.headers().get("content-range").unwrap().to_str().unwrap(),
        format!("bytes 5-8/{}", content.len())
    );
    assert_eq!(ranged.bytes().await.unwrap().as_ref(), &content[5..=8]);

    // An unsatisfiable range is 416.
    let bad = client
        .get(format!("http://localhost:{port}/v2/test/blobs/{digest}"))
        .header("Range", "bytes=1000-2000")
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 416);

    server.abort();
}

#[tokio::test]
async fn test_blob_upload_digest_mismatch_rejected() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let start = client
        .post(format!("http://localhost:{port}/v2/test/blobs/uploads/"))
        .send()
        .await
        .unwrap();
    let location = start.headers().get("location").unwrap().to_str().unwrap();
    let wrong = sha256_of(b"not the content");
    let complete = client
        .put(format!("http://localhost:{port}{location}?digest={wrong}"))
        .body(b"actual content".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(complete.status().as_u16(), 400);
    let body: serde_json::Value = complete.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "DIGEST_INVALID");

    server.abort();
}

#[tokio::test]
async fn test_chunked_upload_with_contiguity_validation() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let content = "chunked content ".repeat(512);
    let content = content.as_bytes();
    let digest = sha256_of(content);

    let start = client
        .post(format!("http://localhost:{port}/v2/test/blobs/uploads/"))
        .send()
        .await
        .unwrap();
    assert_eq!(start.status().as_u16(), 202);
    let location = start.headers().get("location").unwrap().to_str().unwrap();
    let upload_url = format!("http://localhost:{port}{location}");

    // A chunk that does not continue at the committed offset is refused.
    let bad = client
        .patch(&upload_url)
        .header("Content-Type", "application/octet-stream")
        .header("Content-Range", "100-199")
        .body(content[..100].to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 416);

    let chunk_size = 4096;
    let mut offset = 0;
    while offset < content.len() {
        let end = std::cmp::min(offset + chunk_size, content.len());
        let chunk = &content[offset..end];
        let resp = client
            .patch(&upload_url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Range", format!("{}-{}", offset, end - 1))
            .body(chunk.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 202, "chunk failed: {resp:?}");
        assert_eq!(
            resp.headers().get("range").unwrap().to_str().unwrap(),
            format!("0-{}", end - 1)
        );
        offset = end;
    }

    let complete = client
        .put(format!("{upload_url}?digest={digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(complete.status().as_u16(), 201);

    // The committed blob is content-addressed correctly.
    let get = client
        .get(format!("http://localhost:{port}/v2/test/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    let body = get.bytes().await.unwrap();
    assert_eq!(sha256_of(&body), digest);

    server.abort();
}

#[tokio::test]
async fn test_manifest_lifecycle() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let digest = push_simple_manifest(&client, port, "test", "latest", b"layer bytes").await;

    // GET by tag and by digest return identical bytes.
    let by_tag = client
        .get(format!("http://localhost:{port}/v2/test/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(by_tag.status().as_u16(), 200);
    assert_eq!(
        by_tag.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/vnd.oci.image.manifest.v1+json"
    );
    let tag_bytes = by_tag.bytes().await.unwrap();

    let by_digest = client
        .get(format!("http://localhost:{port}/v2/test/manifests/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(by_digest.status().as_u16(), 200);
    assert_eq!(by_digest.bytes().await.unwrap(), tag_bytes);

    // HEAD carries the digest header.
    let head = client
        .head(format!("http://localhost:{port}/v2/test/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(
        head.headers().get("Docker-Content-Digest").unwrap().to_str().unwrap(),
        digest
    );

    // Deleting the tag keeps the digest fetchable.
    let del = client
        .delete(format!("http://localhost:{port}/v2/test/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status().as_u16(), 202);
    let gone = client
        .get(format!("http://localhost:{port}/v2/test/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status().as_u16(), 404);
    let still = client
        .get(format!("http://localhost:{port}/v2/test/manifests/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(still.status().as_u16(), 200);

    // Deleting by digest removes the bytes.
    let del = client
        .delete(format!("http://localhost:{port}/v2/test/manifests/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status().as_u16(), 202);
    let gone = client
        .get(format!("http://localhost:{port}/v2/test/manifests/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status().as_u16(), 404);
    let body: serde_json::Value = gone.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "MANIFEST_UNKNOWN");

    server.abort();
}

#[tokio::test]
async fn test_manifest_put_requires_known_blobs() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": sha256_of(b"missing config"),
            "size": 14,
        },
        "layers": [],
    });
    let resp = client
        .put(format!("http://localhost:{port}/v2/test/manifests/latest"))
        .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
        .json(&manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");

    server.abort();
}

#[tokio::test]
async fn test_multi_segment_repository_names() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    push_simple_manifest(&client, port, "library/nested/app", "v1", b"nested layer").await;

    let tags = client
        .get(format!(
            "http://localhost:{port}/v2/library/nested/app/tags/list"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(tags.status().as_u16(), 200);
    let body: serde_json::Value = tags.json().await.unwrap();
    assert_eq!(body["name"], "library/nested/app");
    assert_eq!(body["tags"][0], "v1");

    let catalog: serde_json::Value = reqwest::get(format!("http://localhost:{port}/v2/_catalog"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let repos = catalog["repositories"].as_array().unwrap();
    assert!(repos.iter().any(|r| r == "library/nested/app"));

    server.abort();
}

#[tokio::test]
async fn test_catalog_and_tags_pagination() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    for repo in ["repo1", "repo2", "repo3", "repo4", "repo5"] {
        push_simple_manifest(&client, port, repo, "latest", repo.as_bytes()).await;
    }
    for tag in ["t1", "t2", "t3", "t4", "t5"] {
        push_simple_manifest(&client, port, "repo1", tag, b"tagged").await;
    }

    // Walk the catalog two entries at a time; concatenation must equal the
    // full sorted listing.
    let mut url = format!("http://localhost:{port}/v2/_catalog?n=2");
    let mut collected = Vec::new();
    loop {
        let resp = client.get(&url).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let link = resp
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let page: serde_json::Value = resp.json().await.unwrap();
        for repo in page["repositories"].as_array().unwrap() {
            collected.push(repo.as_str().unwrap().to_string());
        }
        match link {
            Some(link) => {
                let next = link
                    .trim_start_matches('<')
                    .split('>')
                    .next()
                    .unwrap()
                    .to_string();
                url = format!("http://localhost:{port}{next}");
            }
            None => break,
        }
    }
    assert_eq!(collected, vec!["repo1", "repo2", "repo3", "repo4", "repo5"]);

    // Same walk over tags.
    let mut url = format!("http://localhost:{port}/v2/repo1/tags/list?n=2");
    let mut tags = Vec::new();
    loop {
        let resp = client.get(&url).send().await.unwrap();
        let link = resp
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let page: serde_json::Value = resp.json().await.unwrap();
        for tag in page["tags"].as_array().unwrap() {
            tags.push(tag.as_str().unwrap().to_string());
        }
        match link {
            Some(link) => {
                let next = link
                    .trim_start_matches('<')
                    .split('>')
                    .next()
                    .unwrap()
                    .to_string();
                url = format!("http://localhost:{port}{next}");
            }
            None => break,
        }
    }
    assert_eq!(tags, vec!["latest", "t1", "t2", "t3", "t4", "t5"]);

    server.abort();
}

#[tokio::test]
async fn test_cross_repo_mount() {
    let (server, port, storage) = start_test_server().await;
    let client = reqwest::Client::new();

    let content = b"shared blob";
    let digest = upload_blob(&client, port, "source", content).await;
    let bytes_before = storage.blob_bytes_received();

    // Mount into another repo: 201, no new upload session, no new bytes.
    let mount = client
        .post(format!(
            "http://localhost:{port}/v2/target/blobs/uploads/?mount={digest}&from=source"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(mount.status().as_u16(), 201);
    assert_eq!(
        mount.headers().get("location").unwrap().to_str().unwrap(),
        format!("/v2/target/blobs/{digest}")
    );
    assert_eq!(storage.blob_bytes_received(), bytes_before);

    let head = client
        .head(format!("http://localhost:{port}/v2/target/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status().as_u16(), 200);

    server.abort();
}

#[tokio::test]
async fn test_split_repositories_mount_degrades_to_upload() {
    let mut config = AppConfig::in_memory();
    config.storage.split_repositories = true;
    let (server, port, _) = start_test_server_with(config).await;
    let client = reqwest::Client::new();

    let content = b"isolated blob";
    let digest = upload_blob(&client, port, "source", content).await;

    // The blob is invisible from another repo.
    let head = client
        .head(format!("http://localhost:{port}/v2/other/blobs/{digest}"))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status().as_u16(), 404);

    // And a mount opens an upload session instead of linking.
    let mount = client
        .post(format!(
            "http://localhost:{port}/v2/other/blobs/uploads/?mount={digest}&from=source"
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(mount.status().as_u16(), 202);
    assert!(mount.headers().get("location").is_some());

    server.abort();
}

#[tokio::test]
async fn test_referrers_endpoint() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let subject_digest = push_simple_manifest(&client, port, "test", "latest", b"subject").await;

    // An artifact manifest pointing at the subject.
    let config = b"{}".to_vec();
    let config_digest = upload_blob(&client, port, "test", &config).await;
    let payload = b"attachment payload".to_vec();
    let payload_digest = upload_blob(&client, port, "test", &payload).await;
    let attachment = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.test.note",
            "digest": config_digest,
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.test.note",
            "digest": payload_digest,
            "size": payload.len(),
        }],
        "subject": {
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": subject_digest,
            "size": 0,
        },
    });
    let body = serde_json::to_vec(&attachment).unwrap();
    let attachment_digest = sha256_of(&body);
    let put = client
        .put(format!(
            "http://localhost:{port}/v2/test/manifests/{attachment_digest}"
        ))
        .header("Content-Type", "application/vnd.oci.image.manifest.v1+json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(put.status().as_u16(), 201);
    assert_eq!(
        put.headers().get("OCI-Subject").unwrap().to_str().unwrap(),
        subject_digest
    );

    let referrers: serde_json::Value = client
        .get(format!(
            "http://localhost:{port}/v2/test/referrers/{subject_digest}"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let manifests = referrers["manifests"].as_array().unwrap();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0]["digest"], attachment_digest);
    assert_eq!(manifests[0]["artifactType"], "application/vnd.test.note");

    // Filtering by a non-matching artifactType empties the list.
    let filtered: serde_json::Value = client
        .get(format!(
            "http://localhost:{port}/v2/test/referrers/{subject_digest}?artifactType=application%2Fvnd.other"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(filtered["manifests"].as_array().unwrap().is_empty());

    server.abort();
}

#[tokio::test]
async fn test_unknown_paths_and_methods() {
    let (server, port, _) = start_test_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://localhost:{port}/v2/test/unknown/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    // POST on a manifest path is not a thing.
    let resp = client
        .post(format!("http://localhost:{port}/v2/test/manifests/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 405);

    server.abort();
}
