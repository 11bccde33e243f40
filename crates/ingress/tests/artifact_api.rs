//! Artifact API end-to-end: a real listener fronting the full fetch
//! path (auth, cache, throttle, decode, integrity) against the in-memory
//! store.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use sha2::{Digest, Sha256};

use fleet_common::model::{Agent, Artifact};
use fleet_common::store::{Credentials, DocStore};
use fleet_common::MemStore;
use fleet_ingress::{
    build_router, AllowAll, AppState, ArtifactCache, ArtifactFetcher, CacheConfig, Throttle,
};

const ARTIFACTS: &str = ".fleet-artifacts";
const AGENTS: &str = ".fleet-agents";
const TTL: Duration = Duration::from_secs(60);

struct TestServer {
    addr: std::net::SocketAddr,
    store: Arc<MemStore>,
    bearer: String,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

/// Bind the full router on an ephemeral port with one enrolled agent.
async fn start_server(store: Arc<MemStore>, throttle: Throttle) -> TestServer {
    // enroll an agent with a live credential
    let cred = store.create_credential("agent-1", "").await.unwrap();
    let agent = Agent {
        id: "agent-1".to_string(),
        access_credential_id: cred.id.clone(),
        output_credential_ids: BTreeMap::new(),
        active: true,
        enrolled_at: 1,
        last_checkin: 1,
        updated_at: 1,
        policy_id: "p1".to_string(),
        unenrolled_at: None,
        unenrolled_reason: None,
    };
    store
        .create(AGENTS, "agent-1", serde_json::to_value(&agent).unwrap())
        .await
        .unwrap();

    let fetcher = ArtifactFetcher::new(
        Arc::clone(&store) as _,
        Arc::new(ArtifactCache::new(CacheConfig::default())),
        throttle,
        Arc::new(AllowAll),
        ARTIFACTS,
        TTL,
    );
    let app = build_router(Arc::new(AppState {
        fetcher,
        store: Arc::clone(&store) as _,
        credentials: Arc::clone(&store) as _,
        agents_index: AGENTS.to_string(),
    }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    TestServer {
        addr,
        store,
        bearer: format!("Bearer {}:{}", cred.id, cred.secret),
        _shutdown: tx,
    }
}

async fn seed_artifact(store: &MemStore, identifier: &str, raw: &[u8]) -> String {
    let sha2 = hex::encode(Sha256::digest(raw));
    let artifact = Artifact {
        identifier: identifier.to_string(),
        decoded_sha256: sha2.clone(),
        encoded_sha256: sha2.clone(),
        decoded_size: raw.len() as i64,
        encoded_size: raw.len() as i64,
        compression_algorithm: "none".to_string(),
        encryption_algorithm: "none".to_string(),
        created: 1,
        encoded_body: base64::engine::general_purpose::STANDARD.encode(raw),
        body: Vec::new(),
    };
    store
        .create(
            ARTIFACTS,
            &format!("{identifier}-{sha2}"),
            serde_json::to_value(&artifact).unwrap(),
        )
        .await
        .unwrap();
    sha2
}

fn url(server: &TestServer, id: &str, sha2: &str) -> String {
    format!("http://{}/api/fleet/artifacts/{id}/{sha2}", server.addr)
}

#[tokio::test]
async fn test_artifact_served_then_cached() {
    let store = Arc::new(MemStore::new());
    let raw = b"exception list contents";
    let sha2 = seed_artifact(&store, "endpoint-exceptionlist", raw).await;
    let server = start_server(Arc::clone(&store), Throttle::new(8)).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(url(&server, "endpoint-exceptionlist", &sha2))
        .header("authorization", &server.bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"],
        "application/octet-stream"
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), raw);

    // the decoded bytes always hash to the record's digest
    let searches = server.store.counters().searches.load(Ordering::Relaxed);

    // second request: cache hit, store untouched
    let resp = client
        .get(url(&server, "endpoint-exceptionlist", &sha2))
        .header("authorization", &server.bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.bytes().await.unwrap().as_ref(), raw);
    assert_eq!(
        server.store.counters().searches.load(Ordering::Relaxed),
        searches,
        "cache hit must not touch the store"
    );
}

#[tokio::test]
async fn test_malformed_sha2_is_bad_request() {
    let store = Arc::new(MemStore::new());
    let server = start_server(Arc::clone(&store), Throttle::new(8)).await;

    let searches_before = server.store.counters().searches.load(Ordering::Relaxed);
    let resp = reqwest::Client::new()
        .get(url(&server, "a", "not-hex"))
        .header("authorization", &server.bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(
        server.store.counters().searches.load(Ordering::Relaxed),
        searches_before,
        "validation failures never reach the store"
    );
}

#[tokio::test]
async fn test_missing_credential_is_unauthorized() {
    let store = Arc::new(MemStore::new());
    let sha2 = seed_artifact(&store, "a", b"data").await;
    let server = start_server(Arc::clone(&store), Throttle::new(8)).await;

    let resp = reqwest::Client::new()
        .get(url(&server, "a", &sha2))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let resp = reqwest::Client::new()
        .get(url(&server, "a", &sha2))
        .header("authorization", "Bearer bogus:nope")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_artifact_is_not_found() {
    let store = Arc::new(MemStore::new());
    let server = start_server(Arc::clone(&store), Throttle::new(8)).await;

    let resp = reqwest::Client::new()
        .get(url(&server, "nope", &"0".repeat(64)))
        .header("authorization", &server.bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_corrupt_artifact_is_server_error() {
    let store = Arc::new(MemStore::new());
    // stored bytes do not hash to the recorded digest
    let sha2 = "d".repeat(64);
    let artifact = Artifact {
        identifier: "a".to_string(),
        decoded_sha256: sha2.clone(),
        encoded_sha256: sha2.clone(),
        decoded_size: 4,
        encoded_size: 4,
        compression_algorithm: "none".to_string(),
        encryption_algorithm: "none".to_string(),
        created: 1,
        encoded_body: base64::engine::general_purpose::STANDARD.encode(b"oops"),
        body: Vec::new(),
    };
    store
        .create(ARTIFACTS, "bad", serde_json::to_value(&artifact).unwrap())
        .await
        .unwrap();
    let server = start_server(Arc::clone(&store), Throttle::new(8)).await;

    let resp = reqwest::Client::new()
        .get(url(&server, "a", &sha2))
        .header("authorization", &server.bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_saturated_throttle_is_too_many_requests() {
    let store = Arc::new(MemStore::new());
    let sha2 = seed_artifact(&store, "a", b"data").await;
    // a zero-capacity throttle refuses every store fetch outright
    let server = start_server(Arc::clone(&store), Throttle::new(0)).await;

    let resp = reqwest::Client::new()
        .get(url(&server, "a", &sha2))
        .header("authorization", &server.bearer)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
}
