//! End-to-end scheduler scenarios against a mock peer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use serde_json::json;
use uuid::Uuid;
use vellum_replication::{failure_document_key, start_replication, ReplicationConfig, ReplicationHandle};
use vellum_store::{DocumentStore, Etag, MemoryStore, Metadata, WorkContext, WriteOrigin};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Stateful stand-in for a peer node: remembers the cursor we advanced it to,
/// either through shipped batches or through explicit cursor pushes.
struct PeerState {
    instance: Uuid,
    doc_cursor: Mutex<Etag>,
    attachment_cursor: Mutex<Etag>,
    doc_post_failures: AtomicUsize,
    doc_post_delay: Duration,
}

impl PeerState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            instance: Uuid::new_v4(),
            doc_cursor: Mutex::new(Etag::ZERO),
            attachment_cursor: Mutex::new(Etag::ZERO),
            doc_post_failures: AtomicUsize::new(0),
            doc_post_delay: Duration::ZERO,
        })
    }

    /// Peer whose first `failures` replicateDocs calls return 503.
    fn failing_first(failures: usize) -> Arc<Self> {
        let state = Self::new();
        state.doc_post_failures.store(failures, Ordering::SeqCst);
        state
    }

    fn with_post_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            instance: Uuid::new_v4(),
            doc_cursor: Mutex::new(Etag::ZERO),
            attachment_cursor: Mutex::new(Etag::ZERO),
            doc_post_failures: AtomicUsize::new(0),
            doc_post_delay: delay,
        })
    }

    fn doc_cursor(&self) -> Etag {
        *self.doc_cursor.lock().unwrap()
    }
}

struct LastEtagGet(Arc<PeerState>);

impl Respond for LastEtagGet {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "lastDocumentEtag": self.0.doc_cursor.lock().unwrap().to_string(),
            "lastAttachmentEtag": self.0.attachment_cursor.lock().unwrap().to_string(),
            "serverInstanceId": self.0.instance.to_string(),
        }))
    }
}

struct LastEtagPut(Arc<PeerState>);

impl Respond for LastEtagPut {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        for (name, value) in request.url.query_pairs() {
            if name == "docEtag" {
                *self.0.doc_cursor.lock().unwrap() = value.parse().unwrap();
            }
            if name == "attachmentEtag" {
                *self.0.attachment_cursor.lock().unwrap() = value.parse().unwrap();
            }
        }
        ResponseTemplate::new(200)
    }
}

struct ReplicateDocs(Arc<PeerState>);

impl Respond for ReplicateDocs {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let remaining = self.0.doc_post_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.0.doc_post_failures.store(remaining - 1, Ordering::SeqCst);
            return ResponseTemplate::new(503).set_body_json(json!({"Error": "catching my breath"}));
        }

        let records: Vec<serde_json::Value> = serde_json::from_slice(&request.body).unwrap();
        let max = records
            .iter()
            .filter_map(|record| record["etag"].as_str())
            .filter_map(|etag| etag.parse::<Etag>().ok())
            .max();
        if let Some(max) = max {
            let mut cursor = self.0.doc_cursor.lock().unwrap();
            if max > *cursor {
                *cursor = max;
            }
        }
        ResponseTemplate::new(200).set_delay(self.0.doc_post_delay)
    }
}

struct ReplicateAttachments(Arc<PeerState>);

impl Respond for ReplicateAttachments {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let decoded = bson::Document::from_reader(&mut request.body.as_slice()).unwrap();
        let max = decoded
            .values()
            .filter_map(|element| element.as_document())
            .filter_map(|element| match element.get("@etag") {
                Some(bson::Bson::Binary(binary)) => {
                    let bytes: [u8; 16] = binary.bytes.as_slice().try_into().ok()?;
                    Some(Etag::from_bytes(bytes))
                }
                _ => None,
            })
            .max();
        if let Some(max) = max {
            let mut cursor = self.0.attachment_cursor.lock().unwrap();
            if max > *cursor {
                *cursor = max;
            }
        }
        ResponseTemplate::new(200)
    }
}

async fn mount_peer(server: &MockServer, state: &Arc<PeerState>) {
    Mock::given(method("GET"))
        .and(path("/replication/lastEtag"))
        .respond_with(LastEtagGet(state.clone()))
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/replication/lastEtag"))
        .respond_with(LastEtagPut(state.clone()))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/replication/replicateDocs"))
        .respond_with(ReplicateDocs(state.clone()))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/replication/replicateAttachments"))
        .respond_with(ReplicateAttachments(state.clone()))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/replication/heartbeat"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

fn new_store() -> (Arc<MemoryStore>, Arc<WorkContext>) {
    let work = Arc::new(WorkContext::new());
    (Arc::new(MemoryStore::new(work.clone())), work)
}

fn seed_destinations(store: &MemoryStore, entries: serde_json::Value) {
    store
        .put(
            "replication/destinations",
            None,
            json!({ "destinations": entries }),
            Metadata::new(),
            WriteOrigin::Internal,
        )
        .unwrap();
}

fn put_doc(store: &MemoryStore, key: &str) -> Etag {
    store
        .put(key, None, json!({"k": key}), Metadata::new(), WriteOrigin::Client)
        .unwrap()
}

fn test_config(data_poll: Duration, idle_poll: Duration) -> ReplicationConfig {
    let mut cfg = ReplicationConfig::new(Url::parse("http://origin.local:7171/").unwrap());
    cfg.data_poll_interval = data_poll;
    cfg.idle_poll_interval = idle_poll;
    cfg
}

fn start(
    cfg: ReplicationConfig,
    store: &Arc<MemoryStore>,
    work: &Arc<WorkContext>,
) -> ReplicationHandle {
    let store: Arc<dyn DocumentStore> = store.clone();
    start_replication(cfg, store, work.clone()).unwrap()
}

async fn count_requests(server: &MockServer, http_method: &str, url_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|req| req.method.as_str() == http_method && req.url.path() == url_path)
        .count()
}

/// Polls until `target` requests of the given kind arrived, or panics.
async fn wait_for_requests(server: &MockServer, http_method: &str, url_path: &str, target: usize) {
    for _ in 0..200 {
        if count_requests(server, http_method, url_path).await >= target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {target} {http_method} {url_path} requests");
}

async fn stop(handle: ReplicationHandle) {
    handle.request_stop();
    handle.wait().await.unwrap();
}

// S1: zero destinations produce zero outbound calls, however much data is written.
#[tokio::test]
async fn empty_destination_list_makes_no_outbound_calls() {
    let server = MockServer::start().await;
    let (store, work) = new_store();
    for i in 0..10 {
        put_doc(&store, &format!("docs/{i}"));
    }

    let handle = start(
        test_config(Duration::from_millis(30), Duration::from_millis(50)),
        &store,
        &work,
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop(handle).await;

    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

// S2: happy-path document replication in etag order, no cursor push.
#[tokio::test]
async fn happy_path_ships_documents_in_etag_order() {
    let server = MockServer::start().await;
    let state = PeerState::new();
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(&store, json!([{"url": server.uri()}]));
    let etags: Vec<Etag> = (0..3).map(|i| put_doc(&store, &format!("docs/{i}"))).collect();

    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "POST", "/replication/replicateDocs", 1).await;
    // Let the drain cycle observe the advanced cursor and go quiet.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop(handle).await;

    assert_eq!(count_requests(&server, "POST", "/replication/replicateDocs").await, 1);
    assert_eq!(count_requests(&server, "PUT", "/replication/lastEtag").await, 0);
    assert_eq!(state.doc_cursor(), *etags.last().unwrap());

    let posts: Vec<Request> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|req| req.url.path() == "/replication/replicateDocs")
        .collect();
    let records: Vec<serde_json::Value> = serde_json::from_slice(&posts[0].body).unwrap();
    assert_eq!(records.len(), 3);
    let shipped: Vec<Etag> = records
        .iter()
        .map(|r| r["etag"].as_str().unwrap().parse().unwrap())
        .collect();
    assert_eq!(shipped, etags);
    assert!(posts[0].url.query().unwrap().contains("from="));

    // A clean run leaves no failure document behind.
    assert!(store.get(&failure_document_key(&server.uri())).unwrap().is_none());
}

// S3: a fully filtered region advances the peer cursor with a single PUT.
#[tokio::test]
async fn fully_filtered_region_pushes_the_cursor_instead_of_shipping() {
    let server = MockServer::start().await;
    let state = PeerState::new();
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(
        &store,
        json!([{"url": server.uri(), "excludePrefixes": ["private/"]}]),
    );
    let mut last = Etag::ZERO;
    for i in 0..100 {
        last = put_doc(&store, &format!("private/{i:03}"));
    }

    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "PUT", "/replication/lastEtag", 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop(handle).await;

    assert_eq!(count_requests(&server, "POST", "/replication/replicateDocs").await, 0);
    assert_eq!(count_requests(&server, "PUT", "/replication/lastEtag").await, 1);
    assert_eq!(state.doc_cursor(), last);
}

// S4, recovering half: one 503 triggers an immediate same-cycle retry and no
// failure document survives the success.
#[tokio::test]
async fn first_failure_is_retried_immediately_and_leaves_no_trace() {
    let server = MockServer::start().await;
    let state = PeerState::failing_first(1);
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(&store, json!([{"url": server.uri()}]));
    put_doc(&store, "docs/0");

    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "POST", "/replication/replicateDocs", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(count_requests(&server, "POST", "/replication/replicateDocs").await, 2);
    assert!(store.get(&failure_document_key(&server.uri())).unwrap().is_none());
    let stats = handle.failure_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].count, 0);

    stop(handle).await;
}

// S4, failing half: both attempts 503 ⇒ one counted failure, persisted.
#[tokio::test]
async fn a_failed_retry_counts_once_and_persists() {
    let server = MockServer::start().await;
    let state = PeerState::failing_first(usize::MAX);
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(&store, json!([{"url": server.uri()}]));
    put_doc(&store, "docs/0");

    let handle = start(
        test_config(Duration::from_secs(30), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "POST", "/replication/replicateDocs", 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // First attempt plus the one-shot first-failure retry, nothing more.
    assert_eq!(count_requests(&server, "POST", "/replication/replicateDocs").await, 2);

    let failure_doc = store
        .get(&failure_document_key(&server.uri()))
        .unwrap()
        .expect("failure document persisted");
    assert_eq!(failure_doc.data["failureCount"], json!(1));

    let stats = handle.failure_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].count, 1);
    assert!(stats[0].last_error.contains("catching my breath"));

    stop(handle).await;
}

// S5, data-driven half: with 150 persisted failures only every fifth
// data-driven cycle attempts the destination.
#[tokio::test]
async fn back_off_skips_data_driven_cycles() {
    let server = MockServer::start().await;
    let state = PeerState::failing_first(usize::MAX);
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(&store, json!([{"url": server.uri()}]));
    store
        .put(
            &failure_document_key(&server.uri()),
            None,
            json!({"destination": server.uri(), "failureCount": 150}),
            Metadata::new(),
            WriteOrigin::Internal,
        )
        .unwrap();

    let handle = start(
        test_config(Duration::from_secs(30), Duration::from_secs(30)),
        &store,
        &work,
    );
    // The startup cycle is time-driven and attempts unconditionally.
    wait_for_requests(&server, "GET", "/replication/lastEtag", 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Ten data-driven cycles; attempts land where attempt % 5 == 0.
    for i in 0..10 {
        put_doc(&store, &format!("docs/{i}"));
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop(handle).await;

    assert_eq!(count_requests(&server, "GET", "/replication/lastEtag").await, 1 + 2);
}

// S5, time-driven half: idle wake-ups ignore the failure count.
#[tokio::test]
async fn idle_cycles_attempt_every_destination_regardless_of_failures() {
    let server = MockServer::start().await;
    let state = PeerState::new();
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(&store, json!([{"url": server.uri()}]));
    store
        .put(
            &failure_document_key(&server.uri()),
            None,
            json!({"destination": server.uri(), "failureCount": 150}),
            Metadata::new(),
            WriteOrigin::Internal,
        )
        .unwrap();

    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_millis(80)),
        &store,
        &work,
    );
    tokio::time::sleep(Duration::from_millis(1200)).await;
    stop(handle).await;

    assert!(count_requests(&server, "GET", "/replication/lastEtag").await >= 10);
}

// S6: one in-flight worker per destination, other destinations unaffected.
#[tokio::test]
async fn a_busy_destination_is_not_scheduled_twice() {
    let slow_server = MockServer::start().await;
    let slow_state = PeerState::with_post_delay(Duration::from_millis(800));
    mount_peer(&slow_server, &slow_state).await;

    let fast_server = MockServer::start().await;
    let fast_state = PeerState::new();
    mount_peer(&fast_server, &fast_state).await;

    let (store, work) = new_store();
    seed_destinations(
        &store,
        json!([{"url": slow_server.uri()}, {"url": fast_server.uri()}]),
    );
    put_doc(&store, "docs/0");

    let handle = start(
        test_config(Duration::from_secs(30), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&slow_server, "POST", "/replication/replicateDocs", 1).await;

    // While the slow POST hangs, keep waking the scheduler.
    for i in 1..4 {
        put_doc(&store, &format!("docs/{i}"));
        tokio::time::sleep(Duration::from_millis(120)).await;
    }

    // Still inside the slow destination's in-flight window.
    assert_eq!(count_requests(&slow_server, "GET", "/replication/lastEtag").await, 1);
    // The fast destination kept replicating meanwhile.
    assert!(count_requests(&fast_server, "GET", "/replication/lastEtag").await >= 2);

    tokio::time::sleep(Duration::from_millis(900)).await;
    stop(handle).await;
}

// Property: the sender keeps no cursor of its own, so a restart neither
// skips nor duplicates records.
#[tokio::test]
async fn restart_resumes_from_the_peer_cursor() {
    let server = MockServer::start().await;
    let state = PeerState::new();
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(&store, json!([{"url": server.uri()}]));
    for i in 0..3 {
        put_doc(&store, &format!("docs/{i}"));
    }

    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "POST", "/replication/replicateDocs", 1).await;
    stop(handle).await;

    // "Restart": a fresh engine over the same store and a new write.
    let new_doc = put_doc(&store, "docs/3");
    let work = Arc::new(WorkContext::new());
    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "POST", "/replication/replicateDocs", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop(handle).await;

    let posts: Vec<Request> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|req| req.url.path() == "/replication/replicateDocs")
        .collect();
    assert_eq!(posts.len(), 2);
    let records: Vec<serde_json::Value> = serde_json::from_slice(&posts[1].body).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0]["etag"].as_str().unwrap().parse::<Etag>().unwrap(),
        new_doc
    );
}

// Attachments ride the same worker pass with their own cursor stream.
#[tokio::test]
async fn attachments_ship_after_documents() {
    let server = MockServer::start().await;
    let state = PeerState::new();
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    seed_destinations(&store, json!([{"url": server.uri()}]));
    put_doc(&store, "docs/0");
    let attachment_etag = store
        .put_attachment("files/a", vec![7, 7, 7], Metadata::new(), WriteOrigin::Client)
        .unwrap();

    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "POST", "/replication/replicateAttachments", 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    stop(handle).await;

    let posts: Vec<Request> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|req| req.url.path() == "/replication/replicateAttachments")
        .collect();
    assert_eq!(posts.len(), 1);
    assert_eq!(
        posts[0].headers.get("Attachment-Ids").unwrap().to_str().unwrap(),
        "files/a"
    );
    assert_eq!(
        *state.attachment_cursor.lock().unwrap(),
        attachment_etag
    );
}

// Startup heartbeats reach every recorded source peer, best effort.
#[tokio::test]
async fn startup_notifies_previously_seen_source_peers() {
    let server = MockServer::start().await;
    let state = PeerState::new();
    mount_peer(&server, &state).await;

    let (store, work) = new_store();
    store
        .put(
            "replication/sources/peer-1",
            None,
            json!({"source": server.uri()}),
            Metadata::new(),
            WriteOrigin::Internal,
        )
        .unwrap();

    let handle = start(
        test_config(Duration::from_millis(50), Duration::from_secs(30)),
        &store,
        &work,
    );
    wait_for_requests(&server, "POST", "/replication/heartbeat", 1).await;
    stop(handle).await;

    let heartbeats: Vec<Request> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|req| req.url.path() == "/replication/heartbeat")
        .collect();
    assert_eq!(heartbeats.len(), 1);
    assert!(heartbeats[0].url.query().unwrap().contains("from="));
}
