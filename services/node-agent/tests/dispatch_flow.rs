//! End-to-end dispatch: a routed message leases a VM, the fake guest answers
//! through the pending request store, the reply is produced and the
//! partition's commit offset advances.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use flate2::write::DeflateEncoder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::io::Write;

use async_trait::async_trait;
use common::{boot, harness, pool_config, wait_until, Harness, RecordingReplies};
use mango_node_agent::image::{
    Buckets, ImageService, FUNCTION_BUCKET, KERNEL_OBJECT, MANIFEST_BUCKET, RUNTIME_BUCKET,
};
use mango_node_agent::models::{InvocationRequest, InvocationResponse};
use mango_node_agent::reader::{
    Dispatcher, EnrichError, InboundMessage, PartitionRouter, RequestEnricher, RouterConfig,
    CORRELATION_ID_HEADER, REPLY_TO_HEADER,
};
use mango_node_agent::PendingRequestStore;

struct Flow {
    h: Harness,
    replies: Arc<RecordingReplies>,
    images: Arc<ImageService>,
    router: PartitionRouter,
}

async fn put(store: &InMemory, path: &str, data: Vec<u8>) {
    store.put(&ObjectPath::from(path), data.into()).await.unwrap();
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

async fn flow() -> Flow {
    flow_with(Vec::new()).await
}

async fn flow_with(enrichers: Vec<Arc<dyn RequestEnricher>>) -> Flow {
    let h = harness(pool_config(4, Duration::from_secs(300)));

    let manifests = Arc::new(InMemory::new());
    let runtimes = Arc::new(InMemory::new());
    let functions = Arc::new(InMemory::new());
    put(
        &manifests,
        "F/V.json",
        br#"{"functionId":"F","versionId":"V","runtimeImage":"node.ext4","runtimeCompression":0,"overlayCompression":"Deflate"}"#.to_vec(),
    )
    .await;
    put(&runtimes, "node.ext4", b"rootfs".to_vec()).await;
    put(&runtimes, KERNEL_OBJECT, b"kernel".to_vec()).await;
    put(&functions, "F/V", deflate(b"overlay")).await;

    let buckets = Buckets::new()
        .with_bucket(MANIFEST_BUCKET, manifests)
        .with_bucket(RUNTIME_BUCKET, runtimes)
        .with_bucket(FUNCTION_BUCKET, functions);
    let images = Arc::new(ImageService::new(
        buckets,
        h.dir.path().join("cache"),
        h.dir.path().join("overlays"),
    ));

    let replies = Arc::new(RecordingReplies::default());
    let dispatcher = Arc::new(Dispatcher::new(
        h.pool.clone(),
        h.store.clone(),
        images.clone(),
        replies.clone(),
    )
    .with_enrichers(enrichers));
    let router = PartitionRouter::new(RouterConfig::default(), dispatcher);

    Flow {
        h,
        replies,
        images,
        router,
    }
}

fn message(partition: i32, offset: i64, correlation_id: &str, reply_to: Option<&str>) -> InboundMessage {
    let request = InvocationRequest {
        method: "GET".to_string(),
        host: "fn.example.com".to_string(),
        path: "/hello".to_string(),
        body: String::new(),
        headers: HashMap::new(),
        function_id: Some("F".to_string()),
        function_version: Some("V".to_string()),
    };

    let mut headers = HashMap::new();
    headers.insert(CORRELATION_ID_HEADER.to_string(), correlation_id.to_string());
    if let Some(topic) = reply_to {
        headers.insert(REPLY_TO_HEADER.to_string(), topic.to_string());
    }

    InboundMessage {
        topic: "requests".to_string(),
        partition,
        offset,
        key: None,
        headers,
        payload: serde_json::to_vec(&request).unwrap(),
    }
}

/// Plays the guest: answer every invocation queued for `function_key`.
fn fake_guest(store: Arc<PendingRequestStore>, function_key: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(invocation) = store.dequeue(function_key).await {
            let response = InvocationResponse {
                status_code: 200,
                body: format!("hello from {}", invocation.request.path),
                headers: HashMap::new(),
            };
            store.try_complete(&invocation.correlation_id, response);
        }
    })
}

#[tokio::test]
async fn test_warm_invocation_replies_and_commits() {
    let mut f = flow().await;

    let lease = f.h.pool.acquire("F:V").await.unwrap();
    let id = lease.id().to_string();
    boot(&lease).await;
    lease.release().await;

    let guest = fake_guest(f.h.store.clone(), "F:V");
    f.router.route(message(0, 10, "C", Some("replies-1"))).await;

    let replies = f.replies.clone();
    wait_until(|| replies.sent.lock().unwrap().len() == 1).await;
    let router = &f.router;
    wait_until(|| router.commit_positions() == vec![(0, 11)]).await;

    let sent = f.replies.sent.lock().unwrap()[0].clone();
    assert_eq!(sent.topic, "replies-1");
    assert_eq!(sent.correlation_id, "C");
    assert_eq!(sent.key, "F:V");
    assert_eq!(sent.response.status_code, 200);
    assert_eq!(sent.response.body, "hello from /hello");

    // Only the boot above; the invocation itself reused the VM.
    assert_eq!(f.h.launcher.boot_count(), 1);
    assert_eq!(f.h.pool.idle_count("F:V"), 1);
    assert!(f.h.pool.get(&id).is_some());
    guest.abort();
}

#[tokio::test]
async fn test_cold_invocation_boots_with_fetched_images() {
    let mut f = flow().await;
    let guest = fake_guest(f.h.store.clone(), "F:V");

    f.router.route(message(0, 0, "C1", Some("replies-1"))).await;
    let replies = f.replies.clone();
    wait_until(|| replies.sent.lock().unwrap().len() == 1).await;

    let boots = f.h.launcher.boots.lock().unwrap().clone();
    assert_eq!(boots.len(), 1);
    let spec = &boots[0];
    assert_eq!(std::fs::read(&spec.kernel).unwrap(), b"kernel");
    assert_eq!(std::fs::read(&spec.rootfs).unwrap(), b"rootfs");
    assert_eq!(std::fs::read(&spec.overlay).unwrap(), b"overlay");
    assert!(spec.overlay.starts_with(f.h.dir.path().join("overlays")));

    let handle = f.h.pool.handles().pop().unwrap();
    assert_eq!(spec.guest_ip, handle.network().guest_ip);
    assert_eq!(handle.resource_count(), 2);

    // A second request for the same function reuses the booted VM.
    f.router.route(message(0, 1, "C2", Some("replies-1"))).await;
    wait_until(|| replies.sent.lock().unwrap().len() == 2).await;
    assert_eq!(f.h.launcher.boot_count(), 1);
    assert_eq!(f.h.launcher.launched.load(Ordering::SeqCst), 1);

    let router = &f.router;
    wait_until(|| router.commit_positions() == vec![(0, 2)]).await;

    // Images stay cached while the VM holds them.
    assert_eq!(f.images.evict_expired(Duration::ZERO), 0);

    let overlay = spec.overlay.clone();
    f.h.pool.shutdown().await;
    assert!(!overlay.exists());
    guest.abort();
}

#[tokio::test]
async fn test_missing_reply_topic_pins_commit() {
    let mut f = flow().await;
    let guest = fake_guest(f.h.store.clone(), "F:V");

    f.router.route(message(3, 40, "C1", None)).await;
    f.router.route(message(3, 41, "C2", Some("replies-1"))).await;

    let replies = f.replies.clone();
    wait_until(|| replies.sent.lock().unwrap().len() == 1).await;
    let router = &f.router;
    wait_until(|| router.outstanding(3) == Some(1)).await;

    assert_eq!(f.router.commit_positions(), vec![(3, 40)]);
    assert_eq!(f.replies.sent.lock().unwrap()[0].correlation_id, "C2");
    guest.abort();
}

#[tokio::test]
async fn test_boot_failure_destroys_vm_without_reply() {
    let mut f = flow().await;
    f.h.launcher.fail_boot.store(true, Ordering::SeqCst);

    f.router.route(message(0, 5, "C", Some("replies-1"))).await;

    let network = f.h.network.clone();
    wait_until(|| network.destroyed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(f.h.pool.size(), 0);
    assert!(f.replies.sent.lock().unwrap().is_empty());
    assert_eq!(f.h.store.in_flight_count(), 0);
    assert_eq!(f.router.outstanding(0), Some(1));
    assert_eq!(f.router.commit_positions(), vec![(0, 5)]);
}

#[tokio::test]
async fn test_partitions_commit_independently() {
    let mut f = flow().await;
    let guest = fake_guest(f.h.store.clone(), "F:V");

    f.router.route(message(0, 7, "A", Some("replies-1"))).await;
    f.router.route(message(1, 3, "B", Some("replies-2"))).await;

    let router = &f.router;
    wait_until(|| router.commit_positions() == vec![(0, 8), (1, 4)]).await;

    f.router.mark_committed(&[(0, 8), (1, 4)]);
    assert!(f.router.commit_positions().is_empty());

    let mut topics: Vec<_> = f
        .replies
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.topic.clone())
        .collect();
    topics.sort();
    assert_eq!(topics, vec!["replies-1".to_string(), "replies-2".to_string()]);
    guest.abort();
}

/// Pins requests without a version to `V`.
struct LatestVersion;

#[async_trait]
impl RequestEnricher for LatestVersion {
    fn name(&self) -> &str {
        "latest-version"
    }

    fn can_enrich(&self, request: &InvocationRequest) -> bool {
        request.function_version.is_none()
    }

    async fn enrich(&self, request: &mut InvocationRequest) -> Result<(), EnrichError> {
        request.function_version = Some("V".to_string());
        Ok(())
    }
}

/// Fails every request it sees.
struct Unreachable;

#[async_trait]
impl RequestEnricher for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    fn can_enrich(&self, request: &InvocationRequest) -> bool {
        request.function_version.is_none()
    }

    async fn enrich(&self, _request: &mut InvocationRequest) -> Result<(), EnrichError> {
        Err(EnrichError {
            enricher: self.name().to_string(),
            message: "route lookup unavailable".to_string(),
        })
    }
}

fn unversioned(partition: i32, offset: i64, correlation_id: &str) -> InboundMessage {
    let mut message = message(partition, offset, correlation_id, Some("replies-1"));
    let mut request: InvocationRequest = serde_json::from_slice(&message.payload).unwrap();
    request.function_version = None;
    message.payload = serde_json::to_vec(&request).unwrap();
    message
}

#[tokio::test]
async fn test_enrichers_run_in_order() {
    // The first enricher fills the version, so the second no longer applies.
    let mut f = flow_with(vec![Arc::new(LatestVersion), Arc::new(Unreachable)]).await;
    let guest = fake_guest(f.h.store.clone(), "F:V");

    f.router.route(unversioned(0, 0, "C")).await;

    let replies = f.replies.clone();
    wait_until(|| replies.sent.lock().unwrap().len() == 1).await;
    assert_eq!(f.replies.sent.lock().unwrap()[0].key, "F:V");
    guest.abort();
}

#[tokio::test]
async fn test_unenriched_request_is_not_acknowledged() {
    let mut f = flow_with(vec![Arc::new(Unreachable)]).await;

    f.router.route(unversioned(0, 0, "C")).await;

    let router = &f.router;
    wait_until(|| router.outstanding(0) == Some(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.router.outstanding(0), Some(1));
    assert!(f.replies.sent.lock().unwrap().is_empty());
    assert_eq!(f.h.launcher.launched.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_empty_version_is_rejected_before_leasing() {
    let mut f = flow().await;

    let mut message = unversioned(0, 0, "C");
    let mut request: InvocationRequest = serde_json::from_slice(&message.payload).unwrap();
    request.function_version = Some(String::new());
    message.payload = serde_json::to_vec(&request).unwrap();
    f.router.route(message).await;

    let router = &f.router;
    wait_until(|| router.outstanding(0) == Some(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.router.outstanding(0), Some(1));
    assert!(f.replies.sent.lock().unwrap().is_empty());
    assert_eq!(f.h.launcher.launched.load(Ordering::SeqCst), 0);
}
