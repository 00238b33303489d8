//! Standalone stack tests.
//!
//! Assembles the same pieces `classgridd standalone` does (in-memory
//! broker, filesystem buckets, gateway, relay, autoscaler and a local
//! worker fleet) and drives them through the HTTP router.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use tokio::sync::watch;
use tower::ServiceExt;

use classgrid_autoscale::{Autoscaler, ScalingDecision};
use classgrid_blob::{FsBlobStore, SharedBlobStore, artifact};
use classgrid_core::{ClassgridConfig, StorageBackend, Task};
use classgrid_correlator::Correlator;
use classgrid_gateway::{
    Dispatcher, DispatcherSettings, GatewayState, RelaySettings, ResultRelay, build_router,
};
use classgrid_metrics::GatewayMetrics;
use classgrid_queue::{MemoryBroker, Queue};
use classgrid_worker::{LocalFleet, LookupClassifier, WorkerLoop, WorkerSettings};

const BOUNDARY: &str = "classgridd-test-boundary";

struct Stack {
    _dir: tempfile::TempDir,
    broker: Arc<MemoryBroker>,
    input: SharedBlobStore,
    output: SharedBlobStore,
    dispatcher: Dispatcher,
    relay: ResultRelay,
    fleet: Arc<LocalFleet>,
    autoscaler: Autoscaler,
    router: Router,
}

fn config(root: &std::path::Path) -> ClassgridConfig {
    let mut config = ClassgridConfig::default();
    config.storage.backend = StorageBackend::Fs;
    config.storage.root = root.to_path_buf();
    config.queues.receive_wait = Duration::from_millis(100);
    config.queues.result_wait = Duration::from_millis(100);
    config.gateway.max_wait = Duration::from_secs(10);
    config.autoscale.min_instances = 1;
    config.autoscale.max_instances = 4;
    config.autoscale.scale_factor = 5;
    config
}

fn stack() -> Stack {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());

    let labels = dir.path().join("labels.json");
    std::fs::write(&labels, r#"{"cat": "tabby", "test_00": "Paul"}"#).unwrap();
    let classifier = Arc::new(LookupClassifier::from_file(&labels).unwrap());

    let broker = Arc::new(MemoryBroker::new(config.queues.visibility_timeout));
    let input: SharedBlobStore =
        Arc::new(FsBlobStore::open(dir.path().join(&config.storage.input_bucket)).unwrap());
    let output: SharedBlobStore =
        Arc::new(FsBlobStore::open(dir.path().join(&config.storage.output_bucket)).unwrap());

    let correlator = Correlator::new();
    let dispatcher = Dispatcher::new(
        broker.clone(),
        input.clone(),
        output.clone(),
        correlator.clone(),
        Arc::new(GatewayMetrics::new()),
        DispatcherSettings::from_config(&config),
    );
    let relay = ResultRelay::new(broker.clone(), correlator, RelaySettings::from_config(&config));

    let template = WorkerLoop::new(
        "template",
        broker.clone(),
        input.clone(),
        output.clone(),
        classifier,
        WorkerSettings::from_config(&config),
    );
    let fleet = Arc::new(LocalFleet::new(template));
    let autoscaler = Autoscaler::new(
        broker.clone(),
        config.queues.task_queue.clone(),
        fleet.clone(),
        &config.autoscale,
    );
    let router = build_router(GatewayState {
        dispatcher: dispatcher.clone(),
        upload_field: config.gateway.upload_field.clone(),
        fleet: Some(autoscaler.subscribe()),
    });

    Stack {
        _dir: dir,
        broker,
        input,
        output,
        dispatcher,
        relay,
        fleet,
        autoscaler,
        router,
    }
}

fn start_relay(stack: &Stack) -> watch::Sender<bool> {
    let (tx, rx) = watch::channel(false);
    let relay = stack.relay.clone();
    tokio::spawn(async move { relay.run(rx).await });
    tx
}

fn upload(file_name: &str, payload: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        format!("Content-Disposition: form-data; name=\"myfile\"; filename=\"{file_name}\"\r\n")
            .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(payload);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn body_string(resp: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn upload_is_classified_end_to_end() {
    let mut stack = stack();
    let shutdown = start_relay(&stack);

    // First tick brings the fleet up to its floor.
    assert_eq!(stack.autoscaler.tick().await.unwrap(), ScalingDecision::ScaleOut(1));

    let resp = stack
        .router
        .clone()
        .oneshot(upload("cat.jpg", b"\xff\xd8\xff"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "cat.jpg,tabby\n");

    // Payload and artifact both landed in their buckets.
    assert_eq!(
        stack.input.get("cat.jpg").await.unwrap(),
        Bytes::from_static(b"\xff\xd8\xff")
    );
    let stored = stack.output.get(&artifact::artifact_key("cat.jpg")).await.unwrap();
    assert_eq!(
        artifact::parse_artifact(std::str::from_utf8(&stored).unwrap()),
        Some(("cat.jpg", "tabby"))
    );
    assert_eq!(stack.dispatcher.correlator().pending_count(), 0);

    shutdown.send(true).unwrap();
    stack.fleet.shutdown().await;
}

#[tokio::test]
async fn unknown_subject_fails_with_tag() {
    let mut stack = stack();
    let shutdown = start_relay(&stack);
    stack.autoscaler.tick().await.unwrap();

    let resp = stack
        .router
        .clone()
        .oneshot(upload("stranger.jpg", b"face"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = serde_json::from_str(&body_string(resp).await).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error_tag"], "capability_failed");

    shutdown.send(true).unwrap();
    stack.fleet.shutdown().await;
}

#[tokio::test]
async fn duplicate_upload_fails_fast() {
    // No workers: the first upload stays pending.
    let stack = stack();

    let first = stack.router.clone();
    let pending = tokio::spawn(async move { first.oneshot(upload("cat.jpg", b"one")).await });
    let correlator = stack.dispatcher.correlator().clone();
    eventually("first upload to register", || correlator.is_pending("cat.jpg")).await;

    let resp = stack
        .router
        .clone()
        .oneshot(upload("cat.jpg", b"two"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = body_string(resp).await;
    assert!(body.contains("cat.jpg"));

    pending.abort();
}

#[tokio::test]
async fn backlog_scales_the_fleet_out_and_back_in() {
    let mut stack = stack();
    let shutdown = start_relay(&stack);

    for i in 0..12 {
        let name = format!("test_{i:02}.jpg");
        stack.input.put(&name, Bytes::from_static(b"jpeg")).await.unwrap();
        let task = Task::new(name);
        stack
            .broker
            .send("requests", &task.id, &task.attributes)
            .await
            .unwrap();
    }

    // ceil(12 / 5) = 3 workers.
    assert_eq!(stack.autoscaler.tick().await.unwrap(), ScalingDecision::ScaleOut(3));
    assert_eq!(stack.fleet.len(), 3);

    let broker = stack.broker.clone();
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let ready = broker.approximate_depth("requests").await.unwrap();
            if ready == 0 && broker.in_flight_count("requests").await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "workers never drained the backlog");

    // Idle backlog shrinks the fleet to its floor.
    assert_eq!(stack.autoscaler.tick().await.unwrap(), ScalingDecision::ScaleIn(2));
    let fleet = stack.fleet.clone();
    eventually("terminated workers to exit", || fleet.len() == 1).await;

    let snapshot = stack.autoscaler.subscribe().borrow().clone();
    assert_eq!(snapshot.backlog, 0);
    assert_eq!(snapshot.terminating, 2);
    assert_eq!(snapshot.ticks, 2);

    shutdown.send(true).unwrap();
    stack.fleet.shutdown().await;
}

#[tokio::test]
async fn metrics_expose_gateway_and_fleet() {
    let mut stack = stack();
    let shutdown = start_relay(&stack);
    stack.autoscaler.tick().await.unwrap();

    let resp = stack
        .router
        .clone()
        .oneshot(upload("test_00.jpg", b"jpeg"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let resp = stack.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = body_string(resp).await;
    assert!(text.contains("classgrid_submissions_total 1"));
    assert!(text.contains("classgrid_backlog"));

    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let resp = stack.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    shutdown.send(true).unwrap();
    stack.fleet.shutdown().await;
}
