//! Call-sequence tests against a mocked apiserver, in the style of kube's
//! own mock tests: a `tower_test` pair stands in for the cluster and a
//! verifier task asserts each request before answering it.

use http::{Request, Response};
use http_body_util::BodyExt;
use kube::Client;
use kube::client::Body;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use waiter_scheduler::KubernetesScheduler;
use waiter_scheduler::config::KubernetesConfig;
use waiter_scheduler::k8s::client::ClientManager;
use waiter_scheduler::model::{Service, ServiceInstance, TaskStats, instance_id};
use waiter_scheduler::scheduler::{
    AllowAllAuthorizer, DescriptorLookup, KillOutcome, PasswordSource, ScaleOutcome,
    ServiceDescription, ServiceScheduler,
};

const SERVICE_ID: &str = "waiter-myapp-e8b625cc83c411e8974c38d5474b213d";
const APP_NAME: &str = "myapp-e8b625cc83c411e8974c38d5474b213d";
const POD_NAME: &str = "myapp-e8b625cc83c411e8974c38d5474b213d-abcde";

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

struct NoDescriptors;

impl DescriptorLookup for NoDescriptors {
    fn lookup(&self, _service_id: &str) -> Option<ServiceDescription> {
        None
    }
}

struct NoPasswords;

impl PasswordSource for NoPasswords {
    fn password_for(&self, _service_id: &str) -> String {
        "hunter2".to_string()
    }
}

fn mock_scheduler() -> (Arc<KubernetesScheduler>, ApiServerHandle) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");
    let scheduler = KubernetesScheduler::new(
        KubernetesConfig::default(),
        Arc::new(ClientManager::from_client(client)),
        Arc::new(NoDescriptors),
        Arc::new(NoPasswords),
        Arc::new(AllowAllAuthorizer),
    );
    (Arc::new(scheduler), handle)
}

fn seeded_service(instances: i32) -> Service {
    Service {
        id: SERVICE_ID.to_string(),
        instances,
        task_count: instances,
        task_stats: TaskStats::default(),
        app_name: APP_NAME.to_string(),
        namespace: "testuser".to_string(),
    }
}

fn seeded_instance() -> ServiceInstance {
    ServiceInstance {
        id: instance_id(SERVICE_ID, POD_NAME, 0),
        service_id: SERVICE_ID.to_string(),
        host: "10.141.2.7".to_string(),
        port: 31360,
        extra_ports: vec![],
        protocol: "http".to_string(),
        started_at: None,
        healthy: true,
        log_directory: "/home/testuser/r0".to_string(),
        restart_count: 0,
        flags: BTreeSet::new(),
        exit_code: None,
        app_name: APP_NAME.to_string(),
        namespace: "testuser".to_string(),
    }
}

async fn read_request(request: Request<Body>) -> (http::request::Parts, serde_json::Value) {
    let (parts, body) = request.into_parts();
    let bytes = body.collect().await.expect("request body").to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("request body is json")
    };
    (parts, body)
}

fn status_response(code: u16, reason: &str) -> Response<Body> {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": if code < 400 { "Success" } else { "Failure" },
        "message": reason,
        "reason": reason,
        "code": code,
    });
    Response::builder()
        .status(code)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn replicaset_response(replicas: i32) -> Response<Body> {
    let body = json!({
        "apiVersion": "apps/v1",
        "kind": "ReplicaSet",
        "metadata": {
            "name": APP_NAME,
            "namespace": "testuser",
            "annotations": {"waiter/service-id": SERVICE_ID}
        },
        "spec": {"replicas": replicas, "selector": {}},
        "status": {"replicas": replicas}
    });
    Response::builder()
        .status(200)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn finish(verifier: tokio::task::JoinHandle<()>) {
    timeout(Duration::from_secs(5), verifier)
        .await
        .expect("verifier timed out")
        .expect("verifier assertions hold");
}

#[tokio::test]
async fn test_scale_retries_after_conflict() {
    let (scheduler, mut handle) = mock_scheduler();
    scheduler.watch_state().upsert_service(seeded_service(3));
    let watch_state = scheduler.watch_state();

    let verifier = tokio::spawn(async move {
        // First attempt carries a guard on the stale mirror value.
        let (request, send) = handle.next_request().await.expect("first patch");
        let (parts, body) = read_request(request).await;
        assert_eq!(parts.method, http::Method::PATCH);
        assert!(
            parts
                .uri
                .to_string()
                .contains(&format!("/namespaces/testuser/replicasets/{APP_NAME}"))
        );
        assert_eq!(
            parts.headers["content-type"],
            "application/json-patch+json"
        );
        assert_eq!(body[0]["op"], json!("test"));
        assert_eq!(body[0]["value"], json!(3));
        assert_eq!(body[1]["op"], json!("replace"));
        assert_eq!(body[1]["value"], json!(5));
        // A concurrent scale landed; the mirror now sees 4 replicas.
        watch_state.upsert_service(seeded_service(4));
        send.send_response(status_response(409, "Conflict"));

        // Retry re-reads the mirror and guards on the fresh value.
        let (request, send) = handle.next_request().await.expect("second patch");
        let (_, body) = read_request(request).await;
        assert_eq!(body[0]["value"], json!(4));
        assert_eq!(body[1]["value"], json!(5));
        send.send_response(replicaset_response(5));
    });

    let result = scheduler.scale_service(SERVICE_ID, 5, false).await;
    assert!(result.success);
    assert_eq!(result.status, 200);
    assert_eq!(result.result, ScaleOutcome::Scaled);
    finish(verifier).await;
    assert_eq!(
        scheduler.watch_state().service(SERVICE_ID).unwrap().instances,
        5
    );
}

#[tokio::test]
async fn test_scale_downward_is_a_noop() {
    let (scheduler, handle) = mock_scheduler();
    scheduler.watch_state().upsert_service(seeded_service(3));
    drop(handle);

    let result = scheduler.scale_service(SERVICE_ID, 2, false).await;
    assert!(result.success);
    assert_eq!(result.result, ScaleOutcome::ScalingNotNeeded);
    assert_eq!(
        scheduler.watch_state().service(SERVICE_ID).unwrap().instances,
        3
    );
}

#[tokio::test]
async fn test_safe_kill_issues_three_calls_in_order() {
    let (scheduler, mut handle) = mock_scheduler();
    scheduler.watch_state().upsert_service(seeded_service(1));

    let verifier = tokio::spawn(async move {
        // Step 1: soft delete with the long grace period.
        let (request, send) = handle.next_request().await.expect("soft delete");
        let (parts, body) = read_request(request).await;
        assert_eq!(parts.method, http::Method::DELETE);
        assert!(
            parts
                .uri
                .to_string()
                .contains(&format!("/namespaces/testuser/pods/{POD_NAME}"))
        );
        assert_eq!(body["gracePeriodSeconds"], json!(300));
        send.send_response(status_response(200, "Success"));

        // Step 2: scale the owner down by one; this one breaks.
        let (request, send) = handle.next_request().await.expect("scale patch");
        let (parts, body) = read_request(request).await;
        assert_eq!(parts.method, http::Method::PATCH);
        assert_eq!(body[0]["value"], json!(1));
        assert_eq!(body[1]["value"], json!(0));
        send.send_response(status_response(500, "InternalError"));

        // Step 3: hard delete; the pod is already gone.
        let (request, send) = handle.next_request().await.expect("hard delete");
        let (parts, body) = read_request(request).await;
        assert_eq!(parts.method, http::Method::DELETE);
        assert_eq!(body["gracePeriodSeconds"], json!(0));
        send.send_response(status_response(404, "NotFound"));
    });

    let result = scheduler.kill_instance(&seeded_instance()).await;
    assert!(result.killed);
    assert_eq!(result.status, 200);
    assert_eq!(result.result, KillOutcome::InstanceKilled);
    finish(verifier).await;
}

#[tokio::test]
async fn test_kill_of_missing_pod_reports_404() {
    let (scheduler, mut handle) = mock_scheduler();
    scheduler.watch_state().upsert_service(seeded_service(1));

    let verifier = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("soft delete");
        let (parts, _) = read_request(request).await;
        assert_eq!(parts.method, http::Method::DELETE);
        send.send_response(status_response(404, "NotFound"));
    });

    let result = scheduler.kill_instance(&seeded_instance()).await;
    assert!(!result.killed);
    assert_eq!(result.status, 404);
    assert_eq!(result.result, KillOutcome::NoSuchInstanceExists);
    finish(verifier).await;
}

#[tokio::test]
async fn test_create_conflict_is_a_noop() {
    let (scheduler, mut handle) = mock_scheduler();
    let descriptor = ServiceDescription {
        cmd: "./run-service".to_string(),
        run_as_user: "testuser".to_string(),
        ..Default::default()
    };

    let verifier = tokio::spawn(async move {
        // Existence probe misses.
        let (request, send) = handle.next_request().await.expect("existence probe");
        let (parts, _) = read_request(request).await;
        assert_eq!(parts.method, http::Method::GET);
        send.send_response(status_response(404, "NotFound"));

        // Create hits a concurrent winner.
        let (request, send) = handle.next_request().await.expect("create");
        let (parts, body) = read_request(request).await;
        assert_eq!(parts.method, http::Method::POST);
        assert!(parts.uri.to_string().contains("/namespaces/testuser/replicasets"));
        assert_eq!(body["metadata"]["annotations"]["waiter/service-id"], json!(SERVICE_ID));
        send.send_response(status_response(409, "AlreadyExists"));
    });

    let created = scheduler
        .create_service_if_new(SERVICE_ID, &descriptor)
        .await
        .expect("conflict is not an error");
    assert!(created.is_none());
    finish(verifier).await;
}

#[tokio::test]
async fn test_create_rejects_docker_cmd_type() {
    let (scheduler, handle) = mock_scheduler();
    drop(handle);
    let descriptor = ServiceDescription {
        cmd: "./run-service".to_string(),
        cmd_type: "docker".to_string(),
        run_as_user: "testuser".to_string(),
        ..Default::default()
    };
    let err = scheduler
        .create_service_if_new(SERVICE_ID, &descriptor)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        waiter_scheduler::SchedulerError::Unsupported(_)
    ));
}

#[tokio::test]
async fn test_delete_service_purges_failure_history() {
    let (scheduler, mut handle) = mock_scheduler();
    scheduler.watch_state().upsert_service(seeded_service(1));
    let mut failed = seeded_instance();
    failed.healthy = false;
    scheduler.failure_store().record(failed);

    let verifier = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("delete replicaset");
        let (parts, body) = read_request(request).await;
        assert_eq!(parts.method, http::Method::DELETE);
        assert!(
            parts
                .uri
                .to_string()
                .contains(&format!("/namespaces/testuser/replicasets/{APP_NAME}"))
        );
        assert_eq!(body["propagationPolicy"], json!("Background"));
        send.send_response(status_response(200, "Success"));
    });

    let result = scheduler.delete_service(SERVICE_ID).await;
    assert_eq!(
        serde_json::to_value(&result.result).unwrap(),
        json!("deleted")
    );
    finish(verifier).await;
    assert!(scheduler.failure_store().failed_instances(SERVICE_ID).is_empty());
    assert!(scheduler.watch_state().service(SERVICE_ID).is_none());
}
