//! Binding handles against the in-process fake engine.

mod common;

use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};

use edge_orchestrator_common::{BindingKind, OrchestratorError, WorkerDefinition};
use edge_orchestrator_host::{
    BindingProxyRegistry, LaunchOptions, ProcessSupervisor, RemoteValue, SupervisorOptions,
};

use common::{FakeLauncher, compile};

async fn registry(defs: &[WorkerDefinition]) -> (ProcessSupervisor, BindingProxyRegistry) {
    let supervisor = ProcessSupervisor::new(
        FakeLauncher::new(),
        SupervisorOptions {
            launch: LaunchOptions::default(),
            drain_timeout: Duration::from_secs(1),
            config_debug_path: None,
        },
    );
    let applied = supervisor.apply(compile(defs)).await.unwrap();
    let registry = BindingProxyRegistry::new(applied.process, reqwest::Client::new());
    (supervisor, registry)
}

fn workers() -> Vec<WorkerDefinition> {
    vec![
        WorkerDefinition::module("gateway", "export default {}")
            .with_binding("API", BindingKind::Service {
                target: "api".into(),
                entrypoint: None,
            })
            .with_binding("CACHE", BindingKind::KvNamespace { id: None })
            .with_binding("SETTINGS", BindingKind::PlainValue {
                value: json!({"region": "eu"}),
            }),
        WorkerDefinition::module("api", "export default {}")
            .with_binding("DB", BindingKind::D1Database { id: Some("main".into()) })
            .with_binding("UPLOADS", BindingKind::R2Bucket { bucket: None }),
    ]
}

#[tokio::test]
async fn test_worker_call_reaches_entrypoint() {
    let (_supervisor, registry) = registry(&workers()).await;

    let stub = registry.get_worker(None).unwrap();
    assert_eq!(stub.worker(), "gateway");

    let result = stub.call("greet", &[json!("ada")]).await.unwrap();
    let value = result.as_value().unwrap();
    assert_eq!(value["worker"], "gateway");
    assert_eq!(value["path"], json!(["greet"]));
    assert_eq!(value["args"], json!(["ada"]));
    assert!(value["binding"].is_null());

    let admin = registry.get_worker(Some("api")).unwrap().entrypoint("Admin");
    let result = admin.call("stats", &[]).await.unwrap();
    assert_eq!(result.as_value().unwrap()["entrypoint"], "Admin");
}

#[tokio::test]
async fn test_bindings_listing() {
    let (_supervisor, registry) = registry(&workers()).await;

    let bindings = registry.get_bindings(None).unwrap();
    let kinds: Vec<(&str, &str)> = bindings
        .iter()
        .map(|(name, stub)| (name.as_str(), stub.kind()))
        .collect();
    assert_eq!(
        kinds,
        [("API", "service"), ("CACHE", "kv_namespace"), ("SETTINGS", "json")]
    );

    let settings = &bindings["SETTINGS"];
    assert_eq!(settings.name(), "gateway.SETTINGS");
    assert_eq!(settings.value().unwrap(), Some(&json!({"region": "eu"})));
}

#[tokio::test]
async fn test_binding_property_and_functions() {
    let (_supervisor, registry) = registry(&workers()).await;
    let cache = registry.get_kv_namespace("CACHE", None).unwrap();

    let property = cache.property("name").await.unwrap();
    let value = property.as_value().unwrap();
    assert_eq!(value["binding"], "CACHE");
    assert!(value["args"].is_null());

    let counter = cache.call("counter", &[]).await.unwrap();
    assert_eq!(counter.get("count").and_then(RemoteValue::as_value), Some(&json!(1)));

    let increment = counter.get("increment").and_then(RemoteValue::as_function).unwrap();
    assert_eq!(increment.id(), "counter.increment");
    let called = increment.call(&[json!(5)]).await.unwrap();
    assert_eq!(called.as_value().unwrap()["called"], "counter.increment");
    assert_eq!(called.as_value().unwrap()["args"], json!([5]));
}

#[tokio::test]
async fn test_engine_error_message_is_kept() {
    let (_supervisor, registry) = registry(&workers()).await;
    let db = registry.get_d1_database("DB", Some("api")).unwrap();

    let err = db.call("explode", &[]).await.unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::Transport { reason } if reason.contains("kaboom inside the engine")
    ));
}

#[tokio::test]
async fn test_fetch_through_binding() {
    let (_supervisor, registry) = registry(&workers()).await;
    let api = registry.get_binding(None, "API").unwrap();

    let request = hyper::Request::builder()
        .method("PUT")
        .uri("https://gateway.example.com/items/7?full=1")
        .header("x-trace", "abc")
        .body(Bytes::from_static(b"{}"))
        .unwrap();
    let response = api.fetch(request).await.unwrap();
    assert_eq!(response.status(), 200);

    let echoed: Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(echoed["method"], "PUT");
    assert_eq!(echoed["uri"], "/items/7?full=1");
    assert_eq!(echoed["headers"]["x-trace"], "abc");
    assert_eq!(echoed["headers"]["mf-binding-worker"], "gateway");
    assert_eq!(echoed["headers"]["mf-binding-name"], "API");
    assert_eq!(
        echoed["headers"]["mf-original-url"],
        "https://gateway.example.com/items/7?full=1"
    );
}

#[tokio::test]
async fn test_typed_getters() {
    let (_supervisor, registry) = registry(&workers()).await;

    assert_eq!(registry.get_r2_bucket("UPLOADS", Some("api")).unwrap().kind(), "r2_bucket");

    let err = registry.get_r2_bucket("CACHE", None).unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::Unbound { binding, worker, .. } if binding == "CACHE" && worker == "gateway"
    ));

    let err = registry.get_queue_producer("JOBS", None).unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::NotFound { kind, name, .. } if kind == "binding" && name == "JOBS"
    ));

    let err = registry.get_durable_object_namespace("API", None).unwrap_err();
    assert!(matches!(err, OrchestratorError::Unbound { .. }));
}

#[tokio::test]
async fn test_unknown_and_wrapped_only_workers() {
    let defs = vec![
        WorkerDefinition::module("main", "export default {}").with_binding(
            "RATE",
            BindingKind::Wrapped {
                script_name: "limiter".into(),
                entrypoint: None,
                inner_bindings: Default::default(),
            },
        ),
        WorkerDefinition::module("limiter", "export default function () {}"),
    ];
    let (_supervisor, registry) = registry(&defs).await;

    let err = registry.get_worker(Some("missing")).unwrap_err();
    assert!(matches!(&err, OrchestratorError::NotFound { kind, .. } if kind == "worker"));

    let err = registry.get_worker(Some("limiter")).unwrap_err();
    assert!(err.to_string().contains("wrapped bindings"));

    assert_eq!(registry.get_binding(None, "RATE").unwrap().kind(), "wrapped");
}

#[tokio::test]
async fn test_dispose_poisons_binding_values() {
    let (supervisor, registry) = registry(&workers()).await;
    let settings = registry.get_binding(None, "SETTINGS").unwrap();
    settings.value().unwrap();

    supervisor.dispose().await;

    assert!(matches!(
        settings.value(),
        Err(OrchestratorError::PoisonedStub { ref name }) if name == "gateway.SETTINGS"
    ));
}
