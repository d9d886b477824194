//! Orchestrator API end-to-end against the in-process fake engine.

mod common;

use std::sync::atomic::Ordering;

use bytes::Bytes;
use serde_json::json;

use std::collections::BTreeMap;

use edge_orchestrator_common::{
    BindingKind, DirectSocket, FetchMock, MockInterceptor, OrchestratorError, WorkerDefinition,
};
use edge_orchestrator_core::LoopbackHandler;
use edge_orchestrator_core::runtime_config::outbound_service_name;
use edge_orchestrator_server::Orchestrator;

use common::{FakeLauncher, client, config, get_json, start};

fn worker(name: &str) -> WorkerDefinition {
    WorkerDefinition::module(name, "export default {}")
}

#[tokio::test]
async fn test_routes_to_workers() {
    let workers = vec![worker("api"), worker("admin").with_route("*/admin/*")];
    let (_launcher, orchestrator, url) = start(config(), workers).await;

    let echoed = get_json(&url, "/admin/users").await;
    assert_eq!(echoed["origin"], "entry:admin#1");
    assert_eq!(echoed["uri"], "/admin/users");

    let echoed = get_json(&url, "/other?x=1").await;
    assert_eq!(echoed["origin"], "entry:api#1");
    assert_eq!(echoed["uri"], "/other?x=1");

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_dispatch_fetch() {
    let (_launcher, orchestrator, url) = start(config(), vec![worker("api")]).await;

    let request = hyper::Request::builder()
        .method("POST")
        .uri("http://localhost/items?id=3")
        .header("x-trace", "abc")
        .body(Bytes::from_static(b"{}"))
        .unwrap();
    let response = orchestrator.dispatch_fetch(request).await.unwrap();
    assert_eq!(response.status(), 200);

    let echoed: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["uri"], "/items?id=3");
    assert_eq!(echoed["headers"]["x-trace"], "abc");
    // Without a trusted proxy the engine sees the listening address
    assert_eq!(echoed["headers"]["host"], url.authority());

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_binding_scoping() {
    let mut unnamed = worker("").with_binding("UNNAMED_VALUE", BindingKind::PlainValue {
        value: json!(1),
    });
    unnamed.name = None;
    let workers = vec![
        worker("main").with_binding("MAIN_VALUE", BindingKind::PlainValue { value: json!(2) }),
        unnamed,
    ];
    let (_launcher, orchestrator, _url) = start(config(), workers).await;

    let entry: Vec<String> = orchestrator.get_bindings(None).await.unwrap().into_keys().collect();
    let unnamed: Vec<String> = orchestrator.get_bindings(Some("")).await.unwrap().into_keys().collect();
    assert_eq!(entry, ["MAIN_VALUE"]);
    assert_eq!(unnamed, ["UNNAMED_VALUE"]);

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_worker_rpc_and_typed_getters() {
    let workers = vec![worker("api").with_binding("CACHE", BindingKind::KvNamespace { id: None })];
    let (_launcher, orchestrator, _url) = start(config(), workers).await;

    let stub = orchestrator.get_worker(None).await.unwrap();
    let result = stub.call("ping", &[json!(1)]).await.unwrap();
    assert_eq!(result.as_value().unwrap()["worker"], "api");
    assert_eq!(result.as_value().unwrap()["path"], json!(["ping"]));

    let cache = orchestrator.get_kv_namespace("CACHE", None).await.unwrap();
    assert_eq!(cache.kind(), "kv_namespace");
    assert!(matches!(
        orchestrator.get_r2_bucket("CACHE", None).await,
        Err(OrchestratorError::Unbound { .. })
    ));
    assert!(matches!(
        orchestrator.get_worker(Some("missing")).await,
        Err(OrchestratorError::NotFound { .. })
    ));

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_get_cf() {
    let (_launcher, orchestrator, _url) = start(config(), vec![worker("api")]).await;
    let cf = orchestrator.get_cf().await.unwrap();
    assert_eq!(cf["country"], "US");
    orchestrator.dispose().await;

    let mut custom = config();
    custom.proxy.cf = Some(json!({"colo": "LHR"}));
    let (_launcher, orchestrator, _url) = start(custom, vec![worker("api")]).await;
    assert_eq!(orchestrator.get_cf().await.unwrap(), json!({"colo": "LHR"}));
    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_direct_url() {
    let mut api = worker("api");
    api.unsafe_direct_sockets.push(DirectSocket::default());
    let (_launcher, orchestrator, _url) = start(config(), vec![api, worker("other")]).await;

    let direct = orchestrator.unsafe_get_direct_url(None, None).await.unwrap();
    let echoed = get_json(&direct, "/direct").await;
    assert_eq!(echoed["origin"], "direct:api:default#1");

    let err = orchestrator.unsafe_get_direct_url(Some("other"), None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound { .. }));

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_no_op_set_options_keeps_port() {
    let workers = vec![worker("api")];
    let (launcher, orchestrator, url) = start(config(), workers.clone()).await;

    orchestrator.set_options(config(), workers).await.unwrap();
    assert_eq!(orchestrator.ready().await.unwrap(), url);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    // A real restart on port 0 moves to a fresh port
    orchestrator
        .set_options(config(), vec![WorkerDefinition::module("api", "export default { v: 2 }")])
        .await
        .unwrap();
    let restarted = orchestrator.ready().await.unwrap();
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_ne!(restarted, url);
    assert_eq!(get_json(&restarted, "/").await["origin"], "entry:api#2");

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_set_options_compile_error_applies_nothing() {
    let (launcher, orchestrator, url) = start(config(), vec![worker("api")]).await;

    let err = orchestrator
        .set_options(config(), vec![worker("api"), worker("api")])
        .await
        .unwrap_err();
    assert!(err.is_config_error());
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    assert_eq!(get_json(&url, "/").await["origin"], "entry:api#1");

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_invalid_definitions_fail_construction() {
    let result = Orchestrator::with_launcher(config(), vec![], FakeLauncher::new()).await;
    assert!(matches!(result, Err(OrchestratorError::NoWorkers)));
}

#[tokio::test]
async fn test_startup_failure() {
    let launcher = FakeLauncher::new();
    launcher.fail.store(true, Ordering::SeqCst);
    let orchestrator = Orchestrator::with_launcher(config(), vec![worker("api")], launcher.clone())
        .await
        .unwrap();

    let err = orchestrator.ready().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StartupFailure { .. }));

    // The next successful reconfiguration recovers
    launcher.fail.store(false, Ordering::SeqCst);
    orchestrator
        .set_options(config(), vec![worker("api")])
        .await
        .unwrap();
    orchestrator.ready().await.unwrap();

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_dispose_rejects_pending_ready() {
    let orchestrator = Orchestrator::with_launcher(config(), vec![worker("api")], FakeLauncher::new())
        .await
        .unwrap();

    let (ready, ()) = tokio::join!(orchestrator.ready(), orchestrator.dispose());
    assert!(matches!(ready, Err(OrchestratorError::Disposed)));

    assert!(matches!(orchestrator.ready().await, Err(OrchestratorError::Disposed)));
    assert!(matches!(
        orchestrator.set_options(config(), vec![worker("api")]).await,
        Err(OrchestratorError::Disposed)
    ));
    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_dispose_poisons_stubs() {
    let (_launcher, orchestrator, _url) = start(config(), vec![worker("api")]).await;
    let stub = orchestrator.get_worker(None).await.unwrap();

    orchestrator.dispose().await;
    assert!(matches!(
        stub.call("ping", &[]).await,
        Err(OrchestratorError::PoisonedStub { .. })
    ));
}

fn mocked(name: &str) -> WorkerDefinition {
    let mut def = worker(name);
    def.fetch_mock = Some(FetchMock {
        interceptors: vec![MockInterceptor {
            origin: "https://mocked.example.com".into(),
            path: "/".into(),
            method: None,
            status: 200,
            body: "mocked".into(),
            headers: BTreeMap::new(),
        }],
    });
    def
}

#[tokio::test]
async fn test_ephemeral_port_moves_on_restart() {
    let (_launcher, orchestrator, url) = start(config(), vec![worker("api")]).await;

    orchestrator
        .set_options(config(), vec![WorkerDefinition::module("api", "export default { v: 2 }")])
        .await
        .unwrap();
    let moved = orchestrator.ready().await.unwrap();

    assert_ne!(moved.port(), url.port());
    assert_eq!(get_json(&moved, "/").await["origin"], "entry:api#2");
    assert!(client().get(url).send().await.is_err());

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_explicit_port_survives_restart() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let mut fixed = config();
    fixed.server.port = port;
    let (_launcher, orchestrator, url) = start(fixed.clone(), vec![worker("api")]).await;
    assert_eq!(url.port(), Some(port));

    orchestrator
        .set_options(fixed, vec![WorkerDefinition::module("api", "export default { v: 2 }")])
        .await
        .unwrap();
    assert_eq!(orchestrator.ready().await.unwrap(), url);
    assert_eq!(get_json(&url, "/").await["origin"], "entry:api#2");

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_host_change_rebinds_loopback() {
    let (_launcher, orchestrator, _url) = start(config(), vec![mocked("api")]).await;
    let old_loopback = orchestrator.loopback_addr().await.unwrap();

    let mut wildcard = config();
    wildcard.server.host = "0.0.0.0".into();
    orchestrator.set_options(wildcard, vec![mocked("api")]).await.unwrap();
    let url = orchestrator.ready().await.unwrap();

    let new_loopback = orchestrator.loopback_addr().await.unwrap();
    assert_ne!(new_loopback, old_loopback);
    assert!(new_loopback.ip().is_unspecified());
    assert!(tokio::net::TcpStream::connect(old_loopback).await.is_err());

    // The restarted engine reaches the new loopback server
    let response = client()
        .get(url.join("/outbound?url=https://mocked.example.com/").unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "mocked");

    orchestrator.dispose().await;
}

#[tokio::test]
async fn test_failed_restart_keeps_previous_pipeline() {
    let mut secured = config();
    secured.proxy.unsafe_proxy_shared_secret = Some("old".into());
    let (launcher, orchestrator, url) = start(secured, vec![mocked("api")]).await;
    let loopback = orchestrator.loopback_addr().await.unwrap();

    let mut changed = config();
    changed.server.host = "0.0.0.0".into();
    changed.proxy.unsafe_proxy_shared_secret = Some("new".into());
    changed.proxy.strip_cf_connecting_ip = false;

    launcher.fail.store(true, Ordering::SeqCst);
    let err = orchestrator
        .set_options(changed.clone(), vec![worker("api")])
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::StartupFailure { .. }));

    let proxy = orchestrator.state().proxy();
    assert_eq!(proxy.unsafe_proxy_shared_secret.as_deref(), Some("old"));
    assert!(proxy.strip_cf_connecting_ip);
    assert!(matches!(
        orchestrator.state().handlers().get(&outbound_service_name("api")),
        Some(LoopbackHandler::FetchMock(_))
    ));
    assert_eq!(orchestrator.loopback_addr().await, Some(loopback));

    // The front door still checks the old secret
    let rejected = client()
        .get(url.clone())
        .header("MF-Proxy-Shared-Secret", "new")
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);
    let accepted = client()
        .get(url)
        .header("MF-Proxy-Shared-Secret", "old")
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 503);

    // Retrying once the engine starts applies everything
    launcher.fail.store(false, Ordering::SeqCst);
    orchestrator.set_options(changed, vec![worker("api")]).await.unwrap();
    orchestrator.ready().await.unwrap();
    assert_eq!(
        orchestrator.state().proxy().unsafe_proxy_shared_secret.as_deref(),
        Some("new")
    );
    assert!(matches!(
        orchestrator.state().handlers().get(&outbound_service_name("api")),
        Some(LoopbackHandler::Network { .. })
    ));
    assert_ne!(orchestrator.loopback_addr().await, Some(loopback));

    orchestrator.dispose().await;
}
