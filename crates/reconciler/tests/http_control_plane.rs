mod common;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use common::{TokenAuthority, bearer};
use futures::TryStreamExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use unrelated_gateway_reconciler::api::PageRequest;
use unrelated_gateway_reconciler::model::GatewayStatus;
use unrelated_gateway_reconciler::{
    AlwaysConfirm, CleanupOutcome, Error, ManualClock, TargetOutcome,
};
use unrelated_test_support::{CallLog, StubServer};

/// In-memory control plane speaking the REST+JSON dialect of the real service.
#[derive(Clone, Default)]
struct ControlPlaneStub {
    state: Arc<Mutex<Cp>>,
    log: CallLog,
}

#[derive(Default)]
struct Cp {
    next_id: usize,
    gateways: BTreeMap<String, Value>,
    targets: BTreeMap<String, Vec<Value>>,
    /// GET /gateways/{id} answers CREATING this many times before ACTIVE.
    creating_checks: usize,
    revoked: HashSet<String>,
    conflict_on_create: bool,
    tokens_seen: Vec<String>,
}

impl ControlPlaneStub {
    fn seed(&self, name: &str, tags: Value, targets: &[&str]) -> String {
        let mut cp = self.state.lock();
        cp.next_id += 1;
        let id = format!("gw-{}", cp.next_id);
        cp.gateways.insert(
            id.clone(),
            json!({"gatewayId": id, "name": name, "status": "ACTIVE", "tags": tags}),
        );
        let list = targets
            .iter()
            .enumerate()
            .map(|(i, t)| json!({"targetId": format!("{id}-t{i}"), "name": t, "status": "READY"}))
            .collect();
        cp.targets.insert(id.clone(), list);
        id
    }

    fn routes(&self) -> Router {
        Router::new()
            .route("/gateways", get(list_gateways).post(create_gateway))
            .route("/gateways/{id}", get(get_gateway).delete(delete_gateway))
            .route(
                "/gateways/{id}/targets",
                get(list_targets).post(attach_target),
            )
            .route(
                "/gateways/{id}/targets/{tid}",
                get(get_target).delete(detach_target),
            )
            .with_state(self.clone())
    }
}

fn error(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn check_auth(stub: &ControlPlaneStub, headers: &HeaderMap) -> Result<(), Response> {
    let Some(token) = bearer(headers) else {
        return Err(error(
            StatusCode::UNAUTHORIZED,
            json!({"message": "missing token"}),
        ));
    };
    let mut cp = stub.state.lock();
    cp.tokens_seen.push(token.clone());
    if cp.revoked.contains(&token) {
        return Err(error(
            StatusCode::UNAUTHORIZED,
            json!({"__type": "UnauthorizedException", "message": "token revoked"}),
        ));
    }
    Ok(())
}

fn page(items: &[Value], q: &HashMap<String, String>) -> Value {
    let size: usize = q
        .get("maxResults")
        .and_then(|v| v.parse().ok())
        .unwrap_or(usize::MAX);
    let start: usize = q
        .get("nextToken")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let end = start.saturating_add(size).min(items.len());
    let mut out = json!({"items": items[start.min(end)..end]});
    if end < items.len() {
        out["nextToken"] = json!(end.to_string());
    }
    out
}

async fn create_gateway(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let name = body["name"].as_str().unwrap_or("");
    stub.log.record(format!("POST /gateways {name}"));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let mut cp = stub.state.lock();
    if cp.conflict_on_create {
        return error(
            StatusCode::CONFLICT,
            json!({
                "__type": "com.amazonaws.bedrockagentcorecontrol#ConflictException",
                "message": "gateway name already in use"
            }),
        );
    }
    cp.next_id += 1;
    let id = format!("gw-{}", cp.next_id);
    let gw = json!({
        "gatewayId": id,
        "name": body["name"],
        "status": "CREATING",
        "tags": body["tags"],
        "gatewayUrl": format!("https://{id}.gateway.example.com"),
        "createdAt": "2026-10-19T12:00:00Z",
        "request": body,
    });
    cp.gateways.insert(id.clone(), gw.clone());
    cp.targets.insert(id, Vec::new());
    (StatusCode::ACCEPTED, Json(gw)).into_response()
}

async fn list_gateways(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let mut keys: Vec<String> = q.iter().map(|(k, v)| format!("{k}={v}")).collect();
    keys.sort();
    stub.log.record(format!("GET /gateways?{}", keys.join("&")));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let cp = stub.state.lock();
    let all: Vec<Value> = cp.gateways.values().cloned().collect();
    Json(page(&all, &q)).into_response()
}

async fn get_gateway(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    stub.log.record(format!("GET /gateways/{id}"));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let mut cp = stub.state.lock();
    let ready = if cp.creating_checks > 0 {
        cp.creating_checks -= 1;
        false
    } else {
        true
    };
    match cp.gateways.get_mut(&id) {
        Some(gw) => {
            if ready && gw["status"] == "CREATING" {
                gw["status"] = json!("ACTIVE");
            }
            Json(gw.clone()).into_response()
        }
        None => error(
            StatusCode::NOT_FOUND,
            json!({"__type": "ResourceNotFoundException", "message": format!("{id} not found")}),
        ),
    }
}

async fn delete_gateway(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    stub.log.record(format!("DELETE /gateways/{id}"));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let mut cp = stub.state.lock();
    if cp.targets.get(&id).is_some_and(|t| !t.is_empty()) {
        return error(
            StatusCode::CONFLICT,
            json!({"__type": "ConflictException", "message": "gateway still has targets"}),
        );
    }
    cp.targets.remove(&id);
    match cp.gateways.remove(&id) {
        Some(_) => (StatusCode::ACCEPTED, Json(json!({"gatewayId": id, "status": "DELETING"})))
            .into_response(),
        None => error(StatusCode::NOT_FOUND, json!({"message": "not found"})),
    }
}

async fn attach_target(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    stub.log.record(format!(
        "POST /gateways/{id}/targets {}",
        body["name"].as_str().unwrap_or("")
    ));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let mut cp = stub.state.lock();
    let Some(list) = cp.targets.get_mut(&id) else {
        return error(StatusCode::NOT_FOUND, json!({"message": "no such gateway"}));
    };
    let target = json!({
        "targetId": format!("{id}-t{}", list.len()),
        "name": body["name"],
        "status": "READY",
        "request": body,
    });
    list.push(target.clone());
    Json(target).into_response()
}

async fn list_targets(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    stub.log.record(format!("GET /gateways/{id}/targets"));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let cp = stub.state.lock();
    match cp.targets.get(&id) {
        Some(list) => Json(page(list, &q)).into_response(),
        None => error(StatusCode::NOT_FOUND, json!({"message": "no such gateway"})),
    }
}

async fn get_target(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Path((id, tid)): Path<(String, String)>,
) -> Response {
    stub.log.record(format!("GET /gateways/{id}/targets/{tid}"));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let cp = stub.state.lock();
    match cp
        .targets
        .get(&id)
        .and_then(|list| list.iter().find(|t| t["targetId"] == tid.as_str()))
    {
        Some(t) => Json(t.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, json!({"message": "no such target"})),
    }
}

async fn detach_target(
    State(stub): State<ControlPlaneStub>,
    headers: HeaderMap,
    Path((id, tid)): Path<(String, String)>,
) -> Response {
    stub.log.record(format!("DELETE /gateways/{id}/targets/{tid}"));
    if let Err(resp) = check_auth(&stub, &headers) {
        return resp;
    }
    let mut cp = stub.state.lock();
    let Some(list) = cp.targets.get_mut(&id) else {
        return error(StatusCode::NOT_FOUND, json!({"message": "no such gateway"}));
    };
    let before = list.len();
    list.retain(|t| t["targetId"] != tid.as_str());
    if list.len() == before {
        return error(StatusCode::NOT_FOUND, json!({"message": "no such target"}));
    }
    StatusCode::ACCEPTED.into_response()
}

async fn serve(stub: &ControlPlaneStub, auth: &TokenAuthority) -> StubServer {
    StubServer::spawn(auth.routes().merge(stub.routes()))
        .await
        .expect("spawn stub")
}

fn gateway_section() -> Value {
    json!({
        "gateway": {
            "name": "mcp-demo",
            "roleArn": "arn:aws:iam::123456789012:role/GatewayRole",
            "auth": { "discoveryUrl": "https://issuer.example.com/.well-known/openid-configuration" },
            "lambdaFunctionArn": "arn:aws:lambda:us-west-2:123456789012:function:tools",
            "targets": [
                { "name": "catalog", "type": "open-api", "functionReference": "s3://specs/catalog.json" }
            ],
            "tags": { "team": "tools" }
        }
    })
}

#[tokio::test]
async fn create_gateway_over_http_waits_for_active_and_attaches_targets() {
    let auth = TokenAuthority::default();
    let stub = ControlPlaneStub::default();
    stub.state.lock().creating_checks = 2;
    let server = serve(&stub, &auth).await;
    let clock = ManualClock::new();
    let settings = common::settings(server.base_url(), gateway_section());
    let deployment = common::deployment(settings, &clock);
    let spec = deployment.settings().require_gateway().expect("gateway").clone();

    let reg = deployment
        .registrar()
        .create_gateway(&spec)
        .await
        .expect("registration");

    assert_eq!(reg.gateway.status, GatewayStatus::Active);
    assert!(!reg.reused_existing);
    assert!(!reg.has_failures());
    let names: Vec<&str> = reg.targets.iter().map(|t| t.target_name.as_str()).collect();
    assert_eq!(names, vec!["mcp-demo-lambda-target", "catalog"]);
    assert!(
        reg.targets
            .iter()
            .all(|t| matches!(t.outcome, TargetOutcome::Attached { .. }))
    );
    // Two CREATING answers, then ACTIVE.
    let status_checks = stub
        .log
        .entries()
        .iter()
        .filter(|e| *e == "GET /gateways/gw-1")
        .count();
    assert_eq!(status_checks, 3);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 2]);

    let cp = stub.state.lock();
    let request = &cp.gateways["gw-1"]["request"];
    assert_eq!(request["protocolType"], "MCP");
    assert_eq!(request["tags"]["managed-by"], "unrelated-gateway-deploy");
    assert_eq!(request["tags"]["team"], "tools");
    assert_eq!(
        request["authorizerConfiguration"]["customJwtAuthorizer"]["allowedAudience"],
        json!(["client-1"])
    );
    let lambda = &cp.targets["gw-1"][0]["request"];
    assert_eq!(
        lambda["targetConfiguration"]["mcp"]["lambda"]["lambdaArn"],
        "arn:aws:lambda:us-west-2:123456789012:function:tools"
    );
    // One token for the whole run, presented on every call.
    assert_eq!(auth.issued(), 1);
    assert!(cp.tokens_seen.iter().all(|t| t == "tok-1"));
}

#[tokio::test]
async fn namespaced_conflict_code_is_recognized_as_duplicate_name() {
    let auth = TokenAuthority::default();
    let stub = ControlPlaneStub::default();
    let existing = stub.seed("mcp-demo", json!({}), &["mcp-demo-lambda-target"]);
    stub.state.lock().conflict_on_create = true;
    let server = serve(&stub, &auth).await;
    let clock = ManualClock::new();
    let settings = common::settings(server.base_url(), gateway_section());
    let deployment = common::deployment(settings, &clock);
    let spec = deployment.settings().require_gateway().expect("gateway").clone();

    let reg = deployment
        .registrar()
        .create_gateway(&spec)
        .await
        .expect("adopted");

    assert!(reg.reused_existing);
    assert_eq!(reg.gateway.id, existing);
    assert!(matches!(
        reg.targets[0].outcome,
        TargetOutcome::AlreadyAttached { .. }
    ));
    assert!(matches!(
        reg.targets[1].outcome,
        TargetOutcome::Attached { .. }
    ));
    assert_eq!(stub.log.count("POST /gateways/gw-1/targets"), 1);
}

#[tokio::test]
async fn unauthorized_response_is_retried_once_with_a_fresh_token() {
    let auth = TokenAuthority::default();
    let stub = ControlPlaneStub::default();
    stub.state.lock().revoked.insert("tok-1".to_string());
    let server = serve(&stub, &auth).await;
    let clock = ManualClock::new();
    let deployment = common::deployment(common::settings(server.base_url(), json!({})), &clock);
    let api = deployment.control_plane();

    api.list_gateways(PageRequest::first(10))
        .await
        .expect("re-sent with tok-2");
    assert_eq!(auth.issued(), 2);
    assert_eq!(stub.state.lock().tokens_seen, vec!["tok-1", "tok-2"]);
    assert_eq!(stub.log.count("GET /gateways?"), 2);

    // A freshly issued token that is rejected too is not retried a second time.
    stub.state
        .lock()
        .revoked
        .extend(["tok-2".to_string(), "tok-3".to_string()]);
    let err = api.list_gateways(PageRequest::first(10)).await.unwrap_err();
    assert_eq!(err.status, Some(401));
    assert_eq!(auth.issued(), 3);
    assert_eq!(
        stub.state.lock().tokens_seen,
        vec!["tok-1", "tok-2", "tok-2", "tok-3"]
    );
}

#[tokio::test]
async fn listing_follows_next_token_and_sends_page_size() {
    let auth = TokenAuthority::default();
    let stub = ControlPlaneStub::default();
    for name in ["mcp-a", "other", "mcp-b", "mcp-c", "batch"] {
        stub.seed(name, json!({}), &[]);
    }
    let server = serve(&stub, &auth).await;
    let clock = ManualClock::new();
    let deployment = common::deployment(common::settings(server.base_url(), json!({})), &clock);
    let reconciler = deployment.reconciler(Arc::new(AlwaysConfirm));

    let owned: Vec<String> = reconciler
        .list()
        .map_ok(|gw| gw.name)
        .try_collect()
        .await
        .expect("list");
    assert_eq!(owned, vec!["mcp-a", "mcp-b", "mcp-c"]);
    assert_eq!(
        stub.log.entries(),
        vec![
            "GET /gateways?maxResults=2",
            "GET /gateways?maxResults=2&nextToken=2",
            "GET /gateways?maxResults=2&nextToken=4",
        ]
    );
}

#[tokio::test]
async fn cleanup_detaches_targets_before_deleting_the_gateway() {
    let auth = TokenAuthority::default();
    let stub = ControlPlaneStub::default();
    let id = stub.seed(
        "mcp-demo",
        json!({"managed-by": "unrelated-gateway-deploy"}),
        &["a", "b", "c"],
    );
    let server = serve(&stub, &auth).await;
    let clock = ManualClock::new();
    let deployment = common::deployment(common::settings(server.base_url(), json!({})), &clock);

    let report = deployment
        .reconciler(Arc::new(AlwaysConfirm))
        .cleanup(&[id.clone(), "gw-missing".to_string()], true)
        .await
        .expect("cleanup");

    assert_eq!(
        report.items[0].outcome,
        CleanupOutcome::Deleted {
            detached_targets: 3
        }
    );
    assert_eq!(report.items[1].outcome, CleanupOutcome::AlreadyAbsent);
    assert!(!report.has_failures());

    let entries = stub.log.entries();
    let delete_gw = entries
        .iter()
        .position(|e| *e == format!("DELETE /gateways/{id}"))
        .expect("gateway deleted");
    for i in 0..3 {
        let detach = stub
            .log
            .position(&format!("DELETE /gateways/{id}/targets/{id}-t{i}"))
            .expect("target detached");
        assert!(detach < delete_gw);
    }
    assert!(stub.state.lock().gateways.is_empty());
}

#[tokio::test]
async fn info_reports_missing_gateway_as_not_found() {
    let auth = TokenAuthority::default();
    let stub = ControlPlaneStub::default();
    let server = serve(&stub, &auth).await;
    let clock = ManualClock::new();
    let deployment = common::deployment(common::settings(server.base_url(), json!({})), &clock);

    let err = deployment
        .reconciler(Arc::new(AlwaysConfirm))
        .info("gw-404")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err:?}");
}
