#![allow(dead_code)]

use axum::Router;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Form, Json};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use unrelated_gateway_reconciler::config::{ConfigDocument, Overrides};
use unrelated_gateway_reconciler::{Deployment, ManualClock, Settings};

/// Token endpoint that always succeeds and hands out `tok-1`, `tok-2`, ...
#[derive(Clone, Default)]
pub struct TokenAuthority {
    pub issued: Arc<AtomicUsize>,
}

impl TokenAuthority {
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/oauth2/token", post(issue_token))
            .with_state(self.clone())
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }
}

async fn issue_token(
    State(auth): State<TokenAuthority>,
    _headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Json<Value> {
    assert_eq!(
        form.get("grant_type").map(String::as_str),
        Some("client_credentials")
    );
    let n = auth.issued.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({"access_token": format!("tok-{n}"), "expires_in": 3600, "token_type": "Bearer"}))
}

/// Bearer token presented on a request, if any.
pub fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Validated settings pointing both the token endpoint and the control plane at `base`.
pub fn settings(base: &str, extra: Value) -> Settings {
    let mut doc = json!({
        "region": "us-west-2",
        "controlPlane": { "endpoint": base, "pageSize": 2 },
        "credential": {
            "clientId": "client-1",
            "clientSecret": "secret-1",
            "tokenEndpoint": format!("{base}/oauth2/token"),
        },
        "polling": { "intervalSecs": 5, "maxWaitSecs": 60 },
    });
    if let (Some(d), Some(e)) = (doc.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            d.insert(k.clone(), v.clone());
        }
    }
    let mut f = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("tempfile");
    f.write_all(doc.to_string().as_bytes()).expect("write config");
    ConfigDocument::from_path(f.path(), &Overrides::default())
        .expect("load config")
        .validate(&|_: &str| None)
        .expect("valid config")
}

pub fn deployment(settings: Settings, clock: &ManualClock) -> Deployment {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("http client");
    Deployment::new(
        settings,
        http,
        Arc::new(clock.clone()),
        CancellationToken::new(),
    )
}
