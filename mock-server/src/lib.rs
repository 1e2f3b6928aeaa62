use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{any, get, put},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub name: String,
}

#[derive(Deserialize)]
pub struct CreateItem {
    pub name: String,
}

/// Per-endpoint hit counts.
#[derive(Debug, Default)]
pub struct Counters {
    pub token: AtomicUsize,
    pub refresh: AtomicUsize,
    pub logout: AtomicUsize,
    pub protected: AtomicUsize,
}

impl Counters {
    pub fn token(&self) -> usize {
        self.token.load(Ordering::SeqCst)
    }

    pub fn refresh(&self) -> usize {
        self.refresh.load(Ordering::SeqCst)
    }

    pub fn logout(&self) -> usize {
        self.logout.load(Ordering::SeqCst)
    }

    pub fn protected(&self) -> usize {
        self.protected.load(Ordering::SeqCst)
    }
}

struct Shared {
    counters: Counters,
    tokens: RwLock<HashSet<String>>,
    items: RwLock<HashMap<Uuid, Item>>,
    uploaded: AtomicBool,
    token_delay: Duration,
    refresh_enabled: bool,
}

/// Server state. Clones share it, so tests keep one to read counters.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Shared>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Duration::ZERO, true)
    }
}

impl AppState {
    /// `token_delay` holds every token response back; with `refresh_enabled`
    /// false the refresh endpoint always answers 401.
    pub fn new(token_delay: Duration, refresh_enabled: bool) -> Self {
        Self {
            inner: Arc::new(Shared {
                counters: Counters::default(),
                tokens: RwLock::new(HashSet::new()),
                items: RwLock::new(HashMap::new()),
                uploaded: AtomicBool::new(false),
                token_delay,
                refresh_enabled,
            }),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    /// Invalidate every issued token, as if they all expired.
    pub async fn expire_tokens(&self) {
        self.inner.tokens.write().await.clear();
    }

    async fn issue_token(&self) -> String {
        let token = Uuid::new_v4().to_string();
        self.inner.tokens.write().await.insert(token.clone());
        token
    }

    async fn bearer_token(&self, headers: &HeaderMap) -> Option<String> {
        let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
        let token = value.strip_prefix("Bearer ")?;
        self.inner
            .tokens
            .read()
            .await
            .contains(token)
            .then(|| token.to_string())
    }
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/api/auth/token", get(token))
        .route("/api/auth/token/refresh", get(refresh))
        .route("/api/auth/logout", get(logout))
        .route("/items", get(list_items).post(create_item))
        .route("/items/stream", get(stream_items))
        .route("/items/{id}", get(get_item))
        .route("/events", get(events))
        .route("/legacy-error", get(legacy_error))
        .route("/text-error", get(text_error))
        .route("/echo", any(echo))
        .route("/upload/{name}", put(upload))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::default()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"message": "token expired"})),
    )
        .into_response()
}

async fn token(State(state): State<AppState>) -> Json<Value> {
    state.inner.counters.token.fetch_add(1, Ordering::SeqCst);
    if !state.inner.token_delay.is_zero() {
        tokio::time::sleep(state.inner.token_delay).await;
    }
    let token = state.issue_token().await;
    debug!("issued session token");
    Json(json!({ "token": token }))
}

async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.inner.counters.refresh.fetch_add(1, Ordering::SeqCst);
    if !state.inner.refresh_enabled {
        return unauthorized();
    }
    let previous = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let Some(previous) = previous else {
        return unauthorized();
    };
    state.inner.tokens.write().await.remove(&previous);
    let token = state.issue_token().await;
    Json(json!({ "token": token })).into_response()
}

async fn logout(State(state): State<AppState>) -> StatusCode {
    state.inner.counters.logout.fetch_add(1, Ordering::SeqCst);
    state.expire_tokens().await;
    info!("session logged out");
    StatusCode::NO_CONTENT
}

async fn list_items(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.inner.counters.protected.fetch_add(1, Ordering::SeqCst);
    if state.bearer_token(&headers).await.is_none() {
        return unauthorized();
    }
    let items = state.inner.items.read().await;
    Json(items.values().cloned().collect::<Vec<_>>()).into_response()
}

async fn create_item(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateItem>,
) -> Response {
    state.inner.counters.protected.fetch_add(1, Ordering::SeqCst);
    if state.bearer_token(&headers).await.is_none() {
        return unauthorized();
    }
    let item = Item {
        id: Uuid::new_v4(),
        name: input.name,
    };
    state.inner.items.write().await.insert(item.id, item.clone());
    (StatusCode::CREATED, Json(item)).into_response()
}

async fn get_item(State(state): State<AppState>, headers: HeaderMap, Path(id): Path<Uuid>) -> Response {
    state.inner.counters.protected.fetch_add(1, Ordering::SeqCst);
    if state.bearer_token(&headers).await.is_none() {
        return unauthorized();
    }
    match state.inner.items.read().await.get(&id) {
        Some(item) => Json(item.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "item not found"})),
        )
            .into_response(),
    }
}

/// Items as NDJSON, one chunk per line.
async fn stream_items(State(state): State<AppState>, headers: HeaderMap) -> Response {
    state.inner.counters.protected.fetch_add(1, Ordering::SeqCst);
    if state.bearer_token(&headers).await.is_none() {
        return unauthorized();
    }
    let lines: Vec<Result<String, Infallible>> = state
        .inner
        .items
        .read()
        .await
        .values()
        .map(|item| Ok(format!("{}\n", json!(item))))
        .collect();
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream::iter(lines)),
    )
        .into_response()
}

/// Three numbered events, then the stream ends.
async fn events() -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = (1..=3).map(|n| Ok(Event::default().data(json!({ "n": n }).to_string())));
    Sse::new(stream::iter(events))
}

async fn legacy_error() -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"resultType": "FAIL", "resultMessage": "legacy failure"})),
    )
}

async fn text_error() -> (StatusCode, &'static str) {
    (StatusCode::BAD_GATEWAY, "upstream unavailable")
}

/// Reflects the request back as JSON.
async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: String) -> Json<Value> {
    let headers: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "headers": headers,
        "body": body,
    }))
}

async fn upload(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let base64 = headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| v == "base64");
    if !base64 || body.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    let exclusive = headers
        .get(header::IF_NONE_MATCH)
        .is_some_and(|v| v == "*");
    if exclusive && state.inner.uploaded.load(Ordering::SeqCst) {
        return StatusCode::PRECONDITION_FAILED;
    }
    state.inner.uploaded.store(true, Ordering::SeqCst);
    StatusCode::CREATED
}
