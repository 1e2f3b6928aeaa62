//! End-to-end tests against the live mock server.
//!
//! # Design
//! Starts the mock server on a random port and drives the client over real
//! HTTP: through `ReqwestTransport` (the production transport) and through
//! a ureq-backed transport where the host performs the blocking IO itself.
//! Single-flight and retry properties are asserted with the server's own
//! hit counters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use http_core::{
    ApiClient, ApiError, ClientConfig, CommonService, HeaderStore, HttpMethod, HttpRequest,
    HttpResponse, MultipartForm, RequestBody, RequestDescription, ReqwestTransport, SessionAuth,
    SessionAuthConfig, Transport, TransportError,
};
use mock_server::{AppState, Item};
use serde_json::{json, Value};

async fn start(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mock_server::run_with_state(listener, state));
    format!("http://{addr}")
}

struct Session {
    service: CommonService,
    auth: SessionAuth,
}

fn session(base: &str, transport: Arc<dyn Transport>) -> Session {
    let service = CommonService::new(ClientConfig::new(base), Arc::clone(&transport));
    let config = SessionAuthConfig {
        base_url: Some(base.to_string()),
        ..SessionAuthConfig::default()
    };
    let auth = SessionAuth::builder(transport, service.header_store().clone())
        .with_config(config)
        .build();
    Session { service, auth }
}

fn reqwest_session(base: &str) -> Session {
    session(base, Arc::new(ReqwestTransport::new()))
}

#[tokio::test]
async fn concurrent_callers_share_one_token_fetch() {
    let state = AppState::new(Duration::from_millis(100), true);
    let base = start(state.clone()).await;
    let s = reqwest_session(&base);

    let tokens = futures::future::join_all((0..5).map(|_| s.auth.ensure_token())).await;
    assert_eq!(state.counters().token(), 1);
    assert!(tokens[0].starts_with("Bearer "));
    assert!(tokens.iter().all(|t| t == &tokens[0]));
}

#[tokio::test]
async fn expired_token_is_refreshed_and_request_retried() {
    let state = AppState::default();
    let base = start(state.clone()).await;
    let s = reqwest_session(&base);

    let before = s.auth.ensure_token().await;
    state.expire_tokens().await;

    let service = s.service.clone();
    let items: Vec<Item> = s
        .auth
        .with_session_auth(move || service.call_api(RequestDescription::get("/items")))
        .await
        .unwrap();
    assert!(items.is_empty());
    assert_eq!(state.counters().refresh(), 1);
    assert_eq!(state.counters().protected(), 2);
    assert_ne!(s.service.header_store().value("Authorization"), Some(before));
}

#[tokio::test]
async fn failed_refresh_logs_out_with_original_error() {
    let state = AppState::new(Duration::ZERO, false);
    let base = start(state.clone()).await;
    let s = reqwest_session(&base);

    s.auth.ensure_token().await;
    state.expire_tokens().await;

    let service = s.service.clone();
    let err = s
        .auth
        .with_session_auth(move || service.call_api::<Value>(RequestDescription::get("/items")))
        .await
        .unwrap_err();
    assert!(err.is_unauthorized());
    assert_eq!(err.to_string(), "token expired");
    assert_eq!(state.counters().logout(), 1);
    assert!(s.service.header_store().value("Authorization").is_none());
}

#[tokio::test]
async fn ndjson_items_stream_under_session_auth() {
    let state = AppState::default();
    let base = start(state).await;
    let s = reqwest_session(&base);

    for name in ["alpha", "beta", "gamma"] {
        let service = s.service.clone();
        let req = RequestDescription::post("/items")
            .json_body(&json!({ "name": name }))
            .unwrap();
        s.auth
            .with_session_auth(move || service.call_api::<Item>(req.clone()))
            .await
            .unwrap();
    }

    let service = s.service.clone();
    let mut names: Vec<String> = s
        .auth
        .with_session_auth_stream(move || {
            service.call_api_stream::<Item>(RequestDescription::get("/items/stream"))
        })
        .map(|item| item.unwrap().name)
        .collect()
        .await;
    names.sort();
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn error_bodies_map_to_typed_errors() {
    let base = start(AppState::default()).await;
    let s = reqwest_session(&base);
    s.auth.ensure_token().await;

    let err = s
        .service
        .call_api::<Value>(
            RequestDescription::get("/items/{id}").path_var("id", "00000000-0000-0000-0000-000000000000"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert_eq!(err.to_string(), "item not found");

    let err = s
        .service
        .call_api::<Value>(RequestDescription::get("/legacy-error"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Payload(ref p) if p["resultMessage"] == "legacy failure"));

    let err = s
        .service
        .call_api::<Value>(RequestDescription::get("/text-error"))
        .await
        .unwrap_err();
    let http = err.as_http().unwrap();
    assert_eq!(http.status(), 502);
    assert_eq!(http.data(), Some(&json!("upstream unavailable")));
    assert_eq!(http.message(), "server error (HTTP 502): please try again later");
}

#[tokio::test]
async fn cache_control_requests_go_out_without_authorization() {
    let base = start(AppState::default()).await;
    let s = reqwest_session(&base);
    s.auth.ensure_token().await;

    let echo: Value = s
        .service
        .call_api(RequestDescription::get("/echo").query("tags", vec!["a", "b"]))
        .await
        .unwrap();
    assert!(echo["headers"]["authorization"].is_string());
    assert_eq!(echo["query"], "tags=a&tags=b");

    let echo: Value = s
        .service
        .call_api(RequestDescription::get("/echo").header("Cache-Control", "max-age=60"))
        .await
        .unwrap();
    assert!(echo["headers"].get("authorization").is_none());
    assert_eq!(echo["headers"]["cache-control"], "max-age=60");
}

#[tokio::test]
async fn sse_feed_completes_after_last_event() {
    let base = start(AppState::default()).await;
    let s = reqwest_session(&base);
    let events: Vec<Value> = s.service.sse(RequestDescription::get("/events")).collect().await;
    assert_eq!(events, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
}

#[tokio::test]
async fn upload_returns_raw_response() {
    let base = start(AppState::default()).await;
    let s = reqwest_session(&base);
    let upload = |if_none_match: Option<&str>| http_core::FileUpload {
        url: format!("{base}/upload/report.bin"),
        file: Bytes::from_static(b"aGVsbG8="),
        if_none_match: if_none_match.map(str::to_string),
    };

    let res = s.service.upload_file(upload(Some("*"))).await.unwrap();
    assert_eq!(res.status, 201);
    let res = s.service.upload_file(upload(Some("*"))).await.unwrap();
    assert_eq!(res.status, 412);
}

/// Host-does-IO transport: every request is executed with blocking ureq on
/// the blocking pool.
struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    fn new() -> Self {
        // Status codes are data here; the client interprets them.
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self { agent }
    }
}

fn execute(agent: &ureq::Agent, req: HttpRequest) -> Result<HttpResponse, TransportError> {
    let body: Vec<u8> = match &req.body {
        Some(RequestBody::Text(text)) => text.as_bytes().to_vec(),
        Some(RequestBody::Bytes(bytes)) => bytes.to_vec(),
        Some(RequestBody::Multipart(_)) => {
            return Err(TransportError::new("multipart is not supported by this transport"))
        }
        None => Vec::new(),
    };

    let result = match req.method {
        HttpMethod::Get | HttpMethod::Delete | HttpMethod::Head | HttpMethod::Options => {
            let mut builder = match req.method {
                HttpMethod::Delete => agent.delete(&req.url),
                HttpMethod::Head => agent.head(&req.url),
                HttpMethod::Options => agent.options(&req.url),
                _ => agent.get(&req.url),
            };
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            builder.call()
        }
        HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch => {
            let mut builder = match req.method {
                HttpMethod::Put => agent.put(&req.url),
                HttpMethod::Patch => agent.patch(&req.url),
                _ => agent.post(&req.url),
            };
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            builder.send(&body[..])
        }
    };
    let mut response = result.map_err(|e| TransportError::from_error(&e))?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    let bytes = response
        .body_mut()
        .read_to_vec()
        .map_err(|e| TransportError::from_error(&e))?;
    Ok(HttpResponse::new(status, headers, bytes))
}

#[async_trait]
impl Transport for UreqTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let agent = self.agent.clone();
        tokio::task::spawn_blocking(move || execute(&agent, request))
            .await
            .map_err(|e| TransportError::new(e.to_string()))?
    }
}

#[test]
fn host_driven_transport_round_trip() {
    // Step 1: start mock server on a random port in its own thread.
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();
    let state = AppState::default();
    let server_state = state.clone();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run_with_state(listener, server_state).await
        })
        .unwrap();
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let base = format!("http://{addr}");
        let s = session(&base, Arc::new(UreqTransport::new()));

        // Step 2: the first protected call fetches a token.
        let service = s.service.clone();
        let created: Item = s
            .auth
            .with_session_auth(move || {
                let req = RequestDescription::post("/items")
                    .json_body(&json!({"name": "from host"}))
                    .unwrap();
                service.call_api(req)
            })
            .await
            .unwrap();
        assert_eq!(created.name, "from host");
        assert_eq!(state.counters().token(), 1);

        // Step 3: get it back through a typed path variable.
        let fetched: Item = s
            .service
            .call_api(RequestDescription::get("/items/{id}").path_var("id", created.id.to_string()))
            .await
            .unwrap();
        assert_eq!(fetched.id, created.id);

        // Step 4: logout clears the session.
        s.auth.logout().await.unwrap();
        assert!(s.service.header_store().value("Authorization").is_none());
        let err = s
            .service
            .call_api::<Vec<Item>>(RequestDescription::get("/items"))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    });
}

#[tokio::test]
async fn plain_client_without_store_sends_only_request_headers() {
    let base = start(AppState::default()).await;
    let client = ApiClient::new(ClientConfig::new(&base), Arc::new(ReqwestTransport::new()));
    let echo: Value = client
        .call_api(
            RequestDescription::put("/echo")
                .header("X-Only", "1")
                .json_body(&json!({"b": 1}))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(echo["method"], "PUT");
    assert_eq!(echo["headers"]["x-only"], "1");
    assert_eq!(echo["body"], r#"{"b":1}"#);
    assert!(echo["headers"].get("content-type").is_none());

    let store = HeaderStore::default();
    let with_store = ApiClient::builder(ClientConfig::new(&base), Arc::new(ReqwestTransport::new()))
        .with_header_store(store)
        .build();
    let echo: Value = with_store.call_api(RequestDescription::get("/echo")).await.unwrap();
    assert_eq!(echo["headers"]["content-type"], "application/json");
}

#[tokio::test]
async fn multipart_form_lets_the_transport_pick_the_boundary() {
    let base = start(AppState::default()).await;
    let service = CommonService::new(ClientConfig::new(&base), Arc::new(ReqwestTransport::new()));
    let form = MultipartForm::new().text("title", "report").file(
        "attachment",
        "report.csv",
        Some("text/csv".to_string()),
        Bytes::from_static(b"a,b\n1,2\n"),
    );
    let echo: Value = service
        .call_api(RequestDescription::post("/echo").multipart(form))
        .await
        .unwrap();

    let content_type = echo["headers"]["content-type"].as_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data; boundary="), "{content_type}");
    let body = echo["body"].as_str().unwrap();
    assert!(body.contains(r#"name="title""#));
    assert!(body.contains(r#"filename="report.csv""#));
    assert!(body.to_ascii_lowercase().contains("content-type: text/csv"));
    assert!(body.contains("a,b\n1,2\n"));
}
