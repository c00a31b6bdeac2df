//! Integration tests for the hub client
//!
//! Runs a small in-process hub on a loopback port and drives the client and a
//! full session against it.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::StreamExt;
use homeaffairs::store::StoredToken;
use homeaffairs::{
    AppConfig, ChatError, ChatMessage, ChatTransport, CredentialStore, HubClient, MemoryStore,
    QueryRequest, StreamingChatSession,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct Hub {
    logins: AtomicUsize,
    queries: AtomicUsize,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none")
}

async fn login(State(hub): State<Arc<Hub>>, Json(body): Json<Value>) -> Response {
    if body["password"] != "secret" {
        return (StatusCode::UNAUTHORIZED, "bad credentials").into_response();
    }
    hub.logins.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "data": { "access_token": "fresh" } })).into_response()
}

async fn query(
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    hub.queries.fetch_add(1, Ordering::SeqCst);
    let auth = header_str(&headers, "authorization");
    if auth != "Bearer fresh" && auth != "Bearer dak-test" {
        return (StatusCode::UNAUTHORIZED, "token expired").into_response();
    }
    let tenant = header_str(&headers, "x-tenant-subdomain");
    let message = body["message"].as_str().unwrap_or_default();
    let chunk = json!({ "chunk": format!("[{tenant}] {message}") });
    let sse = format!(
        "event: start\ndata: {{\"conversation_id\":\"hub-conv\"}}\n\n\
         event: answer_chunk\ndata: {chunk}\n\n\
         event: sources\ndata: {{\"sources\":[{{\"source_url\":\"https://www.hyab.gov.hk/en/\",\"document_title\":\"HYAB\"}}]}}\n\n\
         event: done\ndata: {{\"ok\":true}}\n\n"
    );
    ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
}

async fn pointer() -> Json<Value> {
    Json(json!({ "stream_url": "/streams/abc" }))
}

async fn stream_by_id(Path(id): Path<String>) -> Response {
    let sse = format!("data: {{\"chunk\":\"from stream {id}\"}}\n\n");
    ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response()
}

async fn broken() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

async fn session() -> Json<Value> {
    Json(json!({ "session_id": "s-1" }))
}

async fn spawn_hub() -> (SocketAddr, Arc<Hub>) {
    let hub = Arc::new(Hub::default());
    let app = Router::new()
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/developer/agent/query/stream", post(query))
        .route("/pointer", post(pointer))
        .route("/streams/{id}", get(stream_by_id))
        .route("/broken", post(broken))
        .route("/sessions", post(session))
        .with_state(hub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hub)
}

fn config(addr: SocketAddr, vars: &[(&str, &str)]) -> AppConfig {
    let mut env: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.insert("HA_API_BASE_URL".into(), format!("http://{addr}"));
    AppConfig::from_lookup(|key| env.get(key).cloned()).unwrap()
}

fn login_config(addr: SocketAddr) -> AppConfig {
    config(
        addr,
        &[
            ("HA_API_EMAIL", "officer@had.gov.hk"),
            ("HA_API_PASSWORD", "secret"),
            ("HA_TENANT_SUBDOMAIN", "homeaffairshk"),
        ],
    )
}

async fn read_all(client: &HubClient, request: &QueryRequest) -> String {
    let Ok(mut stream) = client.open_stream(request).await else {
        panic!("stream did not open");
    };
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    String::from_utf8(body).unwrap()
}

fn question(text: &str) -> QueryRequest {
    QueryRequest {
        message: text.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn login_caches_token_from_nested_response() {
    let (addr, hub) = spawn_hub().await;
    let store = Arc::new(MemoryStore::new());
    let client = HubClient::new(login_config(addr), store.clone());

    assert_eq!(client.login().await.unwrap(), "fresh");
    assert_eq!(store.token().map(|t| t.token).as_deref(), Some("fresh"));

    let body = read_all(&client, &question("hello")).await;
    assert!(body.contains("[homeaffairshk] hello"));
    assert_eq!(hub.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_token_triggers_exactly_one_relogin() {
    let (addr, hub) = spawn_hub().await;
    let store = Arc::new(MemoryStore::new());
    store
        .save_token(&StoredToken::new("stale", time::Duration::days(1)))
        .unwrap();
    let client = HubClient::new(login_config(addr), store.clone());

    let body = read_all(&client, &question("fees")).await;

    assert!(body.contains("fees"));
    assert_eq!(hub.logins.load(Ordering::SeqCst), 1);
    assert_eq!(hub.queries.load(Ordering::SeqCst), 2);
    assert_eq!(store.token().map(|t| t.token).as_deref(), Some("fresh"));
}

#[tokio::test]
async fn wrong_password_is_an_auth_error() {
    let (addr, _hub) = spawn_hub().await;
    let config = config(
        addr,
        &[
            ("HA_API_EMAIL", "officer@had.gov.hk"),
            ("HA_API_PASSWORD", "wrong"),
        ],
    );
    let client = HubClient::new(config, Arc::new(MemoryStore::new()));

    let err = client.login().await.unwrap_err();
    assert!(matches!(err, ChatError::Auth(ref reason) if reason.contains("bad credentials")));
}

#[tokio::test]
async fn json_pointer_is_followed_to_the_stream() {
    let (addr, _hub) = spawn_hub().await;
    let config = config(
        addr,
        &[("HA_API_KEY", "dak-test"), ("HA_QUERY_PATH", "/pointer")],
    );
    let client = HubClient::new(config, Arc::new(MemoryStore::new()));

    let body = read_all(&client, &question("q")).await;
    assert_eq!(body, "data: {\"chunk\":\"from stream abc\"}\n\n");
}

#[tokio::test]
async fn error_status_carries_body() {
    let (addr, _hub) = spawn_hub().await;
    let config = config(
        addr,
        &[("HA_API_KEY", "dak-test"), ("HA_QUERY_PATH", "/broken")],
    );
    let client = HubClient::new(config, Arc::new(MemoryStore::new()));

    let Err(err) = client.open_stream(&question("q")).await else {
        panic!("expected the hub to fail");
    };
    match err {
        ChatError::Http { status, body } => {
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(body, "boom");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn session_endpoint_hands_out_conversation_id() {
    let (addr, _hub) = spawn_hub().await;
    let config = config(
        addr,
        &[("HA_API_KEY", "dak-test"), ("HA_SESSION_PATH", "/sessions")],
    );
    let client = HubClient::new(config, Arc::new(MemoryStore::new()));

    assert_eq!(
        client.start_conversation().await.unwrap().as_deref(),
        Some("s-1")
    );
}

#[tokio::test]
async fn full_turn_against_hub() {
    let (addr, _hub) = spawn_hub().await;
    let mut config = login_config(addr);
    config.system_prompt = String::new();
    let store = Arc::new(MemoryStore::new());
    let client = HubClient::new(config.clone(), store.clone());
    let mut session = StreamingChatSession::new(&config, Box::new(client), store.clone());

    session.send("Where is my district office?", |_| {}).await.unwrap();

    assert_eq!(
        session.transcript(),
        &[
            ChatMessage::user("Where is my district office?"),
            ChatMessage::assistant("[homeaffairshk] Where is my district office?"),
        ]
    );
    let citations = session.citations().unwrap().citations();
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].url, "https://www.hyab.gov.hk/en/");
    assert_eq!(citations[0].title, "HYAB");
    assert_eq!(session.conversation_id(), Some("hub-conv"));
}
