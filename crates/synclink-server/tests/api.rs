//! HTTP and WebSocket surface, driven end to end.

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use synclink_core::topic::{ChatKind, TopicPattern};
use synclink_core::{
    events, BusTransport, DeliverFrom, Envelope, MemoryBus, MemoryBusClient, MemoryStore,
    NewMessage, SessionStore, Subject,
};
use synclink_server::config::TokenEntry;
use synclink_server::{router, AppState, Config};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(5);

struct TestApp {
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    bus: MemoryBus,
    link: MemoryBusClient,
    app: Router,
}

fn token(token: &str, user_id: &str, device_id: &str, admin: bool) -> TokenEntry {
    TokenEntry {
        token: token.into(),
        user_id: user_id.into(),
        device_id: device_id.into(),
        admin,
        expires_at: None,
    }
}

async fn test_app() -> TestApp {
    let mut config = Config::default();
    config.metrics.enabled = false;
    config.bridge.initial_backoff_ms = 20;
    config.bridge.max_backoff_ms = 100;
    config.auth.tokens = vec![
        token("t-alice", "alice", "laptop", false),
        token("t-alice-phone", "alice", "phone", false),
        token("t-bob", "bob", "desktop", false),
        token("t-admin", "ops", "console", true),
    ];

    let bus = MemoryBus::new();
    let link = bus.client();
    let store = Arc::new(MemoryStore::new());
    let validator = Arc::new(config.token_validator());
    let state = Arc::new(AppState::new(
        config,
        Arc::new(link.clone()),
        store.clone(),
        validator,
    ));
    timeout(WAIT, state.bridge().wait_connected()).await.unwrap();

    TestApp {
        app: router(Arc::clone(&state)),
        state,
        store,
        bus,
        link,
    }
}

fn request(method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

#[tokio::test]
async fn health_reports_bridge_state() {
    let test = test_app().await;
    let (status, body) = send(&test.app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bridge"], "connected");
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn requests_without_valid_token_are_rejected() {
    let test = test_app().await;
    let body = json!({"device_type": "desktop", "client_version": "1.0"});

    let (status, error) = send(
        &test.app,
        request(Method::POST, "/api/heartbeat", None, Some(body.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(error["error"], "unauthenticated");
    assert_eq!(error["retryable"], false);

    let (status, _) = send(
        &test.app,
        request(Method::POST, "/api/heartbeat", Some("forged"), Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn heartbeat_drives_presence_views() {
    let test = test_app().await;
    let (status, body) = send(
        &test.app,
        request(
            Method::POST,
            "/api/heartbeat",
            Some("t-alice"),
            Some(json!({"device_type": "desktop", "client_version": "2.1.0"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "ok");
    assert!(body["server_time"].as_u64().unwrap() > 0);

    let (_, own) = send(
        &test.app,
        request(Method::GET, "/api/presence", Some("t-alice"), None),
    )
    .await;
    assert_eq!(own["devices"][0]["device_id"], "laptop");
    assert_eq!(own["devices"][0]["status"], "online");
    assert_eq!(own["devices"][0]["client_version"], "2.1.0");

    let (_, other) = send(
        &test.app,
        request(Method::GET, "/api/presence/alice", Some("t-bob"), None),
    )
    .await;
    assert_eq!(other["user_id"], "alice");
    assert_eq!(other["online"], true);

    let (_, nobody) = send(
        &test.app,
        request(Method::GET, "/api/presence/carol", Some("t-bob"), None),
    )
    .await;
    assert_eq!(nobody["online"], false);

    let (_, stats) = send(
        &test.app,
        request(Method::GET, "/api/presence/stats", Some("t-bob"), None),
    )
    .await;
    assert_eq!(stats["online"], 1);
    assert_eq!(stats["active_today"], 1);
}

#[tokio::test]
async fn sync_endpoint_pages_the_callers_data() {
    let test = test_app().await;
    let session = test.store.create_session("alice", "notes").await;
    let first = test
        .store
        .create_message(NewMessage {
            session_id: session.id.clone(),
            user_id: "alice".into(),
            parent_id: None,
            role: "user".into(),
            content: "one".into(),
        })
        .await
        .unwrap();
    test.store
        .create_message(NewMessage {
            session_id: session.id.clone(),
            user_id: "alice".into(),
            parent_id: Some(first.id),
            role: "assistant".into(),
            content: "two".into(),
        })
        .await
        .unwrap();

    let (status, body) = send(
        &test.app,
        request(
            Method::POST,
            "/api/sync",
            Some("t-alice-phone"),
            Some(json!({"user_id": "alice", "device_id": "phone", "last_sync_time": null, "last_msg_id": first.id})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    assert_eq!(body["messages"][0]["content"], "two");
    assert_eq!(body["has_more"], false);
    assert_eq!(body["sessions"][0]["id"], session.id);

    let (_, bob) = send(
        &test.app,
        request(Method::POST, "/api/sync", Some("t-bob"), Some(json!({}))),
    )
    .await;
    assert!(bob["messages"].as_array().unwrap().is_empty());

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/api/sync",
            Some("t-bob"),
            Some(json!({"user_id": "alice"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    test.store.set_failing(true);
    let (status, error) = send(
        &test.app,
        request(Method::POST, "/api/sync", Some("t-alice"), Some(json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(error["retryable"], true);
}

#[tokio::test]
async fn created_message_is_stored_and_published_durably() {
    let test = test_app().await;
    let session = test.store.create_session("alice", "plans").await;

    let observer = test.bus.client();
    observer.connect().await.unwrap();
    let mut observed = observer
        .subscribe(
            TopicPattern::chat_all("alice").unwrap().as_str(),
            None,
            DeliverFrom::New,
        )
        .await
        .unwrap();

    let uri = format!("/api/sessions/{}/messages", session.id);
    let (status, created) = send(
        &test.app,
        request(
            Method::POST,
            &uri,
            Some("t-alice"),
            Some(json!({"content": "book flights"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["content"], "book flights");
    assert_eq!(created["role"], "user");

    let raw = timeout(WAIT, observed.receiver.recv()).await.unwrap().unwrap();
    assert_eq!(raw.subject, format!("chat.alice.{}.msg", session.id));
    assert!(raw.sequence.is_some());
    let envelope = Envelope::from_slice(&raw.payload).unwrap();
    assert_eq!(envelope.kind, events::MESSAGE_CREATED);
    assert_eq!(envelope.device_id.as_deref(), Some("laptop"));
    assert_eq!(envelope.payload["id"], created["id"]);

    let stored = test.store.sessions_for_user("alice").await.unwrap();
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn message_creation_errors_map_to_status_codes() {
    let test = test_app().await;
    let session = test.store.create_session("alice", "s").await;
    let body = json!({"content": "x"});

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/api/sessions/missing/messages",
            Some("t-alice"),
            Some(body.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            &format!("/api/sessions/{}/messages", session.id),
            Some("t-bob"),
            Some(body.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/api/sessions/a.b/messages",
            Some("t-alice"),
            Some(body.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    test.link.drop_link();
    let mut state = test.state.bridge().subscribe_state();
    timeout(WAIT, state.wait_for(|state| state.as_str() != "connected"))
        .await
        .unwrap()
        .unwrap();

    let (status, error) = send(
        &test.app,
        request(
            Method::POST,
            &format!("/api/sessions/{}/messages", session.id),
            Some("t-alice"),
            Some(body),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error["error"], "transport_unavailable");
    assert_eq!(error["retryable"], true);
}

#[tokio::test]
async fn broadcast_requires_admin() {
    let test = test_app().await;
    let body = json!({"message": "maintenance at 02:00"});

    let (status, _) = send(
        &test.app,
        request(
            Method::POST,
            "/api/admin/broadcast",
            Some("t-alice"),
            Some(body.clone()),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, accepted) = send(
        &test.app,
        request(Method::POST, "/api/admin/broadcast", Some("t-admin"), Some(body)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["topic"], "admin.broadcast");
}

async fn serve(test: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(&test.state));
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, socket.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn websocket_session_end_to_end() {
    let test = test_app().await;
    let addr = serve(&test).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=t-alice"))
        .await
        .unwrap();

    let connected = next_json(&mut socket).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["user_id"], "alice");
    assert_eq!(connected["device_id"], "laptop");

    socket
        .send(Message::Text(r#"{"type":"ping","timestamp":7}"#.into()))
        .await
        .unwrap();
    let pong = next_json(&mut socket).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["timestamp"], 7);

    socket
        .send(Message::Text(r#"{"type":"subscribe","topic":"chat.bob.s1.msg"}"#.into()))
        .await
        .unwrap();
    let refused = next_json(&mut socket).await;
    assert_eq!(refused["type"], "error");
    assert_eq!(refused["code"], "FORBIDDEN");

    let subject = Subject::chat("alice", "s1", ChatKind::Msg).unwrap();
    let envelope = Envelope::new(events::MESSAGE_CREATED, json!({"content": "from elsewhere"}));
    test.state
        .bridge()
        .publish_durable(&subject, &envelope)
        .await
        .unwrap();

    let push = next_json(&mut socket).await;
    assert_eq!(push["type"], "message_created");
    assert_eq!(push["topic"], "chat.alice.s1.msg");
    assert_eq!(push["data"]["content"], "from elsewhere");

    socket.close(None).await.unwrap();
    timeout(WAIT, async {
        while test.state.hub.lookup("alice", "laptop").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn websocket_upgrade_requires_token() {
    let test = test_app().await;
    let addr = serve(&test).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=forged")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED.as_u16());
        }
        Err(e) => panic!("expected 401, got {e}"),
        Ok(_) => panic!("expected 401, upgrade succeeded"),
    }
    assert_eq!(test.state.hub.stats().connections, 0);
}

#[tokio::test]
async fn websocket_upgrade_rejects_unknown_protocol_major() {
    let test = test_app().await;
    let addr = serve(&test).await;

    let result =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=t-alice&protocol=2.0")).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::BAD_REQUEST.as_u16());
        }
        Err(e) => panic!("expected 400, got {e}"),
        Ok(_) => panic!("expected 400, upgrade succeeded"),
    }
    assert_eq!(test.state.hub.stats().connections, 0);

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=t-alice&protocol=1.3"))
            .await
            .unwrap();
    let connected = next_json(&mut socket).await;
    assert_eq!(connected["type"], "connected");
    assert_eq!(connected["version"], "1.0");
}
