use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use servicebot_backend::core::config::{AppPaths, AppSettings, ConfigService, KnowledgeBackend};
use servicebot_backend::core::errors::ApiError;
use servicebot_backend::llm::{
    ChatRequest, EmbeddingGateway, FragmentStream, Gateways, GenerationGateway, ProviderModel,
};
use servicebot_backend::server::router::router;
use servicebot_backend::state::AppState;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, PartialEq)]
enum Upstream {
    /// Thinks, then answers in three pieces.
    Answers,
    /// Refuses every generation call.
    Down,
    /// Streams until the request is dropped.
    Endless,
}

struct FakeModelServer {
    upstream: Upstream,
    prompts: Mutex<Vec<ChatRequest>>,
}

#[async_trait]
impl EmbeddingGateway for FakeModelServer {
    fn model(&self) -> &str {
        "fake-embed"
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        Ok(inputs
            .iter()
            .map(|text| {
                let refund = text.to_lowercase().matches("refund").count() as f32;
                vec![refund, 0.01]
            })
            .collect())
    }
}

#[async_trait]
impl GenerationGateway for FakeModelServer {
    fn name(&self) -> &str {
        "fake"
    }

    fn model(&self) -> &str {
        "fake-chat"
    }

    async fn health_check(&self) -> Result<bool, ApiError> {
        Ok(self.upstream != Upstream::Down)
    }

    async fn list_models(&self) -> Result<Vec<ProviderModel>, ApiError> {
        Ok(vec![ProviderModel {
            id: "fake-chat".into(),
            name: "Fake Chat".into(),
        }])
    }

    async fn chat(&self, request: ChatRequest) -> Result<String, ApiError> {
        self.prompts.lock().unwrap().push(request);
        match self.upstream {
            Upstream::Down => Err(ApiError::GenerationUnavailable("connection refused".into())),
            _ => Ok("```rust\nfn do_work() {}\n```\nExplanation: renamed.".to_string()),
        }
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<FragmentStream, ApiError> {
        self.prompts.lock().unwrap().push(request);
        let upstream = self.upstream;
        if upstream == Upstream::Down {
            return Err(ApiError::GenerationUnavailable("connection refused".into()));
        }
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            if upstream == Upstream::Endless {
                loop {
                    if tx.send(Ok("tick ".to_string())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            for piece in ["<think>look up policy</think>", "Refunds are ", "accepted within ", "30 days."] {
                if tx.send(Ok(piece.to_string())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

struct TestApp {
    addr: SocketAddr,
    state: Arc<AppState>,
    server: Arc<FakeModelServer>,
    http: reqwest::Client,
    _dir: tempfile::TempDir,
}

impl TestApp {
    async fn spawn(upstream: Upstream) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(AppPaths::with_data_dir(
            dir.path().to_path_buf(),
            dir.path().join("data"),
        ));
        let config = ConfigService::new(paths.clone());
        let mut settings = AppSettings::default();
        settings.knowledge.backend = KnowledgeBackend::Memory;

        let server = Arc::new(FakeModelServer {
            upstream,
            prompts: Mutex::new(Vec::new()),
        });
        let gateways = Gateways {
            generation: server.clone(),
            embedding: server.clone(),
        };
        let state = AppState::build(paths, config, settings, gateways)
            .await
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            addr,
            state,
            server,
            http: reqwest::Client::new(),
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.http.post(self.url(path)).json(&body).send().await.unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http.get(self.url(path)).send().await.unwrap()
    }

    async fn socket(&self) -> Socket {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
            .await
            .unwrap();
        socket
    }
}

/// Data frames of an SSE body, in order.
fn sse_frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn kinds(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .unwrap();
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::text(frame.to_string())).await.unwrap();
}

#[tokio::test]
async fn sse_chat_ends_with_exactly_one_done_frame() {
    let app = TestApp::spawn(Upstream::Answers).await;

    let response = app.post("/api/chat", json!({"message": "How do refunds work?"})).await;
    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let frames = sse_frames(&response.text().await.unwrap());
    let types = kinds(&frames);
    assert_eq!(types.first(), Some(&"reasoning"));
    assert_eq!(types.last(), Some(&"done"));
    assert_eq!(types.iter().filter(|t| **t == "done" || **t == "error").count(), 1);

    let streamed: String = frames
        .iter()
        .filter(|f| f["type"] == "chunk")
        .map(|f| f["content"].as_str().unwrap())
        .collect();
    assert_eq!(streamed, "Refunds are accepted within 30 days.");
    assert_eq!(frames.last().unwrap()["full_response"], streamed);
}

#[tokio::test]
async fn sse_chat_surfaces_upstream_failure_as_final_error_frame() {
    let app = TestApp::spawn(Upstream::Down).await;

    let response = app.post("/api/chat", json!({"message": "hello"})).await;
    assert_eq!(response.status(), 200);

    let frames = sse_frames(&response.text().await.unwrap());
    assert_eq!(kinds(&frames), vec!["error"]);
    assert_eq!(frames[0]["code"], "generation_unavailable");
}

#[tokio::test]
async fn invalid_chat_requests_fail_before_streaming() {
    let app = TestApp::spawn(Upstream::Answers).await;

    let empty = app.post("/api/chat", json!({"message": "   "})).await;
    assert_eq!(empty.status(), 400);
    assert_eq!(empty.json::<Value>().await.unwrap()["code"], "invalid_input");

    let unknown_session = app
        .post("/api/chat", json!({"message": "hi", "session_id": "nope"}))
        .await;
    assert_eq!(unknown_session.status(), 404);
    assert_eq!(
        unknown_session.json::<Value>().await.unwrap()["code"],
        "session_not_found"
    );
}

#[tokio::test]
async fn bot_chat_without_streaming_returns_the_answer() {
    let app = TestApp::spawn(Upstream::Answers).await;

    let created = app.post("/api/bots", json!({"name": "Helper"})).await;
    assert_eq!(created.status(), 201);
    let bot: Value = created.json().await.unwrap();
    let bot_id = bot["id"].as_str().unwrap();

    let response = app
        .post(
            &format!("/api/bots/{bot_id}/chat"),
            json!({"message": "refund?", "stream": false}),
        )
        .await;
    assert_eq!(response.status(), 200);
    let answer: Value = response.json().await.unwrap();
    assert_eq!(answer["response"], "Refunds are accepted within 30 days.");
    assert!(answer["relevant_docs"].is_array());

    let missing = app
        .post("/api/bots/ghost/chat", json!({"message": "hi", "stream": false}))
        .await;
    assert_eq!(missing.status(), 404);
    assert_eq!(missing.json::<Value>().await.unwrap()["code"], "bot_not_found");
}

#[tokio::test]
async fn knowledge_routes_map_errors_to_status_codes() {
    let app = TestApp::spawn(Upstream::Answers).await;

    let created = app
        .post(
            "/api/knowledge",
            json!({"title": "Refunds", "content": "Refund within 30 days.", "tags": ["policy"]}),
        )
        .await;
    assert_eq!(created.status(), 201);
    let item: Value = created.json().await.unwrap();
    let id = item["id"].as_str().unwrap().to_string();

    assert_eq!(app.get(&format!("/api/knowledge/{id}")).await.status(), 200);

    let invalid = app
        .post("/api/knowledge", json!({"title": "", "content": "x"}))
        .await;
    assert_eq!(invalid.status(), 400);

    let results: Value = app
        .post("/api/knowledge/search", json!({"query": "refund", "top_k": 3}))
        .await
        .json()
        .await
        .unwrap();
    let results = results.as_array().expect("search returns an array");
    assert_eq!(results[0]["id"], id.as_str());

    let deleted = app
        .http
        .delete(app.url(&format!("/api/knowledge/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);

    let gone = app.get(&format!("/api/knowledge/{id}")).await;
    assert_eq!(gone.status(), 404);
    assert_eq!(gone.json::<Value>().await.unwrap()["code"], "item_not_found");
}

#[tokio::test]
async fn stored_coding_rule_is_searchable_applicable_and_usable_in_chat() {
    let app = TestApp::spawn(Upstream::Answers).await;

    let created = app
        .post(
            "/api/coding-rules",
            json!({
                "title": "Snake case",
                "language": "Rust",
                "content": "Functions use snake_case names.",
                "category": "style"
            }),
        )
        .await;
    assert_eq!(created.status(), 201);
    let rule: Value = created.json().await.unwrap();
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let hits: Value = app
        .post("/api/coding-rules/search", json!({"query": "SNAKE"}))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 1);

    let languages: Value = app.get("/api/coding-rules/languages").await.json().await.unwrap();
    assert_eq!(languages["languages"], json!(["Rust"]));

    let applied: Value = app
        .post(
            "/api/coding-rules/apply",
            json!({"rule_id": rule_id, "text": "fn doWork() {}"}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(applied["improved_code"], "fn do_work() {}");
    assert_eq!(applied["rule_applied"]["id"], rule_id.as_str());

    let response = app
        .post(
            "/api/chat",
            json!({"message": "Review my code", "style_rule_id": rule_id}),
        )
        .await;
    let frames = sse_frames(&response.text().await.unwrap());
    assert_eq!(kinds(&frames).last(), Some(&"done"));
    let prompts = app.server.prompts.lock().unwrap();
    let system = &prompts.last().unwrap().messages[0].content;
    assert!(system.contains("Functions use snake_case names."));
    drop(prompts);

    let missing = app.get("/api/coding-rules/ghost").await;
    assert_eq!(missing.status(), 404);
    assert_eq!(missing.json::<Value>().await.unwrap()["code"], "rule_not_found");
}

#[tokio::test]
async fn health_lists_available_models() {
    let app = TestApp::spawn(Upstream::Answers).await;

    let health: Value = app.get("/api/health").await.json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["available_models"][0]["id"], "fake-chat");

    let down = TestApp::spawn(Upstream::Down).await;
    let health: Value = down.get("/api/health").await.json().await.unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["available_models"], json!([]));
}

#[tokio::test]
async fn ws_set_session_replays_history_and_greets_new_sessions() {
    let app = TestApp::spawn(Upstream::Answers).await;
    let mut socket = app.socket().await;

    send(&mut socket, json!({"type": "set_session"})).await;
    let changed = next_frame(&mut socket).await;
    assert_eq!(changed["type"], "session_changed");
    let session_id = changed["session_id"].as_str().unwrap().to_string();

    let history = next_frame(&mut socket).await;
    assert_eq!(history["type"], "history");
    assert_eq!(history["messages"], json!([]));
    assert_eq!(next_frame(&mut socket).await["type"], "greeting");

    send(&mut socket, json!({"type": "chat", "message": "refund?"})).await;
    loop {
        let frame = next_frame(&mut socket).await;
        if frame["type"] == "done" {
            break;
        }
        assert_ne!(frame["type"], "error");
    }

    // the turn was saved to the session picked above
    let stored = app.state.sessions.get(&session_id).await.unwrap();
    assert_eq!(stored.messages.len(), 2);
}

#[tokio::test]
async fn ws_stop_is_the_last_frame_of_a_turn() {
    let app = TestApp::spawn(Upstream::Endless).await;
    let mut socket = app.socket().await;

    send(&mut socket, json!({"type": "chat", "message": "talk forever"})).await;
    assert_eq!(next_frame(&mut socket).await["type"], "session_changed");
    assert_eq!(next_frame(&mut socket).await["type"], "chunk");

    send(&mut socket, json!({"type": "stop"})).await;
    loop {
        let frame = next_frame(&mut socket).await;
        if frame["type"] == "stopped" {
            break;
        }
        assert_eq!(frame["type"], "chunk");
    }

    let after = tokio::time::timeout(Duration::from_millis(300), socket.next()).await;
    assert!(after.is_err(), "no frame may follow the stop acknowledgement");
}
