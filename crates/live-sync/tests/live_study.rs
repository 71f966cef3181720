use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{
    Path, State,
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

use live_sync::error::ApiError;
use live_sync::frames::{Canvas, MemoryCanvas};
use live_sync::poll::{ReqwestStudyBackend, StudyBackend};
use live_sync::{StudyHub, StudyPhase, SyncConfig};

const STUDY: &str = "st-live";

struct ServerState {
    study_status: Mutex<String>,
    sessions: Mutex<Vec<Value>>,
    subscribes: Mutex<Vec<String>>,
    push: broadcast::Sender<String>,
    frames: Vec<Vec<u8>>,
}

impl ServerState {
    fn new(frames: Vec<Vec<u8>>) -> Arc<Self> {
        let (push, _) = broadcast::channel(64);
        Arc::new(Self {
            study_status: Mutex::new("running".into()),
            sessions: Mutex::new(Vec::new()),
            subscribes: Mutex::new(Vec::new()),
            push,
            frames,
        })
    }

    fn push(&self, message: Value) {
        let _ = self.push.send(message.to_string());
    }
}

fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/studies/:id", get(get_study))
        .route("/api/studies/:id/sessions", get(get_sessions))
        .route("/api/studies/:id/live-state", get(get_live_state))
        .route("/ws", get(push_handler))
        .route("/ws/screencast/:session", get(frames_handler))
        .with_state(state)
}

async fn get_study(
    Path(id): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    if id != STUDY {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "no such study"})));
    }
    let status = state.study_status.lock().clone();
    let score = (status == "complete").then_some(82.5);
    (
        StatusCode::OK,
        Json(json!({"id": id, "status": status, "max_steps": 10, "score": score})),
    )
}

async fn get_sessions(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({ "sessions": state.sessions.lock().clone() }))
}

async fn get_live_state() -> impl IntoResponse {
    Json(json!({ "sessions": {} }))
}

async fn push_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_socket(socket, state))
}

async fn push_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();
    let mut outbound = state.push.subscribe();
    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                    if value["type"] == "subscribe" {
                        if let Some(study_id) = value["study_id"].as_str() {
                            state.subscribes.lock().push(study_id.to_string());
                        }
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            message = outbound.recv() => match message {
                Ok(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

async fn frames_handler(
    ws: WebSocketUpgrade,
    Path(_session): Path<String>,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| frames_socket(socket, state))
}

async fn frames_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    let _ = socket.send(WsMessage::Text("hello".into())).await;
    for frame in &state.frames {
        if socket.send(WsMessage::Binary(frame.clone())).await.is_err() {
            return;
        }
    }
    while let Some(Ok(message)) = socket.recv().await {
        if matches!(message, WsMessage::Close(_)) {
            break;
        }
    }
}

async fn start_server(state: Arc<ServerState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, build_router(state))
            .await
            .expect("serve");
    });
    addr
}

fn config_for(addr: SocketAddr) -> SyncConfig {
    SyncConfig {
        api_base_url: format!("http://{addr}/api/"),
        push_url: format!("ws://{addr}/ws"),
        frames_url: format!("ws://{addr}/ws/screencast"),
        poll_interval: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([10, 120, 200]));
    let mut bytes = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut bytes, image::ImageOutputFormat::Png)
        .expect("encode png");
    bytes.into_inner()
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn hub_follows_a_study_over_websocket_and_rest() {
    let state = ServerState::new(Vec::new());
    state.sessions.lock().push(json!({
        "id": "s-1",
        "persona_name": "Careful Carl",
        "status": "running",
        "current_step": 1,
        "emotional_state": "calm"
    }));
    let addr = start_server(Arc::clone(&state)).await;
    let hub = StudyHub::from_config(&config_for(addr), None).expect("hub");
    let watch = hub.attach(STUDY);

    wait_until("subscribe", || state.subscribes.lock().contains(&STUDY.to_string())).await;
    wait_until("hydration", || watch.store().session("s-1").is_some()).await;
    let hydrated = watch.store().session("s-1").expect("session");
    assert_eq!(hydrated.persona_name.as_deref(), Some("Careful Carl"));
    assert_eq!(hydrated.emotional_state.as_deref(), Some("calm"));

    state.push(json!({
        "type": "session:step",
        "study_id": STUDY,
        "session_id": "s-1",
        "step_number": 4,
        "think_aloud": "the pricing page is hidden in the footer",
        "emotional_state": "frustrated",
        "action": "click Pricing"
    }));
    wait_until("pushed step", || {
        watch.store().session("s-1").is_some_and(|s| s.step_number == 4)
    })
    .await;
    // the polled list still says step 1 and calm; push wins
    sleep(Duration::from_millis(450)).await;
    let session = watch.store().session("s-1").expect("session");
    assert_eq!(session.step_number, 4);
    assert_eq!(session.emotional_state.as_deref(), Some("frustrated"));
    assert_eq!(watch.store().timeline("s-1").map(|t| t.len()), Some(1));

    *state.study_status.lock() = "complete".into();
    wait_until("completion", || watch.store().phase() == StudyPhase::Complete).await;
    let view = watch.view();
    assert_eq!(view.percent, 100);
    assert_eq!(view.score, Some(82.5));
}

#[tokio::test]
async fn screencast_frames_reach_the_canvas() {
    let state = ServerState::new(vec![png(8, 6), b"not an image".to_vec(), png(8, 6)]);
    let addr = start_server(Arc::clone(&state)).await;
    let canvas = MemoryCanvas::new();
    let factory = {
        let canvas = canvas.clone();
        Arc::new(move |_: &str| Box::new(canvas.clone()) as Box<dyn Canvas>)
    };
    let hub = StudyHub::from_config(&config_for(addr), Some(factory)).expect("hub");
    let watch = hub.attach(STUDY);
    wait_until("subscribe", || !state.subscribes.lock().is_empty()).await;

    state.push(json!({
        "type": "session:live_view",
        "study_id": STUDY,
        "session_id": "s-9",
        "live_view_url": "https://live.test/s-9",
        "screencast": true
    }));
    wait_until("two frames", || canvas.presented() == 2).await;
    let frames = hub.frames().expect("pipeline");
    let status = frames.state("s-9").expect("frame state");
    assert_eq!(status.frame_count, 2);
    assert_eq!(status.dropped_frames, 1);
    assert_eq!(canvas.frame().map(|f| (f.width, f.height)), Some((8, 6)));

    drop(watch);
    wait_until("pipeline stopped", || !frames.is_enabled("s-9")).await;
    assert!(canvas.frame().is_none());
}

#[tokio::test]
async fn rest_backend_reports_http_failures() {
    let state = ServerState::new(Vec::new());
    let addr = start_server(state).await;
    let backend = ReqwestStudyBackend::from_config(&config_for(addr)).expect("backend");

    let study = backend.fetch_study(STUDY).await.expect("study");
    assert_eq!(study.max_steps, Some(10));
    let sessions = backend.fetch_sessions(STUDY).await.expect("sessions");
    assert!(sessions.is_empty());
    let live: HashMap<_, _> = backend.fetch_live_state(STUDY).await.expect("live").sessions;
    assert!(live.is_empty());

    match backend.fetch_study("missing").await {
        Err(ApiError::HttpStatus(status)) => assert_eq!(status.as_u16(), 404),
        other => panic!("expected 404, got {other:?}"),
    }
}
