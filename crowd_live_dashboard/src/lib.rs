use std::sync::Arc;

use crowd_live::core_modules::reconciler::LiveState;
use crowd_live::{CellDrillDown, ContainerBounds, DensityLevel, LiveError, LiveSession, SessionStatus, VideoSource};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};

pub const DEFAULT_BIND: &str = "127.0.0.1:3001";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl ServerConfig {
    /// Bind address from `CROWD_LIVE_BIND`, or the default.
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("CROWD_LIVE_BIND")
            .ok()
            .filter(|addr| !addr.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        Self { bind_addr }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.to_string(),
        }
    }
}

/// Opens a fresh capture device for every start.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn VideoSource> + Send + Sync>;

/// What `/state` and `/ws/state` send: lifecycle plus render state.
#[derive(Debug, Clone, Serialize)]
pub struct StateView {
    pub status: SessionStatus,
    pub state: LiveState,
    /// Overlay colour class of every cell in the latest grid.
    pub density: Vec<Vec<DensityLevel>>,
}

impl StateView {
    pub fn new(status: SessionStatus, state: LiveState) -> Self {
        let density = state.density_levels();
        Self {
            status,
            state,
            density,
        }
    }
}

/// Pointer position plus the rectangle the frame is drawn into.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CellQuery {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub top: f64,
}

impl CellQuery {
    pub fn bounds(&self) -> ContainerBounds {
        ContainerBounds::new(self.left, self.top, self.width, self.height)
    }
}

/// Shared control surface over one session.
#[derive(Clone)]
pub struct ControlHandle {
    session: Arc<Mutex<LiveSession>>,
    source: SourceFactory,
    state_rx: watch::Receiver<LiveState>,
    status_rx: watch::Receiver<SessionStatus>,
}

impl ControlHandle {
    pub fn new<F>(session: LiveSession, source: F) -> Self
    where
        F: Fn() -> Box<dyn VideoSource> + Send + Sync + 'static,
    {
        Self {
            state_rx: session.subscribe_state(),
            status_rx: session.subscribe_status(),
            session: Arc::new(Mutex::new(session)),
            source: Arc::new(source),
        }
    }

    pub async fn start(&self) -> Result<SessionStatus, LiveError> {
        let mut session = self.session.lock().await;
        session.start((self.source)())?;
        Ok(session.status())
    }

    pub async fn stop(&self) -> SessionStatus {
        let mut session = self.session.lock().await;
        session.stop().await;
        session.status()
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn view(&self) -> StateView {
        StateView::new(self.status(), self.state_rx.borrow().clone())
    }

    pub fn resolve_cell(&self, query: CellQuery) -> Option<CellDrillDown> {
        self.state_rx
            .borrow()
            .resolve_cell(query.x, query.y, query.bounds())
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LiveState> {
        self.state_rx.clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }
}

#[cfg(feature = "web")]
mod web {
    use super::*;
    use axum::Router;
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::response::{Html, IntoResponse, Json, Response};
    use axum::routing::{get, post};
    use futures_util::{SinkExt, StreamExt};
    use tracing::{debug, info, warn};

    const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Crowd Live</title></head>
<body style="font-family:sans-serif">
  <h2>Crowd Live</h2>
  <div style="margin:8px 0; display:flex; gap:12px; align-items:center;">
    <button id="btn-start">Start</button>
    <button id="btn-stop">Stop</button>
    <span id="status" style="font-family:monospace; color:#777">idle</span>
  </div>
  <div style="display:flex; gap:16px;">
    <img id="frame" width="640" height="480" style="border:1px solid #444; background:#111">
    <div>
      <div>People: <b id="count">0</b></div>
      <div>Prediction: <span id="prediction">-</span></div>
      <ul id="alerts"></ul>
      <pre id="cell"></pre>
    </div>
  </div>
  <script>
  (function(){
    const $ = (id)=>document.getElementById(id);
    $('btn-start').onclick = ()=> fetch('/control/start', {method:'POST'});
    $('btn-stop').onclick = ()=> fetch('/control/stop', {method:'POST'});
    const img = $('frame');
    img.onclick = (ev)=>{
      const r = img.getBoundingClientRect();
      const q = new URLSearchParams({x:ev.clientX, y:ev.clientY, left:r.left, top:r.top, width:r.width, height:r.height});
      fetch('/cell?'+q).then(res=> res.ok ? res.json() : null).then(cell=>{
        $('cell').textContent = cell ? cell.zone+' '+JSON.stringify(cell.history) : 'no grid yet';
      });
    };
    const ws = new WebSocket((location.protocol==='https:'?'wss://':'ws://')+location.host+'/ws/state');
    ws.onmessage = (ev)=>{
      const view = JSON.parse(ev.data);
      const s = view.status;
      $('status').textContent = s.state + (s.error_message ? ' - '+s.error_message : '');
      $('count').textContent = view.state.current_count;
      const p = view.state.prediction;
      $('prediction').textContent = p ? p.expected_risk_level+' in '+p.horizon_label : '-';
      if (view.state.processed_frame) {
        const f = view.state.processed_frame;
        img.src = f.startsWith('data:') ? f : 'data:image/jpeg;base64,'+f;
      }
      const alerts = $('alerts');
      alerts.replaceChildren();
      for (const a of view.state.alerts) {
        const li = document.createElement('li');
        li.textContent = a.type+': '+a.message;
        alerts.appendChild(li);
      }
    };
  })();
  </script>
</body>
</html>"#;

    #[derive(Serialize)]
    struct ErrorBody {
        error: String,
    }

    pub fn router(control: ControlHandle) -> Router {
        Router::new()
            .route("/", get(|| async { Html(INDEX_HTML) }))
            .route("/healthz", get(|| async { "ok" }))
            .route("/state", get(state))
            .route("/cell", get(cell))
            .route("/control/start", post(start))
            .route("/control/stop", post(stop))
            .route("/ws/state", get(ws_state))
            .with_state(control)
    }

    async fn state(State(control): State<ControlHandle>) -> Json<StateView> {
        Json(control.view())
    }

    async fn cell(State(control): State<ControlHandle>, Query(query): Query<CellQuery>) -> Response {
        match control.resolve_cell(query) {
            Some(drill) => Json(drill).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "no grid cell at that position".to_string(),
                }),
            )
                .into_response(),
        }
    }

    async fn start(State(control): State<ControlHandle>) -> Response {
        match control.start().await {
            Ok(status) => (StatusCode::ACCEPTED, Json(status)).into_response(),
            Err(err) => {
                warn!(error = %err, "start rejected");
                (StatusCode::CONFLICT, Json(ErrorBody { error: err.to_string() })).into_response()
            }
        }
    }

    async fn stop(State(control): State<ControlHandle>) -> Json<SessionStatus> {
        Json(control.stop().await)
    }

    async fn ws_state(ws: WebSocketUpgrade, State(control): State<ControlHandle>) -> impl IntoResponse {
        ws.on_upgrade(move |socket| push_state(socket, control))
    }

    // Sends the full view on connect and again after every change.
    async fn push_state(socket: WebSocket, control: ControlHandle) {
        let (mut tx, mut rx) = socket.split();
        let mut state_rx = control.subscribe_state();
        let mut status_rx = control.subscribe_status();
        debug!("state subscriber connected");

        loop {
            let view = StateView::new(
                status_rx.borrow_and_update().clone(),
                state_rx.borrow_and_update().clone(),
            );
            let Ok(text) = serde_json::to_string(&view) else { break };
            if tx.send(Message::Text(text)).await.is_err() {
                break;
            }

            tokio::select! {
                changed = state_rx.changed() => if changed.is_err() { break },
                changed = status_rx.changed() => if changed.is_err() { break },
                incoming = rx.next() => match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        debug!("state subscriber disconnected");
    }

    pub async fn start_server(cfg: ServerConfig, control: ControlHandle) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
        info!(addr = %cfg.bind_addr, "dashboard listening on http://{}", cfg.bind_addr);
        let app = router(control);
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                warn!(error = %err, "dashboard server stopped");
            }
        });
        Ok(server)
    }
}

#[cfg(feature = "web")]
pub use web::{router, start_server};

#[cfg(not(feature = "web"))]
pub async fn start_server(_cfg: ServerConfig, _control: ControlHandle) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    Err(anyhow::anyhow!("web feature not enabled for crowd_live_dashboard"))
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use crowd_live::{Connector, SessionConfig, SyntheticSource, TransportChannel, Url};
    use futures_util::FutureExt;
    use futures_util::future::BoxFuture;
    use serde_json::Value;
    use tower::ServiceExt;

    struct Unreachable;

    impl Connector for Unreachable {
        fn connect(&self, _endpoint: &Url) -> BoxFuture<'static, crowd_live::Result<TransportChannel>> {
            futures_util::future::pending().boxed()
        }
    }

    fn control() -> ControlHandle {
        let session = LiveSession::with_connector(SessionConfig::default(), Unreachable);
        ControlHandle::new(session, || Box::new(SyntheticSource::new(16, 16)))
    }

    async fn call(control: &ControlHandle, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router(control.clone())
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let response = router(control())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn state_starts_idle_and_empty() {
        let (status, json) = call(&control(), "GET", "/state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"]["state"], "idle");
        assert_eq!(json["state"]["current_count"], 0);
        assert_eq!(json["state"]["alerts"], Value::Array(Vec::new()));
        assert!(json["state"].get("cell_history").is_none());
    }

    #[tokio::test]
    async fn start_then_stop_walks_the_lifecycle() {
        let control = control();
        let (status, json) = call(&control, "POST", "/control/start").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["state"], "connecting");

        let (status, json) = call(&control, "POST", "/control/start").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("connecting"));

        let (status, json) = call(&control, "POST", "/control/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "idle");

        let (_, json) = call(&control, "POST", "/control/stop").await;
        assert_eq!(json["state"], "idle");
    }

    #[tokio::test]
    async fn cell_without_a_grid_is_not_found() {
        let (status, json) = call(&control(), "GET", "/cell?x=10&y=10&width=400&height=400").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn cell_requires_a_complete_query() {
        let (status, _) = call(&control(), "GET", "/cell?x=10").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn index_serves_the_dashboard_page() {
        let response = router(control())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("/ws/state"));
    }

    #[tokio::test]
    async fn alert_text_is_never_parsed_as_markup() {
        let response = router(control())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8_lossy(&body);
        assert!(!page.contains("innerHTML"));
        assert!(page.contains("li.textContent = a.type+': '+a.message;"));
    }
}
