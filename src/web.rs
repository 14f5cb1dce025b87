//! HTTP control surface: a JSON API over [`ClockService`] and one status page.

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::WebConfig;
use crate::dial::DialReading;
use crate::error::ClockError;
use crate::relay::PulseTarget;
use crate::scheduler::PulseEvent;
use crate::service::ClockService;
use crate::status::ClockStatus;

type AppState = Arc<ClockService>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ClockError> for ApiError {
    fn from(err: ClockError) -> Self {
        let status = match err {
            ClockError::StateConflict { .. } => StatusCode::CONFLICT,
            ClockError::InvalidDialReading(_) => StatusCode::BAD_REQUEST,
            ClockError::HardwareFault(_) | ClockError::PersistenceFault(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!("[Web] {} ({})", self.message, self.status);
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct SetDialRequest {
    /// `HH:MM` as read off the face.
    dial: Option<String>,
    minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PulseRequest {
    relay: PulseTarget,
    width_ms: Option<u64>,
}

pub fn build_router(service: Arc<ClockService>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(get_status))
        .route("/api/dial", post(set_dial))
        .route("/api/fast-set", post(start_fast_set))
        .route("/api/stop", post(stop_correction))
        .route("/api/pulse", post(pulse_test))
        .route("/api/burst", post(run_test_burst))
        .with_state(service)
}

/// Serves until `running` clears.
pub async fn serve(
    service: Arc<ClockService>,
    config: &WebConfig,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind web server to {}", addr))?;
    info!("[Web] Listening on http://{}", addr);

    axum::serve(listener, build_router(service))
        .with_graceful_shutdown(wait_for_shutdown(running))
        .await?;
    info!("[Web] Server stopped");
    Ok(())
}

async fn wait_for_shutdown(running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn get_status(State(service): State<AppState>) -> Json<ClockStatus> {
    Json(service.get_status())
}

async fn set_dial(
    State(service): State<AppState>,
    Json(req): Json<SetDialRequest>,
) -> Result<Json<Value>, ApiError> {
    let reading = match (req.dial, req.minutes) {
        (Some(text), _) => text.parse::<DialReading>()?,
        (None, Some(minutes)) => DialReading::from_minutes(minutes),
        (None, None) => {
            return Err(ClockError::InvalidDialReading(
                "expected \"dial\" (HH:MM) or \"minutes\"".to_string(),
            )
            .into())
        }
    };
    let offset = service.set_dial(reading)?;
    Ok(Json(json!({ "offset_minutes": offset.minutes() })))
}

async fn start_fast_set(State(service): State<AppState>) -> Result<Json<Value>, ApiError> {
    let mode = service.start_fast_set()?;
    Ok(Json(json!({ "mode": mode })))
}

async fn stop_correction(State(service): State<AppState>) -> Json<Value> {
    Json(json!({ "mode": service.stop_correction() }))
}

async fn pulse_test(
    State(service): State<AppState>,
    Json(req): Json<PulseRequest>,
) -> Result<Json<PulseEvent>, ApiError> {
    let width = req.width_ms.map(Duration::from_millis);
    let event = tokio::task::spawn_blocking(move || service.pulse_test(req.relay, width))
        .await
        .map_err(|e| ApiError::internal(format!("pulse task failed: {}", e)))??;
    Ok(Json(event))
}

async fn run_test_burst(State(service): State<AppState>) -> Result<Json<ClockStatus>, ApiError> {
    service.run_test_burst()?;
    Ok(Json(service.get_status()))
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>International Impulse Clock</title>
<style>
  body { font-family: sans-serif; max-width: 40em; margin: 2em auto; }
  table td { padding: 0.2em 1em 0.2em 0; }
  .dial { font-size: 3em; font-weight: bold; }
  button { margin: 0.2em; }
  #error { color: #b00; }
</style>
</head>
<body>
<h1>International A/B/C Impulse Clock</h1>
<div class="dial" id="dial_time">--:--</div>
<table>
  <tr><td>System time</td><td id="system_time"></td></tr>
  <tr><td>Mode</td><td id="mode"></td></tr>
  <tr><td>Offset (min)</td><td id="offset_minutes"></td></tr>
  <tr><td>Dial set</td><td id="has_offset"></td></tr>
  <tr><td>Next tick (s)</td><td id="seconds_until_next_tick"></td></tr>
  <tr><td>Last pulse</td><td id="last_pulse"></td></tr>
  <tr><td>Status</td><td id="message"></td></tr>
</table>
<p>
  <input id="reading" placeholder="HH:MM" size="6">
  <button onclick="post('/api/dial', {dial: document.getElementById('reading').value})">Set dial</button>
</p>
<p>
  <button onclick="post('/api/fast-set')">Fast set</button>
  <button onclick="post('/api/stop')">Stop</button>
  <button onclick="post('/api/burst')">Test burst</button>
</p>
<p>
  <button onclick="post('/api/pulse', {relay: 'A'})">Pulse A</button>
  <button onclick="post('/api/pulse', {relay: 'B'})">Pulse B</button>
  <button onclick="post('/api/pulse', {relay: 'AB'})">Pulse A+B</button>
</p>
<p id="error"></p>
<script>
async function post(path, body) {
  const res = await fetch(path, {
    method: 'POST',
    headers: {'Content-Type': 'application/json'},
    body: JSON.stringify(body || {})
  });
  const data = await res.json();
  document.getElementById('error').textContent = res.ok ? '' : data.error;
  refresh();
}
async function refresh() {
  const s = await (await fetch('/api/status')).json();
  for (const key of ['dial_time', 'system_time', 'mode', 'offset_minutes', 'has_offset',
                     'seconds_until_next_tick', 'message']) {
    document.getElementById(key).textContent = s[key];
  }
  const p = s.last_pulse;
  document.getElementById('last_pulse').textContent =
    p ? p.target + ' ' + p.kind + ' at ' + p.timestamp : '-';
}
refresh();
setInterval(refresh, 1000);
</script>
</body>
</html>
"#;
