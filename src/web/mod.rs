//! HTTP front end for the update manager.
//!
//! `POST /run` streams a supervised script as server-sent events: one `data:`
//! chunk per output line (ANSI stripped, HTML escaped), a bare
//! `data: BACKUP_PROMPT` when the script waits for a confirmation, and a
//! final `event: status` chunk carrying `{status, exit_code}`. Answers come
//! back through `POST /backup_response`; `POST /exit` stops the active run.

use std::convert::Infallible;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderName, StatusCode, header},
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{self, BackupKind, Catalog, CatalogError, Launcher};
use crate::config::ManagerConfig;
use crate::events::NarrationEvent;
use crate::log::{LogFileSink, LogFormat};
use crate::prompt::strip_ansi;
use crate::relay::{Answer, RelayError};
use crate::sink::{self, Fanout};
use crate::supervisor::{RunOutcome, Supervisor, SupervisorError, SupervisorState};

/// Side-channel marker telling the page to show the y/n buttons.
pub const BACKUP_PROMPT_MARKER: &str = "BACKUP_PROMPT";
pub const LOG_STEM: &str = "saturn-update-manager";
const HEARTBEAT: Duration = Duration::from_secs(5);

const NO_CACHE: [(HeaderName, &str); 3] = [
    (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
    (header::PRAGMA, "no-cache"),
    (header::EXPIRES, "0"),
];

/// Everything the handlers share.
pub struct AppState {
    pub supervisor: Supervisor,
    pub catalog: Catalog,
    pub launcher: Launcher,
    pub home: PathBuf,
    /// Per-run log directory; `None` disables run logs.
    pub log_dir: Option<PathBuf>,
    pub log_format: LogFormat,
    /// Events buffered per stream client.
    pub sink_buffer: usize,
}

impl AppState {
    pub fn from_config(config: &ManagerConfig, home: PathBuf) -> anyhow::Result<Self> {
        Ok(Self {
            supervisor: Supervisor::new(config.supervisor_config()?),
            catalog: Catalog::load(&config.scripts, &home),
            launcher: config.launcher(),
            home,
            log_dir: Some(config.log_dir()),
            log_format: config.log.format,
            sink_buffer: config.server.sink_buffer,
        })
    }
}

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/scripts", get(scripts))
        .route("/status", get(status))
        .route("/backups", get(backups))
        .route("/run", post(run))
        .route("/backup_response", post(backup_response))
        .route("/exit", post(exit))
        .with_state(state)
}

/// Bind and serve until Ctrl-C; an active run is cancelled on shutdown.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let supervisor = state.supervisor.clone();
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("update manager listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            supervisor.cancel();
        })
        .await
        .context("server error")
}

/// JSON error body with the matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        debug!(status = %self.status, "request failed: {}", self.message);
        (
            self.status,
            NO_CACHE,
            Json(json!({ "status": "error", "message": self.message })),
        )
            .into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let status = match err {
            SupervisorError::Busy { .. } | SupervisorError::Starting => StatusCode::CONFLICT,
            SupervisorError::Spawn { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        let status = match &err {
            CatalogError::UnknownScript(_) | CatalogError::Missing(_) => StatusCode::NOT_FOUND,
            CatalogError::NotRunnable(_) | CatalogError::InvalidBackupKind(_) => {
                StatusCode::BAD_REQUEST
            }
            CatalogError::Preflight { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CatalogError::Supervisor(SupervisorError::Busy { .. } | SupervisorError::Starting) => {
                StatusCode::CONFLICT
            }
            CatalogError::Supervisor(_) | CatalogError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match err {
            RelayError::InvalidAnswer(_) => StatusCode::BAD_REQUEST,
            RelayError::NoPromptOutstanding | RelayError::AlreadyAnswered => StatusCode::CONFLICT,
            RelayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

async fn ping() -> impl IntoResponse {
    (NO_CACHE, "pong")
}

async fn scripts(State(state): State<SharedState>) -> impl IntoResponse {
    (
        NO_CACHE,
        Json(json!({
            "scripts": state.catalog.grouped(),
            "warnings": state.catalog.warnings(),
        })),
    )
}

async fn status(State(state): State<SharedState>) -> impl IntoResponse {
    let pending = state.supervisor.pending_prompt().map(|wait| wait.text);
    (
        NO_CACHE,
        Json(json!({
            "supervisor": state.supervisor.state(),
            "pending_prompt": pending,
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct BackupQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

async fn backups(
    State(state): State<SharedState>,
    Query(query): Query<BackupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = BackupKind::from_str(query.kind.as_deref().unwrap_or_default())?;
    let home = state.home.clone();
    let names = tokio::task::spawn_blocking(move || catalog::list_backups(kind, &home))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    Ok((NO_CACHE, Json(json!({ "backups": names }))))
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub script: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub backup_dir: Option<String>,
}

/// One server-sent event before it is handed to axum.
#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Data(String),
    Status(String),
}

impl Frame {
    fn for_event(event: &NarrationEvent) -> Self {
        match event {
            NarrationEvent::Output { line } => Frame::Data(escape_html(&strip_ansi(line))),
            NarrationEvent::PromptDetected { .. } => Frame::Data(BACKUP_PROMPT_MARKER.to_string()),
            NarrationEvent::Finished { outcome } => Frame::status(outcome),
            other => Frame::Data(escape_html(&other.summary())),
        }
    }

    fn status(outcome: &RunOutcome) -> Self {
        Frame::Status(
            json!({ "status": outcome.label(), "exit_code": outcome.exit_code() }).to_string(),
        )
    }

    /// Carriage returns cannot travel in an SSE field; progress-bar style
    /// output is split into lines instead.
    fn into_event(self) -> Event {
        match self {
            Frame::Data(data) => Event::default().data(data.replace('\r', "\n")),
            Frame::Status(data) => Event::default().event("status").data(data),
        }
    }
}

/// Minimal HTML escaping for output chunks rendered into the page.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

async fn run(
    State(state): State<SharedState>,
    Json(request): Json<RunRequest>,
) -> Result<Response, ApiError> {
    let script = state.catalog.find(&request.script)?.clone();
    if let SupervisorState::Running { pid, .. } = state.supervisor.state() {
        return Err(SupervisorError::Busy { pid }.into());
    }

    let run_id = Uuid::new_v4();
    info!(%run_id, script = script.name(), flags = ?request.flags, "run requested");

    let launcher = state.launcher.clone();
    let checked = script.clone();
    let preflight = tokio::task::spawn_blocking(move || launcher.preflight(&checked))
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    if let Err(err) = preflight {
        warn!(%run_id, "preflight failed: {err}");
        return Ok(failed_stream(&err.to_string()));
    }

    let spec = match state
        .launcher
        .command(&script, &request.flags, request.backup_dir.as_deref())
    {
        Ok(spec) => spec,
        Err(err) => return Ok(failed_stream(&err.to_string())),
    };

    let (channel_sink, receiver) = sink::channel(&format!("stream-{run_id}"), state.sink_buffer);
    let mut fanout = Fanout::default().with(channel_sink);
    if let Some(dir) = &state.log_dir {
        match LogFileSink::timestamped(dir, LOG_STEM, state.log_format) {
            Ok(log) => {
                info!(%run_id, path = %log.path().display(), "run log opened");
                fanout = fanout.with(log);
            }
            Err(e) => warn!(%run_id, "run log disabled: {e:#}"),
        }
    }

    let handle = match state.supervisor.start(spec, fanout) {
        Ok(handle) => handle,
        Err(err @ (SupervisorError::Busy { .. } | SupervisorError::Starting)) => {
            return Err(err.into());
        }
        Err(err) => {
            warn!(%run_id, "{err}");
            return Ok(failed_stream(&err.to_string()));
        }
    };
    info!(%run_id, pid = handle.pid(), "run started");

    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    tokio::task::spawn_blocking(move || {
        while let Some(event) = receiver.recv() {
            let last = event.is_finished();
            if tx.send(Frame::for_event(&event)).is_err() {
                debug!(%run_id, "stream client went away");
                break;
            }
            if last {
                break;
            }
        }
    });

    Ok(event_stream(rx))
}

/// A complete stream for a run that never started: the error in-band,
/// then a `failed` status.
fn failed_stream(error: &str) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Frame>();
    let outcome = RunOutcome::Failed {
        error: error.to_string(),
    };
    let _ = tx.send(Frame::Data(escape_html(&format!("Error: {error}"))));
    let _ = tx.send(Frame::status(&outcome));
    event_stream(rx)
}

fn event_stream(rx: mpsc::UnboundedReceiver<Frame>) -> Response {
    let stream =
        UnboundedReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.into_event()));
    (
        NO_CACHE,
        [(HeaderName::from_static("x-accel-buffering"), "no")],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT)),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub response: String,
}

async fn backup_response(
    State(state): State<SharedState>,
    Json(request): Json<AnswerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let answer = Answer::from_str(&request.response)?;
    let ack = state.supervisor.answer(answer)?;
    info!(%answer, waited_ms = ack.waited.as_millis() as u64, "backup response relayed");
    Ok((NO_CACHE, Json(json!({ "status": "success" }))))
}

async fn exit(State(state): State<SharedState>) -> impl IntoResponse {
    let body: Value = if state.supervisor.cancel() {
        json!({ "status": "terminating" })
    } else {
        json!({ "status": "idle" })
    };
    (NO_CACHE, Json(body))
}
