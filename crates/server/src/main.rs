use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use engine::{Engine, EngineConfig};
use persist::TomlFilePersist;
use serde::Deserialize;
use shared::{
    domain::{RegistrationId, SuggestionId, SuggestionStatus},
    error::{ApiError, EngineError, ErrorCode},
    protocol::{
        CreateSuggestionRequest, EventRecord, EventsResponse, HistoryEntry, InspectionRequest,
        RegisterRequest, RegistrationSnapshot, ResolveSuggestionRequest, SaveReport,
        SaveValueRequest, SuggestionView, UpdateValueRequest,
    },
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

mod config;

use config::{load_settings, Settings};

struct AppState {
    engine: Arc<Engine>,
    events: broadcast::Sender<EventRecord>,
    /// Locator used for registrations that do not bring their own.
    default_locator: String,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    after: u64,
    wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SuggestionsQuery {
    status: Option<SuggestionStatus>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let state = build_state(&settings);
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, tunables_file = %settings.tunables_file, "tuning server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(settings: &Settings) -> Arc<AppState> {
    let engine = Arc::new(Engine::new(
        EngineConfig {
            event_capacity: settings.event_capacity,
            max_poll_wait: Duration::from_millis(settings.max_poll_wait_ms),
        },
        Arc::new(TomlFilePersist),
    ));

    // Bridge the engine's synchronous fan-out into a broadcast channel so
    // any number of sockets can tail it without touching the engine lock.
    let (events, _) = broadcast::channel(256);
    let sender = events.clone();
    engine.subscribe(Box::new(move |event| {
        // Send only fails with zero receivers, which is not a fault.
        let _ = sender.send(event.clone());
        Ok(())
    }));

    Arc::new(AppState {
        engine,
        events,
        default_locator: settings.tunables_file.clone(),
    })
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/registrations", post(register).get(list_registrations))
        .route(
            "/registrations/:id",
            get(get_registration).delete(unregister),
        )
        .route("/registrations/:id/reset", post(reset_registration))
        .route("/reset-all", post(reset_all))
        .route("/values/update", post(update_value))
        .route("/values/save", post(save_value))
        .route("/values/save-all", post(save_all))
        .route("/history/undo", post(undo))
        .route("/history/redo", post(redo))
        .route("/suggestions", post(create_suggestion).get(list_suggestions))
        .route("/suggestions/:id/resolve", post(resolve_suggestion))
        .route("/inspections", post(record_inspection))
        .route("/events", get(list_events))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn reject(error: EngineError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code() {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::AlreadyResolved | ErrorCode::Busy => StatusCode::CONFLICT,
        ErrorCode::Persist => StatusCode::BAD_GATEWAY,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error.into()))
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Json<RegistrationSnapshot> {
    let locator = req
        .locator
        .unwrap_or_else(|| state.default_locator.clone());
    Json(state.engine.register(req.id, locator, req.defaults))
}

async fn unregister(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<EventRecord> {
    let record = state
        .engine
        .unregister(&RegistrationId::new(id))
        .map_err(reject)?;
    Ok(Json(record))
}

async fn list_registrations(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<RegistrationSnapshot>> {
    Json(state.engine.list_registrations())
}

async fn get_registration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<RegistrationSnapshot> {
    let id = RegistrationId::new(id);
    state
        .engine
        .get_registration(&id)
        .map(Json)
        .ok_or_else(|| reject(EngineError::RegistrationNotFound(id)))
}

async fn update_value(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateValueRequest>,
) -> ApiResult<Option<EventRecord>> {
    let outcome = state
        .engine
        .update_value(&req.registration_id, &req.key, req.value, req.origin)
        .map_err(reject)?;
    Ok(Json(outcome))
}

async fn save_value(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SaveValueRequest>,
) -> ApiResult<EventRecord> {
    let record = state
        .engine
        .save_value(&req.registration_id, &req.key)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn save_all(State(state): State<Arc<AppState>>) -> ApiResult<SaveReport> {
    let report = state.engine.save_all().await.map_err(reject)?;
    if !report.failures.is_empty() {
        warn!(
            failed = report.failures.len(),
            saved = report.saved_count,
            "save-all completed with failures"
        );
    }
    Ok(Json(report))
}

async fn reset_registration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Option<EventRecord>> {
    let record = state
        .engine
        .reset_registration(&RegistrationId::new(id))
        .map_err(reject)?;
    Ok(Json(record))
}

async fn reset_all(State(state): State<Arc<AppState>>) -> Json<Vec<EventRecord>> {
    Json(state.engine.reset_all())
}

async fn undo(State(state): State<Arc<AppState>>) -> ApiResult<Option<HistoryEntry>> {
    Ok(Json(state.engine.undo().map_err(reject)?))
}

async fn redo(State(state): State<Arc<AppState>>) -> ApiResult<Option<HistoryEntry>> {
    Ok(Json(state.engine.redo().map_err(reject)?))
}

async fn create_suggestion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSuggestionRequest>,
) -> ApiResult<SuggestionView> {
    let suggestion = state
        .engine
        .create_suggestion(&req.registration_id, &req.key, req.value, req.reason)
        .map_err(reject)?;
    Ok(Json(suggestion))
}

async fn resolve_suggestion(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveSuggestionRequest>,
) -> ApiResult<SuggestionView> {
    let suggestion = state
        .engine
        .resolve_suggestion(SuggestionId(id), req.outcome)
        .map_err(reject)?;
    Ok(Json(suggestion))
}

async fn list_suggestions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SuggestionsQuery>,
) -> Json<Vec<SuggestionView>> {
    Json(state.engine.list_suggestions(q.status))
}

async fn record_inspection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InspectionRequest>,
) -> Json<EventRecord> {
    Json(
        state
            .engine
            .record_inspection(req.registration_id, req.element, req.origin),
    )
}

/// Pull surface for intermittent consumers (agent pollers). `after` is the
/// last sequence the caller has seen; `wait_ms` turns the read into a long
/// poll, clamped server-side.
async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
) -> Json<EventsResponse> {
    let events = match q.wait_ms {
        Some(wait_ms) if wait_ms > 0 => {
            state
                .engine
                .wait_for_events(q.after, Duration::from_millis(wait_ms))
                .await
        }
        _ => state.engine.list_since(q.after),
    };
    let latest_sequence = state.engine.latest_sequence();
    Json(EventsResponse {
        events,
        latest_sequence,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};
    use tokio_stream::wrappers::BroadcastStream;

    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.events.subscribe());

    let send_task = tokio::spawn(async move {
        while let Some(next) = events.next().await {
            // A lagged receiver skips ahead; the client re-syncs via /events.
            let Ok(event) = next else { continue };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
