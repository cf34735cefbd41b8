use crate::waitline_logic::config::Config;
use crate::waitline_logic::state::AppState;
use anyhow::Result;
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use lib_waitline::core::ChannelSubscriber;
use lib_waitline::{Access, Line, LineError, parse_turn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Deserialize)]
pub struct TurnQuery {
    pub turn: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnResponse {
    pub resource: String,
    pub turn: u64,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessResponse {
    pub status: String,
    pub turn: u64,
    pub expires_in_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseResponse {
    pub resource: String,
    pub next_in: u64,
}

/// Error body shared by every route: `{resource, message}`.
pub struct ApiError {
    status: StatusCode,
    resource: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, resource: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            resource: resource.to_string(),
            message: message.into(),
        }
    }

    fn from_line_error(resource: &str, err: LineError) -> Self {
        let status = match err {
            LineError::InvalidTurn(_) | LineError::TurnNotIssued(_) => StatusCode::BAD_REQUEST,
            LineError::TurnNotInService(_) | LineError::TurnAlreadyServed(_) => StatusCode::CONFLICT,
            LineError::Store(_) | LineError::InvalidConfig(_) => {
                log::error!("Line '{}' failed: {}", resource, err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, resource, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "resource": self.resource,
                "message": self.message,
            })),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/lines/{resource}/turn", post(issue_turn_handler))
        .route("/lines/{resource}/next_in", get(ws_handler))
        .route("/lines/{resource}/token", get(token_handler))
        .route("/lines/{resource}/release", post(release_handler))
        .route("/lines/{resource}/status", get(status_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn run(
    config: Config,
    app_state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

fn line_for(state: &AppState, resource: &str) -> Result<Arc<Line>, ApiError> {
    state
        .registry
        .get_or_create(resource)
        .map_err(|e| ApiError::from_line_error(resource, e))
}

fn turn_from(query: &TurnQuery, resource: &str) -> Result<u64, ApiError> {
    parse_turn(query.turn.as_deref().unwrap_or(""))
        .map_err(|e| ApiError::from_line_error(resource, e))
}

async fn issue_turn_handler(
    Path(resource): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TurnResponse>, ApiError> {
    let line = line_for(&state, &resource)?;
    let turn = line
        .issue_turn()
        .map_err(|e| ApiError::from_line_error(&resource, e))?;
    Ok(Json(TurnResponse {
        resource,
        turn,
        expires_in_secs: line.waiting_max_age().as_secs(),
    }))
}

async fn token_handler(
    Path(resource): Path<String>,
    Query(query): Query<TurnQuery>,
    State(state): State<AppState>,
) -> Result<Json<AccessResponse>, ApiError> {
    let turn = turn_from(&query, &resource)?;
    let line = line_for(&state, &resource)?;
    match line
        .claim_access(turn)
        .map_err(|e| ApiError::from_line_error(&resource, e))?
    {
        Access::Granted { turn, .. } => Ok(Json(AccessResponse {
            status: "access_granted".to_string(),
            turn,
            expires_in_secs: line.access_max_age().as_secs(),
        })),
        Access::NotYet { .. } => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            &resource,
            "Not your turn yet. You should wait until access granted.",
        )),
    }
}

async fn release_handler(
    Path(resource): Path<String>,
    Query(query): Query<TurnQuery>,
    State(state): State<AppState>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let turn = turn_from(&query, &resource)?;
    let line = line_for(&state, &resource)?;
    let next_in = line
        .release(turn)
        .map_err(|e| ApiError::from_line_error(&resource, e))?;
    Ok(Json(ReleaseResponse { resource, next_in }))
}

async fn status_handler(
    Path(resource): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let line = line_for(&state, &resource)?;
    let status = line
        .status()
        .map_err(|e| ApiError::from_line_error(&resource, e))?;
    Ok(Json(status))
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(resource): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let line = line_for(&state, &resource)?;
    let buffer = state.ws_buffer;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, line, buffer)))
}

/// Bridges one socket to the line: the socket becomes a subscriber through a
/// channel, and this task writes whatever the broadcaster pushes into it.
/// Once the socket goes away the channel closes, later pushes fail, and the
/// broadcaster prunes the subscriber. Once the line is shut down or evicted
/// nothing will be pushed anymore, so the socket is closed.
async fn handle_socket(socket: WebSocket, line: Arc<Line>, buffer: usize) {
    let (mut sink, mut stream) = socket.split();
    let (subscriber, mut outbox) = ChannelSubscriber::new(buffer);
    let subscriber_id = line.subscribe(Arc::new(subscriber));
    log::info!("Subscriber {} connected to line '{}'", subscriber_id, line.id());

    loop {
        tokio::select! {
            _ = line.shut_down() => {
                log::info!("Line '{}' is gone, closing subscriber {}", line.id(), subscriber_id);
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            pushed = outbox.recv() => {
                let Some(bytes) = pushed else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let text = String::from_utf8_lossy(&bytes).into_owned();
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break; // client disconnected
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Anything else the client sends is ignored
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    log::info!("Subscriber {} disconnected from line '{}'", subscriber_id, line.id());
}
