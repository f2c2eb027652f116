use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::config::{Config, WebSocketConfig};
use crate::ws::ws_handler;
use axum::{
    Extension, Json, Router,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use quizboard_core::{
    ConnectionHub, EventRelay, JoinQuizOperation, JoinQuizOperationOutcome,
    JoinQuizOperationRequest, KeyLayout, LeaderboardRepository, ListScoresOperation,
    ListScoresOperationRequest, QuizError, Result, SharedStore, SubmitQuizOperation,
    SubmitQuizOperationOutcome, SubmitQuizOperationRequest,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub hub: ConnectionHub,
    pub join_quiz: JoinQuizOperation,
    pub submit_quiz: SubmitQuizOperation,
    pub list_scores: ListScoresOperation,
    pub authenticator: Arc<dyn Authenticator>,
    pub websocket: WebSocketConfig,
}

impl ServerState {
    pub fn new(store: Arc<dyn SharedStore>, layout: KeyLayout, config: &Config) -> Self {
        let repository = LeaderboardRepository::new(store, layout)
            .with_membership_ttl(config.store.membership_ttl());

        Self {
            hub: ConnectionHub::with_write_wait(config.websocket.write_wait()),
            join_quiz: JoinQuizOperation::new(repository.clone()),
            submit_quiz: SubmitQuizOperation::new(repository.clone()),
            list_scores: ListScoresOperation::new(repository),
            authenticator: Arc::new(StaticTokenAuthenticator::new(config.auth.token_map())),
            websocket: config.websocket.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SubmitQuizBody {
    score: f64,
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    #[serde(default)]
    from: i64,
    #[serde(default)]
    limit: i64,
}

/// User id resolved from the bearer credential of a `/user` request.
#[derive(Debug, Clone)]
struct AuthenticatedUser(String);

pub async fn run_server(config: Config) -> Result<()> {
    let builder = config.store_builder();
    let layout = builder.key_layout()?;
    let store = builder.build().await?;
    tracing::info!(
        "Using {} store with namespace {}",
        store.backend(),
        layout.namespace()
    );

    let state = Arc::new(ServerState::new(store.clone(), layout.clone(), &config));

    // Subscribe before accepting traffic so no submit made through this
    // process is missed by its own clients.
    let relay = EventRelay::subscribe(store.clone(), &layout, state.hub.clone()).await?;
    let (stop_relay, relay_stopped) = tokio::sync::oneshot::channel::<()>();
    let relay_task = tokio::spawn(relay.run_until(async move {
        let _ = relay_stopped.await;
    }));

    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!("Server listening on {}", config.server.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown requested");
            let _ = stop_relay.send(());
        })
        .await?;

    match relay_task.await {
        Ok(forwarded) => tracing::info!("Event relay stopped after {} events", forwarded),
        Err(error) => tracing::error!("Event relay task failed: {}", error),
    }
    state.hub.close_all().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", error);
        std::future::pending::<()>().await;
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    let user_routes = Router::new()
        .route("/quiz/:quiz_id/join", post(join_quiz))
        .route("/quiz/:quiz_id/submit", post(submit_quiz))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user));

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .route("/leaderboard", get(leaderboard))
        .nest("/user", user_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn success<T: Serialize>(status: StatusCode, data: T) -> Response {
    let resp = ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    };
    (status, Json(resp)).into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let resp = ApiResponse::<()> {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(resp)).into_response()
}

/// Client mistakes come back verbatim; anything else is logged and reported
/// under a generic message.
fn error_response(context: &str, error: QuizError) -> Response {
    match error {
        QuizError::InvalidRequest(message) => failure(StatusCode::BAD_REQUEST, message),
        other => {
            tracing::error!("{}: {}", context, other);
            failure(StatusCode::INTERNAL_SERVER_ERROR, context)
        }
    }
}

async fn require_user(
    State(state): State<Arc<ServerState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match state.authenticator.authenticate(header) {
        Ok(user_id) => {
            request.extensions_mut().insert(AuthenticatedUser(user_id));
            next.run(request).await
        }
        Err(error) => {
            tracing::debug!("Rejected {} {}: {}", request.method(), request.uri(), error);
            failure(StatusCode::UNAUTHORIZED, error.to_string())
        }
    }
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "time": chrono::Utc::now().to_rfc3339(),
        "connections": state.hub.len().await,
    });

    (StatusCode::OK, Json(response))
}

async fn join_quiz(
    State(state): State<Arc<ServerState>>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Path(quiz_id): Path<String>,
) -> Response {
    let request = JoinQuizOperationRequest {
        user_id,
        quiz_id: quiz_id.clone(),
    };

    match state.join_quiz.run(request).await {
        Ok(JoinQuizOperationOutcome::Joined) => success(
            StatusCode::CREATED,
            MessageResponse {
                message: format!("joined quiz {}", quiz_id),
            },
        ),
        Ok(JoinQuizOperationOutcome::Rejected(rejection)) => {
            failure(StatusCode::BAD_REQUEST, rejection.to_string())
        }
        Err(error) => error_response("failed to join quiz", error),
    }
}

async fn submit_quiz(
    State(state): State<Arc<ServerState>>,
    Extension(AuthenticatedUser(user_id)): Extension<AuthenticatedUser>,
    Path(quiz_id): Path<String>,
    payload: std::result::Result<Json<SubmitQuizBody>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            tracing::debug!("Invalid submit payload: {}", rejection);
            return failure(StatusCode::BAD_REQUEST, "invalid payload");
        }
    };

    let request = SubmitQuizOperationRequest {
        user_id,
        quiz_id: quiz_id.clone(),
        score: body.score,
    };

    match state.submit_quiz.run(request).await {
        Ok(SubmitQuizOperationOutcome::Submitted { .. }) => success(
            StatusCode::OK,
            MessageResponse {
                message: format!("submitted quiz {}", quiz_id),
            },
        ),
        Ok(SubmitQuizOperationOutcome::Rejected(rejection)) => {
            failure(StatusCode::BAD_REQUEST, rejection.to_string())
        }
        Err(error) => error_response("failed to submit quiz", error),
    }
}

async fn leaderboard(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LeaderboardQuery>,
) -> Response {
    let request = ListScoresOperationRequest {
        from: query.from,
        limit: query.limit,
    };

    match state.list_scores.run(request).await {
        Ok(entries) => success(StatusCode::OK, entries),
        Err(error) => error_response("failed to list leaderboard", error),
    }
}
