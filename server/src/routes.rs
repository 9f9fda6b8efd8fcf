//! HTTP route handlers for the Rollcall server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /appointments` - Book an appointment
//! - `POST /appointments/{id}/token` - Appointment check-in code
//! - `POST /appointments/scan` - Coach scans the appointment code
//! - `POST /appointments/{id}/participant-token` - Personal check-in code
//! - `POST /participants/scan` - Coach scans a personal code
//! - `POST /participants/{id}/respond` - Accept or decline an invitation
//! - `POST /appointments/{id}/start` - Manual start
//! - `POST /appointments/{id}/finalize` - End the session
//! - `POST /appointments/{id}/participants/{pid}/absent` - Mark absent
//! - `GET /appointments/{id}/counts` - Attendance counts
//! - `GET /appointments/{id}/history` - Attendance ledger
//! - `GET /coaches/{id}/active-session` - The coach's running session
//! - `GET /ws` - Live ledger feed
//! - `GET /health` - Health check
//!
//! # Authentication
//!
//! Every endpoint except `/health` expects the gateway headers described in
//! [`crate::identity`].
//!
//! # Responses
//!
//! Lifecycle endpoints always answer with the structured
//! [`LifecycleResult`] body; the HTTP status mirrors its error code.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::{EventBroadcaster, SubscriberFilter};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::{ServerError, StoreError};
use crate::identity::{identity_from_headers, AuthError, Identity};
use crate::lifecycle::{ErrorCode, LifecycleResult, SessionLifecycleManager};
use crate::registry::{BookingRequest, InvitationOutcome};
use crate::store::InMemoryStore;
use crate::token::TokenCodec;
use crate::types::AttendanceAction;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Lifecycle engine.
    pub manager: Arc<SessionLifecycleManager>,

    /// Live ledger feed.
    pub broadcaster: EventBroadcaster,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state backed by an in-memory store and the
    /// system clock.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let broadcaster = EventBroadcaster::new();
        let codec = TokenCodec::from_seed(config.token_signing_seed.as_ref());
        let manager = SessionLifecycleManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
            codec,
        )
        .with_broadcaster(broadcaster.clone());

        Self::with_components(config, Arc::new(manager), broadcaster)
    }

    /// Creates application state around an existing manager.
    ///
    /// The manager should already publish to `broadcaster` if the live feed
    /// is expected to carry its events.
    #[must_use]
    pub fn with_components(
        config: Config,
        manager: Arc<SessionLifecycleManager>,
        broadcaster: EventBroadcaster,
    ) -> Self {
        Self {
            config: Arc::new(config),
            manager,
            broadcaster,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("manager", &self.manager)
            .field("broadcaster", &self.broadcaster)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/appointments", post(post_appointment))
        .route("/appointments/scan", post(post_appointment_scan))
        .route("/appointments/{id}/token", post(post_appointment_token))
        .route(
            "/appointments/{id}/participant-token",
            post(post_participant_token),
        )
        .route("/appointments/{id}/start", post(post_start))
        .route("/appointments/{id}/finalize", post(post_finalize))
        .route(
            "/appointments/{id}/participants/{participant_id}/absent",
            post(post_absent),
        )
        .route("/appointments/{id}/counts", get(get_counts))
        .route("/appointments/{id}/history", get(get_history))
        .route("/participants/scan", post(post_participant_scan))
        .route("/participants/{id}/respond", post(post_respond))
        .route("/coaches/{id}/active-session", get(get_active_session))
        .route("/ws", get(get_ws))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn auth_rejection(err: &AuthError) -> Response {
    if err.is_configuration_error() {
        error!("Gateway token not configured but auth is enabled");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("server configuration error")),
        )
            .into_response();
    }

    let code = match err {
        AuthError::MissingToken => "missing_token",
        AuthError::InvalidToken => "invalid_token",
        AuthError::MissingUserId => "missing_user",
        AuthError::NotConfigured => "server_error",
    };
    debug!(reason = code, "Request rejected by gateway authentication");
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(err.to_string()).with_code(code)),
    )
        .into_response()
}

/// Resolves the caller or produces the rejection response.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, Response> {
    identity_from_headers(headers, &state.config).map_err(|err| auth_rejection(&err))
}

fn store_failure(err: &StoreError) -> Response {
    error!(error = %err, "Store failure while serving request");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new("internal error").with_code("internal_error")),
    )
        .into_response()
}

fn server_error_response(err: &ServerError) -> Response {
    match err {
        ServerError::Validation(message) => (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(message.clone()).with_code("validation_error")),
        )
            .into_response(),
        ServerError::Store(store) => store_failure(store),
        other => {
            error!(error = %other, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("internal error").with_code("internal_error")),
            )
                .into_response()
        }
    }
}

/// HTTP status for a lifecycle result.
#[must_use]
pub fn status_for(result: &LifecycleResult) -> StatusCode {
    if result.success {
        return StatusCode::OK;
    }
    match result.error_code {
        Some(ErrorCode::WaitingForClients) => StatusCode::ACCEPTED,
        Some(ErrorCode::NotAssigned) => StatusCode::FORBIDDEN,
        Some(ErrorCode::NotFound) => StatusCode::NOT_FOUND,
        Some(ErrorCode::TokenInvalid | ErrorCode::InvalidRole) => StatusCode::BAD_REQUEST,
        Some(ErrorCode::TokenExpired) => StatusCode::GONE,
        Some(
            ErrorCode::TokenMismatch
            | ErrorCode::WindowTooEarly
            | ErrorCode::WindowTooLate
            | ErrorCode::AlreadyPresent
            | ErrorCode::AlreadyAbsent
            | ErrorCode::NoClientParticipants
            | ErrorCode::SessionAlreadyStarted
            | ErrorCode::SessionClosed,
        ) => StatusCode::CONFLICT,
        Some(ErrorCode::InternalError) | None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn lifecycle_response(result: LifecycleResult) -> Response {
    (status_for(&result), Json(result)).into_response()
}

// ============================================================================
// Booking and invitations
// ============================================================================

/// POST /appointments - Book an appointment as the calling client.
///
/// # Responses
///
/// - `201 Created` - The stored appointment
/// - `400 Bad Request` - Invalid booking
/// - `401 Unauthorized` - Gateway authentication failed
async fn post_appointment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BookingRequest>,
) -> Response {
    let creator = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };

    match state.manager.registry().book_appointment(request, &creator) {
        Ok(appointment) => (StatusCode::CREATED, Json(appointment)).into_response(),
        Err(err) => server_error_response(&err),
    }
}

/// Request body for answering an invitation.
#[derive(Debug, Deserialize)]
pub struct RespondRequest {
    pub accept: bool,
}

/// POST /participants/{id}/respond - Accept or decline an invitation.
async fn post_respond(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RespondRequest>,
) -> Response {
    let responder = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };

    match state
        .manager
        .registry()
        .respond_to_invitation(&participant_id, &responder, request.accept)
    {
        Ok(InvitationOutcome::Updated(participant)) => Json(participant).into_response(),
        Ok(InvitationOutcome::AlreadyResponded(participant)) => {
            (StatusCode::CONFLICT, Json(participant)).into_response()
        }
        Ok(InvitationOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("participant not found").with_code("not_found")),
        )
            .into_response(),
        Ok(InvitationOutcome::NotInvitee) => (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("not your invitation").with_code("not_invitee")),
        )
            .into_response(),
        Err(err) => store_failure(&err),
    }
}

// ============================================================================
// Check-in
// ============================================================================

/// Request body carrying a scanned code.
#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub token: String,
}

/// POST /appointments/{id}/token - Generate or fetch the appointment code.
async fn post_appointment_token(
    State(state): State<AppState>,
    Path(appointment_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    lifecycle_response(
        state
            .manager
            .generate_appointment_token(&appointment_id, &caller),
    )
}

/// POST /appointments/scan - Coach scans an appointment code.
async fn post_appointment_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ScanRequest>,
) -> Response {
    let coach = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    lifecycle_response(state.manager.scan_appointment_token(&request.token, &coach))
}

/// POST /appointments/{id}/participant-token - The caller's personal code.
async fn post_participant_token(
    State(state): State<AppState>,
    Path(appointment_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let user = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    lifecycle_response(state.manager.generate_participant_token(&appointment_id, &user))
}

/// POST /participants/scan - Coach scans a personal code.
async fn post_participant_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ScanRequest>,
) -> Response {
    let coach = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    lifecycle_response(state.manager.scan_participant_token(&request.token, &coach))
}

// ============================================================================
// Coach controls
// ============================================================================

/// POST /appointments/{id}/start - Manual start.
async fn post_start(
    State(state): State<AppState>,
    Path(appointment_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let coach = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    lifecycle_response(state.manager.manual_start(&appointment_id, &coach))
}

/// POST /appointments/{id}/finalize - End the session.
async fn post_finalize(
    State(state): State<AppState>,
    Path(appointment_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let coach = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    lifecycle_response(state.manager.finalize_session(&appointment_id, &coach))
}

/// POST /appointments/{id}/participants/{pid}/absent - Mark absent.
async fn post_absent(
    State(state): State<AppState>,
    Path((appointment_id, participant_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let coach = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    lifecycle_response(
        state
            .manager
            .mark_absent(&appointment_id, &participant_id, &coach),
    )
}

// ============================================================================
// Read projections
// ============================================================================

/// GET /appointments/{id}/counts - Attendance counts.
async fn get_counts(
    State(state): State<AppState>,
    Path(appointment_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers) {
        return rejection;
    }

    match state.manager.counts(&appointment_id) {
        Ok(Some(counts)) => Json(counts).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("appointment not found").with_code("not_found")),
        )
            .into_response(),
        Err(err) => store_failure(&err),
    }
}

/// Query parameters for the history endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    /// `desc` for newest first; anything else is oldest first.
    pub order: Option<String>,
}

impl HistoryQuery {
    fn newest_first(&self) -> bool {
        self.order
            .as_deref()
            .is_some_and(|o| o.eq_ignore_ascii_case("desc"))
    }
}

/// GET /appointments/{id}/history - Attendance ledger.
async fn get_history(
    State(state): State<AppState>,
    Path(appointment_id): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers) {
        return rejection;
    }

    match state.manager.history(&appointment_id) {
        Ok(mut events) => {
            if query.newest_first() {
                events.reverse();
            }
            Json(events).into_response()
        }
        Err(err) => store_failure(&err),
    }
}

/// Response body for the active-session lookup.
#[derive(Debug, Serialize, Deserialize)]
pub struct ActiveSessionResponse {
    pub session: Option<crate::types::Appointment>,
}

/// GET /coaches/{id}/active-session - The coach's running session, if any.
async fn get_active_session(
    State(state): State<AppState>,
    Path(coach_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers) {
        return rejection;
    }

    match state.manager.active_session_for_coach(&coach_id) {
        Ok(session) => Json(ActiveSessionResponse { session }).into_response(),
        Err(err) => store_failure(&err),
    }
}

// ============================================================================
// GET /ws - Live ledger feed
// ============================================================================

/// Query parameters for WebSocket subscription.
#[derive(Debug, Default, Deserialize)]
pub struct WsQueryParams {
    /// Only events for this appointment.
    pub appointment: Option<String>,

    /// Only events with this action.
    pub action: Option<AttendanceAction>,
}

impl WsQueryParams {
    /// Builds a `SubscriberFilter` from the query parameters.
    fn to_filter(&self) -> SubscriberFilter {
        let mut filter = SubscriberFilter::new();

        if let Some(ref appointment) = self.appointment {
            filter = filter.with_appointment(appointment.clone());
        }

        if let Some(action) = self.action {
            filter = filter.with_action(action);
        }

        filter
    }
}

/// GET /ws - Live ledger feed.
///
/// Once connected, the server sends each matching ledger entry as a JSON
/// text message.
async fn get_ws(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let subscriber = match authenticate(&state, &headers) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };

    let filter = params.to_filter();
    info!(
        user_id = %subscriber.user_id,
        filter = ?filter,
        "WebSocket client connecting"
    );

    ws.on_upgrade(move |socket| handle_websocket(socket, state.broadcaster, filter))
}

/// Forwards matching ledger entries until the client disconnects.
async fn handle_websocket(
    socket: axum::extract::ws::WebSocket,
    broadcaster: EventBroadcaster,
    filter: SubscriberFilter,
) {
    use axum::extract::ws::Message;
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = broadcaster.subscribe();

    info!("WebSocket client connected");

    let forward_task = tokio::spawn(async move {
        loop {
            match event_rx.recv().await {
                Ok(event) => {
                    if !filter.matches(&event) {
                        trace!(event_id = %event.id, "Event filtered out");
                        continue;
                    }

                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            if let Err(err) = sender.send(Message::Text(json.into())).await {
                                debug!(error = %err, "Failed to send event to WebSocket client");
                                break;
                            }
                        }
                        Err(err) => {
                            error!(error = %err, "Failed to serialize event");
                        }
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    warn!(skipped = count, "WebSocket client lagged, skipped events");
                }
                Err(RecvError::Closed) => {
                    debug!("Event broadcaster closed");
                    break;
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                debug!("WebSocket client sent close frame");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "WebSocket error");
                break;
            }
        }
    }

    forward_task.abort();
    info!("WebSocket client disconnected");
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of live feed subscribers.
    pub connections: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint. No authentication required.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.broadcaster.subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
