use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use relay_core::ids::{AnalysisId, SessionId};
use relay_hub::HubError;

use crate::server::AppState;

/// Body shared by subscribe and unsubscribe. Fields are optional so the
/// handlers can answer missing ones with a structured 400 instead of a
/// framework rejection.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub session_id: Option<String>,
    pub analyses: Option<Vec<String>>,
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message })),
    )
}

pub async fn subscribe_handler(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> impl IntoResponse {
    let Some(session_id) = request.session_id else {
        return bad_request("missing sessionId");
    };
    let Some(analyses) = request.analyses else {
        return bad_request("missing analyses");
    };
    let topics: Vec<AnalysisId> = analyses.into_iter().map(AnalysisId::from_raw).collect();

    match state
        .hub
        .subscribe(&SessionId::from_raw(session_id), &topics)
        .await
    {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "subscribed": outcome.subscribed,
                "denied": outcome.denied,
            })),
        ),
        Err(HubError::UnknownSession(id)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("unknown session: {id}") })),
        ),
        Err(HubError::InvalidTopic) => bad_request("invalid analysis id"),
    }
}

pub async fn unsubscribe_handler(
    State(state): State<AppState>,
    Json(request): Json<SubscriptionRequest>,
) -> impl IntoResponse {
    let Some(session_id) = request.session_id else {
        return bad_request("missing sessionId");
    };
    let Some(analyses) = request.analyses else {
        return bad_request("missing analyses");
    };
    let topics: Vec<AnalysisId> = analyses.into_iter().map(AnalysisId::from_raw).collect();

    let outcome = state
        .hub
        .unsubscribe(&SessionId::from_raw(session_id), &topics);
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "unsubscribed": outcome.unsubscribed,
        })),
    )
}

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "sessions": state.hub.session_count(),
            "channels": state.hub.channel_count(),
            "counters": state.hub.counters().snapshot(),
        })),
    )
}
