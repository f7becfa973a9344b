use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use relay_hub::EventHub;

use crate::routes;
use crate::ws;

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 9102 }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<EventHub>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/subscribe", post(routes::subscribe_handler))
        .route("/unsubscribe", post(routes::unsubscribe_handler))
        .route("/health", get(routes::health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Returns a handle holding the bound port and the server
/// task.
pub async fn start(config: ServerConfig, hub: Arc<EventHub>) -> Result<ServerHandle, std::io::Error> {
    let router = build_router(AppState { hub });
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "relay server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}

/// Handle returned by `start()` — keeps the server task alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use relay_core::ids::{AnalysisId, TeamId, UserId};
    use relay_core::memory::MemoryProviders;
    use relay_core::model::{AnalysisRecord, Role, UNCATEGORIZED_TEAM};
    use relay_hub::HubConfig;

    fn test_hub() -> (Arc<EventHub>, MemoryProviders) {
        let providers = MemoryProviders::new();
        let hub = Arc::new(EventHub::new(
            HubConfig::default(),
            providers.auth.clone(),
            providers.analyses.clone(),
            providers.teams.clone(),
            providers.users.clone(),
            providers.metrics.clone(),
        ));
        (hub, providers)
    }

    async fn serve(hub: Arc<EventHub>) -> u16 {
        let handle = start(ServerConfig { port: 0 }, hub).await.unwrap();
        handle.port
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let (hub, _providers) = test_hub();
        let port = serve(Arc::clone(&hub)).await;

        let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["channels"], 1, "global channel always exists");
    }

    #[tokio::test]
    async fn subscribe_without_session_id_is_400() {
        let (hub, _providers) = test_hub();
        let port = serve(hub).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/subscribe"))
            .json(&serde_json::json!({ "analyses": ["a1"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn subscribe_without_analyses_is_400() {
        let (hub, _providers) = test_hub();
        let port = serve(hub).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/subscribe"))
            .json(&serde_json::json!({ "sessionId": "sess_x" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn subscribe_unknown_session_is_404() {
        let (hub, _providers) = test_hub();
        let port = serve(hub).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/subscribe"))
            .json(&serde_json::json!({ "sessionId": "sess_ghost", "analyses": ["a1"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn subscribe_partial_success_over_http() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(AnalysisRecord {
            id: AnalysisId::from_raw("open"),
            name: "Open".into(),
            team_id: TeamId::from_raw(UNCATEGORIZED_TEAM),
        });
        providers.analyses.insert(AnalysisRecord {
            id: AnalysisId::from_raw("private"),
            name: "Private".into(),
            team_id: TeamId::from_raw("t-secret"),
        });
        let (session_id, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let port = serve(hub).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/subscribe"))
            .json(&serde_json::json!({
                "sessionId": session_id.as_str(),
                "analyses": ["open", "private"],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["subscribed"], serde_json::json!(["open"]));
        assert_eq!(body["denied"], serde_json::json!(["private"]));
    }

    #[tokio::test]
    async fn denied_is_present_even_when_empty() {
        let (hub, providers) = test_hub();
        providers.analyses.insert(AnalysisRecord {
            id: AnalysisId::from_raw("open"),
            name: "Open".into(),
            team_id: TeamId::from_raw(UNCATEGORIZED_TEAM),
        });
        let (session_id, _rx) = hub.add_session(UserId::from_raw("u1"), Role::User);
        let port = serve(hub).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/subscribe"))
            .json(&serde_json::json!({
                "sessionId": session_id.as_str(),
                "analyses": ["open"],
            }))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["denied"].is_array());
        assert_eq!(body["denied"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_session_is_200_empty() {
        let (hub, _providers) = test_hub();
        let port = serve(hub).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/unsubscribe"))
            .json(&serde_json::json!({ "sessionId": "sess_ghost", "analyses": ["a1"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(body["unsubscribed"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn unsubscribe_missing_analyses_is_400() {
        let (hub, _providers) = test_hub();
        let port = serve(hub).await;

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/unsubscribe"))
            .json(&serde_json::json!({ "sessionId": "sess_x" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[test]
    fn build_router_creates_routes() {
        let (hub, _providers) = test_hub();
        let _router = build_router(AppState { hub });
    }
}
