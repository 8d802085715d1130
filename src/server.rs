//! REST facade over an agent session
//!
//! A small axum application exposing the session boundary over HTTP:
//! liveness, service metadata, message send, context reset, and the
//! masked configuration snapshot. Errors map the library taxonomy onto
//! HTTP statuses and a `{error, kind}` envelope.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

use crate::agent::AgentSession;
use crate::error::Error;
use crate::Result;

/// Standardised API error response body.
///
/// Every error returned by the HTTP layer serialises as:
/// ```json
/// { "error": "<message>", "kind": "<kind>" }
/// ```
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    kind: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    kind: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: message.into(),
            kind: "invalid_request".to_string(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Protocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            error: err.to_string(),
            kind: err.kind().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            kind: self.kind,
        };
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    message: String,
    #[serde(default = "default_maintain_context")]
    maintain_context: bool,
}

fn default_maintain_context() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    response: String,
}

/// Running HTTP facade bound to a local address.
pub struct Server {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Server {
    /// Bind the facade and start serving in a background task.
    pub async fn bind(addr: &str, session: Arc<AgentSession>) -> Result<Self> {
        let app = router(session);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        tracing::info!("REST facade listening on {}", addr);
        Ok(Server {
            addr,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&mut self) {
        if let Some(sender) = self.shutdown.take() {
            let _ = sender.send(());
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the facade router around one shared session.
pub fn router(session: Arc<AgentSession>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/", get(root))
        .route("/messages", post(send_message))
        .route("/reset", post(reset))
        .route("/config", get(config_info))
        .with_state(session)
        .layer(cors)
}

async fn health(State(session): State<Arc<AgentSession>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "agent": session.config().agent_name,
        "environment_id": session.config().environment_id,
        "state": session.state().to_string(),
    }))
}

async fn root(State(session): State<Arc<AgentSession>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "description": env!("CARGO_PKG_DESCRIPTION"),
        "agent": session.config().agent_name,
        "config": session.config().snapshot(),
    }))
}

async fn send_message(
    State(session): State<Arc<AgentSession>>,
    Json(request): Json<MessageRequest>,
) -> std::result::Result<Json<MessageResponse>, ApiError> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let response = session
        .send_message_with(&request.message, request.maintain_context)
        .await?;
    Ok(Json(MessageResponse { response }))
}

async fn reset(State(session): State<Arc<AgentSession>>) -> Json<serde_json::Value> {
    session.reset_context().await;
    Json(json!({"status": "reset"}))
}

async fn config_info(State(session): State<Arc<AgentSession>>) -> Json<serde_json::Value> {
    let info = session.info().await;
    Json(serde_json::to_value(info).unwrap_or_else(|_| json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::{FakeOutcome, FakeTransport};
    use crate::auth::NoAuthProvider;
    use crate::config::{test_config, AuthMode};

    fn facade_session(transport: FakeTransport) -> Arc<AgentSession> {
        Arc::new(
            AgentSession::with_transport(
                test_config(AuthMode::None),
                Box::new(NoAuthProvider),
                Box::new(transport),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_health_and_root() {
        let session = facade_session(FakeTransport::replying("ok"));
        let mut server = Server::bind("127.0.0.1:0", session).await.unwrap();
        let base = format!("http://{}", server.addr());

        let health: serde_json::Value = reqwest::get(format!("{}/health", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["environment_id"], "env-123");

        let root: serde_json::Value = reqwest::get(&base).await.unwrap().json().await.unwrap();
        assert_eq!(root["name"], "copilot-agent");
        // Config snapshot in metadata is masked
        assert!(root["config"]["client_secret"].as_str().unwrap().starts_with("****"));

        server.shutdown();
    }

    #[tokio::test]
    async fn test_send_message_roundtrip() {
        let session = facade_session(FakeTransport::replying("re: {msg}"));
        let mut server = Server::bind("127.0.0.1:0", session.clone()).await.unwrap();
        let base = format!("http://{}", server.addr());

        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("{}/messages", base))
            .json(&json!({"message": "hello"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["response"], "re: hello");
        assert_eq!(session.turn_count(), 2);

        // maintain_context=false leaves the log untouched
        let response = client
            .post(format!("{}/messages", base))
            .json(&json!({"message": "again", "maintain_context": false}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(session.turn_count(), 2);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_reset_route_clears_context() {
        let session = facade_session(FakeTransport::replying("ok"));
        let mut server = Server::bind("127.0.0.1:0", session.clone()).await.unwrap();
        let base = format!("http://{}", server.addr());

        let client = reqwest::Client::new();
        client
            .post(format!("{}/messages", base))
            .json(&json!({"message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(session.turn_count(), 2);

        let response = client
            .post(format!("{}/reset", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(session.turn_count(), 0);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_error_envelope_and_status_mapping() {
        let transport = FakeTransport::scripted(vec![FakeOutcome::Activities(json!([
            {"type": "typing"}
        ]))]);
        let session = facade_session(transport);
        let mut server = Server::bind("127.0.0.1:0", session).await.unwrap();
        let base = format!("http://{}", server.addr());

        let client = reqwest::Client::new();

        // Empty message -> 400
        let response = client
            .post(format!("{}/messages", base))
            .json(&json!({"message": "  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        // Protocol error -> 502 with the error kind in the envelope
        let response = client
            .post(format!("{}/messages", base))
            .json(&json!({"message": "hello"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 502);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["kind"], "protocol");
        assert!(body["error"].as_str().unwrap().contains("no text content"));

        server.shutdown();
    }
}
