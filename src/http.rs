//! Internal HTTP surface shared by the front controller and the workers.
//!
//! Every route requires the internal password in the `authorization` header.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode, header::AUTHORIZATION};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{HostError, HostResult};
use crate::orchestrator::front::INTERNAL_PREFIX;

/// What a node does with the calls it receives on its internal surface.
#[async_trait]
pub trait InternalApi: Send + Sync {
    async fn send_event(&self, event: Value) -> HostResult<()>;
    async fn emit_event(&self, name: String, args: Value) -> HostResult<()>;
    async fn health(&self) -> Value;

    /// Stores a bot's library archive and fans the extraction out to the cluster.
    async fn publish_libraries(&self, bot_id: String, _archive: Vec<u8>) -> HostResult<()> {
        Err(HostError::validation(
            "libraries",
            "botId",
            format!("this node does not host bot `{bot_id}`"),
        ))
    }
}

#[derive(Clone)]
struct InternalState {
    api: Arc<dyn InternalApi>,
    password: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct EmitRequest {
    event: String,
    #[serde(default)]
    args: Value,
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = match &self {
            HostError::Validation { .. } | HostError::Configuration { .. } => StatusCode::BAD_REQUEST,
            HostError::NoWorkers => StatusCode::SERVICE_UNAVAILABLE,
            HostError::MiddlewareTimeout { .. } | HostError::HookTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(api: Arc<dyn InternalApi>, password: &str) -> Router {
    let state = InternalState {
        api,
        password: Arc::from(password),
    };
    let internal = Router::new()
        .route("/sendEvent", post(send_event))
        .route("/emitBotpressEvent", post(emit_event))
        .route("/health", get(health))
        .route("/bots/{bot_id}/libraries", post(publish_libraries))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_internal_auth))
        .with_state(state);
    Router::new().nest(INTERNAL_PREFIX, internal)
}

/// Serves `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    info!(addr = ?listener.local_addr().ok(), "internal api listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn require_internal_auth(State(state): State<InternalState>, req: Request<Body>, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == &*state.password);
    if authorized {
        return next.run(req).await;
    }
    warn!(path = %req.uri().path(), "rejected internal call without a valid password");
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Unauthorized" }))).into_response()
}

async fn send_event(State(state): State<InternalState>, Json(event): Json<Value>) -> Result<StatusCode, HostError> {
    state.api.send_event(event).await?;
    Ok(StatusCode::OK)
}

async fn emit_event(State(state): State<InternalState>, Json(req): Json<EmitRequest>) -> Result<StatusCode, HostError> {
    state.api.emit_event(req.event, req.args).await?;
    Ok(StatusCode::OK)
}

async fn health(State(state): State<InternalState>) -> Json<Value> {
    Json(state.api.health().await)
}

async fn publish_libraries(
    State(state): State<InternalState>,
    Path(bot_id): Path<String>,
    archive: Bytes,
) -> Result<StatusCode, HostError> {
    state.api.publish_libraries(bot_id, archive.to_vec()).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tower::ServiceExt;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Value>>,
        emitted: Mutex<Vec<(String, Value)>>,
        archives: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl InternalApi for Recorder {
        async fn send_event(&self, event: Value) -> HostResult<()> {
            if event.get("direction").is_none() {
                return Err(HostError::validation("event", "direction", "is required"));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }

        async fn emit_event(&self, name: String, args: Value) -> HostResult<()> {
            self.emitted.lock().unwrap().push((name, args));
            Ok(())
        }

        async fn health(&self) -> Value {
            json!({ "node-a": { "bots": {} } })
        }

        async fn publish_libraries(&self, bot_id: String, archive: Vec<u8>) -> HostResult<()> {
            self.archives.lock().unwrap().push((bot_id, archive.len()));
            Ok(())
        }
    }

    struct Front;

    #[async_trait]
    impl InternalApi for Front {
        async fn send_event(&self, _event: Value) -> HostResult<()> {
            Ok(())
        }

        async fn emit_event(&self, _name: String, _args: Value) -> HostResult<()> {
            Ok(())
        }

        async fn health(&self) -> Value {
            json!({})
        }
    }

    fn upload(auth: &str, bytes: &'static [u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/internal/bots/welcome/libraries")
            .header("content-type", "application/octet-stream")
            .header(AUTHORIZATION, auth)
            .body(Body::from(bytes))
            .unwrap()
    }

    fn request(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(auth) = auth {
            builder = builder.header(AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn missing_or_wrong_password_is_rejected() {
        let api = Arc::new(Recorder::default());
        let app = router(api.clone(), "secret");

        let resp = app
            .clone()
            .oneshot(request("/api/internal/sendEvent", None, json!({ "direction": "incoming" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(request("/api/internal/sendEvent", Some("nope"), json!({ "direction": "incoming" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(api.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn authorized_calls_reach_the_node() {
        let api = Arc::new(Recorder::default());
        let app = router(api.clone(), "secret");

        let resp = app
            .clone()
            .oneshot(request("/api/internal/sendEvent", Some("secret"), json!({ "direction": "outgoing" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .clone()
            .oneshot(request(
                "/api/internal/emitBotpressEvent",
                Some("secret"),
                json!({ "event": "after_bot_mount", "args": { "botId": "welcome" } }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(api.emitted.lock().unwrap()[0].0, "after_bot_mount");

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/internal/health")
                    .header(AUTHORIZATION, "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let health: Value = serde_json::from_slice(&body).unwrap();
        assert!(health.get("node-a").is_some());
    }

    #[tokio::test]
    async fn validation_errors_are_bad_requests() {
        let app = router(Arc::new(Recorder::default()), "secret");
        let resp = app
            .oneshot(request("/api/internal/sendEvent", Some("secret"), json!({ "type": "text" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn library_archives_reach_the_node() {
        let api = Arc::new(Recorder::default());
        let app = router(api.clone(), "secret");

        let resp = app.clone().oneshot(upload("nope", b"tgz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app.oneshot(upload("secret", b"tgz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*api.archives.lock().unwrap(), vec![("welcome".to_string(), 3)]);
    }

    #[tokio::test]
    async fn nodes_without_bots_refuse_library_archives() {
        let app = router(Arc::new(Front), "secret");
        let resp = app.oneshot(upload("secret", b"tgz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
