use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatch::{ActionResult, Dispatcher};
use crate::engine::{ConnectionState, EngineError, EngineHandle};
use crate::error::{CastError, Result};
use crate::model::{Button, Configuration, ConfigurationSummary};
use crate::session::{PushEvent, SessionRegistry};
use crate::status::{StatusBroadcaster, StatusPush};
use crate::store::{ConfigStore, CreateConfiguration, UpdateConfiguration};

/// Everything the handlers need.
pub struct AppState {
    pub store: Arc<ConfigStore>,
    pub dispatcher: Dispatcher,
    pub engine: EngineHandle,
    pub registry: Arc<SessionRegistry>,
    pub broadcaster: Arc<StatusBroadcaster>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    NotFound,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

type Rejection = (StatusCode, Json<ApiError>);
type ApiResult<T> = std::result::Result<T, Rejection>;

fn reject(err: CastError) -> Rejection {
    let (status, code) = match &err {
        CastError::Validation(_) => (StatusCode::BAD_REQUEST, ErrorCode::Validation),
        CastError::NotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal),
    };
    (
        status,
        Json(ApiError {
            code,
            message: err.to_string(),
        }),
    )
}

/// Engine read-throughs surface the engine's availability directly instead
/// of the press-result envelope.
fn reject_engine(err: &EngineError) -> Rejection {
    let (status, code) = match err {
        EngineError::Unreachable | EngineError::ConnectionLost => {
            (StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Unavailable)
        }
        EngineError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, ErrorCode::Unavailable),
        EngineError::Rejected { .. } => (StatusCode::BAD_GATEWAY, ErrorCode::Internal),
    };
    (
        status,
        Json(ApiError {
            code,
            message: err.to_string(),
        }),
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(get_status))
        .route(
            "/api/configurations",
            get(list_configurations).post(create_configuration),
        )
        .route(
            "/api/configurations/current",
            get(get_current).put(set_current),
        )
        .route(
            "/api/configurations/:id",
            get(get_configuration)
                .put(update_configuration)
                .delete(delete_configuration),
        )
        .route("/api/configurations/:id/buttons", put(upsert_button))
        .route(
            "/api/configurations/:id/buttons/:button_id",
            delete(delete_button),
        )
        .route("/api/press", post(press))
        .route("/api/scenes", get(list_scenes))
        .route("/api/inputs", get(list_inputs))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Serve the API until the token fires.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub connection: ConnectionState,
    #[serde(flatten)]
    pub status: StatusPush,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusBody> {
    let connection = state.engine.state();
    let status = StatusPush::compose(connection, &state.engine.status());
    Json(StatusBody { connection, status })
}

async fn list_configurations(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<ConfigurationSummary>> {
    Json(state.store.list())
}

async fn create_configuration(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateConfiguration>,
) -> ApiResult<Json<Configuration>> {
    let config = state.store.create(req).map_err(reject)?;
    notify_changed(&state, &config);
    Ok(Json(config))
}

async fn get_current(State(state): State<Arc<AppState>>) -> Json<Configuration> {
    Json(state.store.current().as_ref().clone())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetCurrentRequest {
    pub id: String,
}

async fn set_current(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetCurrentRequest>,
) -> ApiResult<Json<Configuration>> {
    let config = state.store.set_current(&req.id).map_err(reject)?;
    notify_changed(&state, &config);
    Ok(Json(config))
}

async fn get_configuration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Configuration>> {
    let config = state.store.get(&id).map_err(reject)?;
    Ok(Json(config))
}

async fn update_configuration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateConfiguration>,
) -> ApiResult<Json<Configuration>> {
    let config = state.store.update(&id, req).map_err(reject)?;
    notify_changed(&state, &config);
    Ok(Json(config))
}

async fn delete_configuration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let repointed = state.store.delete(&id).map_err(reject)?;
    state
        .registry
        .broadcast(&PushEvent::ConfigurationDeleted { id });
    if let Some(config) = repointed {
        notify_changed(&state, &config);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn upsert_button(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(button): Json<Button>,
) -> ApiResult<Json<Configuration>> {
    let config = state.store.upsert_button(&id, button).map_err(reject)?;
    notify_changed(&state, &config);
    Ok(Json(config))
}

async fn delete_button(
    State(state): State<Arc<AppState>>,
    Path((id, button_id)): Path<(String, String)>,
) -> ApiResult<Json<Configuration>> {
    let config = state
        .store
        .delete_button(&id, &button_id)
        .map_err(reject)?;
    notify_changed(&state, &config);
    Ok(Json(config))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PressRequest {
    pub row: u8,
    pub col: u8,
}

async fn press(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PressRequest>,
) -> Json<ActionResult> {
    Json(state.dispatcher.press(req.row, req.col).await)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SceneListBody {
    pub scenes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputListBody {
    pub inputs: Vec<String>,
}

/// Scene names straight from the engine, for picking switch targets.
async fn list_scenes(State(state): State<Arc<AppState>>) -> ApiResult<Json<SceneListBody>> {
    let scenes = state
        .engine
        .list_scenes()
        .await
        .map_err(|e| reject_engine(&e))?;
    Ok(Json(SceneListBody { scenes }))
}

/// Input names straight from the engine, for picking mute targets.
async fn list_inputs(State(state): State<Arc<AppState>>) -> ApiResult<Json<InputListBody>> {
    let inputs = state
        .engine
        .list_inputs()
        .await
        .map_err(|e| reject_engine(&e))?;
    Ok(Json(InputListBody { inputs }))
}

fn notify_changed(state: &AppState, config: &Configuration) {
    let current = state.store.current_id() == config.id;
    state.registry.broadcast(&PushEvent::ConfigurationChanged {
        configuration: config.summary(current),
    });
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

/// One push session: register, deliver the welcome snapshot, then forward
/// queued events until either side goes away. Registration and welcome go
/// through the broadcaster so a status push cannot land between them.
async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let fallback = StatusPush::compose(state.engine.state(), &state.engine.status());
    let (session_id, mut events) = state.broadcaster.register_session(fallback);
    info!(
        "{session_id} connected ({} active)",
        state.registry.session_count()
    );

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = events.recv() => {
                // A closed queue means the registry evicted us.
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // The push channel is one-way; inbound frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.registry.unregister(session_id);
    info!(
        "{session_id} disconnected ({} active)",
        state.registry.session_count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::header::CONTENT_TYPE;
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::config::schema::{EngineSettings, SessionSettings};
    use std::time::Duration;

    fn test_state() -> Arc<AppState> {
        let settings = EngineSettings {
            host: "127.0.0.1".to_string(),
            port: 9,
            password: String::new(),
            reconnect_base_ms: 50,
            reconnect_cap_ms: 200,
            action_timeout_ms: 500,
        };
        let sessions = SessionSettings::default();
        let cancel = CancellationToken::new();
        let (engine, _task) = crate::engine::spawn(&settings, cancel);

        let store = Arc::new(ConfigStore::in_memory());
        let registry = Arc::new(SessionRegistry::new(
            sessions.queue_capacity,
            sessions.failure_threshold,
        ));
        let broadcaster = Arc::new(StatusBroadcaster::new(Arc::clone(&registry)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            engine.clone(),
            Duration::from_millis(500),
        );
        Arc::new(AppState {
            store,
            dispatcher,
            engine,
            registry,
            broadcaster,
        })
    }

    async fn request(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        let response = router(Arc::clone(state))
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, json)
    }

    #[tokio::test]
    async fn healthz_responds() {
        let state = test_state();
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_create_and_fetch_configurations() {
        let state = test_state();

        let (status, json) = request(&state, "GET", "/api/configurations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(Vec::len), Some(1));
        assert_eq!(json[0]["id"], "cfg-1");
        assert_eq!(json[0]["current"], true);

        let (status, json) = request(
            &state,
            "POST",
            "/api/configurations",
            Some(serde_json::json!({
                "name": "Late Night",
                "grid": { "rows": 2, "cols": 3 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], "cfg-2");
        assert_eq!(json["grid"]["cols"], 3);

        let (status, json) = request(&state, "GET", "/api/configurations/cfg-2", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["name"], "Late Night");

        let (status, json) = request(&state, "GET", "/api/configurations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn create_rejects_invalid_payload() {
        let state = test_state();
        let (status, json) = request(
            &state,
            "POST",
            "/api/configurations",
            Some(serde_json::json!({
                "name": "   ",
                "grid": { "rows": 2, "cols": 2 }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "validation");
    }

    #[tokio::test]
    async fn missing_configuration_is_404() {
        let state = test_state();
        let (status, json) = request(&state, "GET", "/api/configurations/cfg-99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");

        let (status, json) = request(
            &state,
            "PUT",
            "/api/configurations/current",
            Some(serde_json::json!({ "id": "cfg-99" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn press_on_empty_cell_is_no_button() {
        let state = test_state();
        let (status, json) = request(
            &state,
            "POST",
            "/api/press",
            Some(serde_json::json!({ "row": 2, "col": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "no_button");
    }

    #[tokio::test]
    async fn upsert_button_rejects_occupied_cell() {
        let state = test_state();
        // Seed layout holds a button at (0,0) already.
        let (status, json) = request(
            &state,
            "PUT",
            "/api/configurations/cfg-1/buttons",
            Some(serde_json::json!({
                "row": 0,
                "col": 0,
                "text": "Clash",
                "action": { "type": "start_stream" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "validation");
    }

    #[tokio::test]
    async fn button_lifecycle_over_http() {
        let state = test_state();
        let (status, json) = request(
            &state,
            "PUT",
            "/api/configurations/cfg-1/buttons",
            Some(serde_json::json!({
                "row": 2,
                "col": 4,
                "text": "Mute Mic",
                "action": { "type": "toggle_mute", "params": { "input": "Mic/Aux" } }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["buttons"].as_array().map(Vec::len), Some(3));

        let (status, json) = request(
            &state,
            "DELETE",
            "/api/configurations/cfg-1/buttons/btn-2-4",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["buttons"].as_array().map(Vec::len), Some(2));

        let (status, json) = request(
            &state,
            "DELETE",
            "/api/configurations/cfg-1/buttons/btn-2-4",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn delete_configuration_rules() {
        let state = test_state();
        let (_, created) = request(
            &state,
            "POST",
            "/api/configurations",
            Some(serde_json::json!({
                "name": "Temp",
                "grid": { "rows": 1, "cols": 1 }
            })),
        )
        .await;
        let id = created["id"].as_str().expect("id").to_string();

        let (status, _) =
            request(&state, "DELETE", &format!("/api/configurations/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = request(&state, "DELETE", "/api/configurations/cfg-1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "validation");
    }

    #[tokio::test]
    async fn status_endpoint_reports_disconnected_engine() {
        let state = test_state();
        let (status, json) = request(&state, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["connected"], false);
        assert!(json["connection"].is_string());
    }

    #[tokio::test]
    async fn configuration_changes_are_pushed_to_sessions() {
        let state = test_state();
        let (_id, mut rx) = state.registry.register();

        let (_, created) = request(
            &state,
            "POST",
            "/api/configurations",
            Some(serde_json::json!({
                "name": "Pushed",
                "grid": { "rows": 1, "cols": 2 }
            })),
        )
        .await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for push")
            .expect("push channel closed");
        match event {
            PushEvent::ConfigurationChanged { configuration } => {
                assert_eq!(Some(configuration.id.as_str()), created["id"].as_str());
                assert_eq!(configuration.name, "Pushed");
                assert!(!configuration.current);
            }
            other => panic!("expected configuration_changed, got {other:?}"),
        }

        let (_, _) = request(
            &state,
            "PUT",
            "/api/configurations/current",
            Some(serde_json::json!({ "id": created["id"] })),
        )
        .await;
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for push")
            .expect("push channel closed");
        match event {
            PushEvent::ConfigurationChanged { configuration } => {
                assert!(configuration.current);
            }
            other => panic!("expected configuration_changed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scene_and_input_lists_need_the_engine() {
        let state = test_state();

        let (status, json) = request(&state, "GET", "/api/scenes", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["code"], "unavailable");

        let (status, json) = request(&state, "GET", "/api/inputs", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["code"], "unavailable");
    }

    #[tokio::test]
    async fn upsert_button_with_missing_action_param_is_rejected() {
        let state = test_state();
        // set_source_visibility requires `visible`; the body must be refused
        // before it reaches the store.
        let body = serde_json::json!({
            "row": 1,
            "col": 2,
            "text": "Cam",
            "action": { "type": "set_source_visibility", "params": { "source": "Camera" } }
        });
        let response = router(Arc::clone(&state))
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/configurations/cfg-1/buttons")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let (_, json) = request(&state, "GET", "/api/configurations/cfg-1", None).await;
        assert_eq!(json["buttons"].as_array().map(Vec::len), Some(2));
    }
}
