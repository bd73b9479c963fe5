//! HTTP API for update presenters
//!
//! This module provides:
//! - REST endpoints for the controller's queries and commands
//! - A WebSocket event stream that starts with a snapshot of every update
//!
//! All routes live under `/api/v1`. Browsers only get cross-origin access
//! for the origins listed in the configuration, and local imports are
//! confined to the configured import directory.

use std::net::SocketAddr;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use ota_updater::presenter::sort_newest_first;
use ota_updater::{
    latest_update, InstallBlocker, LocalImport, ServiceHandle, SubscriptionError, UpdateInfo,
    UpdateView, UpdaterError,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Shared state for HTTP handlers
pub struct AppState {
    /// Handle to the running updater service
    pub handle: ServiceHandle,
    /// Directory local imports are resolved against
    pub import_dir: PathBuf,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

impl ApiError {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn api_error(e: &UpdaterError) -> (StatusCode, Json<ApiError>) {
    let (status, code) = match e {
        UpdaterError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        UpdaterError::DownloadInProgress(_) | UpdaterError::InstallInProgress(_) => {
            (StatusCode::CONFLICT, "busy")
        }
        UpdaterError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
        UpdaterError::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, "unsupported"),
        UpdaterError::InstallBlocked(_) => (StatusCode::PRECONDITION_FAILED, "install_blocked"),
        UpdaterError::ImportRejected(_) => (StatusCode::FORBIDDEN, "import_rejected"),
        UpdaterError::Verification(_) => (StatusCode::UNPROCESSABLE_ENTITY, "verification_failed"),
        UpdaterError::Manifest(_) | UpdaterError::Network(_) => {
            (StatusCode::BAD_GATEWAY, "update_server_error")
        }
        UpdaterError::ServiceStopped => (StatusCode::SERVICE_UNAVAILABLE, "service_stopped"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    (status, Json(ApiError::new(code, &e.to_string())))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateListResponse {
    updates: Vec<UpdateInfo>,
    latest: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDetailResponse {
    update: UpdateInfo,
    view: UpdateView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckResponse {
    new_updates: bool,
    updates: Vec<UpdateInfo>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    busy: bool,
    downloading: bool,
    verifying: bool,
    installing: bool,
    installing_ab: bool,
    install_blocker: Option<InstallBlocker>,
    last_check: Option<DateTime<Utc>>,
    observers: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImportRequest {
    /// Relative to the import directory
    path: PathBuf,
    name: Option<String>,
    version: String,
    timestamp: i64,
}

#[derive(Deserialize)]
struct PerformanceModeRequest {
    enabled: bool,
}

/// First frame of the event stream.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamFrame {
    Snapshot { updates: Vec<UpdateInfo> },
}

// ============================================================================
// Server
// ============================================================================

/// Start the HTTP API server
pub async fn run_http_server(
    addr: SocketAddr,
    state: AppState,
    cors_origins: &[String],
) -> anyhow::Result<()> {
    let app = build_app_router(Arc::new(state), cors_origins);

    info!(address = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the application router with all routes
pub fn build_app_router(state: Arc<AppState>, cors_origins: &[String]) -> Router {
    let cors = cors_layer(cors_origins);

    let api_routes = Router::new()
        .route("/status", get(get_status))
        .route("/check", post(check_now))
        .route("/events", get(event_stream))
        .route("/import", post(import_local))
        .route("/install/stop", post(stop_install))
        .route("/settings/performance-mode", post(set_performance_mode))
        .route("/updates", get(list_updates))
        .route("/updates/:id", get(get_update))
        .route("/updates/:id", delete(delete_update))
        .route("/updates/:id/download", post(start_download))
        .route("/updates/:id/pause", post(pause_download))
        .route("/updates/:id/resume", post(resume_download))
        .route("/updates/:id/install", post(install_update))
        .route("/updates/:id/suspend", post(suspend_install))
        .route("/updates/:id/resume-install", post(resume_install))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .fallback(api_only_fallback)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// CORS for the listed origins only. With none listed, cross-origin browser
/// requests get no CORS headers and are refused by the browser.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if !origins.is_empty() {
        info!(origins = origins.len(), "Cross-origin access enabled");
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

async fn api_only_fallback() -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new("not_found", "No such endpoint")),
    )
}

// ============================================================================
// Queries
// ============================================================================

/// GET /api/v1/updates - All known updates, newest first
async fn list_updates(State(state): State<Arc<AppState>>) -> Json<UpdateListResponse> {
    let mut updates = state.handle.controller().get_updates();
    sort_newest_first(&mut updates);
    let latest = latest_update(&updates).map(|u| u.download_id.clone());
    Json(UpdateListResponse { updates, latest })
}

/// GET /api/v1/updates/:id - One update with its presenter view
async fn get_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<UpdateDetailResponse>> {
    let controller = state.handle.controller();
    let update = controller
        .get_update(&id)
        .ok_or_else(|| api_error(&UpdaterError::NotFound(id.clone())))?;
    let view = controller.view(&id);
    Ok(Json(UpdateDetailResponse { update, view }))
}

/// GET /api/v1/status - Activity flags and last check time
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let controller = state.handle.controller();
    Json(StatusResponse {
        busy: controller.is_busy(),
        downloading: controller.has_active_downloads(),
        verifying: controller.is_any_verifying(),
        installing: controller.is_any_installing(),
        installing_ab: controller.is_installing_ab(),
        install_blocker: controller.install_blocker(),
        last_check: controller.last_check(),
        observers: controller.observer_count(),
    })
}

// ============================================================================
// Commands
// ============================================================================

fn accepted(result: ota_updater::Result<()>, id: &str, action: &str) -> ApiResult<StatusCode> {
    match result {
        Ok(()) => {
            info!(download_id = %id, action = action, "Command accepted via HTTP API");
            Ok(StatusCode::ACCEPTED)
        }
        Err(e) => {
            debug!(download_id = %id, action = action, error = %e, "Command rejected");
            Err(api_error(&e))
        }
    }
}

/// POST /api/v1/check - Check for updates now
async fn check_now(State(state): State<Arc<AppState>>) -> ApiResult<Json<CheckResponse>> {
    match state.handle.check_now().await {
        Ok(outcome) => Ok(Json(CheckResponse {
            new_updates: outcome.new_updates,
            updates: outcome.updates,
        })),
        Err(e) => {
            warn!(error = %e, "Update check via HTTP API failed");
            Err(api_error(&e))
        }
    }
}

/// POST /api/v1/updates/:id/download
async fn start_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.handle.controller().start_download(&id), &id, "download")
}

/// POST /api/v1/updates/:id/pause
async fn pause_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.handle.controller().pause_download(&id), &id, "pause")
}

/// POST /api/v1/updates/:id/resume
async fn resume_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.handle.controller().resume_download(&id), &id, "resume")
}

/// POST /api/v1/updates/:id/install
async fn install_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.handle.install(&id), &id, "install")
}

/// POST /api/v1/updates/:id/suspend
async fn suspend_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(state.handle.controller().suspend_installation(&id), &id, "suspend")
}

/// POST /api/v1/updates/:id/resume-install
async fn resume_install(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    accepted(
        state.handle.controller().resume_installation(&id),
        &id,
        "resume-install",
    )
}

/// DELETE /api/v1/updates/:id
async fn delete_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    match state.handle.controller().delete_update(&id) {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(api_error(&e)),
    }
}

/// POST /api/v1/install/stop - Stop whatever installation is running
async fn stop_install(State(state): State<Arc<AppState>>) -> ApiResult<StatusCode> {
    match state.handle.stop_install() {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(api_error(&e)),
    }
}

/// Resolve a requested import below `import_dir`. Only plain relative paths
/// are accepted, and symlinks may not lead out of the directory.
async fn resolve_import(import_dir: &FsPath, requested: &FsPath) -> Result<PathBuf, UpdaterError> {
    let plain = !requested.as_os_str().is_empty()
        && requested
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(UpdaterError::ImportRejected(format!(
            "{} is not a path inside the import directory",
            requested.display()
        )));
    }

    let root = tokio::fs::canonicalize(import_dir).await.map_err(|e| {
        UpdaterError::ImportRejected(format!(
            "import directory {} unavailable: {}",
            import_dir.display(),
            e
        ))
    })?;
    let source = tokio::fs::canonicalize(root.join(requested))
        .await
        .map_err(|e| UpdaterError::ImportRejected(format!("{}: {}", requested.display(), e)))?;
    if !source.starts_with(&root) {
        return Err(UpdaterError::ImportRejected(format!(
            "{} leads outside the import directory",
            requested.display()
        )));
    }
    if !tokio::fs::metadata(&source).await?.is_file() {
        return Err(UpdaterError::ImportRejected(format!(
            "{} is not a regular file",
            requested.display()
        )));
    }
    Ok(source)
}

/// POST /api/v1/import - Sideload a package from the import directory
async fn import_local(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<Json<UpdateInfo>> {
    let source = match resolve_import(&state.import_dir, &request.path).await {
        Ok(source) => source,
        Err(e) => {
            warn!(path = %request.path.display(), error = %e, "Local import refused");
            return Err(api_error(&e));
        }
    };

    let name = request.name.unwrap_or_else(|| {
        request
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "update.zip".to_string())
    });
    let meta = LocalImport {
        name,
        version: request.version,
        timestamp: request.timestamp,
    };

    match state.handle.controller().import_local(&source, meta).await {
        Ok(update) => Ok(Json(update)),
        Err(e) => {
            warn!(path = %request.path.display(), error = %e, "Local import failed");
            Err(api_error(&e))
        }
    }
}

/// POST /api/v1/settings/performance-mode
async fn set_performance_mode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PerformanceModeRequest>,
) -> StatusCode {
    state
        .handle
        .controller()
        .set_performance_mode(request.enabled);
    StatusCode::NO_CONTENT
}

// ============================================================================
// Event stream
// ============================================================================

/// GET /api/v1/events - WebSocket: snapshot frame, then one frame per event
async fn event_stream(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
        .into_response()
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> Result<(), axum::Error> {
    match serde_json::to_string(value) {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            warn!(error = %e, "Failed to encode event frame");
            Ok(())
        }
    }
}

async fn stream_events(mut socket: WebSocket, state: Arc<AppState>) {
    let observer = Uuid::new_v4();
    info!(observer = %observer, "Event stream attached");

    let (snapshot, mut events) = state.handle.attach();
    if send_json(&mut socket, &StreamFrame::Snapshot { updates: snapshot })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(SubscriptionError::Lagged(missed)) => {
                    warn!(observer = %observer, missed = missed, "Observer fell behind, resending snapshot");
                    let (snapshot, fresh) = state.handle.attach();
                    events = fresh;
                    if send_json(&mut socket, &StreamFrame::Snapshot { updates: snapshot })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(SubscriptionError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(observer = %observer, "Event stream detached");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ota_updater::mock::{
        MockDeviceConditions, MockDownloader, MockInstaller, MockManifestSource, MockVerifier,
    };
    use ota_updater::{BuildInfo, Collaborators, MemoryStore, UpdaterConfig, UpdaterService};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const LIST: &str = r#"{"response": [{"datetime": 200, "filename": "a.zip", "id": "a",
        "romtype": "nightly", "size": 1000, "url": "mock://a", "version": "1.0"}]}"#;

    async fn app(dir: &TempDir) -> Router {
        app_with(dir, &[], Arc::new(MockDeviceConditions::new())).await
    }

    async fn app_with(
        dir: &TempDir,
        origins: &[String],
        device: Arc<MockDeviceConditions>,
    ) -> Router {
        let config = UpdaterConfig {
            download_dir: dir.path().join("updates"),
            manifest_cache: dir.path().join("updates.json"),
            check_interval: "never".to_string(),
            build: BuildInfo {
                timestamp: 100,
                ..BuildInfo::default()
            },
            ..UpdaterConfig::default()
        };
        let collaborators = Collaborators {
            downloader: Arc::new(MockDownloader::new()),
            verifier: Arc::new(MockVerifier::new()),
            installer: Arc::new(MockInstaller::new()),
            store: Arc::new(MemoryStore::new()),
            manifest_source: Arc::new(MockManifestSource::with_body(LIST.as_bytes().to_vec())),
            device,
        };
        let handle = UpdaterService::start(config, collaborators).await.unwrap();

        let import_dir = dir.path().join("import");
        std::fs::create_dir_all(&import_dir).unwrap();
        build_app_router(Arc::new(AppState { handle, import_dir }), origins)
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    fn import(path: &str) -> serde_json::Value {
        serde_json::json!({ "path": path, "version": "1.0", "timestamp": 150 })
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_check_then_list() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "GET", "/api/v1/updates").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updates"].as_array().unwrap().len(), 0);

        let (status, body) = call(&app, "POST", "/api/v1/check").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["newUpdates"], true);

        let (_, body) = call(&app, "GET", "/api/v1/updates").await;
        assert_eq!(body["latest"], "a");

        let (status, body) = call(&app, "GET", "/api/v1/updates/a").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["update"]["download_id"], "a");
        assert_eq!(body["view"]["active_layout"], false);
    }

    #[tokio::test]
    async fn test_command_errors_map_to_status_codes() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;

        let (status, body) = call(&app, "POST", "/api/v1/updates/missing/download").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        call(&app, "POST", "/api/v1/check").await;
        let (status, body) = call(&app, "POST", "/api/v1/updates/a/install").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_state");

        let (status, _) = call(&app, "POST", "/api/v1/install/stop").await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "GET", "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_download_and_delete() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;
        call(&app, "POST", "/api/v1/check").await;

        let (status, _) = call(&app, "POST", "/api/v1/updates/a/download").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = call(&app, "GET", "/api/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["lastCheck"].is_string());

        let (status, _) = call(&app, "DELETE", "/api/v1/updates/a").await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", "/api/v1/updates/a").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_import_is_confined_to_import_dir() {
        let dir = TempDir::new().unwrap();
        let app = app(&dir).await;
        std::fs::write(dir.path().join("secret.txt"), b"not an update").unwrap();
        std::fs::write(dir.path().join("import").join("pkg.zip"), vec![7u8; 512]).unwrap();

        for path in ["../secret.txt", "/etc/passwd", "", "nested/../../secret.txt"] {
            let (status, body) = post_json(&app, "/api/v1/import", import(path)).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{} accepted", path);
            assert_eq!(body["error"], "import_rejected");
        }

        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(
                dir.path().join("secret.txt"),
                dir.path().join("import").join("link.zip"),
            )
            .unwrap();
            let (status, _) = post_json(&app, "/api/v1/import", import("link.zip")).await;
            assert_eq!(status, StatusCode::FORBIDDEN);
        }

        let (status, body) = post_json(&app, "/api/v1/import", import("pkg.zip")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["download_id"], "local");
        assert_eq!(body["file_size"], 512);
    }

    async fn preflight(app: &Router, origin: &str) -> Option<String> {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/import")
            .header("origin", origin)
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    #[tokio::test]
    async fn test_cross_origin_access_needs_listed_origin() {
        let dir = TempDir::new().unwrap();
        let closed = app(&dir).await;
        assert_eq!(preflight(&closed, "https://attacker.example").await, None);

        let dir = TempDir::new().unwrap();
        let open = app_with(
            &dir,
            &["http://localhost:3000".to_string()],
            Arc::new(MockDeviceConditions::new()),
        )
        .await;
        assert_eq!(
            preflight(&open, "http://localhost:3000").await.as_deref(),
            Some("http://localhost:3000")
        );
        assert_eq!(preflight(&open, "https://attacker.example").await, None);
    }

    #[tokio::test]
    async fn test_blocked_install_is_precondition_failed() {
        let dir = TempDir::new().unwrap();
        let device = Arc::new(MockDeviceConditions::new());
        let app = app_with(&dir, &[], device.clone()).await;

        let (_, body) = call(&app, "GET", "/api/v1/status").await;
        assert!(body["installBlocker"].is_null());

        call(&app, "POST", "/api/v1/check").await;
        call(&app, "POST", "/api/v1/updates/a/download").await;
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let (_, body) = call(&app, "GET", "/api/v1/updates/a").await;
            if body["update"]["status"] == "VERIFIED" {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "download never verified");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        device.set_battery(5, false);
        let (_, body) = call(&app, "GET", "/api/v1/status").await;
        assert_eq!(body["installBlocker"]["code"], "battery_low");
        assert_eq!(body["installBlocker"]["required"], 30);

        let (status, body) = call(&app, "POST", "/api/v1/updates/a/install").await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["error"], "install_blocked");

        let (_, body) = call(&app, "GET", "/api/v1/updates/a").await;
        assert_eq!(body["view"]["notice"], "battery_low");
        assert_eq!(body["view"]["primary"]["enabled"], false);
    }
}
