//! REST and WebSocket surface.
//!
//! Dispatches to the lifecycle manager and the callback fabric. Malformed
//! payloads and missing required fields are rejected here, before any
//! manager state is touched. This is also the only layer that converts
//! error kinds into HTTP status codes.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use sandcastle_core::error::FleetError;
use sandcastle_runtime::callback::MAX_FRAME_SIZE;
use sandcastle_runtime::vm::{CreateRequest, UploadFile, VmManager, VmView};
use sandcastle_runtime::SessionRegistry;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<VmManager>,
    pub sessions: Arc<SessionRegistry>,
}

/// Build the `/v1` router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/vms", post(start_vm).get(list_vms).delete(destroy_all))
        .route(
            "/v1/vms/:name",
            get(get_vm).delete(destroy_vm).patch(update_vm_state),
        )
        .route("/v1/vms/:name/snapshots", post(snapshot_vm))
        .route("/v1/vms/:name/cmd", post(vm_command))
        .route("/v1/vms/:name/files", post(file_upload).get(file_download))
        .route("/v1/vms/:name/ws", get(open_session))
        .route("/v1/internal/callback", post(internal_callback))
        .route("/v1/health", get(health))
        .with_state(state)
}

/// Error wrapper carrying the `{error: {message}}` body shape.
struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Only surface-level rejections and name conflicts get their own
        // codes. Everything surfacing from the manager, a missing VM
        // included, is a 500.
        let status = match &self.0 {
            FleetError::Validation(_) => StatusCode::BAD_REQUEST,
            FleetError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": { "message": self.0.to_string() } });
        (status, Json(body)).into_response()
    }
}

/// Unwrap a JSON body, mapping rejections to a 400 in our error shape.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError(FleetError::Validation(format!(
            "Invalid request format: {}",
            rejection.body_text()
        )))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartVmBody {
    #[serde(default)]
    vm_name: String,
    kernel: Option<PathBuf>,
    initramfs: Option<PathBuf>,
    entry_point: Option<String>,
    snapshot_id: Option<String>,
    nfs_server: Option<String>,
    nfs_port: Option<u16>,
    nfs_path: Option<String>,
    callback_url: Option<String>,
}

async fn start_vm(
    State(state): State<AppState>,
    payload: Result<Json<StartVmBody>, JsonRejection>,
) -> Result<Json<VmView>, ApiError> {
    let req = body(payload)?;
    if req.vm_name.is_empty() {
        return Err(ApiError(FleetError::Validation("Empty vm name".to_string())));
    }

    let started = std::time::Instant::now();
    let view = state
        .manager
        .create_vm(CreateRequest {
            name: req.vm_name.clone(),
            kernel: req.kernel,
            initramfs: req.initramfs,
            entry_point: req.entry_point,
            snapshot_id: req.snapshot_id,
            nfs_server: req.nfs_server,
            nfs_port: req.nfs_port,
            nfs_path: req.nfs_path,
            callback_url: req.callback_url,
        })
        .await?;

    tracing::info!(
        vm_name = %req.vm_name,
        startup_ms = started.elapsed().as_millis() as u64,
        "VM started"
    );
    Ok(Json(view))
}

#[derive(Debug, serde::Serialize)]
struct VmListBody {
    vms: Vec<VmView>,
}

async fn list_vms(State(state): State<AppState>) -> Json<VmListBody> {
    Json(VmListBody {
        vms: state.manager.list_vms().await,
    })
}

async fn get_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VmView>, ApiError> {
    Ok(Json(state.manager.get_vm(&name).await?))
}

async fn destroy_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.destroy_vm(&name).await?;
    // Any client session for the VM is gone with it.
    state.sessions.remove_session(&name);
    Ok(Json(serde_json::json!({})))
}

async fn destroy_all(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.destroy_all().await?;
    Ok(Json(serde_json::json!({})))
}

#[derive(Debug, Deserialize)]
struct PatchVmBody {
    #[serde(default)]
    status: String,
}

async fn update_vm_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<PatchVmBody>, JsonRejection>,
) -> Result<Json<VmView>, ApiError> {
    let req = body(payload)?;

    let view = match req.status.as_str() {
        "stopped" => state.manager.stop_vm(&name).await?,
        "paused" => state.manager.pause_vm(&name).await?,
        "resume" => state.manager.resume_vm(&name).await?,
        other => {
            return Err(ApiError(FleetError::Validation(format!(
                "Invalid status value: {}",
                other
            ))));
        }
    };
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    snapshot_id: Option<String>,
}

async fn snapshot_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<SnapshotBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req = body(payload)?;
    let snapshot_id = state.manager.snapshot_vm(&name, req.snapshot_id).await?;
    Ok(Json(serde_json::json!({ "snapshotId": snapshot_id })))
}

#[derive(Debug, Deserialize)]
struct CmdBody {
    #[serde(default)]
    cmd: String,
    blocking: Option<bool>,
}

async fn vm_command(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<CmdBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req = body(payload)?;
    if req.cmd.is_empty() {
        return Err(ApiError(FleetError::Validation(
            "Command cannot be empty".to_string(),
        )));
    }

    let result = state
        .manager
        .vm_command(&name, &req.cmd, req.blocking.unwrap_or(true))
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct UploadBody {
    #[serde(default)]
    files: Vec<UploadFile>,
}

async fn file_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<UploadBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req = body(payload)?;
    if req.files.is_empty() {
        return Err(ApiError(FleetError::Validation(
            "No files provided for upload".to_string(),
        )));
    }

    let result = state.manager.file_upload(&name, req.files).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    paths: String,
}

async fn file_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.paths.is_empty() {
        return Err(ApiError(FleetError::Validation(
            "Missing 'paths' query parameter".to_string(),
        )));
    }

    let paths: Vec<String> = query.paths.split(',').map(str::to_string).collect();
    let result = state.manager.file_download(&name, paths).await?;
    Ok(Json(result))
}

async fn open_session(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            let session = state.sessions.create_session(&name, socket);
            tracing::info!(
                vm_name = %name,
                session_id = %session.id(),
                "WebSocket connection established"
            );
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InternalCallbackBody {
    #[serde(default)]
    vm_name: String,
    #[serde(default)]
    method: String,
    params: Option<serde_json::Value>,
}

/// Callback entry point for guests in direct-HTTP mode. The response shape
/// is `{result}` or `{error}` with a plain string error, which is what the
/// in-guest agent expects.
async fn internal_callback(
    State(state): State<AppState>,
    payload: Result<Json<InternalCallbackBody>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            let body = serde_json::json!({
                "error": format!("Invalid request format: {}", rejection.body_text())
            });
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };

    if req.vm_name.is_empty() || req.method.is_empty() {
        let body = serde_json::json!({ "error": "vmName and method are required" });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    match state
        .manager
        .route_callback(&req.vm_name, &req.method, req.params)
        .await
    {
        Ok(result) => Json(serde_json::json!({ "result": result })).into_response(),
        Err(e) => {
            tracing::error!(
                vm_name = %req.vm_name,
                method = %req.method,
                error = %e,
                "Failed to route callback"
            );
            let body = serde_json::json!({ "error": format!("Callback failed: {}", e) });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
