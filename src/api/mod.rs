use axum::{
    async_trait,
    body::Bytes,
    extract::{FromRequest, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::backup::BackupManager;
use crate::connection::{DeviceDirectory, PathResolver};
use crate::error::{Error, ErrorKind};
use crate::overlay::OverlayManager;
use crate::shares::ShareRegistry;
use crate::storage::Storage;
use crate::utils::config::Config;
use crate::utils::log_buffer::LogEntry;

mod devices;
mod jobs;
mod overlay;
mod shares;

/// Services shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub overlay: OverlayManager,
    pub devices: DeviceDirectory,
    pub resolver: PathResolver,
    pub shares: ShareRegistry,
    pub backups: BackupManager,
    pub storage: Storage,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        // Overlay lifecycle
        .route("/overlay", get(overlay::get_state))
        .route("/overlay/installation", get(overlay::check_installation))
        .route("/overlay/running", get(overlay::check_running))
        .route(
            "/overlay/auth-token",
            get(overlay::get_auth_token).post(overlay::init_auth_token),
        )
        .route("/overlay/capabilities", get(overlay::check_capabilities))
        .route("/overlay/setcap-command", get(overlay::setcap_command))
        .route("/overlay/install", post(overlay::install))
        .route("/overlay/uninstall", post(overlay::uninstall))
        .route("/overlay/start", post(overlay::start))
        .route("/overlay/stop", post(overlay::stop))
        .route("/overlay/monitor/start", post(overlay::start_monitor))
        .route("/overlay/monitor/stop", post(overlay::stop_monitor))
        // Devices and connection paths
        .route("/devices", get(devices::list))
        .route("/devices/discover", post(devices::discover))
        .route("/devices/by-network/:network_id", get(devices::by_network_id))
        .route("/devices/by-ip/:ip", get(devices::by_ip))
        .route("/device", get(devices::get_device).put(devices::set_device))
        .route("/device/present", get(devices::has_device))
        .route("/device/paths", get(devices::available_paths))
        .route("/device/path", get(devices::current_path))
        .route("/device/last-path", get(devices::last_path))
        .route("/device/wait-ready", post(devices::wait_for_ready))
        .route(
            "/connections/recent",
            get(devices::recent_connections).post(devices::save_recent_connection),
        )
        // Shares
        .route("/shares/discover", post(shares::discover))
        .route("/shares/pinned", get(shares::list_pinned).post(shares::pin))
        .route("/shares/pinned/:host/:name", delete(shares::unpin))
        .route("/shares/space", post(shares::space))
        // Backup jobs
        .route("/jobs", get(jobs::list).post(jobs::create))
        .route(
            "/jobs/:id",
            get(jobs::get_job).patch(jobs::update).delete(jobs::remove),
        )
        .route("/jobs/:id/run", post(jobs::run))
        .route("/jobs/:id/stop", post(jobs::stop))
        .route("/jobs/:id/pause", post(jobs::pause))
        .route("/jobs/:id/resume", post(jobs::resume))
        .route("/jobs/:id/logs", get(jobs::logs))
        .route("/logs", get(get_logs))
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorBody>,
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

pub type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    }))
}

#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        ErrorKind::AuthenticationFailed => StatusCode::UNAUTHORIZED,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::ConflictAlreadyRunning => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::NotInstalled | ErrorKind::DaemonUnreachable | ErrorKind::NotReachable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ErrorKind::TransferError | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        } else {
            warn!("Request rejected: {}", self.0);
        }

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(ApiErrorBody {
                kind,
                message: self.0.to_string(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// JSON body whose decoding failures surface as `ValidationError`.
/// An empty body reads as `null`, so optional payloads may be omitted.
pub struct Payload<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for Payload<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError(Error::validation(e.body_text())))?;
        let slice: &[u8] = if bytes.is_empty() { b"null" } else { &bytes };
        serde_json::from_slice(slice)
            .map(Payload)
            .map_err(|e| ApiError(Error::validation(format!("malformed request body: {}", e))))
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

async fn get_logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> ApiResult<Vec<LogEntry>> {
    ok(state.backups.get_logs(query.limit))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backup::testing::MemoryJobStore;
    use crate::backup::FsMirror;
    use crate::connection::testing::ScriptedProbe;
    use crate::connection::{ConnectionHistory, DeviceApi};
    use crate::connection::Device;
    use crate::overlay::testing::FakeOverlayClient;
    use crate::shares::testing::{LocalBackend, RecordingStore};
    use crate::utils::log_buffer::LogBuffer;
    use std::net::IpAddr;
    use std::time::Duration;

    struct NoDevices;

    #[async_trait]
    impl DeviceApi for NoDevices {
        async fn identify(&self, _address: IpAddr) -> crate::error::Result<Option<Device>> {
            Ok(None)
        }
    }

    pub async fn state(share_root: &std::path::Path) -> AppState {
        let config = Config::default();
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.run_migrations().await.unwrap();

        let overlay = OverlayManager::new(
            Arc::new(FakeOverlayClient::installed_and_stopped()),
            Duration::from_millis(100),
        );
        let history = ConnectionHistory::new(10);
        let devices = DeviceDirectory::new(Arc::new(NoDevices), history, Vec::new());
        let resolver = PathResolver::new(Arc::new(ScriptedProbe::ready_after(None, Vec::new())));
        let shares = ShareRegistry::new(
            Arc::new(LocalBackend::new(share_root)),
            Arc::new(RecordingStore::default()),
        );
        let backups = BackupManager::new(
            config.backup.clone(),
            shares.clone(),
            Arc::new(FsMirror::new()),
            Arc::new(MemoryJobStore::default()),
            LogBuffer::new(100),
        );

        AppState {
            config: Arc::new(config),
            overlay,
            devices,
            resolver,
            shares,
            backups,
            storage,
        }
    }

    pub fn app(state: AppState) -> Router {
        Router::new().nest("/api", routes()).with_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{app, state};
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request as HttpRequest};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn call(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::ConflictAlreadyRunning), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::NotInstalled), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn job_crud_goes_through_the_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(state(dir.path()).await);

        let spec = json!({
            "name": "docs",
            "sourcePath": dir.path(),
            "targetShare": {"host": "nas", "name": "backup"},
        });
        let (status, body) = call(router.clone(), Method::POST, "/api/jobs", Some(spec)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "stopped");
        let id = body["data"]["id"].as_str().unwrap().to_string();

        let (_, body) = call(router.clone(), Method::GET, "/api/jobs", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let patch = json!({"id": "something-else"});
        let (status, body) = call(router.clone(), Method::PATCH, &format!("/api/jobs/{}", id), Some(patch)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["kind"], "ValidationError");

        let (status, _) = call(router.clone(), Method::DELETE, &format!("/api/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(router, Method::GET, &format!("/api/jobs/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "NotFound");
    }

    #[tokio::test]
    async fn malformed_bodies_are_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(state(dir.path()).await);
        let (status, body) = call(router, Method::POST, "/api/jobs", Some(json!({"name": 7}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "ValidationError");
    }

    #[tokio::test]
    async fn overlay_installation_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(state(dir.path()).await);
        let (status, body) = call(router, Method::GET, "/api/overlay/installation", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].is_string());
    }

    #[tokio::test]
    async fn missing_device_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(state(dir.path()).await);
        let (_, body) = call(router.clone(), Method::GET, "/api/device/present", None).await;
        assert_eq!(body["data"], false);
        let (status, body) = call(router.clone(), Method::GET, "/api/device/last-path", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].is_null());
        let (status, _) = call(router, Method::GET, "/api/device/paths", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pin_and_unpin_shares() {
        let dir = tempfile::tempdir().unwrap();
        let router = app(state(dir.path()).await);
        let pin = json!({
            "share": {"host": "nas", "name": "photos", "type": "disk"},
            "credentials": {"username": "alice", "password": "pw"},
        });
        let (status, body) = call(router.clone(), Method::POST, "/api/shares/pinned", Some(pin.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.to_string().contains("\"pw\""));
        call(router.clone(), Method::POST, "/api/shares/pinned", Some(pin)).await;

        let (_, body) = call(router.clone(), Method::GET, "/api/shares/pinned", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = call(router.clone(), Method::DELETE, "/api/shares/pinned/nas/photos", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(router, Method::DELETE, "/api/shares/pinned/nas/photos", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
