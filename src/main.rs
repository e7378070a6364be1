use std::{
    collections::HashMap,
    env, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose, Engine as _};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use services::{
    policy, preview,
    preview::PreviewError,
    project,
    project::{Project, SelectError},
    remote::RemoteError,
    scripts, sync, terminal, tree,
    watcher::ChangeFrame,
    ChangeBus, ProjectRegistry, ProjectWatcher, RemoteClient, ScriptRunner, SyncState,
    TerminalRegistry,
};

mod services;

const PROJECT_PATH_ENV: &str = "VIBEFOUNDRY_PROJECT_PATH";
const WATCH_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const GITHUB_DEVICE_CODE_URL: &str = "https://github.com/login/device/code";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

const BINARY_EXTENSIONS: &[&str] = &["pdf", "zip", "tar", "gz"];

#[derive(Parser, Debug)]
#[command(
    name = "vibefoundry-bridge",
    version,
    about = "Local bridge daemon coupling the VibeFoundry IDE to a remote sandbox"
)]
struct Cli {
    /// Project folder to open (falls back to VIBEFOUNDRY_PROJECT_PATH)
    folder: Option<PathBuf>,

    #[arg(long, short, default_value_t = 8765)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Don't open the browser after startup
    #[arg(long)]
    no_browser: bool,
}

struct AppState {
    started_at: Instant,
    projects: ProjectRegistry,
    bus: ChangeBus,
    watcher: Mutex<Option<ProjectWatcher>>,
    sync_state: Arc<SyncState>,
    runner: ScriptRunner,
    terminals: Arc<TerminalRegistry>,
    http: reqwest::Client,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn invalid(detail: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.to_string(),
        }
    }

    fn policy(detail: &str) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            detail: detail.to_string(),
        }
    }

    fn not_found(detail: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.to_string(),
        }
    }

    fn conflict(detail: &str) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            detail: detail.to_string(),
        }
    }

    fn internal(detail: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: detail.to_string(),
        }
    }

    fn bad_gateway(detail: &str) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            detail: detail.to_string(),
        }
    }

    fn from_remote(error: RemoteError) -> Self {
        match error {
            RemoteError::Timeout => Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                detail: error.to_string(),
            },
            RemoteError::Conflict => Self::conflict(&error.to_string()),
            RemoteError::SyncForbidden(_) => Self::policy(&error.to_string()),
            RemoteError::Unreachable(_)
            | RemoteError::Unauthorized
            | RemoteError::NotFound
            | RemoteError::Remote(_) => Self::bad_gateway(&error.to_string()),
        }
    }

    fn from_preview(error: PreviewError) -> Self {
        match error {
            PreviewError::Unsupported(_)
            | PreviewError::NotTabular
            | PreviewError::UnknownColumn(_) => Self::invalid(&error.to_string()),
            PreviewError::Io(_) | PreviewError::Malformed(_) => Self::internal(&error.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct FolderSelectRequest {
    path: String,
}

#[derive(Debug, Deserialize)]
struct FsListQuery {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReadFileQuery {
    path: String,
}

#[derive(Debug, Deserialize)]
struct WriteFileRequest {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteFileRequest {
    path: String,
    #[serde(default)]
    is_directory: bool,
}

#[derive(Debug, Deserialize)]
struct RunScriptsRequest {
    scripts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PipInstallRequest {
    package: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataframeRowsQuery {
    file_path: String,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataframeQueryRequest {
    file_path: String,
    #[serde(default)]
    filters: Vec<preview::QueryFilter>,
    sort: Option<preview::QuerySort>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SyncPullRequest {
    codespace_url: String,
    #[serde(default)]
    last_sync: HashMap<String, i64>,
}

#[derive(Debug, Deserialize)]
struct SyncPushRequest {
    codespace_url: String,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeRequest {
    client_id: String,
    #[serde(default)]
    scope: String,
}

#[derive(Debug, Deserialize)]
struct TokenPollRequest {
    client_id: String,
    device_code: String,
    #[serde(default = "default_grant_type")]
    grant_type: String,
}

fn default_grant_type() -> String {
    DEVICE_CODE_GRANT_TYPE.to_string()
}

#[derive(Debug, Deserialize)]
struct CloseTerminalRequest {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TerminalQuery {
    cols: Option<u16>,
    rows: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RemoteTerminalQuery {
    codespace_url: String,
    cols: Option<u16>,
    rows: Option<u16>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let state = Arc::new(AppState {
        started_at: Instant::now(),
        projects: ProjectRegistry::new(),
        bus: ChangeBus::new(),
        watcher: Mutex::new(None),
        sync_state: Arc::new(SyncState::new()),
        runner: ScriptRunner::new(scripts::DEFAULT_SCRIPT_TIMEOUT),
        terminals: Arc::new(TerminalRegistry::new()),
        http: reqwest::Client::new(),
    });

    let initial_folder = cli
        .folder
        .clone()
        .or_else(|| env::var(PROJECT_PATH_ENV).ok().map(PathBuf::from));

    if let Some(folder) = initial_folder {
        match activate_project(&state, &folder).await {
            Ok(project) => info!(root = %project.root.display(), "opened project"),
            Err(api_error) => {
                error!(detail = %api_error.detail, "invalid project path");
                std::process::exit(2);
            }
        }
    }

    sync::spawn_keepalive(state.sync_state.clone());

    let app = router(state);

    let bind_addr = format!("{}:{}", cli.host, cli.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(bind_error) => {
            error!(%bind_error, "failed to bind {bind_addr}");
            std::process::exit(1);
        }
    };

    let url = format!("http://{bind_addr}");
    info!("vibefoundry-bridge listening on {url}");

    if !cli.no_browser {
        if let Err(open_error) = open::that(&url) {
            warn!(%open_error, "could not open browser");
        }
    }

    if let Err(serve_error) = axum::serve(listener, app).await {
        error!(%serve_error, "server error");
        std::process::exit(1);
    }
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/folder/select", post(folder_select_handler))
        .route("/api/folder/info", get(folder_info_handler))
        .route("/api/fs/home", get(fs_home_handler))
        .route("/api/fs/list", get(fs_list_handler))
        .route("/api/files/tree", get(files_tree_handler))
        .route("/api/files/read", get(files_read_handler))
        .route("/api/files/write", post(files_write_handler))
        .route("/api/files/delete", post(files_delete_handler))
        .route("/api/scripts", get(scripts_list_handler))
        .route("/api/scripts/run", post(scripts_run_handler))
        .route("/api/pip/install", post(pip_install_handler))
        .route("/api/metadata/generate", post(metadata_generate_handler))
        .route("/api/dataframe/rows", get(dataframe_rows_handler))
        .route("/api/dataframe/query", post(dataframe_query_handler))
        .route("/api/sync/pull", post(sync_pull_handler))
        .route("/api/sync/push", post(sync_push_handler))
        .route("/api/sync/full", post(sync_full_handler))
        .route("/api/github/device-code", post(github_device_code_handler))
        .route("/api/github/token", post(github_token_handler))
        .route("/api/terminal/sessions", get(terminal_sessions_handler))
        .route("/api/terminal/close", post(terminal_close_handler))
        .route("/ws/watch", get(ws_watch_handler))
        .route("/ws/terminal", get(ws_terminal_handler))
        .route("/ws/terminal/remote", get(ws_terminal_remote_handler))
        .with_state(state)
}

async fn activate_project(state: &Arc<AppState>, path: &Path) -> Result<Project, ApiError> {
    let project = state
        .projects
        .select(path)
        .await
        .map_err(|select_error| match select_error {
            SelectError::Missing(_) | SelectError::NotADirectory(_) => {
                ApiError::invalid(&select_error.to_string())
            }
            SelectError::Io(_) => ApiError::internal(&select_error.to_string()),
        })?;

    {
        let mut active_watcher = state.watcher.lock().await;
        if let Some(previous) = active_watcher.take() {
            previous.stop();
        }
        *active_watcher = Some(ProjectWatcher::spawn(
            project.root.clone(),
            state.bus.clone(),
        ));
    }

    state.sync_state.reset().await;

    let root = project.root.clone();
    let generated = tokio::task::spawn_blocking(move || project::generate_metadata(&root))
        .await
        .map_err(|join_error| io::Error::other(join_error.to_string()))
        .and_then(|result| result);
    if let Err(metadata_error) = generated {
        warn!(%metadata_error, "initial metadata generation failed");
    }

    Ok(project)
}

async fn require_project(state: &Arc<AppState>) -> ApiResult<Project> {
    state
        .projects
        .current()
        .await
        .ok_or_else(|| ApiError::conflict("no project selected"))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let project_folder = state
        .projects
        .current()
        .await
        .map(|project| project.root.to_string_lossy().to_string());

    Json(json!({
        "status": "ok",
        "uptime_sec": state.started_at.elapsed().as_secs(),
        "project_folder": project_folder,
    }))
}

async fn folder_select_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FolderSelectRequest>,
) -> ApiResult<Json<Value>> {
    if request.path.trim().is_empty() {
        return Err(ApiError::invalid("path must not be empty"));
    }

    let project = activate_project(&state, Path::new(&request.path)).await?;
    Ok(Json(json!({
        "name": project.name,
        "path": project.root.to_string_lossy(),
    })))
}

async fn folder_info_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.projects.current().await {
        Some(project) => Json(json!({
            "project_folder": project.root.to_string_lossy(),
            "name": project.name,
        })),
        None => Json(json!({ "project_folder": Value::Null })),
    }
}

async fn fs_home_handler() -> ApiResult<Json<Value>> {
    let home = dirs::home_dir().ok_or_else(|| ApiError::internal("home directory unknown"))?;
    Ok(Json(json!({ "path": home.to_string_lossy() })))
}

async fn fs_list_handler(Query(query): Query<FsListQuery>) -> ApiResult<Json<Value>> {
    let target = match query.path.filter(|path| !path.trim().is_empty()) {
        Some(path) => PathBuf::from(path),
        None => dirs::home_dir().ok_or_else(|| ApiError::internal("home directory unknown"))?,
    };

    if !target.exists() {
        return Err(ApiError::not_found("path does not exist"));
    }
    if !target.is_dir() {
        return Err(ApiError::invalid("path is not a directory"));
    }

    let entries = std::fs::read_dir(&target)
        .map_err(|read_error| ApiError::policy(&format!("cannot list folder: {read_error}")))?;

    let mut folders = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if policy::is_hidden(&name) {
            continue;
        }
        if entry.path().is_dir() {
            folders.push(json!({
                "name": name,
                "path": entry.path().to_string_lossy(),
            }));
        }
    }
    folders.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    let parent = target
        .parent()
        .filter(|parent| *parent != target)
        .map(|parent| parent.to_string_lossy().to_string());

    Ok(Json(json!({
        "current": target.to_string_lossy(),
        "parent": parent,
        "folders": folders,
    })))
}

async fn files_tree_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let bus = state.bus.clone();

    let snapshot = tokio::task::spawn_blocking(move || tree::scan_tree(&project.root, Some(&bus)))
        .await
        .map_err(|join_error| ApiError::internal(&join_error.to_string()))?
        .map_err(|scan_error| ApiError::internal(&format!("tree scan failed: {scan_error}")))?;

    Ok(Json(json!({ "tree": snapshot })))
}

async fn files_read_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReadFileQuery>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let file_path = resolve_project_path(&project.root, &query.path)?;

    if !file_path.exists() {
        return Err(ApiError::not_found("file not found"));
    }
    if !file_path.is_file() {
        return Err(ApiError::invalid("path is not a file"));
    }

    let file_name = file_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = policy::extension_of(&file_name).unwrap_or_default();

    if preview::is_tabular_extension(&extension) {
        let payload = tokio::task::spawn_blocking(move || {
            preview::load_dataframe(&file_path, 0, preview::DEFAULT_PAGE_LIMIT)
        })
        .await
        .map_err(|join_error| ApiError::internal(&join_error.to_string()))?
        .map_err(ApiError::from_preview)?;

        let mut body = serde_json::to_value(payload)
            .map_err(|encode_error| ApiError::internal(&encode_error.to_string()))?;
        body["filename"] = json!(file_name);
        return Ok(Json(body));
    }

    let bytes = tokio::fs::read(&file_path)
        .await
        .map_err(|read_error| ApiError::internal(&format!("failed to read file: {read_error}")))?;

    if preview::is_image_extension(&extension) || BINARY_EXTENSIONS.contains(&extension.as_str()) {
        return Ok(Json(json!({
            "content": general_purpose::STANDARD.encode(&bytes),
            "encoding": "base64",
            "filename": file_name,
        })));
    }

    match String::from_utf8(bytes) {
        Ok(text) => Ok(Json(json!({
            "content": text,
            "encoding": "utf-8",
            "filename": file_name,
        }))),
        Err(not_utf8) => Ok(Json(json!({
            "content": general_purpose::STANDARD.encode(not_utf8.as_bytes()),
            "encoding": "base64",
            "filename": file_name,
        }))),
    }
}

async fn files_write_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WriteFileRequest>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let file_path = resolve_project_path(&project.root, &request.path)?;

    let relative = relative_to_root(&project.root, &file_path);
    let file_name = file_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();

    if policy::is_within_app(&relative)
        && policy::is_forbidden_in_app(&file_name, Some(request.content.len() as u64))
    {
        return Err(ApiError::policy(
            "this file type is not allowed in the app folder",
        ));
    }

    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|mkdir_error| {
                ApiError::internal(&format!("failed to create directories: {mkdir_error}"))
            })?;
    }

    tokio::fs::write(&file_path, request.content)
        .await
        .map_err(|write_error| {
            ApiError::internal(&format!("failed to write file: {write_error}"))
        })?;

    Ok(Json(json!({ "ok": true, "path": request.path })))
}

async fn files_delete_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteFileRequest>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let target = resolve_project_path(&project.root, &request.path)?;

    if !target.exists() {
        return Err(ApiError::not_found("path does not exist"));
    }

    let removal = if request.is_directory {
        tokio::fs::remove_dir_all(&target).await
    } else {
        tokio::fs::remove_file(&target).await
    };

    removal
        .map_err(|delete_error| ApiError::internal(&format!("failed to delete: {delete_error}")))?;

    Ok(Json(json!({ "ok": true })))
}

async fn scripts_list_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let scripts = tokio::task::spawn_blocking(move || scripts::discover_scripts(&project.root))
        .await
        .map_err(|join_error| ApiError::internal(&join_error.to_string()))?;

    Ok(Json(json!({ "scripts": scripts })))
}

async fn scripts_run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunScriptsRequest>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    if request.scripts.is_empty() {
        return Err(ApiError::invalid("scripts must not be empty"));
    }

    let mut resolved = Vec::with_capacity(request.scripts.len());
    for raw in &request.scripts {
        resolved.push(resolve_project_path(&project.root, raw)?);
    }

    let receivers = state
        .runner
        .submit_batch(resolved, project.root.clone())
        .await;

    let mut results = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        let record = receiver
            .await
            .map_err(|_| ApiError::internal("script worker dropped the run"))?;
        results.push(record);
    }

    let root = project.root.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(metadata_error) = project::generate_metadata(&root) {
            warn!(%metadata_error, "metadata refresh after script run failed");
        }
    });

    Ok(Json(json!({ "results": results })))
}

async fn pip_install_handler(Json(request): Json<PipInstallRequest>) -> ApiResult<Json<Value>> {
    if !scripts::is_valid_package_spec(&request.package) {
        return Err(ApiError::invalid("invalid package name"));
    }

    let outcome = scripts::install_package(&request.package).await;
    Ok(Json(json!({
        "success": outcome.success,
        "stdout": outcome.stdout,
        "stderr": outcome.stderr,
    })))
}

async fn metadata_generate_handler(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    tokio::task::spawn_blocking(move || project::generate_metadata(&project.root))
        .await
        .map_err(|join_error| ApiError::internal(&join_error.to_string()))?
        .map_err(|metadata_error| {
            ApiError::internal(&format!("metadata generation failed: {metadata_error}"))
        })?;

    Ok(Json(json!({ "ok": true })))
}

async fn dataframe_rows_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DataframeRowsQuery>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let file_path = resolve_project_path(&project.root, &query.file_path)?;
    if !file_path.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let limit = query.limit.unwrap_or(preview::DEFAULT_PAGE_LIMIT);
    let offset = query.offset;
    let payload =
        tokio::task::spawn_blocking(move || preview::load_dataframe(&file_path, offset, limit))
            .await
            .map_err(|join_error| ApiError::internal(&join_error.to_string()))?
            .map_err(ApiError::from_preview)?;

    Ok(Json(serde_json::to_value(payload).map_err(
        |encode_error| ApiError::internal(&encode_error.to_string()),
    )?))
}

async fn dataframe_query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DataframeQueryRequest>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let file_path = resolve_project_path(&project.root, &request.file_path)?;
    if !file_path.is_file() {
        return Err(ApiError::not_found("file not found"));
    }

    let limit = request.limit.unwrap_or(preview::DEFAULT_PAGE_LIMIT);
    let offset = request.offset;
    let payload = tokio::task::spawn_blocking(move || {
        preview::query_dataframe(
            &file_path,
            &request.filters,
            request.sort.as_ref(),
            offset,
            limit,
        )
    })
    .await
    .map_err(|join_error| ApiError::internal(&join_error.to_string()))?
    .map_err(ApiError::from_preview)?;

    Ok(Json(serde_json::to_value(payload).map_err(
        |encode_error| ApiError::internal(&encode_error.to_string()),
    )?))
}

async fn sync_pull_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncPullRequest>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let client = RemoteClient::new(&request.codespace_url).map_err(ApiError::from_remote)?;
    state
        .sync_state
        .remember_remote(&request.codespace_url)
        .await;

    let outcome = sync::pull(
        &state.projects,
        &state.sync_state,
        &client,
        &project.root,
        project.epoch,
        &request.last_sync,
    )
    .await
    .map_err(ApiError::from_remote)?;

    Ok(Json(json!({
        "synced_files": outcome.synced_files,
        "last_sync": outcome.last_sync,
    })))
}

async fn sync_push_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncPushRequest>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let client = RemoteClient::new(&request.codespace_url).map_err(ApiError::from_remote)?;
    state
        .sync_state
        .remember_remote(&request.codespace_url)
        .await;

    let pushed = sync::push(&client, &project.root)
        .await
        .map_err(ApiError::from_remote)?;

    Ok(Json(json!({ "pushed_files": pushed })))
}

async fn sync_full_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SyncPullRequest>,
) -> ApiResult<Json<Value>> {
    let project = require_project(&state).await?;
    let client = RemoteClient::new(&request.codespace_url).map_err(ApiError::from_remote)?;
    state
        .sync_state
        .remember_remote(&request.codespace_url)
        .await;

    let outcome = sync::full(
        &state.projects,
        &state.sync_state,
        &client,
        &project.root,
        project.epoch,
        &request.last_sync,
    )
    .await
    .map_err(ApiError::from_remote)?;

    Ok(Json(json!({
        "scripts_sync": {
            "synced_files": outcome.scripts.synced_files,
            "last_sync": outcome.scripts.last_sync,
        },
        "metadata_sync": outcome.metadata_synced,
    })))
}

async fn github_device_code_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeviceCodeRequest>,
) -> Response {
    forward_github(
        &state.http,
        GITHUB_DEVICE_CODE_URL,
        &[
            ("client_id", request.client_id.as_str()),
            ("scope", request.scope.as_str()),
        ],
    )
    .await
}

async fn github_token_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenPollRequest>,
) -> Response {
    forward_github(
        &state.http,
        GITHUB_TOKEN_URL,
        &[
            ("client_id", request.client_id.as_str()),
            ("device_code", request.device_code.as_str()),
            ("grant_type", request.grant_type.as_str()),
        ],
    )
    .await
}

// Pass-through so the browser can run the device flow without tripping CORS.
async fn forward_github(http: &reqwest::Client, url: &str, form: &[(&str, &str)]) -> Response {
    let upstream = http
        .post(url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await;

    match upstream {
        Ok(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
            (status, Json(body)).into_response()
        }
        Err(upstream_error) => {
            ApiError::bad_gateway(&format!("github request failed: {upstream_error}"))
                .into_response()
        }
    }
}

async fn terminal_sessions_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "sessions": state.terminals.list().await }))
}

async fn terminal_close_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CloseTerminalRequest>,
) -> ApiResult<Json<Value>> {
    if state.terminals.close(&request.id).await {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::not_found("terminal session not found"))
    }
}

async fn ws_watch_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| watch_socket(socket, state))
}

async fn watch_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut frames = state.bus.subscribe();
    let mut keepalive = tokio::time::interval(WATCH_KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;

    loop {
        tokio::select! {
            received = frames.recv() => {
                match received {
                    Ok(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "watch subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = keepalive.tick() => {
                if send_frame(&mut socket, &ChangeFrame::Keepalive).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            let _ = socket.send(Message::Text("pong".to_string().into())).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ChangeFrame) -> Result<(), ()> {
    let Ok(text) = serde_json::to_string(frame) else {
        return Ok(());
    };
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|_| ())
}

async fn ws_terminal_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<TerminalQuery>,
) -> Response {
    let Some(project) = state.projects.current().await else {
        return ApiError::conflict("no project selected").into_response();
    };

    let cols = query.cols.unwrap_or(terminal::DEFAULT_COLS);
    let rows = query.rows.unwrap_or(terminal::DEFAULT_ROWS);
    let registry = state.terminals.clone();

    ws.on_upgrade(move |socket| {
        terminal::run_local_session(socket, project.root, cols, rows, registry)
    })
}

async fn ws_terminal_remote_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RemoteTerminalQuery>,
) -> Response {
    if query.codespace_url.trim().is_empty() {
        return ApiError::invalid("codespace_url must not be empty").into_response();
    }

    let remote_url = terminal::remote_terminal_url(&query.codespace_url);
    let cols = query.cols.unwrap_or(terminal::DEFAULT_COLS);
    let rows = query.rows.unwrap_or(terminal::DEFAULT_ROWS);
    let registry = state.terminals.clone();

    ws.on_upgrade(move |socket| {
        terminal::run_remote_session(socket, remote_url, cols, rows, registry)
    })
}

fn resolve_project_path(root: &Path, raw: &str) -> Result<PathBuf, ApiError> {
    if raw.trim().is_empty() {
        return Err(ApiError::invalid("path must not be empty"));
    }

    let requested = Path::new(raw);
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    let normalized = normalize_path(&joined);
    let normalized_root = normalize_path(root);
    if !normalized.starts_with(&normalized_root) {
        return Err(ApiError::policy("path is outside the project folder"));
    }

    Ok(normalized)
}

fn relative_to_root(root: &Path, path: &Path) -> String {
    path.strip_prefix(normalize_path(root))
        .or_else(|_| path.strip_prefix(root))
        .map(|relative| relative.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default()
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                normalized.push(component.as_os_str());
            }
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn bare_test_state() -> Arc<AppState> {
        Arc::new(AppState {
            started_at: Instant::now(),
            projects: ProjectRegistry::new(),
            bus: ChangeBus::new(),
            watcher: Mutex::new(None),
            sync_state: Arc::new(SyncState::new()),
            runner: ScriptRunner::with_interpreter("/bin/sh".to_string(), Duration::from_secs(10)),
            terminals: Arc::new(TerminalRegistry::new()),
            http: reqwest::Client::new(),
        })
    }

    async fn build_test_state() -> (Arc<AppState>, TempDir) {
        let dir = TempDir::new().expect("temp project dir");
        let state = bare_test_state();

        state
            .projects
            .select(dir.path())
            .await
            .expect("select test project");

        (state, dir)
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("parent dir")).expect("create dirs");
        fs::write(path, content).expect("write file");
    }

    #[test]
    fn resolve_project_path_accepts_paths_inside_the_root() {
        let root = Path::new("/projects/demo");
        let resolved =
            resolve_project_path(root, "app/scripts/run.py").expect("resolve relative path");
        assert_eq!(resolved, PathBuf::from("/projects/demo/app/scripts/run.py"));

        let absolute = resolve_project_path(root, "/projects/demo/input/data.csv")
            .expect("resolve absolute path inside root");
        assert_eq!(absolute, PathBuf::from("/projects/demo/input/data.csv"));
    }

    #[test]
    fn resolve_project_path_rejects_escapes() {
        let root = Path::new("/projects/demo");
        let error = resolve_project_path(root, "../other/secret.txt").expect_err("reject escape");
        assert_eq!(error.status, StatusCode::FORBIDDEN);

        let error = resolve_project_path(root, "/etc/passwd").expect_err("reject absolute escape");
        assert_eq!(error.status, StatusCode::FORBIDDEN);

        let error = resolve_project_path(root, "  ").expect_err("reject empty path");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn normalize_path_collapses_current_and_parent_components() {
        assert_eq!(
            normalize_path(Path::new("/tmp/./bridge/../repo/./main.rs")),
            PathBuf::from("/tmp/repo/main.rs")
        );
        assert_eq!(
            normalize_path(Path::new("a/b/../c/./d")),
            PathBuf::from("a/c/d")
        );
    }

    #[test]
    fn remote_errors_map_to_gateway_statuses() {
        assert_eq!(
            ApiError::from_remote(RemoteError::Unreachable("x".into())).status,
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::from_remote(RemoteError::Timeout).status,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from_remote(RemoteError::Conflict).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from_remote(RemoteError::SyncForbidden("a.csv".into())).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiError::from_remote(RemoteError::Remote("boom".into())).status,
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn endpoints_conflict_without_a_selected_project() {
        let state = bare_test_state();

        let error = files_tree_handler(State(state.clone()))
            .await
            .expect_err("tree without project");
        assert_eq!(error.status, StatusCode::CONFLICT);

        let error = scripts_list_handler(State(state))
            .await
            .expect_err("scripts without project");
        assert_eq!(error.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn folder_select_returns_name_and_path() {
        let (state, _dir) = build_test_state().await;
        let other = TempDir::new().expect("second project dir");

        let response = folder_select_handler(
            State(state.clone()),
            Json(FolderSelectRequest {
                path: other.path().to_string_lossy().to_string(),
            }),
        )
        .await
        .expect("select folder");

        assert_eq!(
            response.0["path"],
            other.path().to_string_lossy().to_string()
        );
        assert!(other.path().join("app/scripts").is_dir());
        assert!(state.watcher.lock().await.is_some());
    }

    #[tokio::test]
    async fn folder_select_rejects_bad_paths() {
        let (state, dir) = build_test_state().await;

        let error = folder_select_handler(
            State(state),
            Json(FolderSelectRequest {
                path: dir.path().join("missing").to_string_lossy().to_string(),
            }),
        )
        .await
        .expect_err("missing folder");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn files_tree_purges_forbidden_files() {
        let (state, dir) = build_test_state().await;
        write(dir.path(), "app/scripts/secret.csv", "a,b\n1,2\n");
        write(dir.path(), "app/scripts/keep.py", "print('hi')\n");

        let response = files_tree_handler(State(state)).await.expect("scan tree");
        let encoded = serde_json::to_string(&response.0).expect("serialize tree");

        assert!(!encoded.contains("secret.csv"));
        assert!(encoded.contains("keep.py"));
        assert!(!dir.path().join("app/scripts/secret.csv").exists());
    }

    #[tokio::test]
    async fn files_read_returns_text_dataframe_and_missing() {
        let (state, dir) = build_test_state().await;
        write(dir.path(), "app/scripts/hello.py", "print('hello')\n");
        write(dir.path(), "input/data.csv", "a,b\n1,2\n");

        let text = files_read_handler(
            State(state.clone()),
            Query(ReadFileQuery {
                path: "app/scripts/hello.py".to_string(),
            }),
        )
        .await
        .expect("read text file");
        assert_eq!(text.0["encoding"], "utf-8");
        assert_eq!(text.0["content"], "print('hello')\n");

        let frame = files_read_handler(
            State(state.clone()),
            Query(ReadFileQuery {
                path: "input/data.csv".to_string(),
            }),
        )
        .await
        .expect("read dataframe");
        assert_eq!(frame.0["type"], "dataframe");
        assert_eq!(frame.0["totalRows"], 1);

        let error = files_read_handler(
            State(state),
            Query(ReadFileQuery {
                path: "input/ghost.csv".to_string(),
            }),
        )
        .await
        .expect_err("missing file");
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn files_write_enforces_the_app_policy() {
        let (state, dir) = build_test_state().await;

        let error = files_write_handler(
            State(state.clone()),
            Json(WriteFileRequest {
                path: "app/scripts/dump.csv".to_string(),
                content: "a,b\n".to_string(),
            }),
        )
        .await
        .expect_err("csv under app rejected");
        assert_eq!(error.status, StatusCode::FORBIDDEN);

        files_write_handler(
            State(state.clone()),
            Json(WriteFileRequest {
                path: "input/dump.csv".to_string(),
                content: "a,b\n".to_string(),
            }),
        )
        .await
        .expect("csv under input allowed");
        assert!(dir.path().join("input/dump.csv").is_file());

        files_write_handler(
            State(state),
            Json(WriteFileRequest {
                path: "app/scripts/new.py".to_string(),
                content: "x = 1\n".to_string(),
            }),
        )
        .await
        .expect("python under app allowed");
        assert!(dir.path().join("app/scripts/new.py").is_file());
    }

    #[tokio::test]
    async fn files_delete_removes_files_and_reports_missing() {
        let (state, dir) = build_test_state().await;
        write(dir.path(), "output/old.txt", "x");

        files_delete_handler(
            State(state.clone()),
            Json(DeleteFileRequest {
                path: "output/old.txt".to_string(),
                is_directory: false,
            }),
        )
        .await
        .expect("delete file");
        assert!(!dir.path().join("output/old.txt").exists());

        let error = files_delete_handler(
            State(state),
            Json(DeleteFileRequest {
                path: "output/old.txt".to_string(),
                is_directory: false,
            }),
        )
        .await
        .expect_err("second delete fails");
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scripts_run_returns_records_per_script() {
        let (state, dir) = build_test_state().await;
        write(dir.path(), "app/scripts/greet.sh", "echo greetings\n");

        let response = scripts_run_handler(
            State(state),
            Json(RunScriptsRequest {
                scripts: vec!["app/scripts/greet.sh".to_string()],
            }),
        )
        .await
        .expect("run scripts");

        let results = response.0["results"].as_array().expect("results array");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["success"], true);
        assert!(results[0]["stdout"]
            .as_str()
            .expect("stdout string")
            .contains("greetings"));
        assert_eq!(results[0]["classification"]["type"], "ok");
    }

    #[tokio::test]
    async fn scripts_run_rejects_paths_outside_the_project() {
        let (state, _dir) = build_test_state().await;

        let error = scripts_run_handler(
            State(state),
            Json(RunScriptsRequest {
                scripts: vec!["/etc/passwd".to_string()],
            }),
        )
        .await
        .expect_err("outside path rejected");
        assert_eq!(error.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn dataframe_rows_pages_through_a_csv() {
        let (state, dir) = build_test_state().await;
        write(dir.path(), "input/rows.csv", "n\n1\n2\n3\n4\n");

        let response = dataframe_rows_handler(
            State(state),
            Query(DataframeRowsQuery {
                file_path: "input/rows.csv".to_string(),
                offset: 1,
                limit: Some(2),
            }),
        )
        .await
        .expect("page rows");

        assert_eq!(response.0["totalRows"], 4);
        let data = response.0["data"].as_array().expect("data array");
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["n"], 2);
    }

    #[tokio::test]
    async fn dataframe_query_filters_and_sorts() {
        let (state, dir) = build_test_state().await;
        write(
            dir.path(),
            "input/people.csv",
            "name,age\nalice,30\nbob,25\ncarol,41\n",
        );

        let response = dataframe_query_handler(
            State(state),
            Json(DataframeQueryRequest {
                file_path: "input/people.csv".to_string(),
                filters: vec![],
                sort: Some(preview::QuerySort {
                    column: "age".to_string(),
                    direction: "desc".to_string(),
                }),
                offset: 0,
                limit: Some(2),
            }),
        )
        .await
        .expect("query dataframe");

        assert_eq!(response.0["totalRows"], 3);
        let data = response.0["data"].as_array().expect("data array");
        assert_eq!(data[0]["name"], "carol");
        assert_eq!(data[1]["name"], "alice");
    }

    #[tokio::test]
    async fn terminal_close_reports_unknown_sessions() {
        let (state, _dir) = build_test_state().await;

        let error = terminal_close_handler(
            State(state.clone()),
            Json(CloseTerminalRequest {
                id: "ghost".to_string(),
            }),
        )
        .await
        .expect_err("unknown session");
        assert_eq!(error.status, StatusCode::NOT_FOUND);

        let sessions = terminal_sessions_handler(State(state)).await;
        assert_eq!(sessions.0["sessions"], json!([]));
    }

    #[tokio::test]
    async fn fs_list_shows_directories_only() {
        let (_state, dir) = build_test_state().await;
        write(dir.path(), "loose.txt", "x");

        let response = fs_list_handler(Query(FsListQuery {
            path: Some(dir.path().to_string_lossy().to_string()),
        }))
        .await
        .expect("list folder");

        let folders = response.0["folders"].as_array().expect("folders array");
        let names: Vec<&str> = folders
            .iter()
            .map(|entry| entry["name"].as_str().expect("folder name"))
            .collect();
        assert_eq!(names, vec!["app", "input", "output"]);

        let error = fs_list_handler(Query(FsListQuery {
            path: Some(dir.path().join("nope").to_string_lossy().to_string()),
        }))
        .await
        .expect_err("missing folder");
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pip_install_validates_package_names() {
        let error = pip_install_handler(Json(PipInstallRequest {
            package: "pandas; rm -rf /".to_string(),
        }))
        .await
        .expect_err("shell metacharacters rejected");
        assert_eq!(error.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_the_selected_project() {
        let (state, dir) = build_test_state().await;
        let response = health_handler(State(state)).await;
        assert_eq!(response.0["status"], "ok");
        assert_eq!(
            response.0["project_folder"],
            dir.path().to_string_lossy().to_string()
        );
    }
}
