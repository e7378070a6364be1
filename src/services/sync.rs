use std::{
    collections::HashMap,
    fs,
    path::{Component, Path},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    policy,
    project::ProjectRegistry,
    remote::{RemoteClient, RemoteError},
};

pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const TIME_KEEPER_PATH: &str = "time_keeper.txt";
const TIME_KEEPER_MAX_LINES: usize = 200;

#[derive(Debug, Clone, Default)]
pub(crate) struct PullOutcome {
    pub(crate) synced_files: Vec<String>,
    pub(crate) last_sync: HashMap<String, i64>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct FullOutcome {
    pub(crate) scripts: PullOutcome,
    pub(crate) metadata_synced: bool,
}

/// Sync-side shared state: the per-path modtime vector and the last remote
/// URL a sync call used (the keepalive tick targets it). The vector lives
/// for one project session and is reset on re-selection.
pub(crate) struct SyncState {
    vector: Mutex<HashMap<String, i64>>,
    remote_url: Mutex<Option<String>>,
}

impl SyncState {
    pub(crate) fn new() -> Self {
        Self {
            vector: Mutex::new(HashMap::new()),
            remote_url: Mutex::new(None),
        }
    }

    pub(crate) async fn reset(&self) {
        self.vector.lock().await.clear();
    }

    pub(crate) async fn remember_remote(&self, url: &str) {
        *self.remote_url.lock().await = Some(url.trim_end_matches('/').to_string());
    }

    pub(crate) async fn remote_url(&self) -> Option<String> {
        self.remote_url.lock().await.clone()
    }

    pub(crate) async fn vector_snapshot(&self) -> HashMap<String, i64> {
        self.vector.lock().await.clone()
    }

    /// Merge pulled entries into the vector. Entries only ever move forward.
    pub(crate) async fn commit(&self, updates: &HashMap<String, i64>) {
        let mut vector = self.vector.lock().await;
        for (path, modified) in updates {
            let entry = vector.entry(path.clone()).or_insert(*modified);
            if *modified > *entry {
                *entry = *modified;
            }
        }
    }
}

/// Pull `remote → local app subtree`. A listing failure surfaces as an
/// error; a per-file failure aborts the loop and returns the partial
/// outcome. The vector is committed only while the captured epoch is still
/// the active one.
pub(crate) async fn pull(
    registry: &ProjectRegistry,
    sync_state: &SyncState,
    client: &RemoteClient,
    root: &Path,
    epoch: u64,
    request_last_sync: &HashMap<String, i64>,
) -> Result<PullOutcome, RemoteError> {
    let scripts = client.list_scripts().await?;

    let mut known = sync_state.vector_snapshot().await;
    for (path, modified) in request_last_sync {
        let entry = known.entry(path.clone()).or_insert(*modified);
        if *modified > *entry {
            *entry = *modified;
        }
    }

    let app_dir = root.join(policy::APP_DIR);
    let mut outcome = PullOutcome::default();

    for script in scripts {
        let remote_modified = script.modified_unix();
        let local_modified = known.get(&script.path).copied().unwrap_or(i64::MIN);

        if local_modified >= remote_modified {
            outcome.last_sync.insert(script.path, local_modified);
            continue;
        }

        let Some(relative) = safe_relative_path(&script.path) else {
            debug!(path = %script.path, "skipping remote path that escapes the app subtree");
            continue;
        };

        let file_name = relative
            .rsplit('/')
            .next()
            .unwrap_or(relative.as_str())
            .to_string();
        if policy::is_forbidden_in_app(&file_name, None) {
            debug!(path = %relative, "skipping remote file forbidden in app subtree");
            continue;
        }

        let file = match client.get_script(&script.path).await {
            Ok(file) => file,
            Err(error) => {
                warn!(path = %script.path, %error, "pull aborted mid-listing");
                break;
            }
        };

        if policy::is_forbidden_in_app(&file_name, Some(file.content.len() as u64)) {
            debug!(path = %relative, "skipping oversized text file from remote");
            continue;
        }

        if registry.epoch() != epoch {
            info!("project changed during pull, discarding remaining writes");
            break;
        }

        let local_path = app_dir.join(&relative);
        if let Some(parent) = local_path.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                warn!(path = %relative, %error, "pull aborted, cannot create directories");
                break;
            }
        }
        if let Err(error) = fs::write(&local_path, &file.content) {
            warn!(path = %relative, %error, "pull aborted, cannot write file");
            break;
        }

        outcome.last_sync.insert(script.path.clone(), remote_modified);
        outcome.synced_files.push(script.path);
    }

    if registry.epoch() == epoch {
        sync_state.commit(&outcome.last_sync).await;
    }

    Ok(outcome)
}

/// Push `local app subtree → remote`, unconditionally. Protected names are
/// dropped silently, forbidden-for-sync extensions are logged and dropped.
/// Never consults or updates the vector.
pub(crate) async fn push(client: &RemoteClient, root: &Path) -> Result<Vec<String>, RemoteError> {
    let app_dir = root.join(policy::APP_DIR);
    if !app_dir.is_dir() {
        return Ok(Vec::new());
    }

    let files = collect_push_files(&app_dir, "");
    let mut pushed = Vec::with_capacity(files.len());

    for (relative, content) in files {
        if let Err(error) = client.put_file(&relative, &content).await {
            warn!(path = %relative, %error, "push aborted mid-upload");
            break;
        }
        pushed.push(relative);
    }

    Ok(pushed)
}

fn collect_push_files(dir: &Path, prefix: &str) -> Vec<(String, String)> {
    let mut directories = Vec::new();
    let mut files = Vec::new();

    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if path.is_dir() {
            if !policy::is_ignored_dir(&name) && !policy::is_protected_dir(&name) {
                directories.push((name, path));
            }
        } else if !policy::is_hidden(&name) {
            files.push((name, path));
        }
    }

    directories.sort_by(|a, b| a.0.cmp(&b.0));
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut collected = Vec::new();

    for (name, path) in directories {
        let child_prefix = join_prefix(prefix, &name);
        collected.extend(collect_push_files(&path, &child_prefix));
    }

    for (name, path) in files {
        if policy::is_protected_from_push(&name) {
            continue;
        }
        if policy::is_forbidden_for_sync(&name) {
            debug!(path = %path.display(), "excluding forbidden extension from push");
            continue;
        }

        match fs::read_to_string(&path) {
            Ok(content) => collected.push((join_prefix(prefix, &name), content)),
            Err(error) => {
                debug!(path = %path.display(), %error, "skipping unreadable file during push");
            }
        }
    }

    collected
}

/// Upload the metadata summaries as plain text. Returns false when there is
/// nothing to send.
pub(crate) async fn push_metadata(
    client: &RemoteClient,
    root: &Path,
) -> Result<bool, RemoteError> {
    let meta_dir = root.join(policy::APP_DIR).join(policy::META_DATA_DIR);
    let input_metadata = fs::read_to_string(meta_dir.join("input_metadata.txt")).unwrap_or_default();
    let output_metadata =
        fs::read_to_string(meta_dir.join("output_metadata.txt")).unwrap_or_default();

    if input_metadata.is_empty() && output_metadata.is_empty() {
        return Ok(false);
    }

    client.put_metadata(&input_metadata, &output_metadata).await?;
    Ok(true)
}

/// Full sync: metadata push composed with pull. A metadata failure is
/// reported in the outcome, not raised.
pub(crate) async fn full(
    registry: &ProjectRegistry,
    sync_state: &SyncState,
    client: &RemoteClient,
    root: &Path,
    epoch: u64,
    request_last_sync: &HashMap<String, i64>,
) -> Result<FullOutcome, RemoteError> {
    let metadata_synced = match push_metadata(client, root).await {
        Ok(synced) => synced,
        Err(error) => {
            warn!(%error, "metadata push failed during full sync");
            false
        }
    };

    let scripts = pull(registry, sync_state, client, root, epoch, request_last_sync).await?;

    Ok(FullOutcome {
        scripts,
        metadata_synced,
    })
}

/// Periodic activity signal to the remote's idle-shutdown heuristic. Runs
/// for the life of the process; every failure is logged and ignored.
pub(crate) fn spawn_keepalive(sync_state: Arc<SyncState>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tick.tick().await;

            let Some(url) = sync_state.remote_url().await else {
                continue;
            };

            if let Err(error) = keepalive_tick(&url).await {
                debug!(%error, "keepalive tick failed");
            }
        }
    })
}

async fn keepalive_tick(url: &str) -> Result<(), RemoteError> {
    let client = RemoteClient::new(url)?;
    if !client.health().await {
        return Err(RemoteError::Unreachable("health probe failed".to_string()));
    }

    let existing = match client.get_script(TIME_KEEPER_PATH).await {
        Ok(file) => file.content,
        Err(RemoteError::NotFound) => String::new(),
        Err(error) => return Err(error),
    };

    let content = append_keepalive_line(&existing, &Utc::now().to_rfc3339());
    client.put_file(TIME_KEEPER_PATH, &content).await
}

fn append_keepalive_line(existing: &str, timestamp: &str) -> String {
    let mut lines: Vec<&str> = existing.lines().filter(|line| !line.is_empty()).collect();
    let line = format!("alive {timestamp}");
    if lines.len() >= TIME_KEEPER_MAX_LINES {
        lines.drain(0..=lines.len() - TIME_KEEPER_MAX_LINES);
    }

    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    content.push_str(&line);
    content.push('\n');
    content
}

/// Remote-supplied paths must stay inside `app/`: no absolute paths, no
/// parent components.
fn safe_relative_path(raw: &str) -> Option<String> {
    let path = Path::new(raw);
    let mut segments = Vec::new();

    for component in path.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if segments.is_empty() {
        return None;
    }

    Some(segments.join("/"))
}

fn join_prefix(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
