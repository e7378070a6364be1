use std::{
    collections::VecDeque,
    env, fs,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::{oneshot, Mutex, Notify},
    time::timeout,
};
use tracing::{debug, warn};

use super::policy;

pub(crate) const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(300);
const PIP_TIMEOUT: Duration = Duration::from_secs(300);
const OUTPUT_CAP_BYTES: usize = 256 * 1024;
const TRUNCATION_MARKER: &str = "\n[output truncated]";

const MODULE_ALIASES: &[(&str, &str)] = &[
    ("PIL", "pillow"),
    ("cv2", "opencv-python"),
    ("sklearn", "scikit-learn"),
    ("yaml", "pyyaml"),
];

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum RunClassification {
    Ok,
    TimedOut,
    MissingModule { module: String },
    Failed { code: i32 },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ScriptRunRecord {
    pub(crate) script_path: String,
    pub(crate) started_at: String,
    pub(crate) success: bool,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) return_code: Option<i32>,
    pub(crate) timed_out: bool,
    pub(crate) classification: RunClassification,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DiscoveredScript {
    pub(crate) path: String,
    pub(crate) relative_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct InstallOutcome {
    pub(crate) success: bool,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

struct QueuedRun {
    script: PathBuf,
    root: PathBuf,
    responders: Vec<oneshot::Sender<ScriptRunRecord>>,
}

struct RunnerInner {
    queue: Mutex<VecDeque<QueuedRun>>,
    wake: Notify,
    interpreter: String,
    run_timeout: Duration,
}

/// Sequential script executor. Submissions queue in FIFO order, duplicate
/// paths attach to the already-queued run, and at most one script runs at
/// any instant.
#[derive(Clone)]
pub(crate) struct ScriptRunner {
    inner: Arc<RunnerInner>,
}

impl ScriptRunner {
    pub(crate) fn new(run_timeout: Duration) -> Self {
        Self::with_interpreter(python_bin(), run_timeout)
    }

    pub(crate) fn with_interpreter(interpreter: String, run_timeout: Duration) -> Self {
        let inner = Arc::new(RunnerInner {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            interpreter,
            run_timeout,
        });

        let worker_inner = inner.clone();
        tokio::spawn(async move {
            worker_loop(worker_inner).await;
        });

        Self { inner }
    }

    /// Enqueue scripts under one lock so duplicates inside the batch and
    /// against already-queued runs share a single execution.
    pub(crate) async fn submit_batch(
        &self,
        scripts: Vec<PathBuf>,
        root: PathBuf,
    ) -> Vec<oneshot::Receiver<ScriptRunRecord>> {
        let mut receivers = Vec::with_capacity(scripts.len());

        {
            let mut queue = self.inner.queue.lock().await;
            for script in scripts {
                let (tx, rx) = oneshot::channel();
                match queue.iter_mut().find(|queued| queued.script == script) {
                    Some(existing) => existing.responders.push(tx),
                    None => queue.push_back(QueuedRun {
                        script,
                        root: root.clone(),
                        responders: vec![tx],
                    }),
                }
                receivers.push(rx);
            }
        }

        self.inner.wake.notify_one();
        receivers
    }
}

async fn worker_loop(inner: Arc<RunnerInner>) {
    loop {
        let next = { inner.queue.lock().await.pop_front() };

        match next {
            Some(run) => {
                let record = run_script(
                    &inner.interpreter,
                    &run.script,
                    &run.root,
                    inner.run_timeout,
                )
                .await;
                for responder in run.responders {
                    let _ = responder.send(record.clone());
                }
            }
            None => inner.wake.notified().await,
        }
    }
}

pub(crate) async fn run_script(
    interpreter: &str,
    script: &Path,
    root: &Path,
    run_timeout: Duration,
) -> ScriptRunRecord {
    let started_at = Utc::now().to_rfc3339();
    let script_path = script.to_string_lossy().to_string();

    if !script.is_file() {
        return ScriptRunRecord {
            script_path,
            started_at,
            success: false,
            stdout: String::new(),
            stderr: "script not found".to_string(),
            return_code: Some(-1),
            timed_out: false,
            classification: RunClassification::Failed { code: -1 },
        };
    }

    let cwd = script.parent().unwrap_or(root).to_path_buf();
    let mut command = build_command(interpreter, script, &cwd, root);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            return ScriptRunRecord {
                script_path,
                started_at,
                success: false,
                stdout: String::new(),
                stderr: format!("failed to spawn script: {error}"),
                return_code: Some(-1),
                timed_out: false,
                classification: RunClassification::Failed { code: -1 },
            };
        }
    };

    let stdout_task = child.stdout.take().map(|stream| {
        tokio::spawn(async move { read_capped(stream).await })
    });
    let stderr_task = child.stderr.take().map(|stream| {
        tokio::spawn(async move { read_capped(stream).await })
    });

    let mut timed_out = false;
    let mut return_code = None;

    match timeout(run_timeout, child.wait()).await {
        Ok(Ok(status)) => {
            return_code = status.code();
        }
        Ok(Err(error)) => {
            warn!(script = %script_path, %error, "failed waiting for script");
            return_code = Some(-1);
        }
        Err(_) => {
            timed_out = true;
            kill_process_tree(&mut child).await;
        }
    }

    let stdout = collect_output(stdout_task).await;
    let stderr = collect_output(stderr_task).await;

    let classification = classify_run(timed_out, return_code, &stderr);
    let success = classification == RunClassification::Ok;

    ScriptRunRecord {
        script_path,
        started_at,
        success,
        stdout,
        stderr,
        return_code,
        timed_out,
        classification,
    }
}

fn build_command(interpreter: &str, script: &Path, cwd: &Path, root: &Path) -> Command {
    let mut std_command = std::process::Command::new(interpreter);
    std_command
        .arg(script)
        .current_dir(cwd)
        .env("VIBEFOUNDRY_PROJECT_ROOT", root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_command.process_group(0);
    }

    Command::from(std_command)
}

async fn kill_process_tree(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            let pgid = libc::getpgid(pid as libc::pid_t);
            if pgid > 0 {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

async fn read_capped(mut stream: impl AsyncRead + Unpin) -> (Vec<u8>, bool) {
    let mut collected = Vec::new();
    let mut truncated = false;
    let mut buffer = [0u8; 8192];

    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                if collected.len() < OUTPUT_CAP_BYTES {
                    let take = read.min(OUTPUT_CAP_BYTES - collected.len());
                    collected.extend_from_slice(&buffer[..take]);
                    if take < read {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }

    (collected, truncated)
}

async fn collect_output(
    task: Option<tokio::task::JoinHandle<(Vec<u8>, bool)>>,
) -> String {
    let Some(task) = task else {
        return String::new();
    };

    let (bytes, truncated) = task.await.unwrap_or_default();
    let mut text = String::from_utf8_lossy(&bytes).to_string();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

fn classify_run(
    timed_out: bool,
    return_code: Option<i32>,
    stderr: &str,
) -> RunClassification {
    if timed_out {
        return RunClassification::TimedOut;
    }
    if return_code == Some(0) {
        return RunClassification::Ok;
    }
    if let Some(module) = extract_missing_module(stderr) {
        return RunClassification::MissingModule {
            module: resolve_package_alias(&module),
        };
    }
    RunClassification::Failed {
        code: return_code.unwrap_or(-1),
    }
}

fn extract_missing_module(stderr: &str) -> Option<String> {
    let marker = "No module named '";
    let start = stderr.find(marker)? + marker.len();
    let rest = &stderr[start..];
    let end = rest.find('\'')?;
    let module = &rest[..end];
    if module.is_empty() {
        return None;
    }
    Some(module.to_string())
}

/// Map an import name to its installable package, reducing submodules to
/// their top-level name first.
pub(crate) fn resolve_package_alias(module: &str) -> String {
    let top_level = module.split('.').next().unwrap_or(module);
    MODULE_ALIASES
        .iter()
        .find(|(import_name, _)| *import_name == top_level)
        .map(|(_, package)| (*package).to_string())
        .unwrap_or_else(|| top_level.to_string())
}

pub(crate) fn discover_scripts(root: &Path) -> Vec<DiscoveredScript> {
    let scripts_dir = root.join(policy::APP_DIR).join(policy::SCRIPTS_DIR);
    let mut scripts = Vec::new();
    collect_scripts(&scripts_dir, "", &mut scripts);
    scripts.sort_by(|a, b| a.1.cmp(&b.1));

    scripts
        .into_iter()
        .map(|(absolute, relative)| DiscoveredScript {
            path: absolute,
            relative_path: relative,
        })
        .collect()
}

fn collect_scripts(dir: &Path, prefix: &str, found: &mut Vec<(String, String)>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if path.is_dir() {
            if !policy::is_ignored_dir(&name) {
                let child_prefix = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                collect_scripts(&path, &child_prefix, found);
            }
        } else if !policy::is_hidden(&name)
            && policy::extension_of(&name).as_deref() == Some("py")
        {
            let relative = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            found.push((path.to_string_lossy().to_string(), relative));
        }
    }
}

/// Package names destined for pip's argv. Keeps installs to plain
/// requirement specifiers.
pub(crate) fn is_valid_package_spec(package: &str) -> bool {
    let trimmed = package.trim();
    !trimmed.is_empty()
        && trimmed.len() <= 128
        && trimmed.chars().all(|ch| {
            ch.is_ascii_alphanumeric()
                || matches!(ch, '-' | '_' | '.' | '[' | ']' | '=' | '<' | '>' | '~' | ',')
        })
}

pub(crate) async fn install_package(package: &str) -> InstallOutcome {
    let mut command = Command::new(python_bin());
    command
        .args(["-m", "pip", "install", "--disable-pip-version-check"])
        .arg(package.trim())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            return InstallOutcome {
                success: false,
                stdout: String::new(),
                stderr: format!("failed to start pip: {error}"),
            };
        }
    };

    let stdout_task = child.stdout.take().map(|stream| {
        tokio::spawn(async move { read_capped(stream).await })
    });
    let stderr_task = child.stderr.take().map(|stream| {
        tokio::spawn(async move { read_capped(stream).await })
    });

    let success = match timeout(PIP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        Ok(Err(error)) => {
            warn!(%error, "failed waiting for pip");
            false
        }
        Err(_) => {
            debug!(package, "pip install timed out");
            let _ = child.kill().await;
            let _ = child.wait().await;
            false
        }
    };

    InstallOutcome {
        success,
        stdout: collect_output(stdout_task).await,
        stderr: collect_output(stderr_task).await,
    }
}

fn python_bin() -> String {
    env::var("VIBEFOUNDRY_PYTHON").unwrap_or_else(|_| "python3".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell_runner(run_timeout: Duration) -> ScriptRunner {
        ScriptRunner::with_interpreter("/bin/sh".to_string(), run_timeout)
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, body).expect("write script");
        path
    }

    #[test]
    fn missing_module_extraction_handles_cpython_diagnostics() {
        let stderr = "Traceback (most recent call last):\n  File \"x.py\", line 1\nModuleNotFoundError: No module named 'PIL'\n";
        assert_eq!(extract_missing_module(stderr).as_deref(), Some("PIL"));
        assert_eq!(extract_missing_module("SyntaxError: invalid syntax"), None);
        assert_eq!(
            extract_missing_module("ImportError: No module named 'yaml.loader'").as_deref(),
            Some("yaml.loader")
        );
    }

    #[test]
    fn aliases_map_imports_to_installable_packages() {
        assert_eq!(resolve_package_alias("PIL"), "pillow");
        assert_eq!(resolve_package_alias("PIL.Image"), "pillow");
        assert_eq!(resolve_package_alias("cv2"), "opencv-python");
        assert_eq!(resolve_package_alias("sklearn.linear_model"), "scikit-learn");
        assert_eq!(resolve_package_alias("yaml"), "pyyaml");
        assert_eq!(resolve_package_alias("pandas"), "pandas");
        assert_eq!(resolve_package_alias("numpy.linalg"), "numpy");
    }

    #[test]
    fn classification_prefers_timeout_then_missing_module() {
        assert_eq!(classify_run(true, None, ""), RunClassification::TimedOut);
        assert_eq!(classify_run(false, Some(0), ""), RunClassification::Ok);
        assert_eq!(
            classify_run(false, Some(1), "ModuleNotFoundError: No module named 'cv2'"),
            RunClassification::MissingModule {
                module: "opencv-python".to_string()
            }
        );
        assert_eq!(
            classify_run(false, Some(2), "boom"),
            RunClassification::Failed { code: 2 }
        );
    }

    #[test]
    fn classification_serializes_with_type_tags() {
        let encoded = serde_json::to_value(RunClassification::MissingModule {
            module: "pillow".to_string(),
        })
        .expect("serialize classification");
        assert_eq!(encoded["type"], "missing_module");
        assert_eq!(encoded["module"], "pillow");
    }

    #[test]
    fn discovery_finds_nested_python_scripts_sorted() {
        let dir = TempDir::new().expect("temp dir");
        let scripts = dir.path().join("app/scripts");
        fs::create_dir_all(scripts.join("nested")).expect("mkdir");
        fs::write(scripts.join("b.py"), "").expect("write");
        fs::write(scripts.join("a.py"), "").expect("write");
        fs::write(scripts.join("notes.md"), "").expect("write");
        fs::write(scripts.join("nested/deep.py"), "").expect("write");
        fs::create_dir_all(scripts.join("__pycache__")).expect("mkdir");
        fs::write(scripts.join("__pycache__/x.py"), "").expect("write");

        let found = discover_scripts(dir.path());
        let relative: Vec<&str> = found
            .iter()
            .map(|script| script.relative_path.as_str())
            .collect();
        assert_eq!(relative, vec!["a.py", "b.py", "nested/deep.py"]);
    }

    #[test]
    fn package_spec_validation_rejects_shell_metacharacters() {
        assert!(is_valid_package_spec("pandas"));
        assert!(is_valid_package_spec("pandas==2.2.0"));
        assert!(is_valid_package_spec("uvicorn[standard]"));
        assert!(!is_valid_package_spec(""));
        assert!(!is_valid_package_spec("pandas; rm -rf /"));
        assert!(!is_valid_package_spec("pkg && evil"));
    }

    #[tokio::test]
    async fn run_script_captures_output_and_exit_status() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "ok.sh", "echo out-line\necho err-line >&2\nexit 0\n");

        let record = run_script("/bin/sh", &script, dir.path(), Duration::from_secs(5)).await;
        assert!(record.success);
        assert_eq!(record.return_code, Some(0));
        assert!(record.stdout.contains("out-line"));
        assert!(record.stderr.contains("err-line"));
        assert_eq!(record.classification, RunClassification::Ok);
    }

    #[tokio::test]
    async fn run_script_reports_missing_script() {
        let dir = TempDir::new().expect("temp dir");
        let record = run_script(
            "/bin/sh",
            &dir.path().join("ghost.sh"),
            dir.path(),
            Duration::from_secs(1),
        )
        .await;
        assert!(!record.success);
        assert_eq!(record.classification, RunClassification::Failed { code: -1 });
    }

    #[tokio::test]
    async fn run_script_classifies_missing_modules() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            &dir,
            "broken.sh",
            "echo \"ModuleNotFoundError: No module named 'PIL'\" >&2\nexit 1\n",
        );

        let record = run_script("/bin/sh", &script, dir.path(), Duration::from_secs(5)).await;
        assert!(!record.success);
        assert_eq!(
            record.classification,
            RunClassification::MissingModule {
                module: "pillow".to_string()
            }
        );
    }

    #[tokio::test]
    async fn run_script_enforces_the_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(&dir, "slow.sh", "sleep 30\n");

        let record = run_script("/bin/sh", &script, dir.path(), Duration::from_millis(300)).await;
        assert!(record.timed_out);
        assert!(!record.success);
        assert_eq!(record.classification, RunClassification::TimedOut);
    }

    #[tokio::test]
    async fn run_script_caps_runaway_output() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            &dir,
            "noisy.sh",
            "i=0\nwhile [ $i -lt 40000 ]; do echo 'aaaaaaaaaaaaaaaa'; i=$((i+1)); done\n",
        );

        let record = run_script("/bin/sh", &script, dir.path(), Duration::from_secs(30)).await;
        assert!(record.stdout.len() <= OUTPUT_CAP_BYTES + TRUNCATION_MARKER.len());
        assert!(record.stdout.ends_with(TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn run_script_uses_the_script_parent_as_cwd() {
        let dir = TempDir::new().expect("temp dir");
        let nested = dir.path().join("app/scripts/nested");
        fs::create_dir_all(&nested).expect("mkdir");
        let script = nested.join("where.sh");
        fs::write(&script, "pwd\n").expect("write script");

        let record = run_script("/bin/sh", &script, dir.path(), Duration::from_secs(5)).await;
        assert!(record.stdout.trim_end().ends_with("app/scripts/nested"));
    }

    #[tokio::test]
    async fn queue_runs_fifo_and_deduplicates_pending_paths() {
        let dir = TempDir::new().expect("temp dir");
        let script_a = write_script(&dir, "a.sh", "sleep 0.2\necho ran-a\n");
        let script_b = write_script(&dir, "b.sh", "echo ran-b\n");

        let runner = shell_runner(Duration::from_secs(10));
        let mut receivers = runner
            .submit_batch(
                vec![script_a.clone(), script_b.clone(), script_a.clone()],
                dir.path().to_path_buf(),
            )
            .await;
        assert_eq!(receivers.len(), 3);

        let rx_a2 = receivers.pop().expect("third receiver");
        let rx_b = receivers.pop().expect("second receiver");
        let rx_a1 = receivers.pop().expect("first receiver");

        let record_a1 = rx_a1.await.expect("first a record");
        let record_b = rx_b.await.expect("b record");
        let record_a2 = rx_a2.await.expect("deduped a record");

        assert!(record_a1.stdout.contains("ran-a"));
        assert!(record_b.stdout.contains("ran-b"));
        assert_eq!(record_a1.started_at, record_a2.started_at);
        assert!(record_a1.started_at <= record_b.started_at);
    }
}
