use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc, Arc,
    },
    time::{Duration, Instant},
};

use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{policy, project};

pub(crate) const EVENT_BUS_CAPACITY: usize = 64;
const COALESCE_WINDOW: Duration = Duration::from_millis(1000);
const METADATA_DEBOUNCE: Duration = Duration::from_millis(2000);
const FLUSH_TICK: Duration = Duration::from_millis(200);
const REATTACH_BACKOFF_SECS: &[u64] = &[3, 6, 12];

const OUTPUT_PREVIEW_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "gif", "webp", "csv", "xlsx", "xls"];

pub(crate) const ACTION_DELETED_FOR_SAFETY: &str = "deleted-for-safety";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub(crate) enum ChangeFrame {
    ScriptChange {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_modified: Option<i64>,
    },
    DataChange {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
    OutputFileChange {
        path: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_modified: Option<i64>,
    },
    WatchError {
        detail: String,
    },
    Keepalive,
}

impl ChangeFrame {
    fn coalesce_key(&self) -> Option<String> {
        match self {
            ChangeFrame::ScriptChange { path, .. } => Some(format!("script:{path}")),
            ChangeFrame::DataChange { path, .. } => Some(format!("data:{path}")),
            ChangeFrame::OutputFileChange { path, .. } => Some(format!("output:{path}")),
            ChangeFrame::WatchError { .. } | ChangeFrame::Keepalive => None,
        }
    }

    fn is_data_change(&self) -> bool {
        matches!(self, ChangeFrame::DataChange { .. })
    }
}

/// Fan-out hub for change notifications. Slow subscribers lag and lose their
/// oldest frames; they never back-pressure the watcher.
#[derive(Clone)]
pub(crate) struct ChangeBus {
    tx: broadcast::Sender<ChangeFrame>,
}

impl ChangeBus {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ChangeFrame> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, frame: ChangeFrame) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(frame);
    }
}

/// Watches one project root. The bus outlives the watcher: re-selecting a
/// project replaces the watcher while subscribers stay attached.
pub(crate) struct ProjectWatcher {
    stop: Arc<AtomicBool>,
}

impl ProjectWatcher {
    pub(crate) fn spawn(root: PathBuf, bus: ChangeBus) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let (raw_tx, raw_rx) = mpsc::unbounded_channel::<notify::Event>();

        {
            let root = root.clone();
            let stop = stop.clone();
            let bus = bus.clone();
            std::thread::spawn(move || watch_thread(root, stop, raw_tx, bus));
        }

        tokio::spawn(coalesce_loop(root, raw_rx, bus));

        Self { stop }
    }

    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_thread(
    root: PathBuf,
    stop: Arc<AtomicBool>,
    raw_tx: mpsc::UnboundedSender<notify::Event>,
    bus: ChangeBus,
) {
    let mut attempt = 0usize;

    while !stop.load(Ordering::Relaxed) {
        let (tx, rx) = std_mpsc::channel();
        let mut watcher = match RecommendedWatcher::new(tx, Config::default()) {
            Ok(watcher) => watcher,
            Err(error) => {
                report_watch_failure(&bus, &stop, &mut attempt, &error.to_string());
                continue;
            }
        };

        if let Err(error) = watcher.watch(&root, RecursiveMode::Recursive) {
            report_watch_failure(&bus, &stop, &mut attempt, &error.to_string());
            continue;
        }

        attempt = 0;
        debug!(root = %root.display(), "watcher attached");

        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }

            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(Ok(event)) => {
                    if raw_tx.send(event).is_err() {
                        return;
                    }
                }
                Ok(Err(error)) => {
                    report_watch_failure(&bus, &stop, &mut attempt, &error.to_string());
                    break;
                }
                Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                    report_watch_failure(&bus, &stop, &mut attempt, "watch channel closed");
                    break;
                }
            }
        }
    }
}

fn report_watch_failure(
    bus: &ChangeBus,
    stop: &Arc<AtomicBool>,
    attempt: &mut usize,
    detail: &str,
) {
    warn!(detail, "watcher failed, scheduling re-attach");
    bus.publish(ChangeFrame::WatchError {
        detail: detail.to_string(),
    });

    let backoff = REATTACH_BACKOFF_SECS[(*attempt).min(REATTACH_BACKOFF_SECS.len() - 1)];
    *attempt += 1;

    let deadline = Instant::now() + Duration::from_secs(backoff);
    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
}

async fn coalesce_loop(
    root: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<notify::Event>,
    bus: ChangeBus,
) {
    let mut coalescer = Coalescer::new();
    let mut metadata_deadline: Option<Instant> = None;
    let mut tick = tokio::time::interval(FLUSH_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_event = raw_rx.recv() => {
                let Some(event) = maybe_event else { break };
                let now = Instant::now();
                for frame in classify_event(&root, &event) {
                    if frame.is_data_change() {
                        metadata_deadline = Some(now + METADATA_DEBOUNCE);
                    }
                    coalescer.offer(frame, now);
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for frame in coalescer.flush(now) {
                    bus.publish(frame);
                }

                if metadata_deadline.is_some_and(|deadline| deadline <= now) {
                    metadata_deadline = None;
                    let root = root.clone();
                    tokio::task::spawn_blocking(move || {
                        if let Err(error) = project::generate_metadata(&root) {
                            warn!(%error, "metadata rebuild after data change failed");
                        }
                    });
                }
            }
        }
    }
}

/// Per-path coalescing: the first event for a path opens a window; later
/// events inside the window replace the stored frame so subscribers see one
/// frame carrying the latest state.
struct Coalescer {
    pending: HashMap<String, (ChangeFrame, Instant)>,
}

impl Coalescer {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    fn offer(&mut self, frame: ChangeFrame, now: Instant) {
        let Some(key) = frame.coalesce_key() else {
            return;
        };

        match self.pending.get_mut(&key) {
            Some((stored, _deadline)) => *stored = frame,
            None => {
                self.pending.insert(key, (frame, now + COALESCE_WINDOW));
            }
        }
    }

    fn flush(&mut self, now: Instant) -> Vec<ChangeFrame> {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut frames = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some((frame, _)) = self.pending.remove(&key) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn classify_event(root: &Path, event: &notify::Event) -> Vec<ChangeFrame> {
    let upsert = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_));
    let removal = matches!(event.kind, EventKind::Remove(_));
    if !upsert && !removal {
        return Vec::new();
    }

    event
        .paths
        .iter()
        .filter_map(|path| classify_path(root, path, upsert))
        .collect()
}

fn classify_path(root: &Path, path: &Path, upsert: bool) -> Option<ChangeFrame> {
    let relative = path.strip_prefix(root).ok()?;
    let mut components = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().to_string());

    let top = components.next()?;
    let rest: Vec<String> = components.collect();
    if rest.iter().any(|segment| policy::is_ignored_dir(segment)) {
        return None;
    }

    let relative_str = relative.to_string_lossy().replace('\\', "/");
    let name = rest.last().cloned().unwrap_or_else(|| top.clone());
    let extension = policy::extension_of(&name);

    match top.as_str() {
        policy::INPUT_DIR => Some(ChangeFrame::DataChange {
            path: relative_str,
            action: None,
        }),
        policy::APP_DIR if upsert => {
            let in_scripts = rest.first().map(String::as_str) == Some(policy::SCRIPTS_DIR);
            let is_python = extension.as_deref() == Some("py");
            if in_scripts || is_python {
                Some(ChangeFrame::ScriptChange {
                    last_modified: file_modified_unix(path),
                    path: relative_str,
                })
            } else {
                None
            }
        }
        policy::OUTPUT_DIR if upsert => {
            let previewable = extension
                .as_deref()
                .is_some_and(|ext| OUTPUT_PREVIEW_EXTENSIONS.contains(&ext));
            previewable.then(|| ChangeFrame::OutputFileChange {
                last_modified: file_modified_unix(path),
                path: relative_str,
            })
        }
        _ => None,
    }
}

pub(crate) fn file_modified_unix(path: &Path) -> Option<i64> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn upsert_event(path: &Path) -> notify::Event {
        notify::Event {
            kind: EventKind::Modify(ModifyKind::Any),
            paths: vec![path.to_path_buf()],
            attrs: Default::default(),
        }
    }

    #[test]
    fn script_changes_cover_scripts_dir_and_python_under_app() {
        let root = Path::new("/proj");
        let frame = classify_path(root, Path::new("/proj/app/scripts/run.sh"), true)
            .expect("scripts dir entry classified");
        assert!(matches!(frame, ChangeFrame::ScriptChange { ref path, .. } if path == "app/scripts/run.sh"));

        let frame = classify_path(root, Path::new("/proj/app/tools/helper.py"), true)
            .expect("python under app classified");
        assert!(matches!(frame, ChangeFrame::ScriptChange { ref path, .. } if path == "app/tools/helper.py"));

        assert!(classify_path(root, Path::new("/proj/app/notes.md"), true).is_none());
    }

    #[test]
    fn input_events_classify_as_data_change_including_removals() {
        let root = Path::new("/proj");
        let frame = classify_path(root, Path::new("/proj/input/sales.csv"), true)
            .expect("input upsert classified");
        assert!(matches!(frame, ChangeFrame::DataChange { ref path, .. } if path == "input/sales.csv"));

        let frame = classify_path(root, Path::new("/proj/input/sales.csv"), false)
            .expect("input removal classified");
        assert!(matches!(frame, ChangeFrame::DataChange { .. }));
    }

    #[test]
    fn output_events_require_previewable_extensions() {
        let root = Path::new("/proj");
        assert!(matches!(
            classify_path(root, Path::new("/proj/output/plot.png"), true),
            Some(ChangeFrame::OutputFileChange { .. })
        ));
        assert!(classify_path(root, Path::new("/proj/output/debug.log"), true).is_none());
        assert!(classify_path(root, Path::new("/proj/output/plot.png"), false).is_none());
    }

    #[test]
    fn events_inside_ignored_dirs_are_dropped() {
        let root = Path::new("/proj");
        assert!(classify_path(root, Path::new("/proj/app/__pycache__/run.py"), true).is_none());
        assert!(classify_path(root, Path::new("/proj/input/.tmp/x.csv"), true).is_none());
    }

    #[test]
    fn events_outside_the_root_are_dropped() {
        assert!(classify_path(Path::new("/proj"), Path::new("/other/input/x.csv"), true).is_none());
    }

    #[test]
    fn classify_event_fans_out_over_paths() {
        let root = Path::new("/proj");
        let event = notify::Event {
            kind: EventKind::Create(CreateKind::File),
            paths: vec![
                PathBuf::from("/proj/input/a.csv"),
                PathBuf::from("/proj/output/b.png"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(classify_event(root, &event).len(), 2);
    }

    #[test]
    fn coalescer_emits_one_frame_per_path_per_window() {
        let mut coalescer = Coalescer::new();
        let start = Instant::now();

        for sequence in 0..5 {
            coalescer.offer(
                ChangeFrame::ScriptChange {
                    path: "app/scripts/s.py".to_string(),
                    last_modified: Some(1_700_000_000 + sequence),
                },
                start + Duration::from_millis(80 * sequence as u64),
            );
        }

        assert!(coalescer.flush(start + Duration::from_millis(900)).is_empty());

        let frames = coalescer.flush(start + COALESCE_WINDOW);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0],
            ChangeFrame::ScriptChange {
                path: "app/scripts/s.py".to_string(),
                last_modified: Some(1_700_000_004),
            }
        );
    }

    #[test]
    fn coalescer_keeps_distinct_paths_independent() {
        let mut coalescer = Coalescer::new();
        let start = Instant::now();

        coalescer.offer(
            ChangeFrame::DataChange {
                path: "input/a.csv".to_string(),
                action: None,
            },
            start,
        );
        coalescer.offer(
            ChangeFrame::DataChange {
                path: "input/b.csv".to_string(),
                action: None,
            },
            start,
        );

        let frames = coalescer.flush(start + COALESCE_WINDOW);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn bus_drops_oldest_frames_for_lagging_subscribers() {
        let bus = ChangeBus::new();
        let mut rx = bus.subscribe();

        for sequence in 0..(EVENT_BUS_CAPACITY + 8) {
            bus.publish(ChangeFrame::DataChange {
                path: format!("input/{sequence}.csv"),
                action: None,
            });
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                assert_eq!(skipped, 8);
            }
            other => panic!("expected lagged receiver, got {other:?}"),
        }
    }

    #[test]
    fn frames_serialize_with_wire_type_tags() {
        let frame = ChangeFrame::OutputFileChange {
            path: "output/plot.png".to_string(),
            last_modified: Some(1_700_000_000),
        };
        let encoded = serde_json::to_value(&frame).expect("serialize frame");
        assert_eq!(encoded["type"], "output_file_change");
        assert_eq!(encoded["path"], "output/plot.png");
        assert_eq!(encoded["lastModified"], 1_700_000_000);

        let keepalive = serde_json::to_value(ChangeFrame::Keepalive).expect("serialize keepalive");
        assert_eq!(keepalive["type"], "keepalive");
    }

    #[tokio::test]
    async fn watcher_survives_missing_root_and_reports_errors() {
        let bus = ChangeBus::new();
        let mut rx = bus.subscribe();
        let watcher = ProjectWatcher::spawn(PathBuf::from("/nonexistent-vibefoundry-root"), bus);

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watch error within deadline")
            .expect("frame delivered");
        assert!(matches!(frame, ChangeFrame::WatchError { .. }));

        watcher.stop();
    }

    #[test]
    fn upsert_event_paths_are_visible_to_classification() {
        let event = upsert_event(Path::new("/proj/input/x.csv"));
        assert_eq!(classify_event(Path::new("/proj"), &event).len(), 1);
    }
}
