use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use chrono::Local;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::{policy, preview};

const METADATA_DATA_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls", "parquet"];

const DEFAULT_CLAUDE_MD: &str = r#"# Project conventions

This folder is the synced workspace for the analysis assistant.

- `scripts/` holds runnable Python scripts. Write results into the project's
  `output/` folder, read raw data only through the summaries in `meta_data/`.
- `meta_data/input_metadata.txt` and `meta_data/output_metadata.txt` describe
  the data files available locally. They are regenerated automatically; do not
  edit them by hand.
- Never write `.csv`, `.xlsx`, `.xls`, or `.json` files into this folder.
"#;

const DEFAULT_METADATA_FARMER: &str = r#"import os
import pandas as pd
from datetime import datetime

BASE_DIR = os.path.dirname(os.path.dirname(os.path.abspath(__file__)))
INPUT_FOLDER = os.path.join(BASE_DIR, 'input')
OUTPUT_FOLDER = os.path.join(BASE_DIR, 'output')
META_DATA_FOLDER = os.path.join(BASE_DIR, 'app', 'meta_data')


def describe_csv(filepath, base_folder):
    stat = os.stat(filepath)
    sample = pd.read_csv(filepath, nrows=100)
    rows = sum(1 for _ in open(filepath, 'r', encoding='utf-8')) - 1
    lines = [
        f"File: {os.path.relpath(filepath, base_folder)}",
        f"  Size: {round(stat.st_size / (1024 * 1024), 2)} MB",
        f"  Rows: {rows:,}",
        f"  Columns ({len(sample.columns)}):",
    ]
    for col in sample.columns:
        lines.append(f"    - {col} ({sample[col].dtype})")
    return '\n'.join(lines)


def scan(folder):
    if not os.path.exists(folder):
        return f"Folder does not exist: {folder}"
    found = []
    for root, _dirs, files in os.walk(folder):
        for name in files:
            if name.lower().endswith('.csv'):
                found.append(os.path.join(root, name))
    if not found:
        return "No CSV files found."
    blocks = []
    for path in sorted(found):
        try:
            blocks.append(describe_csv(path, folder))
        except Exception as exc:
            blocks.append(f"File: {os.path.relpath(path, folder)}\n  Error: {exc}")
    return '\n\n'.join(blocks)


def main():
    os.makedirs(META_DATA_FOLDER, exist_ok=True)
    stamp = datetime.now().strftime("%Y-%m-%d %H:%M:%S")
    for folder, target, title in (
        (INPUT_FOLDER, 'input_metadata.txt', 'Input Folder'),
        (OUTPUT_FOLDER, 'output_metadata.txt', 'Output Folder'),
    ):
        with open(os.path.join(META_DATA_FOLDER, target), 'w') as handle:
            handle.write(f"{title} Metadata\nGenerated: {stamp}\n{'=' * 50}\n\n")
            handle.write(scan(folder))


if __name__ == '__main__':
    main()
"#;

#[derive(Debug, Clone)]
pub(crate) struct Project {
    pub(crate) name: String,
    pub(crate) root: PathBuf,
    pub(crate) epoch: u64,
}

#[derive(Debug)]
pub(crate) enum SelectError {
    Missing(PathBuf),
    NotADirectory(PathBuf),
    Io(io::Error),
}

impl std::fmt::Display for SelectError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectError::Missing(path) => {
                write!(formatter, "folder does not exist: {}", path.display())
            }
            SelectError::NotADirectory(path) => {
                write!(formatter, "path is not a directory: {}", path.display())
            }
            SelectError::Io(error) => write!(formatter, "failed to prepare folder: {error}"),
        }
    }
}

/// Process-wide active-project handle. Selection is serialized; each
/// successful selection bumps the epoch so in-flight work against the
/// previous root can tell it lost the race.
pub(crate) struct ProjectRegistry {
    current: RwLock<Option<Project>>,
    epoch: AtomicU64,
    select_gate: Mutex<()>,
}

impl ProjectRegistry {
    pub(crate) fn new() -> Self {
        Self {
            current: RwLock::new(None),
            epoch: AtomicU64::new(0),
            select_gate: Mutex::new(()),
        }
    }

    pub(crate) async fn current(&self) -> Option<Project> {
        self.current.read().await.clone()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) async fn select(&self, path: &Path) -> Result<Project, SelectError> {
        let _gate = self.select_gate.lock().await;

        if !path.exists() {
            return Err(SelectError::Missing(path.to_path_buf()));
        }
        if !path.is_dir() {
            return Err(SelectError::NotADirectory(path.to_path_buf()));
        }

        scaffold(path).map_err(SelectError::Io)?;

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let project = Project {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string_lossy().to_string()),
            root: path.to_path_buf(),
            epoch,
        };

        *self.current.write().await = Some(project.clone());
        info!(root = %project.root.display(), epoch, "project selected");
        Ok(project)
    }
}

/// Create the conventional subtrees and helper files. Existing files are
/// left untouched, so re-selecting a project is a no-op.
pub(crate) fn scaffold(root: &Path) -> io::Result<()> {
    let app = root.join(policy::APP_DIR);

    for dir in [
        root.join(policy::INPUT_DIR),
        root.join(policy::OUTPUT_DIR),
        app.clone(),
        app.join(policy::SCRIPTS_DIR),
        app.join(policy::META_DATA_DIR),
    ] {
        fs::create_dir_all(dir)?;
    }

    write_if_missing(&app.join("CLAUDE.md"), DEFAULT_CLAUDE_MD)?;
    write_if_missing(&app.join("metadatafarmer.py"), DEFAULT_METADATA_FARMER)?;

    Ok(())
}

fn write_if_missing(path: &Path, content: &str) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, content)
}

/// Walk `input/` and `output/` and write per-file summaries into
/// `app/meta_data/`. Returns the two summary texts.
pub(crate) fn generate_metadata(root: &Path) -> io::Result<(String, String)> {
    let meta_dir = root.join(policy::APP_DIR).join(policy::META_DATA_DIR);
    fs::create_dir_all(&meta_dir)?;

    let input_meta = summarize_folder(&root.join(policy::INPUT_DIR), "Input Folder");
    let output_meta = summarize_folder(&root.join(policy::OUTPUT_DIR), "Output Folder");

    fs::write(meta_dir.join("input_metadata.txt"), &input_meta)?;
    fs::write(meta_dir.join("output_metadata.txt"), &output_meta)?;

    Ok((input_meta, output_meta))
}

fn summarize_folder(folder: &Path, title: &str) -> String {
    let mut lines = vec![
        format!("{title} Metadata"),
        format!("Folder: {}", folder.display()),
        format!("Generated: {}", Local::now().format("%Y-%m-%d %H:%M:%S")),
        "=".repeat(50),
        String::new(),
    ];

    let mut data_files = Vec::new();
    collect_data_files(folder, &mut data_files);
    data_files.sort();

    if data_files.is_empty() {
        lines.push("No data files found.".to_string());
        return lines.join("\n");
    }

    for path in data_files {
        let relative = path
            .strip_prefix(folder)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        let size_mb = fs::metadata(&path)
            .map(|meta| meta.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or_default();

        lines.push(format!("File: {relative}"));
        lines.push(format!("  Size: {size_mb:.2} MB"));

        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

        if is_csv {
            match preview::csv_file_summary(&path) {
                Ok(summary) => {
                    lines.push(format!("  Rows: {}", summary.row_count));
                    lines.push(format!("  Columns ({}):", summary.columns.len()));
                    for (name, dtype) in summary.columns {
                        lines.push(format!("    - {name} ({dtype})"));
                    }
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "could not summarize data file");
                    lines.push(format!("  Error reading: {error}"));
                }
            }
        } else {
            lines.push("  Column summary unavailable for this format.".to_string());
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

fn collect_data_files(folder: &Path, found: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(folder) else {
        return;
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if path.is_dir() {
            if !policy::is_ignored_dir(&name) {
                collect_data_files(&path, found);
            }
        } else if policy::extension_of(&name)
            .is_some_and(|ext| METADATA_DATA_EXTENSIONS.contains(&ext.as_str()))
        {
            found.push(path);
        }
    }
}
