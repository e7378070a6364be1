use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
    policy,
    watcher::{file_modified_unix, ChangeBus, ChangeFrame, ACTION_DELETED_FOR_SAFETY},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TreeNode {
    pub(crate) name: String,
    pub(crate) path: String,
    pub(crate) is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) last_modified: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub(crate) children: Option<Vec<TreeNode>>,
}

/// Filtered snapshot of the project tree. Files the policy forbids under
/// `app/` are deleted on discovery and never appear in the snapshot; each
/// deletion is announced on the bus as a safety event.
pub(crate) fn scan_tree(root: &Path, bus: Option<&ChangeBus>) -> io::Result<TreeNode> {
    let name = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| root.to_string_lossy().to_string());

    let children = scan_directory(root, root, "", false, bus)?;

    Ok(TreeNode {
        path: name.clone(),
        name,
        is_directory: true,
        extension: None,
        last_modified: None,
        children: Some(children),
    })
}

fn scan_directory(
    root: &Path,
    dir: &Path,
    relative: &str,
    under_app: bool,
    bus: Option<&ChangeBus>,
) -> io::Result<Vec<TreeNode>> {
    let mut directories: Vec<(String, PathBuf)> = Vec::new();
    let mut files: Vec<(String, PathBuf)> = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if path.is_dir() {
            if !policy::is_ignored_dir(&name) {
                directories.push((name, path));
            }
        } else if !policy::is_hidden(&name) {
            files.push((name, path));
        }
    }

    directories.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));
    files.sort_by(|a, b| a.0.to_lowercase().cmp(&b.0.to_lowercase()));

    let mut nodes = Vec::with_capacity(directories.len() + files.len());

    for (name, path) in directories {
        let child_relative = join_relative(relative, &name);
        let child_under_app = under_app || (relative.is_empty() && name == policy::APP_DIR);
        let children = scan_directory(root, &path, &child_relative, child_under_app, bus)?;
        nodes.push(TreeNode {
            name,
            path: child_relative,
            is_directory: true,
            extension: None,
            last_modified: None,
            children: Some(children),
        });
    }

    for (name, path) in files {
        let child_relative = join_relative(relative, &name);

        if under_app {
            let size = fs::metadata(&path).map(|meta| meta.len()).ok();
            if policy::is_forbidden_in_app(&name, size) {
                purge_forbidden_file(&path, &child_relative, bus);
                continue;
            }
        }

        nodes.push(TreeNode {
            extension: dotted_extension(&name),
            last_modified: file_modified_unix(&path),
            name,
            path: child_relative,
            is_directory: false,
            children: None,
        });
    }

    Ok(nodes)
}

fn purge_forbidden_file(path: &Path, relative: &str, bus: Option<&ChangeBus>) {
    match fs::remove_file(path) {
        Ok(()) => warn!(path = relative, "removed forbidden file from app subtree"),
        Err(error) => warn!(
            path = relative,
            %error,
            "failed to remove forbidden file from app subtree"
        ),
    }

    if let Some(bus) = bus {
        bus.publish(ChangeFrame::DataChange {
            path: relative.to_string(),
            action: Some(ACTION_DELETED_FOR_SAFETY.to_string()),
        });
    }
}

/// Sorted `path:modtime` concatenation over the snapshot's files. Two equal
/// signatures mean the tree did not change between scans.
pub(crate) fn scan_signature(node: &TreeNode) -> String {
    let mut entries = Vec::new();
    collect_signature_entries(node, &mut entries);
    entries.sort();
    entries.join(";")
}

fn collect_signature_entries(node: &TreeNode, entries: &mut Vec<String>) {
    if node.is_directory {
        if let Some(children) = &node.children {
            for child in children {
                collect_signature_entries(child, entries);
            }
        }
    } else {
        entries.push(format!(
            "{}:{}",
            node.path,
            node.last_modified.unwrap_or_default()
        ));
    }
}

fn join_relative(relative: &str, name: &str) -> String {
    if relative.is_empty() {
        name.to_string()
    } else {
        format!("{relative}/{name}")
    }
}

fn dotted_extension(name: &str) -> Option<String> {
    policy::extension_of(name).map(|extension| format!(".{extension}"))
}
