use std::path::Path;

pub(crate) const APP_DIR: &str = "app";
pub(crate) const INPUT_DIR: &str = "input";
pub(crate) const OUTPUT_DIR: &str = "output";
pub(crate) const SCRIPTS_DIR: &str = "scripts";
pub(crate) const META_DATA_DIR: &str = "meta_data";

pub(crate) const MAX_APP_TEXT_BYTES: u64 = 50 * 1024;

const FORBIDDEN_IN_APP_EXTENSIONS: &[&str] = &["csv", "xlsx", "xls", "json"];
const FORBIDDEN_SYNC_EXTENSIONS: &[&str] =
    &["pdf", "csv", "xlsx", "xls", "xlsm", "xlsb", "ppt", "pptx"];
const PROTECTED_PUSH_STEMS: &[&str] = &["sync_server", "metadatafarmer"];
const PROTECTED_PUSH_NAMES: &[&str] = &["CLAUDE.md"];
const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    ".git",
    "target",
    "dist",
    "build",
    ".venv",
    "venv",
];

pub(crate) fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

pub(crate) fn is_ignored_dir(name: &str) -> bool {
    name.starts_with('.') || IGNORED_DIRS.contains(&name)
}

pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// File classes that must never live under `app/`. The size is only needed
/// for the oversized-text rule; callers that have not stat'ed the file pass
/// `None` and large text files pass the check.
pub(crate) fn is_forbidden_in_app(name: &str, size: Option<u64>) -> bool {
    let Some(extension) = extension_of(name) else {
        return false;
    };

    if FORBIDDEN_IN_APP_EXTENSIONS.contains(&extension.as_str()) {
        return true;
    }

    extension == "txt" && size.is_some_and(|bytes| bytes > MAX_APP_TEXT_BYTES)
}

pub(crate) fn is_forbidden_for_sync(name: &str) -> bool {
    extension_of(name)
        .map(|extension| FORBIDDEN_SYNC_EXTENSIONS.contains(&extension.as_str()))
        .unwrap_or(false)
}

/// Files the remote owns. Local copies stay local on push.
pub(crate) fn is_protected_from_push(name: &str) -> bool {
    if PROTECTED_PUSH_NAMES.contains(&name) {
        return true;
    }

    let stem = name.split('.').next().unwrap_or(name);
    PROTECTED_PUSH_STEMS.contains(&stem)
}

pub(crate) fn is_protected_dir(name: &str) -> bool {
    name == META_DATA_DIR
}

/// True when `relative` (project-root relative, `/`-separated) sits inside
/// the protected `app/` subtree.
pub(crate) fn is_within_app(relative: &str) -> bool {
    relative == APP_DIR || relative.starts_with("app/")
}
