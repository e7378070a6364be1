pub mod policy;
pub mod preview;
pub mod project;
pub mod remote;
pub mod scripts;
pub mod sync;
pub mod terminal;
pub mod tree;
pub mod watcher;

pub(crate) use project::ProjectRegistry;
pub(crate) use remote::RemoteClient;
pub(crate) use scripts::ScriptRunner;
pub(crate) use sync::SyncState;
pub(crate) use terminal::TerminalRegistry;
pub(crate) use watcher::{ChangeBus, ProjectWatcher};
