use std::{
    collections::HashMap,
    io::{Read, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use axum::extract::ws::{close_code, CloseFrame, Message as ClientMessage, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message as RemoteMessage};
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) const DEFAULT_COLS: u16 = 80;
pub(crate) const DEFAULT_ROWS: u16 = 20;
const REMOTE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(27);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const REMOTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PTY_OUTPUT_QUEUE: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TerminalSessionInfo {
    pub(crate) id: String,
    pub(crate) mode: &'static str,
    pub(crate) cols: u16,
    pub(crate) rows: u16,
    pub(crate) started_at: String,
    pub(crate) last_activity: i64,
}

struct SessionEntry {
    info: TerminalSessionInfo,
    close: Arc<Notify>,
}

/// Registry of live terminal sessions. Each session owns its sockets; the
/// registry only tracks identity, geometry and the close signal.
pub(crate) struct TerminalRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl TerminalRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn register(
        &self,
        mode: &'static str,
        cols: u16,
        rows: u16,
    ) -> (String, Arc<Notify>) {
        let id = Uuid::new_v4().to_string();
        let close = Arc::new(Notify::new());
        let entry = SessionEntry {
            info: TerminalSessionInfo {
                id: id.clone(),
                mode,
                cols,
                rows,
                started_at: Utc::now().to_rfc3339(),
                last_activity: Utc::now().timestamp(),
            },
            close: close.clone(),
        };

        self.sessions.write().await.insert(id.clone(), entry);
        (id, close)
    }

    pub(crate) async fn touch(&self, id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.info.last_activity = Utc::now().timestamp();
        }
    }

    pub(crate) async fn update_geometry(&self, id: &str, cols: u16, rows: u16) {
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.info.cols = cols;
            entry.info.rows = rows;
        }
    }

    pub(crate) async fn remove(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    pub(crate) async fn list(&self) -> Vec<TerminalSessionInfo> {
        let mut sessions: Vec<TerminalSessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub(crate) async fn close(&self, id: &str) -> bool {
        match self.sessions.read().await.get(id) {
            Some(entry) => {
                entry.close.notify_waiters();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    cols: Option<u16>,
    rows: Option<u16>,
}

fn parse_control(text: &str) -> Option<ControlFrame> {
    serde_json::from_str::<ControlFrame>(text).ok()
}

fn is_pong_frame(text: &str) -> bool {
    parse_control(text).is_some_and(|frame| frame.kind == "pong")
}

fn close_message(reason: &str) -> ClientMessage {
    ClientMessage::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: reason.to_string().into(),
    }))
}

/// Local PTY leg: the user's shell in the project root, fixed geometry at
/// open, resized only by an explicit control frame.
pub(crate) async fn run_local_session(
    mut socket: WebSocket,
    root: PathBuf,
    cols: u16,
    rows: u16,
    registry: Arc<TerminalRegistry>,
) {
    let (session_id, close) = registry.register("local", cols, rows).await;

    let pty_system = native_pty_system();
    let pair = match pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }) {
        Ok(pair) => pair,
        Err(error) => {
            warn!(%error, "failed to open pty");
            let _ = socket.send(close_message("failed to open terminal")).await;
            registry.remove(&session_id).await;
            return;
        }
    };

    let mut command = CommandBuilder::new(default_shell());
    command.cwd(&root);
    command.env("TERM", "xterm-256color");

    let mut child = match pair.slave.spawn_command(command) {
        Ok(child) => child,
        Err(error) => {
            warn!(%error, "failed to spawn shell");
            let _ = socket.send(close_message("failed to start shell")).await;
            registry.remove(&session_id).await;
            return;
        }
    };
    drop(pair.slave);

    let master = pair.master;
    let mut writer = match master.take_writer() {
        Ok(writer) => writer,
        Err(error) => {
            warn!(%error, "failed to take pty writer");
            let _ = socket.send(close_message("terminal unavailable")).await;
            registry.remove(&session_id).await;
            return;
        }
    };

    let (output_tx, mut output_rx) = mpsc::channel::<Vec<u8>>(PTY_OUTPUT_QUEUE);
    match master.try_clone_reader() {
        Ok(mut reader) => {
            std::thread::spawn(move || {
                let mut buffer = [0u8; 4096];
                loop {
                    match reader.read(&mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(read) => {
                            if output_tx.blocking_send(buffer[..read].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        Err(error) => {
            warn!(%error, "failed to clone pty reader");
            let _ = socket.send(close_message("terminal unavailable")).await;
            registry.remove(&session_id).await;
            return;
        }
    }

    let mut idle = Box::pin(tokio::time::sleep(IDLE_TIMEOUT));
    let mut close_reason = "terminal closed";

    loop {
        tokio::select! {
            maybe_output = output_rx.recv() => {
                match maybe_output {
                    Some(bytes) => {
                        if socket.send(ClientMessage::Binary(bytes.into())).await.is_err() {
                            close_reason = "client disconnected";
                            break;
                        }
                    }
                    None => {
                        close_reason = "shell exited";
                        break;
                    }
                }
            }
            maybe_message = socket.recv() => {
                idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                registry.touch(&session_id).await;

                let Some(Ok(message)) = maybe_message else {
                    close_reason = "client disconnected";
                    break;
                };

                match message {
                    ClientMessage::Binary(bytes) => {
                        if write_input(&mut writer, &bytes).is_err() {
                            close_reason = "shell exited";
                            break;
                        }
                    }
                    ClientMessage::Text(text) => {
                        match parse_control(&text) {
                            Some(frame) if frame.kind == "resize" => {
                                let cols = frame.cols.unwrap_or(DEFAULT_COLS);
                                let rows = frame.rows.unwrap_or(DEFAULT_ROWS);
                                if let Err(error) = master.resize(PtySize {
                                    rows,
                                    cols,
                                    pixel_width: 0,
                                    pixel_height: 0,
                                }) {
                                    warn!(%error, "pty resize failed");
                                }
                                registry.update_geometry(&session_id, cols, rows).await;
                            }
                            Some(frame) if frame.kind == "ping" => {
                                let _ = socket
                                    .send(ClientMessage::Text(
                                        "{\"type\":\"pong\"}".to_string().into(),
                                    ))
                                    .await;
                            }
                            _ => {
                                if write_input(&mut writer, text.as_bytes()).is_err() {
                                    close_reason = "shell exited";
                                    break;
                                }
                            }
                        }
                    }
                    ClientMessage::Close(_) => {
                        close_reason = "client disconnected";
                        break;
                    }
                    ClientMessage::Ping(_) | ClientMessage::Pong(_) => {}
                }
            }
            _ = &mut idle => {
                close_reason = "idle timeout";
                break;
            }
            _ = close.notified() => {
                close_reason = "closed by request";
                break;
            }
        }
    }

    let _ = socket.send(close_message(close_reason)).await;
    registry.remove(&session_id).await;

    // Reap off the async runtime; dropping the master hangs up the shell.
    drop(writer);
    drop(master);
    tokio::task::spawn_blocking(move || {
        let _ = child.kill();
        let _ = child.wait();
    });

    debug!(%session_id, close_reason, "local terminal session ended");
}

fn write_input(writer: &mut Box<dyn Write + Send>, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes)?;
    writer.flush()
}

/// Remote proxy leg: bridge the browser socket and the sandbox's `/terminal`
/// socket byte-for-byte. Resize and ping control frames pass through to the
/// remote; pong replies from the remote are filtered out. Any close on
/// either leg closes the other with a short reason.
pub(crate) async fn run_remote_session(
    mut socket: WebSocket,
    remote_ws_url: String,
    cols: u16,
    rows: u16,
    registry: Arc<TerminalRegistry>,
) {
    let (session_id, close) = registry.register("remote", cols, rows).await;

    let connect = tokio::time::timeout(
        REMOTE_CONNECT_TIMEOUT,
        connect_async(remote_ws_url.as_str()),
    );
    let (remote_stream, _response) = match connect.await {
        Ok(Ok(connection)) => connection,
        Ok(Err(error)) => {
            warn!(%error, "remote terminal connection failed");
            let _ = socket.send(close_message("remote connection failed")).await;
            registry.remove(&session_id).await;
            return;
        }
        Err(_) => {
            let _ = socket.send(close_message("remote connection timed out")).await;
            registry.remove(&session_id).await;
            return;
        }
    };

    let (mut remote_tx, mut remote_rx) = remote_stream.split();
    let mut keepalive = tokio::time::interval(REMOTE_KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;

    let mut idle = Box::pin(tokio::time::sleep(IDLE_TIMEOUT));
    let mut close_reason = "terminal closed";

    loop {
        tokio::select! {
            maybe_client = socket.recv() => {
                idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);
                registry.touch(&session_id).await;

                let Some(Ok(message)) = maybe_client else {
                    close_reason = "client disconnected";
                    break;
                };

                match message {
                    ClientMessage::Text(text) => {
                        if let Some(frame) = parse_control(&text) {
                            if frame.kind == "resize" {
                                registry
                                    .update_geometry(
                                        &session_id,
                                        frame.cols.unwrap_or(cols),
                                        frame.rows.unwrap_or(rows),
                                    )
                                    .await;
                            }
                        }
                        if remote_tx
                            .send(RemoteMessage::Text(text.to_string().into()))
                            .await
                            .is_err()
                        {
                            close_reason = "connection lost";
                            break;
                        }
                    }
                    ClientMessage::Binary(bytes) => {
                        if remote_tx
                            .send(RemoteMessage::Binary(bytes.to_vec().into()))
                            .await
                            .is_err()
                        {
                            close_reason = "connection lost";
                            break;
                        }
                    }
                    ClientMessage::Close(_) => {
                        close_reason = "client disconnected";
                        break;
                    }
                    ClientMessage::Ping(_) | ClientMessage::Pong(_) => {}
                }
            }
            maybe_remote = remote_rx.next() => {
                let Some(Ok(message)) = maybe_remote else {
                    close_reason = "connection lost";
                    break;
                };

                match message {
                    RemoteMessage::Text(text) => {
                        if is_pong_frame(text.as_str()) {
                            continue;
                        }
                        if socket
                            .send(ClientMessage::Text(text.to_string().into()))
                            .await
                            .is_err()
                        {
                            close_reason = "client disconnected";
                            break;
                        }
                    }
                    RemoteMessage::Binary(bytes) => {
                        if socket
                            .send(ClientMessage::Binary(bytes.to_vec().into()))
                            .await
                            .is_err()
                        {
                            close_reason = "client disconnected";
                            break;
                        }
                    }
                    RemoteMessage::Close(_) => {
                        close_reason = "connection lost";
                        break;
                    }
                    RemoteMessage::Ping(_) | RemoteMessage::Pong(_) | RemoteMessage::Frame(_) => {}
                }
            }
            _ = keepalive.tick() => {
                if remote_tx
                    .send(RemoteMessage::Text("{\"type\":\"ping\"}".to_string().into()))
                    .await
                    .is_err()
                {
                    close_reason = "connection lost";
                    break;
                }
            }
            _ = &mut idle => {
                close_reason = "idle timeout";
                break;
            }
            _ = close.notified() => {
                close_reason = "closed by request";
                break;
            }
        }
    }

    let _ = socket.send(close_message(close_reason)).await;
    let _ = remote_tx.send(RemoteMessage::Close(None)).await;
    registry.remove(&session_id).await;
    debug!(%session_id, close_reason, "remote terminal session ended");
}

/// Turn an HTTP(S) sandbox base URL into its terminal WebSocket URL.
pub(crate) fn remote_terminal_url(base_url: &str) -> String {
    let trimmed = base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        trimmed.to_string()
    };
    format!("{ws_base}/terminal")
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
