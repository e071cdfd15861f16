//! Backend bridge - child process lifecycle, projection synchronization,
//! and feature proxying.
//!
//! The bridge owns one markup-analysis child process and its RPC session.
//! Its job is to keep that process's view of the projected documents in
//! step with the document store, and to forward hover/completion/formatting
//! requests against the projected text.
//!
//! Degradation is silent everywhere: when the backend is disabled, missing,
//! crashed, or slow, sync calls are no-ops and feature calls return `None`.
//! Nothing in this module propagates an error to the editor-facing layer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

use super::locator::locate_executable;
use super::session::RpcSession;

/// Language tag the backend sees for every projected document.
pub const PROJECTION_LANGUAGE_ID: &str = "html";

/// Suffix appended to a primary URI to form its virtual identity.
pub const VIRTUAL_SUFFIX: &str = "__virtual.html";

/// Deadline for the handshake request.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Derive the virtual document identity for a primary URI.
///
/// Deterministic, so the backend sees one stable identity per primary
/// document across any number of checksum changes.
pub fn virtual_uri(primary_uri: &str) -> String {
    format!("{}{}", primary_uri, VIRTUAL_SUFFIX)
}

/// Lifecycle state of the bridge.
///
/// `Stopped`, `Disabled`, and `Unavailable` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unstarted,
    Starting,
    Running,
    Initialized,
    Stopped,
    Disabled,
    Unavailable,
}

impl BackendState {
    fn is_final(self) -> bool {
        matches!(
            self,
            BackendState::Stopped | BackendState::Disabled | BackendState::Unavailable
        )
    }
}

/// Configuration for launching the backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// When false, `start()` goes straight to `Disabled`.
    pub enabled: bool,
    /// Executable name to search for.
    pub executable: String,
    /// Arguments passed to the child.
    pub args: Vec<String>,
    /// Well-known install directories, checked before the PATH fallback.
    pub install_dirs: Vec<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            executable: "html-languageserver".to_string(),
            args: vec!["--stdio".to_string()],
            install_dirs: Vec::new(),
        }
    }
}

/// One synchronized projection, keyed in the ledger by checksum.
///
/// `backend_version` is bridge-local and gapless per primary URI; it is not
/// the editor's document version. `opened` records whether a didOpen for the
/// virtual identity has been sent yet.
#[derive(Debug, Clone)]
struct ProjectionRecord {
    primary_uri: String,
    content: String,
    backend_version: i64,
    opened: bool,
}

/// Bridge to one markup-analysis child process.
pub struct MarkupBackend {
    config: BackendConfig,
    state: Mutex<BackendState>,
    session: Mutex<Option<Arc<RpcSession>>>,
    /// Serializes start/initialize/stop against each other.
    lifecycle: tokio::sync::Mutex<()>,
    /// Signals the process monitor to kill the child.
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Checksum-keyed synchronization ledger.
    ledger: Mutex<HashMap<String, ProjectionRecord>>,
    /// One lock per primary URI; held across ledger mutation and the
    /// matching notification so per-URI sends never reorder.
    sync_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MarkupBackend {
    /// Create an unstarted bridge.
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BackendState::Unstarted),
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            kill_tx: Mutex::new(None),
            ledger: Mutex::new(HashMap::new()),
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BackendState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, state: BackendState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// Session handle, if one exists and is still live.
    fn live_session(&self) -> Option<Arc<RpcSession>> {
        let guard = self.session.lock().expect("session lock poisoned");
        match guard.as_ref() {
            Some(session) if !session.is_broken() => Some(session.clone()),
            _ => None,
        }
    }

    /// Locate and spawn the backend process.
    ///
    /// `Unstarted → Starting → Running`, or to the final `Disabled` /
    /// `Unavailable` states. Calling in any other state is a no-op.
    pub async fn start(&self) -> BackendState {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() != BackendState::Unstarted {
            return self.state();
        }

        if !self.config.enabled {
            tracing::debug!("markup backend disabled by configuration");
            self.set_state(BackendState::Disabled);
            return BackendState::Disabled;
        }

        self.set_state(BackendState::Starting);

        let path_var = std::env::var_os("PATH");
        let executable = match locate_executable(
            &self.config.executable,
            &self.config.install_dirs,
            path_var.as_ref(),
        ) {
            Some(path) => path,
            None => {
                tracing::warn!(
                    executable = %self.config.executable,
                    "markup backend executable not found; markup features disabled"
                );
                self.set_state(BackendState::Unavailable);
                return BackendState::Unavailable;
            }
        };

        tracing::debug!(path = %executable.display(), "launching markup backend");
        let mut command = Command::new(&executable);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Lead a fresh process group, so stop() can signal descendants too.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(path = %executable.display(), "failed to spawn markup backend: {}", e);
                self.set_state(BackendState::Unavailable);
                return BackendState::Unavailable;
            }
        };

        // Stdio handles are piped above, so take() cannot fail here.
        let stdin = child.stdin.take().expect("child stdin piped");
        let stdout = child.stdout.take().expect("child stdout piped");
        let stderr = child.stderr.take().expect("child stderr piped");

        // Drain stderr so the child never blocks on a full pipe.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "markup_backend_stderr", "{}", line);
            }
        });

        let session = Arc::new(RpcSession::new(stdout, stdin));

        // Process monitor: reaps the child on exit, kills it on stop().
        // kill_on_drop covers the whole process tree if the monitor dies.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => {
                        tracing::warn!(%status, "markup backend exited; features degrade")
                    }
                    Err(e) => tracing::warn!("markup backend wait failed: {}", e),
                },
                _ = kill_rx => {
                    terminate_tree(&mut child);
                    let _ = child.wait().await;
                    tracing::debug!("markup backend terminated on stop");
                }
            }
        });

        *self.session.lock().expect("session lock poisoned") = Some(session);
        *self.kill_tx.lock().expect("kill lock poisoned") = Some(kill_tx);
        self.set_state(BackendState::Running);
        BackendState::Running
    }

    /// Perform the backend handshake.
    ///
    /// Only valid from `Running`; a no-op in every other state. On success
    /// the state becomes `Initialized` and projections recorded while the
    /// handshake was pending are replayed as didOpen notifications. A
    /// failed handshake lands in the final `Unavailable` state.
    pub async fn initialize(&self, root_uri: &str) -> BackendState {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state() != BackendState::Running {
            return self.state();
        }
        let Some(session) = self.live_session() else {
            self.set_state(BackendState::Unavailable);
            return BackendState::Unavailable;
        };

        let params = json!({
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": {
                "textDocument": {
                    "synchronization": { "dynamicRegistration": false },
                    "hover": {},
                    "completion": { "completionItem": { "snippetSupport": false } },
                    "formatting": {},
                    "rangeFormatting": {},
                }
            },
        });

        match session.request("initialize", params, HANDSHAKE_DEADLINE).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => {
                tracing::warn!("markup backend handshake failed; features disabled");
                session.shutdown();
                self.signal_kill();
                self.set_state(BackendState::Unavailable);
                return BackendState::Unavailable;
            }
        }

        if let Err(e) = session.notify("initialized", json!({})).await {
            tracing::warn!("markup backend handshake-complete failed: {}", e);
            session.shutdown();
            self.signal_kill();
            self.set_state(BackendState::Unavailable);
            return BackendState::Unavailable;
        }

        self.set_state(BackendState::Initialized);
        self.replay_unopened(&session).await;
        BackendState::Initialized
    }

    /// Send didOpen for every ledger record that predates the handshake.
    async fn replay_unopened(&self, session: &Arc<RpcSession>) {
        let unopened: Vec<(String, String)> = {
            let ledger = self.ledger.lock().expect("ledger lock poisoned");
            ledger
                .iter()
                .filter(|(_, record)| !record.opened)
                .map(|(checksum, record)| (checksum.clone(), record.primary_uri.clone()))
                .collect()
        };

        for (checksum, primary_uri) in unopened {
            let uri_lock = self.uri_lock(&primary_uri);
            let _guard = uri_lock.lock().await;

            // Re-read under the lock: a concurrent sync may have sent the
            // didOpen itself, or replaced the record, while we waited.
            let record = {
                let ledger = self.ledger.lock().expect("ledger lock poisoned");
                ledger.get(&checksum).cloned()
            };
            let Some(record) = record else { continue };
            if record.opened {
                continue;
            }

            if self.send_open(session, &record).await {
                if let Some(record) = self
                    .ledger
                    .lock()
                    .expect("ledger lock poisoned")
                    .get_mut(&checksum)
                {
                    record.opened = true;
                }
            }
        }
    }

    /// Tear down the session and terminate the child.
    ///
    /// Valid from any non-final state; idempotent.
    pub async fn stop(&self) -> BackendState {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state().is_final() {
            return self.state();
        }

        if let Some(session) = self.session.lock().expect("session lock poisoned").take() {
            session.shutdown();
        }
        self.signal_kill();

        self.set_state(BackendState::Stopped);
        BackendState::Stopped
    }

    /// Ask the process monitor to terminate the child. Idempotent.
    fn signal_kill(&self) {
        if let Some(kill_tx) = self.kill_tx.lock().expect("kill lock poisoned").take() {
            let _ = kill_tx.send(());
        }
    }

    /// Synchronize one projection into the backend.
    ///
    /// In `Initialized` the ledger is updated and a didOpen/didChange goes
    /// out; in `Running` the ledger is updated silently (replayed by
    /// `initialize`); in every other state this is a no-op. Calls for the
    /// same primary URI are serialized, so the backend's notification
    /// stream per virtual identity never reorders.
    pub async fn sync_projection(&self, primary_uri: &str, checksum: &str, content: &str) {
        let state = self.state();
        if !matches!(state, BackendState::Running | BackendState::Initialized) {
            return;
        }

        let uri_lock = self.uri_lock(primary_uri);
        let _guard = uri_lock.lock().await;

        let record = {
            let mut ledger = self.ledger.lock().expect("ledger lock poisoned");

            let previous = ledger
                .iter()
                .find(|(_, record)| record.primary_uri == primary_uri)
                .map(|(existing_checksum, record)| (existing_checksum.clone(), record.clone()));

            let record = match previous {
                Some((existing_checksum, previous)) => {
                    if existing_checksum == checksum {
                        // Upstream already gates on checksum; nothing to do.
                        return;
                    }
                    ledger.remove(&existing_checksum);
                    ProjectionRecord {
                        primary_uri: primary_uri.to_string(),
                        content: content.to_string(),
                        backend_version: previous.backend_version + 1,
                        opened: previous.opened,
                    }
                }
                None => ProjectionRecord {
                    primary_uri: primary_uri.to_string(),
                    content: content.to_string(),
                    backend_version: 1,
                    opened: false,
                },
            };
            ledger.insert(checksum.to_string(), record.clone());
            record
        };

        if self.state() != BackendState::Initialized {
            // Recorded for the post-handshake replay; nothing sent yet.
            return;
        }
        let Some(session) = self.live_session() else {
            return;
        };

        let sent = if record.opened {
            self.send_change(&session, &record).await
        } else {
            self.send_open(&session, &record).await
        };
        if sent && !record.opened {
            if let Some(record) = self
                .ledger
                .lock()
                .expect("ledger lock poisoned")
                .get_mut(checksum)
            {
                record.opened = true;
            }
        }
    }

    async fn send_open(&self, session: &Arc<RpcSession>, record: &ProjectionRecord) -> bool {
        let params = json!({
            "textDocument": {
                "uri": virtual_uri(&record.primary_uri),
                "languageId": PROJECTION_LANGUAGE_ID,
                "version": record.backend_version,
                "text": record.content,
            }
        });
        match session.notify("textDocument/didOpen", params).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(uri = %record.primary_uri, "projection open not delivered: {}", e);
                false
            }
        }
    }

    async fn send_change(&self, session: &Arc<RpcSession>, record: &ProjectionRecord) -> bool {
        // Whole-document replace; the backend never sees incremental ranges.
        let params = json!({
            "textDocument": {
                "uri": virtual_uri(&record.primary_uri),
                "version": record.backend_version,
            },
            "contentChanges": [ { "text": record.content } ],
        });
        match session.notify("textDocument/didChange", params).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(uri = %record.primary_uri, "projection change not delivered: {}", e);
                false
            }
        }
    }

    /// Tell the backend a projection's virtual document is gone.
    ///
    /// Removes the ledger entry for the primary URI; silent outside
    /// `Initialized` like every other operation here.
    pub async fn close_projection(&self, primary_uri: &str) {
        let uri_lock = self.uri_lock(primary_uri);
        let _guard = uri_lock.lock().await;

        let removed = {
            let mut ledger = self.ledger.lock().expect("ledger lock poisoned");
            let checksum = ledger
                .iter()
                .find(|(_, record)| record.primary_uri == primary_uri)
                .map(|(checksum, _)| checksum.clone());
            checksum.and_then(|checksum| ledger.remove(&checksum))
        };

        // The ledger no longer references this URI; its per-URI lock goes
        // with it (the map would otherwise grow for the bridge's lifetime).
        self.sync_locks
            .lock()
            .expect("sync locks poisoned")
            .remove(primary_uri);

        let Some(record) = removed else { return };
        if self.state() != BackendState::Initialized || !record.opened {
            return;
        }
        let Some(session) = self.live_session() else {
            return;
        };

        let params = json!({
            "textDocument": { "uri": virtual_uri(primary_uri) }
        });
        if let Err(e) = session.notify("textDocument/didClose", params).await {
            tracing::debug!(uri = %primary_uri, "projection close not delivered: {}", e);
        }
    }

    /// Forward a feature request against the virtual identity.
    ///
    /// `params` are primary-document-relative; the only translation applied
    /// is swapping in the virtual URI. The backend's structured result is
    /// passed through unmodified. Every failure path returns `None`.
    pub async fn forward(
        &self,
        method: &str,
        checksum: &str,
        mut params: Value,
        deadline: Duration,
    ) -> Option<Value> {
        if self.state() != BackendState::Initialized {
            return None;
        }

        let primary_uri = {
            let ledger = self.ledger.lock().expect("ledger lock poisoned");
            ledger.get(checksum)?.primary_uri.clone()
        };
        let session = self.live_session()?;

        // Params must be an object to carry a textDocument field; array
        // params are legal JSON-RPC but cannot name a document.
        let Some(object) = params.as_object_mut() else {
            tracing::debug!(method, "request params are not an object; no result");
            return None;
        };
        let text_document = object.entry("textDocument").or_insert_with(|| json!({}));
        let Some(text_document) = text_document.as_object_mut() else {
            tracing::debug!(method, "textDocument field is not an object; no result");
            return None;
        };
        text_document.insert("uri".to_string(), Value::String(virtual_uri(&primary_uri)));

        match session.request(method, params, deadline).await {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(method, "proxied call degraded to no result: {}", e);
                None
            }
        }
    }

    /// Hover over a position in the projected document.
    pub async fn hover(
        &self,
        checksum: &str,
        line: u32,
        character: u32,
        deadline: Duration,
    ) -> Option<Value> {
        let params = json!({
            "textDocument": {},
            "position": { "line": line, "character": character },
        });
        self.forward("textDocument/hover", checksum, params, deadline).await
    }

    /// Completion at a position in the projected document.
    pub async fn completion(
        &self,
        checksum: &str,
        line: u32,
        character: u32,
        deadline: Duration,
    ) -> Option<Value> {
        let params = json!({
            "textDocument": {},
            "position": { "line": line, "character": character },
        });
        self.forward("textDocument/completion", checksum, params, deadline).await
    }

    /// Format the whole projected document.
    pub async fn format(&self, checksum: &str, options: Value, deadline: Duration) -> Option<Value> {
        let params = json!({
            "textDocument": {},
            "options": options,
        });
        self.forward("textDocument/formatting", checksum, params, deadline).await
    }

    /// Format a range of the projected document.
    pub async fn format_range(
        &self,
        checksum: &str,
        range: Value,
        options: Value,
        deadline: Duration,
    ) -> Option<Value> {
        let params = json!({
            "textDocument": {},
            "range": range,
            "options": options,
        });
        self.forward("textDocument/rangeFormatting", checksum, params, deadline)
            .await
    }

    fn uri_lock(&self, primary_uri: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.sync_locks
            .lock()
            .expect("sync locks poisoned")
            .entry(primary_uri.to_string())
            .or_default()
            .clone()
    }

    /// Install a session directly, bypassing process spawn. Test-only.
    #[cfg(test)]
    fn attach_session(&self, session: Arc<RpcSession>, state: BackendState) {
        *self.session.lock().unwrap() = Some(session);
        self.set_state(state);
    }

    /// Wire up a kill-signal receiver without spawning. Test-only.
    #[cfg(test)]
    fn install_kill_signal(&self) -> oneshot::Receiver<()> {
        let (kill_tx, kill_rx) = oneshot::channel();
        *self.kill_tx.lock().unwrap() = Some(kill_tx);
        kill_rx
    }
}

/// Kill the child and any processes it spawned.
///
/// The child leads its own process group (see spawn), so on Unix the signal
/// goes to the negated group id and reaches grandchildren too.
#[cfg(unix)]
fn terminate_tree(child: &mut tokio::process::Child) {
    match child.id() {
        Some(pid) => {
            unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(windows)]
fn terminate_tree(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
    }
    let _ = child.start_kill();
}

#[cfg(not(any(unix, windows)))]
fn terminate_tree(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}
