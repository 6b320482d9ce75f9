//! Session supervisor - spawns agent CLIs and tracks them until they exit.
//!
//! Every session owns three tasks: a stdout reader feeding the
//! [`StreamTransformer`], a stderr reader, and an exit monitor that owns the
//! child process. Events from all sessions are published on one broadcast
//! channel as [`SessionEnvelope`]s.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use agent_runtime_error::{ErrorDetails, RuntimeError};
use agent_runtime_schema::{AgentKind, NormalizedEvent};

use crate::config::RuntimeConfig;
use crate::invocation::{encode_user_turn, hook_settings, Invocation};
use crate::stream::{StreamItem, StreamTransformer};

/// Upper bound on waiting for the output readers once the process is gone.
/// Grandchildren that inherited the pipes can keep them open.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A session is registered only once its process has started, so the
/// registry never holds one that is still spawning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
    Errored,
}

/// Read-only snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub agent: AgentKind,
    pub working_directory: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Vendor session id reported by the agent; the resume token for the
    /// next turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc_dir: Option<String>,
}

impl SessionInfo {
    pub fn is_alive(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub agent: AgentKind,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A vendor record and the events normalized from it.
    Agent {
        raw: Value,
        events: Vec<NormalizedEvent>,
    },
    Unparsed {
        line: String,
        error: String,
    },
    Stderr {
        line: String,
    },
    SpawnFailed {
        error: ErrorDetails,
    },
    Exited {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnvelope {
    pub session_id: String,
    /// Per-session, starting at 0.
    pub sequence: u64,
    pub time: String,
    pub event: SessionEvent,
}

struct ManagedSession {
    info: SessionInfo,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl std::fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSession")
            .field("info", &self.info)
            .field("has_stdin", &self.stdin.is_some())
            .finish()
    }
}

type SessionMap = HashMap<String, Arc<Mutex<ManagedSession>>>;

#[derive(Clone)]
struct Publisher {
    session_id: String,
    next_sequence: Arc<StdMutex<u64>>,
    tx: broadcast::Sender<SessionEnvelope>,
}

impl Publisher {
    fn new(session_id: &str, tx: broadcast::Sender<SessionEnvelope>) -> Self {
        Self {
            session_id: session_id.to_string(),
            next_sequence: Arc::new(StdMutex::new(0)),
            tx,
        }
    }

    /// Sequence assignment and send happen under one lock so subscribers
    /// see each session's events in sequence order.
    fn publish(&self, event: SessionEvent) {
        let mut next = self
            .next_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let envelope = SessionEnvelope {
            session_id: self.session_id.clone(),
            sequence: *next,
            time: format_timestamp(),
            event,
        };
        *next += 1;
        // No subscribers is fine.
        let _ = self.tx.send(envelope);
    }
}

/// Owns every running agent session.
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    sessions: Arc<RwLock<SessionMap>>,
    events: broadcast::Sender<SessionEnvelope>,
    config: Arc<RuntimeConfig>,
}

impl SessionSupervisor {
    pub fn new(config: RuntimeConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Receives events for all sessions.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEnvelope> {
        self.events.subscribe()
    }

    /// Events for one session, in order. Subscribe before spawning to observe
    /// the first events.
    pub fn session_events(
        &self,
        session_id: &str,
    ) -> impl Stream<Item = SessionEnvelope> + Send + 'static {
        let session_id = session_id.to_string();
        BroadcastStream::new(self.events.subscribe()).filter_map(move |item| match item {
            Ok(envelope) if envelope.session_id == session_id => Some(envelope),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(session_id = %session_id, skipped, "session event subscriber lagged");
                None
            }
        })
    }

    /// Launches an agent. A launch failure is published as
    /// [`SessionEvent::SpawnFailed`] and returned; the session is never
    /// registered.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<SessionInfo, RuntimeError> {
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let publisher = Publisher::new(&session_id, self.events.clone());

        // Held until the session is registered so an id cannot be claimed twice.
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session_id) {
            return Err(RuntimeError::SessionAlreadyExists { session_id });
        }

        let ipc_dir = match (&self.config.permission_hook, request.agent) {
            (Some(hook), AgentKind::Claude) => Some(hook.ipc_dir(&session_id)),
            _ => None,
        };
        let settings = match (&self.config.permission_hook, &ipc_dir) {
            (Some(hook), Some(dir)) => Some(hook_settings(&hook.mediator_path, dir)),
            _ => None,
        };
        let invocation = Invocation::build(
            request.agent,
            &self.config,
            request.resume_token.as_deref(),
            settings.as_ref(),
        );

        let mut child = match invocation
            .command(&request.working_directory, &self.config)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                let error = RuntimeError::SpawnFailed {
                    agent: request.agent.to_string(),
                    message: format!("{}: {err}", invocation.program),
                };
                tracing::warn!(session_id = %session_id, agent = %request.agent, error = %error, "spawn failed");
                publisher.publish(SessionEvent::SpawnFailed {
                    error: error.to_details(),
                });
                return Err(error);
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();

        let info = SessionInfo {
            id: session_id.clone(),
            agent: request.agent,
            working_directory: request.working_directory.to_string_lossy().to_string(),
            status: SessionStatus::Running,
            pid,
            started_at: format_timestamp(),
            resume_token: request.resume_token.clone(),
            native_session_id: None,
            ipc_dir: ipc_dir.map(|dir| dir.to_string_lossy().to_string()),
        };
        let managed = Arc::new(Mutex::new(ManagedSession {
            info: info.clone(),
            stdin,
            kill_tx: Some(kill_tx),
        }));
        sessions.insert(session_id.clone(), managed.clone());
        drop(sessions);

        tracing::info!(session_id = %session_id, agent = %request.agent, pid = ?pid, "session started");

        let stdout_task = stdout.map(|stdout| {
            tokio::spawn(read_stdout(
                stdout,
                request.agent,
                publisher.clone(),
                managed.clone(),
            ))
        });
        let stderr_task = stderr.map(|stderr| tokio::spawn(read_stderr(stderr, publisher.clone())));

        tokio::spawn(monitor_exit(
            child,
            kill_rx,
            self.config.kill_grace,
            [stdout_task, stderr_task],
            publisher,
            managed,
            self.sessions.clone(),
        ));

        Ok(info)
    }

    /// Writes one user turn and closes the session's input.
    pub async fn send(&self, session_id: &str, message: &str) -> Result<(), RuntimeError> {
        let (mut stdin, agent) = {
            let sessions = self.sessions.read().await;
            let managed = sessions
                .get(session_id)
                .ok_or_else(|| RuntimeError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
            let mut guard = managed.lock().await;
            let stdin = guard.stdin.take().ok_or_else(|| RuntimeError::InputClosed {
                session_id: session_id.to_string(),
            })?;
            (stdin, guard.info.agent)
        };

        let payload = encode_user_turn(agent, message);
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| RuntimeError::StreamError {
                message: format!("failed to write to session {session_id}: {err}"),
            })?;
        stdin.flush().await.map_err(|err| RuntimeError::StreamError {
            message: format!("failed to flush session {session_id}: {err}"),
        })?;
        drop(stdin);
        tracing::debug!(session_id = %session_id, bytes = payload.len(), "sent user turn");
        Ok(())
    }

    /// Removes the session immediately and terminates its process: SIGTERM,
    /// then SIGKILL once the grace period elapses.
    pub async fn kill(&self, session_id: &str) -> Result<(), RuntimeError> {
        let managed = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        request_kill(&managed).await;
        tracing::info!(session_id = %session_id, "session kill requested");
        Ok(())
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos = Vec::with_capacity(sessions.len());
        for managed in sessions.values() {
            infos.push(managed.lock().await.info.clone());
        }
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        infos
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionInfo, RuntimeError> {
        let sessions = self.sessions.read().await;
        let managed = sessions
            .get(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let info = managed.lock().await.info.clone();
        Ok(info)
    }

    /// Kills every session. Safe to call repeatedly.
    pub async fn dispose(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (session_id, managed) in drained {
            request_kill(&managed).await;
            tracing::debug!(session_id = %session_id, "disposed session");
        }
    }
}

async fn request_kill(managed: &Arc<Mutex<ManagedSession>>) {
    let mut guard = managed.lock().await;
    guard.stdin = None;
    if let Some(kill_tx) = guard.kill_tx.take() {
        // The exit monitor may already be gone.
        let _ = kill_tx.send(());
    }
}

async fn read_stdout(
    mut stdout: ChildStdout,
    agent: AgentKind,
    publisher: Publisher,
    managed: Arc<Mutex<ManagedSession>>,
) {
    let mut transformer = StreamTransformer::new(agent);
    let mut buf = vec![0u8; 8192];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for item in transformer.push(&buf[..n]) {
                    deliver(item, &publisher, &managed).await;
                }
            }
            Err(err) => {
                tracing::warn!(session_id = %publisher.session_id, error = %err, "stdout read failed");
                break;
            }
        }
    }
    for item in transformer.finish() {
        deliver(item, &publisher, &managed).await;
    }
}

async fn deliver(item: StreamItem, publisher: &Publisher, managed: &Arc<Mutex<ManagedSession>>) {
    match item {
        StreamItem::Record { raw, events } => {
            let native_id = events.iter().find_map(|event| match event {
                NormalizedEvent::SessionStart(data) => data.native_session_id.clone(),
                _ => None,
            });
            if let Some(native_id) = native_id {
                managed.lock().await.info.native_session_id = Some(native_id);
            }
            publisher.publish(SessionEvent::Agent { raw, events });
        }
        StreamItem::Unparsed { line, error } => {
            tracing::debug!(session_id = %publisher.session_id, error = %error, "unparsed agent output");
            publisher.publish(SessionEvent::Unparsed { line, error });
        }
    }
}

async fn read_stderr(stderr: ChildStderr, publisher: Publisher) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => publisher.publish(SessionEvent::Stderr { line }),
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(session_id = %publisher.session_id, error = %err, "stderr read failed");
                break;
            }
        }
    }
}

async fn monitor_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    grace: Duration,
    readers: [Option<JoinHandle<()>>; 2],
    publisher: Publisher,
    managed: Arc<Mutex<ManagedSession>>,
    sessions: Arc<RwLock<SessionMap>>,
) {
    // A dropped sender (supervisor gone) also terminates the process.
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => terminate(&mut child, grace, &publisher.session_id).await,
    };

    for reader in readers.into_iter().flatten() {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            tracing::debug!(session_id = %publisher.session_id, "output reader did not finish");
        }
    }

    let (exit_code, signal) = match &status {
        Ok(status) => (status.code(), exit_signal(status)),
        Err(err) => {
            tracing::warn!(session_id = %publisher.session_id, error = %err, "failed to wait for session");
            (None, None)
        }
    };
    {
        let mut guard = managed.lock().await;
        guard.info.status = if status.is_ok() {
            SessionStatus::Exited
        } else {
            SessionStatus::Errored
        };
        guard.stdin = None;
    }
    {
        let mut sessions = sessions.write().await;
        let same_session = sessions
            .get(&publisher.session_id)
            .is_some_and(|current| Arc::ptr_eq(current, &managed));
        if same_session {
            sessions.remove(&publisher.session_id);
        }
    }

    tracing::info!(session_id = %publisher.session_id, exit_code = ?exit_code, signal = ?signal, "session exited");
    publisher.publish(SessionEvent::Exited { exit_code, signal });
}

async fn terminate(
    child: &mut Child,
    grace: Duration,
    session_id: &str,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(session_id = %session_id, grace_ms = grace.as_millis() as u64, "grace period elapsed, killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn format_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_config() -> RuntimeConfig {
        RuntimeConfig {
            login_shell: false,
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported_and_not_registered() {
        let supervisor = SessionSupervisor::new(RuntimeConfig {
            claude_program: Some("/definitely/not/a/real/agent".to_string()),
            ..direct_config()
        });
        let mut events = supervisor.subscribe();
        let result = supervisor
            .spawn(SpawnRequest {
                agent: AgentKind::Claude,
                working_directory: std::env::temp_dir(),
                resume_token: None,
                session_id: Some("broken".to_string()),
            })
            .await;

        assert!(matches!(result, Err(RuntimeError::SpawnFailed { .. })));
        assert!(supervisor.list().await.is_empty());
        let envelope = events.recv().await.unwrap();
        assert_eq!(envelope.session_id, "broken");
        assert_eq!(envelope.sequence, 0);
        assert!(matches!(envelope.event, SessionEvent::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let supervisor = SessionSupervisor::new(direct_config());
        assert!(matches!(
            supervisor.send("nope", "hi").await,
            Err(RuntimeError::SessionNotFound { .. })
        ));
        assert!(matches!(
            supervisor.kill("nope").await,
            Err(RuntimeError::SessionNotFound { .. })
        ));
        assert!(matches!(
            supervisor.get("nope").await,
            Err(RuntimeError::SessionNotFound { .. })
        ));
        supervisor.dispose().await;
        supervisor.dispose().await;
    }

    #[test]
    fn test_envelope_serialization() {
        let envelope = SessionEnvelope {
            session_id: "s".to_string(),
            sequence: 3,
            time: "2024-01-01T00:00:00Z".to_string(),
            event: SessionEvent::Exited {
                exit_code: Some(0),
                signal: None,
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["sessionId"], "s");
        assert_eq!(value["event"]["type"], "exited");
        assert_eq!(value["event"]["exit_code"], 0);
        assert!(value["event"].get("signal").is_none());
    }
}
