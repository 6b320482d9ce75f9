//! UI side of the permission IPC directory.
//!
//! While an [`ApprovalBridge`] is running the mediator sees a fresh heartbeat
//! and escalates undecided tool calls; each new request is published to
//! subscribers, who answer with [`ApprovalBridge::respond`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use agent_runtime_error::RuntimeError;
use agent_runtime_permission_mediator::{
    ApprovalChannel, ApprovalResponse, MediatorError, PendingApproval,
};

const MIN_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct ApprovalBridge {
    channel: ApprovalChannel,
    requests: broadcast::Sender<PendingApproval>,
    tasks: Vec<JoinHandle<()>>,
}

impl ApprovalBridge {
    /// Starts the heartbeat and request watcher tasks for `ipc_dir`.
    pub fn start(ipc_dir: PathBuf, heartbeat_interval: Duration, poll_interval: Duration) -> Self {
        let channel = ApprovalChannel::new(ipc_dir);
        let (requests, _) = broadcast::channel(64);
        let tasks = vec![
            tokio::spawn(heartbeat_loop(
                channel.clone(),
                heartbeat_interval.max(MIN_INTERVAL),
            )),
            tokio::spawn(watch_loop(
                channel.clone(),
                requests.clone(),
                poll_interval.max(MIN_INTERVAL),
            )),
        ];
        tracing::info!(ipc_dir = %channel.dir().display(), "approval bridge started");
        Self {
            channel,
            requests,
            tasks,
        }
    }

    pub fn ipc_dir(&self) -> &Path {
        self.channel.dir()
    }

    /// Receives requests as they appear. Requests already pending when a
    /// subscriber joins are available from [`ApprovalBridge::pending`].
    pub fn subscribe(&self) -> broadcast::Receiver<PendingApproval> {
        self.requests.subscribe()
    }

    pub async fn pending(&self) -> Result<Vec<PendingApproval>, RuntimeError> {
        let channel = self.channel.clone();
        run_blocking(move || channel.pending_requests()).await
    }

    pub async fn respond(
        &self,
        request_id: &str,
        response: ApprovalResponse,
    ) -> Result<(), RuntimeError> {
        let channel = self.channel.clone();
        let request_id = request_id.to_string();
        run_blocking(move || channel.respond(&request_id, &response)).await
    }

    pub async fn cancel(&self, request_id: &str) -> Result<(), RuntimeError> {
        let channel = self.channel.clone();
        let request_id = request_id.to_string();
        run_blocking(move || channel.cancel(&request_id)).await
    }

    /// Stops the background tasks. The heartbeat goes stale afterwards and
    /// the mediator stops escalating.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ApprovalBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn heartbeat_loop(channel: ApprovalChannel, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let channel = channel.clone();
        if let Err(err) = run_blocking(move || channel.touch_heartbeat()).await {
            tracing::warn!(error = %err, "failed to touch heartbeat");
        }
    }
}

async fn watch_loop(
    channel: ApprovalChannel,
    requests: broadcast::Sender<PendingApproval>,
    interval: Duration,
) {
    let mut seen: HashSet<String> = HashSet::new();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let scan = channel.clone();
        let pending = match run_blocking(move || scan.pending_requests()).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::debug!(error = %err, "failed to scan approval requests");
                continue;
            }
        };

        seen.retain(|id| pending.iter().any(|request| &request.request_id == id));
        for request in pending {
            if seen.insert(request.request_id.clone()) {
                tracing::info!(
                    request_id = %request.request_id,
                    tool = %request.tool_name,
                    "approval requested"
                );
                let _ = requests.send(request);
            }
        }
    }
}

async fn run_blocking<T, F>(operation: F) -> Result<T, RuntimeError>
where
    F: FnOnce() -> Result<T, MediatorError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(operation).await {
        Ok(result) => result.map_err(mediator_error),
        Err(err) => Err(RuntimeError::StreamError {
            message: format!("approval task failed: {err}"),
        }),
    }
}

fn mediator_error(err: MediatorError) -> RuntimeError {
    match err {
        MediatorError::RequestNotFound { .. } | MediatorError::Malformed { .. } => {
            RuntimeError::InvalidRequest {
                message: err.to_string(),
            }
        }
        other => RuntimeError::Io {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runtime_permission_mediator::{ApprovalDecision, LivenessMonitor};
    use serde_json::json;

    #[tokio::test]
    async fn test_bridge_keeps_heartbeat_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let ipc_dir = dir.path().join("session-1");
        let mut bridge =
            ApprovalBridge::start(ipc_dir.clone(), Duration::from_millis(20), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let monitor = LivenessMonitor::new(&ipc_dir, Duration::from_secs(1));
        assert!(monitor.is_alive());
        bridge.stop();
    }

    #[tokio::test]
    async fn test_bridge_publishes_new_requests_once() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ApprovalBridge::start(
            dir.path().to_path_buf(),
            Duration::from_millis(50),
            Duration::from_millis(20),
        );
        let mut requests = bridge.subscribe();

        let channel = ApprovalChannel::new(dir.path());
        channel
            .submit(&PendingApproval {
                request_id: "req-1".to_string(),
                tool_name: "Write".to_string(),
                tool_input: json!({"file_path": "notes.md"}),
                created_at: "2024-01-01T00:00:00Z".to_string(),
                session_id: None,
                cwd: None,
                raw_request_payload: json!({}),
            })
            .unwrap();

        let request = tokio::time::timeout(Duration::from_secs(2), requests.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.request_id, "req-1");

        // Still pending on the next scans, but not published again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(requests.try_recv().is_err());

        bridge
            .respond("req-1", ApprovalResponse::allow())
            .await
            .unwrap();
        assert!(bridge.pending().await.unwrap().is_empty());
        let response = channel.take_response("req-1").unwrap().unwrap();
        assert_eq!(response.decision, ApprovalDecision::Allow);
    }

    #[tokio::test]
    async fn test_respond_to_unknown_request() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = ApprovalBridge::start(
            dir.path().to_path_buf(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(
            bridge.cancel("ghost").await,
            Err(RuntimeError::InvalidRequest { .. })
        ));
    }
}
