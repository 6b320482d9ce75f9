use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "AGENT_MEDIATOR_";
pub const ALLOWLIST_FILE: &str = "allowlist.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorConfig {
    /// Maximum heartbeat age for the UI to count as present.
    pub staleness: Duration,
    pub poll_interval: Duration,
    /// Bound on waiting for a human response. Kept under the 60 s hook
    /// timeout of the Claude CLI.
    pub timeout: Duration,
    /// Overrides `<ipc_dir>/allowlist.json`.
    pub allowlist_path: Option<PathBuf>,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(55),
            allowlist_path: None,
        }
    }
}

impl MediatorConfig {
    /// Defaults overridden by `AGENT_MEDIATOR_STALENESS_MS`,
    /// `AGENT_MEDIATOR_POLL_MS`, `AGENT_MEDIATOR_TIMEOUT_MS` and
    /// `AGENT_MEDIATOR_ALLOWLIST`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let millis = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            let value = lookup(&key)?;
            match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
                _ => {
                    tracing::warn!(key = %key, value = %value, "ignoring invalid duration");
                    None
                }
            }
        };
        if let Some(staleness) = millis("STALENESS_MS") {
            config.staleness = staleness;
        }
        if let Some(poll_interval) = millis("POLL_MS") {
            config.poll_interval = poll_interval;
        }
        if let Some(timeout) = millis("TIMEOUT_MS") {
            config.timeout = timeout;
        }
        if let Some(path) = lookup(&format!("{ENV_PREFIX}ALLOWLIST")).filter(|p| !p.is_empty()) {
            config.allowlist_path = Some(PathBuf::from(path));
        }
        config
    }

    pub fn allowlist_path(&self, ipc_dir: &Path) -> PathBuf {
        self.allowlist_path
            .clone()
            .unwrap_or_else(|| ipc_dir.join(ALLOWLIST_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("AGENT_MEDIATOR_TIMEOUT_MS", "1500"),
            ("AGENT_MEDIATOR_POLL_MS", "oops"),
            ("AGENT_MEDIATOR_ALLOWLIST", "/etc/allow.json"),
        ]);
        let config = MediatorConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.staleness, Duration::from_secs(10));
        assert_eq!(
            config.allowlist_path(Path::new("/tmp/ipc")),
            PathBuf::from("/etc/allow.json")
        );
    }

    #[test]
    fn allowlist_defaults_into_ipc_dir() {
        let config = MediatorConfig::default();
        assert_eq!(
            config.allowlist_path(Path::new("/tmp/ipc")),
            PathBuf::from("/tmp/ipc/allowlist.json")
        );
    }
}
