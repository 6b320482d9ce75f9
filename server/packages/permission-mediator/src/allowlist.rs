//! Per-project allowlist.
//!
//! Two document shapes are accepted:
//!
//! ```json
//! ["WebFetch", "Edit"]
//! {"tools": ["WebFetch"], "bashRules": [["npm", "test"], ["cd", "*"]]}
//! ```
//!
//! The file is re-read for every decision and is never written here.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::MediatorError;
use crate::rules::{matches_any, parse_rules, BashRule};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    pub tools: Vec<String>,
    pub bash_rules: Vec<BashRule>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AllowlistDocument {
    Tools(Vec<Value>),
    Structured {
        #[serde(default)]
        tools: Vec<Value>,
        #[serde(default, rename = "bashRules")]
        bash_rules: Vec<Value>,
    },
}

impl Allowlist {
    /// Loads the allowlist at `path`. A missing or malformed file is an empty
    /// allowlist.
    pub fn load(path: &Path) -> Self {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "allowlist not readable");
                return Self::default();
            }
        };
        Self::from_json(&text).unwrap_or_else(|err| {
            tracing::warn!(path = %path.display(), error = %err, "ignoring malformed allowlist");
            Self::default()
        })
    }

    pub fn from_json(text: &str) -> Result<Self, MediatorError> {
        let document: AllowlistDocument =
            serde_json::from_str(text).map_err(|err| MediatorError::Malformed {
                what: "allowlist",
                message: err.to_string(),
            })?;
        let (tools, bash_rules) = match document {
            AllowlistDocument::Tools(tools) => (tools, Vec::new()),
            AllowlistDocument::Structured { tools, bash_rules } => (tools, bash_rules),
        };
        Ok(Allowlist {
            tools: tools
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            bash_rules: parse_rules(&bash_rules),
        })
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        self.tools.iter().any(|tool| tool == tool_name)
    }

    pub fn allows_command(&self, command: &str) -> bool {
        matches_any(command, &self.bash_rules)
    }
}
