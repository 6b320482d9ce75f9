//! Bash allow-rules.
//!
//! A rule is a token sequence, e.g. `["git", "status"]`. A rule ending in
//! [`WILDCARD`] authorizes any suffix after its prefix, but never a command
//! that chains, pipes, or backgrounds another command, and never one that
//! runs a command or process substitution. A command that does not parse
//! matches no rule.

use serde_json::Value;

use crate::tokenizer::{lex, Token};

pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BashRule {
    prefix: Vec<String>,
    wildcard: bool,
}

impl BashRule {
    /// Builds a rule from its tokens. Returns `None` for an empty rule.
    pub fn new<I, S>(tokens: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut prefix: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if prefix.is_empty() {
            return None;
        }
        let wildcard = prefix.last().is_some_and(|last| last == WILDCARD);
        if wildcard {
            prefix.pop();
        }
        Some(BashRule { prefix, wildcard })
    }

    /// Parses one allowlist entry. Anything other than a non-empty array of
    /// strings is rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        let tokens = items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()?;
        Self::new(tokens)
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    pub fn matches(&self, command: &str) -> bool {
        lex(command).is_some_and(|tokens| self.matches_tokens(&tokens))
    }

    fn matches_tokens(&self, tokens: &[Token]) -> bool {
        if tokens.is_empty() {
            return false;
        }
        if !self.wildcard {
            return tokens.len() == self.prefix.len()
                && tokens
                    .iter()
                    .zip(&self.prefix)
                    .all(|(token, expected)| token.text == *expected && !token.is_operator());
        }
        if tokens.len() < self.prefix.len() {
            return false;
        }
        if tokens
            .iter()
            .any(|token| token.is_operator() || token.substitutes)
        {
            return false;
        }
        tokens
            .iter()
            .zip(&self.prefix)
            .all(|(token, expected)| token.text == *expected)
    }
}

/// Parses allowlist entries, skipping malformed ones.
pub fn parse_rules(values: &[Value]) -> Vec<BashRule> {
    values.iter().filter_map(BashRule::from_value).collect()
}

/// True when some rule authorizes `command`.
pub fn matches_any(command: &str, rules: &[BashRule]) -> bool {
    if rules.is_empty() {
        return false;
    }
    let Some(tokens) = lex(command) else {
        return false;
    };
    rules.iter().any(|rule| rule.matches_tokens(&tokens))
}
