//! Literal-or-regex patterns used by the stack allow list and the ignored
//! query list.

use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::stack::CallStack;

/// Frame markers for batch-preloading and uniqueness-validation internals of
/// a data-access layer. Queries issued from these paths repeat by design.
pub const DEFAULT_ALLOW_STACK_PATHS: &[&str] =
    &["associations::preloader", "validations::uniqueness"];

/// Pattern as written in a configuration file:
/// `{ literal = "..." }` or `{ regex = "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternSpec {
    Literal(String),
    Regex(String),
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    pub fn regex(source: &str) -> Result<Self> {
        Regex::new(source)
            .map(Pattern::Regex)
            .map_err(|err| Error::Configuration(format!("invalid pattern `{source}`: {err}")))
    }

    pub fn compile(spec: &PatternSpec) -> Result<Self> {
        match spec {
            PatternSpec::Literal(text) => Ok(Pattern::literal(text.clone())),
            PatternSpec::Regex(source) => Pattern::regex(source),
        }
    }

    /// Substring or regex search; used against stack frames.
    pub fn is_found_in(&self, text: &str) -> bool {
        match self {
            Pattern::Literal(literal) => text.contains(literal.as_str()),
            Pattern::Regex(re) => re.is_match(text),
        }
    }

    /// Whole-text equality or regex search; used against query text.
    pub fn matches_query(&self, sql: &str) -> bool {
        match self {
            Pattern::Literal(literal) => literal == sql,
            Pattern::Regex(re) => re.is_match(sql),
        }
    }
}

pub fn is_allowed(stack: &CallStack, patterns: &[Pattern]) -> bool {
    stack
        .frames()
        .iter()
        .any(|frame| patterns.iter().any(|pattern| pattern.is_found_in(frame)))
}

pub fn is_ignored_query(sql: &str, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|pattern| pattern.matches_query(sql))
}
