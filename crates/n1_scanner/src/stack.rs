//! Call stacks and call-site keys.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Ordered frame descriptors, innermost first. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallStack {
    frames: Arc<[String]>,
}

impl CallStack {
    pub fn new<I, S>(frames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            frames: frames.into_iter().map(Into::<String>::into).collect(),
        }
    }

    pub fn frames(&self) -> &[String] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn key(&self) -> CallSiteKey {
        let mut hasher = Sha256::new();
        for frame in self.frames.iter() {
            hasher.update(frame.as_bytes());
            hasher.update(b"\n");
        }
        CallSiteKey(hex::encode(hasher.finalize()))
    }
}

impl<S: Into<String>> FromIterator<S> for CallStack {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSiteKey(String);

impl CallSiteKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallSiteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of the call stack at the moment a query event is observed.
pub trait StackProvider: Send + Sync {
    fn capture(&self) -> Result<CallStack>;
}

/// Captures the current thread's stack with [`std::backtrace`].
///
/// Frames belonging to the backtrace machinery itself are dropped. Symbol
/// names and source locations are only available when debug info is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceProvider;

const INTERNAL_FRAMES: &[&str] = &["std::backtrace", "backtrace_rs", "n1_scanner::stack::"];

impl StackProvider for BacktraceProvider {
    fn capture(&self) -> Result<CallStack> {
        let backtrace = Backtrace::force_capture();
        if backtrace.status() != BacktraceStatus::Captured {
            return Err(Error::StackCapture(
                "backtraces are not supported on this platform".to_string(),
            ));
        }
        Ok(parse_backtrace(&backtrace.to_string()))
    }
}

fn parse_backtrace(rendered: &str) -> CallStack {
    let mut frames: Vec<String> = Vec::new();
    for line in rendered.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(location) = line.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                last.push_str(" at ");
                last.push_str(location);
            }
            continue;
        }
        let symbol = match line.split_once(": ") {
            Some((index, symbol)) if index.chars().all(|c| c.is_ascii_digit()) => symbol,
            _ => line,
        };
        frames.push(symbol.to_string());
    }
    frames
        .into_iter()
        .filter(|frame| !INTERNAL_FRAMES.iter().any(|marker| frame.contains(marker)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_frames_share_a_key() {
        let a = CallStack::new(["app/models/chair.rs:10", "app/main.rs:3"]);
        let b = CallStack::new(["app/models/chair.rs:10", "app/main.rs:3"]);
        let c = CallStack::new(["app/models/chair.rs:11", "app/main.rs:3"]);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key().as_str().len(), 64);
    }

    #[test]
    fn parses_rendered_backtraces() {
        let rendered = "   0: std::backtrace::Backtrace::force_capture\n\
                        \x20            at /rustc/library/std/src/backtrace.rs:310:9\n\
                        \x20  1: app::load_legs\n\
                        \x20            at ./src/app.rs:12:5\n\
                        \x20  2: app::main\n";
        let stack = parse_backtrace(rendered);
        assert_eq!(
            stack.frames(),
            ["app::load_legs at ./src/app.rs:12:5", "app::main"]
        );
    }
}
