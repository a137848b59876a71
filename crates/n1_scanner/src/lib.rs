//! Runtime detection of N+1 query patterns.
//!
//! A [`Scanner`] records read queries between `start` and `finish`, buckets
//! them by the call stack that issued them and, at `finish`, reports every
//! call site that issued the same query shape at least `min_repeat` times.

pub mod capture;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod local;
pub mod notify;
pub mod pattern;
pub mod scope;
pub mod stack;

pub use capture::{annotate_ignored, QueryEvent, IGNORE_ANNOTATION, SCHEMA_LABEL};
pub use config::{Config, Settings};
pub use error::{Error, Result};
pub use fingerprint::{fingerprint, Fingerprinter};
pub use notify::{render, MemorySink, Notification, NotificationSink, TracingSink};
pub use pattern::{Pattern, PatternSpec, DEFAULT_ALLOW_STACK_PATHS};
pub use scope::{Detector, EventSubscriber, Scanner, ScopeStatus};
pub use stack::{BacktraceProvider, CallSiteKey, CallStack, StackProvider};

/// Canonical signature of a MySQL statement; see [`fingerprint::structural`].
pub fn mysql_fingerprint(query: &str) -> Result<String> {
    fingerprint::structural::canonicalize(query)
}
