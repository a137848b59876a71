//! Query events and the per-scope call-site buckets they are recorded into.

use std::cell::OnceCell;
use std::collections::HashMap;

use crate::error::Result;
use crate::fingerprint::Fingerprinter;
use crate::stack::{CallSiteKey, CallStack};

/// Statement label the data layer uses for schema introspection.
pub const SCHEMA_LABEL: &str = "SCHEMA";

/// Comment marking a query the scanner must never record.
pub const IGNORE_ANNOTATION: &str = "/* !n1:ignore! */";

/// Appends the ignore annotation to `sql`.
pub fn annotate_ignored(sql: &str) -> String {
    format!("{sql} {IGNORE_ANNOTATION}")
}

/// One completed statement as reported by the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryEvent<'a> {
    pub sql: &'a str,
    pub name: Option<&'a str>,
    pub cached: bool,
}

impl<'a> QueryEvent<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            name: None,
            cached: false,
        }
    }

    pub fn named(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    /// Uncached, non-schema reads that were not annotated as ignored.
    pub fn is_candidate(&self) -> bool {
        self.name != Some(SCHEMA_LABEL)
            && self.sql.contains("SELECT")
            && !self.cached
            && !self.sql.contains(IGNORE_ANNOTATION)
    }
}

#[derive(Debug)]
pub(crate) struct QueryRecord {
    raw: String,
    fingerprint: OnceCell<String>,
}

impl QueryRecord {
    fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            fingerprint: OnceCell::new(),
        }
    }

    pub(crate) fn raw(&self) -> &str {
        &self.raw
    }

    pub(crate) fn fingerprint(&self, fingerprinter: &Fingerprinter) -> Result<&str> {
        if let Some(fingerprint) = self.fingerprint.get() {
            return Ok(fingerprint);
        }
        let computed = fingerprinter.fingerprint(&self.raw)?;
        Ok(self.fingerprint.get_or_init(|| computed))
    }
}

#[derive(Debug, Default)]
pub(crate) struct SiteRecord {
    pub(crate) count: usize,
    pub(crate) queries: Vec<QueryRecord>,
    pub(crate) call_stack: Option<CallStack>,
}

/// Call-site buckets of one scope, iterated in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct ScopeState {
    order: Vec<CallSiteKey>,
    sites: HashMap<CallSiteKey, SiteRecord>,
}

impl ScopeState {
    /// Records `sql` under the call site of `stack` and returns the site's
    /// new count.
    pub(crate) fn record(&mut self, sql: &str, stack: CallStack) -> usize {
        let key = stack.key();
        if !self.sites.contains_key(&key) {
            self.order.push(key.clone());
        }
        let site = self.sites.entry(key).or_default();

        site.count += 1;
        site.queries.push(QueryRecord::new(sql));
        if site.count == 2 {
            site.call_stack = Some(stack);
        }
        site.count
    }

    pub(crate) fn sites(&self) -> impl Iterator<Item = (&CallSiteKey, &SiteRecord)> {
        self.order
            .iter()
            .filter_map(|key| self.sites.get(key).map(|site| (key, site)))
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn query_count(&self) -> usize {
        self.sites.values().map(|site| site.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack(frame: &str) -> CallStack {
        CallStack::new([frame, "app::main at src/main.rs:1"])
    }

    #[test]
    fn candidate_filter() {
        assert!(QueryEvent::new("SELECT 1").is_candidate());
        assert!(!QueryEvent::new("SELECT 1").named(SCHEMA_LABEL).is_candidate());
        assert!(QueryEvent::new("SELECT 1").named("Leg Load").is_candidate());
        assert!(!QueryEvent::new("SELECT 1").cached(true).is_candidate());
        assert!(!QueryEvent::new("UPDATE legs SET chair_id = 1").is_candidate());
        assert!(!QueryEvent::new(&annotate_ignored("SELECT 1")).is_candidate());
    }

    #[test]
    fn stack_is_stored_on_second_occurrence() {
        let mut state = ScopeState::default();
        assert_eq!(state.record("SELECT 1", stack("a")), 1);
        let key = stack("a").key();
        assert!(state.sites[&key].call_stack.is_none());

        assert_eq!(state.record("SELECT 2", stack("a")), 2);
        assert_eq!(state.sites[&key].call_stack.as_ref(), Some(&stack("a")));
        assert_eq!(state.record("SELECT 3", stack("a")), 3);
        assert_eq!(state.sites[&key].queries.len(), 3);
    }

    #[test]
    fn sites_iterate_in_first_seen_order() {
        let mut state = ScopeState::default();
        for frame in ["c", "a", "b", "a", "c"] {
            state.record("SELECT 1", stack(frame));
        }
        let keys: Vec<_> = state.sites().map(|(key, _)| key.clone()).collect();
        assert_eq!(keys, vec![stack("c").key(), stack("a").key(), stack("b").key()]);
        assert_eq!(state.len(), 3);
        assert_eq!(state.query_count(), 5);
    }

    #[test]
    fn fingerprints_are_computed_once() {
        let record = QueryRecord::new("SELECT * FROM legs WHERE id = 1");
        let fingerprinter = Fingerprinter::Structural;
        let first = record.fingerprint(&fingerprinter).unwrap().to_string();
        assert_eq!(first, "select * from legs where id = ?");
        assert_eq!(record.fingerprint.get().map(String::as_str), Some(first.as_str()));
        assert_eq!(record.raw(), "SELECT * FROM legs WHERE id = 1");
    }
}
