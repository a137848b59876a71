//! Building, rendering and delivering notifications at the end of a scope.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::capture::ScopeState;
use crate::config::Settings;
use crate::error::Result;
use crate::pattern::is_allowed;
use crate::stack::CallStack;

pub const REPORT_HEADER: &str = "N+1 queries detected:";
pub const STACK_HEADER: &str = "Call stack:";

/// Queries from one call site that share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub queries: Vec<String>,
    pub call_stack: CallStack,
}

/// Receives every rendered report of a detector.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, report: &str, notifications: &[Notification]);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&self, report: &str, notifications: &[Notification]) {
        warn!(notifications = notifications.len(), "{report}");
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports
            .lock()
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    pub fn take(&self) -> Vec<String> {
        self.reports
            .lock()
            .map(|mut reports| std::mem::take(&mut *reports))
            .unwrap_or_default()
    }
}

impl NotificationSink for MemorySink {
    fn deliver(&self, report: &str, _notifications: &[Notification]) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report.to_string());
        }
    }
}

/// Applies the repeat threshold, fingerprint grouping and the stack allow
/// list to a finished scope.
pub(crate) fn build(state: &ScopeState, settings: &Settings) -> Result<Vec<Notification>> {
    let min_repeat = settings.min_repeat;
    let mut notifications = Vec::new();

    for (key, site) in state.sites() {
        if site.count < min_repeat {
            continue;
        }

        let mut groups: Vec<Vec<String>> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for query in &site.queries {
            let fingerprint = query.fingerprint(&settings.fingerprinter)?;
            let slot = *index.entry(fingerprint).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(query.raw().to_string());
        }

        groups.retain(|group| group.len() >= min_repeat);
        if groups.is_empty() {
            continue;
        }

        let call_stack = site.call_stack.clone().unwrap_or_default();
        if is_allowed(&call_stack, &settings.allow_stack_paths) {
            debug!(call_site = %key, "repeated queries from allow-listed stack");
            continue;
        }

        notifications.extend(groups.into_iter().map(|queries| Notification {
            queries,
            call_stack: call_stack.clone(),
        }));
    }

    Ok(notifications)
}

/// Renders notifications as a multi-block text report. Frames under the
/// configured filter paths are left out.
pub fn render(notifications: &[Notification], settings: &Settings) -> String {
    let mut report = String::new();
    for notification in notifications {
        report.push_str(REPORT_HEADER);
        report.push('\n');
        for query in &notification.queries {
            report.push_str("  ");
            report.push_str(query);
            report.push('\n');
        }
        report.push_str(STACK_HEADER);
        report.push('\n');
        for frame in notification.call_stack.frames() {
            if settings.is_filtered_frame(frame) {
                continue;
            }
            report.push_str("  ");
            report.push_str(frame);
            report.push('\n');
        }
        report.push('\n');
    }
    report
}
