//! Scan scopes.
//!
//! A [`Detector`] holds what every unit of work shares: compiled settings,
//! the stack provider, the sinks and the event subscription. Each unit owns a
//! [`Scanner`], the scope state machine that records query events between
//! `start` and `finish`.
//!
//! ```text
//! Inactive --start--> Active --pause--> Paused
//!     ^                 |  ^--resume----'  |
//!     '-----finish------'------finish------'
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use tracing::{debug, trace, warn};

use crate::capture::{QueryEvent, ScopeState};
use crate::config::{Config, Settings};
use crate::error::{Error, Result};
use crate::notify::{self, Notification, NotificationSink, TracingSink};
use crate::pattern::is_ignored_query;
use crate::stack::{BacktraceProvider, CallStack, StackProvider};

/// Hooks the detector into the data layer's event bus.
///
/// Called once per detector, on the first scope start.
pub trait EventSubscriber: Send + Sync {
    fn subscribe(&self);
}

pub struct Detector {
    settings: Settings,
    stack_provider: Arc<dyn StackProvider>,
    sinks: Vec<Arc<dyn NotificationSink>>,
    subscriber: Option<Box<dyn EventSubscriber>>,
    subscribed: Once,
    force_raise: AtomicBool,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("settings", &self.settings)
            .field("sinks", &self.sinks.len())
            .field("force_raise", &self.force_raise)
            .finish_non_exhaustive()
    }
}

impl Detector {
    /// Detector with backtrace-based stacks and a [`TracingSink`].
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::from_settings(config.compile()?))
    }

    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            stack_provider: Arc::new(BacktraceProvider),
            sinks: vec![Arc::new(TracingSink)],
            subscriber: None,
            subscribed: Once::new(),
            force_raise: AtomicBool::new(false),
        }
    }

    pub fn with_stack_provider(mut self, provider: impl StackProvider + 'static) -> Self {
        self.stack_provider = Arc::new(provider);
        self
    }

    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_subscriber(mut self, subscriber: impl EventSubscriber + 'static) -> Self {
        self.subscriber = Some(Box::new(subscriber));
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Raise on every detection regardless of configuration, until
    /// [`Detector::unforce_raise`].
    pub fn force_raise(&self) {
        self.force_raise.store(true, Ordering::SeqCst);
    }

    pub fn unforce_raise(&self) {
        self.force_raise.store(false, Ordering::SeqCst);
    }

    pub fn is_force_raise(&self) -> bool {
        self.force_raise.load(Ordering::SeqCst)
    }

    pub fn scanner(self: &Arc<Self>) -> Scanner {
        Scanner::new(Arc::clone(self))
    }

    fn ensure_subscribed(&self) {
        self.subscribed.call_once(|| {
            if let Some(subscriber) = &self.subscriber {
                debug!("subscribing to query events");
                subscriber.subscribe();
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeStatus {
    Inactive,
    Active,
    Paused,
}

/// Scope state machine for one logical unit of work.
///
/// Not shared between units; move it into the task or thread that owns the
/// scope (see [`crate::local`] for a per-thread slot).
#[derive(Debug)]
pub struct Scanner {
    detector: Arc<Detector>,
    status: ScopeStatus,
    state: ScopeState,
    local_raise: bool,
    generation: u64,
}

/// Status and scope identity saved by a pause, restored when it ends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PauseMark {
    status: ScopeStatus,
    generation: u64,
}

impl Scanner {
    pub fn new(detector: Arc<Detector>) -> Self {
        Self {
            detector,
            status: ScopeStatus::Inactive,
            state: ScopeState::default(),
            local_raise: false,
            generation: 0,
        }
    }

    pub fn detector(&self) -> &Arc<Detector> {
        &self.detector
    }

    pub fn status(&self) -> ScopeStatus {
        self.status
    }

    pub fn is_scanning(&self) -> bool {
        self.status == ScopeStatus::Active
    }

    /// Raise on detection for this scanner only, until [`Scanner::stop_raise`].
    pub fn start_raise(&mut self) {
        self.local_raise = true;
    }

    pub fn stop_raise(&mut self) {
        self.local_raise = false;
    }

    pub fn raises(&self) -> bool {
        self.detector.settings.raise_on_detect || self.detector.is_force_raise() || self.local_raise
    }

    /// Opens a scope. Re-entering a live scope keeps its counters.
    pub fn start(&mut self) -> ScopeStatus {
        if !self.detector.settings.enabled {
            trace!("scanning disabled");
            return self.status;
        }
        if self.status != ScopeStatus::Inactive {
            return self.status;
        }

        self.state = ScopeState::default();
        self.generation += 1;
        self.detector.ensure_subscribed();
        self.status = ScopeStatus::Active;
        debug!("scan started");
        self.status
    }

    /// Runs `body` inside a scope and finishes it afterwards.
    ///
    /// An error returned by `body` is passed through unchanged; a detection
    /// raised by the closing `finish` is then only delivered to the sinks. A
    /// panic in `body` closes the scope without evaluating it and resumes
    /// unwinding.
    pub fn scan<T, E, F>(&mut self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Scanner) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        self.start();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        self.close(outcome)
    }

    /// Finishes a scope opened for a body that has already run.
    pub(crate) fn close<T, E>(
        &mut self,
        outcome: std::thread::Result<std::result::Result<T, E>>,
    ) -> std::result::Result<T, E>
    where
        E: From<Error>,
    {
        match outcome {
            Ok(Ok(value)) => {
                self.finish()?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(finish_err) = self.finish() {
                    debug!(error = %finish_err, "scan body failed; not raising");
                }
                Err(err)
            }
            Err(payload) => {
                self.abandon();
                panic::resume_unwind(payload)
            }
        }
    }

    /// Stops recording without discarding what was recorded so far.
    pub fn pause(&mut self) -> ScopeStatus {
        if self.detector.settings.ignore_pauses {
            return self.status;
        }
        if self.status == ScopeStatus::Active {
            self.status = ScopeStatus::Paused;
            trace!("scan paused");
        }
        self.status
    }

    /// Runs `body` paused, then restores the status held before the call.
    pub fn pause_with<T, F>(&mut self, body: F) -> T
    where
        F: FnOnce(&mut Scanner) -> T,
    {
        let mark = self.pause_mark();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        self.restore(mark);
        match outcome {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    pub(crate) fn pause_mark(&mut self) -> PauseMark {
        let mark = PauseMark {
            status: self.status,
            generation: self.generation,
        };
        self.pause();
        mark
    }

    // A scope finished or started since the mark was taken is left as it is.
    pub(crate) fn restore(&mut self, mark: PauseMark) {
        if mark.status != ScopeStatus::Inactive
            && self.status != ScopeStatus::Inactive
            && self.generation == mark.generation
        {
            self.status = mark.status;
        }
    }

    /// Records again. Counters of a paused scope are kept; an inactive
    /// scanner starts a new scope.
    pub fn resume(&mut self) -> ScopeStatus {
        match self.status {
            ScopeStatus::Inactive => self.start(),
            ScopeStatus::Active | ScopeStatus::Paused => {
                self.status = ScopeStatus::Active;
                trace!("scan resumed");
                self.status
            }
        }
    }

    /// Closes the scope, evaluates it and dispatches the report.
    ///
    /// Returns the notifications that were dispatched, or
    /// [`Error::Detection`] carrying the report when raising is on.
    pub fn finish(&mut self) -> Result<Vec<Notification>> {
        if self.status == ScopeStatus::Inactive {
            return Ok(Vec::new());
        }
        self.status = ScopeStatus::Inactive;
        let state = std::mem::take(&mut self.state);

        let settings = &self.detector.settings;
        let notifications = notify::build(&state, settings)?;
        debug!(
            call_sites = state.len(),
            queries = state.query_count(),
            notifications = notifications.len(),
            "scan finished"
        );
        if notifications.is_empty() {
            return Ok(notifications);
        }

        let report = notify::render(&notifications, settings);
        for sink in &self.detector.sinks {
            sink.deliver(&report, &notifications);
        }
        if self.raises() {
            return Err(Error::Detection(report));
        }
        Ok(notifications)
    }

    /// Query-completion hook. Captures the current stack through the
    /// detector's provider; capture failures are logged and dropped.
    pub fn on_query_event(&mut self, event: &QueryEvent<'_>) {
        if !self.accepts(event) {
            return;
        }
        match self.detector.stack_provider.capture() {
            Ok(stack) => self.record_unchecked(event.sql, stack),
            Err(err) => warn!(error = %err, "dropping query event"),
        }
    }

    /// Like [`Scanner::on_query_event`], with a stack supplied by the caller.
    pub fn record_query(&mut self, event: &QueryEvent<'_>, stack: CallStack) {
        if self.accepts(event) {
            self.record_unchecked(event.sql, stack);
        }
    }

    fn accepts(&self, event: &QueryEvent<'_>) -> bool {
        self.status == ScopeStatus::Active
            && event.is_candidate()
            && !is_ignored_query(event.sql, &self.detector.settings.ignore_queries)
    }

    fn record_unchecked(&mut self, sql: &str, stack: CallStack) {
        let count = self.state.record(sql, stack);
        trace!(count, "query recorded");
    }

    fn abandon(&mut self) {
        self.status = ScopeStatus::Inactive;
        self.state = ScopeState::default();
        debug!("scan abandoned");
    }
}
