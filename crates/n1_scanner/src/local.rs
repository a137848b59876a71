//! Per-thread scanner slot.
//!
//! A process-wide query listener has no handle on the unit of work that
//! issued the query. Installing the unit's [`Scanner`] here lets the listener
//! route events with [`dispatch`] to whatever scanner the current thread owns.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};

use tracing::trace;

use crate::capture::QueryEvent;
use crate::error::Error;
use crate::scope::Scanner;

thread_local! {
    static CURRENT: RefCell<Option<Scanner>> = const { RefCell::new(None) };
}

pub fn install(scanner: Scanner) -> Option<Scanner> {
    CURRENT.with(|slot| slot.borrow_mut().replace(scanner))
}

pub fn take() -> Option<Scanner> {
    CURRENT.with(|slot| slot.borrow_mut().take())
}

/// Runs `f` with the current thread's scanner, if one is installed.
///
/// Returns `None` when no scanner is installed or the slot is already
/// borrowed further up the stack. Events dispatched while `f` runs are
/// dropped; run scope bodies through [`scan`] instead.
pub fn with_current<R>(f: impl FnOnce(&mut Scanner) -> R) -> Option<R> {
    CURRENT.with(|slot| {
        let mut slot = slot.try_borrow_mut().ok()?;
        slot.as_mut().map(f)
    })
}

/// Forwards `event` to the current thread's scanner.
pub fn dispatch(event: &QueryEvent<'_>) {
    if with_current(|scanner| scanner.on_query_event(event)).is_none() {
        trace!("no scanner available for query event");
    }
}

/// [`Scanner::scan`] for the installed scanner.
///
/// The slot is only borrowed to open and close the scope, so events
/// dispatched by `body` are recorded. Without an installed scanner `body`
/// runs unscanned.
pub fn scan<T, E, F>(body: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E>,
    E: From<Error>,
{
    if with_current(|scanner| scanner.start()).is_none() {
        trace!("no scanner installed; running body unscanned");
        return body();
    }

    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    let mut slot = Reinstall(take());
    let result = match slot.0.as_mut() {
        Some(scanner) => scanner.close(outcome),
        None => match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        },
    };
    result
}

/// [`Scanner::pause_with`] for the installed scanner.
pub fn pause_with<T>(body: impl FnOnce() -> T) -> T {
    let mark = with_current(|scanner| scanner.pause_mark());
    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    if let Some(mark) = mark {
        with_current(|scanner| scanner.restore(mark));
    }
    match outcome {
        Ok(value) => value,
        Err(payload) => panic::resume_unwind(payload),
    }
}

// Puts the scanner back in the slot on drop, including during unwinding.
struct Reinstall(Option<Scanner>);

impl Drop for Reinstall {
    fn drop(&mut self) {
        if let Some(scanner) = self.0.take() {
            install(scanner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::error::Result;
    use crate::scope::{Detector, ScopeStatus};
    use crate::stack::{CallStack, StackProvider};

    struct FixedStack;

    impl StackProvider for FixedStack {
        fn capture(&self) -> crate::Result<CallStack> {
            Ok(CallStack::new(["app::loop at src/app.rs:7"]))
        }
    }

    fn detector() -> Arc<Detector> {
        detector_with(Config::default())
    }

    fn detector_with(config: Config) -> Arc<Detector> {
        Arc::new(
            Detector::new(&config)
                .unwrap()
                .with_stack_provider(FixedStack)
                .with_sinks(Vec::new()),
        )
    }

    #[test]
    fn dispatch_reaches_the_installed_scanner() {
        let mut scanner = detector().scanner();
        scanner.start();
        assert!(install(scanner).is_none());

        for id in 0..3 {
            dispatch(&QueryEvent::new(&format!("SELECT * FROM legs WHERE id = {id}")));
        }

        let mut scanner = take().unwrap();
        assert_eq!(scanner.status(), ScopeStatus::Active);
        assert_eq!(scanner.finish().unwrap().len(), 1);
    }

    #[test]
    fn dispatch_without_scanner_is_a_no_op() {
        assert!(take().is_none());
        dispatch(&QueryEvent::new("SELECT 1"));
        assert!(with_current(|_| ()).is_none());
    }

    #[test]
    fn reentrant_dispatch_is_dropped() {
        let mut scanner = detector().scanner();
        scanner.start();
        install(scanner);

        with_current(|_| dispatch(&QueryEvent::new("SELECT 1"))).unwrap();

        let mut scanner = take().unwrap();
        assert!(scanner.finish().unwrap().is_empty());
    }

    fn leg_queries(count: usize) {
        for id in 0..count {
            dispatch(&QueryEvent::new(&format!("SELECT * FROM legs WHERE id = {id}")));
        }
    }

    #[test]
    fn scan_records_events_dispatched_by_the_body() {
        install(
            detector_with(Config {
                raise_on_detect: true,
                ..Config::default()
            })
            .scanner(),
        );

        let result: Result<()> = scan(|| {
            leg_queries(20);
            Ok(())
        });

        let report = result.unwrap_err().report().map(str::to_string);
        assert!(report.unwrap().contains("SELECT * FROM legs WHERE id = 19"));
        let scanner = take().unwrap();
        assert_eq!(scanner.status(), ScopeStatus::Inactive);
    }

    #[test]
    fn scan_returns_the_body_result() {
        install(detector().scanner());

        let result: Result<&str> = scan(|| {
            leg_queries(1);
            Ok("done")
        });

        assert_eq!(result.unwrap(), "done");
        assert_eq!(take().unwrap().status(), ScopeStatus::Inactive);
    }

    #[test]
    fn scan_without_scanner_runs_the_body() {
        assert!(take().is_none());
        let result: Result<u8> = scan(|| Ok(7));
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn scan_reinstalls_an_inactive_scanner_after_a_panic() {
        install(detector().scanner());

        let outcome = std::panic::catch_unwind(|| {
            let _: Result<()> = scan(|| {
                leg_queries(3);
                panic!("boom");
            });
        });

        assert!(outcome.is_err());
        let mut scanner = take().unwrap();
        assert_eq!(scanner.status(), ScopeStatus::Inactive);
        assert!(scanner.finish().unwrap().is_empty());
    }

    #[test]
    fn pause_with_suppresses_dispatched_events() {
        let mut scanner = detector().scanner();
        scanner.start();
        install(scanner);

        let status = pause_with(|| {
            leg_queries(5);
            with_current(|scanner| scanner.status())
        });

        assert_eq!(status, Some(ScopeStatus::Paused));
        let mut scanner = take().unwrap();
        assert_eq!(scanner.status(), ScopeStatus::Active);
        assert!(scanner.finish().unwrap().is_empty());
    }
}
