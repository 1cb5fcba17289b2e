//! Stall watchdog for long-running scoped operations
//!
//! A [`Watchdog`] emits one WARN event per interval while the operation it
//! guards is still open. The returned [`WatchdogGuard`] ends the session when
//! finished or dropped, so every exit path (early return, `?`, unwinding) is
//! covered:
//!
//! ```no_run
//! # use bacip_core::Watchdog;
//! # fn close_all() -> Result<(), Box<dyn std::error::Error>> {
//! let _watchdog = Watchdog::new().process_id("closing driver").start()?;
//! // ... work that may hang ...
//! # Ok(())
//! # }
//! ```
//!
//! Completion blocks until the tick thread has exited, so no warning is ever
//! logged after `finish` (or the drop) returns.

use std::backtrace::Backtrace;
use std::panic::Location;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{trace, warn, Span};

/// Default interval between two warnings
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("watchdog interval must be greater than zero")]
    ZeroInterval,
    #[error("failed to spawn watchdog thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Watchdog configuration. Build with the setters, then [`Watchdog::start`].
#[derive(Debug, Clone)]
pub struct Watchdog {
    process_id: Option<String>,
    process_info: Option<String>,
    interval: Duration,
    include_backtrace: bool,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self {
            process_id: None,
            process_info: None,
            interval: DEFAULT_INTERVAL,
            include_backtrace: false,
        }
    }
}

/// Outcome of a finished watchdog session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogReport {
    /// Number of warnings emitted while the operation was open
    pub warnings: u32,
    /// Time between start and completion
    pub elapsed: Duration,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label prefixed to the warning message ("<id> still in progress")
    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    /// Free-form description attached to every event. Defaults to the
    /// source location that called [`Watchdog::start`].
    pub fn process_info(mut self, process_info: impl Into<String>) -> Self {
        self.process_info = Some(process_info.into());
        self
    }

    /// Interval between warnings. Must be greater than zero.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Attach the backtrace captured at start to every warning
    pub fn include_backtrace(mut self, include: bool) -> Self {
        self.include_backtrace = include;
        self
    }

    /// Start watching. Keep the guard alive for the whole operation.
    #[track_caller]
    pub fn start(self) -> Result<WatchdogGuard, WatchdogError> {
        if self.interval.is_zero() {
            return Err(WatchdogError::ZeroInterval);
        }

        let process_info = self.process_info.unwrap_or_else(|| {
            let caller = Location::caller();
            format!("{}:{}", caller.file(), caller.line())
        });
        let prefix = self
            .process_id
            .map(|id| format!("{} ", id))
            .unwrap_or_default();
        let backtrace = self
            .include_backtrace
            .then(|| Backtrace::force_capture().to_string());

        let started = Instant::now();
        let warnings = Arc::new(AtomicU32::new(0));
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let ticker = Ticker {
            prefix,
            process_info: process_info.clone(),
            interval: self.interval,
            backtrace,
            started,
            warnings: Arc::clone(&warnings),
        };

        // Log through the caller's subscriber and span, not the global default
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let span = Span::current();

        let handle = thread::Builder::new()
            .name("bacip-watchdog".to_string())
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _entered = span.enter();
                    ticker.run(done_rx);
                })
            })?;

        Ok(WatchdogGuard {
            done: Some(done_tx),
            handle: Some(handle),
            started,
            warnings,
            process_info,
        })
    }
}

struct Ticker {
    prefix: String,
    process_info: String,
    interval: Duration,
    backtrace: Option<String>,
    started: Instant,
    warnings: Arc<AtomicU32>,
}

impl Ticker {
    fn run(self, done: mpsc::Receiver<()>) {
        trace!(process_info = %self.process_info, interval = ?self.interval, "start checking");
        let mut next_tick = self.started + self.interval;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match done.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => {
                    self.warnings.fetch_add(1, Ordering::SeqCst);
                    self.warn();
                    next_tick += self.interval;
                }
                // Guard finished or dropped
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn warn(&self) {
        let in_progress_for = self.started.elapsed();
        match &self.backtrace {
            Some(backtrace) => warn!(
                process_info = %self.process_info,
                interval = ?self.interval,
                in_progress_for = ?in_progress_for,
                backtrace = %backtrace,
                "{}still in progress",
                self.prefix
            ),
            None => warn!(
                process_info = %self.process_info,
                interval = ?self.interval,
                in_progress_for = ?in_progress_for,
                "{}still in progress",
                self.prefix
            ),
        }
    }
}

/// Open watchdog session. Finishing or dropping it stops the warnings.
#[must_use = "dropping the guard immediately ends the watchdog session"]
pub struct WatchdogGuard {
    done: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    started: Instant,
    warnings: Arc<AtomicU32>,
    process_info: String,
}

impl WatchdogGuard {
    /// End the session and wait for the tick thread to exit
    pub fn finish(mut self) -> WatchdogReport {
        self.stop()
    }

    fn stop(&mut self) -> WatchdogReport {
        let elapsed = self.started.elapsed();
        trace!(process_info = %self.process_info, check_duration = ?elapsed, "done");
        drop(self.done.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(process_info = %self.process_info, "watchdog thread panicked");
            }
        }
        WatchdogReport {
            warnings: self.warnings.load(Ordering::SeqCst),
            elapsed,
        }
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Records the message of every WARN event
    #[derive(Clone, Default)]
    struct WarnCapture(Arc<Mutex<Vec<String>>>);

    impl WarnCapture {
        fn count(&self, message: &str) -> usize {
            self.0.lock().unwrap().iter().filter(|m| *m == message).count()
        }

        fn total(&self) -> usize {
            self.0.lock().unwrap().len()
        }
    }

    struct MessageVisitor(String);

    impl Visit for MessageVisitor {
        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{:?}", value);
            }
        }
    }

    impl<S: Subscriber> Layer<S> for WarnCapture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                let mut visitor = MessageVisitor(String::new());
                event.record(&mut visitor);
                self.0.lock().unwrap().push(visitor.0);
            }
        }
    }

    #[test]
    fn test_slow_operation_warns_repeatedly() {
        let capture = WarnCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            let guard = Watchdog::new()
                .process_id("TestStopWarn")
                .interval(Duration::from_millis(10))
                .include_backtrace(true)
                .start()
                .unwrap();
            thread::sleep(Duration::from_millis(100));
            let report = guard.finish();

            assert!(report.warnings >= 3, "expected at least 3 warnings, got {}", report.warnings);
            assert_eq!(capture.count("TestStopWarn still in progress"), report.warnings as usize);

            // Nothing may arrive after completion returned
            let seen = capture.total();
            thread::sleep(Duration::from_millis(50));
            assert_eq!(capture.total(), seen);
        });
    }

    #[test]
    fn test_fast_operation_never_warns() {
        let capture = WarnCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            let guard = Watchdog::new()
                .process_id("TestStopWarn")
                .interval(Duration::from_millis(100))
                .start()
                .unwrap();
            thread::sleep(Duration::from_millis(10));
            let report = guard.finish();

            assert_eq!(report.warnings, 0);
            assert_eq!(capture.count("TestStopWarn still in progress"), 0);
        });
    }

    #[test]
    fn test_drop_ends_session() {
        let capture = WarnCapture::default();
        let subscriber = tracing_subscriber::registry().with(capture.clone());

        tracing::subscriber::with_default(subscriber, || {
            fn early_return(capture: &WarnCapture) -> Result<(), WatchdogError> {
                let _guard = Watchdog::new()
                    .interval(Duration::from_millis(5))
                    .start()?;
                thread::sleep(Duration::from_millis(30));
                assert!(capture.total() > 0);
                Ok(())
            }

            early_return(&capture).unwrap();
            let seen = capture.total();
            thread::sleep(Duration::from_millis(30));
            assert_eq!(capture.total(), seen);
            assert!(capture.count("still in progress") > 0);
        });
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = Watchdog::new().interval(Duration::ZERO).start();
        assert!(matches!(result, Err(WatchdogError::ZeroInterval)));
    }

    #[test]
    fn test_default_process_info_is_caller_location() {
        let guard = Watchdog::new().start().unwrap();
        assert!(guard.process_info.starts_with(file!()), "{}", guard.process_info);
        assert_eq!(guard.finish().warnings, 0);
    }
}
