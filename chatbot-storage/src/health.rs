//! Process-wide storage health
//!
//! The [`HealthMonitor`] tallies network-class database failures in a
//! sliding window. When the tally exceeds the configured maximum it
//! dispatches a [`ThresholdAction`] exactly once; the production action
//! terminates the process after a grace period so a supervisor can restart
//! it against a reachable database.
//!
//! The monitor also carries two sticky, per-collection degradation flags:
//!
//! - **unique index unavailable**: a declared unique index could not be built,
//!   so the conversation lock switches to its duplicate-cleanup path
//! - **text search unavailable**: a full-text index could not be built, so
//!   searches fall back to prefix matching
//!
//! Flags are set once and never cleared, except by [`HealthMonitor::reset`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use once_cell::sync::OnceCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::HealthConfig;
use crate::error::DatabaseErrorKind;

/// Details handed to a [`ThresholdAction`]
#[derive(Debug, Clone)]
pub struct FailureReport {
    /// Failures inside the window when the threshold was crossed
    pub failures: usize,
    /// Configured maximum
    pub max_failures: u32,
    /// Window length
    pub interval: Duration,
    /// Kind of the failure that crossed the threshold
    pub last_kind: DatabaseErrorKind,
    /// When the threshold was crossed
    pub at: DateTime<Utc>,
}

/// What happens once too many network failures pile up
#[async_trait]
pub trait ThresholdAction: Send + Sync {
    /// Called once, from a spawned task, when the threshold is crossed
    async fn on_threshold(&self, report: FailureReport);
}

/// Terminate the process after a grace period
#[derive(Debug, Clone)]
pub struct TerminateProcess {
    /// Time left for log flushing before exit
    pub grace: Duration,
}

#[async_trait]
impl ThresholdAction for TerminateProcess {
    async fn on_threshold(&self, report: FailureReport) {
        tracing::error!(
            failures = report.failures,
            max_failures = report.max_failures,
            interval_secs = report.interval.as_secs(),
            grace_ms = self.grace.as_millis() as u64,
            "database unreachable, terminating process"
        );
        tokio::time::sleep(self.grace).await;
        std::process::exit(1);
    }
}

/// Do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

#[async_trait]
impl ThresholdAction for NoopAction {
    async fn on_threshold(&self, _report: FailureReport) {}
}

/// Internal state protected by a `std::sync::Mutex`
///
/// The mutex is never held across `.await` points.
#[derive(Default)]
struct WindowState {
    failures: VecDeque<Instant>,
    tripped: bool,
}

/// Network-failure tally and degradation flags
pub struct HealthMonitor {
    state: Mutex<WindowState>,
    interval: Duration,
    max_failures: Option<u32>,
    action: Arc<dyn ThresholdAction>,
    unique_unavailable: DashSet<String>,
    text_search_unavailable: DashSet<String>,
}

static GLOBAL: OnceCell<Arc<HealthMonitor>> = OnceCell::new();

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("interval", &self.interval)
            .field("max_failures", &self.max_failures)
            .field("tripped", &self.is_tripped())
            .finish()
    }
}

impl HealthMonitor {
    /// Monitor with an explicit threshold action
    pub fn new(config: HealthConfig, action: Arc<dyn ThresholdAction>) -> Self {
        Self {
            state: Mutex::new(WindowState::default()),
            interval: config.interval(),
            max_failures: config.max_failures,
            action,
            unique_unavailable: DashSet::new(),
            text_search_unavailable: DashSet::new(),
        }
    }

    /// Monitor that terminates the process when the threshold is crossed
    pub fn terminating(config: HealthConfig) -> Self {
        let grace = config.grace_period();
        Self::new(config, Arc::new(TerminateProcess { grace }))
    }

    /// Monitor that only counts
    pub fn noop() -> Self {
        Self::new(HealthConfig::default(), Arc::new(NoopAction))
    }

    /// Install the process-wide monitor
    ///
    /// Returns the installed instance; when one already exists it is kept
    /// and returned.
    pub fn init_global(config: HealthConfig) -> Arc<HealthMonitor> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::terminating(config))))
    }

    /// The process-wide monitor, created with default settings on first use
    pub fn global() -> Arc<HealthMonitor> {
        Self::init_global(HealthConfig::default())
    }

    /// Record a failed database call
    ///
    /// Only network-class kinds are counted; returns whether this one was.
    pub fn record_failure(&self, kind: &DatabaseErrorKind) -> bool {
        if !kind.is_network() {
            return false;
        }

        let report = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            while let Some(oldest) = state.failures.front() {
                if now.duration_since(*oldest) > self.interval {
                    state.failures.pop_front();
                } else {
                    break;
                }
            }
            state.failures.push_back(now);

            match self.max_failures {
                Some(max) if !state.tripped && state.failures.len() > max as usize => {
                    state.tripped = true;
                    Some(FailureReport {
                        failures: state.failures.len(),
                        max_failures: max,
                        interval: self.interval,
                        last_kind: *kind,
                        at: Utc::now(),
                    })
                }
                _ => None,
            }
        }; // lock dropped here

        tracing::warn!(kind = %kind, "database network failure");

        if let Some(report) = report {
            tracing::error!(
                failures = report.failures,
                max_failures = report.max_failures,
                "database failure threshold crossed"
            );
            self.dispatch(report);
        }
        true
    }

    fn dispatch(&self, report: FailureReport) {
        let action = Arc::clone(&self.action);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    action.on_threshold(report).await;
                });
            }
            Err(_) => {
                tracing::error!("no async runtime, threshold action not dispatched");
            }
        }
    }

    /// Network failures currently inside the window
    pub fn failures_in_window(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        state
            .failures
            .iter()
            .filter(|at| now.duration_since(**at) <= self.interval)
            .count()
    }

    /// Whether the threshold action has been dispatched
    pub fn is_tripped(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tripped
    }

    /// Forget all failures and flags
    pub fn reset(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = WindowState::default();
        self.unique_unavailable.clear();
        self.text_search_unavailable.clear();
    }

    /// Note that a unique index could not be built on a collection
    pub fn mark_unique_unavailable(&self, collection: &str) {
        if self.unique_unavailable.insert(collection.to_string()) {
            tracing::warn!(collection, "unique index unavailable, degraded uniqueness");
        }
    }

    /// Whether a unique index failed on the collection
    pub fn unique_unavailable(&self, collection: &str) -> bool {
        self.unique_unavailable.contains(collection)
    }

    /// Note that a text index could not be built on a collection
    pub fn mark_text_search_unavailable(&self, collection: &str) {
        if self.text_search_unavailable.insert(collection.to_string()) {
            tracing::warn!(collection, "text index unavailable, search uses prefix match");
        }
    }

    /// Whether a text index failed on the collection
    pub fn text_search_unavailable(&self, collection: &str) -> bool {
        self.text_search_unavailable.contains(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Mock action that counts invocations
    struct MockAction {
        calls: AtomicU64,
        last_failures: AtomicU64,
    }

    impl MockAction {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
                last_failures: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ThresholdAction for MockAction {
        async fn on_threshold(&self, report: FailureReport) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_failures
                .store(report.failures as u64, Ordering::SeqCst);
        }
    }

    fn config(max_failures: Option<u32>, interval_secs: u64) -> HealthConfig {
        HealthConfig {
            max_failures,
            interval_secs,
            ..HealthConfig::default()
        }
    }

    #[tokio::test]
    async fn threshold_dispatches_once() {
        let action = Arc::new(MockAction::new());
        let monitor = HealthMonitor::new(config(Some(2), 600), action.clone());

        assert!(monitor.record_failure(&DatabaseErrorKind::ConnectionFailed));
        assert!(monitor.record_failure(&DatabaseErrorKind::Timeout));
        assert!(!monitor.is_tripped());
        monitor.record_failure(&DatabaseErrorKind::ConnectionFailed);
        monitor.record_failure(&DatabaseErrorKind::ConnectionFailed);

        // Give tokio::spawn a moment to execute
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(monitor.is_tripped());
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
        assert_eq!(action.last_failures.load(Ordering::SeqCst), 3);
        assert_eq!(monitor.failures_in_window(), 4);
    }

    #[tokio::test]
    async fn non_network_failures_are_ignored() {
        let action = Arc::new(MockAction::new());
        let monitor = HealthMonitor::new(config(Some(0), 600), action.clone());

        assert!(!monitor.record_failure(&DatabaseErrorKind::DuplicateKey));
        assert!(!monitor.record_failure(&DatabaseErrorKind::QueryFailed));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(monitor.failures_in_window(), 0);
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_threshold_still_counts() {
        let action = Arc::new(MockAction::new());
        let monitor = HealthMonitor::new(config(None, 600), action.clone());

        for _ in 0..10 {
            monitor.record_failure(&DatabaseErrorKind::ConnectionFailed);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(monitor.failures_in_window(), 10);
        assert!(!monitor.is_tripped());
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn old_failures_leave_the_window() {
        let action = Arc::new(MockAction::new());
        let monitor = HealthMonitor::new(config(Some(1), 0), action.clone());

        monitor.record_failure(&DatabaseErrorKind::ConnectionFailed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.record_failure(&DatabaseErrorKind::ConnectionFailed);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!monitor.is_tripped());
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sticky_flags_and_reset() {
        let monitor = HealthMonitor::noop();
        assert!(!monitor.unique_unavailable("states"));

        monitor.mark_unique_unavailable("states");
        monitor.mark_unique_unavailable("states");
        monitor.mark_text_search_unavailable("states");
        assert!(monitor.unique_unavailable("states"));
        assert!(!monitor.unique_unavailable("auditlog"));
        assert!(monitor.text_search_unavailable("states"));

        monitor.record_failure(&DatabaseErrorKind::Timeout);
        monitor.reset();
        assert!(!monitor.unique_unavailable("states"));
        assert!(!monitor.text_search_unavailable("states"));
        assert_eq!(monitor.failures_in_window(), 0);
    }

    #[test]
    fn global_is_shared() {
        let a = HealthMonitor::global();
        let b = HealthMonitor::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
