//! Health checks and the gated check sets behind `/livez` and `/readyz`.
//!
//! Checks are collected into a [`HealthChecks`] set while the server is being
//! wired. Installing the set hands an immutable snapshot to the request path;
//! after that, adding more checks is rejected.

use crate::server::lifecycle::Signaled;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Errors raised while wiring health checks.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("unable to add {endpoint} checks: the endpoint has already been installed")]
    AlreadyInstalled { endpoint: &'static str },

    #[error("health check name cannot be empty")]
    EmptyName,
}

/// Reason a single check failed. Logged, never sent to clients.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HealthCheckError(String);

impl HealthCheckError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// A named health predicate.
pub trait HealthChecker: Send + Sync {
    /// Name reported in the aggregate response.
    fn name(&self) -> &str;

    /// Run the check.
    fn check(&self) -> Result<(), HealthCheckError>;
}

/// Always passes. Reports that the process is able to answer at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct LivenessCheck;

impl HealthChecker for LivenessCheck {
    fn name(&self) -> &str {
        "liveness"
    }

    fn check(&self) -> Result<(), HealthCheckError> {
        Ok(())
    }
}

/// Always passes. Placeholder readiness predicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadinessCheck;

impl HealthChecker for ReadinessCheck {
    fn name(&self) -> &str {
        "readiness"
    }

    fn check(&self) -> Result<(), HealthCheckError> {
        Ok(())
    }
}

/// Fails as soon as the wrapped signal has fired.
#[derive(Debug, Clone)]
pub struct ShutdownCheck {
    signaled: Signaled,
}

impl ShutdownCheck {
    pub fn new(signaled: Signaled) -> Self {
        Self { signaled }
    }
}

impl HealthChecker for ShutdownCheck {
    fn name(&self) -> &str {
        "shutdown"
    }

    fn check(&self) -> Result<(), HealthCheckError> {
        if self.signaled.is_signaled() {
            Err(HealthCheckError::new("process is shutting down"))
        } else {
            Ok(())
        }
    }
}

/// A check built from a closure.
pub struct NamedCheck<F> {
    name: String,
    check: F,
}

impl<F> HealthChecker for NamedCheck<F>
where
    F: Fn() -> Result<(), HealthCheckError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<(), HealthCheckError> {
        (self.check)()
    }
}

/// Wrap a closure as a [`HealthChecker`].
pub fn named_check<F>(name: impl Into<String>, check: F) -> Arc<dyn HealthChecker>
where
    F: Fn() -> Result<(), HealthCheckError> + Send + Sync + 'static,
{
    Arc::new(NamedCheck {
        name: name.into(),
        check,
    })
}

/// A set of checks that can be installed exactly once.
pub struct HealthChecks {
    endpoint: &'static str,
    inner: Mutex<ChecksInner>,
}

#[derive(Default)]
struct ChecksInner {
    checks: Vec<Arc<dyn HealthChecker>>,
    installed: Option<InstalledChecks>,
}

impl HealthChecks {
    /// Create an empty set for the given endpoint name (e.g. `readyz`).
    pub fn new(endpoint: &'static str) -> Self {
        Self {
            endpoint,
            inner: Mutex::new(ChecksInner::default()),
        }
    }

    /// Endpoint this set is served under.
    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    /// Append checks to the set.
    ///
    /// Fails without modifying the set if it has already been installed or if
    /// any check has an empty name.
    pub fn add_checks<I>(&self, checks: I) -> Result<(), HealthError>
    where
        I: IntoIterator<Item = Arc<dyn HealthChecker>>,
    {
        let checks: Vec<_> = checks.into_iter().collect();
        let mut inner = self.inner.lock();

        if inner.installed.is_some() {
            return Err(HealthError::AlreadyInstalled {
                endpoint: self.endpoint,
            });
        }
        if checks.iter().any(|c| c.name().is_empty()) {
            return Err(HealthError::EmptyName);
        }

        inner.checks.extend(checks);
        Ok(())
    }

    /// Mark the set installed and return the snapshot served to clients.
    pub fn install(&self) -> Result<InstalledChecks, HealthError> {
        let mut inner = self.inner.lock();

        if inner.installed.is_some() {
            return Err(HealthError::AlreadyInstalled {
                endpoint: self.endpoint,
            });
        }

        let installed = InstalledChecks {
            endpoint: self.endpoint,
            checks: inner.checks.iter().cloned().collect(),
        };
        inner.installed = Some(installed.clone());
        Ok(installed)
    }

    /// Whether [`install`](Self::install) has been called.
    pub fn is_installed(&self) -> bool {
        self.inner.lock().installed.is_some()
    }

    /// The snapshot handed out by [`install`](Self::install), if any.
    pub fn installed(&self) -> Option<InstalledChecks> {
        self.inner.lock().installed.clone()
    }

    /// Names of the registered checks, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .checks
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }
}

/// Immutable snapshot of an installed check set.
#[derive(Clone)]
pub struct InstalledChecks {
    endpoint: &'static str,
    checks: Arc<[Arc<dyn HealthChecker>]>,
}

impl InstalledChecks {
    /// Endpoint this snapshot is served under.
    pub fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    /// Run every check and aggregate the results.
    pub fn evaluate(&self) -> HealthReport {
        let mut components: BTreeMap<String, ComponentHealth> = BTreeMap::new();

        for checker in self.checks.iter() {
            let status = match checker.check() {
                Ok(()) => HealthStatus::Up,
                Err(e) => {
                    warn!(
                        endpoint = self.endpoint,
                        check = checker.name(),
                        reason = %e,
                        "health check failed"
                    );
                    HealthStatus::Down
                }
            };

            components
                .entry(checker.name().to_string())
                .and_modify(|c| {
                    if status == HealthStatus::Down {
                        c.status = HealthStatus::Down;
                    }
                })
                .or_insert(ComponentHealth { status });
        }

        let status = if components.values().all(|c| c.status == HealthStatus::Up) {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        };

        HealthReport { status, components }
    }
}

/// Up or down.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
}

/// Status of a single check.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentHealth {
    pub status: HealthStatus,
}

/// Aggregate health response body.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    pub fn is_up(&self) -> bool {
        self.status == HealthStatus::Up
    }

    /// Names of the checks that failed.
    pub fn failing(&self) -> impl Iterator<Item = &str> {
        self.components
            .iter()
            .filter(|(_, c)| c.status == HealthStatus::Down)
            .map(|(name, _)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::lifecycle::LifecycleSignals;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn defaults() -> Vec<Arc<dyn HealthChecker>> {
        vec![Arc::new(LivenessCheck), Arc::new(ReadinessCheck)]
    }

    #[test]
    fn test_builtin_checks_pass() {
        assert!(LivenessCheck.check().is_ok());
        assert!(ReadinessCheck.check().is_ok());
        assert_eq!(LivenessCheck.name(), "liveness");
        assert_eq!(ReadinessCheck.name(), "readiness");
    }

    #[test]
    fn test_add_then_install() {
        let checks = HealthChecks::new("readyz");
        checks.add_checks(defaults()).unwrap();
        assert_eq!(checks.names(), vec!["liveness", "readiness"]);
        assert!(!checks.is_installed());

        let installed = checks.install().unwrap();
        assert!(checks.is_installed());
        assert!(checks.installed().is_some());
        assert!(installed.evaluate().is_up());
        assert_eq!(installed.endpoint(), "readyz");
    }

    #[test]
    fn test_add_after_install_is_rejected() {
        for prior in 0..5 {
            let checks = HealthChecks::new("readyz");
            for i in 0..prior {
                checks
                    .add_checks([named_check(format!("check-{i}"), || Ok(()))])
                    .unwrap();
            }
            checks.install().unwrap();

            let result = checks.add_checks([named_check("late", || Ok(()))]);
            assert_eq!(
                result,
                Err(HealthError::AlreadyInstalled { endpoint: "readyz" })
            );
            assert_eq!(checks.names().len(), prior);
        }
    }

    #[test]
    fn test_install_twice_is_rejected() {
        let checks = HealthChecks::new("livez");
        checks.install().unwrap();
        assert!(matches!(
            checks.install(),
            Err(HealthError::AlreadyInstalled { endpoint: "livez" })
        ));
    }

    #[test]
    fn test_empty_name_is_rejected_atomically() {
        let checks = HealthChecks::new("readyz");
        let result = checks.add_checks([named_check("ok", || Ok(())), named_check("", || Ok(()))]);
        assert_eq!(result, Err(HealthError::EmptyName));
        assert!(checks.names().is_empty());
    }

    #[test]
    fn test_single_failure_marks_aggregate_down() {
        let checks = HealthChecks::new("readyz");
        checks.add_checks(defaults()).unwrap();
        checks
            .add_checks([named_check("database", || {
                Err(HealthCheckError::new("connection refused by 10.0.0.7"))
            })])
            .unwrap();

        let report = checks.install().unwrap().evaluate();
        assert!(!report.is_up());
        assert_eq!(report.failing().collect::<Vec<_>>(), vec!["database"]);
        assert_eq!(report.components["liveness"].status, HealthStatus::Up);
    }

    #[test]
    fn test_report_does_not_leak_reason() {
        let checks = HealthChecks::new("readyz");
        checks
            .add_checks([named_check("database", || {
                Err(HealthCheckError::new("password authentication failed"))
            })])
            .unwrap();

        let report = checks.install().unwrap().evaluate();
        let body = serde_json::to_string(&report).unwrap();
        assert_eq!(
            body,
            r#"{"status":"DOWN","components":{"database":{"status":"DOWN"}}}"#
        );
    }

    #[test]
    fn test_duplicate_names_keep_failure() {
        let checks = HealthChecks::new("readyz");
        checks
            .add_checks([
                named_check("cache", || Err(HealthCheckError::new("cold"))),
                named_check("cache", || Ok(())),
            ])
            .unwrap();

        let report = checks.install().unwrap().evaluate();
        assert_eq!(report.components["cache"].status, HealthStatus::Down);
        assert!(!report.is_up());
    }

    #[test]
    fn test_checks_are_evaluated_live() {
        let healthy = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&healthy);

        let checks = HealthChecks::new("readyz");
        checks
            .add_checks([named_check("toggle", move || {
                if flag.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    Err(HealthCheckError::new("toggled off"))
                }
            })])
            .unwrap();
        let installed = checks.install().unwrap();

        assert!(installed.evaluate().is_up());
        healthy.store(false, Ordering::SeqCst);
        assert!(!installed.evaluate().is_up());
    }

    #[test]
    fn test_shutdown_check_fails_once_initiated() {
        let signals = LifecycleSignals::new();
        let checks = HealthChecks::new("readyz");
        checks
            .add_checks([Arc::new(ShutdownCheck::new(signals.shutdown_initiated.signaled()))
                as Arc<dyn HealthChecker>])
            .unwrap();
        let installed = checks.install().unwrap();

        assert!(installed.evaluate().is_up());

        signals.shutdown_initiated.fire();
        let report = installed.evaluate();
        assert!(!report.is_up());
        assert_eq!(report.failing().collect::<Vec<_>>(), vec!["shutdown"]);

        // Later phases have not happened yet.
        assert!(!signals.after_shutdown_delay_duration.is_fired());
        assert!(!signals.shutting_down().is_signaled());
    }

    #[test]
    fn test_empty_set_is_up() {
        let checks = HealthChecks::new("livez");
        assert!(checks.install().unwrap().evaluate().is_up());
    }
}
