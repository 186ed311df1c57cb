//! Settings used to construct a [`GenericServer`](crate::server::GenericServer).

use crate::config::ShutdownConfig;
use crate::server::healthz::{HealthChecker, LivenessCheck, ReadinessCheck};
use crate::server::serving::ServingInfo;
use std::sync::Arc;
use std::time::Duration;

/// Server construction settings.
pub struct ServerConfig {
    /// Initial `/livez` checks. More can be added until the endpoint is installed.
    pub livez_checks: Vec<Arc<dyn HealthChecker>>,

    /// Initial `/readyz` checks. More can be added until the endpoint is installed.
    pub readyz_checks: Vec<Arc<dyn HealthChecker>>,

    /// Hard deadline for draining connections once new requests are refused.
    pub shutdown_timeout: Duration,

    /// How long to keep serving after shutdown starts, while `/readyz` fails.
    pub shutdown_delay_duration: Duration,

    /// The bound listener. Running without one fails.
    pub serving: Option<ServingInfo>,
}

impl ServerConfig {
    /// Defaults: the liveness and readiness checks in both sets, a 60 second
    /// shutdown timeout and no shutdown delay.
    pub fn new() -> Self {
        let defaults: Vec<Arc<dyn HealthChecker>> =
            vec![Arc::new(LivenessCheck), Arc::new(ReadinessCheck)];
        let shutdown = ShutdownConfig::default();

        Self {
            livez_checks: defaults.clone(),
            readyz_checks: defaults,
            shutdown_timeout: shutdown.timeout,
            shutdown_delay_duration: shutdown.delay_duration,
            serving: None,
        }
    }

    /// Take shutdown timing from file configuration.
    pub fn with_shutdown(mut self, shutdown: &ShutdownConfig) -> Self {
        self.shutdown_timeout = shutdown.timeout;
        self.shutdown_delay_duration = shutdown.delay_duration;
        self
    }

    /// Serve on the given listener.
    pub fn with_serving(mut self, serving: ServingInfo) -> Self {
        self.serving = Some(serving);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
