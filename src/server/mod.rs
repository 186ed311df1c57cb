//! The API server runtime: lifecycle signals, health gating, request
//! dispatch, serving, and the phased shutdown that ties them together.

mod config;
mod genericserver;
mod handler;
mod healthz;
mod lifecycle;
mod serving;

pub use config::ServerConfig;
pub use genericserver::{BoxError, GenericServer, PreparedGenericServer, ServerError};
pub use handler::{
    endpoint_fn, text_response, Endpoint, FnEndpoint, HandlerError, HttpResponse, ServerHandler,
    METRICS_PATH, REQUEST_ID_HEADER,
};
pub use healthz::{
    named_check, ComponentHealth, HealthCheckError, HealthChecker, HealthChecks, HealthError,
    HealthReport, HealthStatus, InstalledChecks, LivenessCheck, ReadinessCheck, ShutdownCheck,
};
pub use lifecycle::{FireGuard, LifecycleSignals, Signal, Signaled};
pub use serving::{run_server, ServeError, ServeHandles, ServingInfo, DEFAULT_KEEP_ALIVE_PERIOD};
