//! The generic API server and its shutdown sequence.
//!
//! [`GenericServer`] is wired first (checks, routes, pre-shutdown hooks), then
//! [`prepare_run`](GenericServer::prepare_run) installs the health endpoints
//! and [`PreparedGenericServer::run`] serves until the stop trigger fires and
//! the shutdown sequence has run to completion:
//!
//! 1. `ShutdownInitiated` fires as soon as the stop trigger does; `/readyz`
//!    starts failing right away.
//! 2. Pre-shutdown hooks run; `PreShutdownHooksStopped` fires when they return.
//! 3. `AfterShutdownDelayDuration` fires once the shutdown delay has elapsed.
//! 4. `NotAcceptingNewRequest` fires after both 2 and 3. The listener closes
//!    and open connections drain, bounded by the shutdown timeout.
//! 5. `run` returns once the accept loop has stopped and the drain is done.

use crate::metrics::MetricsCollector;
use crate::server::config::ServerConfig;
use crate::server::handler::{HandlerError, ServerHandler};
use crate::server::healthz::{HealthChecker, HealthChecks, HealthError, ShutdownCheck};
use crate::server::lifecycle::{LifecycleSignals, Signal, Signaled};
use crate::server::serving::{ServeError, ServeHandles, ServingInfo};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Error type returned by pre-shutdown hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type PreShutdownHookFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Errors that can occur while wiring or starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error("invalid pre-shutdown hook: {0}")]
    InvalidHook(String),
}

struct PreShutdownHook {
    name: String,
    hook: PreShutdownHookFn,
}

/// A server instance: its routes, health checks and lifecycle signals.
pub struct GenericServer {
    shutdown_timeout: Duration,
    shutdown_delay_duration: Duration,
    serving: Option<ServingInfo>,
    handler: Arc<ServerHandler>,
    metrics: MetricsCollector,
    livez: HealthChecks,
    readyz: HealthChecks,
    lifecycle_signals: LifecycleSignals,
    pre_shutdown_hooks: Mutex<Vec<PreShutdownHook>>,
}

impl GenericServer {
    /// Build a server from its configuration.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let lifecycle_signals = LifecycleSignals::new();
        let metrics = MetricsCollector::new();
        for signal in lifecycle_signals.all() {
            metrics.set_signal(signal.name(), false);
        }

        let handler = Arc::new(ServerHandler::new(
            lifecycle_signals.shutting_down(),
            metrics.clone(),
        ));

        let livez = HealthChecks::new("livez");
        livez.add_checks(config.livez_checks)?;
        let readyz = HealthChecks::new("readyz");
        readyz.add_checks(config.readyz_checks)?;

        Ok(Self {
            shutdown_timeout: config.shutdown_timeout,
            shutdown_delay_duration: config.shutdown_delay_duration,
            serving: config.serving,
            handler,
            metrics,
            livez,
            readyz,
            lifecycle_signals,
            pre_shutdown_hooks: Mutex::new(Vec::new()),
        })
    }

    /// The route table, for registering application routes.
    pub fn handler(&self) -> &Arc<ServerHandler> {
        &self.handler
    }

    /// The metrics collector.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The lifecycle signals of this server.
    pub fn lifecycle_signals(&self) -> &LifecycleSignals {
        &self.lifecycle_signals
    }

    /// Fires once the server has stopped accepting new requests.
    pub fn shutting_down(&self) -> Signaled {
        self.lifecycle_signals.shutting_down()
    }

    /// The `/livez` check set.
    pub fn livez(&self) -> &HealthChecks {
        &self.livez
    }

    /// The `/readyz` check set.
    pub fn readyz(&self) -> &HealthChecks {
        &self.readyz
    }

    /// Add checks to `/livez`. Fails once the endpoint is installed.
    pub fn add_livez_checks<I>(&self, checks: I) -> Result<(), ServerError>
    where
        I: IntoIterator<Item = Arc<dyn HealthChecker>>,
    {
        self.livez.add_checks(checks)?;
        Ok(())
    }

    /// Add checks to `/readyz`. Fails once the endpoint is installed.
    pub fn add_readyz_checks<I>(&self, checks: I) -> Result<(), ServerError>
    where
        I: IntoIterator<Item = Arc<dyn HealthChecker>>,
    {
        self.readyz.add_checks(checks)?;
        Ok(())
    }

    /// Make `/readyz` fail as soon as `shutdown` fires.
    pub fn add_readyz_shutdown_check(&self, shutdown: Signaled) -> Result<(), ServerError> {
        self.add_readyz_checks([Arc::new(ShutdownCheck::new(shutdown)) as Arc<dyn HealthChecker>])
    }

    /// Expose `/livez`. Further `/livez` checks are rejected afterwards.
    pub fn install_livez(&self) -> Result<(), ServerError> {
        let installed = self.livez.install()?;
        self.handler.install_health(installed)?;
        Ok(())
    }

    /// Expose `/readyz`. Further `/readyz` checks are rejected afterwards.
    pub fn install_readyz(&self) -> Result<(), ServerError> {
        let installed = self.readyz.install()?;
        self.handler.install_health(installed)?;
        Ok(())
    }

    /// Register a hook that runs once shutdown is initiated and must return
    /// before the server stops accepting new requests.
    ///
    /// Hooks run concurrently. A failing or panicking hook is logged and does
    /// not hold up the shutdown.
    pub fn add_pre_shutdown_hook<F, Fut>(
        &self,
        name: impl Into<String>,
        hook: F,
    ) -> Result<(), ServerError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(ServerError::InvalidHook(
                "hook name cannot be empty".to_string(),
            ));
        }

        let mut hooks = self.pre_shutdown_hooks.lock();
        if hooks.iter().any(|h| h.name == name) {
            return Err(ServerError::InvalidHook(format!(
                "a hook named '{name}' is already registered"
            )));
        }

        hooks.push(PreShutdownHook {
            name,
            hook: Box::new(move || Box::pin(hook())),
        });
        Ok(())
    }

    /// Install the health endpoints and return a server ready to run.
    pub fn prepare_run(self) -> Result<PreparedGenericServer, ServerError> {
        self.install_livez()?;

        // As soon as shutdown is initiated, readiness should start failing.
        self.add_readyz_shutdown_check(self.lifecycle_signals.shutdown_initiated.signaled())?;
        self.install_readyz()?;

        info!(routes = ?self.handler.routes(), "server prepared");
        Ok(PreparedGenericServer { server: self })
    }

    /// Release resources owned by the server. Runs when `run` returns.
    fn destroy(&self) {
        info!("server resources released");
    }
}

fn fire(metrics: &MetricsCollector, signal: &Signal) {
    signal.fire();
    metrics.set_signal(signal.name(), true);
}

/// A server whose health endpoints are installed.
pub struct PreparedGenericServer {
    server: GenericServer,
}

impl Deref for PreparedGenericServer {
    type Target = GenericServer;

    fn deref(&self) -> &GenericServer {
        &self.server
    }
}

impl PreparedGenericServer {
    /// Serve until `stop` fires and the shutdown sequence completes.
    ///
    /// Fails before any lifecycle signal fires if there is no listener.
    pub async fn run(mut self, stop: Signaled) -> Result<(), ServerError> {
        let result = self.run_until_stopped(stop).await;
        self.server.destroy();
        result
    }

    async fn run_until_stopped(&mut self, stop: Signaled) -> Result<(), ServerError> {
        let signals = self.server.lifecycle_signals.clone();
        let mut tasks = JoinSet::new();

        let serve = self.non_blocking_run(
            signals.not_accepting_new_request.signaled(),
            &mut tasks,
        )?;

        // Fire ShutdownInitiated on the stop trigger, then AfterShutdownDelayDuration
        // once the delay has elapsed.
        let delay = self.server.shutdown_delay_duration;
        let metrics = self.server.metrics.clone();
        let delay_signals = signals.clone();
        tasks.spawn(async move {
            stop.wait().await;
            info!(delay = ?delay, "shutdown initiated");
            fire(&metrics, &delay_signals.shutdown_initiated);

            tokio::time::sleep(delay).await;
            fire(&metrics, &delay_signals.after_shutdown_delay_duration);
        });

        // Run the pre-shutdown hooks once shutdown is initiated.
        let hooks = std::mem::take(&mut *self.server.pre_shutdown_hooks.lock());
        let metrics = self.server.metrics.clone();
        let hook_signals = signals.clone();
        tasks.spawn(async move {
            hook_signals.shutdown_initiated.signaled().wait().await;
            run_pre_shutdown_hooks(hooks).await;
            fire(&metrics, &hook_signals.pre_shutdown_hooks_stopped);
        });

        // Stop accepting new requests once the delay has elapsed and the hooks
        // have returned.
        let metrics = self.server.metrics.clone();
        let gate_signals = signals.clone();
        tasks.spawn(async move {
            gate_signals.after_shutdown_delay_duration.signaled().wait().await;
            gate_signals.pre_shutdown_hooks_stopped.signaled().wait().await;
            info!("no longer accepting new requests");
            fire(&metrics, &gate_signals.not_accepting_new_request);
        });

        // Wait for both the listener to stop and the connections to drain.
        serve.join().await;

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }

        for signal in signals.all() {
            if !signal.is_fired() {
                warn!(signal = signal.name(), "server stopped before signal fired");
            }
        }

        info!("server stopped");
        Ok(())
    }

    /// Start serving without blocking. Serving stops once `stop` fires.
    fn non_blocking_run(
        &mut self,
        stop: Signaled,
        tasks: &mut JoinSet<()>,
    ) -> Result<ServeHandles, ServerError> {
        let serving = self.server.serving.take().ok_or(ServeError::NoListener)?;
        info!(
            address = %serving.local_addr(),
            shutdown_timeout = ?self.server.shutdown_timeout,
            "serving"
        );

        // An internal trigger lets the listener be torn down independently of
        // the caller's signal.
        let internal_stop = Signal::new("StopServing");
        let handles = serving.serve(
            Arc::clone(&self.server.handler),
            self.server.metrics.clone(),
            self.server.shutdown_timeout,
            internal_stop.signaled(),
        );

        tasks.spawn(async move {
            stop.wait().await;
            internal_stop.fire();
        });

        Ok(handles)
    }
}

async fn run_pre_shutdown_hooks(hooks: Vec<PreShutdownHook>) {
    if hooks.is_empty() {
        return;
    }

    info!(count = hooks.len(), "running pre-shutdown hooks");

    let mut running = JoinSet::new();
    for PreShutdownHook { name, hook } in hooks {
        running.spawn(async move {
            let start = Instant::now();
            let result = hook().await;
            (name, result, start.elapsed())
        });
    }

    while let Some(joined) = running.join_next().await {
        match joined {
            Ok((name, Ok(()), elapsed)) => {
                info!(hook = %name, elapsed_ms = elapsed.as_millis(), "pre-shutdown hook completed");
            }
            Ok((name, Err(e), _)) => {
                error!(hook = %name, error = %e, "pre-shutdown hook failed");
            }
            Err(e) => {
                error!(error = %e, "pre-shutdown hook panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::healthz::named_check;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    async fn server(delay: Duration) -> GenericServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            shutdown_delay_duration: delay,
            shutdown_timeout: Duration::from_secs(5),
            ..ServerConfig::new()
        }
        .with_serving(ServingInfo::from_listener(listener).unwrap());
        GenericServer::new(config).unwrap()
    }

    fn start(
        prepared: PreparedGenericServer,
    ) -> (Signal, LifecycleSignals, JoinHandle<Result<(), ServerError>>) {
        let stop = Signal::new("stop");
        let signals = prepared.lifecycle_signals().clone();
        let handle = tokio::spawn(prepared.run(stop.signaled()));
        (stop, signals, handle)
    }

    /// Let every spawned task run until it blocks.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn failing_hook() -> Result<(), BoxError> {
        Err("lease not found".into())
    }

    async fn panicking_hook() -> Result<(), BoxError> {
        panic!("hook bug")
    }

    fn fired(signals: &LifecycleSignals) -> [bool; 4] {
        signals.all().map(|s| s.is_fired())
    }

    #[tokio::test]
    async fn test_run_without_listener_fails_fast() {
        let server = GenericServer::new(ServerConfig::new()).unwrap();
        let prepared = server.prepare_run().unwrap();
        let signals = prepared.lifecycle_signals().clone();

        let stop = Signal::new("stop");
        stop.fire();
        let result = prepared.run(stop.signaled()).await;

        assert!(matches!(result, Err(ServerError::Serve(ServeError::NoListener))));
        assert_eq!(fired(&signals), [false; 4]);
    }

    #[tokio::test]
    async fn test_prepare_run_installs_endpoints() {
        let prepared = server(Duration::ZERO).await.prepare_run().unwrap();

        assert!(prepared.livez().is_installed());
        assert!(prepared.readyz().is_installed());
        assert_eq!(
            prepared.readyz().names(),
            vec!["liveness", "readiness", "shutdown"]
        );
        assert_eq!(prepared.livez().names(), vec!["liveness", "readiness"]);
        assert_eq!(
            prepared.handler().routes(),
            vec!["/livez", "/metrics", "/readyz"]
        );
    }

    #[tokio::test]
    async fn test_checks_rejected_after_install() {
        let server = server(Duration::ZERO).await;
        server
            .add_readyz_checks([named_check("db", || Ok(()))])
            .unwrap();
        server.install_readyz().unwrap();

        let result = server.add_readyz_checks([named_check("late", || Ok(()))]);
        assert!(matches!(
            result,
            Err(ServerError::Health(HealthError::AlreadyInstalled { endpoint: "readyz" }))
        ));
        assert_eq!(server.readyz().names(), vec!["liveness", "readiness", "db"]);

        // The shutdown check can no longer be wired in either.
        assert!(server.prepare_run().is_err());
    }

    #[tokio::test]
    async fn test_hook_registration() {
        let server = server(Duration::ZERO).await;
        server
            .add_pre_shutdown_hook("deregister", || async { Ok::<(), BoxError>(()) })
            .unwrap();

        assert!(matches!(
            server.add_pre_shutdown_hook("deregister", failing_hook),
            Err(ServerError::InvalidHook(_))
        ));
        assert!(matches!(
            server.add_pre_shutdown_hook("", failing_hook),
            Err(ServerError::InvalidHook(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_fails_before_delay_elapses() {
        let prepared = server(Duration::from_secs(10)).await.prepare_run().unwrap();
        let readyz = prepared.readyz().installed().unwrap();
        let shutting_down = prepared.shutting_down();
        let (stop, signals, handle) = start(prepared);

        settle().await;
        assert!(readyz.evaluate().is_up());

        stop.fire();
        settle().await;

        let report = readyz.evaluate();
        assert!(!report.is_up());
        assert_eq!(report.failing().collect::<Vec<_>>(), vec!["shutdown"]);
        assert!(signals.shutdown_initiated.is_fired());
        assert!(signals.pre_shutdown_hooks_stopped.is_fired());
        assert!(!signals.after_shutdown_delay_duration.is_fired());
        assert!(!shutting_down.is_signaled());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!signals.after_shutdown_delay_duration.is_fired());
        assert!(!shutting_down.is_signaled());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(signals.after_shutdown_delay_duration.is_fired());
        assert!(shutting_down.is_signaled());

        handle.await.unwrap().unwrap();
        assert_eq!(fired(&signals), [true; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_still_waits_for_hooks() {
        let server = server(Duration::ZERO).await;
        let release = Signal::new("release");
        let released = release.signaled();
        server
            .add_pre_shutdown_hook("slow", move || async move {
                released.wait().await;
                Ok::<(), BoxError>(())
            })
            .unwrap();

        let (stop, signals, handle) = start(server.prepare_run().unwrap());
        stop.fire();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(signals.shutdown_initiated.is_fired());
        assert!(signals.after_shutdown_delay_duration.is_fired());
        assert!(!signals.pre_shutdown_hooks_stopped.is_fired());
        assert!(!signals.not_accepting_new_request.is_fired());

        release.fire();
        handle.await.unwrap().unwrap();
        assert_eq!(fired(&signals), [true; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_longer_than_delay() {
        let server = server(Duration::from_secs(1)).await;
        let signals = server.lifecycle_signals().clone();
        let observed = signals.clone();
        let in_order = Arc::new(AtomicBool::new(false));
        let in_order_flag = Arc::clone(&in_order);
        server
            .add_pre_shutdown_hook("drain-queue", move || async move {
                let initiated = observed.shutdown_initiated.is_fired();
                tokio::time::sleep(Duration::from_secs(5)).await;
                in_order_flag.store(
                    initiated
                        && observed.after_shutdown_delay_duration.is_fired()
                        && !observed.not_accepting_new_request.is_fired(),
                    Ordering::SeqCst,
                );
                Ok::<(), BoxError>(())
            })
            .unwrap();

        let (stop, _, handle) = start(server.prepare_run().unwrap());
        stop.fire();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(signals.after_shutdown_delay_duration.is_fired());
        assert!(!signals.pre_shutdown_hooks_stopped.is_fired());
        assert!(!signals.not_accepting_new_request.is_fired());

        handle.await.unwrap().unwrap();
        assert!(in_order.load(Ordering::SeqCst));
        assert_eq!(fired(&signals), [true; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_and_panicking_hooks_do_not_block_shutdown() {
        let server = server(Duration::ZERO).await;
        let ran = Arc::new(AtomicBool::new(false));
        let ran_flag = Arc::clone(&ran);

        server.add_pre_shutdown_hook("fails", failing_hook).unwrap();
        server.add_pre_shutdown_hook("panics", panicking_hook).unwrap();
        server
            .add_pre_shutdown_hook("succeeds", move || async move {
                ran_flag.store(true, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            })
            .unwrap();

        let (stop, signals, handle) = start(server.prepare_run().unwrap());
        stop.fire();

        handle.await.unwrap().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(fired(&signals), [true; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_fires_without_stop() {
        let prepared = server(Duration::ZERO).await.prepare_run().unwrap();
        let (_stop, signals, handle) = start(prepared);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(fired(&signals), [false; 4]);
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_metrics_follow_lifecycle() {
        let prepared = server(Duration::ZERO).await.prepare_run().unwrap();
        let metrics = prepared.metrics().clone();
        let before = metrics.encode().unwrap();
        assert!(before.contains(r#"apiserve_lifecycle_signal{signal="NotAcceptingNewRequest"} 0"#));

        let (stop, _, handle) = start(prepared);
        stop.fire();
        handle.await.unwrap().unwrap();

        let after = metrics.encode().unwrap();
        for name in [
            "ShutdownInitiated",
            "AfterShutdownDelayDuration",
            "PreShutdownHooksStopped",
            "NotAcceptingNewRequest",
        ] {
            assert!(after.contains(&format!(r#"apiserve_lifecycle_signal{{signal="{name}"}} 1"#)));
        }
    }
}
