//! Request dispatch for the API server.
//!
//! Routes are matched by exact path. Health and metrics endpoints keep
//! answering during shutdown; every other route is refused once the server
//! has stopped accepting new requests.

use crate::metrics::MetricsCollector;
use crate::server::healthz::InstalledChecks;
use crate::server::lifecycle::Signaled;
use crate::util::RequestId;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Header carrying the request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Path the prometheus metrics are served under.
pub const METRICS_PATH: &str = "/metrics";

/// Route label used for requests that matched no route.
const UNMATCHED_ROUTE: &str = "unmatched";

/// Response type produced by every endpoint.
pub type HttpResponse = Response<Full<Bytes>>;

/// Errors raised while registering routes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("a handler is already registered for path '{0}'")]
    DuplicateRoute(String),

    #[error("invalid route path '{0}': must start with '/'")]
    InvalidPath(String),
}

/// Something that answers requests for a route.
pub trait Endpoint: Send + Sync {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, HttpResponse>;
}

/// An [`Endpoint`] backed by an async closure.
pub struct FnEndpoint<F>(F);

impl<F, Fut> Endpoint for FnEndpoint<F>
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, HttpResponse> {
        Box::pin((self.0)(req))
    }
}

/// Wrap an async closure as an [`Endpoint`].
pub fn endpoint_fn<F, Fut>(f: F) -> FnEndpoint<F>
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync,
    Fut: Future<Output = HttpResponse> + Send + 'static,
{
    FnEndpoint(f)
}

#[derive(Clone)]
struct Route {
    endpoint: Arc<dyn Endpoint>,
    /// Served even after the server stops accepting new requests.
    always_serve: bool,
}

/// Path-keyed route table shared by every connection.
pub struct ServerHandler {
    routes: RwLock<HashMap<String, Route>>,
    shutting_down: Signaled,
    metrics: MetricsCollector,
}

impl ServerHandler {
    /// Create a handler with the metrics endpoint registered.
    pub fn new(shutting_down: Signaled, metrics: MetricsCollector) -> Self {
        let mut routes = HashMap::new();
        routes.insert(
            METRICS_PATH.to_string(),
            Route {
                endpoint: Arc::new(MetricsEndpoint {
                    metrics: metrics.clone(),
                }),
                always_serve: true,
            },
        );

        Self {
            routes: RwLock::new(routes),
            shutting_down,
            metrics,
        }
    }

    /// Register an application route.
    pub fn add_route<E>(&self, path: &str, endpoint: E) -> Result<(), HandlerError>
    where
        E: Endpoint + 'static,
    {
        self.insert(path, Arc::new(endpoint), false)
    }

    /// Expose an installed check set under `/<endpoint>`.
    pub fn install_health(&self, checks: InstalledChecks) -> Result<(), HandlerError> {
        let path = format!("/{}", checks.endpoint());
        let endpoint = HealthEndpoint {
            checks,
            metrics: self.metrics.clone(),
        };
        self.insert(&path, Arc::new(endpoint), true)
    }

    fn insert(
        &self,
        path: &str,
        endpoint: Arc<dyn Endpoint>,
        always_serve: bool,
    ) -> Result<(), HandlerError> {
        if !path.starts_with('/') {
            return Err(HandlerError::InvalidPath(path.to_string()));
        }

        let mut routes = self.routes.write();
        if routes.contains_key(path) {
            return Err(HandlerError::DuplicateRoute(path.to_string()));
        }
        routes.insert(
            path.to_string(),
            Route {
                endpoint,
                always_serve,
            },
        );

        debug!(path = %path, always_serve, "route registered");
        Ok(())
    }

    /// Registered paths, sorted.
    pub fn routes(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Dispatch a request.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<HttpResponse, Infallible> {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(RequestId::from_string)
            .unwrap_or_default();

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let route = self.routes.read().get(&path).cloned();

        let (label, mut response) = match route {
            None => (
                UNMATCHED_ROUTE,
                text_response(StatusCode::NOT_FOUND, "Not found\n"),
            ),
            Some(route) if !route.always_serve && self.shutting_down.is_signaled() => {
                let mut response =
                    text_response(StatusCode::SERVICE_UNAVAILABLE, "server is shutting down\n");
                response
                    .headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("close"));
                (path.as_str(), response)
            }
            Some(route) => {
                let timer = self.metrics.start_request_timer(&path);
                let response = route.endpoint.call(req).await;
                timer.record(method.as_str(), response.status().as_u16());

                debug!(
                    request_id = %request_id,
                    method = %method,
                    path = %path,
                    status = response.status().as_u16(),
                    "request completed"
                );
                return Ok(with_request_id(response, &request_id));
            }
        };

        self.metrics
            .record_rejected(label, method.as_str(), response.status().as_u16());
        debug!(
            request_id = %request_id,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            "request rejected"
        );

        response = with_request_id(response, &request_id);
        Ok(response)
    }
}

fn with_request_id(mut response: HttpResponse, request_id: &RequestId) -> HttpResponse {
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Build a plain text response.
pub fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn method_allowed(method: &Method) -> bool {
    method == Method::GET || method == Method::HEAD
}

/// Serves the aggregate result of an installed check set.
struct HealthEndpoint {
    checks: InstalledChecks,
    metrics: MetricsCollector,
}

impl HealthEndpoint {
    fn respond(&self) -> HttpResponse {
        let report = self.checks.evaluate();
        for check in report.failing() {
            self.metrics
                .record_health_check_failure(self.checks.endpoint(), check);
        }

        let status = if report.is_up() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };

        match serde_json::to_vec(&report) {
            Ok(body) => {
                let mut response = Response::new(Full::new(Bytes::from(body)));
                *response.status_mut() = status;
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(e) => {
                error!(error = %e, endpoint = self.checks.endpoint(), "failed to encode health report");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode health report\n")
            }
        }
    }
}

impl Endpoint for HealthEndpoint {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, HttpResponse> {
        let response = if method_allowed(req.method()) {
            self.respond()
        } else {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n")
        };
        Box::pin(futures::future::ready(response))
    }
}

/// Serves prometheus text format.
struct MetricsEndpoint {
    metrics: MetricsCollector,
}

impl MetricsEndpoint {
    fn respond(&self) -> HttpResponse {
        match self.metrics.encode() {
            Ok(buffer) => {
                let mut response = Response::new(Full::new(Bytes::from(buffer)));
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                );
                response
            }
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n")
            }
        }
    }
}

impl Endpoint for MetricsEndpoint {
    fn call(&self, req: Request<Incoming>) -> BoxFuture<'static, HttpResponse> {
        let response = if method_allowed(req.method()) {
            self.respond()
        } else {
            text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n")
        };
        Box::pin(futures::future::ready(response))
    }
}
