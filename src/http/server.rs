//! HTTP server implementation.

use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::with_rate_limit;
use crate::error::{Result, SentinelError};
use crate::ratelimit::RateLimiter;

/// HTTP server that puts its routes behind the rate limiter.
///
/// `/health` is served outside the limiter so load balancer health checks are never
/// rejected. Everything else goes through it.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Routes admitted through the rate limiter
    routes: Router,
}

impl HttpServer {
    /// Create a new HTTP server serving `/check` behind the limiter.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            addr,
            rate_limiter,
            routes: Router::new().route("/check", get(check)),
        }
    }

    /// Replace the limited routes with `routes`.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = routes;
        self
    }

    /// The full router: `/health` plus the limited routes.
    pub fn router(&self) -> Router {
        let limited = with_rate_limit(self.routes.clone(), Arc::clone(&self.rate_limiter));
        Router::new().route("/health", get(health)).merge(limited)
    }

    /// Bind the configured address and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            SentinelError::Io(e)
        })?;
        self.serve_listener(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_listener<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            SentinelError::Io(e)
        })
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

/// Answers 200 to every request the limiter admits.
async fn check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "admitted" }))
}
