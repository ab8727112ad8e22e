//! Rate limiting middleware for axum routers.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::instrument;

use crate::config::LimiterSettings;
use crate::ratelimit::{ClientIdentity, Decision, RateLimiter, UNKNOWN_CLIENT};

/// Body of every rejected request.
pub const REJECTION_MESSAGE: &str =
    "You have reached the maximum number of requests or actions allowed within a certain time frame.";

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Wrap every route of `router` with the rate limiter.
pub fn with_rate_limit<S>(router: Router<S>, limiter: Arc<RateLimiter>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
}

/// Admit or reject a request before it reaches the wrapped handler.
#[instrument(
    skip(limiter, request, next),
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_identity(&request, limiter.settings());

    match limiter.check(&client).await {
        Decision::Allow => next.run(request).await,
        Decision::Deny => rejection(),
    }
}

/// The fixed "too many requests" response.
pub fn rejection() -> Response {
    (StatusCode::TOO_MANY_REQUESTS, REJECTION_MESSAGE).into_response()
}

/// Work out who sent `request`.
///
/// The address is the first `X-Forwarded-For` entry when forwarding headers
/// are trusted, otherwise the peer address of the connection. The token is
/// read from the configured header.
pub fn client_identity(request: &Request, settings: &LimiterSettings) -> ClientIdentity {
    let headers = request.headers();

    let address = settings
        .trust_forwarded_for
        .then(|| forwarded_for(headers))
        .flatten()
        .or_else(|| {
            request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.to_string())
        })
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

    let token = headers
        .get(settings.token_header.as_str())
        .and_then(|value| value.to_str().ok());

    ClientIdentity::new(&address, token)
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::LimitConfig;
    use crate::storage::{MemoryBackend, StorageManager};
    use axum::body::{to_bytes, Body};
    use axum::routing::get;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn settings(limit: u64, token_limit: u64) -> LimiterSettings {
        LimiterSettings::in_memory(
            LimitConfig {
                limit,
                window: Duration::from_secs(60),
            },
            LimitConfig {
                limit: token_limit,
                window: Duration::from_secs(60),
            },
        )
    }

    fn app(settings: LimiterSettings) -> (Router, Arc<RateLimiter>) {
        let storage = StorageManager::start(
            Arc::new(MemoryBackend::new()),
            settings.cleanup_interval,
            settings.ttl,
            CancellationToken::new(),
        );
        let limiter = Arc::new(RateLimiter::new(settings, storage));
        let router = Router::new().route("/", get(|| async { "ok" }));
        (with_rate_limit(router, limiter.clone()), limiter)
    }

    fn request(peer: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().uri("/");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut request = builder.body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        request
    }

    #[tokio::test]
    async fn test_admitted_requests_reach_handler() {
        let (app, _) = app(settings(2, 10));

        let response = app.oneshot(request("10.0.0.1:5000", &[])).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_rejection_response() {
        let (app, _) = app(settings(2, 10));

        for _ in 0..2 {
            let response = app.clone().oneshot(request("10.0.0.1:5000", &[])).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(request("10.0.0.1:5001", &[])).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], REJECTION_MESSAGE.as_bytes());
    }

    #[tokio::test]
    async fn test_token_header_selects_token_limit() {
        let (app, _) = app(settings(1, 3));
        let headers = [("API_KEY", "abc123")];

        for _ in 0..3 {
            let response = app.clone().oneshot(request("10.0.0.1:5000", &headers)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(request("10.0.0.1:5000", &headers)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_forwarded_for_identifies_client() {
        let (app, limiter) = app(settings(1, 10));

        let response = app
            .clone()
            .oneshot(request("10.0.0.1:5000", &[("X-Forwarded-For", "203.0.113.7, 10.0.0.1")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Same proxy, different origin client.
        let response = app
            .oneshot(request("10.0.0.1:5000", &[("X-Forwarded-For", "203.0.113.8")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let snapshot = limiter.snapshot().await;
        assert_eq!(snapshot.get("ip:203.0.113.7"), Some(&1));
        assert_eq!(snapshot.get("ip:203.0.113.8"), Some(&1));
        assert!(!snapshot.contains_key("10.0.0.1"));
    }

    #[test]
    fn test_untrusted_forwarded_for_is_ignored() {
        let mut settings = settings(1, 1);
        settings.trust_forwarded_for = false;

        let client = client_identity(
            &request("10.0.0.1:5000", &[("X-Forwarded-For", "203.0.113.7")]),
            &settings,
        );
        assert_eq!(client.address(), "10.0.0.1");
    }

    #[test]
    fn test_request_without_peer_still_classified() {
        let request = axum::http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();

        let client = client_identity(&request, &settings(1, 1));
        assert_eq!(client.address(), UNKNOWN_CLIENT);
        assert!(client.token().is_none());
    }
}
