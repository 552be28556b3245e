//! HTTP adapter for the test orchestrator.

use std::any::Any;
use std::future::Future;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use orchestrator::TestOrchestrator;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

pub mod endpoints;
pub mod error;

pub use error::{ApiError, ApiFailure};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: TestOrchestrator,
}

impl ApiState {
    pub fn new(orchestrator: TestOrchestrator) -> Self {
        Self { orchestrator }
    }
}

pub fn create_router(state: ApiState) -> Router {
    let routes = Router::new()
        .route("/health", get(endpoints::admin::health_check))
        .route("/stats", get(endpoints::admin::stats))
        .route(
            "/tests",
            get(endpoints::lifecycle::list_tests).post(endpoints::lifecycle::create_test),
        )
        .route("/tests/:id", get(endpoints::lifecycle::get_test))
        .route("/tests/:id/start", post(endpoints::lifecycle::start_test))
        .route(
            "/tests/:id/schedule",
            post(endpoints::lifecycle::schedule_test),
        )
        .route("/tests/:id/cancel", post(endpoints::lifecycle::cancel_test))
        .route(
            "/tests/:id/restart",
            post(endpoints::lifecycle::restart_test),
        )
        .route(
            "/tests/:id/results",
            post(endpoints::lifecycle::save_results),
        )
        .with_state(state);

    with_layers(routes)
}

fn with_layers(router: Router) -> Router {
    router
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

/// Handler panics become a generic 500 instead of a dropped connection
fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "Request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(
            "unexpected_failure",
            "an unexpected error occurred",
        )),
    )
        .into_response()
}

/// Serve the API on `listener` until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "API listening");
    }
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_panicking_handler_returns_structured_500() {
        async fn boom() -> &'static str {
            panic!("handler exploded")
        }
        let app = with_layers(Router::new().route("/boom", get(boom)));

        let response = app
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: ApiError = serde_json::from_slice(&body).unwrap();
        assert_eq!(error.error, "unexpected_failure");
    }
}
