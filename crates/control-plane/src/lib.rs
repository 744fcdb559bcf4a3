// Runloop Control Plane Library
// Decision: Shared library for binaries (API server, contract checker) and router tests

pub mod api;
pub mod config;
pub mod dev_driver;
pub mod openapi;
pub mod state;

pub use config::ServerConfig;
pub use state::AppState;

use axum::http::{header, HeaderValue, Method};
use axum::{routing::get, Json, Router};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

/// Build the full HTTP application: API routes, OpenAPI document, CORS and tracing
pub fn app(state: AppState, cors_origins: Vec<HeaderValue>) -> Router {
    let app = api::routes(state).route(
        "/api-doc/openapi.json",
        get(|| async { Json(openapi::ApiDoc::openapi()) }),
    );

    // Add CORS layer only if origins are configured
    let app = if !cors_origins.is_empty() {
        app.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(cors_origins))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN]),
        )
    } else {
        app
    };

    app.layer(TraceLayer::new_for_http())
}
