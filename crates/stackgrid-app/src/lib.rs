//! stackgrid-app — the hello workload a stack deploys.
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/` | `{"message": "Hello, World!!!"}` |
//! | GET | `/health` | `Ok` |
//!
//! The target pool's health check points at `/health`.

use axum::Router;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use tracing::info;

/// Port the container listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 3000;

/// Body of `GET /`, byte for byte. The space after the colon is part of
/// the contract; a compact serializer would drop it, so this is a literal.
pub const HELLO_BODY: &str = r#"{"message": "Hello, World!!!"}"#;

/// Body of `GET /health`.
pub const HEALTH_BODY: &str = "Ok";

pub fn router() -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/health", get(health))
}

/// GET /
pub async fn hello() -> impl IntoResponse {
    info!("request started");
    ([(header::CONTENT_TYPE, "application/json")], HELLO_BODY)
}

/// GET /health
pub async fn health() -> &'static str {
    HEALTH_BODY
}
