use axum::{response::IntoResponse, routing::get, Router};

async fn ok() -> impl IntoResponse {
    "ok"
}

/// A single fallback route: any path returns 200 "ok". No other HTTP
/// surface is exposed.
pub fn create_app() -> Router {
    Router::new().fallback(get(ok))
}
