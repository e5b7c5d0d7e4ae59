use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderMap, HeaderValue, StatusCode};

use crate::server::AppState;

/// Handle Prometheus metrics scraping.
pub async fn prometheus_scrape(State(state): State<AppState>) -> (StatusCode, HeaderMap, String) {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; version=0.0.4"));
    let body = state.metrics.as_ref().map(|handle| handle.render()).unwrap_or_default();
    (StatusCode::OK, headers, body)
}
