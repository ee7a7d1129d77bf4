//! API route definitions.

mod stats;

use axum::Router;
use axum::http::Uri;
use axum::routing::get;

use crate::error::ApiError;
use crate::state::AppState;

/// Build the complete API router.
///
/// - `GET /stats` - every counter (optional `?prefix=`)
///
/// Any other path answers with a JSON 404.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stats", get(stats::counters))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use sentinel_store::CounterStore;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> AppState {
        let counters = CounterStore::in_memory();
        counters.incr("monitor|certstream|cert_cnt").unwrap();
        counters.incr("monitor|certstream|cert_cnt").unwrap();
        counters.incr("monitor|zdns_4hr|results").unwrap();
        AppState::new(Arc::new(counters))
    }

    async fn get_json(state: AppState, uri: &str) -> (StatusCode, Value) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_stats_returns_all_counters() {
        let (status, body) = get_json(test_state(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "monitor|certstream|cert_cnt": 2,
                "monitor|zdns_4hr|results": 1,
            })
        );
    }

    #[tokio::test]
    async fn test_stats_prefix_filter() {
        let (status, body) = get_json(test_state(), "/stats?prefix=monitor%7Czdns").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "monitor|zdns_4hr|results": 1 }));

        let (_, body) = get_json(test_state(), "/stats?prefix=nothing").await;
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn test_stats_empty_store() {
        let state = AppState::new(Arc::new(CounterStore::in_memory()));
        let (status, body) = get_json(state, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn test_unknown_path_is_json_404() {
        let (status, body) = get_json(test_state(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "no route for /nope");
    }
}
