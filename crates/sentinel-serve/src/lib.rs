//! Sentinel Serve - HTTP read endpoint for pipeline counters.
//!
//! Exposes the [`CounterStore`](sentinel_store::CounterStore) shared with the
//! relay stages as a JSON object. The endpoint is read-only and
//! unauthenticated; bind it to an internal address.
//!
//! # Architecture
//!
//! - **AppState**: shared counter store handle
//! - **Routes**: `GET /stats` plus a JSON 404 fallback
//! - **serve**: binds, traces requests, and stops on cancellation

mod error;
mod routes;
mod state;

use axum::http::Request;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Level;

pub use self::error::ApiError;
pub use self::routes::router;
pub use self::state::AppState;

/// Serve the stats API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state).layer(TraceLayer::new_for_http().make_span_with(
        |request: &Request<_>| {
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %request.uri().path(),
                query = request.uri().query().unwrap_or("")
            )
        },
    ));

    tracing::info!(addr = ?listener.local_addr().ok(), "starting stats server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("stats server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sentinel_store::CounterStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_serve_answers_and_shuts_down() {
        let counters = Arc::new(CounterStore::in_memory());
        counters.incr("monitor|certstream|cert_cnt").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve(listener, AppState::new(counters), shutdown.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""monitor|certstream|cert_cnt":1"#));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
