//! Health surface for the relay: current watermark and seen-count over HTTP.

use std::future::Future;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use relay_core::StatusSnapshot;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub const CRATE_NAME: &str = "relay-web";

#[derive(Clone)]
pub struct AppState {
    pub status: watch::Receiver<StatusSnapshot>,
}

impl AppState {
    pub fn new(status: watch::Receiver<StatusSnapshot>) -> Self {
        Self { status }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(liveness_handler)
        .with_state(state)
}

/// Serves the health router until `shutdown` resolves.
pub async fn serve(
    port: u16,
    status: watch::Receiver<StatusSnapshot>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "health endpoint listening");
    axum::serve(listener, app(AppState::new(status)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.status.borrow().clone())
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use relay_core::WatermarkState;
    use tower::ServiceExt;

    fn snapshot() -> StatusSnapshot {
        let when = Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).unwrap();
        let state = WatermarkState::seeded(Some(when)).committed(None, ["a", "b"]);
        StatusSnapshot::from_state(&state).with_cycle(when, true)
    }

    #[tokio::test]
    async fn health_reports_watermark_and_seen_count() {
        let (_tx, rx) = watch::channel(snapshot());
        let resp = app(AppState::new(rx))
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);
        assert_eq!(json["lastTimestamp"], "2026-03-02T08:30:00Z");
        assert_eq!(json["seenCount"], 2);
        assert_eq!(json["lastCycleOk"], true);
    }

    #[tokio::test]
    async fn health_follows_published_updates() {
        let (tx, rx) = watch::channel(StatusSnapshot::from_state(&WatermarkState::default()));
        let app = app(AppState::new(rx));
        tx.send_replace(snapshot());

        let resp = app
            .oneshot(axum::http::Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["seenCount"], 2);
    }

    #[tokio::test]
    async fn any_other_path_is_a_liveness_probe() {
        let (_tx, rx) = watch::channel(snapshot());
        let resp = app(AppState::new(rx))
            .oneshot(axum::http::Request::builder().uri("/anything/else").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }
}
