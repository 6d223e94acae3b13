//! HTTP surface: telephony webhook, media WebSocket, events, health

pub mod media_ws;
pub mod webhook;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::orchestrator::AppContext;

/// Build the application router.
pub fn router(app: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/voice", post(webhook::inbound_call))
        .route("/voice/outbound", post(webhook::outbound_call))
        .route("/media", get(media_ws::upgrade))
        .route("/events", get(sse_events))
        .route("/healthz", get(healthz))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app)
}

/// Bind and serve until the process is stopped.
pub async fn serve(app: AppContext) -> Result<()> {
    let port = app.config.server.http_port;
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "voicedesk listening");
    axum::serve(listener, router(app)).await?;
    Ok(())
}

/// Liveness plus a cheap collaborator probe.
async fn healthz(State(app): State<AppContext>) -> impl IntoResponse {
    let calendar = match app.calendar.health_check().await {
        Ok(()) => "ok",
        Err(_) => "degraded",
    };
    Json(serde_json::json!({
        "status": "ok",
        "active_sessions": app.store.len(),
        "calendar": calendar,
    }))
}

/// Dashboard event feed. Lossy for slow consumers by design.
async fn sse_events(
    State(app): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = app.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(sse) = Event::default().json_data(&event) {
                        return Some((Ok(sse), rx));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "sse subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
