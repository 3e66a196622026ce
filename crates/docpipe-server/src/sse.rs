//! Server-sent events endpoint for real-time document progress.
//!
//! Each connection subscribes to the caller's topic on the event bus
//! and streams events as SSE `data:` records with a heartbeat comment
//! every 30 seconds. The subscription travels inside the stream, so
//! closing the connection drops it and unsubscribes.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, StreamExt};
use serde_json::json;

use docpipe_core::events::user_topic;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Heartbeat interval, as an SSE comment record.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// `GET /api/events` — stream the caller's document events.
pub async fn events(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let subscription = state
        .bus
        .subscribe(&user_topic(&user_id))
        .ok_or_else(|| ApiError::Conflict("too many concurrent event streams".to_string()))?;

    tracing::debug!(user_id = %user_id, "SSE subscriber connected");

    let connected = stream::once(async {
        Ok::<Event, Infallible>(
            Event::default().data(
                json!({
                    "type": "connected",
                    "timestamp": now_iso8601(),
                })
                .to_string(),
            ),
        )
    });

    let updates = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let payload = json!({
            "type": event.kind.event_type(),
            "data": event.document,
            "timestamp": event.timestamp,
        });
        Some((
            Ok::<Event, Infallible>(Event::default().data(payload.to_string())),
            subscription,
        ))
    });

    let sse = Sse::new(connected.chain(updates).boxed()).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    );

    Ok((
        [
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
        ],
        sse,
    ))
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
