//! Job event observability: batched polling and SSE streaming.
//!
//! Both modes share the monotone event-id cursor. On a stream, a
//! `Last-Event-ID` reconnect header takes precedence over the `after` query
//! argument; idle streams heartbeat with `event: ping` roughly once a
//! second; the loop ends when the client disconnects.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Extension, Path, Query};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::common::{ApiError, ApiResult};
use crate::kernel::events::JobEvent;
use crate::kernel::jobs::PipelineJob;
use crate::server::app::AppState;
use crate::server::middleware::Principal;

/// Events per chunk on both the batch endpoint and each stream read.
const EVENT_CHUNK: i64 = 200;

/// Idle-stream heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub after: Option<i64>,
    pub limit: Option<i64>,
    pub format: Option<String>,
}

/// `GET /pipeline/jobs/:id/events?after=N&format=json|sse`
pub async fn job_events(
    Extension(state): Extension<AppState>,
    Principal(api_key): Principal,
    Path(job_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let db = &state.kernel.db;
    PipelineJob::find_owned(job_id, api_key.id, db)
        .await?
        .ok_or(ApiError::NotFound)?;

    let after = resolve_cursor(&headers, query.after);

    if wants_sse(&headers, query.format.as_deref()) {
        return Ok(stream_events(db.clone(), job_id, after).into_response());
    }

    let limit = query.limit.unwrap_or(EVENT_CHUNK).clamp(1, 1000);
    let events = JobEvent::list_after(job_id, after, limit, db).await?;
    let next_cursor = events.last().map(|e| e.id).unwrap_or(after);

    Ok(Json(json!({"events": events, "cursor": next_cursor})).into_response())
}

/// `Last-Event-ID` wins over the `after` query argument when both appear.
fn resolve_cursor(headers: &HeaderMap, after: Option<i64>) -> i64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .or(after)
        .unwrap_or(0)
}

fn wants_sse(headers: &HeaderMap, format: Option<&str>) -> bool {
    if let Some(format) = format {
        return format.eq_ignore_ascii_case("sse");
    }
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Open an SSE stream: seed a heartbeat, then alternate between draining
/// id-ordered chunks and idle pings. The pump task exits when the client
/// goes away (the channel send fails).
fn stream_events(
    db: PgPool,
    job_id: Uuid,
    after: i64,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let mut cursor = after;

        if tx.send(Ok(ping())).await.is_err() {
            return;
        }

        loop {
            match JobEvent::list_after(job_id, cursor, EVENT_CHUNK, &db).await {
                Ok(events) if !events.is_empty() => {
                    for event in events {
                        cursor = event.id;
                        let frame = Event::default()
                            .id(event.id.to_string())
                            .event("job_event")
                            .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".into()));
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {
                    if tx.send(Ok(ping())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "event stream read failed");
                    if tx.send(Ok(ping())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(HEARTBEAT_INTERVAL).await;
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
}

fn ping() -> Event {
    Event::default().event("ping").data("{}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn last_event_id_wins_over_after() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", HeaderValue::from_static("42"));
        assert_eq!(resolve_cursor(&headers, Some(7)), 42);
    }

    #[test]
    fn after_is_used_without_reconnect_header() {
        assert_eq!(resolve_cursor(&HeaderMap::new(), Some(7)), 7);
        assert_eq!(resolve_cursor(&HeaderMap::new(), None), 0);
    }

    #[test]
    fn malformed_last_event_id_falls_back() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", HeaderValue::from_static("not-a-number"));
        assert_eq!(resolve_cursor(&headers, Some(7)), 7);
    }

    #[test]
    fn sse_is_selected_by_format_or_accept() {
        let mut headers = HeaderMap::new();
        assert!(!wants_sse(&headers, None));
        assert!(wants_sse(&headers, Some("sse")));
        assert!(!wants_sse(&headers, Some("json")));

        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        assert!(wants_sse(&headers, None));
        // Explicit format still wins over the accept header
        assert!(!wants_sse(&headers, Some("json")));
    }
}
