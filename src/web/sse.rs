//! SSE hub endpoint.
//!
//! `GET /api/events` subscribes the client to the event bus with a bounded
//! queue: a slow consumer loses oldest events rather than stalling the
//! publishers. Each SSE frame carries the event class in the `event` field
//! and the serialized [`Event`](crate::events::Event) as data.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::AppState;
use crate::events::DEFAULT_QUEUE_CAPACITY;

/// `GET /api/events` — streams lifecycle events until the client goes away
/// or the gateway shuts down (a terminal `close` event is published first).
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.bus.subscribe(None, DEFAULT_QUEUE_CAPACITY);
    let stream = ReceiverStream::new(subscription.into_receiver()).map(|event| {
        let frame = SseEvent::default().event(event.kind.as_str());
        let frame = match serde_json::to_string(&event) {
            Ok(data) => frame.data(data),
            Err(_) => frame.data("{}"),
        };
        Ok(frame)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
