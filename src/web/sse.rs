use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::{self, Stream};

use crate::stats::ApiResponse;

use super::WebState;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_error;

/// Server-sent-events fallback for clients that cannot hold a websocket.
/// Each published snapshot becomes a `statistics` event; the transport layer
/// sends comment keep-alives on the heartbeat cadence.
pub async fn sse_handler(
    State(state): State<WebState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let sub = state.hub.subscribe();

    // Dropping the subscription unsubscribes it, so the session is cleaned
    // up when the client disconnects and axum drops the stream.
    let updates = stream::unfold(sub, |mut sub| async move {
        let snapshot = sub.rx.recv().await?;
        let event = match Event::default()
            .event("statistics")
            .json_data(ApiResponse::ok(snapshot))
        {
            Ok(event) => event,
            Err(err) => {
                log_error!("failed to serialize statistics event: {err}");
                Event::default().event("statistics").data("{}")
            }
        };
        Some((Ok::<_, Infallible>(event), sub))
    });

    Sse::new(updates).keep_alive(KeepAlive::new().interval(state.heartbeat).text("keep-alive"))
}
