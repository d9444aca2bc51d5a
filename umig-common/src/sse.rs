//! Server-Sent Events (SSE) utilities

use crate::events::{EventBus, ImportEvent};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stream import events from the bus as SSE
///
/// With `batch_filter` set, only events of that batch are forwarded.
/// Lagging subscribers skip the events they missed and keep streaming.
pub fn import_event_sse_stream(
    event_bus: &EventBus,
    batch_filter: Option<Uuid>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!(batch_filter = ?batch_filter, "New SSE client connected to import events");

    let mut rx = event_bus.subscribe();

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !matches_filter(&event, batch_filter) {
                        continue;
                    }
                    let event_type = event.event_type();
                    match serde_json::to_string(&event) {
                        Ok(json) => {
                            debug!("SSE: Broadcasting import event: {}", event_type);
                            yield Ok(Event::default().event(event_type).data(json));
                        }
                        Err(e) => {
                            warn!("SSE: Failed to serialize event {}: {}", event_type, e);
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE: Subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => {
                    info!("SSE: Event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}

fn matches_filter(event: &ImportEvent, batch_filter: Option<Uuid>) -> bool {
    match batch_filter {
        None => true,
        Some(batch_id) => event.batch_id() == Some(batch_id),
    }
}
