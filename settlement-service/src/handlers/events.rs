use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::{middleware::TenantContext, AppState};

/// Stream payment and invoice updates for the caller's organisation as
/// server-sent events.
pub async fn payment_events(
    State(state): State<AppState>,
    tenant: TenantContext,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(org_id = %tenant.org_id, "Event stream opened");

    let org_id = tenant.org_id;
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |item| {
        let event = match item {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream subscriber lagged");
                return None;
            }
        };
        if event.org_id() != org_id {
            return None;
        }
        match Event::default().event(event.name()).json_data(&event) {
            Ok(sse) => Some(Ok(sse)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode payment event");
                None
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
