use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use axum_extra::extract::cookie::CookieJar;
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{find_session, require_client};
use crate::AppState;
use crate::error::GatewayError;
use crate::fanout::{Outbound, PushKind, TransportId};
use crate::manager::SessionHandle;
use crate::metrics::GatewayMetrics;
use crate::transport::wire::update_to_text;

/// Deregisters the transport when the response stream is dropped.
struct PushGuard {
    handle: SessionHandle,
    transport: TransportId,
    metrics: Arc<GatewayMetrics>,
}

impl Drop for PushGuard {
    fn drop(&mut self) {
        self.metrics.push_closed();
        let handle = self.handle.clone();
        let transport = self.transport;
        debug!(session = %handle.id(), transport, "event stream closed");
        tokio::spawn(async move { handle.detach(transport).await });
    }
}

pub(crate) fn outbound_event(item: &Outbound) -> Event {
    match item {
        Outbound::Update(update) => Event::default()
            .event("update")
            .id(update.idx.to_string())
            .data(update_to_text(update)),
        // Notice text may carry line breaks, which SSE data lines cannot
        Outbound::Notice(notice) => Event::default()
            .event(notice.event_name())
            .json_data(notice.to_wire())
            .unwrap_or_else(|e| {
                warn!("failed to encode notice: {}", e);
                Event::default().event(notice.event_name())
            }),
    }
}

/// Server-sent events push transport.
pub async fn event_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    jar: CookieJar,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    let subscription = handle.attach(&client, PushKind::EventStream).await?;
    info!(session = %handle.id(), client = %client, transport = subscription.id, "event stream attached");
    state.metrics.push_opened();

    let guard = PushGuard {
        handle,
        transport: subscription.id,
        metrics: state.metrics.clone(),
    };
    let stream = ReceiverStream::new(subscription.receiver).map(move |item| {
        let _ = &guard;
        Ok(outbound_event(&item))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}
