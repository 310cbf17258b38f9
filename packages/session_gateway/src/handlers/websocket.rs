use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{find_session, require_client};
use crate::AppState;
use crate::error::GatewayError;
use crate::fanout::{Outbound, PushBatcher, PushKind, PushSubscription};
use crate::manager::SessionHandle;
use crate::sharing::ClientId;
use crate::transport::Notice;
use crate::transport::wire::{SocketInput, update_to_binary, update_to_text};

#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    /// `1` sends updates as binary frames instead of text.
    #[serde(default)]
    pub binary: Option<u8>,
}

/// WebSocket push transport. Client messages carry inputs and progress.
pub async fn session_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<SocketParams>,
    jar: CookieJar,
) -> Result<Response, GatewayError> {
    let client = require_client(&jar)?;
    let handle = find_session(&state, &id).await?;
    let subscription = handle.attach(&client, PushKind::WebSocket).await?;
    let binary = params.binary == Some(1);

    Ok(ws.on_upgrade(move |socket| {
        handle_session_socket(socket, state, handle, client, subscription, binary)
    }))
}

fn outbound_message(item: Outbound, binary: bool) -> Message {
    match item {
        Outbound::Update(update) if binary => Message::Binary(update_to_binary(&update)),
        Outbound::Update(update) => Message::Text(update_to_text(&update).into()),
        Outbound::Notice(notice) => Message::Text(notice.to_wire().into()),
    }
}

async fn handle_session_socket(
    socket: WebSocket,
    state: AppState,
    handle: SessionHandle,
    client: ClientId,
    subscription: PushSubscription,
    binary: bool,
) {
    let session = handle.id();
    let PushSubscription {
        id: transport,
        receiver: mut outbound,
    } = subscription;
    info!(session = %session, client = %client, transport, binary, "websocket attached");
    state.metrics.push_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let transport_config = &state.config.transport;
    let (tx, mut rx) = mpsc::channel::<Message>(transport_config.send_channel_capacity.max(1));

    // Updates and notices from the session, batched
    let mut batcher = PushBatcher::new(
        transport_config.push_batch_max_items,
        transport_config.push_batch_delay,
        handle.cache().clone(),
    );
    let forward_tx = tx.clone();
    let metrics = state.metrics.clone();
    let forward_task = tokio::spawn(async move {
        let mut reported = 0;
        while let Some(batch) = batcher.next_batch(&mut outbound).await {
            if batcher.skipped() > reported {
                metrics.updates_skipped_expired(batcher.skipped() - reported);
                reported = batcher.skipped();
            }
            for item in batch {
                let last = item.is_disconnect();
                if forward_tx.send(outbound_message(item, binary)).await.is_err() {
                    return;
                }
                if last {
                    let _ = forward_tx.send(Message::Close(None)).await;
                    return;
                }
            }
        }
        // Dropped by the session (revoked or replaced)
        let _ = forward_tx.send(Message::Close(None)).await;
    });

    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    };

    let input_handle = handle.clone();
    let input_client = client.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let input = SocketInput::parse(text.as_str());
                    if !input.data.is_empty() {
                        match input_handle.send_input(&input_client, &input.data).await {
                            Ok(_) => {}
                            Err(GatewayError::SessionGone) => break,
                            Err(e) => {
                                debug!(session = %session, client = %input_client, "input refused: {}", e);
                                if matches!(e, GatewayError::Forbidden(_)) {
                                    break;
                                }
                            }
                        }
                    }
                    if input.last_idx.is_some() || input.latency_ms.is_some() {
                        input_handle
                            .record_progress(&input_client, input.last_idx, input.latency_ms)
                            .await;
                    }
                    if let Some(timestamp) = input.timestamp {
                        let ack = Message::Text(Notice::Ack(timestamp).to_wire().into());
                        if tx.send(ack).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!(session = %session, "client closed websocket");
                    break;
                }
                Err(e) => {
                    warn!(session = %session, "websocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(session = %session, "websocket sender ended"),
        _ = input_task => debug!(session = %session, "websocket input ended"),
    }

    forward_task.abort();
    handle.detach(transport).await;
    state.metrics.push_closed();
    info!(session = %session, client = %client, transport, "websocket detached");
}
