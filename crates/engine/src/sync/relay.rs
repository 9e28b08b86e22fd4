// Channel relay: carries realtime channels between sync nodes in different
// processes.
//
// Each WebSocket on `/v1/channels/{name}` is one presence key on channel
// `name`. The relay keeps a `LocalHub` per channel name and bridges sockets
// onto it, so roster and fan-out rules are the hub's. Change and selection
// frames are re-stamped with the socket's presence key before fan-out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use marginalia_common::protocol::presence::RosterEntry;
use marginalia_common::protocol::ws::{
    decode_frame, encode_frame, ChannelFrame, ALREADY_JOINED, INVALID_FRAME, JOIN_FAILED, JOIN_REQUIRED,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::channel::{ChannelError, LocalChannel, LocalHub, RealtimeChannel};
use super::ws::message_to_frame;

#[derive(Clone, Default)]
pub struct RelayState {
    hubs: Arc<Mutex<HashMap<String, LocalHub>>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(self) -> Router {
        Router::new().route("/v1/channels/{name}", get(channel_route)).with_state(self)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LocalHub>> {
        self.hubs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hub for channel `name`, created on first use.
    pub fn hub(&self, name: &str) -> LocalHub {
        self.lock().entry(name.to_string()).or_insert_with(|| LocalHub::new(name)).clone()
    }

    /// Presence keys currently joined to `name`.
    pub fn member_keys(&self, name: &str) -> Vec<String> {
        self.lock().get(name).map(LocalHub::member_keys).unwrap_or_default()
    }
}

pub async fn serve(listener: TcpListener, state: RelayState) -> Result<()> {
    axum::serve(listener, state.router()).await.context("channel relay failed")
}

async fn channel_route(
    ws: WebSocketUpgrade,
    Path(name): Path<String>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let hub = state.hub(&name);
    ws.on_upgrade(move |socket| handle_socket(socket, name, hub))
}

async fn send_frame(socket: &mut WebSocket, frame: &ChannelFrame) -> Result<()> {
    let text = encode_frame(frame).context("failed to encode relay frame")?;
    socket.send(Message::Text(text.into())).await.context("failed to send relay frame")
}

/// Sends an error frame and closes the socket.
async fn refuse(socket: &mut WebSocket, code: &str, message: String) {
    if let Err(err) = send_frame(socket, &ChannelFrame::error(code, message)).await {
        debug!(error = %err, "could not report relay error");
    }
    if socket.send(Message::Close(None)).await.is_err() {
        debug!("relay socket closed before refusal");
    }
}

async fn await_join(socket: &mut WebSocket) -> Option<RosterEntry> {
    let raw = match socket.recv().await {
        Some(Ok(Message::Text(raw))) => raw,
        _ => return None,
    };
    match decode_frame(raw.as_str()) {
        Ok(ChannelFrame::Join { entry }) => Some(entry),
        _ => {
            refuse(socket, JOIN_REQUIRED, "first frame must be a join".into()).await;
            None
        }
    }
}

async fn handle_socket(mut socket: WebSocket, name: String, hub: LocalHub) {
    let Some(entry) = await_join(&mut socket).await else { return };
    let key = entry.presence_key.clone();
    let channel = hub.channel();

    let mut inbox = match channel.join(entry).await {
        Ok(inbox) => inbox,
        Err(err) => {
            let code = match &err {
                ChannelError::AlreadyJoined(_) => ALREADY_JOINED,
                _ => JOIN_FAILED,
            };
            warn!(channel = %name, presence_key = %key, error = %err, "relay join refused");
            refuse(&mut socket, code, err.to_string()).await;
            return;
        }
    };
    info!(channel = %name, presence_key = %key, "peer joined relay");

    loop {
        tokio::select! {
            outbound = inbox.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                if let Err(err) = send_frame(&mut socket, &message_to_frame(message)).await {
                    debug!(error = %err, "relay socket send failed");
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else {
                    break;
                };

                match message {
                    Message::Text(raw) => match decode_frame(raw.as_str()) {
                        Ok(frame) => {
                            if !forward(&channel, &key, frame).await {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(channel = %name, presence_key = %key, error = %err, "invalid relay frame");
                            if send_frame(&mut socket, &ChannelFrame::error(INVALID_FRAME, err.to_string())).await.is_err() {
                                break;
                            }
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) | Message::Binary(_) => {}
                }
            }
        }
    }

    if let Err(err) = channel.leave(&key).await {
        debug!(error = %err, "peer already off the hub");
    }
    info!(channel = %name, presence_key = %key, "peer left relay");
}

/// Puts one client frame on the hub. Returns false once the peer leaves.
async fn forward(channel: &LocalChannel, key: &str, frame: ChannelFrame) -> bool {
    let result = match frame {
        ChannelFrame::Change { mut message } => {
            message.from.presence_key = key.to_string();
            channel.broadcast(message).await
        }
        ChannelFrame::Selection { mut message } => {
            message.from.presence_key = key.to_string();
            channel.broadcast_selection(message).await
        }
        ChannelFrame::Leave { .. } => return false,
        ChannelFrame::Join { .. } | ChannelFrame::Presence { .. } | ChannelFrame::Error { .. } => {
            debug!(presence_key = %key, "ignoring relay-bound frame the client should not send");
            return true;
        }
    };
    if let Err(err) = result {
        warn!(presence_key = %key, error = %err, "relay fan-out failed");
    }
    true
}
