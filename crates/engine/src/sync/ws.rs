// Realtime channel over a WebSocket to the channel relay.
//
// `join` opens the socket, sends the `join` frame and waits for the first
// roster, so the connection is a channel member once it returns. A writer
// task drains the outgoing queue into the socket; a reader task turns relay
// frames into inbox messages.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use marginalia_common::protocol::broadcast::BroadcastMessage;
use marginalia_common::protocol::presence::{RosterEntry, SelectionBroadcast};
use marginalia_common::protocol::ws::{decode_frame, encode_frame, ChannelFrame, ALREADY_JOINED};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use super::channel::{ChannelError, ChannelMessage, Inbox, RealtimeChannel};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Route the relay serves `channel` on.
pub fn channel_url(relay_url: &str, channel: &str) -> String {
    format!("{}/v1/channels/{}", relay_url.trim_end_matches('/'), channel)
}

/// Inbox message for a relay frame; `None` for frames only clients send.
pub(crate) fn frame_to_message(frame: ChannelFrame) -> Option<ChannelMessage> {
    match frame {
        ChannelFrame::Change { message } => Some(ChannelMessage::Change(message)),
        ChannelFrame::Selection { message } => Some(ChannelMessage::Selection(message)),
        ChannelFrame::Presence { roster } => Some(ChannelMessage::PresenceSync(roster)),
        ChannelFrame::Join { .. } | ChannelFrame::Leave { .. } | ChannelFrame::Error { .. } => None,
    }
}

pub(crate) fn message_to_frame(message: ChannelMessage) -> ChannelFrame {
    match message {
        ChannelMessage::Change(message) => ChannelFrame::Change { message },
        ChannelMessage::Selection(message) => ChannelFrame::Selection { message },
        ChannelMessage::PresenceSync(roster) => ChannelFrame::Presence { roster },
    }
}

struct Connection {
    presence_key: String,
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

/// One engine's connection to a relayed channel.
pub struct WsChannel {
    url: String,
    connection: Mutex<Option<Connection>>,
}

impl WsChannel {
    /// `relay_url` is the relay's base address, e.g. `ws://127.0.0.1:7700`.
    pub fn new(relay_url: &str, channel: &str) -> Self {
        Self { url: channel_url(relay_url, channel), connection: Mutex::new(None) }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, frame: &ChannelFrame) -> Result<(), ChannelError> {
        let text = encode_frame(frame).map_err(|err| ChannelError::Encode(err.to_string()))?;
        let connection = self.lock();
        let connection = connection.as_ref().ok_or_else(|| ChannelError::NotJoined(self.url.clone()))?;
        connection
            .outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| ChannelError::Disconnected(self.url.clone()))
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        if let Some(connection) = self.lock().take() {
            connection.reader.abort();
        }
    }
}

/// Waits for the roster that acknowledges a join.
async fn await_roster<S>(stream: &mut S, url: &str, presence_key: &str) -> Result<Vec<RosterEntry>, ChannelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        let raw = match message.map_err(|err| ChannelError::Unreachable(format!("{url}: {err}")))? {
            Message::Text(raw) => raw,
            Message::Close(_) => break,
            _ => continue,
        };
        return match decode_frame(raw.as_str()) {
            Ok(ChannelFrame::Presence { roster }) => Ok(roster),
            Ok(ChannelFrame::Error { code, .. }) if code == ALREADY_JOINED => {
                Err(ChannelError::AlreadyJoined(presence_key.to_string()))
            }
            Ok(ChannelFrame::Error { code, message }) => Err(ChannelError::Rejected(format!("{code}: {message}"))),
            Ok(_) => Err(ChannelError::Rejected("relay answered the join with a non-roster frame".into())),
            Err(err) => Err(ChannelError::Rejected(err.to_string())),
        };
    }
    Err(ChannelError::Disconnected(url.to_string()))
}

impl RealtimeChannel for WsChannel {
    async fn join(&self, entry: RosterEntry) -> Result<Inbox, ChannelError> {
        if self.lock().is_some() {
            return Err(ChannelError::AlreadyJoined(entry.presence_key));
        }
        let unreachable = |err: tungstenite::Error| ChannelError::Unreachable(format!("{}: {err}", self.url));

        let (socket, _) = connect_async(self.url.as_str()).await.map_err(unreachable)?;
        let (mut sink, mut stream) = socket.split();

        let join = encode_frame(&ChannelFrame::Join { entry: entry.clone() })
            .map_err(|err| ChannelError::Encode(err.to_string()))?;
        sink.send(Message::Text(join.into())).await.map_err(unreachable)?;

        let roster = tokio::time::timeout(JOIN_TIMEOUT, await_roster(&mut stream, &self.url, &entry.presence_key))
            .await
            .map_err(|_| ChannelError::Unreachable(format!("{}: no roster after {JOIN_TIMEOUT:?}", self.url)))??;

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        inbox_tx
            .send(ChannelMessage::PresenceSync(roster))
            .map_err(|_| ChannelError::Disconnected(self.url.clone()))?;

        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = sink.send(message).await {
                    debug!(error = %err, "relay socket write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let url = self.url.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let raw = match message {
                    Ok(Message::Text(raw)) => raw,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(relay = %url, error = %err, "relay socket read failed");
                        break;
                    }
                };
                match decode_frame(raw.as_str()) {
                    Ok(ChannelFrame::Error { code, message }) => {
                        warn!(relay = %url, %code, %message, "relay reported an error");
                    }
                    Ok(frame) => {
                        if let Some(message) = frame_to_message(frame) {
                            if inbox_tx.send(message).is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => warn!(relay = %url, error = %err, "dropping malformed relay frame"),
                }
            }
            debug!(relay = %url, "relay connection closed");
        });

        let mut connection = self.lock();
        if connection.is_some() {
            reader.abort();
            return Err(ChannelError::AlreadyJoined(entry.presence_key));
        }
        debug!(relay = %self.url, presence_key = %entry.presence_key, "joined relayed channel");
        *connection = Some(Connection { presence_key: entry.presence_key, outgoing, reader });
        Ok(inbox)
    }

    async fn broadcast(&self, message: BroadcastMessage) -> Result<(), ChannelError> {
        self.send(&ChannelFrame::Change { message })
    }

    async fn broadcast_selection(&self, message: SelectionBroadcast) -> Result<(), ChannelError> {
        self.send(&ChannelFrame::Selection { message })
    }

    async fn leave(&self, presence_key: &str) -> Result<(), ChannelError> {
        let connection = {
            let mut guard = self.lock();
            let joined = guard.as_ref().is_some_and(|c| c.presence_key == presence_key);
            if joined {
                guard.take()
            } else {
                None
            }
        };
        let Some(connection) = connection else {
            return Err(ChannelError::NotJoined(presence_key.to_string()));
        };

        let leave = encode_frame(&ChannelFrame::Leave { presence_key: presence_key.to_string() })
            .map_err(|err| ChannelError::Encode(err.to_string()))?;
        for message in [Message::Text(leave.into()), Message::Close(None)] {
            if connection.outgoing.send(message).is_err() {
                debug!(relay = %self.url, "relay socket already closed");
                break;
            }
        }
        connection.reader.abort();
        Ok(())
    }
}
