// Realtime peer channel: change broadcasts, selection broadcasts, and the
// presence roster.
//
// `LocalHub` is an in-process channel shared by every engine in one process;
// `ws::WsChannel` reaches engines in other processes through the relay, which
// runs one `LocalHub` per channel name. Broadcasts never echo back to their
// sender. Every join or leave delivers the full roster to all remaining
// members.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use marginalia_common::protocol::broadcast::BroadcastMessage;
use marginalia_common::protocol::presence::{RosterEntry, SelectionBroadcast};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(BroadcastMessage),
    Selection(SelectionBroadcast),
    /// Authoritative roster, including the receiving connection itself.
    PresenceSync(Vec<RosterEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel `{0}` is unreachable")]
    Unreachable(String),
    #[error("presence key {0} is already joined")]
    AlreadyJoined(String),
    #[error("presence key {0} has not joined")]
    NotJoined(String),
    #[error("relay refused the join: {0}")]
    Rejected(String),
    #[error("relay connection to {0} is closed")]
    Disconnected(String),
    #[error("frame could not be encoded: {0}")]
    Encode(String),
}

pub type Inbox = mpsc::UnboundedReceiver<ChannelMessage>;

pub trait RealtimeChannel: Send + Sync + 'static {
    /// Joins with the given presence payload and returns the inbound stream.
    fn join(&self, entry: RosterEntry) -> impl Future<Output = Result<Inbox, ChannelError>> + Send;

    fn broadcast(
        &self,
        message: BroadcastMessage,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn broadcast_selection(
        &self,
        message: SelectionBroadcast,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn leave(&self, presence_key: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

// ── In-process hub ─────────────────────────────────────────────────

struct Member {
    entry: RosterEntry,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

struct HubState {
    name: String,
    members: Vec<Member>,
    offline: bool,
}

impl HubState {
    fn roster(&self) -> Vec<RosterEntry> {
        self.members.iter().map(|m| m.entry.clone()).collect()
    }

    fn publish_roster(&mut self) {
        let roster = self.roster();
        self.members.retain(|m| m.tx.send(ChannelMessage::PresenceSync(roster.clone())).is_ok());
    }

    fn relay(&mut self, sender: &str, message: ChannelMessage) {
        self.members.retain(|m| m.entry.presence_key == sender || m.tx.send(message.clone()).is_ok());
    }

    fn check_online(&self) -> Result<(), ChannelError> {
        if self.offline {
            return Err(ChannelError::Unreachable(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                name: name.into(),
                members: Vec::new(),
                offline: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle for one engine. Handles are cheap and share the hub.
    pub fn channel(&self) -> LocalChannel {
        LocalChannel { hub: self.clone() }
    }

    /// While offline every join and broadcast fails.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn member_keys(&self) -> Vec<String> {
        self.lock().members.iter().map(|m| m.entry.presence_key.clone()).collect()
    }
}

#[derive(Clone)]
pub struct LocalChannel {
    hub: LocalHub,
}

impl RealtimeChannel for LocalChannel {
    async fn join(&self, entry: RosterEntry) -> Result<Inbox, ChannelError> {
        let mut state = self.hub.lock();
        state.check_online()?;
        if state.members.iter().any(|m| m.entry.presence_key == entry.presence_key) {
            return Err(ChannelError::AlreadyJoined(entry.presence_key));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        debug!(channel = %state.name, presence_key = %entry.presence_key, "joined channel");
        state.members.push(Member { entry, tx });
        state.publish_roster();
        Ok(rx)
    }

    async fn broadcast(&self, message: BroadcastMessage) -> Result<(), ChannelError> {
        let mut state = self.hub.lock();
        state.check_online()?;
        let sender = message.from.presence_key.clone();
        state.relay(&sender, ChannelMessage::Change(message));
        Ok(())
    }

    async fn broadcast_selection(&self, message: SelectionBroadcast) -> Result<(), ChannelError> {
        let mut state = self.hub.lock();
        state.check_online()?;
        let sender = message.from.presence_key.clone();
        state.relay(&sender, ChannelMessage::Selection(message));
        Ok(())
    }

    async fn leave(&self, presence_key: &str) -> Result<(), ChannelError> {
        let mut state = self.hub.lock();
        let before = state.members.len();
        state.members.retain(|m| m.entry.presence_key != presence_key);
        if state.members.len() == before {
            return Err(ChannelError::NotJoined(presence_key.to_string()));
        }
        debug!(channel = %state.name, presence_key = %presence_key, "left channel");
        state.publish_roster();
        Ok(())
    }
}
