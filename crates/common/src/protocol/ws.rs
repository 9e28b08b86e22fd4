// WebSocket frames spoken between sync nodes and the channel relay.
//
// One socket carries one presence key on one channel. Frames are JSON text
// messages tagged by `type`.

use serde::{Deserialize, Serialize};

use super::broadcast::BroadcastMessage;
use super::presence::{RosterEntry, SelectionBroadcast};

/// Error code sent when the first frame on a socket is not `join`.
pub const JOIN_REQUIRED: &str = "JOIN_REQUIRED";
/// Error code sent when the presence key is already on the channel.
pub const ALREADY_JOINED: &str = "ALREADY_JOINED";
/// Error code sent when the channel refuses the join for another reason.
pub const JOIN_FAILED: &str = "JOIN_FAILED";
/// Error code sent for a frame that does not parse.
pub const INVALID_FRAME: &str = "INVALID_FRAME";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelFrame {
    /// Client -> Relay: must be the first frame on a socket.
    Join { entry: RosterEntry },

    /// Client -> Relay: leave the channel; the relay closes the socket.
    Leave { presence_key: String },

    /// Bidirectional: a batch of annotation change events.
    Change { message: BroadcastMessage },

    /// Bidirectional: a selection announcement.
    Selection { message: SelectionBroadcast },

    /// Relay -> Client: full roster after every join or leave.
    Presence { roster: Vec<RosterEntry> },

    /// Relay -> Client: error.
    Error { code: String, message: String },
}

impl ChannelFrame {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error { code: code.to_string(), message: message.into() }
    }
}

pub fn decode_frame(raw: &str) -> Result<ChannelFrame, serde_json::Error> {
    serde_json::from_str::<ChannelFrame>(raw)
}

pub fn encode_frame(frame: &ChannelFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
