// Presence wire shapes: channel membership payload and selection broadcast.

use serde::{Deserialize, Serialize};

use super::broadcast::Sender;
use crate::model::User;

/// Payload a peer tracks under its presence key when joining a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub user: User,
}

/// One entry of the authoritative roster reported by the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub presence_key: String,
    pub user: User,
}

impl RosterEntry {
    pub fn new(presence_key: impl Into<String>, user: User) -> Self {
        Self { presence_key: presence_key.into(), user }
    }
}

/// A peer announcing what it has selected. `ids: None` means nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionBroadcast {
    pub from: Sender,
    pub ids: Option<Vec<String>>,
}
